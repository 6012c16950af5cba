// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GPU inventory records and the two inventory sources the node accepts: a JSON file and
//! the CSV produced by
//! `nvidia-smi --query-gpu=uuid,name,memory.total,memory.free --format=csv,noheader,nounits`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const MIB: u64 = 1024 * 1024;

/// Identity of an RPC session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh random identity for an anonymous session
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "client", rename_all = "snake_case")]
pub enum Ownership {
    #[default]
    Free,
    Owned(ClientId),
}

impl Ownership {
    pub fn owner(&self) -> Option<&ClientId> {
        match self {
            Ownership::Free => None,
            Ownership::Owned(client) => Some(client),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Ownership::Free)
    }
}

/// One physical GPU as tracked by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuResource {
    pub uuid: String,
    pub name: String,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub ownership: Ownership,
}

impl GpuResource {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        total_memory_bytes: u64,
        free_memory_bytes: u64,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            total_memory_bytes,
            free_memory_bytes,
            ownership: Ownership::Free,
        }
    }

    pub fn info(&self) -> GpuInfo {
        GpuInfo {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            total_memory_bytes: self.total_memory_bytes,
            free_memory_bytes: self.free_memory_bytes,
            owner: self.ownership.owner().cloned(),
        }
    }

    pub fn status(&self) -> GpuStatus {
        GpuStatus {
            uuid: self.uuid.clone(),
            available: self.ownership.is_free(),
            owner: self.ownership.owner().cloned(),
            free_memory_bytes: self.free_memory_bytes,
            total_memory_bytes: self.total_memory_bytes,
        }
    }
}

/// `ListGpus` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub uuid: String,
    pub name: String,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ClientId>,
}

/// `GetGpuStatus` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub uuid: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ClientId>,
    pub free_memory_bytes: u64,
    pub total_memory_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to read GPU inventory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("GPU inventory is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate GPU uuid {0}")]
    DuplicateUuid(String),

    #[error("line {line}: invalid memory value {value:?}")]
    InvalidMemory { line: usize, value: String },
}

#[derive(Deserialize)]
struct InventoryEntry {
    uuid: String,
    name: String,
    total_memory_bytes: u64,
    #[serde(default)]
    free_memory_bytes: Option<u64>,
}

/// Load an inventory file. A `.csv` file is saved `nvidia-smi` output (see
/// [`parse_nvidia_smi_csv`]); anything else is a JSON list of
/// `{uuid, name, total_memory_bytes, free_memory_bytes}` where a missing
/// `free_memory_bytes` means the whole device is free.
pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<GpuResource>, InventoryError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        parse_nvidia_smi_csv(&contents)
    } else {
        parse_inventory(&contents)
    }
}

pub fn parse_inventory(json: &str) -> Result<Vec<GpuResource>, InventoryError> {
    let entries: Vec<InventoryEntry> = serde_json::from_str(json)?;
    let gpus = entries
        .into_iter()
        .map(|e| {
            let free = e.free_memory_bytes.unwrap_or(e.total_memory_bytes);
            GpuResource::new(e.uuid, e.name, e.total_memory_bytes, free)
        })
        .collect::<Vec<_>>();
    reject_duplicates(&gpus)?;
    Ok(gpus)
}

/// Parse `nvidia-smi` query output (`uuid, name, memory.total, memory.free`, MiB, no header).
/// Lines with fewer than four fields are skipped; `[N/A]` memory reads as zero.
pub fn parse_nvidia_smi_csv(output: &str) -> Result<Vec<GpuResource>, InventoryError> {
    let mut gpus = Vec::new();
    for (index, line) in output.lines().enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            if !line.trim().is_empty() {
                tracing::debug!(line = index + 1, "skipping short nvidia-smi line");
            }
            continue;
        }
        let total = parse_mib(fields[2], index + 1)?;
        let free = parse_mib(fields[3], index + 1)?;
        gpus.push(GpuResource::new(fields[0], fields[1], total, free));
    }
    reject_duplicates(&gpus)?;
    Ok(gpus)
}

fn parse_mib(value: &str, line: usize) -> Result<u64, InventoryError> {
    if value == "[N/A]" || value == "N/A" {
        return Ok(0);
    }
    value
        .parse::<u64>()
        .map(|mib| mib * MIB)
        .map_err(|_| InventoryError::InvalidMemory {
            line,
            value: value.to_string(),
        })
}

fn reject_duplicates(gpus: &[GpuResource]) -> Result<(), InventoryError> {
    let mut seen = std::collections::HashSet::new();
    for gpu in gpus {
        if !seen.insert(gpu.uuid.as_str()) {
            return Err(InventoryError::DuplicateUuid(gpu.uuid.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_nvidia_smi_csv() {
        let out = "\
GPU-aaaa, Tesla V100-SXM2-16GB, 16160, 16150
GPU-bbbb, Tesla V100-SXM2-16GB, 16160, [N/A]
garbage line
";
        let gpus = parse_nvidia_smi_csv(out).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].uuid, "GPU-aaaa");
        assert_eq!(gpus[0].name, "Tesla V100-SXM2-16GB");
        assert_eq!(gpus[0].total_memory_bytes, 16160 * MIB);
        assert_eq!(gpus[0].free_memory_bytes, 16150 * MIB);
        assert_eq!(gpus[1].free_memory_bytes, 0);
        assert!(gpus.iter().all(|g| g.ownership.is_free()));
    }

    #[test]
    fn test_parse_nvidia_smi_csv_bad_number() {
        let err = parse_nvidia_smi_csv("GPU-a, V100, lots, 1\n").unwrap_err();
        assert!(matches!(err, InventoryError::InvalidMemory { line: 1, .. }));
    }

    #[test]
    fn test_load_inventory_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"uuid": "GPU-0", "name": "V100", "total_memory_bytes": 1024, "free_memory_bytes": 512}},
                {{"uuid": "GPU-1", "name": "V100", "total_memory_bytes": 2048}}
            ]"#
        )
        .unwrap();

        let gpus = load_inventory(file.path()).unwrap();
        assert_eq!(gpus[0].free_memory_bytes, 512);
        assert_eq!(gpus[1].free_memory_bytes, 2048);
    }

    #[test]
    fn test_load_inventory_from_nvidia_smi_csv() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "GPU-aaaa, Tesla V100-SXM2-16GB, 16160, 8000").unwrap();
        writeln!(file, "GPU-bbbb, Tesla V100-SXM2-16GB, 16160, 16160").unwrap();

        let gpus = load_inventory(file.path()).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].uuid, "GPU-aaaa");
        assert_eq!(gpus[0].free_memory_bytes, 8000 * MIB);

        // the same rows in a JSON-named file are rejected as JSON
        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(json, "GPU-aaaa, Tesla V100-SXM2-16GB, 16160, 8000").unwrap();
        assert!(matches!(
            load_inventory(json.path()),
            Err(InventoryError::Json(_))
        ));
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let err = parse_inventory(
            r#"[{"uuid": "GPU-0", "name": "a", "total_memory_bytes": 1},
                {"uuid": "GPU-0", "name": "b", "total_memory_bytes": 1}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateUuid(u) if u == "GPU-0"));
    }

    #[test]
    fn test_status_reflects_owner() {
        let mut gpu = GpuResource::new("GPU-0", "V100", 10, 10);
        assert!(gpu.status().available);

        gpu.ownership = Ownership::Owned(ClientId::from("alice"));
        let status = gpu.status();
        assert!(!status.available);
        assert_eq!(status.owner, Some(ClientId::from("alice")));
        assert_eq!(gpu.info().owner, Some(ClientId::from("alice")));
    }
}
