// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::gpu::{ClientId, GpuInfo, GpuStatus};
use crate::launch::KernelLaunch;
use crate::service::CommandResponse;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single RPC frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Optional first message naming the session; anonymous sessions get a random id
    Hello {
        #[serde(default)]
        client_name: Option<String>,
    },
    ListGpus,
    GetGpuStatus {
        uuid: String,
    },
    AcquireGpu {
        uuid: String,
    },
    ReleaseGpu {
        uuid: String,
    },
    /// `command` is a framed wire command: header, payload and CRC trailer
    RunCommand {
        #[serde(with = "base64_bytes")]
        command: Vec<u8>,
        #[serde(default)]
        stream_handle: u64,
    },
    LaunchKernel(KernelLaunch),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Hello { .. } => "hello",
            RpcRequest::ListGpus => "list_gpus",
            RpcRequest::GetGpuStatus { .. } => "get_gpu_status",
            RpcRequest::AcquireGpu { .. } => "acquire_gpu",
            RpcRequest::ReleaseGpu { .. } => "release_gpu",
            RpcRequest::RunCommand { .. } => "run_command",
            RpcRequest::LaunchKernel(_) => "launch_kernel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcResponse {
    Welcome { client_id: ClientId },
    Gpus { gpus: Vec<GpuInfo> },
    Status { status: GpuStatus },
    Ack,
    CommandResult(CommandResponse),
    Error { code: String, message: String },
}

impl RpcResponse {
    pub fn error(code: impl Into<String>, message: impl ToString) -> Self {
        RpcResponse::Error {
            code: code.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed rpc message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("server error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("unexpected response to {method}: {response}")]
    UnexpectedResponse {
        method: &'static str,
        response: String,
    },
}

impl RpcError {
    /// Server error code, when the failure came from the server
    pub fn code(&self) -> Option<&str> {
        match self {
            RpcError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Byte fields travel as base64 strings rather than JSON number arrays
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, RpcError> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_value(RpcRequest::AcquireGpu {
            uuid: "GPU-0".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"method": "acquire_gpu", "uuid": "GPU-0"})
        );

        let req: RpcRequest = decode(br#"{"method": "list_gpus"}"#).unwrap();
        assert_eq!(req, RpcRequest::ListGpus);

        let req: RpcRequest = decode(br#"{"method": "hello"}"#).unwrap();
        assert_eq!(req, RpcRequest::Hello { client_name: None });
    }

    #[test]
    fn test_launch_kernel_is_flattened() {
        let launch = KernelLaunch::new("vec_add", 0x10, vec![1, 2]);
        let frame = encode(&RpcRequest::LaunchKernel(launch.clone())).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["method"], "launch_kernel");
        assert_eq!(json["name"], "vec_add");
        assert_eq!(json["params"], "AQI=");
        assert_eq!(decode::<RpcRequest>(&frame).unwrap(), RpcRequest::LaunchKernel(launch));
    }

    #[test]
    fn test_run_command_bytes_are_base64() {
        let req = RpcRequest::RunCommand {
            command: vec![0xff; 3000],
            stream_handle: 7,
        };
        let frame = encode(&req).unwrap();
        // 4 base64 characters per 3 bytes plus the envelope
        assert!(frame.len() < 4100, "frame is {} bytes", frame.len());
        assert_eq!(decode::<RpcRequest>(&frame).unwrap(), req);

        let err = decode::<RpcRequest>(
            br#"{"method": "run_command", "command": "not base64!", "stream_handle": 1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::Json(_)));
    }

    #[test]
    fn test_error_response() {
        let frame = encode(&RpcResponse::error("unknown_gpu", "unknown GPU x")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "error", "code": "unknown_gpu", "message": "unknown GPU x"})
        );
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(matches!(
            decode::<RpcRequest>(br#"{"method": "format_disk"}"#),
            Err(RpcError::Json(_))
        ));
    }
}
