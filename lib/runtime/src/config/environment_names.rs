// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for centralized management across the workspace
//!
//! Environment variables are organized by functional area:
//! - **Logging**: Log level, configuration file and output format
//! - **Fabric**: Process configuration for the data plane and the control plane

/// Logging environment variables
pub mod logging {
    /// Log filter directives (e.g., "debug", "aitherion_fabric=trace,info")
    pub const AIT_LOG: &str = "AIT_LOG";

    /// Path to logging configuration file
    pub const AIT_LOGGING_CONFIG_PATH: &str = "AIT_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const AIT_LOGGING_JSONL: &str = "AIT_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const AIT_LOG_DISABLE_ANSI: &str = "AIT_LOG_DISABLE_ANSI";
}

/// Fabric process configuration
pub mod fabric {
    /// Prefix for every [`crate::FabricConfig`] field override, e.g. `AIT_DATA_PORT`.
    /// Nested fields use `__`, e.g. `AIT_TRANSPORT__MAX_SEND_WR`.
    pub const AIT_PREFIX: &str = "AIT_";

    /// Path to the fabric TOML configuration file
    pub const AIT_CONFIG_PATH: &str = "AIT_CONFIG_PATH";

    /// Control-plane interface name, also honoured without the prefix for compatibility with
    /// the container launch scripts
    pub const CONTROL_IFACE: &str = "CONTROL_IFACE";

    /// Data-plane interface name
    pub const DATA_IFACE: &str = "DATA_IFACE";
}
