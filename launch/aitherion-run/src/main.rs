// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use aitherion_run::Flags;
use aitherion_runtime::{FabricConfig, Runtime, logging};

use anyhow::Context as _;
use clap::Parser;
use validator::Validate;

fn main() -> anyhow::Result<()> {
    logging::init();
    let flags = Flags::parse();

    let mut config = FabricConfig::from_settings_with(flags.config.as_deref())?;
    flags.apply(&mut config);
    config
        .validate()
        .context("invalid fabric configuration")?;

    let runtime = Runtime::from_settings()?;
    runtime.execute(move |runtime| aitherion_run::run(runtime, config))
}
