// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use raw_block::config::ConfigError;
use raw_block::{AioConfig, DiskConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolConfigError {
    #[error("Failed to read configuration file {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse configuration file {0:?}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("Invalid disk configuration")]
    Disk(#[source] ConfigError),
    #[error("Invalid async I/O configuration")]
    Aio(#[source] ConfigError),
}

/// Settings accepted through `--config`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub aio: AioConfig,
}

impl ToolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ToolConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|e| ToolConfigError::Read(path.to_path_buf(), e))?;
        let config: ToolConfig = serde_json::from_str(&data)
            .map_err(|e| ToolConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ToolConfigError> {
        self.disk.validate().map_err(ToolConfigError::Disk)?;
        self.aio.validate().map_err(ToolConfigError::Aio)
    }
}

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} exited with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| {
            // Dereference necessary to mitigate rustc compiler bug.
            // See <https://github.com/rust-lang/rust/issues/141673>
            (*sub_error).source()
        })
        .enumerate()
        .for_each(|(level, error)| {
            eprintln!("  {level}: {error}",);
        });
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
