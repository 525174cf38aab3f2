// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SECTOR_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The scratch buffer must hold at least one sector.
    #[error("Scratch buffer must hold at least one sector")]
    ScratchTooSmall,
    /// The scratch buffer size does not fit in memory.
    #[error("Scratch buffer of {0} sectors is too large")]
    ScratchTooLarge(usize),
    /// The async queue depth must be non-zero.
    #[error("Async queue depth must be non-zero")]
    ZeroQueueDepth,
    /// The worker pool needs at least one thread.
    #[error("Async worker pool needs at least one thread")]
    ZeroThreads,
    /// io_uring was requested but the crate was built without it.
    #[error("io_uring backend requested but the \"io_uring\" feature is disabled")]
    IoUringDisabled,
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_OPTICAL_READ_RETRIES: u32 = 2;
pub const DEFAULT_FLOPPY_OPEN_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SEEK_ERROR_LOG_LIMIT: u32 = 10;
pub const DEFAULT_SCRATCH_SECTORS: usize = 32;

fn default_diskconfig_optical_read_retries() -> u32 {
    DEFAULT_OPTICAL_READ_RETRIES
}

fn default_diskconfig_floppy_open_timeout_ms() -> u64 {
    DEFAULT_FLOPPY_OPEN_TIMEOUT_MS
}

fn default_diskconfig_seek_error_log_limit() -> u32 {
    DEFAULT_SEEK_ERROR_LOG_LIMIT
}

fn default_diskconfig_scratch_sectors() -> usize {
    DEFAULT_SCRATCH_SECTORS
}

/// Tunables of a raw disk handle.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiskConfig {
    /// Extra seek+read attempts after a short read on optical media.
    #[serde(default = "default_diskconfig_optical_read_retries")]
    pub optical_read_retries: u32,
    /// Idle time after which a floppy descriptor is closed, and the minimum
    /// delay between two failed open attempts.
    #[serde(default = "default_diskconfig_floppy_open_timeout_ms")]
    pub floppy_open_timeout_ms: u64,
    /// Number of consecutive seek failures that get logged.
    #[serde(default = "default_diskconfig_seek_error_log_limit")]
    pub seek_error_log_limit: u32,
    /// Size of the direct-access bounce buffer, in sectors.
    #[serde(default = "default_diskconfig_scratch_sectors")]
    pub scratch_sectors: usize,
}

impl DiskConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scratch_sectors == 0 {
            return Err(ConfigError::ScratchTooSmall);
        }
        if self.scratch_len().is_none() {
            return Err(ConfigError::ScratchTooLarge(self.scratch_sectors));
        }
        Ok(())
    }

    /// Size of the bounce buffer in bytes, `None` on overflow.
    pub fn scratch_len(&self) -> Option<usize> {
        self.scratch_sectors
            .checked_mul(SECTOR_SIZE as usize)
            .filter(|&len| len <= isize::MAX as usize)
    }

    pub fn floppy_open_timeout(&self) -> Duration {
        Duration::from_millis(self.floppy_open_timeout_ms)
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            optical_read_retries: default_diskconfig_optical_read_retries(),
            floppy_open_timeout_ms: default_diskconfig_floppy_open_timeout_ms(),
            seek_error_log_limit: default_diskconfig_seek_error_log_limit(),
            scratch_sectors: default_diskconfig_scratch_sectors(),
        }
    }
}

/// Host facility executing asynchronous requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AioBackendKind {
    /// Kernel AIO context, completions signalled through an eventfd.
    #[default]
    LinuxAio,
    /// Requests executed by a pool of worker threads.
    ThreadPool,
    /// io_uring instance with a registered eventfd.
    IoUring,
}

pub const DEFAULT_AIO_QUEUE_DEPTH: u32 = 128;
pub const DEFAULT_AIO_THREADS: usize = 1;

fn default_aioconfig_queue_depth() -> u32 {
    DEFAULT_AIO_QUEUE_DEPTH
}

fn default_aioconfig_threads() -> usize {
    DEFAULT_AIO_THREADS
}

/// Process-wide settings of the asynchronous I/O engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AioConfig {
    #[serde(default)]
    pub backend: AioBackendKind,
    #[serde(default = "default_aioconfig_queue_depth")]
    pub queue_depth: u32,
    /// Worker threads of the thread-pool backend.
    #[serde(default = "default_aioconfig_threads")]
    pub threads: usize,
}

impl AioConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.backend == AioBackendKind::IoUring && !cfg!(feature = "io_uring") {
            return Err(ConfigError::IoUringDisabled);
        }
        Ok(())
    }
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            backend: AioBackendKind::default(),
            queue_depth: default_aioconfig_queue_depth(),
            threads: default_aioconfig_threads(),
        }
    }
}
