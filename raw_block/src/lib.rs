// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Raw host-disk backend.
//!
//! Presents a host file or host block device (regular file, CD-ROM, floppy)
//! as a guest disk, operating purely on raw byte ranges. Handles opened for
//! direct access go through a sector-aligned bounce buffer, asynchronous
//! requests are driven by a single completion notifier, and removable
//! devices are revalidated lazily so that media swaps get noticed without
//! probing the device on every access.

#[macro_use]
extern crate log;

mod aligned;
pub mod aio;
pub mod aio_linux;
pub mod aio_thread;
#[cfg(feature = "io_uring")]
/// Async backend based on `io-uring`
///
/// Enabled with the `"io_uring"` feature
pub mod aio_uring;
pub mod buffer;
pub mod config;
pub mod host;
pub mod media;
pub mod raw;

use std::io;

use bitflags::bitflags;
use thiserror::Error;

use crate::config::ConfigError;
pub use crate::aio::{
    block_aio_is_supported, block_io_uring_is_supported, AioCallback, AioCompletion, AioContext,
    AioRequest,
};
pub use crate::buffer::IoBuffer;
pub use crate::config::{AioBackendKind, AioConfig, DiskConfig};
pub use crate::media::DeviceClass;
pub use crate::raw::{Driver, RawDisk};

const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

bitflags! {
    /// Access mode requested when opening a disk.
    ///
    /// The absence of `READ_WRITE` means read-only.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ_WRITE = 1 << 0;
        /// Bypass the host page cache. Offsets, lengths and buffer
        /// addresses reaching the host must then be sector aligned.
        const DIRECT = 1 << 1;
        /// Create the file, truncating it if it already exists.
        const CREATE = 1 << 2;
    }
}

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to set up the async I/O engine")]
    AioSetup(#[source] io::Error),
    #[error("Async request failed")]
    AsyncIo(#[source] io::Error),
    #[error("Failed to submit async request")]
    AsyncSubmit(#[source] io::Error),
    #[error("Failed to allocate an aligned buffer of {0} bytes")]
    BufferAllocation(usize),
    #[error("The disk has been closed")]
    Closed,
    #[error("Failed to create the completion notifier")]
    CreateNotifier(#[source] io::Error),
    #[error("Failed to wait on the completion notifier")]
    EpollWait(#[source] io::Error),
    #[error("Failed to flush disk")]
    Flush(#[source] io::Error),
    #[error("Failed getting disk length")]
    GetLength(#[source] io::Error),
    #[error("Buffer of {available} bytes does not match a transfer of {required} bytes")]
    InvalidBuffer { required: usize, available: usize },
    #[error("Invalid disk configuration")]
    InvalidConfig(#[source] ConfigError),
    #[error("Host ioctl failed")]
    Ioctl(#[source] io::Error),
    #[error("No medium present, try again later")]
    MediumUnavailable,
    #[error("Operation not supported by this device class")]
    NotSupported,
    #[error("Failed to open disk image")]
    Open(#[source] io::Error),
    #[error("Failed to read from disk")]
    Read(#[source] io::Error),
    #[error("The disk is opened read-only")]
    ReadOnly,
    #[error("Failed to seek disk")]
    Seek(#[source] io::Error),
    #[error("Short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("Failed to truncate disk")]
    Truncate(#[source] io::Error),
    #[error("Failed to write to disk")]
    Write(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn os_errno(e: &io::Error) -> i32 {
    match e.raw_os_error() {
        Some(libc::EROFS) => -libc::EACCES,
        Some(errno) if errno > 0 => -errno,
        _ => -libc::EIO,
    }
}

impl Error {
    /// Negative host error code equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AioSetup(e)
            | Error::AsyncIo(e)
            | Error::AsyncSubmit(e)
            | Error::CreateNotifier(e)
            | Error::EpollWait(e)
            | Error::Flush(e)
            | Error::GetLength(e)
            | Error::Ioctl(e)
            | Error::Open(e)
            | Error::Read(e)
            | Error::Seek(e)
            | Error::Truncate(e)
            | Error::Write(e) => os_errno(e),
            Error::BufferAllocation(_) => -libc::ENOMEM,
            Error::Closed => -libc::EBADF,
            Error::InvalidBuffer { .. } | Error::InvalidConfig(_) => -libc::EINVAL,
            Error::MediumUnavailable => -libc::EIO,
            Error::NotSupported => -libc::ENOTSUP,
            Error::ReadOnly => -libc::EACCES,
            Error::ShortTransfer { .. } => -libc::EIO,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Read(e) | Error::Write(e) | Error::Seek(e) => e,
            e => io::Error::from_raw_os_error(-e.errno()),
        }
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}
