// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Seams between a disk handle and the host.
//!
//! A [`HostFile`] is an open host descriptor, a [`HostOpener`] turns a path
//! and host open flags into one. Removable devices get reopened on demand,
//! which is why the handle keeps an opener rather than a single descriptor.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// An open host descriptor backing a disk.
pub trait HostFile: Read + Write + Seek + AsRawFd + Send + Debug {
    /// Flush data and metadata to the host storage.
    fn sync_all(&self) -> io::Result<()>;
    fn set_len(&self, size: u64) -> io::Result<()>;
}

impl HostFile for File {
    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }
}

/// Opens host descriptors by path.
pub trait HostOpener: Send + Debug {
    /// `flags` are host `open(2)` flags (`O_RDWR`, `O_DIRECT`, `O_NONBLOCK`,
    /// `O_CREAT`, ...).
    fn open(&self, path: &Path, flags: libc::c_int) -> io::Result<Box<dyn HostFile>>;
}

/// Opens descriptors with `open(2)`.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl HostOpener for SystemOpener {
    fn open(&self, path: &Path, flags: libc::c_int) -> io::Result<Box<dyn HostFile>> {
        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        if flags & libc::O_CREAT != 0 {
            options.create(true).truncate(true);
        }
        options
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC))
            .mode(0o644);

        Ok(Box::new(options.open(path)?))
    }
}

/// Whether the descriptor refers to a host block device.
pub(crate) fn is_block_device(fd: RawFd) -> io::Result<bool> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: FFI call with a valid fd and buffer
    let ret = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: stat is valid at this point
    let is_block = unsafe { (*stat.as_ptr()).st_mode & libc::S_IFMT == libc::S_IFBLK };
    Ok(is_block)
}
