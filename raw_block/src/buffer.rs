// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Heap buffers with a guaranteed address alignment.
//!
//! Direct-access descriptors reject transfers whose memory is not sector
//! aligned, so the scratch buffer of a disk and the buffers handed to the
//! asynchronous engine are allocated through [`IoBuffer`] rather than `Vec`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::{Error, Result, SECTOR_SIZE};

/// Owned, zero-initialized byte buffer whose first byte sits at a chosen
/// alignment (plus an optional offset).
pub struct IoBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    offset: usize,
    len: usize,
}

// SAFETY: IoBuffer exclusively owns its allocation, like a Vec<u8>.
unsafe impl Send for IoBuffer {}
// SAFETY: shared references only allow reads of the owned allocation.
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// Allocates `len` zeroed bytes aligned on a sector boundary.
    pub fn new(len: usize) -> Result<Self> {
        Self::with_alignment(len, SECTOR_SIZE as usize)
    }

    pub fn with_alignment(len: usize, alignment: usize) -> Result<Self> {
        Self::with_offset(len, alignment, 0)
    }

    /// Allocates `len` bytes starting `offset` bytes past an `alignment`
    /// boundary. A non-zero offset smaller than the alignment yields a
    /// buffer that is deliberately misaligned.
    pub fn with_offset(len: usize, alignment: usize, offset: usize) -> Result<Self> {
        let size = offset
            .checked_add(len)
            .ok_or(Error::BufferAllocation(len))?
            .max(alignment);
        let layout =
            Layout::from_size_align(size, alignment).map_err(|_| Error::BufferAllocation(len))?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::BufferAllocation(len))?;

        Ok(IoBuffer {
            ptr,
            layout,
            offset,
            len,
        })
    }

    /// Sector-aligned copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        // SAFETY: offset is within the allocation
        unsafe { self.ptr.as_ptr().add(self.offset) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        // SAFETY: offset is within the allocation
        unsafe { self.ptr.as_ptr().add(self.offset) }
    }

    /// Whether the first byte of the buffer is aligned on `alignment`.
    pub fn is_aligned(&self, alignment: usize) -> bool {
        (self.as_ptr() as usize) % alignment == 0
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: [offset, offset + len) lies within the zero-initialized
        // allocation owned by self.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: see Deref, and &mut self guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by alloc_zeroed with the same layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}
