// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Byte-range I/O on top of the sector-granular primitive.
//!
//! Without a scratch buffer every request is a single host call. Otherwise
//! misaligned heads, tails and destinations go through the scratch buffer,
//! and only a remainder that is aligned in length and address is handed to
//! the host directly.

use std::cmp::min;
use std::ops::Range;

use crate::buffer::IoBuffer;
use crate::raw::RawDisk;
use crate::{align_up, Error, Result, SECTOR_SIZE};

const SECTOR: usize = SECTOR_SIZE as usize;

fn is_sector_aligned(buf: &[u8]) -> bool {
    buf.len() % SECTOR == 0 && (buf.as_ptr() as usize) % SECTOR == 0
}

fn check_complete(expected: usize, actual: usize) -> Result<usize> {
    if actual != expected {
        return Err(Error::ShortTransfer { expected, actual });
    }
    Ok(actual)
}

impl RawDisk {
    /// Reads exactly `buf.len()` bytes at byte `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Some(mut scratch) = self.scratch.take() else {
            let n = self.pread_aligned(Some(offset), buf)?;
            return check_complete(buf.len(), n);
        };
        let result = self.read_through(&mut scratch, offset, buf);
        self.scratch = Some(scratch);
        result
    }

    /// Writes all of `buf` at byte `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let Some(mut scratch) = self.scratch.take() else {
            let n = self.pwrite_aligned(Some(offset), buf)?;
            return check_complete(buf.len(), n);
        };
        let result = self.write_through(&mut scratch, offset, buf);
        self.scratch = Some(scratch);
        result
    }

    fn read_through(
        &mut self,
        scratch: &mut IoBuffer,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let total = buf.len();
        if total == 0 {
            return Ok(0);
        }
        let mut offset = offset;
        let mut done = 0;

        let shift = (offset % SECTOR_SIZE) as usize;
        if shift != 0 {
            let take = min(SECTOR - shift, total);
            let n = self.pread_aligned(Some(offset - shift as u64), &mut scratch[..SECTOR])?;
            if n < shift + take {
                return Err(Error::ShortTransfer {
                    expected: total,
                    actual: n.saturating_sub(shift),
                });
            }
            buf[..take].copy_from_slice(&scratch[shift..shift + take]);
            done += take;
            offset += take as u64;
        }

        while done < total {
            let remaining = total - done;
            if is_sector_aligned(&buf[done..]) {
                let n = self.pread_aligned(Some(offset), &mut buf[done..])?;
                return check_complete(total, done + n);
            }

            let take = min(remaining, scratch.len());
            let chunk = align_up(take, SECTOR);
            let n = self.pread_aligned(Some(offset), &mut scratch[..chunk])?;
            if n < take {
                return Err(Error::ShortTransfer {
                    expected: total,
                    actual: done + n,
                });
            }
            buf[done..done + take].copy_from_slice(&scratch[..take]);
            done += take;
            offset += take as u64;
        }

        Ok(total)
    }

    /// Fills `scratch[range]` with the sector at `offset`, zeroes past the
    /// end of the disk.
    fn read_back(
        &mut self,
        scratch: &mut IoBuffer,
        offset: u64,
        range: Range<usize>,
    ) -> Result<()> {
        let start = range.start;
        let n = self.pread_aligned(Some(offset), &mut scratch[range.clone()])?;
        scratch[start + n..range.end].fill(0);
        Ok(())
    }

    fn write_through(
        &mut self,
        scratch: &mut IoBuffer,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let total = buf.len();
        if total == 0 {
            return Ok(0);
        }
        let mut offset = offset;
        let mut done = 0;

        let shift = (offset % SECTOR_SIZE) as usize;
        if shift != 0 {
            let take = min(SECTOR - shift, total);
            let base = offset - shift as u64;
            self.read_back(scratch, base, 0..SECTOR)?;
            scratch[shift..shift + take].copy_from_slice(&buf[..take]);
            let n = self.pwrite_aligned(Some(base), &scratch[..SECTOR])?;
            if n < SECTOR {
                return Err(Error::ShortTransfer {
                    expected: total,
                    actual: 0,
                });
            }
            done += take;
            offset += take as u64;
        }

        while done < total {
            let remaining = total - done;
            if is_sector_aligned(&buf[done..]) {
                let n = self.pwrite_aligned(Some(offset), &buf[done..])?;
                return check_complete(total, done + n);
            }

            let take = min(remaining, scratch.len());
            let chunk = align_up(take, SECTOR);
            if take < chunk {
                // Preserve what follows the range in its last sector.
                let tail = chunk - SECTOR;
                self.read_back(scratch, offset + tail as u64, tail..chunk)?;
            }
            scratch[..take].copy_from_slice(&buf[done..done + take]);
            let n = self.pwrite_aligned(Some(offset), &scratch[..chunk])?;
            if n < chunk {
                return Err(Error::ShortTransfer {
                    expected: total,
                    actual: done + min(n, take),
                });
            }
            done += take;
            offset += take as u64;
        }

        Ok(total)
    }
}
