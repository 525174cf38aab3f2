// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::BorrowedFd;
use std::path::{Path, PathBuf};

use vmm_sys_util::ioctl_ior_nr;

use crate::aio::{AioCallback, AioContext, AioRequest, RequestOp};
use crate::buffer::IoBuffer;
use crate::config::DiskConfig;
use crate::host::{is_block_device, HostFile, HostOpener, SystemOpener};
use crate::media::{is_scsi_generic_path, DeviceClass, DeviceKind, DeviceSlot, FloppyState};
use crate::{Error, OpenFlags, Result, SECTOR_SIZE};

ioctl_ior_nr!(BLKGETSIZE64, 0x12, 114, u64);

/// Driver variant a disk was opened through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driver {
    /// Image files. Supports creation and truncation.
    File,
    /// Host devices, classified by path. Supports removable-media queries
    /// and raw ioctls.
    HostDevice,
}

/// An open raw disk.
#[derive(Debug)]
pub struct RawDisk {
    path: PathBuf,
    file: Option<Box<dyn HostFile>>,
    kind: DeviceKind,
    driver: Driver,
    read_only: bool,
    direct: bool,
    scsi_generic: bool,
    seek_error_count: u32,
    pub(crate) scratch: Option<IoBuffer>,
    opener: Box<dyn HostOpener>,
    config: DiskConfig,
    closed: bool,
}

impl RawDisk {
    /// Opens an image file.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags, config: DiskConfig) -> Result<Self> {
        Self::open_with_opener(path, flags, config, Driver::File, Box::new(SystemOpener))
    }

    /// Opens a host device, `/dev/cd*` and `/dev/fd*` being handled as
    /// removable optical and floppy drives.
    pub fn open_host_device<P: AsRef<Path>>(
        path: P,
        flags: OpenFlags,
        config: DiskConfig,
    ) -> Result<Self> {
        Self::open_with_opener(
            path,
            flags,
            config,
            Driver::HostDevice,
            Box::new(SystemOpener),
        )
    }

    pub fn open_with_opener<P: AsRef<Path>>(
        path: P,
        flags: OpenFlags,
        config: DiskConfig,
        driver: Driver,
        opener: Box<dyn HostOpener>,
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;
        let path = path.as_ref().to_path_buf();

        let mut open_flags = if flags.contains(OpenFlags::READ_WRITE) {
            libc::O_RDWR
        } else {
            libc::O_RDONLY
        };
        if flags.contains(OpenFlags::DIRECT) {
            open_flags |= libc::O_DIRECT;
        }
        if flags.contains(OpenFlags::CREATE) && driver == Driver::File {
            open_flags |= libc::O_CREAT;
        }

        let (class, scsi_generic) = match driver {
            Driver::File => (DeviceClass::PlainFile, false),
            Driver::HostDevice => (
                DeviceClass::from_path(&path),
                is_scsi_generic_path(&path),
            ),
        };
        // Removable drives must be openable without a medium.
        let nonblock = match class {
            DeviceClass::PlainFile => 0,
            DeviceClass::OpticalDisc | DeviceClass::Floppy => libc::O_NONBLOCK,
        };

        let mut read_only = !flags.contains(OpenFlags::READ_WRITE);
        let file = match opener.open(&path, open_flags | nonblock) {
            Ok(file) => file,
            Err(e)
                if e.raw_os_error() == Some(libc::EROFS)
                    && open_flags & libc::O_ACCMODE == libc::O_RDWR =>
            {
                warn!("{:?} is on read-only media, opening it read-only", path);
                open_flags = (open_flags & !libc::O_ACCMODE) | libc::O_RDONLY;
                read_only = true;
                opener
                    .open(&path, open_flags | nonblock)
                    .map_err(Error::Open)?
            }
            Err(e) => return Err(Error::Open(e)),
        };

        let (kind, file) = match class {
            DeviceClass::PlainFile => (DeviceKind::PlainFile, Some(file)),
            DeviceClass::OpticalDisc => (DeviceKind::OpticalDisc, Some(file)),
            // The floppy descriptor gets reopened on the first access.
            DeviceClass::Floppy => (
                DeviceKind::Floppy(FloppyState::new(open_flags & !libc::O_CREAT)),
                None,
            ),
        };

        let direct = flags.contains(OpenFlags::DIRECT);
        let scratch = if direct {
            let len = config
                .scratch_len()
                .ok_or(Error::BufferAllocation(config.scratch_sectors))?;
            Some(IoBuffer::new(len)?)
        } else {
            None
        };

        debug!(
            "Opened {:?} as {:?} (driver {:?}, read-only {}, direct {})",
            path, class, driver, read_only, direct
        );

        Ok(RawDisk {
            path,
            file,
            kind,
            driver,
            read_only,
            direct,
            scsi_generic,
            seek_error_count: 0,
            scratch,
            opener,
            config,
            closed: false,
        })
    }

    /// Creates, or truncates, an image file of `sectors` sectors.
    pub fn create<P: AsRef<Path>>(path: P, sectors: u64) -> Result<()> {
        let size = sectors
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::Truncate(io::Error::from_raw_os_error(libc::EFBIG)))?;
        let file = SystemOpener
            .open(path.as_ref(), libc::O_WRONLY | libc::O_CREAT)
            .map_err(Error::Open)?;
        file.set_len(size).map_err(Error::Truncate)
    }

    /// Releases the descriptor and the scratch buffer. Closing twice is a
    /// no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.file = None;
        self.scratch = None;
        self.closed = true;
        debug!("Closed {:?}", self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> DeviceClass {
        self.kind.class()
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn is_scsi_generic(&self) -> bool {
        self.scsi_generic
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    fn device(&mut self) -> (&mut DeviceKind, DeviceSlot<'_>) {
        (
            &mut self.kind,
            DeviceSlot {
                file: &mut self.file,
                opener: self.opener.as_ref(),
                path: &self.path,
                open_timeout: self.config.floppy_open_timeout(),
            },
        )
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let (kind, slot) = self.device();
        kind.ensure_open(slot)
    }

    // Only the first failures of a streak get logged.
    fn seek_error_logged(&self) -> bool {
        self.seek_error_count <= self.config.seek_error_log_limit
    }

    fn seek_to(&mut self, offset: Option<u64>) -> Result<()> {
        let Some(offset) = offset else {
            return Ok(());
        };
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            self.seek_error_count = self.seek_error_count.saturating_add(1);
            if self.seek_error_logged() {
                error!(
                    "Failed to seek {:?} to {}: {} (error {} of {} logged)",
                    self.path, offset, e, self.seek_error_count, self.config.seek_error_log_limit
                );
            }
            return Err(Error::Seek(e));
        }
        Ok(())
    }

    /// Single read at `offset`, or at the current position when `None`.
    ///
    /// Returns the number of bytes read, which may fall short of
    /// `buf.len()`. Optical drives get the whole seek and read retried.
    pub(crate) fn pread_aligned(&mut self, offset: Option<u64>, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;

        let mut attempts = match self.kind {
            DeviceKind::OpticalDisc => self.config.optical_read_retries + 1,
            _ => 1,
        };
        loop {
            self.seek_to(offset)?;
            let file = self.file.as_mut().ok_or(Error::Closed)?;
            let result = loop {
                match file.read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    result => break result,
                }
            };
            attempts -= 1;

            match result {
                Ok(n) if n == buf.len() => {
                    self.seek_error_count = 0;
                    return Ok(n);
                }
                result if attempts == 0 => return result.map_err(Error::Read),
                result => debug!(
                    "Retrying read of {} bytes from {:?}: {:?}",
                    buf.len(),
                    self.path,
                    result
                ),
            }
        }
    }

    /// Single write at `offset`, or at the current position when `None`.
    /// Never retried.
    pub(crate) fn pwrite_aligned(&mut self, offset: Option<u64>, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.ensure_open()?;
        self.seek_to(offset)?;

        let file = self.file.as_mut().ok_or(Error::Closed)?;
        let n = loop {
            match file.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => break result.map_err(Error::Write)?,
            }
        };
        if n == buf.len() {
            self.seek_error_count = 0;
        }
        Ok(n)
    }

    /// Sets the image size to `sectors` sectors.
    pub fn truncate(&mut self, sectors: u64) -> Result<()> {
        if self.driver != Driver::File {
            return Err(Error::NotSupported);
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.ensure_open()?;

        let size = sectors
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::Truncate(io::Error::from_raw_os_error(libc::EFBIG)))?;
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        file.set_len(size).map_err(Error::Truncate)
    }

    /// Size of the disk in bytes.
    pub fn length(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let file = self.file.as_mut().ok_or(Error::Closed)?;

        if is_block_device(file.as_raw_fd()).map_err(Error::GetLength)? {
            let mut size: u64 = 0;
            // SAFETY: BLKGETSIZE64 writes a u64 through the provided pointer
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64() as _, &mut size) };
            if ret == 0 {
                return Ok(size);
            }
            warn!(
                "BLKGETSIZE64 failed on {:?}: {}",
                self.path,
                io::Error::last_os_error()
            );
        }

        file.seek(SeekFrom::End(0)).map_err(Error::GetLength)
    }

    /// Makes previous writes durable on the host storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        // A floppy closed for idleness has nothing left to sync.
        match self.file.as_ref() {
            Some(file) => file.sync_all().map_err(Error::Flush),
            None => Ok(()),
        }
    }

    pub fn is_inserted(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        let (kind, slot) = self.device();
        kind.is_inserted(slot)
    }

    /// Returns whether the medium changed since the last call.
    pub fn media_changed(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        let (kind, slot) = self.device();
        kind.media_changed(slot)
    }

    /// Ejects the medium, or closes the tray when `eject` is false.
    pub fn eject(&mut self, eject: bool) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let (kind, slot) = self.device();
        kind.eject(slot, eject)
    }

    pub fn set_locked(&mut self, locked: bool) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let (kind, slot) = self.device();
        kind.set_locked(slot, locked)
    }

    /// Forwards an ioctl to the host device.
    ///
    /// # Safety
    ///
    /// `arg` must be valid for whatever `request` reads or writes through it.
    pub unsafe fn ioctl(&mut self, request: libc::c_ulong, arg: *mut libc::c_void) -> Result<i32> {
        if self.driver != Driver::HostDevice {
            return Err(Error::NotSupported);
        }
        self.ensure_open()?;
        let fd = self.file.as_ref().ok_or(Error::Closed)?.as_raw_fd();

        // SAFETY: the caller guarantees `arg` matches `request`
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret < 0 {
            return Err(Error::Ioctl(io::Error::last_os_error()));
        }
        Ok(ret)
    }

    /// Reads `nb_sectors` sectors starting at `sector` into `buffer`.
    ///
    /// The callback runs from [`AioContext::poll`] and gets `buffer` back.
    pub fn aio_read(
        &mut self,
        ctx: &mut AioContext,
        sector: u64,
        nb_sectors: u32,
        buffer: IoBuffer,
        callback: AioCallback,
    ) -> Result<AioRequest> {
        self.submit_aio(ctx, RequestOp::Read, sector, nb_sectors, buffer, callback)
    }

    /// Writes `buffer` over `nb_sectors` sectors starting at `sector`.
    pub fn aio_write(
        &mut self,
        ctx: &mut AioContext,
        sector: u64,
        nb_sectors: u32,
        buffer: IoBuffer,
        callback: AioCallback,
    ) -> Result<AioRequest> {
        self.submit_aio(ctx, RequestOp::Write, sector, nb_sectors, buffer, callback)
    }

    fn submit_aio(
        &mut self,
        ctx: &mut AioContext,
        op: RequestOp,
        sector: u64,
        nb_sectors: u32,
        mut buffer: IoBuffer,
        callback: AioCallback,
    ) -> Result<AioRequest> {
        let len = nb_sectors as usize * SECTOR_SIZE as usize;
        if buffer.len() != len {
            return Err(Error::InvalidBuffer {
                required: len,
                available: buffer.len(),
            });
        }
        if op == RequestOp::Write && self.read_only {
            return Err(Error::ReadOnly);
        }
        let offset = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::Seek(io::Error::from_raw_os_error(libc::EINVAL)))?;

        // The host rejects misaligned memory on direct descriptors, go
        // through the bounce buffer and report on the next poll instead.
        if self.direct && !buffer.is_aligned(SECTOR_SIZE as usize) {
            let result = match op {
                RequestOp::Read => self.read_at(offset, &mut buffer),
                RequestOp::Write => self.write_at(offset, &buffer),
            };
            return Ok(ctx.defer(result.map(|_| ()), buffer, callback));
        }

        self.ensure_open()?;
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        // SAFETY: the descriptor is owned by self.file, which outlives this
        // borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) }
            .try_clone_to_owned()
            .map_err(Error::AsyncSubmit)?;

        ctx.submit(op, fd, offset, buffer, callback)
    }

    /// Routes unaligned requests through a scratch buffer even though the
    /// descriptor does not need one.
    #[cfg(test)]
    pub(crate) fn enable_bounce_buffer(&mut self) {
        let len = self.config.scratch_len().unwrap();
        self.scratch = Some(IoBuffer::new(len).unwrap());
        self.direct = true;
    }
}

impl Read for RawDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pread_aligned(None, buf)?)
    }
}

impl Write for RawDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.pwrite_aligned(None, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(RawDisk::flush(self)?)
    }
}

impl Seek for RawDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_open()?;
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        file.seek(pos)
    }
}


#[cfg(test)]
mod unit_tests {
    use std::sync::{Arc, Mutex};

    use vmm_sys_util::tempfile::TempFile;

    use super::test_util::FlakyOpener;
    use super::*;
    use crate::aio::AioCompletion;
    use crate::config::{AioBackendKind, AioConfig, ConfigError};
    use crate::media::test_util::RemovableOpener;

    fn patterned_image(sectors: usize) -> TempFile {
        let temp_file = TempFile::new().unwrap();
        let data: Vec<u8> = (0..sectors * SECTOR_SIZE as usize)
            .map(|i| (i % 251) as u8)
            .collect();
        temp_file.as_file().write_all(&data).unwrap();
        temp_file
    }

    #[test]
    fn test_create_and_truncate() {
        let temp_file = TempFile::new().unwrap();
        RawDisk::create(temp_file.as_path(), 8).unwrap();

        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        assert_eq!(disk.length().unwrap(), 8 * SECTOR_SIZE);
        assert_eq!(disk.class(), DeviceClass::PlainFile);
        assert!(disk.is_inserted().unwrap());

        disk.truncate(2).unwrap();
        assert_eq!(disk.length().unwrap(), 2 * SECTOR_SIZE);
        disk.flush().unwrap();
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let temp_file = patterned_image(2);
        let mut disk =
            RawDisk::open(temp_file.as_path(), OpenFlags::empty(), DiskConfig::default())
                .unwrap();
        assert!(disk.is_read_only());
        assert!(matches!(disk.write_at(0, &[0u8; 512]), Err(Error::ReadOnly)));
        assert!(matches!(disk.truncate(1), Err(Error::ReadOnly)));

        let mut buf = [0u8; 512];
        disk.read_at(512, &mut buf).unwrap();
        assert_eq!(buf[0], (512 % 251) as u8);
    }

    #[test]
    fn test_close_is_idempotent() {
        let temp_file = patterned_image(1);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        disk.close();
        disk.close();
        assert!(matches!(disk.length(), Err(Error::Closed)));
        assert!(matches!(disk.flush(), Err(Error::Closed)));
        assert!(matches!(
            disk.read_at(0, &mut [0u8; 16]),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_file_driver_capabilities() {
        let temp_file = patterned_image(1);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        assert_eq!(disk.driver(), Driver::File);
        assert!(matches!(disk.media_changed(), Err(Error::NotSupported)));
        assert!(matches!(disk.eject(true), Err(Error::NotSupported)));
        assert!(matches!(disk.set_locked(true), Err(Error::NotSupported)));
        // SAFETY: the request is rejected before reaching the host
        let ret = unsafe { disk.ioctl(0, std::ptr::null_mut()) };
        assert!(matches!(ret, Err(Error::NotSupported)));
    }

    #[test]
    fn test_host_device_cannot_truncate() {
        let temp_file = patterned_image(1);
        let mut disk = RawDisk::open_host_device(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        assert_eq!(disk.class(), DeviceClass::PlainFile);
        assert!(matches!(disk.truncate(1), Err(Error::NotSupported)));
        assert_eq!(disk.length().unwrap(), SECTOR_SIZE);
    }

    #[test]
    fn test_optical_read_retried() {
        let temp_file = patterned_image(4);
        let opener = FlakyOpener::new(temp_file.as_path());
        let mut disk = RawDisk::open_with_opener(
            "/dev/cdrom",
            OpenFlags::empty(),
            DiskConfig::default(),
            Driver::HostDevice,
            Box::new(opener.clone()),
        )
        .unwrap();
        assert_eq!(disk.class(), DeviceClass::OpticalDisc);

        // Two transient failures are absorbed by the retries.
        opener.set_short_reads(2);
        let mut buf = vec![0u8; 1024];
        assert_eq!(disk.read_at(512, &mut buf).unwrap(), 1024);
        assert_eq!(buf[0], (512 % 251) as u8);
        assert_eq!(buf[1023], (1535 % 251) as u8);

        // A third one is reported.
        opener.set_short_reads(3);
        assert!(matches!(
            disk.read_at(0, &mut buf),
            Err(Error::ShortTransfer { .. })
        ));
    }

    #[test]
    fn test_plain_short_read_not_retried() {
        let temp_file = patterned_image(4);
        let opener = FlakyOpener::new(temp_file.as_path());
        let mut disk = RawDisk::open_with_opener(
            "/dev/sda",
            OpenFlags::empty(),
            DiskConfig::default(),
            Driver::HostDevice,
            Box::new(opener.clone()),
        )
        .unwrap();

        opener.set_short_reads(1);
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            disk.read_at(0, &mut buf),
            Err(Error::ShortTransfer {
                expected: 1024,
                actual: 512
            })
        ));
        // The handle stays usable.
        assert_eq!(disk.read_at(0, &mut buf).unwrap(), 1024);
    }

    #[test]
    fn test_floppy_opened_lazily() {
        let temp_file = patterned_image(4);
        let opener = RemovableOpener::new(temp_file.as_path());
        let mut disk = RawDisk::open_with_opener(
            "/dev/fd0",
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
            Driver::HostDevice,
            Box::new(opener.clone()),
        )
        .unwrap();
        assert_eq!(disk.class(), DeviceClass::Floppy);
        assert_eq!(opener.opens(), 1);

        // The probing descriptor was non-blocking, regular ones are not.
        let mut buf = [0u8; 512];
        disk.read_at(0, &mut buf).unwrap();
        disk.write_at(512, &buf).unwrap();
        assert_eq!(opener.opens(), 2);
        let flags = opener.flags.lock().unwrap().clone();
        assert_ne!(flags[0] & libc::O_NONBLOCK, 0);
        assert_eq!(flags[1] & libc::O_NONBLOCK, 0);
        assert_eq!(flags[1] & libc::O_ACCMODE, libc::O_RDWR);
        drop(flags);

        assert!(disk.is_inserted().unwrap());
        assert!(disk.media_changed().unwrap());
        assert!(!disk.media_changed().unwrap());

        opener.set_present(false);
        disk.eject(true).unwrap();
        assert!(matches!(
            disk.read_at(0, &mut buf),
            Err(Error::MediumUnavailable)
        ));
        assert!(!disk.is_inserted().unwrap());
    }

    #[test]
    fn test_streaming_read_write_seek() {
        let temp_file = patterned_image(2);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();

        disk.seek(SeekFrom::Start(10)).unwrap();
        disk.write_all(b"streamed").unwrap();
        disk.seek(SeekFrom::Start(10)).unwrap();
        let mut buf = [0u8; 8];
        disk.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"streamed");
        assert_eq!(disk.stream_position().unwrap(), 18);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_file = patterned_image(1);
        let config = DiskConfig {
            scratch_sectors: 0,
            ..Default::default()
        };
        assert!(matches!(
            RawDisk::open(temp_file.as_path(), OpenFlags::empty(), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_read_only_media_downgrades() {
        let temp_file = patterned_image(2);
        let opener = FlakyOpener {
            read_only_media: true,
            ..FlakyOpener::new(temp_file.as_path())
        };

        let mut disk = RawDisk::open_with_opener(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
            Driver::File,
            Box::new(opener),
        )
        .unwrap();
        assert!(disk.is_read_only());

        let mut buf = [0u8; 16];
        assert_eq!(disk.read_at(512, &mut buf).unwrap(), 16);
        assert_eq!(buf[0], (512 % 251) as u8);
        assert!(matches!(disk.write_at(0, b"data"), Err(Error::ReadOnly)));
        assert!(matches!(disk.truncate(1), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_seek_failures_counted_and_reset() {
        let temp_file = patterned_image(2);
        let opener = FlakyOpener::new(temp_file.as_path());
        let config = DiskConfig {
            seek_error_log_limit: 3,
            ..Default::default()
        };
        let mut disk = RawDisk::open_with_opener(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            config,
            Driver::File,
            Box::new(opener.clone()),
        )
        .unwrap();

        opener.set_failing_seeks(true);
        let mut buf = [0u8; 512];
        for i in 1..=5 {
            let err = disk.read_at(0, &mut buf).unwrap_err();
            assert!(matches!(err, Error::Seek(_)));
            assert_eq!(err.errno(), -libc::ESPIPE);
            assert_eq!(disk.seek_error_count, i);
            assert_eq!(disk.seek_error_logged(), i <= 3);
        }
        assert!(matches!(disk.write_at(0, &buf), Err(Error::Seek(_))));
        assert_eq!(disk.seek_error_count, 6);

        opener.set_failing_seeks(false);
        assert_eq!(disk.read_at(512, &mut buf).unwrap(), 512);
        assert_eq!(disk.seek_error_count, 0);
        assert!(disk.seek_error_logged());
    }

    #[test]
    fn test_oversized_scratch_rejected() {
        let temp_file = patterned_image(1);
        let config = DiskConfig {
            scratch_sectors: usize::MAX / 256,
            ..Default::default()
        };
        assert!(matches!(
            RawDisk::open(temp_file.as_path(), OpenFlags::DIRECT, config),
            Err(Error::InvalidConfig(ConfigError::ScratchTooLarge(_)))
        ));
    }

    type Completions = Arc<Mutex<Vec<AioCompletion>>>;

    fn collector(completions: &Completions) -> AioCallback {
        let completions = completions.clone();
        Box::new(move |c| completions.lock().unwrap().push(c))
    }

    fn thread_pool_context() -> AioContext {
        AioContext::new(&AioConfig {
            backend: AioBackendKind::ThreadPool,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_aio_read_and_write() {
        let temp_file = patterned_image(8);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        let mut ctx = thread_pool_context();
        let completions: Completions = Arc::default();

        let data = IoBuffer::from_slice(&[0xa5u8; 1024]).unwrap();
        disk.aio_write(&mut ctx, 2, 2, data, collector(&completions))
            .unwrap();
        ctx.flush().unwrap();

        let read = disk
            .aio_read(
                &mut ctx,
                2,
                2,
                IoBuffer::new(1024).unwrap(),
                collector(&completions),
            )
            .unwrap();
        ctx.flush().unwrap();

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|c| c.result.is_ok()));
        let completion = completions.iter().find(|c| c.request == read).unwrap();
        assert!(completion.buffer.iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn test_aio_rejects_mismatched_buffer() {
        let temp_file = patterned_image(8);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::empty(),
            DiskConfig::default(),
        )
        .unwrap();
        let mut ctx = thread_pool_context();
        let completions: Completions = Arc::default();

        assert!(matches!(
            disk.aio_read(
                &mut ctx,
                0,
                2,
                IoBuffer::new(512).unwrap(),
                collector(&completions)
            ),
            Err(Error::InvalidBuffer {
                required: 1024,
                available: 512
            })
        ));
        assert!(matches!(
            disk.aio_write(
                &mut ctx,
                0,
                1,
                IoBuffer::new(512).unwrap(),
                collector(&completions)
            ),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_aio_misaligned_buffer_completes_on_next_poll() {
        let temp_file = patterned_image(8);
        let mut disk = RawDisk::open(
            temp_file.as_path(),
            OpenFlags::READ_WRITE,
            DiskConfig::default(),
        )
        .unwrap();
        disk.enable_bounce_buffer();
        let mut ctx = thread_pool_context();
        let completions: Completions = Arc::default();

        let buffer = IoBuffer::with_offset(512, 512, 1).unwrap();
        let request = disk
            .aio_read(&mut ctx, 1, 1, buffer, collector(&completions))
            .unwrap();
        assert!(completions.lock().unwrap().is_empty());

        assert_eq!(ctx.poll(), 1);
        let completions = completions.lock().unwrap();
        assert_eq!(completions[0].request, request);
        assert!(completions[0].result.is_ok());
        assert_eq!(completions[0].buffer[0], (512 % 251) as u8);
    }
}
