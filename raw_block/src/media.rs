// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Removable-media device manager.
//!
//! Floppy drives give no reliable media-present indication, so the
//! descriptor is opened on demand, kept open while accesses keep coming and
//! closed again once it has been idle for a while. Reopening after a swap is
//! what lets the manager notice a media change. Failed opens are rate
//! limited so that polling an empty drive does not hammer the host.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use vmm_sys_util::ioctl_io_nr;

use crate::host::{HostFile, HostOpener};
use crate::{Error, Result};

ioctl_io_nr!(CDROMEJECT, 0x53, 0x09);
ioctl_io_nr!(CDROMCLOSETRAY, 0x53, 0x19);
ioctl_io_nr!(CDROM_DRIVE_STATUS, 0x53, 0x26);
ioctl_io_nr!(CDROM_LOCKDOOR, 0x53, 0x29);
ioctl_io_nr!(FDEJECT, 0x02, 0x5a);

const CDSL_CURRENT: libc::c_ulong = libc::c_int::MAX as libc::c_ulong;
const CDS_DISC_OK: libc::c_int = 4;

/// Device class of a disk, fixed at open time from the requested path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    PlainFile,
    OpticalDisc,
    Floppy,
}

impl DeviceClass {
    /// Classification applied by the host-device driver.
    pub fn from_path(path: &Path) -> Self {
        let path = path.as_os_str().as_bytes();
        if path.starts_with(b"/dev/cd") {
            DeviceClass::OpticalDisc
        } else if path.starts_with(b"/dev/fd") {
            DeviceClass::Floppy
        } else {
            DeviceClass::PlainFile
        }
    }
}

pub(crate) fn is_scsi_generic_path(path: &Path) -> bool {
    path.as_os_str().as_bytes().starts_with(b"/dev/sg")
}

fn host_ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<libc::c_int> {
    // SAFETY: every request issued from this module takes an integer
    // argument (or ignores it), so no memory is handed to the kernel.
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// The parts of a disk handle the device manager operates on.
pub(crate) struct DeviceSlot<'a> {
    pub file: &'a mut Option<Box<dyn HostFile>>,
    pub opener: &'a dyn HostOpener,
    pub path: &'a Path,
    pub open_timeout: Duration,
}

/// Open/close state of a floppy drive.
#[derive(Debug)]
pub(crate) struct FloppyState {
    /// Flags used when reopening, without `O_NONBLOCK`.
    open_flags: libc::c_int,
    last_open_time: Option<Instant>,
    last_error_time: Option<Instant>,
    had_error: bool,
    media_changed: bool,
}

impl FloppyState {
    pub(crate) fn new(open_flags: libc::c_int) -> Self {
        FloppyState {
            open_flags,
            last_open_time: None,
            last_error_time: None,
            had_error: false,
            // The descriptor starts closed; whatever gets found first is new.
            media_changed: true,
        }
    }

    fn revalidate(&mut self, slot: DeviceSlot<'_>) -> Result<()> {
        let last_media_present = slot.file.is_some();

        if slot.file.is_some()
            && self
                .last_open_time
                .is_some_and(|t| t.elapsed() >= slot.open_timeout)
        {
            *slot.file = None;
            debug!("Floppy {:?} closed after idle timeout", slot.path);
        }

        if slot.file.is_none() {
            if self.had_error
                && self
                    .last_error_time
                    .is_some_and(|t| t.elapsed() < slot.open_timeout)
            {
                debug!("No floppy in {:?} (open delayed)", slot.path);
                return Err(Error::MediumUnavailable);
            }

            match slot.opener.open(slot.path, self.open_flags) {
                Ok(file) => {
                    debug!("Floppy {:?} opened", slot.path);
                    *slot.file = Some(file);
                }
                Err(e) => {
                    self.last_error_time = Some(Instant::now());
                    self.had_error = true;
                    if last_media_present {
                        self.media_changed = true;
                    }
                    debug!("No floppy in {:?}: {}", slot.path, e);
                    return Err(Error::MediumUnavailable);
                }
            }
        }

        if !last_media_present {
            self.media_changed = true;
        }
        self.last_open_time = Some(Instant::now());
        self.had_error = false;
        Ok(())
    }

    fn eject(&mut self, slot: DeviceSlot<'_>) {
        *slot.file = None;

        // The primary descriptor may not be openable without a medium, a
        // non-blocking auxiliary descriptor always is.
        match slot
            .opener
            .open(slot.path, self.open_flags | libc::O_NONBLOCK)
        {
            Ok(aux) => {
                if let Err(e) = host_ioctl(aux.as_raw_fd(), FDEJECT(), 0) {
                    warn!("FDEJECT on {:?} failed: {}", slot.path, e);
                }
            }
            Err(e) => warn!("Failed to open {:?} for eject: {}", slot.path, e),
        }
    }
}

/// Per-class behavior of a disk.
#[derive(Debug)]
pub(crate) enum DeviceKind {
    PlainFile,
    OpticalDisc,
    Floppy(FloppyState),
}

impl DeviceKind {
    pub(crate) fn class(&self) -> DeviceClass {
        match self {
            DeviceKind::PlainFile => DeviceClass::PlainFile,
            DeviceKind::OpticalDisc => DeviceClass::OpticalDisc,
            DeviceKind::Floppy(_) => DeviceClass::Floppy,
        }
    }

    /// Makes sure `slot.file` holds a usable descriptor.
    pub(crate) fn ensure_open(&mut self, slot: DeviceSlot<'_>) -> Result<()> {
        match self {
            DeviceKind::Floppy(state) => state.revalidate(slot),
            DeviceKind::PlainFile | DeviceKind::OpticalDisc => {
                if slot.file.is_some() {
                    Ok(())
                } else {
                    Err(Error::Closed)
                }
            }
        }
    }

    pub(crate) fn is_inserted(&mut self, slot: DeviceSlot<'_>) -> Result<bool> {
        match self {
            DeviceKind::PlainFile => Ok(true),
            DeviceKind::OpticalDisc => {
                let file = slot.file.as_ref().ok_or(Error::Closed)?;
                Ok(matches!(
                    host_ioctl(file.as_raw_fd(), CDROM_DRIVE_STATUS(), CDSL_CURRENT),
                    Ok(CDS_DISC_OK)
                ))
            }
            DeviceKind::Floppy(state) => Ok(state.revalidate(slot).is_ok()),
        }
    }

    /// Returns and clears the media-changed flag.
    pub(crate) fn media_changed(&mut self, slot: DeviceSlot<'_>) -> Result<bool> {
        match self {
            DeviceKind::Floppy(state) => {
                // Only a real access can notice a swap; its outcome is
                // reflected in the flag.
                let _ = state.revalidate(slot);
                Ok(std::mem::take(&mut state.media_changed))
            }
            DeviceKind::PlainFile | DeviceKind::OpticalDisc => Err(Error::NotSupported),
        }
    }

    /// Ejects the medium, or closes the tray when `eject` is false.
    pub(crate) fn eject(&mut self, slot: DeviceSlot<'_>, eject: bool) -> Result<()> {
        match self {
            DeviceKind::OpticalDisc => {
                let file = slot.file.as_ref().ok_or(Error::Closed)?;
                let (request, name) = if eject {
                    (CDROMEJECT(), "CDROMEJECT")
                } else {
                    (CDROMCLOSETRAY(), "CDROMCLOSETRAY")
                };
                if let Err(e) = host_ioctl(file.as_raw_fd(), request, 0) {
                    warn!("{} on {:?} failed: {}", name, slot.path, e);
                }
                Ok(())
            }
            DeviceKind::Floppy(state) => {
                state.eject(slot);
                Ok(())
            }
            DeviceKind::PlainFile => Err(Error::NotSupported),
        }
    }

    pub(crate) fn set_locked(&self, slot: DeviceSlot<'_>, locked: bool) -> Result<()> {
        match self {
            DeviceKind::OpticalDisc => {
                let file = slot.file.as_ref().ok_or(Error::Closed)?;
                // Hosts auto-mounting removable media legitimately refuse.
                if let Err(e) = host_ioctl(
                    file.as_raw_fd(),
                    CDROM_LOCKDOOR(),
                    libc::c_ulong::from(locked),
                ) {
                    debug!("CDROM_LOCKDOOR on {:?} failed: {}", slot.path, e);
                }
                Ok(())
            }
            DeviceKind::PlainFile | DeviceKind::Floppy(_) => Err(Error::NotSupported),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::host::SystemOpener;

    /// Opener simulating a drive whose medium can be pulled and reinserted.
    ///
    /// Every path is redirected to `backing`, a regular file.
    #[derive(Debug, Clone)]
    pub struct RemovableOpener {
        pub backing: PathBuf,
        pub present: Arc<AtomicBool>,
        pub opens: Arc<AtomicUsize>,
        pub flags: Arc<Mutex<Vec<libc::c_int>>>,
    }

    impl RemovableOpener {
        pub fn new(backing: &Path) -> Self {
            RemovableOpener {
                backing: backing.to_path_buf(),
                present: Arc::new(AtomicBool::new(true)),
                opens: Arc::new(AtomicUsize::new(0)),
                flags: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn set_present(&self, present: bool) {
            self.present.store(present, Ordering::SeqCst);
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl HostOpener for RemovableOpener {
        fn open(&self, _path: &Path, flags: libc::c_int) -> io::Result<Box<dyn HostFile>> {
            self.flags.lock().unwrap().push(flags);
            // Non-blocking opens succeed on an empty drive, like the host.
            if !self.present.load(Ordering::SeqCst) && flags & libc::O_NONBLOCK == 0 {
                return Err(io::Error::from_raw_os_error(libc::ENXIO));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            // Redirect to the backing file without any custom flags.
            SystemOpener.open(&self.backing, flags & libc::O_ACCMODE)
        }
    }
}
