// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Asynchronous I/O engine.
//!
//! An [`AioContext`] owns the single completion notifier shared by every
//! request it tracks. Backends signal progress by writing to the notifier;
//! [`AioContext::poll`] drains it, asks the backend about each pending
//! request and runs the callbacks of the finished ones.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use vmm_sys_util::eventfd::EventFd;

use crate::aio_linux::LinuxAio;
use crate::aio_thread::ThreadPoolAio;
use crate::buffer::IoBuffer;
use crate::config::{AioBackendKind, AioConfig};
use crate::{Error, Result};

/// Handle of an asynchronous request, unique within its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AioRequest(u64);

impl AioRequest {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outcome of an asynchronous request, handed to its callback.
#[derive(Debug)]
pub struct AioCompletion {
    pub request: AioRequest,
    pub result: Result<()>,
    /// The buffer the request was submitted with, back to its owner.
    pub buffer: IoBuffer,
}

pub type AioCallback = Box<dyn FnOnce(AioCompletion) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOp {
    Read,
    Write,
}

/// A request as seen by a backend.
///
/// `buf` points to `len` bytes that stay valid until the backend has been
/// told to release the request.
#[derive(Debug)]
pub struct HostRequest {
    pub id: u64,
    pub op: RequestOp,
    pub fd: RawFd,
    pub offset: u64,
    pub buf: *mut u8,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    InProgress,
    /// Bytes transferred, or a negative errno.
    Completed(i64),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request will never run.
    Canceled,
    /// The host already committed to the request.
    NotCanceled,
    AllDone,
}

/// Host facility executing the requests of an [`AioContext`].
pub trait AioBackend: Send {
    /// Called once, before any submission. Every state change of a request
    /// must be followed by a write to `notifier`.
    fn attach(&mut self, notifier: &EventFd) -> io::Result<()>;
    fn submit(&mut self, request: &HostRequest) -> io::Result<()>;
    /// Collects whatever the host completed since the last call.
    fn reap(&mut self) {}
    fn status(&mut self, id: u64) -> HostStatus;
    fn cancel(&mut self, id: u64) -> CancelStatus;
    /// Forgets about a request that is no longer in progress.
    fn release(&mut self, id: u64);
}

/// Check if aio can be used on the current system.
pub fn block_aio_is_supported() -> bool {
    vmm_sys_util::aio::IoContext::new(1).is_ok()
}

/// Check if io_uring can be used on the current system, as it correctly
/// supports the read and write operations the engine relies on.
pub fn block_io_uring_is_supported() -> bool {
    #[cfg(not(feature = "io_uring"))]
    {
        info!("io_uring is disabled by crate features");
        false
    }

    #[cfg(feature = "io_uring")]
    {
        crate::aio_uring::UringAio::is_supported()
    }
}

struct PendingRequest {
    id: u64,
    // Keeps the descriptor alive even if the disk closes its own.
    _fd: OwnedFd,
    buffer: IoBuffer,
    callback: AioCallback,
}

pub struct AioContext {
    notifier: EventFd,
    epoll_file: File,
    backend: Box<dyn AioBackend>,
    pending: Vec<PendingRequest>,
    deferred: VecDeque<(AioCompletion, AioCallback)>,
    next_id: u64,
}

impl AioContext {
    pub fn new(config: &AioConfig) -> Result<Self> {
        let backend: Box<dyn AioBackend> = match config.backend {
            AioBackendKind::LinuxAio => {
                Box::new(LinuxAio::new(config.queue_depth).map_err(Error::AioSetup)?)
            }
            AioBackendKind::ThreadPool => {
                Box::new(ThreadPoolAio::new(config.threads).map_err(Error::AioSetup)?)
            }
            #[cfg(feature = "io_uring")]
            AioBackendKind::IoUring => Box::new(
                crate::aio_uring::UringAio::new(config.queue_depth).map_err(Error::AioSetup)?,
            ),
            #[cfg(not(feature = "io_uring"))]
            AioBackendKind::IoUring => return Err(Error::NotSupported),
        };

        Self::with_backend(backend)
    }

    pub fn with_backend(mut backend: Box<dyn AioBackend>) -> Result<Self> {
        let notifier = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::CreateNotifier)?;

        let epoll_fd = epoll::create(true).map_err(Error::AioSetup)?;
        // Use 'File' to enforce closing on 'epoll_fd'
        // SAFETY: epoll_fd is a valid fd
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };
        epoll::ctl(
            epoll_file.as_raw_fd(),
            epoll::ControlOptions::EPOLL_CTL_ADD,
            notifier.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, 0),
        )
        .map_err(Error::AioSetup)?;

        backend.attach(&notifier).map_err(Error::AioSetup)?;

        Ok(AioContext {
            notifier,
            epoll_file,
            backend,
            pending: Vec::new(),
            deferred: VecDeque::new(),
            next_id: 0,
        })
    }

    /// The completion notifier, for callers multiplexing it in their own
    /// event loop.
    pub fn notifier(&self) -> &EventFd {
        &self.notifier
    }

    /// Number of requests whose callback has not run yet.
    pub fn pending(&self) -> usize {
        self.pending.len() + self.deferred.len()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub(crate) fn submit(
        &mut self,
        op: RequestOp,
        fd: OwnedFd,
        offset: u64,
        mut buffer: IoBuffer,
        callback: AioCallback,
    ) -> Result<AioRequest> {
        let id = self.allocate_id();
        let request = HostRequest {
            id,
            op,
            fd: fd.as_raw_fd(),
            offset,
            buf: buffer.as_mut_ptr(),
            len: buffer.len(),
        };
        self.backend
            .submit(&request)
            .map_err(Error::AsyncSubmit)?;

        // The buffer lives on the heap, moving its owner keeps `buf` valid.
        self.pending.push(PendingRequest {
            id,
            _fd: fd,
            buffer,
            callback,
        });
        Ok(AioRequest(id))
    }

    /// Queues a completion computed synchronously. Its callback runs on the
    /// next poll, never inline.
    pub(crate) fn defer(
        &mut self,
        result: Result<()>,
        buffer: IoBuffer,
        callback: AioCallback,
    ) -> AioRequest {
        let request = AioRequest(self.allocate_id());
        self.deferred.push_back((
            AioCompletion {
                request,
                result,
                buffer,
            },
            callback,
        ));
        if let Err(e) = self.notifier.write(1) {
            error!("Failed to signal deferred completion: {}", e);
        }
        request
    }

    fn drain_notifier(&self) {
        loop {
            match self.notifier.read() {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed to drain completion notifier: {}", e);
                    break;
                }
            }
        }
    }

    fn complete(&mut self, index: usize, res: i64) {
        let entry = self.pending.swap_remove(index);
        self.backend.release(entry.id);

        let expected = entry.buffer.len();
        let result = if res < 0 {
            Err(Error::AsyncIo(io::Error::from_raw_os_error(-res as i32)))
        } else if res as usize != expected {
            Err(Error::ShortTransfer {
                expected,
                actual: res as usize,
            })
        } else {
            Ok(())
        };

        (entry.callback)(AioCompletion {
            request: AioRequest(entry.id),
            result,
            buffer: entry.buffer,
        });
    }

    /// Delivers every completion available right now, without blocking.
    /// Returns the number of callbacks invoked.
    pub fn poll(&mut self) -> usize {
        let mut delivered = 0;

        while let Some((completion, callback)) = self.deferred.pop_front() {
            callback(completion);
            delivered += 1;
        }

        self.drain_notifier();
        self.backend.reap();

        // Removal swaps the last entry into the current slot, which then
        // gets examined in turn.
        let mut index = 0;
        while index < self.pending.len() {
            let id = self.pending[index].id;
            match self.backend.status(id) {
                HostStatus::InProgress => index += 1,
                HostStatus::Cancelled => {
                    self.pending.swap_remove(index);
                    self.backend.release(id);
                }
                HostStatus::Completed(res) => {
                    self.complete(index, res);
                    delivered += 1;
                }
            }
        }

        delivered
    }

    /// Blocks until the notifier becomes readable.
    pub fn wait(&self) -> Result<()> {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 1];
        loop {
            match epoll::wait(self.epoll_file.as_raw_fd(), -1, &mut events[..]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::EpollWait(e)),
            }
        }
    }

    /// Waits until every request has had its callback invoked.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            self.poll();
            if self.pending.is_empty() && self.deferred.is_empty() {
                return Ok(());
            }
            if self.deferred.is_empty() {
                self.wait()?;
            }
        }
    }

    /// Best-effort cancellation.
    ///
    /// The callback of a cancelled request never runs. A request the host
    /// already committed to is waited out before its buffer and descriptor
    /// are released. Requests completed synchronously are already done and
    /// keep their pending callback.
    pub fn cancel(&mut self, request: AioRequest) {
        let Some(index) = self.pending.iter().position(|p| p.id == request.0) else {
            return;
        };

        match self.backend.cancel(request.0) {
            CancelStatus::Canceled => {}
            CancelStatus::NotCanceled | CancelStatus::AllDone => loop {
                self.backend.reap();
                match self.backend.status(request.0) {
                    HostStatus::InProgress => std::thread::yield_now(),
                    _ => break,
                }
            },
        }

        self.pending.swap_remove(index);
        self.backend.release(request.0);
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush async requests: {}", e);
        }
    }
}
