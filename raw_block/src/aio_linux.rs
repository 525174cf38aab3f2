// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//
// Copyright © 2023 Crusoe Energy Systems LLC

//! Kernel AIO backend.
//!
//! Completions are posted to the engine notifier through `IOCB_FLAG_RESFD`
//! and collected with a non-blocking `io_getevents`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;

use vmm_sys_util::aio;
use vmm_sys_util::eventfd::EventFd;

use crate::aio::{AioBackend, CancelStatus, HostRequest, HostStatus, RequestOp};

const REAP_BATCH: usize = 32;

pub struct LinuxAio {
    ctx: aio::IoContext,
    notifier: Option<EventFd>,
    // io_cancel identifies requests by their control block address.
    in_flight: HashMap<u64, Box<aio::IoControlBlock>>,
    completed: HashMap<u64, i64>,
}

impl LinuxAio {
    pub fn new(queue_depth: u32) -> io::Result<Self> {
        let ctx = aio::IoContext::new(queue_depth)?;

        Ok(LinuxAio {
            ctx,
            notifier: None,
            in_flight: HashMap::new(),
            completed: HashMap::new(),
        })
    }
}

impl AioBackend for LinuxAio {
    fn attach(&mut self, notifier: &EventFd) -> io::Result<()> {
        self.notifier = Some(notifier.try_clone()?);
        Ok(())
    }

    fn submit(&mut self, request: &HostRequest) -> io::Result<()> {
        let resfd = self
            .notifier
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?
            .as_raw_fd();
        let opcode = match request.op {
            RequestOp::Read => aio::IOCB_CMD_PREAD,
            RequestOp::Write => aio::IOCB_CMD_PWRITE,
        };

        let mut iocb = Box::new(aio::IoControlBlock {
            aio_fildes: request.fd as u32,
            aio_lio_opcode: opcode as u16,
            aio_buf: request.buf as u64,
            aio_nbytes: request.len as u64,
            aio_offset: request.offset as i64,
            aio_data: request.id,
            aio_flags: aio::IOCB_FLAG_RESFD,
            aio_resfd: resfd as u32,
            ..Default::default()
        });
        let submitted = self.ctx.submit(&[&mut *iocb])?;
        if submitted != 1 {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }

        self.in_flight.insert(request.id, iocb);
        Ok(())
    }

    fn reap(&mut self) {
        let mut events = [aio::IoEvent::default(); REAP_BATCH];
        loop {
            let count = match self.ctx.get_events(0, &mut events, None) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed to collect AIO completions: {}", e);
                    return;
                }
            };
            for event in &events[..count] {
                self.completed.insert(event.data, event.res);
            }
            if count < REAP_BATCH {
                return;
            }
        }
    }

    fn status(&mut self, id: u64) -> HostStatus {
        match self.completed.get(&id) {
            Some(&res) if res == -(libc::ECANCELED as i64) => HostStatus::Cancelled,
            Some(&res) => HostStatus::Completed(res),
            None => HostStatus::InProgress,
        }
    }

    fn cancel(&mut self, id: u64) -> CancelStatus {
        if self.completed.contains_key(&id) {
            return CancelStatus::AllDone;
        }
        let Some(iocb) = self.in_flight.get(&id) else {
            return CancelStatus::AllDone;
        };

        let mut event = aio::IoEvent::default();
        match self.ctx.cancel(iocb, &mut event) {
            Ok(()) => CancelStatus::Canceled,
            // Regular files cannot be cancelled once submitted.
            Err(_) => CancelStatus::NotCanceled,
        }
    }

    fn release(&mut self, id: u64) {
        self.in_flight.remove(&id);
        self.completed.remove(&id);
    }
}
