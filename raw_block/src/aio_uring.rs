// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::{HashMap, HashSet};
use std::io::{Error, Result};
use std::os::unix::io::AsRawFd;

use io_uring::{opcode, types, IoUring, Probe};
use vmm_sys_util::eventfd::EventFd;

use crate::aio::{AioBackend, CancelStatus, HostRequest, HostStatus, RequestOp};

// user_data of the cancellation entries themselves.
const CANCEL_USER_DATA: u64 = u64::MAX;

pub struct UringAio {
    io_uring: IoUring,
    completed: HashMap<u64, i64>,
    cancelling: HashSet<u64>,
}

impl UringAio {
    pub fn new(ring_depth: u32) -> Result<Self> {
        Ok(UringAio {
            io_uring: IoUring::new(ring_depth)?,
            completed: HashMap::new(),
            cancelling: HashSet::new(),
        })
    }

    pub(crate) fn is_supported() -> bool {
        let error_msg = "io_uring not supported:";

        // Check we can create an io_uring instance, which effectively verifies
        // that io_uring_setup() syscall is supported.
        let io_uring = match IoUring::new(1) {
            Ok(io_uring) => io_uring,
            Err(e) => {
                info!("{} failed to create io_uring instance: {}", error_msg, e);
                return false;
            }
        };

        let mut probe = Probe::new();
        if let Err(e) = io_uring.submitter().register_probe(&mut probe) {
            info!("{} failed to register a probe: {}", error_msg, e);
            return false;
        }

        for (code, name) in [
            (opcode::Read::CODE, "IORING_OP_READ"),
            (opcode::Write::CODE, "IORING_OP_WRITE"),
            (opcode::AsyncCancel::CODE, "IORING_OP_ASYNC_CANCEL"),
        ] {
            if !probe.is_supported(code) {
                info!("{} {} operation not supported", error_msg, name);
                return false;
            }
        }

        true
    }

    fn push(&mut self, entry: &io_uring::squeue::Entry) -> Result<()> {
        let (submitter, mut sq, _) = self.io_uring.split();

        // SAFETY: the entry only references memory the engine keeps alive
        // until the request has been released.
        unsafe {
            sq.push(entry)
                .map_err(|_| Error::other("Submission queue is full"))?
        };

        // Update the submission queue and submit new operations to the
        // io_uring instance.
        sq.sync();
        submitter.submit()?;
        Ok(())
    }
}

impl AioBackend for UringAio {
    fn attach(&mut self, notifier: &EventFd) -> Result<()> {
        // Register the io_uring eventfd that will notify when something in
        // the completion queue is ready.
        self.io_uring
            .submitter()
            .register_eventfd(notifier.as_raw_fd())
    }

    fn submit(&mut self, request: &HostRequest) -> Result<()> {
        let fd = types::Fd(request.fd);
        let len = u32::try_from(request.len).map_err(Error::other)?;
        let entry = match request.op {
            RequestOp::Read => opcode::Read::new(fd, request.buf, len)
                .offset(request.offset)
                .build(),
            RequestOp::Write => opcode::Write::new(fd, request.buf, len)
                .offset(request.offset)
                .build(),
        }
        .user_data(request.id);

        self.push(&entry)
    }

    fn reap(&mut self) {
        for entry in self.io_uring.completion() {
            if entry.user_data() != CANCEL_USER_DATA {
                self.completed
                    .insert(entry.user_data(), i64::from(entry.result()));
            }
        }
    }

    fn status(&mut self, id: u64) -> HostStatus {
        match self.completed.get(&id) {
            Some(&res) if res == -(libc::ECANCELED as i64) && self.cancelling.contains(&id) => {
                HostStatus::Cancelled
            }
            Some(&res) => HostStatus::Completed(res),
            None => HostStatus::InProgress,
        }
    }

    fn cancel(&mut self, id: u64) -> CancelStatus {
        if self.completed.contains_key(&id) {
            return CancelStatus::AllDone;
        }

        // The outcome is only known once the target completes, either with
        // -ECANCELED or with its real result.
        let entry = opcode::AsyncCancel::new(id)
            .build()
            .user_data(CANCEL_USER_DATA);
        if let Err(e) = self.push(&entry) {
            warn!("Failed to submit io_uring cancellation: {}", e);
        } else {
            self.cancelling.insert(id);
        }
        CancelStatus::NotCanceled
    }

    fn release(&mut self, id: u64) {
        self.completed.remove(&id);
        self.cancelling.remove(&id);
    }
}
