// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Worker-thread backend.
//!
//! Requests are queued and executed with `pread`/`pwrite` by a small pool
//! of threads. Unlike the kernel backends, a request still sitting in the
//! queue can always be cancelled.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use vmm_sys_util::eventfd::EventFd;

use crate::aio::{AioBackend, CancelStatus, HostRequest, HostStatus, RequestOp};

#[derive(Clone, Copy, Debug)]
struct Job {
    op: RequestOp,
    fd: RawFd,
    offset: u64,
    buf: *mut u8,
    len: usize,
}

// SAFETY: the engine keeps the descriptor and the buffer alive, and does not
// touch the buffer, until the job has been released.
unsafe impl Send for Job {}

impl Job {
    fn execute(&self) -> i64 {
        loop {
            // SAFETY: buf points to len bytes owned by the pending request
            let ret = unsafe {
                match self.op {
                    RequestOp::Read => libc::pread(
                        self.fd,
                        self.buf as *mut libc::c_void,
                        self.len,
                        self.offset as libc::off_t,
                    ),
                    RequestOp::Write => libc::pwrite(
                        self.fd,
                        self.buf as *const libc::c_void,
                        self.len,
                        self.offset as libc::off_t,
                    ),
                }
            };
            if ret >= 0 {
                return ret as i64;
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return -(e.raw_os_error().unwrap_or(libc::EIO) as i64);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
    Done(i64),
    Cancelled,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<u64>,
    jobs: HashMap<u64, (Job, JobState)>,
    notifier: Option<EventFd>,
    shutdown: bool,
}

type Shared = Arc<(Mutex<Queue>, Condvar)>;

pub struct ThreadPoolAio {
    shared: Shared,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolAio {
    pub fn new(threads: usize) -> io::Result<Self> {
        let shared: Shared = Arc::default();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("aio_worker{i}"))
                    .spawn(move || worker_loop(&shared))?,
            );
        }

        Ok(ThreadPoolAio { shared, workers })
    }
}

fn worker_loop(shared: &Shared) {
    let (lock, cvar) = &**shared;
    loop {
        let (id, job) = {
            let mut queue = lock.lock().unwrap();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(id) = queue.pending.pop_front() {
                    if let Some((job, state)) = queue.jobs.get_mut(&id) {
                        *state = JobState::Running;
                        break (id, *job);
                    }
                    continue;
                }
                queue = cvar.wait(queue).unwrap();
            }
        };

        let res = job.execute();

        let mut queue = lock.lock().unwrap();
        if let Some((_, state)) = queue.jobs.get_mut(&id) {
            *state = JobState::Done(res);
        }
        if let Some(notifier) = queue.notifier.as_ref() {
            if let Err(e) = notifier.write(1) {
                error!("Failed to signal AIO completion: {}", e);
            }
        }
    }
}

impl AioBackend for ThreadPoolAio {
    fn attach(&mut self, notifier: &EventFd) -> io::Result<()> {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().notifier = Some(notifier.try_clone()?);
        Ok(())
    }

    fn submit(&mut self, request: &HostRequest) -> io::Result<()> {
        let job = Job {
            op: request.op,
            fd: request.fd,
            offset: request.offset,
            buf: request.buf,
            len: request.len,
        };

        let (lock, cvar) = &*self.shared;
        let mut queue = lock.lock().unwrap();
        queue.jobs.insert(request.id, (job, JobState::Queued));
        queue.pending.push_back(request.id);
        cvar.notify_one();
        Ok(())
    }

    fn status(&mut self, id: u64) -> HostStatus {
        let (lock, _) = &*self.shared;
        match lock.lock().unwrap().jobs.get(&id) {
            Some((_, JobState::Queued | JobState::Running)) => HostStatus::InProgress,
            Some((_, JobState::Done(res))) => HostStatus::Completed(*res),
            Some((_, JobState::Cancelled)) | None => HostStatus::Cancelled,
        }
    }

    fn cancel(&mut self, id: u64) -> CancelStatus {
        let (lock, _) = &*self.shared;
        let mut queue = lock.lock().unwrap();
        let status = match queue.jobs.get_mut(&id) {
            Some((_, state @ JobState::Queued)) => {
                *state = JobState::Cancelled;
                CancelStatus::Canceled
            }
            Some((_, JobState::Running)) => CancelStatus::NotCanceled,
            Some((_, JobState::Cancelled)) => CancelStatus::Canceled,
            Some((_, JobState::Done(_))) | None => CancelStatus::AllDone,
        };
        if status == CancelStatus::Canceled {
            queue.pending.retain(|&pending| pending != id);
        }
        status
    }

    fn release(&mut self, id: u64) {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().jobs.remove(&id);
    }
}

impl Drop for ThreadPoolAio {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("AIO worker thread panicked");
            }
        }
    }
}
