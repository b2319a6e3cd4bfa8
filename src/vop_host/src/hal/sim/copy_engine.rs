/*
Copyright 2026  The VOP Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, error};

use super::arena::SimMem;
use crate::Result;
use crate::copy::copy_bytes;
use crate::hal::{CopyCallback, CopyFault, CopyHandle};
use crate::new_error;

struct CopyJob {
    handle: CopyHandle,
    dst: u64,
    src: u64,
    len: u64,
    fail: bool,
    callback: CopyCallback,
}

/// A copy channel running jobs on its own thread.
///
/// The thread exits once the engine is dropped and the queue has drained.
pub(crate) struct CopyEngine {
    jobs: Sender<CopyJob>,
    next: AtomicU64,
}

impl CopyEngine {
    pub(crate) fn spawn(mem: SimMem, randomize: bool) -> Result<Self> {
        let (jobs, rx) = unbounded();
        thread::Builder::new()
            .name("sim-copy".to_string())
            .spawn(move || run(mem, rx, randomize))?;
        Ok(Self {
            jobs,
            next: AtomicU64::new(1),
        })
    }

    pub(crate) fn submit(
        &self,
        dst: u64,
        src: u64,
        len: u64,
        fail: bool,
        callback: CopyCallback,
    ) -> Result<CopyHandle> {
        let handle = CopyHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.jobs
            .send(CopyJob {
                handle,
                dst,
                src,
                len,
                fail,
                callback,
            })
            .map_err(|_| new_error!("copy engine is gone"))?;
        Ok(handle)
    }
}

fn run(mem: SimMem, rx: Receiver<CopyJob>, randomize: bool) {
    let mut rng = rand::rng();
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        batch.extend(rx.try_iter());
        if randomize {
            batch.shuffle(&mut rng);
            thread::sleep(Duration::from_micros(rng.random_range(0..200)));
        }
        for job in batch {
            let res = if job.fail {
                Err(CopyFault::Hardware)
            } else {
                copy_bytes(&mem, job.dst, job.src, job.len).map_err(|e| {
                    error!("copy {:?} of {:#x} bytes failed: {e}", job.handle, job.len);
                    CopyFault::Hardware
                })
            };
            debug!("copy {:?} done: {res:?}", job.handle);
            (job.callback)(res);
        }
    }
}
