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

//! The per-transfer state machine.
//!
//! An item moves `Reading -> AwaitingDestination -> Copying -> Done` and is
//! finished exactly once, whichever copy path completed it.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use tracing::{Span, debug, error, instrument, warn};
use vop_common::kvec::{ClaimedKvecs, KvecError, MemOps};

use crate::config::TransportConfiguration;
use crate::copy::{CompletionMode, async_aligned_plan, async_staged_len, copy_bytes, sync_copy};
use crate::error::VopError;
use crate::exchange::KvecExchange;
use crate::hal::{CopyCallback, CopyFault, HardwareOps, RemoteMapper, SignalKind};
use crate::heads_up::HeadsUpLine;
use crate::log_once::{LogOnce, error_once};
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::pool::{ItemState, TransferPool};
use crate::queue::{Descriptor, QueuePair};
use crate::{Result, new_error};

/// Everything a running device shares between its loops and callbacks.
pub(crate) struct Session<H: HardwareOps> {
    pub(crate) hw: Arc<H>,
    pub(crate) mem: H::Mem,
    pub(crate) config: TransportConfiguration,
    pub(crate) queues: Arc<QueuePair>,
    pub(crate) exchange: KvecExchange<H::Mem>,
    pub(crate) pool: TransferPool,
    pub(crate) mapper: RemoteMapper,
    pub(crate) available: HeadsUpLine,
    pub(crate) used: HeadsUpLine,
    pub(crate) mode: CompletionMode,
    pub(crate) alignment: bool,
    pub(crate) running: AtomicBool,
    pub(crate) fetch_done: AtomicBool,
    /// Set while receive buffers are being published into the peer's buffer.
    pub(crate) updating: AtomicBool,
    pub(crate) publishing: Mutex<()>,
    /// Items submitted in deferred mode, in submission order.
    pub(crate) sequence: (Sender<usize>, Receiver<usize>),
    pub(crate) submit_failed: LogOnce,
    pub(crate) completion_failed: LogOnce,
}

impl<H: HardwareOps> Session<H> {
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn heads_up(&self, kind: SignalKind) -> Option<&HeadsUpLine> {
        match kind {
            SignalKind::Available => Some(&self.available),
            SignalKind::Used => Some(&self.used),
            SignalKind::ConfigChange => None,
        }
    }

    /// Wake every wait point so loops notice the running flag.
    pub(crate) fn wake_all(&self) {
        self.queues.tx.wake_all();
        self.queues.rx.wake_all();
        self.available.wake_all();
        self.used.wake_all();
        self.pool.wake_all();
        self.mapper.wake_all();
    }

    /// Move one source descriptor to the peer on item `id`.
    #[instrument(skip_all, fields(id = id, head = desc.head), parent = Span::current(), level = "Trace")]
    pub(crate) fn run_transfer(self: &Arc<Self>, id: usize, desc: Descriptor) {
        let res = self
            .read_source(id, desc)
            .and_then(|()| self.await_destination(id))
            .and_then(|()| self.start_copy(id));
        if let Err(e) = res {
            self.abort(id, e);
        }
    }

    fn read_source(&self, id: usize, desc: Descriptor) -> Result<()> {
        let mut item = self.pool.lock(id)?;
        item.state = ItemState::Reading;
        let head = desc.head;
        let segments = desc.segments.clone();
        item.source = Some(desc);
        if segments.len() != 2 {
            return Err(VopError::BadChain(segments.len()));
        }
        let (hdr, payload) = (segments[0], segments[1]);
        item.bytes_read = hdr.len + payload.len;
        item.payload_len = payload.len;

        match (self.mode, item.staging) {
            (CompletionMode::Deferred, Some(staging)) => {
                let len = if payload.len > staging.len {
                    warn!(
                        "payload of {} bytes truncated to the {} byte staging buffer",
                        payload.len, staging.len
                    );
                    staging.len
                } else {
                    payload.len
                };
                copy_bytes(&self.mem, staging.addr, payload.addr, len)?;
                item.payload_len = len;
                item.src_addr = staging.addr;
                // the payload is ours now, the driver can have its buffer back
                self.queues.tx.release(head, item.bytes_read as u32)?;
                item.source_released = true;
            }
            _ => item.src_addr = payload.addr,
        }
        Ok(())
    }

    fn await_destination(&self, id: usize) -> Result<()> {
        let len = {
            let mut item = self.pool.lock(id)?;
            item.state = ItemState::AwaitingDestination;
            item.payload_len as usize + self.mode.overhead()
        };

        let claim = loop {
            if !self.running() {
                return Err(VopError::Stopped);
            }
            if let Some(claim) = self.try_claim(len)? {
                break claim;
            }

            self.available.wait_for(
                &*self.hw,
                || {
                    let class = self.exchange.select_class(len)?;
                    self.exchange.has_available(class)
                },
                &|| self.running(),
            )?;

            match self.try_claim(len)? {
                Some(claim) => break claim,
                // only cancelled slots were published, wait again
                None => debug!("item {id}: {}", VopError::Busy),
            }
        };

        let mut item = self.pool.lock(id)?;
        item.claim = Some(claim);
        item.state = ItemState::Copying;
        Ok(())
    }

    fn try_claim(&self, len: usize) -> Result<Option<ClaimedKvecs>> {
        let class = self.exchange.select_class(len)?;
        match self.exchange.claim(class) {
            Ok(claim) => Ok(Some(claim)),
            Err(VopError::Kvec(KvecError::WouldBlock)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn start_copy(self: &Arc<Self>, id: usize) -> Result<()> {
        let mut item = self.pool.lock(id)?;
        let claim = item
            .claim
            .clone()
            .ok_or_else(|| new_error!("item {id} is copying without a claim"))?;
        if claim.kvecs.len() != 2 {
            return Err(VopError::BadChain(claim.kvecs.len()));
        }
        let (hdr, dst) = (claim.kvecs[0], claim.kvecs[1]);

        let need = item.payload_len + self.mode.overhead() as u64;
        if dst.len < need {
            return Err(VopError::NoSpace(dst.len, need));
        }

        let local = self
            .mapper
            .map(&*self.hw, dst.addr, dst.len, &|| self.running())?;
        item.mapping = Some(local);
        item.bytes_written = hdr.len + item.payload_len;

        if self.mode == CompletionMode::Sync {
            let res = sync_copy(&self.mem, local, item.src_addr, item.payload_len, self.alignment);
            drop(item);
            self.finish(id, res);
            return Ok(());
        }

        let (dst, src, len) = if self.alignment {
            let plan = async_aligned_plan(local, item.src_addr, item.payload_len)?;
            self.mem.write_val(local, plan.offset)?;
            (plan.dst, plan.src, plan.len)
        } else {
            (local, item.src_addr, async_staged_len(item.payload_len))
        };

        let session = Arc::clone(self);
        let callback: CopyCallback = Box::new(move |res| session.on_copy_complete(id, res));
        match self.hw.submit_copy(dst, src, len, callback) {
            Ok(handle) => {
                item.copy_handle = Some(handle);
                drop(item);
                if self.mode == CompletionMode::Deferred {
                    self.sequence.0.send(id).map_err(|_| new_error!("sequencer is gone"))?;
                }
            }
            Err(e) => {
                error_once!(
                    self.submit_failed,
                    "async copy submit failed, falling back to memcpy: {e}"
                );
                CounterMetric::copy_fallback("submit").emit();
                let res = sync_copy(&self.mem, local, item.src_addr, item.payload_len, self.alignment);
                if self.mode == CompletionMode::Deferred {
                    item.completion = Some(res);
                    drop(item);
                    self.sequence.0.send(id).map_err(|_| new_error!("sequencer is gone"))?;
                } else {
                    drop(item);
                    self.finish(id, res);
                }
            }
        }
        Ok(())
    }

    /// Completion callback of an asynchronous copy. Runs on the copy engine's context.
    fn on_copy_complete(&self, id: usize, res: std::result::Result<(), CopyFault>) {
        let mut item = match self.pool.lock(id) {
            Ok(item) => item,
            Err(e) => {
                error!("copy completion for item {id}: {e}");
                return;
            }
        };
        if item.state != ItemState::Copying || item.completion.is_some() {
            warn!("stale copy completion for item {id} in state {:?}", item.state);
            return;
        }

        let outcome = match res {
            Ok(()) => Ok(()),
            Err(fault) => {
                error_once!(
                    self.completion_failed,
                    "async copy completion reported {fault}, falling back to memcpy"
                );
                CounterMetric::copy_fallback("completion").emit();
                match item.mapping {
                    Some(local) => sync_copy(&self.mem, local, item.src_addr, item.payload_len, self.alignment),
                    None => Err(VopError::CopyFailed(format!("item {id} lost its mapping"))),
                }
            }
        };

        if self.mode == CompletionMode::Deferred {
            item.completion = Some(outcome);
            drop(item);
            self.pool.notify_completion(id);
        } else {
            drop(item);
            self.finish(id, outcome);
        }
    }

    /// Finish a deferred item once its completion arrived or `keep_waiting` gives up.
    ///
    /// The destination stays mapped for as long as `keep_waiting` holds.
    pub(crate) fn finish_deferred(&self, id: usize, keep_waiting: &dyn Fn() -> bool) {
        let outcome = self
            .pool
            .lock(id)
            .and_then(|item| self.pool.wait_completion(id, item, keep_waiting))
            .and_then(|mut item| match item.completion.take() {
                Some(res) => res,
                None => {
                    error!("copy {:?} of item {id} still outstanding, giving up on it", item.copy_handle);
                    Err(VopError::CopyFailed(format!("item {id} never completed")))
                }
            });
        self.finish(id, outcome);
    }

    fn abort(&self, id: usize, e: VopError) {
        match e {
            VopError::Stopped => debug!("transfer on item {id} stopped"),
            ref e if e.is_transient() => debug!("transfer on item {id} gave up: {e}"),
            ref e => warn!("transfer on item {id} failed: {e}"),
        }
        self.finish(id, Err(e));
    }

    /// Report the transfer on `id` to both sides and return the item to the pool.
    ///
    /// Runs once per acquired item; a second call for the same item is ignored.
    pub(crate) fn finish(&self, id: usize, outcome: Result<()>) {
        let mut item = match self.pool.lock(id) {
            Ok(item) => item,
            Err(e) => {
                error!("finishing item {id}: {e}");
                return;
            }
        };
        if matches!(item.state, ItemState::Free | ItemState::Done) {
            warn!("item {id} finished twice");
            return;
        }
        item.state = ItemState::Done;

        let ok = outcome.is_ok();
        if let Err(e) = &outcome {
            CounterMetric::transfer_error(e.kind()).emit();
        }

        if let Some(claim) = item.claim.take() {
            let written = if ok { item.bytes_written as u32 } else { 0 };
            if let Err(e) = self.exchange.push_used(claim.head, written) {
                error!("used record for head {}: {e}", claim.head);
            }
            if let Err(e) = self.used.send(&*self.hw) {
                debug!("used heads-up: {e}");
            }
            if let Err(e) = self.exchange.release_claim(claim.class, claim.first_slot) {
                error!("releasing claim of head {}: {e}", claim.head);
            }
        }

        if !item.source_released
            && let Some(source) = item.source.take()
        {
            let read = if ok { item.bytes_read as u32 } else { 0 };
            if let Err(e) = self.queues.tx.release(source.head, read) {
                error!("releasing source head {}: {e}", source.head);
            }
        }

        if let Some(local) = item.mapping.take()
            && let Err(e) = self.mapper.unmap(&*self.hw, local)
        {
            error!("unmapping {local:#x}: {e}");
        }

        if let Some(started) = item.started {
            HistogramMetric::transfer_finished(self.mode.as_str(), started);
        }
        item.reset();
        drop(item);
        if let Err(e) = self.pool.release(id) {
            error!("returning item {id}: {e}");
        }
    }
}
