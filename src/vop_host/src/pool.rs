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

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{Span, debug, instrument};
use vop_common::kvec::ClaimedKvecs;

use crate::error::VopError;
use crate::hal::CopyHandle;
use crate::queue::Descriptor;
use crate::Result;

/// Where a transfer item is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Free,
    Reading,
    AwaitingDestination,
    Copying,
    Done,
}

/// A page aligned buffer owned by one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    pub addr: u64,
    pub len: u64,
}

/// One in-flight transfer: a source descriptor and the peer kvecs it lands in.
#[derive(Debug)]
pub(crate) struct TransferItem {
    pub(crate) id: usize,
    pub(crate) state: ItemState,
    pub(crate) source: Option<Descriptor>,
    pub(crate) source_released: bool,
    pub(crate) bytes_read: u64,
    pub(crate) payload_len: u64,
    /// Where the payload is copied from: the source segment or the staging buffer.
    pub(crate) src_addr: u64,
    pub(crate) staging: Option<StagingBuffer>,
    pub(crate) claim: Option<ClaimedKvecs>,
    /// Local view of the destination payload kvec.
    pub(crate) mapping: Option<u64>,
    pub(crate) bytes_written: u64,
    pub(crate) copy_handle: Option<CopyHandle>,
    pub(crate) started: Option<Instant>,
    /// Outcome of a deferred copy, set by the completion callback.
    pub(crate) completion: Option<Result<()>>,
}

impl TransferItem {
    fn new(id: usize, staging: Option<StagingBuffer>) -> Self {
        Self {
            id,
            state: ItemState::Free,
            source: None,
            source_released: false,
            bytes_read: 0,
            payload_len: 0,
            src_addr: 0,
            staging,
            claim: None,
            mapping: None,
            bytes_written: 0,
            copy_handle: None,
            started: None,
            completion: None,
        }
    }

    /// Back to `Free`, keeping only the id and staging buffer.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.id, self.staging);
    }
}

pub(crate) struct ItemSlot {
    item: Mutex<TransferItem>,
    done: Condvar,
}

struct PoolState {
    ready: Vec<bool>,
    next: usize,
}

/// Fixed pool of transfer items handed out in strict round robin.
///
/// The pool size is a power of two. If the next item in line is still busy,
/// acquisition waits for exactly that item.
pub(crate) struct TransferPool {
    items: Box<[ItemSlot]>,
    state: Mutex<PoolState>,
    ready_cv: Condvar,
    mask: usize,
    slice: Duration,
}

impl TransferPool {
    /// `staging` is empty or holds one buffer per item.
    pub(crate) fn new(size: usize, slice: Duration, staging: &[StagingBuffer]) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(VopError::InvalidState(format!(
                "pool size {size} is not a power of two"
            )));
        }
        if !staging.is_empty() && staging.len() != size {
            return Err(VopError::InvalidState(format!(
                "{} staging buffers for {size} items",
                staging.len()
            )));
        }
        let items = (0..size)
            .map(|id| ItemSlot {
                item: Mutex::new(TransferItem::new(id, staging.get(id).copied())),
                done: Condvar::new(),
            })
            .collect();
        Ok(Self {
            items,
            state: Mutex::new(PoolState {
                ready: vec![true; size],
                next: 0,
            }),
            ready_cv: Condvar::new(),
            mask: size - 1,
            slice,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.items.len()
    }

    /// Take the next item in round robin order, waiting while `running` holds.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn acquire(&self, running: &dyn Fn() -> bool) -> Result<usize> {
        let mut state = self.state.lock()?;
        let id = state.next & self.mask;
        while !state.ready[id] {
            if !running() {
                return Err(VopError::Stopped);
            }
            let (guard, res) = self.ready_cv.wait_timeout(state, self.slice)?;
            state = guard;
            if res.timed_out() {
                debug!("transfer item {id} still busy after {:?}", self.slice);
            }
        }
        if !running() {
            return Err(VopError::Stopped);
        }
        state.ready[id] = false;
        state.next = state.next.wrapping_add(1);
        drop(state);

        let mut item = self.lock(id)?;
        item.state = ItemState::Reading;
        item.started = Some(Instant::now());
        Ok(id)
    }

    /// Return a finished item.
    pub(crate) fn release(&self, id: usize) -> Result<()> {
        let mut state = self.state.lock()?;
        match state.ready.get_mut(id) {
            Some(r) if !*r => *r = true,
            _ => return Err(new_invalid(id)),
        }
        drop(state);
        self.ready_cv.notify_all();
        Ok(())
    }

    pub(crate) fn lock(&self, id: usize) -> Result<MutexGuard<'_, TransferItem>> {
        let slot = self.items.get(id).ok_or_else(|| new_invalid(id))?;
        Ok(slot.item.lock()?)
    }

    /// Wait, holding `item`, until its deferred completion arrives or `running` turns false.
    pub(crate) fn wait_completion<'a>(
        &'a self,
        id: usize,
        mut item: MutexGuard<'a, TransferItem>,
        running: &dyn Fn() -> bool,
    ) -> Result<MutexGuard<'a, TransferItem>> {
        let slot = self.items.get(id).ok_or_else(|| new_invalid(id))?;
        while item.completion.is_none() && running() {
            let (guard, res) = slot.done.wait_timeout(item, self.slice)?;
            item = guard;
            if res.timed_out() && item.completion.is_none() {
                debug!("transfer item {id} still copying after {:?}", self.slice);
            }
        }
        Ok(item)
    }

    pub(crate) fn notify_completion(&self, id: usize) {
        if let Some(slot) = self.items.get(id) {
            slot.done.notify_all();
        }
    }

    /// Wait until every item is back in the pool.
    pub(crate) fn wait_all_ready(&self, timeout: Duration) -> Result<()> {
        let state = self.state.lock()?;
        let (state, res) = self
            .ready_cv
            .wait_timeout_while(state, timeout, |s| s.ready.iter().any(|r| !r))?;
        if res.timed_out() {
            let busy = state.ready.iter().filter(|r| !**r).count();
            return Err(VopError::InvalidState(format!(
                "{busy} transfer items still busy after {timeout:?}"
            )));
        }
        Ok(())
    }

    pub(crate) fn wake_all(&self) {
        self.ready_cv.notify_all();
        for slot in self.items.iter() {
            slot.done.notify_all();
        }
    }
}

fn new_invalid(id: usize) -> VopError {
    VopError::InvalidState(format!("transfer item {id} is not in use"))
}
