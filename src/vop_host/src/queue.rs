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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{Span, instrument, trace};

use crate::error::VopError;
use crate::Result;

/// One buffer segment of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u64,
}

impl Segment {
    pub fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }
}

/// A descriptor chain owned by the device between acquire and release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub head: u16,
    pub segments: SmallVec<[Segment; 2]>,
}

impl Descriptor {
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

/// Completion of a descriptor as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedDescriptor {
    pub head: u16,
    pub len: u32,
}

/// Queue pressure handed to the [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Heads the driver can still post.
    pub num_free: usize,
    /// Heads posted and not yet returned through [`DescriptorQueue::poll_used`].
    pub num_inflight: usize,
}

/// Tells the driver that released descriptors are waiting.
pub trait Notifier: Send + Sync {
    fn notify(&self, stats: QueueStats);
}

/// Hook run after the driver posts a descriptor.
pub type Kick = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Free,
    Available,
    Acquired,
    Used,
}

struct Inner {
    state: Vec<HeadState>,
    segments: Vec<SmallVec<[Segment; 2]>>,
    free: VecDeque<u16>,
    avail: VecDeque<u16>,
    used: VecDeque<UsedDescriptor>,
    acquired: usize,
    unnotified: usize,
    stopped: bool,
}

impl Inner {
    fn stats(&self) -> QueueStats {
        QueueStats {
            num_free: self.free.len(),
            num_inflight: self.state.len() - self.free.len(),
        }
    }

    fn take(&mut self, head: u16) -> Descriptor {
        self.state[head as usize] = HeadState::Acquired;
        self.acquired += 1;
        Descriptor {
            head,
            segments: self.segments[head as usize].clone(),
        }
    }
}

#[derive(Default)]
struct Hooks {
    notifier: Option<Arc<dyn Notifier>>,
    kick: Option<Kick>,
}

/// One direction of descriptors between the local driver and the device.
///
/// The driver posts chains and later collects their completions. The device
/// acquires chains in FIFO order and releases each exactly once with the
/// number of bytes it moved.
pub struct DescriptorQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    avail_cv: Condvar,
    used_cv: Condvar,
    notify_threshold: usize,
    hooks: Mutex<Hooks>,
}

impl DescriptorQueue {
    pub fn new(name: &'static str, capacity: u16, notify_threshold: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                state: vec![HeadState::Free; capacity as usize],
                segments: vec![SmallVec::new(); capacity as usize],
                free: (0..capacity).collect(),
                avail: VecDeque::with_capacity(capacity as usize),
                used: VecDeque::with_capacity(capacity as usize),
                acquired: 0,
                unnotified: 0,
                stopped: true,
            }),
            avail_cv: Condvar::new(),
            used_cv: Condvar::new(),
            notify_threshold: notify_threshold.max(1),
            hooks: Mutex::new(Hooks::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().map(|i| i.state.len()).unwrap_or(0)
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) -> Result<()> {
        self.hooks.lock()?.notifier = Some(notifier);
        Ok(())
    }

    pub fn set_kick(&self, kick: Option<Kick>) -> Result<()> {
        self.hooks.lock()?.kick = kick;
        Ok(())
    }

    // Driver side

    /// Post a chain. Returns its head.
    ///
    /// # Errors
    ///
    /// - [`VopError::BadChain`] - `segments` is empty
    /// - [`VopError::QueueFull`] - every head is in flight
    pub fn post(&self, segments: &[Segment]) -> Result<u16> {
        if segments.is_empty() {
            return Err(VopError::BadChain(0));
        }
        let head = {
            let mut inner = self.inner.lock()?;
            let head = inner.free.pop_front().ok_or(VopError::QueueFull)?;
            inner.state[head as usize] = HeadState::Available;
            inner.segments[head as usize] = segments.iter().copied().collect();
            inner.avail.push_back(head);
            head
        };
        self.avail_cv.notify_one();
        trace!("{}: posted head {head}", self.name);

        let kick = self.hooks.lock()?.kick.clone();
        if let Some(kick) = kick {
            kick();
        }
        Ok(head)
    }

    /// Next completion, if any. Its head can be posted again afterwards.
    pub fn poll_used(&self) -> Option<UsedDescriptor> {
        let mut inner = self.inner.lock().ok()?;
        let used = inner.used.pop_front()?;
        inner.state[used.head as usize] = HeadState::Free;
        inner.free.push_back(used.head);
        Some(used)
    }

    pub fn wait_used(&self, timeout: Duration) -> Result<UsedDescriptor> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock()?;
        loop {
            if let Some(used) = inner.used.pop_front() {
                inner.state[used.head as usize] = HeadState::Free;
                inner.free.push_back(used.head);
                return Ok(used);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VopError::Timeout(timeout));
            }
            inner = self.used_cv.wait_timeout(inner, deadline - now)?.0;
        }
    }

    // Device side

    /// Next posted chain, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// - [`VopError::Stopped`] - the queue was stopped while waiting
    /// - [`VopError::Timeout`] - nothing was posted in time
    pub fn acquire(&self, timeout: Duration) -> Result<Descriptor> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock()?;
        loop {
            if inner.stopped {
                return Err(VopError::Stopped);
            }
            if let Some(head) = inner.avail.pop_front() {
                return Ok(inner.take(head));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VopError::Timeout(timeout));
            }
            inner = self.avail_cv.wait_timeout(inner, deadline - now)?.0;
        }
    }

    pub fn try_acquire(&self) -> Option<Descriptor> {
        self.try_acquire_if(|_| true)
    }

    /// Acquire the front chain only if `accept` agrees to take it.
    pub(crate) fn try_acquire_if(&self, accept: impl FnOnce(&Descriptor) -> bool) -> Option<Descriptor> {
        let mut inner = self.inner.lock().ok()?;
        let head = *inner.avail.front()?;
        let peek = Descriptor {
            head,
            segments: inner.segments[head as usize].clone(),
        };
        if !accept(&peek) {
            return None;
        }
        inner.avail.pop_front();
        Some(inner.take(head))
    }

    /// Hand `head` back to the driver with `bytes` moved. Zero marks a
    /// transfer that moved nothing.
    ///
    /// # Errors
    ///
    /// - [`VopError::DoubleRelease`] - `head` is not held by the device
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn release(&self, head: u16, bytes: u32) -> Result<()> {
        let (notifier, stats) = {
            let mut inner = self.inner.lock()?;
            match inner.state.get(head as usize) {
                Some(HeadState::Acquired) => {}
                _ => return Err(VopError::DoubleRelease(head)),
            }
            inner.state[head as usize] = HeadState::Used;
            inner.acquired -= 1;
            inner.used.push_back(UsedDescriptor { head, len: bytes });
            inner.unnotified += 1;

            let drained = inner.acquired == 0 && inner.avail.is_empty();
            if inner.unnotified >= self.notify_threshold || drained {
                inner.unnotified = 0;
                (self.hooks.lock()?.notifier.clone(), inner.stats())
            } else {
                (None, inner.stats())
            }
        };
        self.used_cv.notify_all();
        if let Some(n) = notifier {
            n.notify(stats);
        }
        Ok(())
    }

    // Control

    pub fn stats(&self) -> QueueStats {
        match self.inner.lock() {
            Ok(inner) => inner.stats(),
            Err(_) => QueueStats {
                num_free: 0,
                num_inflight: 0,
            },
        }
    }

    /// Chains held by the device: posted and not yet released.
    pub fn device_owned(&self) -> usize {
        self.inner
            .lock()
            .map(|i| i.avail.len() + i.acquired)
            .unwrap_or(0)
    }

    /// Heads acquired by the device and not yet released.
    pub fn acquired_heads(&self) -> Vec<u16> {
        match self.inner.lock() {
            Ok(inner) => inner
                .state
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == HeadState::Acquired)
                .map(|(h, _)| h as u16)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.inner.lock()?.stopped = false;
        Ok(())
    }

    /// Stop handing out chains and wake every waiter.
    pub(crate) fn stop(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stopped = true;
        }
        self.wake_all();
    }

    pub fn wake_all(&self) {
        self.avail_cv.notify_all();
        self.used_cv.notify_all();
    }
}

/// The transmit and receive queues of one device.
pub struct QueuePair {
    /// Chains the device sends to the peer.
    pub tx: DescriptorQueue,
    /// Buffers the device publishes to receive into.
    pub rx: DescriptorQueue,
}

impl QueuePair {
    pub fn new(capacity: u16, notify_threshold: usize) -> Self {
        Self {
            tx: DescriptorQueue::new("tx", capacity, notify_threshold),
            rx: DescriptorQueue::new("rx", capacity, notify_threshold),
        }
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.tx.resume()?;
        self.rx.resume()
    }

    pub(crate) fn stop(&self) {
        self.tx.stop();
        self.rx.stop();
    }
}
