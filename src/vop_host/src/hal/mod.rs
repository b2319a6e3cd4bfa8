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

//! The capabilities the transport needs from the platform.
//!
//! The core only talks to [`HardwareOps`]. [`sim`] implements it over a
//! shared in-process arena so that two devices can be wired back to back.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{Span, instrument};
use vop_common::kvec::MemOps;

use crate::error::VopError;
use crate::{Result, new_error};

pub mod sim;

/// Peer feature bit: receive buffers carry an offset prefix, allowing unaligned copies.
pub const FEATURE_OFFSET_RXBUF: u32 = 24;

/// The logical signal lines of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Configuration change: cancellation requests and resets.
    ConfigChange,
    /// New kvecs were published, or new data is available.
    Available,
    /// Used records were written.
    Used,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::ConfigChange => "config",
            SignalKind::Available => "available",
            SignalKind::Used => "used",
        }
    }
}

/// A signal line allocated by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId(pub u32);

/// Identifies a submitted copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyHandle(pub u64);

/// Failure reported by a copy completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CopyFault {
    #[error("copy engine reported a hardware error")]
    Hardware,
    #[error("copy job was aborted")]
    Aborted,
}

/// Called from the backend when a signal line fires.
pub type SignalCallback = Arc<dyn Fn() + Send + Sync>;

/// Called once from the copy engine's context when a job completes.
pub type CopyCallback = Box<dyn FnOnce(std::result::Result<(), CopyFault>) + Send>;

/// Platform capabilities used by a transport device.
///
/// Addresses passed around are `u64`. `phys` addresses name memory as the
/// peer sees it (kvec contents, descriptor segments); local addresses come
/// from [`map_remote`](Self::map_remote) or [`alloc_dma`](Self::alloc_dma)
/// and are accessed through [`mem`](Self::mem).
pub trait HardwareOps: Send + Sync + 'static {
    type Mem: MemOps<Error = VopError> + Clone + Send + Sync + 'static;

    /// Accessor for local memory and mapped windows.
    fn mem(&self) -> Self::Mem;

    fn allocate_signal_line(&self, kind: SignalKind) -> Result<LineId>;
    fn request_notification(&self, line: LineId, callback: SignalCallback) -> Result<()>;
    fn free_notification(&self, line: LineId);
    /// Re-arm `line` after it fired.
    fn acknowledge(&self, line: LineId);
    /// Fire the peer's line of `kind`.
    fn raise_peer(&self, kind: SignalKind) -> Result<()>;

    /// Map `len` bytes of peer memory at `phys`.
    ///
    /// # Errors
    ///
    /// - [`VopError::MapBusy`] - every mapping slot is in use, retry after an unmap
    /// - [`VopError::MapFailed`] - the range could not be mapped
    fn map_remote(&self, phys: u64, len: u64) -> Result<u64>;
    fn unmap(&self, local: u64) -> Result<()>;

    fn has_copy_channel(&self) -> bool;
    /// Queue an asynchronous copy of `len` bytes; `callback` runs once it finished.
    fn submit_copy(&self, dst: u64, src: u64, len: u64, callback: CopyCallback)
    -> Result<CopyHandle>;

    fn alloc_dma(&self, len: u64, align: u64) -> Result<u64>;
    fn free_dma(&self, addr: u64, len: u64) -> Result<()>;

    /// Make the local kvec buffer known to the peer, or withdraw it.
    fn publish_kvec_buffer(&self, addr: Option<u64>);
    fn peer_kvec_buffer(&self) -> Option<u64>;

    fn set_driver_ok(&self, ok: bool);
    fn driver_ok(&self) -> bool;
    fn peer_driver_ok(&self) -> bool;
    fn peer_features(&self) -> u32;
}

/// Arbitrates the backend's mapping slots between transfers.
///
/// Waiters sleep until an unmap happens or the remap timeout runs out.
#[derive(Debug)]
pub struct RemoteMapper {
    released: Mutex<u64>,
    cv: Condvar,
    timeout: Duration,
    attempts: u8,
}

impl RemoteMapper {
    pub fn new(timeout: Duration, attempts: u8) -> Self {
        Self {
            released: Mutex::new(0),
            cv: Condvar::new(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Map `phys`, waiting for a slot while `running` holds.
    #[instrument(err(Debug), skip(self, hw, running), parent = Span::current(), level = "Trace")]
    pub fn map<H: HardwareOps>(
        &self,
        hw: &H,
        phys: u64,
        len: u64,
        running: &dyn Fn() -> bool,
    ) -> Result<u64> {
        let deadline = Instant::now() + self.timeout;
        let mut failures = 0u8;

        loop {
            if !running() {
                return Err(VopError::Stopped);
            }

            let generation = *self.released.lock()?;
            match hw.map_remote(phys, len) {
                Ok(local) => return Ok(local),
                Err(VopError::MapBusy(_, _)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!("no mapping slot for {phys:#x}+{len:#x} after {:?}", self.timeout);
                        return Err(VopError::MapBusy(phys, len));
                    }
                    let guard = self.released.lock()?;
                    let _ = self
                        .cv
                        .wait_timeout_while(guard, deadline - now, |g| *g == generation && running())?;
                }
                Err(VopError::MapFailed(_, _)) => {
                    failures += 1;
                    if failures >= self.attempts {
                        return Err(VopError::MapFailed(phys, len));
                    }
                    tracing::debug!("mapping {phys:#x}+{len:#x} failed, attempt {failures}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unmap and wake mapping waiters.
    pub fn unmap<H: HardwareOps>(&self, hw: &H, local: u64) -> Result<()> {
        let res = hw.unmap(local);
        self.wake_all();
        res
    }

    pub fn wake_all(&self) {
        match self.released.lock() {
            Ok(mut g) => *g = g.wrapping_add(1),
            Err(e) => tracing::error!("mapping waiters lock poisoned: {e}"),
        }
        self.cv.notify_all();
    }
}

/// Poll `cond` every millisecond until it holds or `timeout` expires.
pub(crate) fn poll_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(VopError::Timeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Round `len` up to the backend page size.
pub(crate) fn page_align(len: u64) -> Result<u64> {
    let page = vop_common::PAGE_SIZE as u64;
    len.checked_next_multiple_of(page)
        .ok_or_else(|| new_error!("length {len:#x} overflows when page aligned"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::sim::{SimLink, SimLinkConfig};
    use super::*;

    #[test]
    fn mapper_waits_for_a_released_slot() {
        let mut cfg = SimLinkConfig::default();
        cfg.map_slots = 1;
        let link = SimLink::new(cfg).unwrap();
        let (a, _) = link.endpoints();
        let buf = a.alloc_dma(4096, 4096).unwrap();

        let mapper = Arc::new(RemoteMapper::new(Duration::from_secs(5), 1));
        let first = mapper.map(&*a, buf, 4096, &|| true).unwrap();

        let waiter = {
            let mapper = mapper.clone();
            let a = a.clone();
            thread::spawn(move || mapper.map(&*a, buf, 4096, &|| true))
        };
        thread::sleep(Duration::from_millis(20));
        mapper.unmap(&*a, first).unwrap();

        let second = waiter.join().unwrap().unwrap();
        mapper.unmap(&*a, second).unwrap();
    }

    #[test]
    fn mapper_times_out_and_stops() {
        let mut cfg = SimLinkConfig::default();
        cfg.map_slots = 1;
        let link = SimLink::new(cfg).unwrap();
        let (a, _) = link.endpoints();
        let buf = a.alloc_dma(4096, 4096).unwrap();

        let mapper = RemoteMapper::new(Duration::from_millis(20), 1);
        let held = mapper.map(&*a, buf, 4096, &|| true).unwrap();
        assert!(matches!(
            mapper.map(&*a, buf, 4096, &|| true),
            Err(VopError::MapBusy(_, _))
        ));

        let running = AtomicBool::new(false);
        assert!(matches!(
            mapper.map(&*a, buf, 4096, &|| running.load(Ordering::Relaxed)),
            Err(VopError::Stopped)
        ));
        mapper.unmap(&*a, held).unwrap();
    }

    #[test]
    fn page_alignment() {
        assert_eq!(page_align(1).unwrap(), 4096);
        assert_eq!(page_align(4096).unwrap(), 4096);
        assert!(page_align(u64::MAX).is_err());
    }
}
