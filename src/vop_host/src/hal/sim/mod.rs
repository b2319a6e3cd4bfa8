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

//! Two endpoints wired back to back over one shared arena.
//!
//! Physical addresses are arena offsets shifted by [`arena::PHYS_BASE`] and
//! mean the same thing on both sides. Faults can be injected per endpoint to
//! exercise the error paths of the transport.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use self::arena::{MapTable, SimArena, SimMem};
use self::copy_engine::CopyEngine;
use self::signal::SignalRegistry;
use super::{
    CopyCallback, CopyHandle, FEATURE_OFFSET_RXBUF, HardwareOps, LineId, SignalCallback,
    SignalKind,
};
use crate::error::VopError;
use crate::{Result, new_error};

pub mod arena;
mod copy_engine;
mod signal;
pub mod slab;

/// Shape of a simulated link.
#[derive(Debug, Clone, Copy)]
pub struct SimLinkConfig {
    /// Bytes of shared memory.
    pub arena_size: usize,
    /// Concurrent remote mappings per endpoint.
    pub map_slots: usize,
    /// Whether endpoints have a copy channel.
    pub copy_channel: bool,
    /// Whether endpoints advertise offset-prefixed receive buffers.
    pub offset_rxbuf: bool,
    /// Run copy jobs out of order with small random delays.
    pub randomize_completions: bool,
}

impl Default for SimLinkConfig {
    fn default() -> Self {
        Self {
            arena_size: 16 * 1024 * 1024,
            map_slots: 16,
            copy_channel: true,
            offset_rxbuf: true,
            randomize_completions: false,
        }
    }
}

#[derive(Default)]
struct SideState {
    driver_ok: AtomicBool,
    kvec_buffer: Mutex<Option<u64>>,
    features: AtomicU32,
    signals: SignalRegistry,
}

struct LinkShared {
    sides: [SideState; 2],
}

/// Faults consumed one by one by the next matching operations.
#[derive(Default)]
struct FaultInjection {
    fail_submits: AtomicU32,
    fail_completions: AtomicU32,
    drop_signals: AtomicU32,
    fail_maps: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// One side of a [`SimLink`].
pub struct SimEndpoint {
    side: usize,
    link: Arc<LinkShared>,
    arena: Arc<SimArena>,
    maps: Arc<MapTable>,
    mem: SimMem,
    copy: Option<CopyEngine>,
    faults: FaultInjection,
}

/// A pair of endpoints sharing memory and signal lines.
pub struct SimLink {
    endpoints: (Arc<SimEndpoint>, Arc<SimEndpoint>),
}

impl SimLink {
    pub fn new(cfg: SimLinkConfig) -> Result<Self> {
        if cfg.map_slots == 0 {
            return Err(new_error!("a link needs at least one mapping slot"));
        }
        let arena = Arc::new(SimArena::new(cfg.arena_size)?);
        let link = Arc::new(LinkShared {
            sides: Default::default(),
        });
        let features = if cfg.offset_rxbuf {
            1 << FEATURE_OFFSET_RXBUF
        } else {
            0
        };

        let endpoint = |side: usize| -> Result<Arc<SimEndpoint>> {
            link.sides[side].features.store(features, Ordering::Release);
            let maps = Arc::new(MapTable::new(cfg.map_slots));
            let mem = SimMem::new(arena.clone(), maps.clone());
            let copy = if cfg.copy_channel {
                Some(CopyEngine::spawn(mem.clone(), cfg.randomize_completions)?)
            } else {
                None
            };
            Ok(Arc::new(SimEndpoint {
                side,
                link: link.clone(),
                arena: arena.clone(),
                maps,
                mem,
                copy,
                faults: FaultInjection::default(),
            }))
        };

        Ok(Self {
            endpoints: (endpoint(0)?, endpoint(1)?),
        })
    }

    pub fn endpoints(&self) -> (Arc<SimEndpoint>, Arc<SimEndpoint>) {
        (self.endpoints.0.clone(), self.endpoints.1.clone())
    }
}

impl SimEndpoint {
    fn own(&self) -> &SideState {
        &self.link.sides[self.side]
    }

    fn peer(&self) -> &SideState {
        &self.link.sides[1 - self.side]
    }

    /// Make the next `n` copy submissions fail.
    pub fn fail_next_submits(&self, n: u32) {
        self.faults.fail_submits.store(n, Ordering::Release);
    }

    /// Make the next `n` copy jobs complete with a hardware fault.
    pub fn fail_next_completions(&self, n: u32) {
        self.faults.fail_completions.store(n, Ordering::Release);
    }

    /// Make the next `n` mapping attempts fail.
    pub fn fail_next_maps(&self, n: u32) {
        self.faults.fail_maps.store(n, Ordering::Release);
    }

    /// Lose the next `n` signals raised towards the peer.
    pub fn drop_next_signals(&self, n: u32) {
        self.faults.drop_signals.store(n, Ordering::Release);
    }

    /// Features this endpoint advertises to its peer.
    pub fn set_features(&self, features: u32) {
        self.own().features.store(features, Ordering::Release);
    }

    pub fn mapped_slots(&self) -> usize {
        self.maps.in_use()
    }

    pub fn signal_lines(&self) -> usize {
        self.own().signals.allocated()
    }

    pub fn allocated_pages(&self) -> usize {
        self.arena.allocated_pages()
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        use vop_common::kvec::MemOps;
        self.mem.write(addr, data).map(|_| ())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        use vop_common::kvec::MemOps;
        let mut out = vec![0u8; len];
        self.mem.read(addr, &mut out)?;
        Ok(out)
    }
}

impl HardwareOps for SimEndpoint {
    type Mem = SimMem;

    fn mem(&self) -> SimMem {
        self.mem.clone()
    }

    fn allocate_signal_line(&self, kind: SignalKind) -> Result<LineId> {
        self.own().signals.allocate(kind)
    }

    fn request_notification(&self, line: LineId, callback: SignalCallback) -> Result<()> {
        self.own().signals.register(line, callback)
    }

    fn free_notification(&self, line: LineId) {
        self.own().signals.free(line)
    }

    fn acknowledge(&self, line: LineId) {
        self.own().signals.acknowledge(line)
    }

    fn raise_peer(&self, kind: SignalKind) -> Result<()> {
        if take_one(&self.faults.drop_signals) {
            debug!("dropping {} signal", kind.as_str());
            return Ok(());
        }
        self.peer().signals.raise(kind);
        Ok(())
    }

    fn map_remote(&self, phys: u64, len: u64) -> Result<u64> {
        if take_one(&self.faults.fail_maps) {
            return Err(VopError::MapFailed(phys, len));
        }
        self.maps.map(phys, len)
    }

    fn unmap(&self, local: u64) -> Result<()> {
        self.maps.unmap(local)
    }

    fn has_copy_channel(&self) -> bool {
        self.copy.is_some()
    }

    fn submit_copy(
        &self,
        dst: u64,
        src: u64,
        len: u64,
        callback: CopyCallback,
    ) -> Result<CopyHandle> {
        let Some(engine) = &self.copy else {
            return Err(new_error!("no copy channel"));
        };
        if take_one(&self.faults.fail_submits) {
            return Err(new_error!("copy submission of {len:#x} bytes rejected"));
        }
        let fail = take_one(&self.faults.fail_completions);
        engine.submit(dst, src, len, fail, callback)
    }

    fn alloc_dma(&self, len: u64, align: u64) -> Result<u64> {
        self.arena.alloc(len, align)
    }

    fn free_dma(&self, addr: u64, len: u64) -> Result<()> {
        self.arena.free(addr, len)
    }

    fn publish_kvec_buffer(&self, addr: Option<u64>) {
        match self.own().kvec_buffer.lock() {
            Ok(mut buf) => *buf = addr,
            Err(e) => tracing::error!("kvec buffer lock poisoned: {e}"),
        }
    }

    fn peer_kvec_buffer(&self) -> Option<u64> {
        self.peer().kvec_buffer.lock().ok().and_then(|b| *b)
    }

    fn set_driver_ok(&self, ok: bool) {
        self.own().driver_ok.store(ok, Ordering::Release);
    }

    fn driver_ok(&self) -> bool {
        self.own().driver_ok.load(Ordering::Acquire)
    }

    fn peer_driver_ok(&self) -> bool {
        self.peer().driver_ok.load(Ordering::Acquire)
    }

    fn peer_features(&self) -> u32 {
        self.peer().features.load(Ordering::Acquire)
    }
}
