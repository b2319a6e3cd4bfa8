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

use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytemuck::Pod;
use vop_common::PAGE_SIZE;
use vop_common::kvec::MemOps;

use super::slab::{Run, Slab};
use crate::error::VopError;
use crate::{Result, new_error};

/// First physical address of the arena. Zero stays invalid.
pub const PHYS_BASE: u64 = 0x10_0000;

/// Mapped windows carry `slot + 1` in the bits above this shift.
const MAP_TAG_SHIFT: u32 = 48;
const PHYS_MASK: u64 = (1 << MAP_TAG_SHIFT) - 1;

/// Memory shared by both endpoints of a link, addressed physically.
pub struct SimArena {
    words: Box<[AtomicU64]>,
    allocator: Mutex<Slab<PAGE_SIZE>>,
}

impl SimArena {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.next_multiple_of(PAGE_SIZE);
        let words = (0..size / 8).map(|_| AtomicU64::new(0)).collect();
        let allocator = Slab::new(PHYS_BASE, size).map_err(|e| new_error!("arena: {e}"))?;
        Ok(Self {
            words,
            allocator: Mutex::new(allocator),
        })
    }

    pub fn size(&self) -> usize {
        self.words.len() * 8
    }

    /// Pointer to `len` bytes at `phys`.
    fn ptr(&self, phys: u64, len: u64) -> Result<*mut u8> {
        let off = phys
            .checked_sub(PHYS_BASE)
            .ok_or(VopError::OutOfBounds(phys, len))?;
        let end = off.checked_add(len).ok_or(VopError::OutOfBounds(phys, len))?;
        if end > self.size() as u64 {
            return Err(VopError::OutOfBounds(phys, len));
        }
        // AtomicU64 is interior mutable, writes through the derived pointer are allowed
        Ok(self.words.as_ptr().cast::<u8>().cast_mut().wrapping_add(off as usize))
    }

    pub(crate) fn alloc(&self, len: u64, align: u64) -> Result<u64> {
        if align > PAGE_SIZE as u64 || !align.is_power_of_two() {
            return Err(new_error!("unsupported alignment {align:#x}"));
        }
        let alloc = self
            .allocator
            .lock()?
            .alloc(len as usize)
            .map_err(|e| new_error!("arena allocation of {len:#x} bytes: {e}"))?;
        Ok(alloc.addr)
    }

    pub(crate) fn free(&self, addr: u64, len: u64) -> Result<()> {
        let len = (len as usize).next_multiple_of(PAGE_SIZE);
        self.allocator
            .lock()?
            .free(Run { addr, len })
            .map_err(|e| new_error!("arena free: {e}"))
    }

    pub fn allocated_pages(&self) -> usize {
        match self.allocator.lock() {
            Ok(a) => a.used(),
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    phys: u64,
    len: u64,
}

/// Mapping slots of one endpoint.
pub struct MapTable {
    slots: RwLock<Vec<Option<Window>>>,
}

impl MapTable {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; slots]),
        }
    }

    pub(crate) fn map(&self, phys: u64, len: u64) -> Result<u64> {
        if phys & !PHYS_MASK != 0 {
            return Err(VopError::MapFailed(phys, len));
        }
        let mut slots = self.slots.write()?;
        let Some(idx) = slots.iter().position(Option::is_none) else {
            return Err(VopError::MapBusy(phys, len));
        };
        slots[idx] = Some(Window { phys, len });
        Ok(((idx as u64 + 1) << MAP_TAG_SHIFT) | phys)
    }

    pub(crate) fn unmap(&self, local: u64) -> Result<()> {
        let tag = local >> MAP_TAG_SHIFT;
        let mut slots = self.slots.write()?;
        match tag.checked_sub(1).and_then(|i| slots.get_mut(i as usize)) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(new_error!("{local:#x} is not a mapped address")),
        }
    }

    pub fn in_use(&self) -> usize {
        match self.slots.read() {
            Ok(s) => s.iter().filter(|w| w.is_some()).count(),
            Err(_) => 0,
        }
    }

    /// Physical address behind `addr`, checking mapped windows.
    fn translate(&self, addr: u64, len: u64) -> Result<u64> {
        let tag = addr >> MAP_TAG_SHIFT;
        let phys = addr & PHYS_MASK;
        if tag == 0 {
            return Ok(phys);
        }
        let slots = self.slots.read()?;
        match slots.get(tag as usize - 1) {
            Some(Some(w)) if phys >= w.phys && phys + len <= w.phys + w.len => Ok(phys),
            _ => Err(VopError::OutOfBounds(addr, len)),
        }
    }
}

/// [`MemOps`] over the arena as seen by one endpoint.
///
/// Untagged addresses are physical; tagged ones must fall inside a live
/// mapping of that endpoint, so an access after unmap fails.
#[derive(Clone)]
pub struct SimMem {
    arena: Arc<SimArena>,
    maps: Arc<MapTable>,
}

impl SimMem {
    pub(crate) fn new(arena: Arc<SimArena>, maps: Arc<MapTable>) -> Self {
        Self { arena, maps }
    }

    fn resolve(&self, addr: u64, len: u64) -> Result<*mut u8> {
        let phys = self.maps.translate(addr, len)?;
        self.arena.ptr(phys, len)
    }

    fn resolve_aligned(&self, addr: u64, size: u64) -> Result<*mut u8> {
        if addr % size != 0 {
            return Err(new_error!("unaligned {size} byte atomic access at {addr:#x}"));
        }
        self.resolve(addr, size)
    }
}

impl MemOps for SimMem {
    type Error = VopError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize> {
        let src = self.resolve(addr, dst.len() as u64)?;
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize> {
        let dst = self.resolve(addr, src.len() as u64)?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn read_val<T: Pod>(&self, addr: u64) -> Result<T> {
        let src = self.resolve(addr, size_of::<T>() as u64)?;
        Ok(unsafe { ptr::read_unaligned(src.cast::<T>()) })
    }

    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<()> {
        let dst = self.resolve(addr, size_of::<T>() as u64)?;
        unsafe { ptr::write_unaligned(dst.cast::<T>(), val) };
        Ok(())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16> {
        let p = self.resolve_aligned(addr, 2)?.cast::<AtomicU16>();
        Ok(unsafe { (*p).load(Ordering::Acquire) })
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<()> {
        let p = self.resolve_aligned(addr, 2)?.cast::<AtomicU16>();
        unsafe { (*p).store(val, Ordering::Release) };
        Ok(())
    }

    fn load_acquire_u8(&self, addr: u64) -> Result<u8> {
        let p = self.resolve(addr, 1)?.cast::<AtomicU8>();
        Ok(unsafe { (*p).load(Ordering::Acquire) })
    }

    fn store_release_u8(&self, addr: u64, val: u8) -> Result<()> {
        let p = self.resolve(addr, 1)?.cast::<AtomicU8>();
        unsafe { (*p).store(val, Ordering::Release) };
        Ok(())
    }
}
