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

//! Page allocator for the simulated arena.
//!
//! One bit per `N` byte slot, first fit. The most recently freed run is
//! tried before scanning, so freeing and reallocating the same size returns
//! the same addresses.

use fixedbitset::FixedBitSet;
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum SlabError {
    #[error("Region base {0:#x} is not slot aligned")]
    Misaligned(u64),
    #[error("{len:#x} bytes at {addr:#x} are not an allocated run")]
    BadFree { addr: u64, len: usize },
    #[error("Zero length allocation")]
    ZeroLength,
    #[error("Region holds no slot")]
    EmptyRegion,
    #[error("No run of {0} free slots")]
    Exhausted(usize),
}

/// A run of consecutive slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub addr: u64,
    /// Whole slots, in bytes.
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base: u64,
    taken: FixedBitSet,
    recent: Option<Run>,
}

impl<const N: usize> Slab<N> {
    /// Slots covering `[base, base + len)`; a partial slot at the end is dropped.
    pub fn new(base: u64, len: usize) -> Result<Self, SlabError> {
        if base % N as u64 != 0 {
            return Err(SlabError::Misaligned(base));
        }
        match len / N {
            0 => Err(SlabError::EmptyRegion),
            slots => Ok(Self {
                base,
                taken: FixedBitSet::with_capacity(slots),
                recent: None,
            }),
        }
    }

    fn is_free(&self, first: usize, count: usize) -> bool {
        first + count <= self.taken.len() && self.taken.count_ones(first..first + count) == 0
    }

    fn first_fit(&mut self, count: usize) -> Option<usize> {
        if let Some(run) = self.recent.take() {
            let first = (run.addr - self.base) as usize / N;
            if run.len >= count * N && self.is_free(first, count) {
                return Some(first);
            }
        }
        self.taken.zeroes().find(|&first| self.is_free(first, count))
    }

    /// Take enough consecutive slots for `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<Run, SlabError> {
        if len == 0 {
            return Err(SlabError::ZeroLength);
        }
        let count = len.div_ceil(N);
        let first = self.first_fit(count).ok_or(SlabError::Exhausted(count))?;
        self.taken.insert_range(first..first + count);
        Ok(Run {
            addr: self.base + (first * N) as u64,
            len: count * N,
        })
    }

    /// Return a run handed out by [`alloc`](Self::alloc). Freeing twice fails.
    pub fn free(&mut self, run: Run) -> Result<(), SlabError> {
        let bad = SlabError::BadFree {
            addr: run.addr,
            len: run.len,
        };
        let off = run.addr.checked_sub(self.base).ok_or(bad)? as usize;
        if run.len == 0 || run.len % N != 0 || off % N != 0 {
            return Err(bad);
        }
        let slots = off / N..(off + run.len) / N;
        if slots.end > self.taken.len() || !self.taken.contains_all_in_range(slots.clone()) {
            return Err(bad);
        }
        self.taken.remove_range(slots);
        self.recent = Some(run);
        Ok(())
    }

    /// Slots currently taken.
    pub fn used(&self) -> usize {
        self.taken.count_ones(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;
    const BASE: u64 = 0x10_0000;

    #[test]
    fn freed_run_is_reused() {
        let mut slab = Slab::<PAGE>::new(BASE, 8 * PAGE).unwrap();
        let a = slab.alloc(1).unwrap();
        let b = slab.alloc(PAGE + 1).unwrap();
        assert_eq!(a, Run { addr: BASE, len: PAGE });
        assert_eq!(b, Run { addr: BASE + PAGE as u64, len: 2 * PAGE });

        slab.free(a).unwrap();
        assert_eq!(slab.free(a), Err(SlabError::BadFree { addr: a.addr, len: a.len }));
        assert_eq!(slab.alloc(PAGE).unwrap().addr, a.addr);
        assert_eq!(slab.used(), 3);
    }

    #[test]
    fn exhaustion_and_bad_input() {
        let mut slab = Slab::<PAGE>::new(BASE, 2 * PAGE).unwrap();
        assert_eq!(slab.alloc(0), Err(SlabError::ZeroLength));
        assert_eq!(slab.alloc(3 * PAGE), Err(SlabError::Exhausted(3)));
        let a = slab.alloc(2 * PAGE).unwrap();
        assert_eq!(slab.alloc(1), Err(SlabError::Exhausted(1)));
        slab.free(a).unwrap();
        assert!(slab.free(Run { addr: BASE - PAGE as u64, len: PAGE }).is_err());

        assert!(matches!(Slab::<PAGE>::new(BASE + 1, PAGE), Err(SlabError::Misaligned(_))));
        assert!(matches!(Slab::<PAGE>::new(BASE, PAGE - 1), Err(SlabError::EmptyRegion)));
    }

    #[test]
    fn run_must_fit_before_region_end() {
        let mut slab = Slab::<PAGE>::new(0, 3 * PAGE).unwrap();
        let a = slab.alloc(PAGE).unwrap();
        let _b = slab.alloc(PAGE).unwrap();
        slab.free(a).unwrap();
        // one free page at the front, one at the tail
        assert_eq!(slab.alloc(2 * PAGE), Err(SlabError::Exhausted(2)));
    }
}
