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

//! The two copy strategies and the offset prefix that lets payloads land at
//! an address with the same alignment as their source.
//!
//! With the offset-prefix feature the first byte of a destination payload
//! kvec holds the distance from the kvec start to the payload. Without it
//! payloads start at the kvec start.

use std::sync::atomic::{Ordering, fence};

use vop_common::PAGE_SIZE;
use vop_common::kvec::{
    ASYNC_COPY_ALIGN, ASYNC_COPY_MAX_OFFSET, MTU_MAX, MemOps, SEND_OVERHEAD_ASYNC,
    SEND_OVERHEAD_SYNC,
};

use crate::error::VopError;
use crate::{Result, new_error};

/// Size of a per-item staging buffer, big enough for the largest payload.
pub const STAGING_BUFFER_SIZE: u64 = (MTU_MAX as u64).next_multiple_of(PAGE_SIZE as u64);

const ALIGN: u64 = ASYNC_COPY_ALIGN as u64;
const CHUNK: usize = 4096;

/// How a device copies payloads and where transfers are finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Asynchronous copy straight from the source; the completion callback finishes.
    Inline,
    /// Asynchronous copy from a staging buffer; the sequencer finishes in submission order.
    Deferred,
    /// Synchronous copy; the fetch loop finishes.
    Sync,
}

impl CompletionMode {
    pub fn select(has_channel: bool, force_sync: bool, alignment: bool) -> Self {
        match (has_channel && !force_sync, alignment) {
            (false, _) => CompletionMode::Sync,
            (true, true) => CompletionMode::Inline,
            (true, false) => CompletionMode::Deferred,
        }
    }

    pub fn is_async(self) -> bool {
        self != CompletionMode::Sync
    }

    /// Bytes a destination needs on top of the payload.
    pub fn overhead(self) -> usize {
        if self.is_async() {
            SEND_OVERHEAD_ASYNC
        } else {
            SEND_OVERHEAD_SYNC
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionMode::Inline => "inline",
            CompletionMode::Deferred => "deferred",
            CompletionMode::Sync => "sync",
        }
    }
}

/// Offset prefix for a synchronous copy from `src`, in `1..=4`.
pub fn sync_offset(src: u64) -> u64 {
    match src & 3 {
        0 => 4,
        o => o,
    }
}

/// An asynchronous copy rounded to the copy engine's alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncPlan {
    /// Written at the destination start.
    pub offset: u8,
    pub dst: u64,
    pub src: u64,
    pub len: u64,
}

/// Plan an aligned asynchronous copy of `len` bytes from `src` into the kvec at `dst`.
pub fn async_aligned_plan(dst: u64, src: u64, len: u64) -> Result<AsyncPlan> {
    let mut new_dst = dst.next_multiple_of(ALIGN);
    let offset_dst = new_dst - dst;
    let new_src = src - src % ALIGN;
    let offset_src = src - new_src;
    let mut offset = offset_dst + offset_src;
    if offset_dst == 0 {
        // byte 0 holds the prefix, so the copy can never start there
        new_dst += ALIGN;
        offset += ALIGN;
    }
    if offset > ASYNC_COPY_MAX_OFFSET as u64 {
        return Err(new_error!("copy offset {offset} out of range"));
    }
    Ok(AsyncPlan {
        offset: offset as u8,
        dst: new_dst,
        src: new_src,
        len: (len + offset_src).next_multiple_of(ALIGN),
    })
}

/// Bytes submitted for a staged asynchronous copy of `len` payload bytes.
pub fn async_staged_len(len: u64) -> u64 {
    len.next_multiple_of(ALIGN)
}

/// Plain memory to memory copy through `mem`.
pub fn copy_bytes<M: MemOps<Error = VopError>>(mem: &M, dst: u64, src: u64, len: u64) -> Result<()> {
    let mut buf = [0u8; CHUNK];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(CHUNK as u64) as usize;
        mem.read(src + done, &mut buf[..n])?;
        mem.write(dst + done, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Copy `len` bytes from `src` into the kvec at `dst` on the calling thread.
///
/// Stores are fenced and the last written byte is read back so posted writes
/// reach the peer before the transfer is reported done.
pub fn sync_copy<M: MemOps<Error = VopError>>(
    mem: &M,
    dst: u64,
    src: u64,
    len: u64,
    alignment: bool,
) -> Result<()> {
    let payload = if alignment {
        let offset = sync_offset(src);
        mem.write_val(dst, offset as u8)?;
        dst + offset
    } else {
        dst
    };
    copy_bytes(mem, payload, src, len)
        .map_err(|e| VopError::CopyFailed(format!("memcpy of {len:#x} bytes: {e}")))?;
    fence(Ordering::SeqCst);
    if alignment {
        let _: u8 = mem.read_val(dst)?;
    }
    if len > 0 {
        let _: u8 = mem.read_val(payload + len - 1)?;
    }
    Ok(())
}

/// Payload of `len` bytes received in the buffer at `addr`.
pub fn received_payload<M: MemOps<Error = VopError>>(
    mem: &M,
    addr: u64,
    len: usize,
    alignment: bool,
) -> Result<Vec<u8>> {
    let start = if alignment {
        let offset: u8 = mem.read_val(addr)?;
        if offset == 0 || offset as usize > ASYNC_COPY_MAX_OFFSET {
            return Err(new_error!("bad payload offset {offset} at {addr:#x}"));
        }
        addr + offset as u64
    } else {
        addr
    };
    let mut out = vec![0u8; len];
    mem.read(start, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hal::HardwareOps;
    use crate::hal::sim::{SimLink, SimLinkConfig};

    #[test]
    fn mode_selection() {
        assert_eq!(CompletionMode::select(true, false, true), CompletionMode::Inline);
        assert_eq!(CompletionMode::select(true, false, false), CompletionMode::Deferred);
        assert_eq!(CompletionMode::select(false, false, true), CompletionMode::Sync);
        assert_eq!(CompletionMode::select(true, true, false), CompletionMode::Sync);
        assert_eq!(CompletionMode::Inline.overhead(), 191);
        assert_eq!(CompletionMode::Sync.overhead(), 64);
    }

    #[test]
    fn sync_offsets() {
        assert_eq!(sync_offset(0x1000), 4);
        assert_eq!(sync_offset(0x1001), 1);
        assert_eq!(sync_offset(0x1003), 3);
    }

    #[test]
    fn async_plan_math() {
        // both aligned: payload moves a whole alignment unit in
        let p = async_aligned_plan(0x2000, 0x1000, 100).unwrap();
        assert_eq!(p, AsyncPlan { offset: 64, dst: 0x2040, src: 0x1000, len: 128 });

        // misaligned source
        let p = async_aligned_plan(0x2000, 0x1013, 100).unwrap();
        assert_eq!(p.offset, 64 + 0x13);
        assert_eq!(p.src, 0x1000);
        assert_eq!(p.dst, 0x2040);
        assert_eq!(p.len, (100 + 0x13u64).next_multiple_of(64));
        // the payload byte lands at dst + offset
        assert_eq!(p.dst + (0x1013 - p.src), 0x2000 + p.offset as u64);

        // misaligned destination, worst case stays inside the overhead
        let p = async_aligned_plan(0x2001, 0x103f, 1).unwrap();
        assert_eq!(p.offset, 63 + 63);
        assert!(p.dst + p.len <= 0x2001 + 1 + SEND_OVERHEAD_ASYNC as u64);

        assert_eq!(async_staged_len(1), 64);
        assert_eq!(async_staged_len(128), 128);
        assert_eq!(STAGING_BUFFER_SIZE % PAGE_SIZE as u64, 0);
        assert!(STAGING_BUFFER_SIZE >= MTU_MAX as u64);
    }

    fn endpoint() -> (SimLink, Arc<crate::hal::sim::SimEndpoint>) {
        let link = SimLink::new(SimLinkConfig::default()).unwrap();
        let (a, _) = link.endpoints();
        (link, a)
    }

    #[test]
    fn sync_copy_with_prefix() {
        let (_link, a) = endpoint();
        let mem = a.mem();
        let src = a.alloc_dma(8192, 4096).unwrap();
        let dst = a.alloc_dma(8192, 4096).unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.write_bytes(src + 2, &data).unwrap();

        sync_copy(&mem, dst, src + 2, data.len() as u64, true).unwrap();
        assert_eq!(a.read_bytes(dst, 1).unwrap(), [2]);
        assert_eq!(received_payload(&mem, dst, data.len(), true).unwrap(), data);

        sync_copy(&mem, dst, src + 2, data.len() as u64, false).unwrap();
        assert_eq!(received_payload(&mem, dst, data.len(), false).unwrap(), data);
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let (_link, a) = endpoint();
        let dst = a.alloc_dma(4096, 4096).unwrap();
        a.write_bytes(dst, &[0]).unwrap();
        assert!(received_payload(&a.mem(), dst, 4, true).is_err());
    }
}

#[cfg(test)]
mod fuzz {
    use quickcheck::{QuickCheck, TestResult};

    use super::*;

    fn prop_aligned_plan(dst: u32, src: u32, len: u16) -> TestResult {
        let (dst, src, len) = (dst as u64, src as u64, len as u64);
        let plan = match async_aligned_plan(dst, src, len) {
            Ok(plan) => plan,
            Err(_) => return TestResult::failed(),
        };
        let offset = plan.offset as u64;
        let payload_at = plan.dst + (src - plan.src);

        TestResult::from_bool(
            offset >= 1
                && offset <= ASYNC_COPY_MAX_OFFSET as u64
                && plan.dst % ALIGN == 0
                && plan.src % ALIGN == 0
                && plan.len % ALIGN == 0
                && plan.dst > dst
                && payload_at == dst + offset
                && plan.src + plan.len >= src + len
                && plan.dst + plan.len <= dst + len + SEND_OVERHEAD_ASYNC as u64,
        )
    }

    fn prop_sync_offset_keeps_alignment(dst: u32, src: u32) -> TestResult {
        let (dst, src) = ((dst as u64) & !3, src as u64);
        let offset = sync_offset(src);
        TestResult::from_bool((1..=4).contains(&offset) && (dst + offset) % 4 == src % 4)
    }

    #[test]
    fn prop_plans() {
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop_aligned_plan as fn(u32, u32, u16) -> TestResult);
    }

    #[test]
    fn prop_sync_offsets() {
        QuickCheck::new()
            .tests(500)
            .quickcheck(prop_sync_offset_keeps_alignment as fn(u32, u32) -> TestResult);
    }
}
