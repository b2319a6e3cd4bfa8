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

#![no_main]

use std::cell::RefCell;

use libfuzzer_sys::arbitrary::{Arbitrary, Result, Unstructured};
use libfuzzer_sys::fuzz_target;
use vop_common::kvec::{
    CancelStatus, KvecBufLayout, KvecPublisher, KvecRings, MemOps, SizeClass, UsedRingReader,
    complete_cancel_request, pending_cancel_request,
};

const BASE: u64 = 0x10_0000;
const MAX_ENTRIES: u16 = 64;

/// Kvec buffer contents as the peer left them.
struct PeerBuf {
    bytes: RefCell<Vec<u8>>,
}

#[derive(Debug)]
struct OutOfRange;

impl PeerBuf {
    fn range(&self, addr: u64, len: usize) -> std::result::Result<std::ops::Range<usize>, OutOfRange> {
        let start = addr.checked_sub(BASE).ok_or(OutOfRange)? as usize;
        let end = start.checked_add(len).ok_or(OutOfRange)?;
        if end > self.bytes.borrow().len() {
            return Err(OutOfRange);
        }
        Ok(start..end)
    }
}

impl MemOps for &PeerBuf {
    type Error = OutOfRange;

    fn read(&self, addr: u64, dst: &mut [u8]) -> std::result::Result<usize, OutOfRange> {
        let r = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.bytes.borrow()[r]);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> std::result::Result<usize, OutOfRange> {
        let r = self.range(addr, src.len())?;
        self.bytes.borrow_mut()[r].copy_from_slice(src);
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> std::result::Result<u16, OutOfRange> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_ne_bytes(b))
    }

    fn store_release(&self, addr: u64, val: u16) -> std::result::Result<(), OutOfRange> {
        self.write(addr, &val.to_ne_bytes()).map(|_| ())
    }

    fn load_acquire_u8(&self, addr: u64) -> std::result::Result<u8, OutOfRange> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn store_release_u8(&self, addr: u64, val: u8) -> std::result::Result<(), OutOfRange> {
        self.write(addr, &[val]).map(|_| ())
    }
}

#[derive(Debug)]
enum Op {
    Publish(u16, u32),
    Flush,
    Claim(SizeClass),
    Release(u8),
    Cancel(SizeClass, u32),
    PopUsed,
    ServiceCancel,
}

#[derive(Debug)]
struct FuzzInput {
    entries: u16,
    contents: Vec<u8>,
    ops: Vec<Op>,
}

impl<'a> Arbitrary<'a> for FuzzInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<Self> {
        let entries = (u.arbitrary::<u16>()? % (MAX_ENTRIES / 2) + 1) * 2;
        let contents = u.arbitrary::<Vec<u8>>()?;
        let num_ops = u.arbitrary_len::<u8>()? % 256;
        let mut ops = Vec::with_capacity(num_ops);
        for _ in 0..num_ops {
            ops.push(match u.arbitrary::<u8>()? % 7 {
                0 => Op::Publish(u.arbitrary()?, u.arbitrary()?),
                1 => Op::Flush,
                2 => Op::Claim(u.arbitrary()?),
                3 => Op::Release(u.arbitrary()?),
                4 => Op::Cancel(u.arbitrary()?, u.arbitrary()?),
                5 => Op::PopUsed,
                _ => Op::ServiceCancel,
            });
        }
        Ok(FuzzInput {
            entries,
            contents,
            ops,
        })
    }
}

// The claimer side of a kvec buffer reads counters, records and cancel
// requests written by the peer. Starting from arbitrary contents and
// interleaving publishes with claims, cancels and used record draining,
// nothing may panic and no ring may report more entries than it holds.
fuzz_target!(|input: FuzzInput| {
    let size = KvecBufLayout::query_size(input.entries as usize);
    let mut bytes = input.contents;
    bytes.resize(size, 0);
    let buf = PeerBuf {
        bytes: RefCell::new(bytes),
    };
    let Ok(layout) = (unsafe { KvecBufLayout::from_base(BASE, input.entries) }) else {
        return;
    };

    let Ok(mut publisher) = KvecPublisher::new(layout, &buf) else {
        return;
    };
    let mut rings = KvecRings::new(layout, &buf);
    let mut used = UsedRingReader::new(layout, &buf);
    let mut claims = Vec::new();

    for op in &input.ops {
        match op {
            Op::Publish(head, len) => {
                let _ = publisher.publish(*head, &[(BASE, 12), (BASE, *len as u64)]);
            }
            Op::Flush => {
                let _ = publisher.flush();
            }
            Op::Claim(class) => {
                if let Ok(claim) = rings.claim_next(*class) {
                    assert!(!claim.kvecs.is_empty());
                    assert!(claim.kvecs.len() <= input.entries as usize);
                    claims.push(claim);
                }
            }
            Op::Release(n) => {
                if !claims.is_empty() {
                    let claim = claims.swap_remove(*n as usize % claims.len());
                    let _ = rings.release_claim(claim.class, claim.first_slot);
                }
            }
            Op::Cancel(class, idx) => {
                let _ = rings.mark_cancelled(*class, *idx);
            }
            Op::PopUsed => {
                let _ = used.pop();
            }
            Op::ServiceCancel => {
                if let Ok(Some(req)) = pending_cancel_request(&&buf, &layout) {
                    let status = match req.class() {
                        Some(c) => match rings.mark_cancelled(c, req.index) {
                            Ok(_) => CancelStatus::Ok,
                            Err(_) => CancelStatus::InvalidRequest,
                        },
                        None => CancelStatus::InvalidRequest,
                    };
                    let _ = complete_cancel_request(&&buf, &layout, status);
                }
            }
        }
        for c in SizeClass::ALL {
            if let Ok(avail) = rings.available(c) {
                assert!(avail <= input.entries);
            }
        }
    }
});
