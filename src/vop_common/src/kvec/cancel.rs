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

//! Cancellation handshake through the buffer header.
//!
//! The requester writes into the header of the buffer it published into
//! (the peer's), the responder reads and answers in its own header.

use core::sync::atomic::{Ordering, fence};

use super::{CancelStatus, KvecBufLayout, KvecError, MemOps, SizeClass};

/// A cancellation request as found in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// Raw ring id; may not name a valid class.
    pub ring_id: u16,
    pub index: u32,
}

impl CancelRequest {
    pub fn class(&self) -> Option<SizeClass> {
        SizeClass::try_from(self.ring_id).ok()
    }
}

/// Post a request to cancel the pair at `slot` of `class`.
pub fn post_cancel_request<M: MemOps>(
    mem: &M,
    layout: &KvecBufLayout,
    class: SizeClass,
    slot: u16,
) -> Result<(), KvecError> {
    mem.store_release_u8(layout.cancel_status_addr(), 0)
        .map_err(|_| KvecError::MemError)?;
    mem.write_val(layout.cancel_idx_addr(), slot as u32)
        .map_err(|_| KvecError::MemError)?;
    mem.write_val(layout.cancel_ring_addr(), class as u16)
        .map_err(|_| KvecError::MemError)?;
    fence(Ordering::Release);
    mem.store_release_u8(layout.cancel_request_addr(), 1)
        .map_err(|_| KvecError::MemError)
}

/// Status of the last request, once the responder has cleared it.
pub fn cancel_status<M: MemOps>(
    mem: &M,
    layout: &KvecBufLayout,
) -> Result<Option<CancelStatus>, KvecError> {
    let pending = mem
        .load_acquire_u8(layout.cancel_request_addr())
        .map_err(|_| KvecError::MemError)?;
    if pending != 0 {
        return Ok(None);
    }
    let status = mem
        .load_acquire_u8(layout.cancel_status_addr())
        .map_err(|_| KvecError::MemError)?;
    Ok(CancelStatus::from_byte(status))
}

/// Request waiting in the local header, if any.
pub fn pending_cancel_request<M: MemOps>(
    mem: &M,
    layout: &KvecBufLayout,
) -> Result<Option<CancelRequest>, KvecError> {
    let pending = mem
        .load_acquire_u8(layout.cancel_request_addr())
        .map_err(|_| KvecError::MemError)?;
    if pending == 0 {
        return Ok(None);
    }
    let index: u32 = mem
        .read_val(layout.cancel_idx_addr())
        .map_err(|_| KvecError::MemError)?;
    let ring_id: u16 = mem
        .read_val(layout.cancel_ring_addr())
        .map_err(|_| KvecError::MemError)?;
    Ok(Some(CancelRequest { ring_id, index }))
}

/// Answer the pending request. The status is visible before the request clears.
pub fn complete_cancel_request<M: MemOps>(
    mem: &M,
    layout: &KvecBufLayout,
    status: CancelStatus,
) -> Result<(), KvecError> {
    mem.store_release_u8(layout.cancel_status_addr(), status as u8)
        .map_err(|_| KvecError::MemError)?;
    mem.store_release_u8(layout.cancel_request_addr(), 0)
        .map_err(|_| KvecError::MemError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvec::ring::tests::OwnedBuf;

    #[test]
    fn request_and_answer() {
        let buf = OwnedBuf::new(8);
        let mem = buf.mem();
        let layout = buf.layout();

        assert_eq!(pending_cancel_request(&mem, &layout), Ok(None));

        post_cancel_request(&mem, &layout, SizeClass::Jumbo, 6).unwrap();
        assert_eq!(cancel_status(&mem, &layout), Ok(None));

        let req = pending_cancel_request(&mem, &layout).unwrap().unwrap();
        assert_eq!(req, CancelRequest { ring_id: 1, index: 6 });
        assert_eq!(req.class(), Some(SizeClass::Jumbo));

        complete_cancel_request(&mem, &layout, CancelStatus::Ok).unwrap();
        assert_eq!(pending_cancel_request(&mem, &layout), Ok(None));
        assert_eq!(cancel_status(&mem, &layout), Ok(Some(CancelStatus::Ok)));
    }

    #[test]
    fn new_request_clears_old_status() {
        let buf = OwnedBuf::new(8);
        let mem = buf.mem();
        let layout = buf.layout();

        post_cancel_request(&mem, &layout, SizeClass::Small, 0).unwrap();
        complete_cancel_request(&mem, &layout, CancelStatus::Timeout).unwrap();
        post_cancel_request(&mem, &layout, SizeClass::Small, 2).unwrap();
        mem.store_release_u8(layout.cancel_request_addr(), 0).unwrap();
        assert_eq!(cancel_status(&mem, &layout), Ok(None));
    }

    #[test]
    fn bad_ring_id_has_no_class() {
        let req = CancelRequest { ring_id: 7, index: 0 };
        assert_eq!(req.class(), None);
    }
}
