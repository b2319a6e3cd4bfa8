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

//! Memory access traits for kvec ring operations
//!
//! The rings live in memory that is shared across the link: the local side
//! sees its own buffer directly, the remote side sees it through a mapped
//! window. [`MemOps`] hides that difference from the ring code.

use bytemuck::Pod;

/// Memory access for kvec rings, provided by the platform.
///
/// Addresses are whatever the implementation translates; an address it
/// cannot serve is an error, never undefined behaviour. The acquire and
/// release variants are the only ordering the ring code relies on.
pub trait MemOps {
    type Error;

    /// Read bytes starting at `addr` into `dst`.
    ///
    /// Returns the number of bytes read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write `src` starting at `addr`.
    ///
    /// Returns the number of bytes written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must translate to a valid, aligned `AtomicU16`.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must translate to a valid, aligned `AtomicU16`.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Load a byte with acquire semantics. Used for kvec flags and the
    /// cancellation handshake bytes.
    fn load_acquire_u8(&self, addr: u64) -> Result<u8, Self::Error>;

    /// Store a byte with release semantics.
    fn store_release_u8(&self, addr: u64, val: u8) -> Result<(), Self::Error>;

    /// Plain (unordered) read of a `T` at `addr`.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        self.read(addr, bytemuck::bytes_of_mut(&mut val)).map(|_| val)
    }

    /// Plain (unordered) write of `val` at `addr`.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        self.write(addr, bytemuck::bytes_of(&val)).map(|_| ())
    }
}
