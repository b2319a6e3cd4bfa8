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

use std::cmp::{max, min};
use std::time::Duration;

use tracing::{Span, instrument};

/// Clamp a duration to `[min_ms, max_ms]` milliseconds, `0` selects `default_ms`.
fn clamp_millis(value: Duration, default_ms: u16, min_ms: u16, max_ms: u16) -> u16 {
    match value.as_millis() {
        0 => default_ms,
        1.. => min(max_ms.into(), max(value.as_millis(), min_ms.into())) as u16,
    }
}

fn clamp_count(value: usize, min_count: u16, max_count: u16) -> u16 {
    min(max_count as usize, max(value, min_count as usize)) as u16
}

/// The complete set of configuration needed to run a transport device
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransportConfiguration {
    /// Number of transfer items, always a power of two.
    pool_size: u16,
    /// Entries per kvec size class ring, always even.
    ring_entries: u16,
    /// Heads of each descriptor queue.
    queue_capacity: u16,
    /// Publishes between two producer counter flushes.
    index_update_period: u16,
    /// Releases between two driver notifications.
    used_notify_threshold: u16,
    // Minimum time between two heads-up signals on one line, in milliseconds.
    // A received signal stays fresh for twice as long.
    heads_up_interval: u16,
    heads_up_wait_slice: u16,
    cancel_timeout: u16,
    remap_timeout: u16,
    acquire_timeout: u16,
    start_timeout: u16,
    map_attempts: u8,
    force_sync_copy: bool,
}

impl TransportConfiguration {
    /// The default number of transfer items (half of the default ring entries)
    pub const DEFAULT_POOL_SIZE: u16 = 64;
    /// The minimum number of transfer items
    pub const MIN_POOL_SIZE: u16 = 1;
    /// The maximum number of transfer items
    pub const MAX_POOL_SIZE: u16 = 1024;
    /// The default number of entries per kvec ring
    pub const DEFAULT_RING_ENTRIES: u16 = 128;
    /// The minimum number of entries per kvec ring
    pub const MIN_RING_ENTRIES: u16 = 4;
    /// The maximum number of entries per kvec ring
    pub const MAX_RING_ENTRIES: u16 = 4096;
    /// The default number of heads per descriptor queue
    pub const DEFAULT_QUEUE_CAPACITY: u16 = 64;
    /// The minimum number of heads per descriptor queue
    pub const MIN_QUEUE_CAPACITY: u16 = 1;
    /// The maximum number of heads per descriptor queue
    pub const MAX_QUEUE_CAPACITY: u16 = 2048;
    /// The default number of publishes between counter flushes
    pub const DEFAULT_INDEX_UPDATE_PERIOD: u16 = vop_common::kvec::KVEC_INDEX_UPDATE_PERIOD;
    /// The minimum number of publishes between counter flushes
    pub const MIN_INDEX_UPDATE_PERIOD: u16 = 1;
    /// The maximum number of publishes between counter flushes
    pub const MAX_INDEX_UPDATE_PERIOD: u16 = 1024;
    /// The default number of releases between driver notifications
    pub const DEFAULT_USED_NOTIFY_THRESHOLD: u16 = 16;
    /// The minimum number of releases between driver notifications
    pub const MIN_USED_NOTIFY_THRESHOLD: u16 = 1;
    /// The maximum number of releases between driver notifications
    pub const MAX_USED_NOTIFY_THRESHOLD: u16 = 1024;
    /// The default heads-up interval (in milliseconds)
    pub const DEFAULT_HEADS_UP_INTERVAL: u16 = 2;
    /// The minimum heads-up interval (in milliseconds)
    pub const MIN_HEADS_UP_INTERVAL: u16 = 1;
    /// The maximum heads-up interval (in milliseconds)
    pub const MAX_HEADS_UP_INTERVAL: u16 = 1000;
    /// The default blocking wait slice for heads-up waits (in milliseconds)
    pub const DEFAULT_HEADS_UP_WAIT_SLICE: u16 = 500;
    /// The minimum blocking wait slice for heads-up waits (in milliseconds)
    pub const MIN_HEADS_UP_WAIT_SLICE: u16 = 1;
    /// The maximum blocking wait slice for heads-up waits (in milliseconds)
    pub const MAX_HEADS_UP_WAIT_SLICE: u16 = 10_000;
    /// The default time a cancellation waits for a claimed kvec (in milliseconds)
    pub const DEFAULT_CANCEL_TIMEOUT: u16 = 3000;
    /// The minimum time a cancellation waits for a claimed kvec (in milliseconds)
    pub const MIN_CANCEL_TIMEOUT: u16 = 10;
    /// The maximum time a cancellation waits for a claimed kvec (in milliseconds)
    pub const MAX_CANCEL_TIMEOUT: u16 = u16::MAX;
    /// The default time to wait for a free mapping slot (in milliseconds)
    pub const DEFAULT_REMAP_TIMEOUT: u16 = 3000;
    /// The minimum time to wait for a free mapping slot (in milliseconds)
    pub const MIN_REMAP_TIMEOUT: u16 = 1;
    /// The maximum time to wait for a free mapping slot (in milliseconds)
    pub const MAX_REMAP_TIMEOUT: u16 = u16::MAX;
    /// The default wait slice for descriptors and transfer items (in milliseconds)
    pub const DEFAULT_ACQUIRE_TIMEOUT: u16 = 3000;
    /// The minimum wait slice for descriptors and transfer items (in milliseconds)
    pub const MIN_ACQUIRE_TIMEOUT: u16 = 1;
    /// The maximum wait slice for descriptors and transfer items (in milliseconds)
    pub const MAX_ACQUIRE_TIMEOUT: u16 = u16::MAX;
    /// The default time to wait for both drivers at start (in milliseconds)
    pub const DEFAULT_START_TIMEOUT: u16 = 5000;
    /// The minimum time to wait for both drivers at start (in milliseconds)
    pub const MIN_START_TIMEOUT: u16 = 1;
    /// The maximum time to wait for both drivers at start (in milliseconds)
    pub const MAX_START_TIMEOUT: u16 = u16::MAX;
    /// The default number of attempts to map a remote range
    pub const DEFAULT_MAP_ATTEMPTS: u8 = 3;
    /// The minimum number of attempts to map a remote range
    pub const MIN_MAP_ATTEMPTS: u8 = 1;
    /// The maximum number of attempts to map a remote range
    pub const MAX_MAP_ATTEMPTS: u8 = 16;

    /// Set the number of transfer items, rounded up to a power of two and
    /// clamped to `[MIN_POOL_SIZE, MAX_POOL_SIZE]`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_pool_size(&mut self, pool_size: usize) {
        self.pool_size = clamp_count(pool_size, Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
            .next_power_of_two();
    }

    /// Get the number of transfer items
    pub fn get_pool_size(&self) -> usize {
        self.pool_size as usize
    }

    /// Set the number of entries per kvec ring, rounded up to an even number.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_ring_entries(&mut self, ring_entries: usize) {
        let entries = clamp_count(ring_entries, Self::MIN_RING_ENTRIES, Self::MAX_RING_ENTRIES);
        self.ring_entries = entries + entries % 2;
    }

    /// Get the number of entries per kvec ring
    pub fn get_ring_entries(&self) -> u16 {
        self.ring_entries
    }

    /// Set the number of heads per descriptor queue.
    pub fn set_queue_capacity(&mut self, queue_capacity: usize) {
        self.queue_capacity =
            clamp_count(queue_capacity, Self::MIN_QUEUE_CAPACITY, Self::MAX_QUEUE_CAPACITY);
    }

    /// Get the number of heads per descriptor queue.
    ///
    /// Never more than half the ring entries: every outstanding receive head
    /// holds two kvec slots and one used record.
    pub fn get_queue_capacity(&self) -> u16 {
        min(self.queue_capacity, self.ring_entries / 2)
    }

    /// Set the number of publishes between two producer counter flushes.
    pub fn set_index_update_period(&mut self, period: usize) {
        self.index_update_period = clamp_count(
            period,
            Self::MIN_INDEX_UPDATE_PERIOD,
            Self::MAX_INDEX_UPDATE_PERIOD,
        );
    }

    /// Get the number of publishes between two producer counter flushes
    pub fn get_index_update_period(&self) -> u16 {
        self.index_update_period
    }

    /// Set the number of releases after which the driver is notified.
    pub fn set_used_notify_threshold(&mut self, threshold: usize) {
        self.used_notify_threshold = clamp_count(
            threshold,
            Self::MIN_USED_NOTIFY_THRESHOLD,
            Self::MAX_USED_NOTIFY_THRESHOLD,
        );
    }

    /// Get the number of releases after which the driver is notified
    pub fn get_used_notify_threshold(&self) -> u16 {
        self.used_notify_threshold
    }

    /// Set the minimum time between two heads-up signals on one line. If set to 0
    /// the default of `DEFAULT_HEADS_UP_INTERVAL` is used.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_heads_up_interval(&mut self, interval: Duration) {
        self.heads_up_interval = clamp_millis(
            interval,
            Self::DEFAULT_HEADS_UP_INTERVAL,
            Self::MIN_HEADS_UP_INTERVAL,
            Self::MAX_HEADS_UP_INTERVAL,
        );
    }

    /// Get the heads-up rate limit (T1)
    pub fn get_heads_up_interval(&self) -> Duration {
        Duration::from_millis(self.heads_up_interval as u64)
    }

    /// Get the time a received heads-up is trusted (T2 = 2 * T1)
    pub fn get_heads_up_validity(&self) -> Duration {
        2 * self.get_heads_up_interval()
    }

    /// Set the blocking wait slice used once a heads-up is stale. If set to 0
    /// the default of `DEFAULT_HEADS_UP_WAIT_SLICE` is used.
    pub fn set_heads_up_wait_slice(&mut self, slice: Duration) {
        self.heads_up_wait_slice = clamp_millis(
            slice,
            Self::DEFAULT_HEADS_UP_WAIT_SLICE,
            Self::MIN_HEADS_UP_WAIT_SLICE,
            Self::MAX_HEADS_UP_WAIT_SLICE,
        );
    }

    /// Get the blocking wait slice of heads-up waits
    pub fn get_heads_up_wait_slice(&self) -> Duration {
        Duration::from_millis(self.heads_up_wait_slice as u64)
    }

    /// Set how long a cancellation waits for a claimed kvec to complete. If set to 0
    /// the default of `DEFAULT_CANCEL_TIMEOUT` is used.
    pub fn set_cancel_timeout(&mut self, timeout: Duration) {
        self.cancel_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_CANCEL_TIMEOUT,
            Self::MIN_CANCEL_TIMEOUT,
            Self::MAX_CANCEL_TIMEOUT,
        );
    }

    /// Get how long a cancellation waits for a claimed kvec
    pub fn get_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout as u64)
    }

    /// Set how long to wait for a mapping slot to be released.
    pub fn set_remap_timeout(&mut self, timeout: Duration) {
        self.remap_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_REMAP_TIMEOUT,
            Self::MIN_REMAP_TIMEOUT,
            Self::MAX_REMAP_TIMEOUT,
        );
    }

    /// Get how long to wait for a mapping slot
    pub fn get_remap_timeout(&self) -> Duration {
        Duration::from_millis(self.remap_timeout as u64)
    }

    /// Set the wait slice for descriptors and transfer items. Waits are retried
    /// while the device runs; every expiry is logged.
    pub fn set_acquire_timeout(&mut self, timeout: Duration) {
        self.acquire_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_ACQUIRE_TIMEOUT,
            Self::MIN_ACQUIRE_TIMEOUT,
            Self::MAX_ACQUIRE_TIMEOUT,
        );
    }

    /// Get the wait slice for descriptors and transfer items
    pub fn get_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout as u64)
    }

    /// Set how long `start` waits for both drivers and the peer buffer.
    pub fn set_start_timeout(&mut self, timeout: Duration) {
        self.start_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_START_TIMEOUT,
            Self::MIN_START_TIMEOUT,
            Self::MAX_START_TIMEOUT,
        );
    }

    /// Get how long `start` waits for the peer
    pub fn get_start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout as u64)
    }

    /// Set how many times a failing remote mapping is attempted.
    pub fn set_map_attempts(&mut self, attempts: u8) {
        self.map_attempts = attempts.clamp(Self::MIN_MAP_ATTEMPTS, Self::MAX_MAP_ATTEMPTS);
    }

    /// Get how many times a failing remote mapping is attempted
    pub fn get_map_attempts(&self) -> u8 {
        self.map_attempts
    }

    /// Use the synchronous copy path even when a copy channel exists.
    pub fn set_force_sync_copy(&mut self, force: bool) {
        self.force_sync_copy = force;
    }

    /// Whether the synchronous copy path is forced
    pub fn get_force_sync_copy(&self) -> bool {
        self.force_sync_copy
    }
}

impl Default for TransportConfiguration {
    fn default() -> Self {
        Self {
            pool_size: Self::DEFAULT_POOL_SIZE,
            ring_entries: Self::DEFAULT_RING_ENTRIES,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            index_update_period: Self::DEFAULT_INDEX_UPDATE_PERIOD,
            used_notify_threshold: Self::DEFAULT_USED_NOTIFY_THRESHOLD,
            heads_up_interval: Self::DEFAULT_HEADS_UP_INTERVAL,
            heads_up_wait_slice: Self::DEFAULT_HEADS_UP_WAIT_SLICE,
            cancel_timeout: Self::DEFAULT_CANCEL_TIMEOUT,
            remap_timeout: Self::DEFAULT_REMAP_TIMEOUT,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            start_timeout: Self::DEFAULT_START_TIMEOUT,
            map_attempts: Self::DEFAULT_MAP_ATTEMPTS,
            force_sync_copy: false,
        }
    }
}
