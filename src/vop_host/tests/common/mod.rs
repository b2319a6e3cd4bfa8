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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vop_host::copy::received_payload;
use vop_host::hal::sim::{SimEndpoint, SimLink, SimLinkConfig};
use vop_host::queue::{Segment, UsedDescriptor};
use vop_common::kvec::MemOps;
use vop_host::{HardwareOps, TransportConfiguration, VopDevice};

/// Length of the header segment of every chain the test drivers post.
pub const HDR_LEN: u64 = 12;
/// Receive buffers land in the smallest size class.
pub const RX_BUF_LEN: u64 = 2048;
pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config() -> TransportConfiguration {
    let mut cfg = TransportConfiguration::default();
    cfg.set_pool_size(8);
    cfg.set_ring_entries(32);
    cfg.set_heads_up_interval(Duration::from_millis(1));
    cfg.set_heads_up_wait_slice(Duration::from_millis(20));
    cfg.set_acquire_timeout(Duration::from_millis(200));
    cfg.set_cancel_timeout(Duration::from_millis(500));
    cfg.set_remap_timeout(Duration::from_millis(500));
    cfg
}

/// A device plus the driver state a test needs to talk to it.
pub struct Side<H: HardwareOps = SimEndpoint> {
    pub hw: Arc<H>,
    pub dev: VopDevice<H>,
    offset_rxbuf: bool,
    rx_bufs: Mutex<HashMap<u16, u64>>,
}

impl<H: HardwareOps> Side<H> {
    /// Wrap `hw` in a device with the driver already marked ready.
    pub fn new(hw: Arc<H>, cfg: TransportConfiguration, offset_rxbuf: bool) -> Self {
        hw.set_driver_ok(true);
        Side {
            dev: VopDevice::new(hw.clone(), cfg),
            hw,
            offset_rxbuf,
            rx_bufs: Mutex::new(HashMap::new()),
        }
    }

    /// Post `payload` on the transmit queue, `offset` bytes into its buffer.
    pub fn send_at(&self, payload: &[u8], offset: u64) -> u16 {
        let hdr = self.hw.alloc_dma(HDR_LEN, 64).unwrap();
        let buf = self.hw.alloc_dma(payload.len() as u64 + offset + 1, 64).unwrap();
        self.hw.mem().write(buf + offset, payload).unwrap();
        self.dev
            .queues()
            .tx
            .post(&[
                Segment::new(hdr, HDR_LEN),
                Segment::new(buf + offset, payload.len() as u64),
            ])
            .unwrap()
    }

    pub fn send(&self, payload: &[u8]) -> u16 {
        self.send_at(payload, 0)
    }

    pub fn post_receive(&self) -> u16 {
        self.post_receive_sized(RX_BUF_LEN)
    }

    pub fn post_receive_sized(&self, len: u64) -> u16 {
        let hdr = self.hw.alloc_dma(HDR_LEN, 64).unwrap();
        let buf = self.hw.alloc_dma(len, 64).unwrap();
        let head = self
            .dev
            .queues()
            .rx
            .post(&[Segment::new(hdr, HDR_LEN), Segment::new(buf, len)])
            .unwrap();
        self.rx_bufs.lock().unwrap().insert(head, buf);
        head
    }

    pub fn wait_sent(&self) -> UsedDescriptor {
        self.dev.queues().tx.wait_used(WAIT).unwrap()
    }

    pub fn wait_received(&self) -> UsedDescriptor {
        self.dev.queues().rx.wait_used(WAIT).unwrap()
    }

    /// Payload delivered into the receive buffer of `used`.
    pub fn payload(&self, used: UsedDescriptor) -> Vec<u8> {
        assert!(used.len as u64 >= HDR_LEN, "no payload in {used:?}");
        let buf = self.rx_bufs.lock().unwrap()[&used.head];
        let len = (used.len as u64 - HDR_LEN) as usize;
        received_payload(&self.hw.mem(), buf, len, self.offset_rxbuf).unwrap()
    }
}

pub struct Link {
    // owns the copy engines and the shared arena
    pub sim: SimLink,
    pub a: Side,
    pub b: Side,
}

impl Link {
    pub fn new(sim_cfg: SimLinkConfig, cfg: TransportConfiguration) -> Self {
        let offset_rxbuf = sim_cfg.offset_rxbuf;
        let sim = SimLink::new(sim_cfg).unwrap();
        let (ha, hb) = sim.endpoints();
        Link {
            a: Side::new(ha, cfg, offset_rxbuf),
            b: Side::new(hb, cfg, offset_rxbuf),
            sim,
        }
    }

    pub fn start(&self) {
        start_pair(&self.a.dev, &self.b.dev);
    }

    pub fn stop(&self) {
        self.a.dev.stop().unwrap();
        self.b.dev.stop().unwrap();
    }
}

/// Both devices wait for each other during start, so start them together.
pub fn start_pair<A: HardwareOps, B: HardwareOps>(a: &VopDevice<A>, b: &VopDevice<B>) {
    std::thread::scope(|s| {
        let a = s.spawn(|| a.start());
        b.start().unwrap();
        a.join().unwrap().unwrap();
    });
}

pub fn started(sim_cfg: SimLinkConfig) -> Link {
    let link = Link::new(sim_cfg, test_config());
    link.start();
    link
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
