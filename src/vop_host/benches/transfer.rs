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

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use vop_host::hal::sim::{SimEndpoint, SimLink, SimLinkConfig};
use vop_host::queue::Segment;
use vop_host::{HardwareOps, TransportConfiguration, VopDevice};

const HDR_LEN: u64 = 12;
const RX_LEN: u64 = 16 * 1024;
const WAIT: Duration = Duration::from_secs(10);

struct Bench {
    _link: SimLink,
    a: VopDevice<SimEndpoint>,
    b: VopDevice<SimEndpoint>,
    tx: [Segment; 2],
    rx: [Segment; 2],
}

fn setup(sim: SimLinkConfig, payload: u64) -> Bench {
    let mut cfg = TransportConfiguration::default();
    cfg.set_heads_up_interval(Duration::from_millis(1));
    cfg.set_heads_up_wait_slice(Duration::from_millis(10));

    let link = SimLink::new(sim).unwrap();
    let (ha, hb) = link.endpoints();
    let device = |hw: &Arc<SimEndpoint>| {
        hw.set_driver_ok(true);
        VopDevice::new(hw.clone(), cfg)
    };
    let (a, b) = (device(&ha), device(&hb));
    std::thread::scope(|s| {
        let started = s.spawn(|| a.start());
        b.start().unwrap();
        started.join().unwrap().unwrap();
    });

    let buf = |hw: &Arc<SimEndpoint>, len: u64| hw.alloc_dma(len, 64).unwrap();
    let tx = [
        Segment::new(buf(&ha, HDR_LEN), HDR_LEN),
        Segment::new(buf(&ha, payload), payload),
    ];
    let rx = [
        Segment::new(buf(&hb, HDR_LEN), HDR_LEN),
        Segment::new(buf(&hb, RX_LEN), RX_LEN),
    ];
    Bench {
        _link: link,
        a,
        b,
        tx,
        rx,
    }
}

impl Bench {
    fn round_trip(&self) {
        self.b.queues().rx.post(&self.rx).unwrap();
        self.a.queues().tx.post(&self.tx).unwrap();
        black_box(self.a.queues().tx.wait_used(WAIT).unwrap());
        black_box(self.b.queues().rx.wait_used(WAIT).unwrap());
    }
}

fn transfer_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer");
    let modes = [
        ("inline", SimLinkConfig::default()),
        (
            "deferred",
            SimLinkConfig {
                offset_rxbuf: false,
                ..Default::default()
            },
        ),
        (
            "sync",
            SimLinkConfig {
                copy_channel: false,
                ..Default::default()
            },
        ),
    ];

    for (mode, sim) in modes {
        for payload in [64u64, 1500, 9000] {
            group.throughput(Throughput::Bytes(payload));
            let bench = setup(sim, payload);
            group.bench_with_input(BenchmarkId::new(mode, payload), &payload, |b, _| {
                b.iter(|| bench.round_trip());
            });
        }
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = transfer_benchmark
}
criterion_main!(benches);
