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

//! Rate limited heads-up signals and the waits built on them.
//!
//! A line remembers when it last sent and last received. Senders skip the
//! signal if one went out less than `T1` ago. Waiters trust a signal received
//! less than `T2 = 2 * T1` ago and busy poll; otherwise they block for a
//! bounded slice and nudge the peer again when the slice runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::error::VopError;
use crate::hal::{HardwareOps, SignalKind};
use crate::log_once::{LogOnce, warn_once};
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::Result;

/// One heads-up line (`Available` or `Used`) of a device.
#[derive(Debug)]
pub struct HeadsUpLine {
    kind: SignalKind,
    epoch: Instant,
    // microseconds since `epoch` plus one; zero means never
    sent_us: AtomicU64,
    rcv_us: AtomicU64,
    generation: Mutex<u64>,
    cv: Condvar,
    interval: Duration,
    slice: Duration,
    missed: LogOnce,
}

impl HeadsUpLine {
    pub fn new(kind: SignalKind, interval: Duration, slice: Duration) -> Self {
        Self {
            kind,
            epoch: Instant::now(),
            sent_us: AtomicU64::new(0),
            rcv_us: AtomicU64::new(0),
            generation: Mutex::new(0),
            cv: Condvar::new(),
            interval,
            slice,
            missed: LogOnce::new(),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// How long a received signal stays valid.
    pub fn validity(&self) -> Duration {
        self.interval * 2
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64 + 1
    }

    fn within(&self, stamp: u64, window: Duration) -> bool {
        stamp != 0 && self.now_us().saturating_sub(stamp) < window.as_micros() as u64
    }

    /// Signal the peer unless this line sent less than `T1` ago.
    ///
    /// Returns whether a signal went out.
    pub fn send<H: HardwareOps>(&self, hw: &H) -> Result<bool> {
        let last = self.sent_us.load(Ordering::Acquire);
        if self.within(last, self.interval) {
            return Ok(false);
        }
        let now = self.now_us();
        if self
            .sent_us
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // a concurrent sender won
            return Ok(false);
        }
        hw.raise_peer(self.kind)?;
        Ok(true)
    }

    pub fn force_send<H: HardwareOps>(&self, hw: &H) -> Result<()> {
        self.sent_us.store(self.now_us(), Ordering::Release);
        hw.raise_peer(self.kind)
    }

    /// Signal callback body. The caller acknowledges the line first.
    pub fn on_signal(&self) {
        self.rcv_us.store(self.now_us(), Ordering::Release);
        self.bump();
    }

    /// Wake every waiter so it rechecks its condition and the running flag.
    pub fn wake_all(&self) {
        self.bump();
    }

    fn bump(&self) {
        match self.generation.lock() {
            Ok(mut g) => *g = g.wrapping_add(1),
            Err(e) => tracing::error!("{} line lock poisoned: {e}", self.kind.as_str()),
        }
        self.cv.notify_all();
    }

    pub fn received_recently(&self) -> bool {
        self.within(self.rcv_us.load(Ordering::Acquire), self.validity())
    }

    /// Wait until `cond` holds.
    ///
    /// # Errors
    ///
    /// - [`VopError::Stopped`] - `running` turned false
    /// - any error returned by `cond`
    pub fn wait_for<H: HardwareOps>(
        &self,
        hw: &H,
        mut cond: impl FnMut() -> Result<bool>,
        running: &dyn Fn() -> bool,
    ) -> Result<()> {
        let mut rng = rand::rng();
        loop {
            if !running() {
                return Err(VopError::Stopped);
            }
            if cond()? {
                return Ok(());
            }
            if self.received_recently() {
                thread::sleep(Duration::from_micros(rng.random_range(5..=10)));
                continue;
            }

            let guard = self.generation.lock()?;
            let seen = *guard;
            // a signal may have landed between the check and the lock
            if cond()? {
                return Ok(());
            }
            let (guard, res) = self
                .cv
                .wait_timeout_while(guard, self.slice, |g| *g == seen && running())?;
            drop(guard);

            if res.timed_out() || self.kind == SignalKind::Used {
                if let Err(e) = self.force_send(hw) {
                    debug!("re-sending {} heads-up failed: {e}", self.kind.as_str());
                }
            }
            if res.timed_out() && running() && cond()? {
                warn_once!(
                    self.missed,
                    "missed {} heads-up, condition held after waiting {:?}",
                    self.kind.as_str(),
                    self.slice
                );
                CounterMetric::missed_heads_up(self.kind.as_str()).emit();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::hal::sim::{SimEndpoint, SimLink, SimLinkConfig};

    fn link_with_counter(kind: SignalKind) -> (SimLink, Arc<SimEndpoint>, Arc<AtomicUsize>) {
        let link = SimLink::new(SimLinkConfig::default()).unwrap();
        let (a, b) = link.endpoints();
        let hits = Arc::new(AtomicUsize::new(0));
        let line = b.allocate_signal_line(kind).unwrap();
        let h = hits.clone();
        let weak = Arc::downgrade(&b);
        b.request_notification(line, Arc::new(move || {
            if let Some(b) = weak.upgrade() {
                b.acknowledge(line);
            }
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        (link, a, hits)
    }

    #[test]
    fn sends_are_rate_limited() {
        let (_link, a, hits) = link_with_counter(SignalKind::Available);
        let line = HeadsUpLine::new(
            SignalKind::Available,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(line.send(&*a).unwrap());
        assert!(!line.send(&*a).unwrap());
        line.force_send(&*a).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        thread::sleep(Duration::from_millis(60));
        assert!(line.send(&*a).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn received_signal_is_valid_for_twice_the_interval() {
        let line = HeadsUpLine::new(
            SignalKind::Used,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        assert!(!line.received_recently());
        line.on_signal();
        assert!(line.received_recently());
        thread::sleep(Duration::from_millis(25));
        assert!(!line.received_recently());
    }

    #[test]
    fn waiter_wakes_on_signal() {
        let (_link, a, _) = link_with_counter(SignalKind::Available);
        let line = Arc::new(HeadsUpLine::new(
            SignalKind::Available,
            Duration::from_millis(1),
            Duration::from_secs(10),
        ));
        let flag = Arc::new(AtomicBool::new(false));
        let signaller = {
            let (line, flag) = (line.clone(), flag.clone());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
                line.on_signal();
            })
        };
        let start = Instant::now();
        line.wait_for(&*a, || Ok(flag.load(Ordering::SeqCst)), &|| true)
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        signaller.join().unwrap();
    }

    #[test]
    fn lost_signal_is_caught_after_one_slice() {
        let (_link, a, hits) = link_with_counter(SignalKind::Available);
        let line = HeadsUpLine::new(
            SignalKind::Available,
            Duration::from_millis(1),
            Duration::from_millis(20),
        );
        let start = Instant::now();
        let deadline = start + Duration::from_millis(5);
        line.wait_for(&*a, || Ok(Instant::now() >= deadline), &|| true)
            .unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_secs(5));
        // the timed out wait nudged the peer
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stop_interrupts_the_wait() {
        let (_link, a, _) = link_with_counter(SignalKind::Used);
        let line = Arc::new(HeadsUpLine::new(
            SignalKind::Used,
            Duration::from_millis(1),
            Duration::from_secs(10),
        ));
        let running = Arc::new(AtomicBool::new(true));
        let stopper = {
            let (line, running) = (line.clone(), running.clone());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                running.store(false, Ordering::SeqCst);
                line.wake_all();
            })
        };
        let res = line.wait_for(&*a, || Ok(false), &|| running.load(Ordering::SeqCst));
        assert!(matches!(res, Err(VopError::Stopped)));
        stopper.join().unwrap();
    }
}
