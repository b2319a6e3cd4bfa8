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

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use tracing::{Span, debug, error, info, instrument, warn};
use vop_common::PAGE_SIZE;
use vop_common::kvec::{CancelStatus, KvecBufLayout, KvecError, MemOps};

use crate::config::TransportConfiguration;
use crate::copy::{CompletionMode, STAGING_BUFFER_SIZE};
use crate::error::VopError;
use crate::exchange::KvecExchange;
use crate::hal::{
    FEATURE_OFFSET_RXBUF, HardwareOps, LineId, RemoteMapper, SignalCallback, SignalKind, page_align,
    poll_until,
};
use crate::heads_up::HeadsUpLine;
use crate::log_once::LogOnce;
use crate::pipeline::Session;
use crate::pool::{StagingBuffer, TransferPool};
use crate::queue::QueuePair;
use crate::{Result, new_error};

const CONTROL_CHANNEL_DEPTH: usize = 64;
/// How long stop waits for an in-progress publish before unmapping.
const UPDATE_DRAIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lifecycle state of a [`VopDevice`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl From<u8> for DeviceState {
    fn from(v: u8) -> Self {
        match v {
            1 => DeviceState::Starting,
            2 => DeviceState::Running,
            _ => DeviceState::Stopped,
        }
    }
}

/// Work handed from signal callbacks and queue kicks to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMsg {
    Publish,
    ConfigChange,
    Stop,
}

/// Buffers and lines owned by a started device.
#[derive(Default)]
struct Resources {
    local: Option<(u64, u64)>,
    remote: Option<u64>,
    staging: Vec<StagingBuffer>,
    lines: Vec<LineId>,
}

impl Resources {
    /// Best effort; every failure is logged.
    fn release<H: HardwareOps>(&mut self, hw: &H, mapper: Option<&RemoteMapper>) {
        for line in self.lines.drain(..) {
            hw.free_notification(line);
        }
        hw.publish_kvec_buffer(None);
        if let Some(remote) = self.remote.take() {
            let res = match mapper {
                Some(m) => m.unmap(hw, remote),
                None => hw.unmap(remote),
            };
            if let Err(e) = res {
                error!("unmapping the peer kvec buffer: {e}");
            }
        }
        for buf in self.staging.drain(..) {
            if let Err(e) = hw.free_dma(buf.addr, buf.len) {
                error!("freeing staging buffer {:#x}: {e}", buf.addr);
            }
        }
        if let Some((addr, len)) = self.local.take()
            && let Err(e) = hw.free_dma(addr, len)
        {
            error!("freeing the local kvec buffer: {e}");
        }
    }
}

struct Running<H: HardwareOps> {
    session: Arc<Session<H>>,
    control: Sender<ControlMsg>,
    threads: Vec<JoinHandle<()>>,
    resources: Resources,
}

/// One end of a VOP link.
///
/// Sends what the local driver posts on the transmit queue into receive
/// buffers the peer published, and publishes the buffers posted on the
/// receive queue to the peer.
pub struct VopDevice<H: HardwareOps> {
    hw: Arc<H>,
    config: TransportConfiguration,
    state: AtomicU8,
    queues: Arc<QueuePair>,
    running: Mutex<Option<Running<H>>>,
}

impl<H: HardwareOps> VopDevice<H> {
    pub fn new(hw: Arc<H>, config: TransportConfiguration) -> Self {
        let queues = Arc::new(QueuePair::new(
            config.get_queue_capacity(),
            config.get_used_notify_threshold() as usize,
        ));
        Self {
            hw,
            config,
            state: AtomicU8::new(DeviceState::Stopped as u8),
            queues,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from(self.state.load(Ordering::Acquire))
    }

    pub fn queues(&self) -> &Arc<QueuePair> {
        &self.queues
    }

    pub fn hw(&self) -> &Arc<H> {
        &self.hw
    }

    pub fn config(&self) -> &TransportConfiguration {
        &self.config
    }

    /// Copy strategy picked at start, `None` while stopped.
    pub fn mode(&self) -> Option<CompletionMode> {
        self.session().ok().map(|s| s.mode)
    }

    /// Whether received payloads carry an offset prefix, `None` while stopped.
    pub fn alignment(&self) -> Option<bool> {
        self.session().ok().map(|s| s.alignment)
    }

    fn session(&self) -> Result<Arc<Session<H>>> {
        self.running
            .lock()?
            .as_ref()
            .map(|r| r.session.clone())
            .ok_or(VopError::Stopped)
    }

    /// Bring the device from `Stopped` to `Running`.
    ///
    /// Waits for both drivers, exchanges kvec buffers with the peer and
    /// starts the worker loops.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(
                DeviceState::Stopped as u8,
                DeviceState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|s| VopError::InvalidState(format!("start while {:?}", DeviceState::from(s))))?;

        match self.bring_up() {
            Ok(running) => {
                let control = running.control.clone();
                *self.running.lock()? = Some(running);
                self.state.store(DeviceState::Running as u8, Ordering::Release);
                // receive buffers posted while stopped
                send_control(&control, ControlMsg::Publish);
                info!("device running");
                Ok(())
            }
            Err(e) => {
                self.state.store(DeviceState::Stopped as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> Result<Running<H>> {
        let hw = &*self.hw;
        let cfg = &self.config;
        poll_until(cfg.get_start_timeout(), || hw.driver_ok() && hw.peer_driver_ok())?;

        let mut res = Resources::default();
        let mapper = RemoteMapper::new(cfg.get_remap_timeout(), cfg.get_map_attempts());
        match self.build_session(&mut res, mapper) {
            Ok(running) => Ok(running),
            Err(e) => {
                error!("device start failed: {e}");
                res.release(hw, None);
                Err(e)
            }
        }
    }

    fn build_session(&self, res: &mut Resources, mapper: RemoteMapper) -> Result<Running<H>> {
        let hw = &self.hw;
        let cfg = &self.config;
        let mem = hw.mem();
        let entries = cfg.get_ring_entries();
        let size = page_align(KvecBufLayout::query_size(entries as usize) as u64)?;

        let local = hw.alloc_dma(size, PAGE_SIZE as u64)?;
        res.local = Some((local, size));
        mem.write(local, &vec![0u8; size as usize])?;
        let local_layout = unsafe { KvecBufLayout::from_base(local, entries) }
            .map_err(|e| new_error!("local kvec buffer: {e}"))?;

        hw.publish_kvec_buffer(Some(local));
        let mut peer = None;
        poll_until(cfg.get_start_timeout(), || {
            peer = hw.peer_kvec_buffer();
            peer.is_some()
        })?;
        let peer = peer.ok_or_else(|| new_error!("peer kvec buffer vanished"))?;
        let remote = mapper.map(&**hw, peer, size, &|| true)?;
        res.remote = Some(remote);
        let remote_layout = unsafe { KvecBufLayout::from_base(remote, entries) }
            .map_err(|e| new_error!("peer kvec buffer: {e}"))?;

        let alignment = hw.peer_features() & (1 << FEATURE_OFFSET_RXBUF) != 0;
        let mode = CompletionMode::select(hw.has_copy_channel(), cfg.get_force_sync_copy(), alignment);
        info!("copy mode {}, offset prefix {alignment}", mode.as_str());

        if mode == CompletionMode::Deferred {
            for _ in 0..cfg.get_pool_size() {
                let addr = hw.alloc_dma(STAGING_BUFFER_SIZE, PAGE_SIZE as u64)?;
                res.staging.push(StagingBuffer {
                    addr,
                    len: STAGING_BUFFER_SIZE,
                });
            }
        }
        let pool = TransferPool::new(cfg.get_pool_size(), cfg.get_acquire_timeout(), &res.staging)?;
        let exchange = KvecExchange::new(mem.clone(), local_layout, remote_layout, cfg.get_index_update_period())?;

        let config_line = hw.allocate_signal_line(SignalKind::ConfigChange)?;
        res.lines.push(config_line);
        let available_line = hw.allocate_signal_line(SignalKind::Available)?;
        res.lines.push(available_line);
        let used_line = hw.allocate_signal_line(SignalKind::Used)?;
        res.lines.push(used_line);

        let interval = cfg.get_heads_up_interval();
        let slice = cfg.get_heads_up_wait_slice();
        let session = Arc::new(Session {
            hw: hw.clone(),
            mem,
            config: *cfg,
            queues: self.queues.clone(),
            exchange,
            pool,
            mapper,
            available: HeadsUpLine::new(SignalKind::Available, interval, slice),
            used: HeadsUpLine::new(SignalKind::Used, interval, slice),
            mode,
            alignment,
            running: AtomicBool::new(true),
            fetch_done: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            publishing: Mutex::new(()),
            sequence: unbounded(),
            submit_failed: LogOnce::new(),
            completion_failed: LogOnce::new(),
        });

        let (control, control_rx) = bounded(CONTROL_CHANNEL_DEPTH);
        let weak = Arc::downgrade(&session);
        {
            let (weak, control) = (weak.clone(), control.clone());
            hw.request_notification(
                config_line,
                Arc::new(move || {
                    if let Some(s) = weak.upgrade() {
                        s.hw.acknowledge(config_line);
                    }
                    send_control(&control, ControlMsg::ConfigChange);
                }),
            )?;
        }
        hw.request_notification(
            available_line,
            line_callback(weak.clone(), available_line, SignalKind::Available),
        )?;
        hw.request_notification(used_line, line_callback(weak, used_line, SignalKind::Used))?;

        {
            let control = control.clone();
            self.queues
                .rx
                .set_kick(Some(Arc::new(move || send_control(&control, ControlMsg::Publish))))?;
        }
        self.queues.resume()?;

        let mut threads = Vec::new();
        let spawned = (|| -> Result<()> {
            let s = session.clone();
            threads.push(spawn("vop-fetch", move || s.fetch_loop())?);
            if mode == CompletionMode::Deferred {
                let s = session.clone();
                threads.push(spawn("vop-sequencer", move || s.sequencer_loop())?);
            }
            let s = session.clone();
            threads.push(spawn("vop-used", move || s.used_loop())?);
            let s = session.clone();
            threads.push(spawn("vop-control", move || s.control_loop(control_rx))?);
            Ok(())
        })();

        let running = Running {
            session,
            control,
            threads,
            resources: std::mem::take(res),
        };
        if let Err(e) = spawned {
            self.tear_down(running);
            return Err(e);
        }
        Ok(running)
    }

    /// Bring the device to `Stopped`. Stopping a stopped device does nothing.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn stop(&self) -> Result<()> {
        let running = self.running.lock()?.take();
        let Some(running) = running else {
            debug!("stop on a stopped device");
            return Ok(());
        };
        self.state.store(DeviceState::Stopped as u8, Ordering::Release);
        self.tear_down(running);
        info!("device stopped");
        Ok(())
    }

    fn tear_down(&self, mut running: Running<H>) {
        let session = running.session;
        session.running.store(false, Ordering::Release);
        if let Err(e) = self.queues.rx.set_kick(None) {
            warn!("clearing the receive kick: {e}");
        }
        self.queues.stop();
        session.wake_all();
        send_control(&running.control, ControlMsg::Stop);

        for t in running.threads.drain(..) {
            let name = t.thread().name().unwrap_or("worker").to_string();
            if t.join().is_err() {
                error!("{name} panicked");
            }
        }

        if let Err(e) = session.pool.wait_all_ready(session.config.get_acquire_timeout()) {
            error!("stopping with busy transfer items: {e}");
        }
        for head in self.queues.rx.acquired_heads() {
            if let Err(e) = self.queues.rx.release(head, 0) {
                warn!("returning receive head {head}: {e}");
            }
        }

        if poll_until(UPDATE_DRAIN_TIMEOUT, || !session.updating.load(Ordering::Acquire)).is_err() {
            error!("publish still in progress after {UPDATE_DRAIN_TIMEOUT:?}, unmapping anyway");
        }
        running.resources.release(&*self.hw, Some(&session.mapper));
    }

    /// React to an external pause request, such as a peer crash, by stopping.
    pub fn pause(&self) -> Result<()> {
        self.stop()
    }

    /// Stop, then start again with fresh buffers.
    pub fn reset(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Cancel the receive buffer `head` published to the peer.
    ///
    /// On [`CancelStatus::Ok`] for a buffer the peer never wrote, the head is
    /// returned on the receive queue with zero bytes.
    pub fn cancel_receive(&self, head: u16) -> Result<CancelStatus> {
        let session = self.session()?;
        let hw = self.hw.clone();
        let status = session.exchange.request_cancel(head, self.config.get_cancel_timeout(), || {
            hw.raise_peer(SignalKind::ConfigChange)
        })?;
        if status == CancelStatus::Ok {
            session.drain_used()?;
            if session.exchange.forget_cancelled(head)? {
                self.queues.rx.release(head, 0)?;
            }
        }
        Ok(status)
    }
}

impl<H: HardwareOps> Drop for VopDevice<H> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("stopping device on drop: {e}");
        }
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

fn send_control(control: &Sender<ControlMsg>, msg: ControlMsg) {
    match control.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(ControlMsg::ConfigChange)) => {
            // a peer cancel request goes unanswered and times out on its side
            warn!("control channel full, dropping {:?}", ControlMsg::ConfigChange)
        }
        Err(TrySendError::Full(_)) => debug!("control channel full, dropping {msg:?}"),
        Err(TrySendError::Disconnected(_)) => debug!("control loop gone, dropping {msg:?}"),
    }
}

fn line_callback<H: HardwareOps>(
    session: Weak<Session<H>>,
    line: LineId,
    kind: SignalKind,
) -> SignalCallback {
    Arc::new(move || {
        if let Some(s) = session.upgrade() {
            s.hw.acknowledge(line);
            if let Some(heads_up) = s.heads_up(kind) {
                heads_up.on_signal();
            }
        }
    })
}

impl<H: HardwareOps> Session<H> {
    fn fetch_loop(self: Arc<Self>) {
        let timeout = self.config.get_acquire_timeout();
        while self.running() {
            let desc = match self.queues.tx.acquire(timeout) {
                Ok(desc) => desc,
                Err(VopError::Timeout(_)) => continue,
                Err(VopError::Stopped) => break,
                Err(e) => {
                    error!("fetching from the transmit queue: {e}");
                    break;
                }
            };
            let id = match self.pool.acquire(&|| self.running()) {
                Ok(id) => id,
                Err(e) => {
                    debug!("no transfer item for head {}: {e}", desc.head);
                    if let Err(e) = self.queues.tx.release(desc.head, 0) {
                        error!("returning head {}: {e}", desc.head);
                    }
                    continue;
                }
            };
            self.run_transfer(id, desc);
        }
        self.fetch_done.store(true, Ordering::Release);
        debug!("fetch loop done");
    }

    /// Finish deferred items in submission order.
    ///
    /// Once the device stops, copies already submitted get up to the acquire
    /// timeout to complete before their items are finished as failed.
    fn sequencer_loop(self: Arc<Self>) {
        let drain = self.config.get_acquire_timeout();
        let poll = drain.min(Duration::from_millis(100));
        let deadline: Cell<Option<Instant>> = Cell::new(None);
        let keep_waiting = || {
            if self.running() {
                return true;
            }
            let d = match deadline.get() {
                Some(d) => d,
                None => {
                    let d = Instant::now() + drain;
                    deadline.set(Some(d));
                    d
                }
            };
            Instant::now() < d
        };

        loop {
            match self.sequence.1.recv_timeout(poll) {
                Ok(id) => self.finish_deferred(id, &keep_waiting),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // nothing is pushed once the fetch loop is done
            if !self.running() && self.fetch_done.load(Ordering::Acquire) && self.sequence.1.is_empty() {
                break;
            }
        }
        debug!("sequencer loop done");
    }

    fn used_loop(self: Arc<Self>) {
        while self.running() {
            let res = self.used.wait_for(
                &*self.hw,
                || self.exchange.has_used_pending(),
                &|| self.running(),
            );
            match res {
                Ok(()) => {}
                Err(VopError::Stopped) => break,
                Err(e) => {
                    warn!("waiting for used records: {e}");
                    continue;
                }
            }
            if let Err(e) = self.drain_used() {
                warn!("draining used records: {e}");
            }
            self.publish_receive_buffers();
        }
        debug!("used loop done");
    }

    fn control_loop(self: Arc<Self>, control: Receiver<ControlMsg>) {
        let slice = self.config.get_heads_up_wait_slice();
        loop {
            match control.recv_timeout(slice) {
                Ok(ControlMsg::Publish) => self.publish_receive_buffers(),
                Ok(ControlMsg::ConfigChange) => {
                    if let Err(e) = self.exchange.service_cancel(self.config.get_cancel_timeout()) {
                        warn!("answering a cancel request: {e}");
                    }
                }
                Ok(ControlMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) if !self.running() => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!("control loop done");
    }

    /// Hand used records from the peer back to the receive queue.
    pub(crate) fn drain_used(&self) -> Result<usize> {
        self.exchange.drain_used(|rec| {
            if let Err(e) = self.queues.rx.release(rec.head, rec.len) {
                warn!("used record for head {}: {e}", rec.head);
            }
        })
    }

    /// Publish every receive descriptor the driver posted.
    fn publish_receive_buffers(&self) {
        if !self.running() {
            debug!("not publishing, device is stopping");
            return;
        }
        let _serial = match self.publishing.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("publish lock poisoned: {e}");
                return;
            }
        };
        self.updating.store(true, Ordering::Release);

        let mut published = 0usize;
        while self.running() {
            let Some(desc) = self.queues.rx.try_acquire_if(|d| self.exchange.can_publish(d)) else {
                break;
            };
            match self.exchange.publish(&desc) {
                Ok(outcome) => {
                    published += 1;
                    if outcome.flushed && let Err(e) = self.available.send(&*self.hw) {
                        debug!("available heads-up: {e}");
                    }
                }
                Err(e) => {
                    match e {
                        VopError::Kvec(KvecError::BadChain(_) | KvecError::TooSmall(_)) => {
                            warn!("rejecting receive head {}: {e}", desc.head)
                        }
                        _ => error!("publishing receive head {}: {e}", desc.head),
                    }
                    if let Err(e) = self.queues.rx.release(desc.head, 0) {
                        error!("returning receive head {}: {e}", desc.head);
                    }
                }
            }
        }

        if published > 0 {
            match self.exchange.flush() {
                Ok(_) => {
                    if let Err(e) = self.available.send(&*self.hw) {
                        debug!("available heads-up: {e}");
                    }
                }
                Err(e) => error!("flushing producer counters: {e}"),
            }
        }
        self.updating.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;
    use log::Level;
    use vop_testing::simplelogger::{LOGGER, SimpleLogger};

    use super::{ControlMsg, send_control};

    #[test]
    fn dropped_config_change_is_a_warning() {
        SimpleLogger::initialize_test_logger();
        let (tx, _rx) = bounded(1);
        send_control(&tx, ControlMsg::Publish);
        send_control(&tx, ControlMsg::Publish);
        send_control(&tx, ControlMsg::ConfigChange);

        LOGGER.test_log_records(|calls| {
            let dropped: Vec<Level> = calls
                .iter()
                .filter(|c| c.args.starts_with("control channel full"))
                .map(|c| c.level)
                .collect();
            assert_eq!(dropped, vec![Level::Debug, Level::Warn], "{calls:#?}");
        });
    }
}
