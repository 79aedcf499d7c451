//! # Engine
//!
//! The top-level orchestrator: owns the clock-domain registry, the
//! stream registry, and the cooperating tasks (transmit sequencer,
//! receive dispatch, clock controller) that drive them. A consumer
//! talks to one [`Engine`]; everything else is reached through the
//! [`StreamId`]s it hands back from `create_*`.

use crate::avtp::{self, AudioPacket, CrfCompatibility, CrfPacket};
use crate::clock::ClockDomain;
use crate::clock::controller::{ClockController, ClockDriver};
use crate::error::{AvbError, Result};
use crate::ptp::PtpProxy;
use crate::stream::audio::{AudioStream, CompatibilityMode};
use crate::stream::crf::{ClockMultiplier, ClockReferenceStream, CrfStreamType};
use crate::stream::Direction;
use crate::tspec::{StreamId, TSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

const MASTER_TIME_WATCHDOG: std::time::Duration = std::time::Duration::from_secs(2);
const RECEIVE_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

/// A raw Ethernet frame crossing the NIC boundary, VLAN tag included.
pub type Frame = Vec<u8>;

/// The hardware-attach boundary the original reaches through a
/// NIC-specific attach/detach sequence (out of scope per the interface
/// list this crate was distilled from); a consumer supplies a real
/// implementation, tests use an in-memory loopback.
#[async_trait]
pub trait NicTransport: Send + Sync {
    /// Sends one already-framed packet.
    async fn send(&self, frame: Frame) -> Result<()>;
    /// Waits for the next inbound frame, or `None` if the transport was
    /// closed.
    async fn recv(&self) -> Option<Frame>;
}

/// An in-process transport that loops transmitted frames back to its
/// own receive side, for tests and for a transmit-only/receive-only
/// engine sharing one process.
pub struct LoopbackTransport {
    queue: tokio::sync::Mutex<std::collections::VecDeque<Frame>>,
    notify: Notify,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// An empty loopback transport with no frames queued.
    pub fn new() -> Self {
        Self {
            queue: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Closes the transport; pending and future `recv` calls return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NicTransport for LoopbackTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.queue.lock().await.push_back(frame);
        self.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.queue.lock().await.pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Process-global handles every stream and clock domain is constructed
/// against, built once at [`Engine::new`] and shared by `Arc`. Narrower
/// than the original's environment singleton (no DLT contexts, no
/// dynamic plugin loader): just the two external collaborators this
/// crate actually models as traits.
pub struct Environment {
    /// The gPTP time source every clock domain and stream reads through.
    pub ptp: Arc<dyn PtpProxy>,
    /// The NIC (or loopback) frames are sent on and received from.
    pub transport: Arc<dyn NicTransport>,
}

impl Environment {
    /// Builds an environment from its two external collaborators.
    pub fn new(ptp: Arc<dyn PtpProxy>, transport: Arc<dyn NicTransport>) -> Self {
        Self { ptp, transport }
    }
}

/// Either concrete stream kind, stored in one registry keyed by
/// [`StreamId`] since both share the same lifecycle surface
/// (`base`/`base_mut`, `write_to_avb_packet`, `read_from_avb_packet`)
/// but differ in packet type.
pub enum StreamObject {
    /// A SAF16 audio stream, transmit or receive.
    Audio(AudioStream),
    /// A clock-reference stream, transmit or receive.
    ClockReference(ClockReferenceStream),
}

impl StreamObject {
    fn set_active(&mut self, active: bool) -> Result<()> {
        match self {
            StreamObject::Audio(s) => s.base_mut().set_active(active),
            StreamObject::ClockReference(s) => s.base_mut().set_active(active),
        }
    }

    fn direction(&self) -> Direction {
        match self {
            StreamObject::Audio(s) => s.base().direction(),
            StreamObject::ClockReference(s) => s.base().direction(),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            StreamObject::Audio(s) => s.base().is_active(),
            StreamObject::ClockReference(s) => s.base().is_active(),
        }
    }

    fn write_to_avb_packet(&mut self, next_window_start: u64, ptp: &dyn PtpProxy) -> Result<(u64, Frame)> {
        match self {
            StreamObject::Audio(s) => {
                let launch = s.write_to_avb_packet(next_window_start, ptp)?;
                let frame = s.last_packet_bytes().map(|b| b.to_vec()).unwrap_or_default();
                Ok((launch, frame))
            }
            StreamObject::ClockReference(s) => {
                let launch = s.write_to_avb_packet(next_window_start, ptp)?;
                let frame = s.last_packet_bytes().map(|b| b.to_vec()).unwrap_or_default();
                Ok((launch, frame))
            }
        }
    }
}

struct Shared {
    env: Arc<Environment>,
    streams: RwLock<HashMap<StreamId, StreamObject>>,
    clock_domains: RwLock<HashMap<u32, Arc<Mutex<ClockDomain>>>>,
    next_clock_domain_id: std::sync::atomic::AtomicU32,
    end_flag: AtomicBool,
    notify: Notify,
}

/// The top-level orchestrator. Owns the clock-domain and stream
/// registries, the NIC transport handle, and the background tasks that
/// drive transmit scheduling and receive dispatch.
pub struct Engine {
    shared: Arc<Shared>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    controllers: std::sync::Mutex<Vec<ClockController>>,
}

impl Engine {
    /// Builds an engine around `env` and spawns its receive-dispatch and
    /// transmit-sequencer tasks. No streams or clock domains exist yet;
    /// add them with `create_clock_domain`/`create_*_stream`.
    pub fn new(env: Environment) -> Self {
        let shared = Arc::new(Shared {
            env: Arc::new(env),
            streams: RwLock::new(HashMap::new()),
            clock_domains: RwLock::new(HashMap::new()),
            next_clock_domain_id: std::sync::atomic::AtomicU32::new(1),
            end_flag: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let rx = shared.clone();
        let rx_task = tokio::task::spawn(async move { receive_loop(rx).await });
        let tx = shared.clone();
        let tx_task = tokio::task::spawn(async move { transmit_loop(tx).await });

        Self {
            shared,
            tasks: std::sync::Mutex::new(vec![rx_task, tx_task]),
            controllers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registers `domain`, assigning it the next free id, and returns
    /// the id a stream's `clock_domain` field should use to look it up
    /// again via `clock_domain_handle`.
    pub async fn create_clock_domain(&self, mut domain: ClockDomain) -> u32 {
        let id = self.shared.next_clock_domain_id.fetch_add(1, Ordering::SeqCst);
        domain.set_clock_domain_id(id);
        self.shared.clock_domains.write().await.insert(id, Arc::new(Mutex::new(domain)));
        id
    }

    /// A shared handle to a previously registered clock domain.
    pub async fn clock_domain_handle(&self, id: u32) -> Result<Arc<Mutex<ClockDomain>>> {
        self.shared
            .clock_domains
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AvbError::InvalidParam("unknown clock domain id"))
    }

    /// Starts a [`ClockController`] steering `slave` toward `master`
    /// through `driver`. The controller runs for the engine's lifetime;
    /// `shutdown` tears it down along with the dispatch tasks.
    pub async fn create_clock_controller(
        &self,
        master_id: u32,
        slave_id: u32,
        driver: Arc<dyn ClockDriver>,
        driver_param: u32,
    ) -> Result<()> {
        let master = self.clock_domain_handle(master_id).await?;
        let slave = self.clock_domain_handle(slave_id).await?;
        let controller = ClockController::init(master, slave, driver, driver_param, self.shared.env.ptp.clone())?;
        self.controllers.lock().unwrap().push(controller);
        Ok(())
    }

    /// Builds and registers a transmit [`AudioStream`] under `stream_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_transmit_audio_stream(
        &self,
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        channels: usize,
        sample_freq: u32,
        compat: CompatibilityMode,
        clock_domain_id: u32,
        pool_size: usize,
    ) -> Result<StreamId> {
        let clock_domain = self.clock_domain_handle(clock_domain_id).await?;
        let stream = AudioStream::init_transmit(
            tspec, stream_id, dest_mac, src_mac, channels, sample_freq, compat, clock_domain, pool_size,
        )?;
        self.insert_stream(stream_id, StreamObject::Audio(stream)).await
    }

    /// Builds and registers a receive [`AudioStream`] under `stream_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_receive_audio_stream(
        &self,
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        channels: usize,
        sample_freq: u32,
        compat: CompatibilityMode,
        clock_domain_id: u32,
    ) -> Result<StreamId> {
        let clock_domain = self.clock_domain_handle(clock_domain_id).await?;
        let stream = AudioStream::init_receive(tspec, stream_id, dest_mac, src_mac, channels, sample_freq, compat, clock_domain)?;
        self.insert_stream(stream_id, StreamObject::Audio(stream)).await
    }

    /// Builds and registers a transmit [`ClockReferenceStream`] under
    /// `stream_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_clock_reference_stream(
        &self,
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        compat: CrfCompatibility,
        crf_type: CrfStreamType,
        base_frequency: u32,
        pull: ClockMultiplier,
        timestamp_interval: u16,
        timestamps_per_pdu: u16,
        clock_domain_id: u32,
        pool_size: usize,
    ) -> Result<StreamId> {
        let clock_domain = self.clock_domain_handle(clock_domain_id).await?;
        let stream = ClockReferenceStream::init_transmit(
            tspec, stream_id, dest_mac, src_mac, compat, crf_type, base_frequency, pull, timestamp_interval,
            timestamps_per_pdu, clock_domain, pool_size,
        )?;
        self.insert_stream(stream_id, StreamObject::ClockReference(stream)).await
    }

    /// Registers a receive clock-reference stream (no packet pool,
    /// mirroring [`ClockReferenceStream::init_receive`]'s asymmetry with
    /// the transmit constructor).
    pub async fn create_receive_clock_reference_stream(
        &self,
        tspec: TSpec,
        stream_id: StreamId,
        dest_mac: [u8; 6],
        src_mac: [u8; 6],
        compat: CrfCompatibility,
        clock_domain_id: u32,
    ) -> Result<StreamId> {
        let clock_domain = self.clock_domain_handle(clock_domain_id).await?;
        let stream = ClockReferenceStream::init_receive(tspec, stream_id, dest_mac, src_mac, compat, clock_domain)?;
        self.insert_stream(stream_id, StreamObject::ClockReference(stream)).await
    }

    async fn insert_stream(&self, stream_id: StreamId, obj: StreamObject) -> Result<StreamId> {
        let mut streams = self.shared.streams.write().await;
        if streams.contains_key(&stream_id) {
            return Err(AvbError::AlreadyInUse);
        }
        streams.insert(stream_id, obj);
        Ok(stream_id)
    }

    /// A connect operation between a transmit stream's output and a
    /// receive stream's input has no meaning on a real NIC link (the
    /// two ends live on different stations); this exists for
    /// same-process loopback testing over a [`LoopbackTransport`], where
    /// it is a no-op beyond asserting both ids exist.
    pub async fn connect_streams(&self, tx: StreamId, rx: StreamId) -> Result<()> {
        let streams = self.shared.streams.read().await;
        let tx_stream = streams.get(&tx).ok_or(AvbError::InvalidParam("unknown transmit stream id"))?;
        let rx_stream = streams.get(&rx).ok_or(AvbError::InvalidParam("unknown receive stream id"))?;
        if tx_stream.direction() != Direction::Transmit || rx_stream.direction() != Direction::Receive {
            return Err(AvbError::InvalidParam("connect_streams needs a transmit id and a receive id"));
        }
        Ok(())
    }

    /// Activates or deactivates a previously created stream.
    pub async fn set_stream_active(&self, stream_id: StreamId, active: bool) -> Result<()> {
        let mut streams = self.shared.streams.write().await;
        let stream = streams.get_mut(&stream_id).ok_or(AvbError::InvalidParam("unknown stream id"))?;
        stream.set_active(active)?;
        if active {
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    /// Stops the dispatch tasks and every registered clock controller,
    /// and awaits their completion.
    pub async fn shutdown(&self) {
        self.shared.end_flag.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let mut controllers: Vec<_> = self.controllers.lock().unwrap().drain(..).collect();
        for controller in &mut controllers {
            controller.cleanup().await;
        }
    }
}

/// Transmit sequencer: wakes whenever a stream is (re)activated or its
/// own sleep elapses, and asks every active transmit stream for its
/// next packet. One task services both SR classes here rather than one
/// task per class (§5 names one task per class for a hardware NIC's per
/// class TX window; a trait-abstracted transport has no such window to
/// align with, so it is collapsed to a single cooperative loop).
async fn transmit_loop(shared: Arc<Shared>) {
    let mut last_window_start: u64 = 0;
    loop {
        if shared.end_flag.load(Ordering::SeqCst) {
            break;
        }

        let now = shared.env.ptp.get_local_time();
        let mut next_wake = now + MASTER_TIME_WATCHDOG.as_nanos() as u64;

        {
            let mut streams = shared.streams.write().await;
            for stream in streams.values_mut() {
                if !stream.is_active() || stream.direction() != Direction::Transmit {
                    continue;
                }
                match stream.write_to_avb_packet(last_window_start.max(now), shared.env.ptp.as_ref()) {
                    Ok((launch, frame)) => {
                        if !frame.is_empty() {
                            let _ = shared.env.transport.send(frame).await;
                        }
                        next_wake = next_wake.min(launch.max(now));
                    }
                    Err(e) => {
                        log::warn!("transmit sequencer skipped a stream: {}", e);
                    }
                }
            }
        }
        last_window_start = now;

        let sleep_ns = next_wake.saturating_sub(now).max(1_000_000);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_nanos(sleep_ns)) => {}
            _ = shared.notify.notified() => {}
        }
    }
}

/// Receive dispatch: waits for the next frame, parses its subtype, and
/// routes it to the stream whose `stream_id` matches, dropping it (with
/// a diagnostics-only warning, not an `Err`) if the id is unknown, the
/// subtype is unrecognized, or parsing fails — matching §7's "transient
/// receive errors are absorbed into diagnostics, not surfaced as Err."
async fn receive_loop(shared: Arc<Shared>) {
    loop {
        if shared.end_flag.load(Ordering::SeqCst) {
            break;
        }

        let frame = tokio::time::timeout(RECEIVE_POLL_TIMEOUT, shared.env.transport.recv()).await;
        let frame = match frame {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(_) => continue,
        };

        dispatch_frame(&shared, &frame).await;
    }
}

async fn dispatch_frame(shared: &Arc<Shared>, frame: &[u8]) {
    const VLAN_HEADER_LEN: usize = 18;
    if frame.len() <= VLAN_HEADER_LEN {
        return;
    }
    let subtype = frame[VLAN_HEADER_LEN];

    match subtype {
        avtp::SUBTYPE_AUDIO => {
            let Some(packet) = AudioPacket::parse(frame) else { return };
            let stream_id = packet.stream_id();
            let mut streams = shared.streams.write().await;
            if let Some(StreamObject::Audio(stream)) = streams.get_mut(&stream_id) {
                if let Err(e) = stream.read_from_avb_packet(&packet, shared.env.ptp.as_ref()) {
                    log::debug!("receive stream {:?} rejected a packet: {}", stream_id, e);
                }
            }
        }
        avtp::SUBTYPE_CRF_LATEST | avtp::SUBTYPE_CRF_D6 => {
            let compat = if subtype == avtp::SUBTYPE_CRF_LATEST {
                CrfCompatibility::Latest
            } else {
                CrfCompatibility::D6
            };
            let Some(packet) = CrfPacket::parse(frame, compat) else { return };
            let stream_id = packet.stream_id();
            let mut streams = shared.streams.write().await;
            if let Some(StreamObject::ClockReference(stream)) = streams.get_mut(&stream_id) {
                let outcome = stream.read_from_avb_packet(&packet, shared.env.ptp.as_ref());
                if !outcome.accepted {
                    log::debug!("receive stream {:?} rejected a CRF packet at stage {}", stream_id, outcome.stage_reached);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockDomain;
    use crate::ptp::FakePtpProxy;
    use crate::tspec::{SrClass, StreamId, TSpec};

    fn tspec() -> TSpec {
        TSpec::new(SrClass::High, 24 + 2 * 2 * 6, 1)
    }

    #[tokio::test]
    async fn create_and_activate_a_transmit_audio_stream() {
        let ptp: Arc<dyn PtpProxy> = Arc::new(FakePtpProxy::new());
        let transport: Arc<dyn NicTransport> = Arc::new(LoopbackTransport::new());
        let engine = Engine::new(Environment::new(ptp, transport));

        let domain_id = engine.create_clock_domain(ClockDomain::new_software()).await;
        let stream_id = engine
            .create_transmit_audio_stream(
                tspec(),
                StreamId(0x1122_3344_5566_7788),
                [1, 2, 3, 4, 5, 6],
                [6, 5, 4, 3, 2, 1],
                2,
                48_000,
                CompatibilityMode::Latest,
                domain_id,
                4,
            )
            .await
            .unwrap();

        engine.set_stream_active(stream_id, true).await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_stream_id_is_rejected() {
        let ptp: Arc<dyn PtpProxy> = Arc::new(FakePtpProxy::new());
        let transport: Arc<dyn NicTransport> = Arc::new(LoopbackTransport::new());
        let engine = Engine::new(Environment::new(ptp, transport));
        let domain_id = engine.create_clock_domain(ClockDomain::new_software()).await;

        let id = StreamId(42);
        engine
            .create_receive_audio_stream(tspec(), id, [0; 6], [0; 6], 2, 48_000, CompatibilityMode::Latest, domain_id)
            .await
            .unwrap();
        let err = engine
            .create_receive_audio_stream(tspec(), id, [0; 6], [0; 6], 2, 48_000, CompatibilityMode::Latest, domain_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AvbError::AlreadyInUse));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn connect_streams_rejects_wrong_direction() {
        let ptp: Arc<dyn PtpProxy> = Arc::new(FakePtpProxy::new());
        let transport: Arc<dyn NicTransport> = Arc::new(LoopbackTransport::new());
        let engine = Engine::new(Environment::new(ptp, transport));
        let domain_id = engine.create_clock_domain(ClockDomain::new_software()).await;

        let tx = engine
            .create_transmit_audio_stream(tspec(), StreamId(1), [0; 6], [0; 6], 2, 48_000, CompatibilityMode::Latest, domain_id, 4)
            .await
            .unwrap();
        let rx = engine
            .create_receive_audio_stream(tspec(), StreamId(2), [0; 6], [0; 6], 2, 48_000, CompatibilityMode::Latest, domain_id)
            .await
            .unwrap();

        assert!(engine.connect_streams(tx, rx).await.is_ok());
        assert!(engine.connect_streams(rx, tx).await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_clock_domain_id_is_rejected() {
        let ptp: Arc<dyn PtpProxy> = Arc::new(FakePtpProxy::new());
        let transport: Arc<dyn NicTransport> = Arc::new(LoopbackTransport::new());
        let engine = Engine::new(Environment::new(ptp, transport));
        let err = engine
            .create_receive_audio_stream(tspec(), StreamId(1), [0; 6], [0; 6], 2, 48_000, CompatibilityMode::Latest, 999)
            .await
            .unwrap_err();
        assert!(matches!(err, AvbError::InvalidParam(_)));
        engine.shutdown().await;
    }
}
