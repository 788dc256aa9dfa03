//! The ISO-TP/UDS session engine, command queue, and scheduler, wired
//! together into one dedicated worker thread per [`Session`]
//! (`SPEC_FULL.md` §4.1, §4.2, §5).
//!
//! Everything that touches a `Session`'s state after it starts happens on
//! that session's own thread. Other threads only ever push a message down
//! an `mpsc::Sender` — there is no lock on session-internal state, and
//! therefore no data race to avoid by construction.

pub mod engine;
pub mod queue;
pub mod scheduler;

pub use engine::{SessionState, WriteVariant, DEFAULT_TIMEOUT};
pub use queue::Command;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// A hook a [`Supervisor`](crate::supervisor::Supervisor) installs on a
/// session to route its SID-0x77 write retries to the sibling companion
/// session, lazily creating it if needed. Called synchronously on the
/// session's own worker thread, so it must not block for long.
pub type Retry77Hook = Arc<dyn Fn(u16, Vec<u8>) + Send + Sync>;

use crate::catalog::DidCatalog;
use crate::channel::{CanChannel, CanFrame, CanId};
use crate::codec::Value;
use crate::sink::{DecodeSink, Outcome, PublishSink};

use engine::{EngineAction, ProtocolEngine};
use queue::CommandQueue;
use scheduler::Scheduler;

/// How the session's command-queue drain runs (`SPEC_FULL.md` §4.2).
const DRAIN_TICK: Duration = Duration::from_millis(40);

/// Coarse lifecycle switch controlling what a session will do
/// (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// Blocks all exchanges.
    Standby,
    /// Enables schedules, user commands, and automatic SID-0x77 write retry
    /// on negative response.
    Normal,
    /// Scan-specific callback behavior: the host drives single-DID probing
    /// by pushing one `Read` at a time, so periodic schedules are disabled
    /// (there is no reason to probe a DID both on a schedule and by hand)
    /// and a negative response is reported as-is rather than retried.
    UdsDevScan,
    /// Same dispatch restrictions as `UdsDevScan`: scheduled background
    /// reads are disabled, and every decoded result is reported through the
    /// callback exactly as it would be in `Normal`.
    UdsDidScan,
    /// Only the SID-0x77 write path is enabled: `Read` and plain `Write`
    /// commands sitting in the queue are dropped rather than dispatched.
    Service77,
    /// Decoded values are returned but never published.
    Test,
}

impl OpMode {
    /// Whether scheduled background reads are allowed to feed the command
    /// queue in this mode. Only `Normal` "enables schedules"
    /// (`SPEC_FULL.md` §6); every other non-`Standby` mode is driven purely
    /// by commands the host pushes directly.
    fn schedules_enabled(self) -> bool {
        self == OpMode::Normal
    }

    /// Whether `cmd` is dispatched in this mode, or silently dropped.
    /// `Service77` is the only mode that restricts the command surface:
    /// "enables only the SID-0x77 path" (`SPEC_FULL.md` §6).
    fn permits(self, cmd: &Command) -> bool {
        match self {
            OpMode::Service77 => matches!(cmd, Command::Write77 { .. }),
            _ => true,
        }
    }
}

/// Configuration for one [`Session`] (`SPEC_FULL.md` §3).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This device's transmit identifier.
    pub tx_id: CanId,
    /// This device's receive identifier. Conventionally `tx_id + 0x10`.
    pub rx_id: CanId,
    /// Exchange timeout before a `Timeout` outcome fires.
    pub timeout: Duration,
}

impl SessionConfig {
    /// Builds a config for `tx_id` with `rx_id = tx_id + 0x10` and the
    /// default exchange timeout.
    pub fn for_tx_id(tx_id: CanId) -> Self {
        Self {
            tx_id,
            rx_id: tx_id + 0x10,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builds the config for the companion SID-0x77 session: `tx_id + 0x02`,
    /// `rx_id = tx_id + 0x12` (`SPEC_FULL.md` §6).
    pub fn vendor77_companion_of(base_tx_id: CanId) -> Self {
        Self::for_tx_id(base_tx_id + 0x02)
    }
}

/// One decoded exchange outcome, as delivered to a session's callback
/// (`SPEC_FULL.md` §4.1).
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    /// How the exchange ended.
    pub outcome: Outcome,
    /// The DID this exchange was about.
    pub did: u16,
    /// The DID's sanitized symbolic id, or `DeviceSpecific`/empty if unknown.
    pub symbolic_id: String,
    /// Length of the raw payload, if any.
    pub length: usize,
    /// The decoded value, for successful reads only.
    pub value: Option<Value>,
}

/// A session's outcome callback.
pub type Callback = Box<dyn Fn(ExchangeReport) + Send>;

enum Message {
    Push(Command),
    Inbound(CanFrame),
    SetOpMode(OpMode),
    SetCallback(Callback),
    SetCatalog(Arc<DidCatalog>),
    AddSchedule { period_secs: u32, dids: Vec<u16> },
    FlushStatistics,
    Stop,
}

/// A handle to a running session's dedicated worker thread.
///
/// Cloning is not supported — a `Session` is the sole owner of its thread
/// and its `mpsc::Sender`; the [`crate::supervisor::Supervisor`] is the
/// sole owner of a `Session`.
#[derive(Debug)]
pub struct Session {
    tx: mpsc::Sender<Message>,
    rx_id: CanId,
    running: Arc<AtomicBool>,
    processing: Arc<AtomicBool>,
    overlap_pending: Arc<AtomicU64>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Session {
    /// Spawns a session's worker thread and returns a handle to it.
    ///
    /// `retry77_hook`, if set, is invoked with `(did, payload)` whenever a
    /// `Normal`-mode write gets a negative response; the supervisor uses it
    /// to route the retry to the sibling SID-0x77 companion session,
    /// creating it on first use, rather than this session calling into the
    /// sibling directly (`SPEC_FULL.md` §4.5, §9).
    pub fn spawn(
        config: SessionConfig,
        channel: Arc<Mutex<dyn CanChannel>>,
        catalog: Arc<DidCatalog>,
        publish: Box<dyn PublishSink>,
        retry77_hook: Option<Retry77Hook>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let (schedule_tx, schedule_rx) = mpsc::channel::<Command>();
        let running = Arc::new(AtomicBool::new(true));
        let processing = Arc::new(AtomicBool::new(false));
        let overlap_pending = Arc::new(AtomicU64::new(0));

        let running_thread = running.clone();
        let overlap_thread = overlap_pending.clone();
        let rx_id = config.rx_id;

        let join = std::thread::spawn(move || {
            let mut worker = Worker {
                engine: ProtocolEngine::new(config.tx_id, config.rx_id, config.timeout),
                queue: CommandQueue::new(),
                sink: DecodeSink::new(catalog),
                publish,
                scheduler: Scheduler::new(),
                op_mode: OpMode::Standby,
                cooldown_until: None,
                callback: None,
                channel,
                retry77_hook,
                schedule_tx,
                schedule_rx,
                running: running_thread.clone(),
            };

            while running_thread.load(Ordering::Acquire) {
                match rx.recv_timeout(DRAIN_TICK) {
                    Ok(Message::Push(cmd)) => worker.queue.push(cmd),
                    Ok(Message::Inbound(frame)) => worker.handle_inbound(frame),
                    Ok(Message::SetOpMode(mode)) => worker.op_mode = mode,
                    Ok(Message::SetCallback(cb)) => worker.callback = Some(cb),
                    Ok(Message::SetCatalog(catalog)) => worker.sink.set_catalog(worker.publish.as_mut(), catalog),
                    Ok(Message::AddSchedule { period_secs, dids }) => {
                        worker.add_schedule(period_secs, dids, running_thread.clone());
                    }
                    Ok(Message::FlushStatistics) => {
                        worker.sink.maybe_publish_statistics(worker.publish.as_mut(), Instant::now(), true);
                    }
                    Ok(Message::Stop) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }

                worker.drain_schedule_ticks();
                worker.drain_overlaps(&overlap_thread);
                worker.check_timeout();
                worker.drain_queue();
            }

            worker.scheduler.cancel_all();
            // Always report a final snapshot on the way out, regardless of
            // the publish throttle (`SPEC_FULL.md` §4.3's `forceStore`).
            worker.sink.maybe_publish_statistics(worker.publish.as_mut(), Instant::now(), true);
        });

        Self {
            tx,
            rx_id,
            running,
            processing,
            overlap_pending,
            join: Mutex::new(Some(join)),
        }
    }

    /// This session's receive identifier.
    pub fn rx_id(&self) -> CanId {
        self.rx_id
    }

    /// Enqueues a read of `did`.
    pub fn read_by_did(&self, did: u16) {
        let _ = self.tx.send(Message::Push(Command::Read(did)));
    }

    /// Enqueues a default-encoding write of `payload` to `did`.
    pub fn write_by_did(&self, did: u16, payload: Vec<u8>) {
        let _ = self.tx.send(Message::Push(Command::Write { did, payload }));
    }

    /// Enqueues a vendor SID-0x77 write of `payload` to `did`.
    pub fn write_by_did77(&self, did: u16, payload: Vec<u8>) {
        let _ = self.tx.send(Message::Push(Command::Write77 { did, payload }));
    }

    /// Routes one inbound frame into this session.
    ///
    /// Guards against a re-entrant call arriving while a previous one is
    /// still being dispatched onto the worker thread: the overlapping call
    /// is dropped and counted rather than queued twice (`SPEC_FULL.md` §4.1).
    pub fn on_inbound_frame(&self, frame: CanFrame) {
        if self.processing.swap(true, Ordering::AcqRel) {
            self.overlap_pending.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _ = self.tx.send(Message::Inbound(frame));
        self.processing.store(false, Ordering::Release);
    }

    /// Installs (replacing any previous) outcome callback.
    pub fn set_callback(&self, callback: Callback) {
        let _ = self.tx.send(Message::SetCallback(callback));
    }

    /// Sets the session's op mode.
    pub fn set_op_mode(&self, mode: OpMode) {
        let _ = self.tx.send(Message::SetOpMode(mode));
    }

    /// Swaps in a freshly merged catalog.
    pub fn set_catalog(&self, catalog: Arc<DidCatalog>) {
        let _ = self.tx.send(Message::SetCatalog(catalog));
    }

    /// Installs a periodic (or, if `period_secs == 0`, one-shot) schedule
    /// that reads every DID in `dids`.
    pub fn add_schedule(&self, period_secs: u32, dids: Vec<u16>) {
        let _ = self.tx.send(Message::AddSchedule { period_secs, dids });
    }

    /// Forces an out-of-cadence statistics publish, bypassing the 5000 ms
    /// throttle (`SPEC_FULL.md` §4.3's `forceStore=true`). `stop()` already
    /// does this on the way out; use this to get a snapshot on demand while
    /// the session keeps running.
    pub fn flush_statistics(&self) {
        let _ = self.tx.send(Message::FlushStatistics);
    }

    /// Marks the session as running. A session starts `Standby`;
    /// `opMode` must still be set separately to enable exchanges.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Idempotently stops the session: cancels schedules, abandons any
    /// in-flight exchange without firing its callback, and joins the
    /// worker thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Message::Stop);
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    engine: ProtocolEngine,
    queue: CommandQueue,
    sink: DecodeSink,
    publish: Box<dyn PublishSink>,
    scheduler: Scheduler,
    op_mode: OpMode,
    cooldown_until: Option<Instant>,
    callback: Option<Callback>,
    channel: Arc<Mutex<dyn CanChannel>>,
    retry77_hook: Option<Retry77Hook>,
    /// Schedule loops enqueue `Read` commands here rather than through the
    /// worker's own `Message` channel, since they only ever need to push
    /// commands, never the full message surface.
    schedule_tx: mpsc::Sender<Command>,
    schedule_rx: mpsc::Receiver<Command>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn handle_inbound(&mut self, frame: CanFrame) {
        if frame.id != self.engine.rx_id() {
            return;
        }
        let channel = &self.channel;
        let result = self
            .engine
            .on_inbound_frame(frame.data, |id, data| channel.lock().unwrap().send(id, data));
        match result {
            Ok(action) => self.apply_action(action),
            Err(e) => log::error!("session {:#06X}: send failed while handling inbound frame: {e}", self.engine.rx_id()),
        }
    }

    fn drain_overlaps(&mut self, overlap_pending: &AtomicU64) {
        let pending = overlap_pending.swap(0, Ordering::AcqRel);
        for _ in 0..pending {
            if self.sink.record_overlap() {
                log::warn!(
                    "session {:#06X}: dropped overlapping inbound-frame call (total {})",
                    self.engine.rx_id(),
                    self.sink.statistics().cnt_overlap()
                );
            }
        }
    }

    fn check_timeout(&mut self) {
        if self.engine.is_idle() {
            return;
        }
        let action = self.engine.check_timeout(Instant::now());
        self.apply_action(action);
    }

    fn drain_queue(&mut self) {
        if self.op_mode == OpMode::Standby {
            return;
        }
        if !self.engine.is_idle() {
            return;
        }
        let now = Instant::now();
        if self.cooldown_until.map_or(false, |t| now < t) {
            return;
        }
        loop {
            let Some(cmd) = self.queue.pop() else {
                return;
            };
            if !self.op_mode.permits(&cmd) {
                log::warn!(
                    "session {:#06X}: dropping {cmd:?}, not permitted in {:?}",
                    self.engine.rx_id(),
                    self.op_mode
                );
                continue;
            }
            self.dispatch(cmd);
            return;
        }
    }

    fn dispatch(&mut self, cmd: Command) {
        let channel = &self.channel;
        let result = match &cmd {
            Command::Read(did) => self
                .engine
                .begin_read(*did, |id, data| channel.lock().unwrap().send(id, data)),
            Command::Write { did, payload } => self.engine.begin_write(
                *did,
                payload,
                WriteVariant::Standard,
                |id, data| channel.lock().unwrap().send(id, data),
            ),
            Command::Write77 { did, payload } => self.engine.begin_write(
                *did,
                payload,
                WriteVariant::Vendor77,
                |id, data| channel.lock().unwrap().send(id, data),
            ),
        };
        if let Err(e) = result {
            log::error!(
                "session {:#06X}: failed to start exchange for DID {:#06X}: {e}",
                self.engine.rx_id(),
                cmd.did()
            );
        }
    }

    fn apply_action(&mut self, action: EngineAction) {
        let EngineAction::Completed {
            outcome,
            did,
            raw,
            cooldown,
            reply_time_ms,
            write_payload,
        } = action
        else {
            return;
        };

        self.cooldown_until = Some(Instant::now() + cooldown);
        self.sink.record_outcome(did, outcome, reply_time_ms);

        let (symbolic_id, value) = match (&outcome, &raw) {
            (Outcome::Ok, Some(bytes)) => {
                if self.op_mode != OpMode::Test {
                    self.sink.publish_read(self.publish.as_mut(), did, bytes);
                }
                let desc = self.sink.catalog().get(did);
                let symbolic_id = desc
                    .map(|d| crate::helpers::sanitize_symbolic_id(&d.symbolic_id))
                    .unwrap_or_else(|| crate::sink::DEVICE_SPECIFIC_ID.to_string());
                let value = desc.and_then(|d| {
                    crate::codec::CodecKind::parse(&d.codec_name)
                        .ok()
                        .and_then(|k| k.decode(bytes, &d.codec_args).ok())
                });
                (symbolic_id, value)
            }
            _ => (String::new(), None),
        };

        let length = raw.as_ref().map(Vec::len).unwrap_or(0);

        if outcome == Outcome::NegativeResponse && self.op_mode == OpMode::Normal {
            if let (Some(hook), Some(payload)) = (&self.retry77_hook, write_payload) {
                hook(did, payload);
            }
        }

        let now = Instant::now();
        self.sink.maybe_publish_statistics(self.publish.as_mut(), now, false);

        if let Some(cb) = &self.callback {
            cb(ExchangeReport {
                outcome,
                did,
                symbolic_id,
                length,
                value,
            });
        }
    }

    fn drain_schedule_ticks(&mut self) {
        let enabled = self.op_mode.schedules_enabled();
        while let Ok(cmd) = self.schedule_rx.try_recv() {
            if enabled {
                self.queue.push(cmd);
            }
        }
    }

    fn add_schedule(&mut self, period_secs: u32, dids: Vec<u16>, running: Arc<AtomicBool>) {
        self.scheduler.add(period_secs, dids, self.schedule_tx.clone(), running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogVersion, DidDescriptor};
    use crate::channel::sim::SimulationChannel;
    use std::collections::HashSet;
    use std::sync::mpsc as std_mpsc;

    #[derive(Debug, Default)]
    struct RecordingPublishSink {
        raw: Vec<(u16, String)>,
    }

    impl PublishSink for RecordingPublishSink {
        fn publish_raw(&mut self, did: u16, symbolic_id: &str, _hex: &str) {
            self.raw.push((did, symbolic_id.to_string()));
        }
        fn publish_json(&mut self, _did: u16, _symbolic_id: &str, _json: &str) {}
        fn publish_tree(&mut self, _did: u16, _symbolic_id: &str, _value: &Value) {}
        fn delete_tree(&mut self, _did: u16, _symbolic_id: &str) {}
        fn publish_statistics(&mut self, _stats: &crate::sink::Statistics) {}
    }

    fn empty_catalog() -> Arc<DidCatalog> {
        Arc::new(DidCatalog::merge(CatalogVersion::new("1.0"), vec![], vec![], HashSet::new()).unwrap())
    }

    fn catalog_with(did: u16) -> Arc<DidCatalog> {
        let desc = DidDescriptor {
            did,
            symbolic_id: "outside.temp".to_string(),
            declared_len: 2,
            codec_name: "u16-be".to_string(),
            codec_args: std::collections::BTreeMap::new(),
        };
        Arc::new(DidCatalog::merge(CatalogVersion::new("1.0"), vec![desc], vec![], HashSet::new()).unwrap())
    }

    #[test]
    fn sf_read_end_to_end_reports_ok() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim.clone()));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x500),
            channel,
            catalog_with(0x018C),
            Box::new(RecordingPublishSink::default()),
            None,
        );

        let (report_tx, report_rx) = std_mpsc::channel();
        session.set_callback(Box::new(move |report| {
            let _ = report_tx.send(report);
        }));
        session.set_op_mode(OpMode::Normal);
        session.read_by_did(0x018C);

        // Wait for the engine to have transmitted its request.
        let mut sent = None;
        for _ in 0..50 {
            if let Some(frame) = sim.pop_sent() {
                sent = Some(frame);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let sent = sent.expect("session should have sent the SF read request");
        assert_eq!(sent.id, 0x500);
        assert_eq!(sent.data, [0x03, 0x22, 0x01, 0x8C, 0, 0, 0, 0]);

        session.on_inbound_frame(CanFrame::new(0x510, [0x05, 0x62, 0x01, 0x8C, 0xC2, 0x01, 0x55, 0x55]));

        let report = report_rx.recv_timeout(Duration::from_secs(2)).expect("expected a report");
        assert_eq!(report.outcome, Outcome::Ok);
        assert_eq!(report.did, 0x018C);
        assert_eq!(report.length, 2);

        session.stop();
    }

    #[test]
    fn standby_mode_never_dequeues() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim.clone()));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x500),
            channel,
            empty_catalog(),
            Box::new(RecordingPublishSink::default()),
            None,
        );
        session.read_by_did(0x100);
        std::thread::sleep(Duration::from_millis(200));
        assert!(sim.pop_sent().is_none());
        session.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x500),
            channel,
            empty_catalog(),
            Box::new(RecordingPublishSink::default()),
            None,
        );
        session.stop();
        session.stop();
    }

    #[test]
    fn service77_mode_drops_plain_read_and_write() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim.clone()));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x502),
            channel,
            empty_catalog(),
            Box::new(RecordingPublishSink::default()),
            None,
        );
        session.set_op_mode(OpMode::Service77);
        session.read_by_did(0x100);
        session.write_by_did(0x100, vec![0x01]);
        std::thread::sleep(Duration::from_millis(200));
        assert!(sim.pop_sent().is_none(), "Service77 must not dispatch non-0x77 commands");

        session.write_by_did77(0x100, vec![0x01]);
        let mut sent = None;
        for _ in 0..50 {
            if let Some(frame) = sim.pop_sent() {
                sent = Some(frame);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(sent.is_some(), "Service77 must still dispatch a SID-0x77 write");

        session.stop();
    }

    #[test]
    fn uds_dev_scan_mode_does_not_drain_schedules() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim.clone()));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x500),
            channel,
            empty_catalog(),
            Box::new(RecordingPublishSink::default()),
            None,
        );
        session.set_op_mode(OpMode::UdsDevScan);
        session.add_schedule(0, vec![0x100]);
        std::thread::sleep(Duration::from_millis(300));
        assert!(sim.pop_sent().is_none(), "scan modes must not drain scheduled reads");
        session.stop();
    }

    #[test]
    fn flush_statistics_forces_an_out_of_cadence_publish() {
        let sim = SimulationChannel::new();
        let channel: Arc<Mutex<dyn CanChannel>> = Arc::new(Mutex::new(sim));

        #[derive(Debug, Default)]
        struct CountingSink {
            publishes: Arc<AtomicU64>,
        }
        impl PublishSink for CountingSink {
            fn publish_raw(&mut self, _did: u16, _symbolic_id: &str, _hex: &str) {}
            fn publish_json(&mut self, _did: u16, _symbolic_id: &str, _json: &str) {}
            fn publish_tree(&mut self, _did: u16, _symbolic_id: &str, _value: &Value) {}
            fn delete_tree(&mut self, _did: u16, _symbolic_id: &str) {}
            fn publish_statistics(&mut self, _stats: &crate::sink::Statistics) {
                self.publishes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let publishes = Arc::new(AtomicU64::new(0));
        let session = Session::spawn(
            SessionConfig::for_tx_id(0x500),
            channel,
            empty_catalog(),
            Box::new(CountingSink { publishes: publishes.clone() }),
            None,
        );

        session.flush_statistics();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(publishes.load(Ordering::SeqCst), 1);

        session.flush_statistics();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(publishes.load(Ordering::SeqCst), 2);

        session.stop();
        // `stop()` forces one more snapshot on the way out.
        assert_eq!(publishes.load(Ordering::SeqCst), 3);
    }
}
