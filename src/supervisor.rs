// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Owns every stream's worker threads and drives their reconnect state
//! machine (spec.md §4.1): `Idle -> Connecting -> Running -> Reconnecting
//! -> Stopped`, with exponential backoff between connection attempts.
//! One [`SegmentWriter`](crate::segment_writer) thread and one ingest
//! thread run per enabled stream; both are started and stopped together,
//! since neither is useful without the other.
//!
//! Each stream's retry loop is generic over a clock so it's testable
//! without real sleeps, and reports failures through `base::Error` and
//! `tracing` rather than process-wide state.

use crate::event_bus::{Event, EventBus};
use crate::ingest::{self, Opener, WorkerObserver};
use crate::motion_buffer::Pool as MotionPool;
use crate::motion_trigger::{self, MotionTriggerDriver, TriggerSender};
use crate::router::PacketRouter;
use crate::segment_writer::{self, MotionActive, SegmentWriter};
use base::clock::{Clocks, SystemClocks};
use base::shutdown::{self, Receiver as ShutdownReceiver};
use base::time::Time;
use base::{err, Error, ErrorKind};
use db::stream::Stream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;
use tracing::{error, warn};

/// Initial and maximum reconnect delay (spec.md §4.1).
const BACKOFF_INITIAL: StdDuration = StdDuration::from_secs(1);
const BACKOFF_MAX: StdDuration = StdDuration::from_secs(30);
/// Consecutive failures are forgiven once a connection has stayed
/// `Running` this long.
const RUNNING_RESET_MICROS: i64 = 60_000_000;
/// Consecutive reconnect failures before `stream.degraded` fires.
const DEGRADED_THRESHOLD: u32 = 10;
/// Bad-config errors (unparseable URL, no supported stream) are logged
/// at most this often rather than on every retry.
const BAD_CONFIG_LOG_PERIOD_MICROS: i64 = 60_000_000;
/// How long `remove_stream`/`set_enabled(false)` waits for a worker to
/// notice shutdown and finish its current segment before it gives up
/// waiting (the thread is still joined afterward; this only bounds how
/// long the caller blocks).
const DRAIN_TIMEOUT: StdDuration = StdDuration::from_secs(10);

const NOT_RUNNING: i64 = i64::MIN;
const NEVER_LOGGED: i64 = i64::MIN;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Running,
    Reconnecting,
    Stopped,
}

impl WorkerState {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Running => "running",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// A snapshot of one worker's status, returned by [`StreamSupervisor::list_workers`].
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub stream_name: String,
    pub state: WorkerState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub started_at: Option<Time>,
    pub packets_in: u64,
    pub bytes_in: u64,
}

impl WorkerStatus {
    /// Projects this status into the shape [`crate::query_api::stream_statuses`]
    /// expects for its live-health half of a stream status.
    pub fn as_stream_health(&self) -> crate::query_api::StreamHealth {
        crate::query_api::StreamHealth {
            stream_name: self.stream_name.clone(),
            state: self.state.as_str().to_string(),
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Shared, lock-light worker state: written by the ingest thread (via
/// [`WorkerObserver`]) and the reconnect loop, read by
/// [`StreamSupervisor::list_workers`] and [`crate::query_api`] from any
/// thread.
struct WorkerShared<C: Clocks> {
    clocks: C,
    events: EventBus,
    stream_name: String,
    state: Mutex<WorkerState>,
    last_error: Mutex<Option<String>>,
    consecutive_failures: AtomicU32,
    started_at: Mutex<Option<Time>>,
    running_since_micros: AtomicI64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    degraded: AtomicBool,
    last_bad_config_log_micros: AtomicI64,
}

impl<C: Clocks> WorkerShared<C> {
    fn new(clocks: C, events: EventBus, stream_name: String) -> WorkerShared<C> {
        WorkerShared {
            clocks,
            events,
            stream_name,
            state: Mutex::new(WorkerState::Idle),
            last_error: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            started_at: Mutex::new(None),
            running_since_micros: AtomicI64::new(NOT_RUNNING),
            packets_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            last_bad_config_log_micros: AtomicI64::new(NEVER_LOGGED),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            stream_name: self.stream_name.clone(),
            state: *self.state.lock().unwrap(),
            last_error: self.last_error.lock().unwrap().clone(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().unwrap(),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
        }
    }

    /// Called once per connection attempt, right before `ingest::run`.
    fn note_attempt_started(&self) {
        self.set_state(WorkerState::Connecting);
        *self.started_at.lock().unwrap() = Some(Time::now());
    }

    /// Called when a connection attempt ends without ever completing,
    /// or fails after running a while. Returns the delay to sleep before
    /// the next attempt; the caller doubles (capped) that value only
    /// after sleeping on it, so it grows for the attempt after this one,
    /// not this one (spec.md §4.1: "1 s, 2, 4, 8, 16, cap 30 s").
    fn record_failure(&self, err: &Error, backoff: StdDuration) -> StdDuration {
        let was_long_running = {
            let state = *self.state.lock().unwrap();
            let since = self.running_since_micros.load(Ordering::Relaxed);
            state == WorkerState::Running
                && since != NOT_RUNNING
                && self.clocks.monotonic_micros() - since >= RUNNING_RESET_MICROS
        };
        self.running_since_micros.store(NOT_RUNNING, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(err.to_string());
        self.set_state(WorkerState::Reconnecting);

        let failures = if was_long_running {
            self.consecutive_failures.store(1, Ordering::Relaxed);
            1
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        };

        if matches!(err.kind(), ErrorKind::InvalidArgument | ErrorKind::FailedPrecondition) {
            let now = self.clocks.monotonic_micros();
            let last = self.last_bad_config_log_micros.load(Ordering::Relaxed);
            if last == NEVER_LOGGED || now - last >= BAD_CONFIG_LOG_PERIOD_MICROS {
                self.last_bad_config_log_micros.store(now, Ordering::Relaxed);
                warn!(stream = %self.stream_name, error = %err, "stream configuration error, will keep retrying");
            }
        } else {
            warn!(stream = %self.stream_name, error = %err, failures, "ingest attempt failed, reconnecting");
        }

        if failures == DEGRADED_THRESHOLD && !self.degraded.swap(true, Ordering::Relaxed) {
            self.events.publish(Event::StreamDegraded {
                stream_name: self.stream_name.clone(),
                consecutive_failures: failures,
            });
        }

        if was_long_running {
            BACKOFF_INITIAL
        } else {
            backoff
        }
    }
}

impl<C: Clocks> WorkerObserver for WorkerShared<C> {
    fn on_packet(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_first_keyframe(&self) {
        self.set_state(WorkerState::Running);
        self.running_since_micros.store(self.clocks.monotonic_micros(), Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            self.events.publish(Event::StreamRecovered { stream_name: self.stream_name.clone() });
        }
    }
}

/// The threads and shutdown handle for one currently-enabled stream.
/// `motion_join`/`motion_trigger` are only populated when the stream has
/// motion recording enabled.
struct RunningWorker {
    shutdown_tx: shutdown::Sender,
    ingest_join: JoinHandle<()>,
    writer_join: JoinHandle<()>,
    motion_join: Option<JoinHandle<()>>,
    motion_trigger: Option<TriggerSender>,
}

/// One configured stream's registry entry: its config plus whichever
/// threads are currently running for it (`None` when disabled).
struct Registered<C: Clocks> {
    stream: Mutex<Stream>,
    shared: Arc<WorkerShared<C>>,
    motion_active: MotionActive,
    running: Mutex<Option<RunningWorker>>,
}

/// Errors `StreamSupervisor`'s registry operations can return, matching
/// spec.md §4.1's public contract.
#[derive(Debug, Eq, PartialEq)]
pub enum RegistryError {
    Duplicate,
    Invalid,
    CapacityExceeded,
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryError::Duplicate => "stream already registered",
            RegistryError::Invalid => "invalid stream configuration",
            RegistryError::CapacityExceeded => "stream capacity exceeded",
            RegistryError::NotFound => "no such stream",
        };
        f.write_str(s)
    }
}

impl std::error::Error for RegistryError {}

/// Supervises every configured stream's ingest and segment-writing
/// threads. Generic over [`Clocks`] so reconnect backoff can be tested
/// without sleeping for real (see `tests` below).
pub struct StreamSupervisor<C: Clocks = SystemClocks> {
    clocks: C,
    db: Arc<Mutex<rusqlite::Connection>>,
    events: EventBus,
    recordings_root: PathBuf,
    opener: Arc<dyn Opener>,
    max_streams: usize,
    motion_pool: Arc<MotionPool>,
    registry: Mutex<HashMap<String, Arc<Registered<C>>>>,
}

impl<C: Clocks + Clone> StreamSupervisor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clocks: C,
        db: Arc<Mutex<rusqlite::Connection>>,
        events: EventBus,
        recordings_root: PathBuf,
        opener: Arc<dyn Opener>,
        max_streams: usize,
        motion_pool: Arc<MotionPool>,
    ) -> StreamSupervisor<C> {
        StreamSupervisor {
            clocks,
            db,
            events,
            recordings_root,
            opener,
            max_streams,
            motion_pool,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `stream` and, if enabled, starts its worker threads.
    /// The caller is responsible for having already persisted `stream`
    /// with [`db::stream::create`]; this only manages the live worker.
    pub fn add_stream(&self, stream: Stream) -> Result<(), RegistryError> {
        if url::Url::parse(&stream.url).is_err() {
            return Err(RegistryError::Invalid);
        }
        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&stream.name) {
            return Err(RegistryError::Duplicate);
        }
        if registry.len() >= self.max_streams {
            return Err(RegistryError::CapacityExceeded);
        }
        let motion_active: MotionActive = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(WorkerShared::new(self.clocks.clone(), self.events.clone(), stream.name.clone()));
        let enabled = stream.enabled;
        let entry = Arc::new(Registered {
            stream: Mutex::new(stream),
            shared,
            motion_active,
            running: Mutex::new(None),
        });
        let name = entry.stream.lock().unwrap().name.clone();
        registry.insert(name, entry.clone());
        drop(registry);
        if enabled {
            self.start(&entry);
        }
        Ok(())
    }

    /// Stops `name`'s worker (if running) and drops it from the
    /// registry. Any open segment is finalized by the stopped
    /// `SegmentWriter`; segment rows already in the index are untouched.
    pub fn remove_stream(&self, name: &str) -> Result<(), RegistryError> {
        let entry = self.registry.lock().unwrap().remove(name).ok_or(RegistryError::NotFound)?;
        self.stop(&entry);
        Ok(())
    }

    /// Starts or stops `name`'s worker threads without forgetting its
    /// configuration, so it can be re-enabled later.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let entry = self.registry.lock().unwrap().get(name).cloned().ok_or(RegistryError::NotFound)?;
        entry.stream.lock().unwrap().enabled = enabled;
        let currently_running = entry.running.lock().unwrap().is_some();
        match (enabled, currently_running) {
            (true, false) => self.start(&entry),
            (false, true) => self.stop(&entry),
            _ => {}
        }
        Ok(())
    }

    /// Signals motion for `name`, opening or extending a
    /// [`db::motion::MotionEvent`] (spec.md §3, §4.3). Errs with
    /// [`RegistryError::NotFound`] if the stream isn't registered, or if
    /// it's registered but not currently running with motion recording
    /// enabled (no worker means nothing is consuming the pre-buffer).
    pub fn trigger_motion(&self, name: &str, source: db::motion::Source) -> Result<(), RegistryError> {
        let entry = self.registry.lock().unwrap().get(name).cloned().ok_or(RegistryError::NotFound)?;
        let running = entry.running.lock().unwrap();
        let sender = running.as_ref().and_then(|r| r.motion_trigger.as_ref()).ok_or(RegistryError::NotFound)?;
        sender.trigger(source).map_err(|_| RegistryError::NotFound)
    }

    /// A snapshot of every registered stream's worker status, in name
    /// order.
    pub fn list_workers(&self) -> Vec<WorkerStatus> {
        let registry = self.registry.lock().unwrap();
        let mut out: Vec<WorkerStatus> = registry.values().map(|e| e.shared.status()).collect();
        out.sort_by(|a, b| a.stream_name.cmp(&b.stream_name));
        out
    }

    /// [`list_workers`](Self::list_workers) projected into the shape
    /// [`crate::query_api::stream_statuses`] takes as its `live` argument.
    pub fn health_snapshots(&self) -> Vec<crate::query_api::StreamHealth> {
        self.list_workers().iter().map(WorkerStatus::as_stream_health).collect()
    }

    fn start(&self, entry: &Arc<Registered<C>>) {
        let mut running = entry.running.lock().unwrap();
        if running.is_some() {
            return;
        }
        let stream = entry.stream.lock().unwrap().clone();
        let mut router = PacketRouter::new(stream.settings.motion_recording);
        let sink = router.sender();
        let writer_sink = router.writer_sender();
        let motion_rx = router.motion_rx.take();
        let (shutdown_tx, shutdown_rx) = shutdown::channel();

        let writer_cfg = segment_writer::Config {
            record_mp4_directly: stream.settings.record_mp4_directly,
            width_px: stream.settings.width_hint_px,
            height_px: stream.settings.height_hint_px,
            ..segment_writer::Config::default()
        };
        let writer = match SegmentWriter::new(
            stream.name.clone(),
            self.recordings_root.clone(),
            writer_cfg,
            self.db.clone(),
            self.events.clone(),
            router.writer_rx,
            shutdown_rx.clone(),
            entry.motion_active.clone(),
        ) {
            Ok(w) => w,
            Err(e) => {
                error!(stream = %stream.name, error = %e, "failed to start segment writer");
                entry.shared.set_state(WorkerState::Stopped);
                return;
            }
        };
        let writer_join = std::thread::Builder::new()
            .name(format!("writer-{}", stream.name))
            .spawn(move || {
                if let Err(e) = writer.run() {
                    error!(error = %e, "segment writer exited with an error");
                }
            })
            .expect("spawning segment writer thread");

        let (motion_join, motion_trigger) = match motion_rx {
            Some(motion_rx) => {
                let (trigger_tx, trigger_rx) = motion_trigger::channel();
                let driver = MotionTriggerDriver::new(
                    self.clocks.clone(),
                    stream.name.clone(),
                    self.db.clone(),
                    self.events.clone(),
                    motion_rx,
                    trigger_rx,
                    writer_sink,
                    entry.motion_active.clone(),
                    shutdown_rx.clone(),
                    self.motion_pool.clone(),
                    stream.settings.pre_buffer_sec as i64 * 1_000_000,
                    stream.settings.post_buffer_sec as i64 * 1_000_000,
                );
                let join = std::thread::Builder::new()
                    .name(format!("motion-{}", stream.name))
                    .spawn(move || driver.run())
                    .expect("spawning motion trigger thread");
                (Some(join), Some(trigger_tx))
            }
            None => (None, None),
        };

        let clocks = self.clocks.clone();
        let opener = self.opener.clone();
        let shared = entry.shared.clone();
        let stream_name = stream.name.clone();
        let url = stream.url.clone();
        let ingest_join = std::thread::Builder::new()
            .name(format!("ingest-{}", stream.name))
            .spawn(move || ingest_thread_body(clocks, stream_name, url, opener, sink, shutdown_rx, shared))
            .expect("spawning ingest thread");

        *running = Some(RunningWorker { shutdown_tx, ingest_join, writer_join, motion_join, motion_trigger });
    }

    fn stop(&self, entry: &Arc<Registered<C>>) {
        let running = entry.running.lock().unwrap().take();
        let Some(running) = running else { return };
        drop(running.shutdown_tx);
        let stream_name = entry.stream.lock().unwrap().name.clone();
        join_within_drain_timeout(running.ingest_join, &stream_name, "ingest");
        join_within_drain_timeout(running.writer_join, &stream_name, "segment writer");
        if let Some(motion_join) = running.motion_join {
            join_within_drain_timeout(motion_join, &stream_name, "motion trigger");
        }
        entry.shared.set_state(WorkerState::Stopped);
    }

    /// Stops every running worker. Called once during process teardown.
    pub fn shutdown(&self) {
        let entries: Vec<_> = self.registry.lock().unwrap().values().cloned().collect();
        for entry in entries {
            self.stop(&entry);
        }
    }
}

/// Waits up to [`DRAIN_TIMEOUT`] for `join` to finish, via a small
/// reaper thread so a hung worker doesn't block the caller forever.
/// Rust has no safe way to force-terminate an OS thread, so a worker
/// that outlives the timeout is simply abandoned: the reaper keeps
/// waiting for it in the background and logs if it ever panics.
fn join_within_drain_timeout(join: JoinHandle<()>, stream_name: &str, role: &'static str) {
    let (tx, rx) = std::sync::mpsc::channel();
    let stream_name = stream_name.to_string();
    let stream_name_for_thread = stream_name.clone();
    std::thread::spawn(move || {
        let panicked = join.join().is_err();
        let _ = tx.send(panicked);
        if panicked {
            error!(stream = %stream_name_for_thread, role, "worker thread panicked during shutdown");
        }
    });
    if rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
        warn!(stream = %stream_name, role, "worker did not stop within the drain timeout; still waiting in the background");
    }
}

/// Drives one stream's reconnect loop: open, run until failure or
/// cooperative shutdown, back off, repeat. Isolated on its own thread so
/// a panic here (caught below) can't affect any other stream.
fn ingest_thread_body<C: Clocks>(
    clocks: C,
    stream_name: String,
    url: String,
    opener: Arc<dyn Opener>,
    sink: crate::router::RouterSender,
    shutdown: ShutdownReceiver,
    shared: Arc<WorkerShared<C>>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if shutdown.check().is_err() {
            shared.set_state(WorkerState::Stopped);
            return;
        }
        shared.note_attempt_started();
        let source = match opener.open(&stream_name, &url) {
            Ok(s) => s,
            Err(e) => {
                backoff = shared.record_failure(&e, backoff);
                clocks.sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        let observer: &dyn WorkerObserver = shared.as_ref();
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ingest::run(&stream_name, source, &sink, &shutdown, observer)
        }));
        match run_result {
            Ok(Ok(())) => {
                shared.set_state(WorkerState::Stopped);
                return;
            }
            Ok(Err(e)) => {
                backoff = shared.record_failure(&e, backoff);
            }
            Err(panic_payload) => {
                let msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(stream = %stream_name, panic = %msg, "ingest worker panicked, restarting");
                backoff = shared.record_failure(&err!(Internal, "worker panicked: {msg}"), backoff);
            }
        }
        if shutdown.check().is_err() {
            shared.set_state(WorkerState::Stopped);
            return;
        }
        clocks.sleep(backoff);
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawFrame, Source};
    use crate::packet::TrackKind;
    use base::clock::SimulatedClocks;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn open_test_db() -> Arc<Mutex<rusqlite::Connection>> {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::migrate::upgrade(&mut conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn seed_stream(db: &Arc<Mutex<rusqlite::Connection>>, name: &str) -> Stream {
        let stream = Stream {
            name: name.to_string(),
            url: "rtsp://127.0.0.1/cam".to_string(),
            enabled: true,
            streaming_enabled: true,
            settings: db::stream::StreamSettings::default(),
        };
        db::stream::create(&db.lock().unwrap(), &stream).unwrap();
        stream
    }

    /// Opener that always fails, counting attempts; used to drive the
    /// reconnect/backoff path without a real camera.
    struct FailingOpener {
        attempts: Arc<AtomicUsize>,
    }

    impl Opener for FailingOpener {
        fn open(&self, _stream_name: &str, _url: &str) -> Result<Box<dyn Source>, Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(err!(Unavailable, "camera unreachable"))
        }
    }

    /// Opener whose source yields one keyframe then ends the stream.
    struct OneShotOpener;

    struct OneShotSource {
        yielded: bool,
    }

    impl Source for OneShotSource {
        fn next(&mut self) -> Result<RawFrame, Error> {
            if self.yielded {
                return Err(err!(Unavailable, "stream ended"));
            }
            self.yielded = true;
            Ok(RawFrame {
                data: Bytes::from_static(b"x"),
                pts: 0,
                dts: 0,
                duration: 0,
                is_keyframe: true,
                track: TrackKind::Video,
                new_parameters: false,
            })
        }

        fn has_audio(&self) -> bool {
            false
        }
    }

    impl Opener for OneShotOpener {
        fn open(&self, _stream_name: &str, _url: &str) -> Result<Box<dyn Source>, Error> {
            Ok(Box::new(OneShotSource { yielded: false }))
        }
    }

    #[test]
    fn add_stream_rejects_duplicates_and_bad_urls() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(FailingOpener { attempts: Arc::new(AtomicUsize::new(0)) }),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        let mut stream = seed_stream(&db, "cam1");
        stream.enabled = false;
        sup.add_stream(stream.clone()).unwrap();
        assert_eq!(sup.add_stream(stream).unwrap_err(), RegistryError::Duplicate);

        let bad = Stream {
            name: "cam2".to_string(),
            url: "not a url".to_string(),
            enabled: false,
            streaming_enabled: true,
            settings: db::stream::StreamSettings::default(),
        };
        assert_eq!(sup.add_stream(bad).unwrap_err(), RegistryError::Invalid);
    }

    #[test]
    fn capacity_exceeded_once_registry_is_full() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(FailingOpener { attempts: Arc::new(AtomicUsize::new(0)) }),
            1,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        let mut s1 = seed_stream(&db, "cam1");
        s1.enabled = false;
        sup.add_stream(s1).unwrap();
        let mut s2 = seed_stream(&db, "cam2");
        s2.enabled = false;
        assert_eq!(sup.add_stream(s2).unwrap_err(), RegistryError::CapacityExceeded);
    }

    #[test]
    fn worker_reaches_running_then_stops_on_explicit_disable() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let stream = seed_stream(&db, "cam1");
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(OneShotOpener),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        sup.add_stream(stream).unwrap();
        // `OneShotOpener` yields one keyframe per connection, then ends
        // the stream; the reconnect loop keeps reopening it, so it's
        // enough to wait for at least one packet to confirm the worker
        // reached `Running` before disabling it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if sup.list_workers()[0].packets_in >= 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker never produced a packet");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        sup.set_enabled("cam1", false).unwrap();
        assert_eq!(sup.list_workers()[0].state, WorkerState::Stopped);
        sup.shutdown();
    }

    #[tokio::test]
    async fn reconnect_failures_publish_degraded_after_threshold() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let stream = seed_stream(&db, "cam1");
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let attempts = Arc::new(AtomicUsize::new(0));
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            events,
            dir.path().to_path_buf(),
            Arc::new(FailingOpener { attempts: attempts.clone() }),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        sup.add_stream(stream).unwrap();
        let degraded = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(Event::StreamDegraded { consecutive_failures, .. }) = sub.recv().await {
                    break consecutive_failures;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(degraded, DEGRADED_THRESHOLD);
        assert!(attempts.load(Ordering::SeqCst) >= DEGRADED_THRESHOLD as usize);
        sup.shutdown();
    }

    #[test]
    fn remove_stream_drops_unknown_name() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db,
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(FailingOpener { attempts: Arc::new(AtomicUsize::new(0)) }),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        assert_eq!(sup.remove_stream("nope").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn trigger_motion_errs_without_a_running_worker() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(FailingOpener { attempts: Arc::new(AtomicUsize::new(0)) }),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        assert_eq!(sup.trigger_motion("cam1", db::motion::Source::Manual).unwrap_err(), RegistryError::NotFound);

        let mut stream = seed_stream(&db, "cam1");
        stream.enabled = false; // registered but not running, so still no motion thread
        sup.add_stream(stream).unwrap();
        assert_eq!(sup.trigger_motion("cam1", db::motion::Source::Manual).unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn trigger_motion_on_a_running_motion_enabled_worker_flips_motion_active() {
        let dir = tempdir().unwrap();
        let db = open_test_db();
        let mut stream = seed_stream(&db, "cam1");
        stream.settings.motion_recording = true;
        let sup = StreamSupervisor::new(
            SimulatedClocks::new(0),
            db.clone(),
            EventBus::new(),
            dir.path().to_path_buf(),
            Arc::new(OneShotOpener),
            8,
            MotionPool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
        );
        sup.add_stream(stream).unwrap();
        sup.trigger_motion("cam1", db::motion::Source::Manual).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let entry = sup.registry.lock().unwrap().get("cam1").unwrap().clone();
        loop {
            if entry.motion_active.load(Ordering::Relaxed) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "motion_active never flipped");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        sup.shutdown();
    }
}
