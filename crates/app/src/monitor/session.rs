//! Single-session lifecycle.
//!
//! `SessionManager` owns the one active monitoring session. Start and stop are
//! serialized by the lifecycle lock; status and stream readers go through a
//! separate read lock that is only held long enough to clone an `Arc`, so they
//! never wait on a teardown in progress.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
    thread::JoinHandle,
};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use pose_core::PoseProvider;
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use video_ingest::{
    CaptureError, CaptureHandle, CaptureInterrupt, CaptureOpener, CaptureSource, Frame,
};

use crate::monitor::{
    config::MonitorConfig,
    data::{FramePacket, SessionId, SharedFrame, StatusSnapshot},
    notify::AlertSink,
    pipeline::{PipelineContext, spawn_pipeline},
    watchdog::PipelineHealth,
};

const NO_FALL_TIME: i64 = i64::MIN;

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("No active session")]
    NoActiveSession,
    #[error("Failed to open camera {uri}: {source}")]
    CaptureOpen {
        uri: String,
        #[source]
        source: CaptureError,
    },
    #[error("Failed to read from camera {uri}: {source}")]
    CaptureValidation {
        uri: String,
        #[source]
        source: CaptureError,
    },
    #[error("failed to start monitoring thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SessionError {
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            SessionError::InvalidRequest(_) => 400,
            SessionError::NoActiveSession => 404,
            SessionError::CaptureOpen { .. }
            | SessionError::CaptureValidation { .. }
            | SessionError::Spawn(_) => 500,
        }
    }
}

/// State of one session shared between its pipeline (sole writer) and readers.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) started_at: DateTime<Utc>,
    running: AtomicBool,
    fall_detected: AtomicBool,
    fall_time_ms: AtomicI64,
    consecutive: AtomicU32,
    latest: SharedFrame,
    last_snapshot: Mutex<Option<Arc<Frame>>>,
    pub(crate) health: PipelineHealth,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            fall_detected: AtomicBool::new(false),
            fall_time_ms: AtomicI64::new(NO_FALL_TIME),
            consecutive: AtomicU32::new(0),
            latest: Mutex::new(None),
            last_snapshot: Mutex::new(None),
            health: PipelineHealth::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the pipeline to exit. `running` never goes back to true.
    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn is_fall_detected(&self) -> bool {
        self.fall_detected.load(Ordering::Acquire)
    }

    pub(crate) fn consecutive_candidates(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub(crate) fn fall_time(&self) -> Option<DateTime<Utc>> {
        match self.fall_time_ms.load(Ordering::Acquire) {
            NO_FALL_TIME => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub(crate) fn record_state(&self, fall_detected: bool, consecutive: u32) {
        self.consecutive.store(consecutive, Ordering::Release);
        self.fall_detected.store(fall_detected, Ordering::Release);
    }

    pub(crate) fn record_fall(&self, at: DateTime<Utc>, snapshot: Arc<Frame>) {
        self.fall_time_ms.store(at.timestamp_millis(), Ordering::Release);
        *self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    pub(crate) fn last_snapshot(&self) -> Option<Arc<Frame>> {
        self.last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published frame.
    pub(crate) fn publish_frame(&self, packet: FramePacket) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(packet);
    }

    pub(crate) fn latest_frame(&self) -> Option<FramePacket> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            session_id: Some(self.id.clone()),
            running: self.is_running(),
            fall_detected: self.is_fall_detected(),
            fall_time: self.fall_time(),
            consecutive_candidates: self.consecutive_candidates(),
            timestamp: Utc::now(),
        }
    }
}

/// External collaborators a session needs.
#[derive(Clone)]
pub(crate) struct MonitorBackends {
    pub(crate) opener: Arc<dyn CaptureOpener>,
    pub(crate) pose: Arc<dyn PoseProvider>,
    pub(crate) alerts: Arc<dyn AlertSink>,
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    thread: Option<JoinHandle<()>>,
    /// Yields the capture handle once the pipeline loop has exited.
    done: Receiver<CaptureHandle>,
    /// Aborts a read the pipeline is blocked in.
    interrupter: Option<Arc<dyn CaptureInterrupt>>,
}

pub(crate) struct SessionManager {
    config: Arc<MonitorConfig>,
    backends: MonitorBackends,
    slot: Mutex<Option<ActiveSession>>,
    published: RwLock<Option<Arc<SessionShared>>>,
}

impl SessionManager {
    pub(crate) fn new(config: MonitorConfig, backends: MonitorBackends) -> Self {
        Self {
            config: Arc::new(config),
            backends,
            slot: Mutex::new(None),
            published: RwLock::new(None),
        }
    }

    /// Start monitoring `source`, stopping any active session first.
    pub(crate) fn start(
        &self,
        session_id: SessionId,
        source: CaptureSource,
    ) -> Result<SessionId, SessionError> {
        if session_id.is_blank() {
            return Err(SessionError::InvalidRequest(
                "session_id is required".to_string(),
            ));
        }
        let span = info_span!("session.start", session = %session_id, source = %source.uri);
        let _enter = span.enter();

        let mut slot = self.lock_slot();
        if let Some(previous) = slot.take() {
            info!("stopping session {} before starting a new one", previous.shared.id);
            self.teardown(previous);
        }

        let device = self
            .backends
            .opener
            .open(&source, &self.config.capture)
            .map_err(|source_err| SessionError::CaptureOpen {
                uri: source.uri.clone(),
                source: source_err,
            })?;
        let mut handle = CaptureHandle::new(device, source.uri.clone());
        let first_frame = match handle.read() {
            Ok(frame) => frame,
            Err(err) => {
                handle.release();
                return Err(SessionError::CaptureValidation {
                    uri: source.uri,
                    source: err,
                });
            }
        };
        info!(
            width = first_frame.width,
            height = first_frame.height,
            kind = ?source.kind,
            "capture validated"
        );

        let shared = Arc::new(SessionShared::new(session_id.clone()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let interrupter = handle.interrupter();
        let ctx = PipelineContext {
            shared: Arc::clone(&shared),
            config: Arc::clone(&self.config),
            pose: Arc::clone(&self.backends.pose),
            alerts: Arc::clone(&self.backends.alerts),
        };
        let thread = spawn_pipeline(ctx, handle, done_tx).map_err(SessionError::Spawn)?;

        *slot = Some(ActiveSession {
            shared: Arc::clone(&shared),
            thread: Some(thread),
            done: done_rx,
            interrupter,
        });
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(shared);
        info!("monitoring started");
        Ok(session_id)
    }

    /// Stop the active session and release its capture device.
    pub(crate) fn stop(&self) -> Result<SessionId, SessionError> {
        let mut slot = self.lock_slot();
        let active = slot.take().ok_or(SessionError::NoActiveSession)?;
        let id = active.shared.id.clone();
        let span = info_span!("session.stop", session = %id);
        let _enter = span.enter();
        let started_at = active.shared.started_at;
        self.teardown(active);
        let elapsed = Utc::now().signed_duration_since(started_at);
        info!(seconds = elapsed.num_seconds(), "monitoring stopped");
        Ok(id)
    }

    pub(crate) fn status(&self) -> StatusSnapshot {
        match self.current() {
            Some(shared) => shared.status(),
            None => StatusSnapshot::idle(),
        }
    }

    /// The published session, if any. Never waits on start or stop.
    pub(crate) fn current(&self) -> Option<Arc<SessionShared>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop whatever is running; used when the server exits.
    pub(crate) fn shutdown(&self) {
        match self.stop() {
            Ok(id) => info!("stopped session {id} during shutdown"),
            Err(SessionError::NoActiveSession) => {}
            Err(err) => warn!("shutdown stop failed: {err}"),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal the pipeline, wait a bounded time for it, release the device and
    /// unpublish the session. Called with the lifecycle lock held.
    ///
    /// A pipeline blocked in a read past `join_timeout` has its device
    /// interrupted and is waited on once more, so the device is closed before
    /// the lock is given up.
    fn teardown(&self, mut active: ActiveSession) {
        let id = active.shared.id.clone();
        active.shared.request_stop();

        let mut returned = active.done.recv_timeout(self.config.join_timeout);
        if matches!(returned, Err(RecvTimeoutError::Timeout)) {
            match active.interrupter.as_ref() {
                Some(interrupter) => {
                    warn!(
                        "pipeline for session {id} did not exit within {:?}; interrupting capture",
                        self.config.join_timeout
                    );
                    interrupter.interrupt();
                    returned = active.done.recv_timeout(self.config.join_timeout);
                }
                None => warn!("capture for session {id} cannot be interrupted"),
            }
        }

        match returned {
            Ok(mut handle) => {
                handle.release();
                if let Some(thread) = active.thread.take() {
                    if thread.join().is_err() {
                        warn!("pipeline thread for session {id} panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                error!("pipeline for session {id} is stuck; detaching it with its capture open");
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("pipeline for session {id} exited without returning its capture");
                if let Some(thread) = active.thread.take() {
                    let _ = thread.join();
                }
            }
        }
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let active = self
            .slot
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            self.teardown(active);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::Condvar,
        thread,
        time::{Duration, Instant},
    };

    use pose_core::{PoseError, PoseLandmarks};
    use video_ingest::{CaptureDevice, CaptureSettings, FrameFormat};

    use super::*;
    use crate::monitor::notify::FallAlert;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Event {
        Open(String),
        Release(String),
    }

    pub(crate) type EventLog = Arc<Mutex<Vec<Event>>>;

    pub(crate) fn test_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![40; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    struct FakeDevice {
        uri: String,
        log: EventLog,
        remaining: Option<usize>,
        fail_reads: bool,
    }

    impl CaptureDevice for FakeDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            thread::sleep(Duration::from_millis(2));
            if self.fail_reads {
                return Err(CaptureError::Read("no signal".into()));
            }
            match self.remaining.as_mut() {
                Some(0) => return Err(CaptureError::Closed),
                Some(left) => *left -= 1,
                None => {}
            }
            Ok(test_frame(32, 24))
        }

        fn release(&mut self) {
            self.log
                .lock()
                .unwrap()
                .push(Event::Release(self.uri.clone()));
        }
    }

    /// Latch shared between a blocking device and its interrupter.
    #[derive(Default)]
    struct Latch {
        tripped: Mutex<bool>,
        signal: Condvar,
    }

    impl CaptureInterrupt for Latch {
        fn interrupt(&self) {
            *self.tripped.lock().unwrap() = true;
            self.signal.notify_all();
        }
    }

    /// Serves one frame, then blocks in `read` until interrupted.
    struct StalledDevice {
        uri: String,
        log: EventLog,
        served: bool,
        latch: Arc<Latch>,
    }

    impl CaptureDevice for StalledDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            if !self.served {
                self.served = true;
                return Ok(test_frame(32, 24));
            }
            let tripped = self.latch.tripped.lock().unwrap();
            let (_tripped, _) = self
                .latch
                .signal
                .wait_timeout_while(tripped, Duration::from_secs(10), |tripped| !*tripped)
                .unwrap();
            Err(CaptureError::Closed)
        }

        fn release(&mut self) {
            self.log
                .lock()
                .unwrap()
                .push(Event::Release(self.uri.clone()));
        }

        fn interrupter(&self) -> Option<Arc<dyn CaptureInterrupt>> {
            Some(Arc::clone(&self.latch) as Arc<dyn CaptureInterrupt>)
        }
    }

    /// Opens fake devices. `missing` fails to open, `broken` fails every read,
    /// `short` closes after a handful of frames and `stalled` hangs after its
    /// first frame.
    #[derive(Default)]
    pub(crate) struct FakeOpener {
        pub(crate) log: EventLog,
    }

    impl CaptureOpener for FakeOpener {
        fn open(
            &self,
            source: &CaptureSource,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            if source.uri == "missing" {
                return Err(CaptureError::Open {
                    uri: source.uri.clone(),
                });
            }
            self.log.lock().unwrap().push(Event::Open(source.uri.clone()));
            if source.uri == "stalled" {
                return Ok(Box::new(StalledDevice {
                    uri: source.uri.clone(),
                    log: Arc::clone(&self.log),
                    served: false,
                    latch: Arc::default(),
                }));
            }
            Ok(Box::new(FakeDevice {
                uri: source.uri.clone(),
                log: Arc::clone(&self.log),
                remaining: (source.uri == "short").then_some(4),
                fail_reads: source.uri == "broken",
            }))
        }
    }

    pub(crate) struct NoPose;

    impl PoseProvider for NoPose {
        fn detect(&self, _frame: &Frame) -> Result<Option<PoseLandmarks>, PoseError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) alerts: Mutex<Vec<FallAlert>>,
    }

    impl AlertSink for RecordingSink {
        fn dispatch(&self, alert: FallAlert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    pub(crate) fn manager_with_log() -> (SessionManager, EventLog) {
        manager_with_join_timeout(MonitorConfig::default().join_timeout)
    }

    fn manager_with_join_timeout(join_timeout: Duration) -> (SessionManager, EventLog) {
        let opener = FakeOpener::default();
        let log = Arc::clone(&opener.log);
        let backends = MonitorBackends {
            opener: Arc::new(opener),
            pose: Arc::new(NoPose),
            alerts: Arc::new(RecordingSink::default()),
        };
        let config = MonitorConfig {
            read_retry: Duration::from_millis(5),
            join_timeout,
            ..MonitorConfig::default()
        };
        (SessionManager::new(config, backends), log)
    }

    fn source(uri: &str) -> CaptureSource {
        CaptureSource::from_request(uri, "ip")
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn restarting_releases_previous_device_before_opening_next() {
        let (manager, log) = manager_with_log();
        manager.start(SessionId::from(1), source("cam-a")).expect("first start");
        manager.start(SessionId::from(2), source("cam-b")).expect("second start");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Open("cam-a".into()),
                Event::Release("cam-a".into()),
                Event::Open("cam-b".into()),
            ]
        );
        assert_eq!(manager.status().session_id, Some(SessionId::from(2)));

        manager.stop().expect("stop");
        assert_eq!(log.lock().unwrap().last(), Some(&Event::Release("cam-b".into())));
        let status = manager.status();
        assert!(!status.running);
        assert_eq!(status.session_id, None);
    }

    #[test]
    fn restart_interrupts_stalled_read_before_opening_next() {
        let (manager, log) = manager_with_join_timeout(Duration::from_millis(200));
        manager.start(SessionId::from(1), source("stalled")).expect("first start");
        manager.start(SessionId::from(2), source("cam-b")).expect("second start");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Open("stalled".into()),
                Event::Release("stalled".into()),
                Event::Open("cam-b".into()),
            ]
        );
        manager.stop().expect("stop");
    }

    #[test]
    fn stop_releases_stalled_device_before_returning() {
        let (manager, log) = manager_with_join_timeout(Duration::from_millis(200));
        manager.start(SessionId::from(4), source("stalled")).expect("start");
        let began = Instant::now();
        manager.stop().expect("stop");
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Open("stalled".into()),
                Event::Release("stalled".into()),
            ]
        );
        assert!(manager.current().is_none());
    }

    #[test]
    fn failed_open_leaves_manager_idle() {
        let (manager, log) = manager_with_log();
        let err = manager
            .start(SessionId::from("abc"), source("missing"))
            .expect_err("open must fail");
        assert!(matches!(err, SessionError::CaptureOpen { .. }));
        assert_eq!(err.status_code(), 500);
        let status = manager.status();
        assert!(!status.running);
        assert!(!status.fall_detected);
        assert_eq!(status.session_id, None);
        assert!(manager.current().is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_validation_read_releases_device() {
        let (manager, log) = manager_with_log();
        let err = manager
            .start(SessionId::from(3), source("broken"))
            .expect_err("validation must fail");
        assert!(matches!(err, SessionError::CaptureValidation { .. }));
        assert!(manager.current().is_none());
        assert_eq!(
            *log.lock().unwrap(),
            vec![Event::Open("broken".into()), Event::Release("broken".into())]
        );
    }

    #[test]
    fn stop_without_session_reports_error() {
        let (manager, log) = manager_with_log();
        let err = manager.stop().expect_err("nothing to stop");
        assert!(matches!(err, SessionError::NoActiveSession));
        assert_eq!(err.status_code(), 404);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn blank_session_id_is_rejected() {
        let (manager, log) = manager_with_log();
        let err = manager
            .start(SessionId::from("  "), source("cam-a"))
            .expect_err("blank id");
        assert_eq!(err.status_code(), 400);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn closed_source_releases_device_exactly_once() {
        let (manager, log) = manager_with_log();
        manager.start(SessionId::from(4), source("short")).expect("start");
        let shared = manager.current().expect("published session");
        assert!(wait_until(|| !shared.is_running()));
        assert!(wait_until(|| log.lock().unwrap().len() == 2));

        manager.stop().expect("stop after self-termination");
        let releases = log
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, Event::Release(_)))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn pipeline_publishes_encoded_frames() {
        let (manager, _log) = manager_with_log();
        manager.start(SessionId::from(5), source("cam-a")).expect("start");
        let shared = manager.current().expect("published session");
        assert!(wait_until(|| shared.latest_frame().is_some()));
        let packet = shared.latest_frame().expect("frame");
        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);
        assert!(manager.status().running);
        manager.stop().expect("stop");
        assert!(!shared.is_running());
    }
}
