//! Multi-device coordinator
//!
//! Owns every [`Session`] and the worker task running on it. Commands are
//! dispatched one at a time; a monitor task watches the active workers and
//! sends a single completion notice once they have all finished.

use super::error::{AcquisitionError, AcquisitionResult};
use super::identity::{IdentityClaims, IdentityResolver, IdentityTable};
use super::locator::{default_port_patterns, DeviceDescriptor, DeviceLocator, PortSource};
use super::logger::EventLog;
use super::notify::Notifier;
use super::protocol::{Mode, RunRequest};
use super::session::{RunOutcome, Session, SessionControl, SessionOptions, SessionState};
use super::transport::LinkConnector;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Options handed to every session
    pub session: SessionOptions,
    /// Hardware ID → logical ID
    pub identities: IdentityTable,
    /// Descriptor substrings of candidate ports
    pub port_patterns: Vec<String>,
    /// Upper bound on the boot handshake
    pub handshake_timeout: Duration,
    /// Poll period of the completion monitor
    pub monitor_interval: Duration,
    /// Completion notice recipient
    pub recipient: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            identities: IdentityTable::new(),
            port_patterns: default_port_patterns(),
            handshake_timeout: Duration::from_secs(15),
            monitor_interval: Duration::from_millis(100),
            recipient: String::new(),
        }
    }
}

#[derive(Clone)]
struct SessionSlot {
    control: Arc<SessionControl>,
    session: Arc<tokio::sync::Mutex<Session>>,
}

#[derive(Default)]
struct CoordinatorState {
    sessions: BTreeMap<i32, SessionSlot>,
    workers: HashMap<i32, JoinHandle<()>>,
    outcomes: BTreeMap<i32, RunOutcome>,
    last_mode: Option<Mode>,
}

struct Inner {
    options: CoordinatorOptions,
    connector: Arc<dyn LinkConnector>,
    notifier: Arc<dyn Notifier>,
    log: EventLog,
    state: Mutex<CoordinatorState>,
    /// Held while a command is being dispatched
    command_gate: tokio::sync::Mutex<()>,
    monitor_active: AtomicBool,
    /// Set while the monitor delivers its completion notice
    notice_pending: AtomicBool,
}

/// Drives all connected devices
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator with no sessions
    pub fn new(
        options: CoordinatorOptions,
        connector: Arc<dyn LinkConnector>,
        notifier: Arc<dyn Notifier>,
        log: EventLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                notifier,
                log: log.scoped("coordinator"),
                state: Mutex::new(CoordinatorState::default()),
                command_gate: tokio::sync::Mutex::new(()),
                monitor_active: AtomicBool::new(false),
                notice_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Event log handle
    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Find, connect and identify every device behind `source`.
    ///
    /// Sessions from an earlier call are shut down first. Returns false on an
    /// identity collision, an unknown hardware ID or when no device could be
    /// connected. Nothing stays connected in that case.
    pub async fn initialize(&self, source: &dyn PortSource) -> bool {
        let inner = &self.inner;
        let log = &inner.log;
        self.shutdown().await;

        for (logical_id, hardware_ids) in inner.options.identities.duplicate_logical_ids() {
            log.error(format!(
                "identity table maps {} to logical ID {}",
                hardware_ids.join(", "),
                logical_id
            ));
        }
        if !inner.options.identities.duplicate_logical_ids().is_empty() {
            return false;
        }

        let candidates = match DeviceLocator::new(source).candidates(&inner.options.port_patterns) {
            Ok(candidates) => candidates,
            Err(e) => {
                log.error(e.to_string());
                return false;
            }
        };
        log.info(format!("resolving {} candidate port(s)", candidates.len()));

        let resolver = IdentityResolver::new(
            inner.options.identities.clone(),
            inner.options.handshake_timeout,
            inner.options.session.read_timeout,
            log.clone(),
        );
        let tasks = candidates.into_iter().map(|descriptor| {
            let mut session = Session::new(
                descriptor,
                Arc::clone(&inner.connector),
                resolver.clone(),
                inner.options.session.clone(),
                log.clone(),
            );
            tokio::spawn(async move {
                let result = session.connect().await;
                (session, result)
            })
        });
        let results = join_all(tasks).await;

        let mut claims = IdentityClaims::default();
        let mut sessions = BTreeMap::new();
        let mut valid = true;
        for joined in results {
            let (mut session, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    log.error(format!("resolution worker failed: {}", e));
                    valid = false;
                    continue;
                }
            };
            let identity = match result {
                Ok(identity) => identity,
                Err(e) => {
                    log.warn(format!("skipping {}: {}", session.descriptor().port, e));
                    continue;
                }
            };
            if !identity.is_known() {
                let err = AcquisitionError::UnknownIdentity {
                    port: session.descriptor().port.clone(),
                    hardware_id: identity.hardware_id.clone(),
                };
                log.error(err.to_string());
                session.disconnect();
                valid = false;
                continue;
            }
            if let Err(e) = claims.claim(&identity) {
                log.error(e.to_string());
                session.disconnect();
                valid = false;
                continue;
            }
            sessions.insert(
                identity.logical_id,
                SessionSlot {
                    control: session.control(),
                    session: Arc::new(tokio::sync::Mutex::new(session)),
                },
            );
        }

        if !valid || sessions.is_empty() {
            if sessions.is_empty() && valid {
                log.error("no device could be initialized");
            }
            for slot in sessions.values() {
                slot.session.lock().await.disconnect();
            }
            return false;
        }

        log.info(format!(
            "initialized device(s) {}",
            sessions.keys().map(i32::to_string).collect::<Vec<_>>().join(", ")
        ));
        inner.state.lock().sessions = sessions;
        true
    }

    /// Start `mode` on every device, returning how many workers started.
    ///
    /// STOP cancels every running worker instead.
    pub async fn run<S: AsRef<str>>(&self, mode: Mode, params: &[S]) -> AcquisitionResult<usize> {
        let request = RunRequest::new(mode, params)?;
        self.run_request(&request).await
    }

    /// [`run`](Self::run) with a prepared request
    pub async fn run_request(&self, request: &RunRequest) -> AcquisitionResult<usize> {
        if request.mode() == Mode::Stop {
            self.stop_all().await;
            return Ok(0);
        }

        {
            let mut state = self.inner.state.lock();
            if !self.inner.monitor_active.load(Ordering::SeqCst) {
                state.outcomes.clear();
            }
            state.last_mode = Some(request.mode());
        }

        let mut started = 0;
        for id in self.session_ids() {
            match self.run_command_request(id, request).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => self.inner.log.error(e.to_string()),
            }
        }

        if started > 0 {
            self.ensure_monitor();
        }
        Ok(started)
    }

    /// Start `mode` on one device, replacing whatever it was running
    pub async fn run_command<S: AsRef<str>>(&self, id: i32, mode: Mode, params: &[S]) -> AcquisitionResult<bool> {
        let request = RunRequest::new(mode, params)?;
        let started = self.run_command_request(id, &request).await?;
        if started {
            self.ensure_monitor();
        }
        Ok(started)
    }

    /// Replace the worker of `id` with one executing `request`.
    ///
    /// A running worker is cancelled and awaited first. Returns whether a new
    /// worker was started, which STOP never does.
    async fn run_command_request(&self, id: i32, request: &RunRequest) -> AcquisitionResult<bool> {
        let inner = &self.inner;
        let _gate = inner.command_gate.lock().await;

        let (slot, previous) = {
            let mut state = inner.state.lock();
            let slot = state
                .sessions
                .get(&id)
                .cloned()
                .ok_or(AcquisitionError::UnknownDevice(id))?;
            (slot, state.workers.remove(&id))
        };

        if let Some(handle) = previous {
            inner.log.debug(format!("stopping current run on device {}", id));
            slot.control.cancel();
            if let Err(e) = handle.await {
                inner.log.error(format!("worker for device {} failed: {}", id, e));
            }
        }

        if request.mode() == Mode::Stop {
            return Ok(false);
        }
        if slot.control.state() == SessionState::Failed {
            return Err(AcquisitionError::SessionFailed(id));
        }

        slot.control.arm();
        let mode = request.mode();
        let worker_inner = Arc::clone(inner);
        let request = request.clone();
        let session = Arc::clone(&slot.session);
        let handle = tokio::spawn(async move {
            let outcome = {
                let mut session = session.lock().await;
                session.execute(&request).await
            };
            worker_inner.state.lock().outcomes.insert(id, outcome);
        });
        inner.state.lock().workers.insert(id, handle);
        inner.log.info(format!("device {}: {} started", id, mode));
        Ok(true)
    }

    /// Cancel every running worker and wait for all of them
    pub async fn stop_all(&self) {
        let _gate = self.inner.command_gate.lock().await;
        let handles: Vec<(i32, JoinHandle<()>)> = {
            let mut state = self.inner.state.lock();
            let workers: Vec<_> = state.workers.drain().collect();
            for (id, _) in &workers {
                if let Some(slot) = state.sessions.get(id) {
                    slot.control.cancel();
                }
            }
            workers
        };
        if handles.is_empty() {
            return;
        }

        self.inner.log.info(format!("stopping {} worker(s)", handles.len()));
        let (ids, handles): (Vec<i32>, Vec<_>) = handles.into_iter().unzip();
        for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                self.inner.log.error(format!("worker for device {} failed: {}", id, e));
            }
        }
    }

    /// Stop every worker, then reconnect every session one after another
    pub async fn reset_all(&self) -> AcquisitionResult<()> {
        self.stop_all().await;
        let _gate = self.inner.command_gate.lock().await;

        let slots: Vec<(i32, SessionSlot)> = self
            .inner
            .state
            .lock()
            .sessions
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut first_error = None;
        for (id, slot) in slots {
            let mut session = slot.session.lock().await;
            if let Err(e) = Self::reconnect_session(id, &mut session).await {
                self.inner.log.error(format!("device {}: {}", id, e));
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reconnect one device, clearing a failed state
    pub async fn reconnect(&self, id: i32) -> AcquisitionResult<()> {
        self.run_command_request(id, &RunRequest::stop()).await?;
        let _gate = self.inner.command_gate.lock().await;
        let slot = self
            .inner
            .state
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(AcquisitionError::UnknownDevice(id))?;
        let mut session = slot.session.lock().await;
        Self::reconnect_session(id, &mut session).await
    }

    async fn reconnect_session(id: i32, session: &mut Session) -> AcquisitionResult<()> {
        let identity = session.reconnect().await?;
        if identity.logical_id != id {
            session.disconnect();
            return Err(AcquisitionError::UnknownIdentity {
                port: session.descriptor().port.clone(),
                hardware_id: identity.hardware_id,
            });
        }
        Ok(())
    }

    /// Wait until no worker runs and any pending completion notice was sent
    pub async fn wait_idle(&self) {
        loop {
            let idle = {
                let mut state = self.inner.state.lock();
                state.workers.retain(|_, h| !h.is_finished());
                state.workers.is_empty()
                    && !self.inner.monitor_active.load(Ordering::SeqCst)
                    && !self.inner.notice_pending.load(Ordering::SeqCst)
            };
            if idle {
                return;
            }
            tokio::time::sleep(self.inner.options.monitor_interval).await;
        }
    }

    /// Stop all workers and disconnect every session
    pub async fn shutdown(&self) {
        self.stop_all().await;
        let slots: Vec<SessionSlot> = std::mem::take(&mut self.inner.state.lock().sessions).into_values().collect();
        for slot in slots {
            slot.session.lock().await.disconnect();
        }
    }

    /// Logical IDs of all sessions
    pub fn session_ids(&self) -> Vec<i32> {
        self.inner.state.lock().sessions.keys().copied().collect()
    }

    /// Logical IDs with a worker still running
    pub fn active_devices(&self) -> Vec<i32> {
        let state = self.inner.state.lock();
        let mut ids: Vec<i32> = state
            .workers
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Port and identity of every session, by logical ID
    pub async fn descriptors(&self) -> Vec<DeviceDescriptor> {
        let slots: Vec<SessionSlot> = self.inner.state.lock().sessions.values().cloned().collect();
        let mut descriptors = Vec::with_capacity(slots.len());
        for slot in slots {
            descriptors.push(slot.session.lock().await.descriptor().clone());
        }
        descriptors
    }

    /// State of one session
    pub fn session_state(&self, id: i32) -> Option<SessionState> {
        self.inner.state.lock().sessions.get(&id).map(|s| s.control.state())
    }

    /// Outcomes of the current or last run, by logical ID
    pub fn outcomes(&self) -> BTreeMap<i32, RunOutcome> {
        self.inner.state.lock().outcomes.clone()
    }

    /// Start the completion monitor unless one is running.
    ///
    /// Checked under the state lock so a monitor that is just finishing can
    /// not miss newly started workers.
    fn ensure_monitor(&self) {
        let state = self.inner.state.lock();
        if state.workers.is_empty() {
            return;
        }
        if !self.inner.monitor_active.swap(true, Ordering::SeqCst) {
            tokio::spawn(monitor(Arc::clone(&self.inner)));
        }
    }
}

/// Poll the workers until none is left, then notify once
async fn monitor(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.options.monitor_interval);
    loop {
        ticker.tick().await;
        let dispatching = inner.command_gate.try_lock().is_err();

        let (subject, body) = {
            let mut state = inner.state.lock();
            state.workers.retain(|_, h| !h.is_finished());
            if dispatching || !state.workers.is_empty() {
                continue;
            }
            inner.notice_pending.store(true, Ordering::SeqCst);
            inner.monitor_active.store(false, Ordering::SeqCst);
            summarize(state.last_mode, &state.outcomes)
        };

        inner.log.info(subject.clone());
        if let Err(e) = inner.notifier.notify(&subject, &body, &inner.options.recipient) {
            inner.log.error(format!("completion notice not sent: {}", e));
        }
        inner.notice_pending.store(false, Ordering::SeqCst);
        return;
    }
}

fn summarize(mode: Option<Mode>, outcomes: &BTreeMap<i32, RunOutcome>) -> (String, String) {
    let mode = mode.map_or("Measurement", |m| m.name());
    let failed = outcomes.values().filter(|o| matches!(o, RunOutcome::Failed { .. })).count();
    let subject = if failed == 0 {
        format!("{} run finished on {} device(s)", mode, outcomes.len())
    } else {
        format!("{} run finished, {} of {} device(s) failed", mode, failed, outcomes.len())
    };
    let body = outcomes
        .iter()
        .map(|(id, outcome)| format!("device {}: {}", id, outcome.summary()))
        .collect::<Vec<_>>()
        .join("\n");
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::locator::StaticPorts;
    use crate::core::notify::MockNotifier;
    use crate::core::simulator::{SimBench, VirtualDevice};
    use std::sync::atomic::AtomicUsize;

    fn bench(devices: &[(&str, VirtualDevice)]) -> SimBench {
        devices
            .iter()
            .fold(SimBench::new(), |bench, (port, device)| bench.with_device(port, device.clone()))
    }

    fn coordinator(bench: &SimBench, dir: &std::path::Path, notifier: Arc<dyn Notifier>) -> Coordinator {
        let options = CoordinatorOptions {
            session: SessionOptions {
                read_timeout: Duration::from_millis(50),
                data_dir: dir.to_path_buf(),
                ..SessionOptions::default()
            },
            identities: IdentityTable::from_pairs([("AAA", 0), ("BBB", 1)]),
            handshake_timeout: Duration::from_secs(2),
            ..CoordinatorOptions::default()
        };
        Coordinator::new(options, Arc::new(bench.clone()), notifier, EventLog::default())
    }

    fn counting_notifier(count: Arc<AtomicUsize>) -> Arc<dyn Notifier> {
        let mut mock = MockNotifier::new();
        mock.expect_notify().returning(move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Arc::new(mock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_assigns_logical_ids() {
        let dir = tempfile::tempdir().unwrap();
        let bench = bench(&[("COM3", VirtualDevice::new("BBB")), ("COM4", VirtualDevice::new("AAA"))]);
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));

        assert!(coordinator.initialize(&bench).await);
        assert_eq!(coordinator.session_ids(), vec![0, 1]);
        assert_eq!(coordinator.session_state(1), Some(SessionState::Idle));

        let descriptors = coordinator.descriptors().await;
        assert_eq!(descriptors[0].port, "COM4");
        assert_eq!(descriptors[1].hardware_id.as_deref(), Some("BBB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_fails_and_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let bench = bench(&[("COM3", VirtualDevice::new("AAA")), ("COM4", VirtualDevice::new("AAA"))]);
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));

        assert!(!coordinator.initialize(&bench).await);
        assert!(coordinator.session_ids().is_empty());
        assert!(!coordinator.log().entries_at_least(crate::core::logger::Level::Error).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_identity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bench = bench(&[("COM3", VirtualDevice::new("AAA")), ("COM4", VirtualDevice::new("ZZZ"))]);
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));

        assert!(!coordinator.initialize(&bench).await);
        let errors = coordinator.log().entries_at_least(crate::core::logger::Level::Error);
        assert!(errors.iter().any(|e| e.message.contains("ZZZ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reinitialize_drops_previous_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let a = VirtualDevice::new("AAA");
        let bench = bench(&[
            ("COM3", a.clone()),
            ("COM4", VirtualDevice::new("BBB")),
            ("COM5", VirtualDevice::new("ZZZ")),
        ]);
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));
        let known = StaticPorts(vec![
            DeviceDescriptor::new("COM3", "USB-SERIAL CH340"),
            DeviceDescriptor::new("COM4", "USB-SERIAL CH340"),
        ]);

        assert!(coordinator.initialize(&known).await);
        assert_eq!(coordinator.session_ids(), vec![0, 1]);

        assert!(!coordinator.initialize(&bench).await);
        assert!(coordinator.session_ids().is_empty());
        assert_eq!(coordinator.session_state(0), None);
        assert_eq!(a.opens(), 2);
        assert_eq!(coordinator.run(Mode::ConstantVoltage, &["0.8"]).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_table_rejected_before_opening_ports() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA");
        let bench = bench(&[("COM3", device.clone())]);
        let options = CoordinatorOptions {
            identities: IdentityTable::from_pairs([("AAA", 0), ("BBB", 0)]),
            session: SessionOptions {
                data_dir: dir.path().to_path_buf(),
                ..SessionOptions::default()
            },
            ..CoordinatorOptions::default()
        };
        let coordinator = Coordinator::new(options, Arc::new(bench.clone()), Arc::new(MockNotifier::new()), EventLog::default());

        assert!(!coordinator.initialize(&bench).await);
        assert_eq!(device.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_command_replaces_busy_worker() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA")
            .with_rows(50)
            .with_row_interval(Duration::from_millis(100));
        let bench = bench(&[("COM3", device.clone())]);
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = coordinator(&bench, dir.path(), counting_notifier(Arc::clone(&count)));
        assert!(coordinator.initialize(&bench).await);

        assert!(coordinator.run_command(0, Mode::Scan, &["1.2", "0.03", "3", "50", "1"]).await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(coordinator.active_devices(), vec![0]);

        assert!(coordinator.run_command(0, Mode::ConstantVoltage, &["0.8"]).await.unwrap());
        // the first worker has already pulsed reset and exited
        assert_eq!(device.resets(), 2);

        coordinator.wait_idle().await;
        assert_eq!(device.received().len(), 2);
        assert!(device.received()[1].starts_with("constantVoltage,0.8"));
        assert!(matches!(coordinator.outcomes()[&0], RunOutcome::Completed { rows: 50, .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_all_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = VirtualDevice::new("AAA").with_rows(100).with_row_interval(Duration::from_millis(100));
        let b = VirtualDevice::new("BBB").with_rows(100).with_row_interval(Duration::from_millis(100));
        let bench = bench(&[("COM3", a), ("COM4", b)]);

        let mut mock = MockNotifier::new();
        mock.expect_notify()
            .withf(|subject, body, _| subject.contains("PNO") && body.contains("device 1: cancelled"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let coordinator = coordinator(&bench, dir.path(), Arc::new(mock));
        assert!(coordinator.initialize(&bench).await);

        let started = coordinator.run(Mode::Pno, &["0.5", "0.01", "5", "300", "60"]).await.unwrap();
        assert_eq!(started, 2);
        tokio::time::sleep(Duration::from_millis(500)).await;

        coordinator.run(Mode::Stop, &[] as &[&str]).await.unwrap();
        assert!(coordinator.active_devices().is_empty());
        coordinator.wait_idle().await;

        let outcomes = coordinator.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.values().all(|o| matches!(o, RunOutcome::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_needs_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_fault_after(2);
        let bench = bench(&[("COM3", device.clone())]);
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = coordinator(&bench, dir.path(), counting_notifier(count));
        assert!(coordinator.initialize(&bench).await);

        coordinator.run(Mode::Scan, &["1.2", "0.03", "3", "50", "0"]).await.unwrap();
        coordinator.wait_idle().await;
        assert_eq!(coordinator.session_state(0), Some(SessionState::Failed));

        let err = coordinator.run_command(0, Mode::Scan, &["1.2", "0.03", "3", "50", "0"]).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::SessionFailed(0)));

        device.replug();
        coordinator.reconnect(0).await.unwrap();
        assert_eq!(coordinator.session_state(0), Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_reconnects_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let a = VirtualDevice::new("AAA");
        let b = VirtualDevice::new("BBB");
        let bench = bench(&[("COM3", a.clone()), ("COM4", b.clone())]);
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));
        assert!(coordinator.initialize(&bench).await);

        coordinator.reset_all().await.unwrap();
        assert_eq!(a.opens(), 2);
        assert_eq!(b.opens(), 2);
        assert_eq!(coordinator.session_state(0), Some(SessionState::Idle));
        assert_eq!(coordinator.session_state(1), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_unknown_device_and_bad_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let bench = SimBench::new();
        let coordinator = coordinator(&bench, dir.path(), Arc::new(MockNotifier::new()));

        let err = coordinator.run_command(7, Mode::ConstantVoltage, &["0.8"]).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::UnknownDevice(7)));
        let err = coordinator.run(Mode::Scan, &["1.2"]).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidParameters(_)));
    }
}
