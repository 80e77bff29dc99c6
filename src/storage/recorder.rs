// 试验数据记录器
// Accumulates samples for the active test session and hands them to the persistence worker

use super::worker::PersistenceWorker;
use crate::types::{DataPointRecord, ParameterSample, TestSession};
use chrono::Local;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RecorderState {
    session: Option<TestSession>,
    /// Ticket of the create request whose id we are waiting for
    ticket: Option<u64>,
    next_ticket: u64,
    active: bool,
    recording: bool,
    history: BTreeMap<String, VecDeque<ParameterSample>>,
    /// Points not yet handed to the store
    unsaved: Vec<DataPointRecord>,
    /// Finalized sessions still waiting for their id, by ticket
    orphans: HashMap<u64, (TestSession, Vec<DataPointRecord>)>,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 36_000;

/// Session recorder (one session at a time)
pub struct SessionRecorder {
    state: Mutex<RecorderState>,
    worker: Arc<PersistenceWorker>,
    history_limit: usize,
}

impl SessionRecorder {
    pub fn new(worker: Arc<PersistenceWorker>) -> Self {
        Self { state: Mutex::new(RecorderState::default()), worker, history_limit: DEFAULT_HISTORY_LIMIT }
    }

    /// Bound the in-memory history of each parameter
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Open a new session; its id arrives later through `on_session_created`.
    ///
    /// An active session is finalized first.
    ///
    /// # Returns
    /// Ticket correlating the store's reply with this session
    pub fn begin_session(&self, test_type: &str) -> u64 {
        if self.is_active() {
            self.finalize();
        }
        let session = TestSession::new(test_type);
        let ticket = {
            let mut state = self.state.lock();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            // the previous session was closed before its id arrived
            if let (Some(pending), Some(previous)) = (state.ticket, state.session.take()) {
                let points = std::mem::take(&mut state.unsaved);
                log::debug!("Session '{}' parked until ticket {} is answered", previous.test_type, pending);
                state.orphans.insert(pending, (previous, points));
            }
            state.session = Some(session.clone());
            state.ticket = Some(ticket);
            state.active = true;
            state.history.clear();
            state.unsaved.clear();
            ticket
        };
        log::info!("Session '{}' opened (ticket {})", test_type, ticket);
        if let Err(err) = self.worker.create_session(ticket, session) {
            log::warn!("Session could not be created: {}", err);
        }
        ticket
    }

    /// Attach the id assigned by the store.
    ///
    /// # Returns
    /// `true` if the ticket belonged to the current session
    pub fn on_session_created(&self, ticket: u64, id: i64) -> bool {
        let orphan = self.state.lock().orphans.remove(&ticket);
        if let Some((session, points)) = orphan {
            self.persist_orphan(session, points, id);
            return false;
        }
        let (finalized, session) = {
            let mut state = self.state.lock();
            if state.ticket != Some(ticket) {
                return false;
            }
            state.ticket = None;
            let Some(session) = state.session.as_mut() else {
                return false;
            };
            session.id = id;
            let session = session.clone();
            for point in state.unsaved.iter_mut() {
                point.session_id = id;
            }
            (!state.active, session)
        };
        log::info!("Session id {} assigned", id);
        if finalized {
            // closed before the id arrived: persist the end time now
            if let Err(err) = self.worker.update_session(session) {
                log::warn!("Session {} could not be updated: {}", id, err);
            }
            self.flush();
        }
        true
    }

    fn persist_orphan(&self, mut session: TestSession, mut points: Vec<DataPointRecord>, id: i64) {
        session.id = id;
        for point in points.iter_mut() {
            point.session_id = id;
        }
        log::info!("Session id {} assigned to closed session '{}'", id, session.test_type);
        if let Err(err) = self.worker.update_session(session) {
            log::warn!("Session {} could not be updated: {}", id, err);
        }
        if !points.is_empty() {
            if let Err(err) = self.worker.save_data_points(points) {
                log::warn!("Data points of session {} could not be saved: {}", id, err);
            }
        }
    }

    pub fn set_recording(&self, recording: bool) {
        let mut state = self.state.lock();
        if state.recording != recording {
            log::info!("Recording {}", if recording { "started" } else { "stopped" });
        }
        state.recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Keep a sample if a session is active and recording is on
    pub fn record(&self, sample: &ParameterSample) -> bool {
        let mut state = self.state.lock();
        if !state.active || !state.recording {
            return false;
        }
        let session_id = state.session.as_ref().map_or(TestSession::UNASSIGNED, |s| s.id);
        state.unsaved.push(DataPointRecord {
            id: 0,
            session_id,
            parameter: sample.name.clone(),
            value: sample.value,
            timestamp: sample.timestamp,
        });
        let history = state.history.entry(sample.name.clone()).or_default();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(sample.clone());
        true
    }

    /// Hand unsaved points to the worker once the session id is known.
    ///
    /// # Returns
    /// Number of points submitted
    pub fn flush(&self) -> usize {
        let points = {
            let mut state = self.state.lock();
            let has_id = state.session.as_ref().is_some_and(TestSession::has_id);
            if !has_id || state.unsaved.is_empty() {
                return 0;
            }
            std::mem::take(&mut state.unsaved)
        };
        let count = points.len();
        match self.worker.save_data_points(points) {
            Ok(()) => {
                log::debug!("{} data points submitted", count);
                count
            }
            Err(err) => {
                log::warn!("Data points could not be saved: {}", err);
                0
            }
        }
    }

    /// Close the active session: stamp the end time, persist it and flush points
    pub fn finalize(&self) {
        let session = {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.recording = false;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            session.end_time = Some(Local::now());
            session.clone()
        };
        log::info!("Session '{}' finalized (id {})", session.test_type, session.id);
        if session.has_id() {
            if let Err(err) = self.worker.update_session(session) {
                log::warn!("Session could not be updated: {}", err);
            }
            self.flush();
        }
    }

    pub fn session(&self) -> Option<TestSession> {
        self.state.lock().session.clone()
    }

    /// Samples recorded for one parameter in the current session
    pub fn samples(&self, parameter: &str) -> Vec<ParameterSample> {
        self.state
            .lock()
            .history
            .get(parameter)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn parameters(&self) -> Vec<String> {
        self.state.lock().history.keys().cloned().collect()
    }

    pub fn point_count(&self, parameter: &str) -> usize {
        self.state.lock().history.get(parameter).map_or(0, VecDeque::len)
    }

    pub fn worker(&self) -> &PersistenceWorker {
        &self.worker
    }

    /// Periodic flush of unsaved points
    pub fn spawn_autosave(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if this.is_active() {
                    this.flush();
                }
            }
        })
    }
}
