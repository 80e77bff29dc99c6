// 持久化工作线程
// Store operations run on a dedicated OS thread so disk latency never reaches the polling tasks

use super::store::SessionStore;
use crate::error::StoreError;
use crate::events::EventBus;
use crate::types::{DataPointRecord, StoreEvent, TestSession};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::thread::JoinHandle;

#[derive(Debug)]
enum StoreOp {
    CreateSession { ticket: u64, session: TestSession },
    UpdateSession(TestSession),
    SaveDataPoints(Vec<DataPointRecord>),
    LoadSessions { from: DateTime<Local>, to: DateTime<Local>, test_type: Option<String> },
    LoadDataPoints { session_id: i64, parameter: Option<String> },
    Shutdown,
}

/// Handle to the persistence thread. Results come back as `StoreEvent`s.
pub struct PersistenceWorker {
    tx: flume::Sender<StoreOp>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWorker {
    /// Spawn the worker thread
    ///
    /// # Arguments
    /// * `store` - Backend moved onto the worker thread
    /// * `events` - Bus used to publish results
    pub fn start(store: Box<dyn SessionStore>, events: EventBus) -> Result<Self, StoreError> {
        let (tx, rx) = flume::unbounded();
        let thread = std::thread::Builder::new()
            .name("session-store".into())
            .spawn(move || Self::run(store, rx, events))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { tx, thread: Mutex::new(Some(thread)) })
    }

    fn run(mut store: Box<dyn SessionStore>, rx: flume::Receiver<StoreOp>, events: EventBus) {
        log::debug!("Persistence worker running");
        while let Ok(op) = rx.recv() {
            let event = match op {
                StoreOp::Shutdown => break,
                StoreOp::CreateSession { ticket, session } => store
                    .create_session(&session)
                    .map(|id| StoreEvent::SessionCreated { ticket, id }),
                StoreOp::UpdateSession(session) => {
                    store.update_session(&session).map(|_| StoreEvent::SessionUpdated(session.id))
                }
                StoreOp::SaveDataPoints(points) => store.save_data_points(&points).map(StoreEvent::DataPointsSaved),
                StoreOp::LoadSessions { from, to, test_type } => store
                    .get_sessions(from, to, test_type.as_deref())
                    .map(StoreEvent::SessionsLoaded),
                StoreOp::LoadDataPoints { session_id, parameter } => store
                    .get_data_points(session_id, parameter.as_deref())
                    .map(StoreEvent::DataPointsLoaded),
            };
            match event {
                Ok(event) => events.emit_store(event),
                Err(err) => {
                    log::warn!("Storage operation failed: {}", err);
                    events.emit_store(StoreEvent::Failed(err.to_string()));
                }
            }
        }
        log::debug!("Persistence worker stopped");
    }

    fn submit(&self, op: StoreOp) -> Result<(), StoreError> {
        self.tx.send(op).map_err(|_| StoreError::WorkerStopped)
    }

    pub fn create_session(&self, ticket: u64, session: TestSession) -> Result<(), StoreError> {
        self.submit(StoreOp::CreateSession { ticket, session })
    }

    pub fn update_session(&self, session: TestSession) -> Result<(), StoreError> {
        self.submit(StoreOp::UpdateSession(session))
    }

    pub fn save_data_points(&self, points: Vec<DataPointRecord>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        self.submit(StoreOp::SaveDataPoints(points))
    }

    pub fn load_sessions(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
        test_type: Option<String>,
    ) -> Result<(), StoreError> {
        self.submit(StoreOp::LoadSessions { from, to, test_type })
    }

    pub fn load_data_points(&self, session_id: i64, parameter: Option<String>) -> Result<(), StoreError> {
        self.submit(StoreOp::LoadDataPoints { session_id, parameter })
    }

    /// Drain queued operations and join the thread
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(StoreOp::Shutdown);
        if thread.join().is_err() {
            log::error!("Persistence worker panicked");
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::storage::MemoryStore;

    #[test]
    fn operations_run_in_order_off_thread() {
        let events = EventBus::new();
        let mut rx = events.subscribe_store();
        let store = MemoryStore::new();
        let worker = PersistenceWorker::start(Box::new(store.clone()), events.clone()).unwrap();

        let mut session = TestSession::new("cold crank");
        worker.create_session(7, session.clone()).unwrap();
        session.id = 1;
        session.end_time = Some(Local::now());
        worker
            .save_data_points(vec![DataPointRecord {
                id: 0,
                session_id: 1,
                parameter: "AD_RPM".into(),
                value: 100.0,
                timestamp: Local::now(),
            }])
            .unwrap();
        worker.update_session(session).unwrap();
        worker.load_data_points(1, Some("AD_RPM".into())).unwrap();
        worker.stop();

        let received = drain(&mut rx);
        assert_eq!(received[0], StoreEvent::SessionCreated { ticket: 7, id: 1 });
        assert_eq!(received[1], StoreEvent::DataPointsSaved(1));
        assert_eq!(received[2], StoreEvent::SessionUpdated(1));
        assert!(matches!(&received[3], StoreEvent::DataPointsLoaded(points) if points.len() == 1));
        assert!(store.sessions()[0].end_time.is_some());
    }

    #[test]
    fn failures_are_published() {
        let events = EventBus::new();
        let mut rx = events.subscribe_store();
        let worker = PersistenceWorker::start(Box::new(MemoryStore::new()), events.clone()).unwrap();
        worker.update_session(TestSession::new("orphan")).unwrap();
        worker.stop();
        assert!(matches!(drain(&mut rx).as_slice(), [StoreEvent::Failed(_)]));
    }

    #[test]
    fn submit_after_stop_is_an_error() {
        let worker = PersistenceWorker::start(Box::new(MemoryStore::new()), EventBus::new()).unwrap();
        worker.stop();
        assert_eq!(worker.update_session(TestSession::new("late")), Err(StoreError::WorkerStopped));
    }
}
