// 会话存储接口
// Session-oriented persistence boundary plus the bundled in-memory store

use crate::error::StoreError;
use crate::types::{DataPointRecord, TestSession};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;

/// Persistence boundary. Called only from the persistence worker thread.
pub trait SessionStore: Send {
    /// Persist a new session and return its id
    fn create_session(&mut self, session: &TestSession) -> Result<i64, StoreError>;

    fn update_session(&mut self, session: &TestSession) -> Result<(), StoreError>;

    /// Append a batch, returning how many points were stored
    fn save_data_points(&mut self, points: &[DataPointRecord]) -> Result<usize, StoreError>;

    fn get_data_points(&self, session_id: i64, parameter: Option<&str>) -> Result<Vec<DataPointRecord>, StoreError>;

    fn get_sessions(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
        test_type: Option<&str>,
    ) -> Result<Vec<TestSession>, StoreError>;

    fn session_count(&self) -> usize;

    fn total_data_points(&self) -> usize;
}

#[derive(Default)]
struct MemoryTables {
    sessions: Vec<TestSession>,
    points: Vec<DataPointRecord>,
    next_session_id: i64,
    next_point_id: i64,
}

/// In-memory store. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<TestSession> {
        self.tables.lock().sessions.clone()
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&mut self, session: &TestSession) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock();
        tables.next_session_id += 1;
        let id = tables.next_session_id;
        let mut stored = session.clone();
        stored.id = id;
        tables.sessions.push(stored);
        Ok(id)
    }

    fn update_session(&mut self, session: &TestSession) -> Result<(), StoreError> {
        if !session.has_id() {
            return Err(StoreError::UnassignedSession);
        }
        let mut tables = self.tables.lock();
        let stored = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or(StoreError::SessionNotFound(session.id))?;
        *stored = session.clone();
        Ok(())
    }

    fn save_data_points(&mut self, points: &[DataPointRecord]) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(orphan) = points.iter().find(|p| !tables.sessions.iter().any(|s| s.id == p.session_id)) {
            return Err(StoreError::SessionNotFound(orphan.session_id));
        }
        for point in points {
            tables.next_point_id += 1;
            let mut stored = point.clone();
            stored.id = tables.next_point_id;
            tables.points.push(stored);
        }
        Ok(points.len())
    }

    fn get_data_points(&self, session_id: i64, parameter: Option<&str>) -> Result<Vec<DataPointRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .points
            .iter()
            .filter(|p| p.session_id == session_id && parameter.map_or(true, |name| p.parameter == name))
            .cloned()
            .collect())
    }

    fn get_sessions(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
        test_type: Option<&str>,
    ) -> Result<Vec<TestSession>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.start_time >= from && s.start_time <= to)
            .filter(|s| test_type.map_or(true, |t| s.test_type == t))
            .cloned()
            .collect())
    }

    fn session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    fn total_data_points(&self) -> usize {
        self.tables.lock().points.len()
    }
}
