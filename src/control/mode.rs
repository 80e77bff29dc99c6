// 试验模式控制
// Selects one of the five test procedures through the mode register and ties it to a recorded session

use super::CommandWriter;
use crate::devices::plc::D0_MODE;
use crate::error::ControlError;
use crate::events::EventBus;
use crate::storage::SessionRecorder;
use crate::types::{TestEvent, WriteVerified};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Test procedures, encoded in D0 as 1..5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    Preservation = 1,
    TurbostarterColdCranking = 2,
    PowerAdjustment = 3,
    MainEngineColdCranking = 4,
    MainEngineStartSimulation = 5,
}

impl TestMode {
    pub const ALL: [TestMode; 5] = [
        TestMode::Preservation,
        TestMode::TurbostarterColdCranking,
        TestMode::PowerAdjustment,
        TestMode::MainEngineColdCranking,
        TestMode::MainEngineStartSimulation,
    ];

    pub fn register_value(self) -> u16 {
        self as u16
    }

    pub fn from_value(value: u16) -> Result<Self, ControlError> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.register_value() == value)
            .ok_or(ControlError::UnknownMode(value))
    }

    pub fn label(self) -> &'static str {
        match self {
            TestMode::Preservation => "Preservation/depreservation",
            TestMode::TurbostarterColdCranking => "Turbostarter cold cranking",
            TestMode::PowerAdjustment => "Power adjustment and parameter measurement",
            TestMode::MainEngineColdCranking => "Main engine cold cranking",
            TestMode::MainEngineStartSimulation => "Main engine start simulation",
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub struct ModeController {
    writer: Arc<dyn CommandWriter>,
    recorder: Arc<SessionRecorder>,
    events: EventBus,
    write_before_session_confirmed: bool,
    mode_timeout: Duration,
    current: Option<TestMode>,
    running: bool,
    awaiting_session: bool,
}

impl ModeController {
    /// # Arguments
    /// * `write_before_session_confirmed` - write D0 at once instead of after the session id arrives
    /// * `mode_timeout` - verification window for D0 writes
    pub fn new(
        writer: Arc<dyn CommandWriter>,
        recorder: Arc<SessionRecorder>,
        events: EventBus,
        write_before_session_confirmed: bool,
        mode_timeout: Duration,
    ) -> Self {
        Self {
            writer,
            recorder,
            events,
            write_before_session_confirmed,
            mode_timeout,
            current: None,
            running: false,
            awaiting_session: false,
        }
    }

    pub fn current_mode(&self) -> Option<TestMode> {
        self.current
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_awaiting_session(&self) -> bool {
        self.awaiting_session
    }

    /// Begin a test procedure
    pub fn start_test(&mut self, mode: TestMode) -> Result<(), ControlError> {
        if !self.writer.is_connected() {
            return Err(ControlError::NotConnected);
        }
        if self.running {
            return Err(ControlError::TestAlreadyRunning);
        }
        log::info!("Starting test: {}", mode);
        self.current = Some(mode);
        self.running = true;
        self.recorder.begin_session(mode.label());

        if self.write_before_session_confirmed {
            self.write_mode(mode);
        } else {
            self.awaiting_session = true;
        }
        Ok(())
    }

    /// The store assigned an id to the session opened by `start_test`
    pub fn on_session_created(&mut self, id: i64) {
        if !self.awaiting_session {
            return;
        }
        self.awaiting_session = false;
        match (self.running, self.current) {
            (true, Some(mode)) => {
                log::debug!("Session {} confirmed, selecting mode {}", id, mode.register_value());
                self.write_mode(mode);
            }
            _ => log::debug!("Session {} confirmed after the test ended", id),
        }
    }

    pub fn on_write_verified(&mut self, result: &WriteVerified) {
        if result.register != D0_MODE || !self.running {
            return;
        }
        if result.success {
            if result.value > 0 {
                log::info!("Test mode {} confirmed by controller", result.value);
                self.events.emit_test(TestEvent::Started(result.value));
            }
        } else {
            log::warn!("Mode register not confirmed, aborting test");
            self.finish();
        }
    }

    /// Operator stop
    pub fn stop_test(&mut self) -> bool {
        if !self.running {
            log::warn!("No test running");
            return false;
        }
        log::info!("Stopping test");
        self.writer.write(D0_MODE, 0);
        self.finish();
        true
    }

    /// Stop requested by the sequencer on Exit
    pub fn force_stop(&mut self) {
        if !self.running {
            return;
        }
        log::info!("Test stopped by exit command");
        self.finish();
    }

    fn write_mode(&self, mode: TestMode) {
        self.writer.write_and_verify(D0_MODE, mode.register_value(), self.mode_timeout);
    }

    fn finish(&mut self) {
        self.recorder.finalize();
        self.running = false;
        self.awaiting_session = false;
        self.current = None;
        self.events.emit_test(TestEvent::Stopped);
    }
}
