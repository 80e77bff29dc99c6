// 控制台共享类型定义
// Register references, bus requests and the events exchanged between components

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation tag prefix used for write read-backs.
pub const VERIFICATION_TAG: &str = "verification";

/// Modbus register class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
}

impl RegisterKind {
    /// Single-bit register classes carry 0/1 on the wire
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Coil => write!(f, "coil"),
            RegisterKind::DiscreteInput => write!(f, "discrete input"),
            RegisterKind::HoldingRegister => write!(f, "holding register"),
        }
    }
}

/// Location of a value in the PLC address space.
///
/// `count` is 2 for 32-bit quantities stored low word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterRef {
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
}

impl RegisterRef {
    pub const fn coil(address: u16) -> Self {
        Self { kind: RegisterKind::Coil, address, count: 1 }
    }

    pub const fn discrete(address: u16) -> Self {
        Self { kind: RegisterKind::DiscreteInput, address, count: 1 }
    }

    pub const fn holding(address: u16) -> Self {
        Self { kind: RegisterKind::HoldingRegister, address, count: 1 }
    }

    pub const fn holding_dword(address: u16) -> Self {
        Self { kind: RegisterKind::HoldingRegister, address, count: 2 }
    }

    /// Same location, one register wide
    pub const fn single(self) -> Self {
        Self { count: 1, ..self }
    }

    /// Key used for per-address bookkeeping (kind + address)
    pub fn key(&self) -> (RegisterKind, u16) {
        (self.kind, self.address)
    }
}

impl fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 0x{:04X}", self.kind, self.address)?;
        if self.count > 1 {
            write!(f, " x{}", self.count)?;
        }
        Ok(())
    }
}

/// Polling tier a register belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollTier {
    /// Fast analog channels (~20 Hz)
    High,
    /// Status and command mirror bits (~2 Hz)
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    PriorityRead,
    Write,
}

/// A queued bus operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub register: RegisterRef,
    /// Value to write; unused for reads
    pub value: u16,
    pub tag: String,
}

impl PendingRequest {
    pub fn is_priority(&self) -> bool {
        !matches!(self.kind, RequestKind::Read)
    }
}

/// Results of wire operations as reported by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    ReadCompleted {
        kind: RegisterKind,
        address: u16,
        value: u16,
        tag: String,
    },
    ReadsCompleted {
        kind: RegisterKind,
        address: u16,
        values: Vec<u16>,
    },
    WriteCompleted {
        kind: RegisterKind,
        address: u16,
        success: bool,
        /// Correlation tag of the write, empty for plain writes
        tag: String,
    },
    RequestFailed {
        register: RegisterRef,
        message: String,
        /// The failure indicates the link itself is gone
        link_lost: bool,
    },
}

/// Outcome of a write-and-verify operation
#[derive(Debug, Clone, PartialEq)]
pub struct WriteVerified {
    pub register: RegisterRef,
    pub name: String,
    /// Value observed on read-back, 0 on timeout or write failure
    pub value: u16,
    pub success: bool,
}

/// Sequencer process states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlState {
    #[default]
    ReadyCheck,
    StartInterrupt,
    Stop,
    RestartExit,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::ReadyCheck => "ReadyCheck",
            ControlState::StartInterrupt => "StartInterrupt",
            ControlState::Stop => "Stop",
            ControlState::RestartExit => "RestartExit",
        };
        f.write_str(name)
    }
}

/// Notifications emitted by the control sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    StateChanged(ControlState),
    StartRecording,
    StopRecording,
    StopCurrentTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connecting { attempt: u32 },
    Connected,
    Disconnected,
    Failed(String),
}

/// Test lifecycle notifications from the mode controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent {
    Started(u16),
    Stopped,
}

/// Engineering value of a named channel at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Local>,
}

/// Test session as stored by the persistence layer.
///
/// `id` stays -1 until the store assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSession {
    pub id: i64,
    pub test_type: String,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub description: String,
}

impl TestSession {
    pub const UNASSIGNED: i64 = -1;

    pub fn new(test_type: &str) -> Self {
        Self {
            id: Self::UNASSIGNED,
            test_type: test_type.to_string(),
            start_time: Local::now(),
            end_time: None,
            description: String::new(),
        }
    }

    pub fn has_id(&self) -> bool {
        self.id > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointRecord {
    pub id: i64,
    pub session_id: i64,
    pub parameter: String,
    pub value: f64,
    pub timestamp: DateTime<Local>,
}

/// Replies from the persistence worker
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    SessionCreated { ticket: u64, id: i64 },
    SessionUpdated(i64),
    DataPointsSaved(usize),
    SessionsLoaded(Vec<TestSession>),
    DataPointsLoaded(Vec<DataPointRecord>),
    Failed(String),
}

/// Snapshot of the console for operator display
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsoleStatus {
    pub link: LinkState,
    pub control_state: ControlState,
    pub ready: bool,
    pub started: bool,
    pub stop_asserted: bool,
    pub complete_asserted: bool,
    pub test_mode: Option<u16>,
    pub session_id: Option<i64>,
    pub queued_requests: usize,
    pub pending_verifications: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_display_includes_width() {
        assert_eq!(RegisterRef::holding_dword(0x15).to_string(), "holding register 0x0015 x2");
        assert_eq!(RegisterRef::coil(0x0B).to_string(), "coil 0x000B");
    }

    #[test]
    fn session_starts_unassigned() {
        let session = TestSession::new("cold crank");
        assert_eq!(session.id, TestSession::UNASSIGNED);
        assert!(!session.has_id());
        assert!(session.end_time.is_none());
    }
}
