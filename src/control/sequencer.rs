// 试验流程状态机
// ReadyCheck -> StartInterrupt -> Stop -> RestartExit, driven by status coils and operator triggers

use super::CommandWriter;
use crate::devices::plc::*;
use crate::events::{next_event, EventBus};
use crate::types::{BusEvent, ControlEvent, ControlState, RegisterKind, RegisterRef};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Status coils the sequencer watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBit {
    Ready,
    Started,
    StopCondition,
    Complete,
}

impl StatusBit {
    pub const ALL: [StatusBit; 4] = [
        StatusBit::Ready,
        StatusBit::Started,
        StatusBit::StopCondition,
        StatusBit::Complete,
    ];

    pub fn register(self) -> RegisterRef {
        match self {
            StatusBit::Ready => M11_READY_STATUS,
            StatusBit::Started => M12_START_STATUS,
            StatusBit::StopCondition => M0_STOP_STATUS,
            StatusBit::Complete => M14_COMPLETE_STATUS,
        }
    }

    pub fn from_register(kind: RegisterKind, address: u16) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|bit| bit.register().kind == kind && bit.register().address == address)
    }
}

/// Latched copies of the status coils
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub ready: bool,
    pub started: bool,
    pub stop_asserted: bool,
    pub complete_asserted: bool,
}

impl StatusFlags {
    fn slot(&mut self, bit: StatusBit) -> &mut bool {
        match bit {
            StatusBit::Ready => &mut self.ready,
            StatusBit::Started => &mut self.started,
            StatusBit::StopCondition => &mut self.stop_asserted,
            StatusBit::Complete => &mut self.complete_asserted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequencerPolicy {
    /// On Restart/Interrupt, zero the status coils and request a fresh ready check
    pub owns_status_registers: bool,
    /// Verification window for the mode register reset on Exit
    pub verify_timeout: Duration,
}

impl Default for SequencerPolicy {
    fn default() -> Self {
        Self { owns_status_registers: true, verify_timeout: Duration::from_millis(3000) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reentry {
    /// Restart or Interrupt: device status is stale and must be re-established
    Rearm,
    Exit,
}

/// Test procedure state machine.
///
/// Operator triggers issued from a state where they are not valid are ignored
/// and return `false`.
pub struct ControlSequencer {
    state: ControlState,
    flags: StatusFlags,
    writer: Arc<dyn CommandWriter>,
    events: EventBus,
    policy: SequencerPolicy,
}

impl ControlSequencer {
    pub fn new(writer: Arc<dyn CommandWriter>, events: EventBus, policy: SequencerPolicy) -> Self {
        Self {
            state: ControlState::ReadyCheck,
            flags: StatusFlags::default(),
            writer,
            events,
            policy,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    pub fn trigger_ready_check(&mut self) -> bool {
        if !self.accepts("ready check", &[ControlState::ReadyCheck]) {
            return false;
        }
        self.writer.pulse(M1_READY_CHECK);
        true
    }

    pub fn trigger_start(&mut self) -> bool {
        if !self.accepts("start", &[ControlState::StartInterrupt]) {
            return false;
        }
        self.writer.pulse(M2_START);
        self.events.emit_control(ControlEvent::StartRecording);
        true
    }

    pub fn trigger_stop(&mut self) -> bool {
        if !self.accepts("stop", &[ControlState::Stop]) {
            return false;
        }
        self.writer.pulse(M3_STOP);
        self.enter(ControlState::RestartExit);
        true
    }

    pub fn trigger_restart(&mut self) -> bool {
        if !self.accepts("restart", &[ControlState::RestartExit]) {
            return false;
        }
        self.writer.pulse(M4_RESTART);
        self.reenter_ready_check(Reentry::Rearm);
        true
    }

    pub fn trigger_interrupt(&mut self) -> bool {
        if !self.accepts("interrupt", &[ControlState::StartInterrupt]) {
            return false;
        }
        self.writer.pulse(M5_INTERRUPT);
        self.reenter_ready_check(Reentry::Rearm);
        true
    }

    pub fn trigger_exit(&mut self) -> bool {
        if !self.accepts("exit", &[ControlState::ReadyCheck, ControlState::RestartExit]) {
            return false;
        }
        self.writer.pulse(M6_EXIT);
        self.writer.write_and_verify(D0_MODE, 0, self.policy.verify_timeout);
        self.events.emit_control(ControlEvent::StopCurrentTest);
        self.reenter_ready_check(Reentry::Exit);
        true
    }

    /// Feed an observed status coil value
    pub fn on_status(&mut self, bit: StatusBit, value: bool) {
        let slot = self.flags.slot(bit);
        if *slot == value {
            return;
        }
        *slot = value;
        log::debug!("Status {:?} -> {} in {}", bit, value, self.state);

        match bit {
            StatusBit::Ready if value && self.state == ControlState::ReadyCheck => {
                self.enter(ControlState::StartInterrupt);
            }
            StatusBit::Started if value && self.state == ControlState::StartInterrupt => {
                self.enter(ControlState::Stop);
            }
            StatusBit::StopCondition | StatusBit::Complete
                if self.state == ControlState::Stop
                    && self.flags.stop_asserted
                    && self.flags.complete_asserted =>
            {
                self.enter(ControlState::RestartExit);
            }
            _ => {}
        }
    }

    fn accepts(&self, trigger: &str, valid: &[ControlState]) -> bool {
        if valid.contains(&self.state) {
            if !self.writer.is_connected() {
                log::warn!("Operator {} issued while disconnected", trigger);
            }
            true
        } else {
            log::debug!("Operator {} ignored in {}", trigger, self.state);
            false
        }
    }

    fn enter(&mut self, next: ControlState) {
        log::info!("Control state {} -> {}", self.state, next);
        self.state = next;
        self.events.emit_control(ControlEvent::StateChanged(next));
        if next == ControlState::RestartExit {
            self.events.emit_control(ControlEvent::StopRecording);
        }
    }

    fn reenter_ready_check(&mut self, reentry: Reentry) {
        self.flags = StatusFlags::default();
        self.enter(ControlState::ReadyCheck);
        if reentry == Reentry::Rearm && self.policy.owns_status_registers {
            for bit in StatusBit::ALL {
                self.writer.write_and_verify(bit.register(), 0, self.policy.verify_timeout);
            }
            self.writer.pulse(M1_READY_CHECK);
        }
    }
}

/// Feed status coil reads from the bus into the sequencer until the bus closes
pub async fn drive_status(sequencer: Arc<Mutex<ControlSequencer>>, mut rx: broadcast::Receiver<BusEvent>) {
    while let Some(event) = next_event(&mut rx).await {
        if let BusEvent::ReadCompleted { kind, address, value, .. } = event {
            if let Some(bit) = StatusBit::from_register(kind, address) {
                sequencer.lock().on_status(bit, value != 0);
            }
        }
    }
}
