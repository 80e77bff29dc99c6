// 试验流程控制
// Control sequencer and test-mode controller. Neither touches the wire; all
// register writes go through a CommandWriter.

pub mod mode;
pub mod sequencer;

pub use mode::{ModeController, TestMode};
pub use sequencer::{ControlSequencer, SequencerPolicy, StatusBit, StatusFlags};

use crate::bus::WriteVerifier;
use crate::types::RegisterRef;
use std::time::Duration;

/// Write path used by the control layer
pub trait CommandWriter: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write and confirm by read-back; the outcome arrives as a WriteVerified event
    fn write_and_verify(&self, register: RegisterRef, value: u16, timeout: Duration);

    /// Momentary 1 then 0, both verified
    fn pulse(&self, register: RegisterRef);

    /// Fire-and-forget write
    fn write(&self, register: RegisterRef, value: u16);
}

impl CommandWriter for WriteVerifier {
    fn is_connected(&self) -> bool {
        WriteVerifier::is_connected(self)
    }

    fn write_and_verify(&self, register: RegisterRef, value: u16, timeout: Duration) {
        WriteVerifier::write_and_verify(self, register, value, timeout);
    }

    fn pulse(&self, register: RegisterRef) {
        WriteVerifier::pulse(self, register);
    }

    fn write(&self, register: RegisterRef, value: u16) {
        WriteVerifier::write(self, register, value);
    }
}
