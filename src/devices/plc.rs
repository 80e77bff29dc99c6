// 试验台 PLC 地址表
// Address map of the bench controller: symbolic names, register locations and scaling

use crate::types::{PollTier, RegisterKind, RegisterRef};

/// Mode register, 0 idle, 1..5 selected test procedure
pub const D0_MODE: RegisterRef = RegisterRef::holding(0x0000);

// Command pulses
pub const M1_READY_CHECK: RegisterRef = RegisterRef::coil(0x0001);
pub const M2_START: RegisterRef = RegisterRef::coil(0x0002);
pub const M3_STOP: RegisterRef = RegisterRef::coil(0x0003);
pub const M4_RESTART: RegisterRef = RegisterRef::coil(0x0004);
pub const M5_INTERRUPT: RegisterRef = RegisterRef::coil(0x0005);
pub const M6_EXIT: RegisterRef = RegisterRef::coil(0x0006);

// Status mirrors
pub const M0_STOP_STATUS: RegisterRef = RegisterRef::coil(0x0000);
pub const M11_READY_STATUS: RegisterRef = RegisterRef::coil(0x000B);
pub const M12_START_STATUS: RegisterRef = RegisterRef::coil(0x000C);
pub const M14_COMPLETE_STATUS: RegisterRef = RegisterRef::coil(0x000E);

/// First discrete input (S1); S1..S12 are consecutive
pub const S_BASE: u16 = 0x6000;

/// Command outputs K1..K6 (K6 sits apart from the others)
pub const K_ADDRESSES: [u16; 6] = [0xA000, 0xA001, 0xA002, 0xA003, 0xA004, 0xA008];

// Analog channels
pub const AD_RPM: RegisterRef = RegisterRef::holding(0x000A);
pub const TK_RPM: RegisterRef = RegisterRef::holding_dword(0x0015);
pub const TK_PERCENT: RegisterRef = RegisterRef::holding_dword(0x0017);
pub const ST_RPM: RegisterRef = RegisterRef::holding_dword(0x0029);
pub const ST_PERCENT: RegisterRef = RegisterRef::holding_dword(0x002B);

/// Nominal main engine speed used for the derived AD percentage
pub const AD_NOMINAL_RPM: f64 = 4542.0;

const S_LABELS: [&str; 12] = [
    "BUTS off",
    "ORTS",
    "EMZS",
    "AZTS",
    "ESTS",
    "ESTS off (SOES)",
    "AZTS supply on",
    "ESTS supply on",
    "AZTS channel 1 on",
    "AZTS channel 2 on",
    "ESTS on",
    "VFD ready",
];

const K_LABELS: [&str; 6] = [
    "Turbostarter start",
    "Turbostarter stop",
    "Stop valve",
    "Preservation mode",
    "Cold cranking mode",
    "VFD outputs enabled",
];

/// A named location in the controller
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub register: RegisterRef,
    pub label: String,
    pub unit: &'static str,
    /// Raw-to-engineering multiplier
    pub scale: f64,
    /// Default polling tier; `None` for command registers that are never polled
    pub tier: Option<PollTier>,
}

impl Channel {
    fn new(name: &str, register: RegisterRef, label: &str, unit: &'static str, tier: Option<PollTier>) -> Self {
        Self {
            name: name.to_string(),
            register,
            label: label.to_string(),
            unit,
            scale: 1.0,
            tier,
        }
    }

    /// Convert raw register words into an engineering value
    ///
    /// # Arguments
    /// * `words` - Register contents starting at the channel base address
    ///
    /// # Returns
    /// `None` if fewer words than the channel spans were supplied
    pub fn engineering_value(&self, words: &[u16]) -> Option<f64> {
        let raw = match self.register.count {
            2 => read_dword(words)? as f64,
            _ => *words.first()? as f64,
        };
        Some(raw * self.scale)
    }
}

/// Combine two 16-bit words stored low word first
pub fn read_dword(words: &[u16]) -> Option<u32> {
    match words {
        [lo, hi, ..] => Some((u32::from(*hi) << 16) | u32::from(*lo)),
        _ => None,
    }
}

/// Split a 32-bit value into (low, high) words
pub fn split_dword(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Main engine speed as a percentage of nominal
pub fn ad_percent(rpm: f64) -> f64 {
    rpm / AD_NOMINAL_RPM * 100.0
}

/// Static lookup table between symbolic names and controller addresses
#[derive(Debug, Clone)]
pub struct AddressMap {
    channels: Vec<Channel>,
}

impl AddressMap {
    /// Address map of the bench controller firmware
    pub fn standard() -> Self {
        let mut channels = vec![
            Channel::new("D0_MODE", D0_MODE, "Test mode", "", None),
            Channel::new("M1_READY_CHECK", M1_READY_CHECK, "Ready check command", "", None),
            Channel::new("M2_START", M2_START, "Start command", "", None),
            Channel::new("M3_STOP", M3_STOP, "Stop command", "", None),
            Channel::new("M4_RESTART", M4_RESTART, "Restart command", "", None),
            Channel::new("M5_INTERRUPT", M5_INTERRUPT, "Interrupt command", "", None),
            Channel::new("M6_EXIT", M6_EXIT, "Exit command", "", None),
            Channel::new("M0_STOP_STATUS", M0_STOP_STATUS, "No rotation", "", Some(PollTier::Low)),
            Channel::new("M11_READY_STATUS", M11_READY_STATUS, "Ready", "", Some(PollTier::Low)),
            Channel::new("M12_START_STATUS", M12_START_STATUS, "Started", "", Some(PollTier::Low)),
            Channel::new("M14_COMPLETE_STATUS", M14_COMPLETE_STATUS, "Complete", "", Some(PollTier::Low)),
            Channel::new("AD_RPM", AD_RPM, "Main engine speed", "rpm", Some(PollTier::High)),
            Channel::new("TK_RPM", TK_RPM, "Turbocompressor speed", "rpm", Some(PollTier::High)),
            Channel::new("TK_PERCENT", TK_PERCENT, "Turbocompressor speed", "%", Some(PollTier::Low)),
            Channel::new("ST_RPM", ST_RPM, "Turbostarter speed", "rpm", Some(PollTier::High)),
            Channel::new("ST_PERCENT", ST_PERCENT, "Turbostarter speed", "%", Some(PollTier::Low)),
        ];

        for (index, label) in S_LABELS.iter().enumerate() {
            let register = RegisterRef::discrete(S_BASE + index as u16);
            channels.push(Channel::new(&format!("S{}", index + 1), register, label, "", Some(PollTier::Low)));
        }
        for (index, (address, label)) in K_ADDRESSES.iter().zip(K_LABELS.iter()).enumerate() {
            let register = RegisterRef::coil(*address);
            channels.push(Channel::new(&format!("K{}", index + 1), register, label, "", Some(PollTier::Low)));
        }

        Self { channels }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Look up a channel by symbolic name (case-insensitive)
    pub fn resolve(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Channel whose base address matches `kind`/`address`
    pub fn channel_at(&self, kind: RegisterKind, address: u16) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.register.kind == kind && c.register.address == address)
    }

    /// Symbolic name for a register, or a hex fallback
    pub fn name_of(&self, register: &RegisterRef) -> String {
        self.channel_at(register.kind, register.address)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("{}@0x{:04X}", register.kind, register.address))
    }

    /// Registers polled after connect, with their tier
    pub fn default_polling(&self) -> Vec<(String, RegisterRef, PollTier)> {
        self.channels
            .iter()
            .filter_map(|c| c.tier.map(|tier| (c.name.clone(), c.register, tier)))
            .collect()
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::standard()
    }
}
