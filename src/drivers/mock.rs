// 模拟 PLC
// In-memory Modbus device used by tests and by the CLI simulate mode

use super::modbus::{ModbusError, ModbusTransport};
use crate::types::RegisterKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the mock answers a connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    Refuse,
    /// Never completes; exercises the attempt timeout
    Hang,
}

/// One operation seen on the simulated wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOp {
    Read { kind: RegisterKind, address: u16, count: u16 },
    Write { kind: RegisterKind, address: u16, value: u16 },
}

#[derive(Default)]
struct MockState {
    memory: HashMap<(RegisterKind, u16), u16>,
    ops: Vec<WireOp>,
    failing_writes: HashSet<(RegisterKind, u16)>,
    /// Each entry fails exactly one write
    failing_once: HashSet<(RegisterKind, u16)>,
    /// Writes to these addresses are acknowledged but not stored
    ignored_writes: HashSet<(RegisterKind, u16)>,
    connect_behavior: ConnectBehavior,
    connect_calls: usize,
    reply_delay: Duration,
}

/// Shared handle to a simulated PLC. Clones observe the same device.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connected: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that starts out connected
    pub fn connected() -> Self {
        let mock = Self::new();
        mock.connected.store(true, Ordering::SeqCst);
        mock
    }

    pub fn set_register(&self, kind: RegisterKind, address: u16, value: u16) {
        let value = if kind.is_bit() { u16::from(value != 0) } else { value };
        self.state.lock().memory.insert((kind, address), value);
    }

    pub fn register(&self, kind: RegisterKind, address: u16) -> u16 {
        self.state.lock().memory.get(&(kind, address)).copied().unwrap_or(0)
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        self.state.lock().reply_delay = delay;
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect_behavior = behavior;
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn fail_writes_to(&self, kind: RegisterKind, address: u16) {
        self.state.lock().failing_writes.insert((kind, address));
    }

    /// Reject only the next write to the address
    pub fn fail_next_write_to(&self, kind: RegisterKind, address: u16) {
        self.state.lock().failing_once.insert((kind, address));
    }

    /// Acknowledge writes to the address without changing its value
    pub fn ignore_writes_to(&self, kind: RegisterKind, address: u16) {
        self.state.lock().ignored_writes.insert((kind, address));
    }

    /// Simulate the peer dropping the socket
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<WireOp> {
        self.state.lock().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<WireOp> {
        std::mem::take(&mut self.state.lock().ops)
    }

    pub fn writes(&self) -> Vec<(RegisterKind, u16, u16)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WireOp::Write { kind, address, value } => Some((kind, address, value)),
                WireOp::Read { .. } => None,
            })
            .collect()
    }

    /// Highest number of requests ever observed on the wire at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        self.state.lock().reply_delay
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn connect(&self, _addr: SocketAddr) -> Result<(), ModbusError> {
        let behavior = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            state.connect_behavior
        };
        match behavior {
            ConnectBehavior::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            ConnectBehavior::Refuse => Err(ModbusError::ConnectionFailed("connection refused".into())),
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, kind: RegisterKind, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        if !self.is_connected() {
            return Err(ModbusError::NotConnected);
        }
        self.state.lock().ops.push(WireOp::Read { kind, address, count });
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(ModbusError::Transport("connection reset by peer".into()));
        }
        let state = self.state.lock();
        Ok((0..count)
            .map(|offset| {
                let addr = address.wrapping_add(offset);
                state.memory.get(&(kind, addr)).copied().unwrap_or(0)
            })
            .collect())
    }

    async fn write(&self, kind: RegisterKind, address: u16, value: u16) -> Result<(), ModbusError> {
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        if !self.is_connected() {
            return Err(ModbusError::NotConnected);
        }
        self.state.lock().ops.push(WireOp::Write { kind, address, value });
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(ModbusError::Transport("connection reset by peer".into()));
        }
        let mut state = self.state.lock();
        if kind == RegisterKind::DiscreteInput {
            return Err(ModbusError::InvalidData(format!("discrete input 0x{:04X} is read-only", address)));
        }
        if state.failing_writes.contains(&(kind, address)) || state.failing_once.remove(&(kind, address)) {
            return Err(ModbusError::Exception("illegal data address".into()));
        }
        if !state.ignored_writes.contains(&(kind, address)) {
            let value = if kind.is_bit() { u16::from(value != 0) } else { value };
            state.memory.insert((kind, address), value);
        }
        Ok(())
    }
}
