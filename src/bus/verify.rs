// 写入校验引擎
// Write, read back, compare. Also owns pulsed commands and the fallback re-read timer.

use super::queue::RequestQueue;
use crate::config::VerifyConfig;
use crate::devices::AddressMap;
use crate::drivers::ModbusTransport;
use crate::events::{next_event, EventBus};
use crate::types::{BusEvent, RegisterKind, RegisterRef, WriteVerified, VERIFICATION_TAG};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outstanding expectation for one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub register: RegisterRef,
    pub expected: u16,
    pub issued_at: Instant,
    /// Monotonic stamp; a newer write to the same address gets a larger one
    pub version: u64,
}

/// Tag carried by the read-back of a given record version
pub fn verification_tag(version: u64) -> String {
    format!("{}:{}", VERIFICATION_TAG, version)
}

/// `Some(None)` for an unversioned verification tag, `Some(Some(v))` for a versioned one
pub fn parse_verification_tag(tag: &str) -> Option<Option<u64>> {
    let rest = tag.strip_prefix(VERIFICATION_TAG)?;
    if rest.is_empty() {
        return Some(None);
    }
    rest.strip_prefix(':')?.parse().ok().map(Some)
}

struct VerifierShared {
    queue: Arc<RequestQueue>,
    transport: Arc<dyn ModbusTransport>,
    events: EventBus,
    map: Arc<AddressMap>,
    config: VerifyConfig,
    records: Mutex<HashMap<(RegisterKind, u16), VerificationRecord>>,
    next_version: AtomicU64,
    deferred: Mutex<CancellationToken>,
    fallback_running: AtomicBool,
}

/// Cheap-to-clone handle; clones share records and timers.
#[derive(Clone)]
pub struct WriteVerifier {
    shared: Arc<VerifierShared>,
}

impl WriteVerifier {
    pub fn new(
        queue: Arc<RequestQueue>,
        transport: Arc<dyn ModbusTransport>,
        events: EventBus,
        map: Arc<AddressMap>,
        config: VerifyConfig,
    ) -> Self {
        Self {
            shared: Arc::new(VerifierShared {
                queue,
                transport,
                events,
                map,
                config,
                records: Mutex::new(HashMap::new()),
                next_version: AtomicU64::new(1),
                deferred: Mutex::new(CancellationToken::new()),
                fallback_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// Number of verifications still waiting for a result
    pub fn pending(&self) -> usize {
        self.shared.records.lock().len()
    }

    pub fn record(&self, register: RegisterRef) -> Option<VerificationRecord> {
        self.shared.records.lock().get(&register.key()).cloned()
    }

    /// Queue a write followed by a correlated read-back.
    ///
    /// A newer call for the same address supersedes the outstanding record.
    ///
    /// # Arguments
    /// * `register` - Target register (single width)
    /// * `value` - Value to write; bit registers compare as 0/1
    /// * `timeout` - Time allowed for a matching read-back
    ///
    /// # Returns
    /// Version stamp of the new record, `None` if the link is down
    pub fn write_and_verify(&self, register: RegisterRef, value: u16, timeout: Duration) -> Option<u64> {
        let register = register.single();
        let name = self.shared.map.name_of(&register);
        if !self.is_connected() {
            log::warn!("Cannot write {}={}: not connected", name, value);
            self.emit(register, 0, false);
            return None;
        }

        let expected = if register.kind.is_bit() { u16::from(value != 0) } else { value };
        let version = self.shared.next_version.fetch_add(1, Ordering::SeqCst);
        let record = VerificationRecord { register, expected, issued_at: Instant::now(), version };

        self.shared.queue.enqueue_tagged_write(register, value, verification_tag(version));
        if let Some(previous) = self.shared.records.lock().insert(register.key(), record) {
            log::debug!(
                "{}: verification v{} (expected {}) superseded by v{}",
                name,
                previous.version,
                previous.expected,
                version
            );
        }
        self.shared.queue.enqueue_priority_read(register, verification_tag(version));
        log::debug!("{} <- {} queued for verification (v{})", name, value, version);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire(register, version);
        });
        self.ensure_fallback();
        Some(version)
    }

    /// Momentary command: write 1, then after the hold time write 0, both verified
    pub fn pulse(&self, register: RegisterRef) {
        let timeout = self.shared.config.timeout();
        if self.write_and_verify(register, 1, timeout).is_none() {
            return;
        }
        let token = self.shared.deferred.lock().clone();
        let hold = self.shared.config.pulse_hold();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Pulse reset of {} cancelled", register);
                }
                _ = tokio::time::sleep(hold) => {
                    this.write_and_verify(register, 0, timeout);
                }
            }
        });
    }

    /// Unverified write through the same queue
    pub fn write(&self, register: RegisterRef, value: u16) -> bool {
        if !self.is_connected() {
            log::warn!("Cannot write {}={}: not connected", self.shared.map.name_of(&register), value);
            return false;
        }
        self.shared.queue.enqueue_write(register.single(), value);
        true
    }

    /// Cancel pending pulse resets and the fallback timer (link went down)
    pub fn cancel_deferred(&self) {
        let old = std::mem::replace(&mut *self.shared.deferred.lock(), CancellationToken::new());
        old.cancel();
        self.shared.fallback_running.store(false, Ordering::SeqCst);
    }

    /// Apply one dispatcher result
    pub fn handle_bus_event(&self, event: &BusEvent) {
        match event {
            BusEvent::ReadCompleted { kind, address, value, tag } => {
                let Some(read_version) = parse_verification_tag(tag) else {
                    return;
                };
                let resolved = {
                    let mut records = self.shared.records.lock();
                    match records.get(&(*kind, *address)) {
                        Some(record) if read_version.map_or(true, |v| v == record.version) => {
                            records.remove(&(*kind, *address))
                        }
                        Some(record) => {
                            log::debug!(
                                "Stale read-back v{:?} for 0x{:04X} ignored, waiting for v{}",
                                read_version,
                                address,
                                record.version
                            );
                            None
                        }
                        None => None,
                    }
                };
                if let Some(record) = resolved {
                    let success = *value == record.expected;
                    self.emit(record.register, *value, success);
                }
            }
            BusEvent::WriteCompleted { kind, address, success: false, tag } => {
                // plain writes never own a record
                let Some(write_version) = parse_verification_tag(tag) else {
                    return;
                };
                let removed = {
                    let mut records = self.shared.records.lock();
                    match records.get(&(*kind, *address)) {
                        Some(record) if write_version.map_or(true, |v| v == record.version) => {
                            records.remove(&(*kind, *address))
                        }
                        Some(record) => {
                            log::debug!(
                                "Failed write v{:?} for 0x{:04X} already superseded by v{}",
                                write_version,
                                address,
                                record.version
                            );
                            None
                        }
                        None => None,
                    }
                };
                if let Some(record) = removed {
                    self.emit(record.register, 0, false);
                }
            }
            _ => {}
        }
    }

    /// Consume dispatcher results until the bus closes
    pub async fn run(self, mut rx: broadcast::Receiver<BusEvent>) {
        while let Some(event) = next_event(&mut rx).await {
            self.handle_bus_event(&event);
        }
    }

    fn expire(&self, register: RegisterRef, version: u64) {
        let removed = {
            let mut records = self.shared.records.lock();
            match records.get(&register.key()) {
                Some(record) if record.version == version => records.remove(&register.key()),
                _ => None,
            }
        };
        if removed.is_some() {
            log::warn!("Verification of {} timed out", self.shared.map.name_of(&register));
            self.emit(register, 0, false);
        }
    }

    fn ensure_fallback(&self) {
        if self.shared.fallback_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = self.shared.deferred.lock().clone();
        let period = self.shared.config.fallback();
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !this.reissue_reads() {
                    break;
                }
            }
        });
    }

    /// Re-queue read-backs for every outstanding record.
    ///
    /// # Returns
    /// `false` once nothing is outstanding and the timer should stop
    fn reissue_reads(&self) -> bool {
        let records: Vec<_> = {
            let records = self.shared.records.lock();
            if records.is_empty() {
                self.shared.fallback_running.store(false, Ordering::SeqCst);
                return false;
            }
            records.values().map(|r| (r.register, r.version)).collect()
        };
        if self.is_connected() {
            for (register, version) in records {
                self.shared.queue.enqueue_priority_read(register, verification_tag(version));
            }
        }
        true
    }

    fn emit(&self, register: RegisterRef, value: u16, success: bool) {
        let name = self.shared.map.name_of(&register);
        if success {
            log::info!("{} verified = {}", name, value);
        } else {
            log::warn!("{} verification failed (read {})", name, value);
        }
        self.shared.events.emit_verified(WriteVerified { register, name, value, success });
    }
}
