// 请求调度器
// Single in-flight pump between the request queue and the transport

use super::queue::RequestQueue;
use crate::config::DispatcherConfig;
use crate::drivers::{ModbusError, ModbusTransport};
use crate::events::EventBus;
use crate::types::{BusEvent, PendingRequest, RequestKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

/// Clears the processing flag when the in-flight task ends, however it ends.
struct InFlightGuard {
    processing: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.processing.store(false, Ordering::SeqCst);
    }
}

pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    transport: Arc<dyn ModbusTransport>,
    events: EventBus,
    tick: Duration,
    reply_timeout: Duration,
    processing: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Option<AbortHandle>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        transport: Arc<dyn ModbusTransport>,
        events: EventBus,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            events,
            tick: config.tick(),
            reply_timeout: config.reply_timeout(),
            processing: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    /// Start the pump. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *pump = Some(tokio::spawn(async move { this.run().await }));
        log::debug!("Dispatcher started, tick {:?}", self.tick);
    }

    /// Stop the pump and abandon any request still on the wire
    pub fn stop(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
            log::debug!("Dispatcher stopped");
        }
        if let Some(in_flight) = self.in_flight.lock().take() {
            in_flight.abort();
        }
        self.processing.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.pump.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.queue.wait_available(), if idle => {}
            }
            idle = !self.pump_once();
        }
    }

    /// One dispatch step.
    ///
    /// # Returns
    /// `true` if a request was handed to the transport
    pub fn pump_once(self: &Arc<Self>) -> bool {
        if self.is_processing() || !self.queue.has_requests() || !self.transport.is_connected() {
            return false;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let guard = InFlightGuard { processing: Arc::clone(&self.processing) };

        let Some(request) = self.queue.dequeue() else {
            return false;
        };
        log::debug!("Dispatching {:?} {} tag '{}'", request.kind, request.register, request.tag);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = guard;
            this.execute(request).await;
        });
        *self.in_flight.lock() = Some(task.abort_handle());
        true
    }

    async fn execute(&self, request: PendingRequest) {
        let register = request.register;
        match request.kind {
            RequestKind::Write => {
                let value = if register.kind.is_bit() {
                    u16::from(request.value != 0)
                } else {
                    request.value
                };
                let result = self.with_watchdog(self.transport.write(register.kind, register.address, value)).await;
                self.events.emit_bus(BusEvent::WriteCompleted {
                    kind: register.kind,
                    address: register.address,
                    success: result.is_ok(),
                    tag: request.tag.clone(),
                });
                if let Err(err) = result {
                    self.report_failure(&request, format!("Write error: {}", err), &err);
                }
            }
            RequestKind::Read | RequestKind::PriorityRead => {
                let result = self
                    .with_watchdog(self.transport.read(register.kind, register.address, register.count))
                    .await
                    .and_then(|values| {
                        if values.len() < usize::from(register.count.max(1)) {
                            Err(ModbusError::InvalidData(format!(
                                "expected {} values, got {}",
                                register.count,
                                values.len()
                            )))
                        } else {
                            Ok(values)
                        }
                    });
                match result {
                    Ok(values) if register.count <= 1 => self.events.emit_bus(BusEvent::ReadCompleted {
                        kind: register.kind,
                        address: register.address,
                        value: values[0],
                        tag: request.tag.clone(),
                    }),
                    Ok(values) => self.events.emit_bus(BusEvent::ReadsCompleted {
                        kind: register.kind,
                        address: register.address,
                        values,
                    }),
                    Err(err) => self.report_failure(&request, format!("Read error: {}", err), &err),
                }
            }
        }
    }

    async fn with_watchdog<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, ModbusError>>,
    ) -> Result<T, ModbusError> {
        match tokio::time::timeout(self.reply_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    fn report_failure(&self, request: &PendingRequest, message: String, err: &ModbusError) {
        log::warn!("{} ({}, tag '{}')", message, request.register, request.tag);
        self.events.emit_bus(BusEvent::RequestFailed {
            register: request.register,
            message,
            link_lost: err.is_link_error(),
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
