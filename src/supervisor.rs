// 连接管理
// Bounded connection attempts, link-up start-up and link-down teardown

use crate::bus::{Dispatcher, PollingScheduler, RequestQueue, WriteVerifier};
use crate::config::ConnectionConfig;
use crate::devices::plc::D0_MODE;
use crate::drivers::ModbusTransport;
use crate::error::SupervisorError;
use crate::events::EventBus;
use crate::types::{LinkEvent, LinkState};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owns the transport and the bus components whose lifetime follows the link.
pub struct ConnectionSupervisor {
    transport: Arc<dyn ModbusTransport>,
    queue: Arc<RequestQueue>,
    dispatcher: Arc<Dispatcher>,
    poller: Arc<PollingScheduler>,
    verifier: WriteVerifier,
    events: EventBus,
    attempt_timeout: Duration,
    retry_backoff: Duration,
    max_attempts: u32,
    attempts: AtomicU32,
    init_written: AtomicBool,
    state: Mutex<LinkState>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn ModbusTransport>,
        queue: Arc<RequestQueue>,
        dispatcher: Arc<Dispatcher>,
        poller: Arc<PollingScheduler>,
        verifier: WriteVerifier,
        events: EventBus,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            queue,
            dispatcher,
            poller,
            verifier,
            events,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_attempts: config.max_attempts,
            attempts: AtomicU32::new(0),
            init_written: AtomicBool::new(false),
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected && self.transport.is_connected()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Allow a fresh round of attempts after the limit was hit
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Connect with bounded retries
    ///
    /// # Arguments
    /// * `host` - PLC address (IP literal)
    /// * `port` - Modbus TCP port
    ///
    /// # Returns
    /// Ok once the link is up, or the last failure after the attempt budget is spent
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), SupervisorError> {
        if self.is_connected() {
            log::info!("Already connected");
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| SupervisorError::InvalidAddress(format!("{}:{}", host, port)))?;

        loop {
            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.max_attempts {
                log::warn!("Maximum connection attempts reached");
                return Err(SupervisorError::TooManyAttempts(self.max_attempts));
            }
            let attempt = attempt + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            *self.state.lock() = LinkState::Connecting;
            self.events.emit_link(LinkEvent::Connecting { attempt });
            log::info!("Connecting to {} (attempt {}/{})", addr, attempt, self.max_attempts);

            let err = match tokio::time::timeout(self.attempt_timeout, self.transport.connect(addr)).await {
                Ok(Ok(())) => {
                    self.handle_link_up();
                    return Ok(());
                }
                Ok(Err(e)) => SupervisorError::ConnectFailed(e.to_string()),
                Err(_) => SupervisorError::Timeout,
            };
            log::warn!("Connection attempt {} failed: {}", attempt, err);
            self.transport.disconnect().await;
            *self.state.lock() = LinkState::Disconnected;

            if attempt >= self.max_attempts {
                self.events.emit_link(LinkEvent::Failed(err.to_string()));
                return Err(err);
            }
            tokio::time::sleep(self.retry_backoff).await;
        }
    }

    /// Link confirmed: start the bus and issue the one-time mode reset
    pub fn handle_link_up(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.state.lock() = LinkState::Connected;
        self.dispatcher.start();
        self.poller.start();
        if !self.init_written.swap(true, Ordering::SeqCst) {
            log::info!("Initializing mode register");
            self.queue.enqueue_write(D0_MODE, 0);
        }
        self.events.emit_link(LinkEvent::Connected);
        log::info!("Connected");
    }

    /// Operator disconnect
    pub async fn disconnect(&self) {
        self.reset_attempts();
        self.transport.disconnect().await;
        self.handle_link_down();
    }

    /// The link failed underneath us
    pub async fn drop_link(&self, reason: &str) {
        if self.link_state() != LinkState::Connected {
            return;
        }
        log::warn!("Link lost: {}", reason);
        self.transport.disconnect().await;
        self.handle_link_down();
    }

    /// Stop timers, discard queued intent, re-arm the init write
    pub fn handle_link_down(&self) {
        self.poller.stop();
        self.dispatcher.stop();
        let dropped = self.queue.clear();
        self.verifier.cancel_deferred();
        self.init_written.store(false, Ordering::SeqCst);
        let was = std::mem::replace(&mut *self.state.lock(), LinkState::Disconnected);
        if was != LinkState::Disconnected {
            log::info!("Disconnected ({} queued requests dropped)", dropped);
            self.events.emit_link(LinkEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherConfig, PollingConfig, VerifyConfig};
    use crate::devices::AddressMap;
    use crate::drivers::{ConnectBehavior, MockTransport};
    use crate::events::drain;
    use crate::types::{PollTier, RegisterKind, RegisterRef};

    struct Harness {
        supervisor: ConnectionSupervisor,
        mock: MockTransport,
        queue: Arc<RequestQueue>,
        dispatcher: Arc<Dispatcher>,
        poller: Arc<PollingScheduler>,
        events: EventBus,
    }

    fn harness() -> Harness {
        let mock = MockTransport::new();
        let transport: Arc<dyn ModbusTransport> = Arc::new(mock.clone());
        let events = EventBus::new();
        let queue = Arc::new(RequestQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&transport),
            events.clone(),
            &DispatcherConfig::default(),
        ));
        let poller = Arc::new(PollingScheduler::new(Arc::clone(&queue), Arc::clone(&transport), &PollingConfig::default()));
        poller.add_polled_register("AD_RPM", RegisterRef::holding(0x0A), PollTier::High);
        let verifier = WriteVerifier::new(
            Arc::clone(&queue),
            Arc::clone(&transport),
            events.clone(),
            Arc::new(AddressMap::standard()),
            VerifyConfig::default(),
        );
        let supervisor = ConnectionSupervisor::new(
            transport,
            Arc::clone(&queue),
            Arc::clone(&dispatcher),
            Arc::clone(&poller),
            verifier,
            events.clone(),
            &ConnectionConfig::default(),
        );
        Harness { supervisor, mock, queue, dispatcher, poller, events }
    }

    fn mode_writes(mock: &MockTransport) -> usize {
        mock.writes().iter().filter(|(kind, address, value)| {
            *kind == RegisterKind::HoldingRegister && *address == 0 && *value == 0
        }).count()
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_runs_bus_and_initializes_once() {
        let h = harness();
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        assert!(h.supervisor.is_connected());
        assert!(h.dispatcher.is_running());
        assert!(h.poller.is_running());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mode_writes(&h.mock), 1);

        // repeated link-up without a disconnect
        h.supervisor.handle_link_up();
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mode_writes(&h.mock), 1);
        assert_eq!(h.mock.connect_calls(), 1);

        h.supervisor.disconnect().await;
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mode_writes(&h.mock), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_everything_and_clears_queue() {
        let h = harness();
        let mut rx = h.events.subscribe_link();
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        h.mock.set_reply_delay(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.queue.size() > 0);

        h.supervisor.disconnect().await;
        assert_eq!(h.queue.size(), 0);
        assert!(!h.dispatcher.is_running());
        assert!(!h.poller.is_running());
        assert_eq!(h.supervisor.link_state(), LinkState::Disconnected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.queue.size(), 0);
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&LinkEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_retry_then_give_up() {
        let h = harness();
        h.mock.set_connect_behavior(ConnectBehavior::Hang);
        let started = tokio::time::Instant::now();
        let err = h.supervisor.connect("127.0.0.1", 502).await.unwrap_err();
        assert_eq!(err, SupervisorError::Timeout);
        assert_eq!(h.mock.connect_calls(), 3);
        // three 10 s attempts separated by two 2 s backoffs
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(34) && elapsed < Duration::from_secs(35), "{elapsed:?}");

        let err = h.supervisor.connect("127.0.0.1", 502).await.unwrap_err();
        assert_eq!(err, SupervisorError::TooManyAttempts(3));
        assert_eq!(h.mock.connect_calls(), 3);

        h.supervisor.reset_attempts();
        h.mock.set_connect_behavior(ConnectBehavior::Accept);
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        assert_eq!(h.supervisor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_retried() {
        let h = harness();
        h.mock.set_connect_behavior(ConnectBehavior::Refuse);
        let err = h.supervisor.connect("127.0.0.1", 502).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConnectFailed(_)));
        assert_eq!(h.mock.connect_calls(), 3);
        assert!(!h.dispatcher.is_running());
    }

    #[tokio::test]
    async fn rejects_bad_address() {
        let h = harness();
        let err = h.supervisor.connect("not an ip", 502).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidAddress(_)));
        assert_eq!(h.supervisor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_tears_down() {
        let h = harness();
        h.supervisor.connect("127.0.0.1", 502).await.unwrap();
        h.supervisor.drop_link("connection reset").await;
        assert!(!h.poller.is_running());
        assert!(!h.supervisor.is_connected());
        // second report of the same loss is a no-op
        h.supervisor.drop_link("connection reset").await;
        assert_eq!(h.supervisor.link_state(), LinkState::Disconnected);
    }
}
