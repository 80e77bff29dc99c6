// 事件总线
// One typed broadcast channel per notification kind

use crate::types::*;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Typed fan-out channels shared by every component.
///
/// Cloning is cheap; all clones publish into the same channels. Sending
/// without subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    bus: broadcast::Sender<BusEvent>,
    verified: broadcast::Sender<WriteVerified>,
    control: broadcast::Sender<ControlEvent>,
    link: broadcast::Sender<LinkEvent>,
    samples: broadcast::Sender<ParameterSample>,
    store: broadcast::Sender<StoreEvent>,
    tests: broadcast::Sender<TestEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            bus: broadcast::channel(CHANNEL_CAPACITY).0,
            verified: broadcast::channel(CHANNEL_CAPACITY).0,
            control: broadcast::channel(CHANNEL_CAPACITY).0,
            link: broadcast::channel(CHANNEL_CAPACITY).0,
            samples: broadcast::channel(CHANNEL_CAPACITY).0,
            store: broadcast::channel(CHANNEL_CAPACITY).0,
            tests: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn emit_bus(&self, event: BusEvent) {
        let _ = self.bus.send(event);
    }

    pub fn emit_verified(&self, event: WriteVerified) {
        let _ = self.verified.send(event);
    }

    pub fn emit_control(&self, event: ControlEvent) {
        let _ = self.control.send(event);
    }

    pub fn emit_link(&self, event: LinkEvent) {
        let _ = self.link.send(event);
    }

    pub fn emit_sample(&self, sample: ParameterSample) {
        let _ = self.samples.send(sample);
    }

    pub fn emit_store(&self, event: StoreEvent) {
        let _ = self.store.send(event);
    }

    pub fn emit_test(&self, event: TestEvent) {
        let _ = self.tests.send(event);
    }

    pub fn subscribe_bus(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_verified(&self) -> broadcast::Receiver<WriteVerified> {
        self.verified.subscribe()
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control.subscribe()
    }

    pub fn subscribe_link(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<ParameterSample> {
        self.samples.subscribe()
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn subscribe_tests(&self) -> broadcast::Receiver<TestEvent> {
        self.tests.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive the next event, skipping over lag gaps.
///
/// Returns `None` once every sender is gone.
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Event subscriber lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Drain everything currently buffered in a receiver (test helper and status dumps).
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}
