// 轮询调度器
// Two named register groups, each read on its own fixed tick

use super::queue::RequestQueue;
use crate::config::PollingConfig;
use crate::drivers::ModbusTransport;
use crate::types::{PollTier, RegisterRef};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Default)]
struct Groups {
    high: BTreeMap<String, RegisterRef>,
    low: BTreeMap<String, RegisterRef>,
}

impl Groups {
    fn tier(&self, tier: PollTier) -> &BTreeMap<String, RegisterRef> {
        match tier {
            PollTier::High => &self.high,
            PollTier::Low => &self.low,
        }
    }

    fn tier_mut(&mut self, tier: PollTier) -> &mut BTreeMap<String, RegisterRef> {
        match tier {
            PollTier::High => &mut self.high,
            PollTier::Low => &mut self.low,
        }
    }
}

pub struct PollingScheduler {
    queue: Arc<RequestQueue>,
    transport: Arc<dyn ModbusTransport>,
    groups: RwLock<Groups>,
    high_period: Duration,
    low_period: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(queue: Arc<RequestQueue>, transport: Arc<dyn ModbusTransport>, config: &PollingConfig) -> Self {
        Self {
            queue,
            transport,
            groups: RwLock::new(Groups::default()),
            high_period: Duration::from_millis(config.high_ms),
            low_period: Duration::from_millis(config.low_ms),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a named read. A name lives in one tier only; re-adding moves it.
    pub fn add_polled_register(&self, name: &str, register: RegisterRef, tier: PollTier) {
        let mut groups = self.groups.write();
        groups.high.remove(name);
        groups.low.remove(name);
        groups.tier_mut(tier).insert(name.to_string(), register);
    }

    pub fn remove_polled_register(&self, name: &str) -> bool {
        let mut groups = self.groups.write();
        groups.high.remove(name).is_some() | groups.low.remove(name).is_some()
    }

    pub fn clear_polled_registers(&self) {
        let mut groups = self.groups.write();
        groups.high.clear();
        groups.low.clear();
    }

    pub fn polled(&self, tier: PollTier) -> Vec<(String, RegisterRef)> {
        self.groups
            .read()
            .tier(tier)
            .iter()
            .map(|(name, register)| (name.clone(), *register))
            .collect()
    }

    /// Enqueue one normal-priority read per entry of `tier`.
    /// An entry whose previous read has not been served yet is skipped.
    ///
    /// # Returns
    /// Number of reads queued (0 while the link is down)
    pub fn poll_tier(&self, tier: PollTier) -> usize {
        if !self.transport.is_connected() {
            return 0;
        }
        let groups = self.groups.read();
        let queued = groups
            .tier(tier)
            .iter()
            .filter(|(name, register)| self.queue.enqueue_poll(**register, name))
            .count();
        if queued < groups.tier(tier).len() {
            log::debug!("{:?} poll: {} reads still pending", tier, groups.tier(tier).len() - queued);
        }
        queued
    }

    /// Start both tiers together; no-op if already running
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for (tier, period) in [(PollTier::High, self.high_period), (PollTier::Low, self.low_period)] {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    this.poll_tier(tier);
                }
            }));
        }
        log::info!("Polling started (high {:?}, low {:?})", self.high_period, self.low_period);
    }

    /// Stop both tiers together
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        log::info!("Polling stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MockTransport;
    use crate::types::RequestKind;

    fn scheduler(mock: &MockTransport) -> (Arc<PollingScheduler>, Arc<RequestQueue>) {
        let queue = Arc::new(RequestQueue::new());
        let scheduler = Arc::new(PollingScheduler::new(
            Arc::clone(&queue),
            Arc::new(mock.clone()),
            &PollingConfig::default(),
        ));
        (scheduler, queue)
    }

    #[test]
    fn tiers_are_polled_independently() {
        let mock = MockTransport::connected();
        let (scheduler, queue) = scheduler(&mock);
        scheduler.add_polled_register("AD_RPM", RegisterRef::holding(0x0A), PollTier::High);
        scheduler.add_polled_register("TK_RPM", RegisterRef::holding_dword(0x15), PollTier::High);
        scheduler.add_polled_register("M11_READY_STATUS", RegisterRef::coil(0x0B), PollTier::Low);

        assert_eq!(scheduler.poll_tier(PollTier::High), 2);
        let tags: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|r| {
            assert_eq!(r.kind, RequestKind::Read);
            r.tag
        }).collect();
        assert_eq!(tags, vec!["AD_RPM", "TK_RPM"]);

        assert_eq!(scheduler.poll_tier(PollTier::Low), 1);
        assert_eq!(scheduler.poll_tier(PollTier::Low), 0);
        assert_eq!(queue.dequeue().unwrap().register, RegisterRef::coil(0x0B));
    }

    #[test]
    fn readding_moves_between_tiers() {
        let mock = MockTransport::connected();
        let (scheduler, _queue) = scheduler(&mock);
        scheduler.add_polled_register("TK_PERCENT", RegisterRef::holding_dword(0x17), PollTier::High);
        scheduler.add_polled_register("TK_PERCENT", RegisterRef::holding_dword(0x17), PollTier::Low);
        assert!(scheduler.polled(PollTier::High).is_empty());
        assert_eq!(scheduler.polled(PollTier::Low).len(), 1);

        assert!(scheduler.remove_polled_register("TK_PERCENT"));
        assert!(!scheduler.remove_polled_register("TK_PERCENT"));
    }

    #[test]
    fn nothing_queued_while_disconnected() {
        let mock = MockTransport::new();
        let (scheduler, queue) = scheduler(&mock);
        scheduler.add_polled_register("AD_RPM", RegisterRef::holding(0x0A), PollTier::High);
        assert_eq!(scheduler.poll_tier(PollTier::High), 0);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_follow_configured_rates() {
        let mock = MockTransport::connected();
        let (scheduler, queue) = scheduler(&mock);
        scheduler.add_polled_register("AD_RPM", RegisterRef::holding(0x0A), PollTier::High);
        scheduler.add_polled_register("S1", RegisterRef::discrete(0x6000), PollTier::Low);

        let counts = Arc::new(Mutex::new((0usize, 0usize)));
        let consumer = {
            let queue = Arc::clone(&queue);
            let counts = Arc::clone(&counts);
            tokio::spawn(async move {
                loop {
                    while let Some(request) = queue.dequeue() {
                        let mut counts = counts.lock();
                        match request.tag.as_str() {
                            "AD_RPM" => counts.0 += 1,
                            "S1" => counts.1 += 1,
                            other => panic!("unexpected tag {other}"),
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        scheduler.start();
        scheduler.start();
        // first ticks fire immediately, then 10 more high and 1 more low within 520 ms
        tokio::time::sleep(Duration::from_millis(520)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*counts.lock(), (11, 2));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*counts.lock(), (11, 2));
        assert!(!scheduler.is_running());
        consumer.abort();
    }

    #[test]
    fn unserved_polls_do_not_pile_up() {
        let mock = MockTransport::connected();
        let (scheduler, queue) = scheduler(&mock);
        scheduler.add_polled_register("AD_RPM", RegisterRef::holding(0x0A), PollTier::High);
        for _ in 0..20 {
            scheduler.poll_tier(PollTier::High);
        }
        assert_eq!(queue.size(), 1);
    }
}
