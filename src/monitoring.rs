// 数据监视
// Turns polled register values into named engineering samples

use crate::bus::verify::parse_verification_tag;
use crate::devices::plc::{ad_percent, AddressMap};
use crate::events::{next_event, EventBus};
use crate::storage::SessionRecorder;
use crate::types::{BusEvent, ParameterSample, RegisterRef};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct DataMonitor {
    map: Arc<AddressMap>,
    events: EventBus,
    recorder: Arc<SessionRecorder>,
}

impl DataMonitor {
    pub fn new(map: Arc<AddressMap>, events: EventBus, recorder: Arc<SessionRecorder>) -> Self {
        Self { map, events, recorder }
    }

    /// Samples produced by one bus event (verification read-backs produce none)
    pub fn samples_for(&self, event: &BusEvent) -> Vec<ParameterSample> {
        let now = Local::now();
        let sample = |name: &str, value: f64| ParameterSample { name: name.to_string(), value, timestamp: now };

        match event {
            BusEvent::ReadCompleted { kind, address, value, tag } => {
                if parse_verification_tag(tag).is_some() {
                    return Vec::new();
                }
                let channel = self.map.channel_at(*kind, *address);
                let name = if tag.is_empty() {
                    self.map.name_of(&RegisterRef { kind: *kind, address: *address, count: 1 })
                } else {
                    tag.clone()
                };
                let value = if kind.is_bit() {
                    f64::from(u8::from(*value != 0))
                } else {
                    channel
                        .and_then(|c| c.engineering_value(&[*value]))
                        .unwrap_or(f64::from(*value))
                };
                let mut out = vec![sample(&name, value)];
                if name == "AD_RPM" {
                    out.push(sample("AD_PERCENT", ad_percent(value)));
                }
                out
            }
            BusEvent::ReadsCompleted { kind, address, values } => {
                match self.map.channel_at(*kind, *address) {
                    Some(channel) => channel
                        .engineering_value(values)
                        .map(|value| vec![sample(&channel.name, value)])
                        .unwrap_or_default(),
                    None => {
                        log::debug!("Unmapped block read at {} 0x{:04X}", kind, address);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    fn publish(&self, event: &BusEvent) {
        for sample in self.samples_for(event) {
            self.recorder.record(&sample);
            self.events.emit_sample(sample);
        }
    }

    pub async fn run(self, mut rx: broadcast::Receiver<BusEvent>) {
        while let Some(event) = next_event(&mut rx).await {
            self.publish(&event);
        }
    }
}
