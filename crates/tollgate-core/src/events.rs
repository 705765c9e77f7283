use std::time::SystemTime;

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::debug;

/// Operational events emitted by the billing engine and failure-disable
/// policy. Live subscribers receive them over a broadcast channel; every
/// emit also leaves a structured trace line, so events stay observable even
/// with no subscriber attached.
#[derive(Debug, Clone)]
pub enum OpsEvent {
    ChannelAutoDisabled {
        at: SystemTime,
        channel_id: i64,
        status: u16,
        reason: String,
    },
    ChannelCooldown {
        at: SystemTime,
        channel_id: i64,
        seconds: u64,
    },
    RefundIssued {
        at: SystemTime,
        user_id: i64,
        token_id: i64,
        amount: i64,
    },
    SettlementDead {
        at: SystemTime,
        user_id: i64,
        channel_id: i64,
        quota: i64,
        error: String,
        detail: JsonValue,
    },
}

impl OpsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OpsEvent::ChannelAutoDisabled { .. } => "channel_auto_disabled",
            OpsEvent::ChannelCooldown { .. } => "channel_cooldown",
            OpsEvent::RefundIssued { .. } => "refund_issued",
            OpsEvent::SettlementDead { .. } => "settlement_dead",
        }
    }
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<OpsEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpsEvent> {
        self.tx.subscribe()
    }

    /// Fan out to subscribers (dropped when none are listening) and trace.
    pub fn emit(&self, event: OpsEvent) {
        debug!(event = event.name(), ops_event = ?event);
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.emit(OpsEvent::RefundIssued {
            at: SystemTime::now(),
            user_id: 1,
            token_id: 2,
            amount: 300,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OpsEvent::RefundIssued { amount: 300, .. }));
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let hub = EventHub::new(4);
        hub.emit(OpsEvent::ChannelCooldown {
            at: SystemTime::now(),
            channel_id: 9,
            seconds: 30,
        });
    }
}
