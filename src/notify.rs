use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{StrikeAlert, UserId, WaitlistPromotionInfo};

const CHANNEL_CAPACITY: usize = 256;

/// Something a user should hear about after a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Notification {
    Promoted(WaitlistPromotionInfo),
    Strike(StrikeAlert),
}

impl Notification {
    pub fn user_id(&self) -> &str {
        match self {
            Notification::Promoted(p) => &p.promoted_user_id,
            Notification::Strike(s) => &s.user_id,
        }
    }
}

/// Broadcast hub: one channel per user plus a firehose for dispatchers.
/// Sending never blocks a commit; slow receivers lag and drop.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
    firehose: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.firehose.subscribe()
    }

    /// No-op if nobody is listening. A user channel whose receivers are all
    /// gone is dropped here.
    pub fn send(&self, notification: &Notification) {
        let _ = self.firehose.send(notification.clone());
        let user_id = notification.user_id();
        let abandoned = match self.channels.get(user_id) {
            Some(sender) => sender.send(notification.clone()).is_err(),
            None => false,
        };
        if abandoned {
            self.channels
                .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Drop every user channel nobody listens on. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Outbound delivery (push, email, ...). Failures are logged, never retried
/// into the engine.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Default sink: writes every notification to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        match notification {
            Notification::Promoted(p) => info!(
                "notify {}: promoted into class {} (booking {})",
                p.promoted_user_id, p.class_id, p.booking_id
            ),
            Notification::Strike(s) => info!(
                "notify {}: {} strike, {}/{} restricted={}",
                s.user_id,
                s.kind.as_str(),
                s.strikes,
                s.threshold,
                s.is_restricted
            ),
        }
        Ok(())
    }
}

/// Drain the firehose into `sink` until the hub goes away.
pub async fn run_dispatcher(hub: Arc<NotifyHub>, sink: Arc<dyn NotificationSink>) {
    let mut rx = hub.subscribe_all();
    drop(hub);
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = sink.deliver(&notification).await {
                    warn!("delivery to {} failed: {e}", notification.user_id());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("notification dispatcher lagged, {n} dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
