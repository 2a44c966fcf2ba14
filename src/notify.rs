use async_trait::async_trait;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, BookingStatus, StatusChange};

const CHANNEL_CAPACITY: usize = 256;

/// What the requester is told after their booking changed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNotice {
    pub booking_id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub requester_email: String,
    pub activity_name: String,
    pub actor: Ulid,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub note: Option<String>,
}

impl StatusNotice {
    pub fn new(booking: &Booking, change: &StatusChange) -> Self {
        Self {
            booking_id: booking.id,
            room_id: booking.room_id,
            requester_id: booking.requester_id,
            requester_email: booking.requester.email.clone(),
            activity_name: booking.activity_name.clone(),
            actor: change.actor,
            from: change.from,
            to: change.to,
            note: change.note.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound side channel for status changes. Delivery is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &StatusNotice) -> Result<(), NotifyError>;
}

/// In-process broadcast of status notices to relays (mail bridge, audit log).
/// Each relay subscribes once and sees every notice.
pub struct NotifyHub {
    tx: broadcast::Sender<StatusNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusNotice> {
        self.tx.subscribe()
    }

    /// No-op while no relay is subscribed.
    pub fn send(&self, notice: &StatusNotice) {
        let _ = self.tx.send(notice.clone());
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, notice: &StatusNotice) -> Result<(), NotifyError> {
        self.send(notice);
        Ok(())
    }
}

/// Drains the firehose into the log, standing in for the mail relay.
pub async fn run_notice_log(mut rx: broadcast::Receiver<StatusNotice>) {
    loop {
        match rx.recv().await {
            Ok(n) => tracing::info!(
                booking = %n.booking_id,
                to = %n.requester_email,
                "booking \"{}\" is now {} (was {})",
                n.activity_name,
                n.to,
                n.from
            ),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("notice log lagged, {missed} notices skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
