use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, AvailabilityEntry, Status, Window};

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// What changed, published once the change is committed and the provider lock released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    Booked {
        appointment: Appointment,
    },
    Rescheduled {
        previous: Window,
        appointment: Appointment,
    },
    StatusChanged {
        previous: Status,
        appointment: Appointment,
    },
    AvailabilityDeclared {
        entry: AvailabilityEntry,
    },
    AvailabilityRevoked {
        entry: AvailabilityEntry,
    },
}

impl Notice {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Notice::Booked { appointment }
            | Notice::Rescheduled { appointment, .. }
            | Notice::StatusChanged { appointment, .. } => appointment.provider_id,
            Notice::AvailabilityDeclared { entry } | Notice::AvailabilityRevoked { entry } => {
                entry.provider_id
            }
        }
    }

    pub fn client_id(&self) -> Option<Ulid> {
        self.appointment().map(|a| a.client_id)
    }

    pub fn appointment(&self) -> Option<&Appointment> {
        match self {
            Notice::Booked { appointment }
            | Notice::Rescheduled { appointment, .. }
            | Notice::StatusChanged { appointment, .. } => Some(appointment),
            _ => None,
        }
    }

    pub fn into_appointment(self) -> Option<Appointment> {
        match self {
            Notice::Booked { appointment }
            | Notice::Rescheduled { appointment, .. }
            | Notice::StatusChanged { appointment, .. } => Some(appointment),
            _ => None,
        }
    }

    pub fn into_entry(self) -> Option<AvailabilityEntry> {
        match self {
            Notice::AvailabilityDeclared { entry } | Notice::AvailabilityRevoked { entry } => {
                Some(entry)
            }
            _ => None,
        }
    }

    /// Payload handed to external dispatchers (mail, SMS, webhooks).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for post-commit notices, per party (provider or client) and
/// one firehose carrying everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
    firehose: broadcast::Sender<Notice>,
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
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to notices concerning a provider or a client. Creates the channel if needed.
    pub fn subscribe(&self, party_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(party_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.firehose.subscribe()
    }

    /// Fan a notice out to its provider, its client, and the firehose.
    /// No-op for anyone not listening.
    pub fn publish(&self, notice: &Notice) {
        self.send_to(notice.provider_id(), notice);
        if let Some(client_id) = notice.client_id() {
            self.send_to(client_id, notice);
        }
        let _ = self.firehose.send(notice.clone());
    }

    fn send_to(&self, party_id: Ulid, notice: &Notice) {
        if let Some(sender) = self.channels.get(&party_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a party's channel; its receivers see the stream close.
    pub fn remove(&self, party_id: &Ulid) {
        self.channels.remove(party_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DEFAULT_VISIT_TYPE, EntryKind};

    fn appointment() -> Appointment {
        Appointment {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            client_id: Ulid::new(),
            window: Window::new(1_000, 2_000).unwrap(),
            status: Status::Scheduled,
            visit_type: DEFAULT_VISIT_TYPE.into(),
            reason: None,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn provider_and_client_both_receive() {
        let hub = NotifyHub::new();
        let appt = appointment();
        let mut provider_rx = hub.subscribe(appt.provider_id);
        let mut client_rx = hub.subscribe(appt.client_id);
        let mut all_rx = hub.subscribe_all();

        let notice = Notice::Booked {
            appointment: appt.clone(),
        };
        hub.publish(&notice);

        assert_eq!(provider_rx.recv().await.unwrap(), notice);
        assert_eq!(client_rx.recv().await.unwrap(), notice);
        assert_eq!(all_rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn availability_notice_skips_clients() {
        let hub = NotifyHub::new();
        let provider = Ulid::new();
        let mut rx = hub.subscribe(provider);
        let entry = AvailabilityEntry {
            id: Ulid::new(),
            provider_id: provider,
            window: Window::new(0, 10).unwrap(),
            kind: EntryKind::Available,
            recurrence: None,
            reason: None,
            created_at: 0,
        };
        let notice = Notice::AvailabilityDeclared { entry };
        assert_eq!(notice.client_id(), None);
        hub.publish(&notice);
        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&Notice::Booked {
            appointment: appointment(),
        });
    }

    #[tokio::test]
    async fn removed_party_stream_closes() {
        let hub = NotifyHub::new();
        let appt = appointment();
        let mut rx = hub.subscribe(appt.client_id);
        hub.remove(&appt.client_id);
        hub.publish(&Notice::Booked { appointment: appt });
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn json_payload_is_tagged() {
        let appt = appointment();
        let json = Notice::StatusChanged {
            previous: Status::Scheduled,
            appointment: Appointment {
                status: Status::Cancelled,
                ..appt
            },
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["notice"], "status_changed");
        assert_eq!(value["previous"], "Scheduled");
        assert_eq!(value["appointment"]["status"], "Cancelled");
    }
}
