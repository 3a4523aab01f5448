use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use crate::config::ConfiguredWebhook;
use crate::modem::types::{Alarm, CallerId, HangupCause};
use crate::sms::SmsMessage;
use crate::ussd::UssdMessage;
use crate::webhooks::WebhookSender;

#[derive(Eq, PartialEq, Hash, Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CallRinging,
    CallAnswered,
    CallHungup,
    IncomingSms,
    IncomingUssd,
    Alarm
}
impl EventType {
    pub const fn to_bit(self) -> u8 {
        match self {
            EventType::CallRinging => 1 << 0,
            EventType::CallAnswered => 1 << 1,
            EventType::CallHungup => 1 << 2,
            EventType::IncomingSms => 1 << 3,
            EventType::IncomingUssd => 1 << 4,
            EventType::Alarm => 1 << 5
        }
    }

    pub fn events_to_mask(events: &[EventType]) -> u8 {
        events.iter().fold(0, |acc, event| acc | event.to_bit())
    }
}

/// Everything a session reports outward, tagged with the interface it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    CallRinging {
        interface: String,
        caller_id: CallerId
    },
    CallAnswered {
        interface: String
    },
    CallHungup {
        interface: String,
        cause: HangupCause
    },
    IncomingSms {
        interface: String,
        message: SmsMessage
    },
    IncomingUssd {
        interface: String,
        message: UssdMessage
    },
    Alarm {
        interface: String,
        alarm: Alarm,
        detail: String
    }
}
impl Event {

    #[inline]
    pub fn to_event_type(&self) -> EventType {
        match self {
            Event::CallRinging { .. } => EventType::CallRinging,
            Event::CallAnswered { .. } => EventType::CallAnswered,
            Event::CallHungup { .. } => EventType::CallHungup,
            Event::IncomingSms { .. } => EventType::IncomingSms,
            Event::IncomingUssd { .. } => EventType::IncomingUssd,
            Event::Alarm { .. } => EventType::Alarm
        }
    }

    pub fn interface(&self) -> &str {
        match self {
            Event::CallRinging { interface, .. }
            | Event::CallAnswered { interface }
            | Event::CallHungup { interface, .. }
            | Event::IncomingSms { interface, .. }
            | Event::IncomingUssd { interface, .. }
            | Event::Alarm { interface, .. } => interface
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    pub webhooks: Option<WebhookSender>
}
impl EventBroadcaster {
    pub fn create(webhooks: Option<Vec<ConfiguredWebhook>>) -> (Self, Option<JoinHandle<()>>) {
        let (webhook_sender, webhook_handle) = WebhookSender::new(webhooks)
            .map_or((None, None), |(sender, handle)| (Some(sender), Some(handle)));

        (Self { webhooks: webhook_sender }, webhook_handle)
    }

    pub fn broadcast(&self, event: Event) {
        match &event {
            Event::Alarm { interface, alarm, detail } => info!("Alarm on {}: {:?} ({})", interface, alarm, detail),
            _ => debug!("Broadcasting event: {:?}", event)
        }
        if let Some(webhooks) = &self.webhooks {
            webhooks.send(event);
        }
    }
}
