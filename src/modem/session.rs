use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use crate::config::InterfaceConfig;
use crate::events::Event;
use crate::modem::correlator::LineSink;
use crate::modem::state_machine::{CallAction, CallStateMachine};
use crate::modem::types::{Alarm, HangupCause, InterfaceStatus, ModemInfo};
use crate::modem::urc::{self, UrcEvent};
use crate::ussd::{self, UssdEncoding, UssdMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsMode {
    Pdu,
    Text
}

/// What the modem turned out to support, settled during initialisation and USSD negotiation.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub sms_mode: SmsMode,
    pub no_ucs2: bool,
    pub has_clcc: bool,
    pub has_ecam: bool,
    pub creg_supported: bool,
    pub cnmi_supported: bool,
    pub ussd_request_encoding: UssdEncoding,
    pub ussd_response_encoding: UssdEncoding
}
impl Capabilities {
    pub fn from_config(config: &InterfaceConfig) -> Self {
        Self {
            sms_mode: SmsMode::Pdu,
            no_ucs2: config.no_ucs2,
            has_clcc: config.has_clcc,
            has_ecam: config.has_ecam,
            creg_supported: true,
            cnmi_supported: true,
            ussd_request_encoding: config.ussd_request_encoding,
            ussd_response_encoding: config.ussd_response_encoding
        }
    }
}

/// Modem I/O that an unsolicited line asked for, run once the current exchange is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    FetchSms(u32),
    RequestCallList,
    PollPhonebook,
    ForceHangup(HangupCause)
}

/// Everything a session knows, mutated only by its own worker.
pub struct SessionState {
    pub config: Arc<InterfaceConfig>,
    pub calls: CallStateMachine,
    pub info: ModemInfo,
    pub caps: Capabilities,
    pub last_ussd: Option<UssdMessage>,
    pub pending: VecDeque<PendingAction>,
    events: mpsc::UnboundedSender<Event>
}
impl SessionState {
    pub fn new(config: Arc<InterfaceConfig>, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            caps: Capabilities::from_config(&config),
            config,
            calls: CallStateMachine::new(),
            info: ModemInfo::default(),
            last_ussd: None,
            pending: VecDeque::new(),
            events
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("[{}] Event receiver is gone, dropping event", self.name());
        }
    }

    pub fn alarm(&self, alarm: Alarm, detail: impl Into<String>) {
        let detail = detail.into();
        if alarm.is_fatal() {
            error!("[{}] Alarm {:?}: {}", self.name(), alarm, detail);
        } else {
            warn!("[{}] Alarm {:?}: {}", self.name(), alarm, detail);
        }
        self.emit(Event::Alarm {
            interface: self.name().to_string(),
            alarm,
            detail
        });
    }

    /// Turns state machine output into events and queued modem work.
    pub fn perform(&mut self, actions: Vec<CallAction>) {
        let interface = self.name().to_string();
        for action in actions {
            match action {
                CallAction::NotifyRinging(caller_id) => self.emit(Event::CallRinging { interface: interface.clone(), caller_id }),
                CallAction::NotifyAnswered => self.emit(Event::CallAnswered { interface: interface.clone() }),
                CallAction::NotifyHungup(cause) => self.emit(Event::CallHungup { interface: interface.clone(), cause }),
                CallAction::RequestCallList => {
                    if self.caps.has_clcc {
                        self.pending.push_back(PendingAction::RequestCallList);
                    } else {
                        debug!("[{}] First RING, but call list is not supported", interface);
                    }
                },
                CallAction::PollPhonebook => self.pending.push_back(PendingAction::PollPhonebook),
                CallAction::ForceHangup(cause) => self.pending.push_back(PendingAction::ForceHangup(cause))
            }
        }
    }

    fn on_ussd(&mut self, status: u8, payload: Option<(String, u8)>) {
        let Some((payload, dcs)) = payload else {
            debug!("[{}] USSD status {} without payload", self.name(), status);
            return;
        };

        match ussd::decode_response(&payload, dcs, self.caps.ussd_response_encoding) {
            Ok((text, encoding)) => {
                let message = UssdMessage { status, text, encoding };
                debug!("[{}] USSD reply: {:?}", self.name(), message.text);
                self.last_ussd = Some(message.clone());
                self.emit(Event::IncomingUssd {
                    interface: self.name().to_string(),
                    message
                });
            },
            Err(e) => warn!("[{}] Dropping USSD reply {:?}: {}", self.name(), payload, e)
        }
    }

    pub fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            name: self.name().to_string(),
            state: self.calls.interface(),
            callflow: self.calls.callflow(),
            caller_id: self.calls.caller_id().clone(),
            info: self.info.clone()
        }
    }
}
impl LineSink for SessionState {
    fn on_line(&mut self, line: &str) {
        let Some(event) = urc::classify(line, &self.config.dialect, self.caps.has_ecam, &mut self.info) else {
            return;
        };

        match event {
            UrcEvent::Call(signal) => {
                let actions = self.calls.apply(signal);
                self.perform(actions);
            },
            UrcEvent::Alarm(alarm, detail) => self.alarm(alarm, detail),
            UrcEvent::NewSms(index) => {
                debug!("[{}] New message stored at index {}", self.name(), index);
                self.pending.push_back(PendingAction::FetchSms(index));
            },
            UrcEvent::Ussd { status, payload } => self.on_ussd(status, payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::types::{InterfaceState, Registration};
    use crate::sms::Alphabet;

    fn state(config: InterfaceConfig) -> (SessionState, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionState::new(Arc::new(config), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_ring_cycle_events() {
        let mut config = InterfaceConfig::new("gsm0");
        config.has_clcc = true;
        let (mut state, mut rx) = state(config);

        state.on_line("RING");
        assert_eq!(state.pending.pop_front(), Some(PendingAction::RequestCallList));
        assert!(drain(&mut rx).is_empty());

        state.on_line("RING");
        state.on_line("^CONN:1,0");
        state.on_line("NO CARRIER");
        assert_eq!(state.calls.interface(), InterfaceState::Down);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::CallRinging { .. }));
        assert!(matches!(events[1], Event::CallAnswered { .. }));
        assert!(matches!(events[2], Event::CallHungup { cause: HangupCause::Normal, .. }));
    }

    #[test]
    fn test_call_list_skipped_without_clcc() {
        let (mut state, _rx) = state(InterfaceConfig::new("gsm0"));
        state.on_line("RING");
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_registration_alarm_once() {
        let (mut state, mut rx) = state(InterfaceConfig::new("gsm0"));

        state.on_line("+CREG: 0,1");
        assert_eq!(state.info.registration, Some(Registration::Home));
        assert!(drain(&mut rx).is_empty());

        state.on_line("+CREG: 0,0");
        assert_eq!(state.info.registration, Some(Registration::NotRegistered));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Alarm { alarm: Alarm::NotRegistered, .. }));
    }

    #[test]
    fn test_new_sms_is_queued() {
        let (mut state, _rx) = state(InterfaceConfig::new("gsm0"));
        state.on_line(r#"+CMTI: "MT",5"#);
        assert_eq!(state.pending.pop_front(), Some(PendingAction::FetchSms(5)));
    }

    #[test]
    fn test_ussd_reply_cached_and_emitted() {
        let (mut state, mut rx) = state(InterfaceConfig::new("gsm0"));

        state.on_line(r#"+CUSD: 0,"C8329BFD06",15"#);
        let message = state.last_ussd.clone().unwrap();
        assert_eq!(message.text, "Hello");
        assert_eq!(message.encoding, Alphabet::Default);
        assert!(matches!(&drain(&mut rx)[..], [Event::IncomingUssd { .. }]));

        state.last_ussd = None;
        state.on_line("+CUSD: 2");
        assert!(state.last_ussd.is_none());
        assert_eq!(state.info.ussd_status, Some(2));
        assert!(drain(&mut rx).is_empty());

        // Reserved coding schemes are dropped.
        state.on_line(r#"+CUSD: 0,"AA",128"#);
        assert!(state.last_ussd.is_none());
        assert!(drain(&mut rx).is_empty());
    }
}
