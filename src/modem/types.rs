use std::fmt::{Display, Formatter};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::AtDialect;
use crate::modem::urc;
use crate::sms::SmsError;
use crate::ussd::{UssdError, UssdMessage};

/// Interface-level call state, as seen by the PBX collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceState {
    Idle,
    #[default]
    Down,
    Ring,
    Dialing,
    Busy,
    Up,
    Ringing,
    PreRing,
    DoubleCall,
    Selected,
    HangupRequested,
    PreAnswer
}

/// Modem-reported call progress, tracked independently from [`InterfaceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneCallflow {
    #[default]
    Idle,
    Down,
    IncomingRing,
    Dialing,
    LineBusy,
    Active,
    IncomingHangup,
    Released,
    NoCarrier,
    Influx,
    Incoming,
    Failed,
    NoService,
    OutgoingRestricted,
    SecurityFail,
    NoAnswer,
    Finished,
    Cancelled,
    StatusFailed,
    Refused,
    Ringing,
    InProgress,
    Unplaced,
    Routing,
    EarlyMedia,
    IncomingCallId,
    RemoteHold,
    RemoteAnswer,
    HangupRequested
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    pub name: String,
    pub number: String
}
impl CallerId {
    pub fn clear(&mut self) {
        self.name.clear();
        self.number.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupCause {
    Normal,
    Busy,
    NoAnswer,
    Failure
}

/// Terminal outcome of one command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtResult {
    Ok,
    Error
}

/// Result of an exchange along with every line that arrived while it was in flight.
#[derive(Debug, Clone)]
pub struct AtReply {
    pub result: AtResult,
    pub lines: Vec<String>,
    pub timed_out: bool
}
impl AtReply {
    pub fn is_ok(&self) -> bool {
        self.result == AtResult::Ok
    }

    /// Converts a failed exchange into an [`AtError`] naming `command`.
    pub fn require(self, command: &str) -> Result<Self, AtError> {
        match (self.result, self.timed_out) {
            (AtResult::Ok, _) => Ok(self),
            (AtResult::Error, true) => Err(AtError::Timeout(command.to_string())),
            (AtResult::Error, false) => Err(AtError::Rejected(command.to_string()))
        }
    }

    /// The first line that starts with `prefix`.
    pub fn find(&self, prefix: &str) -> Option<&str> {
        self.lines.iter().map(String::as_str).find(|line| line.starts_with(prefix))
    }

    /// The first line that is neither a final result code nor an unsolicited report, e.g. the
    /// IMEI after `AT+GSN`.
    pub fn information(&self, dialect: &AtDialect) -> Option<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .find(|line| !is_final_result(line) && !line.starts_with("AT") && !urc::is_unsolicited(line, dialect))
    }
}

pub fn is_final_result(line: &str) -> bool {
    line == "OK" || line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

#[derive(Debug, Error)]
pub enum AtError {
    #[error("Serial link is dead: {0}")]
    LinkDead(String),

    #[error("Timed out waiting for a reply to {0:?}")]
    Timeout(String),

    #[error("Modem answered ERROR to {0:?}")]
    Rejected(String),

    #[error("More than {0} lines accumulated in a single read cycle")]
    TooManyLines(usize)
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} is not valid while the interface is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: InterfaceState
    },

    #[error("Call was not answered, interface is {0:?}")]
    NotAnswered(InterfaceState),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Interface is shutting down")]
    Stopped,

    #[error(transparent)]
    At(#[from] AtError),

    #[error(transparent)]
    Sms(#[from] SmsError),

    #[error(transparent)]
    Ussd(#[from] UssdError)
}
impl SessionError {
    /// Whether the session has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::At(AtError::LinkDead(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    NotRegistered,
    Home,
    Roaming
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    NoSignal,
    Low,
    Ok
}
impl SignalQuality {

    /// Classifies a `+CSQ` RSSI value, 99 meaning unknown.
    pub fn from_rssi(rssi: i32) -> Self {
        match rssi {
            99 => SignalQuality::NoSignal,
            r if r < 9 => SignalQuality::NoSignal,
            r if r < 11 => SignalQuality::Low,
            _ => SignalQuality::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryStatus {

    /// 0 = powered by battery, 1 = battery connected but powered externally, 2 = no battery.
    pub power_source: u8,
    pub charge: u8
}

/// Advisory and fatal conditions reported alongside ordinary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Alarm {
    FailedInterface,
    NotRegistered,
    Roaming,
    NoService,
    NoSignal,
    LowSignal,
    LowBattery,
    BatteryExhausted
}
impl Alarm {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Alarm::FailedInterface)
    }
}

/// Network and SIM facts last reported by the modem, rebuilt every session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModemInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub rssi: Option<i32>,
    pub signal: Option<SignalQuality>,
    pub registration: Option<Registration>,
    pub battery: Option<BatteryStatus>,
    pub ussd_status: Option<u8>
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub state: InterfaceState,
    pub callflow: PhoneCallflow,
    pub caller_id: CallerId,
    pub info: ModemInfo
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InterfaceRequest {
    Dial {
        number: String
    },
    Answer,
    Hangup,
    SendDtmf {
        digit: char
    },
    SendSms {
        to: String,
        content: String
    },
    SendUssd {
        code: String
    },
    GetStatus
}
impl InterfaceRequest {
    pub fn get_timeout(&self) -> Duration {
        match self {
            InterfaceRequest::SendSms { .. } => Duration::from_secs(120),
            InterfaceRequest::SendUssd { .. } | InterfaceRequest::Answer => Duration::from_secs(45),
            _ => Duration::from_secs(20)
        }
    }
}

#[derive(Debug, Serialize)]
pub enum InterfaceResponse {
    Done,
    SmsSent {
        references: Vec<u8>
    },
    UssdSent {
        reply: Option<UssdMessage>
    },
    Status(InterfaceStatus),
    Error {
        message: String
    }
}
impl Display for InterfaceResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceResponse::Done =>
                write!(f, "Done"),
            InterfaceResponse::SmsSent { references } =>
                write!(f, "SmsSent: Refs {:?}", references),
            InterfaceResponse::UssdSent { reply } =>
                write!(f, "UssdSent: {:?}", reply.as_ref().map(|r| &r.text)),
            InterfaceResponse::Status(status) =>
                write!(f, "Status: {} is {:?}/{:?}", status.name, status.state, status.callflow),
            InterfaceResponse::Error { message } =>
                write!(f, "Error: {}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_quality_thresholds() {
        assert_eq!(SignalQuality::from_rssi(99), SignalQuality::NoSignal);
        assert_eq!(SignalQuality::from_rssi(8), SignalQuality::NoSignal);
        assert_eq!(SignalQuality::from_rssi(9), SignalQuality::Low);
        assert_eq!(SignalQuality::from_rssi(10), SignalQuality::Low);
        assert_eq!(SignalQuality::from_rssi(11), SignalQuality::Ok);
        assert_eq!(SignalQuality::from_rssi(31), SignalQuality::Ok);
    }

    #[test]
    fn test_reply_require() {
        let reply = AtReply { result: AtResult::Error, lines: vec![], timed_out: true };
        assert!(matches!(reply.require("AT"), Err(AtError::Timeout(_))));

        let reply = AtReply { result: AtResult::Error, lines: vec!["ERROR".into()], timed_out: false };
        assert!(matches!(reply.require("AT+CMGF=0"), Err(AtError::Rejected(_))));

        let reply = AtReply { result: AtResult::Ok, lines: vec!["356938035643809".into(), "OK".into()], timed_out: false };
        assert_eq!(reply.require("AT+GSN").unwrap().information(&AtDialect::default()), Some("356938035643809"));
    }

    #[test]
    fn test_information_skips_unsolicited_lines() {
        let reply = AtReply {
            result: AtResult::Ok,
            lines: vec!["RING".into(), "+CREG: 0,1".into(), "CIEV: 2;0".into(), "356938035643809".into(), "OK".into()],
            timed_out: false
        };
        assert_eq!(reply.information(&AtDialect::default()), Some("356938035643809"));

        let reply = AtReply { result: AtResult::Ok, lines: vec!["RING".into(), "OK".into()], timed_out: false };
        assert_eq!(reply.information(&AtDialect::default()), None);
    }
}
