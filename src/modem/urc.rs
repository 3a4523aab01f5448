use tracing::{debug, error, trace, warn};
use crate::config::AtDialect;
use crate::modem::parsers;
use crate::modem::state_machine::CallSignal;
use crate::modem::types::{Alarm, BatteryStatus, ModemInfo, PhoneCallflow, Registration, SignalQuality};

/// Outcome of interpreting one line, for the session to act upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrcEvent {
    Call(CallSignal),
    Alarm(Alarm, String),

    /// A new message is stored at this index.
    NewSms(u32),

    Ussd {
        status: u8,
        payload: Option<(String, u8)>
    }
}

/// Interprets a line, first match wins. Cached modem facts in `info` are updated as a side
/// effect; anything unrecognised is logged and dropped. Ericsson `*ECAV`/`*ECAM` progress is
/// only trusted once the modem accepted `AT*ECAM=1`.
pub fn classify(line: &str, dialect: &AtDialect, has_ecam: bool, info: &mut ModemInfo) -> Option<UrcEvent> {
    if line == "RING" {
        return Some(UrcEvent::Call(CallSignal::Ring));
    }
    if line.starts_with("+CLIP:") {
        return parsed(line, parsers::parse_clip(line)).map(|caller| UrcEvent::Call(CallSignal::CallerId(caller)));
    }
    if line.starts_with("+CLCC:") {
        return parsed(line, parsers::parse_clcc(line)).map(|caller| UrcEvent::Call(CallSignal::CallList(caller)));
    }
    if line.starts_with("+CREG:") {
        return parsed(line, parsers::parse_creg_response(line)).and_then(|status| registration(status, info));
    }
    if line.starts_with("+CSQ:") {
        return parsed(line, parsers::parse_csq_response(line)).and_then(|(rssi, _)| signal(rssi, info));
    }
    if line.starts_with("+CBC:") {
        return parsed(line, parsers::parse_cbc_response(line)).and_then(|(source, charge)| battery(source, charge, info));
    }
    if line.starts_with("+CMTI:") {
        return parsed(line, parsers::parse_cmti(line)).map(UrcEvent::NewSms);
    }
    if line.starts_with("+CUSD:") {
        let (status, payload) = parsed(line, parsers::parse_cusd(line))?;
        info.ussd_status = Some(status);
        return Some(UrcEvent::Ussd { status, payload });
    }

    match line {
        "BUSY" => return progress(PhoneCallflow::LineBusy),
        "NO ANSWER" => return progress(PhoneCallflow::NoAnswer),
        "NO CARRIER" => return progress(PhoneCallflow::NoCarrier),
        _ => {}
    }

    if let Some(event) = vendor_call_progress(line, dialect, has_ecam) {
        return event;
    }
    if let Some(event) = indicator(line, dialect) {
        return event;
    }

    if line.starts_with("+CMS ERROR: 500") {
        warn!("Modem reported {:?}, the SIM is probably out of credit", line);
        return None;
    }

    trace!("Ignoring line {:?}", line);
    None
}

/// Whether a line is an unsolicited report rather than part of a command's reply.
pub fn is_unsolicited(line: &str, dialect: &AtDialect) -> bool {
    line.starts_with('+')
        || matches!(line, "RING" | "BUSY" | "NO ANSWER" | "NO CARRIER")
        || vendor_call_progress(line, dialect, true).is_some()
        || indicator(line, dialect).is_some()
}

fn parsed<T>(line: &str, result: anyhow::Result<T>) -> Option<T> {
    result
        .inspect_err(|e| warn!("Could not parse {:?}: {}", line, e))
        .ok()
}

fn progress(callflow: PhoneCallflow) -> Option<UrcEvent> {
    Some(UrcEvent::Call(CallSignal::Progress(callflow)))
}

fn registration(status: u8, info: &mut ModemInfo) -> Option<UrcEvent> {
    let registration = match status {
        0 => Registration::NotRegistered,
        1 => Registration::Home,
        _ => Registration::Roaming
    };
    debug!("Network registration status {} -> {:?}", status, registration);
    info.registration = Some(registration);

    match registration {
        Registration::NotRegistered => {
            error!("Modem is not registered to the network");
            Some(UrcEvent::Alarm(Alarm::NotRegistered, format!("+CREG status {}", status)))
        },
        Registration::Roaming => {
            warn!("Modem is roaming (registration status {})", status);
            Some(UrcEvent::Alarm(Alarm::Roaming, format!("+CREG status {}", status)))
        },
        Registration::Home => None
    }
}

fn signal(rssi: i32, info: &mut ModemInfo) -> Option<UrcEvent> {
    let quality = SignalQuality::from_rssi(rssi);
    info.rssi = Some(rssi);
    info.signal = Some(quality);

    match quality {
        SignalQuality::NoSignal => Some(UrcEvent::Alarm(Alarm::NoSignal, format!("rssi {}", rssi))),
        SignalQuality::Low => Some(UrcEvent::Alarm(Alarm::LowSignal, format!("rssi {}", rssi))),
        SignalQuality::Ok => None
    }
}

fn battery(power_source: u8, charge: u8, info: &mut ModemInfo) -> Option<UrcEvent> {
    info.battery = Some(BatteryStatus { power_source, charge });

    // Charge only matters when actually running from the battery.
    if power_source != 0 {
        return None;
    }
    match charge {
        c if c < 10 => Some(UrcEvent::Alarm(Alarm::BatteryExhausted, format!("battery at {}%", c))),
        c if c < 20 => Some(UrcEvent::Alarm(Alarm::LowBattery, format!("battery at {}%", c))),
        _ => None
    }
}

fn matches_literal(line: &str, literal: &str) -> bool {
    !literal.is_empty() && line == literal
}

/// Call progress from configured dialect literals and the Motorola, Huawei and Ericsson codes.
fn vendor_call_progress(line: &str, dialect: &AtDialect, has_ecam: bool) -> Option<Option<UrcEvent>> {
    let configured = [
        (&dialect.call_idle, PhoneCallflow::Idle),
        (&dialect.call_incoming, PhoneCallflow::Incoming),
        (&dialect.call_active, PhoneCallflow::Active),
        (&dialect.call_calling, PhoneCallflow::Dialing),
        (&dialect.call_failed, PhoneCallflow::Failed)
    ];
    if let Some((_, callflow)) = configured.iter().find(|(literal, _)| matches_literal(line, literal)) {
        return Some(progress(*callflow));
    }

    if line.starts_with("+MCST:") {
        let callflow = match parsed(line, parsers::parse_mcst(line))? {
            17 => PhoneCallflow::Influx,
            68 => PhoneCallflow::NoService,
            70 => PhoneCallflow::OutgoingRestricted,
            72 => PhoneCallflow::SecurityFail,
            code => {
                debug!("Unhandled MCST call code {}", code);
                return Some(None);
            }
        };
        return Some(progress(callflow));
    }

    if line.starts_with("^CEND:1") {
        return Some(progress(PhoneCallflow::Idle));
    }

    if line.starts_with("*ECAV:") || line.starts_with("*ECAM:") {
        if !has_ecam {
            debug!("Ignoring {:?}, call monitoring was not enabled", line);
            return Some(None);
        }
        let (_, status) = parsed(line, parsers::parse_ecam(line))?;
        let callflow = match status {
            0 => PhoneCallflow::Idle,
            2 => PhoneCallflow::Dialing,
            3 => PhoneCallflow::Active,
            7 => PhoneCallflow::LineBusy,
            other => {
                debug!("Ericsson call status {} carries no transition", other);
                return Some(None);
            }
        };
        return Some(progress(callflow));
    }
    None
}

fn indicator(line: &str, dialect: &AtDialect) -> Option<Option<UrcEvent>> {
    let alarms = [
        (&dialect.no_service, Alarm::NoService),
        (&dialect.no_signal, Alarm::NoSignal),
        (&dialect.low_signal, Alarm::LowSignal),
        (&dialect.low_battery, Alarm::LowBattery),
        (&dialect.no_battery, Alarm::BatteryExhausted)
    ];
    if let Some((_, alarm)) = alarms.iter().find(|(literal, _)| matches_literal(line, literal)) {
        return Some(Some(UrcEvent::Alarm(*alarm, format!("indicator {:?}", line))));
    }

    let informational = [
        &dialect.call_active_indicator,
        &dialect.no_call_active,
        &dialect.no_call_setup,
        &dialect.call_setup_incoming,
        &dialect.call_setup_outgoing,
        &dialect.remote_ringing
    ];
    if informational.iter().any(|literal| matches_literal(line, literal)) {
        debug!("Indicator {:?}", line);
        return Some(None);
    }
    None
}
