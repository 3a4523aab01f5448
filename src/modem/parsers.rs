use anyhow::{anyhow, Result};
use crate::modem::types::CallerId;

/// Returns the payload after `prefix` on the first line of `response` that carries it.
fn find_payload<'a>(response: &'a str, prefix: &str) -> Result<&'a str> {
    let line = response
        .lines()
        .find(|line| line.trim().starts_with(prefix))
        .ok_or(anyhow!("No {} response found in buffer", prefix))?;

    Ok(line
        .trim()
        .strip_prefix(prefix)
        .ok_or(anyhow!("Malformed {} response", prefix))?
        .trim())
}

/// Splits comma separated fields, honouring double quotes, and strips the quotes.
pub fn split_fields(data: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in data.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c)
        }
    }
    fields.push(current.trim().to_string());
    fields
}

pub fn parse_cmgs_result(response: &str) -> Result<u8> {
    find_payload(response, "+CMGS:")?
        .parse()
        .map_err(|_| anyhow!("Invalid CMGS message reference number"))
}

/// Returns the registration status. Accepts both the solicited `<n>,<stat>` form and the
/// unsolicited `<stat>[,<lac>,<ci>]` form.
pub fn parse_creg_response(response: &str) -> Result<u8> {
    let fields = split_fields(find_payload(response, "+CREG:")?);
    let first = fields.first().filter(|f| !f.is_empty()).ok_or(anyhow!("Missing registration status"))?;

    match fields.get(1).and_then(|second| second.parse::<u8>().ok()) {
        Some(status) if fields.len() == 2 || fields.len() == 4 => Ok(status),
        _ => first.parse().map_err(|_| anyhow!("Invalid registration status"))
    }
}

pub fn parse_csq_response(response: &str) -> Result<(i32, i32)> {
    let data = find_payload(response, "+CSQ:")?;

    let mut parts = data.split(',');
    let rssi: i32 = parts
        .next()
        .ok_or(anyhow!("Missing RSSI value"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid RSSI value"))?;

    let ber: i32 = parts
        .next()
        .ok_or(anyhow!("Missing BER value"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid BER value"))?;

    Ok((rssi, ber))
}

/// Returns `(power_source, charge)`; any trailing voltage field is ignored.
pub fn parse_cbc_response(response: &str) -> Result<(u8, u8)> {
    let data = find_payload(response, "+CBC:")?;

    let mut parts = data.split(',');
    let power_source: u8 = parts
        .next()
        .ok_or(anyhow!("Missing power source"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid power source"))?;

    let charge: u8 = parts
        .next()
        .ok_or(anyhow!("Missing battery charge"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid battery charge"))?;

    Ok((power_source, charge))
}

/// Returns the storage index from a new message indication.
pub fn parse_cmti(response: &str) -> Result<u32> {
    find_payload(response, "+CMTI:")?
        .rsplit(',')
        .next()
        .ok_or(anyhow!("Missing message index"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid message index"))
}

fn caller_id(number: Option<&String>, name: Option<&String>) -> CallerId {
    let number = match number.map(|n| n.trim()).filter(|n| !n.is_empty()) {
        Some(number) => number.to_string(),
        None => "not available".to_string()
    };
    let name = match name.map(|n| n.trim()).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => number.clone()
    };
    CallerId { name, number }
}

/// `+CLIP: "<number>",<type>,<subaddr>,<satype>,"<alpha>",<validity>`
pub fn parse_clip(response: &str) -> Result<CallerId> {
    let fields = split_fields(find_payload(response, "+CLIP:")?);
    Ok(caller_id(fields.first(), fields.get(4)))
}

/// `+CLCC: <id>,<dir>,<stat>,<mode>,<mpty>,"<number>",<type>,"<alpha>"`
pub fn parse_clcc(response: &str) -> Result<CallerId> {
    let fields = split_fields(find_payload(response, "+CLCC:")?);
    if fields.len() < 6 {
        return Err(anyhow!("CLCC response has no number field"));
    }
    Ok(caller_id(fields.get(5), fields.get(7)))
}

/// Returns the status and, when present, the quoted payload with its DCS.
pub fn parse_cusd(response: &str) -> Result<(u8, Option<(String, u8)>)> {
    let data = find_payload(response, "+CUSD:")?;
    let status: u8 = data
        .split(',')
        .next()
        .ok_or(anyhow!("Missing USSD status"))?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid USSD status"))?;

    let (Some(open), Some(close)) = (data.find('"'), data.rfind('"')) else {
        return Ok((status, None));
    };
    if open >= close {
        return Err(anyhow!("Unterminated USSD payload"));
    }

    let payload = data[open + 1..close].to_string();
    let dcs = match data[close + 1..].trim().strip_prefix(',') {
        Some(dcs) => dcs.trim().parse().map_err(|_| anyhow!("Invalid USSD data coding scheme"))?,
        None => 0x0F
    };
    Ok((status, Some((payload, dcs))))
}

/// Returns `(call_id, call_status)` from an Ericsson `*ECAV:`/`*ECAM:` report.
pub fn parse_ecam(response: &str) -> Result<(u8, u8)> {
    let prefix = if response.trim_start().starts_with("*ECAV:") { "*ECAV:" } else { "*ECAM:" };
    let fields = split_fields(find_payload(response, prefix)?);
    if fields.len() < 3 {
        return Err(anyhow!("Expected at least 3 fields in {} report", prefix));
    }

    let call_id = fields[0].parse().map_err(|_| anyhow!("Invalid call id"))?;
    let status = fields[1].parse().map_err(|_| anyhow!("Invalid call status"))?;
    Ok((call_id, status))
}

pub fn parse_mcst(response: &str) -> Result<u32> {
    find_payload(response, "+MCST:")?
        .parse()
        .map_err(|_| anyhow!("Invalid MCST code"))
}

/// `+CPBR: (<first>-<last>),<nlength>,<tlength>`
pub fn parse_cpbr_range(response: &str) -> Result<(u32, u32)> {
    let data = find_payload(response, "+CPBR:")?;
    let range = data
        .strip_prefix('(')
        .and_then(|rest| rest.split(')').next())
        .ok_or(anyhow!("Missing phonebook index range"))?;

    let (first, last) = range.split_once('-').ok_or(anyhow!("Malformed phonebook index range"))?;
    let first = first.trim().parse().map_err(|_| anyhow!("Invalid first phonebook index"))?;
    let last = last.trim().parse().map_err(|_| anyhow!("Invalid last phonebook index"))?;
    Ok((first, last))
}

/// `+CPBR: <index>,"<number>",<type>,"<text>"`
pub fn parse_cpbr_entry(response: &str) -> Result<CallerId> {
    let fields = split_fields(find_payload(response, "+CPBR:")?);
    if fields.len() < 4 {
        return Err(anyhow!("Phonebook entry has {} fields, expected 4", fields.len()));
    }
    Ok(caller_id(fields.get(1), fields.get(3)))
}
