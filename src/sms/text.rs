use crate::sms::alphabet::{self, Alphabet};
use crate::sms::types::{SmsError, SmsMessage};

/// Returns the contents of each double-quoted field, in order.
pub fn quoted_fields(line: &str) -> Vec<&str> {
    line.split('"')
        .skip(1)
        .step_by(2)
        .collect()
}

/// Decodes a text-mode `+CMGR` reply. With `ucs2` the sender and body are UCS-2 hex as
/// produced under `AT+CSCS="UCS2"`, otherwise they are taken verbatim.
pub fn decode_text_mode(header: &str, body: &str, ucs2: bool) -> Result<SmsMessage, SmsError> {
    let fields = quoted_fields(header);
    let raw_sender = fields.get(1)
        .ok_or_else(|| SmsError::Malformed(format!("missing sender in {:?}", header)))?;

    let convert = |value: &str| -> Result<String, SmsError> {
        if !ucs2 {
            return Ok(value.to_string());
        }
        alphabet::from_ucs2_hex(value)
            .ok_or_else(|| SmsError::Malformed(format!("invalid UCS-2 hex {:?}", value)))
    };

    let timestamp = match fields.len() {
        0..=2 => String::new(),
        _ => fields[fields.len() - 1].to_string()
    };

    Ok(SmsMessage {
        sender: convert(raw_sender)?,
        timestamp,
        alphabet: if ucs2 { Alphabet::SixteenBit } else { Alphabet::Default },
        user_data: convert(body.trim())?,
        user_data_header: None,
        service_center: String::new(),
        message_type: 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_fields() {
        let fields = quoted_fields(r#"+CMGR: "REC UNREAD","+31628870634",,"11/01/09,10:26:26+04""#);
        assert_eq!(fields, vec!["REC UNREAD", "+31628870634", "11/01/09,10:26:26+04"]);
        assert!(quoted_fields("+CMGR: 0,,24").is_empty());
    }

    #[test]
    fn test_decode_text_mode() {
        // Success cases
        let message = decode_text_mode(
            r#"+CMGR: "REC UNREAD","002B003300390033003400350036",,"24/03/01,12:00:00+04""#,
            "0043006900610020043F04400438",
            true
        ).unwrap();
        assert_eq!(message.sender, "+393456");
        assert_eq!(message.user_data, "Cia при");
        assert_eq!(message.timestamp, "24/03/01,12:00:00+04");
        assert_eq!(message.alphabet, Alphabet::SixteenBit);

        let message = decode_text_mode(
            r#"+CMGR: "REC READ","+8613918186089","","02/10/28,14:31:41+32""#,
            "plain body",
            false
        ).unwrap();
        assert_eq!(message.sender, "+8613918186089");
        assert_eq!(message.user_data, "plain body");
        assert_eq!(message.timestamp, "02/10/28,14:31:41+32");

        // Failure cases
        assert!(decode_text_mode("+CMGR: 0,,24", "00", true).is_err());
        assert!(decode_text_mode(r#"+CMGR: "REC READ","0041""#, "XYZ", true).is_err());
    }
}
