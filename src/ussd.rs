use std::fmt::{Display, Formatter};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::sms::alphabet::{self, Alphabet};

#[derive(Debug, Error)]
pub enum UssdError {
    #[error("Malformed USSD payload: {0}")]
    Malformed(String),

    #[error("Reserved USSD data coding scheme 0x{0:02X}")]
    UnsupportedScheme(u8),

    #[error("Character {0:?} has no GSM 7-bit representation")]
    Unencodable(char),

    #[error("Modem rejected USSD request {0:?}")]
    Rejected(String)
}

/// How USSD strings are written to, or read back from, the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UssdEncoding {
    #[default]
    Auto,
    Plain,
    Hex7,
    Hex8,
    Ucs2
}
impl FromStr for UssdEncoding {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(UssdEncoding::Auto),
            "plain" => Ok(UssdEncoding::Plain),
            "hex7" => Ok(UssdEncoding::Hex7),
            "hex8" => Ok(UssdEncoding::Hex8),
            "ucs2" => Ok(UssdEncoding::Ucs2),
            _ => Err(anyhow::anyhow!("Unknown USSD encoding {}", value))
        }
    }
}
impl Display for UssdEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UssdEncoding::Auto => "auto",
            UssdEncoding::Plain => "plain",
            UssdEncoding::Hex7 => "hex7",
            UssdEncoding::Hex8 => "hex8",
            UssdEncoding::Ucs2 => "ucs2"
        };
        f.write_str(name)
    }
}

/// A network-originated USSD string, delivered once to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UssdMessage {
    pub status: u8,
    pub text: String,
    pub encoding: Alphabet
}

const CARRIAGE_RETURN: u8 = 0x0D;

/// Builds the `AT+CUSD` command carrying an already-encoded payload.
pub fn request_command(payload: &str) -> String {
    format!("AT+CUSD=1,\"{}\",15", payload)
}

/// Encodes a request string. `Auto` starts out as plain text, negotiation happens in the session.
pub fn encode_request(code: &str, encoding: UssdEncoding) -> Result<String, UssdError> {
    match encoding {
        UssdEncoding::Auto | UssdEncoding::Plain => Ok(code.to_string()),
        UssdEncoding::Hex7 => {
            let mut septets = alphabet::to_septets(code).map_err(UssdError::Unencodable)?;

            // Seven spare bits in the last octet would read back as '@', so pad with CR.
            if septets.len() % 8 == 7 {
                septets.push(CARRIAGE_RETURN);
            }
            Ok(hex::encode_upper(alphabet::pack_septets(&septets, 0)))
        },
        UssdEncoding::Hex8 => {
            let septets = alphabet::to_septets(code).map_err(UssdError::Unencodable)?;
            Ok(hex::encode_upper(septets))
        },
        UssdEncoding::Ucs2 => Ok(alphabet::ucs2_hex(code))
    }
}

/// Resolves a cell broadcast style DCS (GSM 03.38 section 5) into an alphabet.
pub fn alphabet_from_dcs(dcs: u8) -> Result<Alphabet, UssdError> {
    if dcs == 0x11 {
        return Ok(Alphabet::SixteenBit);
    }
    if dcs & 0xF0 <= 0x30 {
        return Ok(Alphabet::Default);
    }
    if dcs & 0xC0 == 0x40 || dcs & 0xF0 == 0x90 {
        return match dcs & 0x0C {
            0x00 => Ok(Alphabet::Default),
            0x04 => Ok(Alphabet::EightBit),
            0x08 => Ok(Alphabet::SixteenBit),
            _ => Err(UssdError::UnsupportedScheme(dcs))
        };
    }
    Err(UssdError::UnsupportedScheme(dcs))
}

fn hex_payload(payload: &str) -> Result<Vec<u8>, UssdError> {
    hex::decode(payload.trim())
        .map_err(|e| UssdError::Malformed(format!("{:?} is not hex: {}", payload, e)))
}

fn looks_like_hex(payload: &str) -> bool {
    let payload = payload.trim();
    !payload.is_empty() && payload.len() % 2 == 0 && payload.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decodes a `+CUSD` payload according to the configured response encoding and its DCS.
pub fn decode_response(
    payload: &str,
    dcs: u8,
    encoding: UssdEncoding
) -> Result<(String, Alphabet), UssdError> {
    let alphabet = alphabet_from_dcs(dcs)?;
    let text = match (encoding, alphabet) {
        (UssdEncoding::Plain, _) => payload.to_string(),

        // Many modems hand back readable text whatever the DCS says.
        (UssdEncoding::Auto, _) if !looks_like_hex(payload) => payload.to_string(),
        (UssdEncoding::Hex7, _) | (UssdEncoding::Auto, Alphabet::Default) => {
            let packed = hex_payload(payload)?;
            let count = packed.len() * 8 / 7;
            let mut septets = alphabet::unpack_septets(&packed, count)
                .ok_or_else(|| UssdError::Malformed("truncated septets".to_string()))?;

            // Strip the padding septet when the last octet had seven spare bits.
            if count > 0 && count * 7 == packed.len() * 8
                && matches!(septets.last(), Some(&CARRIAGE_RETURN) | Some(&0x00))
            {
                septets.pop();
            }
            alphabet::from_septets(&septets)
        },
        // Eight bit payloads are ISO 8859-1.
        (UssdEncoding::Hex8, _) | (UssdEncoding::Auto, Alphabet::EightBit) => {
            hex_payload(payload)?.into_iter().map(char::from).collect()
        },
        (UssdEncoding::Ucs2, _) | (UssdEncoding::Auto, Alphabet::SixteenBit) => {
            alphabet::from_ucs2(&hex_payload(payload)?)
                .ok_or_else(|| UssdError::Malformed("invalid UCS-2 payload".to_string()))?
        }
    };
    Ok((text, alphabet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        assert_eq!(encode_request("*100#", UssdEncoding::Auto).unwrap(), "*100#");
        assert_eq!(encode_request("*100#", UssdEncoding::Hex7).unwrap(), "AA180C3602");
        assert_eq!(encode_request("*100#", UssdEncoding::Hex8).unwrap(), "2A31303023");
        assert_eq!(encode_request("*100#", UssdEncoding::Ucs2).unwrap(), "002A0031003000300023");
        assert_eq!(request_command("AA180C3602"), "AT+CUSD=1,\"AA180C3602\",15");

        // Seven septets get a CR pad so the decoder can drop it.
        let padded = encode_request("*101*1#", UssdEncoding::Hex7).unwrap();
        assert_eq!(padded.len(), 14);
        assert_eq!(decode_response(&padded, 0x0F, UssdEncoding::Hex7).unwrap().0, "*101*1#");

        assert!(matches!(encode_request("€#", UssdEncoding::Hex8), Ok(_)));
        assert!(matches!(encode_request("ж", UssdEncoding::Hex7), Err(UssdError::Unencodable('ж'))));
    }

    #[test]
    fn test_alphabet_from_dcs() {
        // Success cases
        assert_eq!(alphabet_from_dcs(0x11).unwrap(), Alphabet::SixteenBit);
        assert_eq!(alphabet_from_dcs(0x0F).unwrap(), Alphabet::Default);
        assert_eq!(alphabet_from_dcs(0x30).unwrap(), Alphabet::Default);
        assert_eq!(alphabet_from_dcs(0x44).unwrap(), Alphabet::EightBit);
        assert_eq!(alphabet_from_dcs(0x48).unwrap(), Alphabet::SixteenBit);
        assert_eq!(alphabet_from_dcs(0x90).unwrap(), Alphabet::Default);

        // Failure cases
        assert!(matches!(alphabet_from_dcs(0x4C), Err(UssdError::UnsupportedScheme(0x4C))));
        assert!(matches!(alphabet_from_dcs(0xA0), Err(UssdError::UnsupportedScheme(0xA0))));
        assert!(matches!(alphabet_from_dcs(0xF0), Err(UssdError::UnsupportedScheme(0xF0))));
    }

    #[test]
    fn test_decode_response() {
        let (text, alphabet) = decode_response("C8329BFD06", 0x0F, UssdEncoding::Auto).unwrap();
        assert_eq!((text.as_str(), alphabet), ("Hello", Alphabet::Default));

        let (text, alphabet) = decode_response("00420061006C0061006E00630065", 0x48, UssdEncoding::Auto).unwrap();
        assert_eq!((text.as_str(), alphabet), ("Balance", Alphabet::SixteenBit));

        let (text, _) = decode_response("4F4B", 0x44, UssdEncoding::Auto).unwrap();
        assert_eq!(text, "OK");
        let (text, _) = decode_response("7573657240782E636F6D5F", 0x44, UssdEncoding::Auto).unwrap();
        assert_eq!(text, "user@x.com_");
        let (text, _) = decode_response("4E61EF76", 0x0F, UssdEncoding::Hex8).unwrap();
        assert_eq!(text, "Naïv");

        let (text, _) = decode_response("Your balance is 5", 0x0F, UssdEncoding::Plain).unwrap();
        assert_eq!(text, "Your balance is 5");
        let (text, _) = decode_response("Your balance is 5", 0x0F, UssdEncoding::Auto).unwrap();
        assert_eq!(text, "Your balance is 5");

        assert!(matches!(decode_response("C8329BFD06", 0xA0, UssdEncoding::Auto), Err(UssdError::UnsupportedScheme(_))));
        assert!(matches!(decode_response("XY", 0x0F, UssdEncoding::Hex7), Err(UssdError::Malformed(_))));
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("HEX7".parse::<UssdEncoding>().unwrap(), UssdEncoding::Hex7);
        assert_eq!(UssdEncoding::Ucs2.to_string(), "ucs2");
        assert!("base64".parse::<UssdEncoding>().is_err());
    }
}
