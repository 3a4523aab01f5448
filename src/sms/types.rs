use serde::Serialize;
use thiserror::Error;
use crate::sms::alphabet::Alphabet;

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("Malformed PDU: {0}")]
    Malformed(String),

    #[error("Unsupported data coding scheme 0x{0:02X}")]
    UnsupportedScheme(u8),

    #[error("Invalid destination address {0:?}")]
    InvalidAddress(String),

    #[error("Character {0:?} cannot be encoded with the permitted alphabets")]
    Unencodable(char),

    #[error("Message needs {0} parts, more than a concatenated SMS can carry")]
    TooLong(usize)
}

/// A decoded inbound message, handed to the notification sink once and then dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsMessage {
    pub sender: String,
    pub timestamp: String,
    pub alphabet: Alphabet,
    pub user_data: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data_header: Option<Vec<u8>>,

    pub service_center: String,

    /// TP-MTI of the decoded TPDU (0 = DELIVER, 1 = SUBMIT).
    pub message_type: u8
}
impl SmsMessage {

    /// Returns the concatenation header if the UDH carries one (IEI 0x00 or 0x08).
    pub fn concatenation(&self) -> Option<ConcatHeader> {
        let header = self.user_data_header.as_deref()?;
        let mut rest = header;
        while rest.len() >= 2 {
            let (iei, len) = (rest[0], rest[1] as usize);
            let data = rest.get(2..2 + len)?;
            match (iei, data) {
                (0x00, [reference, total, index]) => return Some(ConcatHeader {
                    reference: u16::from(*reference),
                    total: *total,
                    index: *index
                }),
                (0x08, [hi, lo, total, index]) => return Some(ConcatHeader {
                    reference: u16::from_be_bytes([*hi, *lo]),
                    total: *total,
                    index: *index
                }),
                _ => rest = &rest[2 + len..]
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcatHeader {
    pub reference: u16,
    pub total: u8,
    pub index: u8
}

/// An encoded SMS-SUBMIT ready for `AT+CMGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {

    /// Hex of the SCA octet followed by the TPDU.
    pub hex: String,

    /// TPDU length in octets, excluding the SCA, as `AT+CMGS=<length>` expects.
    pub tpdu_len: usize
}
