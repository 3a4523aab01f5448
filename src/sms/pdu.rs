use tracing::debug;
use crate::sms::alphabet::{self, Alphabet};
use crate::sms::types::{Pdu, SmsError, SmsMessage};

/// TP-MTI values.
const MTI_DELIVER: u8 = 0x00;
const MTI_SUBMIT: u8 = 0x01;

const FIRST_OCTET_VPF_RELATIVE: u8 = 0x10;
const FIRST_OCTET_UDHI: u8 = 0x40;

/// 24 hours, relative format.
const VALIDITY_PERIOD: u8 = 0xA7;

/// TP-UD capacity of a single message.
const MAX_USER_DATA_OCTETS: usize = 140;
const MAX_USER_DATA_SEPTETS: usize = 160;

/// UDHL plus an 8-bit-reference concatenation IE.
const CONCAT_UDH_OCTETS: usize = 6;

/// Picks the narrowest alphabet able to carry `text`.
pub fn select_alphabet(text: &str, allow_ucs2: bool) -> Result<Alphabet, SmsError> {
    if alphabet::is_gsm7(text) {
        return Ok(Alphabet::Default);
    }
    if allow_ucs2 {
        return Ok(Alphabet::SixteenBit);
    }
    match text.chars().find(|c| u32::from(*c) > 0xFF) {
        Some(c) => Err(SmsError::Unencodable(c)),
        None => Ok(Alphabet::EightBit)
    }
}

/// Encodes a single-part SMS-SUBMIT, failing if `text` does not fit in one message.
pub fn encode_submit(dest: &str, text: &str, allow_ucs2: bool) -> Result<Pdu, SmsError> {
    let mut parts = encode_submit_parts(dest, text, allow_ucs2, 0)?;
    if parts.len() != 1 {
        return Err(SmsError::TooLong(parts.len()));
    }
    Ok(parts.remove(0))
}

/// Encodes `text` as one SMS-SUBMIT, or as several concatenated parts sharing `reference`.
pub fn encode_submit_parts(
    dest: &str,
    text: &str,
    allow_ucs2: bool,
    reference: u8
) -> Result<Vec<Pdu>, SmsError> {
    let address = encode_address(dest)?;
    let alphabet = select_alphabet(text, allow_ucs2)?;
    let units = character_units(text, alphabet)?;

    let (single_capacity, part_capacity) = match alphabet {
        Alphabet::Default => (MAX_USER_DATA_SEPTETS, MAX_USER_DATA_SEPTETS - septets_for_header(CONCAT_UDH_OCTETS)),
        _ => (MAX_USER_DATA_OCTETS, MAX_USER_DATA_OCTETS - CONCAT_UDH_OCTETS)
    };

    let total: usize = units.iter().map(Vec::len).sum();
    if total <= single_capacity {
        let payload: Vec<u8> = units.into_iter().flatten().collect();
        return Ok(vec![build_submit(&address, alphabet, &payload, None)]);
    }

    let chunks = split_units(units, part_capacity);
    if chunks.len() > u8::MAX as usize {
        return Err(SmsError::TooLong(chunks.len()));
    }

    let count = chunks.len() as u8;
    debug!("Splitting SMS into {} concatenated parts (ref {})", count, reference);
    Ok(chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let udh = [0x05, 0x00, 0x03, reference, count, idx as u8 + 1];
            build_submit(&address, alphabet, chunk, Some(&udh))
        })
        .collect())
}

/// Encodes each character into its indivisible alphabet units (septets or octets).
fn character_units(text: &str, alphabet: Alphabet) -> Result<Vec<Vec<u8>>, SmsError> {
    text.chars()
        .map(|c| {
            let mut unit = Vec::with_capacity(4);
            match alphabet {
                Alphabet::Default => {
                    if !alphabet::push_gsm7_char(c, &mut unit) {
                        return Err(SmsError::Unencodable(c));
                    }
                },
                Alphabet::EightBit => {
                    let byte = u8::try_from(u32::from(c)).map_err(|_| SmsError::Unencodable(c))?;
                    unit.push(byte);
                },
                Alphabet::SixteenBit => {
                    let mut buf = [0u16; 2];
                    for code_unit in c.encode_utf16(&mut buf) {
                        unit.extend_from_slice(&code_unit.to_be_bytes());
                    }
                }
            }
            Ok(unit)
        })
        .collect()
}

fn split_units(units: Vec<Vec<u8>>, capacity: usize) -> Vec<Vec<u8>> {
    let mut chunks: Vec<Vec<u8>> = vec![Vec::new()];
    for unit in units {
        let fits = chunks.last().is_some_and(|chunk| chunk.len() + unit.len() <= capacity);
        if !fits {
            chunks.push(Vec::new());
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.extend(unit);
        }
    }
    chunks
}

/// Number of septets occupied by a UDH of `udh_octets` (including UDHL) plus fill bits.
fn septets_for_header(udh_octets: usize) -> usize {
    (udh_octets * 8).div_ceil(7)
}

fn build_submit(address: &[u8], alphabet: Alphabet, payload: &[u8], udh: Option<&[u8]>) -> Pdu {
    let mut first_octet = MTI_SUBMIT | FIRST_OCTET_VPF_RELATIVE;
    if udh.is_some() {
        first_octet |= FIRST_OCTET_UDHI;
    }

    let mut tpdu = vec![first_octet, 0x00];
    tpdu.extend_from_slice(address);
    tpdu.push(0x00);
    tpdu.push(alphabet.submit_dcs());
    tpdu.push(VALIDITY_PERIOD);

    let header = udh.unwrap_or_default();
    match alphabet {
        Alphabet::Default => {
            let header_septets = septets_for_header(header.len());
            let fill_bits = header_septets * 7 - header.len() * 8;

            tpdu.push((header_septets + payload.len()) as u8);
            tpdu.extend_from_slice(header);
            tpdu.extend(alphabet::pack_septets(payload, fill_bits));
        },
        _ => {
            tpdu.push((header.len() + payload.len()) as u8);
            tpdu.extend_from_slice(header);
            tpdu.extend_from_slice(payload);
        }
    }

    // Empty SCA, the modem uses its configured service centre.
    Pdu {
        hex: format!("00{}", hex::encode_upper(&tpdu)),
        tpdu_len: tpdu.len()
    }
}

fn encode_address(dest: &str) -> Result<Vec<u8>, SmsError> {
    let cleaned: String = dest.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let (international, digits) = match cleaned.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str())
    };
    if digits.is_empty() || digits.len() > 20 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(SmsError::InvalidAddress(dest.to_string()));
    }

    let mut encoded = vec![
        digits.len() as u8,
        if international { 0x91 } else { 0x81 }
    ];
    encoded.extend(digits.as_bytes().chunks(2).map(|pair| {
        let low = pair[0] - b'0';
        let high = pair.get(1).map_or(0x0F, |d| d - b'0');
        (high << 4) | low
    }));
    Ok(encoded)
}

struct PduReader<'a> {
    data: &'a [u8],
    position: usize
}
impl<'a> PduReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn byte(&mut self, field: &str) -> Result<u8, SmsError> {
        Ok(self.take(1, field)?[0])
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], SmsError> {
        let end = self.position + len;
        let slice = self.data
            .get(self.position..end)
            .ok_or_else(|| SmsError::Malformed(format!("truncated at {}", field)))?;

        self.position = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.position.min(self.data.len())..];
        self.position = self.data.len();
        slice
    }
}

/// Resolves the SMS data coding scheme per GSM 03.38 section 4.
pub fn alphabet_from_dcs(dcs: u8) -> Result<Alphabet, SmsError> {
    match dcs >> 4 {
        0x0..=0x7 => {
            // Compressed text is not supported.
            if dcs & 0x20 != 0 {
                return Err(SmsError::UnsupportedScheme(dcs));
            }
            match (dcs >> 2) & 0x03 {
                0 => Ok(Alphabet::Default),
                1 => Ok(Alphabet::EightBit),
                2 => Ok(Alphabet::SixteenBit),
                _ => Err(SmsError::UnsupportedScheme(dcs))
            }
        },
        0xC | 0xD => Ok(Alphabet::Default),
        0xE => Ok(Alphabet::SixteenBit),
        0xF if dcs & 0x04 != 0 => Ok(Alphabet::EightBit),
        0xF => Ok(Alphabet::Default),
        _ => Err(SmsError::UnsupportedScheme(dcs))
    }
}

/// Decodes a PDU-mode `+CMGR` body line (SCA followed by an SMS-DELIVER or SMS-SUBMIT TPDU).
pub fn decode(raw_line: &str) -> Result<SmsMessage, SmsError> {
    let bytes = hex::decode(raw_line.trim())
        .map_err(|e| SmsError::Malformed(format!("invalid hex: {}", e)))?;
    let mut reader = PduReader::new(&bytes);

    let sca_len = reader.byte("SCA length")? as usize;
    let service_center = match sca_len {
        0 => String::new(),
        len => decode_service_center(reader.take(len, "SCA")?)
    };

    let first_octet = reader.byte("first octet")?;
    let message_type = first_octet & 0x03;
    let has_udh = first_octet & FIRST_OCTET_UDHI != 0;

    let (sender, dcs, timestamp) = match message_type {
        MTI_DELIVER => {
            let sender = decode_address(&mut reader)?;
            let _pid = reader.byte("PID")?;
            let dcs = reader.byte("DCS")?;
            let timestamp = format_timestamp(reader.take(7, "SCTS")?);
            (sender, dcs, timestamp)
        },
        MTI_SUBMIT => {
            let _reference = reader.byte("message reference")?;
            let destination = decode_address(&mut reader)?;
            let _pid = reader.byte("PID")?;
            let dcs = reader.byte("DCS")?;
            match (first_octet >> 3) & 0x03 {
                0 => {},
                2 => { reader.take(1, "validity period")?; },
                _ => { reader.take(7, "validity period")?; }
            }
            (destination, dcs, String::new())
        },
        other => return Err(SmsError::Malformed(format!("unsupported message type {}", other)))
    };

    let alphabet = alphabet_from_dcs(dcs)?;
    let udl = reader.byte("UDL")? as usize;
    let user_data = reader.rest();

    let (user_data_header, user_data) = decode_user_data(user_data, udl, alphabet, has_udh)?;
    Ok(SmsMessage {
        sender,
        timestamp,
        alphabet,
        user_data,
        user_data_header,
        service_center,
        message_type
    })
}

fn decode_user_data(
    data: &[u8],
    udl: usize,
    alphabet: Alphabet,
    has_udh: bool
) -> Result<(Option<Vec<u8>>, String), SmsError> {
    let header = if has_udh {
        let udhl = *data.first()
            .ok_or_else(|| SmsError::Malformed("missing UDH length".to_string()))? as usize;
        let ies = data.get(1..=udhl)
            .ok_or_else(|| SmsError::Malformed("truncated UDH".to_string()))?;
        Some(ies.to_vec())
    } else {
        None
    };
    let header_octets = header.as_ref().map_or(0, |ies| ies.len() + 1);

    let text = match alphabet {
        Alphabet::Default => {
            let septets = alphabet::unpack_septets(data, udl)
                .ok_or_else(|| SmsError::Malformed("user data shorter than UDL".to_string()))?;
            let skip = if header_octets > 0 { septets_for_header(header_octets) } else { 0 };
            alphabet::from_septets(septets.get(skip..).unwrap_or_default())
        },
        Alphabet::EightBit | Alphabet::SixteenBit => {
            let body = data.get(header_octets..udl)
                .ok_or_else(|| SmsError::Malformed("user data shorter than UDL".to_string()))?;
            if alphabet == Alphabet::EightBit {
                alphabet::from_latin1(body)
            } else {
                alphabet::from_ucs2(body)
                    .ok_or_else(|| SmsError::Malformed("invalid UCS-2 user data".to_string()))?
            }
        }
    };
    Ok((header, text))
}

fn semi_octet_digit(nibble: u8) -> Option<char> {
    match nibble {
        0..=9 => Some((b'0' + nibble) as char),
        0xA => Some('*'),
        0xB => Some('#'),
        0xC => Some('a'),
        0xD => Some('b'),
        0xE => Some('c'),
        _ => None
    }
}

fn decode_semi_octets(data: &[u8], max_digits: usize) -> String {
    data.iter()
        .flat_map(|b| [b & 0x0F, b >> 4])
        .take(max_digits)
        .map_while(semi_octet_digit)
        .collect()
}

fn decode_address(reader: &mut PduReader) -> Result<String, SmsError> {
    let digits = reader.byte("address length")? as usize;
    let type_of_address = reader.byte("address type")?;
    let data = reader.take(digits.div_ceil(2), "address")?;

    // Alphanumeric originators are packed GSM 7-bit text.
    if (type_of_address >> 4) & 0x07 == 0x05 {
        let septets = alphabet::unpack_septets(data, digits * 4 / 7)
            .ok_or_else(|| SmsError::Malformed("truncated alphanumeric address".to_string()))?;
        return Ok(alphabet::from_septets(&septets));
    }

    let number = decode_semi_octets(data, digits);
    Ok(if (type_of_address >> 4) & 0x07 == 0x01 {
        format!("+{}", number)
    } else {
        number
    })
}

fn decode_service_center(data: &[u8]) -> String {
    let Some((&type_of_address, digits)) = data.split_first() else {
        return String::new();
    };
    let number = decode_semi_octets(digits, digits.len() * 2);
    if (type_of_address >> 4) & 0x07 == 0x01 {
        format!("+{}", number)
    } else {
        number
    }
}

/// Formats a TP-SCTS as `yy/MM/dd,hh:mm:ss±zz`, with the zone in quarter hours.
fn format_timestamp(scts: &[u8]) -> String {
    let field = |b: u8| (b & 0x0F) * 10 + (b >> 4);
    let zone = (scts[6] & 0x07) * 10 + (scts[6] >> 4);
    let sign = if scts[6] & 0x08 != 0 { '-' } else { '+' };
    format!(
        "{:02}/{:02}/{:02},{:02}:{:02}:{:02}{}{:02}",
        field(scts[0]), field(scts[1]), field(scts[2]),
        field(scts[3]), field(scts[4]), field(scts[5]),
        sign, zone
    )
}
