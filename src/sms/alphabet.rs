use serde::{Deserialize, Serialize};

/// Character set selected by a data coding scheme byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alphabet {
    Default,
    EightBit,
    SixteenBit
}
impl Alphabet {
    /// The DCS byte used for outgoing SMS-SUBMIT messages (general data coding, no class).
    pub const fn submit_dcs(self) -> u8 {
        match self {
            Alphabet::Default => 0x00,
            Alphabet::EightBit => 0x04,
            Alphabet::SixteenBit => 0x08
        }
    }
}

const ESCAPE: u8 = 0x1B;

/// GSM 03.38 default alphabet. Index 0x1B is the escape into the extension table.
const GSM7_BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1B}', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à'
];

const GSM7_EXTENSION: [(u8, char); 10] = [
    (0x0A, '\u{0C}'),
    (0x14, '^'),
    (0x28, '{'),
    (0x29, '}'),
    (0x2F, '\\'),
    (0x3C, '['),
    (0x3D, '~'),
    (0x3E, ']'),
    (0x40, '|'),
    (0x65, '€')
];

/// Appends the septets for `c`, returning false if it has no GSM 7-bit representation.
pub fn push_gsm7_char(c: char, out: &mut Vec<u8>) -> bool {
    if c == '\u{1B}' {
        return false;
    }
    if let Some(idx) = GSM7_BASIC.iter().position(|&g| g == c) {
        out.push(idx as u8);
        return true;
    }
    match GSM7_EXTENSION.iter().find(|(_, g)| *g == c) {
        Some((code, _)) => {
            out.push(ESCAPE);
            out.push(*code);
            true
        },
        None => false
    }
}

/// Converts text into unpacked septets, or returns the first unrepresentable character.
pub fn to_septets(text: &str) -> Result<Vec<u8>, char> {
    let mut septets = Vec::with_capacity(text.len());
    for c in text.chars() {
        if !push_gsm7_char(c, &mut septets) {
            return Err(c);
        }
    }
    Ok(septets)
}

pub fn is_gsm7(text: &str) -> bool {
    let mut scratch = Vec::with_capacity(2);
    text.chars().all(|c| {
        scratch.clear();
        push_gsm7_char(c, &mut scratch)
    })
}

/// Converts unpacked septets back into text, resolving escape sequences.
pub fn from_septets(septets: &[u8]) -> String {
    let mut text = String::with_capacity(septets.len());
    let mut iter = septets.iter().map(|s| s & 0x7F);
    while let Some(septet) = iter.next() {
        if septet != ESCAPE {
            text.push(GSM7_BASIC[septet as usize]);
            continue;
        }
        match iter.next() {
            Some(code) => {
                let c = GSM7_EXTENSION.iter()
                    .find(|(ext, _)| *ext == code)
                    .map(|(_, c)| *c)
                    .unwrap_or(GSM7_BASIC[code as usize]);
                text.push(c);
            },

            // A dangling escape is displayed as a space.
            None => text.push(' ')
        }
    }
    text
}

/// Packs septets LSB-first, leaving `fill_bits` zero bits at the start of the output.
pub fn pack_septets(septets: &[u8], fill_bits: usize) -> Vec<u8> {
    let total_bits = fill_bits + septets.len() * 7;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (i, septet) in septets.iter().enumerate() {
        let septet = septet & 0x7F;
        let bit = fill_bits + i * 7;
        let (byte, shift) = (bit / 8, bit % 8);

        out[byte] |= septet << shift;
        if shift > 1 {
            out[byte + 1] |= septet >> (8 - shift);
        }
    }
    out
}

/// Unpacks `count` septets, or None if `data` is too short to hold them.
pub fn unpack_septets(data: &[u8], count: usize) -> Option<Vec<u8>> {
    let mut septets = Vec::with_capacity(count);
    for i in 0..count {
        let bit = i * 7;
        let (byte, shift) = (bit / 8, bit % 8);

        let mut value = *data.get(byte)? >> shift;
        if shift > 1 {
            value |= *data.get(byte + 1)? << (8 - shift);
        }
        septets.push(value & 0x7F);
    }
    Some(septets)
}

pub fn latin1_bytes(text: &str) -> Option<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

pub fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn ucs2_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}

pub fn from_ucs2(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// UTF-8 text as uppercase UCS-2BE hex, the form modems expect with `AT+CSCS="UCS2"`.
pub fn ucs2_hex(text: &str) -> String {
    hex::encode_upper(ucs2_bytes(text))
}

pub fn from_ucs2_hex(value: &str) -> Option<String> {
    hex::decode(value.trim()).ok().and_then(|bytes| from_ucs2(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_septets() {
        let septets = to_septets("hellohello").unwrap();
        assert_eq!(hex::encode_upper(pack_septets(&septets, 0)), "E8329BFD4697D9EC37");

        let unpacked = unpack_septets(&pack_septets(&septets, 0), septets.len()).unwrap();
        assert_eq!(from_septets(&unpacked), "hellohello");

        // Eight septets fill exactly seven octets.
        assert_eq!(pack_septets(&to_septets("12345678").unwrap(), 0).len(), 7);
        assert!(unpack_septets(&[0xE8], 2).is_none());
    }

    #[test]
    fn test_extension_table() {
        let septets = to_septets("[1€]").unwrap();
        assert_eq!(septets, vec![0x1B, 0x3C, 0x31, 0x1B, 0x65, 0x1B, 0x3E]);
        assert_eq!(from_septets(&septets), "[1€]");

        // Unknown extension codes fall back to the basic table.
        assert_eq!(from_septets(&[0x1B, 0x41]), "A");
    }

    #[test]
    fn test_gsm7_detection() {
        assert!(is_gsm7("Hello @ £5 {ok}"));
        assert!(!is_gsm7("naïve"));
        assert_eq!(to_septets("ê"), Err('ê'));
    }

    #[test]
    fn test_ucs2_hex() {
        assert_eq!(ucs2_hex("Hi"), "00480069");
        assert_eq!(from_ucs2_hex("041F04400438043204350442").unwrap(), "Привет");
        assert!(from_ucs2_hex("004").is_none());
    }

    #[test]
    fn test_latin1() {
        assert_eq!(latin1_bytes("café").unwrap(), vec![0x63, 0x61, 0x66, 0xE9]);
        assert!(latin1_bytes("€").is_none());
        assert_eq!(from_latin1(&[0x63, 0xE9]), "cé");
    }
}
