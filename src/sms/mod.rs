pub mod alphabet;
pub mod pdu;
pub mod text;
pub mod types;

pub use alphabet::Alphabet;
pub use pdu::{decode, encode_submit, encode_submit_parts};
pub use text::decode_text_mode;
pub use types::{ConcatHeader, Pdu, SmsError, SmsMessage};
