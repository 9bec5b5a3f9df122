//! Conversion between domain values and the peripheral's byte encoding.
//!
//! The firmware stores the box value as a single ASCII digit: `'1'` for on and
//! `'0'` for off. Nothing outside this module sees those bytes.

use serde::Serialize;

/// Two-state value carried by the box characteristic.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum BoxState {
    #[default]
    #[display("off")]
    Off,
    #[display("on")]
    On,
}

impl BoxState {
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl From<bool> for BoxState {
    fn from(value: bool) -> Self {
        if value { Self::On } else { Self::Off }
    }
}

impl From<BoxState> for bool {
    fn from(value: BoxState) -> Self {
        value.is_on()
    }
}

/// Renders a boolean in the firmware's text form.
#[must_use]
pub fn bool_to_string(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Parses the firmware's text form. Anything other than `"1"` is false.
#[must_use]
pub fn string_to_bool(value: &str) -> bool {
    value == "1"
}

/// Encodes a box value for a characteristic write.
#[must_use]
pub fn encode_box(value: BoxState) -> Vec<u8> {
    bool_to_string(value.is_on()).as_bytes().to_vec()
}

/// Decodes a box characteristic payload.
#[must_use]
pub fn decode_box(payload: &[u8]) -> BoxState {
    BoxState::from(payload == b"1")
}

/// Decodes a message characteristic payload, replacing invalid UTF-8.
#[must_use]
pub fn decode_message(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// A value type published for one channel.
pub trait ChannelValue: Clone + Send + Sync + 'static {
    /// Decodes a payload. Empty payloads never decode.
    fn decode(payload: &[u8]) -> Option<Self>;
}

impl ChannelValue for String {
    fn decode(payload: &[u8]) -> Option<Self> {
        (!payload.is_empty()).then(|| decode_message(payload))
    }
}

impl ChannelValue for BoxState {
    fn decode(payload: &[u8]) -> Option<Self> {
        (!payload.is_empty()).then(|| decode_box(payload))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0")]
    #[case("1")]
    fn text_form_round_trips(#[case] input: &str) {
        assert_eq!(input, bool_to_string(string_to_bool(input)));
    }

    #[rstest]
    #[case("")]
    #[case("true")]
    #[case("01")]
    #[case(" 1")]
    #[case("2")]
    fn unknown_text_is_false(#[case] input: &str) {
        assert!(!string_to_bool(input));
    }

    #[rstest]
    #[case(BoxState::On, b"1")]
    #[case(BoxState::Off, b"0")]
    fn box_values_encode_to_single_ascii_digit(#[case] value: BoxState, #[case] expected: &[u8]) {
        assert_eq!(expected, encode_box(value).as_slice());
    }

    #[test]
    fn empty_payloads_do_not_decode() {
        assert_eq!(None, <String as ChannelValue>::decode(&[]));
        assert_eq!(None, <BoxState as ChannelValue>::decode(&[]));
    }

    #[test]
    fn message_decoding_is_lossy() {
        assert_eq!(
            Some("Hi\u{FFFD}".to_string()),
            <String as ChannelValue>::decode(&[b'H', b'i', 0xFF])
        );
    }
}
