use crate::twilio_types::{OutboundMarkMeta, OutboundMediaMeta, TwilioOutbound};

use base64::{engine, Engine};

const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

pub fn b64_decode(enc: &str) -> Result<Vec<u8>, base64::DecodeError> {
    engine::general_purpose::STANDARD.decode(enc)
}

/// Prepare a TwilioOutbound media message from raw mu-law audio.
pub fn audio2twilio(audio: &[u8], stream_sid: &str) -> TwilioOutbound {
    TwilioOutbound::Media {
        media: OutboundMediaMeta {
            payload: engine::general_purpose::STANDARD.encode(audio),
        },
        stream_sid: stream_sid.to_string(),
    }
}

pub fn mark2twilio(name: &str, stream_sid: &str) -> TwilioOutbound {
    TwilioOutbound::Mark {
        mark: OutboundMarkMeta {
            name: name.to_string(),
        },
        stream_sid: stream_sid.to_string(),
    }
}

/// Normalise a dialable number to E.164. Bare 10-digit numbers are assumed to be
/// North American.
pub fn normalize_phone_number(number: &str) -> String {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => format!("+1{digits}"),
        11 if digits.starts_with('1') => format!("+{digits}"),
        _ if number.trim_start().starts_with('+') => format!("+{digits}"),
        _ => digits,
    }
}

pub fn is_valid_phone_number(number: &str) -> bool {
    let normalized = normalize_phone_number(number);
    let Some(digits) = normalized.strip_prefix('+') else {
        return false;
    };
    (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_payload_survives_the_twilio_encoding() {
        let TwilioOutbound::Media { media, stream_sid } = audio2twilio(&[0xff, 0x7f, 0x00], "MZ1")
        else {
            panic!("expected media message");
        };
        assert_eq!(stream_sid, "MZ1");
        assert_eq!(b64_decode(&media.payload).unwrap(), vec![0xff, 0x7f, 0x00]);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(b64_decode("not base64!").is_err());
    }

    #[test]
    fn phone_numbers_normalise_to_e164() {
        assert_eq!(normalize_phone_number("(555) 123-4567"), "+15551234567");
        assert_eq!(normalize_phone_number("1-555-123-4567"), "+15551234567");
        assert_eq!(normalize_phone_number("+44 20 7946 0958"), "+442079460958");
        assert_eq!(normalize_phone_number("12345"), "12345");
    }

    #[test]
    fn only_plausible_lengths_are_valid() {
        assert!(is_valid_phone_number("5551234567"));
        assert!(is_valid_phone_number("+442079460958"));
        assert!(!is_valid_phone_number("12345"));
        assert!(!is_valid_phone_number("+1234567890123456"));
        assert!(!is_valid_phone_number(""));
    }
}
