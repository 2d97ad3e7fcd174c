//! Serial/UDID string handling (§3 Identity string, §4.5 steps 5-6, §8 round-trip law).

/// Decodes a USB string descriptor's UTF-16LE payload (the bytes following the 2-byte
/// bLength/bDescriptorType header) to ASCII, substituting `?` for any non-ASCII code unit and
/// stopping at the first NUL or the end of the buffer — per §4.5 step 5.
pub fn decode_string_descriptor(utf16le_payload: &[u8]) -> String {
    let mut out = String::with_capacity(utf16le_payload.len() / 2);
    for chunk in utf16le_payload.chunks_exact(2) {
        let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
        if unit == 0 {
            break;
        }
        if unit < 0x80 {
            out.push(unit as u8 as char);
        } else {
            out.push('?');
        }
    }
    out
}

/// Extracts the first supported language ID from the 4+ byte response to a GET_DESCRIPTOR
/// (string index 0) request: a little-endian u16 at offset `[2..4]` (§4.5 step 4).
pub fn first_language_id(response: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = response.get(2..4)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// Reformats a 24-character serial into the 25-character hyphenated UDID form by inserting
/// `-` between the 8th and 9th characters. Any other length passes through unchanged, per
/// §8's round-trip law.
pub fn reformat_udid(serial: &str) -> String {
    if serial.chars().count() != 24 {
        return serial.to_string();
    }

    let mut out = String::with_capacity(25);
    for (i, c) in serial.chars().enumerate() {
        if i == 8 {
            out.push('-');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reformats_24_char_serial() {
        let input = "001122334455667788990011";
        assert_eq!(input.len(), 24);
        assert_eq!(reformat_udid(input), "00112233-4455667788990011");
    }

    #[test]
    fn leaves_non_24_char_serial_unchanged() {
        assert_eq!(reformat_udid("short"), "short");
        let already_25 = "00112233-4455667788990011";
        assert_eq!(reformat_udid(already_25), already_25);
    }

    #[test]
    fn decodes_ascii_string_descriptor() {
        // "AB" little-endian UTF-16, then a NUL we must stop at.
        let payload = [0x41, 0x00, 0x42, 0x00, 0x00, 0x00, 0x43, 0x00];
        assert_eq!(decode_string_descriptor(&payload), "AB");
    }

    #[test]
    fn decodes_stopping_at_buffer_end_without_nul() {
        let payload = [0x41, 0x00, 0x42, 0x00];
        assert_eq!(decode_string_descriptor(&payload), "AB");
    }

    #[test]
    fn substitutes_question_mark_for_non_ascii() {
        // U+00E9 (é) is non-ASCII.
        let payload = [0x41, 0x00, 0xe9, 0x00, 0x00, 0x00];
        assert_eq!(decode_string_descriptor(&payload), "A?");
    }

    #[test]
    fn extracts_first_language_id() {
        let response = [0x04u8, 0x03, 0x09, 0x04];
        assert_eq!(first_language_id(&response), Some(0x0409));
    }

    #[test]
    fn first_language_id_none_when_too_short() {
        assert_eq!(first_language_id(&[0x04, 0x03]), None);
    }
}
