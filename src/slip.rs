//! SLIP framing for the ROM bootloader serial protocol
//!
//! Every packet exchanged with the ROM is delimited by `0xC0` bytes, with
//! occurrences of the delimiter and escape bytes inside the payload replaced
//! by two-byte escape sequences.
//!
//! See https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#low-level-protocol

/// Frame delimiter
const END: u8 = 0xC0;
/// Escape byte
const ESC: u8 = 0xDB;
/// Escaped `0xC0`
const ESC_END: u8 = 0xDC;
/// Escaped `0xDB`
const ESC_ESC: u8 = 0xDD;

/// Wrap `data` in a SLIP frame, escaping the special bytes.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 10);
    frame.push(END);

    for byte in data {
        match *byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(*byte),
        }
    }

    frame.push(END);
    frame
}

/// Unwrap the payload of a SLIP frame, undoing the escape sequences.
///
/// Leading and trailing runs of `END` bytes are stripped. An escape byte
/// followed by anything other than `ESC_END`/`ESC_ESC` passes the second
/// byte through verbatim; the ROM loader produces such sequences and a
/// strict decoder would reject otherwise valid responses.
pub fn decode(frame: &[u8]) -> Vec<u8> {
    let mut start = 0;
    let mut end = frame.len();

    while start < end && frame[start] == END {
        start += 1;
    }
    while end > start && frame[end - 1] == END {
        end -= 1;
    }

    let content = &frame[start..end];
    let mut data = Vec::with_capacity(content.len());

    let mut i = 0;
    while i < content.len() {
        if content[i] == ESC && i + 1 < content.len() {
            match content[i + 1] {
                ESC_END => data.push(END),
                ESC_ESC => data.push(ESC),
                other => data.push(other),
            }
            i += 2;
        } else {
            data.push(content[i]);
            i += 1;
        }
    }

    data
}

/// Extract the first complete frame from a receive buffer.
///
/// Bytes preceding the first `END` are line noise and are skipped. A frame
/// only closes once at least one non-`END` byte has been seen, so runs of
/// delimiters between frames never produce empty frames. Returns the frame
/// (delimiters included) and the remaining bytes, or `None` while the
/// closing delimiter has not arrived yet.
pub fn extract_frame(buffer: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = buffer.iter().position(|b| *b == END)?;

    let mut in_frame = false;
    for (i, byte) in buffer.iter().enumerate().skip(start) {
        if *byte == END {
            if in_frame {
                return Some((&buffer[start..=i], &buffer[i + 1..]));
            }
        } else {
            in_frame = true;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_empty() {
        assert_eq!(encode(&[]), [END, END]);
    }

    #[test]
    fn encode_plain_bytes() {
        assert_eq!(
            encode(&[0x01, 0x02, 0x03, 0x04]),
            [END, 0x01, 0x02, 0x03, 0x04, END]
        );
    }

    #[test]
    fn encode_escapes_end() {
        assert_eq!(encode(&[END]), [END, ESC, ESC_END, END]);
    }

    #[test]
    fn encode_escapes_esc() {
        assert_eq!(encode(&[ESC]), [END, ESC, ESC_ESC, END]);
    }

    #[test]
    fn encode_all_special_bytes() {
        assert_eq!(
            encode(&[END, END, ESC, ESC]),
            [END, ESC, ESC_END, ESC, ESC_END, ESC, ESC_ESC, ESC, ESC_ESC, END]
        );
    }

    #[test]
    fn decode_plain_frame() {
        assert_eq!(decode(&[END, 0x01, 0x02, 0x03, END]), [0x01, 0x02, 0x03]);
    }

    #[test]
    fn decode_unescapes() {
        assert_eq!(
            decode(&[END, 0x01, ESC, ESC_END, 0x03, END]),
            [0x01, END, 0x03]
        );
        assert_eq!(
            decode(&[END, 0x01, ESC, ESC_ESC, 0x03, END]),
            [0x01, ESC, 0x03]
        );
    }

    #[test]
    fn decode_unknown_escape_passes_through() {
        assert_eq!(decode(&[END, ESC, 0xFF, 0x03, END]), [0xFF, 0x03]);
    }

    #[test]
    fn decode_strips_delimiter_runs() {
        assert_eq!(decode(&[END, END, END, 0x01, 0x02, END]), [0x01, 0x02]);
        assert_eq!(decode(&[END, 0x01, 0x02, END, END, END]), [0x01, 0x02]);
    }

    #[test]
    fn decode_empty_frame() {
        assert!(decode(&[END, END]).is_empty());
        assert!(decode(&[END]).is_empty());
        assert!(decode(&[]).is_empty());
    }

    #[test]
    fn round_trip() {
        let cases: &[&[u8]] = &[
            &[],
            &[0x00],
            &[0x01, 0x02, 0x03],
            &[END],
            &[ESC],
            &[END, ESC],
            &[END, END, ESC, ESC],
            &[0x00, END, 0x00, ESC, 0x00],
            &[0xFF; 256],
        ];

        for case in cases {
            assert_eq!(&decode(&encode(case)), case);
        }
    }

    #[test]
    fn extract_single_frame() {
        let buffer = [END, 0x01, 0x02, 0x03, END];
        let (frame, rest) = extract_frame(&buffer).unwrap();
        assert_eq!(frame, buffer);
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_consecutive_frames() {
        let buffer = [END, 0x01, 0x02, END, END, 0x03, 0x04, END];
        let (frame, rest) = extract_frame(&buffer).unwrap();
        assert_eq!(frame, [END, 0x01, 0x02, END]);

        let (frame, rest) = extract_frame(rest).unwrap();
        assert_eq!(frame, [END, 0x03, 0x04, END]);
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_incomplete_frame() {
        assert!(extract_frame(&[END, 0x01, 0x02]).is_none());
        assert!(extract_frame(&[0x01, 0x02, 0x03]).is_none());
        assert!(extract_frame(&[]).is_none());
    }

    #[test]
    fn extract_skips_leading_garbage() {
        let buffer = [0x01, 0x02, END, 0x03, 0x04, END];
        let (frame, rest) = extract_frame(&buffer).unwrap();
        assert_eq!(frame, [END, 0x03, 0x04, END]);
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_ignores_delimiter_runs() {
        assert!(extract_frame(&[END, END, END]).is_none());
    }

    #[test]
    fn extract_keeps_escaped_bytes_intact() {
        let buffer = [END, 0x01, ESC, ESC_END, 0x02, END];
        let (frame, rest) = extract_frame(&buffer).unwrap();
        assert_eq!(frame, buffer);
        assert!(rest.is_empty());
    }
}
