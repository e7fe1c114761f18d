//! Encoding detection for files written by the terminal. Parameter sets and
//! reports are frequently UTF-16LE, sometimes without a BOM, and older ones
//! are in a legacy single-byte code page.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

/// Decodes `bytes` with a detected encoding. Returns the text (BOM removed)
/// and the name of the encoding that was used.
pub fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    let encoding = detect_encoding(bytes);
    let (text, _) = encoding.decode_with_bom_removal(bytes);
    let text = text.into_owned();
    (text, encoding.name())
}

pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }
    if let Some(encoding) = sniff_utf16(bytes) {
        return encoding;
    }
    if std::str::from_utf8(bytes).is_ok() {
        return UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

// BOM-less UTF-16 shows up as mostly-NUL bytes in one of the two lanes.
fn sniff_utf16(bytes: &[u8]) -> Option<&'static Encoding> {
    let sample = &bytes[..bytes.len().min(512)];
    if sample.len() < 4 {
        return None;
    }
    let pairs = sample.len() / 2;
    let even_nul = sample.iter().step_by(2).filter(|b| **b == 0).count();
    let odd_nul = sample.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    if odd_nul * 10 >= pairs * 7 && even_nul * 10 < pairs {
        Some(UTF_16LE)
    } else if even_nul * 10 >= pairs * 7 && odd_nul * 10 < pairs {
        Some(UTF_16BE)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(text: &str, bom: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if bom {
            out.extend_from_slice(&[0xFF, 0xFE]);
        }
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    #[test]
    fn decodes_utf16le_with_bom() {
        let (text, name) = decode_text(&utf16le("Lots=0.1\r\n", true));
        assert_eq!(text, "Lots=0.1\r\n");
        assert_eq!(name, "UTF-16LE");
    }

    #[test]
    fn decodes_utf16le_without_bom() {
        let (text, name) = decode_text(&utf16le("TakeProfit=50||10||5||100||Y\n", false));
        assert_eq!(text, "TakeProfit=50||10||5||100||Y\n");
        assert_eq!(name, "UTF-16LE");
    }

    #[test]
    fn plain_ascii_is_utf8() {
        let (text, name) = decode_text(b"; comment\nA=1\n");
        assert_eq!(text, "; comment\nA=1\n");
        assert_eq!(name, "UTF-8");
    }

    #[test]
    fn utf8_bom_is_removed() {
        let (text, _) = decode_text(b"\xEF\xBB\xBFA=1");
        assert_eq!(text, "A=1");
    }

    #[test]
    fn legacy_single_byte_text_still_decodes() {
        // "Größe=1" in windows-1252
        let (text, _) = decode_text(b"Gr\xF6\xDFe=1\n");
        assert!(text.ends_with("e=1\n"), "{:?}", text);
        assert!(!text.contains('\u{FFFD}'), "{:?}", text);
    }
}
