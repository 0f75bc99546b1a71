//! Latin-1 / UTF-8 bridge for the WebTorrent wire format.
//!
//! JSON text is UTF-8, but tracker messages carry raw 20-byte identifiers.
//! The WebTorrent convention maps each byte one-to-one onto the Unicode
//! code points U+0000..U+00FF and ships the UTF-8 encoding of that string,
//! so `from_latin1` and `to_latin1` must be exact inverses on every byte
//! sequence.

use crate::error::Error;

/// Encodes arbitrary bytes as the UTF-8 string whose code points are the
/// byte values. Output length is at most twice the input length.
pub fn from_latin1(bytes: &[u8]) -> String {
    // char::from(u8) is exactly the U+0000..U+00FF mapping; bytes >= 0x80
    // become two-byte UTF-8 sequences.
    let mut out = String::with_capacity(bytes.len() * 2);
    out.extend(bytes.iter().map(|&b| char::from(b)));
    out
}

/// Decodes a UTF-8 byte sequence back into the bytes it encodes.
///
/// The decoder accepts modern 1..4-byte UTF-8 only. Truncated sequences,
/// stray or missing continuation bytes, overlong encodings, surrogates,
/// 5/6-byte lead bytes and any code point above 0xFF are rejected.
pub fn to_latin1(input: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(input.len());
    let mut it = input.iter();
    while let Some(&lead) = it.next() {
        let (len, mut cp) = match lead {
            0x00..=0x7F => (1, u32::from(lead)),
            0xC0..=0xDF => (2, u32::from(lead & 0x1F)),
            0xE0..=0xEF => (3, u32::from(lead & 0x0F)),
            0xF0..=0xF7 => (4, u32::from(lead & 0x07)),
            _ => {
                return Err(Error::BadMessage(format!(
                    "invalid UTF-8 lead byte 0x{lead:02X}"
                )));
            }
        };

        for _ in 1..len {
            let cont = *it
                .next()
                .ok_or_else(|| Error::BadMessage("truncated UTF-8 sequence".into()))?;
            if cont & 0xC0 != 0x80 {
                return Err(Error::BadMessage(format!(
                    "invalid UTF-8 continuation byte 0x{cont:02X}"
                )));
            }
            cp = (cp << 6) | u32::from(cont & 0x3F);
        }

        let min = match len {
            2 => 0x80,
            3 => 0x800,
            4 => 0x1_0000,
            _ => 0,
        };
        if cp < min {
            return Err(Error::BadMessage(format!(
                "overlong UTF-8 encoding of U+{cp:04X}"
            )));
        }
        if (0xD800..=0xDFFF).contains(&cp) || cp > 0x10_FFFF {
            return Err(Error::BadMessage(format!("invalid code point U+{cp:04X}")));
        }
        if cp > 0xFF {
            return Err(Error::BadMessage(format!(
                "code point U+{cp:04X} outside latin1 range"
            )));
        }
        out.push(cp as u8);
    }
    Ok(out)
}
