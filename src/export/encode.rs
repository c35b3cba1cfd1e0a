//! Content-Transfer-Encoding encoders for re-inlined attachment bodies.
//!
//! Encoders return physical lines without terminators; the serializer adds
//! CRLF.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{ConvertError, Result};

/// Maximum length of an encoded line, soft-break `=` included.
pub const ENCODED_LINE_LENGTH: usize = 76;

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Transfer encodings we can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    /// Parse a `Content-Transfer-Encoding` value; `7bit` when absent.
    pub fn from_header(value: Option<&str>) -> Result<Self> {
        let Some(value) = value.map(str::trim) else {
            return Ok(Self::SevenBit);
        };
        match value.to_ascii_lowercase().as_str() {
            "" | "7bit" => Ok(Self::SevenBit),
            "8bit" => Ok(Self::EightBit),
            "binary" => Ok(Self::Binary),
            "base64" => Ok(Self::Base64),
            "quoted-printable" => Ok(Self::QuotedPrintable),
            _ => Err(ConvertError::UnsupportedEncoding(value.to_string())),
        }
    }

    /// Encode raw attachment bytes into body lines.
    pub fn encode(self, data: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Self::Base64 => encode_base64(data),
            Self::QuotedPrintable => encode_quoted_printable(data),
            Self::SevenBit | Self::EightBit | Self::Binary => split_lines(data)
                .into_iter()
                .map(<[u8]>::to_vec)
                .collect(),
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
        })
    }
}

/// Encode `data` for the given `Content-Transfer-Encoding` header value.
pub fn encode_body(encoding: Option<&str>, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    Ok(TransferEncoding::from_header(encoding)?.encode(data))
}

/// Base64, wrapped at [`ENCODED_LINE_LENGTH`].
pub fn encode_base64(data: &[u8]) -> Vec<Vec<u8>> {
    let encoded = BASE64.encode(data);
    encoded
        .as_bytes()
        .chunks(ENCODED_LINE_LENGTH)
        .map(<[u8]>::to_vec)
        .collect()
}

/// Quoted-printable (RFC 2045 §6.7), wrapped at [`ENCODED_LINE_LENGTH`].
///
/// Line breaks in the data become hard breaks; long lines get soft breaks
/// that never split an `=XX` escape.
pub fn encode_quoted_printable(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for line in split_lines(data) {
        let mut current: Vec<u8> = Vec::with_capacity(ENCODED_LINE_LENGTH);
        for (i, &byte) in line.iter().enumerate() {
            let at_end = i + 1 == line.len();
            let literal = match byte {
                b'=' => false,
                b' ' | b'\t' => !at_end,
                33..=126 => true,
                _ => false,
            };
            let token_len = if literal { 1 } else { 3 };
            if current.len() + token_len > ENCODED_LINE_LENGTH - 1 {
                current.push(b'=');
                out.push(std::mem::take(&mut current));
            }
            if literal {
                current.push(byte);
            } else {
                current.extend_from_slice(&[
                    b'=',
                    HEX_UPPER[(byte >> 4) as usize],
                    HEX_UPPER[(byte & 0x0F) as usize],
                ]);
            }
        }
        out.push(current);
    }
    out
}

/// Split on `\n`, dropping a preceding `\r`. A trailing newline yields a
/// final empty line; empty input yields no lines.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(lines: &[Vec<u8>]) -> String {
        lines
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    #[test]
    fn test_png_base64_prefix() {
        let png = [
            0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H',
            b'D', b'R',
        ];
        let lines = encode_body(Some("base64"), &png).unwrap();
        assert!(text(&lines).starts_with("iVBORw0KGgoAAAANSUhE"));
    }

    #[test]
    fn test_base64_wraps_at_76() {
        let lines = encode_base64(&[0xAB; 200]);
        assert!(lines.len() > 1);
        assert!(lines[..lines.len() - 1].iter().all(|l| l.len() == 76));
        assert!(lines.last().unwrap().len() <= 76);
    }

    #[test]
    fn test_qp_utf8() {
        let lines = encode_body(Some("Quoted-Printable"), "Mit glücklichen Grüßen".as_bytes()).unwrap();
        let encoded = text(&lines);
        assert!(encoded.contains("gl=C3=BCcklichen"));
        assert_eq!(encoded, "Mit gl=C3=BCcklichen Gr=C3=BC=C3=9Fen");
    }

    #[test]
    fn test_qp_escapes_equals_and_trailing_space() {
        let lines = encode_quoted_printable(b"a=b \r\nnext\t");
        assert_eq!(lines, vec![b"a=3Db=20".to_vec(), b"next=09".to_vec()]);
    }

    #[test]
    fn test_qp_soft_breaks() {
        let input = "é".repeat(60);
        let lines = encode_quoted_printable(input.as_bytes());
        assert!(lines.len() > 1);
        for line in &lines[..lines.len() - 1] {
            assert!(line.len() <= ENCODED_LINE_LENGTH);
            assert!(line.ends_with(b"="));
        }
        // Escapes are never split across lines
        let joined: Vec<u8> = lines
            .iter()
            .flat_map(|l| l.strip_suffix(b"=").unwrap_or(l).to_vec())
            .collect();
        assert_eq!(joined, "=C3=A9".repeat(60).into_bytes());
    }

    #[test]
    fn test_pass_through_keeps_bytes() {
        let data = b"caf\xe9\r\nline two\n";
        let lines = encode_body(None, data).unwrap();
        assert_eq!(
            lines,
            vec![b"caf\xe9".to_vec(), b"line two".to_vec(), Vec::new()]
        );
        assert_eq!(encode_body(Some("8BIT"), b"").unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_unknown_encoding_is_fatal() {
        let err = encode_body(Some("x-unknown"), b"data").unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedEncoding(ref e) if e == "x-unknown"));
        assert_eq!(err.to_string(), "Unimplemented encoding: x-unknown");
    }
}
