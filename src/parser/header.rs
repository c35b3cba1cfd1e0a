//! MIME header helpers: structured parameters (RFC 2045/2231) and
//! encoded-words (RFC 2047).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::warn;

use crate::model::mime::Headers;

/// Header that marks a part whose body was externalized by Mail.app.
pub const APPLE_CONTENT_LENGTH: &str = "X-Apple-Content-Length";

/// Boundary token of a `multipart/*` header block, if any.
pub fn multipart_boundary(headers: &Headers) -> Option<String> {
    let content_type = headers.text("Content-Type")?;
    let fake = format!("Content-Type: {content_type}\r\n\r\n");
    let parsed = MessageParser::default().parse(fake.as_bytes())?;
    let ct = parsed.root_part().content_type()?;
    if !ct.ctype().eq_ignore_ascii_case("multipart") {
        return None;
    }
    ct.attribute("boundary")
        .filter(|b| !b.is_empty())
        .map(String::from)
}

/// Attachment file name declared in the message.
///
/// The `Content-Disposition` `filename` parameter wins over the
/// `Content-Type` `name` parameter. Extended (`filename*=UTF-8''…`) and
/// continued parameters are resolved by `mail-parser`; any encoded-words left
/// in the result are decoded afterwards.
pub fn declared_filename(headers: &Headers) -> Option<String> {
    let mut fake = String::new();
    for name in ["Content-Disposition", "Content-Type"] {
        if let Some(value) = headers.text(name) {
            fake.push_str(name);
            fake.push_str(": ");
            fake.push_str(&value);
            fake.push_str("\r\n");
        }
    }
    if fake.is_empty() {
        return None;
    }
    fake.push_str("\r\n");

    let parsed = MessageParser::default().parse(fake.as_bytes())?;
    let name = parsed.root_part().attachment_name()?;
    let decoded = decode_encoded_words(name);
    let decoded = decoded.trim();
    if decoded.is_empty() {
        None
    } else {
        Some(decoded.to_string())
    }
}

/// Boundary token declared anywhere on a single physical line.
///
/// Used while scanning raw lines, so folded `Content-Type` headers whose
/// `boundary=` parameter sits on a continuation line are found too.
pub fn declared_boundary(line: &[u8]) -> Option<String> {
    const NEEDLE: &[u8] = b"boundary=";
    let start = line
        .windows(NEEDLE.len())
        .position(|w| w.eq_ignore_ascii_case(NEEDLE))?
        + NEEDLE.len();
    let rest = &line[start..];

    let value = if let Some(quoted) = rest.strip_prefix(b"\"") {
        let end = quoted.iter().position(|&b| b == b'"')?;
        &quoted[..end]
    } else {
        let end = rest
            .iter()
            .position(|&b| b == b';' || b.is_ascii_whitespace())
            .unwrap_or(rest.len());
        &rest[..end]
    };

    if value.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(value).into_owned())
    }
}

/// Decode RFC 2047 encoded-words in a parameter value.
///
/// Whitespace between two adjacent encoded-words is dropped. Tokens that
/// do not decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut after_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        match encoded_word(candidate) {
            Some((text, len)) => {
                if !after_word || !before.trim().is_empty() {
                    out.push_str(before);
                }
                out.push_str(&text);
                rest = &candidate[len..];
                after_word = true;
            }
            None => {
                out.push_str(before);
                out.push_str("=?");
                rest = &candidate[2..];
                after_word = false;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode the `=?charset?B|Q?text?=` word at the start of `s`.
///
/// Returns the decoded text and the byte length of the word.
fn encoded_word(s: &str) -> Option<(String, usize)> {
    let mut fields = s.strip_prefix("=?")?.splitn(3, '?');
    let charset = fields.next()?;
    let encoding = fields.next()?;
    let tail = fields.next()?;
    let end = tail.find("?=")?;
    let text = &tail[..end];

    let bytes = match encoding {
        "B" | "b" => BASE64
            .decode(text.split_ascii_whitespace().collect::<String>())
            .ok()?,
        "Q" | "q" => q_decode(text.as_bytes()),
        _ => return None,
    };
    let len = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((decode_charset(charset, &bytes), len))
}

fn q_decode(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        match text[i] {
            b'_' => out.push(b' '),
            b'=' => {
                if let Some(byte) = text.get(i + 1..i + 3).and_then(hex_byte) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(b'=');
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn hex_byte(pair: &[u8]) -> Option<u8> {
    let hi = char::from(pair[0]).to_digit(16)?;
    let lo = char::from(pair[1]).to_digit(16)?;
    u8::try_from(hi * 16 + lo).ok()
}

/// Decode `bytes` in the charset named by `label`, ignoring any RFC 2231
/// language suffix (`utf-8*en`).
fn decode_charset(label: &str, bytes: &[u8]) -> String {
    let label = label.split('*').next().unwrap_or(label).trim();
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding
            .decode_without_bom_handling(bytes)
            .0
            .into_owned(),
        None => {
            warn!(charset = label, "Unknown charset, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}
