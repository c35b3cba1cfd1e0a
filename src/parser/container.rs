//! Payload extraction for `.emlx` / `.partial.emlx` containers.
//!
//! A container is `<decimal length><whitespace><payload><plist epilogue>`.
//! The declared length is authoritative: exactly that many bytes after the
//! header are the RFC 822 message, everything after them is the plist.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use tracing::debug;

use crate::error::{ConvertError, Result};

/// More digits than this cannot be a valid `u64` length.
const MAX_LENGTH_DIGITS: usize = 20;

/// Where a [`PayloadReader`] is in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    AwaitingLength,
    ReadingPayload { remaining: u64 },
    DrainingEpilogue,
    Done,
    Failed,
}

/// A container split into its three parts, fully in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub declared_length: u64,
    pub payload: Vec<u8>,
    pub epilogue: Vec<u8>,
}

/// Split an in-memory container into payload and epilogue.
pub fn extract_payload(data: &[u8]) -> Result<Container> {
    let (declared_length, header_len) = parse_length_header(&mut &data[..])?;
    let start = header_len as usize;
    let end = usize::try_from(declared_length)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|&end| end <= data.len())
        .ok_or_else(|| truncated(declared_length, (data.len() - start) as u64))?;

    Ok(Container {
        declared_length,
        payload: data[start..end].to_vec(),
        epilogue: data[end..].to_vec(),
    })
}

/// Parse the leading `^\d+\s+` token.
///
/// Returns the declared payload length and the number of header bytes
/// consumed (digits plus all following whitespace).
pub fn parse_length_header<R: BufRead>(reader: &mut R) -> Result<(u64, u64)> {
    let mut digits = String::new();
    let mut consumed: u64 = 0;

    // Digits
    loop {
        let byte = match peek_byte(reader)? {
            Some(b) => b,
            None => break,
        };
        if !byte.is_ascii_digit() {
            break;
        }
        if digits.len() == MAX_LENGTH_DIGITS {
            return Err(ConvertError::MalformedContainer(
                "payload length does not fit into 64 bits".into(),
            ));
        }
        digits.push(byte as char);
        reader.consume(1);
        consumed += 1;
    }

    // At least one whitespace byte, then all of them
    let mut whitespace = 0usize;
    while let Some(byte) = peek_byte(reader)? {
        if !byte.is_ascii_whitespace() {
            break;
        }
        reader.consume(1);
        whitespace += 1;
        consumed += 1;
    }

    if digits.is_empty() || whitespace == 0 {
        return Err(ConvertError::MalformedContainer(
            "content did not start with payload length as expected".into(),
        ));
    }

    let declared = digits.parse::<u64>().map_err(|_| {
        ConvertError::MalformedContainer("payload length does not fit into 64 bits".into())
    })?;
    Ok((declared, consumed))
}

/// Read the plist epilogue of a seekable container without touching the
/// payload, then rewind to the start.
pub fn peek_epilogue<R: Read + Seek>(reader: &mut R) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(0))?;
    let (declared, header_len) = parse_length_header(&mut BufReader::new(&mut *reader))?;

    let total = reader.seek(SeekFrom::End(0))?;
    let epilogue_start = header_len.saturating_add(declared);
    if epilogue_start > total {
        return Err(truncated(declared, total - header_len));
    }

    reader.seek(SeekFrom::Start(epilogue_start))?;
    let mut epilogue = Vec::with_capacity((total - epilogue_start) as usize);
    reader.read_to_end(&mut epilogue)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(epilogue)
}

/// Streaming payload extractor.
///
/// Hands out the payload one line at a time and never reads past the
/// declared length until [`PayloadReader::finish`] drains the epilogue.
pub struct PayloadReader<R> {
    inner: R,
    state: ExtractState,
    declared_length: u64,
}

impl<R: BufRead> PayloadReader<R> {
    /// Consume the length header and position the reader on the payload.
    pub fn new(mut inner: R) -> Result<Self> {
        let (declared_length, header_len) = parse_length_header(&mut inner)?;
        debug!(declared_length, header_len, "Read container length header");
        Ok(Self {
            inner,
            state: ExtractState::ReadingPayload {
                remaining: declared_length,
            },
            declared_length,
        })
    }

    pub fn declared_length(&self) -> u64 {
        self.declared_length
    }

    pub fn state(&self) -> ExtractState {
        self.state
    }

    /// Read the next payload line into `buf` (cleared first), without its
    /// `\n` or `\r\n` terminator.
    ///
    /// Returns `false` once the whole payload has been handed out.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let mut remaining = match self.state {
            ExtractState::ReadingPayload { remaining } => remaining,
            _ => return Ok(false),
        };
        if remaining == 0 {
            self.state = ExtractState::DrainingEpilogue;
            return Ok(false);
        }

        while remaining > 0 {
            let chunk = match self.inner.fill_buf() {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.state = ExtractState::Failed;
                    return Err(e.into());
                }
            };
            if chunk.is_empty() {
                self.state = ExtractState::Failed;
                return Err(truncated(
                    self.declared_length,
                    self.declared_length - remaining,
                ));
            }
            let take = chunk.len().min(remaining as usize);
            match chunk[..take].iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&chunk[..pos]);
                    self.inner.consume(pos + 1);
                    remaining -= pos as u64 + 1;
                    break;
                }
                None => {
                    buf.extend_from_slice(&chunk[..take]);
                    self.inner.consume(take);
                    remaining -= take as u64;
                }
            }
        }

        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        self.state = ExtractState::ReadingPayload { remaining };
        Ok(true)
    }

    /// Iterate over the remaining payload lines.
    pub fn lines(&mut self) -> PayloadLines<'_, R> {
        PayloadLines { reader: self }
    }

    /// Skip whatever payload is left and return the epilogue bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let mut scratch = Vec::new();
        while self.read_line(&mut scratch)? {}

        let mut epilogue = Vec::new();
        if let Err(e) = self.inner.read_to_end(&mut epilogue) {
            self.state = ExtractState::Failed;
            return Err(e.into());
        }
        self.state = ExtractState::Done;
        debug!(epilogue_len = epilogue.len(), "Drained container epilogue");
        Ok(epilogue)
    }
}

/// Iterator over payload lines, borrowed from a [`PayloadReader`].
pub struct PayloadLines<'a, R> {
    reader: &'a mut PayloadReader<R>,
}

impl<R: BufRead> Iterator for PayloadLines<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_line(&mut line) {
            Ok(true) => Some(Ok(line)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

fn peek_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>> {
    Ok(reader.fill_buf()?.first().copied())
}

fn truncated(declared: u64, available: u64) -> ConvertError {
    ConvertError::MalformedContainer(format!(
        "declared payload length {declared} exceeds the {available} bytes available"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &[u8] = b"21 \nSubject: Hi\r\n\r\nBody\r\n<?xml version=\"1.0\"?><plist/>";

    #[test]
    fn test_extract_payload() {
        let container = extract_payload(SAMPLE).unwrap();
        assert_eq!(container.declared_length, 21);
        assert_eq!(container.payload, b"Subject: Hi\r\n\r\nBody\r\n");
        assert!(container.epilogue.starts_with(b"<?xml"));
    }

    #[test]
    fn test_extract_is_idempotent() {
        let first = extract_payload(SAMPLE).unwrap();
        let second = extract_payload(SAMPLE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_length_is_malformed() {
        let err = extract_payload(b"Subject: Hi\r\n\r\nBody").unwrap_err();
        assert!(matches!(err, ConvertError::MalformedContainer(_)));
        assert!(err.to_string().contains("payload length"));

        // digits must be followed by whitespace
        assert!(extract_payload(b"12Subject").is_err());
    }

    #[test]
    fn test_short_container_is_malformed() {
        let err = extract_payload(b"500\nSubject: Hi\r\n").unwrap_err();
        assert!(matches!(err, ConvertError::MalformedContainer(_)));
    }

    #[test]
    fn test_streaming_lines_stop_at_declared_length() {
        let mut reader = PayloadReader::new(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(reader.declared_length(), 21);
        let lines: Vec<Vec<u8>> = reader.lines().collect::<Result<_>>().unwrap();
        assert_eq!(
            lines,
            vec![b"Subject: Hi".to_vec(), Vec::new(), b"Body".to_vec()]
        );
        assert_eq!(reader.state(), ExtractState::DrainingEpilogue);
        let epilogue = reader.finish().unwrap();
        assert_eq!(epilogue, b"<?xml version=\"1.0\"?><plist/>");
    }

    #[test]
    fn test_streaming_matches_in_memory_with_tiny_buffer() {
        let container = extract_payload(SAMPLE).unwrap();
        let mut reader =
            PayloadReader::new(BufReader::with_capacity(3, Cursor::new(SAMPLE))).unwrap();
        let lines: Vec<Vec<u8>> = reader.lines().collect::<Result<_>>().unwrap();
        assert_eq!(lines.join(&b"\r\n"[..]), b"Subject: Hi\r\n\r\nBody");
        assert_eq!(reader.finish().unwrap(), container.epilogue);
    }

    #[test]
    fn test_streaming_truncated_payload_fails() {
        let mut reader = PayloadReader::new(Cursor::new(&b"40\nSubject: x\n"[..])).unwrap();
        let result: Result<Vec<Vec<u8>>> = reader.lines().collect();
        assert!(matches!(result, Err(ConvertError::MalformedContainer(_))));
        assert_eq!(reader.state(), ExtractState::Failed);
    }

    #[test]
    fn test_peek_epilogue_rewinds() {
        let mut cursor = Cursor::new(SAMPLE.to_vec());
        let epilogue = peek_epilogue(&mut cursor).unwrap();
        assert_eq!(epilogue, b"<?xml version=\"1.0\"?><plist/>");
        assert_eq!(cursor.position(), 0);
    }
}
