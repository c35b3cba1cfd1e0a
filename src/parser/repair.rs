//! Boundary repair for the MIME framing Mail.app gets wrong.
//!
//! Two known malformations are fixed, nothing more:
//!
//! - a boundary line (`--B` or `--B--`) with no empty line before it gets a
//!   synthetic blank line inserted in front of it;
//! - a truncated close-delimiter `--B-` on the very last payload line is
//!   completed to `--B--`.
//!
//! Only tokens declared with a `boundary=` parameter earlier in the stream
//! take part, so body text that merely looks like a delimiter is left alone.
//! The repairer also gives the top-level `Content-Type` header its canonical
//! spelling.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::Result;
use crate::model::mime::Line;
use crate::parser::header::declared_boundary;

const CONTENT_TYPE: &[u8] = b"Content-Type";

/// Output of [`repair_lines`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairedLines {
    pub lines: Vec<Vec<u8>>,
    /// Indices into `lines` of the inserted blank lines.
    pub synthetic: BTreeSet<usize>,
}

/// Repair a fully materialized payload.
pub fn repair_lines(lines: Vec<Vec<u8>>) -> RepairedLines {
    let mut repaired = RepairedLines::default();
    for line in BoundaryRepairer::new(lines.into_iter().map(Ok)).flatten() {
        if line.synthetic {
            repaired.synthetic.insert(repaired.lines.len());
        }
        repaired.lines.push(line.bytes);
    }
    repaired
}

/// Rewrite a `content-type:` header name (any casing) to `Content-Type:`.
///
/// Returns `true` when the line was changed.
pub fn normalize_content_type(line: &mut [u8]) -> bool {
    let len = CONTENT_TYPE.len();
    if line.len() > len
        && line[len] == b':'
        && line[..len].eq_ignore_ascii_case(CONTENT_TYPE)
        && &line[..len] != CONTENT_TYPE
    {
        line[..len].copy_from_slice(CONTENT_TYPE);
        true
    } else {
        false
    }
}

/// Streaming repairer over payload lines.
///
/// Keeps one line of lookahead so it can tell when it is looking at the last
/// line of the payload.
pub struct BoundaryRepairer<I: Iterator<Item = Result<Vec<u8>>>> {
    inner: I,
    peeked: Option<Result<Vec<u8>>>,
    queued: Option<Line>,
    boundaries: Vec<String>,
    in_top_headers: bool,
    previous_empty: bool,
    started: bool,
    failed: bool,
}

impl<I: Iterator<Item = Result<Vec<u8>>>> BoundaryRepairer<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            peeked: None,
            queued: None,
            boundaries: Vec::new(),
            in_top_headers: true,
            // Never insert in front of the very first line
            previous_empty: true,
            started: false,
            failed: false,
        }
    }

    /// Boundary tokens seen so far, in declaration order.
    pub fn boundaries(&self) -> &[String] {
        &self.boundaries
    }

    fn next_raw(&mut self) -> Option<Result<Vec<u8>>> {
        if self.started {
            self.peeked.take()
        } else {
            self.started = true;
            self.inner.next()
        }
    }

    fn is_boundary_line(&self, line: &[u8]) -> bool {
        let Some(token) = line.strip_prefix(b"--") else {
            return false;
        };
        self.boundaries.iter().any(|b| {
            let b = b.as_bytes();
            token == b || (token.len() == b.len() + 2 && token.starts_with(b) && token.ends_with(b"--"))
        })
    }

    fn complete_truncated_close(&self, line: &mut Vec<u8>) {
        let Some(token) = line.strip_prefix(b"--") else {
            return;
        };
        let truncated = self.boundaries.iter().any(|b| {
            let b = b.as_bytes();
            token.len() == b.len() + 1 && token.starts_with(b) && token.ends_with(b"-")
        });
        if truncated {
            debug!(line = %String::from_utf8_lossy(line), "Completing truncated close-delimiter");
            line.push(b'-');
        }
    }
}

impl<I: Iterator<Item = Result<Vec<u8>>>> Iterator for BoundaryRepairer<I> {
    type Item = Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.queued.take() {
            return Some(Ok(line));
        }
        if self.failed {
            return None;
        }

        let mut bytes = match self.next_raw()? {
            Ok(bytes) => bytes,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        self.peeked = self.inner.next();
        let is_last = self.peeked.is_none();

        if self.in_top_headers {
            if bytes.is_empty() {
                self.in_top_headers = false;
            } else if normalize_content_type(&mut bytes) {
                debug!("Normalized top-level Content-Type header name");
            }
        }

        if let Some(boundary) = declared_boundary(&bytes) {
            if !self.boundaries.contains(&boundary) {
                debug!(boundary = %boundary, "Found boundary declaration");
                self.boundaries.push(boundary);
            }
        }

        if is_last {
            self.complete_truncated_close(&mut bytes);
        }

        let needs_blank = !self.previous_empty && self.is_boundary_line(&bytes);
        self.previous_empty = bytes.is_empty();
        let line = Line::new(bytes);

        if needs_blank {
            self.queued = Some(line);
            Some(Ok(Line::synthetic_blank()))
        } else {
            Some(Ok(line))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<Vec<u8>> {
        text.split("\r\n").map(|l| l.as_bytes().to_vec()).collect()
    }

    const MESSAGE: &str = "content-type: multipart/mixed; boundary=\"XYZ\"\r\n\
                           Subject: test\r\n\
                           \r\n\
                           --XYZ\r\n\
                           Content-Type: text/plain\r\n\
                           \r\n\
                           hello\r\n\
                           --XYZ\r\n\
                           Content-Type: text/plain\r\n\
                           \r\n\
                           --XYZ is mentioned here\r\n\
                           --XYZ-";

    #[test]
    fn test_inserts_blank_before_undelimited_boundary() {
        let repaired = repair_lines(lines(MESSAGE));
        let pos = repaired
            .lines
            .iter()
            .position(|l| l == b"hello")
            .unwrap();
        assert!(repaired.lines[pos + 1].is_empty());
        assert!(repaired.synthetic.contains(&(pos + 1)));
        assert_eq!(repaired.lines[pos + 2], b"--XYZ");
        // The first delimiter already follows the header separator
        assert_eq!(repaired.lines[3], b"--XYZ");
        assert!(!repaired.synthetic.contains(&3));
    }

    #[test]
    fn test_completes_truncated_close_on_last_line() {
        let repaired = repair_lines(lines(MESSAGE));
        assert_eq!(repaired.lines.last().unwrap(), b"--XYZ--");
        let n = repaired.lines.len();
        assert!(repaired.lines[n - 2].is_empty());
        assert!(repaired.synthetic.contains(&(n - 2)));
    }

    #[test]
    fn test_truncated_close_is_only_fixed_at_the_end() {
        let input = lines("Content-Type: multipart/mixed; boundary=B\r\n\r\n--B\r\n\r\nx\r\n--B-\r\nmore");
        let repaired = repair_lines(input);
        assert!(repaired.lines.contains(&b"--B-".to_vec()));
        assert!(!repaired.lines.contains(&b"--B--".to_vec()));
    }

    #[test]
    fn test_lookalike_body_text_is_untouched() {
        let repaired = repair_lines(lines(MESSAGE));
        let pos = repaired
            .lines
            .iter()
            .position(|l| l == b"--XYZ is mentioned here")
            .unwrap();
        assert!(!repaired.synthetic.contains(&(pos - 1)));

        // Undeclared tokens never participate
        let plain = lines("Subject: hi\r\n\r\ntext\r\n--OTHER\r\n--OTHER-");
        let repaired = repair_lines(plain.clone());
        assert_eq!(repaired.lines, plain);
        assert!(repaired.synthetic.is_empty());
    }

    #[test]
    fn test_repair_is_idempotent() {
        let once = repair_lines(lines(MESSAGE));
        let twice = repair_lines(once.lines.clone());
        assert_eq!(twice.lines, once.lines);
        assert!(twice.synthetic.is_empty());
    }

    #[test]
    fn test_content_type_normalized_in_top_headers_only() {
        let repaired = repair_lines(lines(MESSAGE));
        assert!(repaired.lines[0].starts_with(b"Content-Type: multipart/mixed"));

        let mut nested = b"content-TYPE: text/plain".to_vec();
        assert!(normalize_content_type(&mut nested));
        assert_eq!(nested, b"Content-Type: text/plain");
        let mut other = b"Content-Typo: x".to_vec();
        assert!(!normalize_content_type(&mut other));

        let input = lines("Subject: x\r\n\r\ncontent-type: stays");
        assert_eq!(repair_lines(input).lines[2], b"content-type: stays");
    }

    #[test]
    fn test_streaming_error_is_passed_through() {
        use crate::error::ConvertError;
        let input = vec![
            Ok(b"Subject: x".to_vec()),
            Err(ConvertError::MalformedContainer("truncated".into())),
        ];
        let out: Vec<Result<Line>> = BoundaryRepairer::new(input.into_iter()).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }
}
