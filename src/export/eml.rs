//! Serialize MIME events as an `.eml` file, and the conversion entry points.
//!
//! An `.eml` file is the RFC 5322 message with CRLF line endings: header
//! block, one empty line, body.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ConvertError, Result};
use crate::export::attachment::{attachments_root, AttachmentResolver};
use crate::model::flags::{FlagLayout, FlagSet};
use crate::model::mime::{MimeNode, PartPath};
use crate::model::plist::PlistValue;
use crate::parser::container::{peek_epilogue, PayloadReader};
use crate::parser::mime::{check_delimiter, tree_events, MimeEvent, MimeTokenizer, Rewriter};
use crate::parser::plist::EmlxMetadata;
use crate::parser::repair::BoundaryRepairer;

const CRLF: &[u8] = b"\r\n";

/// Caller policy for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Record unresolvable attachments as warnings instead of failing.
    pub tolerant: bool,
    /// Refuse messages flagged as deleted with [`ConvertError::DeletedMessageSkipped`].
    pub skip_deleted: bool,
    pub flag_layout: FlagLayout,
    /// Buffer size for reading containers.
    pub read_buffer_size: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            tolerant: false,
            skip_deleted: false,
            flag_layout: FlagLayout::default(),
            read_buffer_size: 128 * 1024,
        }
    }
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    /// Tolerated problems, one per unresolved attachment.
    pub warnings: Vec<String>,
    pub flags: FlagSet,
    pub plist: Option<PlistValue>,
    pub bytes_written: u64,
}

struct WriterFrame {
    boundary: Option<String>,
    nested: bool,
    closed: bool,
    lines_after_close: bool,
}

/// Streaming serializer for [`MimeEvent`]s.
///
/// Synthetic lines are dropped. Empty lines are held back until something
/// follows them, so the output ends with exactly one CRLF.
pub struct EmlWriter<W: Write> {
    out: W,
    frames: Vec<WriterFrame>,
    pending_blank: usize,
    bytes_written: u64,
}

impl<W: Write> EmlWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            frames: Vec::new(),
            pending_blank: 0,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_event(&mut self, event: MimeEvent) -> Result<()> {
        match event {
            MimeEvent::Start {
                path,
                headers,
                boundary,
                delimiter,
            } => {
                let nested = match self.frames.last() {
                    Some(parent) => {
                        check_delimiter(parent.boundary.as_deref(), delimiter.as_deref(), &path)?;
                        self.write_line(format!("--{}", delimiter.unwrap_or_default()).as_bytes())?;
                        true
                    }
                    None => false,
                };
                for header in headers.iter() {
                    for line in header.to_lines() {
                        self.write_line(&line)?;
                    }
                }
                self.write_raw(CRLF)?;
                self.frames.push(WriterFrame {
                    boundary,
                    nested,
                    closed: false,
                    lines_after_close: false,
                });
            }
            MimeEvent::Line(line) => {
                if line.synthetic {
                    return Ok(());
                }
                if let Some(frame) = self.frames.last_mut() {
                    if frame.closed {
                        frame.lines_after_close = true;
                    }
                }
                if line.is_empty() {
                    self.pending_blank += 1;
                } else {
                    self.write_line(&line.bytes)?;
                }
            }
            MimeEvent::Close { boundary } => {
                let expected = self.frames.last().and_then(|f| f.boundary.clone());
                check_delimiter(expected.as_deref(), Some(boundary.as_str()), &PartPath::root())?;
                self.write_line(format!("--{boundary}--").as_bytes())?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.closed = true;
                }
            }
            MimeEvent::End { .. } => {
                let Some(frame) = self.frames.pop() else {
                    return Err(ConvertError::MalformedContainer(
                        "end of part outside of any MIME entity".into(),
                    ));
                };
                if let (Some(boundary), false) = (&frame.boundary, frame.closed) {
                    self.write_line(format!("--{boundary}--").as_bytes())?;
                }
                if frame.nested && frame.boundary.is_some() && !frame.lines_after_close {
                    self.pending_blank += 1;
                }
            }
        }
        Ok(())
    }

    /// Flush and return the sink. Trailing empty lines are discarded.
    pub fn finish(mut self) -> Result<(W, u64)> {
        self.out.flush()?;
        Ok((self.out, self.bytes_written))
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        while self.pending_blank > 0 {
            self.pending_blank -= 1;
            self.write_raw(CRLF)?;
        }
        self.write_raw(line)?;
        self.write_raw(CRLF)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

/// Serialize a whole tree. Placeholder leaves are written with an empty body.
pub fn write_tree<W: Write>(node: &MimeNode, out: W) -> Result<u64> {
    let mut writer = EmlWriter::new(out);
    for event in tree_events(node) {
        writer.write_event(event)?;
    }
    Ok(writer.finish()?.1)
}

/// Convert one container read from `reader`, writing the `.eml` to `sink`.
///
/// Fully streaming. The deleted flag lives in the epilogue, after the
/// payload, so with `skip_deleted` the sink has already been written to when
/// [`ConvertError::DeletedMessageSkipped`] is returned and must be discarded.
pub fn convert_reader<R, W>(
    reader: R,
    attachments_root: Option<&Path>,
    sink: W,
    options: &ConvertOptions,
) -> Result<ConversionReport>
where
    R: std::io::BufRead,
    W: Write,
{
    let mut payload = PayloadReader::new(reader)?;
    let resolver = AttachmentResolver::new(attachments_root.map(Path::to_path_buf), options.tolerant);
    let mut writer = EmlWriter::new(sink);

    let mut rewriter = Rewriter::new(
        MimeTokenizer::new(BoundaryRepairer::new(payload.lines())),
        resolver,
    );
    for event in &mut rewriter {
        writer.write_event(event?)?;
    }
    let warnings = rewriter.into_interceptor().into_warnings();
    let (_, bytes_written) = writer.finish()?;

    let epilogue = payload.finish()?;
    let metadata = EmlxMetadata::from_epilogue(&epilogue, &options.flag_layout);
    if options.skip_deleted && metadata.flags.is_deleted() {
        return Err(ConvertError::DeletedMessageSkipped(PathBuf::new()));
    }

    Ok(ConversionReport {
        warnings,
        flags: metadata.flags,
        plist: metadata.plist,
        bytes_written,
    })
}

/// Convert the container at `path`, writing the `.eml` to `sink`.
///
/// Attachments are looked up in the mailbox's `Attachments/` tree. With
/// `skip_deleted`, a deleted message is detected before anything is written.
pub fn convert_file<W: Write>(path: &Path, sink: W, options: &ConvertOptions) -> Result<ConversionReport> {
    if !path.exists() {
        return Err(ConvertError::FileNotFound(path.to_path_buf()));
    }
    let mut file = File::open(path).map_err(|e| ConvertError::io(path, e))?;

    if options.skip_deleted {
        let epilogue = peek_epilogue(&mut file).map_err(|e| with_path(e, path))?;
        let metadata = EmlxMetadata::from_epilogue(&epilogue, &options.flag_layout);
        if metadata.flags.is_deleted() {
            debug!(path = %path.display(), "Skipping deleted message");
            return Err(ConvertError::DeletedMessageSkipped(path.to_path_buf()));
        }
    }

    let reader = BufReader::with_capacity(options.read_buffer_size.max(1), file);
    let root = attachments_root(path);
    convert_reader(reader, root.as_deref(), sink, options).map_err(|e| with_path(e, path))
}

/// Convert `src` into the file `dest`.
///
/// The output is written to a temporary file next to `dest` and only moved
/// into place when the conversion succeeds, so a failed conversion never
/// leaves a partial `.eml` behind.
pub fn convert_file_to_path(src: &Path, dest: &Path, options: &ConvertOptions) -> Result<ConversionReport> {
    let dir = match dest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConvertError::io(dir, e))?;

    let mut writer = BufWriter::new(temp);
    let report = convert_file(src, &mut writer, options)?;
    let temp = writer
        .into_inner()
        .map_err(|e| ConvertError::io(dest, e.into_error()))?;
    temp.persist(dest)
        .map_err(|e| ConvertError::io(dest, e.error))?;

    info!(
        src = %src.display(),
        dest = %dest.display(),
        bytes = report.bytes_written,
        warnings = report.warnings.len(),
        "Converted message"
    );
    Ok(report)
}

/// Output file name for a container: the name up to its first dot, plus `.eml`.
pub fn eml_file_name(container: &Path) -> Result<String> {
    let name = container
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ConvertError::InvalidPath(container.display().to_string()))?;
    match name.split('.').next() {
        Some(stem) if !stem.is_empty() => Ok(format!("{stem}.eml")),
        _ => Err(ConvertError::InvalidPath(container.display().to_string())),
    }
}

/// Attach the container path to errors that were raised without one.
fn with_path(err: ConvertError, path: &Path) -> ConvertError {
    match err {
        ConvertError::Io { path: p, source } if p.as_os_str() == "<unknown>" => {
            ConvertError::io(path, source)
        }
        ConvertError::DeletedMessageSkipped(_) => ConvertError::DeletedMessageSkipped(path.to_path_buf()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mime::{Headers, Line};
    use crate::parser::mime::build_tree;
    use std::io::Cursor;

    fn container(payload: &str, flags: u64) -> Vec<u8> {
        format!(
            "{}\n{}<?xml version=\"1.0\"?><plist version=\"1.0\"><dict><key>flags</key><integer>{}</integer></dict></plist>",
            payload.len(),
            payload,
            flags
        )
        .into_bytes()
    }

    fn convert(data: &[u8], options: &ConvertOptions) -> Result<(String, ConversionReport)> {
        let mut out = Vec::new();
        let report = convert_reader(Cursor::new(data), None, &mut out, options)?;
        Ok((String::from_utf8(out).unwrap(), report))
    }

    const SIMPLE: &str = "Subject: Hello\nFrom: a@example.com\n\nBody line\n\n\n";

    #[test]
    fn test_simple_message_gets_crlf_and_single_trailing_break() {
        let (eml, report) = convert(&container(SIMPLE, 1), &ConvertOptions::default()).unwrap();
        assert_eq!(eml, "Subject: Hello\r\nFrom: a@example.com\r\n\r\nBody line\r\n");
        assert_eq!(report.bytes_written, eml.len() as u64);
        assert!(report.warnings.is_empty());
        assert!(report.flags.contains(crate::model::flags::MessageFlag::Read));
    }

    #[test]
    fn test_multipart_round_trip() {
        let payload = "Content-Type: multipart/alternative; boundary=\"B1\"\r\n\
                       Subject: Alt\r\n\
                       \r\n\
                       --B1\r\n\
                       Content-Type: text/plain\r\n\
                       \r\n\
                       plain\r\n\
                       \r\n\
                       --B1\r\n\
                       Content-Type: text/html\r\n\
                       \r\n\
                       <p>html</p>\r\n\
                       \r\n\
                       --B1--\r\n";
        let (eml, _) = convert(&container(payload, 0), &ConvertOptions::default()).unwrap();
        assert_eq!(eml, payload);
    }

    #[test]
    fn test_synthetic_blank_is_stripped() {
        let payload = "Content-Type: multipart/mixed; boundary=X\n\n--X\n\nbody\n--X--\n";
        let (eml, _) = convert(&container(payload, 0), &ConvertOptions::default()).unwrap();
        assert_eq!(
            eml,
            "Content-Type: multipart/mixed; boundary=X\r\n\r\n--X\r\n\r\nbody\r\n--X--\r\n"
        );
    }

    #[test]
    fn test_nested_close_gets_blank_line() {
        let payload = "Content-Type: multipart/mixed; boundary=O\n\n--O\n\
                       Content-Type: multipart/alternative; boundary=I\n\n--I\n\ntext\n\n--I--\n--O--\n";
        let (eml, _) = convert(&container(payload, 0), &ConvertOptions::default()).unwrap();
        assert!(eml.contains("--I--\r\n\r\n--O--\r\n"));
    }

    #[test]
    fn test_truncated_close_completed() {
        let payload = "Content-Type: multipart/mixed; boundary=T\n\n--T\n\nbody\n--T-";
        let (eml, _) = convert(&container(payload, 0), &ConvertOptions::default()).unwrap();
        assert!(eml.ends_with("body\r\n--T--\r\n"));
    }

    #[test]
    fn test_deleted_message_skipped_only_when_asked() {
        let data = container(SIMPLE, 0b10);
        let (_, report) = convert(&data, &ConvertOptions::default()).unwrap();
        assert!(report.flags.is_deleted());

        let options = ConvertOptions {
            skip_deleted: true,
            ..Default::default()
        };
        let err = convert(&data, &options).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_malformed_container() {
        let err = convert(b"Subject: nope\n\nbody", &ConvertOptions::default()).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Invalid structure; content did not start with payload length"));
    }

    #[test]
    fn test_writer_rejects_foreign_delimiter() {
        let mut writer = EmlWriter::new(Vec::new());
        writer
            .write_event(MimeEvent::Start {
                path: PartPath::root(),
                headers: Headers::parse(&["Content-Type: multipart/mixed; boundary=A"]),
                boundary: Some("A".into()),
                delimiter: None,
            })
            .unwrap();
        let err = writer
            .write_event(MimeEvent::Start {
                path: PartPath::from(vec![1]),
                headers: Headers::new(),
                boundary: None,
                delimiter: Some("Z".into()),
            })
            .unwrap_err();
        assert!(matches!(err, ConvertError::InconsistentBoundary { .. }));
    }

    #[test]
    fn test_write_tree() {
        let events = vec![
            MimeEvent::Start {
                path: PartPath::root(),
                headers: Headers::parse(&["Subject: t"]),
                boundary: None,
                delimiter: None,
            },
            MimeEvent::Line(Line::new("hello")),
            MimeEvent::End {
                path: PartPath::root(),
            },
        ];
        let tree = build_tree(events.into_iter().map(Ok)).unwrap();
        let mut out = Vec::new();
        let written = write_tree(&tree, &mut out).unwrap();
        assert_eq!(out, b"Subject: t\r\n\r\nhello\r\n");
        assert_eq!(written, out.len() as u64);
    }

    #[test]
    fn test_eml_file_name() {
        assert_eq!(
            eml_file_name(Path::new("/x/Messages/4711.partial.emlx")).unwrap(),
            "4711.eml"
        );
        assert_eq!(eml_file_name(Path::new("12.emlx")).unwrap(), "12.eml");
        assert!(eml_file_name(Path::new("/")).is_err());
    }
}
