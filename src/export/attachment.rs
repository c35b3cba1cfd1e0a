//! Re-inline attachments that Mail.app stored next to a `.partial.emlx`.
//!
//! For `.../Messages/<id>.partial.emlx` the body of the part at position
//! path `1.2` lives in `.../Attachments/<id>/1.2/<file name>`.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConvertError, Result};
use crate::export::encode::TransferEncoding;
use crate::model::mime::{Headers, PartPath};
use crate::parser::header::{declared_filename, APPLE_CONTENT_LENGTH};
use crate::parser::mime::Interceptor;

/// `Attachments/<id>` directory for a container path.
///
/// `<id>` is the file name up to its first dot, so `123.partial.emlx` and
/// `123.emlx` both map to `Attachments/123`.
pub fn attachments_root(container: &Path) -> Option<PathBuf> {
    let name = container.file_name()?.to_str()?;
    let id = name.split('.').next().filter(|id| !id.is_empty())?;
    let mailbox = container.parent()?.parent()?;
    Some(mailbox.join("Attachments").join(id))
}

/// A placeholder part waiting for its body to be drained.
#[derive(Debug)]
pub struct PendingAttachment {
    path: PartPath,
    encoding: TransferEncoding,
    declared_name: Option<String>,
}

/// [`Interceptor`] that replaces placeholder bodies with the encoded
/// content of the externalized attachment file.
#[derive(Debug)]
pub struct AttachmentResolver {
    root: Option<PathBuf>,
    tolerant: bool,
    warnings: Vec<String>,
}

impl AttachmentResolver {
    /// `root` is the `Attachments/<id>` directory, `None` when unknown.
    pub fn new(root: Option<PathBuf>, tolerant: bool) -> Self {
        Self {
            root,
            tolerant,
            warnings: Vec::new(),
        }
    }

    /// Messages recorded for attachments that were replaced by an empty body.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    /// Directory holding the attachment of the part at `path`.
    pub fn part_dir(&self, path: &PartPath) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(path.to_string()))
    }

    /// Candidate file names, in the order they are tried.
    pub fn candidates(&self, path: &PartPath, declared: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(name) = declared {
            if is_plain_file_name(name) {
                names.push(name.to_string());
            } else {
                warn!(part = %path, name, "Ignoring attachment name that is not a plain file name");
            }
        }
        if let Some(single) = self.part_dir(path).and_then(|dir| single_visible_file(&dir)) {
            if !names.contains(&single) {
                names.push(single);
            }
        }
        names
    }

    fn read_first(&self, path: &PartPath, candidates: &[String]) -> Option<Vec<u8>> {
        let dir = self.part_dir(path)?;
        candidates.iter().find_map(|name| {
            let file = dir.join(name);
            match std::fs::read(&file) {
                Ok(data) => {
                    debug!(path = %file.display(), bytes = data.len(), "Read attachment file");
                    Some(data)
                }
                Err(e) => {
                    debug!(path = %file.display(), error = %e, "Attachment candidate not readable");
                    None
                }
            }
        })
    }
}

impl Interceptor for AttachmentResolver {
    type Pending = PendingAttachment;

    fn intercept(
        &mut self,
        path: &PartPath,
        headers: &mut Headers,
    ) -> Result<Option<PendingAttachment>> {
        if !headers.contains(APPLE_CONTENT_LENGTH) {
            return Ok(None);
        }
        let encoding =
            TransferEncoding::from_header(headers.text("Content-Transfer-Encoding").as_deref())?;
        let declared_name = declared_filename(headers);
        headers.remove(APPLE_CONTENT_LENGTH);
        Ok(Some(PendingAttachment {
            path: path.clone(),
            encoding,
            declared_name,
        }))
    }

    fn finish(&mut self, pending: PendingAttachment) -> Result<Vec<Vec<u8>>> {
        let candidates = self.candidates(&pending.path, pending.declared_name.as_deref());
        if let Some(data) = self.read_first(&pending.path, &candidates) {
            return Ok(pending.encoding.encode(&data));
        }

        let err = ConvertError::AttachmentUnresolvable { tried: candidates };
        if self.tolerant {
            warn!(part = %pending.path, error = %err, "Substituting empty attachment body");
            self.warnings.push(err.to_string());
            Ok(Vec::new())
        } else {
            Err(err)
        }
    }
}

/// `true` if `name` is exactly one normal path component.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// The only non-hidden regular file in `dir`, if there is exactly one.
fn single_visible_file(dir: &Path) -> Option<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Attachment directory not readable");
            return None;
        }
    };
    let mut found = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') || !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = Some(name.to_string());
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn placeholder_headers(extra: &[&str]) -> Headers {
        let mut lines = vec!["X-Apple-Content-Length: 42"];
        lines.extend_from_slice(extra);
        Headers::parse(&lines)
    }

    #[test]
    fn test_attachments_root() {
        let root = attachments_root(Path::new("/mail/INBOX.mbox/Data/Messages/123.partial.emlx"));
        assert_eq!(
            root,
            Some(PathBuf::from("/mail/INBOX.mbox/Data/Attachments/123"))
        );
        assert_eq!(attachments_root(Path::new("123.emlx")), None);
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("report.pdf"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("a/b.txt"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name(""));
    }

    #[test]
    fn test_non_placeholder_is_not_intercepted() {
        let mut resolver = AttachmentResolver::new(None, false);
        let mut headers = Headers::parse(&["Content-Type: text/plain"]);
        assert!(resolver
            .intercept(&PartPath::from(vec![1]), &mut headers)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolves_declared_name_and_strips_header() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("2")).unwrap();
        std::fs::write(dir.path().join("2/hello.txt"), "hi there\n").unwrap();

        let mut resolver = AttachmentResolver::new(Some(dir.path().to_path_buf()), false);
        let mut headers = placeholder_headers(&[
            "Content-Disposition: attachment; filename=hello.txt",
            "Content-Transfer-Encoding: base64",
        ]);
        let pending = resolver
            .intercept(&PartPath::from(vec![2]), &mut headers)
            .unwrap()
            .unwrap();
        assert!(!headers.contains(APPLE_CONTENT_LENGTH));
        let body = resolver.finish(pending).unwrap();
        assert_eq!(body, vec![b"aGkgdGhlcmUK".to_vec()]);
    }

    #[test]
    fn test_falls_back_to_single_file() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("1.2");
        std::fs::create_dir_all(&part).unwrap();
        std::fs::write(part.join("Mail-Anhang.txt"), "x").unwrap();
        std::fs::write(part.join(".DS_Store"), "junk").unwrap();

        let mut resolver = AttachmentResolver::new(Some(dir.path().to_path_buf()), false);
        let path = PartPath::from(vec![1, 2]);
        assert_eq!(
            resolver.candidates(&path, Some("missing.txt")),
            vec!["missing.txt".to_string(), "Mail-Anhang.txt".to_string()]
        );
        let mut headers = placeholder_headers(&["Content-Disposition: attachment; filename=missing.txt"]);
        let pending = resolver.intercept(&path, &mut headers).unwrap().unwrap();
        assert_eq!(resolver.finish(pending).unwrap(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_unresolvable_tolerant_and_strict() {
        let dir = TempDir::new().unwrap();
        let path = PartPath::from(vec![3]);

        let mut tolerant = AttachmentResolver::new(Some(dir.path().to_path_buf()), true);
        let mut headers = placeholder_headers(&["Content-Type: application/pdf; name=\"gone.pdf\""]);
        let pending = tolerant.intercept(&path, &mut headers).unwrap().unwrap();
        assert!(tolerant.finish(pending).unwrap().is_empty());
        assert_eq!(
            tolerant.warnings(),
            ["Could not get attachment file (tried gone.pdf)".to_string()]
        );

        let mut strict = AttachmentResolver::new(Some(dir.path().to_path_buf()), false);
        let mut headers = placeholder_headers(&["Content-Type: application/pdf; name=\"gone.pdf\""]);
        let pending = strict.intercept(&path, &mut headers).unwrap().unwrap();
        assert!(matches!(
            strict.finish(pending),
            Err(ConvertError::AttachmentUnresolvable { .. })
        ));
    }

    #[test]
    fn test_unknown_encoding_fails_even_when_tolerant() {
        let mut resolver = AttachmentResolver::new(None, true);
        let mut headers = placeholder_headers(&["Content-Transfer-Encoding: x-unknown"]);
        let err = resolver
            .intercept(&PartPath::from(vec![1]), &mut headers)
            .unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedEncoding(_)));
    }
}
