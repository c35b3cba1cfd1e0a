//! MIME structure types shared by the tokenizer, the attachment resolver and
//! the serializer.

use std::fmt;

/// One physical line of the payload, without its line terminator.
///
/// `synthetic` marks blank lines inserted by the boundary repairer. They
/// guide parsing but are never written to the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub bytes: Vec<u8>,
    pub synthetic: bool,
}

impl Line {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            synthetic: false,
        }
    }

    /// An inserted blank line that must be stripped before emission.
    pub fn synthetic_blank() -> Self {
        Self {
            bytes: Vec::new(),
            synthetic: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A single header field.
///
/// `value` is everything after the colon, verbatim. Folded continuation lines
/// are kept, joined with CRLF, so the header serializes back byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name)
    }

    /// The value with line breaks collapsed to spaces and outer whitespace trimmed.
    pub fn text(&self) -> String {
        let raw = String::from_utf8_lossy(&self.value);
        raw.replace("\r\n", " ").replace('\n', " ").trim().to_string()
    }

    /// Physical lines of this header. Continuation lines that lost their
    /// leading whitespace are indented with a tab.
    pub fn to_lines(&self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for (idx, segment) in split_crlf(&self.value).into_iter().enumerate() {
            let mut line = Vec::with_capacity(self.name.len() + segment.len() + 2);
            if idx == 0 {
                line.extend_from_slice(self.name.as_bytes());
                line.push(b':');
            } else if !matches!(segment.first(), Some(b' ') | Some(b'\t')) {
                line.push(b'\t');
            }
            line.extend_from_slice(segment);
            lines.push(line);
        }
        lines
    }
}

/// Ordered header block. Repeated names are preserved in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a header block from its physical lines (no terminating blank line).
    pub fn parse<L: AsRef<[u8]>>(lines: &[L]) -> Self {
        let mut headers: Vec<Header> = Vec::new();
        for line in lines {
            let line = line.as_ref();
            let is_continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
            match (is_continuation, line.iter().position(|&b| b == b':')) {
                (false, Some(colon)) => {
                    headers.push(Header {
                        name: String::from_utf8_lossy(&line[..colon]).into_owned(),
                        value: line[colon + 1..].to_vec(),
                    });
                }
                _ => {
                    // Continuation, or a stray line without a colon
                    if let Some(last) = headers.last_mut() {
                        last.value.extend_from_slice(b"\r\n");
                        last.value.extend_from_slice(line);
                    } else {
                        tracing::debug!(
                            line = %String::from_utf8_lossy(line),
                            "Dropping header line without a field name"
                        );
                    }
                }
            }
        }
        Self(headers)
    }

    /// First header with the given name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.is(name))
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.is(name))
    }

    /// Unfolded, trimmed value of the first header with this name.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(Header::text)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Remove every header with this name. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.is(name));
        before - self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 1-based position of a node inside the MIME tree.
///
/// The root is the empty path; `[1, 2]` is the second child of the first
/// child. Apple Mail names attachment directories after the dot-joined path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PartPath(Vec<u32>);

impl PartPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }
}

impl From<Vec<u32>> for PartPath {
    fn from(indices: Vec<u32>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for PartPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

/// Body of a leaf node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafBody {
    /// Content stored inline in the container.
    Inline(Vec<Line>),
    /// Content externalized by Mail.app (`X-Apple-Content-Length`).
    Placeholder { declared_length: Option<u64> },
}

/// A parsed MIME entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeNode {
    Leaf {
        headers: Headers,
        body: LeafBody,
    },
    Multipart {
        headers: Headers,
        boundary: String,
        preamble: Vec<Line>,
        children: Vec<MimeNode>,
        epilogue: Vec<Line>,
    },
}

impl MimeNode {
    pub fn headers(&self) -> &Headers {
        match self {
            MimeNode::Leaf { headers, .. } | MimeNode::Multipart { headers, .. } => headers,
        }
    }

    pub fn boundary(&self) -> Option<&str> {
        match self {
            MimeNode::Multipart { boundary, .. } => Some(boundary),
            MimeNode::Leaf { .. } => None,
        }
    }

    pub fn children(&self) -> &[MimeNode] {
        match self {
            MimeNode::Multipart { children, .. } => children,
            MimeNode::Leaf { .. } => &[],
        }
    }

    /// Node at `path`, relative to this node.
    pub fn find(&self, path: &PartPath) -> Option<&MimeNode> {
        let mut node = self;
        for &index in path.indices() {
            node = node.children().get(index.checked_sub(1)? as usize)?;
        }
        Some(node)
    }

    /// Paths of all placeholder leaves, in document order.
    pub fn placeholders(&self) -> Vec<PartPath> {
        let mut found = Vec::new();
        collect_placeholders(self, PartPath::root(), &mut found);
        found
    }
}

fn collect_placeholders(node: &MimeNode, path: PartPath, found: &mut Vec<PartPath>) {
    match node {
        MimeNode::Leaf {
            body: LeafBody::Placeholder { .. },
            ..
        } => found.push(path),
        MimeNode::Leaf { .. } => {}
        MimeNode::Multipart { children, .. } => {
            for (i, child) in children.iter().enumerate() {
                collect_placeholders(child, path.child(i as u32 + 1), found);
            }
        }
    }
}

/// Split on CRLF (or bare LF), keeping a trailing empty segment.
fn split_crlf(value: &[u8]) -> Vec<&[u8]> {
    value
        .split(|&b| b == b'\n')
        .map(|seg| seg.strip_suffix(b"\r").unwrap_or(seg))
        .collect()
}
