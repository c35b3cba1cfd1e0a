//! MIME tokenizer and rewriter.
//!
//! [`MimeTokenizer`] turns repaired payload lines into a flat, depth-first
//! stream of [`MimeEvent`]s without holding more than one header block in
//! memory. [`Rewriter`] sits on top of that stream and lets an
//! [`Interceptor`] swap the body of selected leaf parts.
//!
//! Every line between two delimiters belongs to the enclosing entity,
//! including the empty line right before a delimiter. This keeps the event
//! stream byte-faithful, so serializing it reproduces the input.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{ConvertError, Result};
use crate::model::mime::{Headers, LeafBody, Line, MimeNode, PartPath};
use crate::parser::header::{multipart_boundary, APPLE_CONTENT_LENGTH};

/// One tokenizer event, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeEvent {
    /// Headers of an entity are complete.
    ///
    /// `boundary` is set for multiparts, `delimiter` is the token of the
    /// delimiter line that opened this entity (`None` for the root).
    Start {
        path: PartPath,
        headers: Headers,
        boundary: Option<String>,
        delimiter: Option<String>,
    },
    /// A body, preamble or epilogue line of the innermost open entity.
    Line(Line),
    /// The close-delimiter `--boundary--` of the innermost open multipart.
    Close { boundary: String },
    /// The entity at `path` is finished.
    End { path: PartPath },
}

enum EntityState {
    Headers(Vec<Vec<u8>>),
    Body {
        boundary: Option<String>,
        closed: bool,
    },
}

struct Entity {
    path: PartPath,
    delimiter: Option<String>,
    state: EntityState,
    children: u32,
}

impl Entity {
    fn new(path: PartPath, delimiter: Option<String>) -> Self {
        Self {
            path,
            delimiter,
            state: EntityState::Headers(Vec::new()),
            children: 0,
        }
    }

    /// Boundary this entity still accepts delimiters for.
    fn open_boundary(&self) -> Option<&str> {
        match &self.state {
            EntityState::Body {
                boundary: Some(b),
                closed: false,
            } => Some(b),
            _ => None,
        }
    }
}

/// Streaming MIME tokenizer over repaired payload lines.
pub struct MimeTokenizer<I> {
    lines: I,
    stack: Vec<Entity>,
    queue: VecDeque<MimeEvent>,
    finished: bool,
}

impl<I: Iterator<Item = Result<Line>>> MimeTokenizer<I> {
    pub fn new(lines: I) -> Self {
        Self {
            lines,
            stack: vec![Entity::new(PartPath::root(), None)],
            queue: VecDeque::new(),
            finished: false,
        }
    }

    fn feed(&mut self, line: Line) {
        if let Some((depth, boundary, closing)) = self.match_delimiter(&line.bytes) {
            while self.stack.len() > depth + 1 {
                self.close_top();
            }
            let parent = &mut self.stack[depth];
            if closing {
                if let EntityState::Body { closed, .. } = &mut parent.state {
                    *closed = true;
                }
                self.queue.push_back(MimeEvent::Close { boundary });
            } else {
                parent.children += 1;
                let path = parent.path.child(parent.children);
                self.stack.push(Entity::new(path, Some(boundary)));
            }
            return;
        }

        let Some(top) = self.stack.last_mut() else {
            return;
        };
        if line.is_empty() && matches!(top.state, EntityState::Headers(_)) {
            Self::complete_headers(top, &mut self.queue);
            return;
        }
        match &mut top.state {
            EntityState::Headers(lines) => lines.push(line.bytes),
            EntityState::Body { .. } => self.queue.push_back(MimeEvent::Line(line)),
        }
    }

    /// Find the innermost open multipart whose delimiter this line is.
    fn match_delimiter(&self, line: &[u8]) -> Option<(usize, String, bool)> {
        let token = line.strip_prefix(b"--")?;
        self.stack.iter().enumerate().rev().find_map(|(depth, entity)| {
            let boundary = entity.open_boundary()?;
            let b = boundary.as_bytes();
            if token == b {
                Some((depth, boundary.to_string(), false))
            } else if token.len() == b.len() + 2 && token.starts_with(b) && token.ends_with(b"--")
            {
                Some((depth, boundary.to_string(), true))
            } else {
                None
            }
        })
    }

    fn complete_headers(entity: &mut Entity, queue: &mut VecDeque<MimeEvent>) {
        let EntityState::Headers(lines) = &mut entity.state else {
            return;
        };
        let headers = Headers::parse(lines.as_slice());
        let boundary = multipart_boundary(&headers);
        debug!(
            path = %entity.path,
            multipart = boundary.is_some(),
            header_count = headers.len(),
            "Parsed MIME entity headers"
        );
        queue.push_back(MimeEvent::Start {
            path: entity.path.clone(),
            headers,
            boundary: boundary.clone(),
            delimiter: entity.delimiter.clone(),
        });
        entity.state = EntityState::Body {
            boundary,
            closed: false,
        };
    }

    fn close_top(&mut self) {
        let Some(mut entity) = self.stack.pop() else {
            return;
        };
        Self::complete_headers(&mut entity, &mut self.queue);
        if let Some(boundary) = entity.open_boundary() {
            warn!(
                path = %entity.path,
                boundary = %boundary,
                "Multipart has no close-delimiter, closing it"
            );
            self.queue.push_back(MimeEvent::Close {
                boundary: boundary.to_string(),
            });
        }
        self.queue.push_back(MimeEvent::End { path: entity.path });
    }
}

impl<I: Iterator<Item = Result<Line>>> Iterator for MimeTokenizer<I> {
    type Item = Result<MimeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.lines.next() {
                Some(Ok(line)) => self.feed(line),
                Some(Err(e)) => {
                    self.finished = true;
                    self.queue.clear();
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    while !self.stack.is_empty() {
                        self.close_top();
                    }
                }
            }
        }
    }
}

/// Replaces the body of selected leaf parts while the event stream flows by.
///
/// Only leaves are offered to [`Interceptor::intercept`].
pub trait Interceptor {
    /// State kept for one diverted part until its body has been consumed.
    type Pending;

    /// Decide whether the leaf at `path` is diverted. May edit the headers
    /// that will be emitted for it.
    fn intercept(&mut self, path: &PartPath, headers: &mut Headers)
        -> Result<Option<Self::Pending>>;

    /// Receive one line of the original body of a diverted part.
    fn divert(&mut self, _pending: &mut Self::Pending, _line: Line) {}

    /// Produce the replacement body lines once the original body is drained.
    fn finish(&mut self, pending: Self::Pending) -> Result<Vec<Vec<u8>>>;
}

/// Event adaptor driving an [`Interceptor`].
///
/// A diverted part's replacement is emitted completely before that part's
/// `End`, and only one part is diverted at a time.
pub struct Rewriter<I, X: Interceptor> {
    events: I,
    interceptor: X,
    active: Option<(PartPath, X::Pending)>,
    queue: VecDeque<MimeEvent>,
    failed: bool,
}

impl<I, X> Rewriter<I, X>
where
    I: Iterator<Item = Result<MimeEvent>>,
    X: Interceptor,
{
    pub fn new(events: I, interceptor: X) -> Self {
        Self {
            events,
            interceptor,
            active: None,
            queue: VecDeque::new(),
            failed: false,
        }
    }

    pub fn interceptor(&self) -> &X {
        &self.interceptor
    }

    pub fn into_interceptor(self) -> X {
        self.interceptor
    }

    fn handle(&mut self, event: MimeEvent) -> Result<Option<MimeEvent>> {
        match event {
            MimeEvent::Start {
                path,
                mut headers,
                boundary,
                delimiter,
            } => {
                if boundary.is_none() && self.active.is_none() {
                    if let Some(pending) = self.interceptor.intercept(&path, &mut headers)? {
                        debug!(path = %path, "Diverting part body");
                        self.active = Some((path.clone(), pending));
                    }
                }
                Ok(Some(MimeEvent::Start {
                    path,
                    headers,
                    boundary,
                    delimiter,
                }))
            }
            MimeEvent::Line(line) => match &mut self.active {
                Some((_, pending)) => {
                    self.interceptor.divert(pending, line);
                    Ok(None)
                }
                None => Ok(Some(MimeEvent::Line(line))),
            },
            MimeEvent::End { path } => {
                let ends_active = matches!(&self.active, Some((active, _)) if *active == path);
                if ends_active {
                    if let Some((_, pending)) = self.active.take() {
                        let replacement = self.interceptor.finish(pending)?;
                        self.queue
                            .extend(replacement.into_iter().map(|l| MimeEvent::Line(Line::new(l))));
                    }
                    self.queue.push_back(MimeEvent::End { path });
                    Ok(None)
                } else {
                    Ok(Some(MimeEvent::End { path }))
                }
            }
            other => Ok(Some(other)),
        }
    }
}

impl<I, X> Iterator for Rewriter<I, X>
where
    I: Iterator<Item = Result<MimeEvent>>,
    X: Interceptor,
{
    type Item = Result<MimeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }
            if self.failed {
                return None;
            }
            let event = match self.events.next()? {
                Ok(event) => event,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            match self.handle(event) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Assemble an event stream into a [`MimeNode`] tree.
///
/// Leaves carrying `X-Apple-Content-Length` become placeholders. Delimiter
/// tokens are checked against their parent's boundary.
pub fn build_tree<I>(events: I) -> Result<MimeNode>
where
    I: IntoIterator<Item = Result<MimeEvent>>,
{
    struct Open {
        headers: Headers,
        boundary: Option<String>,
        lines: Vec<Line>,
        children: Vec<MimeNode>,
        epilogue: Vec<Line>,
        closed: bool,
    }

    let mut stack: Vec<Open> = Vec::new();
    let mut root = None;

    for event in events {
        match event? {
            MimeEvent::Start {
                path,
                headers,
                boundary,
                delimiter,
            } => {
                if let Some(parent) = stack.last() {
                    check_delimiter(parent.boundary.as_deref(), delimiter.as_deref(), &path)?;
                }
                stack.push(Open {
                    headers,
                    boundary,
                    lines: Vec::new(),
                    children: Vec::new(),
                    epilogue: Vec::new(),
                    closed: false,
                });
            }
            MimeEvent::Line(line) => {
                let open = stack.last_mut().ok_or_else(|| outside("line"))?;
                if open.closed {
                    open.epilogue.push(line);
                } else {
                    open.lines.push(line);
                }
            }
            MimeEvent::Close { boundary } => {
                let open = stack.last_mut().ok_or_else(|| outside("close-delimiter"))?;
                check_delimiter(open.boundary.as_deref(), Some(boundary.as_str()), &PartPath::root())?;
                open.closed = true;
            }
            MimeEvent::End { .. } => {
                let open = stack.pop().ok_or_else(|| outside("end of part"))?;
                let node = match open.boundary {
                    Some(boundary) => MimeNode::Multipart {
                        headers: open.headers,
                        boundary,
                        preamble: open.lines,
                        children: open.children,
                        epilogue: open.epilogue,
                    },
                    None => {
                        let body = match open.headers.text(APPLE_CONTENT_LENGTH) {
                            Some(value) => LeafBody::Placeholder {
                                declared_length: value.parse().ok(),
                            },
                            None => LeafBody::Inline(open.lines),
                        };
                        MimeNode::Leaf {
                            headers: open.headers,
                            body,
                        }
                    }
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
        }
    }

    root.ok_or_else(|| ConvertError::MalformedContainer("message has no MIME entity".into()))
}

/// Flatten a tree back into events. Placeholder leaves have no body lines.
pub fn tree_events(node: &MimeNode) -> Vec<MimeEvent> {
    let mut events = Vec::new();
    push_events(node, PartPath::root(), None, &mut events);
    events
}

fn push_events(
    node: &MimeNode,
    path: PartPath,
    delimiter: Option<&str>,
    events: &mut Vec<MimeEvent>,
) {
    events.push(MimeEvent::Start {
        path: path.clone(),
        headers: node.headers().clone(),
        boundary: node.boundary().map(String::from),
        delimiter: delimiter.map(String::from),
    });
    match node {
        MimeNode::Leaf { body, .. } => {
            if let LeafBody::Inline(lines) = body {
                events.extend(lines.iter().cloned().map(MimeEvent::Line));
            }
        }
        MimeNode::Multipart {
            boundary,
            preamble,
            children,
            epilogue,
            ..
        } => {
            events.extend(preamble.iter().cloned().map(MimeEvent::Line));
            for (i, child) in children.iter().enumerate() {
                push_events(child, path.child(i as u32 + 1), Some(boundary), events);
            }
            events.push(MimeEvent::Close {
                boundary: boundary.clone(),
            });
            events.extend(epilogue.iter().cloned().map(MimeEvent::Line));
        }
    }
    events.push(MimeEvent::End { path });
}

/// Verify that a delimiter token matches the boundary of its multipart.
pub fn check_delimiter(expected: Option<&str>, found: Option<&str>, path: &PartPath) -> Result<()> {
    match (expected, found) {
        (Some(expected), Some(found)) if expected == found => Ok(()),
        (Some(expected), found) => Err(ConvertError::InconsistentBoundary {
            expected: expected.to_string(),
            found: found.unwrap_or_default().to_string(),
        }),
        (None, _) => Err(ConvertError::MalformedContainer(format!(
            "part {path} is nested in an entity that is not multipart"
        ))),
    }
}

fn outside(what: &str) -> ConvertError {
    ConvertError::MalformedContainer(format!("{what} outside of any MIME entity"))
}
