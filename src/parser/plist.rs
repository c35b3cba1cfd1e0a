//! XML property-list parser for the emlx epilogue.
//!
//! Metadata is best-effort: any parse failure is logged and yields `None`,
//! it never fails a conversion.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::flags::{FlagLayout, FlagSet};
use crate::model::plist::PlistValue;

/// Metadata recovered from the epilogue of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmlxMetadata {
    /// Decoded flag set (empty when the epilogue has no usable `flags`).
    pub flags: FlagSet,
    /// The raw `flags` integer.
    pub raw_flags: Option<u64>,
    /// The whole parsed property list.
    pub plist: Option<PlistValue>,
}

impl EmlxMetadata {
    /// Parse the epilogue and decode its `flags` with `layout`.
    pub fn from_epilogue(epilogue: &[u8], layout: &FlagLayout) -> Self {
        let plist = parse_plist(epilogue);
        let raw_flags = plist
            .as_ref()
            .and_then(|p| p.get("flags"))
            .and_then(PlistValue::as_integer)
            .and_then(|n| u64::try_from(n).ok());
        let flags = raw_flags.map(|raw| layout.decode(raw)).unwrap_or_default();
        Self {
            flags,
            raw_flags,
            plist,
        }
    }
}

enum Frame {
    Dict {
        entries: Vec<(String, PlistValue)>,
        key: Option<String>,
    },
    Array(Vec<PlistValue>),
}

/// Parse an XML property list. Returns `None` on any error or when the
/// document holds no value.
pub fn parse_plist(data: &[u8]) -> Option<PlistValue> {
    match parse_plist_inner(data) {
        Ok(value) => value,
        Err(reason) => {
            warn!(reason = %reason, "Could not parse plist epilogue, ignoring metadata");
            None
        }
    }
}

fn parse_plist_inner(data: &[u8]) -> Result<Option<PlistValue>, String> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<PlistValue> = None;
    let mut scalar: Option<Vec<u8>> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(format!("XML parse error: {e}")),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"plist" => {}
                    b"dict" => stack.push(Frame::Dict {
                        entries: Vec::new(),
                        key: None,
                    }),
                    b"array" => stack.push(Frame::Array(Vec::new())),
                    _ => {
                        scalar = Some(name);
                        text.clear();
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if scalar.is_some() {
                    let unescaped = e.unescape().map_err(|e| e.to_string())?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name().as_ref().to_vec();
                let value = match name.as_slice() {
                    b"true" => Some(PlistValue::Boolean(true)),
                    b"false" => Some(PlistValue::Boolean(false)),
                    b"dict" => Some(PlistValue::Dictionary(Vec::new())),
                    b"array" => Some(PlistValue::Array(Vec::new())),
                    b"string" => Some(PlistValue::String(String::new())),
                    b"data" => Some(PlistValue::Data(Vec::new())),
                    b"key" => {
                        set_key(&mut stack, String::new())?;
                        None
                    }
                    other => {
                        debug!(element = %String::from_utf8_lossy(other), "Skipping empty plist element");
                        None
                    }
                };
                if let Some(value) = value {
                    insert(&mut stack, &mut root, value)?;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"plist" => {}
                    b"dict" => match stack.pop() {
                        Some(Frame::Dict { entries, .. }) => {
                            insert(&mut stack, &mut root, PlistValue::Dictionary(entries))?
                        }
                        _ => return Err("unbalanced </dict>".into()),
                    },
                    b"array" => match stack.pop() {
                        Some(Frame::Array(items)) => {
                            insert(&mut stack, &mut root, PlistValue::Array(items))?
                        }
                        _ => return Err("unbalanced </array>".into()),
                    },
                    _ => {
                        if scalar.take().is_some() {
                            let content = std::mem::take(&mut text);
                            if name == b"key" {
                                set_key(&mut stack, content)?;
                            } else {
                                let value = scalar_value(&name, content)?;
                                insert(&mut stack, &mut root, value)?;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err("unterminated dict or array".into());
    }
    Ok(root)
}

fn scalar_value(element: &[u8], content: String) -> Result<PlistValue, String> {
    let trimmed = content.trim();
    match element {
        b"string" => Ok(PlistValue::String(content)),
        b"integer" => trimmed
            .parse::<i64>()
            .map(PlistValue::Integer)
            .map_err(|e| format!("bad <integer> '{trimmed}': {e}")),
        b"real" => trimmed
            .parse::<f64>()
            .map(PlistValue::Real)
            .map_err(|e| format!("bad <real> '{trimmed}': {e}")),
        b"date" => DateTime::parse_from_rfc3339(trimmed)
            .map(|d| PlistValue::Date(d.with_timezone(&Utc)))
            .map_err(|e| format!("bad <date> '{trimmed}': {e}")),
        b"data" => {
            let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(compact)
                .map(PlistValue::Data)
                .map_err(|e| format!("bad <data>: {e}"))
        }
        other => Err(format!(
            "unknown plist element <{}>",
            String::from_utf8_lossy(other)
        )),
    }
}

fn set_key(stack: &mut [Frame], name: String) -> Result<(), String> {
    match stack.last_mut() {
        Some(Frame::Dict { key, .. }) => {
            *key = Some(name);
            Ok(())
        }
        _ => Err("<key> outside of <dict>".into()),
    }
}

fn insert(
    stack: &mut [Frame],
    root: &mut Option<PlistValue>,
    value: PlistValue,
) -> Result<(), String> {
    match stack.last_mut() {
        None => {
            *root = Some(value);
            Ok(())
        }
        Some(Frame::Array(items)) => {
            items.push(value);
            Ok(())
        }
        Some(Frame::Dict { entries, key }) => {
            let name = key.take().ok_or("dict value without a preceding <key>")?;
            entries.push((name, value));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flags::MessageFlag;

    const EPILOGUE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>date-received</key>
	<integer>1546300800</integer>
	<key>flags</key>
	<integer>8589968387</integer>
	<key>remote-id</key>
	<string>4711</string>
	<key>subject</key>
	<string>Gr&#252;&#223;e &amp; mehr</string>
	<key>to</key>
	<array>
		<string>bob@example.com</string>
	</array>
	<key>partial</key>
	<true/>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_emlx_epilogue() {
        let plist = parse_plist(EPILOGUE.as_bytes()).unwrap();
        assert_eq!(plist.get("remote-id").and_then(|v| v.as_str()), Some("4711"));
        assert_eq!(
            plist.get("subject").and_then(|v| v.as_str()),
            Some("Grüße & mehr")
        );
        assert_eq!(plist.get("partial"), Some(&PlistValue::Boolean(true)));
        assert_eq!(
            plist.get("to"),
            Some(&PlistValue::Array(vec![PlistValue::String(
                "bob@example.com".into()
            )]))
        );
    }

    #[test]
    fn test_metadata_flags() {
        let meta = EmlxMetadata::from_epilogue(EPILOGUE.as_bytes(), &FlagLayout::default());
        // 8589968387 = bit 33, bit 15, bit 10, deleted and read
        assert_eq!(meta.raw_flags, Some(8589968387));
        assert!(meta.flags.contains(MessageFlag::Read));
        assert!(meta.flags.is_deleted());
    }

    #[test]
    fn test_date_and_data() {
        let xml = b"<plist><dict><key>d</key><date>2019-01-01T00:00:00Z</date>\
                    <key>b</key><data>aGVs\n bG8=</data></dict></plist>";
        let plist = parse_plist(xml).unwrap();
        assert!(matches!(plist.get("d"), Some(PlistValue::Date(_))));
        assert_eq!(plist.get("b"), Some(&PlistValue::Data(b"hello".to_vec())));
    }

    #[test]
    fn test_garbage_is_tolerated() {
        assert_eq!(parse_plist(b"<plist><dict><key>flags</key>"), None);
        let meta = EmlxMetadata::from_epilogue(b"not xml at all <<<", &FlagLayout::default());
        assert!(meta.flags.is_empty());
        assert_eq!(meta.raw_flags, None);
    }

    #[test]
    fn test_empty_epilogue() {
        let meta = EmlxMetadata::from_epilogue(b"", &FlagLayout::default());
        assert_eq!(meta, EmlxMetadata::default());
    }
}
