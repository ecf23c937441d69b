//! Canonical comparable form of a document's text.
//!
//! The diagram session re-serializes the whole file on every touch, bumping
//! bookkeeping attributes (`modified`, `etag`, viewport `dx`/`dy`) and
//! reflowing whitespace even when nothing was drawn. Two texts whose
//! snapshots compare equal are treated as the same diagram.

use crate::format::OutputFormat;
use crate::xml::{self, Attributes, Writer};
use roxmltree::Node;

/// Canonical form of a text blob at one point in time.
///
/// `Unparseable` never equals anything, itself included, so an edit that
/// cannot be understood is always propagated instead of silently dropped.
#[derive(Debug, Clone)]
pub enum NormalizedSnapshot {
    Canonical(String),
    Unparseable,
}

impl PartialEq for NormalizedSnapshot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Canonical(a), Self::Canonical(b)) => a == b,
            _ => false,
        }
    }
}

impl NormalizedSnapshot {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Canonical(s) => Some(s),
            Self::Unparseable => None,
        }
    }
}

/// Normalize diagram XML (or an SVG carrying it).
pub fn normalize(text: &str) -> NormalizedSnapshot {
    match canonicalize(text) {
        Some(canonical) => NormalizedSnapshot::Canonical(canonical),
        None => NormalizedSnapshot::Unparseable,
    }
}

/// Normalize according to the document's output format.
///
/// Converted scripts are not XML and have no volatile fields: their snapshot
/// is the text itself.
pub fn normalize_for(format: OutputFormat, text: &str) -> NormalizedSnapshot {
    match format {
        OutputFormat::ConvertedScript => NormalizedSnapshot::Canonical(text.to_string()),
        OutputFormat::DiagramXml | OutputFormat::EmbeddedSvg => normalize(text),
    }
}

fn canonicalize(text: &str) -> Option<String> {
    let doc = xml::parse(text).ok()?;
    let mut writer = Writer::new(None, &strip_volatile);
    for child in doc.root().children() {
        writer.top_level(child);
    }
    Some(writer.finish())
}

fn strip_volatile(node: Node<'_, '_>, attrs: &mut Attributes) {
    match node.tag_name().name() {
        "mxfile" => {
            xml::set_attribute(attrs, "modified", "");
            xml::set_attribute(attrs, "etag", "");
        }
        "mxGraphModel" => {
            xml::set_attribute(attrs, "dx", "0");
            xml::set_attribute(attrs, "dy", "0");
        }
        "svg" if node.parent().is_some_and(|p| p.is_root()) => {
            // Image exports embed the diagram file in `content`
            if let Some((_, content)) = attrs.iter_mut().find(|(name, _)| name == "content") {
                if let Some(embedded) = canonicalize(content) {
                    *content = embedded;
                }
            }
        }
        _ => {}
    }
}
