//! Small XML writer over a parsed `roxmltree` document.
//!
//! `roxmltree` is read-only, so both the canonical form used for change
//! detection and the pretty-printed output are produced by walking the
//! parsed tree and writing it back out. Attribute values can be rewritten
//! per element through a callback.

use roxmltree::{Document, Node, NodeType, ParsingOptions};

/// Ordered `(qualified name, value)` pairs of one element.
pub(crate) type Attributes = Vec<(String, String)>;

/// Parse `text`, accepting a DOCTYPE (image exports carry one).
pub(crate) fn parse(text: &str) -> Result<Document<'_>, roxmltree::Error> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Document::parse_with_options(text, options)
}

/// Set `name` to `value`, overwriting in place or appending when absent.
pub(crate) fn set_attribute(attrs: &mut Attributes, name: &str, value: &str) {
    match attrs.iter_mut().find(|(n, _)| n == name) {
        Some((_, v)) => *v = value.to_string(),
        None => attrs.push((name.to_string(), value.to_string())),
    }
}

/// Move `name` to the front with `value`, dropping any other occurrence.
pub(crate) fn set_first_attribute(attrs: &mut Attributes, name: &str, value: &str) {
    attrs.retain(|(n, _)| n != name);
    attrs.insert(0, (name.to_string(), value.to_string()));
}

pub(crate) struct Writer<'r> {
    indent: Option<usize>,
    rewrite: &'r dyn Fn(Node<'_, '_>, &mut Attributes),
    /// Inside mixed content: text is written verbatim, whitespace included.
    preserve_space: bool,
    out: String,
}

impl<'r> Writer<'r> {
    /// `indent: None` writes the compact form with no whitespace between nodes.
    pub(crate) fn new(
        indent: Option<usize>,
        rewrite: &'r dyn Fn(Node<'_, '_>, &mut Attributes),
    ) -> Self {
        Self {
            indent,
            rewrite,
            preserve_space: false,
            out: String::new(),
        }
    }

    pub(crate) fn finish(self) -> String {
        self.out
    }

    /// Write a top-level node (a child of the document root).
    pub(crate) fn top_level(&mut self, node: Node<'_, '_>) {
        if self.indent.is_some() && !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
        self.node(node, 0);
    }

    fn pad(&mut self, depth: usize) {
        if self.preserve_space {
            return;
        }
        if let Some(width) = self.indent {
            self.out.extend(std::iter::repeat_n(' ', width * depth));
        }
    }

    fn node(&mut self, node: Node<'_, '_>, depth: usize) {
        match node.node_type() {
            NodeType::Element => self.element(node, depth),
            NodeType::Text if self.preserve_space => {
                escape_text(&mut self.out, node.text().unwrap_or_default());
            }
            NodeType::Text => {
                if let Some(text) = node.text().map(str::trim).filter(|t| !t.is_empty()) {
                    self.pad(depth);
                    escape_text(&mut self.out, text);
                }
            }
            NodeType::Comment => {
                self.pad(depth);
                self.out.push_str("<!--");
                self.out.push_str(node.text().unwrap_or_default());
                self.out.push_str("-->");
            }
            NodeType::PI => {
                if let Some(pi) = node.pi() {
                    self.pad(depth);
                    self.out.push_str("<?");
                    self.out.push_str(pi.target);
                    if let Some(value) = pi.value {
                        self.out.push(' ');
                        self.out.push_str(value);
                    }
                    self.out.push_str("?>");
                }
            }
            NodeType::Root => {
                for child in node.children() {
                    self.top_level(child);
                }
            }
        }
    }

    fn element(&mut self, node: Node<'_, '_>, depth: usize) {
        let name = qualified_name(node, node.tag_name().namespace(), node.tag_name().name());

        let mut attrs: Attributes = namespace_declarations(node);
        attrs.extend(node.attributes().map(|attr| {
            (
                qualified_name(node, attr.namespace(), attr.name()),
                attr.value().to_string(),
            )
        }));
        (self.rewrite)(node, &mut attrs);

        self.pad(depth);
        self.out.push('<');
        self.out.push_str(&name);
        for (key, value) in &attrs {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            escape_attribute(&mut self.out, value);
            self.out.push('"');
        }

        let children: Vec<Node<'_, '_>> = if self.preserve_space {
            node.children().collect()
        } else {
            node.children().filter(|c| !is_blank_text(*c)).collect()
        };
        if children.is_empty() {
            self.out.push_str("/>");
            return;
        }
        self.out.push('>');

        let has_text = children.iter().any(|c| c.is_text());
        let text_only = children.iter().all(|c| c.is_text());
        if self.preserve_space || self.indent.is_none() {
            for child in children {
                self.node(child, depth + 1);
            }
        } else if text_only {
            // Inline text content, no padding
            for child in children {
                if let Some(text) = child.text() {
                    escape_text(&mut self.out, text.trim());
                }
            }
        } else if has_text || node.tag_name().namespace() == Some(XHTML_NS) {
            // Mixed content (SVG <text>, HTML labels): whitespace is significant
            self.preserve_space = true;
            for child in node.children() {
                self.node(child, depth + 1);
            }
            self.preserve_space = false;
        } else {
            for child in children {
                self.out.push('\n');
                self.node(child, depth + 1);
            }
            self.out.push('\n');
            self.pad(depth);
        }

        self.out.push_str("</");
        self.out.push_str(&name);
        self.out.push('>');
    }
}

/// HTML labels inside `foreignObject` render whitespace between elements.
const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

fn is_blank_text(node: Node<'_, '_>) -> bool {
    node.is_text() && node.text().is_none_or(|t| t.trim().is_empty())
}

fn qualified_name(node: Node<'_, '_>, namespace: Option<&str>, local: &str) -> String {
    match namespace.and_then(|uri| node.lookup_prefix(uri)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_string(),
    }
}

/// Namespace declarations introduced by `node` itself, i.e. in scope here but
/// not on the parent element.
fn namespace_declarations(node: Node<'_, '_>) -> Attributes {
    let inherited: Vec<(Option<&str>, &str)> = node
        .parent_element()
        .map(|parent| parent.namespaces().map(|ns| (ns.name(), ns.uri())).collect())
        .unwrap_or_default();

    node.namespaces()
        .filter(|ns| ns.name() != Some("xml"))
        .filter(|ns| !inherited.contains(&(ns.name(), ns.uri())))
        .map(|ns| {
            let key = match ns.name() {
                Some(prefix) => format!("xmlns:{prefix}"),
                None => "xmlns".to_string(),
            };
            (key, ns.uri().to_string())
        })
        .collect()
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#xa;"),
            '\r' => out.push_str("&#xd;"),
            '\t' => out.push_str("&#x9;"),
            _ => out.push(c),
        }
    }
}

/// Escape a string for use inside a double-quoted attribute value.
pub fn escape_attribute_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_attribute(&mut out, value);
    out
}
