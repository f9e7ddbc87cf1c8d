//! Owned XML fragment tree on top of quick-xml.
//!
//! Chat traffic is a stream of sibling stanzas with no document root, so a
//! fragment is parsed inside a synthetic `<xml>` wrapper and kept as a list of
//! top-level nodes. Start tags keep their raw attribute bytes (including the
//! quoting style the client used) and text keeps its escaped form, so
//! untouched parts serialize back unchanged.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

const WRAPPER_OPEN: &str = "<xml>";
const WRAPPER_CLOSE: &str = "</xml>";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("fragment ended inside an open element")]
    Unbalanced,
    #[error("content after the fragment wrapper")]
    TrailingContent,
    #[error("failed to serialize fragment: {0}")]
    Write(String),
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    /// Text, CDATA, comments and anything else, re-emitted verbatim.
    Other(Event<'static>),
}

#[derive(Debug, Clone)]
pub struct Element {
    start: BytesStart<'static>,
    children: Vec<Node>,
    self_closing: bool,
}

impl Element {
    fn open(start: BytesStart<'static>) -> Self {
        Self {
            start,
            children: Vec::new(),
            self_closing: false,
        }
    }

    fn empty(start: BytesStart<'static>) -> Self {
        Self {
            start,
            children: Vec::new(),
            self_closing: true,
        }
    }

    pub fn name(&self) -> &[u8] {
        self.start.name().into_inner()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == name.as_bytes()
    }

    /// Unescaped value of the first attribute named `key`.
    pub fn attr(&self, key: &str) -> Option<String> {
        self.start
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == key.as_bytes())
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.start
            .attributes()
            .flatten()
            .any(|a| a.key.as_ref() == key.as_bytes())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(e) if e.is(name) => Some(e),
            _ => None,
        })
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.is(name) => Some(e),
            _ => None,
        })
    }

    /// Follows a chain of child names, first match at each level.
    pub fn descendant(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    pub fn descendant_mut(&mut self, path: &[&str]) -> Option<&mut Element> {
        let mut el = self;
        for name in path {
            el = el.child_mut(name)?;
        }
        Some(el)
    }

    /// Removes the first child element named `name`. Returns whether one was found.
    pub fn remove_child(&mut self, name: &str) -> bool {
        let pos = self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.is(name)));
        match pos {
            Some(i) => {
                self.children.remove(i);
                true
            }
            None => false,
        }
    }

    /// Concatenated, unescaped text of the direct text children.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        let mut any = false;
        for node in &self.children {
            match node {
                Node::Other(Event::Text(t)) => {
                    any = true;
                    match t.unescape() {
                        Ok(s) => out.push_str(&s),
                        Err(_) => out.push_str(&String::from_utf8_lossy(t)),
                    }
                }
                Node::Other(Event::CData(c)) => {
                    any = true;
                    out.push_str(&String::from_utf8_lossy(c));
                }
                _ => {}
            }
        }
        any.then_some(out)
    }

    /// Replaces every child with a single text node.
    pub fn set_text(&mut self, value: &str) {
        self.children.clear();
        self.children
            .push(Node::Other(Event::Text(BytesText::new(value).into_owned())));
        self.self_closing = false;
    }
}

/// A parsed run of sibling nodes.
#[derive(Debug, Clone)]
pub struct Fragment {
    nodes: Vec<Node>,
}

impl Fragment {
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        let wrapped = format!("{WRAPPER_OPEN}{input}{WRAPPER_CLOSE}");
        let mut reader = Reader::from_str(&wrapped);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event()?;
            if root.is_some() && !matches!(event, Event::Eof) {
                return Err(TreeError::TrailingContent);
            }
            match event {
                Event::Start(e) => stack.push(Element::open(e.into_owned())),
                Event::Empty(e) => {
                    push_child(&mut stack, Node::Element(Element::empty(e.into_owned())))?
                }
                Event::End(_) => {
                    let el = stack.pop().ok_or(TreeError::Unbalanced)?;
                    if stack.is_empty() {
                        root = Some(el);
                    } else {
                        push_child(&mut stack, Node::Element(el))?;
                    }
                }
                Event::Eof => break,
                other => push_child(&mut stack, Node::Other(other.into_owned()))?,
            }
        }

        match root {
            Some(root) if stack.is_empty() => Ok(Self {
                nodes: root.children,
            }),
            _ => Err(TreeError::Unbalanced),
        }
    }

    /// Top-level elements only.
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.nodes.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Keeps only the top-level nodes for which `keep` returns true.
    /// Non-element nodes are always kept.
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.nodes.retain(|n| match n {
            Node::Element(e) => keep(e),
            Node::Other(_) => true,
        });
    }

    /// Flat serialization: no declaration, no wrapper, UTF-8.
    pub fn to_xml(&self) -> Result<String, TreeError> {
        let mut writer = Writer::new(Vec::new());
        for node in &self.nodes {
            write_node(&mut writer, node)?;
        }
        String::from_utf8(writer.into_inner()).map_err(|e| TreeError::Write(e.to_string()))
    }
}

fn push_child(stack: &mut [Element], node: Node) -> Result<(), TreeError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => Err(TreeError::TrailingContent),
    }
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<(), TreeError> {
    let write = |writer: &mut Writer<Vec<u8>>, event: Event<'_>| {
        writer
            .write_event(event)
            .map_err(|e| TreeError::Write(e.to_string()))
    };
    match node {
        Node::Element(el) if el.self_closing && el.children.is_empty() => {
            write(writer, Event::Empty(el.start.borrow()))
        }
        Node::Element(el) => {
            write(writer, Event::Start(el.start.borrow()))?;
            for child in &el.children {
                write_node(writer, child)?;
            }
            write(writer, Event::End(el.start.to_end()))
        }
        Node::Other(event) => write(writer, event.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_fragment_serializes_back() {
        let input = "<presence id='p1'><show>chat</show><status>hi &amp; bye</status></presence><iq type='get'/>";
        let fragment = Fragment::parse(input).unwrap();
        assert_eq!(fragment.to_xml().unwrap(), input);
    }

    #[test]
    fn test_unclosed_element_is_an_error() {
        assert!(Fragment::parse("<presence><show>chat</show>").is_err());
    }

    #[test]
    fn test_stray_end_tag_is_an_error() {
        assert!(Fragment::parse("</presence><presence/>").is_err());
    }

    #[test]
    fn test_descendant_and_set_text() {
        let mut fragment =
            Fragment::parse("<presence><games><lol><st>dnd</st></lol></games></presence>").unwrap();
        let presence = fragment.elements_mut().next().unwrap();
        assert_eq!(
            presence.descendant(&["games", "lol", "st"]).and_then(|e| e.text()),
            Some("dnd".to_string())
        );
        presence
            .descendant_mut(&["games", "lol", "st"])
            .unwrap()
            .set_text("a<b");
        assert_eq!(
            fragment.to_xml().unwrap(),
            "<presence><games><lol><st>a&lt;b</st></lol></games></presence>"
        );
    }

    #[test]
    fn test_remove_child_and_attributes() {
        let mut fragment =
            Fragment::parse("<presence to='room@muc'><status>x</status><show/></presence>").unwrap();
        let presence = fragment.elements_mut().next().unwrap();
        assert!(presence.has_attr("to"));
        assert_eq!(presence.attr("to").as_deref(), Some("room@muc"));
        assert!(presence.remove_child("status"));
        assert!(!presence.remove_child("status"));
        assert_eq!(fragment.to_xml().unwrap(), "<presence to='room@muc'><show/></presence>");
    }

    #[test]
    fn test_retain_elements_keeps_whitespace() {
        let mut fragment = Fragment::parse("<a/> <b/>").unwrap();
        fragment.retain_elements(|e| !e.is("a"));
        assert_eq!(fragment.to_xml().unwrap(), " <b/>");
    }
}
