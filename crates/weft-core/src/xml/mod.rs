//! Owned XML document model.
//!
//! Workflow templates and instance savepoints are XML. Instead of a
//! pointer-linked DOM, a document is an arena of nodes addressed by stable
//! integer ids; parent links are indices, so subtrees can be cloned,
//! grafted and detached without reference cycles. Parsing and escaping are
//! delegated to quick-xml; navigation and mutation live here.
//!
//! Serialization is canonical: no inserted whitespace, attributes in
//! insertion order, `"` quoting. Parsing a serialized document and
//! serializing it again yields byte-identical output.

use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{EngineError, Result};

/// Stable index of a node inside its [`Document`] arena.
pub type NodeId = usize;

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

/// An XML document backed by a node arena.
///
/// Detached nodes stay in the arena but are unreachable from the root;
/// documents are short-lived enough that reclamation is not worth the
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Document {
    /// Create a document with a single empty root element.
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Element {
                name: root_name.into(),
                attrs: Vec::new(),
            },
        };
        Self {
            nodes: vec![root],
            root: 0,
        }
    }

    /// Parse an XML string into a document.
    pub fn parse(input: &str) -> Result<Self> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(false);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut root: Option<NodeId> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let id = push_element(&mut nodes, &mut stack, &mut root, &e)?;
                    stack.push(id);
                }
                Ok(Event::Empty(e)) => {
                    push_element(&mut nodes, &mut stack, &mut root, &e)?;
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    if let Some(&parent) = stack.last() {
                        let text = t
                            .unescape()
                            .map_err(|e| EngineError::xml("XML", e.to_string()))?
                            .into_owned();
                        let id = nodes.len();
                        nodes.push(Node {
                            parent: Some(parent),
                            children: Vec::new(),
                            kind: NodeKind::Text(text),
                        });
                        nodes[parent].children.push(id);
                    }
                }
                Ok(Event::CData(t)) => {
                    if let Some(&parent) = stack.last() {
                        let text = String::from_utf8_lossy(&t).into_owned();
                        let id = nodes.len();
                        nodes.push(Node {
                            parent: Some(parent),
                            children: Vec::new(),
                            kind: NodeKind::Text(text),
                        });
                        nodes[parent].children.push(id);
                    }
                }
                // Declarations, comments and processing instructions carry
                // no savepoint semantics.
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(EngineError::xml(
                        "XML",
                        format!("parse error at byte {}: {e}", reader.buffer_position()),
                    ));
                }
                Ok(_) => {}
            }
        }

        let root =
            root.ok_or_else(|| EngineError::xml("XML", "document has no root element"))?;
        Ok(Self { nodes, root })
    }

    /// The root element.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Element name, or `None` for a text node.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } => Some(name),
            NodeKind::Text(_) => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Element { .. })
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// All children (elements and text) in document order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Child elements in document order.
    pub fn child_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| self.is_element(c))
            .collect()
    }

    /// Child elements with a given name, in document order.
    pub fn children_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| self.name(c) == Some(name))
            .collect()
    }

    /// First child element with a given name.
    pub fn first_child_named(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| self.name(c) == Some(name))
    }

    /// Attribute value of an element.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    /// All attributes of an element in insertion order.
    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        match &self.nodes[id].kind {
            NodeKind::Element { attrs, .. } => attrs,
            NodeKind::Text(_) => &[],
        }
    }

    /// Set (or replace) an attribute.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id].kind {
            match attrs.iter_mut().find(|(k, _)| k == name) {
                Some(entry) => entry.1 = value.to_owned(),
                None => attrs.push((name.to_owned(), value.to_owned())),
            }
        }
    }

    /// Remove an attribute if present.
    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id].kind {
            attrs.retain(|(k, _)| k != name);
        }
    }

    /// Concatenated text content of a node's entire subtree.
    pub fn text(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => out.push_str(t),
            NodeKind::Element { .. } => {
                for &c in &self.nodes[id].children {
                    self.collect_text(c, out);
                }
            }
        }
    }

    /// Append a new child element, returning its id.
    pub fn append_element(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Element {
                name: name.into(),
                attrs: Vec::new(),
            },
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Append a text child.
    pub fn append_text(&mut self, parent: NodeId, text: impl Into<String>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind: NodeKind::Text(text.into()),
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Replace the node's children with a single text child.
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        self.nodes[id].children.clear();
        self.append_text(id, text);
    }

    /// Detach a node from its parent. The node and its subtree stay in the
    /// arena but are no longer reachable from the root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    /// Position of a child within its parent's child list.
    pub fn child_index(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes[id].parent?;
        self.nodes[parent].children.iter().position(|&c| c == id)
    }

    /// Deep-copy a subtree of this document under `parent`, inserted at
    /// `index` within the parent's child list (clamped to the end).
    pub fn clone_subtree(&mut self, src: NodeId, parent: NodeId, index: usize) -> NodeId {
        let id = self.copy_rec(src, parent);
        // copy_rec appended the clone; move it to the requested position.
        self.nodes[parent].children.pop();
        let index = index.min(self.nodes[parent].children.len());
        self.nodes[parent].children.insert(index, id);
        id
    }

    /// Deep-copy a subtree from another document under `parent`, appended.
    pub fn import_subtree(&mut self, other: &Document, src: NodeId, parent: NodeId) -> NodeId {
        let kind = other.nodes[src].kind.clone();
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent].children.push(id);
        for &c in &other.nodes[src].children {
            self.import_subtree(other, c, id);
        }
        id
    }

    fn copy_rec(&mut self, src: NodeId, parent: NodeId) -> NodeId {
        let kind = self.nodes[src].kind.clone();
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent].children.push(id);
        let children = self.nodes[src].children.clone();
        for c in children {
            self.copy_rec(c, id);
        }
        id
    }

    /// All elements in the subtree of `id` (inclusive) in document order.
    pub fn descendant_elements(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_elements(id, &mut out);
        out
    }

    fn collect_elements(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if self.is_element(id) {
            out.push(id);
            for &c in &self.nodes[id].children {
                self.collect_elements(c, out);
            }
        }
    }

    /// Serialize the whole document.
    pub fn to_xml(&self) -> String {
        self.serialize(self.root)
    }

    /// Serialize a subtree.
    pub fn serialize(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => out.push_str(&escape(t.as_str())),
            NodeKind::Element { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(v));
                    out.push('"');
                }
                if self.nodes[id].children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for &c in &self.nodes[id].children {
                        self.write_node(c, out);
                    }
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
        }
    }
}

fn escape_attr(value: &str) -> String {
    // escape() covers & < > ' " -- more than attributes strictly need, but
    // unescape() reverses it exactly, which keeps round-trips stable.
    escape(value).into_owned()
}

fn push_element(
    nodes: &mut Vec<Node>,
    stack: &mut [NodeId],
    root: &mut Option<NodeId>,
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<NodeId> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| EngineError::xml("XML", err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = unescape(&String::from_utf8_lossy(&attr.value))
            .map_err(|err| EngineError::xml("XML", err.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }

    let parent = stack.last().copied();
    let id = nodes.len();
    nodes.push(Node {
        parent,
        children: Vec::new(),
        kind: NodeKind::Element { name, attrs },
    });

    match parent {
        Some(p) => nodes[p].children.push(id),
        None => {
            if root.is_some() {
                return Err(EngineError::xml("XML", "multiple root elements"));
            }
            *root = Some(id);
        }
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_navigate() {
        let doc = Document::parse(
            r#"<workflow group="g"><subjobs><job name="a"><tasks><task path="/bin/true"/></tasks></job></subjobs></workflow>"#,
        )
        .unwrap();

        let root = doc.root();
        assert_eq!(doc.name(root), Some("workflow"));
        assert_eq!(doc.attr(root, "group"), Some("g"));

        let subjobs = doc.first_child_named(root, "subjobs").unwrap();
        let jobs = doc.children_named(subjobs, "job");
        assert_eq!(jobs.len(), 1);
        assert_eq!(doc.attr(jobs[0], "name"), Some("a"));

        let tasks = doc.first_child_named(jobs[0], "tasks").unwrap();
        let task = doc.first_child_named(tasks, "task").unwrap();
        assert_eq!(doc.attr(task, "path"), Some("/bin/true"));
    }

    #[test]
    fn text_content_is_unescaped() {
        let doc = Document::parse("<a>one &amp; two</a>").unwrap();
        assert_eq!(doc.text(doc.root()), "one & two");
    }

    #[test]
    fn serialize_round_trip_is_stable() {
        let input = r#"<workflow group="g &amp; h"><job><tasks><task path="/bin/echo">hi &lt;there&gt;</task></tasks></job></workflow>"#;
        let doc = Document::parse(input).unwrap();
        let once = doc.to_xml();
        let doc2 = Document::parse(&once).unwrap();
        let twice = doc2.to_xml();
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_elements_self_close() {
        let mut doc = Document::new("root");
        doc.append_element(doc.root(), "leaf");
        assert_eq!(doc.to_xml(), "<root><leaf/></root>");
    }

    #[test]
    fn set_attr_replaces() {
        let mut doc = Document::new("root");
        doc.set_attr(doc.root(), "status", "QUEUED");
        doc.set_attr(doc.root(), "status", "EXECUTING");
        assert_eq!(doc.attr(doc.root(), "status"), Some("EXECUTING"));
        assert_eq!(doc.attrs(doc.root()).len(), 1);
    }

    #[test]
    fn clone_subtree_copies_deeply_at_index() {
        let mut doc =
            Document::parse(r#"<r><a x="1"><b>t</b></a><c/></r>"#).unwrap();
        let root = doc.root();
        let a = doc.first_child_named(root, "a").unwrap();
        let idx = doc.child_index(a).unwrap();
        let clone = doc.clone_subtree(a, root, idx + 1);

        assert_eq!(doc.attr(clone, "x"), Some("1"));
        assert_eq!(doc.text(clone), "t");
        // Order: a, clone, c.
        let names: Vec<_> = doc
            .child_elements(root)
            .into_iter()
            .map(|id| doc.name(id).unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a", "a", "c"]);

        // Mutating the clone leaves the original alone.
        doc.set_attr(clone, "x", "2");
        assert_eq!(doc.attr(a, "x"), Some("1"));
    }

    #[test]
    fn detach_removes_from_parent() {
        let mut doc = Document::parse("<r><a/><b/></r>").unwrap();
        let a = doc.first_child_named(doc.root(), "a").unwrap();
        doc.detach(a);
        assert_eq!(doc.to_xml(), "<r><b/></r>");
    }

    #[test]
    fn import_subtree_across_documents() {
        let src = Document::parse(r#"<t><job name="j"><tasks><task path="p"/></tasks></job></t>"#)
            .unwrap();
        let job = src.first_child_named(src.root(), "job").unwrap();

        let mut dst = Document::new("savepoint");
        let imported = dst.import_subtree(&src, job, dst.root());
        assert_eq!(dst.name(imported), Some("job"));
        assert_eq!(
            dst.to_xml(),
            r#"<savepoint><job name="j"><tasks><task path="p"/></tasks></job></savepoint>"#
        );
    }

    #[test]
    fn multiple_roots_rejected() {
        assert!(Document::parse("<a/><b/>").is_err());
    }

    #[test]
    fn malformed_rejected() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("not xml at all").is_err());
    }

    #[test]
    fn whitespace_text_preserved() {
        let input = "<a>\n  <b/>\n</a>";
        let doc = Document::parse(input).unwrap();
        assert_eq!(doc.to_xml(), input);
    }
}
