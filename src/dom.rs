//! Arena-backed live document tree.
//!
//! The whole engine works over one [`Dom`] arena: the mounted document, parsed
//! replacement fragments, and detached orphans all live in the same `Vec` of
//! nodes, so moving a node between trees is a cheap re-parenting operation and
//! a [`NodeId`] stays valid (and identical) for the life of the document. That
//! stability is what preserves keyed-element identity, focus, and form state
//! across reconciliation passes.
//!
//! Node slots are never reused. Detached subtrees that nothing references
//! anymore simply stay behind as garbage, which matches the lifetime of the
//! orphan pool: anything left over after a patch pass is dropped with it.

use core::fmt::Write as _;

/// Stable handle to a node in a [`Dom`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub enum NodeKind {
	Document,
	Element(Element),
	Text(String),
	Comment(String),
}

/// An element's declared attributes plus the live properties that can diverge
/// from them (user-edited input value vs. attribute default, etc.).
///
/// Attributes keep their document order so serialization is deterministic;
/// lookups are linear, which is fine at attribute-list sizes.
#[derive(Debug, Clone)]
pub struct Element {
	tag: String,
	attrs: Vec<(String, String)>,
	/// Live `value` property of form controls.
	pub value: String,
	pub checked: bool,
	pub selected: bool,
	pub disabled: bool,
	pub readonly: bool,
	/// Live open/closed state of a `<dialog>`.
	pub open: bool,
}

impl Element {
	fn new(tag: String, attrs: Vec<(String, String)>) -> Self {
		let value = attrs.iter().find(|(n, _)| n == "value").map(|(_, v)| v.clone()).unwrap_or_default();
		let has = |name: &str| attrs.iter().any(|(n, _)| n == name);
		Self {
			value,
			checked: has("checked"),
			selected: has("selected"),
			disabled: has("disabled"),
			readonly: has("readonly"),
			open: has("open"),
			tag,
			attrs,
		}
	}

	#[must_use]
	pub fn tag(&self) -> &str {
		&self.tag
	}

	#[must_use]
	pub fn attr(&self, name: &str) -> Option<&str> {
		self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	#[must_use]
	pub fn has_attr(&self, name: &str) -> bool {
		self.attrs.iter().any(|(n, _)| n == name)
	}

	pub fn attr_names(&self) -> impl Iterator<Item = &str> {
		self.attrs.iter().map(|(n, _)| n.as_str())
	}

	/// `type` attribute, for input-kind checks.
	#[must_use]
	pub fn input_type(&self) -> &str {
		self.attr("type").unwrap_or("text")
	}
}

#[derive(Debug)]
struct Node {
	parent: Option<NodeId>,
	children: Vec<NodeId>,
	kind: NodeKind,
}

/// The live document: node arena plus the page-level state the update
/// lifecycle mutates (URL, title, history, focus).
#[derive(Debug)]
pub struct Dom {
	nodes: Vec<Node>,
	root: NodeId,
	body: NodeId,
	mutations: u64,
	active_element: Option<NodeId>,
	url: String,
	title: String,
	history: Vec<String>,
}

impl Dom {
	/// An empty document with a `<body>` scope root, located at `url`.
	#[must_use]
	pub fn new(url: &str) -> Self {
		let mut dom = Self {
			nodes: vec![Node {
				parent: None,
				children: Vec::new(),
				kind: NodeKind::Document,
			}],
			root: NodeId(0),
			body: NodeId(0),
			mutations: 0,
			active_element: None,
			url: url.to_string(),
			title: String::new(),
			history: Vec::new(),
		};
		let body = dom.create_element("body", Vec::new());
		dom.attach(dom.root, body, None);
		dom.body = body;
		dom.mutations = 0;
		dom
	}

	#[must_use]
	pub fn root(&self) -> NodeId {
		self.root
	}

	#[must_use]
	pub fn body(&self) -> NodeId {
		self.body
	}

	fn node(&self, id: NodeId) -> &Node {
		&self.nodes[id.0]
	}

	fn node_mut(&mut self, id: NodeId) -> &mut Node {
		&mut self.nodes[id.0]
	}

	#[must_use]
	pub fn kind(&self, id: NodeId) -> &NodeKind {
		&self.node(id).kind
	}

	#[must_use]
	pub fn element(&self, id: NodeId) -> Option<&Element> {
		match &self.node(id).kind {
			NodeKind::Element(element) => Some(element),
			_ => None,
		}
	}

	pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
		match &mut self.node_mut(id).kind {
			NodeKind::Element(element) => Some(element),
			_ => None,
		}
	}

	#[must_use]
	pub fn tag_name(&self, id: NodeId) -> Option<&str> {
		self.element(id).map(Element::tag)
	}

	#[must_use]
	pub fn is_element(&self, id: NodeId, tag: &str) -> bool {
		self.tag_name(id) == Some(tag)
	}

	#[must_use]
	pub fn text(&self, id: NodeId) -> Option<&str> {
		match &self.node(id).kind {
			NodeKind::Text(text) => Some(text),
			_ => None,
		}
	}

	// --- creation (all nodes start detached) ---

	pub fn create_element(&mut self, tag: &str, attrs: Vec<(String, String)>) -> NodeId {
		self.push(NodeKind::Element(Element::new(tag.to_ascii_lowercase(), attrs)))
	}

	pub fn create_text(&mut self, text: &str) -> NodeId {
		self.push(NodeKind::Text(text.to_string()))
	}

	pub fn create_comment(&mut self, text: &str) -> NodeId {
		self.push(NodeKind::Comment(text.to_string()))
	}

	/// A detached, document-kind container node. Parse results land under one
	/// of these and are consumed piecewise by the reconciler.
	pub fn create_fragment(&mut self) -> NodeId {
		self.push(NodeKind::Document)
	}

	fn push(&mut self, kind: NodeKind) -> NodeId {
		let id = NodeId(self.nodes.len());
		self.nodes.push(Node {
			parent: None,
			children: Vec::new(),
			kind,
		});
		id
	}

	// --- structure ---

	#[must_use]
	pub fn parent(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).parent
	}

	#[must_use]
	pub fn children(&self, id: NodeId) -> &[NodeId] {
		&self.node(id).children
	}

	#[must_use]
	pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).children.first().copied()
	}

	#[must_use]
	pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).children.last().copied()
	}

	#[must_use]
	pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
		let parent = self.node(id).parent?;
		let siblings = &self.node(parent).children;
		let index = siblings.iter().position(|c| *c == id)?;
		siblings.get(index + 1).copied()
	}

	#[must_use]
	pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
		let parent = self.node(id).parent?;
		let siblings = &self.node(parent).children;
		let index = siblings.iter().position(|c| *c == id)?;
		index.checked_sub(1).and_then(|i| siblings.get(i)).copied()
	}

	/// Whether `id` is reachable from the document root.
	#[must_use]
	pub fn is_attached(&self, id: NodeId) -> bool {
		let mut cursor = id;
		loop {
			if cursor == self.root {
				return true;
			}
			match self.node(cursor).parent {
				Some(parent) => cursor = parent,
				None => return false,
			}
		}
	}

	#[must_use]
	pub fn is_descendant_of(&self, id: NodeId, ancestor: NodeId) -> bool {
		let mut cursor = self.node(id).parent;
		while let Some(current) = cursor {
			if current == ancestor {
				return true;
			}
			cursor = self.node(current).parent;
		}
		false
	}

	fn attach(&mut self, parent: NodeId, child: NodeId, before: Option<NodeId>) {
		debug_assert_ne!(parent, child);
		self.detach(child);
		let index = match before {
			Some(reference) => self
				.node(parent)
				.children
				.iter()
				.position(|c| *c == reference)
				.unwrap_or_else(|| self.node(parent).children.len()),
			None => self.node(parent).children.len(),
		};
		self.node_mut(parent).children.insert(index, child);
		self.node_mut(child).parent = Some(parent);
		self.bump(parent);
	}

	/// Counts a mutation if it is observable on the mounted tree. Writes to
	/// detached fragments and orphans are invisible, like they would be to a
	/// mutation observer on the document.
	fn bump(&mut self, at: NodeId) {
		if self.is_attached(at) {
			self.mutations += 1;
		}
	}

	fn detach(&mut self, id: NodeId) {
		if let Some(parent) = self.node_mut(id).parent.take() {
			self.node_mut(parent).children.retain(|c| *c != id);
		}
	}

	/// Appends `child` as the last child of `parent`, detaching it from its
	/// current parent first.
	pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
		self.attach(parent, child, None);
	}

	/// Inserts `child` into `parent` immediately before `reference`.
	pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: NodeId) {
		self.attach(parent, child, Some(reference));
	}

	/// Detaches `id` from its parent. The node and its subtree stay in the
	/// arena and may be reattached later (keyed reuse).
	pub fn remove_node(&mut self, id: NodeId) {
		if self.node(id).parent.is_some() {
			self.bump(id);
		}
		self.detach(id);
	}

	/// Replaces `old` with `new` in `old`'s parent. `old` is left detached.
	pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
		if let Some(parent) = self.node(old).parent {
			self.attach(parent, new, Some(old));
			self.detach(old);
		}
	}

	// --- attributes, text, properties ---

	#[must_use]
	pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
		self.element(id).and_then(|e| e.attr(name))
	}

	pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
		let Some(element) = self.element_mut(id) else { return };
		match element.attrs.iter_mut().find(|(n, _)| n == name) {
			Some((_, v)) => *v = value.to_string(),
			None => element.attrs.push((name.to_string(), value.to_string())),
		}
		self.bump(id);
	}

	pub fn remove_attr(&mut self, id: NodeId, name: &str) {
		let Some(element) = self.element_mut(id) else { return };
		let before = element.attrs.len();
		element.attrs.retain(|(n, _)| n != name);
		if element.attrs.len() != before {
			self.bump(id);
		}
	}

	pub fn set_text(&mut self, id: NodeId, text: &str) {
		if let NodeKind::Text(t) = &mut self.node_mut(id).kind {
			*t = text.to_string();
			self.bump(id);
		}
	}

	/// Writes a live form-control property. Bumps the mutation counter, so
	/// callers compare before writing.
	pub fn set_property(&mut self, id: NodeId, write: impl FnOnce(&mut Element)) {
		if let Some(element) = self.element_mut(id) {
			write(element);
			self.bump(id);
		}
	}

	// --- queries ---

	/// Depth-first search over the *attached* tree for an element with the
	/// given `id` attribute. Detached fragments and orphans are not visible
	/// here; that is what the orphan pool is for.
	#[must_use]
	pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
		self.descendants(self.root).find(|n| self.attr(*n, "id") == Some(id))
	}

	/// All descendants of `id` in document order, excluding `id` itself.
	pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
		Descendants {
			dom: self,
			stack: self.node(id).children.iter().rev().copied().collect(),
		}
	}

	/// `id` followed by its ancestors up to the document root.
	pub fn ancestors_inclusive(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
		let mut cursor = Some(id);
		core::iter::from_fn(move || {
			let current = cursor?;
			cursor = self.parent(current);
			Some(current)
		})
	}

	// --- page state ---

	#[must_use]
	pub fn mutation_count(&self) -> u64 {
		self.mutations
	}

	#[must_use]
	pub fn active_element(&self) -> Option<NodeId> {
		self.active_element
	}

	pub fn set_active_element(&mut self, id: Option<NodeId>) {
		self.active_element = id;
	}

	#[must_use]
	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn set_url(&mut self, url: &str) {
		self.url = url.to_string();
	}

	#[must_use]
	pub fn title(&self) -> &str {
		&self.title
	}

	pub fn set_title(&mut self, title: &str) {
		self.title = title.to_string();
	}

	#[must_use]
	pub fn history(&self) -> &[String] {
		&self.history
	}

	pub fn push_history(&mut self, url: &str) {
		self.history.push(url.to_string());
		self.url = url.to_string();
	}

	// --- serialization (tests, diagnostics) ---

	/// Serializes the children of `id` back to markup. Live properties are
	/// not reflected; this is the declared-attribute view.
	#[must_use]
	pub fn inner_html(&self, id: NodeId) -> String {
		let mut out = String::new();
		for child in self.children(id) {
			self.write_node(*child, &mut out);
		}
		out
	}

	fn write_node(&self, id: NodeId, out: &mut String) {
		match self.kind(id) {
			NodeKind::Document => {
				for child in self.children(id) {
					self.write_node(*child, out);
				}
			}
			NodeKind::Element(element) => {
				let _ = write!(out, "<{}", element.tag());
				for (name, value) in &element.attrs {
					if value.is_empty() {
						let _ = write!(out, " {name}");
					} else {
						let _ = write!(out, " {name}=\"{value}\"");
					}
				}
				out.push('>');
				if crate::html::is_void_tag(element.tag()) {
					return;
				}
				for child in self.children(id) {
					self.write_node(*child, out);
				}
				let _ = write!(out, "</{}>", element.tag());
			}
			NodeKind::Text(text) => out.push_str(text),
			NodeKind::Comment(text) => {
				let _ = write!(out, "<!--{text}-->");
			}
		}
	}
}

pub struct Descendants<'a> {
	dom: &'a Dom,
	stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
	type Item = NodeId;

	fn next(&mut self) -> Option<NodeId> {
		let next = self.stack.pop()?;
		self.stack.extend(self.dom.children(next).iter().rev().copied());
		Some(next)
	}
}
