//! Keyed-element identity resolution.
//!
//! A keyed element owns exactly one live instance per id. During a patch pass
//! an instance may be temporarily homeless between removal from one position
//! and reinsertion elsewhere; the [`OrphanPool`] is the holding area for those
//! instances, scoped to one top-level reconciliation call. Whatever is still
//! in the pool when the pass ends is garbage and dropped with it.

use crate::dom::{Dom, NodeId};
use hashbrown::HashMap;

/// Tag of elements carrying a stable cross-position identity.
pub const KEYED_TAG: &str = "stitch-keyed";

/// Detached keyed elements of the current patch pass, by id.
#[derive(Debug, Default)]
pub struct OrphanPool {
	entries: HashMap<String, NodeId>,
}

impl OrphanPool {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn stash(&mut self, key: String, node: NodeId) {
		self.entries.insert(key, node);
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<NodeId> {
		self.entries.get(key).copied()
	}

	pub fn remove(&mut self, key: &str) {
		self.entries.remove(key);
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// The id of `node` if it is a keyed element.
#[must_use]
pub fn keyed_id(dom: &Dom, node: NodeId) -> Option<&str> {
	if dom.is_element(node, KEYED_TAG) {
		dom.attr(node, "id")
	} else {
		None
	}
}

/// Resolves `key` to a live instance: the mounted document first, the orphan
/// pool second. The document deliberately wins when both match, so an id that
/// is simultaneously mounted and orphaned reuses the mounted instance and the
/// orphan is left to be dropped with the pool.
///
/// Lookup is document-wide on purpose: a keyed element may relocate across
/// distant parts of the tree within one pass. The caller decides whether the
/// candidate's current parent permits the splice.
#[must_use]
pub fn resolve(dom: &Dom, orphans: &OrphanPool, key: &str) -> Option<NodeId> {
	dom.element_by_id(key).or_else(|| orphans.get(key))
}
