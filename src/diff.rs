//! Tree reconciliation: merges a freshly parsed replacement fragment into the
//! live tree in place.
//!
//! The walk is a single forward scan with one cursor per sibling list; there
//! is no edit-distance search. Lookahead is limited to identity lookup for
//! keyed elements, which is what keeps list reordering from degrading into
//! remove-and-recreate. Unchanged subtrees are skipped in O(1) via the
//! content fingerprint attribute.

use crate::{
	dom::{Dom, NodeId, NodeKind},
	lifecycle::RestorationMap,
	protocol::HASH_ATTR,
	registry::{self, keyed_id, OrphanPool},
	Error,
};
use tracing::{trace, trace_span};

/// Mutates `live_parent`'s children in place until they are structurally and
/// attribute-wise equivalent to `replacement_parent`'s children, reusing as
/// many live nodes as possible and preserving keyed-element identity.
///
/// `replacement_parent` is consumed: its children are moved into the live
/// tree or left behind as arena garbage. `orphans` must span one top-level
/// call and all recursive descents. `restore` is the restoration map of the
/// request driving this patch, if any; markup-driven disabled/read-only
/// changes are recorded there instead of overwriting the in-flight state.
pub fn patch_children(dom: &mut Dom, live_parent: NodeId, replacement_parent: NodeId, orphans: &mut OrphanPool, mut restore: Option<&mut RestorationMap>) -> Result<(), Error> {
	let span = trace_span!("patch_children", ?live_parent, ?replacement_parent);
	let _enter = span.enter();

	let mut node_before = dom.first_child(live_parent);
	let mut node_after = dom.first_child(replacement_parent);

	loop {
		let Some(before) = node_before else {
			match node_after {
				// Both cursors exhausted.
				None => return Ok(()),
				// No live siblings remain: bulk-move the whole remaining
				// replacement run, preferring pooled orphans over incoming
				// keyed nodes. Nothing is left to compare against, so the
				// scan ends here.
				Some(after) => {
					trace!("appending remaining replacement run");
					let mut cursor = Some(after);
					while let Some(node) = cursor {
						if matches!(dom.kind(node), NodeKind::Comment(_)) {
							return Err(Error::UnexpectedComment);
						}
						let next = dom.next_sibling(node);
						if let Some(key) = keyed_id(dom, node).map(str::to_string) {
							if let Some(orphan) = orphans.get(&key) {
								trace!(key, "reusing orphan for appended keyed element");
								dom.append_child(live_parent, orphan);
								orphans.remove(&key);
								cursor = next;
								continue;
							}
						}
						dom.append_child(live_parent, node);
						cursor = next;
					}
					return Ok(());
				}
			}
		};

		let Some(after) = node_after else {
			// Trailing live nodes are deletions.
			trace!(?before, "removing trailing live node");
			let next = dom.next_sibling(before);
			stash_if_keyed(dom, orphans, before);
			dom.remove_node(before);
			node_before = next;
			continue;
		};

		// A comment in replacement markup is a rendering defect; reject it
		// here, before this position can splice it into the live tree.
		if matches!(dom.kind(after), NodeKind::Comment(_)) {
			return Err(Error::UnexpectedComment);
		}

		// Defaults: advance both cursors. Overridden where one side defers.
		let mut next_before = dom.next_sibling(before);
		let next_after = dom.next_sibling(after);
		// The live node this position is patched against; replaced when a
		// keyed instance is spliced in front of the cursor.
		let mut current = before;

		let keyed_mismatch = match keyed_id(dom, after) {
			Some(key) => (keyed_id(dom, before) != Some(key)).then(|| key.to_string()),
			None => None,
		};
		if let Some(key) = keyed_mismatch {
			// Hold the live cursor; this position is resolved by identity.
			next_before = Some(before);
			let candidate = registry::resolve(dom, orphans, &key).filter(|c| dom.parent(*c).is_none() || dom.parent(*c) == Some(live_parent));
			match candidate {
				Some(existing) => {
					trace!(key, ?existing, "splicing existing keyed instance into place");
					dom.insert_before(live_parent, existing, before);
					orphans.remove(&key);
					current = existing;
					// Fall through: patch the spliced instance against `after`.
				}
				None => {
					// No reusable instance (or a conflicting simultaneous
					// claim under another parent): plain insert, and leave
					// the live node for the next replacement sibling.
					trace!(key, "inserting new keyed element");
					dom.insert_before(live_parent, after, before);
					node_before = next_before;
					node_after = next_after;
					continue;
				}
			}
		} else if node_kind_differs(dom, before, after) {
			trace!(?before, ?after, "replacing node of different kind");
			stash_if_keyed(dom, orphans, before);
			dom.replace_node(before, after);
			node_before = next_before;
			node_after = next_after;
			continue;
		}

		match dom.kind(after) {
			NodeKind::Element(_) => {
				if fingerprints_match(dom, current, after) {
					trace!(?current, "skipping subtree with unchanged fingerprint");
				} else {
					patch_attributes(dom, current, after, restore.as_deref_mut());
					patch_children(dom, current, after, orphans, restore.as_deref_mut())?;
				}
			}
			NodeKind::Text(text) => {
				if dom.text(current) != Some(text) {
					let text = text.clone();
					dom.set_text(current, &text);
				}
			}
			NodeKind::Comment(_) | NodeKind::Document => {
				// Comments were rejected above; fragment containers never nest
				// below the top level.
				debug_assert!(false, "unreachable replacement node kind");
			}
		}

		node_before = next_before;
		node_after = next_after;
	}
}

fn stash_if_keyed(dom: &Dom, orphans: &mut OrphanPool, node: NodeId) {
	if let Some(key) = keyed_id(dom, node) {
		// Keep it around in case it reappears later in this pass.
		orphans.stash(key.to_string(), node);
	}
}

fn node_kind_differs(dom: &Dom, before: NodeId, after: NodeId) -> bool {
	match (dom.kind(before), dom.kind(after)) {
		(NodeKind::Element(b), NodeKind::Element(a)) => b.tag() != a.tag(),
		(NodeKind::Text(_), NodeKind::Text(_)) | (NodeKind::Comment(_), NodeKind::Comment(_)) => false,
		_ => true,
	}
}

/// Subtrees with an equal content fingerprint are byte-for-byte identical by
/// contract and skipped without descending. Clearing the attribute (dirty
/// marking) makes a match impossible, forcing the descent.
fn fingerprints_match(dom: &Dom, before: NodeId, after: NodeId) -> bool {
	matches!(
		(dom.attr(before, HASH_ATTR), dom.attr(after, HASH_ATTR)),
		(Some(b), Some(a)) if b == a
	)
}

/// Synchronizes declared attributes and the live properties of form-relevant
/// elements from `replacement` onto `live`. Both are elements of the same tag.
pub fn patch_attributes(dom: &mut Dom, live: NodeId, replacement: NodeId, mut restore: Option<&mut RestorationMap>) {
	let span = trace_span!("patch_attributes", ?live);
	let _enter = span.enter();

	let tag = dom.element(live).map(|e| e.tag().to_string()).unwrap_or_default();

	// A dialog's `open` attribute drives an imperative show/close on the live
	// property and is excluded from generic attribute processing entirely.
	if tag == "dialog" {
		let open = dom.element(replacement).is_some_and(|e| e.has_attr("open"));
		if dom.element(live).is_some_and(|e| e.open != open) {
			trace!(open, "toggling dialog");
			dom.set_property(live, |e| e.open = open);
		}
	}

	// Attribute names present on the live element but absent on the
	// replacement are resets, not mere removals: several of them have a live
	// property that can diverge from the attribute default. Control-state
	// names are forced into the set so the reset happens even when only the
	// property ever diverged.
	let mut removed: Vec<String> = match dom.element(live) {
		Some(element) => element.attr_names().map(str::to_string).collect(),
		None => return,
	};
	let mut force = |name: &str| {
		if !removed.iter().any(|n| n == name) {
			removed.push(name.to_string());
		}
	};
	if tag == "input" {
		force("value");
		force("checked");
	}
	if tag == "option" {
		force("selected");
	}
	if matches!(tag.as_str(), "input" | "textarea" | "select" | "button") {
		force("disabled");
	}
	if matches!(tag.as_str(), "input" | "textarea") {
		force("readonly");
	}

	let replacement_attrs: Vec<(String, String)> = match dom.element(replacement) {
		Some(element) => element.attr_names().map(|n| (n.to_string(), element.attr(n).unwrap_or_default().to_string())).collect(),
		None => return,
	};

	for (name, new_value) in &replacement_attrs {
		removed.retain(|n| n != name);
		if ignore_attr(&tag, name) {
			continue;
		}

		match name.as_str() {
			// Presence in markup is compared against the *attribute* (the
			// last-synced default), not the possibly user-edited property:
			// typing is only overwritten when the server changes the default.
			"value" => {
				if dom.attr(live, "value") != Some(new_value) {
					trace!(%new_value, "updating value default");
					dom.set_attr(live, "value", new_value);
					let new_value = new_value.clone();
					dom.set_property(live, |e| e.value = new_value);
				}
			}
			"checked" => {
				let intended = dom.element(replacement).is_some_and(|e| e.checked);
				if dom.element(live).is_some_and(|e| e.checked != intended) {
					dom.set_property(live, |e| e.checked = intended);
				}
				sync_attr(dom, live, name, new_value);
			}
			"selected" => {
				let intended = dom.element(replacement).is_some_and(|e| e.selected);
				if dom.element(live).is_some_and(|e| e.selected != intended) {
					dom.set_property(live, |e| e.selected = intended);
				}
				sync_attr(dom, live, name, new_value);
			}
			// While a request holds controls disabled/read-only, markup-driven
			// changes go into its restoration map and take effect on settle.
			"disabled" => {
				apply_flag(dom, restore.as_deref_mut(), live, Flag::Disabled, true);
				sync_attr(dom, live, name, new_value);
			}
			"readonly" => {
				apply_flag(dom, restore.as_deref_mut(), live, Flag::Readonly, true);
				sync_attr(dom, live, name, new_value);
			}
			_ => sync_attr(dom, live, name, new_value),
		}
	}

	// Reset whatever is left over to its type-appropriate default.
	for name in &removed {
		if ignore_attr(&tag, name) {
			continue;
		}
		match name.as_str() {
			"value" => {
				if dom.element(live).is_some_and(|e| !e.value.is_empty()) {
					dom.set_property(live, |e| e.value.clear());
				}
			}
			"checked" => {
				if dom.element(live).is_some_and(|e| e.checked) {
					dom.set_property(live, |e| e.checked = false);
				}
			}
			"selected" => {
				if dom.element(live).is_some_and(|e| e.selected) {
					dom.set_property(live, |e| e.selected = false);
				}
			}
			"disabled" => apply_flag(dom, restore.as_deref_mut(), live, Flag::Disabled, false),
			"readonly" => apply_flag(dom, restore.as_deref_mut(), live, Flag::Readonly, false),
			_ => {}
		}
		dom.remove_attr(live, name);
	}
}

fn sync_attr(dom: &mut Dom, live: NodeId, name: &str, value: &str) {
	if dom.attr(live, name) != Some(value) {
		trace!(name, value, "updating attribute");
		dom.set_attr(live, name, value);
	}
}

#[derive(Clone, Copy)]
enum Flag {
	Disabled,
	Readonly,
}

fn apply_flag(dom: &mut Dom, restore: Option<&mut RestorationMap>, live: NodeId, flag: Flag, intended: bool) {
	if let Some(map) = restore {
		if map.contains(live) {
			// The in-flight request owns the property until it settles; only
			// the restore-to value changes.
			match flag {
				Flag::Disabled => map.record_disabled(live, intended),
				Flag::Readonly => map.record_readonly(live, intended),
			}
			return;
		}
	}
	let current = dom.element(live).map(|e| match flag {
		Flag::Disabled => e.disabled,
		Flag::Readonly => e.readonly,
	});
	if current.is_some_and(|c| c != intended) {
		dom.set_property(live, |e| match flag {
			Flag::Disabled => e.disabled = intended,
			Flag::Readonly => e.readonly = intended,
		});
	}
}

fn ignore_attr(tag: &str, attr: &str) -> bool {
	tag == "dialog" && attr == "open"
}
