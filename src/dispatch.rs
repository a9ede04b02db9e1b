//! Event dispatch: routes tree events to handler attributes and turns them
//! into update triggers.
//!
//! Handlers are declared as `stitch-<event>` attributes carrying the server
//! side event id, with an optional `stitch-<event>-payload` attribute as a
//! JSON payload template. An event dispatched at a target walks up the tree
//! to the nearest node carrying a handler for that event name, then hands the
//! trigger to the innermost enclosing scope willing to intercept it.

use std::time::Duration;

use hashbrown::HashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
	diff,
	dom::{Dom, NodeId},
	lifecycle::{clear_chain_above, Coordinator, Disable, Trigger},
	protocol::{
		clear_fingerprints_to_scope, FollowUp, Payload, Transport, BOUNDARY_TAG,
	},
	registry::OrphanPool,
	Error,
};

/// Prefix of handler attributes (`stitch-click`, `stitch-input`, ...).
pub const HANDLER_PREFIX: &str = "stitch-";
/// Synthetic event carrying a server-requested follow-up.
pub const FIRE_EVENT: &str = "stitch-fire";

/// Placeholder in payload templates replaced with the control's live value.
const VALUE_PLACEHOLDER: &str = "_##InputValue";
/// Placeholder (with its surrounding quotes) replaced with the control's
/// checked state as a bare boolean.
const CHECKED_PLACEHOLDER: &str = "\"_##InputChecked\"";

/// One event observed on the tree.
#[derive(Debug, Clone)]
pub struct DomEvent {
	pub name: String,
	pub target: NodeId,
	/// Set on synthetic [`FIRE_EVENT`]s; carries the event id and payload
	/// directly instead of reading them off handler attributes.
	pub detail: Option<FollowUp>,
}

impl DomEvent {
	#[must_use]
	pub fn new(name: impl Into<String>, target: NodeId) -> Self {
		Self { name: name.into(), target, detail: None }
	}

	#[must_use]
	pub fn fire(target: NodeId, event_id: impl Into<String>, payload: Value) -> Self {
		Self {
			name: FIRE_EVENT.to_string(),
			target,
			detail: Some(FollowUp { event_id: event_id.into(), payload }),
		}
	}
}

/// How the payload of a trigger is derived from the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadSource {
	/// `stitch-<event>-payload` parsed as JSON (or the event detail).
	Attr,
	/// Payload template with the control's live value and checked state
	/// substituted for the placeholders.
	Template,
	/// The handler node is a form; serialize its controls.
	Form,
}

/// Per-event-name interception policy.
#[derive(Debug, Clone)]
struct Policy {
	payload: PayloadSource,
	/// Disable the triggering control while the request is in flight.
	disable: bool,
	/// Clear fingerprints from the handler node through its scope root, so
	/// the server response can override control state.
	dirty: bool,
	debounce: Option<Duration>,
}

/// The events the runtime listens for, with their policies. Scope roots do
/// not subscribe individually; interception is resolved against the live
/// tree at dispatch time, so freshly patched-in scopes need no registration
/// step.
#[derive(Debug)]
pub struct ListenerRegistry {
	policies: HashMap<String, Policy>,
}

impl ListenerRegistry {
	/// The standard listener set: pointer, form and animation events plus
	/// the synthetic follow-up event.
	#[must_use]
	pub fn standard() -> Self {
		let mut policies = HashMap::new();
		policies.insert(
			"click".to_string(),
			Policy { payload: PayloadSource::Attr, disable: true, dirty: false, debounce: None },
		);
		policies.insert(
			"change".to_string(),
			Policy { payload: PayloadSource::Template, disable: false, dirty: true, debounce: None },
		);
		policies.insert(
			"input".to_string(),
			Policy {
				payload: PayloadSource::Template,
				disable: false,
				dirty: true,
				debounce: Some(Duration::from_millis(500)),
			},
		);
		policies.insert(
			"submit".to_string(),
			Policy { payload: PayloadSource::Form, disable: false, dirty: false, debounce: None },
		);
		policies.insert(
			"transitionend".to_string(),
			Policy { payload: PayloadSource::Attr, disable: false, dirty: false, debounce: None },
		);
		policies.insert(
			"animationend".to_string(),
			Policy { payload: PayloadSource::Attr, disable: false, dirty: false, debounce: None },
		);
		policies.insert(
			FIRE_EVENT.to_string(),
			Policy { payload: PayloadSource::Attr, disable: false, dirty: false, debounce: None },
		);
		Self { policies }
	}

	fn policy(&self, event: &str) -> Option<&Policy> {
		self.policies.get(event)
	}
}

impl Default for ListenerRegistry {
	fn default() -> Self {
		Self::standard()
	}
}

/// Routes events to handlers and drives the resulting updates, following up
/// on server-requested events until the chain settles.
pub struct Dispatcher<T: Transport> {
	coordinator: Coordinator<T>,
	registry: ListenerRegistry,
}

impl<T: Transport> Dispatcher<T> {
	#[must_use]
	pub fn new(coordinator: Coordinator<T>) -> Self {
		Self { coordinator, registry: ListenerRegistry::standard() }
	}

	#[must_use]
	pub fn coordinator(&self) -> &Coordinator<T> {
		&self.coordinator
	}

	/// Dispatches one event. Unhandled events and events whose update was
	/// superseded resolve to `Ok(())`; transport and protocol failures
	/// surface as errors.
	pub async fn dispatch(&self, event: DomEvent) -> Result<(), Error> {
		let mut event = event;
		loop {
			let Some(outcome) = self.dispatch_once(&event).await? else {
				return Ok(());
			};
			let (scope, follow_up) = outcome;
			debug!(event_id = %follow_up.event_id, "dispatching follow-up event");
			event = DomEvent {
				name: FIRE_EVENT.to_string(),
				target: scope,
				detail: Some(follow_up),
			};
		}
	}

	/// Runs one dispatch round; returns the scope and follow-up event when
	/// the server requested another round.
	async fn dispatch_once(&self, event: &DomEvent) -> Result<Option<(NodeId, FollowUp)>, Error> {
		let Some(policy) = self.registry.policy(&event.name).cloned() else {
			trace!(event = %event.name, "no listener for event");
			return Ok(None);
		};

		let prepared = {
			let mut dom = self.coordinator.dom().borrow_mut();
			self.prepare(&mut dom, event, &policy)?
		};
		let Some(Prepared { scope, event_id, payload, disable }) = prepared else {
			return Ok(None);
		};

		if self.apply_prerendered(scope, &event_id, &payload, &policy)? {
			return Ok(None);
		}

		let trigger = Trigger { event_id, payload, debounce: policy.debounce, disable };
		match self.coordinator.trigger(scope, trigger).await {
			Ok(follow_up) => Ok(follow_up.map(|follow_up| (scope, follow_up))),
			Err(Error::Cancelled) => Ok(None),
			Err(error) => Err(error),
		}
	}

	/// Resolves the handler node, intercepting scope, event id and payload
	/// for an event, applying the policy's tree side effects along the way.
	fn prepare(
		&self,
		dom: &mut Dom,
		event: &DomEvent,
		policy: &Policy,
	) -> Result<Option<Prepared>, Error> {
		let Some((node, event_id)) = handler_for(dom, event) else {
			trace!(event = %event.name, target = ?event.target, "no handler found");
			return Ok(None);
		};

		let scope = intercepting_scope(dom, node, &event_id);

		// The scope's own view may change because of this event; clear its
		// fingerprint chain so an enclosing patch cannot skip over it.
		if dom.tag_name(scope) == Some(BOUNDARY_TAG) {
			clear_chain_above(dom, scope);
		}

		if policy.disable && dom.element(node).is_some_and(|element| element.disabled) {
			trace!(?node, "ignoring event on disabled control");
			return Ok(None);
		}

		if policy.dirty {
			clear_fingerprints_to_scope(dom, node);
		}

		if event.name == "click" {
			apply_default_toggle(dom, node);
		}

		let payload = match policy.payload {
			PayloadSource::Form => Payload::Form(serialize_form(dom, node)),
			PayloadSource::Template => Payload::Json(template_payload(dom, node, &event.name)?),
			PayloadSource::Attr => match &event.detail {
				Some(detail) => Payload::Json(detail.payload.clone()),
				None => Payload::Json(attr_payload(dom, node, &event.name)?),
			},
		};

		let disable = if policy.payload == PayloadSource::Form {
			Disable::Form(form_controls(dom, node))
		} else if policy.disable {
			Disable::Control(node)
		} else {
			Disable::None
		};

		Ok(Some(Prepared { scope, event_id, payload, disable }))
	}

	/// Applies a prerendered variant of the scope when one matches the event,
	/// skipping the server round trip. Variants are trailing `<template>`
	/// children of the scope root carrying `event-id` and `event-payload`
	/// attributes.
	fn apply_prerendered(
		&self,
		scope: NodeId,
		event_id: &str,
		payload: &Payload,
		policy: &Policy,
	) -> Result<bool, Error> {
		if policy.payload == PayloadSource::Form {
			return Ok(false);
		}
		let mut dom = self.coordinator.dom().borrow_mut();
		if dom.tag_name(scope) != Some(BOUNDARY_TAG) {
			return Ok(false);
		}

		let mut templates = Vec::new();
		let mut cursor = dom.last_child(scope);
		while let Some(id) = cursor {
			if dom.tag_name(id) == Some("template")
				&& dom.attr(id, "event-id").is_some()
				&& dom.attr(id, "event-payload").is_some()
			{
				templates.push(id);
				cursor = dom.prev_sibling(id);
			} else {
				break;
			}
		}
		if templates.is_empty() {
			return Ok(false);
		}

		let Payload::Json(payload) = payload else {
			return Ok(false);
		};
		let payload_str = payload.to_string();
		let matched = templates.iter().copied().find(|id| {
			dom.attr(*id, "event-id") == Some(event_id)
				&& dom.attr(*id, "event-payload") == Some(payload_str.as_str())
		});
		let Some(template) = matched else {
			return Ok(false);
		};

		debug!(?scope, %event_id, "applying prerendered variant");
		dom.remove_node(template);
		let mut orphans = OrphanPool::new();
		diff::patch_children(&mut dom, scope, template, &mut orphans, None)?;
		// The other templates were trailing children the patch removed; put
		// the whole set back for later events.
		for id in templates.iter().rev() {
			dom.append_child(scope, *id);
		}
		Ok(true)
	}
}

struct Prepared {
	scope: NodeId,
	event_id: String,
	payload: Payload,
	disable: Disable,
}

/// Walks from the event target upward to the first node carrying a handler
/// for the event. Synthetic events carry their id in the detail and resolve
/// at the target itself.
fn handler_for(dom: &Dom, event: &DomEvent) -> Option<(NodeId, String)> {
	if let Some(detail) = &event.detail {
		return Some((event.target, detail.event_id.clone()));
	}
	let attr_name = format!("{HANDLER_PREFIX}{}", event.name);
	dom.ancestors_inclusive(event.target).find_map(|id| {
		dom.attr(id, &attr_name).map(|event_id| (id, event_id.to_string()))
	})
}

/// The innermost scope that intercepts `event_id`, walking outward past
/// scopes whose `events` allow-list rejects it. A rejecting scope still has
/// its fingerprint chain cleared, since the event hints that its view is
/// stale. The page scope (body) intercepts everything.
fn intercepting_scope(dom: &mut Dom, node: NodeId, event_id: &str) -> NodeId {
	let mut cursor = Some(node);
	while let Some(id) = cursor {
		if dom.tag_name(id) == Some(BOUNDARY_TAG) {
			if scope_accepts(dom, id, event_id) {
				return id;
			}
			trace!(scope = ?id, %event_id, "scope allow-list rejects event, deferring outward");
			clear_chain_above(dom, id);
		}
		cursor = dom.parent(id);
	}
	dom.body()
}

/// A scope's `events` attribute is a comma-separated allow-list of event
/// ids; missing or empty means it intercepts everything.
fn scope_accepts(dom: &Dom, scope: NodeId, event_id: &str) -> bool {
	match dom.attr(scope, "events") {
		None | Some("") => true,
		Some(list) => list.split(',').any(|entry| entry == event_id),
	}
}

/// Native default action of a click in this tree model: checkboxes toggle,
/// radios check themselves and clear the rest of their group.
fn apply_default_toggle(dom: &mut Dom, node: NodeId) {
	let Some(element) = dom.element(node) else { return };
	if element.tag() != "input" {
		return;
	}
	let input_type = element.input_type().to_string();
	let name = element.attr("name").map(str::to_string);
	match input_type.as_str() {
		"checkbox" => {
			dom.set_property(node, |element| element.checked = !element.checked);
		}
		"radio" => {
			let group_root = dom
				.ancestors_inclusive(node)
				.find(|id| dom.tag_name(*id) == Some("form"))
				.unwrap_or_else(|| dom.body());
			if let Some(name) = name {
				let group: Vec<NodeId> = dom
					.descendants(group_root)
					.filter(|id| {
						*id != node
							&& dom.element(*id).is_some_and(|element| {
								element.tag() == "input"
									&& element.input_type() == "radio"
									&& element.attr("name") == Some(name.as_str())
							})
					})
					.collect();
				for id in group {
					dom.set_property(id, |element| element.checked = false);
				}
			}
			dom.set_property(node, |element| element.checked = true);
		}
		_ => {}
	}
}

/// Reads `stitch-<event>-payload` and parses it as JSON. A handler without a
/// payload attribute sends `null`.
fn attr_payload(dom: &Dom, node: NodeId, event: &str) -> Result<Value, Error> {
	let attr_name = format!("{HANDLER_PREFIX}{event}-payload");
	match dom.attr(node, &attr_name) {
		Some(raw) => serde_json::from_str(raw).map_err(|error| Error::Parse(error.to_string())),
		None => Ok(Value::Null),
	}
}

/// Substitutes the control's live value and checked state into the payload
/// template, then parses it. The value lands as JSON string content, the
/// checked placeholder (quotes included) becomes a bare boolean.
fn template_payload(dom: &Dom, node: NodeId, event: &str) -> Result<Value, Error> {
	let attr_name = format!("{HANDLER_PREFIX}{event}-payload");
	let Some(template) = dom.attr(node, &attr_name) else {
		return Ok(Value::Null);
	};
	let element = dom.element(node);
	let value = element.map(|element| element.value.as_str()).unwrap_or_default();
	let checked = element.is_some_and(|element| element.checked);

	let escaped = serde_json::to_string(value).map_err(|error| Error::Parse(error.to_string()))?;
	let escaped = &escaped[1..escaped.len() - 1];
	let substituted = template
		.replacen(VALUE_PLACEHOLDER, escaped, 1)
		.replacen(CHECKED_PLACEHOLDER, if checked { "true" } else { "false" }, 1);
	serde_json::from_str(&substituted).map_err(|error| Error::Parse(error.to_string()))
}

/// Successful controls of a form in tree order: named, enabled, and for
/// checkboxes and radios, checked. Buttons never serialize.
fn serialize_form(dom: &Dom, form: NodeId) -> Vec<(String, String)> {
	let mut fields = Vec::new();
	for id in dom.descendants(form) {
		let Some(element) = dom.element(id) else { continue };
		let Some(name) = element.attr("name") else { continue };
		if element.disabled {
			continue;
		}
		match element.tag() {
			"input" => match element.input_type() {
				"submit" | "button" | "reset" | "image" | "file" => {}
				"checkbox" | "radio" => {
					if element.checked {
						let value = element.attr("value").unwrap_or("on");
						fields.push((name.to_string(), value.to_string()));
					}
				}
				_ => fields.push((name.to_string(), element.value.clone())),
			},
			"textarea" | "select" => fields.push((name.to_string(), element.value.clone())),
			_ => {}
		}
	}
	fields
}

/// All controls of a form, for whole-form disabling during submission.
fn form_controls(dom: &Dom, form: NodeId) -> Vec<NodeId> {
	dom.descendants(form)
		.filter(|id| {
			matches!(
				dom.tag_name(*id),
				Some("input" | "textarea" | "select" | "button"),
			)
		})
		.collect()
}
