//! Request lifecycle: one in-flight update per scope, with supersession,
//! debouncing and control restoration.
//!
//! Each scope root owns at most one pending update. Triggering a new update
//! for a scope cancels the pending one and synchronously restores whatever
//! controls it had disabled, so the new update captures the true pre-request
//! state. The cancelled task observes its token at the next suspension point
//! and exits without touching the tree.

use std::{cell::Cell, cell::RefCell, rc::Rc, time::Duration};

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::{
	cancellation::{CancellationSource, CancellationToken},
	diff,
	dom::{Dom, NodeId},
	html,
	protocol::{
		self, classify, endpoint_for, FollowUp, Payload, RenderRequest, RenderResponse, Transport,
		BOUNDARY_TAG, HASH_ATTR,
	},
	registry::OrphanPool,
	Error,
};

/// Prior control state captured before a request disables controls, keyed by
/// node. Restoration drains the map, so restoring twice is a no-op; that is
/// what makes supersession safe to restore eagerly.
#[derive(Debug, Default)]
pub struct RestorationMap {
	entries: HashMap<NodeId, Restore>,
}

#[derive(Debug, Clone, Copy)]
struct Restore {
	disabled: bool,
	readonly: bool,
}

impl RestorationMap {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn contains(&self, id: NodeId) -> bool {
		self.entries.contains_key(&id)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Disables a control for the duration of a request, capturing its prior
	/// state for restoration. Capturing twice keeps the first snapshot.
	pub fn disable(&mut self, dom: &mut Dom, id: NodeId) {
		let Some(element) = dom.element(id) else {
			return;
		};
		let prior = Restore { disabled: element.disabled, readonly: element.readonly };
		self.entries.entry(id).or_insert(prior);
		if !prior.disabled {
			dom.set_property(id, |element| element.disabled = true);
		}
	}

	/// Replaces the restore-to disabled state of an already captured control.
	/// Markup that arrives while the request is in flight lands here instead
	/// of on the live property.
	pub fn record_disabled(&mut self, id: NodeId, value: bool) {
		if let Some(restore) = self.entries.get_mut(&id) {
			restore.disabled = value;
		}
	}

	/// Like [`record_disabled`](Self::record_disabled), for `readonly`.
	pub fn record_readonly(&mut self, id: NodeId, value: bool) {
		if let Some(restore) = self.entries.get_mut(&id) {
			restore.readonly = value;
		}
	}

	/// Writes all captured states back and empties the map.
	pub fn restore(&mut self, dom: &mut Dom) {
		for (id, restore) in self.entries.drain() {
			dom.set_property(id, |element| {
				element.disabled = restore.disabled;
				element.readonly = restore.readonly;
			});
		}
	}
}

/// Which controls a trigger disables while its request is in flight.
#[derive(Debug, Clone, Default)]
pub enum Disable {
	#[default]
	None,
	/// The triggering control alone.
	Control(NodeId),
	/// Every control of a submitted form.
	Form(Vec<NodeId>),
}

/// One update to run through a scope.
#[derive(Debug, Clone)]
pub struct Trigger {
	pub event_id: String,
	pub payload: Payload,
	/// Wait this long before sending; a newer trigger for the same scope
	/// cancels the wait.
	pub debounce: Option<Duration>,
	pub disable: Disable,
}

impl Trigger {
	#[must_use]
	pub fn new(event_id: impl Into<String>, payload: Payload) -> Self {
		Self { event_id: event_id.into(), payload, debounce: None, disable: Disable::None }
	}
}

struct Slot {
	source: CancellationSource,
	restore: Rc<RefCell<RestorationMap>>,
	generation: u64,
}

/// Drives updates for all scopes of one page.
pub struct Coordinator<T: Transport> {
	dom: Rc<RefCell<Dom>>,
	transport: T,
	pending: RefCell<HashMap<NodeId, Slot>>,
	generation: Cell<u64>,
}

impl<T: Transport> Coordinator<T> {
	#[must_use]
	pub fn new(dom: Rc<RefCell<Dom>>, transport: T) -> Self {
		Self {
			dom,
			transport,
			pending: RefCell::new(HashMap::new()),
			generation: Cell::new(0),
		}
	}

	#[must_use]
	pub fn dom(&self) -> &Rc<RefCell<Dom>> {
		&self.dom
	}

	#[must_use]
	pub fn has_pending(&self, scope: NodeId) -> bool {
		self.pending.borrow().contains_key(&scope)
	}

	/// Runs one update through `scope`: supersede, debounce, disable, send,
	/// patch, restore. Returns the follow-up event the server requested, if
	/// any; the caller decides whether to dispatch it.
	///
	/// Returns [`Error::Cancelled`] when a newer trigger for the same scope
	/// superseded this one. The superseder already restored this update's
	/// controls; a cancelled call leaves the tree alone.
	pub async fn trigger(&self, scope: NodeId, trigger: Trigger) -> Result<Option<FollowUp>, Error> {
		let (token, restore, generation) = self.open_slot(scope);

		if let Some(delay) = trigger.debounce {
			trace!(?scope, ?delay, "debouncing");
			tokio::time::sleep(delay).await;
			if token.is_cancelled() {
				return Err(Error::Cancelled);
			}
		}

		let request = {
			let mut dom = self.dom.borrow_mut();
			match &trigger.disable {
				Disable::None => {}
				Disable::Control(id) => restore.borrow_mut().disable(&mut dom, *id),
				Disable::Form(controls) => {
					let mut restore = restore.borrow_mut();
					for id in controls {
						restore.disable(&mut dom, *id);
					}
				}
			}
			RenderRequest {
				endpoint: endpoint_for(&dom, scope),
				event_id: trigger.event_id.clone(),
				payload: trigger.payload.clone(),
				state: state_script(&dom, scope),
			}
		};

		debug!(?scope, event_id = %request.event_id, endpoint = %request.endpoint, "sending update");
		let response = match self.transport.send(request, &token).await {
			Ok(response) => response,
			Err(error) => {
				if !token.is_cancelled() {
					self.settle(scope, generation, &restore);
				}
				return Err(error);
			}
		};
		if token.is_cancelled() {
			return Err(Error::Cancelled);
		}

		match classify(&response) {
			Ok(RenderResponse::Redirect { href }) => {
				debug!(%href, "server redirected");
				{
					let mut dom = self.dom.borrow_mut();
					dom.set_url(&href);
					dom.push_history(&href);
				}
				self.settle(scope, generation, &restore);
				Ok(None)
			}
			Ok(RenderResponse::Fire(follow_up)) => {
				debug!(event_id = %follow_up.event_id, "server fired follow-up without markup");
				let attached = self.dom.borrow().is_attached(scope);
				self.settle(scope, generation, &restore);
				Ok(attached.then_some(follow_up))
			}
			Ok(RenderResponse::Markup { html, location, title, follow_up }) => {
				let result = self.apply_markup(scope, &html, location.as_deref(), title.as_deref(), &restore);
				self.settle(scope, generation, &restore);
				result.map(|patched| if patched { follow_up } else { None })
			}
			Err(error) => {
				self.settle(scope, generation, &restore);
				Err(error)
			}
		}
	}

	/// Parses the replacement markup and patches the scope's subtree.
	/// Returns `false` when the scope left the tree while the request was in
	/// flight, in which case nothing is patched.
	fn apply_markup(
		&self,
		scope: NodeId,
		html: &str,
		location: Option<&str>,
		title: Option<&str>,
		restore: &Rc<RefCell<RestorationMap>>,
	) -> Result<bool, Error> {
		let mut dom = self.dom.borrow_mut();
		if !dom.is_attached(scope) {
			debug!(?scope, "scope left the tree while request was in flight");
			return Ok(false);
		}

		let replacement = html::parse_fragment(&mut dom, html)?;
		let mut orphans = OrphanPool::new();
		let mut restore = restore.borrow_mut();
		diff::patch_children(&mut dom, scope, replacement, &mut orphans, Some(&mut restore))?;

		if let Some(location) = location {
			let (path, query) = protocol::split_url(dom.url());
			let current =
				if query.is_empty() { path.to_string() } else { format!("{path}?{query}") };
			if current != location {
				dom.push_history(location);
				dom.set_url(location);
			}
		}
		if let Some(title) = title {
			dom.set_title(title);
		}
		Ok(true)
	}

	/// Clears every scope's fingerprint chain and re-renders the page scope.
	/// Used after history navigation and cache restores, where the server
	/// state may have drifted from the rendered markup.
	pub async fn refresh(&self) -> Result<Option<FollowUp>, Error> {
		{
			let mut dom = self.dom.borrow_mut();
			let scopes: Vec<NodeId> = dom
				.descendants(dom.root())
				.filter(|id| dom.tag_name(*id) == Some(BOUNDARY_TAG))
				.collect();
			for scope in scopes {
				clear_chain_above(&mut dom, scope);
			}
			let body = dom.body();
			dom.remove_attr(body, HASH_ATTR);
		}
		let body = self.dom.borrow().body();
		self.trigger(
			body,
			Trigger::new(protocol::REFRESH_EVENT_ID, Payload::Json(serde_json::json!({}))),
		)
		.await
	}

	/// Claims the scope's pending slot, cancelling and restoring any update
	/// that still holds it.
	fn open_slot(
		&self,
		scope: NodeId,
	) -> (CancellationToken, Rc<RefCell<RestorationMap>>, u64) {
		let generation = self.generation.get() + 1;
		self.generation.set(generation);

		let previous = self.pending.borrow_mut().remove(&scope);
		if let Some(slot) = previous {
			debug!(?scope, "superseding pending update");
			slot.source.cancel();
			slot.restore.borrow_mut().restore(&mut self.dom.borrow_mut());
		}

		let source = CancellationSource::new();
		let token = source.token();
		let restore = Rc::new(RefCell::new(RestorationMap::new()));
		self.pending.borrow_mut().insert(
			scope,
			Slot { source, restore: Rc::clone(&restore), generation },
		);
		(token, restore, generation)
	}

	/// Restores captured controls and releases the slot, unless a newer
	/// update has already claimed it.
	fn settle(&self, scope: NodeId, generation: u64, restore: &Rc<RefCell<RestorationMap>>) {
		restore.borrow_mut().restore(&mut self.dom.borrow_mut());
		let mut pending = self.pending.borrow_mut();
		if pending.get(&scope).is_some_and(|slot| slot.generation == generation) {
			pending.remove(&scope);
		}
	}
}

/// State a scope carries for the server, as the JSON text of a leading
/// `<script type="application/json">` child.
fn state_script(dom: &Dom, scope: NodeId) -> Option<String> {
	let first = dom.first_child(scope)?;
	if dom.tag_name(first) != Some("script")
		|| dom.attr(first, "type") != Some("application/json")
	{
		return None;
	}
	let mut text = String::new();
	for child in dom.children(first) {
		if let Some(chunk) = dom.text(*child) {
			text.push_str(chunk);
		}
	}
	Some(text)
}

/// Clears fingerprints from `scope` upward, stopping below the next
/// enclosing scope root (which clears its own chain).
pub(crate) fn clear_chain_above(dom: &mut Dom, scope: NodeId) {
	let mut cursor = Some(scope);
	while let Some(id) = cursor {
		dom.remove_attr(id, HASH_ATTR);
		cursor = dom
			.parent(id)
			.filter(|parent| dom.tag_name(*parent) != Some(BOUNDARY_TAG));
	}
}
