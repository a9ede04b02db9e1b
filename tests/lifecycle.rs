use std::{
	cell::RefCell,
	collections::VecDeque,
	rc::Rc,
	time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use stitch_dom::{
	dispatch::{Dispatcher, DomEvent},
	dom::{Dom, NodeId},
	html::parse_fragment,
	lifecycle::{Coordinator, Disable, Trigger},
	protocol::{Payload, RawResponse, RenderRequest, Transport},
	registry::OrphanPool,
	CancellationToken, Error,
};

/// Scripted transport: hands out queued responses after a fixed latency and
/// records every request it saw.
#[derive(Clone, Default)]
struct FakeTransport {
	inner: Rc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
	latency: RefCell<Duration>,
	responses: RefCell<VecDeque<RawResponse>>,
	requests: RefCell<Vec<RenderRequest>>,
	fail: RefCell<bool>,
}

impl FakeTransport {
	fn with_latency(latency: Duration) -> Self {
		let transport = Self::default();
		*transport.inner.latency.borrow_mut() = latency;
		transport
	}

	fn respond(&self, response: RawResponse) {
		self.inner.responses.borrow_mut().push_back(response);
	}

	fn respond_markup(&self, html: &str) {
		self.respond(markup(html, &[]));
	}

	fn fail_next(&self) {
		*self.inner.fail.borrow_mut() = true;
	}

	fn requests(&self) -> Vec<RenderRequest> {
		self.inner.requests.borrow().clone()
	}
}

#[async_trait(?Send)]
impl Transport for FakeTransport {
	async fn send(
		&self,
		request: RenderRequest,
		token: &CancellationToken,
	) -> Result<RawResponse, Error> {
		self.inner.requests.borrow_mut().push(request);
		let latency = *self.inner.latency.borrow();
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}
		if token.is_cancelled() {
			return Err(Error::Cancelled);
		}
		if std::mem::take(&mut *self.inner.fail.borrow_mut()) {
			return Err(Error::Transport("connection reset".into()));
		}
		self.inner
			.responses
			.borrow_mut()
			.pop_front()
			.ok_or_else(|| Error::Transport("no scripted response".into()))
	}
}

fn markup(html: &str, headers: &[(&str, &str)]) -> RawResponse {
	RawResponse {
		status: 200,
		final_url: "https://example.com/page".to_string(),
		headers: headers
			.iter()
			.map(|(name, value)| ((*name).to_string(), (*value).to_string()))
			.collect(),
		body: html.to_string(),
	}
}

fn page(html: &str) -> (Rc<RefCell<Dom>>, NodeId) {
	let mut dom = Dom::new("/page");
	let body = dom.body();
	let replacement = parse_fragment(&mut dom, html).unwrap();
	let mut orphans = OrphanPool::new();
	stitch_dom::diff::patch_children(&mut dom, body, replacement, &mut orphans, None).unwrap();
	(Rc::new(RefCell::new(dom)), body)
}

fn find(dom: &Dom, tag: &str) -> NodeId {
	dom.descendants(dom.root()).find(|id| dom.tag_name(*id) == Some(tag)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn newer_trigger_supersedes_the_pending_one() {
	let (dom, body) = page("<input name=\"q\"><p>initial</p>");
	let input = find(&dom.borrow(), "input");
	let transport = FakeTransport::with_latency(Duration::from_millis(100));
	transport.respond_markup("<input name=\"q\"><p>from the second update</p>");
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	let first = async {
		let mut trigger = Trigger::new("1", Payload::Json(json!({})));
		trigger.disable = Disable::Control(input);
		coordinator.trigger(body, trigger).await
	};
	let second = async {
		tokio::time::sleep(Duration::from_millis(10)).await;
		let mut trigger = Trigger::new("2", Payload::Json(json!({})));
		trigger.disable = Disable::Control(input);
		coordinator.trigger(body, trigger).await
	};
	let (first, second) = tokio::join!(first, second);

	assert!(matches!(first, Err(Error::Cancelled)));
	assert!(second.is_ok());
	assert_eq!(transport.requests().len(), 2);
	let dom = dom.borrow();
	assert_eq!(dom.inner_html(body), "<input name=\"q\"><p>from the second update</p>");
	assert!(!dom.element(input).unwrap().disabled);
}

#[tokio::test(start_paused = true)]
async fn debounced_triggers_collapse_into_one_request() {
	let (dom, body) = page("<p>initial</p>");
	let transport = FakeTransport::default();
	transport.respond_markup("<p>done</p>");
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	let debounced = |event_id: &str| {
		let mut trigger = Trigger::new(event_id, Payload::Json(json!({})));
		trigger.debounce = Some(Duration::from_millis(500));
		trigger
	};
	let first = coordinator.trigger(body, debounced("1"));
	let second = async {
		tokio::time::sleep(Duration::from_millis(100)).await;
		coordinator.trigger(body, debounced("2")).await
	};
	let (first, second) = tokio::join!(first, second);

	assert!(matches!(first, Err(Error::Cancelled)));
	assert!(second.is_ok());
	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].event_id, "2");
	assert_eq!(dom.borrow().inner_html(body), "<p>done</p>");
}

#[tokio::test(start_paused = true)]
async fn form_submission_serializes_and_restores_controls() {
	let (dom, body) = page(
		"<form stitch-submit=\"3\"><input name=\"name\" value=\"Alice\"><input type=\"checkbox\" name=\"ok\" checked><button>Go</button></form>",
	);
	let form = find(&dom.borrow(), "form");
	let button = find(&dom.borrow(), "button");
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<form stitch-submit=\"3\"><input name=\"name\" value=\"Alice\"><input type=\"checkbox\" name=\"ok\" checked><button>Go</button></form><div hash=\"9\">Hello Alice</div>",
	);
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("submit", form)).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].event_id, "3");
	assert_eq!(requests[0].headers(), vec![("x-stitch", "boundary")]);
	assert_eq!(
		requests[0].payload,
		Payload::Form(vec![
			("name".to_string(), "Alice".to_string()),
			("ok".to_string(), "on".to_string()),
		]),
	);
	let dom = dom.borrow();
	assert!(dom.inner_html(body).ends_with("<div hash=\"9\">Hello Alice</div>"));
	assert!(!dom.element(button).unwrap().disabled);
	assert_eq!(dom.history(), &[] as &[String]);
	assert_eq!(dom.title(), "");
}

#[tokio::test(start_paused = true)]
async fn transport_failure_restores_and_leaves_the_tree_alone() {
	let (dom, body) = page("<button stitch-click=\"4\">Go</button>");
	let button = find(&dom.borrow(), "button");
	let transport = FakeTransport::default();
	transport.fail_next();
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	let mut trigger = Trigger::new("4", Payload::Json(json!(null)));
	trigger.disable = Disable::Control(button);
	let result = coordinator.trigger(body, trigger).await;

	assert!(matches!(result, Err(Error::Transport(_))));
	let dom = dom.borrow();
	assert_eq!(dom.inner_html(body), "<button stitch-click=\"4\">Go</button>");
	assert!(!dom.element(button).unwrap().disabled);
}

#[tokio::test(start_paused = true)]
async fn redirect_sentinel_navigates_instead_of_patching() {
	let (dom, body) = page("<p>before</p>");
	let transport = FakeTransport::default();
	transport.respond(RawResponse {
		status: 200,
		final_url: "https://example.com/client_redirect?/after-login".to_string(),
		headers: Vec::new(),
		body: String::new(),
	});
	let coordinator = Coordinator::new(Rc::clone(&dom), transport);

	let result = coordinator.trigger(body, Trigger::new("1", Payload::Json(json!({})))).await;

	assert!(matches!(result, Ok(None)));
	let dom = dom.borrow();
	assert_eq!(dom.inner_html(body), "<p>before</p>");
	assert_eq!(dom.url(), "/after-login");
	assert_eq!(dom.history(), &["/after-login".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn location_and_title_headers_update_page_state() {
	let (dom, body) = page("<p>tab one</p>");
	let transport = FakeTransport::default();
	transport.respond(markup(
		"<p>tab two</p>",
		&[("location", "/page?tab=2"), ("x-stitch-title", "Tab two")],
	));
	let coordinator = Coordinator::new(Rc::clone(&dom), transport);

	coordinator.trigger(body, Trigger::new("1", Payload::Json(json!({})))).await.unwrap();

	let dom = dom.borrow();
	assert_eq!(dom.inner_html(body), "<p>tab two</p>");
	assert_eq!(dom.url(), "/page?tab=2");
	assert_eq!(dom.history(), &["/page?tab=2".to_string()]);
	assert_eq!(dom.title(), "Tab two");
}

#[tokio::test(start_paused = true)]
async fn follow_up_headers_drive_another_dispatch() {
	let (dom, body) = page("<p>step 0</p>");
	let transport = FakeTransport::default();
	transport.respond(markup(
		"<p>step 1</p>",
		&[("x-stitch-event", "7"), ("x-stitch-payload", "{\"step\":2}")],
	));
	transport.respond_markup("<p>step 2</p>");
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::fire(body, "1", json!({}))).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[1].event_id, "7");
	assert_eq!(requests[1].json_body(), "{\"eventId\":7,\"payload\":{\"step\":2}}");
	assert_eq!(dom.borrow().inner_html(body), "<p>step 2</p>");
}

#[tokio::test(start_paused = true)]
async fn no_content_fire_dispatches_without_patching() {
	let (dom, body) = page("<button stitch-click=\"4\">Go</button>");
	let button = find(&dom.borrow(), "button");
	let transport = FakeTransport::default();
	transport.respond(RawResponse {
		status: 204,
		final_url: "https://example.com/page".to_string(),
		headers: vec![
			("x-stitch-event".to_string(), "7".to_string()),
			("x-stitch-payload".to_string(), "{\"step\":2}".to_string()),
		],
		body: String::new(),
	});
	transport.respond_markup("<button stitch-click=\"4\">Go</button><p>step 2</p>");
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("click", button)).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[1].event_id, "7");
	assert_eq!(requests[1].json_body(), "{\"eventId\":7,\"payload\":{\"step\":2}}");
	// The first answer carried no markup; only the follow-up patched the tree.
	let dom = dom.borrow();
	assert!(dom.inner_html(body).contains("<p>step 2</p>"));
	assert!(!dom.element(button).unwrap().disabled);
}

#[tokio::test(start_paused = true)]
async fn scope_detached_mid_flight_is_not_patched() {
	let (dom, body) = page("<stitch-boundary name=\"panel\" events=\"\"><p>inside</p></stitch-boundary>");
	let scope = find(&dom.borrow(), "stitch-boundary");
	let transport = FakeTransport::with_latency(Duration::from_millis(100));
	transport.respond_markup("<p>too late</p>");
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	let update = coordinator.trigger(scope, Trigger::new("1", Payload::Json(json!({}))));
	let removal = async {
		tokio::time::sleep(Duration::from_millis(10)).await;
		dom.borrow_mut().remove_node(scope);
	};
	let (update, ()) = tokio::join!(update, removal);

	assert!(matches!(update, Ok(None)));
	assert_eq!(transport.requests()[0].endpoint, "/__boundary/panel");
	assert_eq!(dom.borrow().inner_html(body), "");
}

#[tokio::test(start_paused = true)]
async fn state_script_is_forwarded_verbatim() {
	let (dom, _body) = page(
		"<stitch-boundary name=\"counter\" events=\"\"><script type=\"application/json\">{\"count\":3}</script><p>3</p></stitch-boundary>",
	);
	let scope = find(&dom.borrow(), "stitch-boundary");
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<script type=\"application/json\">{\"count\":4}</script><p>4</p>",
	);
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	coordinator.trigger(scope, Trigger::new("5", Payload::Json(json!({})))).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests[0].state.as_deref(), Some("{\"count\":3}"));
	assert_eq!(
		requests[0].json_body(),
		"{\"eventId\":5,\"payload\":{},\"state\":{\"count\":3}}",
	);
}

#[tokio::test(start_paused = true)]
async fn prerendered_variant_skips_the_server_round_trip() {
	let (dom, _body) = page(
		"<stitch-boundary name=\"counter\" events=\"\"><p>count 0</p><button stitch-click=\"5\" stitch-click-payload=\"{&quot;step&quot;:1}\">+</button><template event-id=\"5\" event-payload=\"{&quot;step&quot;:1}\"><p>count 1</p><button stitch-click=\"5\" stitch-click-payload=\"{&quot;step&quot;:1}\">+</button></template></stitch-boundary>",
	);
	let scope = find(&dom.borrow(), "stitch-boundary");
	let button = find(&dom.borrow(), "button");
	let transport = FakeTransport::default();
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("click", button)).await.unwrap();

	assert!(transport.requests().is_empty());
	let dom = dom.borrow();
	let children = dom.children(scope).to_vec();
	assert_eq!(dom.tag_name(children[0]), Some("p"));
	assert_eq!(dom.inner_html(children[0]), "count 1");
	assert_eq!(dom.tag_name(*children.last().unwrap()), Some("template"));
}

#[tokio::test(start_paused = true)]
async fn dirty_marking_forces_descent_past_stale_fingerprints() {
	let (dom, _body) = page(
		"<stitch-boundary name=\"panel\" events=\"\" hash=\"1\"><div hash=\"5\"><input stitch-change=\"6\" stitch-change-payload=\"{&quot;v&quot;:&quot;_##InputValue&quot;}\"><p>old</p></div></stitch-boundary>",
	);
	let scope = find(&dom.borrow(), "stitch-boundary");
	let input = find(&dom.borrow(), "input");
	dom.borrow_mut().set_property(input, |element| element.value = "typed".to_string());
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<div hash=\"5\"><input stitch-change=\"6\" stitch-change-payload=\"{&quot;v&quot;:&quot;_##InputValue&quot;}\"><p>new</p></div>",
	);
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("change", input)).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests[0].event_id, "6");
	assert_eq!(requests[0].payload, Payload::Json(json!({ "v": "typed" })));
	// The live fingerprint was cleared, so the identical replacement hash
	// cannot short-circuit the patch.
	let dom = dom.borrow();
	assert!(dom.inner_html(scope).contains("<p>new</p>"));
}

#[tokio::test(start_paused = true)]
async fn allow_list_defers_to_the_outer_scope() {
	let (dom, body) = page(
		"<stitch-boundary name=\"inner\" events=\"1,2\" hash=\"3\"><button stitch-click=\"9\">Go</button></stitch-boundary>",
	);
	let button = find(&dom.borrow(), "button");
	let scope = find(&dom.borrow(), "stitch-boundary");
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<stitch-boundary name=\"inner\" events=\"1,2\" hash=\"3\"><button stitch-click=\"9\">Go</button></stitch-boundary><p>handled outside</p>",
	);
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("click", button)).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	// The page scope took the event, so it went to the page endpoint.
	assert_eq!(requests[0].endpoint, "/page");
	// The rejecting scope lost its fingerprint, making the patch descend
	// into it.
	let dom = dom.borrow();
	assert!(dom.inner_html(body).contains("<p>handled outside</p>"));
	assert!(dom.is_attached(scope));
}

#[tokio::test(start_paused = true)]
async fn refresh_clears_fingerprints_and_rerenders_the_page() {
	let (dom, body) = page(
		"<stitch-boundary name=\"panel\" events=\"\" hash=\"1\"><p hash=\"2\">stale</p></stitch-boundary>",
	);
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<stitch-boundary name=\"panel\" events=\"\" hash=\"1\"><p hash=\"4\">fresh</p></stitch-boundary>",
	);
	let coordinator = Coordinator::new(Rc::clone(&dom), transport.clone());

	coordinator.refresh().await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].event_id, "0");
	assert_eq!(requests[0].endpoint, "/page");
	// The boundary's cleared fingerprint let the patch descend into it even
	// though the replacement carries the same hash.
	assert!(dom.borrow().inner_html(body).contains("fresh"));
}

#[tokio::test(start_paused = true)]
async fn disabled_control_does_not_trigger() {
	let (dom, _body) = page("<button stitch-click=\"4\" disabled>Go</button>");
	let button = find(&dom.borrow(), "button");
	let transport = FakeTransport::default();
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("click", button)).await.unwrap();

	assert!(transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn checkbox_click_toggles_before_the_request() {
	let (dom, _body) = page(
		"<input type=\"checkbox\" stitch-click=\"8\" stitch-click-payload=\"{&quot;on&quot;:true}\">",
	);
	let checkbox = find(&dom.borrow(), "input");
	let transport = FakeTransport::default();
	transport.respond_markup(
		"<input type=\"checkbox\" checked stitch-click=\"8\" stitch-click-payload=\"{&quot;on&quot;:true}\">",
	);
	let dispatcher = Dispatcher::new(Coordinator::new(Rc::clone(&dom), transport.clone()));

	dispatcher.dispatch(DomEvent::new("click", checkbox)).await.unwrap();

	assert_eq!(transport.requests().len(), 1);
	assert!(dom.borrow().element(checkbox).unwrap().checked);
}
