//! Wire protocol between the client runtime and the rendering server.
//!
//! Every update is a `PUT` carrying the triggering event and, when the scope
//! root stores one, the serialized scope state. The server answers with
//! replacement markup plus optional side channel headers (title, canonical
//! location, a follow-up event). Redirects are signalled in-band through a
//! sentinel path so the runtime can distinguish a render rewrite from a real
//! navigation.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{value::RawValue, Value};

use crate::{cancellation::CancellationToken, dom::Dom, dom::NodeId, Error};

/// Fingerprint attribute: subtrees whose fingerprints match are skipped
/// during reconciliation.
pub const HASH_ATTR: &str = "hash";
/// Tag of scope root elements.
pub const BOUNDARY_TAG: &str = "stitch-boundary";

/// Marks update requests so middleware can tell them from navigations.
pub const MARKER_HEADER: &str = "x-stitch";
pub const MARKER_VALUE: &str = "boundary";
/// Response header carrying a new document title.
pub const TITLE_HEADER: &str = "x-stitch-title";
/// Response headers carrying a follow-up event to dispatch after patching.
pub const EVENT_HEADER: &str = "x-stitch-event";
pub const PAYLOAD_HEADER: &str = "x-stitch-payload";
/// Response header carrying the canonical URL for the rendered state.
pub const LOCATION_HEADER: &str = "location";

/// Sentinel path a server-side redirect resolves to; the real destination
/// rides in the query string.
pub const REDIRECT_PATH: &str = "/client_redirect";

/// Synthetic event id dispatched by a full refresh.
pub const REFRESH_EVENT_ID: &str = "0";

/// Event payload, either structured JSON (click, change, input) or the
/// url-encoded fields of a submitted form.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	Json(Value),
	Form(Vec<(String, String)>),
}

impl Payload {
	/// Url-encodes form fields; JSON payloads serialize through `serde_json`.
	#[must_use]
	pub fn form_encoded(fields: &[(String, String)]) -> String {
		let mut out = String::new();
		for (name, value) in fields {
			if !out.is_empty() {
				out.push('&');
			}
			url_encode_into(&mut out, name);
			out.push('=');
			url_encode_into(&mut out, value);
		}
		out
	}
}

fn url_encode_into(out: &mut String, raw: &str) {
	for byte in raw.bytes() {
		match byte {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
				out.push(byte as char);
			}
			b' ' => out.push('+'),
			_ => {
				out.push('%');
				out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0').to_ascii_uppercase());
				out.push(char::from_digit(u32::from(byte & 0xf), 16).unwrap_or('0').to_ascii_uppercase());
			}
		}
	}
}

/// One update request, addressed either to a named scope endpoint or to the
/// current page URL.
#[derive(Debug, Clone)]
pub struct RenderRequest {
	pub endpoint: String,
	pub event_id: String,
	pub payload: Payload,
	/// Raw JSON text of the scope's state script, forwarded verbatim.
	pub state: Option<String>,
}

impl RenderRequest {
	/// Headers every update request carries: the framework marker that lets
	/// server middleware tell updates from navigations, plus the content type
	/// for JSON payloads. Form payloads leave the content type to the
	/// transport's multipart encoding.
	#[must_use]
	pub fn headers(&self) -> Vec<(&'static str, &'static str)> {
		let mut headers = vec![(MARKER_HEADER, MARKER_VALUE)];
		if matches!(self.payload, Payload::Json(_)) {
			headers.push(("content-type", "application/json"));
		}
		headers
	}

	/// Request body for JSON payloads. Numeric event ids stay numbers so the
	/// server's handler table can index them directly; the state rides along
	/// as the verbatim text of the scope's state script.
	#[must_use]
	pub fn json_body(&self) -> String {
		let Payload::Json(payload) = &self.payload else {
			return String::new();
		};

		#[derive(Serialize)]
		#[serde(rename_all = "camelCase")]
		struct Body<'a> {
			event_id: Value,
			payload: &'a Value,
			#[serde(skip_serializing_if = "Option::is_none")]
			state: Option<&'a RawValue>,
		}

		let event_id = self
			.event_id
			.parse::<u64>()
			.map_or_else(|_| Value::String(self.event_id.clone()), Value::from);
		let state = self
			.state
			.as_deref()
			.and_then(|state| serde_json::from_str::<&RawValue>(state).ok());
		let body = Body { event_id, payload, state };
		serde_json::to_string(&body).unwrap_or_default()
	}
}

/// What the transport hands back, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
	pub status: u16,
	/// URL the response was ultimately served from, after any redirects.
	pub final_url: String,
	pub headers: Vec<(String, String)>,
	pub body: String,
}

impl RawResponse {
	#[must_use]
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}
}

/// A follow-up event the server asks the client to dispatch after patching.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
	pub event_id: String,
	pub payload: Value,
}

/// Classified server response.
#[derive(Debug, Clone)]
pub enum RenderResponse {
	/// Replacement markup for the scope's subtree.
	Markup {
		html: String,
		/// Canonical URL to record in history, when it differs.
		location: Option<String>,
		title: Option<String>,
		follow_up: Option<FollowUp>,
	},
	/// The server redirected to the sentinel path; navigate instead of
	/// patching.
	Redirect { href: String },
	/// No content, only a follow-up event to dispatch; nothing is patched.
	Fire(FollowUp),
}

/// Classifies a raw response per the redirect sentinel and header contract.
pub fn classify(response: &RawResponse) -> Result<RenderResponse, Error> {
	let (path, query) = split_url(&response.final_url);
	if (200..300).contains(&response.status) && path == REDIRECT_PATH {
		return Ok(RenderResponse::Redirect { href: query.to_string() });
	}

	// No content plus event headers means "dispatch this instead of patching".
	if response.status == 204 {
		return match follow_up_headers(response)? {
			Some(follow_up) => Ok(RenderResponse::Fire(follow_up)),
			None => Err(Error::UnexpectedStatus(response.status)),
		};
	}

	if response.status != 200 {
		return Err(Error::UnexpectedStatus(response.status));
	}

	let follow_up = follow_up_headers(response)?;

	Ok(RenderResponse::Markup {
		html: response.body.clone(),
		location: response.header(LOCATION_HEADER).map(str::to_string),
		title: response.header(TITLE_HEADER).map(str::to_string),
		follow_up,
	})
}

fn follow_up_headers(response: &RawResponse) -> Result<Option<FollowUp>, Error> {
	match (response.header(EVENT_HEADER), response.header(PAYLOAD_HEADER)) {
		(Some(event_id), Some(payload)) => Ok(Some(FollowUp {
			event_id: event_id.to_string(),
			payload: serde_json::from_str(payload)
				.map_err(|error| Error::Parse(error.to_string()))?,
		})),
		_ => Ok(None),
	}
}

/// Splits an absolute or origin-relative URL into path and query (without
/// the `?`).
pub(crate) fn split_url(url: &str) -> (&str, &str) {
	let after_scheme = url
		.find("://")
		.map_or(url, |scheme| {
			let rest = &url[scheme + 3..];
			rest.find('/').map_or("", |slash| &rest[slash..])
		});
	match after_scheme.split_once('?') {
		Some((path, query)) => (path, query),
		None => (after_scheme, ""),
	}
}

/// Delivers update requests to the rendering server.
///
/// Implementations must poll `token` across their own suspension points and
/// return [`Error::Cancelled`] instead of a response once it trips.
#[async_trait(?Send)]
pub trait Transport {
	async fn send(
		&self,
		request: RenderRequest,
		token: &CancellationToken,
	) -> Result<RawResponse, Error>;
}

/// Endpoint an update for `scope` is addressed to: named scopes get their
/// own route, the page scope renders through the current URL.
#[must_use]
pub fn endpoint_for(dom: &Dom, scope: NodeId) -> String {
	match dom.attr(scope, "name") {
		Some(name) if dom.tag_name(scope) == Some(BOUNDARY_TAG) => {
			format!("/__boundary/{name}")
		}
		_ => dom.url().to_string(),
	}
}

/// Clears fingerprints from `node` up to and including its enclosing scope
/// root, so the next patch cannot skip the stale subtree.
pub fn clear_fingerprints_to_scope(dom: &mut Dom, node: NodeId) {
	let chain: Vec<NodeId> = dom.ancestors_inclusive(node).collect();
	for id in chain {
		let Some(tag) = dom.tag_name(id) else {
			continue;
		};
		let is_scope = tag == BOUNDARY_TAG || tag == "body";
		dom.remove_attr(id, HASH_ATTR);
		if is_scope {
			break;
		}
	}
}
