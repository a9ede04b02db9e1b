#![doc(html_root_url = "https://docs.rs/stitch-dom/0.1.0")]
#![warn(clippy::pedantic)]
//! In-place reconciliation of server-rendered HTML fragments into a live
//! document tree, plus the event and request plumbing that drives it.
//!
//! The tree lives in an arena ([`dom::Dom`]); replacement markup is parsed
//! into a detached fragment and merged by [`diff::patch_children`], which
//! mutates the live tree only where it differs. Keyed elements keep their
//! node identity across reorders, fingerprinted subtrees are skipped
//! wholesale, and form-control state survives the patch.
//!
//! On top of the differ, [`lifecycle::Coordinator`] runs at most one update
//! request per scope (superseding stale ones), and [`dispatch::Dispatcher`]
//! resolves tree events against `stitch-*` handler attributes and turns them
//! into those updates.

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}

pub mod cancellation;
pub mod diff;
pub mod dispatch;
pub mod dom;
pub mod html;
pub mod lifecycle;
pub mod protocol;
pub mod registry;

pub use cancellation::{CancellationSource, CancellationToken};
pub use dispatch::{Dispatcher, DomEvent, ListenerRegistry};
pub use dom::{Dom, NodeId};
pub use lifecycle::{Coordinator, Disable, RestorationMap, Trigger};
pub use protocol::{Payload, RawResponse, RenderRequest, RenderResponse, Transport};

/// Unified error type of the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The update was superseded by a newer trigger for the same scope.
	#[error("update superseded")]
	Cancelled,
	/// The server answered with a status the protocol has no meaning for.
	#[error("received unexpected status code: {0}")]
	UnexpectedStatus(u16),
	/// Replacement markup contained a comment node, which the differ does
	/// not patch.
	#[error("unexpected comment")]
	UnexpectedComment,
	/// Malformed markup or JSON.
	#[error("parse error: {0}")]
	Parse(String),
	/// The transport failed to deliver the request.
	#[error("transport error: {0}")]
	Transport(String),
}
