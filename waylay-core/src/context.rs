//! §3 "Context": per-request state. Design Note §9 offers two ways to link
//! a request to its context — a process-wide registry keyed by identity, or
//! passing the context explicitly to modifiers. This engine takes the
//! second option: modifiers receive `&mut Context` directly (see
//! [`crate::modifier`]), so no registry, no pointer-identity bookkeeping,
//! and no risk of a stale entry outliving its request.

use std::sync::{Arc, Mutex};

use http::Extensions;

use crate::{session::Session, stream::BoxedStream};

/// Per-request state handed to the request and response modifiers.
pub struct Context {
    pub session: Session,
    /// Set by a request modifier to make the round-trip delegator (§4.6)
    /// synthesize a `200 OK` instead of contacting any origin.
    pub skip_round_trip: bool,
    /// Auxiliary per-request key/value storage consumed by modifiers.
    /// Reuses `http::Extensions` — the same type-map the `http` crate
    /// already uses for request/response extensions — instead of rolling a
    /// bespoke `Any` map.
    pub extensions: Extensions,
    /// The hijack capability (Design Note §9): a modifier that wants to
    /// seize the raw connection takes it out of this cell and calls
    /// [`Session::try_hijack`]. The pipeline checks the cell, not the
    /// stream it started with, once the modifier returns.
    stream_cell: Arc<Mutex<Option<BoxedStream>>>,
}

impl Context {
    pub fn new(session: Session, stream_cell: Arc<Mutex<Option<BoxedStream>>>) -> Self {
        Self {
            session,
            skip_round_trip: false,
            extensions: Extensions::new(),
            stream_cell,
        }
    }

    /// Take ownership of the underlying connection stream, transitioning
    /// the session to hijacked. Returns `None` if the session was already
    /// hijacked (by a previous modifier invocation on this connection) or if
    /// this call loses a race for the one-way transition.
    pub fn hijack(&self) -> Option<BoxedStream> {
        if !self.session.try_hijack() {
            return None;
        }
        self.stream_cell.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
