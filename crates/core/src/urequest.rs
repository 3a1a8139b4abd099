// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Resource requests and their provisions.
//!
//! A pipe that needs an upstream-negotiated resource (a uref manager, a
//! ubuf manager for a given flow format, a flow-format suggestion, a clock,
//! a sink latency figure) builds a [`Request`] and registers it on its
//! output. The request travels along the output chain until a pipe serves
//! it; a pipe that can neither serve nor forward raises
//! [`Event::ProvideRequest`] so the probe chain can answer. The `provide`
//! callback may fire asynchronously, long after registration.
//!
//! [`Event::ProvideRequest`]: crate::uprobe::Event::ProvideRequest

use crate::ubuf::UbufMgr;
use crate::uclock::Uclock;
use crate::uref::{Uref, UrefMgr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    UrefMgr,
    UbufMgr,
    FlowFormat,
    Uclock,
    SinkLatency,
}

/// The answer to a request.
pub enum Provision {
    UrefMgr(UrefMgr),
    UbufMgr(UbufMgr),
    FlowFormat(Uref),
    Uclock(Uclock),
    SinkLatency(u64),
}

impl Provision {
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::UrefMgr(_) => RequestKind::UrefMgr,
            Self::UbufMgr(_) => RequestKind::UbufMgr,
            Self::FlowFormat(_) => RequestKind::FlowFormat,
            Self::Uclock(_) => RequestKind::Uclock,
            Self::SinkLatency(_) => RequestKind::SinkLatency,
        }
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

struct RequestInner {
    id: u64,
    kind: RequestKind,
    flow_def: Option<Uref>,
    provide: Box<dyn Fn(&Request, Provision) + Send + Sync>,
}

/// A refcounted resource request. Clones are the same request; equality is
/// by identity so `UnregisterRequest` can name the one to drop.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Builds a request. `flow_def` carries the desired format for
    /// `UbufMgr` and `FlowFormat` requests. The callback receives the
    /// request itself so the requester can match the provision back.
    #[must_use]
    pub fn new(
        kind: RequestKind,
        flow_def: Option<Uref>,
        provide: impl Fn(&Request, Provision) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                flow_def,
                provide: Box::new(provide),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    /// The desired flow format, when the kind carries one.
    #[must_use]
    pub fn flow_def(&self) -> Option<&Uref> {
        self.inner.flow_def.as_ref()
    }

    /// Serves the request. Kind mismatches are the provider's bug and are
    /// simply ignored by the requester's callback contract.
    pub fn provide(&self, provision: Provision) {
        (self.inner.provide)(self, provision);
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Request {}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("id", &self.inner.id).field("kind", &self.inner.kind).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn provide_invokes_callback() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let request = Request::new(RequestKind::SinkLatency, None, move |req, provision| {
            if let Provision::SinkLatency(lat) = provision {
                *seen_in.lock().unwrap() = Some((req.id(), lat));
            }
        });
        let id = request.id();
        request.provide(Provision::SinkLatency(27));
        assert_eq!(*seen.lock().unwrap(), Some((id, 27)));
    }

    #[test]
    fn clones_are_the_same_request() {
        let a = Request::new(RequestKind::Uclock, None, |_, _| {});
        let b = a.clone();
        let c = Request::new(RequestKind::Uclock, None, |_, _| {});
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
