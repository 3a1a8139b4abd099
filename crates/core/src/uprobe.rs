// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The probe chain: out-of-band events raised by pipes.
//!
//! Probes form a singly-linked list, head to tail, each holding a strong
//! reference to the next. A handler returning `Err(Unhandled)` lets the
//! event fall through to the next probe; any other return stops
//! propagation. Handlers may also transform an event and forward it
//! explicitly through the `next` chain they are given (see
//! [`UprobePrefix`]).
//!
//! Log events terminate in [`UprobeLog`], which hands them to `tracing`.

use crate::error::{Result, UbaseError};
use crate::upipe::PipeRef;
use crate::urequest::Request;
use crate::uref::Uref;
use std::sync::Arc;

/// Severity of a [`Event::Log`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Events raised by pipes through their probe chain.
pub enum Event {
    /// One-shot, fired by a successful alloc before it returns.
    Ready,
    /// One-shot, fired when the last reference is dropped.
    Dead,
    /// Unrecoverable failure; termination policy is a probe concern.
    Fatal(UbaseError),
    /// Recoverable failure.
    Error(UbaseError),
    /// Traced line.
    Log(LogLevel, String),
    /// A request that could not be served along the output chain.
    ProvideRequest(Request),
    /// Output unset but data waiting; carries the pending flow def.
    NeedOutput(Option<Uref>),
    /// A new outbound flow definition was stored.
    NewFlowDef(Uref),
    /// A split pipe's flow list changed.
    SplitUpdate,
    /// A pipe needs an event-pump manager to schedule itself.
    NeedUpumpMgr,
    /// The stream ended upstream.
    SourceEnd,
    /// The stream ended downstream.
    SinkEnd,
    /// A source stamped a clock reference.
    ClockRef { cr_sys: u64, cr_prog: u64, discontinuity: bool },
    /// A source stamped timestamps on a uref (attributes only).
    ClockTs(Uref),
    /// A source derived a wall-clock date.
    ClockUtc { cr_sys: u64, utc: u64 },
    /// A framer gained parse synchronization.
    SyncAcquired,
    /// A framer lost parse synchronization.
    SyncLost,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ready => "Ready",
            Self::Dead => "Dead",
            Self::Fatal(_) => "Fatal",
            Self::Error(_) => "Error",
            Self::Log(..) => "Log",
            Self::ProvideRequest(_) => "ProvideRequest",
            Self::NeedOutput(_) => "NeedOutput",
            Self::NewFlowDef(_) => "NewFlowDef",
            Self::SplitUpdate => "SplitUpdate",
            Self::NeedUpumpMgr => "NeedUpumpMgr",
            Self::SourceEnd => "SourceEnd",
            Self::SinkEnd => "SinkEnd",
            Self::ClockRef { .. } => "ClockRef",
            Self::ClockTs(_) => "ClockTs",
            Self::ClockUtc { .. } => "ClockUtc",
            Self::SyncAcquired => "SyncAcquired",
            Self::SyncLost => "SyncLost",
        };
        f.write_str(name)
    }
}

/// An event handler in a chain.
///
/// Return `Ok(())` to stop propagation, `Err(Unhandled)` to fall through.
/// A handler may rewrite an event and forward it via `next` instead.
pub trait ProbeHandler: Send + Sync {
    fn throw(&self, next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()>;
}

struct ProbeNode {
    handler: Box<dyn ProbeHandler>,
    next: Uprobe,
}

/// A refcounted probe chain. Cloning shares the chain.
#[derive(Clone, Default)]
pub struct Uprobe {
    head: Option<Arc<ProbeNode>>,
}

impl Uprobe {
    /// The empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a chain with `handler` prepended; events reach it first.
    #[must_use]
    pub fn push(self, handler: impl ProbeHandler + 'static) -> Self {
        Self { head: Some(Arc::new(ProbeNode { handler: Box::new(handler), next: self })) }
    }

    /// Walks the chain.
    ///
    /// # Errors
    ///
    /// `Unhandled` when no probe caught the event; any other error is the
    /// stopping handler's verdict.
    pub fn throw(&self, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match &self.head {
            None => Err(UbaseError::Unhandled),
            Some(node) => match node.handler.throw(&node.next, pipe, event) {
                Err(UbaseError::Unhandled) => node.next.throw(pipe, event),
                other => other,
            },
        }
    }
}

/// Adapts a closure into a probe, the staple of tests and applications.
pub struct UprobeFn<F>(pub F);

impl<F> ProbeHandler for UprobeFn<F>
where
    F: Fn(&PipeRef<'_>, &Event) -> Result<()> + Send + Sync,
{
    fn throw(&self, _next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        (self.0)(pipe, event)
    }
}

/// Terminal log sink: forwards log events at or above `min` to `tracing`.
/// Error and fatal events are traced too but left unhandled so policy
/// probes further down still see them.
pub struct UprobeLog {
    min: LogLevel,
}

impl UprobeLog {
    #[must_use]
    pub const fn new(min: LogLevel) -> Self {
        Self { min }
    }
}

impl ProbeHandler for UprobeLog {
    fn throw(&self, _next: &Uprobe, _pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match event {
            Event::Log(level, msg) => {
                if *level >= self.min {
                    match level {
                        LogLevel::Verbose => tracing::trace!("{msg}"),
                        LogLevel::Debug => tracing::debug!("{msg}"),
                        LogLevel::Info | LogLevel::Notice => tracing::info!("{msg}"),
                        LogLevel::Warning => tracing::warn!("{msg}"),
                        LogLevel::Error => tracing::error!("{msg}"),
                    }
                }
                Ok(())
            }
            Event::Error(err) => {
                tracing::warn!("pipe error: {err}");
                Err(UbaseError::Unhandled)
            }
            Event::Fatal(err) => {
                tracing::error!("fatal pipe error: {err}");
                Err(UbaseError::Unhandled)
            }
            _ => Err(UbaseError::Unhandled),
        }
    }
}

/// Decorates log lines with a pipe tag before passing them on.
pub struct UprobePrefix {
    tag: String,
}

impl UprobePrefix {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl ProbeHandler for UprobePrefix {
    fn throw(&self, next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match event {
            Event::Log(level, msg) => {
                next.throw(pipe, &Event::Log(*level, format!("[{}] {msg}", self.tag)))
            }
            _ => Err(UbaseError::Unhandled),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::upipe::tests::phony_sink;
    use std::sync::Mutex;

    fn collector(seen: Arc<Mutex<Vec<String>>>) -> UprobeFn<impl Fn(&PipeRef<'_>, &Event) -> Result<()> + Send + Sync>
    {
        UprobeFn(move |_pipe: &PipeRef<'_>, event: &Event| match event {
            Event::Log(_, msg) => {
                seen.lock().unwrap().push(msg.clone());
                Ok(())
            }
            _ => Err(UbaseError::Unhandled),
        })
    }

    #[test]
    fn unhandled_falls_through_and_prefix_rewrites() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = Uprobe::new().push(collector(seen.clone())).push(UprobePrefix::new("tag"));

        let (pipe, _records) = phony_sink(chain);
        pipe.throw_log(LogLevel::Debug, "hello");
        assert_eq!(seen.lock().unwrap().as_slice(), ["[tag] hello"]);
    }

    #[test]
    fn handled_event_stops_propagation() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let chain =
            Uprobe::new().push(collector(second.clone())).push(collector(first.clone()));

        let (pipe, _records) = phony_sink(chain);
        pipe.throw_log(LogLevel::Debug, "once");
        assert_eq!(first.lock().unwrap().len(), 1);
        assert!(second.lock().unwrap().is_empty());
    }
}
