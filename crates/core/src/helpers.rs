// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The helper catalogue: reusable policy structs composed into a pipe's
//! private state.
//!
//! - [`OutputHelper`]: stored outbound flow def, buffered urefs while the
//!   output or flow def is missing, downstream request registry.
//! - [`UrefStream`]: byte-stream accumulation over packetized input, with
//!   per-uref attribute marks for framers.
//! - [`SubRegistry`]: weak sub-pipe bookkeeping for composites.
//!
//! Each helper supplies the control-command arms it owns; a pipe's
//! `control` delegates first and handles the rest.

use crate::control::{Command, Reply};
use crate::error::Result;
use crate::ubuf::{Ubuf, UbufBlock};
use crate::upipe::{Pipe, PipeCtx, WeakPipe};
use crate::uprobe::Event;
use crate::urequest::Request;
use crate::uref::Uref;
use std::collections::VecDeque;

/// Outcome of offering a command to a helper.
pub enum HelperControl {
    /// The helper owned the command.
    Handled(Result<Reply>),
    /// Not this helper's command; handed back to the caller.
    Pass(Command),
}

/// Output-side state: the next pipe, the stored flow definition, and
/// whatever could not be delivered yet.
///
/// Data is only forwarded once both an output and a flow def exist; the
/// flow def always travels first. Until then urefs are buffered and
/// `NeedOutput` is raised so a probe may attach one.
#[derive(Default)]
pub struct OutputHelper {
    output: Option<Pipe>,
    flow_def: Option<Uref>,
    flow_def_sent: bool,
    buffered: VecDeque<Uref>,
    requests: Vec<Request>,
}

impl OutputHelper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn flow_def(&self) -> Option<&Uref> {
        self.flow_def.as_ref()
    }

    #[must_use]
    pub fn output_pipe(&self) -> Option<&Pipe> {
        self.output.as_ref()
    }

    /// Stores a new outbound flow definition, raises `NewFlowDef`, and
    /// flushes anything that was waiting for it.
    pub fn store_flow_def(&mut self, ctx: &mut PipeCtx<'_>, flow_def: Uref) {
        ctx.throw(Event::NewFlowDef(flow_def.dup()));
        self.flow_def = Some(flow_def);
        self.flow_def_sent = false;
        self.flush(ctx);
    }

    /// Sends a uref downstream, or buffers it while the edge is not ready.
    pub fn output(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        if self.output.is_some() && self.flow_def.is_some() {
            self.sync_flow_def(ctx);
            if let Some(out) = &self.output {
                ctx.forward(out, uref);
            }
        } else {
            if self.buffered.is_empty() && self.output.is_none() {
                ctx.throw(Event::NeedOutput(self.flow_def.as_ref().map(Uref::dup)));
            }
            self.buffered.push_back(uref);
        }
    }

    fn sync_flow_def(&mut self, ctx: &mut PipeCtx<'_>) {
        if self.flow_def_sent {
            return;
        }
        if let (Some(out), Some(flow_def)) = (&self.output, &self.flow_def) {
            ctx.send_control(out, Command::SetFlowDef(flow_def.dup()));
            self.flow_def_sent = true;
        }
    }

    fn flush(&mut self, ctx: &mut PipeCtx<'_>) {
        if self.output.is_none() || self.flow_def.is_none() {
            return;
        }
        self.sync_flow_def(ctx);
        while let Some(uref) = self.buffered.pop_front() {
            if let Some(out) = &self.output {
                ctx.forward(out, uref);
            }
        }
    }

    /// Installs the next pipe, re-registers pending requests on it, and
    /// forwards the stored flow def plus buffered urefs.
    pub fn set_output(&mut self, ctx: &mut PipeCtx<'_>, output: Option<Pipe>) {
        if let Some(old) = self.output.take() {
            for request in &self.requests {
                ctx.send_control(&old, Command::UnregisterRequest(request.clone()));
            }
            ctx.release_later(old);
        }
        self.output = output;
        self.flow_def_sent = false;
        if let Some(out) = &self.output {
            for request in &self.requests {
                ctx.register_downstream(out, request.clone());
            }
        }
        self.flush(ctx);
    }

    /// Tracks a request and pushes it along the output chain, or up the
    /// probe chain while no output exists.
    pub fn register_request(&mut self, ctx: &mut PipeCtx<'_>, request: Request) {
        self.requests.push(request.clone());
        match &self.output {
            Some(out) => ctx.register_downstream(out, request),
            None => ctx.throw_provide_request(request),
        }
    }

    pub fn unregister_request(&mut self, ctx: &mut PipeCtx<'_>, request: &Request) {
        self.requests.retain(|r| r != request);
        if let Some(out) = &self.output {
            ctx.send_control(out, Command::UnregisterRequest(request.clone()));
        }
    }

    /// The control arms this helper owns.
    pub fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> HelperControl {
        match command {
            Command::SetOutput(output) => {
                self.set_output(ctx, output);
                HelperControl::Handled(Ok(Reply::None))
            }
            Command::GetOutput => {
                HelperControl::Handled(Ok(Reply::Output(self.output.clone())))
            }
            Command::GetFlowDef => HelperControl::Handled(Ok(Reply::FlowDef(
                self.flow_def.as_ref().map(Uref::dup),
            ))),
            Command::RegisterRequest(request) => {
                self.register_request(ctx, request);
                HelperControl::Handled(Ok(Reply::None))
            }
            Command::UnregisterRequest(request) => {
                self.unregister_request(ctx, &request);
                HelperControl::Handled(Ok(Reply::None))
            }
            other => HelperControl::Pass(other),
        }
    }

    /// Drops the output edge and anything buffered; for `on_last_release`.
    pub fn clean(&mut self, ctx: &mut PipeCtx<'_>) {
        self.buffered.clear();
        if let Some(old) = self.output.take() {
            ctx.release_later(old);
        }
        self.requests.clear();
    }
}

/// Byte-stream accumulation over packetized block input.
///
/// Input payloads are chained without copy; each input uref leaves an
/// attribute mark at its start offset. A framer extracting a frame asks for
/// the attributes of the uref in which the frame started; a mark is
/// consumed by the first frame at or past it, so dates are used exactly
/// once and later frames extrapolate.
#[derive(Default)]
pub struct UrefStream {
    ubuf: UbufBlock,
    marks: VecDeque<(u64, Uref)>,
    consumed: u64,
}

impl UrefStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chains an input uref's payload; its attributes become the mark for
    /// the byte offset where the payload starts. Urefs with no block
    /// payload are dropped.
    pub fn append(&mut self, mut uref: Uref) {
        let Some(Ubuf::Block(block)) = uref.detach_ubuf() else { return };
        let offset = self.consumed + self.ubuf.size() as u64;
        self.marks.push_back((offset, uref));
        self.ubuf.append(block);
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.ubuf.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ubuf.is_empty()
    }

    #[must_use]
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.ubuf.byte(offset)
    }

    pub fn peek<'a>(&'a self, offset: usize, scratch: &'a mut [u8]) -> Option<&'a [u8]> {
        self.ubuf.peek(offset, scratch)
    }

    /// Detaches the first `len` bytes as their own buffer.
    #[must_use]
    pub fn extract(&mut self, len: usize) -> Option<UbufBlock> {
        let frame = self.ubuf.splice(0, len).ok()?;
        self.skip(len);
        Some(frame)
    }

    /// Drops `len` leading bytes (scan garbage).
    pub fn skip(&mut self, len: usize) {
        if self.ubuf.skip(len).is_ok() {
            self.consumed += len as u64;
        }
    }

    /// Attributes for a frame starting at `rel_off`: the closest mark at or
    /// before it. All marks up to that point are consumed.
    #[must_use]
    pub fn attrs_for(&mut self, rel_off: usize) -> Option<Uref> {
        let abs = self.consumed + rel_off as u64;
        let mut found = None;
        while let Some((off, _)) = self.marks.front() {
            if *off <= abs {
                found = self.marks.pop_front().map(|(_, attrs)| attrs);
            } else {
                break;
            }
        }
        found
    }

    /// Resets the accumulator, e.g. when a new input flow def arrives.
    pub fn clear(&mut self) {
        self.ubuf = UbufBlock::default();
        self.marks.clear();
        self.consumed = 0;
    }
}

/// Weak registry of a composite's sub-pipes. Entries whose last external
/// handle is gone are pruned on access.
#[derive(Default)]
pub struct SubRegistry {
    subs: Vec<WeakPipe>,
}

impl SubRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pipe: &Pipe) {
        self.subs.push(pipe.downgrade());
    }

    /// Live sub-pipes, pruning dead entries.
    pub fn alive(&mut self) -> Vec<Pipe> {
        let mut alive = Vec::new();
        self.subs.retain(|weak| match weak.upgrade() {
            Some(pipe) => {
                alive.push(pipe);
                true
            }
            None => false,
        });
        alive
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.iter().all(|weak| weak.upgrade().is_none())
    }
}

/// `ubase`-style guard: returns `Handled`'s result early from a pipe's
/// `control`, in the spirit of chained helper dispatch.
#[macro_export]
macro_rules! helper_control {
    ($helper:expr, $ctx:expr, $command:expr) => {
        match $helper.control($ctx, $command) {
            $crate::helpers::HelperControl::Handled(result) => return result,
            $crate::helpers::HelperControl::Pass(command) => command,
        }
    };
}
