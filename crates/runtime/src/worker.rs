// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Worker bin pipe: an inner pipeline running on a transfer manager's
//! thread, bridged by queue pipes.
//!
//! The bin composes an input path (bin input forwarded through the
//! transfer proxy), the transferred inner pipe, and an output path (a
//! queue sink installed as the inner's output on the remote loop, drained
//! by a local queue source). `BinGetFirstInner`/`BinGetLastInner` expose
//! the terminals for wiring. The bin's release is the only thing that
//! releases both sides.
//!
//! When the inner consumes no input the bin degenerates to a source-only
//! configuration ([`alloc_source`]); when it produces no output, to a
//! sink-only one ([`alloc_sink`]).

use std::sync::Arc;
use upipe_core::prelude::*;

use crate::queue;
use crate::xfer::XferMgr;

pub const WORKER_SIGNATURE: u32 = fourcc(*b"wrkr");

/// Which sides of the inner pipeline the bin exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Linear,
    SourceOnly,
    SinkOnly,
}

/// Wraps `inner` with both an input and an output path.
///
/// # Errors
///
/// Propagates proxy and queue allocation failures.
pub fn alloc(xfer: &XferMgr, probe: Uprobe, inner: Pipe, queue_length: usize) -> Result<Pipe> {
    build(xfer, probe, inner, queue_length, Shape::Linear)
}

/// Wraps a source `inner`: the bin has no input path.
///
/// # Errors
///
/// Propagates proxy and queue allocation failures.
pub fn alloc_source(
    xfer: &XferMgr,
    probe: Uprobe,
    inner: Pipe,
    queue_length: usize,
) -> Result<Pipe> {
    build(xfer, probe, inner, queue_length, Shape::SourceOnly)
}

/// Wraps a sink `inner`: the bin has no output path.
///
/// # Errors
///
/// Propagates proxy allocation failures.
pub fn alloc_sink(xfer: &XferMgr, probe: Uprobe, inner: Pipe) -> Result<Pipe> {
    build(xfer, probe, inner, 0, Shape::SinkOnly)
}

fn build(
    xfer: &XferMgr,
    probe: Uprobe,
    inner: Pipe,
    queue_length: usize,
    shape: Shape,
) -> Result<Pipe> {
    let proxy = xfer.alloc_pipe(inner, Uprobe::new())?;

    let out_source = if shape == Shape::SinkOnly {
        None
    } else {
        let (qsink, qsrc) = queue::alloc_pair(Uprobe::new(), Uprobe::new(), queue_length)?;
        // Installed on the remote loop, after anything already queued.
        proxy.set_output(&qsink)?;
        Some(qsrc)
    };

    Ok(Pipe::build(
        Arc::new(WorkerMgr),
        probe,
        WorkerOps { proxy, out_source, shape },
    ))
}

struct WorkerMgr;

impl PipeManager for WorkerMgr {
    fn signature(&self) -> u32 {
        WORKER_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        // A worker wraps an existing inner; use the module functions.
        Err(UbaseError::Invalid)
    }
}

struct WorkerOps {
    proxy: Pipe,
    out_source: Option<Pipe>,
    shape: Shape,
}

impl PipeOps for WorkerOps {
    fn control(&mut self, _ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::BinGetFirstInner => Ok(Reply::Inner(match self.shape {
                Shape::SourceOnly => None,
                _ => Some(self.proxy.clone()),
            })),
            Command::BinGetLastInner => Ok(Reply::Inner(match &self.out_source {
                Some(qsrc) => Some(qsrc.clone()),
                None => Some(self.proxy.clone()),
            })),
            // The output side lives locally on the queue source.
            command @ (Command::SetOutput(_)
            | Command::GetOutput
            | Command::GetFlowDef
            | Command::AttachUpumpMgr(_)
            | Command::RegisterRequest(_)
            | Command::UnregisterRequest(_)) => match &self.out_source {
                Some(qsrc) => qsrc.control(command),
                None => Err(UbaseError::Unhandled),
            },
            // Everything else configures the inner, through the queue.
            command => self.proxy.control(command),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        if self.shape == Shape::SourceOnly {
            drop(uref);
            ctx.warn("source-only worker does not accept input");
            return;
        }
        ctx.forward(&self.proxy, uref);
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        // Both terminals go together, never before the bin itself.
        ctx.release_later(self.proxy.clone());
        if let Some(qsrc) = self.out_source.take() {
            ctx.release_later(qsrc);
        }
    }
}
