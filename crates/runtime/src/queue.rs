// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Queue pipes: a sink/source pair bridging two event loops.
//!
//! The sink enqueues everything it receives (flow defs included, so
//! ordering across the bridge is exact); the source drains on its own
//! loop's signal watcher and re-emits through a standard output helper.
//! Input is never refused: past the configured max length the queue keeps
//! absorbing, standing in for upstream blocking, and says so once in the
//! log.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use upipe_core::prelude::*;

pub const QSINK_SIGNATURE: u32 = fourcc(*b"qsnk");
pub const QSRC_SIGNATURE: u32 = fourcc(*b"qsrc");

const DEFAULT_MAX_LENGTH: usize = 64;

enum QItem {
    FlowDef(Uref),
    Data(Uref),
    End,
}

struct QueueState {
    queue: VecDeque<QItem>,
    max_length: usize,
    over_length: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    signal: Usignal,
}

fn lock(shared: &QueueShared) -> MutexGuard<'_, QueueState> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl QueueShared {
    fn push(&self, item: QItem) {
        {
            let mut state = lock(self);
            state.queue.push_back(item);
            if state.queue.len() > state.max_length && !state.over_length {
                state.over_length = true;
                tracing::debug!(
                    "queue exceeds its max length of {}, absorbing",
                    state.max_length
                );
            }
        }
        self.signal.raise();
    }

    fn drain(&self) -> Vec<QItem> {
        let mut state = lock(self);
        state.over_length = false;
        state.queue.drain(..).collect()
    }
}

struct Drain;

/// Allocates a connected sink/source pair. Feed the sink on any thread;
/// attach a pump manager to the source on the loop that should emit.
///
/// # Errors
///
/// `Invalid` for a zero `max_length`.
pub fn alloc_pair(
    sink_probe: Uprobe,
    source_probe: Uprobe,
    max_length: usize,
) -> Result<(Pipe, Pipe)> {
    if max_length == 0 {
        return Err(UbaseError::Invalid);
    }
    let shared = Arc::new(QueueShared {
        state: Mutex::new(QueueState {
            queue: VecDeque::new(),
            max_length,
            over_length: false,
        }),
        signal: Usignal::new(),
    });
    let sink = Pipe::build(
        Arc::new(QueueSinkMgr),
        sink_probe,
        QueueSinkOps { shared: shared.clone() },
    );
    let source = Pipe::build(
        Arc::new(QueueSourceMgr),
        source_probe,
        QueueSourceOps {
            shared,
            output: OutputHelper::new(),
            upump_mgr: None,
            pump: None,
            this: WeakPipe::new(),
        },
    );
    Ok((sink, source))
}

struct QueueSinkMgr;

impl PipeManager for QueueSinkMgr {
    fn signature(&self) -> u32 {
        QSINK_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        // Queue ends come in pairs; use alloc_pair.
        Err(UbaseError::Invalid)
    }
}

struct QueueSinkOps {
    shared: Arc<QueueShared>,
}

impl PipeOps for QueueSinkOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.shared.push(QItem::FlowDef(flow_def));
                Ok(Reply::None)
            }
            Command::SetMaxLength(max) => {
                if max == 0 {
                    return Err(UbaseError::Invalid);
                }
                lock(&self.shared).max_length = max;
                Ok(Reply::None)
            }
            Command::GetMaxLength => Ok(Reply::MaxLength(lock(&self.shared).max_length)),
            Command::RegisterRequest(request) => {
                ctx.throw_provide_request(request);
                Ok(Reply::None)
            }
            Command::UnregisterRequest(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, _ctx: &mut PipeCtx<'_>, uref: Uref) {
        self.shared.push(QItem::Data(uref));
    }

    fn on_last_release(&mut self, _ctx: &mut PipeCtx<'_>) {
        self.shared.push(QItem::End);
    }
}

struct QueueSourceMgr;

impl PipeManager for QueueSourceMgr {
    fn signature(&self) -> u32 {
        QSRC_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Err(UbaseError::Invalid)
    }
}

struct QueueSourceOps {
    shared: Arc<QueueShared>,
    output: OutputHelper,
    upump_mgr: Option<UpumpMgr>,
    pump: Option<Upump>,
    this: WeakPipe,
}

impl QueueSourceOps {
    fn start_pump(&mut self, ctx: &mut PipeCtx<'_>) {
        if self.pump.is_some() {
            return;
        }
        let Some(upump_mgr) = &self.upump_mgr else { return };
        let this = self.this.clone();
        let cb: PumpCallback = Box::new(move || match this.upgrade() {
            Some(pipe) => pipe
                .control(Command::Custom(CustomCommand {
                    signature: QSRC_SIGNATURE,
                    payload: Box::new(Drain),
                }))
                .is_ok(),
            None => false,
        });
        match upump_mgr.alloc_signal_watcher(self.shared.signal.clone(), cb) {
            Ok(mut pump) => {
                pump.start();
                self.pump = Some(pump);
                // Catch up with anything queued before the pump existed.
                self.shared.signal.raise();
            }
            Err(err) => ctx.fatal(err),
        }
    }

    fn drain(&mut self, ctx: &mut PipeCtx<'_>) {
        for item in self.shared.drain() {
            match item {
                QItem::FlowDef(flow_def) => self.output.store_flow_def(ctx, flow_def),
                QItem::Data(uref) => self.output.output(ctx, uref),
                QItem::End => {
                    ctx.throw(Event::SourceEnd);
                    if let Some(mut pump) = self.pump.take() {
                        pump.stop();
                        ctx.release_later(pump);
                    }
                }
            }
        }
    }
}

impl PipeOps for QueueSourceOps {
    fn on_ready(&mut self, ctx: &mut PipeCtx<'_>) {
        if let Some(pipe) = ctx.pipe() {
            self.this = pipe.downgrade();
        }
    }

    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        let command = upipe_core::helper_control!(self.output, ctx, command);
        match command {
            Command::AttachUpumpMgr(mgr) => {
                self.upump_mgr = Some(mgr);
                self.start_pump(ctx);
                Ok(Reply::None)
            }
            Command::GetMaxLength => Ok(Reply::MaxLength(lock(&self.shared).max_length)),
            Command::SetMaxLength(max) => {
                if max == 0 {
                    return Err(UbaseError::Invalid);
                }
                lock(&self.shared).max_length = max;
                Ok(Reply::None)
            }
            Command::Custom(custom) => {
                custom.payload.downcast::<Drain>().map_err(|_| UbaseError::Invalid)?;
                self.drain(ctx);
                Ok(Reply::None)
            }
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
            ctx.release_later(pump);
        }
        self.output.clean(ctx);
    }
}
