// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cross-thread transfer: migrate a pipe's input and control operations to
//! a remote event loop.
//!
//! An [`XferMgr`] owns a worker thread running its own event loop and a
//! multi-producer/single-consumer command queue. [`XferMgr::alloc_pipe`]
//! wraps a remote inner pipe in a proxy living on the originating thread;
//! every `input` or `control` call on the proxy is enqueued as a typed
//! command the worker applies in FIFO order. A control command is applied
//! after every input enqueued before it; releasing the proxy drains the
//! queued commands before the inner pipe is released on the worker thread.
//!
//! Replies come in three flavors: fire-and-forget (the default for
//! set-style commands), synchronous via [`control_sync`]'s channel
//! handshake, or asynchronously through the proxy's probe chain. While the
//! manager is frozen the worker stops dequeuing and a proxy may introspect
//! its inner directly (get-style commands), which bin pipes use during
//! wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upipe_core::prelude::*;

use crate::upump::TokioUpumpMgr;

pub const XFER_SIGNATURE: u32 = fourcc(*b"xfer");

enum XferCmd {
    Input(Pipe, Uref),
    Control(Pipe, Command, Option<std::sync::mpsc::Sender<Result<Reply>>>),
    Release(Pipe),
}

struct FreezeGate {
    frozen: AtomicBool,
    notify: tokio::sync::Notify,
}

impl FreezeGate {
    async fn wait_thawed(&self) {
        while self.frozen.load(Ordering::Acquire) {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.frozen.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

struct XferInner {
    tx: mpsc::UnboundedSender<XferCmd>,
    upump_mgr: UpumpMgr,
    gate: Arc<FreezeGate>,
    cancel: CancellationToken,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Transfer manager: one worker thread, one command queue.
#[derive(Clone)]
pub struct XferMgr {
    inner: Arc<XferInner>,
}

impl XferMgr {
    /// Spawns the worker thread and its event loop.
    ///
    /// # Errors
    ///
    /// `External` when the thread cannot be created.
    pub fn alloc(name: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<XferCmd>();
        let gate = Arc::new(FreezeGate { frozen: AtomicBool::new(false), notify: tokio::sync::Notify::new() });
        let cancel = CancellationToken::new();

        let loop_gate = gate.clone();
        let loop_cancel = cancel.clone();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!("cannot build transfer loop: {err}");
                        return;
                    }
                };
                if handle_tx.send(runtime.handle().clone()).is_err() {
                    return;
                }
                runtime.block_on(async move {
                    loop {
                        loop_gate.wait_thawed().await;
                        tokio::select! {
                            () = loop_cancel.cancelled() => break,
                            cmd = rx.recv() => match cmd {
                                Some(cmd) => apply(cmd),
                                None => break,
                            },
                        }
                    }
                    // Drain whatever was enqueued before shutdown so inner
                    // pipes are released here, on their own loop.
                    while let Ok(cmd) = rx.try_recv() {
                        apply(cmd);
                    }
                });
            })
            .map_err(|err| UbaseError::External(err.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| UbaseError::External("transfer loop died during setup".into()))?;
        Ok(Self {
            inner: Arc::new(XferInner {
                tx,
                upump_mgr: TokioUpumpMgr::from_handle(handle),
                gate,
                cancel,
                join: Mutex::new(Some(join)),
            }),
        })
    }

    /// The pump manager of the remote loop.
    #[must_use]
    pub fn upump_mgr(&self) -> UpumpMgr {
        self.inner.upump_mgr.clone()
    }

    /// Pauses dequeuing; already-queued commands stay queued. While frozen,
    /// proxies answer get-style commands directly from their inner.
    pub fn freeze(&self) {
        self.inner.gate.frozen.store(true, Ordering::Release);
    }

    /// Resumes dequeuing.
    pub fn thaw(&self) {
        self.inner.gate.frozen.store(false, Ordering::Release);
        self.inner.gate.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.gate.frozen.load(Ordering::Acquire)
    }

    /// Wraps `remote` in a proxy pipe. From here on the remote pipe must
    /// only be driven through the proxy; the remote loop's pump manager is
    /// attached to it as part of the migration.
    ///
    /// # Errors
    ///
    /// `Busy` when the worker is shutting down.
    pub fn alloc_pipe(&self, remote: Pipe, probe: Uprobe) -> Result<Pipe> {
        self.inner
            .tx
            .send(XferCmd::Control(
                remote.clone(),
                Command::AttachUpumpMgr(self.inner.upump_mgr.clone()),
                None,
            ))
            .map_err(|_| UbaseError::Busy)?;
        Ok(Pipe::build(
            Arc::new(XferPipeMgr),
            probe,
            XferOps { inner: self.inner.clone(), remote },
        ))
    }
}

impl Drop for XferInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let join = match self.join.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

fn apply(cmd: XferCmd) {
    match cmd {
        XferCmd::Input(pipe, uref) => pipe.input(uref),
        XferCmd::Control(pipe, command, reply_tx) => {
            let result = pipe.control(command);
            match reply_tx {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => {
                    if let Err(err) = result {
                        if !err.is_unhandled() {
                            tracing::debug!("transferred control failed: {err}");
                        }
                    }
                }
            }
        }
        XferCmd::Release(pipe) => drop(pipe),
    }
}

struct XferPipeMgr;

impl PipeManager for XferPipeMgr {
    fn signature(&self) -> u32 {
        XFER_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        // Proxies wrap an existing inner; use XferMgr::alloc_pipe.
        Err(UbaseError::Invalid)
    }
}

struct SyncControl {
    command: Command,
    reply_tx: Option<std::sync::mpsc::Sender<Result<Reply>>>,
}

/// Sends a command through the proxy and waits for the worker's reply.
/// Must be called from a thread that may block (not an event loop).
///
/// # Errors
///
/// `Busy` on timeout or a dead worker; otherwise the inner pipe's verdict.
pub fn control_sync(proxy: &Pipe, command: Command, timeout: Duration) -> Result<Reply> {
    let (reply_tx, reply_rx) = std::sync::mpsc::channel();
    proxy.control(Command::Custom(CustomCommand {
        signature: XFER_SIGNATURE,
        payload: Box::new(SyncControl { command, reply_tx: Some(reply_tx) }),
    }))?;
    reply_rx.recv_timeout(timeout).map_err(|_| UbaseError::Busy)?
}

/// Sends a command through the proxy without waiting; use it to reach the
/// inner pipe's own custom commands.
///
/// # Errors
///
/// `Busy` when the worker is shutting down.
pub fn control_async(proxy: &Pipe, command: Command) -> Result<()> {
    proxy
        .control(Command::Custom(CustomCommand {
            signature: XFER_SIGNATURE,
            payload: Box::new(SyncControl { command, reply_tx: None }),
        }))
        .map(|_| ())
}

struct XferOps {
    inner: Arc<XferInner>,
    remote: Pipe,
}

impl XferOps {
    fn enqueue(&self, cmd: XferCmd) -> Result<Reply> {
        self.inner.tx.send(cmd).map_err(|_| UbaseError::Busy)?;
        Ok(Reply::None)
    }
}

impl PipeOps for XferOps {
    fn control(&mut self, _ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            // Migration swaps in the remote loop's pump manager.
            Command::AttachUpumpMgr(_) => self.enqueue(XferCmd::Control(
                self.remote.clone(),
                Command::AttachUpumpMgr(self.inner.upump_mgr.clone()),
                None,
            )),
            command @ (Command::SetFlowDef(_)
            | Command::SetOutput(_)
            | Command::AttachUclock(_)
            | Command::RegisterRequest(_)
            | Command::UnregisterRequest(_)
            | Command::SetUri(_)
            | Command::SetOption(..)
            | Command::EndPreroll
            | Command::SetMaxLength(_)) => {
                self.enqueue(XferCmd::Control(self.remote.clone(), command, None))
            }
            Command::Custom(custom) => {
                let sync = custom.payload.downcast::<SyncControl>().map_err(|_| UbaseError::Invalid)?;
                self.enqueue(XferCmd::Control(self.remote.clone(), sync.command, sync.reply_tx))
            }
            command => {
                // Get-style introspection is only safe while frozen.
                if self.inner.gate.frozen.load(Ordering::Acquire) {
                    self.remote.control(command)
                } else {
                    Err(UbaseError::Busy)
                }
            }
        }
    }

    fn input(&mut self, _ctx: &mut PipeCtx<'_>, uref: Uref) {
        let _ = self.inner.tx.send(XferCmd::Input(self.remote.clone(), uref));
    }

    fn on_last_release(&mut self, _ctx: &mut PipeCtx<'_>) {
        // Ordered after everything already queued.
        let _ = self.inner.tx.send(XferCmd::Release(self.remote.clone()));
    }
}
