// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipes, pipe managers, and the effects discipline.
//!
//! A [`Pipe`] is a handle to a processing instance allocated by a
//! [`PipeManager`]. Allocation fires `Ready` exactly once; dropping the
//! last handle fires `Dead` exactly once. Two reference levels exist:
//! external handles ([`Pipe`]) and internal anchors ([`PipeGuard`], used by
//! sub-pipes to pin their super). When the last *external* handle drops,
//! the pipe's [`PipeOps::on_last_release`] hook runs (composites use it to
//! signal `SOURCE_END` to their sub-pipes), and the pipe dies once the
//! anchors are gone too.
//!
//! Pipe state is mutated under a per-pipe mutex. Ops never call into
//! foreign objects directly: probe throws, uref forwarding, control calls
//! on other pipes, request provisions and releases are recorded on the
//! [`PipeCtx`] and executed by a per-thread trampoline once no pipe lock is
//! held. This keeps reentrancy safe (a probe may call `split_iterate` on
//! the pipe that raised the event) and preserves delivery order along each
//! edge.

use crate::control::{Command, Reply};
use crate::error::{Result, UbaseError};
use crate::uprobe::{Event, LogLevel, Uprobe};
use crate::urequest::{Provision, Request, RequestKind};
use crate::uref::Uref;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Builds the fourcc-style 32-bit signature carried by pipe managers.
#[must_use]
pub const fn fourcc(tag: [u8; 4]) -> u32 {
    u32::from_be_bytes(tag)
}

/// Arguments to a manager's alloc.
pub enum AllocArgs {
    /// A plain pipe.
    Void,
    /// A pipe parameterized by a flow definition (sub-pipes of splitters,
    /// joiners).
    Flow(Uref),
}

/// A refcounted pipe factory. It owns any process-wide state shared by the
/// pipes it allocates and outlives every one of them.
pub trait PipeManager: Send + Sync {
    /// The fourcc-like signature gating custom control commands.
    fn signature(&self) -> u32;

    /// Allocates a pipe in the `Ready` state. A failing allocator must not
    /// fire `Ready`.
    ///
    /// # Errors
    ///
    /// `Invalid` for unusable args, `Alloc` on resource exhaustion.
    fn alloc(self: Arc<Self>, probe: Uprobe, args: AllocArgs) -> Result<Pipe>;

    /// Releases process-wide caches (pool free-lists).
    fn vacuum(&self) {}
}

/// Shared manager handle.
pub type PipeMgr = Arc<dyn PipeManager>;

/// Allocates a plain pipe from a manager.
///
/// # Errors
///
/// Propagates the manager's alloc error.
pub fn alloc_void(mgr: &PipeMgr, probe: Uprobe) -> Result<Pipe> {
    mgr.clone().alloc(probe, AllocArgs::Void)
}

/// Allocates a flow-parameterized pipe from a manager.
///
/// # Errors
///
/// Propagates the manager's alloc error.
pub fn alloc_flow(mgr: &PipeMgr, probe: Uprobe, flow_def: Uref) -> Result<Pipe> {
    mgr.clone().alloc(probe, AllocArgs::Flow(flow_def))
}

/// Private per-pipe behavior and state, driven under the pipe's lock.
pub trait PipeOps: Send {
    /// The synchronous command bus.
    ///
    /// # Errors
    ///
    /// `Unhandled` for commands this pipe does not implement.
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply>;

    /// Data path. Must always consume the uref: free it, queue it, or
    /// transfer ownership by forwarding.
    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        drop(uref);
        ctx.warn("pipe does not accept input");
    }

    /// Called once, right after `Ready` fired, with the handle available
    /// through the context.
    fn on_ready(&mut self, _ctx: &mut PipeCtx<'_>) {}

    /// Called when the last external handle is dropped, before `Dead`.
    fn on_last_release(&mut self, _ctx: &mut PipeCtx<'_>) {}

    /// Delivery point for request provisions created via
    /// [`PipeCtx::make_request`].
    fn provided(&mut self, _ctx: &mut PipeCtx<'_>, _request_id: u64, _provision: Provision) {}
}

pub(crate) struct PipeCore {
    this: Weak<PipeCore>,
    mgr: PipeMgr,
    probe: Uprobe,
    shell: Mutex<Weak<PipeShell>>,
    ops: Mutex<Option<Box<dyn PipeOps>>>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PipeCore {
    fn throw_here(&self, event: &Event) {
        let pipe_ref = PipeRef { core: self };
        match self.probe.throw(&pipe_ref, event) {
            Err(UbaseError::Unhandled) => match event {
                Event::Fatal(err) => tracing::error!("unhandled fatal event: {err}"),
                Event::Error(err) => tracing::warn!("unhandled error event: {err}"),
                _ => {}
            },
            Ok(()) | Err(_) => {}
        }
    }

    fn with_ops<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut dyn PipeOps, &mut PipeCtx<'_>) -> R,
    ) -> Option<R> {
        let (result, deferred) = {
            let mut guard = lock_recover(&self.ops);
            let ops = guard.as_mut()?;
            let mut ctx = PipeCtx {
                core: self,
                this: Arc::downgrade(self),
                deferred: Vec::new(),
            };
            let result = f(ops.as_mut(), &mut ctx);
            (result, ctx.deferred)
        };
        dispatch(deferred);
        Some(result)
    }

    fn do_control(self: &Arc<Self>, command: Command) -> Result<Reply> {
        if let Command::Custom(custom) = &command {
            if custom.signature != self.mgr.signature() {
                return Err(UbaseError::Unhandled);
            }
        }
        self.with_ops(|ops, ctx| ops.control(ctx, command)).unwrap_or(Err(UbaseError::Busy))
    }

    fn do_input(self: &Arc<Self>, uref: Uref) {
        let _ = self.with_ops(|ops, ctx| ops.input(ctx, uref));
    }

    pub(crate) fn deliver_provision(self: &Arc<Self>, request_id: u64, provision: Provision) {
        let _ = self.with_ops(|ops, ctx| ops.provided(ctx, request_id, provision));
    }
}

impl Drop for PipeCore {
    fn drop(&mut self) {
        self.throw_here(&Event::Dead);
    }
}

pub(crate) struct PipeShell {
    core: Arc<PipeCore>,
}

impl Drop for PipeShell {
    fn drop(&mut self) {
        let _ = self.core.with_ops(|ops, ctx| ops.on_last_release(ctx));
    }
}

/// External handle to a pipe. Cloning shares the handle refcount; dropping
/// the last clone releases the pipe.
#[derive(Clone)]
pub struct Pipe {
    shell: Arc<PipeShell>,
}

impl Pipe {
    /// Creates a pipe around `ops` and fires `Ready`. Managers call this
    /// from their alloc.
    pub fn build(mgr: PipeMgr, probe: Uprobe, ops: impl PipeOps + 'static) -> Self {
        let core = Arc::new_cyclic(|this| PipeCore {
            this: this.clone(),
            mgr,
            probe,
            shell: Mutex::new(Weak::new()),
            ops: Mutex::new(Some(Box::new(ops))),
        });
        let shell = Arc::new(PipeShell { core: core.clone() });
        *lock_recover(&core.shell) = Arc::downgrade(&shell);
        let pipe = Self { shell };
        pipe.core().throw_here(&Event::Ready);
        let _ = pipe.core().with_ops(|ops, ctx| ops.on_ready(ctx));
        pipe
    }

    pub(crate) fn core(&self) -> &Arc<PipeCore> {
        &self.shell.core
    }

    pub(crate) fn from_core(core: &Arc<PipeCore>) -> Option<Self> {
        lock_recover(&core.shell).upgrade().map(|shell| Self { shell })
    }

    /// Feeds a uref into the pipe's data path.
    pub fn input(&self, uref: Uref) {
        self.core().do_input(uref);
    }

    /// Issues a control command.
    ///
    /// # Errors
    ///
    /// `Unhandled` for unknown commands (including custom commands whose
    /// signature does not match the manager), or the command's own error.
    pub fn control(&self, command: Command) -> Result<Reply> {
        self.core().do_control(command)
    }

    /// The manager this pipe was allocated from.
    #[must_use]
    pub fn mgr(&self) -> PipeMgr {
        self.core().mgr.clone()
    }

    /// Throws a log event through the pipe's probe chain.
    pub fn throw_log(&self, level: LogLevel, msg: impl Into<String>) {
        self.core().throw_here(&Event::Log(level, msg.into()));
    }

    /// Downgrades to a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakPipe {
        WeakPipe { shell: Arc::downgrade(&self.shell) }
    }

    /// An internal anchor keeping the pipe's state alive without counting
    /// as an external handle. Sub-pipes anchor their super this way.
    #[must_use]
    pub fn guard(&self) -> PipeGuard {
        PipeGuard { core: self.shell.core.clone() }
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shell.core, &other.shell.core)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").field("mgr", &self.core().mgr.signature()).finish()
    }
}

/// Non-owning pipe handle.
#[derive(Clone, Default)]
pub struct WeakPipe {
    shell: Weak<PipeShell>,
}

impl WeakPipe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn upgrade(&self) -> Option<Pipe> {
        self.shell.upgrade().map(|shell| Pipe { shell })
    }
}

/// Internal retention level: keeps a pipe's state alive without keeping it
/// externally referenced.
#[derive(Clone)]
pub struct PipeGuard {
    core: Arc<PipeCore>,
}

impl PipeGuard {
    /// Recovers an external handle, when any still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Pipe> {
        Pipe::from_core(&self.core)
    }

    /// Issues a control command at the anchor level.
    ///
    /// # Errors
    ///
    /// As [`Pipe::control`].
    pub fn control(&self, command: Command) -> Result<Reply> {
        self.core.do_control(command)
    }
}

/// Borrowed view of a pipe handed to probe handlers. During `Dead` the
/// external handles are gone, so `upgrade` yields `None`.
pub struct PipeRef<'a> {
    pub(crate) core: &'a PipeCore,
}

impl PipeRef<'_> {
    /// Recovers an external handle, when any still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Pipe> {
        lock_recover(&self.core.shell).upgrade().map(|shell| Pipe { shell })
    }

    /// Issues a control command on the pipe that raised the event.
    ///
    /// # Errors
    ///
    /// As [`Pipe::control`].
    pub fn control(&self, command: Command) -> Result<Reply> {
        match self.core.this.upgrade() {
            Some(core) => core.do_control(command),
            None => Err(UbaseError::Busy),
        }
    }

    /// The manager signature of the pipe that raised the event.
    #[must_use]
    pub fn signature(&self) -> u32 {
        self.core.mgr.signature()
    }
}

pub(crate) enum Action {
    Input { target: Pipe, uref: Uref },
    Control { target: Pipe, command: Command },
    RegisterDownstream { requester: Weak<PipeCore>, target: Pipe, request: Request },
    Throw { core: Weak<PipeCore>, event: Event },
    Provide { request: Request, provision: Provision },
    Release(#[allow(dead_code)] Box<dyn std::any::Any>),
}

thread_local! {
    static QUEUE: RefCell<VecDeque<Action>> = RefCell::new(VecDeque::new());
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(false));
    }
}

pub(crate) fn dispatch(actions: Vec<Action>) {
    if actions.is_empty() {
        return;
    }
    QUEUE.with(|q| q.borrow_mut().extend(actions));
    if ACTIVE.with(Cell::get) {
        // An outer trampoline is already draining this thread's queue.
        return;
    }
    ACTIVE.with(|a| a.set(true));
    let _guard = ActiveGuard;
    loop {
        let Some(action) = QUEUE.with(|q| q.borrow_mut().pop_front()) else { break };
        run_action(action);
    }
}

fn run_action(action: Action) {
    match action {
        Action::Input { target, uref } => target.core().do_input(uref),
        Action::Control { target, command } => {
            if let Err(err) = target.core().do_control(command) {
                if !err.is_unhandled() {
                    tracing::debug!("deferred control failed: {err}");
                }
            }
        }
        Action::RegisterDownstream { requester, target, request } => {
            if target.core().do_control(Command::RegisterRequest(request.clone())).is_err() {
                // Nothing along the output chain serves it; let the
                // requester's probe chain have a go.
                if let Some(core) = requester.upgrade() {
                    core.throw_here(&Event::ProvideRequest(request));
                }
            }
        }
        Action::Throw { core, event } => {
            if let Some(core) = core.upgrade() {
                core.throw_here(&event);
            }
        }
        Action::Provide { request, provision } => request.provide(provision),
        Action::Release(value) => drop(value),
    }
}

/// Execution context handed to [`PipeOps`] calls. Cross-object effects are
/// recorded here and run once the pipe's lock is released.
pub struct PipeCtx<'a> {
    core: &'a PipeCore,
    this: Weak<PipeCore>,
    deferred: Vec<Action>,
}

impl PipeCtx<'_> {
    /// The pipe's own external handle, when one still exists.
    #[must_use]
    pub fn pipe(&self) -> Option<Pipe> {
        lock_recover(&self.core.shell).upgrade().map(|shell| Pipe { shell })
    }

    /// The manager signature of this pipe.
    #[must_use]
    pub fn signature(&self) -> u32 {
        self.core.mgr.signature()
    }

    /// Raises an event through this pipe's probe chain.
    pub fn throw(&mut self, event: Event) {
        self.deferred.push(Action::Throw { core: self.this.clone(), event });
    }

    /// Raises an event through *another* pipe's probe chain (composites
    /// signalling their sub-pipes).
    pub fn throw_at(&mut self, target: &Pipe, event: Event) {
        self.deferred
            .push(Action::Throw { core: Arc::downgrade(target.core()), event });
    }

    /// Forwards a uref to another pipe's data path.
    pub fn forward(&mut self, target: &Pipe, uref: Uref) {
        self.deferred.push(Action::Input { target: target.clone(), uref });
    }

    /// Issues a fire-and-forget control command on another pipe.
    pub fn send_control(&mut self, target: &Pipe, command: Command) {
        self.deferred.push(Action::Control { target: target.clone(), command });
    }

    /// Registers a request on the downstream pipe; when the chain cannot
    /// serve it, the request comes back as `ProvideRequest` on this pipe's
    /// probe chain.
    pub fn register_downstream(&mut self, target: &Pipe, request: Request) {
        self.deferred.push(Action::RegisterDownstream {
            requester: this_weak(&self.this),
            target: target.clone(),
            request,
        });
    }

    /// Raises `ProvideRequest` on this pipe's own probe chain, for pipes
    /// with no output to forward a request to.
    pub fn throw_provide_request(&mut self, request: Request) {
        self.throw(Event::ProvideRequest(request));
    }

    /// Serves a request this pipe received.
    pub fn provide(&mut self, request: &Request, provision: Provision) {
        self.deferred.push(Action::Provide { request: request.clone(), provision });
    }

    /// Defers dropping a value (pipes, pumps) until no lock is held.
    pub fn release_later(&mut self, value: impl std::any::Any) {
        self.deferred.push(Action::Release(Box::new(value)));
    }

    /// Builds a request whose provision is delivered to this pipe's
    /// [`PipeOps::provided`] hook.
    #[must_use]
    pub fn make_request(&self, kind: RequestKind, flow_def: Option<Uref>) -> Request {
        let this = self.this.clone();
        Request::new(kind, flow_def, move |request, provision| {
            if let Some(core) = this.upgrade() {
                // Invoked from the trampoline's provide action or from a
                // probe handler, never under this pipe's lock.
                core.deliver_provision(request.id(), provision);
            }
        })
    }

    pub fn log(&mut self, level: LogLevel, msg: impl Into<String>) {
        self.throw(Event::Log(level, msg.into()));
    }

    pub fn verbose(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Verbose, msg);
    }

    pub fn dbg(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Warning, msg);
    }

    pub fn err(&mut self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg);
    }

    /// Raises a recoverable error event.
    pub fn error(&mut self, err: UbaseError) {
        self.throw(Event::Error(err));
    }

    /// Raises a fatal event; policy (exit or not) belongs to the probes.
    pub fn fatal(&mut self, err: UbaseError) {
        self.throw(Event::Fatal(err));
    }
}

fn this_weak(this: &Weak<PipeCore>) -> Weak<PipeCore> {
    this.clone()
}
