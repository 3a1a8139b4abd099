// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Event-pump contracts.
//!
//! A [`UpumpMgr`] binds pipes to an event loop; source pipes allocate
//! timers and idlers from it and reschedule themselves. The concrete
//! binding lives in the runtime crate; the core only fixes the contract so
//! `Command::AttachUpumpMgr` can carry a manager across crate boundaries.
//!
//! A pump callback returns `true` to stay scheduled and `false` to retire
//! itself (a source hitting end of stream, a drain finding its queue gone).

use crate::error::Result;
use std::sync::Arc;

/// Callback invoked on each pump firing.
pub type PumpCallback = Box<dyn FnMut() -> bool + Send>;

/// Factory for pumps on one event loop. All delays count 27 MHz ticks.
pub trait UpumpMgrOps: Send + Sync {
    /// A timer firing once after `after`, then every `repeat` when given.
    fn alloc_timer(&self, after: u64, repeat: Option<u64>, cb: PumpCallback) -> Result<Upump>;

    /// An idler firing whenever the loop has nothing better to do.
    fn alloc_idler(&self, cb: PumpCallback) -> Result<Upump>;

    /// A watcher firing whenever `signal` is raised; the callback is
    /// expected to drain whatever the signal covers.
    fn alloc_signal_watcher(&self, signal: Usignal, cb: PumpCallback) -> Result<Upump>;
}

/// Refcounted pump-manager handle.
#[derive(Clone)]
pub struct UpumpMgr {
    ops: Arc<dyn UpumpMgrOps>,
}

impl UpumpMgr {
    #[must_use]
    pub fn new(ops: Arc<dyn UpumpMgrOps>) -> Self {
        Self { ops }
    }

    /// # Errors
    ///
    /// `Upump` when the loop refuses the pump.
    pub fn alloc_timer(&self, after: u64, repeat: Option<u64>, cb: PumpCallback) -> Result<Upump> {
        self.ops.alloc_timer(after, repeat, cb)
    }

    /// # Errors
    ///
    /// `Upump` when the loop refuses the pump.
    pub fn alloc_idler(&self, cb: PumpCallback) -> Result<Upump> {
        self.ops.alloc_idler(cb)
    }

    /// # Errors
    ///
    /// `Upump` when the loop refuses the pump.
    pub fn alloc_signal_watcher(&self, signal: Usignal, cb: PumpCallback) -> Result<Upump> {
        self.ops.alloc_signal_watcher(signal, cb)
    }
}

/// Start/stop handle for one allocated pump. Dropping the handle retires
/// the pump.
pub trait UpumpOps: Send {
    fn start(&mut self);
    fn stop(&mut self);
}

pub struct Upump {
    ops: Box<dyn UpumpOps>,
}

impl Upump {
    #[must_use]
    pub fn new(ops: Box<dyn UpumpOps>) -> Self {
        Self { ops }
    }

    pub fn start(&mut self) {
        self.ops.start();
    }

    pub fn stop(&mut self) {
        self.ops.stop();
    }
}

/// A cross-thread wakeup flag for queue-style pumps.
#[derive(Clone, Default)]
pub struct Usignal {
    notify: Arc<tokio::sync::Notify>,
}

impl Usignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal; at least one subsequent watcher firing is
    /// guaranteed.
    pub fn raise(&self) {
        self.notify.notify_one();
    }

    /// Waits until the signal is raised.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
