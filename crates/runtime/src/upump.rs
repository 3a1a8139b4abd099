// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Tokio binding of the event-pump contract.
//!
//! A [`TokioUpumpMgr`] schedules pumps as tasks on a tokio runtime handle.
//! [`TokioUpumpMgr::spawn_thread`] stands up a dedicated single-threaded
//! loop, which is how the transfer manager gives each worker its own event
//! loop. Pumps are allocated stopped; `start` spawns the task, `stop`
//! cancels it, and a stopped pump can be started again.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use upipe_core::error::{Result, UbaseError};
use upipe_core::upump::{PumpCallback, Upump, UpumpMgr, UpumpMgrOps, UpumpOps, Usignal};

/// Converts 27 MHz ticks to a wall-clock duration.
#[must_use]
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1000) / 27)
}

/// Pump factory over a tokio runtime.
pub struct TokioUpumpMgr {
    handle: tokio::runtime::Handle,
}

impl TokioUpumpMgr {
    /// Wraps an existing runtime.
    #[must_use]
    pub fn from_handle(handle: tokio::runtime::Handle) -> UpumpMgr {
        UpumpMgr::new(Arc::new(Self { handle }))
    }

    /// Spawns a dedicated event-loop thread and returns its pump manager.
    /// Dropping the guard shuts the loop down.
    ///
    /// # Errors
    ///
    /// `External` when the thread or runtime cannot be created.
    pub fn spawn_thread(name: &str) -> Result<(UpumpMgr, UpumpThread)> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!("cannot build event loop: {err}");
                        return;
                    }
                };
                if handle_tx.send(runtime.handle().clone()).is_err() {
                    return;
                }
                runtime.block_on(loop_cancel.cancelled());
            })
            .map_err(|err| UbaseError::External(err.to_string()))?;
        let handle = handle_rx
            .recv()
            .map_err(|_| UbaseError::External("event loop died during setup".into()))?;
        Ok((Self::from_handle(handle), UpumpThread { cancel, join: Some(join) }))
    }
}

/// Keeps a dedicated event-loop thread alive; drop to shut it down.
pub struct UpumpThread {
    cancel: CancellationToken,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for UpumpThread {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

enum PumpKind {
    Timer { after: u64, repeat: Option<u64> },
    Idler,
    Signal(Usignal),
}

struct TokioPump {
    handle: tokio::runtime::Handle,
    kind: PumpKind,
    cb: Arc<Mutex<PumpCallback>>,
    cancel: Option<CancellationToken>,
}

fn fire(cb: &Arc<Mutex<PumpCallback>>) -> bool {
    let mut guard = match cb.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    (guard)()
}

impl UpumpOps for TokioPump {
    fn start(&mut self) {
        if self.cancel.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        let cb = self.cb.clone();
        match &self.kind {
            PumpKind::Timer { after, repeat } => {
                let after = ticks_to_duration(*after);
                let repeat = repeat.map(ticks_to_duration);
                self.handle.spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(after) => {}
                    }
                    loop {
                        if cancel.is_cancelled() || !fire(&cb) {
                            return;
                        }
                        let Some(period) = repeat else { return };
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(period) => {}
                        }
                    }
                });
            }
            PumpKind::Idler => {
                self.handle.spawn(async move {
                    loop {
                        if cancel.is_cancelled() || !fire(&cb) {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                });
            }
            PumpKind::Signal(signal) => {
                let signal = signal.clone();
                self.handle.spawn(async move {
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = signal.wait() => {}
                        }
                        if !fire(&cb) {
                            return;
                        }
                    }
                });
            }
        }
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl Drop for TokioPump {
    fn drop(&mut self) {
        self.stop();
    }
}

impl UpumpMgrOps for TokioUpumpMgr {
    fn alloc_timer(&self, after: u64, repeat: Option<u64>, cb: PumpCallback) -> Result<Upump> {
        Ok(Upump::new(Box::new(TokioPump {
            handle: self.handle.clone(),
            kind: PumpKind::Timer { after, repeat },
            cb: Arc::new(Mutex::new(cb)),
            cancel: None,
        })))
    }

    fn alloc_idler(&self, cb: PumpCallback) -> Result<Upump> {
        Ok(Upump::new(Box::new(TokioPump {
            handle: self.handle.clone(),
            kind: PumpKind::Idler,
            cb: Arc::new(Mutex::new(cb)),
            cancel: None,
        })))
    }

    fn alloc_signal_watcher(&self, signal: Usignal, cb: PumpCallback) -> Result<Upump> {
        Ok(Upump::new(Box::new(TokioPump {
            handle: self.handle.clone(),
            kind: PumpKind::Signal(signal),
            cb: Arc::new(Mutex::new(cb)),
            cancel: None,
        })))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use upipe_core::uclock::UCLOCK_FREQ;

    #[test]
    fn ticks_convert_to_wall_clock() {
        assert_eq!(ticks_to_duration(UCLOCK_FREQ), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(27), Duration::from_micros(1));
    }

    #[test]
    fn timer_fires_and_repeats_until_stopped() {
        let (mgr, _thread) = TokioUpumpMgr::spawn_thread("pump-test").unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_in = count.clone();
        let mut pump = mgr
            .alloc_timer(
                0,
                Some(UCLOCK_FREQ / 1000),
                Box::new(move || {
                    count_in.fetch_add(1, Ordering::Relaxed);
                    true
                }),
            )
            .unwrap();
        pump.start();
        std::thread::sleep(Duration::from_millis(50));
        pump.stop();
        let seen = count.load(Ordering::Relaxed);
        assert!(seen > 1, "timer should have fired repeatedly, saw {seen}");
        std::thread::sleep(Duration::from_millis(20));
        assert!(count.load(Ordering::Relaxed) - seen <= 1, "timer kept firing after stop");
    }

    #[test]
    fn signal_watcher_fires_per_raise() {
        let (mgr, _thread) = TokioUpumpMgr::spawn_thread("signal-test").unwrap();
        let signal = Usignal::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_in = count.clone();
        let mut pump = mgr
            .alloc_signal_watcher(
                signal.clone(),
                Box::new(move || {
                    count_in.fetch_add(1, Ordering::Relaxed);
                    true
                }),
            )
            .unwrap();
        pump.start();
        signal.raise();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::Relaxed) >= 1);
    }
}
