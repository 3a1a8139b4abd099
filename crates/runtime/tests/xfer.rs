// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

//! Transfer-manager contracts: FIFO delivery, input/control ordering,
//! freeze introspection, and release draining.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use upipe_core::prelude::*;
use upipe_runtime::xfer::{self, XferMgr};

const TRACE_SIGNATURE: u32 = fourcc(*b"trce");

/// A pipe recording, in order, everything that happens to it.
struct TraceMgr;

impl PipeManager for TraceMgr {
    fn signature(&self) -> u32 {
        TRACE_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        // Trace pipes are built directly so the test can hold their log.
        Err(UbaseError::Invalid)
    }
}

struct TraceOps {
    log: Arc<Mutex<Vec<String>>>,
}

impl PipeOps for TraceOps {
    fn control(&mut self, _ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetOption(key, value) => {
                self.log.lock().unwrap().push(format!("option {key}={value}"));
                Ok(Reply::None)
            }
            Command::GetUri => Ok(Reply::Uri(Some("trace://".into()))),
            Command::AttachUpumpMgr(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, _ctx: &mut PipeCtx<'_>, uref: Uref) {
        let seq = uref.attrs().get_unsigned("seq").unwrap_or(u64::MAX);
        self.log.lock().unwrap().push(format!("input {seq}"));
    }
}

fn trace_pipe(probe: Uprobe) -> (Pipe, Arc<Mutex<Vec<String>>>) {
    let shared = Arc::new(Mutex::new(Vec::new()));
    let mgr: PipeMgr = Arc::new(TraceMgr);
    let pipe = Pipe::build(mgr, probe, TraceOps { log: shared.clone() });
    (pipe, shared)
}

fn data(seq: u64) -> Uref {
    let mut uref = Uref::new();
    uref.attrs_mut().set_unsigned("seq", seq);
    uref
}

fn barrier(proxy: &Pipe) {
    // A synchronous round trip through the worker flushes the queue.
    let reply = xfer::control_sync(proxy, Command::GetUri, Duration::from_secs(5)).unwrap();
    assert!(matches!(reply, Reply::Uri(Some(_))));
}

#[test]
fn commands_are_applied_in_enqueue_order() {
    let mgr = XferMgr::alloc("xfer-fifo").unwrap();
    let (remote, log) = trace_pipe(Uprobe::new());
    let proxy = mgr.alloc_pipe(remote, Uprobe::new()).unwrap();

    for seq in 0..50 {
        proxy.input(data(seq));
    }
    proxy.set_option("mark", "mid").unwrap();
    for seq in 50..100 {
        proxy.input(data(seq));
    }
    barrier(&proxy);

    let log = log.lock().unwrap();
    let mut expected: Vec<String> = (0..50).map(|i| format!("input {i}")).collect();
    expected.push("option mark=mid".into());
    expected.extend((50..100).map(|i| format!("input {i}")));
    assert_eq!(*log, expected);
}

#[test]
fn frozen_manager_allows_direct_introspection() {
    let mgr = XferMgr::alloc("xfer-freeze").unwrap();
    let (remote, log) = trace_pipe(Uprobe::new());
    let proxy = mgr.alloc_pipe(remote, Uprobe::new()).unwrap();
    barrier(&proxy);

    // Unfrozen: get-style commands on the proxy are refused.
    assert!(matches!(proxy.get_uri(), Err(UbaseError::Busy)));

    mgr.freeze();
    assert!(mgr.is_frozen());
    assert_eq!(proxy.get_uri().unwrap(), Some("trace://".into()));

    // Frozen input stays queued.
    proxy.input(data(7));
    std::thread::sleep(Duration::from_millis(50));
    assert!(log.lock().unwrap().is_empty());

    mgr.thaw();
    barrier(&proxy);
    assert_eq!(log.lock().unwrap().as_slice(), ["input 7"]);
}

#[test]
fn release_drains_queued_commands_first() {
    let mgr = XferMgr::alloc("xfer-release").unwrap();
    let dead = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dead_in = dead.clone();
    let probe = Uprobe::new().push(UprobeFn(move |_: &PipeRef<'_>, event: &Event| {
        if matches!(event, Event::Dead) {
            dead_in.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        Err(UbaseError::Unhandled)
    }));
    let (remote, log) = trace_pipe(probe);
    let proxy = mgr.alloc_pipe(remote, Uprobe::new()).unwrap();

    for seq in 0..20 {
        proxy.input(data(seq));
    }
    drop(proxy);
    // Dropping the manager joins the worker after the queue drained.
    drop(mgr);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 20);
    assert!(dead.load(std::sync::atomic::Ordering::Relaxed));
}
