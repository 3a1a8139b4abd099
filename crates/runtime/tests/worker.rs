// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

//! Queue-pair and worker-bin scenarios: FIFO delivery across loops, flow
//! defs first, and a file source running on a worker thread.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use upipe_core::prelude::*;
use upipe_runtime::{queue, worker, TokioUpumpMgr, XferMgr};

const RECORD_SIGNATURE: u32 = fourcc(*b"rsnk");

struct RecordMgr;

impl PipeManager for RecordMgr {
    fn signature(&self) -> u32 {
        RECORD_SIGNATURE
    }

    fn alloc(self: Arc<Self>, _probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Err(UbaseError::Invalid)
    }
}

struct RecordOps {
    records: Arc<Mutex<Vec<Uref>>>,
    flow_defs: Arc<Mutex<Vec<Uref>>>,
}

impl PipeOps for RecordOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.flow_defs.lock().unwrap().push(flow_def);
                Ok(Reply::None)
            }
            Command::RegisterRequest(request) => {
                ctx.throw_provide_request(request);
                Ok(Reply::None)
            }
            Command::UnregisterRequest(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, _ctx: &mut PipeCtx<'_>, uref: Uref) {
        self.records.lock().unwrap().push(uref);
    }
}

#[allow(clippy::type_complexity)]
fn record_sink() -> (Pipe, Arc<Mutex<Vec<Uref>>>, Arc<Mutex<Vec<Uref>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let flow_defs = Arc::new(Mutex::new(Vec::new()));
    let pipe = Pipe::build(
        Arc::new(RecordMgr),
        Uprobe::new(),
        RecordOps { records: records.clone(), flow_defs: flow_defs.clone() },
    );
    (pipe, records, flow_defs)
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn queue_pair_preserves_order_and_flow_def_precedence() {
    let (pump_mgr, _loop_thread) = TokioUpumpMgr::spawn_thread("queue-test").unwrap();
    let (qsink, qsrc) = queue::alloc_pair(Uprobe::new(), Uprobe::new(), 8).unwrap();
    let (sink, records, flow_defs) = record_sink();
    qsrc.set_output(&sink).unwrap();
    qsrc.attach_upump_mgr(&pump_mgr).unwrap();

    assert_eq!(qsink.get_max_length().unwrap(), 8);
    qsink.set_max_length(4).unwrap();
    assert_eq!(qsrc.get_max_length().unwrap(), 4);

    let mut flow_def = Uref::new();
    flow_def.set_flow_def("block.");
    qsink.set_flow_def(&flow_def).unwrap();
    for seq in 0..100u64 {
        let mut uref = Uref::new();
        uref.attrs_mut().set_unsigned("seq", seq);
        qsink.input(uref);
    }

    assert!(wait_until(Duration::from_secs(5), || records.lock().unwrap().len() == 100));
    let seqs: Vec<u64> = records
        .lock()
        .unwrap()
        .iter()
        .map(|u| u.attrs().get_unsigned("seq").unwrap())
        .collect();
    assert_eq!(seqs, (0..100).collect::<Vec<u64>>());
    assert_eq!(flow_defs.lock().unwrap().len(), 1);
}

#[test]
fn queue_sink_release_propagates_source_end() {
    let (pump_mgr, _loop_thread) = TokioUpumpMgr::spawn_thread("queue-end").unwrap();
    let ended = Arc::new(AtomicBool::new(false));
    let ended_in = ended.clone();
    let src_probe = Uprobe::new().push(UprobeFn(move |_: &PipeRef<'_>, event: &Event| {
        if matches!(event, Event::SourceEnd) {
            ended_in.store(true, Ordering::Relaxed);
        }
        Err(UbaseError::Unhandled)
    }));
    let (qsink, qsrc) = queue::alloc_pair(Uprobe::new(), src_probe, 8).unwrap();
    let (sink, records, _) = record_sink();
    qsrc.set_output(&sink).unwrap();
    qsrc.attach_upump_mgr(&pump_mgr).unwrap();

    let mut flow_def = Uref::new();
    flow_def.set_flow_def("block.");
    qsink.set_flow_def(&flow_def).unwrap();
    qsink.input(Uref::new());
    drop(qsink);

    assert!(wait_until(Duration::from_secs(5), || ended.load(Ordering::Relaxed)));
    assert_eq!(records.lock().unwrap().len(), 1);
}

#[test]
fn worker_source_runs_a_file_source_remotely() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 249) as u8).collect();
    tmp.write_all(&payload).unwrap();

    let xfer = XferMgr::alloc("worker-src").unwrap();
    let (local_pump, _loop_thread) = TokioUpumpMgr::spawn_thread("worker-local").unwrap();

    let fsrc = alloc_void(&upipe_pipes::file::FileSrcMgr::mgr(), Uprobe::new()).unwrap();
    let bin = worker::alloc_source(&xfer, Uprobe::new(), fsrc, 16).unwrap();

    let (sink, records, flow_defs) = record_sink();
    bin.set_output(&sink).unwrap();
    bin.attach_upump_mgr(&local_pump).unwrap();

    // Terminals are exposed for wiring.
    assert!(bin.bin_get_first_inner().unwrap().is_none());
    assert!(bin.bin_get_last_inner().unwrap().is_some());

    // Configure the remote source through the bin; reads start on the
    // worker loop.
    bin.set_uri(tmp.path().to_str().unwrap()).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        let total: usize = records
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.block_size().unwrap_or(0))
            .sum();
        total == payload.len()
    }));

    let collected: Vec<u8> = records
        .lock()
        .unwrap()
        .iter()
        .flat_map(|u| u.block_to_vec().unwrap())
        .collect();
    assert_eq!(collected, payload);
    assert_eq!(
        flow_defs.lock().unwrap().first().and_then(|f| f.flow_def().map(str::to_owned)),
        Some("block.".to_owned())
    );

    drop(bin);
    drop(xfer);
}
