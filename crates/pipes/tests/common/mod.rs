// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

//! Test support: a recording sink observing everything a pipe emits.

use std::sync::{Arc, Mutex};
use upipe_core::prelude::*;

pub const RECORD_SIGNATURE: u32 = fourcc(*b"rsnk");

type FlowFormatAnswer = Box<dyn Fn(&Uref) -> Uref + Send + Sync>;

/// A sink storing every uref and flow def it receives. When built with a
/// flow-format answer, it serves `FlowFormat` requests the way a mux or
/// encoder would; every other request falls back to the probe chain.
pub struct RecordSink {
    pub pipe: Pipe,
    pub records: Arc<Mutex<Vec<Uref>>>,
    pub flow_defs: Arc<Mutex<Vec<Uref>>>,
}

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
    flow_format: Option<FlowFormatAnswer>,
}

impl PipeOps for RecordOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.flow_defs.lock().unwrap().push(flow_def);
                Ok(Reply::None)
            }
            Command::RegisterRequest(request) => {
                if request.kind() == RequestKind::FlowFormat {
                    if let (Some(answer), Some(proposal)) =
                        (&self.flow_format, request.flow_def())
                    {
                        let answer = answer(proposal);
                        ctx.provide(&request, Provision::FlowFormat(answer));
                        return Ok(Reply::None);
                    }
                }
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

pub fn record_sink(probe: Uprobe, flow_format: Option<FlowFormatAnswer>) -> RecordSink {
    let records = Arc::new(Mutex::new(Vec::new()));
    let flow_defs = Arc::new(Mutex::new(Vec::new()));
    let pipe = Pipe::build(
        Arc::new(RecordMgr),
        probe,
        RecordOps {
            records: records.clone(),
            flow_defs: flow_defs.clone(),
            flow_format,
        },
    );
    RecordSink { pipe, records, flow_defs }
}
