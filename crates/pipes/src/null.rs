// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A sink swallowing every uref it receives.
//!
//! Accepts any flow definition. With the `dump` option set, received urefs
//! have their attributes logged at debug level, which makes it a handy
//! graph terminator while debugging.

use upipe_core::prelude::*;

pub const NULL_SIGNATURE: u32 = fourcc(*b"null");

/// Manager for null pipes.
pub struct NullMgr;

impl NullMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        std::sync::Arc::new(Self)
    }
}

impl PipeManager for NullMgr {
    fn signature(&self) -> u32 {
        NULL_SIGNATURE
    }

    fn alloc(self: std::sync::Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Ok(Pipe::build(self, probe, NullOps { dump: false, count: 0 }))
    }
}

struct NullOps {
    dump: bool,
    count: u64,
}

impl PipeOps for NullOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(_) => Ok(Reply::None),
            Command::SetOption(key, value) => {
                if key == "dump" {
                    self.dump = value == "true";
                    Ok(Reply::None)
                } else {
                    Err(UbaseError::Invalid)
                }
            }
            Command::RegisterRequest(request) => {
                // Terminal pipe: nothing downstream, let the probes serve it.
                ctx.throw_provide_request(request);
                Ok(Reply::None)
            }
            Command::UnregisterRequest(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        self.count += 1;
        if self.dump {
            ctx.dbg(format!("dropped uref: {:?}", uref.attrs()));
        }
        drop(uref);
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        ctx.dbg(format!("dropped {} urefs", self.count));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn swallows_input_and_any_flow_def() {
        let null = alloc_void(&NullMgr::mgr(), Uprobe::new()).unwrap();
        let mut flow_def = Uref::new();
        flow_def.set_flow_def("void.whatever.");
        null.set_flow_def(&flow_def).unwrap();
        null.set_option("dump", "true").unwrap();
        null.input(Uref::new());
        assert!(null.set_option("unknown", "x").is_err());
    }
}
