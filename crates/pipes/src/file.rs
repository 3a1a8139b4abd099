// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! File source and sink.
//!
//! The source opens the endpoint given by `SetUri`, reads fixed-size
//! blocks on an idler pump, stamps `cr_sys` when a clock is attached, and
//! raises `SourceEnd` at end of file. `SetUri` may be called repeatedly;
//! each call closes the previous endpoint. The sink writes every block
//! uref to its endpoint in segment order and raises `SinkEnd` on write
//! failure.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use upipe_core::flow;
use upipe_core::prelude::*;
use upipe_core::ubuf::UbufBlock;

pub const FSRC_SIGNATURE: u32 = fourcc(*b"fsrc");
pub const FSINK_SIGNATURE: u32 = fourcc(*b"fsnk");

const DEFAULT_READ_SIZE: usize = 4096;

/// Custom command: perform one read. The pump uses it; tests may drive it
/// directly.
pub struct ReadTick;

/// Asks the source to read one block now.
///
/// # Errors
///
/// `Unhandled` when `pipe` is not a file source.
pub fn read_tick(pipe: &Pipe) -> Result<bool> {
    match pipe.control(Command::Custom(CustomCommand {
        signature: FSRC_SIGNATURE,
        payload: Box::new(ReadTick),
    }))? {
        Reply::Custom(more) => Ok(*more.downcast::<bool>().map_err(|_| UbaseError::Invalid)?),
        _ => Err(UbaseError::Invalid),
    }
}

/// Manager for file sources.
pub struct FileSrcMgr;

impl FileSrcMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        Arc::new(Self)
    }
}

impl PipeManager for FileSrcMgr {
    fn signature(&self) -> u32 {
        FSRC_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Ok(Pipe::build(
            self,
            probe,
            FileSrcOps {
                output: OutputHelper::new(),
                uri: None,
                file: None,
                read_size: DEFAULT_READ_SIZE,
                uclock: None,
                upump_mgr: None,
                pump: None,
                uref_mgr: None,
                uref_request: None,
                this: WeakPipe::new(),
            },
        ))
    }
}

struct FileSrcOps {
    output: OutputHelper,
    uri: Option<String>,
    file: Option<File>,
    read_size: usize,
    uclock: Option<Uclock>,
    upump_mgr: Option<UpumpMgr>,
    pump: Option<Upump>,
    uref_mgr: Option<UrefMgr>,
    uref_request: Option<Request>,
    this: WeakPipe,
}

impl FileSrcOps {
    fn stop_pump(&mut self, ctx: &mut PipeCtx<'_>) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
            ctx.release_later(pump);
        }
    }

    fn maybe_start_pump(&mut self, ctx: &mut PipeCtx<'_>) {
        if self.pump.is_some() || self.file.is_none() {
            return;
        }
        let Some(upump_mgr) = &self.upump_mgr else {
            ctx.throw(Event::NeedUpumpMgr);
            return;
        };
        let this = self.this.clone();
        let cb: PumpCallback = Box::new(move || match this.upgrade() {
            Some(pipe) => read_tick(&pipe).unwrap_or(false),
            None => false,
        });
        match upump_mgr.alloc_idler(cb) {
            Ok(mut pump) => {
                pump.start();
                self.pump = Some(pump);
            }
            Err(err) => ctx.fatal(err),
        }
    }

    fn read_once(&mut self, ctx: &mut PipeCtx<'_>) -> bool {
        let Some(file) = self.file.as_mut() else { return false };
        let mut buf = vec![0; self.read_size];
        match file.read(&mut buf) {
            Ok(0) => {
                ctx.dbg("end of file reached");
                self.file = None;
                self.stop_pump(ctx);
                ctx.throw(Event::SourceEnd);
                false
            }
            Ok(n) => {
                buf.truncate(n);
                let mut uref = self.uref_mgr.as_ref().map_or_else(Uref::new, UrefMgr::alloc);
                uref.attach_ubuf(Ubuf::Block(UbufBlock::from_slice(&buf)));
                if let Some(clock) = &self.uclock {
                    uref.set_cr_sys(clock.now());
                }
                self.output.output(ctx, uref);
                true
            }
            Err(err) => {
                ctx.err(format!("read error: {err}"));
                self.file = None;
                self.stop_pump(ctx);
                ctx.throw(Event::SourceEnd);
                false
            }
        }
    }
}

impl PipeOps for FileSrcOps {
    fn on_ready(&mut self, ctx: &mut PipeCtx<'_>) {
        if let Some(pipe) = ctx.pipe() {
            self.this = pipe.downgrade();
        }
    }

    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        let command = upipe_core::helper_control!(self.output, ctx, command);
        match command {
            Command::SetUri(uri) => {
                self.stop_pump(ctx);
                self.file = Some(File::open(&uri)?);
                ctx.info(format!("opening {uri}"));
                self.uri = Some(uri);

                if let Some(request) = self.uref_request.take() {
                    self.output.unregister_request(ctx, &request);
                }
                let request = ctx.make_request(RequestKind::UrefMgr, None);
                self.uref_request = Some(request.clone());
                self.output.register_request(ctx, request);

                let mut flow_def = self.uref_mgr.as_ref().map_or_else(Uref::new, UrefMgr::alloc);
                flow_def.set_flow_def(flow::DEF_BLOCK);
                self.output.store_flow_def(ctx, flow_def);

                self.maybe_start_pump(ctx);
                Ok(Reply::None)
            }
            Command::GetUri => Ok(Reply::Uri(self.uri.clone())),
            Command::AttachUpumpMgr(mgr) => {
                self.upump_mgr = Some(mgr);
                self.stop_pump(ctx);
                self.maybe_start_pump(ctx);
                Ok(Reply::None)
            }
            Command::AttachUclock(clock) => {
                self.uclock = Some(clock);
                Ok(Reply::None)
            }
            Command::SetOption(key, value) => match key.as_str() {
                "read_size" => {
                    self.read_size = value.parse().map_err(|_| UbaseError::Invalid)?;
                    Ok(Reply::None)
                }
                _ => Err(UbaseError::Invalid),
            },
            Command::Custom(custom) => {
                custom.payload.downcast::<ReadTick>().map_err(|_| UbaseError::Invalid)?;
                let more = self.read_once(ctx);
                Ok(Reply::Custom(Box::new(more)))
            }
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn provided(&mut self, _ctx: &mut PipeCtx<'_>, _request_id: u64, provision: Provision) {
        if let Provision::UrefMgr(mgr) = provision {
            self.uref_mgr = Some(mgr);
        }
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        self.stop_pump(ctx);
        self.output.clean(ctx);
    }
}

/// Manager for file sinks.
pub struct FileSinkMgr;

impl FileSinkMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        Arc::new(Self)
    }
}

impl PipeManager for FileSinkMgr {
    fn signature(&self) -> u32 {
        FSINK_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Ok(Pipe::build(self, probe, FileSinkOps { uri: None, file: None, failed: false }))
    }
}

struct FileSinkOps {
    uri: Option<String>,
    file: Option<File>,
    failed: bool,
}

impl PipeOps for FileSinkOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(flow_def) => {
                flow_def.match_flow_def(flow::DEF_BLOCK)?;
                Ok(Reply::None)
            }
            Command::SetUri(uri) => {
                self.file = Some(File::create(&uri)?);
                ctx.info(format!("writing to {uri}"));
                self.uri = Some(uri);
                self.failed = false;
                Ok(Reply::None)
            }
            Command::GetUri => Ok(Reply::Uri(self.uri.clone())),
            Command::RegisterRequest(request) => {
                ctx.throw_provide_request(request);
                Ok(Reply::None)
            }
            Command::UnregisterRequest(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        let Some(file) = self.file.as_mut() else {
            ctx.warn("no uri set, dropping uref");
            return;
        };
        let Some(Ubuf::Block(block)) = uref.ubuf() else {
            // Control urefs carry nothing to persist.
            return;
        };
        for seg in block.segments() {
            if let Err(err) = file.write_all(seg) {
                if !self.failed {
                    self.failed = true;
                    ctx.err(format!("write error: {err}"));
                    ctx.error(UbaseError::External(err.to_string()));
                    ctx.throw(Event::SinkEnd);
                }
                return;
            }
        }
    }

    fn on_last_release(&mut self, _ctx: &mut PipeCtx<'_>) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn source_reads_whole_file_then_ends() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&payload).unwrap();

        let ended = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ended_in = ended.clone();
        let probe = Uprobe::new().push(UprobeFn(move |_: &PipeRef<'_>, event: &Event| {
            if matches!(event, Event::SourceEnd) {
                ended_in.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            Err(UbaseError::Unhandled)
        }));

        let src = alloc_void(&FileSrcMgr::mgr(), probe).unwrap();
        src.set_option("read_size", "4096").unwrap();
        src.set_uri(tmp.path().to_str().unwrap()).unwrap();

        let out = tempfile::NamedTempFile::new().unwrap();
        let sink = src.alloc_output(&FileSinkMgr::mgr(), Uprobe::new()).unwrap();
        sink.set_uri(out.path().to_str().unwrap()).unwrap();

        while read_tick(&src).unwrap() {}
        assert!(ended.load(std::sync::atomic::Ordering::Relaxed));

        drop(sink);
        drop(src);
        let written = std::fs::read(out.path()).unwrap();
        assert_eq!(written, payload);
    }

    #[test]
    fn source_rejects_missing_file() {
        let src = alloc_void(&FileSrcMgr::mgr(), Uprobe::new()).unwrap();
        assert!(src.set_uri("/nonexistent/definitely/not/here").is_err());
        assert_eq!(src.get_uri().unwrap(), None);
    }

    #[test]
    fn sink_requires_block_flow_def() {
        let sink = alloc_void(&FileSinkMgr::mgr(), Uprobe::new()).unwrap();
        let mut flow_def = Uref::new();
        flow_def.set_flow_def("sound.");
        assert!(sink.set_flow_def(&flow_def).is_err());
        flow_def.set_flow_def("block.");
        sink.set_flow_def(&flow_def).unwrap();
    }
}
