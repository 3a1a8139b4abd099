// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Splits packed (interleaved) audio into planar outputs.
//!
//! Each output is a sub-pipe allocated with a flow definition naming the
//! channels it wants: `sound.channels`, `sound.planes` and a channel
//! bitfield over the input layout. Every input uref is de-interleaved per
//! sub into a buffer from the sub's negotiated sound manager; timestamps
//! and the other attributes ride along unchanged. Sub flow definitions
//! inherit the input definition, rate and latency, and recompute the
//! sample size for their own layout.

use std::sync::{Arc, Mutex, MutexGuard};
use upipe_core::flow;
use upipe_core::prelude::*;

pub const AUDIO_SPLIT_SIGNATURE: u32 = fourcc(*b"aspl");
pub const AUDIO_SPLIT_SUB_SIGNATURE: u32 = fourcc(*b"assb");

/// Bit `i` selects input channel `i`; set on a sub's flow-def parameters.
pub const BITFIELD: &str = "audio_split.bitfield";

/// Sets the channel bitfield on a sub's flow-def parameters.
pub fn set_bitfield(flow_def: &mut Uref, bitfield: u64) {
    flow_def.attrs_mut().set_unsigned(BITFIELD, bitfield);
}

struct Process(Uref);
struct Rebuild;

struct SplitShared {
    flow_def: Option<Uref>,
    sample_size: u8,
    channels: u8,
    channel_sample_size: u8,
    subs: SubRegistry,
}

fn lock(shared: &Mutex<SplitShared>) -> MutexGuard<'_, SplitShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Manager for audio-split pipes.
pub struct AudioSplitMgr;

impl AudioSplitMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        Arc::new(Self)
    }
}

impl PipeManager for AudioSplitMgr {
    fn signature(&self) -> u32 {
        AUDIO_SPLIT_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        let shared = Arc::new(Mutex::new(SplitShared {
            flow_def: None,
            sample_size: 0,
            channels: 0,
            channel_sample_size: 0,
            subs: SubRegistry::new(),
        }));
        Ok(Pipe::build(self, probe, AudioSplitOps { shared, this: WeakPipe::new() }))
    }
}

struct AudioSplitOps {
    shared: Arc<Mutex<SplitShared>>,
    this: WeakPipe,
}

impl AudioSplitOps {
    fn set_flow_def(&mut self, ctx: &mut PipeCtx<'_>, flow_def: Uref) -> Result<()> {
        flow_def.match_flow_def(flow::DEF_SOUND)?;
        let attrs = flow_def.attrs();
        if attrs.get_small_unsigned(flow::SOUND_PLANES).unwrap_or(1) != 1 {
            return Err(UbaseError::Invalid);
        }
        let sample_size =
            attrs.get_small_unsigned(flow::SOUND_SAMPLE_SIZE).ok_or(UbaseError::Invalid)?;
        let channels = attrs.get_small_unsigned(flow::SOUND_CHANNELS).ok_or(UbaseError::Invalid)?;
        if channels == 0 || channels > 64 {
            return Err(UbaseError::Invalid);
        }
        let channel_sample_size = sample_size / channels;
        if channel_sample_size == 0 {
            return Err(UbaseError::Invalid);
        }

        let subs = {
            let mut shared = lock(&self.shared);
            shared.flow_def = Some(flow_def);
            shared.sample_size = sample_size;
            shared.channels = channels;
            shared.channel_sample_size = channel_sample_size;
            shared.subs.alive()
        };
        for sub in subs {
            ctx.send_control(
                &sub,
                Command::Custom(CustomCommand {
                    signature: AUDIO_SPLIT_SUB_SIGNATURE,
                    payload: Box::new(Rebuild),
                }),
            );
        }
        Ok(())
    }
}

impl PipeOps for AudioSplitOps {
    fn on_ready(&mut self, ctx: &mut PipeCtx<'_>) {
        if let Some(pipe) = ctx.pipe() {
            self.this = pipe.downgrade();
        }
    }

    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.set_flow_def(ctx, flow_def)?;
                Ok(Reply::None)
            }
            Command::GetSubMgr => Ok(Reply::SubMgr(Arc::new(AudioSplitSubMgr {
                shared: self.shared.clone(),
                split: self.this.clone(),
            }))),
            Command::IterateSub => Ok(Reply::Subs(lock(&self.shared).subs.alive())),
            Command::RegisterRequest(request) => {
                ctx.throw_provide_request(request);
                Ok(Reply::None)
            }
            Command::UnregisterRequest(_) => Ok(Reply::None),
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        let subs = lock(&self.shared).subs.alive();
        for sub in subs {
            ctx.send_control(
                &sub,
                Command::Custom(CustomCommand {
                    signature: AUDIO_SPLIT_SUB_SIGNATURE,
                    payload: Box::new(Process(uref.dup())),
                }),
            );
        }
        drop(uref);
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        for sub in lock(&self.shared).subs.alive() {
            ctx.throw_at(&sub, Event::SourceEnd);
        }
    }
}

struct AudioSplitSubMgr {
    shared: Arc<Mutex<SplitShared>>,
    split: WeakPipe,
}

impl PipeManager for AudioSplitSubMgr {
    fn signature(&self) -> u32 {
        AUDIO_SPLIT_SUB_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, args: AllocArgs) -> Result<Pipe> {
        let AllocArgs::Flow(params) = args else { return Err(UbaseError::Invalid) };
        let bitfield = params.attrs().get_unsigned(BITFIELD).ok_or(UbaseError::Invalid)?;
        let planes =
            params.attrs().get_small_unsigned(flow::SOUND_PLANES).ok_or(UbaseError::Invalid)?;
        let channels =
            params.attrs().get_small_unsigned(flow::SOUND_CHANNELS).ok_or(UbaseError::Invalid)?;
        let split = self.split.upgrade().ok_or(UbaseError::Invalid)?;

        let shared = self.shared.clone();
        let pipe = Pipe::build(
            self,
            probe,
            AudioSplitSubOps {
                shared: shared.clone(),
                _super_guard: split.guard(),
                super_pipe: split.downgrade(),
                output: OutputHelper::new(),
                ubuf_mgr: None,
                ubuf_request: None,
                params,
                bitfield,
                planes,
                channels,
                sample_size: 0,
            },
        );
        lock(&shared).subs.add(&pipe);
        Ok(pipe)
    }
}

struct AudioSplitSubOps {
    shared: Arc<Mutex<SplitShared>>,
    _super_guard: PipeGuard,
    super_pipe: WeakPipe,
    output: OutputHelper,
    ubuf_mgr: Option<UbufMgr>,
    ubuf_request: Option<Request>,
    params: Uref,
    bitfield: u64,
    planes: u8,
    channels: u8,
    sample_size: u8,
}

impl AudioSplitSubOps {
    fn build_flow_def(&mut self, ctx: &mut PipeCtx<'_>) {
        let (input_flow, split_sample_size, split_channels) = {
            let shared = lock(&self.shared);
            let Some(input_flow) = shared.flow_def.as_ref().map(Uref::dup) else { return };
            (input_flow, shared.sample_size, shared.channels)
        };

        let mut flow_def = self.params.dup();
        if let Some(def) = input_flow.flow_def() {
            flow_def.set_flow_def(def);
        }
        if let Some(latency) = input_flow.flow_latency() {
            flow_def.set_flow_latency(latency);
        }
        if let Some(rate) = input_flow.attrs().get_unsigned(flow::SOUND_RATE) {
            flow_def.attrs_mut().set_unsigned(flow::SOUND_RATE, rate);
        }

        let mut sample_size = split_sample_size / split_channels;
        if self.planes == 1 {
            sample_size *= self.channels;
        }
        self.sample_size = sample_size;
        flow_def.attrs_mut().set_small_unsigned(flow::SOUND_SAMPLE_SIZE, sample_size);

        if let Some(request) = self.ubuf_request.take() {
            self.output.unregister_request(ctx, &request);
        }
        let request = ctx.make_request(RequestKind::UbufMgr, Some(flow_def.dup()));
        self.ubuf_request = Some(request.clone());
        self.output.store_flow_def(ctx, flow_def);
        self.output.register_request(ctx, request);
    }

    fn process(&mut self, ctx: &mut PipeCtx<'_>, mut uref: Uref) {
        let Some(ubuf_mgr) = &self.ubuf_mgr else { return };
        let (in_sample_size, in_channels, css) = {
            let shared = lock(&self.shared);
            (shared.sample_size, shared.channels, shared.channel_sample_size)
        };
        let Some(Ubuf::Sound(input)) = uref.ubuf() else {
            ctx.warn("invalid sound uref");
            return;
        };
        let samples = input.samples();
        let Ok(in_data) = input.plane_read_idx(0) else {
            ctx.warn("invalid sound uref");
            return;
        };

        let Ok(mut out_ubuf) = ubuf_mgr.alloc_sound(samples) else {
            ctx.fatal(UbaseError::Alloc);
            return;
        };
        {
            let Ok(out_sound) = out_ubuf.sound_mut() else {
                ctx.fatal(UbaseError::Alloc);
                return;
            };
            let out_stride = usize::from(self.sample_size);
            let in_stride = usize::from(in_sample_size);
            let css = usize::from(css);
            let plane_names: Vec<String> =
                out_sound.iterate_planes().map(str::to_owned).collect();

            let mut in_idx: u8 = 0;
            for plane in &plane_names {
                let mut out_idx: usize = 0;
                let Ok(out_data) = out_sound.plane_write(plane) else {
                    ctx.fatal(UbaseError::Alloc);
                    return;
                };
                loop {
                    while in_idx < in_channels && self.bitfield & (1u64 << in_idx) == 0 {
                        in_idx += 1;
                    }
                    if in_idx == in_channels {
                        break;
                    }
                    for s in 0..samples {
                        let src = s * in_stride + usize::from(in_idx) * css;
                        let dst = s * out_stride + out_idx * css;
                        out_data[dst..dst + css].copy_from_slice(&in_data[src..src + css]);
                    }
                    in_idx += 1;
                    out_idx += 1;
                    if !(self.planes == 1 && out_idx < usize::from(self.channels)) {
                        break;
                    }
                }
            }
        }

        uref.attach_ubuf(out_ubuf);
        self.output.output(ctx, uref);
    }
}

impl PipeOps for AudioSplitSubOps {
    fn on_ready(&mut self, ctx: &mut PipeCtx<'_>) {
        self.build_flow_def(ctx);
    }

    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        let command = upipe_core::helper_control!(self.output, ctx, command);
        match command {
            Command::SubGetSuper => Ok(Reply::Super(self.super_pipe.upgrade())),
            Command::Custom(custom) => {
                let payload = match custom.payload.downcast::<Process>() {
                    Ok(process) => {
                        self.process(ctx, process.0);
                        return Ok(Reply::None);
                    }
                    Err(payload) => payload,
                };
                payload.downcast::<Rebuild>().map_err(|_| UbaseError::Invalid)?;
                self.build_flow_def(ctx);
                Ok(Reply::None)
            }
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn provided(&mut self, _ctx: &mut PipeCtx<'_>, _request_id: u64, provision: Provision) {
        if let Provision::UbufMgr(mgr) = provision {
            self.ubuf_mgr = Some(mgr);
        }
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        self.output.clean(ctx);
    }
}
