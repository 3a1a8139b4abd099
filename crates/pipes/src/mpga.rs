// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MPEG-1 layer I/II/III and AAC audio framer.
//!
//! Input is a byte stream of `block.mp2.sound.`, `block.mp3.sound.` or
//! `block.aac.sound.` data. The framer scans for frame syncwords and only
//! believes a frame once the following header checks out, then outputs one
//! uref per frame. Timestamps stick to the frame whose first byte arrived
//! in the dated uref; later frames extrapolate by the frame duration.
//!
//! AAC encapsulation is negotiated with downstream through a flow-format
//! request: `adts` output keeps (or synthesizes) the 7-byte ADTS header,
//! `raw` output strips it and publishes a 2-byte AudioSpecificConfig in
//! `flow.headers` when global headers are wanted.

use std::sync::Arc;
use upipe_core::flow;
use upipe_core::prelude::*;
use upipe_core::ubuf::UbufBlock;
use upipe_core::uclock::UCLOCK_FREQ;

pub const MPGAF_SIGNATURE: u32 = fourcc(*b"mpgf");

/// Encapsulation attribute carried by AAC flow definitions.
pub const ENCAPS_ATTR: &str = "mpga.encaps";

/// How AAC frames are packaged on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encaps {
    Adts,
    Raw,
}

/// Reads the encapsulation attribute of a flow definition.
#[must_use]
pub fn encaps(flow_def: &Uref) -> Option<Encaps> {
    match flow_def.attrs().get_small_unsigned(ENCAPS_ATTR) {
        Some(0) => Some(Encaps::Adts),
        Some(1) => Some(Encaps::Raw),
        _ => None,
    }
}

/// Sets the encapsulation attribute on a flow definition.
pub fn set_encaps(flow_def: &mut Uref, encaps: Encaps) {
    let value = match encaps {
        Encaps::Adts => 0,
        Encaps::Raw => 1,
    };
    flow_def.attrs_mut().set_small_unsigned(ENCAPS_ATTR, value);
}

const MPGA_HEADER_SIZE: usize = 4;
const ADTS_HEADER_SIZE: usize = 7;
const AAC_FRAME_SAMPLES: u64 = 1024;

const MPGA_RATES: [u64; 3] = [44_100, 48_000, 32_000];
const MPGA_BITRATES_L1: [u64; 15] =
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const MPGA_BITRATES_L2: [u64; 15] =
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const MPGA_BITRATES_L3: [u64; 15] =
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

const AAC_RATES: [u64; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MpgaHeader {
    layer: u8,
    bitrate: u64,
    rate: u64,
    channels: u8,
    frame_size: usize,
    samples: u64,
}

fn parse_mpga(h: &[u8]) -> Option<MpgaHeader> {
    if h.len() < MPGA_HEADER_SIZE || h[0] != 0xFF || (h[1] & 0xE0) != 0xE0 {
        return None;
    }
    // MPEG-1 only; MPEG-2 low sampling profiles are not carried here.
    if (h[1] >> 3) & 0x3 != 0x3 {
        return None;
    }
    let layer = match (h[1] >> 1) & 0x3 {
        0x3 => 1,
        0x2 => 2,
        0x1 => 3,
        _ => return None,
    };
    let bitrate_index = usize::from(h[2] >> 4);
    if bitrate_index == 0 || bitrate_index == 0xF {
        return None;
    }
    let sampling = usize::from((h[2] >> 2) & 0x3);
    if sampling == 0x3 {
        return None;
    }
    let padding = u64::from((h[2] >> 1) & 0x1);
    let mode = (h[3] >> 6) & 0x3;

    let rate = MPGA_RATES[sampling];
    let bitrate = 1000
        * match layer {
            1 => MPGA_BITRATES_L1[bitrate_index],
            2 => MPGA_BITRATES_L2[bitrate_index],
            _ => MPGA_BITRATES_L3[bitrate_index],
        };
    let (frame_size, samples) = if layer == 1 {
        (((12 * bitrate / rate + padding) * 4) as usize, 384)
    } else {
        ((144 * bitrate / rate + padding) as usize, 1152)
    };
    Some(MpgaHeader {
        layer,
        bitrate,
        rate,
        channels: if mode == 0x3 { 1 } else { 2 },
        frame_size,
        samples,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdtsHeader {
    profile: u8,
    freq_index: u8,
    channels: u8,
    frame_size: usize,
    header_size: usize,
    rate: u64,
}

fn parse_adts(h: &[u8]) -> Option<AdtsHeader> {
    if h.len() < ADTS_HEADER_SIZE || h[0] != 0xFF || (h[1] & 0xF6) != 0xF0 {
        return None;
    }
    let protection_absent = h[1] & 0x1;
    let profile = h[2] >> 6;
    let freq_index = (h[2] >> 2) & 0xF;
    if usize::from(freq_index) >= AAC_RATES.len() {
        return None;
    }
    let channels = ((h[2] & 0x1) << 2) | (h[3] >> 6);
    if channels == 0 {
        return None;
    }
    let frame_size =
        (usize::from(h[3] & 0x3) << 11) | (usize::from(h[4]) << 3) | usize::from(h[5] >> 5);
    let header_size = if protection_absent == 1 { ADTS_HEADER_SIZE } else { ADTS_HEADER_SIZE + 2 };
    if frame_size <= header_size {
        return None;
    }
    Some(AdtsHeader {
        profile,
        freq_index,
        channels,
        frame_size,
        header_size,
        rate: AAC_RATES[usize::from(freq_index)],
    })
}

/// 2-byte AudioSpecificConfig: object type, frequency index, channels,
/// 1024-sample frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Asc {
    object_type: u8,
    freq_index: u8,
    channels: u8,
}

impl Asc {
    fn from_adts(header: &AdtsHeader) -> Self {
        Self {
            object_type: header.profile + 1,
            freq_index: header.freq_index,
            channels: header.channels,
        }
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        let object_type = bytes[0] >> 3;
        let freq_index = ((bytes[0] & 0x7) << 1) | (bytes[1] >> 7);
        let channels = (bytes[1] >> 3) & 0xF;
        if usize::from(freq_index) >= AAC_RATES.len() || channels == 0 {
            return None;
        }
        Some(Self { object_type, freq_index, channels })
    }

    fn to_bytes(self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.freq_index >> 1),
            ((self.freq_index & 0x1) << 7) | (self.channels << 3),
        ]
    }

    fn rate(&self) -> u64 {
        AAC_RATES[usize::from(self.freq_index)]
    }

    fn adts_header(&self, payload: usize) -> [u8; ADTS_HEADER_SIZE] {
        let len = payload + ADTS_HEADER_SIZE;
        [
            0xFF,
            0xF1,
            ((self.object_type - 1) << 6)
                | (self.freq_index << 2)
                | ((self.channels >> 2) & 0x1),
            ((self.channels & 0x3) << 6) | (((len >> 11) & 0x3) as u8),
            ((len >> 3) & 0xFF) as u8,
            (((len & 0x7) << 5) as u8) | 0x1F,
            0xFC,
        ]
    }
}

enum InputKind {
    Mpga,
    AacAdts,
    AacRaw(Asc),
}

/// Manager for framer pipes.
pub struct MpgaFramerMgr;

impl MpgaFramerMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        Arc::new(Self)
    }
}

impl PipeManager for MpgaFramerMgr {
    fn signature(&self) -> u32 {
        MPGAF_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Ok(Pipe::build(
            self,
            probe,
            FramerOps {
                output: OutputHelper::new(),
                stream: UrefStream::new(),
                input_flow: None,
                input_kind: None,
                out_encaps: Encaps::Adts,
                global: false,
                flow_format_request: None,
                sync: false,
                mpga_info: None,
                adts_info: None,
                next_dates: NextDates::default(),
            },
        ))
    }
}

/// Extrapolated timestamps for frames that arrive without their own date.
#[derive(Default)]
struct NextDates {
    pts_orig: Option<u64>,
    pts_prog: Option<u64>,
    pts_sys: Option<u64>,
}

struct FramerOps {
    output: OutputHelper,
    stream: UrefStream,
    input_flow: Option<Uref>,
    input_kind: Option<InputKind>,
    out_encaps: Encaps,
    global: bool,
    flow_format_request: Option<Request>,
    sync: bool,
    mpga_info: Option<MpgaHeader>,
    adts_info: Option<AdtsHeader>,
    next_dates: NextDates,
}

impl FramerOps {
    fn set_flow_def(&mut self, ctx: &mut PipeCtx<'_>, flow_def: Uref) -> Result<()> {
        flow_def.match_flow_def(flow::DEF_BLOCK)?;
        let def = flow_def.flow_def().ok_or(UbaseError::Invalid)?;
        let suffix = &def[flow::DEF_BLOCK.len()..];

        let kind = if suffix.starts_with("mp2.sound.")
            || suffix.starts_with("mp3.sound.")
            || suffix.starts_with("sound.")
        {
            InputKind::Mpga
        } else if suffix.starts_with("aac.sound.") {
            if encaps(&flow_def) == Some(Encaps::Raw) {
                let asc = flow_def
                    .flow_headers()
                    .and_then(Asc::parse)
                    .ok_or(UbaseError::Invalid)?;
                InputKind::AacRaw(asc)
            } else {
                InputKind::AacAdts
            }
        } else {
            return Err(UbaseError::Invalid);
        };

        if self.sync {
            self.sync = false;
            ctx.throw(Event::SyncLost);
        }
        self.stream.clear();
        self.mpga_info = None;
        self.adts_info = None;
        self.next_dates = NextDates::default();
        self.input_kind = Some(kind);
        self.input_flow = Some(flow_def);

        // Ask downstream how it wants the stream packaged.
        if let Some(request) = self.flow_format_request.take() {
            self.output.unregister_request(ctx, &request);
        }
        let proposal = self.build_flow_format_proposal();
        let request = ctx.make_request(RequestKind::FlowFormat, Some(proposal));
        self.flow_format_request = Some(request.clone());
        self.output.register_request(ctx, request);

        // Raw input needs no parsing to know its format.
        if matches!(self.input_kind, Some(InputKind::AacRaw(_))) {
            self.update_flow_def(ctx);
        }
        Ok(())
    }

    fn build_flow_format_proposal(&self) -> Uref {
        let mut proposal =
            self.input_flow.as_ref().map_or_else(Uref::new, Uref::dup);
        match &self.input_kind {
            Some(InputKind::AacRaw(_)) => set_encaps(&mut proposal, Encaps::Raw),
            Some(_) | None => set_encaps(&mut proposal, Encaps::Adts),
        }
        proposal
    }

    fn update_flow_def(&mut self, ctx: &mut PipeCtx<'_>) {
        let Some(flow_def) = self.build_flow_def() else { return };
        let changed = self
            .output
            .flow_def()
            .is_none_or(|current| !current.attrs().compare(flow_def.attrs()));
        if changed {
            self.output.store_flow_def(ctx, flow_def);
        }
    }

    fn build_flow_def(&self) -> Option<Uref> {
        let mut flow_def = self.input_flow.as_ref().map(Uref::dup)?;
        flow_def.attrs_mut().delete(AttrType::Opaque, flow::HEADERS);
        flow_def.attrs_mut().delete(AttrType::Bool, flow::GLOBAL);

        match self.input_kind.as_ref()? {
            InputKind::Mpga => {
                let info = self.mpga_info.as_ref()?;
                let def = if info.layer == 3 { "block.mp3.sound." } else { "block.mp2.sound." };
                flow_def.set_flow_def(def);
                set_encaps(&mut flow_def, self.out_encaps);
                let attrs = flow_def.attrs_mut();
                attrs.set_unsigned(flow::SOUND_RATE, info.rate);
                attrs.set_small_unsigned(flow::SOUND_CHANNELS, info.channels);
                attrs.set_unsigned(flow::SOUND_SAMPLES, info.samples);
                attrs.set_unsigned(flow::BLOCK_OCTETRATE, info.bitrate / 8);
            }
            InputKind::AacAdts => {
                let info = self.adts_info.as_ref()?;
                let asc = Asc::from_adts(info);
                self.fill_aac_flow_def(&mut flow_def, &asc);
            }
            InputKind::AacRaw(asc) => {
                let asc = *asc;
                self.fill_aac_flow_def(&mut flow_def, &asc);
            }
        }
        Some(flow_def)
    }

    fn fill_aac_flow_def(&self, flow_def: &mut Uref, asc: &Asc) {
        flow_def.set_flow_def("block.aac.sound.");
        set_encaps(flow_def, self.out_encaps);
        let rate = asc.rate();
        let attrs = flow_def.attrs_mut();
        attrs.set_unsigned(flow::SOUND_RATE, rate);
        attrs.set_small_unsigned(flow::SOUND_CHANNELS, asc.channels);
        attrs.set_unsigned(flow::SOUND_SAMPLES, AAC_FRAME_SAMPLES);
        if self.global && self.out_encaps == Encaps::Raw {
            flow_def.set_flow_global();
            flow_def.set_flow_headers(&asc.to_bytes());
        }
    }

    fn emit_frame(
        &mut self,
        ctx: &mut PipeCtx<'_>,
        frame: UbufBlock,
        attrs: Option<Uref>,
        samples: u64,
        rate: u64,
    ) {
        let duration = samples * UCLOCK_FREQ / rate;
        let mut uref = attrs.unwrap_or_default();
        if uref.pts_orig().is_none() {
            if let Some(pts) = self.next_dates.pts_orig {
                uref.set_pts_orig(pts);
            }
        }
        if uref.pts_prog().is_none() {
            if let Some(pts) = self.next_dates.pts_prog {
                uref.set_pts_prog(pts);
            }
        }
        if uref.pts_sys().is_none() {
            if let Some(pts) = self.next_dates.pts_sys {
                uref.set_pts_sys(pts);
            }
        }
        self.next_dates.pts_orig = uref.pts_orig().map(|pts| pts + duration);
        self.next_dates.pts_prog = uref.pts_prog().map(|pts| pts + duration);
        self.next_dates.pts_sys = uref.pts_sys().map(|pts| pts + duration);

        uref.attach_ubuf(Ubuf::Block(frame));
        uref.set_duration(duration);
        if !self.sync {
            self.sync = true;
            ctx.throw(Event::SyncAcquired);
        }
        self.output.output(ctx, uref);
    }

    fn scan_mpga(&mut self, ctx: &mut PipeCtx<'_>) {
        loop {
            let size = self.stream.size();
            if size < MPGA_HEADER_SIZE {
                return;
            }
            let mut candidate = None;
            for i in 0..=(size - MPGA_HEADER_SIZE) {
                let mut scratch = [0u8; MPGA_HEADER_SIZE];
                let Some(header) = self.stream.peek(i, &mut scratch) else { break };
                if let Some(info) = parse_mpga(header) {
                    candidate = Some((i, info));
                    break;
                }
            }
            let Some((pos, info)) = candidate else {
                // Keep a potential partial syncword.
                if size > MPGA_HEADER_SIZE {
                    self.stream.skip(size - MPGA_HEADER_SIZE);
                }
                return;
            };
            if pos + info.frame_size + MPGA_HEADER_SIZE > size {
                self.stream.skip(pos);
                return;
            }
            let mut scratch = [0u8; MPGA_HEADER_SIZE];
            let next = self
                .stream
                .peek(pos + info.frame_size, &mut scratch)
                .and_then(parse_mpga);
            let next_matches = next.is_some_and(|n| {
                n.layer == info.layer && n.rate == info.rate && n.channels == info.channels
            });
            if !next_matches {
                self.stream.skip(pos + 1);
                continue;
            }

            if self.mpga_info != Some(info) {
                self.mpga_info = Some(info);
                self.update_flow_def(ctx);
            }
            let attrs = self.stream.attrs_for(pos);
            self.stream.skip(pos);
            let Some(frame) = self.stream.extract(info.frame_size) else { return };
            self.emit_frame(ctx, frame, attrs, info.samples, info.rate);
        }
    }

    fn scan_adts(&mut self, ctx: &mut PipeCtx<'_>) {
        loop {
            let size = self.stream.size();
            if size < ADTS_HEADER_SIZE {
                return;
            }
            let mut candidate = None;
            for i in 0..=(size - ADTS_HEADER_SIZE) {
                let mut scratch = [0u8; ADTS_HEADER_SIZE];
                let Some(header) = self.stream.peek(i, &mut scratch) else { break };
                if let Some(info) = parse_adts(header) {
                    candidate = Some((i, info));
                    break;
                }
            }
            let Some((pos, info)) = candidate else {
                if size > ADTS_HEADER_SIZE {
                    self.stream.skip(size - ADTS_HEADER_SIZE);
                }
                return;
            };
            // The next syncword vouches for this frame.
            if pos + info.frame_size + 2 > size {
                self.stream.skip(pos);
                return;
            }
            let mut scratch = [0u8; 2];
            let next_ok = self
                .stream
                .peek(pos + info.frame_size, &mut scratch)
                .is_some_and(|h| h[0] == 0xFF && (h[1] & 0xF6) == 0xF0);
            if !next_ok {
                self.stream.skip(pos + 1);
                continue;
            }

            if self.adts_info != Some(info) {
                self.adts_info = Some(info);
                self.update_flow_def(ctx);
            }
            let attrs = self.stream.attrs_for(pos);
            self.stream.skip(pos);
            let Some(mut frame) = self.stream.extract(info.frame_size) else { return };
            if self.out_encaps == Encaps::Raw && frame.skip(info.header_size).is_err() {
                continue;
            }
            self.emit_frame(ctx, frame, attrs, AAC_FRAME_SAMPLES, info.rate);
        }
    }

    fn input_raw(&mut self, ctx: &mut PipeCtx<'_>, mut uref: Uref) {
        let Some(InputKind::AacRaw(asc)) = &self.input_kind else { return };
        let asc = *asc;
        let Some(Ubuf::Block(payload)) = uref.detach_ubuf() else {
            ctx.warn("raw input uref carries no block");
            return;
        };
        let frame = match self.out_encaps {
            Encaps::Raw => payload,
            Encaps::Adts => {
                let mut frame = UbufBlock::from_slice(&asc.adts_header(payload.size()));
                frame.append(payload);
                frame
            }
        };
        self.emit_frame(ctx, frame, Some(uref), AAC_FRAME_SAMPLES, asc.rate());
    }
}

impl PipeOps for FramerOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        let command = upipe_core::helper_control!(self.output, ctx, command);
        match command {
            Command::SetFlowDef(flow_def) => {
                self.set_flow_def(ctx, flow_def)?;
                Ok(Reply::None)
            }
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        match &self.input_kind {
            None => {
                ctx.warn("received data before a flow definition");
            }
            Some(InputKind::AacRaw(_)) => self.input_raw(ctx, uref),
            Some(InputKind::Mpga) => {
                self.stream.append(uref);
                self.scan_mpga(ctx);
            }
            Some(InputKind::AacAdts) => {
                self.stream.append(uref);
                self.scan_adts(ctx);
            }
        }
    }

    fn provided(&mut self, ctx: &mut PipeCtx<'_>, _request_id: u64, provision: Provision) {
        if let Provision::FlowFormat(answer) = provision {
            self.out_encaps = encaps(&answer).unwrap_or(Encaps::Adts);
            self.global = answer.flow_global();
            self.update_flow_def(ctx);
        }
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        if self.sync {
            ctx.throw(Event::SyncLost);
        }
        self.output.clean(ctx);
    }
}
