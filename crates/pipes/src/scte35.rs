// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! SCTE-35 splice-section generator.
//!
//! Accepts flow definition `void.scte35.` and control urefs describing
//! splice events. A mux calls [`prepare`] with the current date; at most
//! one section goes out per configured interval: a `splice_insert` section
//! per pending event, or a `splice_null` heartbeat when idle. An event is
//! forgotten once its splice point has passed.
//!
//! Sections are valid PSI: table id 0xFC, SAP type 3, MPEG CRC-32,
//! `pts_adjustment` 0. Times on the wire count the 90 kHz clock
//! (27 MHz / 300) on 33 bits.

use bytes::BufMut;
use std::sync::Arc;
use upipe_core::prelude::*;
use upipe_core::uclock::UCLOCK_FREQ;

pub const SCTE35G_SIGNATURE: u32 = fourcc(*b"s35g");

/// Output flow definition of the generator.
pub const OUTPUT_FLOW_DEF: &str = "block.mpegtspsi.mpegtsscte35.";

/// Splice command types.
pub const SCTE35_NULL_COMMAND: u8 = 0x00;
pub const SCTE35_INSERT_COMMAND: u8 = 0x05;

/// Attributes understood on control urefs.
pub const COMMAND_TYPE: &str = "scte35.type";
pub const EVENT_ID: &str = "scte35.event_id";
pub const CANCEL: &str = "scte35.cancel";
pub const OUT_OF_NETWORK: &str = "scte35.out_of_network";
pub const AUTO_RETURN: &str = "scte35.auto_return";
pub const UNIQUE_PROGRAM_ID: &str = "scte35.unique_program_id";

struct SetInterval(u64);

struct PrepareCmd {
    now: u64,
    latency: u64,
}

/// Configures the heartbeat interval (27 MHz ticks).
///
/// # Errors
///
/// `Unhandled` when `pipe` is not a SCTE-35 generator.
pub fn set_interval(pipe: &Pipe, interval: u64) -> Result<()> {
    pipe.control(Command::Custom(CustomCommand {
        signature: SCTE35G_SIGNATURE,
        payload: Box::new(SetInterval(interval)),
    }))
    .map(|_| ())
}

/// Asks the generator to emit whatever is due at `now`, `latency` ahead of
/// transmission.
///
/// # Errors
///
/// `Unhandled` when `pipe` is not a SCTE-35 generator, `Busy` while the
/// uref/ubuf managers have not been provided yet.
pub fn prepare(pipe: &Pipe, now: u64, latency: u64) -> Result<()> {
    pipe.control(Command::Custom(CustomCommand {
        signature: SCTE35G_SIGNATURE,
        payload: Box::new(PrepareCmd { now, latency }),
    }))
    .map(|_| ())
}

const MPEG_CRC_POLY: u32 = 0x04C1_1DB7;

/// MPEG-2 CRC-32, as used by every PSI section.
#[must_use]
pub fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 == 0 { crc << 1 } else { (crc << 1) ^ MPEG_CRC_POLY };
        }
    }
    crc
}

fn put_splice_time(out: &mut Vec<u8>, pts_90khz: u64) {
    // time_specified(1) reserved(6) pts[33]
    out.put_u8(0xFE | (((pts_90khz >> 32) & 0x1) as u8));
    out.put_u32((pts_90khz & 0xFFFF_FFFF) as u32);
}

fn build_section(command_type: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 17 + body.len();
    let mut out = Vec::with_capacity(section_length + 3);
    out.put_u8(0xFC);
    // section_syntax(0) private(0) sap_type(11) length[12]
    out.put_u8(0x30 | (((section_length >> 8) & 0xF) as u8));
    out.put_u8((section_length & 0xFF) as u8);
    out.put_u8(0x00); // protocol_version
    // encrypted(0) algorithm(000000) pts_adjustment[33] = 0
    out.put_u8(0x00);
    out.put_u32(0);
    out.put_u8(0x00); // cw_index
    // tier(0xFFF) splice_command_length[12]
    out.put_u8(0xFF);
    out.put_u8(0xF0 | (((body.len() >> 8) & 0xF) as u8));
    out.put_u8((body.len() & 0xFF) as u8);
    out.put_u8(command_type);
    out.put_slice(body);
    out.put_u16(0); // descriptor_loop_length
    let crc = crc32_mpeg(&out);
    out.put_u32(crc);
    out
}

/// Manager for SCTE-35 generators.
pub struct Scte35gMgr;

impl Scte35gMgr {
    #[must_use]
    pub fn mgr() -> PipeMgr {
        Arc::new(Self)
    }
}

impl PipeManager for Scte35gMgr {
    fn signature(&self) -> u32 {
        SCTE35G_SIGNATURE
    }

    fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
        Ok(Pipe::build(
            self,
            probe,
            Scte35gOps {
                output: OutputHelper::new(),
                uref_mgr: None,
                ubuf_mgr: None,
                interval: UCLOCK_FREQ,
                next_section: 0,
                events: Vec::new(),
            },
        ))
    }
}

struct Scte35gOps {
    output: OutputHelper,
    uref_mgr: Option<UrefMgr>,
    ubuf_mgr: Option<UbufMgr>,
    interval: u64,
    next_section: u64,
    events: Vec<Uref>,
}

impl Scte35gOps {
    fn set_flow_def(&mut self, ctx: &mut PipeCtx<'_>, flow_def: &Uref) -> Result<()> {
        flow_def.match_flow_def("void.scte35.")?;

        let mut out_flow = Uref::new();
        out_flow.set_flow_def(OUTPUT_FLOW_DEF);
        if let Some(latency) = flow_def.flow_latency() {
            out_flow.set_flow_latency(latency);
        }

        let uref_request = ctx.make_request(RequestKind::UrefMgr, None);
        self.output.register_request(ctx, uref_request);
        let ubuf_request = ctx.make_request(RequestKind::UbufMgr, Some(out_flow.dup()));
        self.output.register_request(ctx, ubuf_request);

        self.output.store_flow_def(ctx, out_flow);
        Ok(())
    }

    fn store_event(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        let Some(command_type) = uref.attrs().get_small_unsigned(COMMAND_TYPE) else {
            ctx.warn("control uref without a command type");
            return;
        };
        if command_type != SCTE35_INSERT_COMMAND {
            ctx.warn(format!("unsupported splice command {command_type}"));
            return;
        }
        let Some(event_id) = uref.attrs().get_unsigned(EVENT_ID) else {
            ctx.warn("insert event without an event id");
            return;
        };
        if uref.pts_sys().is_none() {
            ctx.warn(format!("event {event_id} carries no system date"));
            return;
        }
        self.events.retain(|ev| ev.attrs().get_unsigned(EVENT_ID) != Some(event_id));
        if uref.attrs().get_bool(CANCEL).unwrap_or(false) {
            ctx.dbg(format!("cancelled event {event_id}"));
            return;
        }
        ctx.dbg(format!("registered splice event {event_id}"));
        self.events.push(uref);
    }

    fn prepare(&mut self, ctx: &mut PipeCtx<'_>, now: u64, latency: u64) -> Result<()> {
        if now + latency < self.next_section {
            return Ok(());
        }
        self.events.retain(|ev| ev.pts_sys().is_some_and(|pts| pts >= now));

        if self.events.is_empty() {
            let section = build_section(SCTE35_NULL_COMMAND, &[]);
            self.emit(ctx, now, &section)?;
        } else {
            let sections: Vec<Vec<u8>> = self
                .events
                .iter()
                .map(|event| build_section(SCTE35_INSERT_COMMAND, &Self::insert_body(event)))
                .collect();
            for section in sections {
                self.emit(ctx, now, &section)?;
            }
        }
        self.next_section = now + self.interval;
        Ok(())
    }

    fn insert_body(event: &Uref) -> Vec<u8> {
        let pts = event.pts_prog().or_else(|| event.pts_sys()).unwrap_or(0) / 300;
        let duration = event.duration();
        let mut body = Vec::new();
        let event_id = event.attrs().get_unsigned(EVENT_ID).unwrap_or(0);
        body.put_u32((event_id & 0xFFFF_FFFF) as u32);
        body.put_u8(0x7F); // cancel(0) reserved(1111111)
        let out_of_network = event.attrs().get_bool(OUT_OF_NETWORK).unwrap_or(false);
        // out_of_network, program_splice(1), duration_flag, immediate(0)
        let mut flags = 0x0F;
        if out_of_network {
            flags |= 0x80;
        }
        flags |= 0x40;
        if duration.is_some() {
            flags |= 0x20;
        }
        body.put_u8(flags);
        put_splice_time(&mut body, pts & 0x1_FFFF_FFFF);
        if let Some(duration) = duration {
            let auto_return = event.attrs().get_bool(AUTO_RETURN).unwrap_or(false);
            let duration = (duration / 300) & 0x1_FFFF_FFFF;
            let mut lead = 0x7E | (((duration >> 32) & 0x1) as u8);
            if auto_return {
                lead |= 0x80;
            }
            body.put_u8(lead);
            body.put_u32((duration & 0xFFFF_FFFF) as u32);
        }
        let program_id = event.attrs().get_unsigned(UNIQUE_PROGRAM_ID).unwrap_or(0);
        body.put_u16((program_id & 0xFFFF) as u16);
        body.put_u8(0x00); // avail_num
        body.put_u8(0x00); // avails_expected
        body
    }

    fn emit(&mut self, ctx: &mut PipeCtx<'_>, now: u64, section: &[u8]) -> Result<()> {
        let (Some(uref_mgr), Some(ubuf_mgr)) = (&self.uref_mgr, &self.ubuf_mgr) else {
            return Err(UbaseError::Busy);
        };
        let mut uref = Uref::block_alloc(uref_mgr, ubuf_mgr, section.len())?;
        uref.block_write(0, section.len())?.copy_from_slice(section);
        uref.set_cr_sys(now);
        self.output.output(ctx, uref);
        Ok(())
    }
}

impl PipeOps for Scte35gOps {
    fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
        let command = upipe_core::helper_control!(self.output, ctx, command);
        match command {
            Command::SetFlowDef(flow_def) => {
                self.set_flow_def(ctx, &flow_def)?;
                Ok(Reply::None)
            }
            Command::Custom(custom) => {
                let payload = match custom.payload.downcast::<SetInterval>() {
                    Ok(interval) => {
                        self.interval = interval.0;
                        return Ok(Reply::None);
                    }
                    Err(payload) => payload,
                };
                let prepare =
                    payload.downcast::<PrepareCmd>().map_err(|_| UbaseError::Invalid)?;
                self.prepare(ctx, prepare.now, prepare.latency)?;
                Ok(Reply::None)
            }
            _ => Err(UbaseError::Unhandled),
        }
    }

    fn input(&mut self, ctx: &mut PipeCtx<'_>, uref: Uref) {
        if uref.ubuf().is_some() {
            ctx.warn("expected a control uref");
            return;
        }
        self.store_event(ctx, uref);
    }

    fn provided(&mut self, _ctx: &mut PipeCtx<'_>, _request_id: u64, provision: Provision) {
        match provision {
            Provision::UrefMgr(mgr) => self.uref_mgr = Some(mgr),
            Provision::UbufMgr(mgr) => self.ubuf_mgr = Some(mgr),
            _ => {}
        }
    }

    fn on_last_release(&mut self, ctx: &mut PipeCtx<'_>) {
        self.events.clear();
        self.output.clean(ctx);
    }
}
