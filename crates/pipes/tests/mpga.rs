// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

//! End-to-end framer scenarios: MPEG-1 layer II framing, ADTS AAC
//! passthrough, and encapsulation conversions in both directions.

mod common;

use common::record_sink;
use upipe_core::flow;
use upipe_core::prelude::*;
use upipe_pipes::mpga::{encaps, set_encaps, Encaps, MpgaFramerMgr};

const MPGA_HEADER_SIZE: usize = 4;
const ADTS_HEADER_SIZE: usize = 7;

fn mgrs() -> (UrefMgr, UbufMgr) {
    let umem = UmemMgr::alloc_mgr();
    (UrefMgr::std(UdictMgr::inline_mgr(0)), UbufMgr::block_mem(&umem, 0, 0, 0))
}

/// 256 kbit/s, 48 kHz, stereo, MPEG-1 layer II.
fn write_mpga(buf: &mut [u8]) {
    buf[0] = 0xFF;
    buf[1] = 0xFD;
    buf[2] = 0xC4;
    buf[3] = 0x00;
}

/// AAC LC, 48 kHz, stereo, frame length 768 including the 7-byte header.
fn write_adts(buf: &mut [u8]) {
    buf[0] = 0xFF;
    buf[1] = 0xF1;
    buf[2] = 0x4C;
    buf[3] = 0x80;
    buf[4] = 0x60;
    buf[5] = 0x1F;
    buf[6] = 0xFC;
}

fn write_data(buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
}

fn stamp(uref: &mut Uref) {
    uref.set_pts_orig(27_000_000);
    uref.set_dts_orig(27_000_000);
    uref.set_cr_sys(84);
    uref.set_rap_sys(42);
}

fn check_data(bytes: &[u8], offset: usize) {
    for (i, byte) in bytes[offset..].iter().enumerate() {
        assert_eq!(*byte, (i % 256) as u8, "mismatch at offset {}", offset + i);
    }
}

fn check_dates(uref: &Uref) {
    assert_eq!(uref.rap_sys(), Some(42));
    assert_eq!(uref.pts_orig(), Some(27_000_000));
    assert_eq!(uref.dts_orig(), Some(27_000_000));
}

#[test]
fn mpeg1_layer2_frame_is_extracted() {
    let (uref_mgr, ubuf_mgr) = mgrs();
    let sink = record_sink(
        Uprobe::new(),
        Some(Box::new(|proposal: &Uref| {
            let mut answer = proposal.dup();
            set_encaps(&mut answer, Encaps::Adts);
            answer.delete_flow_global();
            answer
        })),
    );

    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_block_def(&uref_mgr, "mp2.sound.");
    framer.set_flow_def(&flow_def).unwrap();
    framer.set_output(&sink.pipe).unwrap();

    // 42 junk bytes, one complete 768-byte frame, the next frame's header.
    let size = 42 + 768 + MPGA_HEADER_SIZE;
    let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, size).unwrap();
    {
        let buf = uref.block_write(0, size).unwrap();
        buf.fill(0);
        write_mpga(&mut buf[42..]);
        write_data(&mut buf[42 + MPGA_HEADER_SIZE..42 + 768]);
        write_mpga(&mut buf[42 + 768..]);
    }
    stamp(&mut uref);
    framer.input(uref);

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let out = &records[0];
    assert_eq!(out.block_size().unwrap(), 768);
    check_data(&out.block_to_vec().unwrap(), MPGA_HEADER_SIZE);
    check_dates(out);

    let flow_defs = sink.flow_defs.lock().unwrap();
    assert_eq!(flow_defs.len(), 1);
    let fd = &flow_defs[0];
    assert_eq!(fd.flow_def(), Some("block.mp2.sound."));
    assert_eq!(encaps(fd), Some(Encaps::Adts));
    assert_eq!(fd.attrs().get_unsigned(flow::SOUND_RATE), Some(48_000));
    assert_eq!(fd.attrs().get_small_unsigned(flow::SOUND_CHANNELS), Some(2));
    assert_eq!(fd.attrs().get_unsigned(flow::SOUND_SAMPLES), Some(1152));
    assert_eq!(fd.attrs().get_unsigned(flow::BLOCK_OCTETRATE), Some(32_000));
    assert!(fd.flow_headers().is_none());
}

#[test]
fn adts_passthrough_keeps_headers() {
    let (uref_mgr, ubuf_mgr) = mgrs();
    let sink = record_sink(
        Uprobe::new(),
        Some(Box::new(|proposal: &Uref| {
            let mut answer = proposal.dup();
            set_encaps(&mut answer, Encaps::Adts);
            answer
        })),
    );

    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_block_def(&uref_mgr, "aac.sound.");
    framer.set_flow_def(&flow_def).unwrap();
    framer.set_output(&sink.pipe).unwrap();

    let size = 42 + 768 + ADTS_HEADER_SIZE;
    let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, size).unwrap();
    {
        let buf = uref.block_write(0, size).unwrap();
        buf.fill(0);
        write_adts(&mut buf[42..]);
        write_data(&mut buf[42 + ADTS_HEADER_SIZE..42 + 768]);
        write_adts(&mut buf[42 + 768..]);
    }
    stamp(&mut uref);
    framer.input(uref);

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let out = &records[0];
    assert_eq!(out.block_size().unwrap(), 768);
    check_data(&out.block_to_vec().unwrap(), ADTS_HEADER_SIZE);
    check_dates(out);
}

#[test]
fn adts_to_raw_strips_header_and_publishes_asc() {
    let (uref_mgr, ubuf_mgr) = mgrs();
    let sink = record_sink(
        Uprobe::new(),
        Some(Box::new(|proposal: &Uref| {
            let mut answer = proposal.dup();
            set_encaps(&mut answer, Encaps::Raw);
            answer.set_flow_global();
            answer
        })),
    );

    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_block_def(&uref_mgr, "aac.sound.");
    framer.set_flow_def(&flow_def).unwrap();
    framer.set_output(&sink.pipe).unwrap();

    let size = 42 + 768 + ADTS_HEADER_SIZE;
    let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, size).unwrap();
    {
        let buf = uref.block_write(0, size).unwrap();
        buf.fill(0);
        write_adts(&mut buf[42..]);
        write_data(&mut buf[42 + ADTS_HEADER_SIZE..42 + 768]);
        write_adts(&mut buf[42 + 768..]);
    }
    stamp(&mut uref);
    framer.input(uref);

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let out = &records[0];
    assert_eq!(out.block_size().unwrap(), 768 - ADTS_HEADER_SIZE);
    check_data(&out.block_to_vec().unwrap(), 0);
    check_dates(out);

    // Downstream sees raw encapsulation with 2-byte global headers
    // spelling LC / 48 kHz / stereo / 1024-sample frames.
    let flow_defs = sink.flow_defs.lock().unwrap();
    let fd = flow_defs.last().unwrap();
    assert_eq!(encaps(fd), Some(Encaps::Raw));
    assert!(fd.flow_global());
    assert_eq!(fd.flow_headers(), Some(&[0x11, 0x90][..]));
    assert_eq!(fd.attrs().get_unsigned(flow::SOUND_SAMPLES), Some(1024));
}

#[test]
fn raw_to_adts_synthesizes_headers() {
    let (uref_mgr, ubuf_mgr) = mgrs();
    let sink = record_sink(
        Uprobe::new(),
        Some(Box::new(|proposal: &Uref| {
            let mut answer = proposal.dup();
            set_encaps(&mut answer, Encaps::Adts);
            answer.delete_flow_global();
            answer
        })),
    );

    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let mut flow_def = flow::alloc_block_def(&uref_mgr, "aac.sound.");
    set_encaps(&mut flow_def, Encaps::Raw);
    flow_def.set_flow_headers(&[0x11, 0x90]);
    framer.set_flow_def(&flow_def).unwrap();
    framer.set_output(&sink.pipe).unwrap();

    let size = 768 - ADTS_HEADER_SIZE;
    let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, size).unwrap();
    write_data(uref.block_write(0, size).unwrap());
    stamp(&mut uref);
    framer.input(uref);

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let out = &records[0];
    assert_eq!(out.block_size().unwrap(), 768);
    let bytes = out.block_to_vec().unwrap();
    assert_eq!(bytes[0], 0xFF);
    assert_eq!(bytes[1] & 0xF6, 0xF0);
    // The synthesized header declares the whole 768-byte frame.
    let declared =
        (usize::from(bytes[3] & 0x3) << 11) | (usize::from(bytes[4]) << 3) | usize::from(bytes[5] >> 5);
    assert_eq!(declared, 768);
    check_data(&bytes, ADTS_HEADER_SIZE);
    check_dates(out);
}

#[test]
fn raw_passthrough_keeps_global_headers() {
    let (uref_mgr, ubuf_mgr) = mgrs();
    let sink = record_sink(
        Uprobe::new(),
        Some(Box::new(|proposal: &Uref| {
            let mut answer = proposal.dup();
            set_encaps(&mut answer, Encaps::Raw);
            answer.set_flow_global();
            answer
        })),
    );

    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let mut flow_def = flow::alloc_block_def(&uref_mgr, "aac.sound.");
    set_encaps(&mut flow_def, Encaps::Raw);
    flow_def.set_flow_headers(&[0x11, 0x90]);
    framer.set_flow_def(&flow_def).unwrap();
    framer.set_output(&sink.pipe).unwrap();

    let size = 768 - ADTS_HEADER_SIZE;
    let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, size).unwrap();
    write_data(uref.block_write(0, size).unwrap());
    stamp(&mut uref);
    framer.input(uref);

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].block_size().unwrap(), 768 - ADTS_HEADER_SIZE);

    let flow_defs = sink.flow_defs.lock().unwrap();
    let fd = flow_defs.last().unwrap();
    assert_eq!(fd.flow_headers(), Some(&[0x11, 0x90][..]));
}

#[test]
fn rejects_unrelated_flow_defs() {
    let (uref_mgr, _) = mgrs();
    let framer = alloc_void(&MpgaFramerMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_def(&uref_mgr, "pic.");
    assert!(framer.set_flow_def(&flow_def).is_err());
    let flow_def = flow::alloc_block_def(&uref_mgr, "h264.pic.");
    assert!(framer.set_flow_def(&flow_def).is_err());
}
