// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

//! Audio splitter scenario: interleaved stereo s16 into two planar mono
//! outputs selected by channel bitfields.

mod common;

use common::record_sink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use upipe_core::flow;
use upipe_core::prelude::*;
use upipe_core::probes::UprobeUbufMem;
use upipe_pipes::audio_split::{set_bitfield, AudioSplitMgr};

fn sub_params(uref_mgr: &UrefMgr, bitfield: u64) -> Uref {
    let mut params = uref_mgr.alloc_control();
    params.set_flow_def(flow::DEF_SOUND);
    params.attrs_mut().set_small_unsigned(flow::SOUND_CHANNELS, 1);
    params.attrs_mut().set_small_unsigned(flow::SOUND_PLANES, 1);
    set_bitfield(&mut params, bitfield);
    params
}

#[test]
fn splits_interleaved_stereo_into_planar_channels() {
    let umem = UmemMgr::alloc_mgr();
    let uref_mgr = UrefMgr::std(UdictMgr::inline_mgr(0));
    let input_ubuf_mgr = UbufMgr::sound_mem(&umem, 4, &["lr"]);

    let split = alloc_void(&AudioSplitMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_sound_def(&uref_mgr, "s16.", 48_000, 2, 4, 1);
    split.set_flow_def(&flow_def).unwrap();

    // One sub per channel; the ubuf-mem probe serves their managers.
    let mut subs = Vec::new();
    let mut sinks = Vec::new();
    for bitfield in [0b01u64, 0b10u64] {
        let probe = Uprobe::new().push(UprobeUbufMem::new(umem.clone()));
        let sub = split.alloc_flow_sub(probe, sub_params(&uref_mgr, bitfield)).unwrap();
        let sink = record_sink(Uprobe::new(), None);
        sub.set_output(&sink.pipe).unwrap();
        subs.push(sub);
        sinks.push(sink);
    }

    // 1024 samples of interleaved stereo s16.
    let mut input = Uref::sound_alloc(&uref_mgr, &input_ubuf_mgr, 1024).unwrap();
    let mut reference = vec![0u8; 1024 * 4];
    for (j, byte) in reference.iter_mut().enumerate() {
        *byte = (j % 251) as u8;
    }
    {
        let sound = input.ubuf_mut().unwrap().sound_mut().unwrap();
        sound.plane_write("lr").unwrap().copy_from_slice(&reference);
    }
    input.set_pts_orig(27_000_000);
    split.input(input);

    for (channel, sink) in sinks.iter().enumerate() {
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1, "channel {channel}");
        let out = &records[0];
        assert_eq!(out.pts_orig(), Some(27_000_000));

        let sound = out.ubuf().unwrap().sound().unwrap();
        assert_eq!(sound.samples(), 1024);
        assert_eq!(sound.sample_size(), 2);
        let data = sound.plane_read_idx(0).unwrap();
        assert_eq!(data.len(), 2048);
        for (k, byte) in data.iter().enumerate() {
            let expected = reference[4 * (k / 2) + channel * 2 + (k % 2)];
            assert_eq!(*byte, expected, "channel {channel} byte {k}");
        }

        let flow_defs = sink.flow_defs.lock().unwrap();
        let fd = flow_defs.last().unwrap();
        assert_eq!(fd.flow_def(), Some("sound.s16."));
        assert_eq!(fd.attrs().get_small_unsigned(flow::SOUND_SAMPLE_SIZE), Some(2));
        assert_eq!(fd.attrs().get_unsigned(flow::SOUND_RATE), Some(48_000));
    }
}

#[test]
fn sub_knows_its_super_and_gets_source_end() {
    let umem = UmemMgr::alloc_mgr();
    let uref_mgr = UrefMgr::std(UdictMgr::inline_mgr(0));

    let split = alloc_void(&AudioSplitMgr::mgr(), Uprobe::new()).unwrap();
    let flow_def = flow::alloc_sound_def(&uref_mgr, "s16.", 48_000, 2, 4, 1);
    split.set_flow_def(&flow_def).unwrap();

    let ended = Arc::new(AtomicBool::new(false));
    let ended_in = ended.clone();
    let probe = Uprobe::new()
        .push(UprobeUbufMem::new(umem))
        .push(UprobeFn(move |_: &PipeRef<'_>, event: &Event| {
            if matches!(event, Event::SourceEnd) {
                ended_in.store(true, Ordering::Relaxed);
            }
            Err(UbaseError::Unhandled)
        }));
    let sub = split.alloc_flow_sub(probe, sub_params(&uref_mgr, 0b01)).unwrap();

    let sup = sub.sub_get_super().unwrap().unwrap();
    assert!(sup.ptr_eq(&split));
    assert_eq!(split.iterate_sub().unwrap().len(), 1);
    drop(sup);

    // Releasing the splitter warns its children.
    drop(split);
    assert!(ended.load(Ordering::Relaxed));

    // The sub still answers (its super's state is pinned), then dies.
    assert!(sub.sub_get_super().unwrap().is_none());
}

#[test]
fn split_rejects_planar_or_odd_flow_defs() {
    let uref_mgr = UrefMgr::std(UdictMgr::inline_mgr(0));
    let split = alloc_void(&AudioSplitMgr::mgr(), Uprobe::new()).unwrap();

    let mut planar = flow::alloc_sound_def(&uref_mgr, "s16.", 48_000, 2, 4, 2);
    assert!(split.set_flow_def(&planar).is_err());
    planar.attrs_mut().set_small_unsigned(flow::SOUND_PLANES, 1);
    planar.attrs_mut().set_small_unsigned(flow::SOUND_CHANNELS, 0);
    assert!(split.set_flow_def(&planar).is_err());

    let pic = flow::alloc_def(&uref_mgr, "pic.");
    assert!(split.set_flow_def(&pic).is_err());
}
