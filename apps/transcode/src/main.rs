// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Elementary-stream transcoder: reads a file, frames it, writes the
//! framed stream back out, with the source running on a worker thread.
//!
//! The codec modules of a full transcoder are separate components; this
//! binary wires the built-in framers, so `-f` only knows the `es`
//! container and `-x`/`-g` report their module as unavailable.

use clap::Parser;
use std::sync::mpsc;
use std::time::Duration;
use upipe_core::prelude::*;
use upipe_core::probes::{UprobeUbufMem, UprobeUrefMgr};
use upipe_pipes::file::{FileSinkMgr, FileSrcMgr};
use upipe_pipes::mpga::MpgaFramerMgr;
use upipe_runtime::{worker, TokioUpumpMgr, XferMgr};

const QUEUE_LENGTH: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "transcode", about = "Frame an elementary stream from file to file")]
struct Args {
    /// Verbose logging; repeat for debug output.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// File mode: stamp reception dates from the wall clock.
    #[arg(short = 'F')]
    file_mode: bool,

    /// Output container format (only "es" is built in).
    #[arg(short = 'f')]
    format: Option<String>,

    /// Output MIME type (audio/mpeg, audio/aac).
    #[arg(short = 'm')]
    mime: Option<String>,

    /// Begin per-stream configuration for this stream id.
    #[arg(short = 'p')]
    program: Option<u64>,

    /// Codec of the configured stream: mp2, mp3 or aac.
    #[arg(short = 'c')]
    codec: Option<String>,

    /// Decoder accelerator for the stream.
    #[arg(short = 'x')]
    accel: Option<String>,

    /// Filter graph for the stream.
    #[arg(short = 'g')]
    filters: Option<String>,

    /// Encoder option, key=value; repeatable.
    #[arg(short = 'o', action = clap::ArgAction::Append)]
    options: Vec<String>,

    /// Source file.
    source: String,

    /// Destination file.
    destination: String,
}

enum Outcome {
    SourceEnd,
    Fatal(UbaseError),
}

fn pick_codec(args: &Args) -> Result<&'static str> {
    if let Some(codec) = args.codec.as_deref() {
        return match codec {
            "mp2" => Ok("mp2"),
            "mp3" => Ok("mp3"),
            "aac" => Ok("aac"),
            other => {
                tracing::error!("codec module {other} is not available");
                Err(UbaseError::Invalid)
            }
        };
    }
    match args.mime.as_deref() {
        None | Some("audio/mpeg") => Ok("mp2"),
        Some("audio/aac") => Ok("aac"),
        Some(other) => {
            tracing::error!("no codec module for MIME type {other}");
            Err(UbaseError::Invalid)
        }
    }
}

fn run(args: &Args) -> Result<()> {
    if let Some(accel) = &args.accel {
        tracing::error!("decoder accelerator {accel} is not available");
        return Err(UbaseError::Invalid);
    }
    if let Some(filters) = &args.filters {
        tracing::error!("filter module {filters} is not available");
        return Err(UbaseError::Invalid);
    }
    if let Some(format) = args.format.as_deref() {
        if format != "es" {
            tracing::error!("container module {format} is not available");
            return Err(UbaseError::Invalid);
        }
    }
    for option in &args.options {
        if option.split_once('=').is_none() {
            tracing::error!("malformed option {option}, expected key=value");
            return Err(UbaseError::Invalid);
        }
    }
    let codec = pick_codec(args)?;
    if let Some(program) = args.program {
        tracing::debug!("configuring stream {program} as {codec}");
    }

    // Managers shared by the whole graph.
    let umem = UmemMgr::pool_mgr(&[4096, 16_384, 65_536], 16);
    let udict_mgr = UdictMgr::inline_mgr(64);
    let uref_mgr = UrefMgr::std(udict_mgr);

    let log_level = match args.debug {
        0 => LogLevel::Notice,
        1 => LogLevel::Debug,
        _ => LogLevel::Verbose,
    };
    let providers = Uprobe::new()
        .push(UprobeLog::new(log_level))
        .push(UprobeUbufMem::new(umem))
        .push(UprobeUrefMgr::new(uref_mgr.clone()));

    let (outcome_tx, outcome_rx) = mpsc::channel::<Outcome>();
    let watcher = move |tx: mpsc::Sender<Outcome>| {
        UprobeFn(move |_: &PipeRef<'_>, event: &Event| match event {
            Event::SourceEnd => {
                let _ = tx.send(Outcome::SourceEnd);
                Err(UbaseError::Unhandled)
            }
            Event::Fatal(err) => {
                let _ = tx.send(Outcome::Fatal(err.clone()));
                Err(UbaseError::Unhandled)
            }
            _ => Err(UbaseError::Unhandled),
        })
    };

    // The source runs on its own loop; everything downstream on ours.
    let xfer = XferMgr::alloc("transcode-src")?;
    let (local_pump, _local_loop) = TokioUpumpMgr::spawn_thread("transcode-main")?;

    let src_probe = providers
        .clone()
        .push(watcher(outcome_tx.clone()))
        .push(UprobePrefix::new("fsrc"));
    let fsrc = alloc_void(&FileSrcMgr::mgr(), src_probe)?;
    if args.file_mode {
        fsrc.attach_uclock(&Uclock::std())?;
    }
    let bin = worker::alloc_source(&xfer, providers.clone(), fsrc, QUEUE_LENGTH)?;

    let framer_probe = providers.clone().push(UprobePrefix::new(codec));
    let framer = alloc_void(&MpgaFramerMgr::mgr(), framer_probe)?;
    let flow_def = upipe_core::flow::alloc_block_def(&uref_mgr, &format!("{codec}.sound."));
    framer.set_flow_def(&flow_def)?;
    for option in &args.options {
        if let Some((key, value)) = option.split_once('=') {
            if let Err(err) = framer.set_option(key, value) {
                tracing::warn!("option {key}={value} not accepted: {err}");
            }
        }
    }

    let sink_probe = providers
        .clone()
        .push(watcher(outcome_tx))
        .push(UprobePrefix::new("fsink"));
    let fsink = alloc_void(&FileSinkMgr::mgr(), sink_probe)?;
    fsink.set_uri(&args.destination)?;

    framer.set_output(&fsink)?;
    bin.set_output(&framer)?;
    bin.attach_upump_mgr(&local_pump)?;
    bin.set_uri(&args.source)?;

    tracing::info!("transcoding {} to {} ({codec})", args.source, args.destination);
    match outcome_rx.recv() {
        Ok(Outcome::SourceEnd) => {
            // Let the queues flush before tearing the graph down.
            std::thread::sleep(Duration::from_millis(300));
            tracing::info!("stream finished");
            Ok(())
        }
        Ok(Outcome::Fatal(err)) => {
            tracing::error!("stream failed: {err}");
            Err(err)
        }
        Err(_) => Err(UbaseError::External("pipeline vanished".into())),
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let default_filter = match args.debug {
        0 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(_) => std::process::ExitCode::FAILURE,
    }
}
