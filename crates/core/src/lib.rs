// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Upipe Core - contracts and data structures of the pipeline runtime.
//!
//! This crate defines everything a processing pipe is built from:
//!
//! ## Core Modules
//!
//! - [`umem`]: raw-memory manager with bounded free-lists
//! - [`udict`]: typed, insertion-ordered attribute dictionary
//! - [`ubuf`]: refcounted media payloads (block/picture/sound)
//! - [`uref`]: the unit flowing between pipes (payload + attributes)
//! - [`flow`]: flow definitions and well-known flow attributes
//! - [`uclock`]: 27 MHz monotonic clocks and per-uref timestamps
//! - [`upipe`]: pipes, managers, lifecycle, the effects trampoline
//! - [`control`]: the typed command bus
//! - [`urequest`]: resource requests and provisions
//! - [`uprobe`]: the event/probe chain
//! - [`probes`]: request providers and the flow selector
//! - [`helpers`]: reusable state helpers (output, uref-stream, sub registry)
//! - [`upump`]: event-pump contracts (implemented by the runtime crate)
//! - [`error`]: the shared error taxonomy
//!
//! ## Quick Start
//!
//! ```ignore
//! use upipe_core::prelude::*;
//!
//! // Managers shared by the whole graph.
//! let umem = UmemMgr::alloc_mgr();
//! let udict_mgr = UdictMgr::inline_mgr(16);
//! let uref_mgr = UrefMgr::std(udict_mgr);
//!
//! // A probe chain ending in a tracing log sink.
//! let probe = Uprobe::new().push(UprobeLog::new(LogLevel::Debug));
//!
//! // Allocate pipes from their managers and wire them.
//! let source = upipe_core::upipe::alloc_void(&source_mgr, probe.clone())?;
//! let sink = source.alloc_output(&sink_mgr, probe)?;
//! ```

pub mod control;
pub mod error;
pub mod flow;
pub mod helpers;
pub mod probes;
pub mod ubuf;
pub mod uclock;
pub mod udict;
pub mod umem;
pub mod upipe;
pub mod upump;
pub mod uprobe;
pub mod uref;
pub mod urequest;

// Convenience re-exports for the types nearly every pipe touches.

pub use control::{Command, CustomCommand, Reply};
pub use error::{Result, UbaseError};
pub use helpers::{HelperControl, OutputHelper, SubRegistry, UrefStream};
pub use ubuf::{Ubuf, UbufBlock, UbufMgr, UbufPic, UbufSound};
pub use uclock::{Uclock, UclockOps, UCLOCK_FREQ};
pub use udict::{AttrType, AttrValue, Rational, Udict, UdictMgr};
pub use umem::{UmemBuf, UmemMgr};
pub use upipe::{
    alloc_flow, alloc_void, fourcc, AllocArgs, Pipe, PipeCtx, PipeGuard, PipeManager, PipeMgr,
    PipeOps, PipeRef, WeakPipe,
};
pub use upump::{PumpCallback, Upump, UpumpMgr, UpumpMgrOps, UpumpOps, Usignal};
pub use uprobe::{Event, LogLevel, ProbeHandler, Uprobe, UprobeFn, UprobeLog, UprobePrefix};
pub use urequest::{Provision, Request, RequestKind};
pub use uref::{Uref, UrefMgr};

/// One-stop import for pipe implementations and applications.
pub mod prelude {
    pub use crate::control::{Command, CustomCommand, Reply};
    pub use crate::error::{Result, UbaseError};
    pub use crate::helpers::{HelperControl, OutputHelper, SubRegistry, UrefStream};
    pub use crate::ubuf::{Ubuf, UbufBlock, UbufMgr};
    pub use crate::uclock::{Uclock, UCLOCK_FREQ};
    pub use crate::udict::{AttrType, AttrValue, Rational, Udict, UdictMgr};
    pub use crate::umem::UmemMgr;
    pub use crate::upipe::{
        alloc_flow, alloc_void, fourcc, AllocArgs, Pipe, PipeCtx, PipeGuard, PipeManager,
        PipeMgr, PipeOps, PipeRef, WeakPipe,
    };
    pub use crate::upump::{PumpCallback, Upump, UpumpMgr, Usignal};
    pub use crate::uprobe::{Event, LogLevel, ProbeHandler, Uprobe, UprobeFn, UprobeLog,
        UprobePrefix};
    pub use crate::urequest::{Provision, Request, RequestKind};
    pub use crate::uref::{Uref, UrefMgr};
}
