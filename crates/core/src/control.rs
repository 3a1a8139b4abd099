// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The synchronous command bus.
//!
//! Commands are a typed enum with typed replies; third-party pipes extend
//! the bus through [`Command::Custom`], gated by the manager's fourcc
//! signature. A pipe that does not implement a command returns
//! `Err(Unhandled)` so wrappers (bins, proxies) can take over.
//!
//! [`Pipe`] grows one convenience method per standard command below.

use crate::error::{Result, UbaseError};
use crate::uclock::Uclock;
use crate::upipe::{alloc_flow, alloc_void, Pipe, PipeMgr};
use crate::upump::UpumpMgr;
use crate::uprobe::Uprobe;
use crate::urequest::Request;
use crate::uref::Uref;
use std::any::Any;

/// A signature-gated command for pipe-specific extensions.
pub struct CustomCommand {
    /// Must match the target manager's signature.
    pub signature: u32,
    /// Pipe-defined payload, downcast by the implementation.
    pub payload: Box<dyn Any + Send>,
}

/// Standard control commands.
pub enum Command {
    /// Validate and adopt an incoming flow definition.
    SetFlowDef(Uref),
    /// Yield the last stored outbound flow def.
    GetFlowDef,
    /// Install (or clear) the next pipe in the graph.
    SetOutput(Option<Pipe>),
    /// Yield the currently installed output.
    GetOutput,
    /// Bind to an event-pump manager.
    AttachUpumpMgr(UpumpMgr),
    /// Bind a clock source.
    AttachUclock(Uclock),
    /// Propagate a resource request downstream.
    RegisterRequest(Request),
    UnregisterRequest(Request),
    /// Source/sink pipes: open/close the named endpoint.
    SetUri(String),
    GetUri,
    /// String key/value configuration.
    SetOption(String, String),
    /// Demuxers: snapshot the flow defs currently produced.
    SplitIterate,
    /// Composite pipes: the manager used to allocate sub-pipes.
    GetSubMgr,
    /// Snapshot the currently-allocated sub-pipes.
    IterateSub,
    /// A sub-pipe yields its super-pipe.
    SubGetSuper,
    /// Opaque-bin pipes expose their input terminal.
    BinGetFirstInner,
    /// Opaque-bin pipes expose their output terminal.
    BinGetLastInner,
    /// Terminate preroll buffering.
    EndPreroll,
    /// Queue-like pipes: bound the buffered length.
    SetMaxLength(usize),
    GetMaxLength,
    Custom(CustomCommand),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SetFlowDef(_) => "SetFlowDef",
            Self::GetFlowDef => "GetFlowDef",
            Self::SetOutput(_) => "SetOutput",
            Self::GetOutput => "GetOutput",
            Self::AttachUpumpMgr(_) => "AttachUpumpMgr",
            Self::AttachUclock(_) => "AttachUclock",
            Self::RegisterRequest(_) => "RegisterRequest",
            Self::UnregisterRequest(_) => "UnregisterRequest",
            Self::SetUri(_) => "SetUri",
            Self::GetUri => "GetUri",
            Self::SetOption(..) => "SetOption",
            Self::SplitIterate => "SplitIterate",
            Self::GetSubMgr => "GetSubMgr",
            Self::IterateSub => "IterateSub",
            Self::SubGetSuper => "SubGetSuper",
            Self::BinGetFirstInner => "BinGetFirstInner",
            Self::BinGetLastInner => "BinGetLastInner",
            Self::EndPreroll => "EndPreroll",
            Self::SetMaxLength(_) => "SetMaxLength",
            Self::GetMaxLength => "GetMaxLength",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Typed command replies.
pub enum Reply {
    None,
    FlowDef(Option<Uref>),
    Output(Option<Pipe>),
    Uri(Option<String>),
    FlowDefs(Vec<Uref>),
    SubMgr(PipeMgr),
    Subs(Vec<Pipe>),
    Super(Option<Pipe>),
    Inner(Option<Pipe>),
    MaxLength(usize),
    Custom(Box<dyn Any + Send>),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::FlowDef(_) => "FlowDef",
            Self::Output(_) => "Output",
            Self::Uri(_) => "Uri",
            Self::FlowDefs(_) => "FlowDefs",
            Self::SubMgr(_) => "SubMgr",
            Self::Subs(_) => "Subs",
            Self::Super(_) => "Super",
            Self::Inner(_) => "Inner",
            Self::MaxLength(_) => "MaxLength",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

impl Pipe {
    /// # Errors
    ///
    /// `Invalid` on flow-def rejection, or the pipe's own error.
    pub fn set_flow_def(&self, flow_def: &Uref) -> Result<()> {
        self.control(Command::SetFlowDef(flow_def.dup())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` when the pipe stores no outbound flow def.
    pub fn get_flow_def(&self) -> Result<Option<Uref>> {
        match self.control(Command::GetFlowDef)? {
            Reply::FlowDef(flow_def) => Ok(flow_def),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes with no output slot.
    pub fn set_output(&self, output: &Self) -> Result<()> {
        self.control(Command::SetOutput(Some(output.clone()))).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes with no output slot.
    pub fn clear_output(&self) -> Result<()> {
        self.control(Command::SetOutput(None)).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes with no output slot.
    pub fn get_output(&self) -> Result<Option<Self>> {
        match self.control(Command::GetOutput)? {
            Reply::Output(output) => Ok(output),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes that never schedule pumps.
    pub fn attach_upump_mgr(&self, mgr: &UpumpMgr) -> Result<()> {
        self.control(Command::AttachUpumpMgr(mgr.clone())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes that never consume time.
    pub fn attach_uclock(&self, clock: &Uclock) -> Result<()> {
        self.control(Command::AttachUclock(clock.clone())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` when the pipe cannot serve or forward requests.
    pub fn register_request(&self, request: &Request) -> Result<()> {
        self.control(Command::RegisterRequest(request.clone())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` when the pipe cannot serve or forward requests.
    pub fn unregister_request(&self, request: &Request) -> Result<()> {
        self.control(Command::UnregisterRequest(request.clone())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Invalid`/`External` when the endpoint cannot be opened.
    pub fn set_uri(&self, uri: &str) -> Result<()> {
        self.control(Command::SetUri(uri.to_owned())).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes without an endpoint.
    pub fn get_uri(&self) -> Result<Option<String>> {
        match self.control(Command::GetUri)? {
            Reply::Uri(uri) => Ok(uri),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Invalid` for unknown keys; pipes document their accepted keys.
    pub fn set_option(&self, key: &str, value: &str) -> Result<()> {
        self.control(Command::SetOption(key.to_owned(), value.to_owned())).map(|_| ())
    }

    /// Snapshot of the flow defs a split pipe currently produces.
    ///
    /// # Errors
    ///
    /// `Unhandled` for non-split pipes.
    pub fn split_iterate(&self) -> Result<Vec<Uref>> {
        match self.control(Command::SplitIterate)? {
            Reply::FlowDefs(flow_defs) => Ok(flow_defs),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for non-composite pipes.
    pub fn get_sub_mgr(&self) -> Result<PipeMgr> {
        match self.control(Command::GetSubMgr)? {
            Reply::SubMgr(mgr) => Ok(mgr),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// Snapshot of the currently-allocated sub-pipes.
    ///
    /// # Errors
    ///
    /// `Unhandled` for non-composite pipes.
    pub fn iterate_sub(&self) -> Result<Vec<Self>> {
        match self.control(Command::IterateSub)? {
            Reply::Subs(subs) => Ok(subs),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes that are not sub-pipes.
    pub fn sub_get_super(&self) -> Result<Option<Self>> {
        match self.control(Command::SubGetSuper)? {
            Reply::Super(sup) => Ok(sup),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for non-bin pipes.
    pub fn bin_get_first_inner(&self) -> Result<Option<Self>> {
        match self.control(Command::BinGetFirstInner)? {
            Reply::Inner(inner) => Ok(inner),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for non-bin pipes.
    pub fn bin_get_last_inner(&self) -> Result<Option<Self>> {
        match self.control(Command::BinGetLastInner)? {
            Reply::Inner(inner) => Ok(inner),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// # Errors
    ///
    /// `Unhandled` for pipes without preroll.
    pub fn end_preroll(&self) -> Result<()> {
        self.control(Command::EndPreroll).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for non-queue pipes.
    pub fn set_max_length(&self, max: usize) -> Result<()> {
        self.control(Command::SetMaxLength(max)).map(|_| ())
    }

    /// # Errors
    ///
    /// `Unhandled` for non-queue pipes.
    pub fn get_max_length(&self) -> Result<usize> {
        match self.control(Command::GetMaxLength)? {
            Reply::MaxLength(max) => Ok(max),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// Allocates a pipe from `mgr` and installs it as this pipe's output.
    ///
    /// # Errors
    ///
    /// Propagates alloc and `SetOutput` errors.
    pub fn alloc_output(&self, mgr: &PipeMgr, probe: Uprobe) -> Result<Self> {
        let output = alloc_void(mgr, probe)?;
        self.set_output(&output)?;
        Ok(output)
    }

    /// Realizes a sub-pipe of this composite carrying exactly `flow_def`.
    ///
    /// # Errors
    ///
    /// `Unhandled` for non-composite pipes; propagates the sub alloc error.
    pub fn alloc_flow_sub(&self, probe: Uprobe, flow_def: Uref) -> Result<Self> {
        let sub_mgr = self.get_sub_mgr()?;
        alloc_flow(&sub_mgr, probe, flow_def)
    }
}
