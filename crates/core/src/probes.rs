// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Standard probes: request providers and the flow selector.
//!
//! Provider probes answer `ProvideRequest` events from pre-configured
//! instances, so a whole graph can be served by stacking them once under
//! the application's logger chain. [`UprobeSelflow`] watches a split pipe's
//! `SplitUpdate` events and materializes sub-pipes for the flows the user
//! selected.

use crate::error::{Result, UbaseError};
use crate::ubuf::UbufMgr;
use crate::uclock::Uclock;
use crate::umem::UmemMgr;
use crate::upipe::{Pipe, PipeRef, WeakPipe};
use crate::upump::UpumpMgr;
use crate::uprobe::{Event, ProbeHandler, Uprobe, UprobePrefix};
use crate::urequest::{Provision, RequestKind};
use crate::uref::{Uref, UrefMgr};
use std::sync::{Arc, Mutex, Weak};

/// Provides uref managers.
pub struct UprobeUrefMgr {
    mgr: UrefMgr,
}

impl UprobeUrefMgr {
    #[must_use]
    pub fn new(mgr: UrefMgr) -> Self {
        Self { mgr }
    }
}

impl ProbeHandler for UprobeUrefMgr {
    fn throw(&self, _next: &Uprobe, _pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match event {
            Event::ProvideRequest(request) if request.kind() == RequestKind::UrefMgr => {
                request.provide(Provision::UrefMgr(self.mgr.clone()));
                Ok(())
            }
            _ => Err(UbaseError::Unhandled),
        }
    }
}

/// Provides ubuf managers built from the request's flow format.
/// Flow-format requests are left alone: answering those is the
/// downstream pipe's privilege.
pub struct UprobeUbufMem {
    umem: UmemMgr,
}

impl UprobeUbufMem {
    #[must_use]
    pub fn new(umem: UmemMgr) -> Self {
        Self { umem }
    }
}

impl ProbeHandler for UprobeUbufMem {
    fn throw(&self, _next: &Uprobe, _pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        let Event::ProvideRequest(request) = event else {
            return Err(UbaseError::Unhandled);
        };
        if request.kind() != RequestKind::UbufMgr {
            return Err(UbaseError::Unhandled);
        }
        let Some(flow_def) = request.flow_def() else {
            return Err(UbaseError::Unhandled);
        };
        match UbufMgr::from_flow_def(&self.umem, flow_def.attrs()) {
            Ok(mgr) => {
                request.provide(Provision::UbufMgr(mgr));
                Ok(())
            }
            Err(_) => Err(UbaseError::Unhandled),
        }
    }
}

/// Provides a clock.
pub struct UprobeUclock {
    clock: Uclock,
}

impl UprobeUclock {
    #[must_use]
    pub fn new(clock: Uclock) -> Self {
        Self { clock }
    }
}

impl ProbeHandler for UprobeUclock {
    fn throw(&self, _next: &Uprobe, _pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match event {
            Event::ProvideRequest(request) if request.kind() == RequestKind::Uclock => {
                request.provide(Provision::Uclock(self.clock.clone()));
                Ok(())
            }
            _ => Err(UbaseError::Unhandled),
        }
    }
}

/// Attaches a pump manager to pipes that ask for one.
pub struct UprobeUpumpMgr {
    mgr: UpumpMgr,
}

impl UprobeUpumpMgr {
    #[must_use]
    pub fn new(mgr: UpumpMgr) -> Self {
        Self { mgr }
    }
}

impl ProbeHandler for UprobeUpumpMgr {
    fn throw(&self, _next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        match event {
            Event::NeedUpumpMgr => {
                pipe.control(crate::control::Command::AttachUpumpMgr(self.mgr.clone())).map(|_| ())
            }
            _ => Err(UbaseError::Unhandled),
        }
    }
}

/// The kind of flows a selector watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelflowKind {
    Void,
    Pic,
    Sound,
    Subpic,
}

fn check_def(kind: SelflowKind, def: &str) -> bool {
    match kind {
        SelflowKind::Void => def.starts_with("void."),
        SelflowKind::Pic => {
            (def.starts_with("pic.") && !def.starts_with("pic.sub."))
                || def
                    .find(".pic.")
                    .is_some_and(|pos| !def[pos..].starts_with(".pic.sub."))
        }
        SelflowKind::Sound => def.starts_with("sound.") || def.contains(".sound."),
        SelflowKind::Subpic => def.starts_with("pic.sub.") || def.contains(".pic.sub."),
    }
}

fn check_selected(flows: &str, flow_id: u64, flow_def: &Uref) -> bool {
    if flows == "all" || flows == "auto" {
        return true;
    }
    for part in flows.split(',').filter(|p| !p.is_empty()) {
        if let Ok(id) = part.parse::<u64>() {
            if id == flow_id {
                return true;
            }
            continue;
        }
        if let Some((attr, value)) = part.split_once('=') {
            match attr {
                "lang" => {
                    if flow_def.flow_languages().contains(&value) {
                        return true;
                    }
                }
                "name" => {
                    if flow_def.flow_name() == Some(value) {
                        return true;
                    }
                }
                _ => {}
            }
            continue;
        }
        tracing::warn!("malformed flow selector ({part})");
    }
    false
}

struct SelflowSub {
    split: WeakPipe,
    flow_id: u64,
    flow_def: Option<Uref>,
    subpipe: Option<Pipe>,
}

struct SelflowState {
    flows: String,
    auto_cfg: bool,
    has_selection: bool,
    subs: Vec<SelflowSub>,
}

struct SelflowInner {
    kind: SelflowKind,
    subprobe: Uprobe,
    state: Mutex<SelflowState>,
}

/// Watches `SplitUpdate`, compares each candidate flow against the user
/// selection (`all`, `auto`, explicit id list, `lang=`/`name=`
/// predicates), allocates a sub-pipe per selected flow and releases
/// sub-pipes for flows that disappeared. In `auto` mode the first matching
/// flow wins and the choice is revised when it goes away.
///
/// Clones share the selector; push one clone on the split pipe's chain and
/// keep another to reconfigure it.
#[derive(Clone)]
pub struct UprobeSelflow {
    inner: Arc<SelflowInner>,
}

impl UprobeSelflow {
    /// `subprobe` is given to every allocated sub-pipe.
    #[must_use]
    pub fn new(subprobe: Uprobe, kind: SelflowKind, flows: &str) -> Self {
        let flows = if flows.is_empty() { "auto" } else { flows };
        Self {
            inner: Arc::new(SelflowInner {
                kind,
                subprobe,
                state: Mutex::new(SelflowState {
                    flows: flows.to_owned(),
                    auto_cfg: flows == "auto",
                    has_selection: false,
                    subs: Vec::new(),
                }),
            }),
        }
    }

    /// The current selection: an id list terminated by a comma, or `all`,
    /// or `auto` when nothing was found yet.
    #[must_use]
    pub fn get(&self) -> String {
        lock(&self.inner.state).flows.clone()
    }

    /// Changes the selection and reconsiders every known flow.
    pub fn set(&self, flows: &str) {
        {
            let mut state = lock(&self.inner.state);
            state.auto_cfg = flows == "auto";
            if !state.auto_cfg || !state.has_selection {
                state.flows = flows.to_owned();
            }
        }
        Self::refresh(&self.inner);
    }

    /// Applies the selection: decisions are computed under the lock,
    /// allocations and releases happen outside it.
    fn refresh(inner: &Arc<SelflowInner>) {
        let mut to_drop: Vec<Pipe> = Vec::new();
        let to_alloc: Vec<(Pipe, u64, Uref)> = {
            let mut state = lock(&inner.state);

            if state.auto_cfg {
                let current = state
                    .subs
                    .iter()
                    .find(|sub| sub.subpipe.is_some())
                    .map(|sub| sub.flow_id);
                let pick = current.or_else(|| {
                    state.subs.iter().find(|sub| sub.flow_def.is_some()).map(|sub| sub.flow_id)
                });
                match pick {
                    Some(id) => {
                        state.flows = format!("{id},");
                        state.has_selection = true;
                    }
                    None => {
                        state.flows = "auto".to_owned();
                        state.has_selection = false;
                    }
                }
            }

            let flows = state.flows.clone();
            let mut to_alloc = Vec::new();
            for sub in &mut state.subs {
                let Some(flow_def) = &sub.flow_def else { continue };
                let selected = check_selected(&flows, sub.flow_id, flow_def);
                if selected && sub.subpipe.is_none() {
                    if let Some(split) = sub.split.upgrade() {
                        to_alloc.push((split, sub.flow_id, flow_def.dup()));
                    }
                } else if !selected {
                    if let Some(pipe) = sub.subpipe.take() {
                        to_drop.push(pipe);
                    }
                }
            }
            to_alloc
        };

        drop(to_drop);

        for (split, flow_id, flow_def) in to_alloc {
            let watcher = SelflowSubWatcher {
                inner: Arc::downgrade(inner),
                split: split.downgrade(),
                flow_id,
            };
            let probe = inner
                .subprobe
                .clone()
                .push(watcher)
                .push(UprobePrefix::new(format!("flow {flow_id}")));
            match split.alloc_flow_sub(probe, flow_def) {
                Ok(subpipe) => {
                    let mut state = lock(&inner.state);
                    if let Some(sub) = state
                        .subs
                        .iter_mut()
                        .find(|sub| sub.flow_id == flow_id && same_pipe(&sub.split, &split))
                    {
                        sub.subpipe = Some(subpipe);
                    }
                }
                Err(err) => tracing::warn!("cannot allocate sub-pipe for flow {flow_id}: {err}"),
            }
        }
    }
}

fn lock(mutex: &Mutex<SelflowState>) -> std::sync::MutexGuard<'_, SelflowState> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn same_pipe(weak: &WeakPipe, pipe: &Pipe) -> bool {
    weak.upgrade().is_some_and(|p| p.ptr_eq(pipe))
}

impl ProbeHandler for UprobeSelflow {
    fn throw(&self, _next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        if !matches!(event, Event::SplitUpdate) {
            return Err(UbaseError::Unhandled);
        }
        let Some(split) = pipe.upgrade() else {
            return Err(UbaseError::Unhandled);
        };
        let flow_defs = split.split_iterate()?;

        let mut to_drop = Vec::new();
        {
            let mut state = lock(&self.inner.state);

            for flow_def in &flow_defs {
                let Some(flow_id) = flow_def.flow_id() else { continue };
                let Some(def) = flow_def.flow_def() else { continue };
                if !check_def(self.inner.kind, def) {
                    continue;
                }
                match state
                    .subs
                    .iter_mut()
                    .find(|sub| sub.flow_id == flow_id && same_pipe(&sub.split, &split))
                {
                    Some(sub) => {
                        if sub.flow_def.is_none() {
                            sub.flow_def = Some(flow_def.dup());
                        }
                    }
                    None => state.subs.push(SelflowSub {
                        split: split.downgrade(),
                        flow_id,
                        flow_def: Some(flow_def.dup()),
                        subpipe: None,
                    }),
                }
            }

            // Flows that disappeared from the split.
            state.subs.retain_mut(|sub| {
                if !same_pipe(&sub.split, &split) {
                    return true;
                }
                let still_there =
                    flow_defs.iter().any(|fd| fd.flow_id() == Some(sub.flow_id));
                if !still_there {
                    if let Some(pipe) = sub.subpipe.take() {
                        to_drop.push(pipe);
                    }
                }
                still_there
            });
        }
        drop(to_drop);

        Self::refresh(&self.inner);
        // Let outer probes observe the update too.
        Err(UbaseError::Unhandled)
    }
}

/// Watches one allocated sub-pipe; on `SourceEnd` the selector forgets the
/// flow and releases the sub-pipe.
struct SelflowSubWatcher {
    inner: Weak<SelflowInner>,
    split: WeakPipe,
    flow_id: u64,
}

impl ProbeHandler for SelflowSubWatcher {
    fn throw(&self, next: &Uprobe, pipe: &PipeRef<'_>, event: &Event) -> Result<()> {
        if !matches!(event, Event::SourceEnd) {
            return Err(UbaseError::Unhandled);
        }
        let result = next.throw(pipe, event);
        if let Some(inner) = self.inner.upgrade() {
            let mut to_drop = Vec::new();
            {
                let mut state = lock(&inner.state);
                state.subs.retain_mut(|sub| {
                    let matches = sub.flow_id == self.flow_id
                        && match (sub.split.upgrade(), self.split.upgrade()) {
                            (Some(a), Some(b)) => a.ptr_eq(&b),
                            (None, None) => true,
                            _ => false,
                        };
                    if matches {
                        if let Some(pipe) = sub.subpipe.take() {
                            to_drop.push(pipe);
                        }
                    }
                    !matches
                });
            }
            drop(to_drop);
        }
        match result {
            Err(UbaseError::Unhandled) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::control::{Command, CustomCommand, Reply};
    use crate::helpers::SubRegistry;
    use crate::udict::UdictMgr;
    use crate::upipe::{
        alloc_void, fourcc, AllocArgs, PipeCtx, PipeManager, PipeMgr, PipeOps,
    };
    use crate::upipe::tests::phony_sink;
    use crate::uref::UrefMgr;

    const SPLIT_SIGNATURE: u32 = fourcc(*b"spts");
    const SPLIT_SUB_SIGNATURE: u32 = fourcc(*b"spsu");

    struct SetFlows(Vec<(u64, &'static str)>);

    struct SplitShared {
        subs: Mutex<SubRegistry>,
    }

    struct SplitTestMgr;

    impl PipeManager for SplitTestMgr {
        fn signature(&self) -> u32 {
            SPLIT_SIGNATURE
        }

        fn alloc(self: Arc<Self>, probe: Uprobe, _args: AllocArgs) -> Result<Pipe> {
            let shared = Arc::new(SplitShared { subs: Mutex::new(SubRegistry::new()) });
            Ok(Pipe::build(self, probe, SplitOps { flows: Vec::new(), shared, this: WeakPipe::new() }))
        }
    }

    struct SplitOps {
        flows: Vec<Uref>,
        shared: Arc<SplitShared>,
        this: WeakPipe,
    }

    impl PipeOps for SplitOps {
        fn on_ready(&mut self, ctx: &mut PipeCtx<'_>) {
            if let Some(pipe) = ctx.pipe() {
                self.this = pipe.downgrade();
            }
        }

        fn control(&mut self, ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
            match command {
                Command::SplitIterate => {
                    Ok(Reply::FlowDefs(self.flows.iter().map(Uref::dup).collect()))
                }
                Command::GetSubMgr => Ok(Reply::SubMgr(Arc::new(SplitSubMgr {
                    shared: self.shared.clone(),
                    split: self.this.clone(),
                }))),
                Command::IterateSub => {
                    Ok(Reply::Subs(self.shared.subs.lock().unwrap().alive()))
                }
                Command::Custom(custom) => {
                    let flows = custom
                        .payload
                        .downcast::<SetFlows>()
                        .map_err(|_| UbaseError::Invalid)?;
                    self.flows = flows
                        .0
                        .iter()
                        .map(|(id, def)| {
                            let mut uref = Uref::new();
                            uref.set_flow_id(*id);
                            uref.set_flow_def(def);
                            uref
                        })
                        .collect();
                    ctx.throw(Event::SplitUpdate);
                    Ok(Reply::None)
                }
                _ => Err(UbaseError::Unhandled),
            }
        }
    }

    struct SplitSubMgr {
        shared: Arc<SplitShared>,
        split: WeakPipe,
    }

    impl PipeManager for SplitSubMgr {
        fn signature(&self) -> u32 {
            SPLIT_SUB_SIGNATURE
        }

        fn alloc(self: Arc<Self>, probe: Uprobe, args: AllocArgs) -> Result<Pipe> {
            let AllocArgs::Flow(flow_def) = args else { return Err(UbaseError::Invalid) };
            let split = self.split.clone();
            let guard = split.upgrade().map(|p| p.guard());
            let shared = self.shared.clone();
            let pipe = Pipe::build(self, probe, SplitSubOps { flow_def, split, _guard: guard });
            shared.subs.lock().unwrap().add(&pipe);
            Ok(pipe)
        }
    }

    struct SplitSubOps {
        flow_def: Uref,
        split: WeakPipe,
        _guard: Option<crate::upipe::PipeGuard>,
    }

    impl PipeOps for SplitSubOps {
        fn control(&mut self, _ctx: &mut PipeCtx<'_>, command: Command) -> Result<Reply> {
            match command {
                Command::GetFlowDef => Ok(Reply::FlowDef(Some(self.flow_def.dup()))),
                Command::SubGetSuper => Ok(Reply::Super(self.split.upgrade())),
                _ => Err(UbaseError::Unhandled),
            }
        }
    }

    fn publish(split: &Pipe, flows: Vec<(u64, &'static str)>) {
        split
            .control(Command::Custom(CustomCommand {
                signature: SPLIT_SIGNATURE,
                payload: Box::new(SetFlows(flows)),
            }))
            .map(|_| ())
            .unwrap();
    }

    fn sub_ids(split: &Pipe) -> Vec<u64> {
        split
            .iterate_sub()
            .unwrap()
            .iter()
            .map(|sub| sub.get_flow_def().unwrap().unwrap().flow_id().unwrap())
            .collect()
    }

    #[test]
    fn selflow_auto_picks_first_and_revises() {
        let selflow = UprobeSelflow::new(Uprobe::new(), SelflowKind::Pic, "auto");
        let mgr: PipeMgr = Arc::new(SplitTestMgr);
        let split = alloc_void(&mgr, Uprobe::new().push(selflow.clone())).unwrap();

        publish(&split, vec![(0x100, "pic."), (0x101, "sound."), (0x102, "pic.")]);
        assert_eq!(sub_ids(&split), [0x100]);
        assert_eq!(selflow.get(), format!("{},", 0x100));

        // The chosen flow disappears: its sub-pipe dies and the selector
        // falls over to the other matching flow.
        publish(&split, vec![(0x101, "sound."), (0x102, "pic.")]);
        assert_eq!(sub_ids(&split), [0x102]);
        assert_eq!(selflow.get(), format!("{},", 0x102));
    }

    #[test]
    fn selflow_all_takes_every_matching_flow() {
        let selflow = UprobeSelflow::new(Uprobe::new(), SelflowKind::Pic, "all");
        let mgr: PipeMgr = Arc::new(SplitTestMgr);
        let split = alloc_void(&mgr, Uprobe::new().push(selflow)).unwrap();

        publish(&split, vec![(0x100, "pic."), (0x101, "sound."), (0x102, "pic.")]);
        let mut ids = sub_ids(&split);
        ids.sort_unstable();
        assert_eq!(ids, [0x100, 0x102]);
    }

    #[test]
    fn selflow_filters_by_language() {
        let selflow = UprobeSelflow::new(Uprobe::new(), SelflowKind::Sound, "lang=eng");
        let mgr: PipeMgr = Arc::new(SplitTestMgr);
        let split = alloc_void(&mgr, Uprobe::new().push(selflow.clone())).unwrap();

        publish(&split, vec![(0x10, "sound."), (0x11, "sound.")]);
        // No languages declared: nothing matches.
        assert!(sub_ids(&split).is_empty());
        assert!(!check_selected("lang=eng,", 0x10, &Uref::new()));

        let mut with_lang = Uref::new();
        with_lang.add_flow_language("eng");
        assert!(check_selected("lang=eng,", 0x10, &with_lang));
        assert!(!check_selected("lang=fra,", 0x10, &with_lang));
    }

    #[test]
    fn selflow_kind_filter_matches_def_families() {
        assert!(check_def(SelflowKind::Pic, "pic."));
        assert!(check_def(SelflowKind::Pic, "block.h264.pic."));
        assert!(!check_def(SelflowKind::Pic, "pic.sub."));
        assert!(!check_def(SelflowKind::Pic, "block.dvbsub.pic.sub."));
        assert!(check_def(SelflowKind::Subpic, "block.dvbsub.pic.sub."));
        assert!(check_def(SelflowKind::Sound, "block.mp2.sound."));
        assert!(check_def(SelflowKind::Void, "void.scte35."));
        assert!(!check_def(SelflowKind::Void, "block."));
    }

    #[test]
    fn provider_probes_answer_requests() {
        let uref_mgr = UrefMgr::std(UdictMgr::inline_mgr(0));
        let umem = UmemMgr::alloc_mgr();
        let probe = Uprobe::new()
            .push(UprobeUrefMgr::new(uref_mgr))
            .push(UprobeUbufMem::new(umem));
        let (sink, _records) = phony_sink(probe);

        let got = Arc::new(Mutex::new(false));
        let got_in = got.clone();
        let request = crate::urequest::Request::new(
            RequestKind::UrefMgr,
            None,
            move |_req, provision| {
                if matches!(provision, Provision::UrefMgr(_)) {
                    *got_in.lock().unwrap() = true;
                }
            },
        );
        sink.register_request(&request).unwrap();
        assert!(*got.lock().unwrap());

        // A ubuf manager request built from a sound flow def.
        let got_mgr = Arc::new(Mutex::new(false));
        let got_in = got_mgr.clone();
        let mut flow_def = Uref::new();
        flow_def.set_flow_def("sound.s16.");
        flow_def.attrs_mut().set_small_unsigned(crate::flow::SOUND_SAMPLE_SIZE, 2);
        flow_def.attrs_mut().set_small_unsigned(crate::flow::SOUND_CHANNELS, 1);
        flow_def.attrs_mut().set_small_unsigned(crate::flow::SOUND_PLANES, 1);
        let request = crate::urequest::Request::new(
            RequestKind::UbufMgr,
            Some(flow_def),
            move |_req, provision| {
                if matches!(provision, Provision::UbufMgr(_)) {
                    *got_in.lock().unwrap() = true;
                }
            },
        );
        sink.register_request(&request).unwrap();
        assert!(*got_mgr.lock().unwrap());
    }
}
