// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The unit that flows between pipes.
//!
//! A [`Uref`] bundles an optional owned [`Ubuf`] payload with an owned
//! [`Udict`] of attributes (flow definition, timestamps, flags). Control
//! urefs carry no payload. A uref is single-owner; multi-consumer fanout
//! must [`Uref::dup`] explicitly, which deep-copies the dictionary but
//! shares the payload refcount.

use crate::error::{Result, UbaseError};
use crate::ubuf::{Ubuf, UbufMgr};
use crate::udict::{Udict, UdictMgr};
use std::sync::Arc;

struct UrefMgrInner {
    udict_mgr: UdictMgr,
}

/// Factory for urefs; owns the dictionary manager the attributes are drawn
/// from.
#[derive(Clone)]
pub struct UrefMgr {
    inner: Arc<UrefMgrInner>,
}

impl UrefMgr {
    /// The standard manager.
    #[must_use]
    pub fn std(udict_mgr: UdictMgr) -> Self {
        Self { inner: Arc::new(UrefMgrInner { udict_mgr }) }
    }

    /// Allocates an empty uref with no payload.
    #[must_use]
    pub fn alloc(&self) -> Uref {
        Uref { ubuf: None, attrs: self.inner.udict_mgr.alloc() }
    }

    /// Allocates a control uref (alias of [`Self::alloc`], kept for call-site
    /// clarity).
    #[must_use]
    pub fn alloc_control(&self) -> Uref {
        self.alloc()
    }
}

/// A payload reference plus its attributes.
pub struct Uref {
    ubuf: Option<Ubuf>,
    attrs: Udict,
}

impl Uref {
    /// A uref with no manager affiliation, for tests.
    #[must_use]
    pub fn new() -> Self {
        Self { ubuf: None, attrs: Udict::new() }
    }

    /// Allocates a uref carrying a fresh writable block of `size` bytes.
    ///
    /// # Errors
    ///
    /// `Invalid` when `ubuf_mgr` is not a block manager.
    pub fn block_alloc(uref_mgr: &UrefMgr, ubuf_mgr: &UbufMgr, size: usize) -> Result<Self> {
        let mut uref = uref_mgr.alloc();
        uref.ubuf = Some(ubuf_mgr.alloc_block(size)?);
        Ok(uref)
    }

    /// Allocates a uref carrying a fresh sound buffer of `samples` samples.
    ///
    /// # Errors
    ///
    /// `Invalid` when `ubuf_mgr` is not a sound manager.
    pub fn sound_alloc(uref_mgr: &UrefMgr, ubuf_mgr: &UbufMgr, samples: usize) -> Result<Self> {
        let mut uref = uref_mgr.alloc();
        uref.ubuf = Some(ubuf_mgr.alloc_sound(samples)?);
        Ok(uref)
    }

    /// Duplicate: deep-copies the attributes, shares the payload.
    #[must_use]
    pub fn dup(&self) -> Self {
        Self { ubuf: self.ubuf.clone(), attrs: self.attrs.dup() }
    }

    /// New uref with the same attributes and a different payload.
    #[must_use]
    pub fn fork(&self, ubuf: Option<Ubuf>) -> Self {
        Self { ubuf, attrs: self.attrs.dup() }
    }

    pub fn attach_ubuf(&mut self, ubuf: Ubuf) {
        self.ubuf = Some(ubuf);
    }

    pub fn detach_ubuf(&mut self) -> Option<Ubuf> {
        self.ubuf.take()
    }

    #[must_use]
    pub const fn ubuf(&self) -> Option<&Ubuf> {
        self.ubuf.as_ref()
    }

    pub fn ubuf_mut(&mut self) -> Option<&mut Ubuf> {
        self.ubuf.as_mut()
    }

    #[must_use]
    pub const fn attrs(&self) -> &Udict {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Udict {
        &mut self.attrs
    }

    // Block payload forwarders.

    /// # Errors
    ///
    /// `Invalid` when the uref carries no block payload.
    pub fn block_size(&self) -> Result<usize> {
        Ok(self.ubuf.as_ref().ok_or(UbaseError::Invalid)?.block()?.size())
    }

    /// Maps `len` bytes at `offset` of the block payload for writing.
    ///
    /// # Errors
    ///
    /// See [`crate::ubuf::UbufBlock::write`]; `Invalid` with no payload.
    pub fn block_write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.ubuf.as_mut().ok_or(UbaseError::Invalid)?.block_mut()?.write(offset, len)
    }

    /// Maps bytes of the block payload for reading (see
    /// [`crate::ubuf::UbufBlock::peek`]).
    pub fn block_peek<'a>(&'a self, offset: usize, scratch: &'a mut [u8]) -> Option<&'a [u8]> {
        self.ubuf.as_ref()?.block().ok()?.peek(offset, scratch)
    }

    /// Copies the whole block payload into a vector.
    ///
    /// # Errors
    ///
    /// `Invalid` when the uref carries no block payload.
    pub fn block_to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.ubuf.as_ref().ok_or(UbaseError::Invalid)?.block()?.to_vec())
    }
}

impl Default for Uref {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Uref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uref").field("ubuf", &self.ubuf).field("attrs", &self.attrs).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::umem::UmemMgr;

    fn mgrs() -> (UrefMgr, UbufMgr) {
        let umem = UmemMgr::alloc_mgr();
        let uref_mgr = UrefMgr::std(UdictMgr::inline_mgr(0));
        let ubuf_mgr = UbufMgr::block_mem(&umem, 0, 0, 0);
        (uref_mgr, ubuf_mgr)
    }

    #[test]
    fn dup_copies_attrs_and_shares_payload() {
        let (uref_mgr, ubuf_mgr) = mgrs();
        let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, 8).unwrap();
        uref.block_write(0, 8).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        uref.attrs_mut().set_unsigned("flow.id", 7);

        let mut copy = uref.dup();
        copy.attrs_mut().set_unsigned("flow.id", 8);
        assert_eq!(uref.attrs().get_unsigned("flow.id"), Some(7));

        // The payload is now shared, so writes are refused on both.
        assert!(uref.block_write(0, 1).is_err());
        assert_eq!(copy.block_to_vec().unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn fork_swaps_payload_keeps_attrs() {
        let (uref_mgr, ubuf_mgr) = mgrs();
        let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, 4).unwrap();
        uref.attrs_mut().set_string("flow.def", "block.");
        let fork = uref.fork(None);
        assert!(fork.ubuf().is_none());
        assert_eq!(fork.attrs().get_string("flow.def"), Some("block."));
    }

    #[test]
    fn detach_leaves_control_uref() {
        let (uref_mgr, ubuf_mgr) = mgrs();
        let mut uref = Uref::block_alloc(&uref_mgr, &ubuf_mgr, 4).unwrap();
        assert!(uref.detach_ubuf().is_some());
        assert!(uref.block_size().is_err());
    }
}
