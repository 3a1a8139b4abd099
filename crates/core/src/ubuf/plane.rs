// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared plane storage for picture and sound buffers.

use crate::umem::{UmemBuf, UmemMgr};
use std::sync::Arc;

/// One plane's backing memory. Cloning shares; writes need uniqueness.
#[derive(Clone)]
pub(super) struct PlaneMem {
    mem: Arc<UmemBuf>,
}

impl PlaneMem {
    pub(super) fn alloc(umem: &UmemMgr, size: usize) -> Self {
        Self { mem: Arc::new(umem.alloc(size)) }
    }

    pub(super) fn as_slice(&self) -> &[u8] {
        self.mem.as_slice()
    }

    /// `None` when the plane is shared with another buffer.
    pub(super) fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.mem).map(UmemBuf::as_mut_slice)
    }

    /// Copy-on-write into fresh storage when shared.
    pub(super) fn make_unique(&mut self, umem: &UmemMgr) {
        if Arc::get_mut(&mut self.mem).is_some() {
            return;
        }
        let mut copy = umem.alloc(self.mem.len());
        copy.as_mut_slice().copy_from_slice(self.mem.as_slice());
        self.mem = Arc::new(copy);
    }
}
