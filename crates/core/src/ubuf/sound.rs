// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Sound buffers: one or more named channel planes at a declared sample
//! size. An interleaved stream is a single plane whose sample size covers
//! every channel; planar audio uses one plane per channel.

use crate::error::{Result, UbaseError};
use crate::umem::UmemMgr;
use smallvec::SmallVec;
use std::sync::Arc;

use super::plane::PlaneMem;

#[derive(Clone)]
struct SoundPlane {
    channel: Arc<str>,
    mem: PlaneMem,
}

/// A sound payload. Cloning shares the planes; writes require unique
/// ownership of the touched plane.
#[derive(Clone)]
pub struct UbufSound {
    samples: usize,
    sample_size: usize,
    planes: SmallVec<[SoundPlane; 2]>,
}

impl UbufSound {
    pub(super) fn alloc(
        umem: &UmemMgr,
        sample_size: usize,
        channels: &[Arc<str>],
        samples: usize,
    ) -> Result<Self> {
        if sample_size == 0 || channels.is_empty() {
            return Err(UbaseError::Invalid);
        }
        let planes = channels
            .iter()
            .map(|channel| SoundPlane {
                channel: channel.clone(),
                mem: PlaneMem::alloc(umem, samples * sample_size),
            })
            .collect();
        Ok(Self { samples, sample_size, planes })
    }

    /// Number of samples per plane.
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Bytes per sample per plane.
    #[must_use]
    pub const fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Enumerates channel plane names.
    pub fn iterate_planes(&self) -> impl Iterator<Item = &str> {
        self.planes.iter().map(|p| &*p.channel)
    }

    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Maps a plane for reading, by channel name.
    ///
    /// # Errors
    ///
    /// `Invalid` when the plane does not exist.
    pub fn plane_read(&self, channel: &str) -> Result<&[u8]> {
        self.planes
            .iter()
            .find(|p| &*p.channel == channel)
            .map(|p| p.mem.as_slice())
            .ok_or(UbaseError::Invalid)
    }

    /// Maps a plane for reading, by index.
    ///
    /// # Errors
    ///
    /// `Invalid` when the index is out of range.
    pub fn plane_read_idx(&self, idx: usize) -> Result<&[u8]> {
        self.planes.get(idx).map(|p| p.mem.as_slice()).ok_or(UbaseError::Invalid)
    }

    /// Maps a plane for writing; requires unique ownership of that plane.
    ///
    /// # Errors
    ///
    /// `Invalid` when the plane does not exist, `Busy` when shared.
    pub fn plane_write(&mut self, channel: &str) -> Result<&mut [u8]> {
        let plane = self
            .planes
            .iter_mut()
            .find(|p| &*p.channel == channel)
            .ok_or(UbaseError::Invalid)?;
        plane.mem.as_mut_slice().ok_or(UbaseError::Busy)
    }

    /// Copy-on-write: re-owns every shared plane.
    pub fn make_writable(&mut self, umem: &UmemMgr) {
        for plane in &mut self.planes {
            plane.mem.make_unique(umem);
        }
    }
}

impl std::fmt::Debug for UbufSound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UbufSound")
            .field("samples", &self.samples)
            .field("sample_size", &self.sample_size)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_alloc_and_write() {
        let umem = UmemMgr::alloc_mgr();
        let channels = [Arc::<str>::from("lr")];
        let mut snd = UbufSound::alloc(&umem, 4, &channels, 1024).unwrap();
        assert_eq!(snd.samples(), 1024);
        assert_eq!(snd.plane_read("lr").unwrap().len(), 4096);

        snd.plane_write("lr").unwrap()[0] = 0x42;
        let dup = snd.clone();
        assert!(matches!(snd.plane_write("lr"), Err(UbaseError::Busy)));
        assert_eq!(dup.plane_read_idx(0).unwrap()[0], 0x42);
    }

    #[test]
    fn planar_planes_are_independent() {
        let umem = UmemMgr::alloc_mgr();
        let channels = [Arc::<str>::from("l"), Arc::<str>::from("r")];
        let mut snd = UbufSound::alloc(&umem, 2, &channels, 16).unwrap();
        let names: Vec<_> = snd.iterate_planes().map(str::to_owned).collect();
        assert_eq!(names, ["l", "r"]);

        snd.plane_write("l").unwrap().fill(1);
        assert!(snd.plane_read("r").unwrap().iter().all(|&b| b == 0));
        assert!(snd.plane_read("missing").is_err());
    }
}
