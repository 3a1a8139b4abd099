// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Picture buffers: a set of named planes with stride and subsampling.

use crate::error::{Result, UbaseError};
use crate::umem::UmemMgr;
use smallvec::SmallVec;
use std::sync::Arc;

use super::plane::PlaneMem;

/// Static description of one plane of a pixel format.
#[derive(Debug, Clone)]
pub struct PicPlaneDesc {
    /// Chroma name, e.g. `y8`, `u8`, `v8`, `a8`, `x10`, `u8y8v8y8`.
    pub chroma: Arc<str>,
    /// Horizontal subsampling (1 = full resolution).
    pub hsub: usize,
    /// Vertical subsampling.
    pub vsub: usize,
    /// Bytes per macropixel in this plane.
    pub macropixel_size: usize,
}

#[derive(Clone)]
struct PicPlane {
    desc: PicPlaneDesc,
    stride: usize,
    mem: PlaneMem,
}

/// A picture payload. Cloning shares the planes; writes require unique
/// ownership of the touched plane.
#[derive(Clone)]
pub struct UbufPic {
    hsize: usize,
    vsize: usize,
    macropixel: usize,
    planes: SmallVec<[PicPlane; 4]>,
}

impl UbufPic {
    pub(super) fn alloc(
        umem: &UmemMgr,
        macropixel: usize,
        align: usize,
        descs: &[PicPlaneDesc],
        hsize: usize,
        vsize: usize,
    ) -> Result<Self> {
        if hsize == 0 || vsize == 0 || hsize % macropixel != 0 {
            return Err(UbaseError::Invalid);
        }
        let mut planes = SmallVec::new();
        for desc in descs {
            if hsize % (desc.hsub * macropixel) != 0 || vsize % desc.vsub != 0 {
                return Err(UbaseError::Invalid);
            }
            let row = hsize / desc.hsub / macropixel * desc.macropixel_size;
            let stride = if align > 1 { row.div_ceil(align) * align } else { row };
            let rows = vsize / desc.vsub;
            planes.push(PicPlane {
                desc: desc.clone(),
                stride,
                mem: PlaneMem::alloc(umem, stride * rows),
            });
        }
        Ok(Self { hsize, vsize, macropixel, planes })
    }

    #[must_use]
    pub const fn hsize(&self) -> usize {
        self.hsize
    }

    #[must_use]
    pub const fn vsize(&self) -> usize {
        self.vsize
    }

    /// Pixels per horizontal macropixel.
    #[must_use]
    pub const fn macropixel(&self) -> usize {
        self.macropixel
    }

    /// Enumerates plane chroma names.
    pub fn iterate_planes(&self) -> impl Iterator<Item = &str> {
        self.planes.iter().map(|p| &*p.desc.chroma)
    }

    #[must_use]
    pub fn plane_desc(&self, chroma: &str) -> Option<&PicPlaneDesc> {
        self.planes.iter().find(|p| &*p.desc.chroma == chroma).map(|p| &p.desc)
    }

    /// Maps a plane for reading; yields the data and its stride.
    ///
    /// # Errors
    ///
    /// `Invalid` when the plane does not exist.
    pub fn plane_read(&self, chroma: &str) -> Result<(&[u8], usize)> {
        let plane =
            self.planes.iter().find(|p| &*p.desc.chroma == chroma).ok_or(UbaseError::Invalid)?;
        Ok((plane.mem.as_slice(), plane.stride))
    }

    /// Maps a plane for writing; requires unique ownership of that plane.
    ///
    /// # Errors
    ///
    /// `Invalid` when the plane does not exist, `Busy` when shared.
    pub fn plane_write(&mut self, chroma: &str) -> Result<(&mut [u8], usize)> {
        let plane = self
            .planes
            .iter_mut()
            .find(|p| &*p.desc.chroma == chroma)
            .ok_or(UbaseError::Invalid)?;
        let stride = plane.stride;
        Ok((plane.mem.as_mut_slice().ok_or(UbaseError::Busy)?, stride))
    }

    /// Copy-on-write: re-owns every shared plane.
    pub fn make_writable(&mut self, umem: &UmemMgr) {
        for plane in &mut self.planes {
            plane.mem.make_unique(umem);
        }
    }
}

impl std::fmt::Debug for UbufPic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UbufPic")
            .field("hsize", &self.hsize)
            .field("vsize", &self.vsize)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn yuv_descs() -> Vec<PicPlaneDesc> {
        [("y8", 1, 1, 1), ("u8", 2, 2, 1), ("v8", 2, 2, 1)]
            .into_iter()
            .map(|(chroma, hsub, vsub, size)| PicPlaneDesc {
                chroma: Arc::from(chroma),
                hsub,
                vsub,
                macropixel_size: size,
            })
            .collect()
    }

    #[test]
    fn alloc_yuv420_with_aligned_strides() {
        let umem = UmemMgr::alloc_mgr();
        let pic = UbufPic::alloc(&umem, 1, 16, &yuv_descs(), 100, 60).unwrap();
        let (y, y_stride) = pic.plane_read("y8").unwrap();
        assert_eq!(y_stride, 112);
        assert_eq!(y.len(), 112 * 60);
        let (u, u_stride) = pic.plane_read("u8").unwrap();
        assert_eq!(u_stride, 64);
        assert_eq!(u.len(), 64 * 30);
        assert_eq!(pic.iterate_planes().count(), 3);
    }

    #[test]
    fn odd_sizes_are_rejected() {
        let umem = UmemMgr::alloc_mgr();
        assert!(UbufPic::alloc(&umem, 1, 0, &yuv_descs(), 101, 60).is_err());
        assert!(UbufPic::alloc(&umem, 1, 0, &yuv_descs(), 100, 61).is_err());
    }

    #[test]
    fn shared_plane_refuses_write() {
        let umem = UmemMgr::alloc_mgr();
        let mut pic = UbufPic::alloc(&umem, 1, 0, &yuv_descs(), 16, 16).unwrap();
        let dup = pic.clone();
        assert!(matches!(pic.plane_write("y8"), Err(UbaseError::Busy)));
        pic.make_writable(&umem);
        let (y, _) = pic.plane_write("y8").unwrap();
        y[0] = 0xAB;
        assert_eq!(dup.plane_read("y8").unwrap().0[0], 0);
    }
}
