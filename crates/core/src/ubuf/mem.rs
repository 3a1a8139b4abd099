// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Typed ubuf factories backed by umem storage.
//!
//! A manager fixes the shape of the buffers it produces: reserve sizes for
//! block buffers, the plane set for pictures, the channel layout for sound.
//! [`UbufMgr::from_flow_def`] builds the matching manager for a flow
//! definition, which is how request providers answer ubuf-manager requests.

use crate::error::{Result, UbaseError};
use crate::flow;
use crate::udict::Udict;
use crate::umem::UmemMgr;
use std::sync::Arc;

use super::block::UbufBlock;
use super::pic::{PicPlaneDesc, UbufPic};
use super::sound::UbufSound;
use super::Ubuf;

/// Block-buffer factory with prepend/append reserves and alignment.
pub struct UbufBlockMgr {
    umem: UmemMgr,
    prepend: usize,
    append: usize,
    align: usize,
}

impl UbufBlockMgr {
    fn alloc(&self, size: usize) -> UbufBlock {
        let mut total = self.prepend + size + self.append;
        if self.align > 1 {
            total = total.div_ceil(self.align) * self.align;
        }
        UbufBlock::from_umem(self.umem.alloc(total), self.prepend, size)
    }
}

/// Picture-buffer factory over a declared plane set.
pub struct UbufPicMgr {
    umem: UmemMgr,
    macropixel: usize,
    align: usize,
    planes: Vec<PicPlaneDesc>,
}

impl UbufPicMgr {
    #[must_use]
    pub fn new(umem: UmemMgr, macropixel: usize, align: usize) -> Self {
        Self { umem, macropixel, align, planes: Vec::new() }
    }

    /// Declares a plane; chainable at construction time.
    #[must_use]
    pub fn with_plane(
        mut self,
        chroma: &str,
        hsub: usize,
        vsub: usize,
        macropixel_size: usize,
    ) -> Self {
        self.planes.push(PicPlaneDesc { chroma: Arc::from(chroma), hsub, vsub, macropixel_size });
        self
    }

    fn alloc(&self, hsize: usize, vsize: usize) -> Result<UbufPic> {
        UbufPic::alloc(&self.umem, self.macropixel, self.align, &self.planes, hsize, vsize)
    }
}

/// Sound-buffer factory over a declared channel layout.
pub struct UbufSoundMgr {
    umem: UmemMgr,
    sample_size: usize,
    channels: Vec<Arc<str>>,
}

impl UbufSoundMgr {
    fn alloc(&self, samples: usize) -> Result<UbufSound> {
        UbufSound::alloc(&self.umem, self.sample_size, &self.channels, samples)
    }
}

/// A typed ubuf factory handle. Cheap to clone; shared by reference between
/// pipes on the same loop.
#[derive(Clone)]
pub enum UbufMgr {
    Block(Arc<UbufBlockMgr>),
    Pic(Arc<UbufPicMgr>),
    Sound(Arc<UbufSoundMgr>),
}

impl UbufMgr {
    /// Block manager with the given reserves. `align` 0 or 1 disables
    /// alignment.
    #[must_use]
    pub fn block_mem(umem: &UmemMgr, prepend: usize, append: usize, align: usize) -> Self {
        Self::Block(Arc::new(UbufBlockMgr { umem: umem.clone(), prepend, append, align }))
    }

    /// Wraps a configured picture manager.
    #[must_use]
    pub fn pic_mem(mgr: UbufPicMgr) -> Self {
        Self::Pic(Arc::new(mgr))
    }

    /// Sound manager producing `channels.len()` planes of `sample_size`
    /// bytes per sample.
    #[must_use]
    pub fn sound_mem(umem: &UmemMgr, sample_size: usize, channels: &[&str]) -> Self {
        Self::Sound(Arc::new(UbufSoundMgr {
            umem: umem.clone(),
            sample_size,
            channels: channels.iter().map(|c| Arc::from(*c)).collect(),
        }))
    }

    /// Allocates a writable block of `size` bytes.
    ///
    /// # Errors
    ///
    /// `Invalid` when this is not a block manager.
    pub fn alloc_block(&self, size: usize) -> Result<Ubuf> {
        match self {
            Self::Block(mgr) => Ok(Ubuf::Block(mgr.alloc(size))),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// Allocates a picture of `hsize` x `vsize` pixels.
    ///
    /// # Errors
    ///
    /// `Invalid` when this is not a picture manager or the dimensions do not
    /// fit the plane set.
    pub fn alloc_pic(&self, hsize: usize, vsize: usize) -> Result<Ubuf> {
        match self {
            Self::Pic(mgr) => Ok(Ubuf::Pic(mgr.alloc(hsize, vsize)?)),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// Allocates a sound buffer of `samples` samples per plane.
    ///
    /// # Errors
    ///
    /// `Invalid` when this is not a sound manager.
    pub fn alloc_sound(&self, samples: usize) -> Result<Ubuf> {
        match self {
            Self::Sound(mgr) => Ok(Ubuf::Sound(mgr.alloc(samples)?)),
            _ => Err(UbaseError::Invalid),
        }
    }

    /// Builds the manager matching a flow definition's attributes.
    ///
    /// # Errors
    ///
    /// `Invalid` when the flow def is not recognized or lacks the shape
    /// attributes its kind requires.
    pub fn from_flow_def(umem: &UmemMgr, attrs: &Udict) -> Result<Self> {
        let def = attrs.get_string(flow::DEF).ok_or(UbaseError::Invalid)?;
        if def.starts_with(flow::DEF_BLOCK) {
            return Ok(Self::block_mem(umem, 0, 0, 0));
        }
        if def.starts_with(flow::DEF_SOUND) || def.contains(".sound.") {
            let sample_size =
                attrs.get_small_unsigned(flow::SOUND_SAMPLE_SIZE).ok_or(UbaseError::Invalid)?;
            let channels = attrs.get_small_unsigned(flow::SOUND_CHANNELS).unwrap_or(1);
            let planes = attrs.get_small_unsigned(flow::SOUND_PLANES).unwrap_or(channels.min(1));
            let mut names = Vec::new();
            for idx in 0..usize::from(planes.max(1)) {
                let key = format!("{}{idx}", flow::SOUND_CHANNEL_PREFIX);
                match attrs.get_string(&key) {
                    Some(name) => names.push(name.to_owned()),
                    None => names.push(format!("c{idx}")),
                }
            }
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            return Ok(Self::sound_mem(umem, usize::from(sample_size), &refs));
        }
        if def.starts_with(flow::DEF_PIC) {
            let macropixel = usize::from(attrs.get_small_unsigned(flow::PIC_MACROPIXEL).unwrap_or(1));
            let planes = attrs.get_small_unsigned(flow::PIC_PLANES).ok_or(UbaseError::Invalid)?;
            let mut mgr = UbufPicMgr::new(umem.clone(), macropixel, 0);
            for idx in 0..usize::from(planes) {
                let chroma = attrs
                    .get_string(&format!("pic.plane.{idx}.chroma"))
                    .ok_or(UbaseError::Invalid)?
                    .to_owned();
                let hsub = attrs
                    .get_small_unsigned(&format!("pic.plane.{idx}.hsub"))
                    .ok_or(UbaseError::Invalid)?;
                let vsub = attrs
                    .get_small_unsigned(&format!("pic.plane.{idx}.vsub"))
                    .ok_or(UbaseError::Invalid)?;
                let size = attrs
                    .get_small_unsigned(&format!("pic.plane.{idx}.macropixel_size"))
                    .ok_or(UbaseError::Invalid)?;
                mgr = mgr.with_plane(&chroma, usize::from(hsub), usize::from(vsub), usize::from(size));
            }
            return Ok(Self::pic_mem(mgr));
        }
        Err(UbaseError::Invalid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn block_alloc_honors_prepend_reserve() {
        let umem = UmemMgr::alloc_mgr();
        let mgr = UbufMgr::block_mem(&umem, 32, 0, 0);
        let mut ubuf = mgr.alloc_block(100).unwrap();
        let block = ubuf.block_mut().unwrap();
        assert_eq!(block.size(), 100);
        block.prepend(32).unwrap();
        assert_eq!(block.size(), 132);
    }

    #[test]
    fn sound_mgr_from_flow_def() {
        let umem = UmemMgr::alloc_mgr();
        let mut attrs = Udict::new();
        attrs.set_string(flow::DEF, "sound.s16.");
        attrs.set_small_unsigned(flow::SOUND_SAMPLE_SIZE, 2);
        attrs.set_small_unsigned(flow::SOUND_CHANNELS, 1);
        attrs.set_small_unsigned(flow::SOUND_PLANES, 1);
        let mgr = UbufMgr::from_flow_def(&umem, &attrs).unwrap();
        let snd = mgr.alloc_sound(1024).unwrap();
        assert_eq!(snd.sound().unwrap().plane_read_idx(0).unwrap().len(), 2048);
    }

    #[test]
    fn unknown_flow_def_is_invalid() {
        let umem = UmemMgr::alloc_mgr();
        let mut attrs = Udict::new();
        attrs.set_string(flow::DEF, "void.");
        assert!(UbufMgr::from_flow_def(&umem, &attrs).is_err());
    }
}
