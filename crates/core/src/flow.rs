// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Flow definitions and the well-known flow attributes.
//!
//! A flow definition is a uref with no payload whose attributes describe the
//! format downstream will receive: a dotted type string under [`DEF`]
//! (e.g. `block.mpegtsaligned.`, `pic.`, `sound.f32.`), dimensions, rate,
//! channel layout, latency, codec-private headers. A flow def is always
//! emitted (or re-emitted) before any data uref its format describes.

use crate::error::{Result, UbaseError};
use crate::uref::{Uref, UrefMgr};

/// The flow definition string.
pub const DEF: &str = "flow.def";
/// Flow identifier assigned by a split pipe.
pub const ID: &str = "flow.id";
/// Set on the first uref after a discontinuity.
pub const DISCONTINUITY: &str = "flow.discontinuity";
/// Set on urefs starting at a random access point.
pub const RANDOM: &str = "flow.random";
/// Set on the last uref of the flow.
pub const END: &str = "flow.end";
/// Codec-private global headers.
pub const HEADERS: &str = "flow.headers";
/// Requests global headers in the flow def rather than in-band.
pub const GLOBAL: &str = "flow.global";
/// Accumulated latency, in ticks of a 27 MHz clock.
pub const LATENCY: &str = "flow.latency";
/// Number of declared languages.
pub const LANGUAGES: &str = "flow.languages";
/// Per-language attribute prefix; append the index.
pub const LANGUAGE_PREFIX: &str = "flow.language.";
/// Human-readable flow (program) name.
pub const NAME: &str = "flow.name";

pub const DEF_BLOCK: &str = "block.";
pub const DEF_PIC: &str = "pic.";
pub const DEF_PIC_SUB: &str = "pic.sub.";
pub const DEF_SOUND: &str = "sound.";
pub const DEF_VOID: &str = "void.";

/// Block flow attributes.
pub const BLOCK_SIZE: &str = "block.size";
pub const BLOCK_OCTETRATE: &str = "block.octetrate";

/// Picture flow attributes.
pub const PIC_HSIZE: &str = "pic.hsize";
pub const PIC_VSIZE: &str = "pic.vsize";
pub const PIC_PROGRESSIVE: &str = "pic.progressive";
pub const PIC_MACROPIXEL: &str = "pic.macropixel";
pub const PIC_PLANES: &str = "pic.planes";

/// Sound flow attributes.
pub const SOUND_RATE: &str = "sound.rate";
pub const SOUND_CHANNELS: &str = "sound.channels";
pub const SOUND_SAMPLES: &str = "sound.samples";
pub const SOUND_SAMPLE_SIZE: &str = "sound.sample_size";
pub const SOUND_PLANES: &str = "sound.planes";
pub const SOUND_CHANNEL_PREFIX: &str = "sound.channel.";

/// Allocates a flow definition with the given definition string.
#[must_use]
pub fn alloc_def(mgr: &UrefMgr, def: &str) -> Uref {
    let mut uref = mgr.alloc_control();
    uref.attrs_mut().set_string(DEF, def);
    uref
}

/// Allocates a block flow definition: `block.` followed by `suffix`.
#[must_use]
pub fn alloc_block_def(mgr: &UrefMgr, suffix: &str) -> Uref {
    alloc_def(mgr, &format!("{DEF_BLOCK}{suffix}"))
}

/// Allocates a sound flow definition with its shape attributes.
#[must_use]
pub fn alloc_sound_def(
    mgr: &UrefMgr,
    suffix: &str,
    rate: u64,
    channels: u8,
    sample_size: u8,
    planes: u8,
) -> Uref {
    let mut uref = alloc_def(mgr, &format!("{DEF_SOUND}{suffix}"));
    let attrs = uref.attrs_mut();
    attrs.set_unsigned(SOUND_RATE, rate);
    attrs.set_small_unsigned(SOUND_CHANNELS, channels);
    attrs.set_small_unsigned(SOUND_SAMPLE_SIZE, sample_size);
    attrs.set_small_unsigned(SOUND_PLANES, planes);
    uref
}

impl Uref {
    /// The flow definition string, when present.
    #[must_use]
    pub fn flow_def(&self) -> Option<&str> {
        self.attrs().get_string(DEF)
    }

    pub fn set_flow_def(&mut self, def: &str) {
        self.attrs_mut().set_string(DEF, def);
    }

    /// Checks that the flow definition starts with `prefix`.
    ///
    /// # Errors
    ///
    /// `Invalid` when absent or mismatched.
    pub fn match_flow_def(&self, prefix: &str) -> Result<()> {
        match self.flow_def() {
            Some(def) if def.starts_with(prefix) => Ok(()),
            _ => Err(UbaseError::Invalid),
        }
    }

    #[must_use]
    pub fn flow_id(&self) -> Option<u64> {
        self.attrs().get_unsigned(ID)
    }

    pub fn set_flow_id(&mut self, id: u64) {
        self.attrs_mut().set_unsigned(ID, id);
    }

    #[must_use]
    pub fn flow_headers(&self) -> Option<&[u8]> {
        self.attrs().get_opaque(HEADERS)
    }

    pub fn set_flow_headers(&mut self, headers: &[u8]) {
        self.attrs_mut().set_opaque(HEADERS, headers.to_vec());
    }

    #[must_use]
    pub fn flow_global(&self) -> bool {
        self.attrs().get_bool(GLOBAL).unwrap_or(false)
    }

    pub fn set_flow_global(&mut self) {
        self.attrs_mut().set_bool(GLOBAL, true);
    }

    pub fn delete_flow_global(&mut self) {
        self.attrs_mut().delete(crate::udict::AttrType::Bool, GLOBAL);
    }

    #[must_use]
    pub fn flow_latency(&self) -> Option<u64> {
        self.attrs().get_clock(LATENCY)
    }

    pub fn set_flow_latency(&mut self, latency: u64) {
        self.attrs_mut().set_clock(LATENCY, latency);
    }

    #[must_use]
    pub fn flow_languages(&self) -> Vec<&str> {
        let count = self.attrs().get_small_unsigned(LANGUAGES).unwrap_or(0);
        (0..count)
            .filter_map(|idx| self.attrs().get_string(&format!("{LANGUAGE_PREFIX}{idx}")))
            .collect()
    }

    pub fn add_flow_language(&mut self, lang: &str) {
        let count = self.attrs().get_small_unsigned(LANGUAGES).unwrap_or(0);
        self.attrs_mut().set_string(&format!("{LANGUAGE_PREFIX}{count}"), lang);
        self.attrs_mut().set_small_unsigned(LANGUAGES, count + 1);
    }

    #[must_use]
    pub fn flow_name(&self) -> Option<&str> {
        self.attrs().get_string(NAME)
    }

    pub fn set_flow_name(&mut self, name: &str) {
        self.attrs_mut().set_string(NAME, name);
    }
}
