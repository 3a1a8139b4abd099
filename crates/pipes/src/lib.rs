// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in processing pipes.
//!
//! Every module implements the core pipe contract against a concrete job:
//!
//! - [`null`]: a sink that swallows everything
//! - [`file`]: file source and sink driven by `SetUri`
//! - [`mpga`]: MPEG-1 layer I/II/III and AAC (ADTS/raw) audio framer
//! - [`scte35`]: SCTE-35 splice-section generator
//! - [`audio_split`]: interleaved-to-planar audio splitter with sub-pipes

pub mod audio_split;
pub mod file;
pub mod mpga;
pub mod null;
pub mod scte35;
