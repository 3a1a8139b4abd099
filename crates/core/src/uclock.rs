// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Monotonic clocks and the per-uref timestamp model.
//!
//! Pipes consume time exclusively through a [`Uclock`] so tests and
//! remote-playback scenarios can inject a virtual clock. Five timestamp
//! kinds are stored per uref as plain clock attributes: `cr`/`dts`/`pts`
//! in each of three domains: `sys` (monotonic wall clock), `prog` (the
//! stream's own clock), `orig` (source presentation time). Consumers use
//! whichever domain is defined and propagate missing values through.

use crate::uref::Uref;
use std::sync::Arc;
use std::time::Instant;

/// Clock frequency: all times count ticks of a 27 MHz clock.
pub const UCLOCK_FREQ: u64 = 27_000_000;

/// A monotonic time source.
pub trait UclockOps: Send + Sync {
    /// Current time in 27 MHz ticks.
    fn now(&self) -> u64;
}

/// Refcounted clock handle.
#[derive(Clone)]
pub struct Uclock {
    ops: Arc<dyn UclockOps>,
}

impl Uclock {
    #[must_use]
    pub fn new(ops: Arc<dyn UclockOps>) -> Self {
        Self { ops }
    }

    /// The standard clock, counting from its own creation.
    #[must_use]
    pub fn std() -> Self {
        struct Std {
            origin: Instant,
        }
        impl UclockOps for Std {
            fn now(&self) -> u64 {
                let elapsed = self.origin.elapsed();
                elapsed.as_secs() * UCLOCK_FREQ
                    + u64::from(elapsed.subsec_nanos()) * (UCLOCK_FREQ / 1_000_000) / 1_000
            }
        }
        Self::new(Arc::new(Std { origin: Instant::now() }))
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.ops.now()
    }
}

/// Clock reference, system domain.
pub const CR_SYS: &str = "k.date.sys.cr";
pub const CR_PROG: &str = "k.date.prog.cr";
pub const CR_ORIG: &str = "k.date.orig.cr";
pub const DTS_SYS: &str = "k.date.sys.dts";
pub const DTS_PROG: &str = "k.date.prog.dts";
pub const DTS_ORIG: &str = "k.date.orig.dts";
pub const PTS_SYS: &str = "k.date.sys.pts";
pub const PTS_PROG: &str = "k.date.prog.pts";
pub const PTS_ORIG: &str = "k.date.orig.pts";
/// Delay between decoding and presentation timestamps.
pub const DTS_PTS_DELAY: &str = "k.dts_pts_delay";
/// Duration of the content carried by the uref.
pub const DURATION: &str = "k.duration";
/// Playback rate.
pub const RATE: &str = "k.rate";
/// Set on urefs carrying a clock reference.
pub const REF: &str = "k.ref";
/// System date of the latest random access point.
pub const RAP_SYS: &str = "k.rap_sys";

macro_rules! clock_attr {
    ($get:ident, $set:ident, $name:expr) => {
        #[must_use]
        pub fn $get(&self) -> Option<u64> {
            self.attrs().get_clock($name)
        }

        pub fn $set(&mut self, date: u64) {
            self.attrs_mut().set_clock($name, date);
        }
    };
}

impl Uref {
    clock_attr!(cr_sys, set_cr_sys, CR_SYS);
    clock_attr!(cr_prog, set_cr_prog, CR_PROG);
    clock_attr!(cr_orig, set_cr_orig, CR_ORIG);
    clock_attr!(dts_sys, set_dts_sys, DTS_SYS);
    clock_attr!(dts_prog, set_dts_prog, DTS_PROG);
    clock_attr!(dts_orig, set_dts_orig, DTS_ORIG);
    clock_attr!(pts_sys, set_pts_sys, PTS_SYS);
    clock_attr!(pts_prog, set_pts_prog, PTS_PROG);
    clock_attr!(pts_orig, set_pts_orig, PTS_ORIG);
    clock_attr!(duration, set_duration, DURATION);
    clock_attr!(rap_sys, set_rap_sys, RAP_SYS);
    clock_attr!(dts_pts_delay, set_dts_pts_delay, DTS_PTS_DELAY);
}
