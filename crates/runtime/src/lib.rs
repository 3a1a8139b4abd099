// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Upipe Runtime - event-loop binding and cross-thread transfer.
//!
//! - [`upump`]: tokio implementation of the event-pump contract, plus the
//!   dedicated-thread loop constructor
//! - [`xfer`]: the transfer manager migrating pipe operations to a worker
//!   thread through a lock-free command queue
//! - [`queue`]: queue sink/source pairs bridging event loops
//! - [`worker`]: the worker bin pipe composing all of the above

pub mod queue;
pub mod upump;
pub mod worker;
pub mod xfer;

pub use upump::{TokioUpumpMgr, UpumpThread};
pub use xfer::XferMgr;
