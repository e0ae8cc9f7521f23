// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The client half of the CesiumDB object store.
//!
//! Applications work on locally cached objects through a [`Session`]. The
//! session locks and fetches objects from a [`Server`] on demand, keeps
//! modified objects in its workspace, and writes them back in batches when
//! flushed.

/// The core locator interface
pub mod session;

pub mod config;
pub mod copy_area;
pub mod errs;
pub mod flush;
/// The lock modes and their conversion lattice.
pub mod lock;
pub mod lockset;
/// An in-process server, for embedding and tests.
pub mod loopback;
pub mod object;
pub mod oid;
pub mod server;
pub mod transform;
pub mod workspace;

mod fetch;
mod lifecycle;

pub use config::{
    LocatorConfig,
    LocatorConfigBuilder,
};
pub use errs::{
    LocatorError,
    TransformError,
};
pub use flush::{
    FlushMode,
    FlushReport,
};
pub use lock::Lock;
pub use lockset::{
    LocksetPolicy,
    LocksetReport,
};
pub use oid::Oid;
pub use server::Server;
pub use session::{
    Session,
    TxnState,
};
pub use workspace::HandleId;
