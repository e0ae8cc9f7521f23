// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use thiserror::Error;

use crate::{
    oid::Oid,
    workspace::HandleId,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocatorError {
    #[error("object {0} not found")]
    NotFound(Oid),
    #[error("lock on {0} is held by another transaction")]
    LockConflict(Oid),
    #[error("transform error")]
    Transform(#[from] TransformError),
    /// The server killed the transaction, every cached lock and dirty bit is
    /// already gone by the time the caller sees this.
    #[error("transaction was aborted by the server")]
    UnilateralAbort,
    #[error("copy area growth to {requested} bytes exceeds the {limit} byte limit")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("object needs {needed} bytes, copy area holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("class name {0:?} already exists")]
    NameExists(String),
    #[error("class name {0:?} does not exist")]
    NameNotFound(String),
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),
    #[error("invalid handle {0}: {1}")]
    InvalidHandle(HandleId, &'static str),
    #[error("invalid header format: {0}")]
    InvalidHeaderFormat(String),
    #[error("server error: {0}")]
    Server(String),
}

impl LocatorError {
    /// Whether the error killed the whole transaction rather than one object.
    pub fn is_unilateral_abort(&self) -> bool {
        matches!(self, LocatorError::UnilateralAbort)
    }
}

/// Errors raised by the disk <-> memory object transformers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("encoded object needs {needed} bytes")]
    RetryLarger { needed: usize },
    #[error("malformed object: {0}")]
    Malformed(String),
    #[error("representation mismatch, expected {expected} found {found}")]
    SchemaMismatch { expected: u16, found: u16 },
    #[error("reference to an object without a permanent oid")]
    UnresolvedReference,
}
