// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use tracing::{
    debug,
    instrument,
    warn,
};

use crate::{
    config::LocatorConfig,
    errs::{
        LocatorError,
        TransformError,
    },
    flush::{
        FlushEngine,
        FlushMode,
        FlushReport,
    },
    lock::Lock,
    object::{
        ObjectData,
        Value,
    },
    oid::TempOidGenerator,
    server::{
        ForceMode,
        Server,
    },
    transform::{
        Transformer,
        WireTransformer,
    },
    workspace::{
        HandleId,
        Workspace,
    },
};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    /// No round trip happened since the last commit or abort.
    #[default]
    Idle,
    Active,
}

/// A client's view of the database for one logical thread.
///
/// Everything the locator knows lives here: the workspace of cached objects,
/// the flush buffer, and the temporary oid counter. The server only ever sees
/// what goes through [`Session::flush`] and the fetch paths.
pub struct Session<S: Server, T: Transformer = WireTransformer> {
    pub(crate) workspace: Workspace,
    pub(crate) server: S,
    pub(crate) transformer: T,
    pub(crate) engine: FlushEngine,
    pub(crate) temp_oids: TempOidGenerator,
    pub(crate) config: LocatorConfig,
    pub(crate) state: TxnState,
}

impl<S: Server> Session<S, WireTransformer> {
    pub fn connect(server: S, config: LocatorConfig) -> Self {
        Session::with_transformer(server, WireTransformer, config)
    }
}

impl<S: Server, T: Transformer> Session<S, T> {
    pub fn with_transformer(server: S, transformer: T, config: LocatorConfig) -> Self {
        Session {
            workspace: Workspace::new(),
            server,
            transformer,
            engine: FlushEngine::new(&config),
            temp_oids: TempOidGenerator::new(config.temp_oid_limit()),
            config,
            state: TxnState::Idle,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Choose how the server treats failing objects in a forced buffer.
    /// [`ForceMode::ContinueOnError`] is meant for replaying replicated work.
    pub fn set_force_mode(&mut self, mode: ForceMode) {
        self.engine.force_mode = mode;
    }

    /// Every round trip result passes through here. A unilateral abort means
    /// the server already threw the transaction away, so the cache follows.
    pub(crate) fn settle<R>(&mut self, result: Result<R, LocatorError>) -> Result<R, LocatorError> {
        match result {
            | Ok(reply) => {
                self.state = TxnState::Active;
                Ok(reply)
            },
            | Err(LocatorError::UnilateralAbort) => {
                warn!("transaction aborted by the server, invalidating the workspace");
                self.invalidate_all();
                Err(LocatorError::UnilateralAbort)
            },
            | Err(err) => Err(err),
        }
    }

    /// Read access. Takes a shared lock on the object first.
    pub fn get(&mut self, id: HandleId) -> Result<&ObjectData, LocatorError> {
        self.ensure_lock(id, Lock::Shared)?;
        self.workspace
            .get(id)?
            .object()
            .as_ref()
            .ok_or(LocatorError::InvalidHandle(id, "object is not cached"))
    }

    /// Overwrite attribute `idx` of an instance.
    #[instrument(level = "debug", skip(self, value))]
    pub fn set_attribute(&mut self, id: HandleId, idx: usize, value: Value) -> Result<(), LocatorError> {
        self.ensure_lock(id, Lock::Exclusive)?;

        let class = self
            .workspace
            .get(id)?
            .class()
            .ok_or(LocatorError::InvalidHandle(id, "object has no class"))?;
        let kind = {
            let def = self
                .workspace
                .get(class)?
                .object()
                .as_ref()
                .and_then(ObjectData::as_class)
                .ok_or(LocatorError::InvalidHandle(class, "class is not cached"))?;
            let attr = def
                .attributes()
                .get(idx)
                .ok_or(LocatorError::InvalidHandle(id, "no such attribute"))?;
            if !value.fits(attr.kind()) {
                return Err(TransformError::Malformed(format!(
                    "{:?} does not fit attribute {} of class {}",
                    value,
                    attr.name(),
                    def.name()
                ))
                .into());
            }
            attr.kind()
        };

        match self.workspace.object_mut(id)? {
            | ObjectData::Instance(inst) => match inst.values_mut().get_mut(idx) {
                | Some(slot) => *slot = value,
                | None => return Err(LocatorError::InvalidHandle(id, "no such attribute")),
            },
            | ObjectData::Class(_) => return Err(LocatorError::InvalidHandle(id, "classes have no attribute values")),
        }
        debug!(%id, idx, ?kind, "attribute set");
        self.workspace.mark_dirty(id)
    }

    /// Delete an object. Deleting a class also releases its name.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, id: HandleId) -> Result<(), LocatorError> {
        if id == self.workspace.root() {
            return Err(LocatorError::InvalidHandle(id, "the root class cannot be deleted"));
        }
        self.ensure_lock(id, Lock::Exclusive)?;

        let name = self
            .workspace
            .get(id)?
            .object()
            .as_ref()
            .and_then(ObjectData::as_class)
            .map(|def| def.name().clone());
        if let Some(name) = name {
            self.delete_class_name(&name)?;
        }
        self.workspace.mark_deleted(id)
    }

    /// Push every dirty object to the server.
    pub fn flush_all(&mut self) -> Result<FlushReport, LocatorError> {
        self.flush(FlushMode::Many)
    }

    /// Forget everything the current transaction did locally. Called on
    /// abort, and by the session itself when the server aborts on its own.
    #[instrument(level = "debug", skip(self))]
    pub fn invalidate_all(&mut self) {
        // unsent entries were already cleaned, their copies are just as stale
        self.workspace.redirty(self.engine.in_flight());
        self.workspace.invalidate_all();
        self.engine.reset();
        self.state = TxnState::Idle;
    }

    /// The server committed and released every lock; cached objects stay but
    /// have to be locked again before the next use.
    #[instrument(level = "debug", skip(self))]
    pub fn commit_cleanup(&mut self) {
        self.workspace.release_locks();
        self.engine.reset();
        self.state = TxnState::Idle;
    }
}

impl<S: Server, T: Transformer> Drop for Session<S, T> {
    fn drop(&mut self) {
        let dirty = self.workspace.dirty_count();
        if dirty > 0 {
            warn!(dirty, "session dropped with unflushed objects");
        }
    }
}
