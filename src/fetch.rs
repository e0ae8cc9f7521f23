// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use tracing::{
    instrument,
    trace,
};

use crate::{
    copy_area::{
        CopyArea,
        Operation,
    },
    errs::LocatorError,
    lock::Lock,
    object::ObjectData,
    oid::Oid,
    server::{
        FetchRequest,
        Server,
    },
    session::Session,
    transform::Transformer,
    workspace::HandleId,
};

/// What cache population made of one reply entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Populated {
    pub oid: Oid,
    pub handle: Option<HandleId>,
    pub missing: bool,
}

impl<S: Server, T: Transformer> Session<S, T> {
    /// Make sure `id` is cached and holds at least `requested`, going to the
    /// server only when the cached state cannot satisfy the request. Returns
    /// the lock held afterwards.
    #[instrument(level = "debug", skip(self))]
    pub fn ensure_lock(&mut self, id: HandleId, requested: Lock) -> Result<Lock, LocatorError> {
        if id == self.workspace.root() {
            return self.workspace.stamp_lock(id, requested);
        }

        let handle = self.workspace.get(id)?;
        let oid = handle.oid();
        let cached = handle.lock();
        let is_cached = handle.is_cached();
        let class = handle.class();

        if !oid.is_permanent() {
            // nobody but this client can see a temporary object
            if !is_cached {
                return Err(LocatorError::NotFound(oid));
            }
            return self.workspace.stamp_lock(id, requested);
        }
        if is_cached && cached != Lock::Null && cached.covers(requested) {
            return Ok(cached);
        }

        let mut req = FetchRequest::new(oid, requested);
        let mut implicit = Lock::Null;
        if let Some(class) = class {
            let class_handle = self.workspace.get(class)?;
            implicit = class_handle.lock().implicit_instance_lock();
            req = req.with_class(class_handle.oid(), !class_handle.is_cached());
        }
        if implicit != Lock::Null {
            req = req.with_prefetch(implicit);
        }

        let reply = self.server.fetch_object(&req);
        let reply = match self.settle(reply) {
            | Ok(reply) => reply,
            | Err(LocatorError::NotFound(missing)) => {
                self.workspace.decache(id)?;
                return Err(LocatorError::NotFound(missing));
            },
            | Err(err) => return Err(err),
        };

        self.populate(&reply.area, implicit)?;

        let held = self.workspace.stamp_lock(id, reply.granted)?;
        if let Some(class) = self.workspace.get(id)?.class() {
            if class != id {
                self.workspace.stamp_lock(class, reply.granted.intention())?;
            }
        }
        Ok(held)
    }

    /// Install every object of a reply area into the workspace. Instances
    /// the caller did not ask for are stamped with `implicit`; requested
    /// objects are stamped by the caller.
    #[instrument(level = "trace", skip(self, area), fields(entries = area.len()))]
    pub(crate) fn populate(&mut self, area: &CopyArea, implicit: Lock) -> Result<Vec<Populated>, LocatorError> {
        let mut seen = Vec::with_capacity(area.len());

        for (desc, bytes) in area.entries() {
            let oid = desc.oid();

            if desc.operation() == Operation::Missing {
                let handle = self.workspace.find(oid);
                if let Some(handle) = handle {
                    self.workspace.decache(handle)?;
                }
                trace!(%oid, "reported missing");
                seen.push(Populated {
                    oid,
                    handle,
                    missing: true,
                });
                continue;
            }

            let class_oid = desc.class_oid();
            let class = self.workspace.intern(class_oid, None);
            let id = self.workspace.intern(oid, Some(class));

            let class_def = if class_oid.is_root() {
                None
            } else {
                self.workspace
                    .get(class)?
                    .object()
                    .as_ref()
                    .and_then(ObjectData::as_class)
                    .cloned()
            };
            let data = self
                .transformer
                .to_memory(class_def.as_ref(), bytes, &mut self.workspace)?;
            let is_instance = matches!(data, ObjectData::Instance(_));

            if !self.workspace.cache(id, data)? {
                trace!(%oid, "kept dirty local copy");
            }
            if is_instance && implicit != Lock::Null {
                self.workspace.stamp_lock(id, implicit)?;
            }

            seen.push(Populated {
                oid,
                handle: Some(id),
                missing: false,
            });
        }

        Ok(seen)
    }
}
