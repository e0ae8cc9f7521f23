// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Write-back of dirty objects.
//!
//! Dirty handles are encoded into a [`CopyArea`] in dirty-list order and the
//! area is forced to the server whenever it fills up. Every oid written into
//! the area has to be permanent, so classes and referenced objects that are
//! still temporary get their oid assigned ahead of time. Their own pending
//! inserts are turned into updates right before the force.

use std::mem;

use bytes::Bytes;
use tracing::{
    debug,
    instrument,
    trace,
    warn,
};

use crate::{
    config::LocatorConfig,
    copy_area::{
        CopyArea,
        Descriptor,
        Operation,
    },
    errs::{
        LocatorError,
        TransformError,
    },
    oid::{
        Hfid,
        Oid,
    },
    server::{
        ForceMode,
        ObjectOutcome,
        Server,
    },
    session::Session,
    transform::Transformer,
    workspace::HandleId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Stop after the first force.
    Single,
    /// Drain every dirty object.
    Many,
}

/// An insert in the area whose object still carries a temporary oid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTempOid {
    pub handle: HandleId,
    /// Descriptor index in the area.
    pub idx: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub forces: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Deleted objects that never reached the server.
    pub dropped: usize,
    /// How often the area had to grow for an oversized object.
    pub grown: usize,
    /// Objects the server refused under [`ForceMode::ContinueOnError`].
    pub failed: usize,
}

impl FlushReport {
    pub fn written(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Debug)]
pub struct FlushEngine {
    area: CopyArea,
    pending: Vec<PendingTempOid>,
    /// The handle behind each descriptor of the area.
    entries: Vec<HandleId>,
    pub(crate) force_mode: ForceMode,
}

impl FlushEngine {
    pub fn new(config: &LocatorConfig) -> Self {
        FlushEngine {
            area: CopyArea::new(
                config.copy_area_size(),
                config.max_copy_area_size(),
                config.area_alignment(),
            ),
            pending: vec![],
            entries: vec![],
            force_mode: ForceMode::Strict,
        }
    }

    pub fn area(&self) -> &CopyArea {
        &self.area
    }

    pub fn pending(&self) -> &[PendingTempOid] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.area.is_empty()
    }

    /// Handles whose entries sit in the area, unsent.
    pub fn in_flight(&self) -> &[HandleId] {
        &self.entries
    }

    /// Drop the buffered entries without sending them.
    pub fn reset(&mut self) {
        self.area.reset();
        self.pending.clear();
        self.entries.clear();
    }

    /// Turn inserts of objects that got a permanent oid early into updates
    /// of that oid.
    fn rewrite_pending(&mut self, oid_of: impl Fn(HandleId) -> Option<Oid>) {
        let area = &mut self.area;
        self.pending.retain(|pending| match oid_of(pending.handle) {
            | Some(oid) if oid.is_permanent() => {
                area.set_operation(pending.idx, Operation::Update);
                area.set_oid(pending.idx, oid);
                debug!(handle = %pending.handle, %oid, "pending insert became an update");
                false
            },
            | _ => true,
        });
    }
}

impl<S: Server, T: Transformer> Session<S, T> {
    pub fn flush_engine(&self) -> &FlushEngine {
        &self.engine
    }

    /// Write dirty objects back to the server.
    #[instrument(level = "debug", skip(self))]
    pub fn flush(&mut self, mode: FlushMode) -> Result<FlushReport, LocatorError> {
        let mut report = FlushReport::default();

        match self.drain(mode, &mut report) {
            | Ok(()) => {
                debug!(?report, "flush done");
                Ok(report)
            },
            | Err(err) if err.is_unilateral_abort() => Err(err),
            | Err(err) => {
                // entries already in the area were cleaned when appended
                self.workspace.redirty(self.engine.in_flight());
                self.engine.reset();
                Err(err)
            },
        }
    }

    fn drain(&mut self, mode: FlushMode, report: &mut FlushReport) -> Result<(), LocatorError> {
        for id in self.workspace.dirty_handles() {
            if !self.workspace.get(id)?.dirty() {
                // went out with its class
                continue;
            }
            if !self.flush_handle(id, mode, report)? {
                break;
            }
            if mode == FlushMode::Single && report.forces > 0 {
                break;
            }
        }

        if !self.engine.is_empty() {
            self.force(report)?;
        }
        Ok(())
    }

    /// Append one dirty object to the area. Returns `false` when a single
    /// flush has to stop because the area is full.
    fn flush_handle(&mut self, id: HandleId, mode: FlushMode, report: &mut FlushReport) -> Result<bool, LocatorError> {
        let handle = self.workspace.get(id)?;
        let deleted = handle.deleted();
        let class = handle.class();
        let current = handle.oid();

        if deleted && !current.is_permanent() {
            self.workspace.drop_temporary(id)?;
            report.dropped += 1;
            trace!(%id, "dropped object that never reached the server");
            return Ok(true);
        }
        if current.is_null() {
            self.workspace.clean(id)?;
            return Ok(true);
        }

        if let Some(class) = class {
            if class != id && self.workspace.get(class)?.dirty() && !self.flush_handle(class, mode, report)? {
                return Ok(false);
            }
        }

        let mut class_oid = Oid::ROOT;
        if let Some(class) = class {
            class_oid = self.assign_oid_now(class)?;
        }

        let (operation, bytes) = if deleted {
            (Operation::Delete, Bytes::new())
        } else {
            let refs = self
                .workspace
                .get(id)?
                .object()
                .as_ref()
                .map(|obj| obj.references())
                .unwrap_or_default();
            for target in refs {
                let referenced = self.workspace.get(target)?;
                if !referenced.oid().is_temp() {
                    continue;
                }
                if referenced.deleted() {
                    // never reaches the server, the reference is written as null
                    self.workspace.drop_temporary(target)?;
                    report.dropped += 1;
                    trace!(%id, %target, "dropped deleted reference target");
                } else {
                    self.assign_oid_now(target)?;
                }
            }

            let bytes = match self.encode_to_fit(id, mode, report)? {
                | Some(bytes) => bytes,
                | None => return Ok(false),
            };
            let operation = if self.workspace.get(id)?.oid().is_temp() {
                Operation::Insert
            } else {
                Operation::Update
            };
            (operation, bytes)
        };

        let oid = self.workspace.get(id)?.oid();
        let hfid = Hfid::of_class(class_oid).unwrap_or(Hfid::ROOT);
        let idx = self
            .engine
            .area
            .append(Descriptor::new(operation, hfid, oid, class_oid), &bytes)?;
        self.engine.entries.push(id);
        if operation == Operation::Insert {
            self.engine.pending.push(PendingTempOid { handle: id, idx });
        }
        self.workspace.clean(id)?;
        trace!(%id, %oid, ?operation, "appended to copy area");

        if self.engine.area.is_exhausted() {
            self.force(report)?;
        }
        Ok(true)
    }

    /// Encode `id` into the room left in the area. A full area is forced to
    /// make room, unless a single flush already has something to force; an
    /// object too large for an empty area gets one growth step to exactly its
    /// size.
    fn encode_to_fit(
        &mut self,
        id: HandleId,
        mode: FlushMode,
        report: &mut FlushReport,
    ) -> Result<Option<Bytes>, LocatorError> {
        let mut grown = false;
        loop {
            let obj = self
                .workspace
                .get(id)?
                .object()
                .as_ref()
                .ok_or(LocatorError::InvalidHandle(id, "dirty object is not cached"))?;
            let encoded = self
                .transformer
                .to_disk(obj, &self.workspace, self.engine.area.room());

            match encoded {
                | Ok(bytes) => return Ok(Some(bytes)),
                | Err(TransformError::RetryLarger { .. }) if !self.engine.is_empty() && mode == FlushMode::Single => {
                    return Ok(None);
                },
                | Err(TransformError::RetryLarger { needed }) if !self.engine.is_empty() => {
                    trace!(%id, needed, "area full, forcing");
                    self.force(report)?;
                },
                | Err(TransformError::RetryLarger { needed }) if !grown => {
                    let capacity = self.engine.area.grow_to_fit(needed)?;
                    debug!(%id, needed, capacity, "copy area grown");
                    report.grown += 1;
                    grown = true;
                },
                | Err(TransformError::RetryLarger { needed }) => {
                    return Err(LocatorError::BufferTooSmall {
                        needed,
                        capacity: self.engine.area.capacity(),
                    });
                },
                | Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send the area to the server and apply the outcome to the workspace.
    #[instrument(level = "debug", skip(self, report), fields(objects = self.engine.area.len()))]
    fn force(&mut self, report: &mut FlushReport) -> Result<(), LocatorError> {
        if self.engine.is_empty() {
            return Ok(());
        }

        let workspace = &self.workspace;
        self.engine
            .rewrite_pending(|handle| workspace.get(handle).ok().map(|h| h.oid()));

        let result = self.server.force(&self.engine.area, self.engine.force_mode);
        let reply = match self.settle(result) {
            | Ok(reply) => reply,
            | Err(LocatorError::UnilateralAbort) => return Err(LocatorError::UnilateralAbort),
            | Err(err) => {
                self.workspace.redirty(self.engine.in_flight());
                self.engine.reset();
                return Err(err);
            },
        };
        report.forces += 1;

        let entries = mem::take(&mut self.engine.entries);
        for (idx, (id, outcome)) in entries.into_iter().zip(reply.outcomes).enumerate() {
            let operation = self
                .engine
                .area
                .descriptor(idx)
                .map(|desc| desc.operation())
                .ok_or(LocatorError::Server(format!("reply outcome {} has no descriptor", idx)))?;

            match outcome {
                | ObjectOutcome::Applied(oid) => match operation {
                    | Operation::Insert => {
                        self.workspace.relocate(id, oid)?;
                        report.inserts += 1;
                    },
                    | Operation::Update => report.updates += 1,
                    | Operation::Delete => {
                        self.workspace.decache(id)?;
                        report.deletes += 1;
                    },
                    | Operation::Fetch | Operation::Missing => {},
                },
                | ObjectOutcome::Failed(err) => {
                    warn!(%id, %err, "server refused object, keeping it dirty");
                    self.workspace.mark_dirty(id)?;
                    report.failed += 1;
                },
            }
        }

        self.engine.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::LocatorConfigBuilder,
        loopback::LoopbackServer,
        object::{
            AttrKind,
            Attribute,
            ObjectData,
            Value,
        },
    };

    fn session_with(cfg: LocatorConfig) -> Session<Arc<LoopbackServer>> {
        Session::connect(Arc::new(LoopbackServer::default()), cfg)
    }

    fn blob_class(session: &mut Session<Arc<LoopbackServer>>) -> HandleId {
        session
            .create_class("blob", vec![Attribute::new("data", AttrKind::Bytes)])
            .unwrap()
    }

    #[test]
    fn test_flush_inserts_and_cleans() {
        let mut session = session_with(LocatorConfig::default());
        let class = blob_class(&mut session);
        let obj = session
            .create_instance(class, vec![Value::Bytes(Bytes::from_static(b"hi"))])
            .unwrap();

        let report = session.flush_all().unwrap();
        assert_eq!(report.forces, 1);
        assert_eq!(report.written(), 2);
        assert_eq!(session.workspace().dirty_count(), 0);
        assert!(session.flush_engine().is_empty());

        let oid = session.workspace().get(obj).unwrap().oid();
        assert!(oid.is_permanent());
        assert!(session.server().contains(oid));
        assert_eq!(
            session.server().class_of(oid),
            Some(session.workspace().get(class).unwrap().oid())
        );
    }

    #[test]
    fn test_small_area_forces_repeatedly() {
        let cfg = LocatorConfigBuilder::new()
            .copy_area_size(160)
            .max_copy_area_size(1 << 16)
            .build();
        let mut session = session_with(cfg);
        let class = blob_class(&mut session);
        for _ in 0..10 {
            session
                .create_instance(class, vec![Value::Bytes(Bytes::from(vec![7u8; 40]))])
                .unwrap();
        }

        let report = session.flush_all().unwrap();
        assert!(report.forces > 1);
        assert_eq!(report.grown, 0);
        assert_eq!(session.server().len(), 11);
        assert_eq!(session.workspace().dirty_count(), 0);
    }

    #[test]
    fn test_oversized_object_grows_once() {
        let cfg = LocatorConfigBuilder::new()
            .copy_area_size(128)
            .max_copy_area_size(1 << 16)
            .build();
        let mut session = session_with(cfg);
        let class = blob_class(&mut session);
        session.flush_all().unwrap();

        let big = session
            .create_instance(class, vec![Value::Bytes(Bytes::from(vec![1u8; 4096]))])
            .unwrap();
        let report = session.flush_all().unwrap();
        assert_eq!(report.grown, 1);
        assert!(session
            .server()
            .contains(session.workspace().get(big).unwrap().oid()));
        assert_eq!(
            session.flush_engine().area().capacity(),
            128,
            "the area shrinks back after the force"
        );
    }

    #[test]
    fn test_growth_beyond_limit_is_out_of_memory() {
        let cfg = LocatorConfigBuilder::new()
            .copy_area_size(128)
            .max_copy_area_size(256)
            .build();
        let mut session = session_with(cfg);
        let class = blob_class(&mut session);
        session.flush_all().unwrap();

        let huge = session
            .create_instance(class, vec![Value::Bytes(Bytes::from(vec![1u8; 1024]))])
            .unwrap();
        assert!(matches!(session.flush_all(), Err(LocatorError::OutOfMemory { .. })));
        assert!(session.workspace().get(huge).unwrap().dirty(), "nothing is lost");
    }

    #[test]
    fn test_single_mode_stops_after_one_force() {
        let cfg = LocatorConfigBuilder::new()
            .copy_area_size(160)
            .max_copy_area_size(1 << 16)
            .build();
        let mut session = session_with(cfg);
        let class = blob_class(&mut session);
        session.flush_all().unwrap();
        for _ in 0..10 {
            session
                .create_instance(class, vec![Value::Bytes(Bytes::from(vec![3u8; 40]))])
                .unwrap();
        }

        let report = session.flush(FlushMode::Single).unwrap();
        assert_eq!(report.forces, 1);
        assert!(session.workspace().dirty_count() > 0);
        session.flush_all().unwrap();
        assert_eq!(session.workspace().dirty_count(), 0);
    }

    #[test]
    fn test_deleted_temporary_is_dropped() {
        let mut session = session_with(LocatorConfig::default());
        let class = blob_class(&mut session);
        let obj = session.create_instance(class, vec![Value::Null]).unwrap();
        session.delete(obj).unwrap();

        let report = session.flush_all().unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.inserts, 1, "only the class went out");
        assert!(session.workspace().get(obj).unwrap().oid().is_null());
        assert_eq!(session.workspace().live_temporaries(), 0);
    }

    #[test]
    fn test_update_and_delete() {
        let mut session = session_with(LocatorConfig::default());
        let class = blob_class(&mut session);
        let obj = session.create_instance(class, vec![Value::Null]).unwrap();
        session.flush_all().unwrap();
        let oid = session.workspace().get(obj).unwrap().oid();

        session
            .set_attribute(obj, 0, Value::Bytes(Bytes::from_static(b"new")))
            .unwrap();
        let report = session.flush_all().unwrap();
        assert_eq!(report.updates, 1);
        let stored = session.server().record(oid).unwrap();
        let decoded = session
            .transformer
            .to_memory(None, stored, &mut session.workspace)
            .unwrap();
        assert_eq!(
            decoded,
            ObjectData::Instance(crate::object::Instance::new(0, vec![Value::Bytes(Bytes::from_static(b"new"))]))
        );

        session.delete(obj).unwrap();
        let report = session.flush_all().unwrap();
        assert_eq!(report.deletes, 1);
        assert!(!session.server().contains(oid));
        assert!(!session.workspace().get(obj).unwrap().is_cached());
    }

    #[test]
    fn test_failed_force_keeps_objects_dirty() {
        let mut session = session_with(LocatorConfig::default());
        let class = blob_class(&mut session);
        let obj = session.create_instance(class, vec![Value::Null]).unwrap();
        session.flush_all().unwrap();
        let oid = session.workspace().get(obj).unwrap().oid();

        session.set_attribute(obj, 0, Value::Null).unwrap();
        session.server().hold_conflicting(oid);
        assert_eq!(session.flush_all(), Err(LocatorError::LockConflict(oid)));
        assert!(session.workspace().get(obj).unwrap().dirty());
        assert!(session.flush_engine().is_empty());

        session.server().release_conflicting(oid);
        assert_eq!(session.flush_all().unwrap().updates, 1);
    }

    #[test]
    fn test_partial_failure_is_counted() {
        let mut session = session_with(LocatorConfig::default());
        session.set_force_mode(ForceMode::ContinueOnError);
        let class = blob_class(&mut session);
        let a = session.create_instance(class, vec![Value::Null]).unwrap();
        let b = session.create_instance(class, vec![Value::Null]).unwrap();
        session.flush_all().unwrap();

        session.set_attribute(a, 0, Value::Null).unwrap();
        session.set_attribute(b, 0, Value::Null).unwrap();
        let locked = session.workspace().get(b).unwrap().oid();
        session.server().hold_conflicting(locked);

        let report = session.flush_all().unwrap();
        assert_eq!(report.updates, 1);
        assert_eq!(report.failed, 1);
        assert!(!session.workspace().get(a).unwrap().dirty());
        assert!(session.workspace().get(b).unwrap().dirty());
    }

    #[test]
    fn test_pending_rewrite() {
        let mut engine = FlushEngine::new(&LocatorConfig::default());
        let temp = crate::oid::TempOidGenerator::new(4).next().unwrap();
        let idx = engine
            .area
            .append(Descriptor::new(Operation::Insert, Hfid::ROOT, temp, Oid::ROOT), b"x")
            .unwrap();
        engine.pending.push(PendingTempOid {
            handle: HandleId(1),
            idx,
        });

        engine.rewrite_pending(|_| Some(temp));
        assert_eq!(engine.pending().len(), 1, "still temporary, still pending");

        let perm = Oid::new(0, 4, 2);
        engine.rewrite_pending(|_| Some(perm));
        assert!(engine.pending().is_empty());
        let desc = engine.area().descriptor(idx).unwrap();
        assert_eq!(desc.operation(), Operation::Update);
        assert_eq!(desc.oid(), perm);
    }
}
