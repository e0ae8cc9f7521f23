// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use tracing::{
    debug,
    instrument,
};

use crate::{
    errs::{
        LocatorError,
        TransformError,
    },
    flush::FlushMode,
    lock::Lock,
    object::{
        Attribute,
        ClassDef,
        Instance,
        ObjectData,
        Value,
    },
    oid::{
        Hfid,
        Oid,
    },
    server::{
        AssignRequest,
        NameStatus,
        Server,
    },
    session::Session,
    transform::Transformer,
    workspace::HandleId,
};

impl<S: Server, T: Transformer> Session<S, T> {
    /// Hand out the next temporary oid. When the counter space runs dry every
    /// live temporary is flushed so the space can be reused.
    pub(crate) fn mint_temp_oid(&mut self) -> Result<Oid, LocatorError> {
        if let Some(oid) = self.temp_oids.next() {
            return Ok(oid);
        }

        debug!(issued = self.temp_oids.issued(), "temporary oids exhausted, flushing");
        self.flush(FlushMode::Many)?;
        let live = self.workspace.live_temporaries();
        if live > 0 {
            return Err(LocatorError::OutOfMemory {
                requested: live + 1,
                limit: self.config.temp_oid_limit() as usize,
            });
        }
        self.temp_oids.reset();
        self.temp_oids.next().ok_or(LocatorError::OutOfMemory {
            requested: 1,
            limit: self.config.temp_oid_limit() as usize,
        })
    }

    /// Create a class. The name is reserved on the server right away so two
    /// clients cannot both create it; the class itself is written by the next
    /// flush.
    #[instrument(level = "debug", skip(self, attributes))]
    pub fn create_class(&mut self, name: &str, attributes: Vec<Attribute>) -> Result<HandleId, LocatorError> {
        let oid = self.mint_temp_oid()?;

        let status = self.server.reserve_class_name(name, oid);
        if self.settle(status)? == NameStatus::Exists {
            return Err(LocatorError::NameExists(name.to_string()));
        }

        let root = self.workspace.root();
        let id = self
            .workspace
            .new_object(oid, root, ObjectData::Class(ClassDef::new(name, attributes)));
        // the creator owns the schema until it commits
        self.workspace.stamp_lock(id, Lock::SchemaModification)?;
        debug!(%id, %oid, "class created");
        Ok(id)
    }

    /// Create an instance of `class`. `values` has to match the class's
    /// attributes one to one.
    pub fn create_instance(&mut self, class: HandleId, values: Vec<Value>) -> Result<HandleId, LocatorError> {
        self.ensure_lock(class, Lock::IntentShared)?;

        let def = self
            .workspace
            .get(class)?
            .object()
            .as_ref()
            .and_then(ObjectData::as_class)
            .ok_or(LocatorError::InvalidHandle(class, "not a class"))?;
        if !def.accepts(&values) {
            return Err(TransformError::Malformed(format!(
                "{} values do not match the {} attributes of class {}",
                values.len(),
                def.attributes().len(),
                def.name()
            ))
            .into());
        }
        let repr_id = def.repr_id();

        let oid = self.mint_temp_oid()?;
        Ok(self
            .workspace
            .new_object(oid, class, ObjectData::Instance(Instance::new(repr_id, values))))
    }

    /// Give `id` its permanent oid now instead of at the next flush. Returns
    /// the oid, which is the current one if it already is permanent.
    #[instrument(level = "debug", skip(self))]
    pub fn assign_oid_now(&mut self, id: HandleId) -> Result<Oid, LocatorError> {
        let handle = self.workspace.get(id)?;
        let oid = handle.oid();
        if oid.is_permanent() {
            return Ok(oid);
        }
        if oid.is_null() {
            return Err(LocatorError::InvalidHandle(id, "object was dropped"));
        }

        let class = handle
            .class()
            .ok_or(LocatorError::InvalidHandle(id, "object has no class"))?;
        let (expected_size, name) = match handle.object() {
            | Some(obj) => (
                self.transformer.size_hint(obj),
                obj.as_class().map(|def| def.name().clone()),
            ),
            | None => (0, None),
        };

        // the class has to exist on the server before anything can live in it
        let class_oid = self.assign_oid_now(class)?;
        let hfid = Hfid::of_class(class_oid).unwrap_or(Hfid::ROOT);

        let req = AssignRequest::new(hfid, expected_size, class_oid, name);
        let assigned = self.server.assign_permanent_oid(&req);
        let assigned = self.settle(assigned)?;
        self.workspace.relocate(id, assigned)?;
        debug!(%id, temp = %oid, perm = %assigned, "permanent oid assigned");
        Ok(assigned)
    }

    /// Rename a class. The new name is reserved before anything changes
    /// locally, so a taken name leaves the class untouched.
    #[instrument(level = "debug", skip(self))]
    pub fn rename_class(&mut self, id: HandleId, new_name: &str) -> Result<(), LocatorError> {
        self.ensure_lock(id, Lock::SchemaModification)?;

        let handle = self.workspace.get(id)?;
        let oid = handle.oid();
        let old_name = handle
            .object()
            .as_ref()
            .and_then(ObjectData::as_class)
            .map(|def| def.name().clone())
            .ok_or(LocatorError::InvalidHandle(id, "not a class"))?;

        let status = self.server.rename_class_name(&old_name, new_name, oid);
        if self.settle(status)? == NameStatus::Exists {
            return Err(LocatorError::NameExists(new_name.to_string()));
        }

        if let ObjectData::Class(def) = self.workspace.object_mut(id)? {
            def.rename(new_name);
        }
        self.workspace.mark_dirty(id)
    }

    /// Release a class name on the server. Called when a class is deleted.
    pub(crate) fn delete_class_name(&mut self, name: &str) -> Result<(), LocatorError> {
        let status = self.server.delete_class_name(name);
        self.settle(status)?;
        Ok(())
    }

    /// Look a class up by name and lock it with `lock`.
    #[instrument(level = "debug", skip(self))]
    pub fn find_class(&mut self, name: &str, lock: Lock) -> Result<HandleId, LocatorError> {
        let found = self.server.find_class_oid(name);
        let oid = self
            .settle(found)?
            .ok_or_else(|| LocatorError::NameNotFound(name.to_string()))?;

        let root = self.workspace.root();
        let id = self.workspace.intern(oid, Some(root));
        self.ensure_lock(id, lock)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::{
            LocatorConfig,
            LocatorConfigBuilder,
        },
        loopback::LoopbackServer,
        object::AttrKind,
    };

    fn session() -> Session<Arc<LoopbackServer>> {
        Session::connect(Arc::new(LoopbackServer::default()), LocatorConfig::default())
    }

    #[test]
    fn test_create_class_reserves_name() {
        let mut session = session();
        let id = session.create_class("bird", vec![]).unwrap();
        let handle = session.workspace().get(id).unwrap();
        assert!(handle.oid().is_temp());
        assert!(handle.dirty());
        assert_eq!(handle.lock(), Lock::SchemaModification);

        let before = session.workspace().len();
        assert_eq!(
            session.create_class("bird", vec![]),
            Err(LocatorError::NameExists("bird".into()))
        );
        assert_eq!(session.workspace().len(), before, "a taken name creates nothing");
    }

    #[test]
    fn test_create_instance_checks_values() {
        let mut session = session();
        let class = session
            .create_class("pair", vec![Attribute::new("a", AttrKind::Int), Attribute::new("b", AttrKind::Str)])
            .unwrap();

        assert!(session
            .create_instance(class, vec![Value::Int(1), Value::Str("x".into())])
            .is_ok());
        assert!(matches!(
            session.create_instance(class, vec![Value::Int(1)]),
            Err(LocatorError::Transform(TransformError::Malformed(_)))
        ));
        assert!(matches!(
            session.create_instance(class, vec![Value::Str("x".into()), Value::Int(1)]),
            Err(LocatorError::Transform(TransformError::Malformed(_)))
        ));
    }

    #[test]
    fn test_assign_oid_now() {
        let mut session = session();
        let class = session.create_class("fish", vec![]).unwrap();
        let fish = session.create_instance(class, vec![]).unwrap();

        let oid = session.assign_oid_now(fish).unwrap();
        assert!(oid.is_permanent());
        assert!(
            session.workspace().get(class).unwrap().oid().is_permanent(),
            "the class is assigned first"
        );
        assert_eq!(session.find_class("fish", Lock::IntentShared).unwrap(), class);

        let assigns = session.server().stats().assigns();
        assert_eq!(session.assign_oid_now(fish).unwrap(), oid);
        assert_eq!(session.server().stats().assigns(), assigns);
    }

    #[test]
    fn test_rename_class() {
        let mut session = session();
        let a = session.create_class("a", vec![]).unwrap();
        session.create_class("b", vec![]).unwrap();

        assert_eq!(session.rename_class(a, "b"), Err(LocatorError::NameExists("b".into())));
        let name = |s: &Session<Arc<LoopbackServer>>| {
            s.workspace()
                .get(a)
                .unwrap()
                .object()
                .as_ref()
                .and_then(ObjectData::as_class)
                .map(|def| def.name().clone())
        };
        assert_eq!(name(&session), Some("a".to_string()));

        session.rename_class(a, "c").unwrap();
        assert_eq!(name(&session), Some("c".to_string()));
        session.flush_all().unwrap();
        let oid = session.workspace().get(a).unwrap().oid();
        assert_eq!(session.server().find_class_oid("c").unwrap(), Some(oid));
    }

    #[test]
    fn test_find_class_from_another_session() {
        let server = Arc::new(LoopbackServer::default());
        let mut writer = Session::connect(server.clone(), LocatorConfig::default());
        let class = writer
            .create_class("tree", vec![Attribute::new("height", AttrKind::Float)])
            .unwrap();
        writer.flush_all().unwrap();
        let oid = writer.workspace().get(class).unwrap().oid();

        let mut reader = Session::connect(server, LocatorConfig::default());
        let found = reader.find_class("tree", Lock::Shared).unwrap();
        let handle = reader.workspace().get(found).unwrap();
        assert_eq!(handle.oid(), oid);
        assert!(handle.is_class());
        assert_eq!(handle.lock(), Lock::Shared);
        assert!(matches!(reader.find_class("shrub", Lock::Shared), Err(LocatorError::NameNotFound(_))));
    }

    #[test]
    fn test_deleting_class_releases_name() {
        let mut session = session();
        let class = session.create_class("moth", vec![]).unwrap();
        session.flush_all().unwrap();
        session.delete(class).unwrap();
        assert_eq!(session.server().find_class_oid("moth").unwrap(), None);
        assert!(session.create_class("moth", vec![]).is_ok());
    }

    #[test]
    fn test_temp_oid_exhaustion_flushes() {
        let cfg = LocatorConfigBuilder::new().temp_oid_limit(3).build();
        let mut session = Session::connect(Arc::new(LoopbackServer::default()), cfg);
        let class = session.create_class("ant", vec![]).unwrap();
        let ants = (0..5)
            .map(|_| session.create_instance(class, vec![]).unwrap())
            .collect::<Vec<_>>();

        assert!(session.server().stats().forces() >= 1);
        assert!(session.workspace().get(ants[0]).unwrap().oid().is_permanent());
        assert!(session.workspace().live_temporaries() <= 3);
        session.flush_all().unwrap();
        for ant in ants {
            assert!(session.workspace().get(ant).unwrap().oid().is_permanent());
        }
    }
}
