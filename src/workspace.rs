// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::fmt;

use getset::{
    CopyGetters,
    Getters,
};
use hashbrown::HashMap;
use tracing::instrument;

use crate::{
    errs::LocatorError,
    lock::Lock,
    object::ObjectData,
    oid::Oid,
    transform::{
        OidInterner,
        OidResolver,
    },
};

/// Client-local identity of an object. Stable for the lifetime of the session,
/// no matter how often the object's oid or cached representation changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Handle {
    #[getset(get_copy = "pub")]
    oid: Oid,
    /// The owning class. Only the root class has none.
    #[getset(get_copy = "pub")]
    class: Option<HandleId>,
    #[getset(get = "pub")]
    object: Option<ObjectData>,
    #[getset(get_copy = "pub")]
    lock: Lock,
    #[getset(get_copy = "pub")]
    dirty: bool,
    #[getset(get_copy = "pub")]
    deleted: bool,
    listed: bool,
}

impl Handle {
    fn new(oid: Oid, class: Option<HandleId>) -> Self {
        Handle {
            oid,
            class,
            object: None,
            lock: Lock::Null,
            dirty: false,
            deleted: false,
            listed: false,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.object.is_some()
    }

    pub fn is_class(&self) -> bool {
        matches!(self.object, Some(ObjectData::Class(_)))
    }
}

/// The session's object cache.
///
/// Handles live in an arena and are indexed by their current oid, temporary
/// or permanent. Dirty handles are additionally kept in append order so the
/// flush visits them in the order they were first touched.
#[derive(Debug)]
pub struct Workspace {
    handles: Vec<Handle>,
    by_oid: HashMap<Oid, HandleId>,
    dirty: Vec<HandleId>,
    root: HandleId,
}

impl Default for Workspace {
    fn default() -> Self {
        Workspace::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        let mut ws = Workspace {
            handles: vec![],
            by_oid: HashMap::new(),
            dirty: vec![],
            root: HandleId(0),
        };
        ws.root = ws.insert(Handle::new(Oid::ROOT, None));
        ws
    }

    fn insert(&mut self, handle: Handle) -> HandleId {
        let id = HandleId(self.handles.len() as u32);
        self.by_oid.insert(handle.oid, id);
        self.handles.push(handle);
        id
    }

    /// The handle of the root class.
    pub fn root(&self) -> HandleId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, id: HandleId) -> Result<&Handle, LocatorError> {
        self.handles
            .get(id.0 as usize)
            .ok_or(LocatorError::UnknownHandle(id))
    }

    fn get_mut(&mut self, id: HandleId) -> Result<&mut Handle, LocatorError> {
        self.handles
            .get_mut(id.0 as usize)
            .ok_or(LocatorError::UnknownHandle(id))
    }

    pub fn find(&self, oid: Oid) -> Option<HandleId> {
        self.by_oid.get(&oid).copied()
    }

    /// Find the handle for `oid`, creating an uncached one on first reference.
    pub fn intern(&mut self, oid: Oid, class: Option<HandleId>) -> HandleId {
        match self.find(oid) {
            | Some(id) => {
                let handle = &mut self.handles[id.0 as usize];
                if handle.class.is_none() && id != self.root {
                    handle.class = class;
                }
                id
            },
            | None => self.insert(Handle::new(oid, class)),
        }
    }

    /// Register an object created by this client. It starts dirty and locked
    /// exclusively since nobody else can see it yet.
    pub fn new_object(&mut self, oid: Oid, class: HandleId, data: ObjectData) -> HandleId {
        let mut handle = Handle::new(oid, Some(class));
        handle.object = Some(data);
        handle.lock = Lock::Exclusive;
        let id = self.insert(handle);
        self.mark_listed(id);
        id
    }

    /// Install a representation received from the server. Local changes win:
    /// a dirty handle keeps its object and `false` is returned.
    #[instrument(level = "trace", skip(self, data))]
    pub fn cache(&mut self, id: HandleId, data: ObjectData) -> Result<bool, LocatorError> {
        let handle = self.get_mut(id)?;
        if handle.dirty {
            return Ok(false);
        }
        handle.object = Some(data);
        Ok(true)
    }

    /// Raise the cached lock to the join of what it holds and `lock`.
    pub fn stamp_lock(&mut self, id: HandleId, lock: Lock) -> Result<Lock, LocatorError> {
        let handle = self.get_mut(id)?;
        handle.lock = handle.lock.join(lock);
        Ok(handle.lock)
    }

    pub(crate) fn object_mut(&mut self, id: HandleId) -> Result<&mut ObjectData, LocatorError> {
        self.get_mut(id)?
            .object
            .as_mut()
            .ok_or(LocatorError::InvalidHandle(id, "object is not cached"))
    }

    fn mark_listed(&mut self, id: HandleId) {
        let handle = &mut self.handles[id.0 as usize];
        handle.dirty = true;
        if !handle.listed {
            handle.listed = true;
            self.dirty.push(id);
        }
    }

    pub fn mark_dirty(&mut self, id: HandleId) -> Result<(), LocatorError> {
        self.get(id)?;
        self.mark_listed(id);
        Ok(())
    }

    pub fn mark_deleted(&mut self, id: HandleId) -> Result<(), LocatorError> {
        self.get_mut(id)?.deleted = true;
        self.mark_listed(id);
        Ok(())
    }

    /// Flag handles as modified again, skipping unknown ones.
    pub(crate) fn redirty(&mut self, ids: &[HandleId]) {
        for id in ids {
            if (id.0 as usize) < self.handles.len() {
                self.mark_listed(*id);
            }
        }
    }

    /// Forget that `id` was modified. The handle stays cached.
    pub fn clean(&mut self, id: HandleId) -> Result<(), LocatorError> {
        self.get_mut(id)?.dirty = false;
        Ok(())
    }

    /// Drop the cached representation and lock of `id`. The next access has
    /// to go back to the server.
    pub fn decache(&mut self, id: HandleId) -> Result<(), LocatorError> {
        let handle = self.get_mut(id)?;
        handle.object = None;
        handle.lock = Lock::Null;
        handle.dirty = false;
        handle.deleted = false;
        Ok(())
    }

    /// Swap the oid of `id`, re-keying the oid index.
    pub fn relocate(&mut self, id: HandleId, oid: Oid) -> Result<(), LocatorError> {
        let old = self.get(id)?.oid;
        if old == oid {
            return Ok(());
        }
        if self.by_oid.get(&old) == Some(&id) {
            self.by_oid.remove(&old);
        }
        self.by_oid.insert(oid, id);
        self.get_mut(id)?.oid = oid;
        Ok(())
    }

    /// Forget an object that never reached the server. Its handle lingers
    /// with a null oid so stale references resolve to nothing.
    pub fn drop_temporary(&mut self, id: HandleId) -> Result<(), LocatorError> {
        let oid = self.get(id)?.oid;
        if self.by_oid.get(&oid) == Some(&id) {
            self.by_oid.remove(&oid);
        }
        self.decache(id)?;
        self.get_mut(id)?.oid = Oid::NULL;
        Ok(())
    }

    /// Snapshot the dirty list. The returned iterator is finite; handles
    /// cleaned while it runs are still yielded, so callers re-check the flag.
    pub fn dirty_handles(&mut self) -> DirtyHandles {
        let handles = &mut self.handles;
        self.dirty.retain(|id| {
            let handle = &mut handles[id.0 as usize];
            handle.listed = handle.dirty;
            handle.dirty
        });
        DirtyHandles {
            inner: self.dirty.clone().into_iter(),
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.handles.iter().filter(|h| h.dirty).count()
    }

    /// Number of indexed handles whose oid is still temporary.
    pub fn live_temporaries(&self) -> usize {
        self.by_oid.keys().filter(|oid| oid.is_temp()).count()
    }

    /// Throw away everything the aborted transaction did: objects that never
    /// reached the server are dropped, modified objects lose their stale
    /// representation, and no cached lock survives.
    #[instrument(level = "debug", skip(self))]
    pub fn invalidate_all(&mut self) {
        for idx in 0..self.handles.len() {
            let id = HandleId(idx as u32);
            let handle = &mut self.handles[idx];
            if handle.oid.is_temp() {
                if self.by_oid.get(&handle.oid) == Some(&id) {
                    self.by_oid.remove(&handle.oid);
                }
                handle.oid = Oid::NULL;
                handle.object = None;
            } else if handle.dirty || handle.deleted {
                handle.object = None;
            }
            handle.dirty = false;
            handle.deleted = false;
            handle.listed = false;
            handle.lock = Lock::Null;
        }
        self.dirty.clear();
    }

    /// Reset every cached lock once the server released them at commit.
    pub fn release_locks(&mut self) {
        for handle in self.handles.iter_mut() {
            handle.lock = Lock::Null;
        }
    }
}

impl OidResolver for Workspace {
    fn resolve(&self, handle: HandleId) -> Option<Oid> {
        self.handles
            .get(handle.0 as usize)
            .map(|h| h.oid)
            .filter(|oid| !oid.is_null())
    }
}

impl OidInterner for Workspace {
    fn intern_ref(&mut self, oid: Oid) -> HandleId {
        self.intern(oid, None)
    }
}

/// A finite pass over the handles that were dirty when it was created.
#[derive(Debug)]
pub struct DirtyHandles {
    inner: std::vec::IntoIter<HandleId>,
}

impl Iterator for DirtyHandles {
    type Item = HandleId;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        object::{
            ClassDef,
            Instance,
        },
        oid::TempOidGenerator,
    };

    fn class_obj() -> ObjectData {
        ObjectData::Class(ClassDef::new("thing", vec![]))
    }

    #[test]
    fn test_root_is_registered() {
        let ws = Workspace::new();
        let root = ws.root();
        assert_eq!(ws.find(Oid::ROOT), Some(root));
        assert_eq!(ws.get(root).unwrap().class(), None);
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut ws = Workspace::new();
        let root = ws.root();
        let a = ws.intern(Oid::new(0, 5, 1), None);
        let b = ws.intern(Oid::new(0, 5, 1), Some(root));
        assert_eq!(a, b);
        assert_eq!(ws.get(a).unwrap().class(), Some(root), "class link is filled in late");
        assert!(!ws.get(a).unwrap().is_cached());
    }

    #[test]
    fn test_stamp_never_lowers_lock() {
        let mut ws = Workspace::new();
        let id = ws.intern(Oid::new(0, 5, 1), None);
        ws.stamp_lock(id, Lock::Exclusive).unwrap();
        assert_eq!(ws.stamp_lock(id, Lock::Shared).unwrap(), Lock::Exclusive);
    }

    #[test]
    fn test_dirty_handles_skip_cleaned_entries() {
        let mut ws = Workspace::new();
        let mut gen = TempOidGenerator::new(10);
        let root = ws.root();
        let a = ws.new_object(gen.next().unwrap(), root, class_obj());
        let b = ws.new_object(gen.next().unwrap(), root, class_obj());
        ws.clean(a).unwrap();

        assert_eq!(ws.dirty_handles().collect::<Vec<_>>(), vec![b]);

        ws.mark_dirty(a).unwrap();
        ws.mark_dirty(a).unwrap();
        assert_eq!(ws.dirty_handles().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_cache_keeps_local_changes() {
        let mut ws = Workspace::new();
        let mut gen = TempOidGenerator::new(10);
        let root = ws.root();
        let id = ws.new_object(gen.next().unwrap(), root, class_obj());

        let stale = ObjectData::Instance(Instance::new(0, vec![]));
        assert!(!ws.cache(id, stale).unwrap());
        assert_eq!(ws.get(id).unwrap().object(), &Some(class_obj()));
    }

    #[test]
    fn test_relocate_rekeys_index() {
        let mut ws = Workspace::new();
        let mut gen = TempOidGenerator::new(10);
        let root = ws.root();
        let temp = gen.next().unwrap();
        let id = ws.new_object(temp, root, class_obj());
        assert_eq!(ws.live_temporaries(), 1);

        let perm = Oid::new(0, 9, 0);
        ws.relocate(id, perm).unwrap();
        assert_eq!(ws.find(temp), None);
        assert_eq!(ws.find(perm), Some(id));
        assert_eq!(ws.live_temporaries(), 0);
        assert_eq!(ws.resolve(id), Some(perm));
    }

    #[test]
    fn test_invalidate_all() {
        let mut ws = Workspace::new();
        let mut gen = TempOidGenerator::new(10);
        let root = ws.root();
        let fresh = ws.new_object(gen.next().unwrap(), root, class_obj());
        let stored = ws.intern(Oid::new(0, 3, 0), Some(root));
        ws.cache(stored, class_obj()).unwrap();
        ws.stamp_lock(stored, Lock::Exclusive).unwrap();
        ws.mark_deleted(stored).unwrap();
        let clean = ws.intern(Oid::new(0, 4, 0), Some(root));
        ws.cache(clean, class_obj()).unwrap();
        ws.stamp_lock(clean, Lock::Shared).unwrap();

        ws.invalidate_all();

        assert_eq!(ws.dirty_count(), 0);
        assert_eq!(ws.live_temporaries(), 0);
        assert_eq!(ws.resolve(fresh), None);
        let stored = ws.get(stored).unwrap();
        assert!(!stored.deleted());
        assert!(!stored.is_cached());
        assert_eq!(stored.lock(), Lock::Null);
        let clean = ws.get(clean).unwrap();
        assert!(clean.is_cached(), "clean objects keep their representation");
        assert_eq!(clean.lock(), Lock::Null);
    }

    #[test]
    fn test_unknown_handle() {
        let ws = Workspace::new();
        assert!(matches!(ws.get(HandleId(42)), Err(LocatorError::UnknownHandle(HandleId(42)))));
    }
}
