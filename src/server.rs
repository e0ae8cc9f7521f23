// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The requests the locator sends to the server. How they travel is up to the
//! implementation; every call is a single blocking round trip and any of them
//! may come back with [`LocatorError::UnilateralAbort`].

use std::sync::Arc;

use getset::{
    CopyGetters,
    Getters,
};

use crate::{
    copy_area::CopyArea,
    errs::LocatorError,
    lock::Lock,
    oid::{
        Hfid,
        Oid,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct FetchRequest {
    oid: Oid,
    lock: Lock,
    /// The class of the object when the client knows it.
    class_oid: Option<Oid>,
    /// Whether the reply has to include the class record too.
    fetch_class: bool,
    /// Lock the client will stamp onto unsolicited instances of the same class.
    implicit_lock: Lock,
    prefetch: bool,
}

impl FetchRequest {
    pub fn new(oid: Oid, lock: Lock) -> Self {
        FetchRequest {
            oid,
            lock,
            class_oid: None,
            fetch_class: true,
            implicit_lock: Lock::Null,
            prefetch: false,
        }
    }

    pub fn with_class(mut self, class_oid: Oid, fetch_class: bool) -> Self {
        self.class_oid = Some(class_oid);
        self.fetch_class = fetch_class;
        self
    }

    pub fn with_prefetch(mut self, implicit_lock: Lock) -> Self {
        self.implicit_lock = implicit_lock;
        self.prefetch = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchReply {
    pub area: CopyArea,
    /// What the server actually granted on the requested object.
    pub granted: Lock,
}

/// A class named by a lockset, either directly or as the class of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct LocksetClass {
    oid: Oid,
    lock: Lock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct LocksetObject {
    oid: Oid,
    /// Index into [`LocksetRequest::classes`], if the class is known.
    class_idx: Option<usize>,
}

/// A batch of objects and classes to lock and fetch together.
///
/// The server works through both arrays over as many round trips as it needs,
/// moving [`LocksetRequest::next_class`] and [`LocksetRequest::next_object`]
/// forward by however many entries it handled. Replies do not say which entry
/// an object belongs to; the client infers it from the cursors.
#[derive(Debug, Clone, Default, Getters, CopyGetters)]
pub struct LocksetRequest {
    #[getset(get = "pub")]
    classes: Vec<LocksetClass>,
    #[getset(get = "pub")]
    objects: Vec<LocksetObject>,
    #[getset(get_copy = "pub")]
    inst_lock: Lock,
    #[getset(get_copy = "pub")]
    quit_on_errors: bool,
    #[getset(get_copy = "pub")]
    next_class: usize,
    #[getset(get_copy = "pub")]
    next_object: usize,
}

impl LocksetRequest {
    pub fn new(inst_lock: Lock, quit_on_errors: bool) -> Self {
        LocksetRequest {
            inst_lock,
            quit_on_errors,
            ..Default::default()
        }
    }

    /// Register a class, or raise the lock of an already registered one.
    pub fn add_class(&mut self, oid: Oid, lock: Lock) -> usize {
        match self.classes.iter().position(|c| c.oid == oid) {
            | Some(idx) => {
                self.classes[idx].lock = self.classes[idx].lock.join(lock);
                idx
            },
            | None => {
                self.classes.push(LocksetClass { oid, lock });
                self.classes.len() - 1
            },
        }
    }

    pub fn add_object(&mut self, oid: Oid, class_idx: Option<usize>) -> usize {
        self.objects.push(LocksetObject { oid, class_idx });
        self.objects.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.objects.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.next_class >= self.classes.len() && self.next_object >= self.objects.len()
    }

    /// Called by the server once it handled `classes` more classes and
    /// `objects` more objects.
    pub fn advance(&mut self, classes: usize, objects: usize) {
        self.next_class = (self.next_class + classes).min(self.classes.len());
        self.next_object = (self.next_object + objects).min(self.objects.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMode {
    /// The first failing object fails the whole buffer.
    Strict,
    /// Apply what can be applied and report per-object outcomes. Used when
    /// replaying replicated batches.
    ContinueOnError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectOutcome {
    /// The object was written; carries its permanent oid.
    Applied(Oid),
    Failed(LocatorError),
}

/// One outcome per descriptor of the forced area, in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForceReply {
    pub outcomes: Vec<ObjectOutcome>,
}

impl ForceReply {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ObjectOutcome::Failed(_)))
            .count()
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failures() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStatus {
    Reserved,
    Exists,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct AssignRequest {
    #[getset(get_copy = "pub")]
    hfid: Hfid,
    #[getset(get_copy = "pub")]
    expected_size: usize,
    #[getset(get_copy = "pub")]
    class_oid: Oid,
    #[getset(get = "pub")]
    name: Option<String>,
}

impl AssignRequest {
    pub fn new(hfid: Hfid, expected_size: usize, class_oid: Oid, name: Option<String>) -> Self {
        AssignRequest {
            hfid,
            expected_size,
            class_oid,
            name,
        }
    }
}

pub trait Server {
    fn fetch_object(&self, req: &FetchRequest) -> Result<FetchReply, LocatorError>;

    /// Handle the next slice of `req`, advancing its cursors.
    fn fetch_lockset(&self, req: &mut LocksetRequest) -> Result<CopyArea, LocatorError>;

    fn force(&self, area: &CopyArea, mode: ForceMode) -> Result<ForceReply, LocatorError>;

    fn reserve_class_name(&self, name: &str, oid: Oid) -> Result<NameStatus, LocatorError>;

    fn rename_class_name(&self, old: &str, new: &str, oid: Oid) -> Result<NameStatus, LocatorError>;

    fn delete_class_name(&self, name: &str) -> Result<NameStatus, LocatorError>;

    fn find_class_oid(&self, name: &str) -> Result<Option<Oid>, LocatorError>;

    fn assign_permanent_oid(&self, req: &AssignRequest) -> Result<Oid, LocatorError>;
}

impl<T: Server> Server for Arc<T> {
    fn fetch_object(&self, req: &FetchRequest) -> Result<FetchReply, LocatorError> {
        (**self).fetch_object(req)
    }

    fn fetch_lockset(&self, req: &mut LocksetRequest) -> Result<CopyArea, LocatorError> {
        (**self).fetch_lockset(req)
    }

    fn force(&self, area: &CopyArea, mode: ForceMode) -> Result<ForceReply, LocatorError> {
        (**self).force(area, mode)
    }

    fn reserve_class_name(&self, name: &str, oid: Oid) -> Result<NameStatus, LocatorError> {
        (**self).reserve_class_name(name, oid)
    }

    fn rename_class_name(&self, old: &str, new: &str, oid: Oid) -> Result<NameStatus, LocatorError> {
        (**self).rename_class_name(old, new, oid)
    }

    fn delete_class_name(&self, name: &str) -> Result<NameStatus, LocatorError> {
        (**self).delete_class_name(name)
    }

    fn find_class_oid(&self, name: &str) -> Result<Option<Oid>, LocatorError> {
        (**self).find_class_oid(name)
    }

    fn assign_permanent_oid(&self, req: &AssignRequest) -> Result<Oid, LocatorError> {
        (**self).assign_permanent_oid(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockset_registration() {
        let mut req = LocksetRequest::new(Lock::Shared, true);
        let cls = req.add_class(Oid::new(0, 1, 0), Lock::IntentShared);
        assert_eq!(req.add_class(Oid::new(0, 1, 0), Lock::Shared), cls);
        assert_eq!(req.classes()[cls].lock(), Lock::Shared);

        req.add_object(Oid::new(0, 2, 0), Some(cls));
        req.add_object(Oid::new(0, 2, 1), None);
        assert!(!req.is_done());

        req.advance(1, 1);
        assert!(!req.is_done());
        req.advance(5, 5);
        assert!(req.is_done());
        assert_eq!(req.next_object(), 2, "cursors never run past the arrays");
    }

    #[test]
    fn test_force_reply_failures() {
        let reply = ForceReply {
            outcomes: vec![
                ObjectOutcome::Applied(Oid::new(0, 1, 0)),
                ObjectOutcome::Failed(LocatorError::NotFound(Oid::new(0, 2, 0))),
            ],
        };
        assert_eq!(reply.failures(), 1);
        assert!(reply.is_partial_failure());
        assert!(!ForceReply::default().is_partial_failure());
    }
}
