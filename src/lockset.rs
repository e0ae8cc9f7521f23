// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use hashbrown::HashSet;
use tracing::{
    debug,
    instrument,
};

use crate::{
    errs::LocatorError,
    lock::Lock,
    oid::Oid,
    server::{
        LocksetRequest,
        Server,
    },
    session::Session,
    transform::Transformer,
    workspace::HandleId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocksetPolicy {
    /// The first object that cannot be locked fails the whole call.
    AbortOnFirstError,
    /// Lock what can be locked; unavailable objects are reported.
    BestEffort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocksetReport {
    pub round_trips: usize,
    /// Handles the server could not deliver. Always empty under
    /// [`LocksetPolicy::AbortOnFirstError`].
    pub missing: Vec<HandleId>,
}

impl<S: Server, T: Transformer> Session<S, T> {
    /// Drop repeated oids, keeping the first occurrence. Long inputs go
    /// through a hash set, short ones are scanned.
    fn dedup_handles(&self, handles: &[HandleId]) -> Result<Vec<(HandleId, Oid)>, LocatorError> {
        let mut unique: Vec<(HandleId, Oid)> = Vec::with_capacity(handles.len());

        if handles.len() > self.config.dedup_hash_threshold() {
            let mut seen = HashSet::with_capacity(handles.len());
            for id in handles {
                let oid = self.workspace.get(*id)?.oid();
                if seen.insert(oid) {
                    unique.push((*id, oid));
                }
            }
        } else {
            for id in handles {
                let oid = self.workspace.get(*id)?.oid();
                if !unique.iter().any(|(_, seen)| *seen == oid) {
                    unique.push((*id, oid));
                }
            }
        }

        Ok(unique)
    }

    /// Lock and fetch a batch of objects in as few round trips as the server
    /// allows. Classes in `handles` get `class_lock`, everything else gets
    /// `inst_lock` and its class the matching intention lock.
    #[instrument(level = "debug", skip(self, handles), fields(handles = handles.len()))]
    pub fn fetch_all(
        &mut self,
        handles: &[HandleId],
        inst_lock: Lock,
        class_lock: Lock,
        policy: LocksetPolicy,
    ) -> Result<LocksetReport, LocatorError> {
        let root = self.workspace.root();
        let quit = policy == LocksetPolicy::AbortOnFirstError;
        let mut req = LocksetRequest::new(inst_lock, quit);
        // parallel to req.classes() and req.objects()
        let mut class_handles: Vec<HandleId> = vec![];
        let mut object_handles: Vec<HandleId> = vec![];
        let mut report = LocksetReport::default();

        for (id, oid) in self.dedup_handles(handles)? {
            let handle = self.workspace.get(id)?;
            let is_class = handle.is_class() || handle.class() == Some(root);
            let is_cached = handle.is_cached();
            let held = handle.lock();
            let class = handle.class();
            let wanted = if is_class { class_lock } else { inst_lock };

            if id == root || !oid.is_permanent() {
                // the root and local objects never travel
                if is_cached || id == root {
                    self.workspace.stamp_lock(id, wanted)?;
                } else if quit {
                    return Err(LocatorError::NotFound(oid));
                } else {
                    report.missing.push(id);
                }
                continue;
            }
            if is_cached && held != Lock::Null && held.covers(wanted) {
                continue;
            }

            if is_class {
                let idx = req.add_class(oid, wanted);
                if idx == class_handles.len() {
                    class_handles.push(id);
                }
                continue;
            }

            let class_idx = match class {
                | Some(class) if class != root => {
                    let class_oid = self.workspace.get(class)?.oid();
                    let idx = req.add_class(class_oid, inst_lock.intention());
                    if idx == class_handles.len() {
                        class_handles.push(class);
                    }
                    Some(idx)
                },
                | _ => None,
            };
            req.add_object(oid, class_idx);
            object_handles.push(id);
        }

        let mut missing: HashSet<Oid> = HashSet::new();

        while !req.is_empty() && !req.is_done() {
            let result = self.server.fetch_lockset(&mut req);
            let area = match self.settle(result) {
                | Ok(area) => area,
                | Err(LocatorError::NotFound(oid)) => {
                    if let Some(id) = self.workspace.find(oid) {
                        self.workspace.decache(id)?;
                    }
                    return Err(LocatorError::NotFound(oid));
                },
                | Err(err) => return Err(err),
            };
            report.round_trips += 1;

            for entry in self.populate(&area, Lock::Null)? {
                if entry.missing {
                    missing.insert(entry.oid);
                }
            }
        }

        for (class, id) in req.classes().iter().zip(class_handles.iter()) {
            if missing.contains(&class.oid()) {
                report.missing.push(*id);
                continue;
            }
            self.workspace.stamp_lock(*id, class.lock())?;
        }
        for (obj, id) in req.objects().iter().zip(object_handles.iter()) {
            if missing.contains(&obj.oid()) {
                report.missing.push(*id);
                continue;
            }
            self.workspace.stamp_lock(*id, inst_lock)?;
            if let Some(class) = self.workspace.get(*id)?.class() {
                if class != *id {
                    self.workspace.stamp_lock(class, inst_lock.intention())?;
                }
            }
        }

        debug!(
            round_trips = report.round_trips,
            missing = report.missing.len(),
            "lockset fetched"
        );
        Ok(report)
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
        object::{
            AttrKind,
            Attribute,
            Value,
        },
    };

    fn populated(count: usize, batch_limit: usize) -> (Session<Arc<LoopbackServer>>, HandleId, Vec<HandleId>) {
        let cfg = LocatorConfigBuilder::new()
            .dedup_hash_threshold(4)
            .lockset_batch_limit(batch_limit)
            .build();
        let server = Arc::new(LoopbackServer::with_config(&cfg));
        let mut writer = Session::connect(server.clone(), cfg);
        let dog = writer
            .create_class("dog", vec![Attribute::new("name", AttrKind::Str)])
            .unwrap();
        let dogs = (0..count)
            .map(|i| writer.create_instance(dog, vec![Value::Str(format!("rex {}", i))]).unwrap())
            .collect::<Vec<_>>();
        writer.flush_all().unwrap();
        let dog_oid = writer.workspace().get(dog).unwrap().oid();
        let oids = dogs
            .iter()
            .map(|id| writer.workspace().get(*id).unwrap().oid())
            .collect::<Vec<_>>();

        let mut reader = Session::connect(server, cfg);
        let dog = reader.workspace.intern(dog_oid, Some(reader.workspace.root()));
        let dogs = oids
            .into_iter()
            .map(|oid| reader.workspace.intern(oid, Some(dog)))
            .collect();
        (reader, dog, dogs)
    }

    #[test]
    fn test_round_trips_follow_batch_limit() {
        let (mut session, dog, dogs) = populated(7, 3);
        let report = session
            .fetch_all(&dogs, Lock::Shared, Lock::IntentShared, LocksetPolicy::AbortOnFirstError)
            .unwrap();

        assert_eq!(report.round_trips, 3);
        assert!(report.missing.is_empty());
        for id in &dogs {
            let handle = session.workspace().get(*id).unwrap();
            assert!(handle.is_cached());
            assert_eq!(handle.lock(), Lock::Shared);
        }
        assert_eq!(session.workspace().get(dog).unwrap().lock(), Lock::IntentShared);
    }

    #[test]
    fn test_duplicates_are_fetched_once() {
        let (mut session, _, dogs) = populated(3, 64);
        let mut input = dogs.clone();
        input.extend(dogs.iter().rev());
        input.extend(dogs.iter());

        let report = session
            .fetch_all(&input, Lock::Shared, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();
        assert_eq!(report.round_trips, 1);
        assert_eq!(session.server().stats().locksets(), 1);
    }

    #[test]
    fn test_sufficiently_locked_handles_are_skipped() {
        let (mut session, _, dogs) = populated(2, 64);
        session
            .fetch_all(&dogs, Lock::Exclusive, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();

        let report = session
            .fetch_all(&dogs, Lock::Shared, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();
        assert_eq!(report.round_trips, 0);
        assert_eq!(session.workspace().get(dogs[0]).unwrap().lock(), Lock::Exclusive);
    }

    #[test]
    fn test_best_effort_reports_missing() {
        let (mut session, _, dogs) = populated(4, 2);
        let gone = session.workspace().get(dogs[2]).unwrap().oid();
        session.server().delete_behind(gone);

        let report = session
            .fetch_all(&dogs, Lock::Shared, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();
        assert_eq!(report.missing, vec![dogs[2]]);
        assert!(!session.workspace().get(dogs[2]).unwrap().is_cached());
        assert_eq!(session.workspace().get(dogs[3]).unwrap().lock(), Lock::Shared);
    }

    #[test]
    fn test_abort_on_first_error() {
        let (mut session, _, dogs) = populated(4, 2);
        let locked = session.workspace().get(dogs[1]).unwrap().oid();
        session.server().hold_conflicting(locked);

        assert_eq!(
            session.fetch_all(&dogs, Lock::Shared, Lock::IntentShared, LocksetPolicy::AbortOnFirstError),
            Err(LocatorError::LockConflict(locked))
        );
    }

    #[test]
    fn test_unknown_class_is_sent_along() {
        let (session, _, dogs) = populated(2, 64);
        let oid = session.workspace().get(dogs[0]).unwrap().oid();

        let mut fresh = Session::connect(session.server().clone(), LocatorConfig::default());
        let stranger = fresh.workspace.intern(oid, None);
        let report = fresh
            .fetch_all(&[stranger], Lock::Shared, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();

        assert_eq!(report.round_trips, 1);
        let class = fresh.workspace().get(stranger).unwrap().class().unwrap();
        let class = fresh.workspace().get(class).unwrap();
        assert!(class.is_class());
        assert_eq!(class.lock(), Lock::IntentShared);
    }

    #[test]
    fn test_missing_on_empty_server() {
        let mut session = Session::connect(Arc::new(LoopbackServer::default()), LocatorConfig::default());
        let orphan = session.workspace.intern(Oid::new(0, 12, 3), None);
        let report = session
            .fetch_all(&[orphan], Lock::Shared, Lock::IntentShared, LocksetPolicy::BestEffort)
            .unwrap();
        assert_eq!(report.missing, vec![orphan]);
    }
}
