// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! An in-process [`Server`]. Records are kept in an ordered map and every
//! force is applied immediately; there is no rollback. The hooks at the
//! bottom let callers simulate what other clients or the server's deadlock
//! detector would do.

use std::sync::atomic::{
    AtomicBool,
    AtomicUsize,
    Ordering::Relaxed,
};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use hashbrown::{
    HashMap,
    HashSet,
};
use parking_lot::Mutex;
use tracing::{
    instrument,
    trace,
};

use crate::{
    config::{
        LocatorConfig,
        DEFAULT_LOCKSET_BATCH_LIMIT,
    },
    copy_area::{
        CopyArea,
        Descriptor,
        Operation,
    },
    errs::LocatorError,
    lock::Lock,
    oid::{
        Hfid,
        Oid,
    },
    server::{
        AssignRequest,
        FetchReply,
        FetchRequest,
        ForceMode,
        ForceReply,
        LocksetRequest,
        NameStatus,
        ObjectOutcome,
        Server,
    },
};

/// Slots handed out per page before the allocator moves to the next page.
const SLOTS_PER_PAGE: u32 = 16;
/// Upper bound on unsolicited siblings returned with a single fetch.
const PREFETCH_LIMIT: usize = 8;

#[derive(Debug, Clone)]
struct Record {
    class_oid: Oid,
    hfid: Hfid,
    /// `None` while the slot is only reserved by an early oid assignment.
    data: Option<Bytes>,
}

/// Round trips served, per contract.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    fetches: AtomicUsize,
    locksets: AtomicUsize,
    forces: AtomicUsize,
    assigns: AtomicUsize,
    names: AtomicUsize,
}

impl LoopbackStats {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Relaxed)
    }

    pub fn locksets(&self) -> usize {
        self.locksets.load(Relaxed)
    }

    pub fn forces(&self) -> usize {
        self.forces.load(Relaxed)
    }

    pub fn assigns(&self) -> usize {
        self.assigns.load(Relaxed)
    }

    pub fn names(&self) -> usize {
        self.names.load(Relaxed)
    }
}

#[derive(Debug)]
pub struct LoopbackServer {
    records: SkipMap<Oid, Record>,
    names: Mutex<HashMap<String, Oid>>,
    conflicts: Mutex<HashSet<Oid>>,
    next_slot: Mutex<u32>,
    abort_next: AtomicBool,
    batch_limit: usize,
    stats: LoopbackStats,
    forced: Mutex<Vec<Vec<Descriptor>>>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        LoopbackServer::new(DEFAULT_LOCKSET_BATCH_LIMIT)
    }
}

impl LoopbackServer {
    pub fn new(batch_limit: usize) -> Self {
        LoopbackServer {
            records: SkipMap::new(),
            names: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(HashSet::new()),
            next_slot: Mutex::new(0),
            abort_next: AtomicBool::new(false),
            batch_limit: batch_limit.max(1),
            stats: LoopbackStats::default(),
            forced: Mutex::new(vec![]),
        }
    }

    /// A server whose lockset batches follow `config`.
    pub fn with_config(config: &LocatorConfig) -> Self {
        LoopbackServer::new(config.lockset_batch_limit())
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    fn allocate(&self) -> Oid {
        let mut next = self.next_slot.lock();
        let slot = *next;
        *next += 1;
        // page 0 belongs to the root class
        Oid::new(0, (1 + slot / SLOTS_PER_PAGE) as i32, (slot % SLOTS_PER_PAGE) as i16)
    }

    /// Send `area` through the wire format, the way a remote peer would see it.
    fn wire(area: &CopyArea) -> Result<CopyArea, LocatorError> {
        CopyArea::decode(area.encode())
    }

    fn round_trip(&self, counter: &AtomicUsize) -> Result<(), LocatorError> {
        counter.fetch_add(1, Relaxed);
        if self.abort_next.swap(false, Relaxed) {
            return Err(LocatorError::UnilateralAbort);
        }
        Ok(())
    }

    fn conflicts_with(&self, oid: Oid, lock: Lock) -> bool {
        !Lock::SchemaStability.covers(lock) && self.conflicts.lock().contains(&oid)
    }

    /// The record at `oid`, unless it is missing or only reserved.
    fn stored(&self, oid: Oid) -> Option<(Record, Bytes)> {
        let entry = self.records.get(&oid)?;
        let record = entry.value().clone();
        record.data.clone().map(|data| (record, data))
    }

    fn class_exists(&self, class_oid: Oid) -> bool {
        class_oid.is_root() || self.records.contains_key(&class_oid)
    }

    fn append_record(area: &mut CopyArea, oid: Oid, record: &Record, data: &Bytes) -> Result<(), LocatorError> {
        area.append(Descriptor::new(Operation::Fetch, record.hfid, oid, record.class_oid), data)?;
        Ok(())
    }

    fn append_missing(area: &mut CopyArea, oid: Oid) -> Result<(), LocatorError> {
        area.append(Descriptor::new(Operation::Missing, Hfid::ROOT, oid, Oid::NULL), &[])?;
        Ok(())
    }

    /// Append `oid` to a lockset reply, or a miss marker when it cannot be
    /// delivered and the request tolerates errors.
    fn deliver(&self, area: &mut CopyArea, oid: Oid, lock: Lock, quit_on_errors: bool) -> Result<bool, LocatorError> {
        let err = if self.conflicts_with(oid, lock) {
            LocatorError::LockConflict(oid)
        } else {
            match self.stored(oid) {
                | Some((record, data)) => {
                    Self::append_record(area, oid, &record, &data)?;
                    return Ok(true);
                },
                | None => LocatorError::NotFound(oid),
            }
        };

        if quit_on_errors {
            return Err(err);
        }
        Self::append_missing(area, oid)?;
        Ok(false)
    }

    fn lookup(&self, staged: &[(Oid, Option<Record>)], oid: Oid) -> Option<Record> {
        match staged.iter().rev().find(|(staged_oid, _)| *staged_oid == oid) {
            | Some((_, record)) => record.clone(),
            | None => self.records.get(&oid).map(|e| e.value().clone()),
        }
    }

    /// Make another client delete `oid` behind this client's back.
    pub fn delete_behind(&self, oid: Oid) {
        self.records.remove(&oid);
    }

    /// Pretend another transaction holds a lock on `oid` that conflicts with
    /// anything stronger than schema stability.
    pub fn hold_conflicting(&self, oid: Oid) {
        self.conflicts.lock().insert(oid);
    }

    pub fn release_conflicting(&self, oid: Oid) {
        self.conflicts.lock().remove(&oid);
    }

    /// Make the next round trip report that the transaction was aborted.
    pub fn inject_unilateral_abort(&self) {
        self.abort_next.store(true, Relaxed);
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.stored(oid).is_some()
    }

    pub fn record(&self, oid: Oid) -> Option<Bytes> {
        self.stored(oid).map(|(_, data)| data)
    }

    pub fn class_of(&self, oid: Oid) -> Option<Oid> {
        self.stored(oid).map(|(record, _)| record.class_oid)
    }

    /// Number of records holding data.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|e| e.value().data.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The directory of every area forced so far, in arrival order.
    pub fn forced(&self) -> Vec<Vec<Descriptor>> {
        self.forced.lock().clone()
    }
}

impl Server for LoopbackServer {
    #[instrument(level = "trace", skip(self))]
    fn fetch_object(&self, req: &FetchRequest) -> Result<FetchReply, LocatorError> {
        self.round_trip(&self.stats.fetches)?;

        if self.conflicts_with(req.oid(), req.lock()) {
            return Err(LocatorError::LockConflict(req.oid()));
        }
        let (record, data) = self.stored(req.oid()).ok_or(LocatorError::NotFound(req.oid()))?;
        let class_oid = record.class_oid;

        let mut area = CopyArea::unbounded();
        if req.fetch_class() && !class_oid.is_root() {
            if let Some((class_record, class_data)) = self.stored(class_oid) {
                Self::append_record(&mut area, class_oid, &class_record, &class_data)?;
            }
        }
        Self::append_record(&mut area, req.oid(), &record, &data)?;

        if req.prefetch() && !class_oid.is_root() {
            let siblings = self
                .records
                .iter()
                .filter(|e| *e.key() != req.oid() && e.value().class_oid == class_oid)
                .filter(|e| !self.conflicts_with(*e.key(), req.implicit_lock()))
                .filter_map(|e| {
                    let sibling = e.value().clone();
                    sibling.data.clone().map(|data| (*e.key(), sibling, data))
                })
                .take(PREFETCH_LIMIT)
                .collect::<Vec<_>>();
            for (oid, sibling, data) in siblings {
                Self::append_record(&mut area, oid, &sibling, &data)?;
            }
        }

        Ok(FetchReply {
            area: Self::wire(&area)?,
            granted: req.lock(),
        })
    }

    #[instrument(level = "trace", skip(self, req), fields(next_class = req.next_class(), next_object = req.next_object()))]
    fn fetch_lockset(&self, req: &mut LocksetRequest) -> Result<CopyArea, LocatorError> {
        self.round_trip(&self.stats.locksets)?;

        let mut area = CopyArea::unbounded();
        let quit = req.quit_on_errors();

        let class_end = (req.next_class() + self.batch_limit).min(req.classes().len());
        let mut sent = HashSet::new();
        for class in &req.classes()[req.next_class()..class_end] {
            if self.deliver(&mut area, class.oid(), class.lock(), quit)? {
                sent.insert(class.oid());
            }
        }

        let object_end = (req.next_object() + self.batch_limit).min(req.objects().len());
        for obj in &req.objects()[req.next_object()..object_end] {
            if obj.class_idx().is_none() {
                // the client did not know the class, send it along once
                if let Some(class_oid) = self.class_of(obj.oid()) {
                    if !class_oid.is_root() && sent.insert(class_oid) {
                        if let Some((class_record, data)) = self.stored(class_oid) {
                            Self::append_record(&mut area, class_oid, &class_record, &data)?;
                        }
                    }
                }
            }
            self.deliver(&mut area, obj.oid(), req.inst_lock(), quit)?;
        }

        let classes = class_end - req.next_class();
        let objects = object_end - req.next_object();
        req.advance(classes, objects);
        trace!(classes, objects, "lockset slice served");
        Self::wire(&area)
    }

    #[instrument(level = "trace", skip(self, area), fields(objects = area.len()))]
    fn force(&self, area: &CopyArea, mode: ForceMode) -> Result<ForceReply, LocatorError> {
        self.round_trip(&self.stats.forces)?;
        let area = Self::wire(area)?;
        self.forced.lock().push(area.descriptors().to_vec());

        let mut staged: Vec<(Oid, Option<Record>)> = vec![];
        let mut rebinds: Vec<(Oid, Oid)> = vec![];
        let mut outcomes = Vec::with_capacity(area.len());

        for (desc, bytes) in area.entries() {
            let oid = desc.oid();
            let outcome = match desc.operation() {
                | Operation::Insert if !oid.is_temp() => {
                    ObjectOutcome::Failed(LocatorError::Server(format!("insert of permanent oid {}", oid)))
                },
                | Operation::Insert => {
                    let class_oid = desc.class_oid();
                    if !class_oid.is_permanent() ||
                        (!self.class_exists(class_oid) && self.lookup(&staged, class_oid).is_none())
                    {
                        ObjectOutcome::Failed(LocatorError::NotFound(class_oid))
                    } else {
                        let new_oid = self.allocate();
                        staged.push((
                            new_oid,
                            Some(Record {
                                class_oid,
                                hfid: desc.hfid(),
                                data: Some(bytes),
                            }),
                        ));
                        rebinds.push((oid, new_oid));
                        ObjectOutcome::Applied(new_oid)
                    }
                },
                | Operation::Update | Operation::Delete if self.conflicts_with(oid, Lock::Exclusive) => {
                    ObjectOutcome::Failed(LocatorError::LockConflict(oid))
                },
                | Operation::Update => match self.lookup(&staged, oid) {
                    | Some(record) => {
                        staged.push((
                            oid,
                            Some(Record {
                                data: Some(bytes),
                                ..record
                            }),
                        ));
                        ObjectOutcome::Applied(oid)
                    },
                    | None => ObjectOutcome::Failed(LocatorError::NotFound(oid)),
                },
                // a slot that was only reserved is freed the same way
                | Operation::Delete => match self.lookup(&staged, oid) {
                    | Some(_) => {
                        staged.push((oid, None));
                        ObjectOutcome::Applied(oid)
                    },
                    | None => ObjectOutcome::Failed(LocatorError::NotFound(oid)),
                },
                | Operation::Fetch | Operation::Missing => ObjectOutcome::Failed(LocatorError::Server(format!(
                    "{:?} is not a flush operation",
                    desc.operation()
                ))),
            };

            if let (ForceMode::Strict, ObjectOutcome::Failed(err)) = (mode, &outcome) {
                return Err(err.clone());
            }
            outcomes.push(outcome);
        }

        for (oid, record) in staged {
            match record {
                | Some(record) => {
                    self.records.insert(oid, record);
                },
                | None => {
                    self.records.remove(&oid);
                },
            }
        }
        let mut names = self.names.lock();
        for (temp, perm) in rebinds {
            for bound in names.values_mut().filter(|bound| **bound == temp) {
                *bound = perm;
            }
        }

        Ok(ForceReply { outcomes })
    }

    fn reserve_class_name(&self, name: &str, oid: Oid) -> Result<NameStatus, LocatorError> {
        self.round_trip(&self.stats.names)?;
        let mut names = self.names.lock();
        if names.contains_key(name) {
            return Ok(NameStatus::Exists);
        }
        names.insert(name.to_string(), oid);
        Ok(NameStatus::Reserved)
    }

    fn rename_class_name(&self, old: &str, new: &str, oid: Oid) -> Result<NameStatus, LocatorError> {
        self.round_trip(&self.stats.names)?;
        let mut names = self.names.lock();
        if names.contains_key(new) {
            return Ok(NameStatus::Exists);
        }
        names.remove(old);
        names.insert(new.to_string(), oid);
        Ok(NameStatus::Reserved)
    }

    fn delete_class_name(&self, name: &str) -> Result<NameStatus, LocatorError> {
        self.round_trip(&self.stats.names)?;
        match self.names.lock().remove(name) {
            | Some(_) => Ok(NameStatus::Deleted),
            | None => Err(LocatorError::NameNotFound(name.to_string())),
        }
    }

    fn find_class_oid(&self, name: &str) -> Result<Option<Oid>, LocatorError> {
        self.round_trip(&self.stats.names)?;
        Ok(self.names.lock().get(name).copied())
    }

    #[instrument(level = "trace", skip(self))]
    fn assign_permanent_oid(&self, req: &AssignRequest) -> Result<Oid, LocatorError> {
        self.round_trip(&self.stats.assigns)?;
        if !self.class_exists(req.class_oid()) {
            return Err(LocatorError::NotFound(req.class_oid()));
        }

        let oid = self.allocate();
        self.records.insert(
            oid,
            Record {
                class_oid: req.class_oid(),
                hfid: req.hfid(),
                data: None,
            },
        );
        if let Some(name) = req.name() {
            self.names.lock().insert(name.clone(), oid);
        }
        Ok(oid)
    }
}
