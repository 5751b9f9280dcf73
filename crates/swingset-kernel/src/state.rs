//! The kernel's single owned state arena.
//!
//! Everything a crank can touch lives in `KernelState`: the object table,
//! every vat's c-list and vatstore, the queues and the GC action set. A crank
//! mutates it in place. The large tables journal their writes, so a
//! savepoint (`StateMark`) copies only the small scalar parts and the
//! persistence layer writes back only what changed.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use swingset_store::Hash;

use crate::capdata::{CapData, Message};
use crate::clist::{CList, CListMark, Holder, MapOpts};
use crate::error::KernelError;
use crate::gc::GcAction;
use crate::ids::{DeviceId, KPid, KRef, KernelSlot, VatId, VatSlot};
use crate::journal::TrackedMap;
use crate::object_table::{ObjectTable, ObjectTableMark, PromiseState, ResultPolicy};
use crate::options::{KernelOptions, Threshold, VatOptions};
use crate::policy::{CleanupBudget, CleanupWork};
use crate::run_queue::{QueueMark, RunQueue, RunQueueEvent};
use crate::worker::VatSource;

pub const FIRST_VAT_ID: u64 = 1;
pub const FIRST_DEVICE_ID: u64 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VatLifecycle {
    /// Created, `startVat` not yet delivered.
    Starting,
    Active,
    /// An upgrade is queued.
    Upgrading,
    Terminated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapDirt {
    pub deliveries: u64,
    pub gc_krefs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Transcript position the snapshot covers up to.
    pub snap_pos: u64,
    pub hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VatRecord {
    pub vat_id: VatId,
    pub source: VatSource,
    pub options: VatOptions,
    pub lifecycle: VatLifecycle,
    pub incarnation: u64,
    pub clist: CList,
    pub vatstore: TrackedMap<String, String>,
    pub reap_dirt: ReapDirt,
    /// First transcript position a fresh worker must replay.
    pub transcript_start: u64,
    pub transcript_end: u64,
    pub last_snapshot: Option<SnapshotInfo>,
    /// Created at runtime rather than at kernel initialization.
    pub dynamic: bool,
}

impl VatRecord {
    pub fn new(vat_id: VatId, source: VatSource, options: VatOptions, dynamic: bool) -> Self {
        Self {
            vat_id,
            source,
            options,
            lifecycle: VatLifecycle::Starting,
            incarnation: 0,
            clist: CList::default(),
            vatstore: TrackedMap::new(),
            reap_dirt: ReapDirt::default(),
            transcript_start: 0,
            transcript_end: 0,
            last_snapshot: None,
            dynamic,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.options.name.as_deref()
    }

    /// Deliveries recorded since the last snapshot or incarnation start.
    pub fn transcript_span(&self) -> u64 {
        self.transcript_end - self.transcript_start
    }

    fn mark(&self) -> VatMark {
        VatMark {
            source: self.source.clone(),
            options: self.options.clone(),
            lifecycle: self.lifecycle,
            incarnation: self.incarnation,
            clist: self.clist.mark(),
            vatstore: self.vatstore.mark(),
            reap_dirt: self.reap_dirt,
            transcript_start: self.transcript_start,
            transcript_end: self.transcript_end,
            last_snapshot: self.last_snapshot.clone(),
        }
    }

    fn rollback(&mut self, mark: VatMark) {
        self.source = mark.source;
        self.options = mark.options;
        self.lifecycle = mark.lifecycle;
        self.incarnation = mark.incarnation;
        self.clist.rollback(mark.clist);
        self.vatstore.rollback(mark.vatstore);
        self.reap_dirt = mark.reap_dirt;
        self.transcript_start = mark.transcript_start;
        self.transcript_end = mark.transcript_end;
        self.last_snapshot = mark.last_snapshot;
    }
}

#[derive(Clone, Debug)]
struct VatMark {
    source: VatSource,
    options: VatOptions,
    lifecycle: VatLifecycle,
    incarnation: u64,
    clist: CListMark,
    vatstore: usize,
    reap_dirt: ReapDirt,
    transcript_start: u64,
    transcript_end: u64,
    last_snapshot: Option<SnapshotInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub name: String,
    pub clist: CList,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KernelState {
    pub options: KernelOptions,
    pub objects: ObjectTable,
    pub vats: BTreeMap<VatId, VatRecord>,
    /// Terminated vats whose c-lists and vatstores are still being released.
    pub dead_vats: BTreeMap<VatId, VatRecord>,
    /// Records dropped since the last commit, so persistence can flush their
    /// final deletions and a rollback can bring them back.
    pub(crate) forgotten: Vec<VatRecord>,
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub vat_names: IndexMap<String, VatId>,
    pub device_names: IndexMap<String, DeviceId>,
    pub terminated: Vec<VatId>,
    pub run_queue: RunQueue,
    pub reap_queue: BTreeSet<VatId>,
    pub gc_actions: BTreeSet<GcAction>,
    pub pinned: BTreeSet<KRef>,
    pub bootstrap_vat: Option<VatId>,
    pub next_vat_id: u64,
    pub next_device_id: u64,
    pub crank_number: u64,
}

impl KernelState {
    pub fn new(options: KernelOptions) -> Self {
        Self {
            options,
            objects: ObjectTable::default(),
            vats: BTreeMap::new(),
            dead_vats: BTreeMap::new(),
            forgotten: Vec::new(),
            devices: BTreeMap::new(),
            vat_names: IndexMap::new(),
            device_names: IndexMap::new(),
            terminated: Vec::new(),
            run_queue: RunQueue::default(),
            reap_queue: BTreeSet::new(),
            gc_actions: BTreeSet::new(),
            pinned: BTreeSet::new(),
            bootstrap_vat: None,
            next_vat_id: FIRST_VAT_ID,
            next_device_id: FIRST_DEVICE_ID,
            crank_number: 0,
        }
    }

    pub fn vat(&self, vat_id: VatId) -> Result<&VatRecord, KernelError> {
        self.vats.get(&vat_id).ok_or(KernelError::UnknownVat(vat_id))
    }

    pub fn vat_mut(&mut self, vat_id: VatId) -> Result<&mut VatRecord, KernelError> {
        self.vats.get_mut(&vat_id).ok_or(KernelError::UnknownVat(vat_id))
    }

    pub fn is_live(&self, vat_id: VatId) -> bool {
        self.vats.contains_key(&vat_id)
    }

    pub fn allocate_vat_id(&mut self) -> VatId {
        let vat_id = VatId(self.next_vat_id);
        self.next_vat_id += 1;
        vat_id
    }

    pub fn allocate_device_id(&mut self) -> DeviceId {
        let device_id = DeviceId(self.next_device_id);
        self.next_device_id += 1;
        device_id
    }

    pub fn add_vat(&mut self, record: VatRecord) {
        if let Some(name) = record.name() {
            self.vat_names.insert(name.to_string(), record.vat_id);
        }
        self.vats.insert(record.vat_id, record);
    }

    pub fn vat_id_by_name(&self, name: &str) -> Result<VatId, KernelError> {
        self.vat_names
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::UnknownVatName(name.to_string()))
    }

    /// Append to the run queue. The queued copy holds a count on every slot
    /// it mentions until it is dequeued.
    pub fn enqueue(&mut self, event: RunQueueEvent) -> Result<(), KernelError> {
        self.objects.increment_all(event.slots(), "queue")?;
        self.run_queue.push(event);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        let Some(event) = self.run_queue.pop() else {
            return Ok(None);
        };
        self.objects.decrement_all(event.slots(), "queue")?;
        Ok(Some(event))
    }

    pub fn add_message_to_promise_queue(&mut self, kpid: KPid, msg: Message) -> Result<(), KernelError> {
        self.objects.increment_all(msg.slots(), "promise-queue")?;
        match &mut self.objects.promise_mut(kpid)?.state {
            PromiseState::Unresolved { queue, .. } => {
                queue.push(msg);
                Ok(())
            }
            _ => Err(KernelError::invariant(format!(
                "queueing a message on resolved promise {kpid}"
            ))),
        }
    }

    /// Settle `kpid` and move its queued messages back onto the run queue.
    /// Returns the vats that must be notified, in subscription order.
    fn resolve_kernel_promise(
        &mut self,
        kpid: KPid,
        rejected: bool,
        data: CapData<KernelSlot>,
    ) -> Result<Vec<VatId>, KernelError> {
        self.objects.increment_all(data.slots.iter().copied(), "resolution")?;
        let record = self.objects.promise_mut(kpid)?;
        let settled = if rejected {
            PromiseState::Rejected(data)
        } else {
            PromiseState::Fulfilled(data)
        };
        let PromiseState::Unresolved {
            subscribers, queue, ..
        } = std::mem::replace(&mut record.state, settled)
        else {
            return Err(KernelError::invariant(format!("{kpid} resolved twice")));
        };
        for msg in queue {
            // the promise queue's counts on the message move to the run queue
            self.objects
                .increment_ref_count(kpid.into(), "queue", Default::default())?;
            self.run_queue.push(RunQueueEvent::Send {
                target: KernelSlot::Promise(kpid),
                msg,
            });
        }
        Ok(subscribers.into_iter().collect())
    }

    /// Resolve promises on behalf of `expected_decider` (the kernel itself
    /// when `None`), notifying subscribers and applying result policies.
    pub fn do_resolve(
        &mut self,
        expected_decider: Option<VatId>,
        resolutions: Vec<(KPid, bool, CapData<KernelSlot>)>,
    ) -> Result<(), KernelError> {
        for (kpid, rejected, data) in resolutions {
            let record = self
                .objects
                .promise(kpid)
                .ok_or(KernelError::UnknownPromise(kpid))?;
            if record.state.decider() != expected_decider {
                return Err(KernelError::invariant(format!(
                    "{kpid} is decided by {:?}, not {:?}",
                    record.state.decider(),
                    expected_decider
                )));
            }
            let policy = record.policy;
            let message = data.error_message();
            let body = data.body.clone();
            let subscribers = self.resolve_kernel_promise(kpid, rejected, data)?;
            for vat_id in subscribers {
                self.enqueue(RunQueueEvent::Notify { vat_id, kpid })?;
            }
            match (policy, rejected) {
                (ResultPolicy::LogAlways, false) => log::info!("{kpid} fulfilled: {body}"),
                (ResultPolicy::LogAlways | ResultPolicy::LogFailure, true) => {
                    log::warn!("{kpid} rejected: {body}")
                }
                (ResultPolicy::Panic, true) => {
                    return Err(KernelError::ResultPolicyPanic {
                        kpid,
                        reason: message.unwrap_or(body),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject an unresolved promise whoever decides it. Settled promises are
    /// left alone.
    pub fn resolve_to_error(&mut self, kpid: KPid, data: CapData<KernelSlot>) -> Result<(), KernelError> {
        let Some(record) = self.objects.promise(kpid) else {
            return Ok(());
        };
        if record.state.is_resolved() {
            return Ok(());
        }
        let decider = record.state.decider();
        self.do_resolve(decider, vec![(kpid, true, data)])
    }

    pub fn do_subscribe(&mut self, vat_id: VatId, kpid: KPid) -> Result<(), KernelError> {
        let record = self.objects.promise_mut(kpid)?;
        match &mut record.state {
            PromiseState::Unresolved { subscribers, .. } => {
                subscribers.insert(vat_id);
                Ok(())
            }
            _ => self.enqueue(RunQueueEvent::Notify { vat_id, kpid }),
        }
    }

    pub fn promises_decided_by(&self, vat_id: VatId) -> Vec<KPid> {
        self.objects
            .promises
            .iter()
            .filter(|(_, record)| record.state.decider() == Some(vat_id))
            .map(|(kpid, _)| *kpid)
            .collect()
    }

    /// Hold an object on behalf of the host for the life of the kernel.
    pub fn pin_object(&mut self, kref: KRef) -> Result<(), KernelError> {
        if self.pinned.insert(kref) {
            self.objects
                .increment_ref_count(kref.into(), "pin", Default::default())?;
        }
        Ok(())
    }

    pub fn kernel_to_vat(
        &mut self,
        vat_id: VatId,
        slot: KernelSlot,
        opts: MapOpts,
    ) -> Result<VatSlot, KernelError> {
        let KernelState { vats, objects, .. } = self;
        let vat = vats.get_mut(&vat_id).ok_or(KernelError::UnknownVat(vat_id))?;
        vat.clist.map_kernel_to_vat(slot, objects, opts)
    }

    pub fn vat_to_kernel(
        &mut self,
        vat_id: VatId,
        vref: VatSlot,
        opts: MapOpts,
    ) -> Result<KernelSlot, KernelError> {
        let KernelState { vats, objects, .. } = self;
        let vat = vats.get_mut(&vat_id).ok_or(KernelError::UnknownVat(vat_id))?;
        vat.clist
            .map_vat_to_kernel(Holder::Vat(vat_id), vref, objects, opts)
    }

    pub fn capdata_to_vat(
        &mut self,
        vat_id: VatId,
        data: &CapData<KernelSlot>,
    ) -> Result<CapData<VatSlot>, KernelError> {
        data.try_map_slots(|slot| self.kernel_to_vat(vat_id, *slot, MapOpts::default()))
    }

    pub fn capdata_to_kernel(
        &mut self,
        vat_id: VatId,
        data: &CapData<VatSlot>,
    ) -> Result<CapData<KernelSlot>, KernelError> {
        data.try_map_slots(|vref| self.vat_to_kernel(vat_id, *vref, MapOpts::default()))
    }

    pub fn delete_clist_entry(&mut self, vat_id: VatId, slot: KernelSlot) -> Result<Option<VatSlot>, KernelError> {
        let KernelState { vats, objects, .. } = self;
        match vats.get_mut(&vat_id) {
            Some(vat) => vat.clist.delete_entry(slot, objects),
            None => Ok(None),
        }
    }

    pub fn reap_interval(&self, vat: &VatRecord) -> Threshold {
        vat.options
            .reap_interval
            .unwrap_or(self.options.default_reap_interval)
    }

    pub fn reap_gc_krefs(&self, vat: &VatRecord) -> Threshold {
        vat.options
            .reap_gc_krefs
            .unwrap_or(self.options.default_reap_gc_krefs)
    }

    /// Count deliveries toward the vat's next reap, scheduling it once a
    /// threshold is met.
    pub fn add_dirt(&mut self, vat_id: VatId, deliveries: u64, gc_krefs: u64) {
        let Some(vat) = self.vats.get(&vat_id) else {
            return;
        };
        let interval = self.reap_interval(vat);
        let gc_threshold = self.reap_gc_krefs(vat);
        let Some(vat) = self.vats.get_mut(&vat_id) else {
            return;
        };
        vat.reap_dirt.deliveries += deliveries;
        vat.reap_dirt.gc_krefs += gc_krefs;
        if interval.reached(vat.reap_dirt.deliveries) || gc_threshold.reached(vat.reap_dirt.gc_krefs) {
            log::debug!("scheduling reap of {vat_id}");
            self.reap_queue.insert(vat_id);
        }
    }

    /// Take a vat out of service. Promises it decides are rejected with
    /// `reason` and it leaves the name table, the reap queue and the GC
    /// action set at once. Its c-list, vatstore and snapshot record stay
    /// behind in `dead_vats` for `cleanup_terminated_vat`. Returns whether
    /// the vat was live.
    pub fn terminate_vat_state(
        &mut self,
        vat_id: VatId,
        reason: CapData<KernelSlot>,
    ) -> Result<bool, KernelError> {
        if !self.vats.contains_key(&vat_id) {
            return Ok(false);
        }
        for kpid in self.promises_decided_by(vat_id) {
            self.do_resolve(Some(vat_id), vec![(kpid, true, reason.clone())])?;
        }
        let Some(mut record) = self.vats.remove(&vat_id) else {
            return Ok(false);
        };
        if let Some(name) = record.name() {
            self.vat_names.shift_remove(name);
        }
        self.reap_queue.remove(&vat_id);
        self.gc_actions.retain(|action| action.vat_id != vat_id);
        if self.bootstrap_vat == Some(vat_id) {
            self.bootstrap_vat = None;
        }
        self.terminated.push(vat_id);
        record.lifecycle = VatLifecycle::Terminated;
        self.dead_vats.insert(vat_id, record);
        Ok(true)
    }

    /// The terminated vat to clean up next, lowest ID first.
    pub fn next_dead_vat(&self) -> Option<VatId> {
        self.dead_vats.keys().next().copied()
    }

    /// One budgeted step of releasing a terminated vat: exports are orphaned
    /// first, then imports released, then the remaining c-list entries and
    /// vatstore keys deleted and finally the snapshot record dropped.
    /// Returns the work done and whether anything is left.
    pub fn cleanup_terminated_vat(
        &mut self,
        vat_id: VatId,
        budget: &CleanupBudget,
    ) -> Result<(CleanupWork, bool), KernelError> {
        let mut work = CleanupWork::default();
        let KernelState {
            dead_vats, objects, ..
        } = self;
        let Some(vat) = dead_vats.get_mut(&vat_id) else {
            return Ok((work, true));
        };

        let (exports, more) = take_batch(
            vat.clist.exports().map(|(slot, _)| slot),
            budget.limit(budget.exports),
        );
        for slot in exports {
            vat.clist.delete_entry(slot, objects)?;
            if let KernelSlot::Object(kref) = slot {
                objects.orphan_object(kref);
            }
            work.exports += 1;
        }
        if more {
            return Ok((work, false));
        }

        let (imports, more) = take_batch(vat.clist.imports(), budget.limit(budget.imports));
        for slot in imports {
            vat.clist.delete_entry(slot, objects)?;
            work.imports += 1;
        }
        if more {
            return Ok((work, false));
        }

        let kv_limit = budget.limit(budget.kv);
        let (entries, more) = take_batch(vat.clist.kernel_to_vat.keys().copied(), kv_limit);
        for slot in entries {
            vat.clist.delete_entry(slot, objects)?;
            work.kv += 1;
        }
        if more {
            return Ok((work, false));
        }
        let (keys, more) = take_batch(
            vat.vatstore.keys().cloned(),
            kv_limit.map(|limit| limit.saturating_sub(work.kv)),
        );
        for key in keys {
            vat.vatstore.remove(&key);
            work.kv += 1;
        }
        if more {
            return Ok((work, false));
        }

        if vat.last_snapshot.take().is_some() {
            work.snapshots += 1;
        }
        Ok((work, true))
    }

    /// Drop a fully cleaned-up vat record.
    pub fn forget_dead_vat(&mut self, vat_id: VatId) {
        if let Some(record) = self.dead_vats.remove(&vat_id) {
            log::debug!("forgetting {vat_id}");
            self.forgotten.push(record);
        }
    }

    pub fn mark(&self) -> StateMark {
        StateMark {
            options: self.options.clone(),
            objects: self.objects.mark(),
            vats: self
                .vats
                .iter()
                .map(|(vat_id, vat)| (*vat_id, (vat.mark(), false)))
                .chain(
                    self.dead_vats
                        .iter()
                        .map(|(vat_id, vat)| (*vat_id, (vat.mark(), true))),
                )
                .collect(),
            forgotten: self.forgotten.len(),
            devices: self
                .devices
                .iter()
                .map(|(device_id, device)| (*device_id, device.clist.mark()))
                .collect(),
            vat_names: self.vat_names.clone(),
            device_names: self.device_names.clone(),
            terminated: self.terminated.len(),
            run_queue: self.run_queue.mark(),
            reap_queue: self.reap_queue.clone(),
            gc_actions: self.gc_actions.clone(),
            pinned: self.pinned.clone(),
            bootstrap_vat: self.bootstrap_vat,
            next_vat_id: self.next_vat_id,
            next_device_id: self.next_device_id,
            crank_number: self.crank_number,
        }
    }

    /// Return to `mark`. Vats created since are dropped, and vats
    /// terminated or forgotten since come back as they were.
    pub fn rollback(&mut self, mark: StateMark) {
        let StateMark {
            options,
            objects,
            mut vats,
            forgotten,
            devices,
            vat_names,
            device_names,
            terminated,
            run_queue,
            reap_queue,
            gc_actions,
            pinned,
            bootstrap_vat,
            next_vat_id,
            next_device_id,
            crank_number,
        } = mark;
        self.options = options;
        self.objects.rollback(objects);

        let mut records = std::mem::take(&mut self.vats);
        records.append(&mut self.dead_vats);
        while self.forgotten.len() > forgotten {
            if let Some(record) = self.forgotten.pop() {
                records.insert(record.vat_id, record);
            }
        }
        for (vat_id, mut record) in records {
            let Some((vat_mark, dead)) = vats.remove(&vat_id) else {
                continue;
            };
            record.rollback(vat_mark);
            if dead {
                self.dead_vats.insert(vat_id, record);
            } else {
                self.vats.insert(vat_id, record);
            }
        }

        self.devices.retain(|device_id, _| devices.contains_key(device_id));
        for (device_id, device) in &mut self.devices {
            if let Some(clist) = devices.get(device_id) {
                device.clist.rollback(*clist);
            }
        }
        self.vat_names = vat_names;
        self.device_names = device_names;
        self.terminated.truncate(terminated);
        self.run_queue.rollback(run_queue);
        self.reap_queue = reap_queue;
        self.gc_actions = gc_actions;
        self.pinned = pinned;
        self.bootstrap_vat = bootstrap_vat;
        self.next_vat_id = next_vat_id;
        self.next_device_id = next_device_id;
        self.crank_number = crank_number;
    }
}

/// Up to `limit` items, and whether more were left behind.
fn take_batch<T>(items: impl Iterator<Item = T>, limit: Option<u64>) -> (Vec<T>, bool) {
    let mut items = items.peekable();
    let batch: Vec<T> = match limit {
        Some(limit) => items.by_ref().take(limit as usize).collect(),
        None => items.by_ref().collect(),
    };
    (batch, items.peek().is_some())
}

/// The scalar parts of a `KernelState` and the journal positions of its
/// tables at a savepoint.
#[derive(Clone, Debug)]
pub struct StateMark {
    options: KernelOptions,
    objects: ObjectTableMark,
    vats: BTreeMap<VatId, (VatMark, bool)>,
    forgotten: usize,
    devices: BTreeMap<DeviceId, CListMark>,
    vat_names: IndexMap<String, VatId>,
    device_names: IndexMap<String, DeviceId>,
    terminated: usize,
    run_queue: QueueMark,
    reap_queue: BTreeSet<VatId>,
    gc_actions: BTreeSet<GcAction>,
    pinned: BTreeSet<KRef>,
    bootstrap_vat: Option<VatId>,
    next_vat_id: u64,
    next_device_id: u64,
    crank_number: u64,
}
