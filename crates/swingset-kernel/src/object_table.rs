//! Kernel object and promise records with their reference counts.
//!
//! Objects carry a `(reachable, recognizable)` pair; the owner's export entry
//! never contributes to it. Promises carry a single count covering c-list
//! entries, queued events and resolution data that mention them.

use std::collections::BTreeSet;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, Message};
use crate::error::KernelError;
use crate::ids::{DeviceId, KDevice, KPid, KRef, KernelSlot, VatId};
use crate::journal::TrackedMap;

pub const FIRST_OBJECT_ID: u64 = 20;
pub const FIRST_PROMISE_ID: u64 = 40;
pub const FIRST_DEVICE_NODE_ID: u64 = 30;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// `None` once the exporting vat has abandoned or lost the object.
    pub owner: Option<VatId>,
    pub reachable: u64,
    pub recognizable: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseState {
    Unresolved {
        decider: Option<VatId>,
        subscribers: IndexSet<VatId>,
        queue: Vec<Message>,
    },
    Fulfilled(CapData<KernelSlot>),
    Rejected(CapData<KernelSlot>),
}

impl PromiseState {
    pub fn unresolved(decider: Option<VatId>) -> Self {
        PromiseState::Unresolved {
            decider,
            subscribers: IndexSet::new(),
            queue: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, PromiseState::Unresolved { .. })
    }

    pub fn decider(&self) -> Option<VatId> {
        match self {
            PromiseState::Unresolved { decider, .. } => *decider,
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PromiseState::Unresolved { .. } => "unresolved",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        }
    }
}

/// What the kernel does when a host-originated result promise settles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultPolicy {
    #[default]
    Ignore,
    LogAlways,
    LogFailure,
    /// A rejection panics the kernel.
    Panic,
}

impl ResultPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultPolicy::Ignore => "ignore",
            ResultPolicy::LogAlways => "logAlways",
            ResultPolicy::LogFailure => "logFailure",
            ResultPolicy::Panic => "panic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(ResultPolicy::Ignore),
            "logAlways" => Some(ResultPolicy::LogAlways),
            "logFailure" => Some(ResultPolicy::LogFailure),
            "panic" => Some(ResultPolicy::Panic),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromiseRecord {
    pub state: PromiseState,
    pub refcount: u64,
    pub policy: ResultPolicy,
    /// The host holds one count until it reads the resolution.
    pub held_by_host: bool,
}

impl PromiseRecord {
    /// Every kernel slot this promise holds a count on.
    pub fn held_slots(&self) -> Vec<KernelSlot> {
        match &self.state {
            PromiseState::Unresolved { queue, .. } => queue.iter().flat_map(Message::slots).collect(),
            PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => data.slots.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RefCountOpts {
    /// The reference is the owner's own export entry.
    pub is_export: bool,
    /// Only the recognizable half of an object count moves.
    pub only_recognizable: bool,
}

impl RefCountOpts {
    pub fn export() -> Self {
        Self {
            is_export: true,
            only_recognizable: false,
        }
    }

    pub fn recognizable() -> Self {
        Self {
            is_export: false,
            only_recognizable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTable {
    pub objects: TrackedMap<KRef, ObjectRecord>,
    pub promises: TrackedMap<KPid, PromiseRecord>,
    pub device_nodes: TrackedMap<KDevice, DeviceId>,
    pub next_object: u64,
    pub next_promise: u64,
    pub next_device_node: u64,
    /// Slots whose counts touched zero since the last refcount pass.
    pub maybe_free: BTreeSet<KernelSlot>,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self {
            objects: TrackedMap::new(),
            promises: TrackedMap::new(),
            device_nodes: TrackedMap::new(),
            next_object: FIRST_OBJECT_ID,
            next_promise: FIRST_PROMISE_ID,
            next_device_node: FIRST_DEVICE_NODE_ID,
            maybe_free: BTreeSet::new(),
        }
    }
}

/// Where an `ObjectTable` stood at a savepoint.
#[derive(Clone, Debug)]
pub struct ObjectTableMark {
    objects: usize,
    promises: usize,
    device_nodes: usize,
    next_object: u64,
    next_promise: u64,
    next_device_node: u64,
    maybe_free: BTreeSet<KernelSlot>,
}

impl ObjectTable {
    pub fn mark(&self) -> ObjectTableMark {
        ObjectTableMark {
            objects: self.objects.mark(),
            promises: self.promises.mark(),
            device_nodes: self.device_nodes.mark(),
            next_object: self.next_object,
            next_promise: self.next_promise,
            next_device_node: self.next_device_node,
            maybe_free: self.maybe_free.clone(),
        }
    }

    pub fn rollback(&mut self, mark: ObjectTableMark) {
        self.objects.rollback(mark.objects);
        self.promises.rollback(mark.promises);
        self.device_nodes.rollback(mark.device_nodes);
        self.next_object = mark.next_object;
        self.next_promise = mark.next_promise;
        self.next_device_node = mark.next_device_node;
        self.maybe_free = mark.maybe_free;
    }

    /// Take a count on behalf of the host, once per promise.
    pub fn hold_for_host(&mut self, kpid: KPid) -> Result<(), KernelError> {
        let record = self.promise_mut(kpid)?;
        if record.held_by_host {
            return Ok(());
        }
        record.held_by_host = true;
        self.increment_ref_count(kpid.into(), "external", RefCountOpts::default())
    }

    /// Drop the host's count, if it still holds one.
    pub fn release_host_hold(&mut self, kpid: KPid) -> Result<(), KernelError> {
        let record = self.promise_mut(kpid)?;
        if !record.held_by_host {
            return Ok(());
        }
        record.held_by_host = false;
        self.decrement_ref_count(kpid.into(), "external", RefCountOpts::default())?;
        Ok(())
    }

    pub fn add_object(&mut self, owner: Option<VatId>) -> KRef {
        let kref = KRef(self.next_object);
        self.next_object += 1;
        self.objects.insert(
            kref,
            ObjectRecord {
                owner,
                reachable: 0,
                recognizable: 0,
            },
        );
        kref
    }

    /// A promise decided by the kernel itself until it is sent somewhere.
    pub fn add_promise(&mut self, policy: ResultPolicy) -> KPid {
        self.insert_promise(None, policy)
    }

    pub fn add_promise_for_vat(&mut self, decider: VatId) -> KPid {
        self.insert_promise(Some(decider), ResultPolicy::Ignore)
    }

    fn insert_promise(&mut self, decider: Option<VatId>, policy: ResultPolicy) -> KPid {
        let kpid = KPid(self.next_promise);
        self.next_promise += 1;
        self.promises.insert(
            kpid,
            PromiseRecord {
                state: PromiseState::unresolved(decider),
                refcount: 0,
                policy,
                held_by_host: false,
            },
        );
        kpid
    }

    pub fn add_device_node(&mut self, owner: DeviceId) -> KDevice {
        let node = KDevice(self.next_device_node);
        self.next_device_node += 1;
        self.device_nodes.insert(node, owner);
        node
    }

    pub fn object(&self, kref: KRef) -> Option<&ObjectRecord> {
        self.objects.get(&kref)
    }

    pub fn object_exists(&self, kref: KRef) -> bool {
        self.objects.contains_key(&kref)
    }

    pub fn owner_of(&self, kref: KRef) -> Option<VatId> {
        self.objects.get(&kref).and_then(|record| record.owner)
    }

    pub fn promise(&self, kpid: KPid) -> Option<&PromiseRecord> {
        self.promises.get(&kpid)
    }

    pub fn promise_mut(&mut self, kpid: KPid) -> Result<&mut PromiseRecord, KernelError> {
        self.promises
            .get_mut(&kpid)
            .ok_or(KernelError::UnknownPromise(kpid))
    }

    pub fn delete_object(&mut self, kref: KRef) {
        self.objects.remove(&kref);
        self.maybe_free.remove(&KernelSlot::Object(kref));
    }

    pub fn orphan_object(&mut self, kref: KRef) {
        if let Some(record) = self.objects.get_mut(&kref) {
            record.owner = None;
            self.maybe_free.insert(KernelSlot::Object(kref));
        }
    }

    pub fn increment_ref_count(
        &mut self,
        slot: KernelSlot,
        tag: &str,
        opts: RefCountOpts,
    ) -> Result<(), KernelError> {
        match slot {
            KernelSlot::Promise(kpid) => {
                let record = self.promises.get_mut(&kpid).ok_or_else(|| {
                    KernelError::invariant(format!("{tag}: increment of unknown promise {kpid}"))
                })?;
                record.refcount += 1;
            }
            KernelSlot::Object(kref) => {
                if opts.is_export {
                    return Ok(());
                }
                let record = self.objects.get_mut(&kref).ok_or_else(|| {
                    KernelError::invariant(format!("{tag}: increment of retired object {kref}"))
                })?;
                if !opts.only_recognizable {
                    record.reachable += 1;
                }
                record.recognizable += 1;
            }
            // device nodes do not participate in GC
            KernelSlot::Device(_) => {}
        }
        Ok(())
    }

    /// Returns whether the count reached zero. Objects that were already
    /// retired are ignored, since duplicate drop notices are expected.
    pub fn decrement_ref_count(
        &mut self,
        slot: KernelSlot,
        tag: &str,
        opts: RefCountOpts,
    ) -> Result<bool, KernelError> {
        let underflow = || KernelError::RefCountUnderflow {
            slot,
            tag: tag.to_string(),
        };
        match slot {
            KernelSlot::Promise(kpid) => {
                let record = self.promises.get_mut(&kpid).ok_or_else(underflow)?;
                record.refcount = record.refcount.checked_sub(1).ok_or_else(underflow)?;
                if record.refcount == 0 {
                    self.maybe_free.insert(slot);
                    return Ok(true);
                }
                Ok(false)
            }
            KernelSlot::Object(kref) => {
                if opts.is_export {
                    return Ok(false);
                }
                let Some(record) = self.objects.get_mut(&kref) else {
                    return Ok(false);
                };
                if !opts.only_recognizable {
                    record.reachable = record.reachable.checked_sub(1).ok_or_else(underflow)?;
                }
                record.recognizable = record.recognizable.checked_sub(1).ok_or_else(underflow)?;
                if record.reachable > record.recognizable {
                    return Err(KernelError::RefCountMismatch {
                        kref,
                        reachable: record.reachable,
                        recognizable: record.recognizable,
                    });
                }
                let freed = record.reachable == 0 || record.recognizable == 0;
                if freed {
                    self.maybe_free.insert(slot);
                }
                Ok(freed)
            }
            KernelSlot::Device(_) => Ok(false),
        }
    }

    /// Move only the reachable half of an import's count, for c-list
    /// reachability flag changes.
    pub fn adjust_reachable(&mut self, kref: KRef, increment: bool) -> Result<(), KernelError> {
        let Some(record) = self.objects.get_mut(&kref) else {
            return Ok(());
        };
        if increment {
            record.reachable += 1;
            if record.reachable > record.recognizable {
                return Err(KernelError::RefCountMismatch {
                    kref,
                    reachable: record.reachable,
                    recognizable: record.recognizable,
                });
            }
        } else {
            record.reachable = record
                .reachable
                .checked_sub(1)
                .ok_or_else(|| KernelError::RefCountUnderflow {
                    slot: KernelSlot::Object(kref),
                    tag: "clist-reachable".into(),
                })?;
            if record.reachable == 0 {
                self.maybe_free.insert(KernelSlot::Object(kref));
            }
        }
        Ok(())
    }

    pub fn increment_all(
        &mut self,
        slots: impl IntoIterator<Item = KernelSlot>,
        tag: &str,
    ) -> Result<(), KernelError> {
        for slot in slots {
            self.increment_ref_count(slot, tag, RefCountOpts::default())?;
        }
        Ok(())
    }

    pub fn decrement_all(
        &mut self,
        slots: impl IntoIterator<Item = KernelSlot>,
        tag: &str,
    ) -> Result<(), KernelError> {
        for slot in slots {
            self.decrement_ref_count(slot, tag, RefCountOpts::default())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_start_at_kernel_numbering() {
        let mut table = ObjectTable::default();
        assert_eq!(table.add_object(Some(VatId(1))), KRef(20));
        assert_eq!(table.add_promise(ResultPolicy::Ignore), KPid(40));
        assert_eq!(table.add_device_node(DeviceId(7)), KDevice(30));
        assert_eq!(table.add_object(None), KRef(21));
    }

    #[test]
    fn exports_do_not_count() {
        let mut table = ObjectTable::default();
        let kref = table.add_object(Some(VatId(1)));
        table
            .increment_ref_count(kref.into(), "clist", RefCountOpts::export())
            .unwrap();
        assert_eq!(table.object(kref).unwrap().recognizable, 0);

        table
            .increment_ref_count(kref.into(), "queue", RefCountOpts::default())
            .unwrap();
        let freed = table
            .decrement_ref_count(kref.into(), "queue", RefCountOpts::default())
            .unwrap();
        assert!(freed);
        assert!(table.maybe_free.contains(&KernelSlot::Object(kref)));
    }

    #[test]
    fn underflow_is_an_error_not_a_clamp() {
        let mut table = ObjectTable::default();
        let kpid = table.add_promise(ResultPolicy::Ignore);
        let err = table
            .decrement_ref_count(kpid.into(), "queue", RefCountOpts::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::RefCountUnderflow { .. }));
        assert!(err.is_fatal());

        let kref = table.add_object(Some(VatId(1)));
        let err = table
            .decrement_ref_count(kref.into(), "queue", RefCountOpts::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::RefCountUnderflow { .. }));
    }

    #[test]
    fn reachable_may_not_exceed_recognizable() {
        let mut table = ObjectTable::default();
        let kref = table.add_object(Some(VatId(1)));
        table
            .increment_ref_count(kref.into(), "clist", RefCountOpts::recognizable())
            .unwrap();
        table.adjust_reachable(kref, true).unwrap();
        let err = table.adjust_reachable(kref, true).unwrap_err();
        assert!(matches!(err, KernelError::RefCountMismatch { .. }));
    }

    #[test]
    fn retired_objects_ignore_late_decrements() {
        let mut table = ObjectTable::default();
        let kref = table.add_object(Some(VatId(1)));
        table.delete_object(kref);
        let freed = table
            .decrement_ref_count(kref.into(), "clist", RefCountOpts::recognizable())
            .unwrap();
        assert!(!freed);
        assert!(
            table
                .increment_ref_count(kref.into(), "queue", RefCountOpts::default())
                .is_err()
        );
    }

    #[test]
    fn host_holds_count_once_and_release_once() {
        let mut table = ObjectTable::default();
        let kpid = table.add_promise(ResultPolicy::Ignore);
        table.hold_for_host(kpid).unwrap();
        table.hold_for_host(kpid).unwrap();
        assert_eq!(table.promise(kpid).unwrap().refcount, 1);

        table.release_host_hold(kpid).unwrap();
        table.release_host_hold(kpid).unwrap();
        assert_eq!(table.promise(kpid).unwrap().refcount, 0);
        assert!(table.maybe_free.contains(&KernelSlot::Promise(kpid)));
    }

    #[test]
    fn rollback_forgets_allocations_since_the_mark() {
        let mut table = ObjectTable::default();
        let kept = table.add_object(Some(VatId(1)));
        let mark = table.mark();
        let dropped = table.add_object(Some(VatId(1)));
        table
            .increment_ref_count(kept.into(), "queue", RefCountOpts::default())
            .unwrap();
        table.rollback(mark);
        assert!(!table.object_exists(dropped));
        assert_eq!(table.object(kept).unwrap().reachable, 0);
        assert_eq!(table.add_object(None), dropped);
    }

    #[test]
    fn result_policies_parse_their_names() {
        for policy in [
            ResultPolicy::Ignore,
            ResultPolicy::LogAlways,
            ResultPolicy::LogFailure,
            ResultPolicy::Panic,
        ] {
            assert_eq!(ResultPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(ResultPolicy::parse("none"), None);
    }
}
