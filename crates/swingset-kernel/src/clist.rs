//! Per-vat translation between kernel slots and vat-local references.
//!
//! Each entry also carries a reachability flag. For imports the flag decides
//! whether the entry holds the reachable half of the object's count; for
//! exports it records whether the kernel still believes importers can reach
//! the object, which drives `dropExports`.

use crate::error::{KernelError, SyscallError};
use crate::ids::{DeviceId, KernelSlot, SlotKind, VatId, VatSlot};
use crate::journal::TrackedMap;
use crate::object_table::{ObjectTable, RefCountOpts};

pub const FIRST_IMPORT_OBJECT: u64 = 50;
pub const FIRST_IMPORT_PROMISE: u64 = 60;
pub const FIRST_IMPORT_DEVICE: u64 = 70;

/// Who a c-list belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Holder {
    Vat(VatId),
    Device(DeviceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CListEntry {
    pub vref: VatSlot,
    pub reachable: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct MapOpts {
    pub set_reachable: bool,
    /// Refuse to allocate a new entry.
    pub required: bool,
}

impl Default for MapOpts {
    fn default() -> Self {
        Self {
            set_reachable: true,
            required: false,
        }
    }
}

impl MapOpts {
    pub fn required() -> Self {
        Self {
            set_reachable: true,
            required: true,
        }
    }

    pub fn lookup_only() -> Self {
        Self {
            set_reachable: false,
            required: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CList {
    pub kernel_to_vat: TrackedMap<KernelSlot, CListEntry>,
    pub vat_to_kernel: TrackedMap<VatSlot, KernelSlot>,
    pub next_object: u64,
    pub next_promise: u64,
    pub next_device: u64,
}

impl Default for CList {
    fn default() -> Self {
        Self {
            kernel_to_vat: TrackedMap::new(),
            vat_to_kernel: TrackedMap::new(),
            next_object: FIRST_IMPORT_OBJECT,
            next_promise: FIRST_IMPORT_PROMISE,
            next_device: FIRST_IMPORT_DEVICE,
        }
    }
}

fn is_import_object(vref: &VatSlot) -> bool {
    vref.is_object() && !vref.allocated_by_vat
}

#[derive(Clone, Copy, Debug)]
pub struct CListMark {
    kernel_to_vat: usize,
    vat_to_kernel: usize,
    next_object: u64,
    next_promise: u64,
    next_device: u64,
}

impl CList {
    pub fn mark(&self) -> CListMark {
        CListMark {
            kernel_to_vat: self.kernel_to_vat.mark(),
            vat_to_kernel: self.vat_to_kernel.mark(),
            next_object: self.next_object,
            next_promise: self.next_promise,
            next_device: self.next_device,
        }
    }

    pub fn rollback(&mut self, mark: CListMark) {
        self.kernel_to_vat.rollback(mark.kernel_to_vat);
        self.vat_to_kernel.rollback(mark.vat_to_kernel);
        self.next_object = mark.next_object;
        self.next_promise = mark.next_promise;
        self.next_device = mark.next_device;
    }

    pub fn len(&self) -> usize {
        self.kernel_to_vat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernel_to_vat.is_empty()
    }

    pub fn entry(&self, slot: KernelSlot) -> Option<&CListEntry> {
        self.kernel_to_vat.get(&slot)
    }

    pub fn has_kernel_slot(&self, slot: KernelSlot) -> bool {
        self.kernel_to_vat.contains_key(&slot)
    }

    pub fn kernel_slot(&self, vref: &VatSlot) -> Option<KernelSlot> {
        self.vat_to_kernel.get(vref).copied()
    }

    pub fn vref(&self, slot: KernelSlot) -> Option<VatSlot> {
        self.kernel_to_vat.get(&slot).map(|entry| entry.vref)
    }

    pub fn reachable_flag(&self, slot: KernelSlot) -> bool {
        self.kernel_to_vat
            .get(&slot)
            .is_some_and(|entry| entry.reachable)
    }

    fn insert(&mut self, slot: KernelSlot, vref: VatSlot) {
        self.kernel_to_vat.insert(
            slot,
            CListEntry {
                vref,
                reachable: false,
            },
        );
        self.vat_to_kernel.insert(vref, slot);
    }

    /// Translate a reference emitted by the holder, allocating kernel
    /// identities for fresh exports.
    pub fn map_vat_to_kernel(
        &mut self,
        holder: Holder,
        vref: VatSlot,
        objects: &mut ObjectTable,
        opts: MapOpts,
    ) -> Result<KernelSlot, KernelError> {
        if let Some(slot) = self.kernel_slot(&vref) {
            if opts.set_reachable && vref.is_object() {
                if vref.allocated_by_vat {
                    self.set_reachable_flag(slot, objects)?;
                } else if !self.reachable_flag(slot) {
                    return Err(SyscallError::UnreachableImport(vref).into());
                }
            }
            return Ok(slot);
        }
        if !vref.allocated_by_vat || opts.required {
            return Err(SyscallError::UnknownVref(vref).into());
        }
        let slot = match (vref.kind, holder) {
            (SlotKind::Object, Holder::Vat(vat_id)) => KernelSlot::Object(objects.add_object(Some(vat_id))),
            (SlotKind::Promise, Holder::Vat(vat_id)) => {
                KernelSlot::Promise(objects.add_promise_for_vat(vat_id))
            }
            (SlotKind::Device, Holder::Vat(_)) => return Err(SyscallError::DeviceExport(vref).into()),
            (SlotKind::Device, Holder::Device(device_id)) => {
                KernelSlot::Device(objects.add_device_node(device_id))
            }
            (_, Holder::Device(_)) => {
                return Err(SyscallError::WrongKind {
                    vref,
                    expected: "a device node",
                }
                .into());
            }
        };
        self.insert(slot, vref);
        objects.increment_ref_count(slot, "clist-export", RefCountOpts::export())?;
        if opts.set_reachable {
            self.set_reachable_flag(slot, objects)?;
        }
        Ok(slot)
    }

    /// Translate a kernel slot for delivery to the holder, allocating an
    /// import entry on first sight.
    pub fn map_kernel_to_vat(
        &mut self,
        slot: KernelSlot,
        objects: &mut ObjectTable,
        opts: MapOpts,
    ) -> Result<VatSlot, KernelError> {
        if let Some(entry) = self.kernel_to_vat.get(&slot) {
            let vref = entry.vref;
            if opts.set_reachable {
                self.set_reachable_flag(slot, objects)?;
            }
            return Ok(vref);
        }
        if opts.required {
            return Err(KernelError::UnknownSlot(slot));
        }
        let vref = match slot {
            KernelSlot::Object(_) => {
                let id = self.next_object;
                self.next_object += 1;
                VatSlot::import(SlotKind::Object, id)
            }
            KernelSlot::Promise(_) => {
                let id = self.next_promise;
                self.next_promise += 1;
                VatSlot::import(SlotKind::Promise, id)
            }
            KernelSlot::Device(_) => {
                let id = self.next_device;
                self.next_device += 1;
                VatSlot::import(SlotKind::Device, id)
            }
        };
        objects.increment_ref_count(slot, "clist-import", RefCountOpts::recognizable())?;
        self.insert(slot, vref);
        if opts.set_reachable {
            self.set_reachable_flag(slot, objects)?;
        }
        Ok(vref)
    }

    pub fn set_reachable_flag(
        &mut self,
        slot: KernelSlot,
        objects: &mut ObjectTable,
    ) -> Result<(), KernelError> {
        let Some(entry) = self.kernel_to_vat.get_mut(&slot) else {
            return Err(KernelError::UnknownSlot(slot));
        };
        if entry.reachable {
            return Ok(());
        }
        entry.reachable = true;
        if let (true, KernelSlot::Object(kref)) = (is_import_object(&entry.vref), slot) {
            objects.adjust_reachable(kref, true)?;
        }
        Ok(())
    }

    pub fn clear_reachable_flag(
        &mut self,
        slot: KernelSlot,
        objects: &mut ObjectTable,
    ) -> Result<(), KernelError> {
        let Some(entry) = self.kernel_to_vat.get_mut(&slot) else {
            return Ok(());
        };
        if !entry.reachable {
            return Ok(());
        }
        entry.reachable = false;
        if let (true, KernelSlot::Object(kref)) = (is_import_object(&entry.vref), slot) {
            objects.adjust_reachable(kref, false)?;
        }
        Ok(())
    }

    /// Remove an entry and release whatever count it held. Missing entries
    /// are ignored.
    pub fn delete_entry(
        &mut self,
        slot: KernelSlot,
        objects: &mut ObjectTable,
    ) -> Result<Option<VatSlot>, KernelError> {
        let Some(entry) = self.kernel_to_vat.remove(&slot) else {
            return Ok(None);
        };
        self.vat_to_kernel.remove(&entry.vref);
        let opts = if entry.reachable && is_import_object(&entry.vref) {
            RefCountOpts::default()
        } else {
            RefCountOpts {
                is_export: entry.vref.allocated_by_vat,
                only_recognizable: true,
            }
        };
        objects.decrement_ref_count(slot, "clist-delete", opts)?;
        Ok(Some(entry.vref))
    }

    /// Imported object slots, in kernel order.
    pub fn imports(&self) -> impl Iterator<Item = KernelSlot> + '_ {
        self.kernel_to_vat
            .iter()
            .filter(|(_, entry)| is_import_object(&entry.vref))
            .map(|(slot, _)| *slot)
    }

    /// Object slots this holder exports.
    pub fn exports(&self) -> impl Iterator<Item = (KernelSlot, VatSlot)> + '_ {
        self.kernel_to_vat
            .iter()
            .filter(|(_, entry)| entry.vref.is_object() && entry.vref.allocated_by_vat)
            .map(|(slot, entry)| (*slot, entry.vref))
    }

    pub fn promises(&self) -> impl Iterator<Item = KernelSlot> + '_ {
        self.kernel_to_vat
            .keys()
            .filter(|slot| slot.kind() == SlotKind::Promise)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::KRef;

    #[test]
    fn exports_allocate_owned_objects() {
        let mut objects = ObjectTable::default();
        let mut clist = CList::default();
        let slot = clist
            .map_vat_to_kernel(Holder::Vat(VatId(1)), VatSlot::export(3), &mut objects, MapOpts::default())
            .unwrap();
        let kref = slot.as_object().unwrap();
        assert_eq!(objects.owner_of(kref), Some(VatId(1)));
        assert!(clist.reachable_flag(slot));
        let record = objects.object(kref).unwrap();
        assert_eq!((record.reachable, record.recognizable), (0, 0));

        let again = clist
            .map_vat_to_kernel(Holder::Vat(VatId(1)), VatSlot::export(3), &mut objects, MapOpts::default())
            .unwrap();
        assert_eq!(again, slot);
    }

    #[test]
    fn imports_count_recognizable_then_reachable() {
        let mut objects = ObjectTable::default();
        let kref = objects.add_object(Some(VatId(1)));
        let mut clist = CList::default();

        let vref = clist
            .map_kernel_to_vat(kref.into(), &mut objects, MapOpts { set_reachable: false, required: false })
            .unwrap();
        assert_eq!(vref.to_string(), "o-50");
        assert_eq!(objects.object(kref).unwrap().recognizable, 1);
        assert_eq!(objects.object(kref).unwrap().reachable, 0);

        clist.set_reachable_flag(kref.into(), &mut objects).unwrap();
        assert_eq!(objects.object(kref).unwrap().reachable, 1);

        clist.clear_reachable_flag(kref.into(), &mut objects).unwrap();
        assert_eq!(objects.object(kref).unwrap().reachable, 0);
        assert!(objects.maybe_free.contains(&KernelSlot::Object(kref)));

        clist.delete_entry(kref.into(), &mut objects).unwrap();
        assert_eq!(objects.object(kref).unwrap().recognizable, 0);
        assert!(clist.is_empty());
    }

    #[test]
    fn unreachable_imports_cannot_be_used() {
        let mut objects = ObjectTable::default();
        let kref = objects.add_object(Some(VatId(1)));
        let mut clist = CList::default();
        let vref = clist
            .map_kernel_to_vat(kref.into(), &mut objects, MapOpts::default())
            .unwrap();
        clist.clear_reachable_flag(kref.into(), &mut objects).unwrap();
        let err = clist
            .map_vat_to_kernel(Holder::Vat(VatId(2)), vref, &mut objects, MapOpts::default())
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::IllegalSyscall(SyscallError::UnreachableImport(_))
        ));
    }

    #[test]
    fn vats_cannot_forge_imports_or_export_devices() {
        let mut objects = ObjectTable::default();
        let mut clist = CList::default();
        let forged = VatSlot::import(SlotKind::Object, 99);
        assert!(matches!(
            clist.map_vat_to_kernel(Holder::Vat(VatId(1)), forged, &mut objects, MapOpts::default()),
            Err(KernelError::IllegalSyscall(SyscallError::UnknownVref(_)))
        ));
        let device_export: VatSlot = "d+1".parse().unwrap();
        assert!(matches!(
            clist.map_vat_to_kernel(Holder::Vat(VatId(1)), device_export, &mut objects, MapOpts::default()),
            Err(KernelError::IllegalSyscall(SyscallError::DeviceExport(_)))
        ));
    }

    #[test]
    fn rollback_reuses_import_numbers() {
        let mut objects = ObjectTable::default();
        let first = objects.add_object(Some(VatId(1)));
        let second = objects.add_object(Some(VatId(1)));
        let mut clist = CList::default();
        clist
            .map_kernel_to_vat(first.into(), &mut objects, MapOpts::default())
            .unwrap();
        let mark = clist.mark();
        let vref = clist
            .map_kernel_to_vat(second.into(), &mut objects, MapOpts::default())
            .unwrap();
        clist.rollback(mark);
        assert!(!clist.has_kernel_slot(second.into()));
        assert_eq!(clist.kernel_slot(&vref), None);
        assert_eq!(clist.len(), 1);
        assert_eq!(
            clist
                .map_kernel_to_vat(second.into(), &mut objects, MapOpts::default())
                .unwrap(),
            vref
        );
    }

    #[test]
    fn promise_entries_hold_a_single_count() {
        let mut objects = ObjectTable::default();
        let mut clist = CList::default();
        let slot = clist
            .map_vat_to_kernel(Holder::Vat(VatId(2)), VatSlot::promise(1), &mut objects, MapOpts::default())
            .unwrap();
        let kpid = slot.as_promise().unwrap();
        assert_eq!(objects.promise(kpid).unwrap().refcount, 1);
        assert_eq!(objects.promise(kpid).unwrap().state.decider(), Some(VatId(2)));
        clist.delete_entry(slot, &mut objects).unwrap();
        assert_eq!(objects.promise(kpid).unwrap().refcount, 0);
        assert_eq!(clist.delete_entry(KRef(20).into(), &mut objects).unwrap(), None);
    }
}
