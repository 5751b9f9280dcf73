//! Refcount processing and the GC action set.
//!
//! Counts that touch zero during a crank are collected in
//! `ObjectTable::maybe_free`; at the end of the crank `process_refcounts`
//! turns them into promise deletions, object deletions or GC actions for the
//! owning vat. GC actions are delivered ahead of ordinary traffic, one group
//! per crank, after dropping any that later activity has made obsolete.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::ids::{KRef, KernelSlot, ParseRefError, VatId};
use crate::run_queue::RunQueueEvent;
use crate::state::KernelState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcActionKind {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }
}

/// `v1 dropExport ko20`. Ordered by vat, then kind, then kref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GcAction {
    pub vat_id: VatId,
    pub kind: GcActionKind,
    pub kref: KRef,
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat_id, self.kind.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(' ');
        let (Some(vat), Some(kind), Some(kref), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseRefError::new("GcAction", s));
        };
        let kind = match kind {
            "dropExport" => GcActionKind::DropExport,
            "retireExport" => GcActionKind::RetireExport,
            "retireImport" => GcActionKind::RetireImport,
            _ => return Err(ParseRefError::new("GcAction", s)),
        };
        Ok(GcAction {
            vat_id: vat.parse()?,
            kind,
            kref: kref.parse()?,
        })
    }
}

impl TryFrom<String> for GcAction {
    type Error = ParseRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GcAction> for String {
    fn from(value: GcAction) -> Self {
        value.to_string()
    }
}

impl KernelState {
    /// Drain `maybe_free`, deleting dead promises and objects and queueing GC
    /// actions for owners. Deleting a promise can free more slots, so this
    /// loops until nothing is left.
    pub fn process_refcounts(&mut self) -> Result<(), KernelError> {
        while let Some(slot) = self.objects.maybe_free.pop_first() {
            match slot {
                KernelSlot::Promise(kpid) => {
                    let Some(record) = self.objects.promise(kpid) else {
                        continue;
                    };
                    if record.refcount > 0 {
                        continue;
                    }
                    let held = record.held_slots();
                    log::debug!("deleting promise {kpid}");
                    self.objects.promises.remove(&kpid);
                    self.objects.decrement_all(held, "promise-delete")?;
                }
                KernelSlot::Object(kref) => {
                    let Some(record) = self.objects.object(kref) else {
                        continue;
                    };
                    if record.reachable > 0 {
                        continue;
                    }
                    let recognizable = record.recognizable;
                    match record.owner {
                        Some(owner) if self.dead_vats.contains_key(&owner) => {
                            // nobody is left to hear dropExports
                            let KernelState {
                                dead_vats, objects, ..
                            } = self;
                            if let Some(vat) = dead_vats.get_mut(&owner) {
                                vat.clist.delete_entry(slot, objects)?;
                            }
                            self.objects.orphan_object(kref);
                        }
                        Some(owner) => {
                            let Some(vat) = self.vats.get(&owner) else {
                                continue;
                            };
                            if vat.clist.reachable_flag(slot) {
                                self.add_gc_action(owner, GcActionKind::DropExport, kref);
                            }
                            if recognizable == 0 {
                                self.add_gc_action(owner, GcActionKind::RetireExport, kref);
                            }
                        }
                        None if recognizable == 0 => {
                            log::debug!("deleting orphaned {kref}");
                            self.objects.delete_object(kref);
                        }
                        None => self.retire_kernel_objects(&[kref]),
                    }
                }
                KernelSlot::Device(_) => {}
            }
        }
        Ok(())
    }

    pub fn add_gc_action(&mut self, vat_id: VatId, kind: GcActionKind, kref: KRef) {
        self.gc_actions.insert(GcAction { vat_id, kind, kref });
    }

    /// Tell every importer to retire its entry, then forget the objects.
    pub fn retire_kernel_objects(&mut self, krefs: &[KRef]) {
        for &kref in krefs {
            let slot = KernelSlot::Object(kref);
            let importers: Vec<VatId> = self
                .vats
                .iter()
                .filter(|(_, vat)| {
                    vat.clist
                        .entry(slot)
                        .is_some_and(|entry| !entry.vref.allocated_by_vat)
                })
                .map(|(vat_id, _)| *vat_id)
                .collect();
            for vat_id in importers {
                self.add_gc_action(vat_id, GcActionKind::RetireImport, kref);
            }
            log::debug!("retiring {kref}");
            self.objects.delete_object(kref);
        }
    }

    fn gc_action_still_valid(&self, action: &GcAction) -> bool {
        let slot = KernelSlot::Object(action.kref);
        let Some(vat) = self.vats.get(&action.vat_id) else {
            return false;
        };
        match action.kind {
            GcActionKind::DropExport => {
                self.objects
                    .object(action.kref)
                    .is_some_and(|record| record.reachable == 0)
                    && vat.clist.reachable_flag(slot)
            }
            GcActionKind::RetireExport => {
                self.objects
                    .object(action.kref)
                    .is_some_and(|record| record.reachable == 0 && record.recognizable == 0)
                    && vat.clist.has_kernel_slot(slot)
            }
            GcActionKind::RetireImport => vat.clist.has_kernel_slot(slot),
        }
    }

    /// Take the first live group of GC actions (one vat, one kind) as a
    /// delivery event. Actions negated by later activity are discarded.
    pub fn next_gc_action_event(&mut self) -> Option<RunQueueEvent> {
        let mut group: Option<(VatId, GcActionKind)> = None;
        let mut krefs = Vec::new();
        let mut consumed = Vec::new();
        for action in &self.gc_actions {
            if let Some((vat_id, kind)) = group {
                if (vat_id, kind) != (action.vat_id, action.kind) {
                    break;
                }
            }
            consumed.push(*action);
            if self.gc_action_still_valid(action) {
                group = Some((action.vat_id, action.kind));
                krefs.push(action.kref);
            } else {
                log::debug!("dropping negated gc action {action}");
            }
        }
        for action in &consumed {
            self.gc_actions.remove(action);
        }
        let (vat_id, kind) = group?;
        Some(match kind {
            GcActionKind::DropExport => RunQueueEvent::DropExports { vat_id, krefs },
            GcActionKind::RetireExport => RunQueueEvent::RetireExports { vat_id, krefs },
            GcActionKind::RetireImport => RunQueueEvent::RetireImports { vat_id, krefs },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_sort_by_vat_then_kind() {
        let actions: std::collections::BTreeSet<GcAction> = [
            "v2 dropExport ko20",
            "v1 retireImport ko21",
            "v1 dropExport ko22",
            "v1 retireExport ko20",
        ]
        .into_iter()
        .map(|s| s.parse().unwrap())
        .collect();
        let ordered: Vec<String> = actions.iter().map(ToString::to_string).collect();
        assert_eq!(
            ordered,
            vec![
                "v1 dropExport ko22",
                "v1 retireExport ko20",
                "v1 retireImport ko21",
                "v2 dropExport ko20",
            ]
        );
    }

    #[test]
    fn malformed_actions_are_rejected() {
        assert!("v1 dropExport".parse::<GcAction>().is_err());
        assert!("v1 explode ko20".parse::<GcAction>().is_err());
        assert!("v1 dropExport ko20 extra".parse::<GcAction>().is_err());
    }
}
