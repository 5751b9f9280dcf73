//! Debug introspection of the kernel tables.

use serde::Serialize;

use crate::ids::{KPid, KRef, KernelSlot, VatId, VatSlot};
use crate::object_table::PromiseState;
use crate::run_queue::RunQueueEvent;
use crate::state::{KernelState, VatLifecycle};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelTableRow {
    pub kernel_slot: KernelSlot,
    /// Vat or device holding the entry.
    pub holder: String,
    pub vref: VatSlot,
    pub reachable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRow {
    pub kref: KRef,
    pub owner: Option<VatId>,
    pub reachable: u64,
    pub recognizable: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseRow {
    pub kpid: KPid,
    pub state: &'static str,
    pub refcount: u64,
    pub decider: Option<VatId>,
    pub subscribers: Vec<VatId>,
    pub queued: usize,
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatRow {
    pub vat_id: VatId,
    pub name: Option<String>,
    pub lifecycle: VatLifecycle,
    pub incarnation: u64,
    pub transcript_start: u64,
    pub transcript_end: u64,
    pub vatstore_keys: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelDump {
    pub crank_number: u64,
    pub kernel_table: Vec<KernelTableRow>,
    pub objects: Vec<ObjectRow>,
    pub promises: Vec<PromiseRow>,
    pub gc_actions: Vec<String>,
    pub reap_queue: Vec<VatId>,
    pub run_queue: Vec<RunQueueEvent>,
    pub vats: Vec<VatRow>,
    pub terminated: Vec<VatId>,
    /// Terminated vats whose c-lists and vatstores are not yet released.
    pub awaiting_cleanup: Vec<VatId>,
    pub pinned: Vec<KRef>,
}

impl KernelDump {
    /// Whether any c-list row still names `slot`.
    pub fn mentions(&self, slot: KernelSlot) -> bool {
        self.kernel_table.iter().any(|row| row.kernel_slot == slot)
    }
}

impl KernelState {
    pub fn dump(&self) -> KernelDump {
        let mut kernel_table = Vec::new();
        for (vat_id, vat) in self.vats.iter().chain(&self.dead_vats) {
            for (slot, entry) in &vat.clist.kernel_to_vat {
                kernel_table.push(KernelTableRow {
                    kernel_slot: *slot,
                    holder: vat_id.to_string(),
                    vref: entry.vref,
                    reachable: entry.reachable,
                });
            }
        }
        for (device_id, device) in &self.devices {
            for (slot, entry) in &device.clist.kernel_to_vat {
                kernel_table.push(KernelTableRow {
                    kernel_slot: *slot,
                    holder: device_id.to_string(),
                    vref: entry.vref,
                    reachable: entry.reachable,
                });
            }
        }

        let objects = self
            .objects
            .objects
            .iter()
            .map(|(kref, record)| ObjectRow {
                kref: *kref,
                owner: record.owner,
                reachable: record.reachable,
                recognizable: record.recognizable,
            })
            .collect();

        let promises = self
            .objects
            .promises
            .iter()
            .map(|(kpid, record)| {
                let (subscribers, queued, data) = match &record.state {
                    PromiseState::Unresolved {
                        subscribers, queue, ..
                    } => (subscribers.iter().copied().collect(), queue.len(), None),
                    PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => {
                        (Vec::new(), 0, Some(data.body.clone()))
                    }
                };
                PromiseRow {
                    kpid: *kpid,
                    state: record.state.label(),
                    refcount: record.refcount,
                    decider: record.state.decider(),
                    subscribers,
                    queued,
                    data,
                }
            })
            .collect();

        let vats = self
            .vats
            .values()
            .map(|vat| VatRow {
                vat_id: vat.vat_id,
                name: vat.name().map(str::to_string),
                lifecycle: vat.lifecycle,
                incarnation: vat.incarnation,
                transcript_start: vat.transcript_start,
                transcript_end: vat.transcript_end,
                vatstore_keys: vat.vatstore.len(),
            })
            .collect();

        KernelDump {
            crank_number: self.crank_number,
            kernel_table,
            objects,
            promises,
            gc_actions: self.gc_actions.iter().map(ToString::to_string).collect(),
            reap_queue: self.reap_queue.iter().copied().collect(),
            run_queue: self.run_queue.iter().cloned().collect(),
            vats,
            terminated: self.terminated.clone(),
            awaiting_cleanup: self.dead_vats.keys().copied().collect(),
            pinned: self.pinned.iter().copied().collect(),
        }
    }
}
