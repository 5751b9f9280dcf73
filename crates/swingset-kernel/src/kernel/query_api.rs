//! Host-facing operations. Mutating calls validate, apply and commit
//! immediately; the work they queue runs on later cranks.

use serde::Serialize;
use serde_json::Value;
use swingset_store::SwingStore;

use crate::capdata::{CapData, Message};
use crate::clist::MapOpts;
use crate::device::root_node_vref;
use crate::dump::KernelDump;
use crate::error::KernelError;
use crate::ids::{DeviceId, KDevice, KPid, KRef, KernelSlot, VatId, VatSlot};
use crate::object_table::{PromiseState, ResultPolicy};
use crate::options::{KernelOptions, VatOptionChanges, VatOptions};
use crate::run_queue::RunQueueEvent;
use crate::state::VatLifecycle;
use crate::worker::VatSource;

use super::Kernel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PromiseStatus {
    Unresolved,
    Fulfilled,
    Rejected,
    /// Never existed, or already collected.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub rejected: bool,
    pub data: CapData<KernelSlot>,
}

impl Kernel {
    /// Queue `method(args)` to an arbitrary kernel object or promise. The
    /// host holds the returned kpid until it reads the resolution.
    pub fn queue_to_kref(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
        policy: ResultPolicy,
    ) -> Result<KPid, KernelError> {
        self.check_panic()?;
        for slot in std::iter::once(&target).chain(args.slots.iter()) {
            if !self.slot_exists(*slot) {
                return Err(KernelError::UnknownSlot(*slot));
            }
        }
        let kpid = self.state.objects.add_promise(policy);
        self.state.objects.hold_for_host(kpid)?;
        self.state.enqueue(RunQueueEvent::Send {
            target,
            msg: Message::new(method, args, Some(kpid)),
        })?;
        log::debug!("queued {method} to {target}, result {kpid}");
        self.commit_host()?;
        Ok(kpid)
    }

    pub fn queue_to_vat_root(
        &mut self,
        vat_name: &str,
        method: &str,
        args: CapData<KernelSlot>,
        policy: ResultPolicy,
    ) -> Result<KPid, KernelError> {
        self.check_panic()?;
        let vat_id = self.state.vat_id_by_name(vat_name)?;
        self.queue_to_vat_export(vat_id, 0, method, args, policy)
    }

    /// Queue to the vat's `o+<export_index>` export, entering it in the
    /// vat's c-list if the kernel has not seen it yet.
    pub fn queue_to_vat_export(
        &mut self,
        vat_id: VatId,
        export_index: u64,
        method: &str,
        args: CapData<KernelSlot>,
        policy: ResultPolicy,
    ) -> Result<KPid, KernelError> {
        self.check_panic()?;
        self.state.vat(vat_id)?;
        let target = self
            .state
            .vat_to_kernel(vat_id, VatSlot::export(export_index), MapOpts::default())?;
        self.queue_to_kref(target, method, args, policy)
    }

    pub fn vat_root(&mut self, vat_name: &str) -> Result<KRef, KernelError> {
        self.check_panic()?;
        let vat_id = self.state.vat_id_by_name(vat_name)?;
        let slot = self
            .state
            .vat_to_kernel(vat_id, VatSlot::root(), MapOpts::default())?;
        let kref = slot
            .as_object()
            .ok_or_else(|| KernelError::invariant(format!("root of {vat_id} mapped to {slot}")))?;
        self.commit_host()?;
        Ok(kref)
    }

    /// Keep a vat's root object alive for the host regardless of vat
    /// references.
    pub fn pin_vat_root(&mut self, vat_name: &str) -> Result<KRef, KernelError> {
        let kref = self.vat_root(vat_name)?;
        self.state.pin_object(kref)?;
        self.commit_host()?;
        Ok(kref)
    }

    pub fn kp_status(&self, kpid: KPid) -> PromiseStatus {
        match self.state.objects.promise(kpid).map(|record| &record.state) {
            None => PromiseStatus::Unknown,
            Some(PromiseState::Unresolved { .. }) => PromiseStatus::Unresolved,
            Some(PromiseState::Fulfilled(_)) => PromiseStatus::Fulfilled,
            Some(PromiseState::Rejected(_)) => PromiseStatus::Rejected,
        }
    }

    /// Read a settled promise. The first read releases the host's hold, after
    /// which the promise and whatever its resolution references may be
    /// collected.
    pub fn kp_resolution(&mut self, kpid: KPid) -> Result<Resolution, KernelError> {
        let record = self
            .state
            .objects
            .promise(kpid)
            .ok_or(KernelError::UnknownPromise(kpid))?;
        let resolution = match &record.state {
            PromiseState::Unresolved { .. } => return Err(KernelError::PromiseUnresolved(kpid)),
            PromiseState::Fulfilled(data) => Resolution {
                rejected: false,
                data: data.clone(),
            },
            PromiseState::Rejected(data) => Resolution {
                rejected: true,
                data: data.clone(),
            },
        };
        if record.held_by_host && self.panic.is_none() {
            self.state.objects.release_host_hold(kpid)?;
            self.state.process_refcounts()?;
            self.commit_host()?;
        }
        Ok(resolution)
    }

    /// Hold a promise for the host until it reads the resolution.
    pub fn kp_register_interest(&mut self, kpid: KPid) -> Result<(), KernelError> {
        self.check_panic()?;
        if self.state.objects.promise(kpid).is_none() {
            return Err(KernelError::UnknownPromise(kpid));
        }
        self.state.objects.hold_for_host(kpid)?;
        self.commit_host()
    }

    pub fn change_kernel_options(&mut self, changes: &Value) -> Result<(), KernelError> {
        self.check_panic()?;
        self.state.options = self.state.options.with_changes(changes)?;
        log::info!("kernel options changed: {changes}");
        self.commit_host()
    }

    pub fn kernel_options(&self) -> &KernelOptions {
        &self.state.options
    }

    pub fn vat_options(&self, vat_id: VatId) -> Result<&VatOptions, KernelError> {
        Ok(&self.state.vat(vat_id)?.options)
    }

    /// Validate now, apply on the vat's next crank.
    pub fn change_vat_options(&mut self, vat_id: VatId, changes: &Value) -> Result<(), KernelError> {
        self.check_panic()?;
        let changes = VatOptionChanges::parse(changes)?;
        self.state.vat(vat_id)?;
        self.state
            .enqueue(RunQueueEvent::ChangeVatOptions { vat_id, changes })?;
        self.commit_host()
    }

    /// Returns the new vat's ID and the kpid its root object will be
    /// delivered through.
    pub fn create_vat(
        &mut self,
        source: VatSource,
        options: VatOptions,
        vat_parameters: Value,
    ) -> Result<(VatId, KPid), KernelError> {
        self.check_panic()?;
        let vat_id = self.state.allocate_vat_id();
        let result = self.state.objects.add_promise(ResultPolicy::Ignore);
        self.state.objects.hold_for_host(result)?;
        self.state.enqueue(RunQueueEvent::CreateVat {
            vat_id,
            source,
            options,
            vat_parameters,
            result,
        })?;
        log::info!("queued creation of {vat_id}");
        self.commit_host()?;
        Ok((vat_id, result))
    }

    pub fn upgrade_vat(
        &mut self,
        vat_id: VatId,
        source: VatSource,
        vat_parameters: Value,
        upgrade_message: &str,
    ) -> Result<KPid, KernelError> {
        self.check_panic()?;
        self.state.vat_mut(vat_id)?.lifecycle = VatLifecycle::Upgrading;
        let result = self.state.objects.add_promise(ResultPolicy::Ignore);
        self.state.objects.hold_for_host(result)?;
        self.state.enqueue(RunQueueEvent::UpgradeVat {
            vat_id,
            source,
            vat_parameters,
            upgrade_message: upgrade_message.to_string(),
            result,
        })?;
        log::info!("queued upgrade of {vat_id}");
        self.commit_host()?;
        Ok(result)
    }

    pub fn terminate_vat(&mut self, vat_id: VatId, reason: &str) -> Result<(), KernelError> {
        self.check_panic()?;
        self.state.vat(vat_id)?;
        self.state.enqueue(RunQueueEvent::TerminateVat {
            vat_id,
            reason: reason.to_string(),
        })?;
        self.commit_host()
    }

    /// Schedule bringOutYourDead for every live vat.
    pub fn reap_all_vats(&mut self) -> Result<(), KernelError> {
        self.check_panic()?;
        let live: Vec<VatId> = self.state.vats.keys().copied().collect();
        self.state.reap_queue.extend(live);
        self.commit_host()
    }

    pub fn vat_id_by_name(&self, name: &str) -> Result<VatId, KernelError> {
        self.state.vat_id_by_name(name)
    }

    pub fn vat_lifecycle(&self, vat_id: VatId) -> Result<VatLifecycle, KernelError> {
        match self.state.vats.get(&vat_id) {
            Some(vat) => Ok(vat.lifecycle),
            None if self.state.dead_vats.contains_key(&vat_id)
                || self.state.terminated.contains(&vat_id) =>
            {
                Ok(VatLifecycle::Terminated)
            }
            None => Err(KernelError::UnknownVat(vat_id)),
        }
    }

    pub fn vat_incarnation(&self, vat_id: VatId) -> Result<u64, KernelError> {
        Ok(self.state.vat(vat_id)?.incarnation)
    }

    pub fn device_node(&self, name: &str) -> Result<KDevice, KernelError> {
        let device_id: DeviceId = self
            .state
            .device_names
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::UnknownDevice(name.to_string()))?;
        let device = self
            .state
            .devices
            .get(&device_id)
            .ok_or_else(|| KernelError::UnknownDevice(name.to_string()))?;
        match device.clist.kernel_slot(&root_node_vref()) {
            Some(KernelSlot::Device(node)) => Ok(node),
            _ => Err(KernelError::UnknownDevice(name.to_string())),
        }
    }

    pub fn dump(&self) -> KernelDump {
        self.state.dump()
    }

    pub fn activity_hash(&self) -> Option<String> {
        self.storage.activity_hash()
    }

    pub fn crank_number(&self) -> u64 {
        self.state.crank_number
    }

    pub fn store(&self) -> &SwingStore {
        self.storage.store()
    }

    fn slot_exists(&self, slot: KernelSlot) -> bool {
        match slot {
            KernelSlot::Object(kref) => self.state.objects.object_exists(kref),
            KernelSlot::Promise(kpid) => self.state.objects.promise(kpid).is_some(),
            KernelSlot::Device(node) => self.state.objects.device_nodes.contains_key(&node),
        }
    }
}
