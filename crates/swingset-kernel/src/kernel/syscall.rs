//! Servicing a vat's syscalls during a live delivery.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::capdata::{CapData, Message};
use crate::clist::MapOpts;
use crate::device::DeviceHandler;
use crate::error::{KernelError, SyscallError};
use crate::ids::{DeviceId, KPid, KernelSlot, SlotKind, VatId, VatSlot};
use crate::object_table::PromiseState;
use crate::run_queue::RunQueueEvent;
use crate::state::KernelState;
use crate::transcript::TranscriptSyscall;
use crate::worker::{SyscallHandler, SyscallResult, VatMessage, VatResolution, VatSyscall};

/// What a delivery's syscalls left behind for the crank to act on.
pub(crate) struct SyscallReport {
    pub recorded: Vec<TranscriptSyscall>,
    pub illegal: Option<String>,
    pub fatal: Option<KernelError>,
    pub exit: Option<(bool, CapData<KernelSlot>)>,
}

pub(crate) struct CrankSyscalls<'a> {
    vat_id: VatId,
    state: &'a mut KernelState,
    devices: &'a mut BTreeMap<DeviceId, Box<dyn DeviceHandler>>,
    recorded: Vec<TranscriptSyscall>,
    illegal: Option<String>,
    fatal: Option<KernelError>,
    exit: Option<(bool, CapData<KernelSlot>)>,
}

impl<'a> CrankSyscalls<'a> {
    pub fn new(
        vat_id: VatId,
        state: &'a mut KernelState,
        devices: &'a mut BTreeMap<DeviceId, Box<dyn DeviceHandler>>,
    ) -> Self {
        Self {
            vat_id,
            state,
            devices,
            recorded: Vec::new(),
            illegal: None,
            fatal: None,
            exit: None,
        }
    }

    pub fn finish(self) -> SyscallReport {
        SyscallReport {
            recorded: self.recorded,
            illegal: self.illegal,
            fatal: self.fatal,
            exit: self.exit,
        }
    }

    fn dispatch(&mut self, call: &VatSyscall) -> Result<SyscallResult, KernelError> {
        match call {
            VatSyscall::Send { target, message } => self.send(*target, message),
            VatSyscall::Subscribe { vpid } => {
                let kpid = self.promise_slot(*vpid)?;
                self.state.do_subscribe(self.vat_id, kpid)?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Resolve { resolutions } => self.resolve(resolutions),
            VatSyscall::Exit { failure, info } => {
                let info = self.state.capdata_to_kernel(self.vat_id, info)?;
                log::info!("{} requested exit (failure: {failure})", self.vat_id);
                self.exit = Some((*failure, info));
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreGet { key } => {
                let vat = self.state.vat(self.vat_id)?;
                Ok(SyscallResult::Value(vat.vatstore.get(key).cloned()))
            }
            VatSyscall::VatstoreGetNextKey { prior_key } => {
                let vat = self.state.vat(self.vat_id)?;
                let next = vat
                    .vatstore
                    .range::<str, _>((Bound::Excluded(prior_key.as_str()), Bound::Unbounded))
                    .next()
                    .map(|(key, _)| key.clone());
                Ok(SyscallResult::Value(next))
            }
            VatSyscall::VatstoreSet { key, value } => {
                let vat = self.state.vat_mut(self.vat_id)?;
                vat.vatstore.insert(key.clone(), value.clone());
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.state.vat_mut(self.vat_id)?.vatstore.remove(key);
                Ok(SyscallResult::Ok)
            }
            VatSyscall::DropImports { vrefs } => {
                for vref in vrefs {
                    expect_import(vref)?;
                    let KernelState { vats, objects, .. } = &mut *self.state;
                    let vat = vats
                        .get_mut(&self.vat_id)
                        .ok_or(KernelError::UnknownVat(self.vat_id))?;
                    if let Some(slot) = vat.clist.kernel_slot(vref) {
                        vat.clist.clear_reachable_flag(slot, objects)?;
                    }
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireImports { vrefs } => {
                for vref in vrefs {
                    expect_import(vref)?;
                    let vat = self.state.vat(self.vat_id)?;
                    let Some(slot) = vat.clist.kernel_slot(vref) else {
                        continue;
                    };
                    if vat.clist.reachable_flag(slot) {
                        return Err(SyscallError::RetireReachable(*vref).into());
                    }
                    self.state.delete_clist_entry(self.vat_id, slot)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireExports { vrefs } => {
                for vref in vrefs {
                    expect_export(vref)?;
                    let vat = self.state.vat(self.vat_id)?;
                    let Some(slot) = vat.clist.kernel_slot(vref) else {
                        continue;
                    };
                    if vat.clist.reachable_flag(slot) {
                        return Err(SyscallError::RetireReachable(*vref).into());
                    }
                    self.state.delete_clist_entry(self.vat_id, slot)?;
                    if let KernelSlot::Object(kref) = slot {
                        self.state.retire_kernel_objects(&[kref]);
                    }
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::AbandonExports { vrefs } => {
                for vref in vrefs {
                    expect_export(vref)?;
                    let Some(slot) = self.state.vat(self.vat_id)?.clist.kernel_slot(vref) else {
                        continue;
                    };
                    self.state.delete_clist_entry(self.vat_id, slot)?;
                    if let KernelSlot::Object(kref) = slot {
                        self.state.objects.orphan_object(kref);
                    }
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::CallNow {
                target,
                method,
                args,
            } => self.call_now(*target, method, args),
        }
    }

    fn send(&mut self, target: VatSlot, message: &VatMessage) -> Result<SyscallResult, KernelError> {
        let target = self.state.vat_to_kernel(self.vat_id, target, MapOpts::default())?;
        let args = self.state.capdata_to_kernel(self.vat_id, &message.args)?;
        let result = match message.result {
            Some(vpid) => {
                let kpid = self.promise_slot(vpid)?;
                // the vat gives up deciding its result promise to whoever
                // receives the message
                let record = self.state.objects.promise_mut(kpid)?;
                match &mut record.state {
                    PromiseState::Unresolved { decider, .. } if *decider == Some(self.vat_id) => {
                        *decider = None;
                    }
                    PromiseState::Unresolved { .. } => {
                        return Err(SyscallError::NotDecider {
                            vat_id: self.vat_id,
                            kpid,
                        }
                        .into());
                    }
                    _ => return Err(SyscallError::AlreadyResolved(kpid).into()),
                }
                Some(kpid)
            }
            None => None,
        };
        self.state.enqueue(RunQueueEvent::Send {
            target,
            msg: Message::new(message.method.clone(), args, result),
        })?;
        Ok(SyscallResult::Ok)
    }

    fn resolve(&mut self, resolutions: &[VatResolution]) -> Result<SyscallResult, KernelError> {
        let mut settled = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            let kpid = self.promise_slot(resolution.vpid)?;
            let record = self
                .state
                .objects
                .promise(kpid)
                .ok_or(KernelError::UnknownPromise(kpid))?;
            if record.state.is_resolved() {
                return Err(SyscallError::AlreadyResolved(kpid).into());
            }
            if record.state.decider() != Some(self.vat_id) {
                return Err(SyscallError::NotDecider {
                    vat_id: self.vat_id,
                    kpid,
                }
                .into());
            }
            let data = self.state.capdata_to_kernel(self.vat_id, &resolution.data)?;
            settled.push((kpid, resolution.rejected, data));
        }
        let kpids: Vec<KPid> = settled.iter().map(|(kpid, _, _)| *kpid).collect();
        self.state.do_resolve(Some(self.vat_id), settled)?;
        // a vat forgets the vpids it resolves
        for kpid in kpids {
            self.state.delete_clist_entry(self.vat_id, kpid.into())?;
        }
        Ok(SyscallResult::Ok)
    }

    fn call_now(
        &mut self,
        target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<SyscallResult, KernelError> {
        if target.kind != SlotKind::Device || target.allocated_by_vat {
            return Err(SyscallError::WrongKind {
                vref: target,
                expected: "a device node import",
            }
            .into());
        }
        let slot = self
            .state
            .vat_to_kernel(self.vat_id, target, MapOpts::required())?;
        let KernelSlot::Device(node) = slot else {
            return Err(SyscallError::UnknownDeviceNode(slot).into());
        };
        let (device_id, device_target) = self.state.device_node_vref(node)?;
        let kernel_args = self.state.capdata_to_kernel(self.vat_id, args)?;
        let device_args = self.state.capdata_to_device(device_id, &kernel_args)?;
        let Some(handler) = self.devices.get_mut(&device_id) else {
            return Ok(SyscallResult::Error(format!("device {device_id} has no handler")));
        };
        match handler.invoke(&device_target, method, &device_args) {
            Ok(result) => {
                let result = self.state.capdata_from_device(device_id, &result)?;
                let result = self.state.capdata_to_vat(self.vat_id, &result)?;
                Ok(SyscallResult::Data(result))
            }
            Err(reason) => {
                log::debug!("{method} on {node} failed: {reason}");
                Ok(SyscallResult::Error(reason))
            }
        }
    }

    fn promise_slot(&mut self, vpid: VatSlot) -> Result<KPid, KernelError> {
        if !vpid.is_promise() {
            return Err(SyscallError::WrongKind {
                vref: vpid,
                expected: "a promise",
            }
            .into());
        }
        let slot = self.state.vat_to_kernel(self.vat_id, vpid, MapOpts::default())?;
        slot.as_promise()
            .ok_or_else(|| KernelError::invariant(format!("{vpid} mapped to {slot}")))
    }
}

fn expect_import(vref: &VatSlot) -> Result<(), SyscallError> {
    if vref.is_object() && !vref.allocated_by_vat {
        Ok(())
    } else {
        Err(SyscallError::WrongKind {
            vref: *vref,
            expected: "an object import",
        })
    }
}

fn expect_export(vref: &VatSlot) -> Result<(), SyscallError> {
    if vref.is_object() && vref.allocated_by_vat {
        Ok(())
    } else {
        Err(SyscallError::WrongKind {
            vref: *vref,
            expected: "an object export",
        })
    }
}

impl SyscallHandler for CrankSyscalls<'_> {
    fn syscall(&mut self, call: VatSyscall) -> SyscallResult {
        let result = if self.illegal.is_some() || self.fatal.is_some() {
            SyscallResult::Error("vat is being terminated".into())
        } else {
            match self.dispatch(&call) {
                Ok(result) => result,
                Err(err) if err.is_fatal() => {
                    log::error!("{} syscall failed fatally: {err}", self.vat_id);
                    self.fatal = Some(err);
                    SyscallResult::Error("kernel failure".into())
                }
                Err(err) => {
                    log::warn!("{} made an illegal syscall: {err}", self.vat_id);
                    let reason = err.to_string();
                    self.illegal = Some(reason.clone());
                    SyscallResult::Error(reason)
                }
            }
        };
        self.recorded.push(TranscriptSyscall {
            call,
            result: result.clone(),
        });
        result
    }
}
