//! Host devices reachable from vats through `callNow`.
//!
//! Devices export device nodes (`d+N` on the device side, `kd` in the
//! kernel, `d-N` in importing vats). Kernel slots handed to a device are
//! entered in its c-list with a count that is never released: devices do not
//! take part in GC, so anything a device has seen stays alive.

use crate::capdata::CapData;
use crate::clist::{Holder, MapOpts};
use crate::error::KernelError;
use crate::ids::{DeviceId, KDevice, KernelSlot, SlotKind, VatSlot};
use crate::state::{DeviceRecord, KernelState};

pub trait DeviceHandler: Send {
    /// Invoke `method` on one of this device's nodes. Errors are returned to
    /// the calling vat as a syscall error.
    fn invoke(
        &mut self,
        target: &VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<CapData<VatSlot>, String>;
}

/// The device-side reference (`d+0`) of a device's root node.
pub(crate) fn root_node_vref() -> VatSlot {
    VatSlot {
        kind: SlotKind::Device,
        ..VatSlot::root()
    }
}

impl KernelState {
    pub fn add_device(&mut self, name: &str) -> DeviceId {
        let device_id = self.allocate_device_id();
        self.devices.insert(
            device_id,
            DeviceRecord {
                device_id,
                name: name.to_string(),
                clist: Default::default(),
            },
        );
        self.device_names.insert(name.to_string(), device_id);
        device_id
    }

    /// The root node (`d+0`) of a device, allocated on first use.
    pub fn device_root(&mut self, device_id: DeviceId) -> Result<KDevice, KernelError> {
        let KernelState { devices, objects, .. } = self;
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| KernelError::UnknownDevice(device_id.to_string()))?;
        let slot = device.clist.map_vat_to_kernel(
            Holder::Device(device_id),
            root_node_vref(),
            objects,
            MapOpts::default(),
        )?;
        match slot {
            KernelSlot::Device(node) => Ok(node),
            other => Err(KernelError::invariant(format!(
                "device root mapped to {other}"
            ))),
        }
    }

    pub fn capdata_to_device(
        &mut self,
        device_id: DeviceId,
        data: &CapData<KernelSlot>,
    ) -> Result<CapData<VatSlot>, KernelError> {
        let KernelState { devices, objects, .. } = self;
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| KernelError::UnknownDevice(device_id.to_string()))?;
        data.try_map_slots(|slot| device.clist.map_kernel_to_vat(*slot, objects, MapOpts::default()))
    }

    pub fn capdata_from_device(
        &mut self,
        device_id: DeviceId,
        data: &CapData<VatSlot>,
    ) -> Result<CapData<KernelSlot>, KernelError> {
        let KernelState { devices, objects, .. } = self;
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| KernelError::UnknownDevice(device_id.to_string()))?;
        data.try_map_slots(|vref| {
            device
                .clist
                .map_vat_to_kernel(Holder::Device(device_id), *vref, objects, MapOpts::default())
        })
    }

    /// The device-side reference for a device node.
    pub fn device_node_vref(&self, node: KDevice) -> Result<(DeviceId, VatSlot), KernelError> {
        let owner = self
            .objects
            .device_nodes
            .get(&node)
            .copied()
            .ok_or_else(|| KernelError::UnknownDevice(node.to_string()))?;
        let device = self
            .devices
            .get(&owner)
            .ok_or_else(|| KernelError::UnknownDevice(owner.to_string()))?;
        let vref = device
            .clist
            .vref(KernelSlot::Device(node))
            .ok_or_else(|| KernelError::UnknownDevice(node.to_string()))?;
        Ok((owner, vref))
    }
}
