//! The boundary between the kernel and whatever executes a vat.
//!
//! The kernel hands a worker one vat-local delivery at a time and services
//! its syscalls synchronously while the delivery runs. Workers never see
//! kernel identities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::capdata::CapData;
use crate::ids::{VatId, VatSlot};
use crate::options::VatOptions;

/// Names the program a worker should run. Bundle loading lives outside the
/// kernel; the name is resolved by the worker factory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatSource {
    pub bundle: String,
}

impl VatSource {
    pub fn bundle(name: impl Into<String>) -> Self {
        Self { bundle: name.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatMessage {
    pub method: String,
    pub args: CapData<VatSlot>,
    pub result: Option<VatSlot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    pub vpid: VatSlot,
    pub rejected: bool,
    pub data: CapData<VatSlot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    Message {
        target: VatSlot,
        message: VatMessage,
    },
    Notify {
        resolutions: Vec<VatResolution>,
    },
    DropExports {
        vrefs: Vec<VatSlot>,
    },
    RetireExports {
        vrefs: Vec<VatSlot>,
    },
    RetireImports {
        vrefs: Vec<VatSlot>,
    },
    ChangeVatOptions {
        options: BTreeMap<String, Value>,
    },
    StartVat {
        vat_parameters: Value,
    },
    BringOutYourDead,
}

impl VatDelivery {
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::ChangeVatOptions { .. } => "changeVatOptions",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VatSlot,
        message: VatMessage,
    },
    Subscribe {
        vpid: VatSlot,
    },
    Resolve {
        resolutions: Vec<VatResolution>,
    },
    Exit {
        failure: bool,
        info: CapData<VatSlot>,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreGetNextKey {
        prior_key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    DropImports {
        vrefs: Vec<VatSlot>,
    },
    RetireImports {
        vrefs: Vec<VatSlot>,
    },
    RetireExports {
        vrefs: Vec<VatSlot>,
    },
    AbandonExports {
        vrefs: Vec<VatSlot>,
    },
    CallNow {
        target: VatSlot,
        method: String,
        args: CapData<VatSlot>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SyscallResult {
    Ok,
    Value(Option<String>),
    Data(CapData<VatSlot>),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "camelCase")]
pub enum DeliveryOutcome {
    Ok,
    /// The delivery failed inside the worker. The kernel terminates the vat.
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub outcome: DeliveryOutcome,
    /// Worker-reported work units. Informational only.
    #[serde(default)]
    pub computrons: u64,
}

impl DeliveryResult {
    pub fn ok(computrons: u64) -> Self {
        Self {
            outcome: DeliveryOutcome::Ok,
            computrons,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::Error(reason.into()),
            computrons: 0,
        }
    }
}

/// Kernel side of a running delivery.
pub trait SyscallHandler {
    fn syscall(&mut self, call: VatSyscall) -> SyscallResult;

    /// Replayed deliveries must not produce outside effects.
    fn replaying(&self) -> bool {
        false
    }
}

pub trait VatWorker: Send {
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<DeliveryResult, WorkerError>;

    /// Serialized RAM state, or `None` if this worker cannot snapshot.
    fn snapshot(&mut self) -> Result<Option<Vec<u8>>, WorkerError>;

    fn shutdown(&mut self) {}
}

pub struct WorkerSpec<'a> {
    pub vat_id: VatId,
    pub source: &'a VatSource,
    pub options: &'a VatOptions,
    pub incarnation: u64,
    pub snapshot: Option<&'a [u8]>,
}

pub trait WorkerFactory: Send {
    fn spawn(&self, spec: &WorkerSpec<'_>) -> Result<Box<dyn VatWorker>, WorkerError>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown bundle '{0}'")]
    UnknownBundle(String),
    #[error("no worker factory for manager type '{0}'")]
    UnknownManagerType(String),
    #[error("failed to restore from snapshot: {0}")]
    Restore(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
