//! Object-capability kernel: routes capability-bearing messages between vats,
//! garbage-collects cross-vat references and persists enough state to replay
//! deterministically.

pub mod capdata;
pub mod clist;
pub mod device;
pub mod dump;
pub mod error;
pub mod gc;
pub mod ids;
pub mod journal;
pub mod kernel;
pub mod local_worker;
pub mod object_table;
pub mod options;
pub mod persist;
pub mod policy;
pub mod run_queue;
pub mod state;
pub mod transcript;
pub mod worker;

pub use capdata::{CapData, Message};
pub use device::DeviceHandler;
pub use dump::KernelDump;
pub use error::{KernelError, SyscallError};
pub use ids::{DeviceId, KDevice, KPid, KRef, KernelSlot, SlotKind, VatId, VatSlot};
pub use kernel::{Kernel, KernelBuilder, KernelConfig, PromiseStatus, Resolution, StaticVat};
pub use local_worker::{LocalWorkerFactory, ProgramError, ProgramResult, VatContext, VatProgram};
pub use object_table::ResultPolicy;
pub use options::{KernelOptions, Threshold, VatOptionChanges, VatOptions};
pub use policy::{
    CleanupBudget, CleanupWork, CrankLimitPolicy, ForeverPolicy, PolicyInput, RunPolicy,
};
pub use run_queue::RunQueueEvent;
pub use state::VatLifecycle;
pub use swingset_store::{MemBackends, SwingStore};
pub use worker::{
    DeliveryOutcome, DeliveryResult, SyscallHandler, SyscallResult, VatDelivery, VatMessage,
    VatResolution, VatSource, VatSyscall, VatWorker, WorkerError, WorkerFactory, WorkerSpec,
};
