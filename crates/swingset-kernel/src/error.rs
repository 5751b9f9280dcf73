use thiserror::Error;

use crate::ids::{KPid, KRef, KernelSlot, VatId, VatSlot};
use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] swingset_store::StoreError),
    #[error("worker for {vat_id} failed: {source}")]
    Worker {
        vat_id: VatId,
        #[source]
        source: WorkerError,
    },
    #[error("illegal syscall: {0}")]
    IllegalSyscall(#[from] SyscallError),
    #[error("{option} {value} {reason}")]
    InvalidOption {
        option: String,
        value: String,
        reason: String,
    },
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("unknown vat name '{0}'")]
    UnknownVatName(String),
    #[error("unknown kernel slot {0}")]
    UnknownSlot(KernelSlot),
    #[error("unknown promise {0}")]
    UnknownPromise(KPid),
    #[error("promise {0} is unresolved")]
    PromiseUnresolved(KPid),
    #[error("device '{0}' is not registered")]
    UnknownDevice(String),
    #[error("refcount underflow on {slot} ({tag})")]
    RefCountUnderflow { slot: KernelSlot, tag: String },
    #[error("refcount mismatch on {kref}: reachable {reachable} > recognizable {recognizable}")]
    RefCountMismatch {
        kref: KRef,
        reachable: u64,
        recognizable: u64,
    },
    #[error("kernel invariant violated: {0}")]
    Invariant(String),
    #[error("transcript divergence replaying {vat_id}: {detail}")]
    TranscriptDivergence { vat_id: VatId, detail: String },
    #[error("critical vat {vat_id} failed: {reason}")]
    CriticalVatFailure { vat_id: VatId, reason: String },
    #[error("promise {kpid} with panic result policy was rejected: {reason}")]
    ResultPolicyPanic { kpid: KPid, reason: String },
    #[error("kernel state decode error: {0}")]
    Decode(String),
    #[error("kernel panicked: {0}")]
    Panicked(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

impl KernelError {
    /// Fatal errors leave the kernel panicked: its in-memory state can no
    /// longer be trusted to match what replicas would compute.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Store(_)
                | KernelError::Worker { .. }
                | KernelError::RefCountUnderflow { .. }
                | KernelError::RefCountMismatch { .. }
                | KernelError::Invariant(_)
                | KernelError::TranscriptDivergence { .. }
                | KernelError::CriticalVatFailure { .. }
                | KernelError::ResultPolicyPanic { .. }
                | KernelError::Decode(_)
                | KernelError::Panicked(_)
                | KernelError::Json(_)
                | KernelError::Cbor(_)
        )
    }

    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        KernelError::Invariant(detail.into())
    }

    pub(crate) fn invalid_option(
        option: impl Into<String>,
        value: &serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        KernelError::InvalidOption {
            option: option.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// A syscall the kernel refuses to perform. The offending vat is terminated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error("vref {0} is not in the c-list")]
    UnknownVref(VatSlot),
    #[error("import {0} is not reachable")]
    UnreachableImport(VatSlot),
    #[error("{vref} is not {expected}")]
    WrongKind {
        vref: VatSlot,
        expected: &'static str,
    },
    #[error("{vat_id} is not the decider of {kpid}")]
    NotDecider { vat_id: VatId, kpid: KPid },
    #[error("promise {0} is already resolved")]
    AlreadyResolved(KPid),
    #[error("cannot retire {0} while it is still reachable")]
    RetireReachable(VatSlot),
    #[error("vats cannot export device nodes ({0})")]
    DeviceExport(VatSlot),
    #[error("{0} is not a registered device node")]
    UnknownDeviceNode(KernelSlot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_errors_name_the_option() {
        let err = KernelError::invalid_option(
            "defaultReapInterval",
            &serde_json::json!("banana"),
            "must be a positive number or \"never\"",
        );
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "defaultReapInterval \"banana\" must be a positive number or \"never\""
        );
    }

    #[test]
    fn invariant_violations_are_fatal() {
        assert!(KernelError::invariant("boom").is_fatal());
        assert!(!KernelError::UnknownVatName("bob".into()).is_fatal());
    }
}
