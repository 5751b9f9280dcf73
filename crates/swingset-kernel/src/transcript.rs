//! Transcript entries and the replay-side syscall handler.
//!
//! Each committed delivery is stored with every syscall it made and the
//! answer the kernel gave. Replaying a vat feeds the recorded answers back
//! instead of touching kernel state, and any difference between the recorded
//! and the replayed syscalls is a divergence.

use serde::{Deserialize, Serialize};
use swingset_store::to_canonical_cbor;

use crate::error::KernelError;
use crate::ids::VatId;
use crate::worker::{DeliveryResult, SyscallHandler, SyscallResult, VatDelivery, VatSyscall};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSyscall {
    pub call: VatSyscall,
    pub result: SyscallResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    pub syscalls: Vec<TranscriptSyscall>,
    pub result: DeliveryResult,
}

impl TranscriptEntry {
    pub fn encode(&self) -> Result<Vec<u8>, KernelError> {
        Ok(to_canonical_cbor(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KernelError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

pub struct ReplayHandler<'a> {
    vat_id: VatId,
    recorded: &'a [TranscriptSyscall],
    next: usize,
    divergence: Option<String>,
}

impl<'a> ReplayHandler<'a> {
    pub fn new(vat_id: VatId, entry: &'a TranscriptEntry) -> Self {
        Self {
            vat_id,
            recorded: &entry.syscalls,
            next: 0,
            divergence: None,
        }
    }

    /// Fails if the replayed delivery diverged or left recorded syscalls
    /// unmade.
    pub fn finish(self) -> Result<(), KernelError> {
        if let Some(detail) = self.divergence {
            return Err(KernelError::TranscriptDivergence {
                vat_id: self.vat_id,
                detail,
            });
        }
        if self.next != self.recorded.len() {
            return Err(KernelError::TranscriptDivergence {
                vat_id: self.vat_id,
                detail: format!(
                    "replay made {} syscalls, transcript recorded {}",
                    self.next,
                    self.recorded.len()
                ),
            });
        }
        Ok(())
    }
}

impl SyscallHandler for ReplayHandler<'_> {
    fn syscall(&mut self, call: VatSyscall) -> SyscallResult {
        if self.divergence.is_some() {
            return SyscallResult::Error("replay diverged".into());
        }
        let Some(recorded) = self.recorded.get(self.next) else {
            self.divergence = Some(format!("extra syscall {call:?}"));
            return SyscallResult::Error("replay diverged".into());
        };
        if recorded.call != call {
            self.divergence = Some(format!(
                "syscall {} was {:?}, transcript has {:?}",
                self.next, call, recorded.call
            ));
            return SyscallResult::Error("replay diverged".into());
        }
        self.next += 1;
        recorded.result.clone()
    }

    fn replaying(&self) -> bool {
        true
    }
}
