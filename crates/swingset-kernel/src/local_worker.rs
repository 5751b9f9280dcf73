//! In-process worker hosting Rust-implemented vat programs.
//!
//! Programs are registered by bundle name and run under the `local` manager
//! type. `VatContext` is the program's view of the syscall interface; it
//! allocates vat-side references (`o+N`, `p+N`) itself, so those counters
//! are part of the worker's snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::CapData;
use crate::ids::{SlotKind, VatSlot};
use crate::worker::{
    DeliveryResult, SyscallHandler, SyscallResult, VatDelivery, VatMessage, VatResolution,
    VatSyscall, VatWorker, WorkerError, WorkerFactory, WorkerSpec,
};

/// How a program method failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    /// The request was refused. A message's result promise is rejected with
    /// the reason and the vat carries on.
    #[error("{0}")]
    Rejected(String),
    /// The vat cannot go on and is terminated.
    #[error("{0}")]
    Fatal(String),
}

impl From<String> for ProgramError {
    fn from(reason: String) -> Self {
        ProgramError::Rejected(reason)
    }
}

impl From<&str> for ProgramError {
    fn from(reason: &str) -> Self {
        ProgramError::Rejected(reason.to_string())
    }
}

pub type ProgramResult = Result<(), ProgramError>;

pub trait VatProgram: Send {
    fn start_vat(&mut self, _ctx: &mut VatContext<'_>, _vat_parameters: &Value) -> ProgramResult {
        Ok(())
    }

    fn deliver_message(
        &mut self,
        ctx: &mut VatContext<'_>,
        target: &VatSlot,
        message: &VatMessage,
    ) -> ProgramResult;

    fn notify(&mut self, _ctx: &mut VatContext<'_>, _resolutions: &[VatResolution]) -> ProgramResult {
        Ok(())
    }

    fn drop_exports(&mut self, _ctx: &mut VatContext<'_>, _vrefs: &[VatSlot]) -> ProgramResult {
        Ok(())
    }

    fn retire_exports(&mut self, _ctx: &mut VatContext<'_>, _vrefs: &[VatSlot]) -> ProgramResult {
        Ok(())
    }

    fn retire_imports(&mut self, _ctx: &mut VatContext<'_>, _vrefs: &[VatSlot]) -> ProgramResult {
        Ok(())
    }

    fn change_vat_options(
        &mut self,
        _ctx: &mut VatContext<'_>,
        _options: &BTreeMap<String, Value>,
    ) -> ProgramResult {
        Ok(())
    }

    fn bring_out_your_dead(&mut self, _ctx: &mut VatContext<'_>) -> ProgramResult {
        Ok(())
    }

    /// Serialized RAM state. Programs returning `None` are never snapshotted
    /// and are rebuilt by replaying their whole transcript.
    fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(&mut self, _snapshot: &[u8]) -> ProgramResult {
        Err("snapshots are not supported".into())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Counters {
    next_export: u64,
    next_promise: u64,
}

impl Default for Counters {
    fn default() -> Self {
        // o+0 is the root object
        Self {
            next_export: 1,
            next_promise: 1,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LocalSnapshot {
    counters: Counters,
    #[serde(with = "serde_bytes")]
    program: Vec<u8>,
}

pub struct VatContext<'a> {
    syscalls: &'a mut dyn SyscallHandler,
    counters: &'a mut Counters,
    incarnation: u64,
    issued: u64,
    settled: BTreeSet<VatSlot>,
}

impl VatContext<'_> {
    fn call(&mut self, call: VatSyscall) -> SyscallResult {
        self.issued += 1;
        self.syscalls.syscall(call)
    }

    /// True while the kernel is rebuilding this vat from its transcript.
    /// Outside effects (logging) should be skipped.
    pub fn replaying(&self) -> bool {
        self.syscalls.replaying()
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn allocate_export(&mut self) -> VatSlot {
        let vref = VatSlot::export(self.counters.next_export);
        self.counters.next_export += 1;
        vref
    }

    pub fn allocate_promise(&mut self) -> VatSlot {
        let vpid = VatSlot::promise(self.counters.next_promise);
        self.counters.next_promise += 1;
        vpid
    }

    /// Send with a fresh result promise, which is returned.
    pub fn send(&mut self, target: VatSlot, method: &str, args: CapData<VatSlot>) -> VatSlot {
        let result = self.allocate_promise();
        self.call(VatSyscall::Send {
            target,
            message: VatMessage {
                method: method.to_string(),
                args,
                result: Some(result),
            },
        });
        result
    }

    pub fn send_only(&mut self, target: VatSlot, method: &str, args: CapData<VatSlot>) {
        self.call(VatSyscall::Send {
            target,
            message: VatMessage {
                method: method.to_string(),
                args,
                result: None,
            },
        });
    }

    pub fn subscribe(&mut self, vpid: VatSlot) {
        self.call(VatSyscall::Subscribe { vpid });
    }

    pub fn resolve(&mut self, vpid: VatSlot, data: CapData<VatSlot>) {
        self.settle(vpid, false, data);
    }

    pub fn reject(&mut self, vpid: VatSlot, data: CapData<VatSlot>) {
        self.settle(vpid, true, data);
    }

    fn settle(&mut self, vpid: VatSlot, rejected: bool, data: CapData<VatSlot>) {
        self.settled.insert(vpid);
        self.call(VatSyscall::Resolve {
            resolutions: vec![VatResolution {
                vpid,
                rejected,
                data,
            }],
        });
    }

    pub fn vatstore_get(&mut self, key: &str) -> Option<String> {
        match self.call(VatSyscall::VatstoreGet { key: key.to_string() }) {
            SyscallResult::Value(value) => value,
            _ => None,
        }
    }

    pub fn vatstore_get_next_key(&mut self, prior_key: &str) -> Option<String> {
        match self.call(VatSyscall::VatstoreGetNextKey {
            prior_key: prior_key.to_string(),
        }) {
            SyscallResult::Value(value) => value,
            _ => None,
        }
    }

    pub fn vatstore_set(&mut self, key: &str, value: &str) {
        self.call(VatSyscall::VatstoreSet {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn vatstore_delete(&mut self, key: &str) {
        self.call(VatSyscall::VatstoreDelete { key: key.to_string() });
    }

    pub fn drop_imports(&mut self, vrefs: Vec<VatSlot>) {
        self.call(VatSyscall::DropImports { vrefs });
    }

    pub fn retire_imports(&mut self, vrefs: Vec<VatSlot>) {
        self.call(VatSyscall::RetireImports { vrefs });
    }

    pub fn retire_exports(&mut self, vrefs: Vec<VatSlot>) {
        self.call(VatSyscall::RetireExports { vrefs });
    }

    pub fn abandon_exports(&mut self, vrefs: Vec<VatSlot>) {
        self.call(VatSyscall::AbandonExports { vrefs });
    }

    /// Ask the kernel to terminate this vat once the delivery ends.
    pub fn exit(&mut self, failure: bool, info: CapData<VatSlot>) {
        self.call(VatSyscall::Exit { failure, info });
    }

    /// Synchronous device invocation. `target` must be a `d-N` import.
    pub fn call_now(
        &mut self,
        target: VatSlot,
        method: &str,
        args: CapData<VatSlot>,
    ) -> Result<CapData<VatSlot>, String> {
        if target.kind != SlotKind::Device {
            return Err(format!("{target} is not a device node"));
        }
        match self.call(VatSyscall::CallNow {
            target,
            method: method.to_string(),
            args,
        }) {
            SyscallResult::Data(data) => Ok(data),
            SyscallResult::Error(reason) => Err(reason),
            other => Err(format!("unexpected callNow result {other:?}")),
        }
    }
}

pub struct LocalWorker {
    program: Box<dyn VatProgram>,
    counters: Counters,
    incarnation: u64,
}

impl VatWorker for LocalWorker {
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<DeliveryResult, WorkerError> {
        let mut ctx = VatContext {
            syscalls,
            counters: &mut self.counters,
            incarnation: self.incarnation,
            issued: 0,
            settled: BTreeSet::new(),
        };
        let program = self.program.as_mut();
        let outcome = match delivery {
            VatDelivery::Message { target, message } => program.deliver_message(&mut ctx, target, message),
            VatDelivery::Notify { resolutions } => program.notify(&mut ctx, resolutions),
            VatDelivery::DropExports { vrefs } => program.drop_exports(&mut ctx, vrefs),
            VatDelivery::RetireExports { vrefs } => program.retire_exports(&mut ctx, vrefs),
            VatDelivery::RetireImports { vrefs } => program.retire_imports(&mut ctx, vrefs),
            VatDelivery::ChangeVatOptions { options } => program.change_vat_options(&mut ctx, options),
            VatDelivery::StartVat { vat_parameters } => program.start_vat(&mut ctx, vat_parameters),
            VatDelivery::BringOutYourDead => program.bring_out_your_dead(&mut ctx),
        };
        let outcome = match (outcome, delivery) {
            (
                Err(ProgramError::Rejected(reason)),
                VatDelivery::Message {
                    message: VatMessage { method, result, .. },
                    ..
                },
            ) => {
                log::debug!("{method} rejected: {reason}");
                if let Some(vpid) = result.filter(|vpid| !ctx.settled.contains(vpid)) {
                    ctx.reject(vpid, CapData::error(reason));
                }
                Ok(())
            }
            (outcome, _) => outcome,
        };
        let computrons = ctx.issued + 1;
        Ok(match outcome {
            Ok(()) => DeliveryResult::ok(computrons),
            Err(ProgramError::Rejected(reason) | ProgramError::Fatal(reason)) => {
                DeliveryResult::error(reason)
            }
        })
    }

    fn snapshot(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
        let Some(program) = self.program.snapshot() else {
            return Ok(None);
        };
        let snapshot = LocalSnapshot {
            counters: self.counters,
            program,
        };
        let bytes = swingset_store::to_canonical_cbor(&snapshot).map_err(anyhow::Error::from)?;
        Ok(Some(bytes))
    }
}

type ProgramCtor = Box<dyn Fn() -> Box<dyn VatProgram> + Send + Sync>;

/// Spawns `LocalWorker`s for registered bundle names.
#[derive(Default)]
pub struct LocalWorkerFactory {
    programs: BTreeMap<String, ProgramCtor>,
}

impl LocalWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, bundle: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn VatProgram> + Send + Sync + 'static,
    {
        self.programs.insert(bundle.into(), Box::new(ctor));
        self
    }

    pub fn with_program<F>(mut self, bundle: impl Into<String>, ctor: F) -> Self
    where
        F: Fn() -> Box<dyn VatProgram> + Send + Sync + 'static,
    {
        self.register(bundle, ctor);
        self
    }
}

impl WorkerFactory for LocalWorkerFactory {
    fn spawn(&self, spec: &WorkerSpec<'_>) -> Result<Box<dyn VatWorker>, WorkerError> {
        let ctor = self
            .programs
            .get(&spec.source.bundle)
            .ok_or_else(|| WorkerError::UnknownBundle(spec.source.bundle.clone()))?;
        let mut program = ctor();
        let mut counters = Counters::default();
        if let Some(bytes) = spec.snapshot {
            let snapshot: LocalSnapshot =
                serde_cbor::from_slice(bytes).map_err(|err| WorkerError::Restore(err.to_string()))?;
            program
                .restore(&snapshot.program)
                .map_err(|err| WorkerError::Restore(err.to_string()))?;
            counters = snapshot.counters;
        }
        log::debug!(
            "spawned local worker for {} ({}, incarnation {})",
            spec.vat_id,
            spec.source.bundle,
            spec.incarnation
        );
        Ok(Box::new(LocalWorker {
            program,
            counters,
            incarnation: spec.incarnation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::VatId;
    use crate::options::VatOptions;
    use crate::worker::{DeliveryOutcome, VatSource};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<VatSyscall>,
    }

    impl SyscallHandler for Recorder {
        fn syscall(&mut self, call: VatSyscall) -> SyscallResult {
            let result = match &call {
                VatSyscall::VatstoreGet { .. } => SyscallResult::Value(Some("41".into())),
                _ => SyscallResult::Ok,
            };
            self.calls.push(call);
            result
        }
    }

    #[derive(Default)]
    struct Echo {
        seen: u64,
    }

    impl VatProgram for Echo {
        fn deliver_message(
            &mut self,
            ctx: &mut VatContext<'_>,
            _target: &VatSlot,
            message: &VatMessage,
        ) -> ProgramResult {
            match message.method.as_str() {
                "fail" => return Err("asked to fail".into()),
                "crash" => return Err(ProgramError::Fatal("asked to crash".into())),
                _ => {}
            }
            self.seen += 1;
            let stored: u64 = ctx
                .vatstore_get("n")
                .and_then(|n| n.parse().ok())
                .unwrap_or_default();
            ctx.vatstore_set("n", &(stored + 1).to_string());
            if let Some(result) = message.result {
                ctx.resolve(result, CapData::from_json(&Value::from(self.seen), Vec::new()));
            }
            Ok(())
        }

        fn snapshot(&self) -> Option<Vec<u8>> {
            Some(self.seen.to_le_bytes().to_vec())
        }

        fn restore(&mut self, snapshot: &[u8]) -> ProgramResult {
            let bytes: [u8; 8] = snapshot.try_into().map_err(|_| "bad snapshot".to_string())?;
            self.seen = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    fn factory() -> LocalWorkerFactory {
        LocalWorkerFactory::new().with_program("echo", || Box::new(Echo::default()))
    }

    fn spec<'a>(source: &'a VatSource, options: &'a VatOptions, snapshot: Option<&'a [u8]>) -> WorkerSpec<'a> {
        WorkerSpec {
            vat_id: VatId(1),
            source,
            options,
            incarnation: 0,
            snapshot,
        }
    }

    fn message(method: &str) -> VatDelivery {
        VatDelivery::Message {
            target: VatSlot::root(),
            message: VatMessage {
                method: method.into(),
                args: CapData::undefined(),
                result: Some("p-60".parse().unwrap()),
            },
        }
    }

    #[test]
    fn unknown_bundles_fail_to_spawn() {
        let source = VatSource::bundle("missing");
        let options = VatOptions::default();
        let err = factory().spawn(&spec(&source, &options, None)).err().unwrap();
        assert!(matches!(err, WorkerError::UnknownBundle(name) if name == "missing"));
    }

    #[test]
    fn deliveries_issue_syscalls_through_the_handler() {
        let source = VatSource::bundle("echo");
        let options = VatOptions::default();
        let mut worker = factory().spawn(&spec(&source, &options, None)).unwrap();
        let mut recorder = Recorder::default();
        let result = worker.deliver(&message("ping"), &mut recorder).unwrap();
        assert_eq!(result.outcome, DeliveryOutcome::Ok);
        assert_eq!(result.computrons, 4);
        assert!(matches!(
            &recorder.calls[1],
            VatSyscall::VatstoreSet { value, .. } if value == "42"
        ));

        let crashed = worker.deliver(&message("crash"), &mut recorder).unwrap();
        assert_eq!(crashed.outcome, DeliveryOutcome::Error("asked to crash".into()));
    }

    #[test]
    fn refused_messages_reject_their_result() {
        let source = VatSource::bundle("echo");
        let options = VatOptions::default();
        let mut worker = factory().spawn(&spec(&source, &options, None)).unwrap();
        let mut recorder = Recorder::default();
        let failed = worker.deliver(&message("fail"), &mut recorder).unwrap();
        assert_eq!(failed.outcome, DeliveryOutcome::Ok);
        let [VatSyscall::Resolve { resolutions }] = recorder.calls.as_slice() else {
            panic!("expected one resolve, got {:?}", recorder.calls);
        };
        assert_eq!(resolutions[0].vpid, "p-60".parse().unwrap());
        assert!(resolutions[0].rejected);
        assert_eq!(resolutions[0].data.error_message().as_deref(), Some("asked to fail"));
    }

    #[test]
    fn snapshots_restore_program_state_and_counters() {
        let source = VatSource::bundle("echo");
        let options = VatOptions::default();
        let factory = factory();
        let mut worker = factory.spawn(&spec(&source, &options, None)).unwrap();
        let mut recorder = Recorder::default();
        worker.deliver(&message("ping"), &mut recorder).unwrap();
        worker.deliver(&message("ping"), &mut recorder).unwrap();
        let bytes = worker.snapshot().unwrap().unwrap();

        let mut restored = factory.spawn(&spec(&source, &options, Some(&bytes))).unwrap();
        let mut recorder = Recorder::default();
        restored.deliver(&message("ping"), &mut recorder).unwrap();
        let resolved = recorder.calls.iter().find_map(|call| match call {
            VatSyscall::Resolve { resolutions } => Some(resolutions[0].data.body.clone()),
            _ => None,
        });
        assert_eq!(resolved.as_deref(), Some("#3"));
    }
}
