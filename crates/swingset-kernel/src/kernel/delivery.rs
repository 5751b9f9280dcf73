//! Delivering events to vat workers, and keeping those workers loaded.

use crate::capdata::{CapData, Message};
use crate::clist::MapOpts;
use crate::error::KernelError;
use crate::ids::{KPid, KRef, KernelSlot, VatId};
use crate::object_table::PromiseState;
use crate::options::VatOptionChanges;
use crate::state::{KernelState, ReapDirt, SnapshotInfo};
use crate::transcript::{ReplayHandler, TranscriptEntry};
use crate::worker::{
    DeliveryOutcome, VatDelivery, VatMessage, VatResolution, VatWorker, WorkerError, WorkerSpec,
};

use super::Kernel;
use super::crank::{CrankKind, CrankOutcome, Termination};
use super::syscall::CrankSyscalls;

/// Promise forwarding chains longer than this are treated as a cycle.
const MAX_FORWARDING_HOPS: usize = 100;

pub(crate) enum DeliveryProblem {
    /// The vat made a syscall the kernel refused.
    Illegal(String),
    /// The worker reported an error or crashed.
    Failed(String),
    /// The vat asked to be terminated.
    Exit {
        failure: bool,
        info: CapData<KernelSlot>,
    },
}

pub(crate) struct DeliveryStatus {
    pub computrons: u64,
    pub problem: Option<DeliveryProblem>,
}

impl Kernel {
    /// Run one delivery on the vat's worker, servicing its syscalls against
    /// kernel state and recording the transcript entry.
    pub(crate) fn deliver_to_vat(
        &mut self,
        vat_id: VatId,
        delivery: VatDelivery,
    ) -> Result<DeliveryStatus, KernelError> {
        self.ensure_worker(vat_id)?;
        self.touched.insert(vat_id);
        log::trace!("delivering {} to {vat_id}", delivery.kind());

        let Kernel {
            state,
            workers,
            devices,
            ..
        } = self;
        let worker = workers
            .get_mut(&vat_id)
            .ok_or_else(|| KernelError::invariant(format!("no worker loaded for {vat_id}")))?;
        let mut syscalls = CrankSyscalls::new(vat_id, state, devices);
        let delivered = worker.deliver(&delivery, &mut syscalls);
        let report = syscalls.finish();
        if let Some(fatal) = report.fatal {
            return Err(fatal);
        }
        let result = match delivered {
            Ok(result) => result,
            Err(err) => {
                log::warn!("worker for {vat_id} failed during {}: {err}", delivery.kind());
                return Ok(DeliveryStatus {
                    computrons: 0,
                    problem: Some(DeliveryProblem::Failed(err.to_string())),
                });
            }
        };

        let vat = self.state.vat_mut(vat_id)?;
        let position = vat.transcript_end;
        vat.transcript_end += 1;
        let computrons = result.computrons;
        let outcome = result.outcome.clone();
        self.pending_transcripts.push((
            vat_id,
            position,
            TranscriptEntry {
                delivery,
                syscalls: report.recorded,
                result,
            },
        ));

        let problem = if let Some(reason) = report.illegal {
            Some(DeliveryProblem::Illegal(reason))
        } else if let DeliveryOutcome::Error(reason) = outcome {
            Some(DeliveryProblem::Failed(reason))
        } else {
            report
                .exit
                .map(|(failure, info)| DeliveryProblem::Exit { failure, info })
        };
        Ok(DeliveryStatus { computrons, problem })
    }

    /// Turn a delivery status into the crank's outcome. Failures roll the
    /// delivery back and terminate the vat; `result` is rejected too.
    pub(crate) fn settle_delivery(
        vat_id: VatId,
        status: DeliveryStatus,
        result: Option<KPid>,
    ) -> CrankOutcome {
        let outcome = CrankOutcome::delivered(vat_id, status.computrons);
        match status.problem {
            None => outcome,
            Some(DeliveryProblem::Illegal(reason)) | Some(DeliveryProblem::Failed(reason)) => {
                let reason = CapData::error(reason);
                CrankOutcome {
                    kind: CrankKind::Failed,
                    abort: true,
                    terminate: Some(Termination {
                        vat_id,
                        reason: reason.clone(),
                    }),
                    ..outcome
                }
                .reject(result, reason)
            }
            Some(DeliveryProblem::Exit { failure: false, info }) => CrankOutcome {
                terminate: Some(Termination { vat_id, reason: info }),
                ..outcome
            },
            Some(DeliveryProblem::Exit { failure: true, info }) => {
                // slots mapped during the rolled-back delivery no longer exist
                let info = CapData::new(info.body, Vec::new());
                CrankOutcome {
                    kind: CrankKind::Failed,
                    abort: true,
                    terminate: Some(Termination {
                        vat_id,
                        reason: info.clone(),
                    }),
                    ..outcome
                }
                .reject(result, info)
            }
        }
    }

    /// Load the vat's worker if it is not running: restore the latest
    /// snapshot, then replay the transcript since.
    pub(crate) fn ensure_worker(&mut self, vat_id: VatId) -> Result<(), KernelError> {
        if self.workers.contains_key(&vat_id) {
            return Ok(());
        }
        let mut worker = self
            .spawn_worker(vat_id)
            .map_err(|source| KernelError::Worker { vat_id, source })?;

        let vat = self.state.vat(vat_id)?;
        let (start, end) = (vat.transcript_start, vat.transcript_end);
        // entries from earlier in this crank are not in the store yet
        let pending: Vec<(u64, TranscriptEntry)> = self
            .pending_transcripts
            .iter()
            .filter(|(holder, position, _)| *holder == vat_id && *position >= start)
            .map(|(_, position, entry)| (*position, entry.clone()))
            .collect();
        let committed_end = pending.first().map_or(end, |(position, _)| *position);
        let mut entries = self.storage.read_transcript(vat_id, start, committed_end)?;
        entries.extend(pending.into_iter().map(|(_, entry)| entry));

        for entry in &entries {
            replay_entry(vat_id, worker.as_mut(), entry)?;
        }
        if !entries.is_empty() {
            log::debug!("replayed {} deliveries into {vat_id}", entries.len());
        }
        self.workers.insert(vat_id, worker);
        Ok(())
    }

    /// Start a worker for the vat's current incarnation from its latest
    /// snapshot, without replay.
    pub(crate) fn spawn_worker(&self, vat_id: VatId) -> Result<Box<dyn VatWorker>, WorkerError> {
        let Some(vat) = self.state.vats.get(&vat_id) else {
            return Err(WorkerError::Internal(anyhow::anyhow!("{vat_id} does not exist")));
        };
        let manager_type = vat
            .options
            .manager_type
            .clone()
            .unwrap_or_else(|| self.state.options.default_manager_type.clone());
        let factory = self
            .factories
            .get(&manager_type)
            .ok_or(WorkerError::UnknownManagerType(manager_type))?;
        let snapshot = match &vat.last_snapshot {
            Some(info) => Some(
                self.storage
                    .load_snapshot(info.hash)
                    .map_err(|err| WorkerError::Restore(err.to_string()))?,
            ),
            None => None,
        };
        factory.spawn(&WorkerSpec {
            vat_id,
            source: &vat.source,
            options: &vat.options,
            incarnation: vat.incarnation,
            snapshot: snapshot.as_deref(),
        })
    }

    /// Snapshot the vat once enough deliveries have piled up since the last
    /// one, so a restart replays a bounded transcript.
    pub(crate) fn maybe_snapshot(&mut self, vat_id: VatId) -> Result<(), KernelError> {
        let Some(vat) = self.state.vats.get(&vat_id) else {
            return Ok(());
        };
        let threshold = match vat.last_snapshot {
            None => self.state.options.snapshot_initial,
            Some(_) => vat
                .options
                .snapshot_interval
                .unwrap_or(self.state.options.snapshot_interval),
        };
        if threshold == 0 || vat.transcript_span() < threshold {
            return Ok(());
        }
        let Some(worker) = self.workers.get_mut(&vat_id) else {
            return Ok(());
        };
        let bytes = match worker.snapshot() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(err) => {
                log::warn!("snapshot of {vat_id} failed: {err}");
                return Ok(());
            }
        };
        let size = bytes.len();
        let hash = self.storage.save_snapshot(bytes);
        let vat = self.state.vat_mut(vat_id)?;
        log::debug!(
            "snapshotted {vat_id} at transcript position {} ({size} bytes, {hash})",
            vat.transcript_end
        );
        vat.last_snapshot = Some(SnapshotInfo {
            snap_pos: vat.transcript_end,
            hash,
        });
        vat.transcript_start = vat.transcript_end;
        Ok(())
    }

    pub(crate) fn process_send(&mut self, target: KernelSlot, msg: Message) -> Result<CrankOutcome, KernelError> {
        let mut target = target;
        for _ in 0..MAX_FORWARDING_HOPS {
            match target {
                KernelSlot::Object(kref) => return self.send_to_object(kref, msg),
                KernelSlot::Device(node) => {
                    return self.splat(&msg, CapData::error(format!("cannot send to device node {node}")));
                }
                KernelSlot::Promise(kpid) => {
                    let record = self
                        .state
                        .objects
                        .promise(kpid)
                        .ok_or(KernelError::UnknownPromise(kpid))?;
                    match &record.state {
                        PromiseState::Fulfilled(data) => match data.single_slot() {
                            Some(slot @ (KernelSlot::Object(_) | KernelSlot::Promise(_))) => target = slot,
                            _ => {
                                let reason = format!(
                                    "data is not callable, has no method {}",
                                    msg.method
                                );
                                return self.splat(&msg, CapData::error(reason));
                            }
                        },
                        PromiseState::Rejected(data) => {
                            let data = data.clone();
                            return self.splat(&msg, data);
                        }
                        PromiseState::Unresolved { decider, .. } => {
                            let pipeline_to = decider.filter(|decider| {
                                self.state
                                    .vats
                                    .get(decider)
                                    .is_some_and(|vat| vat.options.enable_pipelining)
                            });
                            return match pipeline_to {
                                Some(decider) => self.deliver_message(decider, target, msg),
                                None => {
                                    self.state.add_message_to_promise_queue(kpid, msg)?;
                                    Ok(CrankOutcome::empty())
                                }
                            };
                        }
                    }
                }
            }
        }
        self.splat(&msg, CapData::error("promise forwarding cycle"))
    }

    fn send_to_object(&mut self, kref: KRef, msg: Message) -> Result<CrankOutcome, KernelError> {
        match self.state.objects.owner_of(kref) {
            Some(owner) if self.state.is_live(owner) => {
                self.deliver_message(owner, KernelSlot::Object(kref), msg)
            }
            _ => self.splat(&msg, CapData::error("vat terminated")),
        }
    }

    /// Reject the message's result without delivering it.
    fn splat(&mut self, msg: &Message, reason: CapData<KernelSlot>) -> Result<CrankOutcome, KernelError> {
        log::debug!("message {} cannot be delivered: {}", msg.method, reason.body);
        if let Some(result) = msg.result {
            self.state.resolve_to_error(result, reason)?;
        }
        Ok(CrankOutcome::empty())
    }

    fn deliver_message(
        &mut self,
        vat_id: VatId,
        target: KernelSlot,
        msg: Message,
    ) -> Result<CrankOutcome, KernelError> {
        let Some(target_vref) = self.state.vat(vat_id)?.clist.vref(target) else {
            return self.splat(&msg, CapData::error(format!("{target} is not known to {vat_id}")));
        };
        let args = self.state.capdata_to_vat(vat_id, &msg.args)?;
        let result = match msg.result {
            Some(kpid) => {
                match &mut self.state.objects.promise_mut(kpid)?.state {
                    PromiseState::Unresolved { decider, .. } if decider.is_none() => {
                        *decider = Some(vat_id);
                    }
                    _ => {
                        return Err(KernelError::invariant(format!(
                            "result promise {kpid} is already decided"
                        )));
                    }
                }
                Some(self.state.kernel_to_vat(vat_id, kpid.into(), MapOpts::default())?)
            }
            None => None,
        };
        let delivery = VatDelivery::Message {
            target: target_vref,
            message: VatMessage {
                method: msg.method,
                args,
                result,
            },
        };
        let status = self.deliver_to_vat(vat_id, delivery)?;
        Ok(Self::settle_delivery(vat_id, status, msg.result).with_dirt(1, 0))
    }

    pub(crate) fn process_notify(&mut self, vat_id: VatId, kpid: KPid) -> Result<CrankOutcome, KernelError> {
        let Some(vat) = self.state.vats.get(&vat_id) else {
            return Ok(CrankOutcome::empty());
        };
        let Some(vpid) = vat.clist.vref(kpid.into()) else {
            return Ok(CrankOutcome::empty());
        };
        let record = self
            .state
            .objects
            .promise(kpid)
            .ok_or(KernelError::UnknownPromise(kpid))?;
        let (rejected, data) = match &record.state {
            PromiseState::Fulfilled(data) => (false, data.clone()),
            PromiseState::Rejected(data) => (true, data.clone()),
            PromiseState::Unresolved { .. } => {
                return Err(KernelError::invariant(format!("notify of unresolved {kpid}")));
            }
        };
        let data = self.state.capdata_to_vat(vat_id, &data)?;
        // the vat forgets a vpid once it hears the resolution
        self.state.delete_clist_entry(vat_id, kpid.into())?;
        let delivery = VatDelivery::Notify {
            resolutions: vec![VatResolution {
                vpid,
                rejected,
                data,
            }],
        };
        let status = self.deliver_to_vat(vat_id, delivery)?;
        Ok(Self::settle_delivery(vat_id, status, None).with_dirt(1, 0))
    }

    pub(crate) fn process_drop_exports(
        &mut self,
        vat_id: VatId,
        krefs: Vec<KRef>,
    ) -> Result<CrankOutcome, KernelError> {
        let mut vrefs = Vec::new();
        for kref in krefs {
            let KernelState { vats, objects, .. } = &mut self.state;
            let Some(vat) = vats.get_mut(&vat_id) else {
                return Ok(CrankOutcome::empty());
            };
            if let Some(vref) = vat.clist.vref(kref.into()) {
                vat.clist.clear_reachable_flag(kref.into(), objects)?;
                vrefs.push(vref);
            }
        }
        self.deliver_gc(vat_id, VatDelivery::DropExports { vrefs })
    }

    pub(crate) fn process_retire_exports(
        &mut self,
        vat_id: VatId,
        krefs: Vec<KRef>,
    ) -> Result<CrankOutcome, KernelError> {
        let mut vrefs = Vec::new();
        for kref in krefs {
            if let Some(vref) = self.state.delete_clist_entry(vat_id, kref.into())? {
                vrefs.push(vref);
            }
            self.state.objects.delete_object(kref);
        }
        self.deliver_gc(vat_id, VatDelivery::RetireExports { vrefs })
    }

    pub(crate) fn process_retire_imports(
        &mut self,
        vat_id: VatId,
        krefs: Vec<KRef>,
    ) -> Result<CrankOutcome, KernelError> {
        let mut vrefs = Vec::new();
        for kref in krefs {
            if let Some(vref) = self.state.delete_clist_entry(vat_id, kref.into())? {
                vrefs.push(vref);
            }
        }
        self.deliver_gc(vat_id, VatDelivery::RetireImports { vrefs })
    }

    fn deliver_gc(&mut self, vat_id: VatId, delivery: VatDelivery) -> Result<CrankOutcome, KernelError> {
        let count = match &delivery {
            VatDelivery::DropExports { vrefs }
            | VatDelivery::RetireExports { vrefs }
            | VatDelivery::RetireImports { vrefs } => vrefs.len() as u64,
            _ => 0,
        };
        if count == 0 || !self.state.is_live(vat_id) {
            return Ok(CrankOutcome::empty());
        }
        let status = self.deliver_to_vat(vat_id, delivery)?;
        Ok(Self::settle_delivery(vat_id, status, None).with_dirt(1, count))
    }

    pub(crate) fn process_bring_out_your_dead(&mut self, vat_id: VatId) -> Result<CrankOutcome, KernelError> {
        if !self.state.is_live(vat_id) {
            return Ok(CrankOutcome::empty());
        }
        self.state.vat_mut(vat_id)?.reap_dirt = ReapDirt::default();
        let status = self.deliver_to_vat(vat_id, VatDelivery::BringOutYourDead)?;
        Ok(Self::settle_delivery(vat_id, status, None))
    }

    pub(crate) fn process_change_vat_options(
        &mut self,
        vat_id: VatId,
        changes: VatOptionChanges,
    ) -> Result<CrankOutcome, KernelError> {
        let Some(vat) = self.state.vats.get_mut(&vat_id) else {
            return Ok(CrankOutcome::empty());
        };
        changes.apply(&mut vat.options);
        log::info!("changed options of {vat_id}");
        let delivery = VatDelivery::ChangeVatOptions {
            options: changes.forwarded,
        };
        let status = self.deliver_to_vat(vat_id, delivery)?;
        Ok(Self::settle_delivery(vat_id, status, None))
    }
}

fn replay_entry(
    vat_id: VatId,
    worker: &mut dyn VatWorker,
    entry: &TranscriptEntry,
) -> Result<(), KernelError> {
    let mut handler = ReplayHandler::new(vat_id, entry);
    let result = worker
        .deliver(&entry.delivery, &mut handler)
        .map_err(|source| KernelError::Worker { vat_id, source })?;
    handler.finish()?;
    if result.outcome != entry.result.outcome {
        return Err(KernelError::TranscriptDivergence {
            vat_id,
            detail: format!(
                "{} delivery ended {:?}, transcript recorded {:?}",
                entry.delivery.kind(),
                result.outcome,
                entry.result.outcome
            ),
        });
    }
    Ok(())
}
