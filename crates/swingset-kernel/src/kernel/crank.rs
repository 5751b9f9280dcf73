//! The crank loop: pick one event, process it against a savepoint, run GC
//! bookkeeping and commit. A crank may instead spend a cleanup budget on a
//! terminated vat.

use crate::capdata::CapData;
use crate::error::KernelError;
use crate::ids::{KPid, KernelSlot, VatId};
use crate::policy::{CleanupBudget, CleanupWork, PolicyInput, RunPolicy};
use crate::run_queue::RunQueueEvent;
use crate::state::StateMark;

use super::Kernel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CrankKind {
    Delivered,
    VatCreated,
    Failed,
    Cleanup,
    #[default]
    Empty,
}

pub(crate) struct Termination {
    pub vat_id: VatId,
    pub reason: CapData<KernelSlot>,
}

/// What processing one event asks the crank to do once the worker has
/// returned.
#[derive(Default)]
pub(crate) struct CrankOutcome {
    pub kind: CrankKind,
    pub vat_id: Option<VatId>,
    pub computrons: u64,
    /// Roll back to the delivery savepoint. The event stays consumed.
    pub abort: bool,
    /// Rejections applied after any rollback.
    pub rejections: Vec<(KPid, CapData<KernelSlot>)>,
    pub terminate: Option<Termination>,
    /// Reap dirt as (deliveries, gc krefs).
    pub dirt: Option<(u64, u64)>,
}

impl CrankOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn delivered(vat_id: VatId, computrons: u64) -> Self {
        Self {
            kind: CrankKind::Delivered,
            vat_id: Some(vat_id),
            computrons,
            ..Self::default()
        }
    }

    pub fn with_dirt(mut self, deliveries: u64, gc_krefs: u64) -> Self {
        self.dirt = Some((deliveries, gc_krefs));
        self
    }

    pub fn reject(mut self, kpid: Option<KPid>, reason: CapData<KernelSlot>) -> Self {
        if let Some(kpid) = kpid {
            self.rejections.push((kpid, reason));
        }
        self
    }
}

pub(crate) struct Savepoint {
    state: StateMark,
    transcripts: usize,
}

pub(crate) struct CrankReport {
    pub kind: CrankKind,
    pub input: PolicyInput,
    pub cleanup: CleanupWork,
}

impl Kernel {
    /// Run a single crank. Returns whether any work remains.
    pub fn step(&mut self) -> Result<bool, KernelError> {
        self.crank(Some(CleanupBudget::unlimited()))?;
        Ok(self.has_work())
    }

    /// Crank until the queues drain or `policy` says stop. Returns the
    /// number of cranks run. Terminated vats are only cleaned up while the
    /// policy hands out a budget for it.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> Result<u64, KernelError> {
        let mut cranks = 0;
        loop {
            let budget = policy.allow_cleanup();
            let Some(report) = self.crank(budget)? else {
                break;
            };
            cranks += 1;
            let keep_going = match report.kind {
                CrankKind::Delivered => policy.crank_complete(&report.input),
                CrankKind::VatCreated => policy.vat_created(&report.input),
                CrankKind::Failed => policy.crank_failed(&report.input),
                CrankKind::Cleanup => policy.did_cleanup(&report.cleanup),
                CrankKind::Empty => policy.empty_crank(),
            };
            if !keep_going {
                break;
            }
        }
        Ok(cranks)
    }

    pub fn has_work(&self) -> bool {
        !self.state.gc_actions.is_empty()
            || !self.state.reap_queue.is_empty()
            || !self.state.run_queue.is_empty()
            || !self.state.dead_vats.is_empty()
    }

    fn crank(&mut self, cleanup: Option<CleanupBudget>) -> Result<Option<CrankReport>, KernelError> {
        self.check_panic()?;
        let start = self.savepoint();
        match self.run_crank(cleanup) {
            Ok(report) => Ok(report),
            Err(err) if err.is_fatal() => {
                log::error!("kernel panic at crank {}: {err}", self.state.crank_number);
                self.panic = Some(err.to_string());
                self.pending_transcripts.clear();
                self.storage.abort();
                Err(err)
            }
            Err(err) => {
                // the event is retried by the next crank
                log::warn!("crank {} abandoned: {err}", self.state.crank_number);
                self.storage.abort();
                self.restore(start);
                Err(err)
            }
        }
    }

    fn run_crank(&mut self, cleanup: Option<CleanupBudget>) -> Result<Option<CrankReport>, KernelError> {
        self.touched.clear();
        if let (Some(budget), Some(vat_id)) = (cleanup, self.state.next_dead_vat()) {
            return self.cleanup_crank(vat_id, &budget).map(Some);
        }
        let Some(event) = self.next_event()? else {
            return Ok(None);
        };
        log::debug!(
            "crank {}: {} {:?}",
            self.state.crank_number,
            event.kind(),
            event.vat_id()
        );
        let deliver_point = self.savepoint();
        let outcome = self.process_event(event)?;

        if outcome.abort {
            self.restore(deliver_point);
        } else if let (Some(vat_id), Some((deliveries, gc_krefs))) = (outcome.vat_id, outcome.dirt) {
            self.state.add_dirt(vat_id, deliveries, gc_krefs);
        }
        for (kpid, reason) in outcome.rejections {
            self.state.resolve_to_error(kpid, reason)?;
        }
        match outcome.terminate {
            Some(Termination { vat_id, reason }) => self.terminate_vat_now(vat_id, reason)?,
            None => {
                if let (Some(vat_id), false) = (outcome.vat_id, outcome.abort) {
                    self.maybe_snapshot(vat_id)?;
                }
            }
        }

        self.state.process_refcounts()?;
        self.state.crank_number += 1;
        let transcripts = std::mem::take(&mut self.pending_transcripts);
        self.storage.commit(&mut self.state, transcripts)?;
        self.touched.clear();
        Ok(Some(CrankReport {
            kind: outcome.kind,
            input: PolicyInput {
                vat_id: outcome.vat_id,
                computrons: outcome.computrons,
            },
            cleanup: CleanupWork::default(),
        }))
    }

    /// Release one budget's worth of a terminated vat. The transcript goes
    /// last, together with the record itself.
    fn cleanup_crank(&mut self, vat_id: VatId, budget: &CleanupBudget) -> Result<CrankReport, KernelError> {
        let (mut work, done) = self.state.cleanup_terminated_vat(vat_id, budget)?;
        if done {
            self.storage.delete_transcript(vat_id);
            work.transcripts += 1;
            self.state.forget_dead_vat(vat_id);
            log::info!("finished cleaning up {vat_id}");
        } else {
            log::debug!("cleaning up {vat_id}: {} items released", work.total());
        }
        self.state.process_refcounts()?;
        self.state.crank_number += 1;
        self.storage.commit(&mut self.state, Vec::new())?;
        Ok(CrankReport {
            kind: CrankKind::Cleanup,
            input: PolicyInput::default(),
            cleanup: work,
        })
    }

    /// GC actions first, then reaps, then the run queue.
    fn next_event(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        if let Some(event) = self.state.next_gc_action_event() {
            return Ok(Some(event));
        }
        if let Some(vat_id) = self.state.reap_queue.pop_first() {
            return Ok(Some(RunQueueEvent::BringOutYourDead { vat_id }));
        }
        self.state.dequeue()
    }

    fn process_event(&mut self, event: RunQueueEvent) -> Result<CrankOutcome, KernelError> {
        match event {
            RunQueueEvent::Send { target, msg } => self.process_send(target, msg),
            RunQueueEvent::Notify { vat_id, kpid } => self.process_notify(vat_id, kpid),
            RunQueueEvent::CreateVat {
                vat_id,
                source,
                options,
                vat_parameters,
                result,
            } => self.process_create_vat(vat_id, source, options, vat_parameters, result),
            RunQueueEvent::StartVat {
                vat_id,
                vat_parameters,
            } => self.process_start_vat(vat_id, vat_parameters),
            RunQueueEvent::UpgradeVat {
                vat_id,
                source,
                vat_parameters,
                upgrade_message,
                result,
            } => self.process_upgrade_vat(vat_id, source, vat_parameters, upgrade_message, result),
            RunQueueEvent::TerminateVat { vat_id, reason } => {
                if !self.state.is_live(vat_id) {
                    return Ok(CrankOutcome::empty());
                }
                Ok(CrankOutcome {
                    terminate: Some(Termination {
                        vat_id,
                        reason: CapData::error(reason),
                    }),
                    ..CrankOutcome::delivered(vat_id, 0)
                })
            }
            RunQueueEvent::ChangeVatOptions { vat_id, changes } => {
                self.process_change_vat_options(vat_id, changes)
            }
            RunQueueEvent::BringOutYourDead { vat_id } => self.process_bring_out_your_dead(vat_id),
            RunQueueEvent::DropExports { vat_id, krefs } => self.process_drop_exports(vat_id, krefs),
            RunQueueEvent::RetireExports { vat_id, krefs } => {
                self.process_retire_exports(vat_id, krefs)
            }
            RunQueueEvent::RetireImports { vat_id, krefs } => {
                self.process_retire_imports(vat_id, krefs)
            }
        }
    }

    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            state: self.state.mark(),
            transcripts: self.pending_transcripts.len(),
        }
    }

    /// Roll state back and discard every worker that ran since, so the next
    /// delivery rebuilds it from the committed transcript.
    pub(crate) fn restore(&mut self, savepoint: Savepoint) {
        self.state.rollback(savepoint.state);
        self.pending_transcripts.truncate(savepoint.transcripts);
        let touched = std::mem::take(&mut self.touched);
        for vat_id in touched {
            self.evict_worker(vat_id);
        }
    }

    /// Stop a vat and release its worker. Its c-list, vatstore and
    /// transcript are left for cleanup cranks. A critical vat takes the
    /// kernel down with it.
    pub(crate) fn terminate_vat_now(
        &mut self,
        vat_id: VatId,
        reason: CapData<KernelSlot>,
    ) -> Result<(), KernelError> {
        let Some(vat) = self.state.vats.get(&vat_id) else {
            return Ok(());
        };
        let critical = vat.options.critical;
        let name = vat.name().unwrap_or("unnamed").to_string();
        if !self.state.terminate_vat_state(vat_id, reason.clone())? {
            return Ok(());
        }
        self.evict_worker(vat_id);
        self.pending_transcripts.retain(|(holder, _, _)| *holder != vat_id);
        log::info!("terminated {vat_id} ({name}): {}", reason.body);
        if critical {
            return Err(KernelError::CriticalVatFailure {
                vat_id,
                reason: reason.error_message().unwrap_or(reason.body),
            });
        }
        Ok(())
    }
}
