//! Starting, creating and upgrading vats.

use serde_json::{Value, json};

use crate::capdata::CapData;
use crate::clist::MapOpts;
use crate::error::KernelError;
use crate::ids::{KPid, KernelSlot, VatId, VatSlot};
use crate::options::VatOptions;
use crate::state::{ReapDirt, VatLifecycle, VatRecord};
use crate::worker::{VatDelivery, VatSource};

use super::Kernel;
use super::crank::{CrankKind, CrankOutcome};
use super::delivery::DeliveryProblem;

impl Kernel {
    pub(crate) fn process_start_vat(
        &mut self,
        vat_id: VatId,
        vat_parameters: Value,
    ) -> Result<CrankOutcome, KernelError> {
        if !self.state.is_live(vat_id) {
            return Ok(CrankOutcome::empty());
        }
        let status = self.deliver_to_vat(vat_id, VatDelivery::StartVat { vat_parameters })?;
        let outcome = Self::settle_delivery(vat_id, status, None);
        if !outcome.abort {
            self.state.vat_mut(vat_id)?.lifecycle = VatLifecycle::Active;
            log::info!("started {vat_id}");
        }
        Ok(outcome)
    }

    pub(crate) fn process_create_vat(
        &mut self,
        vat_id: VatId,
        source: VatSource,
        options: VatOptions,
        vat_parameters: Value,
        result: KPid,
    ) -> Result<CrankOutcome, KernelError> {
        let failed = |reason: String| {
            log::warn!("creating {vat_id} failed: {reason}");
            CrankOutcome {
                kind: CrankKind::Failed,
                vat_id: Some(vat_id),
                abort: true,
                ..CrankOutcome::empty()
            }
            .reject(Some(result), CapData::error(reason))
        };
        if let Some(name) = &options.name {
            if self.state.vat_names.contains_key(name) {
                return Ok(failed(format!("vat name '{name}' is already in use")));
            }
        }

        self.state
            .add_vat(VatRecord::new(vat_id, source, options, true));
        let worker = match self.spawn_worker(vat_id) {
            Ok(worker) => worker,
            Err(err) => return Ok(failed(err.to_string())),
        };
        self.workers.insert(vat_id, worker);
        self.touched.insert(vat_id);

        let status = self.deliver_to_vat(vat_id, VatDelivery::StartVat { vat_parameters })?;
        let computrons = status.computrons;
        match status.problem {
            None => {}
            Some(DeliveryProblem::Illegal(reason)) | Some(DeliveryProblem::Failed(reason)) => {
                return Ok(failed(reason));
            }
            Some(DeliveryProblem::Exit { .. }) => {
                return Ok(failed("vat exited during startVat".into()));
            }
        }

        self.state.vat_mut(vat_id)?.lifecycle = VatLifecycle::Active;
        let root = self
            .state
            .vat_to_kernel(vat_id, VatSlot::root(), MapOpts::default())?;
        self.state
            .do_resolve(None, vec![(result, false, CapData::slot(root))])?;
        log::info!("created {vat_id} with root {root}");
        Ok(CrankOutcome {
            kind: CrankKind::VatCreated,
            vat_id: Some(vat_id),
            computrons,
            ..CrankOutcome::empty()
        })
    }

    pub(crate) fn process_upgrade_vat(
        &mut self,
        vat_id: VatId,
        source: VatSource,
        vat_parameters: Value,
        upgrade_message: String,
        result: KPid,
    ) -> Result<CrankOutcome, KernelError> {
        if !self.state.is_live(vat_id) {
            self.state
                .resolve_to_error(result, CapData::error("vat terminated"))?;
            return Ok(CrankOutcome::empty());
        }

        let before_reap = self.savepoint();
        // let the old incarnation settle its garbage first
        let status = self.deliver_to_vat(vat_id, VatDelivery::BringOutYourDead)?;
        let mut computrons = status.computrons;
        if let Some(problem) = status.problem {
            let reason = match problem {
                DeliveryProblem::Illegal(reason) | DeliveryProblem::Failed(reason) => reason,
                DeliveryProblem::Exit { .. } => "vat exited before upgrade".into(),
            };
            self.restore(before_reap);
            return Ok(self.upgrade_failed(vat_id, result, reason));
        }
        self.state.vat_mut(vat_id)?.reap_dirt = ReapDirt::default();
        let before_upgrade = self.savepoint();

        let old_incarnation = self.state.vat(vat_id)?.incarnation;
        let disconnection = CapData::upgrade_disconnection(&upgrade_message, old_incarnation);
        for kpid in self.state.promises_decided_by(vat_id) {
            self.state
                .do_resolve(Some(vat_id), vec![(kpid, true, disconnection.clone())])?;
        }
        let vat = self.state.vat(vat_id)?;
        let promises: Vec<KernelSlot> = vat.clist.promises().collect();
        let abandoned: Vec<KernelSlot> = vat
            .clist
            .exports()
            .filter(|(_, vref)| !vref.is_root() && !vref.is_durable())
            .map(|(slot, _)| slot)
            .collect();
        for slot in promises {
            self.state.delete_clist_entry(vat_id, slot)?;
        }
        for slot in abandoned {
            self.state.delete_clist_entry(vat_id, slot)?;
            if let KernelSlot::Object(kref) = slot {
                self.state.objects.orphan_object(kref);
            }
        }

        let vat = self.state.vat_mut(vat_id)?;
        vat.incarnation += 1;
        vat.source = source;
        vat.transcript_start = vat.transcript_end;
        vat.last_snapshot = None;
        let incarnation = vat.incarnation;

        self.evict_worker(vat_id);
        match self.spawn_worker(vat_id) {
            Ok(worker) => {
                self.workers.insert(vat_id, worker);
                self.touched.insert(vat_id);
            }
            Err(err) => {
                self.restore(before_upgrade);
                return Ok(self.upgrade_failed(vat_id, result, err.to_string()));
            }
        }
        let status = self.deliver_to_vat(vat_id, VatDelivery::StartVat { vat_parameters })?;
        computrons += status.computrons;
        if let Some(problem) = status.problem {
            let reason = match problem {
                DeliveryProblem::Illegal(reason) | DeliveryProblem::Failed(reason) => reason,
                DeliveryProblem::Exit { .. } => "vat exited during startVat".into(),
            };
            self.restore(before_upgrade);
            return Ok(self.upgrade_failed(vat_id, result, reason));
        }

        self.state.vat_mut(vat_id)?.lifecycle = VatLifecycle::Active;
        self.state
            .do_resolve(None, vec![(result, false, CapData::from_json(&json!(incarnation), Vec::new()))])?;
        log::info!("upgraded {vat_id} to incarnation {incarnation}");
        Ok(CrankOutcome::delivered(vat_id, computrons))
    }

    /// The vat stays on its old incarnation.
    fn upgrade_failed(&mut self, vat_id: VatId, result: KPid, reason: String) -> CrankOutcome {
        log::warn!("upgrade of {vat_id} failed: {reason}");
        if let Some(vat) = self.state.vats.get_mut(&vat_id) {
            vat.lifecycle = VatLifecycle::Active;
        }
        let outcome = CrankOutcome {
            kind: CrankKind::Failed,
            vat_id: Some(vat_id),
            ..CrankOutcome::empty()
        };
        outcome.reject(Some(result), CapData::error(reason))
    }
}
