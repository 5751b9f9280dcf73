use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::Message;
use crate::ids::{KPid, KRef, KernelSlot, VatId};
use crate::options::{VatOptionChanges, VatOptions};
use crate::worker::VatSource;

/// Everything the scheduler can hand to a crank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum RunQueueEvent {
    Send {
        target: KernelSlot,
        msg: Message,
    },
    Notify {
        vat_id: VatId,
        kpid: KPid,
    },
    CreateVat {
        vat_id: VatId,
        source: VatSource,
        options: VatOptions,
        #[serde(default)]
        vat_parameters: Value,
        result: KPid,
    },
    StartVat {
        vat_id: VatId,
        #[serde(default)]
        vat_parameters: Value,
    },
    UpgradeVat {
        vat_id: VatId,
        source: VatSource,
        #[serde(default)]
        vat_parameters: Value,
        upgrade_message: String,
        result: KPid,
    },
    TerminateVat {
        vat_id: VatId,
        reason: String,
    },
    ChangeVatOptions {
        vat_id: VatId,
        changes: VatOptionChanges,
    },
    BringOutYourDead {
        vat_id: VatId,
    },
    DropExports {
        vat_id: VatId,
        krefs: Vec<KRef>,
    },
    RetireExports {
        vat_id: VatId,
        krefs: Vec<KRef>,
    },
    RetireImports {
        vat_id: VatId,
        krefs: Vec<KRef>,
    },
}

impl RunQueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueEvent::Send { .. } => "send",
            RunQueueEvent::Notify { .. } => "notify",
            RunQueueEvent::CreateVat { .. } => "create-vat",
            RunQueueEvent::StartVat { .. } => "start-vat",
            RunQueueEvent::UpgradeVat { .. } => "upgrade-vat",
            RunQueueEvent::TerminateVat { .. } => "terminate-vat",
            RunQueueEvent::ChangeVatOptions { .. } => "change-vat-options",
            RunQueueEvent::BringOutYourDead { .. } => "bringOutYourDead",
            RunQueueEvent::DropExports { .. } => "dropExports",
            RunQueueEvent::RetireExports { .. } => "retireExports",
            RunQueueEvent::RetireImports { .. } => "retireImports",
        }
    }

    /// The vat this event is addressed to, when that is known without
    /// routing.
    pub fn vat_id(&self) -> Option<VatId> {
        match self {
            RunQueueEvent::Send { .. } => None,
            RunQueueEvent::Notify { vat_id, .. }
            | RunQueueEvent::CreateVat { vat_id, .. }
            | RunQueueEvent::StartVat { vat_id, .. }
            | RunQueueEvent::UpgradeVat { vat_id, .. }
            | RunQueueEvent::TerminateVat { vat_id, .. }
            | RunQueueEvent::ChangeVatOptions { vat_id, .. }
            | RunQueueEvent::BringOutYourDead { vat_id }
            | RunQueueEvent::DropExports { vat_id, .. }
            | RunQueueEvent::RetireExports { vat_id, .. }
            | RunQueueEvent::RetireImports { vat_id, .. } => Some(*vat_id),
        }
    }

    /// Slots a queued copy of this event keeps alive.
    pub fn slots(&self) -> Vec<KernelSlot> {
        match self {
            RunQueueEvent::Send { target, msg } => {
                std::iter::once(*target).chain(msg.slots()).collect()
            }
            RunQueueEvent::Notify { kpid, .. } => vec![KernelSlot::Promise(*kpid)],
            RunQueueEvent::CreateVat { result, .. } | RunQueueEvent::UpgradeVat { result, .. } => {
                vec![KernelSlot::Promise(*result)]
            }
            _ => Vec::new(),
        }
    }
}

/// FIFO of pending events. `head` counts every event ever dequeued so the
/// persisted form can number entries stably; a queued event never changes
/// once it has a position.
#[derive(Clone, Debug, Default)]
pub struct RunQueue {
    pub head: u64,
    pub events: VecDeque<RunQueueEvent>,
    /// Events dequeued since the last commit, oldest first.
    popped: Vec<RunQueueEvent>,
}

impl PartialEq for RunQueue {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head && self.events == other.events
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueMark {
    head: u64,
    tail: u64,
}

impl RunQueue {
    pub fn new(head: u64, events: VecDeque<RunQueueEvent>) -> Self {
        Self {
            head,
            events,
            popped: Vec::new(),
        }
    }

    pub fn push(&mut self, event: RunQueueEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<RunQueueEvent> {
        let event = self.events.pop_front()?;
        self.head += 1;
        self.popped.push(event.clone());
        Some(event)
    }

    pub fn mark(&self) -> QueueMark {
        QueueMark {
            head: self.head,
            tail: self.tail(),
        }
    }

    /// Put back what was popped since `mark` and drop what was pushed.
    pub fn rollback(&mut self, mark: QueueMark) {
        while self.head > mark.head {
            let Some(event) = self.popped.pop() else {
                break;
            };
            self.events.push_front(event);
            self.head -= 1;
        }
        let keep = mark.tail.saturating_sub(self.head) as usize;
        self.events.truncate(keep);
    }

    /// Forget the pops kept for rollback. Called once the queue is durable.
    pub fn settle(&mut self) {
        self.popped.clear();
    }

    pub fn tail(&self) -> u64 {
        self.head + self.events.len() as u64
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunQueueEvent> {
        self.events.iter()
    }
}
