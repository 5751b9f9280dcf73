//! Host-supplied run policies. `Kernel::run` asks the policy after every
//! crank whether to keep going, which lets a host bound the work done per
//! block. Cleanup of terminated vats is metered separately through
//! `allow_cleanup` and `did_cleanup`.

use serde::Serialize;

use crate::ids::VatId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyInput {
    pub vat_id: Option<VatId>,
    pub computrons: u64,
}

/// Per-crank limits on cleaning up after terminated vats. `None` limits
/// are unbounded; categories without their own limit use `default`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupBudget {
    pub default: Option<u64>,
    pub exports: Option<u64>,
    pub imports: Option<u64>,
    pub kv: Option<u64>,
    pub snapshots: Option<u64>,
    pub transcripts: Option<u64>,
}

impl CleanupBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// The same limit for every category.
    pub fn uniform(limit: u64) -> Self {
        Self {
            default: Some(limit),
            ..Self::default()
        }
    }

    /// Effective limit for a category. Zero is raised to one so every
    /// cleanup crank makes progress.
    pub fn limit(&self, category: Option<u64>) -> Option<u64> {
        category.or(self.default).map(|limit| limit.max(1))
    }
}

/// What one cleanup crank deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupWork {
    pub exports: u64,
    pub imports: u64,
    pub kv: u64,
    pub snapshots: u64,
    pub transcripts: u64,
}

impl CleanupWork {
    pub fn total(&self) -> u64 {
        self.exports + self.imports + self.kv + self.snapshots + self.transcripts
    }
}

pub trait RunPolicy {
    /// Asked before each crank. `None` defers cleanup of terminated vats;
    /// other work still runs.
    fn allow_cleanup(&mut self) -> Option<CleanupBudget> {
        Some(CleanupBudget::unlimited())
    }

    fn did_cleanup(&mut self, _work: &CleanupWork) -> bool {
        true
    }

    fn vat_created(&mut self, _input: &PolicyInput) -> bool {
        true
    }

    fn crank_complete(&mut self, _input: &PolicyInput) -> bool {
        true
    }

    fn crank_failed(&mut self, _input: &PolicyInput) -> bool {
        true
    }

    /// A crank that delivered nothing, e.g. a send to a dead vat.
    fn empty_crank(&mut self) -> bool {
        true
    }
}

/// Run until the queues are empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForeverPolicy;

impl RunPolicy for ForeverPolicy {}

/// Stop after a fixed number of cranks of any kind.
#[derive(Clone, Copy, Debug)]
pub struct CrankLimitPolicy {
    remaining: u64,
}

impl CrankLimitPolicy {
    pub fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }

    fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

impl RunPolicy for CrankLimitPolicy {
    fn vat_created(&mut self, _input: &PolicyInput) -> bool {
        self.tick()
    }

    fn crank_complete(&mut self, _input: &PolicyInput) -> bool {
        self.tick()
    }

    fn crank_failed(&mut self, _input: &PolicyInput) -> bool {
        self.tick()
    }

    fn empty_crank(&mut self) -> bool {
        self.tick()
    }

    fn did_cleanup(&mut self, _work: &CleanupWork) -> bool {
        self.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crank_limit_counts_every_kind_of_crank() {
        let mut policy = CrankLimitPolicy::new(3);
        let input = PolicyInput::default();
        assert!(policy.crank_complete(&input));
        assert!(policy.empty_crank());
        assert!(!policy.crank_failed(&input));

        let mut policy = CrankLimitPolicy::new(2);
        assert!(policy.did_cleanup(&CleanupWork::default()));
        assert!(!policy.crank_complete(&input));
    }

    #[test]
    fn budgets_fall_back_to_the_default_and_never_stall() {
        let budget = CleanupBudget {
            exports: Some(0),
            ..CleanupBudget::uniform(5)
        };
        assert_eq!(budget.limit(budget.exports), Some(1));
        assert_eq!(budget.limit(budget.kv), Some(5));
        assert_eq!(CleanupBudget::unlimited().limit(None), None);
        let work = CleanupWork {
            exports: 2,
            kv: 3,
            ..CleanupWork::default()
        };
        assert_eq!(work.total(), 5);
    }
}
