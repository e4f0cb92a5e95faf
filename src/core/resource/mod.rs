use std::sync::Arc;

use serde::Serialize;

use crate::core::model::ModelTier;
use crate::error::{Result, RuntimeError};
use crate::format::human_bytes;

/// Point-in-time view of device resources. Taken fresh for every decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub total_memory: u64,
    pub available_memory: u64,
    pub total_storage: u64,
    pub available_storage: u64,
    pub cpu_core_count: usize,
    /// Load average over core count; 1.0 means every core busy.
    pub approximate_cpu_load: f32,
}

impl ResourceSnapshot {
    pub fn used_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.available_memory)
    }

    pub fn used_storage(&self) -> u64 {
        self.total_storage.saturating_sub(self.available_storage)
    }

    /// Fraction in `[0, 1]`; an unknown total counts as fully used.
    pub fn memory_usage(&self) -> f64 {
        usage(self.used_memory(), self.total_memory)
    }

    pub fn storage_usage(&self) -> f64 {
        usage(self.used_storage(), self.total_storage)
    }

    pub fn summary(&self) -> String {
        format!(
            "RAM {}/{} ({:.0}%) | storage {}/{} ({:.0}%) | {} cores, load {:.2}",
            human_bytes(self.used_memory()),
            human_bytes(self.total_memory),
            self.memory_usage() * 100.0,
            human_bytes(self.used_storage()),
            human_bytes(self.total_storage),
            self.storage_usage() * 100.0,
            self.cpu_core_count,
            self.approximate_cpu_load,
        )
    }
}

fn usage(used: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        used as f64 / total as f64
    }
}

pub trait ResourceProbe: Send + Sync {
    fn capture(&self) -> anyhow::Result<ResourceSnapshot>;
}

/// A snapshot handed in by the host application.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub ResourceSnapshot);

impl ResourceProbe for StaticProbe {
    fn capture(&self) -> anyhow::Result<ResourceSnapshot> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetPolicy {
    /// Usage fraction above which nothing is loaded.
    pub ceiling: f64,
    /// Fraction of the device that models may occupy in total.
    pub ai_share: f64,
    pub max_threads: usize,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            ceiling: 0.5,
            ai_share: 0.6,
            max_threads: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDecision {
    pub allowed: bool,
    pub tier: ModelTier,
    pub max_artifact_bytes: u64,
    pub max_memory_bytes: u64,
    pub reason: String,
    pub threads: usize,
}

pub struct ResourceBudgetAdvisor {
    policy: BudgetPolicy,
    probe: Arc<dyn ResourceProbe>,
}

impl ResourceBudgetAdvisor {
    pub fn new(policy: BudgetPolicy, probe: Arc<dyn ResourceProbe>) -> Self {
        Self { policy, probe }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    pub fn assess(&self, snapshot: &ResourceSnapshot) -> ResourceDecision {
        let threads = self.policy.max_threads.min(snapshot.cpu_core_count).max(1);
        let ceiling_pct = self.policy.ceiling * 100.0;

        let over_ceiling = [
            ("RAM", snapshot.memory_usage()),
            ("storage", snapshot.storage_usage()),
        ]
        .into_iter()
        .find(|(_, used)| *used > self.policy.ceiling);

        if let Some((what, used)) = over_ceiling {
            return ResourceDecision {
                allowed: false,
                tier: ModelTier::Tiny,
                max_artifact_bytes: 0,
                max_memory_bytes: 0,
                reason: format!(
                    "{} usage {:.0}% exceeds the {:.0}% safety ceiling",
                    what,
                    used * 100.0,
                    ceiling_pct
                ),
                threads,
            };
        }

        let memory_budget = self.budget(snapshot.total_memory, snapshot.used_memory());
        let storage_budget = self.budget(snapshot.total_storage, snapshot.used_storage());
        let fits = |tier: &ModelTier| memory_budget >= tier.memory_budget() && storage_budget >= tier.size_budget();

        let tier = ModelTier::ALL.into_iter().rev().find(fits).unwrap_or(ModelTier::Tiny);
        let allowed = fits(&tier);

        let reason = if allowed {
            format!(
                "{} tier fits: {} memory and {} storage available to models",
                tier,
                human_bytes(memory_budget),
                human_bytes(storage_budget)
            )
        } else if memory_budget < tier.memory_budget() {
            format!(
                "RAM budget {} is below the {} tier requirement of {}",
                human_bytes(memory_budget),
                tier,
                human_bytes(tier.memory_budget())
            )
        } else {
            format!(
                "storage budget {} is below the {} tier requirement of {}",
                human_bytes(storage_budget),
                tier,
                human_bytes(tier.size_budget())
            )
        };

        ResourceDecision {
            allowed,
            tier,
            max_artifact_bytes: if allowed { tier.size_budget() } else { 0 },
            max_memory_bytes: if allowed { tier.memory_budget() } else { 0 },
            reason,
            threads,
        }
    }

    /// `total * ai_share - used`, floored at zero.
    fn budget(&self, total: u64, used: u64) -> u64 {
        let share = total as f64 * self.policy.ai_share;
        (share - used as f64).max(0.0) as u64
    }

    /// Captures a fresh snapshot and assesses it.
    pub fn assess_now(&self) -> Result<(ResourceSnapshot, ResourceDecision)> {
        let snapshot = self
            .probe
            .capture()
            .map_err(|e| RuntimeError::InsufficientResources(format!("resource probe failed: {:#}", e)))?;
        let decision = self.assess(&snapshot);
        Ok((snapshot, decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn snapshot(total_mem: u64, used_mem: u64, total_disk: u64, used_disk: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            total_memory: total_mem,
            available_memory: total_mem - used_mem,
            total_storage: total_disk,
            available_storage: total_disk - used_disk,
            cpu_core_count: 8,
            approximate_cpu_load: 0.2,
        }
    }

    fn advisor() -> ResourceBudgetAdvisor {
        let probe = StaticProbe(snapshot(GIB, 0, GIB, 0));
        ResourceBudgetAdvisor::new(BudgetPolicy::default(), Arc::new(probe))
    }

    #[test]
    fn test_mid_range_device_gets_pro() {
        let snap = snapshot(6 * GIB, 2 * GIB, 100 * GIB, 30 * GIB);
        let decision = advisor().assess(&snap);

        assert!(decision.allowed);
        assert_eq!(decision.tier, ModelTier::Pro);
        assert_eq!(decision.max_artifact_bytes, ModelTier::Pro.size_budget());
        assert_eq!(decision.threads, 4);
    }

    #[test]
    fn test_ram_over_ceiling_is_refused() {
        let snap = snapshot(100 * GIB, 55 * GIB, 100 * GIB, 10 * GIB);
        let decision = advisor().assess(&snap);

        assert!(!decision.allowed);
        assert_eq!(decision.tier, ModelTier::Tiny);
        assert!(decision.reason.contains("RAM"), "{}", decision.reason);
    }

    #[test]
    fn test_storage_over_ceiling_is_refused() {
        let snap = snapshot(16 * GIB, GIB, 100 * GIB, 51 * GIB);
        let decision = advisor().assess(&snap);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("storage"));
    }

    #[test]
    fn test_never_allowed_above_ceiling() {
        let advisor = advisor();
        for used_pct in 51..=100u64 {
            let snap = snapshot(100 * GIB, used_pct * GIB, 100 * GIB, 0);
            assert!(!advisor.assess(&snap).allowed, "{}% used", used_pct);
        }
    }

    #[test]
    fn test_tier_is_monotonic_in_available_memory() {
        let advisor = advisor();
        let mut previous = ModelTier::Tiny;
        for free_gib in 1..=32u64 {
            let total = 64 * GIB;
            let snap = snapshot(total, total - free_gib * GIB - 16 * GIB, 500 * GIB, 0);
            let tier = advisor.assess(&snap).tier;
            assert!(tier >= previous, "{} GiB free gave {} after {}", free_gib, tier, previous);
            previous = tier;
        }
    }

    #[test]
    fn test_tier_is_monotonic_in_available_storage() {
        let advisor = advisor();
        let total = 8 * GIB;
        let step = GIB / 4;
        let mut tiers = Vec::new();
        // from half the disk used down to an empty disk
        for n in 0..=16u64 {
            let used = total / 2 - n * step;
            tiers.push(advisor.assess(&snapshot(64 * GIB, 0, total, used)).tier);
        }

        assert!(tiers.windows(2).all(|w| w[0] <= w[1]), "{:?}", tiers);
        assert!(tiers[0] < tiers[16]);
        assert_eq!(tiers[16], ModelTier::Ultra);
    }

    #[test]
    fn test_tiny_budget_is_refused() {
        // under the ceiling but not enough share left for tiny
        let snap = snapshot(GIB / 2, GIB / 4, 100 * GIB, 0);
        let decision = advisor().assess(&snap);
        assert!(!decision.allowed);
        assert_eq!(decision.tier, ModelTier::Tiny);
        assert!(decision.reason.contains("RAM"));
    }

    #[test]
    fn test_zero_totals_are_refused() {
        let snap = ResourceSnapshot {
            total_memory: 0,
            available_memory: 0,
            total_storage: 0,
            available_storage: 0,
            cpu_core_count: 1,
            approximate_cpu_load: 0.0,
        };
        assert!(!advisor().assess(&snap).allowed);
    }

    struct UnmountedProbe;

    impl ResourceProbe for UnmountedProbe {
        fn capture(&self) -> anyhow::Result<ResourceSnapshot> {
            anyhow::bail!("no mounted disk holds /models")
        }
    }

    #[test]
    fn test_capture_failure_is_reported() {
        let advisor = ResourceBudgetAdvisor::new(BudgetPolicy::default(), Arc::new(UnmountedProbe));
        match advisor.assess_now() {
            Err(RuntimeError::InsufficientResources(reason)) => {
                assert!(reason.contains("probe failed"), "{}", reason);
                assert!(reason.contains("no mounted disk"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other.map(|(_, d)| d.reason)),
        }
    }

    #[test]
    fn test_assess_now_uses_probe() {
        let (snap, decision) = advisor().assess_now().unwrap();
        assert_eq!(snap.total_memory, GIB);
        assert_eq!(decision.tier, ModelTier::Lite);
        assert!(snap.summary().contains("RAM"));
    }
}
