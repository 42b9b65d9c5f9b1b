//! Preemption classification.

use std::fmt;

/// Who was on the CPU before the task that just got scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreemptionCategory {
    /// Switch within one cgroup.
    SameContainer,
    /// One side is the root/host cgroup.
    SystemService,
    /// Cross-tenant switch.
    OtherContainer,
}

impl PreemptionCategory {
    /// Metric label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SameContainer => "same_container",
            Self::SystemService => "system_service",
            Self::OtherContainer => "other_container",
        }
    }
}

impl fmt::Display for PreemptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rules apply in order: equal ids, then a zero id, then everything else.
pub fn classify(prev_cgroup_id: u64, cgroup_id: u64) -> PreemptionCategory {
    if prev_cgroup_id == cgroup_id {
        PreemptionCategory::SameContainer
    } else if prev_cgroup_id == 0 || cgroup_id == 0 {
        PreemptionCategory::SystemService
    } else {
        PreemptionCategory::OtherContainer
    }
}
