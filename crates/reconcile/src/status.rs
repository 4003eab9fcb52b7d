//! Function status lifecycle.
//!
//! A pass starts from the stored phase (`Unavailable` when unset), moves to
//! `Update` when the artifact or network had drifted, and always settles on
//! `Building` or `Available` from the workload's reported `Available` condition.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kfn_core::{FunctionStatus, Phase};

/// Reported `Available` condition: `Some(true)` only for status `"True"`,
/// `None` when the workload has not reported the condition.
pub fn workload_available(dep: &Deployment) -> Option<bool> {
    dep.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Available")
        .map(|c| c.status == "True")
}

/// Phase bookkeeping for one pass.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    stored: Option<FunctionStatus>,
    phase: Phase,
}

impl PhaseTracker {
    pub fn begin(stored: Option<&FunctionStatus>) -> Self {
        let phase = match stored.map(|s| s.phase) {
            None | Some(Phase::Unset) => Phase::Unavailable,
            Some(p) => p,
        };
        Self { stored: stored.cloned(), phase }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// A previous pass updated the artifact or network and stopped before the
    /// workload was refreshed.
    pub fn resumes_update(&self) -> bool {
        self.stored.as_ref().is_some_and(|s| s.phase == Phase::Update)
    }

    /// Artifact or network drift was found in this pass.
    pub fn mark_update(&mut self) {
        self.phase = Phase::Update;
    }

    /// Final phase from the observed workload. A workload that was just
    /// created has no observed state yet and counts as available.
    pub fn settle(&mut self, workload: Option<&Deployment>) -> Phase {
        self.phase = match workload.and_then(workload_available) {
            Some(false) => Phase::Building,
            _ => Phase::Available,
        };
        self.phase
    }

    pub fn status(&self, error_message: Option<String>) -> FunctionStatus {
        FunctionStatus { phase: self.phase, error_message }
    }

    /// `next` differs from what the Function carried at pass start.
    pub fn changed(&self, next: &FunctionStatus) -> bool {
        self.stored.as_ref() != Some(next)
    }
}

/// Delayed re-check for phases whose progress may not produce a watch event.
pub fn requeue_after(phase: Phase, building_delay: Duration) -> Option<Duration> {
    match phase {
        Phase::Building => Some(building_delay),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    fn dep(conditions: Option<Vec<(&str, &str)>>) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                conditions: conditions.map(|cs| {
                    cs.into_iter()
                        .map(|(t, s)| DeploymentCondition { type_: t.into(), status: s.into(), ..Default::default() })
                        .collect()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn unset_status_starts_unavailable() {
        assert_eq!(PhaseTracker::begin(None).phase(), Phase::Unavailable);
        assert_eq!(PhaseTracker::begin(Some(&FunctionStatus::default())).phase(), Phase::Unavailable);
        let stored = FunctionStatus::with_phase(Phase::Available);
        assert_eq!(PhaseTracker::begin(Some(&stored)).phase(), Phase::Available);
    }

    #[test]
    fn settle_follows_available_condition() {
        let mut t = PhaseTracker::begin(None);
        t.mark_update();
        assert_eq!(t.phase(), Phase::Update);

        assert_eq!(t.settle(Some(&dep(Some(vec![("Progressing", "True"), ("Available", "False")])))), Phase::Building);
        assert_eq!(t.settle(Some(&dep(Some(vec![("Available", "Unknown")])))), Phase::Building);
        assert_eq!(t.settle(Some(&dep(Some(vec![("Available", "True")])))), Phase::Available);
        assert_eq!(t.settle(Some(&dep(None))), Phase::Available);
        assert_eq!(t.settle(Some(&Deployment::default())), Phase::Available);
        assert_eq!(t.settle(None), Phase::Available);
    }

    #[test]
    fn stored_update_phase_is_resumed() {
        let stored = FunctionStatus { phase: Phase::Update, error_message: Some("get Deployment failed".into()) };
        assert!(PhaseTracker::begin(Some(&stored)).resumes_update());
        assert!(!PhaseTracker::begin(Some(&FunctionStatus::with_phase(Phase::Available))).resumes_update());

        // marking update in this pass is not the same as resuming one
        let mut t = PhaseTracker::begin(None);
        t.mark_update();
        assert!(!t.resumes_update());
    }

    #[test]
    fn only_building_requeues() {
        let d = Duration::from_secs(20);
        assert_eq!(requeue_after(Phase::Building, d), Some(d));
        for p in [Phase::Available, Phase::Unavailable, Phase::Update, Phase::Unset] {
            assert_eq!(requeue_after(p, d), None);
        }
    }

    #[test]
    fn unchanged_status_is_not_rewritten() {
        let stored = FunctionStatus::with_phase(Phase::Available);
        let mut t = PhaseTracker::begin(Some(&stored));
        t.settle(None);
        assert!(!t.changed(&t.status(None)));
        assert!(t.changed(&t.status(Some("boom".into()))));
        assert!(PhaseTracker::begin(None).changed(&FunctionStatus::with_phase(Phase::Unavailable)));
    }
}
