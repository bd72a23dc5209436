//! Run registry: structured status tracking for background analysis runs.
//!
//! Replaces an ad-hoc per-run status dictionary with a defined state
//! machine (`Queued -> Running -> Completed | Failed`) and monotonically
//! non-decreasing progress, safe to share between a worker thread and a
//! status-polling path.

use crate::types::{TerraError, TerraResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Status record for one analysis run
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    /// Percent complete, 0-100, never decreases
    pub progress: f32,
    /// Completion summary or failure cause
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registry of analysis runs keyed by generated run ids.
///
/// Interior mutability keeps the registry shareable behind an `Arc`;
/// cancellation mid-run is not supported, unwanted runs are abandoned.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunStatus>>,
    counter: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queued run and return its identifier
    pub fn create(&self, label: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let run_id = format!("{}_{}_{}", label, now.timestamp_millis(), seq);

        let status = RunStatus {
            state: RunState::Queued,
            progress: 0.0,
            message: None,
            created_at: now,
            updated_at: now,
        };
        self.lock().insert(run_id.clone(), status);
        log::info!("registered run {}", run_id);
        run_id
    }

    /// Queued -> Running
    pub fn mark_running(&self, run_id: &str) -> TerraResult<()> {
        self.transition(run_id, RunState::Running, None)
    }

    /// Update progress; values lower than the current one are ignored so
    /// reported progress never moves backwards.
    pub fn set_progress(&self, run_id: &str, progress: f32) -> TerraResult<()> {
        let mut runs = self.lock();
        let status = runs
            .get_mut(run_id)
            .ok_or_else(|| unknown_run(run_id))?;

        if status.state != RunState::Running {
            return Err(TerraError::Processing(format!(
                "run {} is not running (state {:?})",
                run_id, status.state
            )));
        }

        let clamped = progress.clamp(0.0, 100.0);
        if clamped > status.progress {
            status.progress = clamped;
            status.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Running -> Completed; pins progress at 100
    pub fn complete(&self, run_id: &str, message: impl Into<String>) -> TerraResult<()> {
        self.transition(run_id, RunState::Completed, Some(message.into()))
    }

    /// Queued|Running -> Failed, with the causing message attached
    pub fn fail(&self, run_id: &str, message: impl Into<String>) -> TerraResult<()> {
        self.transition(run_id, RunState::Failed, Some(message.into()))
    }

    pub fn get(&self, run_id: &str) -> Option<RunStatus> {
        self.lock().get(run_id).cloned()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn transition(
        &self,
        run_id: &str,
        target: RunState,
        message: Option<String>,
    ) -> TerraResult<()> {
        let mut runs = self.lock();
        let status = runs
            .get_mut(run_id)
            .ok_or_else(|| unknown_run(run_id))?;

        let allowed = matches!(
            (status.state, target),
            (RunState::Queued, RunState::Running)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Queued, RunState::Failed)
        );
        if !allowed {
            return Err(TerraError::Processing(format!(
                "illegal run transition {:?} -> {:?} for {}",
                status.state, target, run_id
            )));
        }

        status.state = target;
        if target == RunState::Completed {
            status.progress = 100.0;
        }
        if message.is_some() {
            status.message = message;
        }
        status.updated_at = Utc::now();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunStatus>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unknown_run(run_id: &str) -> TerraError {
    TerraError::Processing(format!("unknown run id: {}", run_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let registry = RunRegistry::new();
        let id = registry.create("bangalore");

        assert_eq!(registry.get(&id).unwrap().state, RunState::Queued);

        registry.mark_running(&id).unwrap();
        registry.set_progress(&id, 25.0).unwrap();
        registry.set_progress(&id, 75.0).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 75.0);

        registry.complete(&id, "16 cells processed").unwrap();
        let status = registry.get(&id).unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.progress, 100.0);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let registry = RunRegistry::new();
        let id = registry.create("delhi");
        registry.mark_running(&id).unwrap();

        registry.set_progress(&id, 60.0).unwrap();
        registry.set_progress(&id, 40.0).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 60.0);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let registry = RunRegistry::new();
        let id = registry.create("mumbai");

        // cannot complete a queued run
        assert!(registry.complete(&id, "done").is_err());

        registry.mark_running(&id).unwrap();
        registry.fail(&id, "network down").unwrap();

        // terminal states accept no further transitions
        assert!(registry.mark_running(&id).is_err());
        assert!(registry.complete(&id, "done").is_err());
        let status = registry.get(&id).unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.message.as_deref(), Some("network down"));
    }

    #[test]
    fn test_unknown_run_id() {
        let registry = RunRegistry::new();
        assert!(registry.mark_running("nope").is_err());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = RunRegistry::new();
        let a = registry.create("city");
        let b = registry.create("city");
        assert_ne!(a, b);
        assert_eq!(registry.run_ids().len(), 2);
    }
}
