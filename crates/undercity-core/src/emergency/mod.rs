//! Emergency mode: the mainline-health kill switch.
//!
//! A single process-wide flag persisted to `emergency.json`. It trips
//! when the pre-merge health check finds mainline verification broken,
//! blocks all new batches and merges while active, and clears either by
//! operator command or by a passing post-merge health check. The
//! orchestrator may seed one maximum-priority fix task per activation,
//! bounded by a fix-attempt counter.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use undercity_state::atomic;
use undercity_state::layout::StateLayout;
use undercity_state::StateError;

use crate::verify::{VerifyReport, VerifyRunner};

/// Environment variable that skips the emergency gate (tests only).
pub const SKIP_GATE_ENV: &str = "UNDERCITY_SKIP_EMERGENCY_GATE";

/// Default cap on automatic fix tasks per activation.
pub const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 2;

/// Persisted emergency state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fix_attempts: u32,
}

/// The emergency-mode flag.
#[derive(Debug)]
pub struct EmergencyMode {
    path: PathBuf,
    state: EmergencyState,
    max_fix_attempts: u32,
}

impl EmergencyMode {
    pub fn open(layout: &StateLayout) -> Result<Self, StateError> {
        let path = layout.emergency_file();
        let state: EmergencyState = atomic::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            state,
            max_fix_attempts: DEFAULT_MAX_FIX_ATTEMPTS,
        })
    }

    pub fn with_max_fix_attempts(mut self, max: u32) -> Self {
        self.max_fix_attempts = max;
        self
    }

    fn persist(&self) -> Result<(), StateError> {
        atomic::write_json_atomic(&self.path, &self.state)
    }

    /// Whether the gate is active. Honors [`SKIP_GATE_ENV`].
    pub fn is_active(&self) -> bool {
        if gate_skipped() {
            return false;
        }
        self.state.active
    }

    pub fn state(&self) -> &EmergencyState {
        &self.state
    }

    /// Trip the switch. Re-activating while active keeps the original
    /// activation timestamp and counter.
    pub fn activate(&mut self, reason: &str) -> Result<(), StateError> {
        if !self.state.active {
            self.state.active = true;
            self.state.activated_at = Some(Utc::now());
            self.state.fix_attempts = 0;
            tracing::error!(reason, "EMERGENCY MODE ACTIVATED");
        }
        self.state.reason = Some(reason.to_owned());
        self.persist()
    }

    /// Clear the switch (operator command or passing health check).
    pub fn clear(&mut self) -> Result<(), StateError> {
        if self.state.active {
            tracing::info!("emergency mode cleared");
        }
        self.state = EmergencyState::default();
        self.persist()
    }

    /// Whether another automatic fix task may be seeded.
    pub fn can_auto_fix(&self) -> bool {
        self.state.active && self.state.fix_attempts < self.max_fix_attempts
    }

    /// Count one automatic fix-task spawn.
    pub fn record_fix_attempt(&mut self) -> Result<u32, StateError> {
        self.state.fix_attempts += 1;
        self.persist()?;
        Ok(self.state.fix_attempts)
    }
}

/// Whether the emergency gate is disabled via the environment.
pub fn gate_skipped() -> bool {
    std::env::var(SKIP_GATE_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Run the project's verification suite against mainline. Used as both
/// the pre-merge gate and the post-merge confirmation.
pub async fn mainline_health_check(
    verify: &VerifyRunner,
    main_repo: &Path,
) -> anyhow::Result<VerifyReport> {
    tracing::info!(repo = %main_repo.display(), "running mainline health check");
    verify.run(main_repo).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mode() -> (tempfile::TempDir, EmergencyMode) {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(dir.path());
        layout.ensure().unwrap();
        let mode = EmergencyMode::open(&layout).unwrap();
        (dir, mode)
    }

    #[test]
    fn starts_inactive() {
        let (_dir, mode) = open_mode();
        assert!(!mode.is_active());
        assert_eq!(mode.state(), &EmergencyState::default());
    }

    #[test]
    fn activate_clear_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StateLayout::for_project(dir.path());
        layout.ensure().unwrap();
        {
            let mut mode = EmergencyMode::open(&layout).unwrap();
            mode.activate("mainline tests failing").unwrap();
            assert!(mode.is_active());
        }
        // Survives reopen.
        let mut mode = EmergencyMode::open(&layout).unwrap();
        assert!(mode.is_active());
        assert_eq!(
            mode.state().reason.as_deref(),
            Some("mainline tests failing")
        );

        mode.clear().unwrap();
        assert!(!mode.is_active());
        let mode = EmergencyMode::open(&layout).unwrap();
        assert!(!mode.is_active());
    }

    #[test]
    fn fix_attempts_are_bounded() {
        let (_dir, mode) = open_mode();
        let mut mode = mode.with_max_fix_attempts(2);
        mode.activate("broken").unwrap();

        assert!(mode.can_auto_fix());
        mode.record_fix_attempt().unwrap();
        assert!(mode.can_auto_fix());
        mode.record_fix_attempt().unwrap();
        assert!(!mode.can_auto_fix(), "cap reached, requires human clear");
    }

    #[test]
    fn reactivation_keeps_counter() {
        let (_dir, mut mode) = open_mode();
        mode.activate("first").unwrap();
        mode.record_fix_attempt().unwrap();
        mode.activate("still broken").unwrap();
        assert_eq!(mode.state().fix_attempts, 1);
        assert_eq!(mode.state().reason.as_deref(), Some("still broken"));
    }
}
