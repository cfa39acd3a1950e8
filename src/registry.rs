//! In-memory job state, the orchestrator's only shared mutable data.
//!
//! Two-level locking: the outer `RwLock` covers insert/remove/lookup of
//! jobs, a per-job `Mutex` covers `JobState` mutation, and each unit sits
//! behind its own `Mutex`. Every method returns owned snapshots so no lock
//! is ever held across bus, store, or hub I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::events::{Platform, Screen};

/// Identifies one screen×platform work unit within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub screen_index: usize,
    pub platform: Platform,
}

/// Iteration progress for one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitState {
    /// Highest iteration observed.
    pub iteration: u32,
    /// Maximum score seen so far, kept for diagnostics.
    pub best_score: f64,
    /// Terminal flag; flips false→true exactly once.
    pub done: bool,
}

/// Aggregate progress for one job.
#[derive(Debug)]
pub struct JobState {
    pub platforms: Vec<Platform>,
    pub screens: Vec<Screen>,
    pub threshold: u32,
    pub repo_context: String,
    /// screens × platforms, fixed once screens are known.
    pub total_work: usize,
    pub completed: usize,
    pub total_score: f64,
    pub total_iter: u32,
    units: HashMap<UnitKey, Arc<Mutex<UnitState>>>,
}

struct JobHandle {
    state: Mutex<JobState>,
}

/// Snapshot handed to the figma-parsed fan-out.
#[derive(Debug)]
pub struct FanOut {
    pub platforms: Vec<Platform>,
    pub screen_count: usize,
    /// First screen to generate, absent when the design had no screens.
    pub first_screen: Option<Screen>,
}

/// Result of marking a unit terminal.
#[derive(Debug)]
pub enum AdvanceOutcome {
    UnknownJob,
    UnknownUnit,
    /// Duplicate terminal event for an already-done unit; counted nothing.
    AlreadyDone,
    Advanced(AdvanceInfo),
}

#[derive(Debug)]
pub struct AdvanceInfo {
    /// Name of the finished screen, absent when the index was out of range.
    pub screen_name: Option<String>,
    /// Next screen to start on the same platform, if any remains.
    pub next_screen: Option<Screen>,
    pub completed: usize,
    pub total_work: usize,
}

/// Final rollup produced when a job leaves the registry.
#[derive(Debug)]
pub struct JobSummary {
    pub screens: usize,
    pub platforms: Vec<Platform>,
    pub completed: usize,
    pub avg_score: f64,
    pub total_iter: u32,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted job. Screens arrive later via
    /// [`set_screens`](Self::set_screens).
    pub fn insert(
        &self,
        job_id: &str,
        platforms: Vec<Platform>,
        threshold: u32,
        repo_context: String,
    ) {
        let handle = Arc::new(JobHandle {
            state: Mutex::new(JobState {
                platforms,
                screens: Vec::new(),
                threshold,
                repo_context,
                total_work: 0,
                completed: 0,
                total_score: 0.0,
                total_iter: 0,
                units: HashMap::new(),
            }),
        });
        self.jobs
            .write()
            .unwrap()
            .insert(job_id.to_string(), handle);
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    fn handle(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.read().unwrap().get(job_id).cloned()
    }

    /// Fix the screen list, derive `total_work`, and initialise every
    /// screen×platform unit. Returns what the fan-out needs, or `None` for
    /// an unknown job.
    pub fn set_screens(&self, job_id: &str, screens: Vec<Screen>) -> Option<FanOut> {
        let handle = self.handle(job_id)?;
        let mut state = handle.state.lock().unwrap();
        let platforms = state.platforms.clone();
        state.total_work = screens.len() * platforms.len();
        for screen_index in 0..screens.len() {
            for &platform in &platforms {
                state.units.insert(
                    UnitKey {
                        screen_index,
                        platform,
                    },
                    Arc::new(Mutex::new(UnitState::default())),
                );
            }
        }
        state.screens = screens;
        Some(FanOut {
            platforms: state.platforms.clone(),
            screen_count: state.screens.len(),
            first_screen: state.screens.first().cloned(),
        })
    }

    /// Threshold and repo context for an outgoing codegen request.
    pub fn codegen_params(&self, job_id: &str) -> Option<(u32, String)> {
        let handle = self.handle(job_id)?;
        let state = handle.state.lock().unwrap();
        Some((state.threshold, state.repo_context.clone()))
    }

    /// Record a diff observation on a unit: bump `iteration`, fold the score
    /// into `best_score`. Returns the updated best score, or `None` when the
    /// job or unit is unknown.
    pub fn record_iteration(
        &self,
        job_id: &str,
        key: UnitKey,
        iteration: u32,
        score: f64,
    ) -> Option<f64> {
        let handle = self.handle(job_id)?;
        let unit = {
            let state = handle.state.lock().unwrap();
            state.units.get(&key).cloned()?
        };
        let mut unit = unit.lock().unwrap();
        unit.iteration = iteration;
        if score > unit.best_score {
            unit.best_score = score;
        }
        Some(unit.best_score)
    }

    /// Mark a unit terminal and fold its score into the job totals.
    /// Idempotent: a unit that is already done counts nothing.
    pub fn advance(
        &self,
        job_id: &str,
        key: UnitKey,
        score: f64,
        iterations: u32,
    ) -> AdvanceOutcome {
        let handle = match self.handle(job_id) {
            Some(handle) => handle,
            None => return AdvanceOutcome::UnknownJob,
        };
        let mut state = handle.state.lock().unwrap();

        {
            let unit = match state.units.get(&key) {
                Some(unit) => Arc::clone(unit),
                None => return AdvanceOutcome::UnknownUnit,
            };
            let mut unit = unit.lock().unwrap();
            if unit.done {
                return AdvanceOutcome::AlreadyDone;
            }
            unit.done = true;
        }

        state.completed += 1;
        state.total_score += score;
        state.total_iter += iterations;

        let next_key = UnitKey {
            screen_index: key.screen_index + 1,
            platform: key.platform,
        };
        let next_pending = state
            .units
            .get(&next_key)
            .is_some_and(|unit| !unit.lock().unwrap().done);
        let next_screen = if next_pending {
            state.screens.get(next_key.screen_index).cloned()
        } else {
            None
        };

        AdvanceOutcome::Advanced(AdvanceInfo {
            screen_name: state.screens.get(key.screen_index).map(|s| s.name.clone()),
            next_screen,
            completed: state.completed,
            total_work: state.total_work,
        })
    }

    /// Remove a job and return its final rollup.
    pub fn remove(&self, job_id: &str) -> Option<JobSummary> {
        let handle = self.jobs.write().unwrap().remove(job_id)?;
        let state = handle.state.lock().unwrap();
        let avg_score = if state.completed > 0 {
            state.total_score / state.completed as f64
        } else {
            0.0
        };
        Some(JobSummary {
            screens: state.screens.len(),
            platforms: state.platforms.clone(),
            completed: state.completed,
            avg_score,
            total_iter: state.total_iter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::screen;

    fn two_screen_registry() -> JobRegistry {
        let registry = JobRegistry::new();
        registry.insert(
            "job-1",
            vec![Platform::React, Platform::Kmp],
            90,
            String::new(),
        );
        registry
            .set_screens("job-1", vec![screen("Home"), screen("Settings")])
            .unwrap();
        registry
    }

    fn unit(screen_index: usize, platform: Platform) -> UnitKey {
        UnitKey {
            screen_index,
            platform,
        }
    }

    #[test]
    fn set_screens_fixes_total_work() {
        let registry = two_screen_registry();
        match registry.advance("job-1", unit(0, Platform::React), 90.0, 1) {
            AdvanceOutcome::Advanced(info) => {
                assert_eq!(info.total_work, 4);
                assert_eq!(info.completed, 1);
            }
            other => panic!("expected Advanced, got {:?}", other),
        }
    }

    #[test]
    fn set_screens_unknown_job_is_none() {
        let registry = JobRegistry::new();
        assert!(registry.set_screens("ghost", vec![screen("Home")]).is_none());
    }

    #[test]
    fn empty_design_has_no_first_screen() {
        let registry = JobRegistry::new();
        registry.insert("job-1", vec![Platform::React], 95, String::new());
        let fan_out = registry.set_screens("job-1", vec![]).unwrap();
        assert_eq!(fan_out.screen_count, 0);
        assert!(fan_out.first_screen.is_none());
    }

    #[test]
    fn advance_is_idempotent_for_done_units() {
        let registry = two_screen_registry();
        let key = unit(0, Platform::React);
        assert!(matches!(
            registry.advance("job-1", key, 92.0, 3),
            AdvanceOutcome::Advanced(_)
        ));
        assert!(matches!(
            registry.advance("job-1", key, 92.0, 3),
            AdvanceOutcome::AlreadyDone
        ));
        // the duplicate counted nothing
        let summary = registry.remove("job-1").unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total_iter, 3);
    }

    #[test]
    fn advance_sequences_screens_per_platform() {
        let registry = two_screen_registry();
        let info = match registry.advance("job-1", unit(0, Platform::React), 90.0, 1) {
            AdvanceOutcome::Advanced(info) => info,
            other => panic!("expected Advanced, got {:?}", other),
        };
        assert_eq!(info.screen_name.as_deref(), Some("Home"));
        assert_eq!(info.next_screen.as_ref().map(|s| s.name.as_str()), Some("Settings"));

        // last screen on the platform has nothing to chain to
        let info = match registry.advance("job-1", unit(1, Platform::React), 88.0, 2) {
            AdvanceOutcome::Advanced(info) => info,
            other => panic!("expected Advanced, got {:?}", other),
        };
        assert!(info.next_screen.is_none());
        assert_eq!(info.completed, 2);
    }

    #[test]
    fn completed_never_exceeds_total_work() {
        let registry = two_screen_registry();
        let keys = [
            unit(0, Platform::React),
            unit(0, Platform::Kmp),
            unit(1, Platform::React),
            unit(1, Platform::Kmp),
        ];
        for (i, key) in keys.iter().enumerate() {
            match registry.advance("job-1", *key, 80.0, 1) {
                AdvanceOutcome::Advanced(info) => {
                    assert_eq!(info.completed, i + 1);
                    assert!(info.completed <= info.total_work);
                }
                other => panic!("expected Advanced, got {:?}", other),
            }
        }
        // every further event is a duplicate
        assert!(matches!(
            registry.advance("job-1", keys[3], 80.0, 1),
            AdvanceOutcome::AlreadyDone
        ));
    }

    #[test]
    fn record_iteration_tracks_best_score() {
        let registry = two_screen_registry();
        let key = unit(0, Platform::Kmp);
        assert_eq!(registry.record_iteration("job-1", key, 1, 70.0), Some(70.0));
        assert_eq!(registry.record_iteration("job-1", key, 2, 55.0), Some(70.0));
        assert_eq!(registry.record_iteration("job-1", key, 3, 81.5), Some(81.5));
    }

    #[test]
    fn record_iteration_unknown_unit_is_none() {
        let registry = two_screen_registry();
        assert!(registry
            .record_iteration("job-1", unit(9, Platform::React), 1, 50.0)
            .is_none());
        assert!(registry
            .record_iteration("ghost", unit(0, Platform::React), 1, 50.0)
            .is_none());
    }

    #[test]
    fn remove_computes_average_over_completed_units() {
        let registry = two_screen_registry();
        registry.advance("job-1", unit(0, Platform::React), 90.0, 2);
        registry.advance("job-1", unit(0, Platform::Kmp), 70.0, 4);
        let summary = registry.remove("job-1").unwrap();
        assert_eq!(summary.completed, 2);
        assert!((summary.avg_score - 80.0).abs() < f64::EPSILON);
        assert_eq!(summary.total_iter, 6);
        assert_eq!(summary.screens, 2);
        // registry no longer knows the job
        assert_eq!(registry.active_jobs(), 0);
        assert!(matches!(
            registry.advance("job-1", unit(1, Platform::React), 50.0, 1),
            AdvanceOutcome::UnknownJob
        ));
    }

    #[test]
    fn remove_with_no_completed_units_averages_zero() {
        let registry = JobRegistry::new();
        registry.insert("job-1", vec![Platform::React], 95, String::new());
        registry.set_screens("job-1", vec![]).unwrap();
        let summary = registry.remove("job-1").unwrap();
        assert_eq!(summary.avg_score, 0.0);
        assert_eq!(summary.total_iter, 0);
    }

    #[test]
    fn codegen_params_reflect_submission() {
        let registry = JobRegistry::new();
        registry.insert(
            "job-1",
            vec![Platform::Flutter],
            88,
            "https://github.com/acme/app".to_string(),
        );
        let (threshold, repo_context) = registry.codegen_params("job-1").unwrap();
        assert_eq!(threshold, 88);
        assert_eq!(repo_context, "https://github.com/acme/app");
        assert!(registry.codegen_params("ghost").is_none());
    }
}
