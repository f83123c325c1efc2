//! Time-budgeted calibration scheduler
//!
//! CALIBRATE runs the recipe list in order inside a caller-supplied time
//! budget. Each recipe passes two admission gates: it must be due (its
//! frequency interval has elapsed since its last successful run) and its
//! predicted duration must fit in the remaining budget. Completed recipes
//! are persisted immediately, so a later failure never rolls back work
//! already done.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use ccslib::{
    codes, load_recipes, AmpSelect, CcsError, CcsResult, Command, Done, Recipe, RecipeKey,
    RecipeKind,
};
use log::{debug, info};

use crate::commands::parse_params;
use crate::delegate::{delegate, peer_tags};
use crate::exec::{checkpoint, done_from_err, CommandExec, Context};

/// Wall-clock milliseconds since the UNIX epoch
pub fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Admission decision for one recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Not due yet: the frequency interval has not elapsed
    FrequencyGate,
    /// Predicted duration does not fit the remaining budget
    BudgetGate,
}

/// Decide whether a recipe runs now.
///
/// Both comparisons are strict boundary checks: a recipe due exactly now is
/// admitted, and a predicted duration exactly equal to the remaining budget
/// is admitted; one unit over is rejected.
pub fn admit(
    recipe: &Recipe,
    last_run_ms: Option<u64>,
    now_ms: u64,
    deadline_ms: u64,
    readout_overhead_ms: u64,
) -> Admission {
    if let Some(last) = last_run_ms {
        if now_ms.saturating_sub(last) < recipe.frequency_ms {
            return Admission::FrequencyGate;
        }
    }
    let predicted = recipe.predicted_duration_ms(readout_overhead_ms);
    if now_ms.saturating_add(predicted) > deadline_ms {
        return Admission::BudgetGate;
    }
    Admission::Admitted
}

/// Durable recipe run history: `RecipeKey → last_run_epoch_ms`.
///
/// Stored as a `key=value` text file; entries are created on the first
/// successful run and updated thereafter, never deleted. Every update is
/// persisted immediately.
pub struct ScheduleState {
    path: PathBuf,
    entries: HashMap<String, u64>,
}

impl ScheduleState {
    /// Load the store; a missing file is an empty history
    pub fn load<P: AsRef<Path>>(path: P) -> CcsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        match fs::read_to_string(&path) {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (key, value) = line.split_once('=').ok_or_else(|| {
                        CcsError::Schedule(format!("malformed line {} in {}", lineno + 1, path.display()))
                    })?;
                    let timestamp: u64 = value.trim().parse().map_err(|_| {
                        CcsError::Schedule(format!(
                            "bad timestamp on line {} in {}",
                            lineno + 1,
                            path.display()
                        ))
                    })?;
                    entries.insert(key.trim().to_string(), timestamp);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CcsError::Io(e)),
        }

        Ok(Self { path, entries })
    }

    pub fn last_run(&self, key: &RecipeKey) -> Option<u64> {
        self.entries.get(key.as_str()).copied()
    }

    /// Record a successful run and persist the whole store immediately
    pub fn record(&mut self, key: &RecipeKey, run_epoch_ms: u64) -> CcsResult<()> {
        self.entries.insert(key.as_str().to_string(), run_epoch_ms);
        self.persist()
    }

    fn persist(&self) -> CcsResult<()> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        let mut content = String::new();
        content.push_str("# CCS calibration schedule state\n");
        content.push_str(&format!("# updated {}\n", Utc::now().to_rfc3339()));
        for key in keys {
            content.push_str(&format!("{}={}\n", key, self.entries[key]));
        }

        // Write-then-rename so a crash mid-write never truncates the store
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| CcsError::Schedule(format!("create {}: {}", temp_path.display(), e)))?;
        file.write_all(content.as_bytes())
            .map_err(|e| CcsError::Schedule(format!("write {}: {}", temp_path.display(), e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| CcsError::Schedule(format!("rename to {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CalibrateParams {
    time_budget_ms: u64,
}

/// CALIBRATE - run due calibration recipes inside a time budget
pub struct CalibrateCommand {
    recipes_run: u32,
    frames_taken: u32,
}

impl CalibrateCommand {
    pub fn new() -> Self {
        Self {
            recipes_run: 0,
            frames_taken: 0,
        }
    }

    fn run_recipe(&mut self, recipe: &Recipe, ctx: &mut Context<'_>) -> CcsResult<Option<Done>> {
        let pipeline_addr = ctx.config.pipeline_addr.clone();
        let overhead = ctx.config.readout_overhead_ms;

        ctx.hardware.driver(ctx.session.id)?.setup(
            recipe.bin,
            AmpSelect::from_alt_flag(recipe.use_alt_amplifier),
        )?;

        for _ in 0..recipe.count {
            checkpoint(ctx.session)?;

            // Per-frame Ack, sent before the integration it covers
            let frame_budget = recipe
                .exposure_ms
                .saturating_add(overhead)
                .saturating_add(ctx.session.default_ack_ms);
            ctx.link.send_ack(ctx.command_id, frame_budget)?;

            let frame = {
                let mut driver = ctx.hardware.driver(ctx.session.id)?;
                checkpoint(ctx.session)?;
                if recipe.kind == RecipeKind::Dark {
                    driver.expose(recipe.exposure_ms)?;
                }
                driver.readout()?
            };
            let path = ctx.frames.write(&frame)?;

            checkpoint(ctx.session)?;

            let peer_cmd = Command::new(ctx.command_id, peer_tags::REDUCE)
                .with_field("frame_path", json!(path.display().to_string()))
                .with_field("kind", json!(recipe.kind.name()));
            let peer_done = delegate(ctx, &pipeline_addr, peer_cmd)?;
            if peer_done.is_local_abort() {
                return Err(CcsError::Aborted);
            }
            if !peer_done.successful {
                return Ok(Some(Done::failure(
                    ctx.command_id,
                    codes::PEER_FAILED,
                    format!(
                        "pipeline reduction failed: {} ({})",
                        peer_done.error_message, peer_done.error_code
                    ),
                )));
            }

            self.frames_taken += 1;

            // Reduction-done Ack
            ctx.link.send_ack(ctx.command_id, ctx.session.default_ack_ms)?;
        }

        Ok(None)
    }

    fn run_inner(&mut self, command: &Command, ctx: &mut Context<'_>) -> CcsResult<Done> {
        let params: CalibrateParams = parse_params(command)?;

        let recipes = load_recipes(&ctx.config.recipe_path)?;
        let mut state = ScheduleState::load(&ctx.config.schedule_state_path)?;

        let start_ms = now_epoch_ms();
        let deadline_ms = start_ms.saturating_add(params.time_budget_ms);
        info!(
            "{}: calibration run, {} recipes, budget {} ms",
            ctx.session.id,
            recipes.len(),
            params.time_budget_ms
        );

        for recipe in &recipes {
            checkpoint(ctx.session)?;

            let key = recipe.key();
            let now = now_epoch_ms();
            match admit(
                recipe,
                state.last_run(&key),
                now,
                deadline_ms,
                ctx.config.readout_overhead_ms,
            ) {
                Admission::FrequencyGate => {
                    debug!("{}: {} not due, skipped", ctx.session.id, key.as_str());
                    continue;
                }
                Admission::BudgetGate => {
                    debug!(
                        "{}: {} does not fit remaining budget, skipped",
                        ctx.session.id,
                        key.as_str()
                    );
                    continue;
                }
                Admission::Admitted => {}
            }

            info!("{}: running recipe {}", ctx.session.id, key.as_str());
            if let Some(failure) = self.run_recipe(recipe, ctx)? {
                return Ok(failure);
            }

            // Persist before moving on: a later failure must not roll this
            // recipe's completion back.
            state.record(&key, now_epoch_ms())?;
            self.recipes_run += 1;
        }

        checkpoint(ctx.session)?;

        // Cover the potentially long master-bias build with one more Ack
        ctx.link.send_ack(ctx.command_id, ctx.session.default_ack_ms)?;
        let pipeline_addr = ctx.config.pipeline_addr.clone();
        let peer_cmd = Command::new(ctx.command_id, peer_tags::BUILD_MASTER_BIAS);
        let peer_done = delegate(ctx, &pipeline_addr, peer_cmd)?;
        if peer_done.is_local_abort() {
            return Err(CcsError::Aborted);
        }
        if !peer_done.successful {
            return Ok(Done::failure(
                command.id,
                codes::PEER_FAILED,
                format!(
                    "master bias build failed: {} ({})",
                    peer_done.error_message, peer_done.error_code
                ),
            ));
        }

        Ok(Done::success(command.id)
            .with_field("recipes_run", json!(self.recipes_run))
            .with_field("frames_taken", json!(self.frames_taken)))
    }
}

impl CommandExec for CalibrateCommand {
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        self.run_inner(command, ctx)
            .unwrap_or_else(|e| done_from_err(command.id, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccslib::Binning;

    const MINUTE_MS: u64 = 60_000;
    const HOUR_MS: u64 = 60 * MINUTE_MS;

    fn bias_recipe(frequency_ms: u64) -> Recipe {
        Recipe {
            kind: RecipeKind::Bias,
            bin: Binning(1),
            use_alt_amplifier: false,
            frequency_ms,
            count: 1,
            exposure_ms: 0,
        }
    }

    #[test]
    fn test_budget_gate_boundaries() {
        let now = 1_000_000;
        let budget = 60 * MINUTE_MS;
        let deadline = now + budget;

        // Predicted 5 minutes, never run: fits
        let r1 = bias_recipe(HOUR_MS);
        assert_eq!(
            admit(&r1, None, now, deadline, 5 * MINUTE_MS),
            Admission::Admitted
        );

        // Predicted 61 minutes: over a 60 minute budget
        let r2 = bias_recipe(24 * HOUR_MS);
        assert_eq!(
            admit(&r2, None, now, deadline, 61 * MINUTE_MS),
            Admission::BudgetGate
        );

        // Exactly the remaining budget: admitted
        assert_eq!(
            admit(&r2, None, now, deadline, 60 * MINUTE_MS),
            Admission::Admitted
        );

        // One millisecond over: rejected
        let r3 = bias_recipe(24 * HOUR_MS);
        assert_eq!(
            admit(&r3, None, now, deadline, 60 * MINUTE_MS + 1),
            Admission::BudgetGate
        );
    }

    #[test]
    fn test_frequency_gate_boundaries() {
        let recipe = bias_recipe(HOUR_MS);
        let deadline = u64::MAX;

        // Never run: due
        assert_eq!(admit(&recipe, None, 0, deadline, 1), Admission::Admitted);

        // Due exactly now: admitted
        assert_eq!(
            admit(&recipe, Some(0), HOUR_MS, deadline, 1),
            Admission::Admitted
        );

        // One millisecond early: rejected
        assert_eq!(
            admit(&recipe, Some(0), HOUR_MS - 1, deadline, 1),
            Admission::FrequencyGate
        );
    }

    #[test]
    fn test_rerun_after_success_admits_nothing() {
        let recipes = vec![bias_recipe(HOUR_MS), bias_recipe(24 * HOUR_MS)];
        let now = 5_000_000;
        let deadline = now + 60 * MINUTE_MS;

        let mut last_runs: HashMap<String, u64> = HashMap::new();
        for recipe in &recipes {
            assert_eq!(
                admit(recipe, last_runs.get(recipe.key().as_str()).copied(), now, deadline, 1),
                Admission::Admitted
            );
            last_runs.insert(recipe.key().as_str().to_string(), now);
        }

        // Identical recipes, unchanged clock: the frequency gate holds for all
        for recipe in &recipes {
            assert_eq!(
                admit(recipe, last_runs.get(recipe.key().as_str()).copied(), now, deadline, 1),
                Admission::FrequencyGate
            );
        }
    }

    #[test]
    fn test_schedule_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.state");

        let key = bias_recipe(HOUR_MS).key();
        {
            let mut state = ScheduleState::load(&path).unwrap();
            assert_eq!(state.last_run(&key), None);
            state.record(&key, 123_456).unwrap();
        }

        let state = ScheduleState::load(&path).unwrap();
        assert_eq!(state.last_run(&key), Some(123_456));
    }

    #[test]
    fn test_schedule_state_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.state");
        let key = bias_recipe(HOUR_MS).key();

        let mut state = ScheduleState::load(&path).unwrap();
        state.record(&key, 100).unwrap();
        state.record(&key, 200).unwrap();

        let reloaded = ScheduleState::load(&path).unwrap();
        assert_eq!(reloaded.last_run(&key), Some(200));
    }

    #[test]
    fn test_schedule_state_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.state");
        fs::write(&path, "# header\nnot a valid line\n").unwrap();

        let result = ScheduleState::load(&path);
        assert!(matches!(result, Err(CcsError::Schedule(_))));
    }
}
