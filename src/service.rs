//! # Stage: Experiment Service (Lifecycle Controller)
//!
//! ## Responsibility
//! The single entry point callers use: creates tests through the registry,
//! drives the draft → running → paused/completed → archived state machine,
//! assigns variants, records conversions, runs analyses and the
//! auto-completion policy.
//!
//! ## Guarantees
//! - Explicit transitions: every status change is a visible call in this
//!   file, never a storage-level hook
//! - Idempotent assignment: a returning participant always gets the variant
//!   recorded in the ledger, including when a concurrent caller won the
//!   insert race
//! - Idempotent conversion: only the caller that flips `converted` runs the
//!   auto-completion check
//! - Thread-safe: `Send + Sync`, share it behind an `Arc`
//!
//! ## NOT Responsible For
//! - Authentication, HTTP, or enriching audience context from user profiles
//! - Time-driven completion on its own: [`ExperimentService::sweep`] must be
//!   called by an external scheduler

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignment::{matches_target_audience, select_variant};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{AbTestError, Result};
use crate::model::{
    ConversionOutcome, ConversionType, ParticipantContext, Participation, ParticipationKey, Test,
    TestResults, TestStatus, TestType, VariantAssignment,
};
use crate::random::{RandomSource, ThreadRandom};
use crate::registry::{self, TemplateCustomizations, TestConfig, TestRegistry, TestTemplate};
use crate::stats;
use crate::storage::Storage;

/// The experimentation engine, wired to its collaborators.
///
/// # Construction
/// - `new(storage)`: wall clock, thread RNG, default [`EngineConfig`]
/// - `with_clock` / `with_random` / `with_config`: swap collaborators,
///   typically for deterministic tests
pub struct ExperimentService {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    registry: TestRegistry,
    config: EngineConfig,
}

impl ExperimentService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let config = EngineConfig::default();
        Self {
            storage,
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            registry: TestRegistry::new(config.weight_tolerance),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.registry = TestRegistry::new(config.weight_tolerance);
        self.config = config;
        self
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Validate `config` and store it as a new draft test owned by `owner`.
    pub fn create_test(&self, owner: &str, config: TestConfig) -> Result<Test> {
        let test = self.registry.build(
            Uuid::new_v4().to_string(),
            owner,
            config,
            self.clock.now(),
        )?;
        self.storage.insert_test(&test)?;
        info!(
            test_id = %test.id,
            owner = %owner,
            test_type = %test.test_type,
            variants = test.variants.len(),
            "A/B test created"
        );
        Ok(test)
    }

    pub fn templates(&self) -> Vec<TestTemplate> {
        registry::templates()
    }

    pub fn create_from_template(
        &self,
        owner: &str,
        template_id: &str,
        customizations: TemplateCustomizations,
    ) -> Result<Test> {
        let template = registry::find_template(template_id)?;
        debug!(template_id = %template_id, "creating test from template");
        self.create_test(owner, template.to_config(customizations))
    }

    pub fn get_test(&self, test_id: &str) -> Result<Test> {
        self.storage
            .get_test(test_id)?
            .ok_or_else(|| AbTestError::TestNotFound(test_id.to_string()))
    }

    /// Running tests, most recently started first, optionally of one type.
    pub fn list_active_tests(&self, test_type: Option<TestType>) -> Result<Vec<Test>> {
        let mut tests: Vec<Test> = self
            .storage
            .list_tests()?
            .into_iter()
            .filter(|t| t.status == TestStatus::Running)
            .filter(|t| test_type.map_or(true, |ty| t.test_type == ty))
            .collect();
        tests.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(tests)
    }

    /// Tests owned by `owner`, newest first.
    pub fn list_user_tests(&self, owner: &str) -> Result<Vec<Test>> {
        let mut tests: Vec<Test> = self
            .storage
            .list_tests()?
            .into_iter()
            .filter(|t| t.owner == owner)
            .collect();
        tests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tests)
    }

    pub fn participations(&self, test_id: &str) -> Result<Vec<Participation>> {
        self.get_test(test_id)?;
        self.storage.list_participations(test_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// draft → running. Sets the start date, and the end date when the test
    /// has a planned duration.
    pub fn start(&self, test_id: &str) -> Result<Test> {
        let mut test = self.get_test(test_id)?;
        let from = test.status;
        if from != TestStatus::Draft {
            return Err(AbTestError::InvalidTransition { from, action: "start" });
        }
        test.status = TestStatus::Running;
        schedule(&mut test, self.clock.now());
        self.commit(&test, from, "start")?;
        info!(test_id = %test.id, end_date = ?test.end_date, "A/B test started");
        Ok(test)
    }

    /// draft, running or paused → paused. Completed and archived tests are
    /// final and cannot be paused.
    pub fn pause(&self, test_id: &str) -> Result<Test> {
        let mut test = self.get_test(test_id)?;
        let from = test.status;
        if matches!(from, TestStatus::Completed | TestStatus::Archived) {
            return Err(AbTestError::InvalidTransition { from, action: "pause" });
        }
        test.status = TestStatus::Paused;
        self.commit(&test, from, "pause")?;
        info!(test_id = %test.id, from = %from, "A/B test paused");
        Ok(test)
    }

    /// paused → running. `start_date` is kept; a test paused straight from
    /// draft is scheduled as if it were starting now.
    pub fn resume(&self, test_id: &str) -> Result<Test> {
        let mut test = self.get_test(test_id)?;
        let from = test.status;
        if from != TestStatus::Paused {
            return Err(AbTestError::InvalidTransition { from, action: "resume" });
        }
        test.status = TestStatus::Running;
        if test.start_date.is_none() {
            schedule(&mut test, self.clock.now());
        }
        self.commit(&test, from, "resume")?;
        info!(test_id = %test.id, "A/B test resumed");
        Ok(test)
    }

    /// Final analysis, then → completed with the end date set to now.
    /// Completing an already completed test returns it unchanged.
    pub fn complete(&self, test_id: &str) -> Result<Test> {
        self.complete_at(test_id, self.clock.now())
    }

    fn complete_at(&self, test_id: &str, now: DateTime<Utc>) -> Result<Test> {
        let test = self.get_test(test_id)?;
        match test.status {
            TestStatus::Archived => {
                return Err(AbTestError::InvalidTransition { from: test.status, action: "complete" })
            }
            TestStatus::Completed => return Ok(test),
            _ => {}
        }
        let results = self.evaluate(&test, now)?;
        if let Some(done) = self.finish(test, results, now)? {
            return Ok(done);
        }
        let current = self.get_test(test_id)?;
        if current.status == TestStatus::Completed {
            return Ok(current);
        }
        Err(AbTestError::InvalidTransition { from: current.status, action: "complete" })
    }

    /// completed → archived.
    pub fn archive(&self, test_id: &str) -> Result<Test> {
        let mut test = self.get_test(test_id)?;
        let from = test.status;
        if from != TestStatus::Completed {
            return Err(AbTestError::InvalidTransition { from, action: "archive" });
        }
        test.status = TestStatus::Archived;
        self.commit(&test, from, "archive")?;
        info!(test_id = %test.id, "A/B test archived");
        Ok(test)
    }

    /// Write the lifecycle of `test` if its stored status is still `from`.
    fn commit(&self, test: &Test, from: TestStatus, action: &'static str) -> Result<()> {
        if self.storage.save_lifecycle(test, from)? {
            return Ok(());
        }
        let current = self.get_test(&test.id)?;
        Err(AbTestError::InvalidTransition { from: current.status, action })
    }

    /// Move `test` to completed as of `now`. Returns `None` when another
    /// caller changed its status first.
    fn finish(
        &self,
        mut test: Test,
        results: TestResults,
        now: DateTime<Utc>,
    ) -> Result<Option<Test>> {
        let from = test.status;
        test.status = TestStatus::Completed;
        test.end_date = Some(now);
        if !self.storage.save_lifecycle(&test, from)? {
            debug!(test_id = %test.id, from = %from, "completion lost to a concurrent transition");
            return Ok(None);
        }
        info!(
            test_id = %test.id,
            winner = ?results.winner,
            p_value = results.p_value,
            "A/B test completed"
        );
        test.results = Some(results);
        Ok(Some(test))
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Assign `participant_id` (optionally scoped to `application_id`) to a
    /// variant of a running test.
    pub fn assign(
        &self,
        test_id: &str,
        participant_id: &str,
        application_id: Option<&str>,
        context: Option<ParticipantContext>,
    ) -> Result<VariantAssignment> {
        let test = self.get_test(test_id)?;
        if test.status != TestStatus::Running {
            return Err(AbTestError::TestNotRunning(test_id.to_string()));
        }

        let key = ParticipationKey::new(test_id, participant_id, application_id.map(String::from));
        if let Some(existing) = self.storage.get_participation(&key)? {
            debug!(test_id = %test_id, participant_id = %participant_id, variant_id = %existing.variant_id, "returning participant");
            return Ok(assignment_for(&test, &existing));
        }

        if let Some(audience) = &test.target_audience {
            if !matches_target_audience(context.as_ref(), audience) {
                warn!(test_id = %test_id, participant_id = %participant_id, "participant outside target audience");
                return Err(AbTestError::AudienceMismatch(test_id.to_string()));
            }
        }

        let draw = self.random.next_percent();
        let variant = select_variant(&test.variants, draw).ok_or_else(|| {
            AbTestError::InvalidVariantConfiguration(format!("test {test_id} has no variants"))
        })?;

        let now = self.clock.now();
        let participation = Participation {
            test_id: test_id.to_string(),
            participant_id: participant_id.to_string(),
            application_id: key.application_id.clone(),
            variant_id: variant.id.clone(),
            variant_name: variant.name.clone(),
            assigned_at: now,
            exposed_at: now,
            converted_at: None,
            converted: false,
            conversion_type: None,
            conversion_value: None,
            context,
        };

        let outcome = self.storage.insert_participation(participation)?;
        if !outcome.was_inserted() {
            debug!(test_id = %test_id, participant_id = %participant_id, "lost assignment race, using existing variant");
        }
        let recorded = outcome.into_participation();
        debug!(
            test_id = %test_id,
            participant_id = %participant_id,
            variant_id = %recorded.variant_id,
            draw,
            "variant assigned"
        );
        Ok(assignment_for(&test, &recorded))
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    /// Mark a participant as converted. Repeat calls are no-ops.
    pub fn record_conversion(
        &self,
        test_id: &str,
        participant_id: &str,
        conversion_type: ConversionType,
        application_id: Option<&str>,
        conversion_value: Option<f64>,
    ) -> Result<()> {
        let key = ParticipationKey::new(test_id, participant_id, application_id.map(String::from));
        let outcome = self.storage.mark_converted(
            &key,
            conversion_type,
            conversion_value,
            self.clock.now(),
        )?;
        match outcome {
            ConversionOutcome::NotFound => Err(AbTestError::ParticipantNotFound {
                test_id: test_id.to_string(),
                participant_id: participant_id.to_string(),
            }),
            ConversionOutcome::AlreadyConverted => {
                debug!(test_id = %test_id, participant_id = %participant_id, "conversion already recorded");
                Ok(())
            }
            ConversionOutcome::Converted => {
                debug!(
                    test_id = %test_id,
                    participant_id = %participant_id,
                    conversion_type = %conversion_type,
                    "conversion recorded"
                );
                self.check_auto_completion(test_id)?;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Analyse the current ledger and persist the results onto the test.
    pub fn analyze(&self, test_id: &str) -> Result<TestResults> {
        let test = self.get_test(test_id)?;
        self.evaluate(&test, self.clock.now())
    }

    fn evaluate(&self, test: &Test, now: DateTime<Utc>) -> Result<TestResults> {
        let participations = self.storage.list_participations(&test.id)?;
        let results = stats::analyze(
            test,
            &participations,
            self.config.small_sample_threshold,
            now,
        );
        self.storage.save_results(&test.id, &results)?;
        debug!(
            test_id = %test.id,
            participants = participations.len(),
            p_value = results.p_value,
            significant = results.statistical_significance,
            "A/B test analyzed"
        );
        Ok(results)
    }

    /// Complete a running test once it has enough participants, has run for
    /// the minimum number of days, and shows a significant winner. Returns
    /// `true` only for the caller whose check completed the test.
    pub fn check_auto_completion(&self, test_id: &str) -> Result<bool> {
        self.auto_complete_at(test_id, self.clock.now())
    }

    fn auto_complete_at(&self, test_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(test) = self.storage.get_test(test_id)? else {
            return Ok(false);
        };
        if test.status != TestStatus::Running {
            return Ok(false);
        }
        let count = self.storage.count_participations(test_id)?;
        if count < u64::from(test.minimum_sample_size) {
            return Ok(false);
        }
        let Some(start) = test.start_date else {
            return Ok(false);
        };
        if now - start < Duration::days(self.config.auto_complete_min_days) {
            return Ok(false);
        }

        let results = self.evaluate(&test, now)?;
        if !results.statistical_significance {
            return Ok(false);
        }
        info!(test_id = %test_id, participants = count, winner = ?results.winner, "auto-completing A/B test");
        Ok(self.finish(test, results, now)?.is_some())
    }

    /// Periodic pass over running tests as of `now`: completes those past
    /// their end date and re-evaluates auto-completion for the rest. Tests
    /// completed here get `now` as their end date. Returns the ids of tests
    /// completed by this pass.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let running: Vec<Test> = self
            .storage
            .list_tests()?
            .into_iter()
            .filter(|t| t.status == TestStatus::Running)
            .collect();

        let mut completed = Vec::new();
        for test in running {
            let id = test.id.clone();
            let expired = test.end_date.is_some_and(|end| now >= end);
            let outcome = if expired {
                info!(test_id = %id, "A/B test reached its end date");
                self.evaluate(&test, now)
                    .and_then(|results| self.finish(test, results, now))
                    .map(|done| done.is_some())
            } else {
                self.auto_complete_at(&id, now)
            };
            match outcome {
                Ok(true) => completed.push(id),
                Ok(false) => {}
                Err(e) => warn!(test_id = %id, error = %e, "sweep skipped test"),
            }
        }
        Ok(completed)
    }
}

/// Set the start date to `now` and derive the end date from the planned
/// duration.
fn schedule(test: &mut Test, now: DateTime<Utc>) {
    test.start_date = Some(now);
    test.end_date = test.duration_days.map(|d| now + Duration::days(i64::from(d)));
}

fn assignment_for(test: &Test, participation: &Participation) -> VariantAssignment {
    VariantAssignment {
        test_id: test.id.clone(),
        variant_id: participation.variant_id.clone(),
        variant_name: participation.variant_name.clone(),
        content: test
            .variant(&participation.variant_id)
            .map(|v| v.content.clone())
            .unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
