//! # Stage: Test Registry
//!
//! ## Responsibility
//! Turns a caller-supplied [`TestConfig`] into a validated draft [`Test`]:
//! variant count and weight-sum checks, confidence level, sample-size and
//! duration bounds, and sequential `variant_N` id assignment. Also owns the
//! built-in template catalogue.
//!
//! ## Guarantees
//! - A config that fails validation never produces a `Test`
//! - Variant ids are `variant_1..variant_N` in definition order
//! - Every built-in template validates as-is
//!
//! ## NOT Responsible For
//! - Persisting the test (see `service`)
//! - Lifecycle transitions after creation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AbTestError, Result};
use crate::model::{TargetAudience, TargetMetric, Test, TestStatus, TestType, Variant};

/// Accepted confidence levels, in percent.
pub const CONFIDENCE_LEVELS: [u8; 3] = [90, 95, 99];

pub const MIN_SAMPLE_SIZE: u32 = 10;
pub const MAX_SAMPLE_SIZE: u32 = 10_000;
pub const MAX_DURATION_DAYS: u32 = 365;

// ---------------------------------------------------------------------------
// TestConfig: what a caller submits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantConfig {
    pub name: String,
    #[serde(default)]
    pub content: serde_json::Value,
    pub weight: f64,
}

impl VariantConfig {
    pub fn new(name: impl Into<String>, content: serde_json::Value, weight: f64) -> Self {
        Self { name: name.into(), content, weight }
    }
}

fn default_minimum_sample_size() -> u32 {
    30
}

fn default_confidence_level() -> u8 {
    95
}

fn default_expected_effect() -> f64 {
    10.0
}

/// Definition of a new test, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub test_type: TestType,
    pub variants: Vec<VariantConfig>,
    #[serde(default)]
    pub target_metric: TargetMetric,
    #[serde(default = "default_minimum_sample_size")]
    pub minimum_sample_size: u32,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: u8,
    #[serde(default = "default_expected_effect")]
    pub expected_effect: f64,
    #[serde(default, rename = "duration")]
    pub duration_days: Option<u32>,
    #[serde(default)]
    pub target_audience: Option<TargetAudience>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TestConfig {
    /// A config with the defaults for everything but name, type and variants.
    pub fn new(name: impl Into<String>, test_type: TestType, variants: Vec<VariantConfig>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            test_type,
            variants,
            target_metric: TargetMetric::default(),
            minimum_sample_size: default_minimum_sample_size(),
            confidence_level: default_confidence_level(),
            expected_effect: default_expected_effect(),
            duration_days: None,
            target_audience: None,
            tags: Vec::new(),
            notes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TestRegistry
// ---------------------------------------------------------------------------

/// Validation rules for new tests.
#[derive(Debug, Clone)]
pub struct TestRegistry {
    weight_tolerance: f64,
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self { weight_tolerance: 0.01 }
    }
}

impl TestRegistry {
    pub fn new(weight_tolerance: f64) -> Self {
        Self { weight_tolerance }
    }

    /// At least two variants, each weight in `[0, 100]`, summing to 100
    /// within the configured tolerance.
    pub fn validate_variants(&self, variants: &[VariantConfig]) -> Result<()> {
        if variants.len() < 2 {
            return Err(AbTestError::InvalidVariantConfiguration(format!(
                "at least 2 variants are required, got {}",
                variants.len()
            )));
        }
        if let Some(v) = variants
            .iter()
            .find(|v| !v.weight.is_finite() || !(0.0..=100.0).contains(&v.weight))
        {
            return Err(AbTestError::InvalidVariantConfiguration(format!(
                "variant '{}' has weight {} outside [0, 100]",
                v.name, v.weight
            )));
        }
        let total: f64 = variants.iter().map(|v| v.weight).sum();
        if (total - 100.0).abs() > self.weight_tolerance {
            return Err(AbTestError::InvalidVariantConfiguration(format!(
                "variant weights must sum to 100%, got {total}"
            )));
        }
        Ok(())
    }

    pub fn validate(&self, config: &TestConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(AbTestError::InvalidConfiguration("test name must not be empty".into()));
        }
        self.validate_variants(&config.variants)?;
        if !CONFIDENCE_LEVELS.contains(&config.confidence_level) {
            return Err(AbTestError::InvalidConfidenceLevel(config.confidence_level));
        }
        if !(MIN_SAMPLE_SIZE..=MAX_SAMPLE_SIZE).contains(&config.minimum_sample_size) {
            return Err(AbTestError::InvalidConfiguration(format!(
                "minimum sample size must be in [{MIN_SAMPLE_SIZE}, {MAX_SAMPLE_SIZE}], got {}",
                config.minimum_sample_size
            )));
        }
        if !(1.0..=100.0).contains(&config.expected_effect) {
            return Err(AbTestError::InvalidConfiguration(format!(
                "expected effect must be in [1, 100], got {}",
                config.expected_effect
            )));
        }
        if let Some(days) = config.duration_days {
            if !(1..=MAX_DURATION_DAYS).contains(&days) {
                return Err(AbTestError::InvalidConfiguration(format!(
                    "duration must be in [1, {MAX_DURATION_DAYS}] days, got {days}"
                )));
            }
        }
        Ok(())
    }

    /// Validate `config` and build the draft test it describes.
    pub fn build(
        &self,
        id: String,
        owner: &str,
        config: TestConfig,
        now: DateTime<Utc>,
    ) -> Result<Test> {
        self.validate(&config)?;

        let variants = config
            .variants
            .into_iter()
            .enumerate()
            .map(|(i, v)| Variant {
                id: format!("variant_{}", i + 1),
                name: v.name,
                content: v.content,
                weight: v.weight,
            })
            .collect();

        Ok(Test {
            id,
            name: config.name,
            description: config.description,
            owner: owner.to_string(),
            test_type: config.test_type,
            status: TestStatus::Draft,
            variants,
            target_metric: config.target_metric,
            minimum_sample_size: config.minimum_sample_size,
            confidence_level: config.confidence_level,
            expected_effect: config.expected_effect,
            duration_days: config.duration_days,
            start_date: None,
            end_date: None,
            target_audience: config.target_audience.filter(|a| !a.is_unrestricted()),
            tags: config.tags,
            notes: config.notes,
            created_at: now,
            results: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A ready-made test definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub test_type: TestType,
    pub variants: Vec<VariantConfig>,
    pub target_metric: TargetMetric,
    pub minimum_sample_size: u32,
    pub expected_effect: f64,
}

/// Overrides applied on top of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateCustomizations {
    pub name: Option<String>,
    pub description: Option<String>,
    pub minimum_sample_size: Option<u32>,
    pub confidence_level: Option<u8>,
    pub expected_effect: Option<f64>,
    #[serde(rename = "duration")]
    pub duration_days: Option<u32>,
    pub target_audience: Option<TargetAudience>,
    pub tags: Option<Vec<String>>,
}

impl TestTemplate {
    pub fn to_config(&self, custom: TemplateCustomizations) -> TestConfig {
        TestConfig {
            name: custom.name.unwrap_or_else(|| self.name.clone()),
            description: custom.description.unwrap_or_else(|| self.description.clone()),
            test_type: self.test_type,
            variants: self.variants.clone(),
            target_metric: self.target_metric,
            minimum_sample_size: custom.minimum_sample_size.unwrap_or(self.minimum_sample_size),
            confidence_level: custom.confidence_level.unwrap_or_else(default_confidence_level),
            expected_effect: custom.expected_effect.unwrap_or(self.expected_effect),
            duration_days: custom.duration_days,
            target_audience: custom.target_audience,
            tags: custom.tags.unwrap_or_default(),
            notes: None,
        }
    }
}

/// The built-in template catalogue.
pub fn templates() -> Vec<TestTemplate> {
    use serde_json::json;

    vec![
        TestTemplate {
            id: "cover_letter_tone".into(),
            name: "Cover Letter Tone Test".into(),
            description: "Test different tones in cover letters (professional vs. enthusiastic)"
                .into(),
            test_type: TestType::CoverLetter,
            variants: vec![
                VariantConfig::new(
                    "Professional Tone",
                    json!({
                        "tone": "professional",
                        "style": "formal",
                        "keywords": ["experienced", "qualified", "professional"]
                    }),
                    50.0,
                ),
                VariantConfig::new(
                    "Enthusiastic Tone",
                    json!({
                        "tone": "enthusiastic",
                        "style": "engaging",
                        "keywords": ["excited", "passionate", "eager"]
                    }),
                    50.0,
                ),
            ],
            target_metric: TargetMetric::ResponseRate,
            minimum_sample_size: 50,
            expected_effect: 15.0,
        },
        TestTemplate {
            id: "application_timing".into(),
            name: "Application Timing Test".into(),
            description: "Test optimal times for job applications".into(),
            test_type: TestType::Timing,
            variants: vec![
                VariantConfig::new(
                    "Morning (9-11 AM)",
                    json!({ "timeRange": "09:00-11:00", "timezone": "local" }),
                    33.33,
                ),
                VariantConfig::new(
                    "Afternoon (1-3 PM)",
                    json!({ "timeRange": "13:00-15:00", "timezone": "local" }),
                    33.33,
                ),
                VariantConfig::new(
                    "Evening (5-7 PM)",
                    json!({ "timeRange": "17:00-19:00", "timezone": "local" }),
                    33.34,
                ),
            ],
            target_metric: TargetMetric::ResponseRate,
            minimum_sample_size: 75,
            expected_effect: 10.0,
        },
        TestTemplate {
            id: "subject_line_style".into(),
            name: "Email Subject Line Test".into(),
            description: "Test different email subject line styles".into(),
            test_type: TestType::SubjectLine,
            variants: vec![
                VariantConfig::new(
                    "Direct",
                    json!({ "template": "Application for {jobTitle} - {userName}", "style": "direct" }),
                    50.0,
                ),
                VariantConfig::new(
                    "Question-based",
                    json!({ "template": "Could I be your next {jobTitle}?", "style": "question" }),
                    50.0,
                ),
            ],
            target_metric: TargetMetric::OpenRate,
            minimum_sample_size: 40,
            expected_effect: 20.0,
        },
        TestTemplate {
            id: "follow_up_timing".into(),
            name: "Follow-up Timing Test".into(),
            description: "Test optimal timing for follow-up emails".into(),
            test_type: TestType::FollowUp,
            variants: vec![
                VariantConfig::new(
                    "1 Week Follow-up",
                    json!({ "days": 7, "message": "polite_inquiry" }),
                    50.0,
                ),
                VariantConfig::new(
                    "2 Week Follow-up",
                    json!({ "days": 14, "message": "polite_inquiry" }),
                    50.0,
                ),
            ],
            target_metric: TargetMetric::ResponseRate,
            minimum_sample_size: 60,
            expected_effect: 12.0,
        },
    ]
}

pub fn find_template(template_id: &str) -> Result<TestTemplate> {
    templates()
        .into_iter()
        .find(|t| t.id == template_id)
        .ok_or_else(|| AbTestError::TemplateNotFound(template_id.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn variants(weights: &[f64]) -> Vec<VariantConfig> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| VariantConfig::new(format!("v{i}"), json!({ "i": i }), *w))
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[rstest]
    #[case(&[50.0, 50.0])]
    #[case(&[40.0, 30.0, 30.0])]
    #[case(&[33.33, 33.33, 33.34])]
    #[case(&[50.005, 50.0])]
    #[case(&[100.0, 0.0])]
    fn test_valid_weights_accepted(#[case] weights: &[f64]) {
        assert!(TestRegistry::default().validate_variants(&variants(weights)).is_ok());
    }

    #[rstest]
    #[case(&[49.5, 49.5])]
    #[case(&[60.0, 50.0])]
    #[case(&[50.02, 50.0])]
    #[case(&[100.0])]
    #[case(&[])]
    #[case(&[150.0, -50.0])]
    fn test_invalid_weights_rejected(#[case] weights: &[f64]) {
        let err = TestRegistry::default().validate_variants(&variants(weights)).unwrap_err();
        assert!(matches!(err, AbTestError::InvalidVariantConfiguration(_)), "{err}");
    }

    #[test]
    fn test_nan_weight_rejected() {
        let err = TestRegistry::default()
            .validate_variants(&variants(&[f64::NAN, 50.0]))
            .unwrap_err();
        assert!(matches!(err, AbTestError::InvalidVariantConfiguration(_)));
    }

    #[rstest]
    #[case(90, true)]
    #[case(95, true)]
    #[case(99, true)]
    #[case(80, false)]
    #[case(100, false)]
    fn test_confidence_levels(#[case] level: u8, #[case] ok: bool) {
        let mut cfg = TestConfig::new("t", TestType::CoverLetter, variants(&[50.0, 50.0]));
        cfg.confidence_level = level;
        let res = TestRegistry::default().validate(&cfg);
        if ok {
            assert!(res.is_ok());
        } else {
            assert!(matches!(res, Err(AbTestError::InvalidConfidenceLevel(l)) if l == level));
        }
    }

    #[rstest]
    #[case(9)]
    #[case(10_001)]
    fn test_sample_size_bounds(#[case] n: u32) {
        let mut cfg = TestConfig::new("t", TestType::Timing, variants(&[50.0, 50.0]));
        cfg.minimum_sample_size = n;
        assert!(matches!(
            TestRegistry::default().validate(&cfg),
            Err(AbTestError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_duration_bounds() {
        let mut cfg = TestConfig::new("t", TestType::Timing, variants(&[50.0, 50.0]));
        cfg.duration_days = Some(0);
        assert!(TestRegistry::default().validate(&cfg).is_err());
        cfg.duration_days = Some(366);
        assert!(TestRegistry::default().validate(&cfg).is_err());
        cfg.duration_days = Some(30);
        assert!(TestRegistry::default().validate(&cfg).is_ok());
    }

    #[test]
    fn test_blank_name_rejected() {
        let cfg = TestConfig::new("  ", TestType::Timing, variants(&[50.0, 50.0]));
        assert!(matches!(
            TestRegistry::default().validate(&cfg),
            Err(AbTestError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_build_assigns_sequential_variant_ids() {
        let cfg = TestConfig::new("t", TestType::CvTemplate, variants(&[40.0, 30.0, 30.0]));
        let test = TestRegistry::default().build("id-1".into(), "owner", cfg, now()).unwrap();
        let ids: Vec<&str> = test.variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["variant_1", "variant_2", "variant_3"]);
        assert_eq!(test.status, TestStatus::Draft);
        assert_eq!(test.created_at, now());
        assert!(test.start_date.is_none());
        assert!(test.results.is_none());
    }

    #[test]
    fn test_build_drops_empty_audience() {
        let mut cfg = TestConfig::new("t", TestType::CvTemplate, variants(&[50.0, 50.0]));
        cfg.target_audience = Some(TargetAudience::default());
        let test = TestRegistry::default().build("id".into(), "o", cfg, now()).unwrap();
        assert!(test.target_audience.is_none());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: TestConfig = serde_json::from_value(json!({
            "name": "tone",
            "type": "cover_letter",
            "variants": [
                { "name": "A", "content": { "tone": "formal" }, "weight": 50 },
                { "name": "B", "weight": 50 }
            ],
            "duration": 14
        }))
        .unwrap();
        assert_eq!(cfg.minimum_sample_size, 30);
        assert_eq!(cfg.confidence_level, 95);
        assert_eq!(cfg.duration_days, Some(14));
        assert_eq!(cfg.variants[1].content, serde_json::Value::Null);
    }

    #[test]
    fn test_every_template_validates() {
        let registry = TestRegistry::default();
        for t in templates() {
            let cfg = t.to_config(TemplateCustomizations::default());
            assert!(registry.validate(&cfg).is_ok(), "template {} invalid", t.id);
        }
    }

    #[test]
    fn test_template_customizations_override() {
        let t = find_template("subject_line_style").unwrap();
        let cfg = t.to_config(TemplateCustomizations {
            name: Some("Q3 subject lines".into()),
            confidence_level: Some(99),
            duration_days: Some(21),
            ..Default::default()
        });
        assert_eq!(cfg.name, "Q3 subject lines");
        assert_eq!(cfg.confidence_level, 99);
        assert_eq!(cfg.duration_days, Some(21));
        assert_eq!(cfg.minimum_sample_size, 40);
        assert_eq!(cfg.target_metric, TargetMetric::OpenRate);
    }

    #[test]
    fn test_unknown_template() {
        assert!(matches!(
            find_template("nope"),
            Err(AbTestError::TemplateNotFound(id)) if id == "nope"
        ));
    }
}
