//! # Stage: Data Model
//!
//! ## Responsibility
//! Records shared by every stage of the engine: test definitions with their
//! embedded variants, participation ledger entries, and analysis snapshots.
//!
//! ## Guarantees
//! - Serializable: every record round-trips through serde (camelCase fields,
//!   snake_case enum values), which is what the SQLite store persists
//! - Enum string forms are stable (`as_str` / `FromStr` agree with serde)
//!
//! ## NOT Responsible For
//! - Validation of test configurations (see `registry`)
//! - State transitions (see `service`)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// What a test varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    CoverLetter,
    ApplicationMethod,
    Timing,
    CvTemplate,
    SubjectLine,
    FollowUp,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::CoverLetter => "cover_letter",
            TestType::ApplicationMethod => "application_method",
            TestType::Timing => "timing",
            TestType::CvTemplate => "cv_template",
            TestType::SubjectLine => "subject_line",
            TestType::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover_letter" => Ok(TestType::CoverLetter),
            "application_method" => Ok(TestType::ApplicationMethod),
            "timing" => Ok(TestType::Timing),
            "cv_template" => Ok(TestType::CvTemplate),
            "subject_line" => Ok(TestType::SubjectLine),
            "follow_up" => Ok(TestType::FollowUp),
            other => Err(format!("unknown test type: {other}")),
        }
    }
}

/// Lifecycle state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Draft => "draft",
            TestStatus::Running => "running",
            TestStatus::Paused => "paused",
            TestStatus::Completed => "completed",
            TestStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TestStatus::Draft),
            "running" => Ok(TestStatus::Running),
            "paused" => Ok(TestStatus::Paused),
            "completed" => Ok(TestStatus::Completed),
            "archived" => Ok(TestStatus::Archived),
            other => Err(format!("unknown test status: {other}")),
        }
    }
}

/// The rate a test is trying to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    #[default]
    ResponseRate,
    InterviewRate,
    OfferRate,
    ClickRate,
    OpenRate,
}

impl TargetMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMetric::ResponseRate => "response_rate",
            TargetMetric::InterviewRate => "interview_rate",
            TargetMetric::OfferRate => "offer_rate",
            TargetMetric::ClickRate => "click_rate",
            TargetMetric::OpenRate => "open_rate",
        }
    }
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The event that counts as success for a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    Response,
    Interview,
    Offer,
    Click,
    Open,
}

impl ConversionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionType::Response => "response",
            ConversionType::Interview => "interview",
            ConversionType::Offer => "offer",
            ConversionType::Click => "click",
            ConversionType::Open => "open",
        }
    }
}

impl fmt::Display for ConversionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response" => Ok(ConversionType::Response),
            "interview" => Ok(ConversionType::Interview),
            "offer" => Ok(ConversionType::Offer),
            "click" => Ok(ConversionType::Click),
            "open" => Ok(ConversionType::Open),
            other => Err(format!("unknown conversion type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Test definition
// ---------------------------------------------------------------------------

/// One treatment arm of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// `variant_1`, `variant_2`, ... in definition order.
    pub id: String,
    pub name: String,
    /// Opaque payload handed back to the caller on assignment.
    pub content: serde_json::Value,
    /// Percentage share of traffic, 0–100.
    pub weight: f64,
}

/// Eligibility filters. An empty list means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetAudience {
    pub industries: Vec<String>,
    pub experience_levels: Vec<String>,
    pub locations: Vec<String>,
    pub job_types: Vec<String>,
}

impl TargetAudience {
    pub fn is_unrestricted(&self) -> bool {
        self.industries.is_empty()
            && self.experience_levels.is_empty()
            && self.locations.is_empty()
            && self.job_types.is_empty()
    }
}

/// An experiment definition plus its live lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// User who created and owns the test.
    pub owner: String,
    #[serde(rename = "type")]
    pub test_type: TestType,
    pub status: TestStatus,
    pub variants: Vec<Variant>,
    pub target_metric: TargetMetric,
    pub minimum_sample_size: u32,
    /// 90, 95 or 99.
    pub confidence_level: u8,
    /// Expected improvement, in percent.
    pub expected_effect: f64,
    /// Planned run length in days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<TargetAudience>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<TestResults>,
}

impl Test {
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }
}

// ---------------------------------------------------------------------------
// Participation ledger
// ---------------------------------------------------------------------------

/// Audience attributes supplied by the caller at assignment time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParticipantContext {
    pub job_title: Option<String>,
    pub company: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
    pub job_type: Option<String>,
    pub experience_level: Option<String>,
    pub salary_range: Option<String>,
    pub application_method: Option<String>,
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
}

/// Uniqueness key of the ledger: one participation per tuple.
///
/// An empty application id is the same key as no application id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipationKey {
    pub test_id: String,
    pub participant_id: String,
    pub application_id: Option<String>,
}

impl ParticipationKey {
    pub fn new(
        test_id: impl Into<String>,
        participant_id: impl Into<String>,
        application_id: Option<String>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            participant_id: participant_id.into(),
            application_id: application_id.filter(|a| !a.is_empty()),
        }
    }
}

/// Durable record linking one participant to the variant they were assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub test_id: String,
    pub participant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    pub variant_id: String,
    pub variant_name: String,
    pub assigned_at: DateTime<Utc>,
    pub exposed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_at: Option<DateTime<Utc>>,
    pub converted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_type: Option<ConversionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ParticipantContext>,
}

impl Participation {
    pub fn key(&self) -> ParticipationKey {
        ParticipationKey::new(
            self.test_id.clone(),
            self.participant_id.clone(),
            self.application_id.clone(),
        )
    }
}

/// What a caller receives from `assign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantAssignment {
    pub test_id: String,
    pub variant_id: String,
    pub variant_name: String,
    pub content: serde_json::Value,
}

/// Outcome of a storage-level conversion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// This call flipped `converted` from false to true.
    Converted,
    /// Someone already converted this participant; nothing changed.
    AlreadyConverted,
    NotFound,
}

// ---------------------------------------------------------------------------
// Analysis snapshot
// ---------------------------------------------------------------------------

/// Interval bounds in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantResult {
    pub id: String,
    pub name: String,
    pub participants: u64,
    pub conversions: u64,
    /// Percent, 0–100.
    pub conversion_rate: f64,
    pub confidence_interval: ConfidenceInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub test_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// (1 - pValue) × 100.
    pub confidence: f64,
    pub statistical_significance: bool,
    pub p_value: f64,
    /// Absolute percentage-point difference between the top two variants.
    pub effect_size: f64,
    pub variants: Vec<VariantResult>,
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}
