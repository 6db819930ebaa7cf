//! # Module: storage
//!
//! Persistence seam for tests and the participation ledger.
//!
//! The engine only talks to [`Storage`]; two backends ship with the crate:
//!
//! - [`memory::InMemoryStorage`]: mutex-guarded maps, for tests and
//!   embedding
//! - [`sqlite::SqliteStorage`]: `rusqlite` with a `UNIQUE` index on the
//!   participation key, used by the CLI
//!
//! ## Contract
//! - `insert_participation` is an atomic insert-if-absent on
//!   (test id, participant id, application id). Losing a race is not an
//!   error: the existing row is returned as [`InsertOutcome::Existing`].
//! - `mark_converted` is a compare-and-set on `converted`; exactly one caller
//!   observes [`ConversionOutcome::Converted`] for a given key.
//! - `save_lifecycle` is a compare-and-set on `status`: it writes status and
//!   dates only while the stored status still equals the caller's expected
//!   one, so two racing transitions cannot both apply.
//! - `save_lifecycle` writes only status and dates; `save_results` writes only
//!   the results snapshot. Neither clobbers the other.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    ConversionOutcome, ConversionType, Participation, ParticipationKey, Test, TestResults,
    TestStatus,
};

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Result of an insert-if-absent on the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Participation),
    /// A participation already existed for the key; it is returned unchanged.
    Existing(Participation),
}

impl InsertOutcome {
    pub fn into_participation(self) -> Participation {
        match self {
            InsertOutcome::Inserted(p) | InsertOutcome::Existing(p) => p,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

pub trait Storage: Send + Sync {
    /// Store a new test. Fails if the id is taken.
    fn insert_test(&self, test: &Test) -> Result<()>;

    fn get_test(&self, test_id: &str) -> Result<Option<Test>>;

    /// All tests, oldest first.
    fn list_tests(&self) -> Result<Vec<Test>>;

    /// Persist `status`, `start_date` and `end_date` of `test` if the stored
    /// status is still `expected`. Returns `false` when it has moved on.
    fn save_lifecycle(&self, test: &Test, expected: TestStatus) -> Result<bool>;

    /// Replace the results snapshot of a test.
    fn save_results(&self, test_id: &str, results: &TestResults) -> Result<()>;

    fn insert_participation(&self, participation: Participation) -> Result<InsertOutcome>;

    fn get_participation(&self, key: &ParticipationKey) -> Result<Option<Participation>>;

    fn list_participations(&self, test_id: &str) -> Result<Vec<Participation>>;

    fn count_participations(&self, test_id: &str) -> Result<u64>;

    fn mark_converted(
        &self,
        key: &ParticipationKey,
        conversion_type: ConversionType,
        conversion_value: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome>;
}
