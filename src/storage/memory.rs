//! In-process storage backend.
//!
//! Tests live behind an `RwLock`; the ledger lives behind a single `Mutex` so
//! the uniqueness check and the insert happen under one guard.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use super::{InsertOutcome, Storage};
use crate::error::{AbTestError, Result};
use crate::model::{
    ConversionOutcome, ConversionType, Participation, ParticipationKey, Test, TestResults,
    TestStatus,
};

#[derive(Debug, Default)]
struct Ledger {
    /// Insertion order.
    rows: Vec<Participation>,
    index: HashMap<ParticipationKey, usize>,
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tests: RwLock<Vec<Test>>,
    ledger: Mutex<Ledger>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned<T>(_: T) -> AbTestError {
        AbTestError::Storage("in-memory store lock poisoned".into())
    }
}

impl Storage for InMemoryStorage {
    fn insert_test(&self, test: &Test) -> Result<()> {
        let mut tests = self.tests.write().map_err(Self::poisoned)?;
        if tests.iter().any(|t| t.id == test.id) {
            return Err(AbTestError::Storage(format!("test {} already exists", test.id)));
        }
        tests.push(test.clone());
        Ok(())
    }

    fn get_test(&self, test_id: &str) -> Result<Option<Test>> {
        let tests = self.tests.read().map_err(Self::poisoned)?;
        Ok(tests.iter().find(|t| t.id == test_id).cloned())
    }

    fn list_tests(&self) -> Result<Vec<Test>> {
        Ok(self.tests.read().map_err(Self::poisoned)?.clone())
    }

    fn save_lifecycle(&self, test: &Test, expected: TestStatus) -> Result<bool> {
        let mut tests = self.tests.write().map_err(Self::poisoned)?;
        let stored = tests
            .iter_mut()
            .find(|t| t.id == test.id)
            .ok_or_else(|| AbTestError::TestNotFound(test.id.clone()))?;
        if stored.status != expected {
            return Ok(false);
        }
        stored.status = test.status;
        stored.start_date = test.start_date;
        stored.end_date = test.end_date;
        Ok(true)
    }

    fn save_results(&self, test_id: &str, results: &TestResults) -> Result<()> {
        let mut tests = self.tests.write().map_err(Self::poisoned)?;
        let stored = tests
            .iter_mut()
            .find(|t| t.id == test_id)
            .ok_or_else(|| AbTestError::TestNotFound(test_id.to_string()))?;
        stored.results = Some(results.clone());
        Ok(())
    }

    fn insert_participation(&self, mut participation: Participation) -> Result<InsertOutcome> {
        let mut ledger = self.ledger.lock().map_err(Self::poisoned)?;
        let key = participation.key();
        participation.application_id = key.application_id.clone();
        if let Some(&i) = ledger.index.get(&key) {
            return Ok(InsertOutcome::Existing(ledger.rows[i].clone()));
        }
        let i = ledger.rows.len();
        ledger.rows.push(participation.clone());
        ledger.index.insert(key, i);
        Ok(InsertOutcome::Inserted(participation))
    }

    fn get_participation(&self, key: &ParticipationKey) -> Result<Option<Participation>> {
        let ledger = self.ledger.lock().map_err(Self::poisoned)?;
        Ok(ledger.index.get(key).map(|&i| ledger.rows[i].clone()))
    }

    fn list_participations(&self, test_id: &str) -> Result<Vec<Participation>> {
        let ledger = self.ledger.lock().map_err(Self::poisoned)?;
        Ok(ledger.rows.iter().filter(|p| p.test_id == test_id).cloned().collect())
    }

    fn count_participations(&self, test_id: &str) -> Result<u64> {
        let ledger = self.ledger.lock().map_err(Self::poisoned)?;
        Ok(ledger.rows.iter().filter(|p| p.test_id == test_id).count() as u64)
    }

    fn mark_converted(
        &self,
        key: &ParticipationKey,
        conversion_type: ConversionType,
        conversion_value: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome> {
        let mut ledger = self.ledger.lock().map_err(Self::poisoned)?;
        let Some(&i) = ledger.index.get(key) else {
            return Ok(ConversionOutcome::NotFound);
        };
        let row = &mut ledger.rows[i];
        if row.converted {
            return Ok(ConversionOutcome::AlreadyConverted);
        }
        row.converted = true;
        row.conversion_type = Some(conversion_type);
        row.conversion_value = conversion_value;
        row.converted_at = Some(at);
        Ok(ConversionOutcome::Converted)
    }
}
