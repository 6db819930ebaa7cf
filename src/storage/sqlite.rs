//! SQLite storage backend.
//!
//! Test definitions are stored as a JSON document next to the columns the
//! engine mutates (status, dates, results), so lifecycle writes and results
//! writes touch disjoint columns. The participation key is enforced by a
//! `UNIQUE` index; a missing application id is stored as `''` because SQLite
//! treats `NULL`s as distinct in unique indexes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{InsertOutcome, Storage};
use crate::error::{AbTestError, Result};
use crate::model::{
    ConversionOutcome, ConversionType, ParticipantContext, Participation, ParticipationKey, Test,
    TestResults, TestStatus,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ab_tests (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    test_type   TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    start_date  TEXT,
    end_date    TEXT,
    definition  TEXT NOT NULL,
    results     TEXT
);
CREATE INDEX IF NOT EXISTS idx_ab_tests_owner  ON ab_tests(owner);
CREATE INDEX IF NOT EXISTS idx_ab_tests_status ON ab_tests(status);

CREATE TABLE IF NOT EXISTS ab_test_participations (
    test_id          TEXT NOT NULL,
    participant_id   TEXT NOT NULL,
    application_id   TEXT NOT NULL DEFAULT '',
    variant_id       TEXT NOT NULL,
    variant_name     TEXT NOT NULL,
    assigned_at      TEXT NOT NULL,
    exposed_at       TEXT NOT NULL,
    converted        INTEGER NOT NULL DEFAULT 0,
    converted_at     TEXT,
    conversion_type  TEXT,
    conversion_value REAL,
    context          TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS unique_test_participant_application
    ON ab_test_participations(test_id, participant_id, application_id);
";

const PARTICIPATION_COLUMNS: &str = "test_id, participant_id, application_id, variant_id, \
     variant_name, assigned_at, exposed_at, converted, converted_at, conversion_type, \
     conversion_value, context";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AbTestError::Storage("sqlite connection lock poisoned".into()))
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AbTestError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn app_key(application_id: &Option<String>) -> &str {
    application_id.as_deref().unwrap_or("")
}

/// A test row as read from SQLite, before decoding.
struct TestRow {
    status: String,
    start_date: Option<String>,
    end_date: Option<String>,
    definition: String,
    results: Option<String>,
}

impl TestRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            status: row.get(0)?,
            start_date: row.get(1)?,
            end_date: row.get(2)?,
            definition: row.get(3)?,
            results: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Test> {
        let mut test: Test = serde_json::from_str(&self.definition)?;
        test.status = self.status.parse().map_err(AbTestError::Storage)?;
        test.start_date = parse_opt_ts(self.start_date)?;
        test.end_date = parse_opt_ts(self.end_date)?;
        test.results = self.results.as_deref().map(serde_json::from_str).transpose()?;
        Ok(test)
    }
}

/// A participation row as read from SQLite, before decoding.
struct ParticipationRow {
    test_id: String,
    participant_id: String,
    application_id: String,
    variant_id: String,
    variant_name: String,
    assigned_at: String,
    exposed_at: String,
    converted: bool,
    converted_at: Option<String>,
    conversion_type: Option<String>,
    conversion_value: Option<f64>,
    context: Option<String>,
}

impl ParticipationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            test_id: row.get(0)?,
            participant_id: row.get(1)?,
            application_id: row.get(2)?,
            variant_id: row.get(3)?,
            variant_name: row.get(4)?,
            assigned_at: row.get(5)?,
            exposed_at: row.get(6)?,
            converted: row.get(7)?,
            converted_at: row.get(8)?,
            conversion_type: row.get(9)?,
            conversion_value: row.get(10)?,
            context: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Participation> {
        let conversion_type = self
            .conversion_type
            .as_deref()
            .map(str::parse::<ConversionType>)
            .transpose()
            .map_err(AbTestError::Storage)?;
        let context: Option<ParticipantContext> =
            self.context.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Participation {
            test_id: self.test_id,
            participant_id: self.participant_id,
            application_id: Some(self.application_id).filter(|a| !a.is_empty()),
            variant_id: self.variant_id,
            variant_name: self.variant_name,
            assigned_at: parse_ts(&self.assigned_at)?,
            exposed_at: parse_ts(&self.exposed_at)?,
            converted: self.converted,
            converted_at: parse_opt_ts(self.converted_at)?,
            conversion_type,
            conversion_value: self.conversion_value,
            context,
        })
    }
}

fn select_participation(conn: &Connection, key: &ParticipationKey) -> Result<Option<Participation>> {
    let sql = format!(
        "SELECT {PARTICIPATION_COLUMNS} FROM ab_test_participations \
         WHERE test_id = ?1 AND participant_id = ?2 AND application_id = ?3"
    );
    let row = conn
        .query_row(
            &sql,
            params![key.test_id, key.participant_id, app_key(&key.application_id)],
            ParticipationRow::from_row,
        )
        .optional()?;
    row.map(ParticipationRow::decode).transpose()
}

// ---------------------------------------------------------------------------
// Storage impl
// ---------------------------------------------------------------------------

impl Storage for SqliteStorage {
    fn insert_test(&self, test: &Test) -> Result<()> {
        let mut definition = test.clone();
        definition.results = None;
        let definition = serde_json::to_string(&definition)?;
        let results = test.results.as_ref().map(serde_json::to_string).transpose()?;
        self.conn()?.execute(
            "INSERT INTO ab_tests (id, owner, test_type, status, created_at, start_date, end_date, definition, results)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                test.id,
                test.owner,
                test.test_type.as_str(),
                test.status.as_str(),
                ts(&test.created_at),
                test.start_date.as_ref().map(ts),
                test.end_date.as_ref().map(ts),
                definition,
                results,
            ],
        )?;
        Ok(())
    }

    fn get_test(&self, test_id: &str) -> Result<Option<Test>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT status, start_date, end_date, definition, results FROM ab_tests WHERE id = ?1",
                params![test_id],
                TestRow::from_row,
            )
            .optional()?;
        row.map(TestRow::decode).transpose()
    }

    fn list_tests(&self) -> Result<Vec<Test>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, start_date, end_date, definition, results FROM ab_tests
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map([], TestRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TestRow::decode).collect()
    }

    fn save_lifecycle(&self, test: &Test, expected: TestStatus) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE ab_tests SET status = ?2, start_date = ?3, end_date = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                test.id,
                test.status.as_str(),
                test.start_date.as_ref().map(ts),
                test.end_date.as_ref().map(ts),
                expected.as_str(),
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        let exists = conn
            .query_row("SELECT 1 FROM ab_tests WHERE id = ?1", params![test.id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(AbTestError::TestNotFound(test.id.clone()));
        }
        Ok(false)
    }

    fn save_results(&self, test_id: &str, results: &TestResults) -> Result<()> {
        let json = serde_json::to_string(results)?;
        let changed = self.conn()?.execute(
            "UPDATE ab_tests SET results = ?2 WHERE id = ?1",
            params![test_id, json],
        )?;
        if changed == 0 {
            return Err(AbTestError::TestNotFound(test_id.to_string()));
        }
        Ok(())
    }

    fn insert_participation(&self, mut p: Participation) -> Result<InsertOutcome> {
        p.application_id = p.key().application_id;
        let context = p.context.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn()?;
        let sql = format!(
            "INSERT INTO ab_test_participations ({PARTICIPATION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(test_id, participant_id, application_id) DO NOTHING"
        );
        let inserted = conn.execute(
            &sql,
            params![
                p.test_id,
                p.participant_id,
                app_key(&p.application_id),
                p.variant_id,
                p.variant_name,
                ts(&p.assigned_at),
                ts(&p.exposed_at),
                p.converted,
                p.converted_at.as_ref().map(ts),
                p.conversion_type.map(|c| c.as_str()),
                p.conversion_value,
                context,
            ],
        )?;
        if inserted == 1 {
            return Ok(InsertOutcome::Inserted(p));
        }
        select_participation(&conn, &p.key())?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| AbTestError::Storage("participation vanished after conflict".into()))
    }

    fn get_participation(&self, key: &ParticipationKey) -> Result<Option<Participation>> {
        let conn = self.conn()?;
        select_participation(&conn, key)
    }

    fn list_participations(&self, test_id: &str) -> Result<Vec<Participation>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {PARTICIPATION_COLUMNS} FROM ab_test_participations
             WHERE test_id = ?1 ORDER BY rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![test_id], ParticipationRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ParticipationRow::decode).collect()
    }

    fn count_participations(&self, test_id: &str) -> Result<u64> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM ab_test_participations WHERE test_id = ?1",
            params![test_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn mark_converted(
        &self,
        key: &ParticipationKey,
        conversion_type: ConversionType,
        conversion_value: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE ab_test_participations
             SET converted = 1, conversion_type = ?4, conversion_value = ?5, converted_at = ?6
             WHERE test_id = ?1 AND participant_id = ?2 AND application_id = ?3 AND converted = 0",
            params![
                key.test_id,
                key.participant_id,
                app_key(&key.application_id),
                conversion_type.as_str(),
                conversion_value,
                ts(&at),
            ],
        )?;
        if changed == 1 {
            return Ok(ConversionOutcome::Converted);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ab_test_participations
                 WHERE test_id = ?1 AND participant_id = ?2 AND application_id = ?3",
                params![key.test_id, key.participant_id, app_key(&key.application_id)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(if exists.is_some() {
            ConversionOutcome::AlreadyConverted
        } else {
            ConversionOutcome::NotFound
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn participation(user: &str, app: Option<&str>) -> Participation {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Participation {
            test_id: "t1".into(),
            participant_id: user.into(),
            application_id: app.map(String::from),
            variant_id: "variant_1".into(),
            variant_name: "A".into(),
            assigned_at: t,
            exposed_at: t,
            converted_at: None,
            converted: false,
            conversion_type: None,
            conversion_value: None,
            context: Some(ParticipantContext {
                industry: Some("tech".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_null_application_id_is_unique() {
        let s = SqliteStorage::open_in_memory().unwrap();
        assert!(s.insert_participation(participation("u1", None)).unwrap().was_inserted());
        let mut again = participation("u1", None);
        again.variant_id = "variant_2".into();
        let out = s.insert_participation(again).unwrap();
        assert!(!out.was_inserted());
        assert_eq!(out.into_participation().variant_id, "variant_1");
        assert_eq!(s.count_participations("t1").unwrap(), 1);
    }

    #[test]
    fn test_participation_round_trips_through_columns() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let p = participation("u1", Some("app-9"));
        s.insert_participation(p.clone()).unwrap();
        let got = s.get_participation(&p.key()).unwrap().unwrap();
        assert_eq!(got, p);
    }

    #[test]
    fn test_missing_application_id_reads_back_as_none() {
        let s = SqliteStorage::open_in_memory().unwrap();
        s.insert_participation(participation("u1", None)).unwrap();
        let got = s.list_participations("t1").unwrap();
        assert_eq!(got[0].application_id, None);
    }

    #[test]
    fn test_mark_converted_compare_and_set() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let p = participation("u1", None);
        s.insert_participation(p.clone()).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        assert_eq!(
            s.mark_converted(&p.key(), ConversionType::Interview, Some(2.5), at).unwrap(),
            ConversionOutcome::Converted
        );
        assert_eq!(
            s.mark_converted(&p.key(), ConversionType::Offer, None, Utc::now()).unwrap(),
            ConversionOutcome::AlreadyConverted
        );
        let got = s.get_participation(&p.key()).unwrap().unwrap();
        assert!(got.converted);
        assert_eq!(got.converted_at, Some(at));
        assert_eq!(got.conversion_type, Some(ConversionType::Interview));
        assert_eq!(got.conversion_value, Some(2.5));

        let ghost = ParticipationKey::new("t1", "ghost", None);
        assert_eq!(
            s.mark_converted(&ghost, ConversionType::Open, None, at).unwrap(),
            ConversionOutcome::NotFound
        );
    }
}
