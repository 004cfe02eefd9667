#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use incident_atlas_core::{
    format_rfc3339, now_utc, parse_rfc3339, AtlasError, AuditAction, AuditLogEntry, FieldFilter,
    FieldOp, Geometry, Record, RecordId, RecordInput, RecordPredicate, RecordSource, RecordTypeId,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const ATLAS_MIGRATION_VERSION: i64 = 1;

// Occurred instants are epoch microseconds so range predicates compare
// numerically; created/modified are display-only RFC3339 text.
const SCHEMA_ATLAS_V1: &str = r"
CREATE TABLE IF NOT EXISTS records (
  record_id TEXT PRIMARY KEY,
  record_type TEXT NOT NULL,
  schema_version INTEGER NOT NULL CHECK (schema_version >= 1),
  occurred_from INTEGER NOT NULL,
  occurred_to INTEGER NOT NULL CHECK (occurred_from <= occurred_to),
  geom_wkt TEXT NOT NULL,
  location_text TEXT NOT NULL,
  data_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_type_occurred
  ON records(record_type, occurred_from);

CREATE TABLE IF NOT EXISTS audit_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  actor_id TEXT NOT NULL,
  username TEXT NOT NULL,
  record_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('create', 'update', 'delete')),
  occurred_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_occurred
  ON audit_log(occurred_at, entry_seq);
CREATE INDEX IF NOT EXISTS idx_audit_log_username
  ON audit_log(username, occurred_at);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;
";

const RECORD_COLUMNS: &str = "record_id, record_type, schema_version, occurred_from, occurred_to, \
                              geom_wkt, location_text, data_json, created_at, modified_at";

pub struct SqliteAtlasStore {
    conn: Connection,
}

impl SqliteAtlasStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ATLAS_V1)
            .context("failed to apply atlas schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ATLAS_MIGRATION_VERSION, now],
            )
            .context("failed to register atlas schema migration")?;

        Ok(())
    }

    pub fn create_record(&mut self, input: &RecordInput) -> Result<Record> {
        input.validate()?;

        let record_id = RecordId::new();
        let now = now_utc();
        let now_text = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start create transaction")?;
        tx.execute(
            "INSERT INTO records(
                record_id, record_type, schema_version, occurred_from, occurred_to,
                geom_wkt, location_text, data_json, created_at, modified_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record_id.to_string(),
                input.record_type.to_string(),
                i64::from(input.schema_version),
                to_micros(input.occurred_from)?,
                to_micros(input.occurred_to)?,
                input.geom.to_wkt(),
                input.location_text,
                serde_json::to_string(&input.data).context("failed to serialize data payload")?,
                now_text,
                now_text,
            ],
        )
        .context("failed to insert record")?;
        tx.commit().context("failed to commit create transaction")?;

        Ok(Record {
            record_id,
            record_type: input.record_type,
            schema_version: input.schema_version,
            occurred_from: input.occurred_from,
            occurred_to: input.occurred_to,
            geom: input.geom.clone(),
            location_text: input.location_text.clone(),
            data: input.data.clone(),
            created_at: now,
            modified_at: now,
        })
    }

    pub fn update_record(&mut self, record_id: RecordId, input: &RecordInput) -> Result<Record> {
        input.validate()?;

        let existing = self
            .get_record(record_id)?
            .ok_or_else(|| AtlasError::NotFound(format!("record {record_id} does not exist")))?;

        let now = now_utc();
        let now_text = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;
        tx.execute(
            "UPDATE records SET
                record_type = ?2, schema_version = ?3, occurred_from = ?4, occurred_to = ?5,
                geom_wkt = ?6, location_text = ?7, data_json = ?8, modified_at = ?9
             WHERE record_id = ?1",
            params![
                record_id.to_string(),
                input.record_type.to_string(),
                i64::from(input.schema_version),
                to_micros(input.occurred_from)?,
                to_micros(input.occurred_to)?,
                input.geom.to_wkt(),
                input.location_text,
                serde_json::to_string(&input.data).context("failed to serialize data payload")?,
                now_text,
            ],
        )
        .context("failed to update record")?;
        tx.commit().context("failed to commit update transaction")?;

        Ok(Record {
            record_id,
            record_type: input.record_type,
            schema_version: input.schema_version,
            occurred_from: input.occurred_from,
            occurred_to: input.occurred_to,
            geom: input.geom.clone(),
            location_text: input.location_text.clone(),
            data: input.data.clone(),
            created_at: existing.created_at,
            modified_at: now,
        })
    }

    pub fn delete_record(&mut self, record_id: RecordId) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM records WHERE record_id = ?1",
                params![record_id.to_string()],
            )
            .context("failed to delete record")?;

        if affected == 0 {
            return Err(AtlasError::NotFound(format!("record {record_id} does not exist")).into());
        }
        Ok(())
    }

    pub fn get_record(&self, record_id: RecordId) -> Result<Option<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"
        ))?;
        stmt.query_row(params![record_id.to_string()], parse_record_row)
            .optional()
            .context("failed to load record")
    }

    pub fn query_records(&self, predicate: &RecordPredicate) -> Result<Vec<Record>> {
        let (where_sql, args) = predicate_where(predicate)?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records{where_sql} \
             ORDER BY occurred_from ASC, record_id ASC"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(SqlArg::to_value)),
            parse_record_row,
        )?;
        collect_rows(rows)
    }

    /// Appends one audit entry for a mutation that already succeeded. The
    /// username is snapshotted into the row; later account changes never
    /// rewrite history.
    pub fn append_audit(
        &mut self,
        actor_id: Ulid,
        username: &str,
        record_id: RecordId,
        action: AuditAction,
    ) -> Result<AuditLogEntry> {
        let entry_id = Ulid::new();
        let occurred_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start audit transaction")?;
        tx.execute(
            "INSERT INTO audit_log(entry_id, actor_id, username, record_id, action, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry_id.to_string(),
                actor_id.to_string(),
                username,
                record_id.to_string(),
                action.as_str(),
                to_micros(occurred_at)?,
            ],
        )
        .context("failed to append audit entry")?;
        let entry_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit audit transaction")?;

        Ok(AuditLogEntry {
            entry_seq,
            entry_id,
            actor_id,
            username: username.to_string(),
            record_id,
            action,
            occurred_at,
        })
    }

    /// Bounded audit read; validation of the bounds is the caller's
    /// responsibility (see `AuditLogQuery::validate`).
    pub fn query_audit_log(
        &self,
        min_date: OffsetDateTime,
        max_date: OffsetDateTime,
        action: Option<AuditAction>,
        username: Option<&str>,
    ) -> Result<Vec<AuditLogEntry>> {
        let mut sql = "SELECT entry_seq, entry_id, actor_id, username, record_id, action, \
                       occurred_at FROM audit_log \
                       WHERE occurred_at >= ? AND occurred_at <= ?"
            .to_string();
        let mut args: Vec<SqlValue> =
            vec![SqlValue::from(to_micros(min_date)?), SqlValue::from(to_micros(max_date)?)];

        if let Some(action) = action {
            sql.push_str(" AND action = ?");
            args.push(SqlValue::from(action.as_str().to_string()));
        }
        if let Some(username) = username {
            sql.push_str(" AND username = ?");
            args.push(SqlValue::from(username.to_string()));
        }
        sql.push_str(" ORDER BY entry_seq ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), parse_audit_row)?;
        collect_rows(rows)
    }

    pub fn count_audit_entries(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .context("failed to count audit entries")
    }
}

impl RecordSource for SqliteAtlasStore {
    fn query_records(&self, predicate: &RecordPredicate) -> Result<Vec<Record>> {
        Self::query_records(self, predicate)
    }
}

/// Renders the predicate as standalone SQL text with inlined literals,
/// the form the tile renderer replays verbatim from the cache.
pub fn render_tile_sql(predicate: &RecordPredicate) -> Result<String> {
    let (where_sql, args) = predicate_where(predicate)?;
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records{where_sql} \
         ORDER BY occurred_from ASC, record_id ASC"
    );

    let pieces: Vec<&str> = sql.split('?').collect();
    if pieces.len() != args.len() + 1 {
        return Err(anyhow!("placeholder count does not match argument count"));
    }

    let mut rendered = String::with_capacity(sql.len());
    for (index, piece) in pieces.iter().enumerate() {
        rendered.push_str(piece);
        if index < args.len() {
            rendered.push_str(&args[index].to_literal());
        }
    }
    Ok(rendered)
}

#[derive(Debug, Clone, PartialEq)]
enum SqlArg {
    Text(String),
    Int(i64),
    Real(f64),
}

impl SqlArg {
    fn to_value(&self) -> SqlValue {
        match self {
            Self::Text(value) => SqlValue::from(value.clone()),
            Self::Int(value) => SqlValue::from(*value),
            Self::Real(value) => SqlValue::from(*value),
        }
    }

    fn to_literal(&self) -> String {
        match self {
            Self::Text(value) => format!("'{}'", value.replace('\'', "''")),
            Self::Int(value) => value.to_string(),
            Self::Real(value) => value.to_string(),
        }
    }
}

fn predicate_where(predicate: &RecordPredicate) -> Result<(String, Vec<SqlArg>)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<SqlArg> = Vec::new();

    if let Some(record_type) = predicate.record_type {
        clauses.push("record_type = ?".to_string());
        args.push(SqlArg::Text(record_type.to_string()));
    }
    if let Some(min) = predicate.occurred_min {
        clauses.push("occurred_from >= ?".to_string());
        args.push(SqlArg::Int(to_micros(min)?));
    }
    if let Some(max) = predicate.occurred_max {
        clauses.push("occurred_from <= ?".to_string());
        args.push(SqlArg::Int(to_micros(max)?));
    }

    for filter in &predicate.field_filters {
        field_filter_clause(filter, &mut clauses, &mut args)?;
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((where_sql, args))
}

fn field_filter_clause(
    filter: &FieldFilter,
    clauses: &mut Vec<String>,
    args: &mut Vec<SqlArg>,
) -> Result<()> {
    let path = json_path(&filter.path)?;

    match &filter.op {
        FieldOp::Eq(value) => {
            let (arg, type_guard) = scalar_arg(&filter.path, value)?;
            clauses.push(format!(
                "(json_type(data_json, ?) IN ({type_guard}) AND json_extract(data_json, ?) = ?)"
            ));
            args.push(SqlArg::Text(path.clone()));
            args.push(SqlArg::Text(path));
            args.push(arg);
        }
        FieldOp::Contains(values) => {
            if values.is_empty() {
                return Err(AtlasError::Validation(format!(
                    "filters.{} containment rule MUST NOT be empty",
                    filter.path.join("#")
                ))
                .into());
            }
            for value in values {
                let (arg, type_guard) = scalar_arg(&filter.path, value)?;
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM json_each(data_json, ?) \
                     WHERE json_each.type IN ({type_guard}) AND json_each.value = ?)"
                ));
                args.push(SqlArg::Text(path.clone()));
                args.push(arg);
            }
        }
        FieldOp::IntRange { min, max } => {
            let mut parts = vec!["json_type(data_json, ?) = 'integer'".to_string()];
            let mut range_args = vec![SqlArg::Text(path.clone())];
            if let Some(min) = min {
                parts.push("json_extract(data_json, ?) >= ?".to_string());
                range_args.push(SqlArg::Text(path.clone()));
                range_args.push(SqlArg::Int(*min));
            }
            if let Some(max) = max {
                parts.push("json_extract(data_json, ?) <= ?".to_string());
                range_args.push(SqlArg::Text(path.clone()));
                range_args.push(SqlArg::Int(*max));
            }
            clauses.push(format!("({})", parts.join(" AND ")));
            args.extend(range_args);
        }
    }
    Ok(())
}

fn scalar_arg(path: &[String], value: &Value) -> Result<(SqlArg, &'static str)> {
    if let Some(text) = value.as_str() {
        return Ok((SqlArg::Text(text.to_string()), "'text'"));
    }
    if let Some(number) = value.as_i64() {
        return Ok((SqlArg::Int(number), "'integer'"));
    }
    if let Some(number) = value.as_f64() {
        return Ok((SqlArg::Real(number), "'real'"));
    }
    if let Some(flag) = value.as_bool() {
        return Ok((SqlArg::Int(i64::from(flag)), "'true', 'false'"));
    }
    Err(AtlasError::Validation(format!(
        "filters.{} value MUST be a scalar (string, number, or boolean)",
        path.join("#")
    ))
    .into())
}

fn json_path(path: &[String]) -> Result<String> {
    let mut rendered = String::from("$");
    for segment in path {
        if segment.contains('"') {
            return Err(AtlasError::Validation(
                "filters path segments MUST NOT contain double quotes".to_string(),
            )
            .into());
        }
        rendered.push_str(&format!(".\"{segment}\""));
    }
    Ok(rendered)
}

fn to_micros(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000)
        .map_err(|_| anyhow!("timestamp out of range for storage"))
}

fn from_micros(value: i64) -> Result<OffsetDateTime, rusqlite::Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000)
        .map_err(|err| conversion_failure(0, format!("invalid stored timestamp: {err}")))
}

fn conversion_failure(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid(index: usize, raw: &str) -> Result<Ulid, rusqlite::Error> {
    Ulid::from_string(raw)
        .map_err(|err| conversion_failure(index, format!("invalid stored identifier: {err}")))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let record_id_raw: String = row.get(0)?;
    let record_type_raw: String = row.get(1)?;
    let schema_version_i64: i64 = row.get(2)?;
    let occurred_from_us: i64 = row.get(3)?;
    let occurred_to_us: i64 = row.get(4)?;
    let geom_wkt: String = row.get(5)?;
    let location_text: String = row.get(6)?;
    let data_raw: String = row.get(7)?;
    let created_at_raw: String = row.get(8)?;
    let modified_at_raw: String = row.get(9)?;

    let schema_version = u32::try_from(schema_version_i64)
        .map_err(|_| conversion_failure(2, format!("invalid schema_version: {schema_version_i64}")))?;
    let geom = Geometry::parse_wkt(&geom_wkt)
        .map_err(|err| conversion_failure(5, format!("invalid stored geometry: {err}")))?;
    let data: Value = serde_json::from_str(&data_raw)
        .map_err(|err| conversion_failure(7, format!("invalid stored data payload: {err}")))?;
    let created_at = parse_rfc3339(&created_at_raw)
        .map_err(|err| conversion_failure(8, format!("invalid created_at: {err}")))?;
    let modified_at = parse_rfc3339(&modified_at_raw)
        .map_err(|err| conversion_failure(9, format!("invalid modified_at: {err}")))?;

    Ok(Record {
        record_id: RecordId(parse_ulid(0, &record_id_raw)?),
        record_type: RecordTypeId(parse_ulid(1, &record_type_raw)?),
        schema_version,
        occurred_from: from_micros(occurred_from_us)?,
        occurred_to: from_micros(occurred_to_us)?,
        geom,
        location_text,
        data,
        created_at,
        modified_at,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let entry_seq: i64 = row.get(0)?;
    let entry_id_raw: String = row.get(1)?;
    let actor_id_raw: String = row.get(2)?;
    let username: String = row.get(3)?;
    let record_id_raw: String = row.get(4)?;
    let action_raw: String = row.get(5)?;
    let occurred_at_us: i64 = row.get(6)?;

    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| conversion_failure(5, format!("invalid stored action: {action_raw}")))?;

    Ok(AuditLogEntry {
        entry_seq,
        entry_id: parse_ulid(1, &entry_id_raw)?,
        actor_id: parse_ulid(2, &actor_id_raw)?,
        username,
        record_id: RecordId(parse_ulid(4, &record_id_raw)?),
        action,
        occurred_at: from_micros(occurred_at_us)?,
    })
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed to read row")?);
    }
    Ok(items)
}
