use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AtlasError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordTypeId(pub Ulid);

impl Display for RecordTypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Admin,
    RecordWrite,
    RecordRead,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::RecordWrite => "record_write",
            Self::RecordRead => "record_read",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "record_write" => Some(Self::RecordWrite),
            "record_read" => Some(Self::RecordRead),
            _ => None,
        }
    }
}

/// Parses a comma-separated capability list; unknown names are dropped.
#[must_use]
pub fn parse_capabilities(raw: &str) -> Vec<Capability> {
    raw.split(',')
        .filter_map(|item| Capability::parse(item.trim()))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerContext {
    pub actor_id: Ulid,
    pub username: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Full,
    ReadOnlyDetails,
}

/// Selects the response detail level for a caller. Evaluated per request;
/// list and detail paths go through this same function.
#[must_use]
pub fn select_view(capabilities: &[Capability]) -> ViewKind {
    if capabilities.contains(&Capability::Admin) {
        ViewKind::Full
    } else {
        ViewKind::ReadOnlyDetails
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { lon: f64, lat: f64 },
    Polygon(Vec<(f64, f64)>),
}

impl Geometry {
    #[must_use]
    pub fn to_wkt(&self) -> String {
        match self {
            Self::Point { lon, lat } => format!("POINT ({lon} {lat})"),
            Self::Polygon(ring) => {
                let pairs: Vec<String> = ring
                    .iter()
                    .map(|(lon, lat)| format!("{lon} {lat}"))
                    .collect();
                format!("POLYGON (({}))", pairs.join(", "))
            }
        }
    }

    /// Parses `POINT (x y)` and single-ring `POLYGON ((x y, ...))` WKT, the
    /// two shapes the record store accepts.
    ///
    /// # Errors
    /// Returns [`AtlasError::Validation`] for any other geometry text.
    pub fn parse_wkt(value: &str) -> Result<Self, AtlasError> {
        let trimmed = value.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("POINT") {
            let body = strip_parens(rest.trim(), 1)?;
            let (lon, lat) = parse_coordinate_pair(body)?;
            return Ok(Self::Point { lon, lat });
        }

        if let Some(rest) = upper.strip_prefix("POLYGON") {
            let body = strip_parens(rest.trim(), 2)?;
            let mut ring = Vec::new();
            for pair in body.split(',') {
                ring.push(parse_coordinate_pair(pair)?);
            }
            if ring.len() < 4 {
                return Err(AtlasError::Validation(
                    "geom polygon ring MUST have at least 4 points".to_string(),
                ));
            }
            if ring.first() != ring.last() {
                return Err(AtlasError::Validation(
                    "geom polygon ring MUST be closed".to_string(),
                ));
            }
            return Ok(Self::Polygon(ring));
        }

        Err(AtlasError::Validation(format!(
            "geom MUST be POINT or POLYGON WKT, got: {trimmed}"
        )))
    }
}

impl Serialize for Geometry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_wkt())
    }
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse_wkt(&raw).map_err(serde::de::Error::custom)
    }
}

fn strip_parens(value: &str, depth: usize) -> Result<&str, AtlasError> {
    let mut body = value.trim();
    for _ in 0..depth {
        body = body
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .ok_or_else(|| {
                AtlasError::Validation(format!("geom WKT is missing parentheses: {value}"))
            })?
            .trim();
    }
    Ok(body)
}

fn parse_coordinate_pair(value: &str) -> Result<(f64, f64), AtlasError> {
    let mut parts = value.split_whitespace();
    let lon = parts
        .next()
        .and_then(|raw| raw.parse::<f64>().ok())
        .ok_or_else(|| AtlasError::Validation(format!("geom coordinate is not numeric: {value}")))?;
    let lat = parts
        .next()
        .and_then(|raw| raw.parse::<f64>().ok())
        .ok_or_else(|| AtlasError::Validation(format!("geom coordinate is not numeric: {value}")))?;
    if parts.next().is_some() {
        return Err(AtlasError::Validation(format!(
            "geom coordinate MUST be a lon/lat pair: {value}"
        )));
    }
    Ok((lon, lat))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub record_id: RecordId,
    pub record_type: RecordTypeId,
    pub schema_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_to: OffsetDateTime,
    pub geom: Geometry,
    pub location_text: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordInput {
    pub record_type: RecordTypeId,
    pub schema_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_to: OffsetDateTime,
    pub geom: Geometry,
    pub location_text: String,
    pub data: Value,
}

impl RecordInput {
    /// Validates a record submission before it reaches the store.
    ///
    /// # Errors
    /// Returns [`AtlasError::Validation`] when a field violates its
    /// constraint; the message names the offending field.
    pub fn validate(&self) -> Result<(), AtlasError> {
        if self.schema_version == 0 {
            return Err(AtlasError::Validation(
                "schema_version MUST be >= 1".to_string(),
            ));
        }

        if self.occurred_from > self.occurred_to {
            return Err(AtlasError::Validation(
                "occurred_from MUST be <= occurred_to".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub actor_id: Ulid,
    pub username: String,
    pub record_id: RecordId,
    pub action: AuditAction,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    Eq(Value),
    Contains(Vec<Value>),
    IntRange { min: Option<i64>, max: Option<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldFilter {
    pub path: Vec<String>,
    pub op: FieldOp,
}

/// Immutable description of a record selection: type, inclusive time
/// bounds on `occurred_from`, and payload field filters. Built once from
/// request parameters and shared by the listing, aggregation, and tile
/// cache paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordPredicate {
    pub record_type: Option<RecordTypeId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_min: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_max: Option<OffsetDateTime>,
    pub field_filters: Vec<FieldFilter>,
}

impl RecordPredicate {
    /// Builds a predicate from the raw query-string map. Recognized keys
    /// are `record_type`, `occurred_min`, `occurred_max`, and `filters`
    /// (flattened `#`-path rules over the payload); everything else is
    /// ignored. Whether min/max ordering or presence is required is the
    /// calling endpoint's decision, not the builder's.
    ///
    /// # Errors
    /// Returns [`AtlasError::Validation`] naming the parameter when a
    /// recognized key holds a malformed value.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, AtlasError> {
        let record_type = match params.get("record_type") {
            Some(raw) => Some(RecordTypeId(Ulid::from_string(raw).map_err(|err| {
                AtlasError::Validation(format!("record_type is not a valid identifier: {err}"))
            })?)),
            None => None,
        };

        let occurred_min = match params.get("occurred_min") {
            Some(raw) => Some(parse_rfc3339_param("occurred_min", raw)?),
            None => None,
        };
        let occurred_max = match params.get("occurred_max") {
            Some(raw) => Some(parse_rfc3339_param("occurred_max", raw)?),
            None => None,
        };

        let field_filters = match params.get("filters") {
            Some(raw) => parse_field_filters(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            record_type,
            occurred_min,
            occurred_max,
            field_filters,
        })
    }

    /// In-memory evaluation; agrees with the store's SQL translation.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(record_type) = self.record_type {
            if record.record_type != record_type {
                return false;
            }
        }

        if let Some(min) = self.occurred_min {
            if record.occurred_from < min {
                return false;
            }
        }

        if let Some(max) = self.occurred_max {
            if record.occurred_from > max {
                return false;
            }
        }

        self.field_filters
            .iter()
            .all(|filter| field_filter_matches(filter, &record.data))
    }
}

fn field_filter_matches(filter: &FieldFilter, data: &Value) -> bool {
    let Some(actual) = lookup_path(data, &filter.path) else {
        return false;
    };

    match &filter.op {
        FieldOp::Eq(expected) => actual == expected,
        FieldOp::Contains(values) => actual
            .as_array()
            .is_some_and(|items| values.iter().all(|value| items.contains(value))),
        FieldOp::IntRange { min, max } => {
            let Some(number) = actual.as_i64() else {
                return false;
            };
            if min.is_some_and(|bound| number < bound) {
                return false;
            }
            !max.is_some_and(|bound| number > bound)
        }
    }
}

fn lookup_path<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = data;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn parse_field_filters(raw: &str) -> Result<Vec<FieldFilter>, AtlasError> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|err| AtlasError::Validation(format!("filters is not valid JSON: {err}")))?;

    let Value::Object(entries) = parsed else {
        return Err(AtlasError::Validation(
            "filters MUST be a JSON object".to_string(),
        ));
    };

    let mut filters = Vec::with_capacity(entries.len());
    for (key, rule) in entries {
        let path: Vec<String> = key.split('#').map(str::to_string).collect();
        filters.push(FieldFilter {
            path,
            op: parse_filter_rule(&key, &rule)?,
        });
    }
    Ok(filters)
}

fn parse_filter_rule(key: &str, rule: &Value) -> Result<FieldOp, AtlasError> {
    let Some(rule_type) = rule.get("_rule_type").and_then(Value::as_str) else {
        // A bare value is shorthand for equality.
        return Ok(FieldOp::Eq(rule.clone()));
    };

    match rule_type {
        "containment" => {
            let values = rule
                .get("contains")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    AtlasError::Validation(format!(
                        "filters.{key} containment rule MUST carry a contains array"
                    ))
                })?;
            Ok(FieldOp::Contains(values.clone()))
        }
        "intrange" => {
            let min = rule.get("min").and_then(Value::as_i64);
            let max = rule.get("max").and_then(Value::as_i64);
            if min.is_none() && max.is_none() {
                return Err(AtlasError::Validation(format!(
                    "filters.{key} intrange rule MUST carry min or max"
                )));
            }
            Ok(FieldOp::IntRange { min, max })
        }
        other => Err(AtlasError::Validation(format!(
            "filters.{key} has unknown _rule_type: {other}"
        ))),
    }
}

fn parse_rfc3339_param(name: &str, raw: &str) -> Result<OffsetDateTime, AtlasError> {
    parse_rfc3339(raw)
        .map_err(|err| AtlasError::Validation(format!("{name} is not a valid instant: {err}")))
}

/// Source of records for the aggregation engine. The sqlite store is the
/// production implementation; tests substitute in-memory fixtures.
pub trait RecordSource {
    /// # Errors
    /// Propagates the underlying store failure.
    fn query_records(&self, predicate: &RecordPredicate) -> anyhow::Result<Vec<Record>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TodDowBin {
    pub dow: u8,
    pub tod: u8,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct WeekBin {
    pub week: u8,
    pub count: u64,
}

/// Counts matching records per `(weekday, hour)` of `occurred_from` in the
/// reference zone. Empty cells are never emitted; output is sorted by key.
///
/// # Errors
/// Propagates record-source failures.
pub fn compute_toddow<S>(
    source: &S,
    predicate: &RecordPredicate,
    zone: UtcOffset,
) -> anyhow::Result<Vec<TodDowBin>>
where
    S: RecordSource + ?Sized,
{
    let records = source.query_records(predicate)?;
    let mut bins: BTreeMap<(u8, u8), u64> = BTreeMap::new();

    for record in &records {
        let local = record.occurred_from.to_offset(zone);
        // Monday maps to 2: downstream dashboard consumers index weekdays
        // with this shift, so it is part of the wire contract.
        let dow = local.weekday().number_from_monday() + 1;
        let tod = local.hour();
        *bins.entry((dow, tod)).or_insert(0) += 1;
    }

    Ok(bins
        .into_iter()
        .map(|((dow, tod), count)| TodDowBin { dow, tod, count })
        .collect())
}

/// Counts matching records per ISO calendar week of `occurred_from` in the
/// reference zone. Both occurred bounds are required up front so a weak
/// predicate can never widen into a full-table scan.
///
/// # Errors
/// Returns [`AtlasError::Validation`] when either bound is missing;
/// propagates record-source failures.
pub fn compute_stepwise<S>(
    source: &S,
    predicate: &RecordPredicate,
    zone: UtcOffset,
) -> anyhow::Result<Vec<WeekBin>>
where
    S: RecordSource + ?Sized,
{
    if predicate.occurred_min.is_none() {
        return Err(AtlasError::Validation(
            "occurred_min is required for stepwise aggregation".to_string(),
        )
        .into());
    }
    if predicate.occurred_max.is_none() {
        return Err(AtlasError::Validation(
            "occurred_max is required for stepwise aggregation".to_string(),
        )
        .into());
    }

    let records = source.query_records(predicate)?;
    let mut bins: BTreeMap<u8, u64> = BTreeMap::new();

    for record in &records {
        let week = record.occurred_from.to_offset(zone).iso_week();
        *bins.entry(week).or_insert(0) += 1;
    }

    Ok(bins
        .into_iter()
        .map(|(week, count)| WeekBin { week, count })
        .collect())
}

/// Shapes a record for the caller's view. `Full` is the whole
/// representation; `ReadOnlyDetails` reduces the payload to its top-level
/// `*Details` sections and drops everything else in `data`.
///
/// # Errors
/// Returns [`AtlasError::Serialization`] if the record cannot be encoded.
pub fn shape_record(record: &Record, view: ViewKind) -> Result<Value, AtlasError> {
    let mut encoded = serde_json::to_value(record)
        .map_err(|err| AtlasError::Serialization(format!("failed to encode record: {err}")))?;

    if view == ViewKind::Full {
        return Ok(encoded);
    }

    let reduced = match record.data.as_object() {
        Some(sections) => Value::Object(
            sections
                .iter()
                .filter(|(key, _)| key.ends_with("Details"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        None => Value::Object(serde_json::Map::new()),
    };

    if let Some(fields) = encoded.as_object_mut() {
        fields.insert("data".to_string(), reduced);
    }
    Ok(encoded)
}

pub const DEFAULT_AUDIT_MAX_SPAN: Duration = Duration::days(31);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditLogQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub min_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub max_date: Option<OffsetDateTime>,
    pub action: Option<AuditAction>,
    pub username: Option<String>,
}

impl AuditLogQuery {
    /// Builds an audit query from the raw query-string map; unrecognized
    /// parameters are ignored.
    ///
    /// # Errors
    /// Returns [`AtlasError::Validation`] naming the parameter for
    /// malformed dates or an unknown action.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, AtlasError> {
        let min_date = match params.get("min_date") {
            Some(raw) => Some(parse_rfc3339_param("min_date", raw)?),
            None => None,
        };
        let max_date = match params.get("max_date") {
            Some(raw) => Some(parse_rfc3339_param("max_date", raw)?),
            None => None,
        };
        let action = match params.get("action") {
            Some(raw) => Some(AuditAction::parse(raw).ok_or_else(|| {
                AtlasError::Validation(
                    "action MUST be one of create, update, delete".to_string(),
                )
            })?),
            None => None,
        };
        let username = params.get("username").cloned();

        Ok(Self {
            min_date,
            max_date,
            action,
            username,
        })
    }

    /// Enforces the bounded-range contract: both dates present and the
    /// span within `max_span`.
    ///
    /// # Errors
    /// Returns [`AtlasError::Validation`] naming the missing or
    /// out-of-range parameter.
    pub fn validate(
        &self,
        max_span: Duration,
    ) -> Result<(OffsetDateTime, OffsetDateTime), AtlasError> {
        let min_date = self
            .min_date
            .ok_or_else(|| AtlasError::Validation("min_date is required".to_string()))?;
        let max_date = self
            .max_date
            .ok_or_else(|| AtlasError::Validation("max_date is required".to_string()))?;

        if max_date - min_date > max_span {
            return Err(AtlasError::Validation(format!(
                "min_date/max_date span MUST NOT exceed {} days",
                max_span.whole_days()
            )));
        }

        Ok((min_date, max_date))
    }
}

/// Parses an RFC3339 instant; any UTC offset is accepted and preserved.
///
/// # Errors
/// Returns [`AtlasError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, AtlasError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AtlasError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AtlasError::Serialization`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AtlasError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AtlasError::Serialization(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Parses the tenant reference zone: `Z` or a `+hh:mm` / `-hh:mm` offset.
///
/// # Errors
/// Returns [`AtlasError::Validation`] for any other shape.
pub fn parse_zone_offset(value: &str) -> Result<UtcOffset, AtlasError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("z") {
        return Ok(UtcOffset::UTC);
    }

    let invalid =
        || AtlasError::Validation(format!("zone offset MUST look like +08:00, got: {value}"));

    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1_i8, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1_i8, rest)
    } else {
        return Err(invalid());
    };

    let (hours_raw, minutes_raw) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i8 = hours_raw.parse().map_err(|_| invalid())?;
    let minutes: i8 = minutes_raw.parse().map_err(|_| invalid())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| invalid())
}
