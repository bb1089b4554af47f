//! Core calendar model, day keys, and null-coalescing merge primitives for YAEF.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

/// Values providers emit in place of a missing cell.
const MISSING_SENTINELS: &[&str] = &["", "nan", "-", "n/a", "null", "none"];

/// Canonical `"<Weekday>, MM/DD/YYYY"` key identifying one calendar day.
///
/// Ordering is chronological; documents render most-recent-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(NaiveDate);

#[derive(Debug, Error)]
#[error("invalid day key {key:?}: {source}")]
pub struct DayKeyError {
    pub key: String,
    source: chrono::ParseError,
}

impl DayKey {
    pub const FORMAT: &'static str = "%A, %m/%d/%Y";

    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Day of `ts` in its own offset, so an evening release west of UTC keeps its local date.
    pub fn from_timestamp<Tz: TimeZone>(ts: &DateTime<Tz>) -> Self {
        Self(ts.date_naive())
    }

    pub fn parse(key: &str) -> Result<Self, DayKeyError> {
        NaiveDate::parse_from_str(key.trim(), Self::FORMAT)
            .map(Self)
            .map_err(|source| DayKeyError {
                key: key.to_string(),
                source,
            })
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = DayKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// Coarse market significance of an economic event, read from the row's impact icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Impact {
    High,
    Medium,
    Low,
    #[serde(rename = "Non-Economic", alias = "NonEconomic")]
    NonEconomic,
}

impl Impact {
    /// Maps the trailing code of an `...-impact-<code>` icon class.
    pub fn from_marker_code(code: &str) -> Option<Self> {
        match code {
            "red" => Some(Self::High),
            "ora" => Some(Self::Medium),
            "yel" => Some(Self::Low),
            "gra" => Some(Self::NonEconomic),
            _ => None,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "High" => Some(Self::High),
            "Medium" => Some(Self::Medium),
            "Low" => Some(Self::Low),
            "Non-Economic" | "NonEconomic" => Some(Self::NonEconomic),
            _ => None,
        }
    }
}

/// One row of the economic-events calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicEvent {
    pub date: Option<String>,
    pub time: Option<String>,
    pub currency: Option<String>,
    #[serde(deserialize_with = "de_lenient_impact")]
    pub impact: Option<Impact>,
    #[serde(rename = "event", alias = "event_name")]
    pub event_name: Option<String>,
    pub actual: Option<String>,
    pub forecast: Option<String>,
    pub previous: Option<String>,
}

/// One company's earnings event as reported by the market calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsRecord {
    pub symbol: String,
    #[serde(default, deserialize_with = "de_lenient_text")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub marketcap: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_text")]
    pub event_name: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_timestamp")]
    pub date: Option<DateTime<FixedOffset>>,
    #[serde(default, deserialize_with = "de_lenient_text")]
    pub timing: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub eps_estimate: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub reported_eps: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub surprise_pct: Option<f64>,
}

impl EarningsRecord {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            company: None,
            marketcap: None,
            event_name: None,
            date: None,
            timing: None,
            eps_estimate: None,
            reported_eps: None,
            surprise_pct: None,
        }
    }

    /// Company grouping key; falls back to the symbol.
    pub fn company_key(&self) -> &str {
        self.company.as_deref().unwrap_or(&self.symbol)
    }

    pub fn day_key(&self) -> Option<DayKey> {
        self.date.as_ref().map(DayKey::from_timestamp)
    }
}

/// A record with an identity inside its leaf list and a null-coalescing field merge.
pub trait MergeRecord {
    fn identity(&self) -> Option<&str>;

    /// Folds `newer` into `self`: every non-null field of `newer` wins, and a
    /// null field never erases a value `self` already holds.
    fn merge_from(&mut self, newer: Self);
}

fn override_field_value<T>(field: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *field = Some(value);
    }
}

impl MergeRecord for EarningsRecord {
    fn identity(&self) -> Option<&str> {
        Some(&self.symbol)
    }

    fn merge_from(&mut self, newer: Self) {
        override_field_value(&mut self.company, newer.company);
        override_field_value(&mut self.marketcap, newer.marketcap);
        override_field_value(&mut self.event_name, newer.event_name);
        override_field_value(&mut self.date, newer.date);
        override_field_value(&mut self.timing, newer.timing);
        override_field_value(&mut self.eps_estimate, newer.eps_estimate);
        override_field_value(&mut self.reported_eps, newer.reported_eps);
        override_field_value(&mut self.surprise_pct, newer.surprise_pct);
    }
}

impl MergeRecord for EconomicEvent {
    fn identity(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    fn merge_from(&mut self, newer: Self) {
        override_field_value(&mut self.date, newer.date);
        override_field_value(&mut self.time, newer.time);
        override_field_value(&mut self.currency, newer.currency);
        override_field_value(&mut self.impact, newer.impact);
        override_field_value(&mut self.event_name, newer.event_name);
        override_field_value(&mut self.actual, newer.actual);
        override_field_value(&mut self.forecast, newer.forecast);
        override_field_value(&mut self.previous, newer.previous);
    }
}

/// `mergeRecord(old, new)`, applied old-then-new.
pub fn merge_record<R: MergeRecord>(mut old: R, new: R) -> R {
    old.merge_from(new);
    old
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Merged,
    /// The record had no identity and was not stored.
    Skipped,
}

/// Inserts `incoming` into `records`, or merges it into the entry with the same identity.
/// Existing entries keep their position; new identities are appended.
pub fn upsert<R: MergeRecord>(records: &mut Vec<R>, incoming: R) -> Upsert {
    let Some(id) = incoming.identity() else {
        return Upsert::Skipped;
    };
    let position = records.iter().position(|r| r.identity() == Some(id));
    match position {
        Some(index) => {
            records[index].merge_from(incoming);
            Upsert::Merged
        }
        None => {
            records.push(incoming);
            Upsert::Inserted
        }
    }
}

pub type CompanyGroups = BTreeMap<String, Vec<EarningsRecord>>;

/// Day-keyed calendar document. Serializes as a JSON object whose keys run
/// from the most recent day to the oldest.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarDocument<D> {
    days: BTreeMap<DayKey, D>,
}

/// `day -> company -> [record]`, records unique by symbol within a company.
pub type EarningsCalendar = CalendarDocument<CompanyGroups>;

/// `day -> [event]`, events unique by event name within a day.
pub type EconomicsCalendar = CalendarDocument<Vec<EconomicEvent>>;

impl<D> Default for CalendarDocument<D> {
    fn default() -> Self {
        Self {
            days: BTreeMap::new(),
        }
    }
}

impl<D> CalendarDocument<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn get(&self, day: &DayKey) -> Option<&D> {
        self.days.get(day)
    }

    pub fn day_mut(&mut self, day: DayKey) -> &mut D
    where
        D: Default,
    {
        self.days.entry(day).or_default()
    }

    /// Days from most recent to oldest.
    pub fn iter(&self) -> impl Iterator<Item = (&DayKey, &D)> {
        self.days.iter().rev()
    }

    pub fn day_keys(&self) -> Vec<DayKey> {
        self.days.keys().rev().copied().collect()
    }

    pub fn into_days(self) -> impl Iterator<Item = (DayKey, D)> {
        self.days.into_iter().rev()
    }

    /// Keeps days whose date lies in `[start, end]`; a missing bound is open.
    pub fn retain_range(&mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) {
        self.days.retain(|day, _| {
            start.map_or(true, |s| day.date() >= s) && end.map_or(true, |e| day.date() <= e)
        });
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, DocumentError>
    where
        D: Serialize,
    {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<D: Serialize> Serialize for CalendarDocument<D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.days.len()))?;
        for (day, entry) in self.days.iter().rev() {
            map.serialize_entry(&day.to_string(), entry)?;
        }
        map.end()
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed calendar document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    DayKey(#[from] DayKeyError),
}

/// Shape the persisted document was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGeneration {
    /// Whole document was a flat list of records; discarded on load.
    FlatDocument,
    /// At least one day was a flat list of records; migrated to company groups.
    FlatDays,
    /// Current `day -> company -> [record]` shape.
    Grouped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub document: T,
    pub generation: SchemaGeneration,
    pub migrated_days: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEarningsDay {
    Grouped(CompanyGroups),
    Legacy(Vec<EarningsRecord>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEarningsDocument {
    Days(BTreeMap<String, StoredEarningsDay>),
    Flat(Vec<JsonValue>),
}

/// Regroups a legacy flat day by company (or symbol when no company is recorded).
fn group_legacy_day(records: Vec<EarningsRecord>) -> CompanyGroups {
    let mut groups = CompanyGroups::new();
    for record in records {
        let company = record.company_key().to_string();
        upsert(groups.entry(company).or_default(), record);
    }
    groups
}

impl EarningsCalendar {
    /// Decodes a persisted earnings document, migrating legacy day shapes in place.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Decoded<Self>, DocumentError> {
        let stored: StoredEarningsDocument = serde_json::from_slice(bytes)?;
        let days = match stored {
            StoredEarningsDocument::Days(days) => days,
            StoredEarningsDocument::Flat(items) => {
                warn!(items = items.len(), "discarding flat-list earnings document");
                return Ok(Decoded {
                    document: Self::new(),
                    generation: SchemaGeneration::FlatDocument,
                    migrated_days: 0,
                });
            }
        };

        let mut document = Self::new();
        let mut migrated_days = 0usize;
        for (raw_key, entry) in days {
            let day = DayKey::parse(&raw_key)?;
            let groups = match entry {
                StoredEarningsDay::Grouped(groups) => groups,
                StoredEarningsDay::Legacy(records) => {
                    migrated_days += 1;
                    group_legacy_day(records)
                }
            };
            document.insert_day(day, &raw_key, groups);
        }

        let generation = if migrated_days > 0 {
            SchemaGeneration::FlatDays
        } else {
            SchemaGeneration::Grouped
        };
        Ok(Decoded {
            document,
            generation,
            migrated_days,
        })
    }

    /// Upserts a record under its derived day and company.
    /// Returns `None` when the record carries no usable date.
    pub fn upsert_record(&mut self, record: EarningsRecord) -> Option<Upsert> {
        let day = record.day_key()?;
        let company = record.company_key().to_string();
        let groups = self.day_mut(day);
        Some(upsert(groups.entry(company).or_default(), record))
    }

    /// Two raw keys can name the same day (`3/4/2024` vs `03/04/2024`);
    /// the later key is merged into the earlier one record by record.
    fn insert_day(&mut self, day: DayKey, raw_key: &str, groups: CompanyGroups) {
        if !self.days.contains_key(&day) {
            self.days.insert(day, groups);
            return;
        }
        warn!(day = %day, raw_key, "merging earnings day stored under a duplicate key");
        let existing = self.day_mut(day);
        for (company, records) in groups {
            let list = existing.entry(company).or_default();
            for record in records {
                upsert(list, record);
            }
        }
    }

    pub fn record_count(&self) -> usize {
        self.days
            .values()
            .flat_map(|groups| groups.values())
            .map(Vec::len)
            .sum()
    }
}

impl EconomicsCalendar {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Decoded<Self>, DocumentError> {
        let stored: BTreeMap<String, Vec<EconomicEvent>> = serde_json::from_slice(bytes)?;
        let mut document = Self::new();
        for (raw_key, events) in stored {
            let day = DayKey::parse(&raw_key)?;
            document.insert_day(day, &raw_key, events);
        }
        Ok(Decoded {
            document,
            generation: SchemaGeneration::Grouped,
            migrated_days: 0,
        })
    }

    fn insert_day(&mut self, day: DayKey, raw_key: &str, events: Vec<EconomicEvent>) {
        if !self.days.contains_key(&day) {
            self.days.insert(day, events);
            return;
        }
        warn!(day = %day, raw_key, "merging economics day stored under a duplicate key");
        let existing = self.day_mut(day);
        for event in events {
            upsert(existing, event);
        }
    }

    pub fn upsert_event(&mut self, day: DayKey, event: EconomicEvent) -> Upsert {
        if event.identity().is_none() {
            return Upsert::Skipped;
        }
        upsert(self.day_mut(day), event)
    }

    pub fn event_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}

fn is_missing_sentinel(text: &str) -> bool {
    let trimmed = text.trim();
    MISSING_SENTINELS
        .iter()
        .any(|s| trimmed.eq_ignore_ascii_case(s))
}

/// Trimmed text, or `None` for blank and sentinel values.
pub fn text_or_none(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !is_missing_sentinel(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Finite number from a JSON number or numeric string; sentinels and non-finite values are `None`.
pub fn number_or_none(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) if !is_missing_sentinel(s) => {
            s.trim().trim_end_matches('%').replace(',', "").parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Timestamp from a string (see [`parse_timestamp`]) or epoch seconds/milliseconds.
pub fn timestamp_or_none(value: &JsonValue) -> Option<DateTime<FixedOffset>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))?;
            let millis = if raw.abs() >= 100_000_000_000 { raw } else { raw.saturating_mul(1000) };
            Utc.timestamp_millis_opt(millis).single().map(|ts| ts.fixed_offset())
        }
        _ => None,
    }
}

/// Accepts RFC 3339 (`T` or space separator), offset date-times, naive
/// date-times, and bare dates. An explicit offset is kept as given; naive
/// values are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    if is_missing_sentinel(text) {
        return None;
    }
    if let Ok(ts) = text.parse::<DateTime<FixedOffset>>() {
        return Some(ts);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

fn de_lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(text_or_none(&JsonValue::deserialize(deserializer)?))
}

fn de_lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(number_or_none(&JsonValue::deserialize(deserializer)?))
}

fn de_lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
    Ok(timestamp_or_none(&JsonValue::deserialize(deserializer)?))
}

fn de_lenient_impact<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Impact>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(label) => Impact::from_label(&label),
        _ => None,
    })
}
