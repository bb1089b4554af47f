//! Calendar source adapters: economic-calendar table parsing and paginated
//! earnings collection.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use yaef_core::{
    number_or_none, text_or_none, timestamp_or_none, DayKey, EarningsCalendar, EarningsRecord,
    EconomicEvent, EconomicsCalendar, Impact, Upsert,
};
use yaef_storage::{FetchError, HttpFetcher};

pub const CALENDAR_TABLE_SELECTOR: &str = "table.calendar__table";
pub const EVENT_ROW_SELECTOR: &str = "tr[data-event-id]";
pub const EARNINGS_PAGE_SIZE: usize = 100;

/// Upper bound on pages per collection, in case a provider never returns a short page.
const MAX_EARNINGS_PAGES: usize = 200;
const IMPACT_MARKER: &str = "-impact-";
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("calendar table not found: no element matches {selector}")]
    TableNotFound { selector: &'static str },
    #[error("invalid selector {selector}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("invalid provider payload: {0}")]
    Payload(String),
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn blank_to_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Serialized HTML of the calendar table inside a full economic-calendar page.
pub fn extract_calendar_table(page_html: &str) -> Result<String, AdapterError> {
    let document = Html::parse_document(page_html);
    let table = selector(CALENDAR_TABLE_SELECTOR)?;
    document
        .select(&table)
        .next()
        .map(|t| t.html())
        .ok_or(AdapterError::TableNotFound {
            selector: CALENDAR_TABLE_SELECTOR,
        })
}

/// Cell values of one event row before date/time carry-forward. Blank cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRowCells {
    pub date: Option<String>,
    pub time: Option<String>,
    pub currency: Option<String>,
    pub impact: Option<Impact>,
    pub event_name: Option<String>,
    pub actual: Option<String>,
    pub forecast: Option<String>,
    pub previous: Option<String>,
}

/// Date and time inherited from the most recent row that printed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCarry {
    pub current_date: Option<String>,
    pub current_time: Option<String>,
}

impl RowCarry {
    pub fn apply(&mut self, cells: EventRowCells) -> EconomicEvent {
        if let Some(date) = cells.date {
            self.current_date = Some(date);
        }
        if let Some(time) = cells.time {
            self.current_time = Some(time);
        }
        EconomicEvent {
            date: self.current_date.clone(),
            time: self.current_time.clone(),
            currency: cells.currency,
            impact: cells.impact,
            event_name: cells.event_name,
            actual: cells.actual,
            forecast: cells.forecast,
            previous: cells.previous,
        }
    }
}

struct RowSelectors {
    date: Selector,
    time: Selector,
    currency: Selector,
    impact: Selector,
    title: Selector,
    actual: Selector,
    forecast: Selector,
    previous: Selector,
}

impl RowSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            date: selector(".calendar__date")?,
            time: selector(".calendar__time")?,
            currency: selector(".calendar__currency")?,
            impact: selector(".calendar__impact")?,
            title: selector(".calendar__event-title")?,
            actual: selector(".calendar__actual")?,
            forecast: selector(".calendar__forecast")?,
            previous: selector(".calendar__previous")?,
        })
    }

    fn read(&self, row: ElementRef<'_>) -> EventRowCells {
        let text = |sel: &Selector| {
            row.select(sel)
                .next()
                .and_then(|cell| blank_to_none(cell.text().collect::<String>()))
        };
        EventRowCells {
            date: text(&self.date),
            time: text(&self.time),
            currency: text(&self.currency),
            impact: row.select(&self.impact).next().and_then(impact_marker),
            event_name: text(&self.title),
            actual: text(&self.actual),
            forecast: text(&self.forecast),
            previous: text(&self.previous),
        }
    }
}

/// Impact from the first `...-impact-<code>` class under `cell`.
fn impact_marker(cell: ElementRef<'_>) -> Option<Impact> {
    let code = cell
        .descendants()
        .filter_map(ElementRef::wrap)
        .flat_map(|el| el.value().classes())
        .find_map(|class| class.rsplit_once(IMPACT_MARKER).map(|(_, code)| code))?;
    Impact::from_marker_code(code)
}

/// Walks `tr[data-event-id]` rows in document order, one event per row.
/// Rows whose carried date is still unknown are kept.
pub fn parse_economic_calendar(table_html: &str) -> Result<Vec<EconomicEvent>, AdapterError> {
    let fragment = Html::parse_fragment(table_html);
    let rows = selector(EVENT_ROW_SELECTOR)?;
    let cells = RowSelectors::new()?;
    let mut carry = RowCarry::default();
    Ok(fragment
        .select(&rows)
        .map(|row| carry.apply(cells.read(row)))
        .collect())
}

pub fn parse_economic_page(page_html: &str) -> Result<Vec<EconomicEvent>, AdapterError> {
    let table = extract_calendar_table(page_html)?;
    parse_economic_calendar(&table)
}

/// Resolves the calendar's year-less date text (`"Mon Mar 4"`, `"MonMar 4"`,
/// `"Mon 1/1"`) against `reference`, picking the year that lands nearest to it.
pub fn resolve_economic_day(text: &str, reference: NaiveDate) -> Option<DayKey> {
    let lower = text.trim().to_ascii_lowercase();
    let (month, day, year) = parse_numeric_date(&lower).or_else(|| parse_month_name_date(&lower))?;
    let date = match year {
        Some(year) => NaiveDate::from_ymd_opt(year, month, day)?,
        None => nearest_year(month, day, reference)?,
    };
    Some(DayKey::new(date))
}

fn parse_numeric_date(text: &str) -> Option<(u32, u32, Option<i32>)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let mut parts = text[start..].split('/');
    let month = parts.next()?.trim().parse().ok()?;
    let day = parts.next()?.trim().parse().ok()?;
    let year = match parts.next() {
        Some(raw) => {
            let year: i32 = raw.trim().parse().ok()?;
            Some(if year < 100 { year + 2000 } else { year })
        }
        None => None,
    };
    Some((month, day, year))
}

fn parse_month_name_date(text: &str) -> Option<(u32, u32, Option<i32>)> {
    let (position, month) = MONTHS
        .iter()
        .enumerate()
        .filter_map(|(i, name)| text.find(name).map(|pos| (pos, i as u32 + 1)))
        .min_by_key(|(pos, _)| *pos)?;
    let rest = text[position..].trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let mut numbers = rest
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let day = numbers.next()?.parse().ok()?;
    let year = numbers.next().and_then(|y| y.parse().ok());
    Some((month, day, year))
}

fn nearest_year(month: u32, day: u32, reference: NaiveDate) -> Option<NaiveDate> {
    let year = reference.year();
    [year, year - 1, year + 1]
        .into_iter()
        .filter_map(|y| NaiveDate::from_ymd_opt(y, month, day))
        .min_by_key(|d| (*d - reference).num_days().abs())
}

#[derive(Debug, Clone, Default)]
pub struct GroupedEconomics {
    pub calendar: EconomicsCalendar,
    pub merged_duplicates: usize,
    /// Events without a resolvable date or an event name.
    pub dropped: usize,
}

pub fn group_economic_events(
    events: impl IntoIterator<Item = EconomicEvent>,
    reference: NaiveDate,
) -> GroupedEconomics {
    let mut grouped = GroupedEconomics::default();
    for event in events {
        let day = event
            .date
            .as_deref()
            .and_then(|text| resolve_economic_day(text, reference));
        let Some(day) = day else {
            debug!(date = ?event.date, event = ?event.event_name, "dropping event without a day");
            grouped.dropped += 1;
            continue;
        };
        match grouped.calendar.upsert_event(day, event) {
            Upsert::Inserted => {}
            Upsert::Merged => grouped.merged_duplicates += 1,
            Upsert::Skipped => grouped.dropped += 1,
        }
    }
    grouped
}

/// One provider row, keyed by the provider's column names.
pub type RawEarningsRow = Map<String, JsonValue>;

static NULL: JsonValue = JsonValue::Null;

fn column<'a>(row: &'a RawEarningsRow, name: &str) -> &'a JsonValue {
    row.get(name).unwrap_or(&NULL)
}

/// Maps provider columns onto [`EarningsRecord`]; rows without a symbol yield `None`.
pub fn normalize_earnings_row(row: &RawEarningsRow) -> Option<EarningsRecord> {
    let symbol = text_or_none(column(row, "Symbol")).or_else(|| text_or_none(column(row, "index")))?;
    Some(EarningsRecord {
        company: text_or_none(column(row, "Company")).or_else(|| Some(symbol.clone())),
        marketcap: number_or_none(column(row, "Marketcap")),
        event_name: text_or_none(column(row, "Event Name")),
        date: timestamp_or_none(column(row, "Event Start Date")),
        timing: text_or_none(column(row, "Timing")),
        eps_estimate: number_or_none(column(row, "EPS Estimate")),
        reported_eps: number_or_none(column(row, "Reported EPS")),
        surprise_pct: number_or_none(column(row, "Surprise(%)")),
        symbol,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
    pub min_market_cap: u64,
}

#[async_trait]
pub trait EarningsSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// `Ok(None)` means the provider has no page at this offset.
    async fn fetch_page(
        &self,
        request: PageRequest,
    ) -> Result<Option<Vec<RawEarningsRow>>, AdapterError>;
}

#[async_trait]
pub trait EconomicPageSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct EarningsCollection {
    pub calendar: EarningsCalendar,
    pub collected: usize,
    pub pages_fetched: usize,
    pub merged_duplicates: usize,
    /// Rows without a symbol.
    pub skipped_rows: usize,
    /// Records without a usable date.
    pub dropped: usize,
}

/// Pages through `source` until a short or empty page, grouping records by
/// day and company as they arrive. Duplicate symbols across pages are merged.
pub async fn collect_earnings(
    source: &dyn EarningsSource,
    min_market_cap: u64,
) -> Result<EarningsCollection, AdapterError> {
    let mut collection = EarningsCollection::default();
    let mut offset = 0usize;

    while collection.pages_fetched < MAX_EARNINGS_PAGES {
        let request = PageRequest {
            limit: EARNINGS_PAGE_SIZE,
            offset,
            min_market_cap,
        };
        let page = source.fetch_page(request).await?;
        collection.pages_fetched += 1;

        let Some(rows) = page.filter(|rows| !rows.is_empty()) else {
            break;
        };
        let page_len = rows.len();
        debug!(source = source.source_id(), offset, rows = page_len, "earnings page");

        for row in &rows {
            let Some(record) = normalize_earnings_row(row) else {
                collection.skipped_rows += 1;
                continue;
            };
            collection.collected += 1;
            match collection.calendar.upsert_record(record) {
                Some(Upsert::Merged) => collection.merged_duplicates += 1,
                Some(_) => {}
                None => collection.dropped += 1,
            }
        }

        if page_len < EARNINGS_PAGE_SIZE {
            return Ok(collection);
        }
        offset += EARNINGS_PAGE_SIZE;
    }

    if collection.pages_fetched >= MAX_EARNINGS_PAGES {
        warn!(
            source = source.source_id(),
            pages = collection.pages_fetched,
            "earnings pagination stopped at page limit"
        );
    }
    Ok(collection)
}

/// Visualization column ids mapped to the column names [`normalize_earnings_row`] reads.
const EARNINGS_COLUMNS: [(&str, &str); 9] = [
    ("ticker", "Symbol"),
    ("companyshortname", "Company"),
    ("intradaymarketcap", "Marketcap"),
    ("eventname", "Event Name"),
    ("startdatetime", "Event Start Date"),
    ("startdatetimetype", "Timing"),
    ("epsestimate", "EPS Estimate"),
    ("epsactual", "Reported EPS"),
    ("epssurprisepct", "Surprise(%)"),
];

/// Days of upcoming earnings requested per collection, starting today.
pub const EARNINGS_WINDOW_DAYS: i64 = 7;

/// Screener query for one page of the earnings calendar, sorted by market cap.
pub fn earnings_query(request: &PageRequest, start: NaiveDate, end: NaiveDate) -> JsonValue {
    let fields: Vec<&str> = EARNINGS_COLUMNS.iter().map(|(id, _)| *id).collect();
    json!({
        "offset": request.offset,
        "size": request.limit,
        "sortField": "intradaymarketcap",
        "sortType": "DESC",
        "entityIdType": "earnings",
        "includeFields": fields,
        "query": {
            "operator": "and",
            "operands": [
                {"operator": "gte", "operands": ["startdatetime", start.format("%Y-%m-%d").to_string()]},
                {"operator": "lt", "operands": ["startdatetime", end.format("%Y-%m-%d").to_string()]},
                {"operator": "or", "operands": [{"operator": "eq", "operands": ["region", "us"]}]},
                {"operator": "gte", "operands": ["intradaymarketcap", request.min_market_cap]}
            ]
        }
    })
}

fn column_name(column: &JsonValue) -> String {
    let id = column.get("id").and_then(JsonValue::as_str);
    if let Some((_, name)) = id.and_then(|id| EARNINGS_COLUMNS.iter().find(|(known, _)| *known == id)) {
        return (*name).to_string();
    }
    column
        .get("label")
        .and_then(JsonValue::as_str)
        .or(id)
        .unwrap_or_default()
        .to_string()
}

/// Decodes a visualization response: `finance.result[0].documents[0]` holds a
/// `columns` list and `rows` as positional arrays, zipped here into named rows.
pub fn decode_earnings_page(body: &[u8]) -> Result<Option<Vec<RawEarningsRow>>, AdapterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::Payload(e.to_string()))?;
    let finance = value
        .get("finance")
        .ok_or_else(|| AdapterError::Payload("missing `finance` envelope".to_string()))?;
    if let Some(error) = finance.get("error").filter(|e| !e.is_null()) {
        return Err(AdapterError::Payload(format!("provider error: {error}")));
    }
    let Some(document) = finance.pointer("/result/0/documents/0") else {
        return Ok(None);
    };

    let columns: Vec<String> = match document.get("columns") {
        Some(JsonValue::Array(columns)) => columns.iter().map(column_name).collect(),
        _ => return Err(AdapterError::Payload("`columns` is not an array".to_string())),
    };
    let rows = match document.get("rows") {
        Some(JsonValue::Array(rows)) => rows,
        Some(JsonValue::Null) | None => return Ok(None),
        Some(other) => {
            return Err(AdapterError::Payload(format!("`rows` is not an array: {other}")))
        }
    };
    Ok(Some(
        rows.iter()
            .filter_map(JsonValue::as_array)
            .map(|cells| columns.iter().cloned().zip(cells.iter().cloned()).collect())
            .collect(),
    ))
}

/// Market earnings calendar from the visualization screener: one JSON POST per
/// page over a window of [`EARNINGS_WINDOW_DAYS`] days.
#[derive(Debug, Clone)]
pub struct HttpEarningsSource {
    http: HttpFetcher,
    url: String,
    start: Option<NaiveDate>,
}

impl HttpEarningsSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            start: None,
        }
    }

    /// Pins the window start; otherwise each page request starts today (UTC).
    pub fn with_start(mut self, start: NaiveDate) -> Self {
        self.start = Some(start);
        self
    }
}

#[async_trait]
impl EarningsSource for HttpEarningsSource {
    fn source_id(&self) -> &'static str {
        "market-earnings"
    }

    async fn fetch_page(
        &self,
        request: PageRequest,
    ) -> Result<Option<Vec<RawEarningsRow>>, AdapterError> {
        let start = self.start.unwrap_or_else(|| Utc::now().date_naive());
        let end = start + Duration::days(EARNINGS_WINDOW_DAYS);
        let query = [("lang", "en-US".to_string()), ("region", "US".to_string())];
        let body = earnings_query(&request, start, end);
        match self.http.post_json(&self.url, &query, &body).await {
            Ok(resp) => decode_earnings_page(&resp.body),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Economic calendar page fetched with the browser request profile.
#[derive(Debug, Clone)]
pub struct HttpEconomicPageSource {
    http: HttpFetcher,
    url: String,
}

impl HttpEconomicPageSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EconomicPageSource for HttpEconomicPageSource {
    fn source_id(&self) -> &'static str {
        "economic-calendar"
    }

    async fn fetch_page(&self) -> Result<String, AdapterError> {
        Ok(self.http.fetch(&self.url).await?.text())
    }
}
