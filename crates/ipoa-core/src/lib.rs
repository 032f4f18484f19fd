//! Core IPO record model, placeholder semantics and the record normalizer.
//!
//! Everything the rest of the workspace knows about "unknown" values lives
//! here: the sentinels, the single placeholder predicate and the normalizer
//! that turns loosely-typed rows into [`IpoRecord`]s.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "ipoa-core";

/// Sentinel for unknown text and date fields.
pub const PLACEHOLDER_TEXT: &str = "TBA";

/// Sentinel for unknown notes.
pub const PLACEHOLDER_NOTES: &str = "Details pending.";

/// Other spellings of "unknown" seen in scraped tables and sheet cells.
const UNKNOWN_MARKERS: &[&str] = &["n/a", "na", "-", "—", "null", "none"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%d-%b-%Y",
];

/// A loosely-typed row as produced by the AI extractor or read back from the sheet.
pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpoStatus {
    #[default]
    Upcoming,
    Open,
    Closed,
}

impl IpoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpoStatus::Upcoming => "upcoming",
            IpoStatus::Open => "open",
            IpoStatus::Closed => "closed",
        }
    }

    pub fn parse_loose(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Some(IpoStatus::Upcoming),
            "open" => Some(IpoStatus::Open),
            "closed" => Some(IpoStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for IpoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell value, independent of the field it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    /// `None` for nulls, booleans, arrays and objects: none of them can carry a field value.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(FieldValue::Text(s.clone())),
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Number),
            _ => None,
        }
    }

    /// The one placeholder predicate. `0`, `"0"`, `""`, `"TBA"` and
    /// `"Details pending."` are all unknown, whatever field they sit in.
    pub fn is_placeholder(&self) -> bool {
        match self {
            FieldValue::Number(n) => !n.is_finite() || *n <= 0.0,
            FieldValue::Text(s) => {
                let t = s.trim();
                if t.is_empty()
                    || t.eq_ignore_ascii_case(PLACEHOLDER_TEXT)
                    || t == PLACEHOLDER_NOTES
                    || UNKNOWN_MARKERS.iter().any(|m| t.eq_ignore_ascii_case(m))
                {
                    return true;
                }
                // Only plain numerals count; `f64::from_str` would also take "inf" and "NaN".
                let numeral = t
                    .chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-' | '+'));
                match t.replace(',', "").parse::<f64>() {
                    Ok(n) if numeral => FieldValue::Number(n).is_placeholder(),
                    _ => false,
                }
            }
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => parse_number(s),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Number(n) => number_to_json(*n),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) => f.write_str(&format_number(*n)),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Number(n) => serialize_number(n, serializer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordField {
    CompanyName,
    Symbol,
    IpoDate,
    ApplicationOpen,
    ApplicationClose,
    Industry,
    LotSize,
    PriceBandLow,
    PriceBandHigh,
    Gmp,
    IssuePrice,
    Status,
    Notes,
}

impl RecordField {
    pub const ALL: [RecordField; 13] = [
        RecordField::CompanyName,
        RecordField::Symbol,
        RecordField::IpoDate,
        RecordField::ApplicationOpen,
        RecordField::ApplicationClose,
        RecordField::Industry,
        RecordField::LotSize,
        RecordField::PriceBandLow,
        RecordField::PriceBandHigh,
        RecordField::Gmp,
        RecordField::IssuePrice,
        RecordField::Status,
        RecordField::Notes,
    ];

    /// Fields a newer extraction may fill in when the stored value is unknown.
    pub const PROMOTABLE: [RecordField; 9] = [
        RecordField::PriceBandHigh,
        RecordField::PriceBandLow,
        RecordField::Gmp,
        RecordField::LotSize,
        RecordField::IpoDate,
        RecordField::ApplicationOpen,
        RecordField::ApplicationClose,
        RecordField::Industry,
        RecordField::IssuePrice,
    ];

    /// Column name in the sheet and key in extractor output.
    pub fn name(self) -> &'static str {
        match self {
            RecordField::CompanyName => "company_name",
            RecordField::Symbol => "symbol",
            RecordField::IpoDate => "ipo_date",
            RecordField::ApplicationOpen => "application_open",
            RecordField::ApplicationClose => "application_close",
            RecordField::Industry => "industry",
            RecordField::LotSize => "lot_size",
            RecordField::PriceBandLow => "price_band_low",
            RecordField::PriceBandHigh => "price_band_high",
            RecordField::Gmp => "gmp",
            RecordField::IssuePrice => "issue_price",
            RecordField::Status => "status",
            RecordField::Notes => "notes",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for RecordField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Canonical IPO row. Unknown values hold the documented sentinels, never `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoRecord {
    pub company_name: String,
    pub symbol: String,
    pub ipo_date: String,
    pub application_open: String,
    pub application_close: String,
    pub industry: String,
    #[serde(serialize_with = "serialize_number")]
    pub lot_size: f64,
    #[serde(serialize_with = "serialize_number")]
    pub price_band_low: f64,
    #[serde(serialize_with = "serialize_number")]
    pub price_band_high: f64,
    #[serde(serialize_with = "serialize_number")]
    pub gmp: f64,
    #[serde(serialize_with = "serialize_number")]
    pub issue_price: f64,
    pub status: IpoStatus,
    /// False when `status` is only the default because the source gave none.
    #[serde(skip)]
    pub status_reported: bool,
    pub notes: String,
}

impl IpoRecord {
    /// A record with every field except the name set to its placeholder.
    pub fn placeholder(company_name: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            symbol: PLACEHOLDER_TEXT.to_string(),
            ipo_date: PLACEHOLDER_TEXT.to_string(),
            application_open: PLACEHOLDER_TEXT.to_string(),
            application_close: PLACEHOLDER_TEXT.to_string(),
            industry: PLACEHOLDER_TEXT.to_string(),
            lot_size: 0.0,
            price_band_low: 0.0,
            price_band_high: 0.0,
            gmp: 0.0,
            issue_price: 0.0,
            status: IpoStatus::default(),
            status_reported: false,
            notes: PLACEHOLDER_NOTES.to_string(),
        }
    }

    pub fn natural_key(&self) -> String {
        normalize_key(&self.company_name)
    }

    pub fn get(&self, field: RecordField) -> FieldValue {
        match field {
            RecordField::CompanyName => FieldValue::Text(self.company_name.clone()),
            RecordField::Symbol => FieldValue::Text(self.symbol.clone()),
            RecordField::IpoDate => FieldValue::Text(self.ipo_date.clone()),
            RecordField::ApplicationOpen => FieldValue::Text(self.application_open.clone()),
            RecordField::ApplicationClose => FieldValue::Text(self.application_close.clone()),
            RecordField::Industry => FieldValue::Text(self.industry.clone()),
            RecordField::LotSize => FieldValue::Number(self.lot_size),
            RecordField::PriceBandLow => FieldValue::Number(self.price_band_low),
            RecordField::PriceBandHigh => FieldValue::Number(self.price_band_high),
            RecordField::Gmp => FieldValue::Number(self.gmp),
            RecordField::IssuePrice => FieldValue::Number(self.issue_price),
            RecordField::Status => FieldValue::Text(self.status.as_str().to_string()),
            RecordField::Notes => FieldValue::Text(self.notes.clone()),
        }
    }

    /// Writes a value into a field, coercing between text and numbers.
    /// A status value that does not parse leaves the status untouched.
    pub fn set(&mut self, field: RecordField, value: FieldValue) {
        let number = || {
            value
                .as_number()
                .filter(|n| n.is_finite() && *n > 0.0)
                .unwrap_or(0.0)
        };
        match field {
            RecordField::CompanyName => self.company_name = value.to_string(),
            RecordField::Symbol => self.symbol = value.to_string(),
            RecordField::IpoDate => self.ipo_date = value.to_string(),
            RecordField::ApplicationOpen => self.application_open = value.to_string(),
            RecordField::ApplicationClose => self.application_close = value.to_string(),
            RecordField::Industry => self.industry = value.to_string(),
            RecordField::Notes => self.notes = value.to_string(),
            RecordField::LotSize => self.lot_size = number(),
            RecordField::PriceBandLow => self.price_band_low = number(),
            RecordField::PriceBandHigh => self.price_band_high = number(),
            RecordField::Gmp => self.gmp = number(),
            RecordField::IssuePrice => self.issue_price = number(),
            RecordField::Status => {
                if let Some(status) = IpoStatus::parse_loose(&value.to_string()) {
                    self.status = status;
                    self.status_reported = true;
                }
            }
        }
    }

    pub fn to_raw(&self) -> RawRecord {
        RecordField::ALL
            .iter()
            .map(|f| (f.name().to_string(), self.get(*f).to_json()))
            .collect()
    }
}

/// Field updates for one stored row, addressed by natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordPatch {
    pub key: String,
    /// Name exactly as stored, for backends that match rows verbatim.
    pub company_name: String,
    pub updates: BTreeMap<RecordField, FieldValue>,
}

impl RecordPatch {
    pub fn updates_json(&self) -> JsonValue {
        JsonValue::Object(
            self.updates
                .iter()
                .map(|(field, value)| (field.name().to_string(), value.to_json()))
                .collect(),
        )
    }

    pub fn apply_to(&self, record: &mut IpoRecord) {
        for (field, value) in &self.updates {
            record.set(*field, value.clone());
        }
    }
}

/// Natural key used for identity across runs: trimmed and lower-cased.
pub fn normalize_key(company_name: &str) -> String {
    company_name.trim().to_lowercase()
}

/// Fills every missing or falsy field of a raw row with its placeholder.
/// Total: any input yields a record. A row whose name is missing, null or
/// blank comes back with an empty `company_name` and is left for the caller to skip.
pub fn normalize_record(raw: &RawRecord) -> IpoRecord {
    let text = |field: RecordField| normalized_text(raw.get(field.name()));
    let number = |field: RecordField| normalized_number(raw.get(field.name()));
    let date = |field: RecordField| {
        text(field)
            .map(|s| normalize_date_text(&s))
            .unwrap_or_else(|| PLACEHOLDER_TEXT.to_string())
    };

    let price_band_high = number(RecordField::PriceBandHigh).unwrap_or(0.0);
    let status = raw
        .get(RecordField::Status.name())
        .and_then(JsonValue::as_str)
        .and_then(IpoStatus::parse_loose);
    // Names are identity, not data: "NA" or "TBA" is still a company.
    let company_name = raw
        .get(RecordField::CompanyName.name())
        .and_then(FieldValue::from_json)
        .map(|v| v.to_string().trim().to_string())
        .unwrap_or_default();

    IpoRecord {
        company_name,
        symbol: text(RecordField::Symbol).unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
        ipo_date: date(RecordField::IpoDate),
        application_open: date(RecordField::ApplicationOpen),
        application_close: date(RecordField::ApplicationClose),
        industry: text(RecordField::Industry).unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
        lot_size: number(RecordField::LotSize).unwrap_or(0.0),
        price_band_low: number(RecordField::PriceBandLow).unwrap_or(0.0),
        price_band_high,
        gmp: number(RecordField::Gmp).unwrap_or(0.0),
        issue_price: number(RecordField::IssuePrice).unwrap_or(price_band_high),
        status: status.unwrap_or_default(),
        status_reported: status.is_some(),
        notes: text(RecordField::Notes).unwrap_or_else(|| PLACEHOLDER_NOTES.to_string()),
    }
}

fn normalized_text(value: Option<&JsonValue>) -> Option<String> {
    let value = FieldValue::from_json(value?)?;
    if value.is_placeholder() {
        return None;
    }
    Some(value.to_string().trim().to_string())
}

fn normalized_number(value: Option<&JsonValue>) -> Option<f64> {
    let value = FieldValue::from_json(value?)?;
    if value.is_placeholder() {
        return None;
    }
    value.as_number().filter(|n| n.is_finite() && *n > 0.0)
}

/// Rewrites recognised dates to `YYYY-MM-DD`; anything else is kept as written.
pub fn normalize_date_text(input: &str) -> String {
    let trimmed = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// First decimal number in free text, ignoring thousands separators.
/// "₹ 1,200" → 1200 | "95-100" → 95 | "-12" → -12
pub fn parse_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    let mut prev: Option<char> = None;

    for ch in text.chars().filter(|c| *c != ',') {
        if ch.is_ascii_digit() {
            if current.is_empty() && prev == Some('-') {
                current.push('-');
            }
            current.push(ch);
        } else if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
        } else if !current.is_empty() {
            break;
        }
        prev = Some(ch);
    }

    current.trim_end_matches('.').parse().ok()
}

pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
    }
}

/// Whole numbers go out as integers so sheet cells read `150`, not `150.0`.
pub fn serialize_number<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        serializer.serialize_i64(*n as i64)
    } else {
        serializer.serialize_f64(*n)
    }
}

// ── Analysis ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Apply,
    Avoid,
    Watch,
    Error,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Apply => "APPLY",
            Decision::Avoid => "AVOID",
            Decision::Watch => "WATCH",
            Decision::Error => "ERROR",
        }
    }

    pub fn parse_loose(input: &str) -> Option<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "APPLY" => Some(Decision::Apply),
            "AVOID" => Some(Decision::Avoid),
            "WATCH" => Some(Decision::Watch),
            "ERROR" => Some(Decision::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scored recommendation from the analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisItem {
    pub company: String,
    pub decision: Decision,
    pub score: u8,
    pub reason: String,
}

impl AnalysisItem {
    /// Stand-in result when the analysis call itself failed.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            company: "Error".to_string(),
            decision: Decision::Error,
            score: 0,
            reason: reason.into(),
        }
    }

    /// Lenient read of one model-produced object. Items without a company are
    /// discarded; an unrecognised decision reads as WATCH.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let company = obj
            .get("company")
            .or_else(|| obj.get("company_name"))
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        let decision = obj
            .get("decision")
            .and_then(JsonValue::as_str)
            .and_then(Decision::parse_loose)
            .unwrap_or(Decision::Watch);
        let score = obj
            .get("score")
            .and_then(FieldValue::from_json)
            .and_then(|v| v.as_number())
            .map(|n| n.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(0);
        let reason = obj
            .get("reason")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        Some(Self {
            company,
            decision,
            score,
            reason,
        })
    }
}
