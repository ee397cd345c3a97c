//! Request key generation
//!
//! Cache keys are pure functions of the query criteria. Each present field is
//! written as a tagged component (`c:`, `p:`, `s:`, `dr:`, `st:`, `pg:`, `ps:`,
//! `so:`) in a fixed order and joined with `|`; absent fields are omitted.
//! Delimiter characters inside values are percent-escaped so no value can forge
//! a component boundary.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// Namespace for paginated list queries
pub const LIST_NAMESPACE: &str = "oos:list";
/// Namespace for count queries
pub const COUNT_NAMESPACE: &str = "oos:count";
/// Namespace used to group all pages of one list query
pub const FAMILY_NAMESPACE: &str = "oos:family";

/// A string uniquely identifying one cached query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for CacheKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Lifecycle status of an out-of-stock record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfStockStatus {
    Pending,
    Completed,
    Returned,
}

impl OutOfStockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Returned => "returned",
        }
    }
}

/// Requested ordering of list results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    CustomerName,
    ProductName,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewestFirst => "newest",
            Self::OldestFirst => "oldest",
            Self::CustomerName => "customer",
            Self::ProductName => "product",
        }
    }
}

/// Filter, pagination and sort criteria for out-of-stock queries
///
/// Values are normalised as they are set, so two criteria built from the same
/// logical inputs in any order compare equal and derive identical keys.
///
/// ```rust
/// use lopan_cache::keys::{OutOfStockFilterCriteria, OutOfStockStatus};
///
/// let a = OutOfStockFilterCriteria::new()
///     .customer("C-42")
///     .status(OutOfStockStatus::Pending)
///     .page(1);
/// let b = OutOfStockFilterCriteria::new()
///     .page(1)
///     .status(OutOfStockStatus::Pending)
///     .customer("  C-42 ");
/// assert_eq!(a.list_key(), b.list_key());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawCriteria")]
pub struct OutOfStockFilterCriteria {
    customer_id: Option<String>,
    product_id: Option<String>,
    status: Option<OutOfStockStatus>,
    date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    search_text: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort_order: Option<SortOrder>,
}

impl OutOfStockFilterCriteria {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn customer(mut self, customer_id: impl AsRef<str>) -> Self {
        self.customer_id = normalize_id(customer_id.as_ref());
        self
    }

    #[must_use]
    pub fn product(mut self, product_id: impl AsRef<str>) -> Self {
        self.product_id = normalize_id(product_id.as_ref());
        self
    }

    #[must_use]
    pub fn status(mut self, status: OutOfStockStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to a date range; bounds are converted to UTC and ordered
    #[must_use]
    pub fn date_range<Tz: TimeZone>(mut self, start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        let start = start.with_timezone(&Utc);
        let end = end.with_timezone(&Utc);
        self.date_range = Some(if start <= end { (start, end) } else { (end, start) });
        self
    }

    #[must_use]
    pub fn search(mut self, text: impl AsRef<str>) -> Self {
        self.search_text = normalize_search(text.as_ref());
        self
    }

    #[must_use]
    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn sort(mut self, order: SortOrder) -> Self {
        self.sort_order = Some(order);
        self
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    pub fn status_filter(&self) -> Option<OutOfStockStatus> {
        self.status
    }

    pub fn date_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.date_range
    }

    pub fn search_text(&self) -> Option<&str> {
        self.search_text.as_deref()
    }

    pub fn page_number(&self) -> Option<u32> {
        self.page
    }

    pub fn page_size_value(&self) -> Option<u32> {
        self.page_size
    }

    pub fn sort_order(&self) -> Option<SortOrder> {
        self.sort_order
    }

    pub fn list_key(&self) -> CacheKey {
        derive_list_key(self)
    }

    pub fn count_key(&self) -> CacheKey {
        derive_count_key(self)
    }

    /// Key shared by every page of this query (pagination and sort stripped)
    pub fn family_key(&self) -> CacheKey {
        let mut writer = KeyWriter::new(FAMILY_NAMESPACE);
        self.write_filters(&mut writer);
        writer.finish()
    }

    fn write_filters(&self, writer: &mut KeyWriter) {
        if let Some(customer) = &self.customer_id {
            writer.push("c", customer);
        }
        if let Some(product) = &self.product_id {
            writer.push("p", product);
        }
        if let Some(status) = self.status {
            writer.push("s", status.as_str());
        }
        if let Some((start, end)) = &self.date_range {
            writer.push_range("dr", &format_instant(start), &format_instant(end));
        }
        if let Some(search) = &self.search_text {
            writer.push("st", search);
        }
    }
}

/// Wire form of [`OutOfStockFilterCriteria`]; replayed through the builder so
/// deserialized criteria are normalised exactly like built ones
#[derive(Deserialize)]
struct RawCriteria {
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    status: Option<OutOfStockStatus>,
    #[serde(default)]
    date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default)]
    search_text: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
    #[serde(default)]
    sort_order: Option<SortOrder>,
}

impl From<RawCriteria> for OutOfStockFilterCriteria {
    fn from(raw: RawCriteria) -> Self {
        let mut criteria = Self::new();
        if let Some(customer) = raw.customer_id {
            criteria = criteria.customer(customer);
        }
        if let Some(product) = raw.product_id {
            criteria = criteria.product(product);
        }
        if let Some(status) = raw.status {
            criteria = criteria.status(status);
        }
        if let Some((start, end)) = raw.date_range {
            criteria = criteria.date_range(start, end);
        }
        if let Some(search) = raw.search_text {
            criteria = criteria.search(search);
        }
        if let Some(page) = raw.page {
            criteria = criteria.page(page);
        }
        if let Some(page_size) = raw.page_size {
            criteria = criteria.page_size(page_size);
        }
        if let Some(order) = raw.sort_order {
            criteria = criteria.sort(order);
        }
        criteria
    }
}

/// Key for a paginated list query
pub fn derive_list_key(criteria: &OutOfStockFilterCriteria) -> CacheKey {
    let mut writer = KeyWriter::new(LIST_NAMESPACE);
    criteria.write_filters(&mut writer);
    if let Some(page) = criteria.page {
        writer.push("pg", &page.to_string());
    }
    if let Some(size) = criteria.page_size {
        writer.push("ps", &size.to_string());
    }
    if let Some(order) = criteria.sort_order {
        writer.push("so", order.as_str());
    }
    writer.finish()
}

/// Key for a count query; pagination and sort never affect a count
pub fn derive_count_key(criteria: &OutOfStockFilterCriteria) -> CacheKey {
    let mut writer = KeyWriter::new(COUNT_NAMESPACE);
    criteria.write_filters(&mut writer);
    writer.finish()
}

struct KeyWriter {
    buf: String,
}

impl KeyWriter {
    fn new(namespace: &str) -> Self {
        Self {
            buf: namespace.to_owned(),
        }
    }

    fn push(&mut self, tag: &str, value: &str) {
        self.buf.push('|');
        self.buf.push_str(tag);
        self.buf.push(':');
        escape_into(&mut self.buf, value);
    }

    fn push_range(&mut self, tag: &str, start: &str, end: &str) {
        self.push(tag, start);
        self.buf.push('~');
        escape_into(&mut self.buf, end);
    }

    fn finish(self) -> CacheKey {
        CacheKey(self.buf)
    }
}

fn escape_into(buf: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '%' => buf.push_str("%25"),
            '|' => buf.push_str("%7C"),
            '~' => buf.push_str("%7E"),
            _ => buf.push(ch),
        }
    }
}

fn format_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn normalize_search(raw: &str) -> Option<String> {
    let collapsed = raw
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}
