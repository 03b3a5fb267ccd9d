//! Declarative vendor mapping documents.
//!
//! A mapping turns one vendor's HTTP API into the fixed operation set the
//! rest of the system understands. Mappings are JSON documents stored on the
//! vendor row; a loaded mapping is immutable for the lifetime of an adapter
//! (and therefore within a sync run).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::ErrorKind;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Full per-vendor mapping document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorMapping {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Base URL joined with each operation's relative `url`.
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthRecipe,
    /// Vendor's native currency (ISO code).
    pub currency: String,
    #[serde(default)]
    pub deposit_currency: Option<String>,
    /// Client-side cap honored by the adapter's rate limiter.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    pub operations: Operations,
}

fn default_version() -> u32 {
    1
}

impl VendorMapping {
    pub fn timeout_ms(&self, op: &OperationSpec) -> u64 {
        op.timeout_ms
            .or(self.default_timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

/// The declared operations. Absent entries mean the vendor does not support
/// that operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operations {
    #[serde(default)]
    pub list_countries: Option<OperationSpec>,
    #[serde(default)]
    pub list_services: Option<OperationSpec>,
    #[serde(default)]
    pub list_prices: Option<OperationSpec>,
    #[serde(default)]
    pub buy: Option<OperationSpec>,
    #[serde(default)]
    pub status: Option<OperationSpec>,
    #[serde(default)]
    pub cancel: Option<OperationSpec>,
    #[serde(default)]
    pub resend: Option<OperationSpec>,
    #[serde(default)]
    pub complete: Option<OperationSpec>,
    #[serde(default)]
    pub balance: Option<OperationSpec>,
}

/// How credentials are attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRecipe {
    #[default]
    None,
    /// `?{param}={key}` appended to the query string.
    QueryKey { param: String, key: String },
    /// `Authorization: Bearer {token}`.
    Bearer { token: String },
    /// Arbitrary static header.
    Header { name: String, value: String },
}

/// How the request payload is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEncoding {
    #[default]
    Query,
    Form,
    Json,
}

/// How the response body is decoded before field extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseDecoding {
    Json,
    /// Delimited text records, e.g. `ACCESS_NUMBER:123:79991112233`.
    KeyValue {
        #[serde(default = "default_record_sep")]
        record_sep: String,
        #[serde(default = "default_field_sep")]
        field_sep: String,
    },
    Csv {
        #[serde(default = "default_csv_delim")]
        delimiter: char,
        #[serde(default)]
        has_header: bool,
    },
}

impl Default for ResponseDecoding {
    fn default() -> Self {
        ResponseDecoding::Json
    }
}

fn default_record_sep() -> String {
    "\n".into()
}

fn default_field_sep() -> String {
    ":".into()
}

fn default_csv_delim() -> char {
    ';'
}

/// Shape of a list response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListLayout {
    /// Root is an array of row objects.
    #[default]
    Rows,
    /// Root is an object; each key is the external id, each value a row.
    KeyedRows,
    /// Prices only: root is `{country: {service: leaf}}`; the two map keys
    /// become the row's country and service.
    CountryServiceMap,
}

/// Where the interesting data lives in a decoded response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseShape {
    /// Dot path from the document root to the payload (list or object).
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub layout: ListLayout,
    /// Logical field name -> selector path relative to each row (or to the
    /// payload for scalar operations).
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Maps a raw response onto an error kind. Rules run in order; the first
/// match wins. A rule with neither `status` nor `matches` never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRule {
    #[serde(default)]
    pub status: Option<u16>,
    /// Regex applied to the raw response body.
    #[serde(default)]
    pub matches: Option<String>,
    pub kind: ErrorKind,
}

/// Pagination hints for list operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageHint {
    /// Query parameter carrying the page number (0-based).
    pub param: String,
    #[serde(default)]
    pub size_param: Option<String>,
    #[serde(default = "default_page_size")]
    pub size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    50
}

/// One declared HTTP operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    #[serde(default = "default_method")]
    pub method: String,
    /// Path template with `{placeholders}`, joined on the mapping base URL
    /// unless absolute.
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query parameter templates, always appended.
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub encoding: RequestEncoding,
    /// Body template for `form`/`json` encodings; string leaves are bound.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub decoding: ResponseDecoding,
    #[serde(default)]
    pub response: ResponseShape,
    #[serde(default)]
    pub errors: Vec<ErrorRule>,
    /// Vendor status value -> canonical activation state, for `status`.
    #[serde(default)]
    pub status_map: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub page: Option<PageHint>,
    /// Advisory wait for `RATE_LIMITED`, surfaced on the typed error.
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".into()
}
