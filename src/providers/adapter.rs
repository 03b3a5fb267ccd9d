//! The mapping-driven vendor adapter.
//!
//! One HTTP request per operation, vendor-declared timeout, error-in-body
//! conventions classified through the mapping's rules, and canonical
//! normalization applied on the way out. The adapter never retries; retry
//! policy belongs to the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::models::{
    ActivationState, ActivationStatus, BuyOptions, CatalogCountry, CatalogService, PriceEntry,
    Vendor,
};
use crate::registry::CanonicalRegistry;

use super::decode::{
    decode_body, iter_country_service, iter_rows, select_f64, select_i64, select_string,
};
use super::error::{ErrorKind, ProviderError};
use super::mapping::{
    AuthRecipe, ListLayout, OperationSpec, RequestEncoding, ResponseShape, VendorMapping,
};
use super::{Provider, VendorPurchase};

/// Client-side request budget over a one-minute window.
struct RateLimiter {
    per_minute: u32,
    used: u32,
    window_start: Instant,
}

impl RateLimiter {
    fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            used: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns how long the caller must wait before sending, if at all.
    fn reserve(&mut self) -> Duration {
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(60) {
            self.used = 0;
            self.window_start = Instant::now();
        }
        if self.used >= self.per_minute {
            let wait = Duration::from_secs(60).saturating_sub(elapsed);
            self.used = 1;
            self.window_start = Instant::now() + wait;
            wait
        } else {
            self.used += 1;
            Duration::ZERO
        }
    }
}

pub struct DynamicAdapter {
    vendor: Vendor,
    client: Client,
    registry: Arc<CanonicalRegistry>,
    limiter: Option<parking_lot::Mutex<RateLimiter>>,
}

impl DynamicAdapter {
    pub fn new(vendor: Vendor, registry: Arc<CanonicalRegistry>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("numbroker/1.0")
            .build()?;
        let limiter = vendor
            .mapping
            .requests_per_minute
            .map(|n| parking_lot::Mutex::new(RateLimiter::new(n.max(1))));
        Ok(Self {
            vendor,
            client,
            registry,
            limiter,
        })
    }

    fn mapping(&self) -> &VendorMapping {
        &self.vendor.mapping
    }

    fn op(&self, name: &str, spec: Option<&OperationSpec>) -> Result<OperationSpec, ProviderError> {
        spec.cloned().ok_or_else(|| {
            ProviderError::bad_request(
                &self.vendor.name,
                format!("operation {} not declared in mapping", name),
            )
        })
    }

    /// Bind `{placeholders}` in one template. Missing inputs fail before any
    /// HTTP is attempted.
    fn bind(&self, template: &str, inputs: &HashMap<&str, String>) -> Result<String, ProviderError> {
        bind_template(template, inputs)
            .map_err(|name| {
                ProviderError::bad_request(
                    &self.vendor.name,
                    format!("missing input for placeholder {{{}}}", name),
                )
            })
    }

    fn build_url(&self, spec: &OperationSpec, inputs: &HashMap<&str, String>) -> Result<String, ProviderError> {
        let path = self.bind(&spec.url, inputs)?;
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path);
        }
        let base = self.mapping().base_url.trim_end_matches('/');
        Ok(format!("{}/{}", base, path.trim_start_matches('/')))
    }

    /// Classify a response against the operation's rules, then fall back to
    /// HTTP status. Returns `Ok(())` for a clean 2xx.
    fn classify(
        &self,
        spec: &OperationSpec,
        status: u16,
        body: &str,
    ) -> Result<(), ProviderError> {
        for rule in &spec.errors {
            let status_ok = rule.status.map_or(rule.matches.is_some(), |s| s == status);
            let body_ok = match &rule.matches {
                Some(pattern) => match Regex::new(pattern) {
                    Ok(re) => re.is_match(body),
                    Err(e) => {
                        warn!(vendor = %self.vendor.name, pattern, "bad error rule regex: {}", e);
                        false
                    }
                },
                None => rule.status.is_some(),
            };
            if status_ok && body_ok {
                let snippet: String = body.chars().take(200).collect();
                return Err(ProviderError::new(rule.kind, &self.vendor.name, snippet)
                    .with_status(status)
                    .with_backoff(spec.backoff_ms));
            }
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(&self.vendor.name, status, body)
                .with_backoff(spec.backoff_ms));
        }
        Ok(())
    }

    /// Execute one declared operation and return the decoded body.
    async fn execute(
        &self,
        spec: &OperationSpec,
        inputs: &HashMap<&str, String>,
    ) -> Result<Value, ProviderError> {
        let url = self.build_url(spec, inputs)?;

        let mut query: Vec<(String, String)> = Vec::with_capacity(spec.query.len() + 1);
        for (k, template) in &spec.query {
            query.push((k.clone(), self.bind(template, inputs)?));
        }

        let mut headers: Vec<(String, String)> = Vec::with_capacity(spec.headers.len() + 1);
        for (k, template) in &spec.headers {
            headers.push((k.clone(), self.bind(template, inputs)?));
        }

        match &self.mapping().auth {
            AuthRecipe::None => {}
            AuthRecipe::QueryKey { param, key } => query.push((param.clone(), key.clone())),
            AuthRecipe::Bearer { token } => {
                headers.push(("Authorization".into(), format!("Bearer {}", token)))
            }
            AuthRecipe::Header { name, value } => headers.push((name.clone(), value.clone())),
        }

        let body = match &spec.body {
            Some(template) => Some(self.bind_body(template, inputs)?),
            None => None,
        };

        // Everything that can fail on inputs has failed by now; only the
        // wire remains.
        if let Some(limiter) = &self.limiter {
            let wait = limiter.lock().reserve();
            if !wait.is_zero() {
                debug!(vendor = %self.vendor.name, "rate limit: waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
        }

        let method = reqwest::Method::from_bytes(spec.method.as_bytes()).map_err(|_| {
            ProviderError::bad_request(
                &self.vendor.name,
                format!("invalid HTTP method {}", spec.method),
            )
        })?;

        let mut request = self.client.request(method, &url).query(&query);
        for (k, v) in &headers {
            request = request.header(k, v);
        }
        if let Some(body) = body {
            request = match spec.encoding {
                RequestEncoding::Json => request.json(&body),
                RequestEncoding::Form => {
                    request.form(&flatten_body(&body))
                }
                RequestEncoding::Query => request.query(&flatten_body(&body)),
            };
        }

        let op_timeout = Duration::from_millis(self.mapping().timeout_ms(spec));
        let response = match timeout(op_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(ProviderError::timeout(&self.vendor.name)),
            Ok(Err(e)) => {
                return Err(ProviderError::new(
                    ErrorKind::ServerError,
                    &self.vendor.name,
                    format!("transport error: {}", e),
                ))
            }
            Err(_) => return Err(ProviderError::timeout(&self.vendor.name)),
        };

        let status = response.status().as_u16();
        let text = match timeout(op_timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(ProviderError::new(
                    ErrorKind::ServerError,
                    &self.vendor.name,
                    format!("failed reading body: {}", e),
                ))
            }
            Err(_) => return Err(ProviderError::timeout(&self.vendor.name)),
        };

        self.classify(spec, status, &text)?;

        decode_body(&text, &spec.decoding).map_err(|e| {
            ProviderError::new(ErrorKind::Unknown, &self.vendor.name, e.to_string())
                .with_status(status)
        })
    }

    fn bind_body(
        &self,
        template: &Value,
        inputs: &HashMap<&str, String>,
    ) -> Result<Value, ProviderError> {
        match template {
            Value::String(s) => Ok(Value::String(self.bind(s, inputs)?)),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.bind_body(v, inputs))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.bind_body(v, inputs)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn field<'a>(shape: &'a ResponseShape, name: &str) -> Option<&'a str> {
        shape.fields.get(name).map(String::as_str)
    }

    /// Whether the operation's templates reference `{country}` anywhere.
    fn needs_country(spec: &OperationSpec) -> bool {
        let in_str = |s: &str| s.contains("{country}");
        in_str(&spec.url)
            || spec.query.values().any(|v| in_str(v))
            || spec.headers.values().any(|v| in_str(v))
            || spec
                .body
                .as_ref()
                .map(|b| b.to_string().contains("{country}"))
                .unwrap_or(false)
    }

    /// Execute one operation across its declared pages. Without a page hint
    /// this is a single call; with one, pages accumulate until an empty page
    /// or the page cap.
    async fn execute_pages(
        &self,
        spec: &OperationSpec,
        inputs: &HashMap<&str, String>,
    ) -> Result<Vec<Value>, ProviderError> {
        let Some(hint) = &spec.page else {
            return Ok(vec![self.execute(spec, inputs).await?]);
        };

        let mut pages = Vec::new();
        for page in 0..hint.max_pages {
            let mut page_spec = spec.clone();
            page_spec
                .query
                .insert(hint.param.clone(), page.to_string());
            if let Some(size_param) = &hint.size_param {
                page_spec
                    .query
                    .insert(size_param.clone(), hint.size.to_string());
            }
            let value = self.execute(&page_spec, inputs).await?;
            let empty = match spec.response.layout {
                ListLayout::CountryServiceMap => iter_country_service(&value, &spec.response)
                    .map(|rows| rows.is_empty())
                    .unwrap_or(true),
                _ => iter_rows(&value, &spec.response)
                    .map(|rows| rows.is_empty())
                    .unwrap_or(true),
            };
            if empty {
                break;
            }
            pages.push(value);
        }
        Ok(pages)
    }

    async fn list_services_with(
        &self,
        spec: &OperationSpec,
        country: &str,
    ) -> Result<Vec<CatalogService>, ProviderError> {
        let mut inputs = HashMap::new();
        inputs.insert("country", country.to_string());
        let mut out = Vec::new();
        for value in self.execute_pages(spec, &inputs).await? {
            out.extend(self.services_from(&value, spec)?);
        }
        Ok(out)
    }

    fn services_from(
        &self,
        value: &Value,
        spec: &OperationSpec,
    ) -> Result<Vec<CatalogService>, ProviderError> {
        let shape = &spec.response;
        let rows = iter_rows(value, shape).map_err(|e| self.shape_err(e))?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            let raw_name = Self::field(shape, "name")
                .and_then(|p| select_string(row, p))
                .unwrap_or_else(|| key.clone());
            let canonical = self.registry.canonical_service(&raw_name);
            let vendor_icon = Self::field(shape, "icon").and_then(|p| select_string(row, p));
            let icon_url = self.registry.resolve_icon(&canonical.code, vendor_icon);
            out.push(CatalogService {
                external_id: key,
                code: canonical.code,
                name: canonical.name,
                icon_url,
            });
        }
        Ok(out)
    }

    fn shape_err(&self, e: anyhow::Error) -> ProviderError {
        ProviderError::new(ErrorKind::Unknown, &self.vendor.name, e.to_string())
    }
}

/// Replace `{name}` placeholders from `inputs`; `Err` carries the first
/// missing placeholder name.
fn bind_template(template: &str, inputs: &HashMap<&str, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match inputs.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.to_string()),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return Ok(out);
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Flatten a bound body template into the string pairs form/query encodings
/// expect. Nested values are serialized as JSON strings.
fn flatten_body(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect(),
        _ => vec![],
    }
}

#[async_trait]
impl Provider for DynamicAdapter {
    fn slug(&self) -> &str {
        &self.vendor.name
    }

    fn vendor(&self) -> &Vendor {
        &self.vendor
    }

    async fn list_countries(&self) -> Result<Vec<CatalogCountry>, ProviderError> {
        let spec = self.op(
            "list_countries",
            self.mapping().operations.list_countries.as_ref(),
        )?;
        let shape = &spec.response;

        let mut out = Vec::new();
        for value in self.execute_pages(&spec, &HashMap::new()).await? {
            for (key, row) in iter_rows(&value, shape).map_err(|e| self.shape_err(e))? {
                let raw_name = Self::field(shape, "name")
                    .and_then(|p| select_string(row, p))
                    .unwrap_or_else(|| key.clone());
                let canonical = self.registry.canonical_country(&raw_name);
                let vendor_flag = Self::field(shape, "flag").and_then(|p| select_string(row, p));
                let flag_url = self.registry.resolve_icon(&canonical.code, vendor_flag);
                out.push(CatalogCountry {
                    external_id: key,
                    code: canonical.code,
                    name: canonical.name,
                    iso2: canonical.iso2,
                    flag_url,
                });
            }
        }
        Ok(out)
    }

    async fn list_services(
        &self,
        country: Option<&str>,
    ) -> Result<Vec<CatalogService>, ProviderError> {
        let spec = self.op(
            "list_services",
            self.mapping().operations.list_services.as_ref(),
        )?;

        if let Some(country) = country {
            return self.list_services_with(&spec, country).await;
        }
        if !Self::needs_country(&spec) {
            return self.list_services_with(&spec, "").await;
        }

        // The vendor insists on a country we don't have: fall back through
        // "", "us", then its own first country.
        let mut last_err = None;
        for candidate in ["", "us"] {
            match self.list_services_with(&spec, candidate).await {
                Ok(services) => return Ok(services),
                Err(e) => last_err = Some(e),
            }
        }
        if let Ok(countries) = self.list_countries().await {
            if let Some(first) = countries.first() {
                return self.list_services_with(&spec, &first.external_id).await;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ProviderError::new(
                ErrorKind::Unknown,
                &self.vendor.name,
                "no country candidate yielded services",
            )
        }))
    }

    async fn list_prices(&self, country: Option<&str>) -> Result<Vec<PriceEntry>, ProviderError> {
        let spec = self.op(
            "list_prices",
            self.mapping().operations.list_prices.as_ref(),
        )?;
        let mut inputs = HashMap::new();
        if let Some(country) = country {
            inputs.insert("country", country.to_string());
        } else if Self::needs_country(&spec) {
            inputs.insert("country", String::new());
        }
        let shape = &spec.response;

        let mut out = Vec::new();
        for value in self.execute_pages(&spec, &inputs).await? {
            if shape.layout == ListLayout::CountryServiceMap {
                for (country_key, service_key, leaf) in
                    iter_country_service(&value, shape).map_err(|e| self.shape_err(e))?
                {
                    let raw_price = Self::field(shape, "price")
                        .and_then(|p| select_f64(leaf, p))
                        .unwrap_or(0.0);
                    let count = Self::field(shape, "count")
                        .and_then(|p| select_i64(leaf, p))
                        .unwrap_or(0);
                    if count <= 0 {
                        continue;
                    }
                    let operator =
                        Self::field(shape, "operator").and_then(|p| select_string(leaf, p));
                    out.push(PriceEntry {
                        country: country_key.to_lowercase(),
                        service: self.registry.canonical_service(&service_key).code,
                        operator,
                        raw_price,
                        count,
                    });
                }
            } else {
                for (key, row) in iter_rows(&value, shape).map_err(|e| self.shape_err(e))? {
                    let country_key = Self::field(shape, "country")
                        .and_then(|p| select_string(row, p))
                        .or_else(|| country.map(|c| c.to_string()))
                        .unwrap_or(key);
                    let service_key = Self::field(shape, "service")
                        .and_then(|p| select_string(row, p))
                        .unwrap_or_default();
                    let raw_price = Self::field(shape, "price")
                        .and_then(|p| select_f64(row, p))
                        .unwrap_or(0.0);
                    let count = Self::field(shape, "count")
                        .and_then(|p| select_i64(row, p))
                        .unwrap_or(0);
                    if count <= 0 || service_key.is_empty() {
                        continue;
                    }
                    let operator =
                        Self::field(shape, "operator").and_then(|p| select_string(row, p));
                    out.push(PriceEntry {
                        country: country_key.to_lowercase(),
                        service: self.registry.canonical_service(&service_key).code,
                        operator,
                        raw_price,
                        count,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn buy(
        &self,
        country: &str,
        service: &str,
        opts: &BuyOptions,
    ) -> Result<VendorPurchase, ProviderError> {
        let spec = self.op("buy", self.mapping().operations.buy.as_ref())?;
        let mut inputs = HashMap::new();
        inputs.insert("country", country.to_string());
        inputs.insert("service", service.to_string());
        if let Some(operator) = &opts.operator {
            inputs.insert("operator", operator.clone());
        }
        let value = self.execute(&spec, &inputs).await?;
        let shape = &spec.response;

        let id = Self::field(shape, "id")
            .and_then(|p| select_string(&value, p))
            .ok_or_else(|| {
                ProviderError::new(
                    ErrorKind::Unknown,
                    &self.vendor.name,
                    "purchase response missing activation id",
                )
            })?;
        let phone = Self::field(shape, "phone")
            .and_then(|p| select_string(&value, p))
            .unwrap_or_default();
        Ok(VendorPurchase { id, phone })
    }

    async fn status(&self, activation_id: &str) -> Result<ActivationStatus, ProviderError> {
        let spec = self.op("status", self.mapping().operations.status.as_ref())?;
        let mut inputs = HashMap::new();
        inputs.insert("id", activation_id.to_string());
        let value = self.execute(&spec, &inputs).await?;
        let shape = &spec.response;

        let raw_state = Self::field(shape, "status")
            .and_then(|p| select_string(&value, p))
            .unwrap_or_default();
        let mapped = spec
            .status_map
            .get(&raw_state)
            .map(String::as_str)
            .unwrap_or(raw_state.as_str());
        let state = match mapped {
            "sms_received" => ActivationState::SmsReceived,
            "canceled" => ActivationState::Canceled,
            "completed" => ActivationState::Completed,
            "expired" => ActivationState::Expired,
            _ => ActivationState::WaitingSms,
        };

        let sms = match Self::field(shape, "sms").and_then(|p| super::decode::select(&value, p)) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        };

        Ok(ActivationStatus { state, sms })
    }

    async fn cancel(&self, activation_id: &str) -> Result<(), ProviderError> {
        let spec = self.op("cancel", self.mapping().operations.cancel.as_ref())?;
        let mut inputs = HashMap::new();
        inputs.insert("id", activation_id.to_string());
        self.execute(&spec, &inputs).await.map(|_| ())
    }

    async fn resend(&self, activation_id: &str) -> Result<(), ProviderError> {
        let spec = self.op("resend", self.mapping().operations.resend.as_ref())?;
        let mut inputs = HashMap::new();
        inputs.insert("id", activation_id.to_string());
        self.execute(&spec, &inputs).await.map(|_| ())
    }

    async fn complete(&self, activation_id: &str) -> Result<(), ProviderError> {
        let spec = self.op("complete", self.mapping().operations.complete.as_ref())?;
        let mut inputs = HashMap::new();
        inputs.insert("id", activation_id.to_string());
        self.execute(&spec, &inputs).await.map(|_| ())
    }

    async fn balance(&self) -> Result<f64, ProviderError> {
        let spec = self.op("balance", self.mapping().operations.balance.as_ref())?;
        let value = self.execute(&spec, &HashMap::new()).await?;
        Self::field(&spec.response, "balance")
            .and_then(|p| select_f64(&value, p))
            .ok_or_else(|| {
                ProviderError::new(
                    ErrorKind::Unknown,
                    &self.vendor.name,
                    "balance response missing balance field",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mapping::ErrorRule;
    use crate::test_support::{adapter_fixture, vendor_fixture};

    #[test]
    fn bind_template_replaces_and_reports_missing() {
        let inputs = HashMap::from([("country", "us".to_string()), ("service", "wa".to_string())]);
        assert_eq!(
            bind_template("/buy?c={country}&s={service}", &inputs).unwrap(),
            "/buy?c=us&s=wa"
        );
        assert_eq!(
            bind_template("/x/{operator}", &inputs),
            Err("operator".to_string())
        );
        assert_eq!(bind_template("/plain", &inputs).unwrap(), "/plain");
    }

    #[test]
    fn missing_placeholder_is_bad_request_before_any_call() {
        let adapter = adapter_fixture(vendor_fixture("v1"));
        let spec = OperationSpec {
            url: "/buy/{country}/{service}/{operator}".into(),
            ..crate::test_support::op_fixture()
        };
        let inputs = HashMap::from([("country", "us".to_string()), ("service", "wa".to_string())]);
        let err = adapter.build_url(&spec, &inputs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn url_joining() {
        let adapter = adapter_fixture(vendor_fixture("v1"));
        let spec = OperationSpec {
            url: "/countries".into(),
            ..crate::test_support::op_fixture()
        };
        let url = adapter.build_url(&spec, &HashMap::new()).unwrap();
        assert_eq!(url, "https://api.vendor.test/countries");

        let absolute = OperationSpec {
            url: "https://other.test/x".into(),
            ..crate::test_support::op_fixture()
        };
        assert_eq!(
            adapter.build_url(&absolute, &HashMap::new()).unwrap(),
            "https://other.test/x"
        );
    }

    #[test]
    fn body_error_rules_win_over_http_status() {
        let adapter = adapter_fixture(vendor_fixture("v1"));
        let spec = OperationSpec {
            errors: vec![
                ErrorRule {
                    status: None,
                    matches: Some("NO_NUMBERS".into()),
                    kind: ErrorKind::NoStock,
                },
                ErrorRule {
                    status: None,
                    matches: Some("NO_BALANCE|NO_MONEY".into()),
                    kind: ErrorKind::NoBalance,
                },
                ErrorRule {
                    status: Some(418),
                    matches: None,
                    kind: ErrorKind::RateLimited,
                },
            ],
            ..crate::test_support::op_fixture()
        };

        // Error-in-body convention on a 200.
        let err = adapter.classify(&spec, 200, "NO_NUMBERS").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoStock);

        let err = adapter.classify(&spec, 200, "NO_MONEY").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoBalance);

        let err = adapter.classify(&spec, 418, "teapot").unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);

        // Unmatched non-2xx falls back to status classification.
        let err = adapter.classify(&spec, 503, "oops").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);

        assert!(adapter.classify(&spec, 200, "ok").is_ok());
    }

    #[test]
    fn needs_country_detection() {
        let with = OperationSpec {
            url: "/svc".into(),
            query: HashMap::from([("country".to_string(), "{country}".to_string())]),
            ..crate::test_support::op_fixture()
        };
        let without = OperationSpec {
            url: "/svc".into(),
            ..crate::test_support::op_fixture()
        };
        assert!(DynamicAdapter::needs_country(&with));
        assert!(!DynamicAdapter::needs_country(&without));
    }

    #[test]
    fn rate_limiter_reserve_window() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.reserve().is_zero());
        assert!(limiter.reserve().is_zero());
        assert!(!limiter.reserve().is_zero());
    }
}
