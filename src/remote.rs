//! Client for the remote ledger service.
//!
//! The orchestrator only sees the `RemoteClient` trait; the blocking HTTP
//! implementation lives here too. Pagination follows RFC 5988 `Link`
//! headers, requests pass through a token-bucket rate limiter, and 429/5xx
//! responses are retried up to [`MAX_RETRIES`] times with `Retry-After`
//! honored when present.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dates::DateWindow;
use crate::error::{FinchError, Result};
use crate::models::{Account, AccountType, Category, Transaction};
use crate::notes;

pub const MAX_RETRIES: u32 = 3;
const PER_PAGE: u32 = 1000;
const DEFAULT_BACKOFF_MS: u64 = 500;

/// Interface the orchestrator consumes. `&self` methods so push can fan out
/// PATCHes across scoped threads.
pub trait RemoteClient: Sync {
    fn get_accounts(&self) -> Result<Vec<Account>>;
    fn get_categories(&self) -> Result<Vec<Category>>;
    fn get_transactions(
        &self,
        window: &DateWindow,
        updated_since: Option<NaiveDateTime>,
    ) -> Result<Vec<Transaction>>;
    fn get_transaction(&self, id: i64) -> Result<Option<Transaction>>;
    fn patch_transaction(&self, id: i64, patch: &TransactionPatch) -> Result<()>;
}

/// Body of a `PATCH /transactions/{id}`; only changed fields are sent.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TransactionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_review: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_transfer: Option<bool>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        *self == TransactionPatch::default()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    id: i64,
    title: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    currency_code: String,
    #[serde(default)]
    starting_balance: Option<Decimal>,
    #[serde(default)]
    starting_balance_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    id: i64,
    title: String,
    #[serde(default)]
    parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireCategoryRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    id: i64,
    date: NaiveDate,
    amount: Decimal,
    currency_code: String,
    #[serde(default)]
    transaction_account_id: Option<i64>,
    #[serde(default)]
    category: Option<WireCategoryRef>,
    #[serde(default)]
    payee: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    needs_review: bool,
    #[serde(default)]
    is_transfer: bool,
    #[serde(default)]
    closing_balance: Option<Decimal>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl WireTransaction {
    fn into_model(self) -> Transaction {
        let parsed = notes::parse(self.note.as_deref().unwrap_or(""));
        let mut metadata = parsed.annotations;
        let paired_id = metadata
            .remove("paired")
            .and_then(|v| v.parse::<i64>().ok());
        let suspect_reason = metadata.remove("suspect_reason").filter(|s| !s.is_empty());

        Transaction {
            id: self.id,
            date: self.date,
            amount: self.amount,
            currency: self.currency_code.to_uppercase(),
            account_id: self.transaction_account_id.unwrap_or_default(),
            category_id: self.category.map(|c| c.id),
            payee: self.payee.unwrap_or_default(),
            narration: parsed.text,
            labels: self
                .labels
                .iter()
                .filter_map(|l| crate::models::normalize_label(l))
                .collect(),
            needs_review: self.needs_review,
            is_transfer: self.is_transfer,
            paired_id,
            suspect_reason,
            closing_balance: self.closing_balance,
            updated_at: self.updated_at,
            metadata,
        }
    }
}

/// Render a transaction's narration + annotations into the remote note field.
pub fn render_note(txn: &Transaction) -> String {
    let mut annotations: BTreeMap<String, String> = txn.metadata.clone();
    if let Some(paired) = txn.paired_id {
        annotations.insert("paired".to_string(), paired.to_string());
    }
    if let Some(reason) = &txn.suspect_reason {
        annotations.insert("suspect_reason".to_string(), reason.clone());
    }
    notes::serialize(&txn.narration, &annotations)
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Token bucket refilled continuously; `acquire` blocks until a token is
/// available.
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: u32) -> TokenBucket {
        TokenBucket {
            tokens: f64::from(tokens_per_second),
            max_tokens: f64::from(tokens_per_second),
            refill_rate: f64::from(tokens_per_second),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(wait_secs))
        }
    }
}

/// Parse a `Retry-After` header value in delay-seconds form.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Parse an RFC 5988 `Link` header into rel → URL.
pub fn parse_link_header(header: &str) -> BTreeMap<String, String> {
    let mut links = BTreeMap::new();
    for part in header.split(',') {
        let mut sections = part.trim().splitn(2, ';');
        let Some(url_part) = sections.next() else {
            continue;
        };
        let Some(rel_part) = sections.next() else {
            continue;
        };
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        if !url.starts_with("http://") && !url.starts_with("https://") {
            continue;
        }
        let rel = rel_part
            .trim()
            .strip_prefix("rel=")
            .map(|r| r.trim_matches('"'));
        if let Some(rel) = rel {
            links.insert(rel.to_string(), url.to_string());
        }
    }
    links
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemoteClient {
    base_url: String,
    token: String,
    client: Client,
    bucket: Mutex<TokenBucket>,
    user_id: Mutex<Option<i64>>,
}

impl HttpRemoteClient {
    pub fn new(base_url: &str, token: &str) -> Result<HttpRemoteClient> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FinchError::Remote(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpRemoteClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
            bucket: Mutex::new(TokenBucket::new(10)),
            user_id: Mutex::new(None),
        })
    }

    fn wait_for_token(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                bucket.try_acquire().err()
            };
            match wait {
                None => return,
                Some(duration) => {
                    debug!(wait_ms = duration.as_millis() as u64, "rate limited, waiting");
                    std::thread::sleep(duration);
                }
            }
        }
    }

    /// Issue one request with rate limiting and bounded retries. `send` is
    /// re-invoked on each attempt.
    fn execute<F>(&self, describe: &str, send: F) -> Result<Response>
    where
        F: Fn(&Client) -> reqwest::Result<Response>,
    {
        let mut attempt = 0u32;
        loop {
            self.wait_for_token();
            let response = send(&self.client);
            attempt += 1;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    if attempt > MAX_RETRIES {
                        return Err(FinchError::Remote(format!("{describe}: {e}")));
                    }
                    warn!(attempt, error = %e, "request failed, retrying");
                    std::thread::sleep(Duration::from_millis(
                        DEFAULT_BACKOFF_MS * u64::from(attempt),
                    ));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(FinchError::RemoteAuth(format!("{describe}: HTTP {status}")));
            }

            let retryable =
                status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable || attempt > MAX_RETRIES {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(FinchError::RateLimited {
                        attempts: attempt,
                        message: describe.to_string(),
                    });
                }
                return Err(FinchError::Remote(format!("{describe}: HTTP {status}")));
            }

            let wait = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(Duration::from_millis(DEFAULT_BACKOFF_MS * u64::from(attempt)));
            warn!(attempt, status = %status, wait_ms = wait.as_millis() as u64, "retrying after backoff");
            std::thread::sleep(wait);
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token.clone();
        let response = self.execute(&format!("GET {url}"), |client| {
            client
                .get(url)
                .header("X-Developer-Key", &token)
                .header("Accept", "application/json")
                .send()
        })?;
        response
            .json::<T>()
            .map_err(|e| FinchError::Remote(format!("malformed response from {url}: {e}")))
    }

    fn user_id(&self) -> Result<i64> {
        if let Some(id) = *self.user_id.lock().unwrap() {
            return Ok(id);
        }
        let user: WireUser = self.get_json(&format!("{}/me", self.base_url))?;
        *self.user_id.lock().unwrap() = Some(user.id);
        Ok(user.id)
    }

    fn transactions_url(
        &self,
        user_id: i64,
        window: &DateWindow,
        updated_since: Option<NaiveDateTime>,
    ) -> String {
        let mut url = format!(
            "{}/users/{user_id}/transactions?per_page={PER_PAGE}",
            self.base_url
        );
        if let Some(from) = window.from {
            url.push_str(&format!("&start_date={}", from.format("%Y-%m-%d")));
        }
        if let Some(to) = window.to {
            url.push_str(&format!("&end_date={}", to.format("%Y-%m-%d")));
        }
        if let Some(since) = updated_since {
            url.push_str(&format!("&updated_since={}", since.format("%Y-%m-%dT%H:%M:%SZ")));
        }
        url
    }
}

impl RemoteClient for HttpRemoteClient {
    fn get_accounts(&self) -> Result<Vec<Account>> {
        let user_id = self.user_id()?;
        let wire: Vec<WireAccount> =
            self.get_json(&format!("{}/users/{user_id}/transaction_accounts", self.base_url))?;
        Ok(wire
            .into_iter()
            .map(|a| Account {
                id: a.id,
                display_name: a.title,
                account_type: a
                    .kind
                    .as_deref()
                    .and_then(AccountType::parse)
                    .unwrap_or(AccountType::Asset),
                currency: a.currency_code.to_uppercase(),
                opening_date: a.starting_balance_date,
                opening_balance: a.starting_balance,
            })
            .collect())
    }

    fn get_categories(&self) -> Result<Vec<Category>> {
        let user_id = self.user_id()?;
        let wire: Vec<WireCategory> =
            self.get_json(&format!("{}/users/{user_id}/categories", self.base_url))?;
        Ok(wire
            .into_iter()
            .map(|c| Category {
                id: c.id,
                title: c.title,
                parent_id: c.parent_id,
            })
            .collect())
    }

    fn get_transactions(
        &self,
        window: &DateWindow,
        updated_since: Option<NaiveDateTime>,
    ) -> Result<Vec<Transaction>> {
        let user_id = self.user_id()?;
        let mut url = self.transactions_url(user_id, window, updated_since);
        let mut all = Vec::new();

        loop {
            let token = self.token.clone();
            let request_url = url.clone();
            let response = self.execute(&format!("GET {request_url}"), |client| {
                client
                    .get(&request_url)
                    .header("X-Developer-Key", &token)
                    .header("Accept", "application/json")
                    .send()
            })?;

            let next = response
                .headers()
                .get("Link")
                .and_then(|v| v.to_str().ok())
                .map(parse_link_header)
                .and_then(|links| links.get("next").cloned());

            let page: Vec<WireTransaction> = response.json().map_err(|e| {
                FinchError::Remote(format!("malformed response from {request_url}: {e}"))
            })?;
            debug!(count = page.len(), "fetched transaction page");
            all.extend(page.into_iter().map(WireTransaction::into_model));

            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }

        Ok(all)
    }

    fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let url = format!("{}/transactions/{id}", self.base_url);
        let token = self.token.clone();
        let result = self.execute(&format!("GET {url}"), |client| {
            client
                .get(&url)
                .header("X-Developer-Key", &token)
                .header("Accept", "application/json")
                .send()
        });
        match result {
            Ok(response) => {
                let wire: WireTransaction = response.json().map_err(|e| {
                    FinchError::Remote(format!("malformed response from {url}: {e}"))
                })?;
                Ok(Some(wire.into_model()))
            }
            Err(FinchError::Remote(msg)) if msg.contains("HTTP 404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn patch_transaction(&self, id: i64, patch: &TransactionPatch) -> Result<()> {
        let url = format!("{}/transactions/{id}", self.base_url);
        let token = self.token.clone();
        self.execute(&format!("PATCH {url}"), |client| {
            client
                .patch(&url)
                .header("X-Developer-Key", &token)
                .header("Accept", "application/json")
                .json(patch)
                .send()
        })?;
        Ok(())
    }
}
