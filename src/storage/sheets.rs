//! Google Sheets v4 `SheetStore`.
//!
//! API: `https://sheets.googleapis.com/v4/spreadsheets/{id}/values`
//! Auth: service-account JWT (RS256) exchanged for an OAuth access token,
//! cached until shortly before it expires.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RowUpdate, SheetStore};
use crate::net::{send_json, CallError};
use crate::types::CellValue;

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for the signed assertion (Google's maximum).
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Service account
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// The parts of a service-account key file needed to mint tokens.
pub struct ServiceAccountKey {
    pub client_email: String,
    pub token_uri: String,
    private_key: Secret<String>,
}

impl ServiceAccountKey {
    /// Parse the JSON key file downloaded from the Google Cloud console.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawServiceAccount =
            serde_json::from_str(json).context("Service account JSON is malformed")?;

        if raw.client_email.trim().is_empty() {
            anyhow::bail!("Service account JSON has an empty client_email");
        }
        // Validate the key now so a bad key is a startup error.
        EncodingKey::from_rsa_pem(raw.private_key.as_bytes())
            .context("Service account private_key is not a valid RSA PEM key")?;

        Ok(Self {
            client_email: raw.client_email,
            token_uri: raw
                .token_uri
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            private_key: Secret::new(raw.private_key),
        })
    }

    fn assertion(&self) -> Result<String, CallError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| CallError::NonTransient(format!("invalid service account key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| CallError::NonTransient(format!("failed to sign assertion: {e}")))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct GoogleSheetsStore {
    http: Client,
    api_base: String,
    spreadsheet_id: String,
    key: ServiceAccountKey,
    token: Mutex<Option<CachedToken>>,
}

/// `'Tab Name'`, with embedded quotes doubled.
fn quoted_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn cell_json(value: &CellValue) -> Value {
    match value {
        CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Number(n) => json!(n),
    }
}

/// A1-notation column letters for a zero-based index: 0 → `A`, 26 → `AA`.
fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

impl GoogleSheetsStore {
    pub fn new(spreadsheet_id: impl Into<String>, key: ServiceAccountKey, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("market-explorer/0.1")
            .build()
            .context("Failed to build Sheets HTTP client")?;

        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            key,
            token: Mutex::new(None),
        })
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn values_url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values{}",
            self.api_base,
            urlencoding::encode(&self.spreadsheet_id),
            suffix
        )
    }

    /// A valid access token, minting a new one when the cached token is
    /// missing or about to expire.
    async fn access_token(&self) -> Result<String, CallError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at {
                return Ok(t.token.clone());
            }
        }

        let assertion = self.key.assertion()?;
        let body = send_json(
            self.http
                .post(&self.key.token_uri)
                .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())]),
        )
        .await?;
        let response: TokenResponse = serde_json::from_value(body)
            .map_err(|e| CallError::NonTransient(format!("unexpected token response: {e}")))?;

        debug!(expires_in = response.expires_in, "Sheets access token refreshed");

        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(response.access_token)
    }

    /// Send an authorised request. A 401 drops the cached token and is
    /// reported as transient so the retry mints a fresh one.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, CallError> {
        let token = self.access_token().await?;
        match send_json(request.bearer_auth(token)).await {
            Err(CallError::NonTransient(msg)) if msg.starts_with(&format!("HTTP {}", StatusCode::UNAUTHORIZED)) => {
                *self.token.lock().await = None;
                Err(CallError::Transient(msg))
            }
            other => other,
        }
    }
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, CallError> {
        let range = urlencoding::encode(&quoted_sheet(sheet)).into_owned();
        let url = self.values_url(&format!("/{range}"));
        let body = self
            .send(self.http.get(url).query(&[
                ("majorDimension", "ROWS"),
                ("valueRenderOption", "FORMATTED_VALUE"),
            ]))
            .await?;

        let rows = match body.get("values") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(rows)) => rows
                .iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect(),
            Some(_) => {
                return Err(CallError::NonTransient(
                    "Sheets `values` is not an array".to_string(),
                ))
            }
        };
        debug!(sheet, rows = rows.len(), "Sheet read");
        Ok(rows)
    }

    async fn write_rows(&self, sheet: &str, updates: &[RowUpdate]) -> Result<(), CallError> {
        let tab = quoted_sheet(sheet);
        let data: Vec<Value> = updates
            .iter()
            .flat_map(|u| {
                let tab = tab.as_str();
                u.runs().into_iter().map(move |(start, values)| {
                    let values: Vec<Value> = values.into_iter().map(cell_json).collect();
                    json!({
                        "range": format!("{tab}!{}{}", column_letter(start), u.row_index + 1),
                        "majorDimension": "ROWS",
                        "values": [values],
                    })
                })
            })
            .collect();

        let url = self.values_url(":batchUpdate");
        self.send(self.http.post(url).json(&json!({
            "valueInputOption": "RAW",
            "data": data,
        })))
        .await?;
        debug!(sheet, ranges = updates.len(), "Sheet batch update sent");
        Ok(())
    }

    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), CallError> {
        let range = urlencoding::encode(&quoted_sheet(sheet)).into_owned();
        let url = self.values_url(&format!("/{range}:append"));
        self.send(
            self.http
                .post(url)
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&json!({ "majorDimension": "ROWS", "values": [values] })),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
