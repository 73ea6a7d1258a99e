//! HTTP client for the spreadsheet values API.
//!
//! Exposes conditional range reads (`If-None-Match`/ETag), batch value
//! updates, row appends and range clears. The client itself never retries;
//! callers wrap it in their own retry/rate-limit policy.

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use async_trait::async_trait;
use sheetbridge_core::models::CellValue;
use sheetbridge_core::ports::{RangeRead, RangeValues, SpreadsheetPort};

use crate::error::{Result, SheetsError};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: u16,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ValueRangeBody {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Client for the spreadsheet values API.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl SheetsClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the API (e.g. `https://sheets.example.com`)
    /// * `token` - Bearer token; credential refresh is the caller's concern.
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| SheetsError::invalid_request("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("sheets API response status: {}", status);
            return;
        }
        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("sheets API response error ({}): {}", status, preview);
    }

    fn etag_of(headers: &HeaderMap) -> Option<String> {
        headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string())
    }

    fn error_from_body(status: StatusCode, body: &str) -> SheetsError {
        if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
            let code = if parsed.error.code > 0 {
                parsed.error.code
            } else {
                status.as_u16()
            };
            return SheetsError::api(code, parsed.error.message);
        }
        SheetsError::api(status.as_u16(), format!("Request failed: {body}"))
    }

    /// Parse a JSON response body, mapping non-2xx statuses to API errors.
    async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::error_from_body(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!("Failed to deserialize sheets response. Body: {body}, Error: {e}");
            SheetsError::api(status.as_u16(), format!("Failed to parse response: {e}"))
        })
    }

    /// Conditional read of a range.
    ///
    /// GET /v4/spreadsheets/{spreadsheetId}/values/{range}
    pub async fn get_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        if_none_match: Option<&str>,
    ) -> Result<RangeRead> {
        let url = format!("{}/v4/spreadsheets/{}/values/{}", self.base_url, spreadsheet_id, range);

        let mut headers = self.headers()?;
        if let Some(etag) = if_none_match {
            let value = HeaderValue::from_str(&format!("\"{etag}\""))
                .map_err(|_| SheetsError::invalid_request("Invalid ETag value"))?;
            headers.insert(IF_NONE_MATCH, value);
        }

        let response = self.client.get(&url).headers(headers).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            let etag = Self::etag_of(response.headers()).or_else(|| if_none_match.map(String::from));
            return Ok(RangeRead::NotModified { etag });
        }

        let etag = Self::etag_of(response.headers());
        let body: ValueRangeBody = Self::parse_response(response).await?;
        let grid = body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(CellValue::from).collect())
            .collect();
        Ok(RangeRead::Modified { grid, etag })
    }

    /// Batch update of value ranges.
    ///
    /// POST /v4/spreadsheets/{spreadsheetId}/values:batchUpdate
    pub async fn batch_update_values(
        &self,
        spreadsheet_id: &str,
        updates: &[RangeValues],
    ) -> Result<Option<String>> {
        let url = format!("{}/v4/spreadsheets/{}/values:batchUpdate", self.base_url, spreadsheet_id);

        let data: Vec<serde_json::Value> = updates
            .iter()
            .map(|update| {
                serde_json::json!({
                    "range": update.range,
                    "values": grid_to_json(&update.values),
                })
            })
            .collect();
        let body = serde_json::json!({
            "valueInputOption": "RAW",
            "data": data,
        });

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let etag = Self::etag_of(response.headers());
        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(etag)
    }

    /// Append rows after the last data row of a range.
    ///
    /// POST /v4/spreadsheets/{spreadsheetId}/values/{range}:append
    pub async fn append_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: &[Vec<CellValue>],
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}:append?valueInputOption=RAW",
            self.base_url, spreadsheet_id, range
        );
        let body = serde_json::json!({ "values": grid_to_json(rows) });

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let etag = Self::etag_of(response.headers());
        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(etag)
    }

    /// Clear every cell in a range; the rows themselves remain.
    ///
    /// POST /v4/spreadsheets/{spreadsheetId}/values/{range}:clear
    pub async fn clear_values(&self, spreadsheet_id: &str, range: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}:clear",
            self.base_url, spreadsheet_id, range
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let etag = Self::etag_of(response.headers());
        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(etag)
    }
}

fn grid_to_json(rows: &[Vec<CellValue>]) -> Vec<Vec<serde_json::Value>> {
    rows.iter()
        .map(|row| row.iter().map(|cell| cell.clone().into()).collect())
        .collect()
}

#[async_trait]
impl SpreadsheetPort for SheetsClient {
    async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
        if_none_match: Option<&str>,
    ) -> sheetbridge_core::Result<RangeRead> {
        Ok(self.get_range(spreadsheet_id, range, if_none_match).await?)
    }

    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        updates: Vec<RangeValues>,
    ) -> sheetbridge_core::Result<Option<String>> {
        Ok(self.batch_update_values(spreadsheet_id, &updates).await?)
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> sheetbridge_core::Result<Option<String>> {
        Ok(self.append_values(spreadsheet_id, range, &rows).await?)
    }

    async fn clear_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> sheetbridge_core::Result<Option<String>> {
        Ok(self.clear_values(spreadsheet_id, range).await?)
    }
}
