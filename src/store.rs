//! Time-series store access (InfluxDB v2 query API).

use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION},
    Client, StatusCode,
};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::InfluxConfig;
use crate::error::ReconcileError;

/// A store that can run a Flux query and hand back the `_value` column.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// `_value` of every returned row, in response order. No rows is a valid,
    /// non-error answer.
    async fn query_values(&self, flux: &str) -> Result<Vec<i64>, ReconcileError>;
}

/// HTTP client for `POST /api/v2/query`.
///
/// Owns its connection pool; the pool is released when the store is dropped
/// at the end of the run that created it.
pub struct InfluxStore {
    client: Client,
    query_url: String,
    org: String,
    token: String,
}

impl InfluxStore {
    pub fn connect(config: &InfluxConfig) -> Result<Self, ReconcileError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| ReconcileError::Config(format!("failed to build InfluxDB client: {}", e)))?;

        debug!(url = %config.url, org = %config.org, "Opened InfluxDB client");

        Ok(Self {
            client,
            query_url: format!("{}/api/v2/query", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            token: config.token.clone(),
        })
    }
}

impl Drop for InfluxStore {
    fn drop(&mut self) {
        debug!(url = %self.query_url, "Closing InfluxDB client");
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn query_values(&self, flux: &str) -> Result<Vec<i64>, ReconcileError> {
        let resp = self
            .client
            .post(&self.query_url)
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/csv")
            .json(&json!({ "query": flux, "type": "flux" }))
            .send()
            .await
            .map_err(|e| ReconcileError::from_request("POST /api/v2/query", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ReconcileError::from_request("reading query response", e))?;

        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ReconcileError::Auth(format!("InfluxDB {}: {}", status, body))
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    ReconcileError::Transport(format!("InfluxDB {}: {}", status, body))
                }
                s if s.is_client_error() => {
                    ReconcileError::Query(format!("InfluxDB {}: {}", status, body))
                }
                _ => ReconcileError::Transport(format!("InfluxDB {}: {}", status, body)),
            });
        }

        parse_annotated_csv(&body)
    }
}

/// Pull the `_value` column out of an (annotated) CSV query response.
///
/// Each table starts with its own header row; tables are separated by blank
/// lines and annotation rows start with `#`. A table carrying an `error`
/// column instead of `_value` is an in-band query failure.
pub fn parse_annotated_csv(body: &str) -> Result<Vec<i64>, ReconcileError> {
    let mut values = Vec::new();
    let mut header: Option<Vec<String>> = None;
    let mut value_idx: Option<usize> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            header = None;
            value_idx = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let fields = split_csv_line(line);
        if header.is_none() {
            value_idx = fields.iter().position(|c| c == "_value");
            header = Some(fields);
            continue;
        }

        let Some(idx) = value_idx else {
            let columns = header.as_deref().unwrap_or_default();
            if let Some(err_idx) = columns.iter().position(|c| c == "error") {
                let msg = fields.get(err_idx).cloned().unwrap_or_default();
                return Err(ReconcileError::Query(format!("InfluxDB query failed: {}", msg)));
            }
            return Err(ReconcileError::Query(format!(
                "response table has no _value column: {}",
                columns.join(",")
            )));
        };

        let raw = fields.get(idx).map(String::as_str).unwrap_or("");
        let value = raw.trim().parse::<i64>().map_err(|e| {
            ReconcileError::Query(format!("non-integer _value '{}': {}", raw, e))
        })?;
        values.push(value);
    }

    Ok(values)
}

/// RFC 4180 field splitting: quoted fields may hold commas and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Router};

    const ONE_TABLE: &str = "\
,result,table,_start,_stop,_field,_measurement,device_user_id,_value\r
,_result,0,2025-05-13T09:30:59Z,2025-05-13T09:31:59Z,status,vital,abc,5\r
\r
";

    const ANNOTATED_MULTI: &str = "\
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,string,string,long
#group,false,false,true,true,true,true,false
#default,_result,,,,,,
,result,table,_start,_stop,_field,_measurement,_value
,,0,2025-05-13T09:30:59Z,2025-05-13T09:31:59Z,battery,device_status,3

#datatype,string,long,string,long
#group,false,false,true,false
#default,_result,,,
,result,table,tag,_value
,,1,\"a,b\",4
";

    #[test]
    fn test_single_table() {
        assert_eq!(parse_annotated_csv(ONE_TABLE).unwrap(), vec![5]);
    }

    #[test]
    fn test_annotated_multi_table() {
        assert_eq!(parse_annotated_csv(ANNOTATED_MULTI).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_empty_body_is_no_rows() {
        assert!(parse_annotated_csv("").unwrap().is_empty());
        assert!(parse_annotated_csv("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_in_band_error_table() {
        let body = ",error,reference\n,\"type error: bad filter\",897\n";
        let err = parse_annotated_csv(body).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Query("InfluxDB query failed: type error: bad filter".into())
        );
    }

    #[test]
    fn test_non_integer_value() {
        let body = ",result,table,_value\n,_result,0,3.5\n";
        assert!(matches!(
            parse_annotated_csv(body),
            Err(ReconcileError::Query(_))
        ));
    }

    #[test]
    fn test_split_quoted_fields() {
        assert_eq!(
            split_csv_line(r#",x,"a,b","say ""hi""",7"#),
            vec!["", "x", "a,b", r#"say "hi""#, "7"]
        );
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn store(url: String) -> InfluxStore {
        InfluxStore::connect(&InfluxConfig {
            url,
            org: "cotons".into(),
            token: "secret".into(),
            ..InfluxConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_against_server() {
        let app = Router::new().route(
            "/api/v2/query",
            post(|headers: HeaderMap, body: String| async move {
                let authed = headers.get("authorization").and_then(|v| v.to_str().ok())
                    == Some("Token secret");
                if !authed {
                    return (StatusCode::UNAUTHORIZED, String::from("{\"code\":\"unauthorized\"}"));
                }
                if !body.contains("count()") {
                    return (StatusCode::BAD_REQUEST, String::from("{\"code\":\"invalid\"}"));
                }
                (StatusCode::OK, ONE_TABLE.to_string())
            }),
        );
        let url = spawn(app).await;

        let values = store(url.clone())
            .query_values("from(bucket: \"b\") |> count()")
            .await
            .unwrap();
        assert_eq!(values, vec![5]);

        let err = store(url.clone())
            .query_values("from(bucket: \"b\")")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Query(_)));

        let mut bad_token = store(url);
        bad_token.token = "wrong".into();
        let err = bad_token.query_values("|> count()").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Auth(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let app = Router::new().route(
            "/api/v2/query",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "starting") }),
        );
        let url = spawn(app).await;
        let err = store(url).query_values("x").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transport(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_is_transport() {
        let app = Router::new().route(
            "/api/v2/query",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let url = spawn(app).await;
        let err = store(url).query_values("x").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = store(format!("http://{}", addr))
            .query_values("from(bucket: \"b\") |> count()")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Transport(_)));
        assert!(err.is_retryable());
    }
}
