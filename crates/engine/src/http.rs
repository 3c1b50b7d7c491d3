//! Probe and ranged/single-stream fetch primitives used by the task worker.

use std::time::Duration;

use reqwest::{Client, Response};

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; FluxDM/1.0; +https://example.invalid)";

/// Result of probing a remote resource before planning chunks.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInfo {
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
}

/// Issues a `HEAD` request and extracts `Content-Length` / `Accept-Ranges`.
pub async fn probe(client: &Client, url: &str, timeout: Duration) -> EngineResult<ProbeInfo> {
    let response = client
        .head(url)
        .header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| EngineError::Probe(e.to_string()))?;

    if !response.status().is_success() {
        return Err(EngineError::ServerContract {
            status: response.status().as_u16(),
            context: "HEAD probe".to_string(),
        });
    }

    let total_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let accepts_ranges = response
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    Ok(ProbeInfo {
        total_size,
        accepts_ranges,
    })
}

/// Issues a ranged `GET` for `[start, end]` inclusive. The caller inspects
/// `response.status()`: a server that ignores `Range` and returns 200 with
/// the full body signals the single-stream fallback path rather than an error.
pub async fn get_range(
    client: &Client,
    url: &str,
    start: u64,
    end: u64,
    timeout: Duration,
) -> EngineResult<Response> {
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT)
        .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

/// Issues a plain `GET` for the whole resource (single-stream mode).
pub async fn get_full(client: &Client, url: &str, timeout: Duration) -> EngineResult<Response> {
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT)
        .timeout(timeout)
        .send()
        .await?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_extracts_length_and_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/f.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "1000")
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let info = probe(&client, &format!("{}/f.bin", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.total_size, Some(1000));
        assert!(info.accepts_ranges);
    }

    #[tokio::test]
    async fn probe_surfaces_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        let err = probe(&client, &format!("{}/missing", server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServerContract { status: 404, .. }));
    }
}
