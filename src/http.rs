use crate::error::{Error, Result};
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("bq-analyst/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    base_delay_ms: u64,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_timeout(user_agent, Duration::from_secs(180))
    }

    pub fn with_timeout(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;

        Ok(Self {
            client,
            max_retries: 3,
            base_delay_ms: 1000,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First backoff delay; later retries double it.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(MAX_DELAY_MS);
        self
    }

    pub async fn get_json_authed<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<T> {
        let body = self
            .request_with_retry(|| {
                self.client
                    .get(url)
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header(header::ACCEPT, "application/json")
            })
            .await?;
        serde_json::from_str(&body).map_err(|e| Error::parse(format!("JSON parse: {e}")))
    }

    pub async fn post_json_authed<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_string(body)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        let auth = format!("Bearer {token}");
        let text = self
            .post_json_raw(url, &body, &[(header::AUTHORIZATION.as_str(), auth.as_str())])
            .await?;
        serde_json::from_str(&text).map_err(|e| Error::parse(format!("JSON parse: {e}")))
    }

    pub async fn post_json_raw(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<String> {
        self.request_with_retry(|| {
            let mut req = self
                .client
                .post(url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
            for (k, v) in headers {
                req = req.header(*k, *v);
            }
            req
        })
        .await
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T> {
        let body = self
            .request_with_retry(|| self.client.post(url).form(form))
            .await?;
        serde_json::from_str(&body).map_err(|e| Error::parse(format!("JSON parse: {e}")))
    }

    pub async fn get_text_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<String> {
        self.request_with_retry(|| {
            let mut req = self.client.get(url);
            for (k, v) in headers {
                req = req.header(*k, *v);
            }
            req
        })
        .await
    }

    /// Send the request built by `build`, retrying connection failures,
    /// timeouts and transient statuses (429, 500, 502, 503, 504) with
    /// exponential backoff. A 429 `Retry-After` replaces the backoff delay.
    /// Once a success status has arrived the request is never sent again,
    /// even if reading its body fails.
    async fn request_with_retry<F>(&self, build: F) -> Result<String>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay_ms = self.base_delay_ms;
        let mut attempt = 0;

        loop {
            let err = match build().send().await {
                Ok(resp) if resp.status().is_success() => {
                    let host = host_of(resp.url());
                    debug!(%host, status = resp.status().as_u16(), "response");
                    return resp.text().await.map_err(|e| Error::http(e.to_string()));
                }
                Ok(resp) => Self::status_error(resp).await,
                Err(e) if e.is_timeout() || e.is_connect() => Error::http(e.to_string()),
                Err(e) => return Err(Error::http(e.to_string())),
            };

            if attempt >= self.max_retries || !is_transient(&err) {
                return Err(err);
            }
            attempt += 1;

            let wait_ms = retry_delay_ms(&err, delay_ms);
            warn!(attempt, wait_ms, error = %err, "transient failure, will retry");
            sleep(Duration::from_millis(wait_ms)).await;
            delay_ms = delay_ms.saturating_mul(2).min(MAX_DELAY_MS);
        }
    }

    async fn status_error(resp: reqwest::Response) -> Error {
        let status = resp.status();
        let host = host_of(resp.url());
        debug!(%host, status = status.as_u16(), "response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Error::RateLimit {
                platform: host,
                retry_after_secs,
            };
        }
        let body = resp.text().await.unwrap_or_default();
        Error::api_with_status(host, body, status.as_u16())
    }
}

const MAX_DELAY_MS: u64 = 30_000;

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Http(_) | Error::RateLimit { .. } => true,
        Error::Api {
            status_code: Some(code),
            ..
        } => matches!(code, 500 | 502 | 503 | 504),
        _ => false,
    }
}

/// How long to wait before the next attempt; a server-sent `Retry-After`
/// wins over the backoff delay.
fn retry_delay_ms(err: &Error, backoff_ms: u64) -> u64 {
    match err {
        Error::RateLimit {
            retry_after_secs: Some(secs),
            ..
        } => secs.saturating_mul(1000).min(MAX_DELAY_MS),
        _ => backoff_ms,
    }
}

fn host_of(url: &reqwest::Url) -> String {
    url.host_str().unwrap_or("unknown").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_from_url() {
        let url = reqwest::Url::parse("https://bigquery.googleapis.com/bigquery/v2/projects/p/datasets")
            .unwrap();
        assert_eq!(host_of(&url), "bigquery.googleapis.com");
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient(&Error::http("connection reset")));
        assert!(is_transient(&Error::api_with_status("x", "backendError", 503)));
        assert!(is_transient(&Error::RateLimit {
            platform: "x".into(),
            retry_after_secs: None,
        }));
        assert!(!is_transient(&Error::api_with_status("x", "invalidQuery", 400)));
        assert!(!is_transient(&Error::api("x", "no status")));
    }

    #[test]
    fn retry_after_sets_the_delay_without_overflow() {
        let limited = |secs| Error::RateLimit {
            platform: "x".into(),
            retry_after_secs: secs,
        };
        assert_eq!(retry_delay_ms(&limited(Some(2)), 1000), 2000);
        assert_eq!(retry_delay_ms(&limited(Some(u64::MAX)), 1000), MAX_DELAY_MS);
        assert_eq!(retry_delay_ms(&limited(None), 1000), 1000);
        assert_eq!(retry_delay_ms(&Error::http("reset"), 4000), 4000);
    }

    mod wire {
        use super::*;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        const TRUNCATED_OK: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
            content-length: 100\r\nconnection: close\r\n\r\n{\"jobComplete\"";
        const UNAVAILABLE: &str =
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
        const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";

        async fn read_request(stream: &mut TcpStream) {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let body_len = text[..end]
                        .lines()
                        .find_map(|line| {
                            line.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        return;
                    }
                }
            }
        }

        /// Answers the n-th connection with the n-th canned response (the
        /// last one repeats). Returns the URL and a connection counter.
        async fn canned_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = listener.accept().await.unwrap();
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let response = responses[n.min(responses.len() - 1)];
                    read_request(&mut stream).await;
                    stream.write_all(response.as_bytes()).await.unwrap();
                    let _ = stream.shutdown().await;
                }
            });
            (format!("http://{addr}/queries"), hits)
        }

        fn client() -> HttpClient {
            HttpClient::new(USER_AGENT)
                .unwrap()
                .with_retry_delay(Duration::from_millis(1))
        }

        #[tokio::test]
        async fn broken_success_body_is_not_resent() {
            let (url, hits) = canned_server(vec![TRUNCATED_OK, OK]).await;
            let result = client().post_json_raw(&url, r#"{"query":"SELECT 1"}"#, &[]).await;
            assert!(result.is_err(), "{result:?}");
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn unavailable_is_retried() {
            let (url, hits) = canned_server(vec![UNAVAILABLE, OK]).await;
            let body = client().post_json_raw(&url, "{}", &[]).await.unwrap();
            assert_eq!(body, "{}");
            assert_eq!(hits.load(Ordering::SeqCst), 2);
        }
    }
}
