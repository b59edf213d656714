use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use super::error::TraktError;
use super::types::{TraktAddResponse, TraktHistoryRequest, TraktRemoveResponse, TraktWatchedShow};
use crate::traits::{Credential, HistoryAck, HistoryService, ShowHistory, WatchedShow};

pub const DEFAULT_BASE_URL: &str = "https://api.trakt.tv";

const API_VERSION: &str = "2";

/// Trakt API v2 client for the sync history endpoints.
pub struct TraktClient {
    client_id: String,
    base_url: Url,
    http: Client,
}

impl TraktClient {
    /// Build a client. Every request fails with a network error after `timeout`.
    pub fn new(client_id: String, base_url: &str, timeout: Duration) -> Result<Self, TraktError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| TraktError::Config(format!("{base_url}: {e}")))?;
        // `Url::join` replaces the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client_id,
            base_url,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TraktError> {
        self.base_url
            .join(path)
            .map_err(|e| TraktError::Config(format!("{path}: {e}")))
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: Url,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", credential.bearer())
            .header("trakt-api-version", API_VERSION)
            .header("trakt-api-key", &self.client_id)
            .header("Content-Type", "application/json")
    }

    /// Check the HTTP response for errors and return the body text on failure.
    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, TraktError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            tracing::warn!(?retry_after, "Trakt rate limit hit");
            return Err(TraktError::RateLimited { retry_after });
        }

        let status = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status, "Trakt API error");
        Err(TraktError::Api {
            status,
            message: body,
        })
    }

    /// Read the whole body, then parse it. A failed read is a transport error;
    /// only a body that arrived but does not match `T` is a parse error.
    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TraktError> {
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TraktError::Parse(e.to_string()))
    }
}

impl HistoryService for TraktClient {
    type Error = TraktError;

    async fn add_history(
        &self,
        credential: &Credential,
        batch: &[ShowHistory],
    ) -> Result<HistoryAck, TraktError> {
        let url = self.endpoint("sync/history")?;
        let resp = self
            .request(reqwest::Method::POST, url, credential)
            .json(&TraktHistoryRequest::from_batch(batch))
            .send()
            .await?;

        let resp = Self::check_response(resp).await?;
        let body: TraktAddResponse = Self::read_json(resp).await?;

        Ok(body.into_ack())
    }

    async fn remove_history(
        &self,
        credential: &Credential,
        batch: &[ShowHistory],
    ) -> Result<HistoryAck, TraktError> {
        let url = self.endpoint("sync/history/remove")?;
        let resp = self
            .request(reqwest::Method::POST, url, credential)
            .json(&TraktHistoryRequest::from_batch(batch))
            .send()
            .await?;

        let resp = Self::check_response(resp).await?;
        let body: TraktRemoveResponse = Self::read_json(resp).await?;

        Ok(body.into_ack())
    }

    async fn get_watched_shows(&self, credential: &Credential) -> Result<Vec<WatchedShow>, TraktError> {
        let url = self.endpoint("sync/watched/shows")?;
        let resp = self
            .request(reqwest::Method::GET, url, credential)
            .send()
            .await?;

        let resp = Self::check_response(resp).await?;
        let shows: Vec<TraktWatchedShow> = Self::read_json(resp).await?;

        shows
            .into_iter()
            .map(TraktWatchedShow::into_watched_show)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::traits::{EpisodeHistory, FailureKind, SeasonHistory, ServiceError};

    fn client(server: &MockServer) -> TraktClient {
        TraktClient::new("client-id".into(), &server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn batch() -> Vec<ShowHistory> {
        vec![ShowHistory {
            show_id: 100,
            seasons: vec![SeasonHistory {
                number: 1,
                episodes: vec![EpisodeHistory {
                    number: 1,
                    watched_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
                }],
            }],
        }]
    }

    #[tokio::test]
    async fn test_add_history_sends_headers_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/history"))
            .and(header("Authorization", "Bearer tok"))
            .and(header("trakt-api-version", "2"))
            .and(header("trakt-api-key", "client-id"))
            .and(body_json(json!({
                "shows": [{
                    "ids": { "trakt": 100 },
                    "seasons": [{
                        "number": 1,
                        "episodes": [{ "number": 1, "watched_at": "2024-01-02T03:04:05Z" }]
                    }]
                }]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "added": { "movies": 0, "episodes": 1 },
                "not_found": { "movies": [], "shows": [], "seasons": [], "episodes": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ack = client(&server)
            .add_history(&Credential::new("tok"), &batch())
            .await
            .unwrap();
        assert_eq!(ack.count, 1);
        assert_eq!(ack.not_found, 0);
    }

    #[tokio::test]
    async fn test_remove_history_reads_deleted_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/history/remove"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "deleted": { "movies": 0, "episodes": 2 }
            })))
            .mount(&server)
            .await;

        let ack = client(&server)
            .remove_history(&Credential::new("tok"), &batch())
            .await
            .unwrap();
        assert_eq!(ack.count, 2);
    }

    #[tokio::test]
    async fn test_get_watched_shows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sync/watched/shows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "plays": 1,
                    "show": { "title": "Show", "year": 2020, "ids": { "trakt": 200, "tvdb": 7 } },
                    "seasons": [{
                        "number": 1,
                        "episodes": [{ "number": 1, "plays": 1, "last_watched_at": "2024-05-01T10:00:00.000Z" }]
                    }]
                }
            ])))
            .mount(&server)
            .await;

        let shows = client(&server)
            .get_watched_shows(&Credential::new("tok"))
            .await
            .unwrap();
        assert_eq!(shows.len(), 1);
        assert_eq!(shows[0].show_id, 200);
        assert_eq!(shows[0].ids.tvdb, Some(7));
        assert_eq!(
            shows[0].seasons[0].episodes[0].last_watched_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_watched_shows(&Credential::new("expired"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Auth);
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "10"))
            .mount(&server)
            .await;

        let err = client(&server)
            .add_history(&Credential::new("tok"), &batch())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TraktError::RateLimited {
                retry_after: Some(10)
            }
        ));
        assert_eq!(err.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn test_unexpected_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_watched_shows(&Credential::new("tok"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn test_slow_response_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client =
            TraktClient::new("id".into(), &server.uri(), Duration::from_millis(200)).unwrap();
        let err = client
            .get_watched_shows(&Credential::new("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, TraktError::Http(ref e) if e.is_timeout()));
        assert_eq!(err.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn test_body_stalled_mid_read_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                      Content-Length: 64\r\n\r\n[",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = TraktClient::new(
            "id".into(),
            &format!("http://{addr}"),
            Duration::from_millis(300),
        )
        .unwrap();
        let err = client
            .get_watched_shows(&Credential::new("tok"))
            .await
            .unwrap_err();
        assert!(!matches!(err, TraktError::Parse(_)));
        assert_eq!(err.kind(), FailureKind::Network);
    }

    #[test]
    fn test_base_url_with_path_prefix() {
        let client =
            TraktClient::new("id".into(), "http://localhost:1/api", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            client.endpoint("sync/history").unwrap().as_str(),
            "http://localhost:1/api/sync/history"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = TraktClient::new("id".into(), "not a url", Duration::from_secs(1));
        assert!(matches!(result, Err(TraktError::Config(_))));
    }
}
