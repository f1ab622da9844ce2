use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    config::NodeConfig,
    error::{Error, Result},
    protocol::{
        ErrorResponse, LoadResult, NodeInfo, PlayerInfo, SessionUpdate, Stats, Track,
        UpdatePlayer,
    },
};

/// Wall-clock cap per REST attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
/// Base of the linear retry backoff (`RETRY_STEP * attempt`).
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Shared view of the node's session id.
///
/// The WebSocket layer writes it on `ready`; the REST layer reads it for
/// session-scoped paths and clears it when the server answers 404 on one,
/// which tells the session layer to reconnect.
#[derive(Debug, Default)]
pub struct SessionHandle {
    id: parking_lot::RwLock<Option<String>>,
}

impl SessionHandle {
    pub fn get(&self) -> Option<String> {
        self.id.read().clone()
    }

    pub fn set(&self, session_id: String) {
        *self.id.write() = Some(session_id);
    }

    pub fn clear(&self) {
        *self.id.write() = None;
    }

    pub fn is_present(&self) -> bool {
        self.id.read().is_some()
    }
}

/// Authenticated HTTP client for one Lavalink node.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    retry_amount: u32,
    session: Arc<SessionHandle>,
}

impl RestClient {
    pub fn new(config: &NodeConfig, session: Arc<SessionHandle>) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&config.password)
            .map_err(|_| Error::config("node password is not a valid header value"))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("open-lavalink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base: config.rest_base(),
            retry_amount: config.retry_amount.max(1),
            session,
        })
    }

    /// `GET /version` — plain-text server version.
    pub async fn version(&self) -> Result<String> {
        let response = self.send(Method::GET, "/version", &[], None).await?;
        Ok(response.text().await?)
    }

    /// `GET /v4/info`.
    pub async fn info(&self) -> Result<NodeInfo> {
        self.request_json(Method::GET, "/v4/info", &[], None).await
    }

    /// `GET /v4/stats` — on-demand health snapshot.
    pub async fn stats(&self) -> Result<Stats> {
        self.request_json(Method::GET, "/v4/stats", &[], None).await
    }

    /// `GET /v4/loadtracks?identifier=...`.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.request_json(
            Method::GET,
            "/v4/loadtracks",
            &[("identifier", identifier)],
            None,
        )
        .await
    }

    /// `GET /v4/decodetrack?encodedTrack=...`.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        self.request_json(
            Method::GET,
            "/v4/decodetrack",
            &[("encodedTrack", encoded)],
            None,
        )
        .await
    }

    /// `POST /v4/decodetracks`.
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        self.request_json(
            Method::POST,
            "/v4/decodetracks",
            &[],
            Some(serde_json::to_value(encoded)?),
        )
        .await
    }

    /// `PATCH /v4/sessions/{sid}` — configure resumption.
    pub async fn update_session(&self, update: &SessionUpdate) -> Result<()> {
        let path = format!("/v4/sessions/{}", self.session_id()?);
        self.send(Method::PATCH, &path, &[], Some(serde_json::to_value(update)?))
            .await?;
        Ok(())
    }

    /// `GET /v4/sessions/{sid}/players/{guild}`.
    pub async fn get_player(&self, guild_id: u64) -> Result<PlayerInfo> {
        let path = format!("/v4/sessions/{}/players/{guild_id}", self.session_id()?);
        self.request_json(Method::GET, &path, &[], None).await
    }

    /// `PATCH /v4/sessions/{sid}/players/{guild}?noReplace=...`.
    pub async fn update_player(
        &self,
        guild_id: u64,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<PlayerInfo> {
        let path = format!("/v4/sessions/{}/players/{guild_id}", self.session_id()?);
        let no_replace = if no_replace { "true" } else { "false" };
        self.request_json(
            Method::PATCH,
            &path,
            &[("noReplace", no_replace)],
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    /// `DELETE /v4/sessions/{sid}/players/{guild}`.
    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        let path = format!("/v4/sessions/{}/players/{guild_id}", self.session_id()?);
        self.send(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    fn session_id(&self) -> Result<String> {
        self.session
            .get()
            .ok_or_else(|| Error::precondition("no active session on this node"))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.send(method, path, query, body).await?;
        Ok(response.json().await?)
    }

    /// Issues one request with bounded retries.
    ///
    /// Network failures (connect refusal, timeout) retry up to
    /// `retry_amount` attempts with a `500ms * attempt` backoff. Any HTTP
    /// response, success or not, ends the retry loop: non-2xx becomes a
    /// typed error and is never retried.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);

        let mut attempt = 1u32;
        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .timeout(ATTEMPT_TIMEOUT);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            debug!(%method, %url, attempt, "rest request");
            match request.send().await {
                Ok(response) => return self.check_status(response, path).await,
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if attempt >= self.retry_amount {
                        return Err(Error::transport(format!(
                            "{method} {url} failed after {attempt} attempts: {err}"
                        )));
                    }
                    let backoff = RETRY_STEP * attempt;
                    warn!(%url, attempt, ?backoff, "rest attempt failed, retrying: {err}");
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        path: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // A 404 on a session-scoped path means the server no longer knows
        // our session; drop it so the session layer reconnects.
        if status == StatusCode::NOT_FOUND && path.starts_with("/v4/sessions/") {
            warn!(path, "session rejected by node, marking invalid");
            self.session.clear();
            return Err(Error::Session(format!("session not found on {path}")));
        }

        let body = response.json::<ErrorResponse>().await.ok();
        Err(Error::Rest {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_handle_roundtrip() {
        let session = SessionHandle::default();
        assert!(!session.is_present());
        session.set("abc".to_string());
        assert_eq!(session.get().as_deref(), Some("abc"));
        session.clear();
        assert!(session.get().is_none());
    }

    #[test]
    fn test_session_scoped_calls_require_session() {
        let session = Arc::new(SessionHandle::default());
        let client = RestClient::new(&NodeConfig::default(), session.clone()).unwrap();
        assert!(matches!(
            client.session_id(),
            Err(Error::Precondition(_))
        ));

        session.set("s1".to_string());
        assert_eq!(client.session_id().unwrap(), "s1");
    }
}
