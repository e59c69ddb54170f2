// src/status/mod.rs — Helix live-status client
//
// Polls the Helix REST API for live status of a batch of channel logins and
// resolves login -> user id. Owns the app access token: cached until close to
// expiry, refreshed single-flight (callers queue on the token mutex while one
// request renews it).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::infra::config::HelixCredentials;
use crate::infra::errors::CollectorError;

const TWITCH_OAUTH_URL: &str = "https://id.twitch.tv/oauth2/token";
const HELIX_BASE: &str = "https://api.twitch.tv/helix";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Refresh the token once we are within this window of its declared expiry.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// One currently-broadcasting channel, as reported by `GET /streams`.
/// Absence from the poll result means the channel is not live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub user_login: String,
    pub user_id: String,
    /// ISO-8601 broadcast start, normalized to a `Z` suffix. Immutable for
    /// the life of the broadcast; keys the session's storage directory.
    pub started_at: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub viewer_count: u64,
}

/// Seam for the collector: anything that can answer "which of these logins
/// are live right now". Lets tests drive the reconcile loop with a script.
#[async_trait]
pub trait LiveStatusSource: Send + Sync {
    async fn live_status(
        &self,
        logins: &[String],
    ) -> Result<HashMap<String, StreamInfo>, CollectorError>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct HelixClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    batch_size: usize,
    oauth_url: String,
    api_base: String,
    token: Mutex<Option<CachedToken>>,
    // Positive lookups only; logins are not expected to be renamed mid-run.
    user_id_cache: Mutex<HashMap<String, String>>,
}

impl HelixClient {
    pub fn new(creds: HelixCredentials, batch_size: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            client_id: creds.client_id,
            client_secret: creds.client_secret,
            batch_size: batch_size.max(1),
            oauth_url: TWITCH_OAUTH_URL.into(),
            api_base: HELIX_BASE.into(),
            token: Mutex::new(None),
            user_id_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Point the client at a different token endpoint / API base (tests).
    pub fn with_base_urls(mut self, oauth_url: &str, api_base: &str) -> Self {
        self.oauth_url = oauth_url.trim_end_matches('/').into();
        self.api_base = api_base.trim_end_matches('/').into();
        self
    }

    /// Returns a bearer token, refreshing it if it is within
    /// `TOKEN_EXPIRY_SKEW` of expiry. Holding the mutex across the refresh
    /// request is what makes the refresh single-flight.
    async fn bearer(&self) -> Result<String, CollectorError> {
        let mut guard = self.token.lock().await;

        if let Some(tok) = guard.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_SKEW < tok.expires_at {
                return Ok(tok.access_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default = "default_expires_in")]
            expires_in: u64,
        }
        fn default_expires_in() -> u64 {
            3600
        }

        let resp = self
            .http
            .post(&self.oauth_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| CollectorError::StatusFetch(format!("token exchange: {e}")))?;

        if !resp.status().is_success() {
            return Err(CollectorError::StatusFetch(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CollectorError::StatusFetch(format!("token response: {e}")))?;

        let expires_in = body.expires_in;
        let token = body.access_token.clone();
        *guard = Some(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });

        tracing::debug!(expires_in, "refreshed app access token");
        Ok(token)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CollectorError> {
        let token = self.bearer().await?;
        let url = format!("{}{}", self.api_base, path);

        let resp = self
            .http
            .get(&url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(&token)
            .query(query)
            .send()
            .await
            .map_err(|e| CollectorError::StatusFetch(format!("GET {path}: {e}")))?;

        if !resp.status().is_success() {
            return Err(CollectorError::StatusFetch(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| CollectorError::StatusFetch(format!("GET {path} body: {e}")))
    }

    /// Resolve logins to user ids, hitting the API only for cache misses.
    pub async fn resolve_user_ids(
        &self,
        logins: &[String],
    ) -> Result<HashMap<String, String>, CollectorError> {
        #[derive(Deserialize)]
        struct UsersResponse {
            #[serde(default)]
            data: Vec<UserRow>,
        }
        #[derive(Deserialize)]
        struct UserRow {
            id: String,
            login: String,
        }

        let logins: Vec<String> = logins
            .iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();

        let mut cache = self.user_id_cache.lock().await;

        let missing: Vec<String> = logins
            .iter()
            .filter(|l| !cache.contains_key(*l))
            .cloned()
            .collect();

        for chunk in missing.chunks(self.batch_size) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|l| ("login", l.as_str())).collect();
            let body: UsersResponse = self.get_json("/users", &query).await?;
            for row in body.data {
                cache.insert(row.login.to_lowercase(), row.id);
            }
        }

        Ok(logins
            .iter()
            .filter_map(|l| cache.get(l).map(|id| (l.clone(), id.clone())))
            .collect())
    }
}

#[async_trait]
impl LiveStatusSource for HelixClient {
    /// Live status for the requested logins, batched to respect the API's
    /// query-parameter cap. Entries exist only for live channels.
    async fn live_status(
        &self,
        logins: &[String],
    ) -> Result<HashMap<String, StreamInfo>, CollectorError> {
        #[derive(Deserialize)]
        struct StreamsResponse {
            #[serde(default)]
            data: Vec<StreamInfo>,
        }

        let logins: Vec<String> = logins
            .iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();

        let mut live = HashMap::new();
        for chunk in logins.chunks(self.batch_size) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|l| ("user_login", l.as_str())).collect();
            let body: StreamsResponse = self.get_json("/streams", &query).await?;
            for mut info in body.data {
                info.user_login = info.user_login.to_lowercase();
                info.started_at = info.started_at.replace("+00:00", "Z");
                live.insert(info.user_login.clone(), info);
            }
        }

        Ok(live)
    }
}
