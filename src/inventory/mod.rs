//! Session-authenticated client for the external inventory REST API.
//!
//! Reads are exposed through [`InventorySource`] and the single write path
//! (ticket follow-ups) through [`FollowupPoster`], so the reconciliation engine
//! and the outbox processor can each be driven by a fake in tests.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;

pub mod model;

pub use model::{ComponentSets, ComponentType, DropdownValue, RawRecord};

/// Marker the API puts in the body of a 400 when a range starts past the end.
const RANGE_EXCEEDED: &str = "ERROR_RANGE_EXCEED_TOTAL";
/// Marker for a session token the server no longer accepts.
const SESSION_INVALID: &str = "ERROR_SESSION_TOKEN_INVALID";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("inventory authentication failed: {0}")]
    Auth(String),
    #[error("inventory returned {status} for {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },
    #[error("inventory request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid inventory response: {0}")]
    Decode(String),
    #[error("invalid inventory URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    /// The server rejected the session token itself; a fresh session may succeed.
    pub fn is_session_expired(&self) -> bool {
        match self {
            ClientError::Status { status, body, .. } => {
                *status == StatusCode::UNAUTHORIZED || body.contains(SESSION_INVALID)
            }
            _ => false,
        }
    }
}

/// Read side of the inventory API.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Establish a session. Other calls open one lazily when needed.
    async fn open_session(&self) -> Result<(), ClientError>;

    /// Best-effort; a failure is logged, the server expires the session anyway.
    async fn close_session(&self);

    /// At most `limit` records starting at `offset`; empty once past the end.
    async fn fetch_assets_page(&self, offset: u32, limit: u32)
        -> Result<Vec<RawRecord>, ClientError>;

    /// Items of one component type; a 404 means "none" and yields `[]`.
    async fn fetch_components(
        &self,
        asset_id: i64,
        component_type: ComponentType,
    ) -> Result<Vec<RawRecord>, ClientError>;

    /// Every known component type for one asset. A failing type is logged
    /// and reported in [`ComponentSets::failed`], never fatal.
    async fn fetch_all_components(&self, asset_id: i64) -> ComponentSets {
        let mut sets = ComponentSets::default();
        for component_type in ComponentType::ALL {
            match self.fetch_components(asset_id, component_type).await {
                Ok(items) => {
                    sets.fetched.insert(component_type, items);
                }
                Err(err) => {
                    warn!(%err, asset_id, %component_type, "component fetch failed; skipping type");
                    sets.failed.push(component_type);
                }
            }
        }
        sets
    }
}

/// Request shapes accepted by different deployments for a ticket follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupShape {
    TicketSubresource,
    ItilFollowup,
    LegacyTicketFollowup,
}

impl FollowupShape {
    /// Tried in this order; the first accepted shape wins.
    pub const ORDER: [FollowupShape; 3] = [
        FollowupShape::TicketSubresource,
        FollowupShape::ItilFollowup,
        FollowupShape::LegacyTicketFollowup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FollowupShape::TicketSubresource => "ticket_subresource",
            FollowupShape::ItilFollowup => "itil_followup",
            FollowupShape::LegacyTicketFollowup => "legacy_ticket_followup",
        }
    }
}

impl fmt::Display for FollowupShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a follow-up delivery across all shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowupOutcome {
    Delivered { shape: FollowupShape },
    Rejected { attempts: Vec<(FollowupShape, String)> },
}

impl FollowupOutcome {
    /// One-line summary of every rejected attempt, for `last_error`.
    pub fn error_summary(&self) -> Option<String> {
        match self {
            FollowupOutcome::Delivered { .. } => None,
            FollowupOutcome::Rejected { attempts } if attempts.is_empty() => {
                Some("no follow-up shape attempted".to_string())
            }
            FollowupOutcome::Rejected { attempts } => Some(
                attempts
                    .iter()
                    .map(|(shape, err)| format!("{}: {}", shape, err))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }
}

/// Write side of the inventory API.
#[async_trait]
pub trait FollowupPoster: Send + Sync {
    async fn post_followup(&self, ticket_id: i64, content: &str) -> FollowupOutcome;
}

/// Path and JSON body for one follow-up shape.
pub fn followup_request(shape: FollowupShape, ticket_id: i64, content: &str) -> (String, Value) {
    match shape {
        FollowupShape::TicketSubresource => (
            format!("Ticket/{}/ITILFollowup", ticket_id),
            json!({
                "input": { "itemtype": "Ticket", "items_id": ticket_id, "content": content }
            }),
        ),
        FollowupShape::ItilFollowup => (
            "ITILFollowup".to_string(),
            json!({
                "input": { "itemtype": "Ticket", "items_id": ticket_id, "content": content }
            }),
        ),
        FollowupShape::LegacyTicketFollowup => (
            "TicketFollowup".to_string(),
            json!({
                "input": { "tickets_id": ticket_id, "content": content }
            }),
        ),
    }
}

/// HTTP implementation of [`InventorySource`] and [`FollowupPoster`].
pub struct InventoryClient {
    http: Client,
    base_url: Url,
    app_token: String,
    user_token: String,
    collection: String,
    session: Mutex<Option<String>>,
}

impl fmt::Debug for InventoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InventoryClient")
            .field("base_url", &self.base_url)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl InventoryClient {
    pub fn new(
        base_url: &str,
        app_token: String,
        user_token: String,
        collection: String,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        // `Url::join` drops the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url =
            Url::parse(&normalized).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let http = Client::builder()
            .user_agent("inventory-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            app_token,
            user_token,
            collection,
            session: Mutex::new(None),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ClientError> {
        Self::new(
            &cfg.inventory.base_url,
            cfg.inventory.app_token.clone(),
            cfg.inventory.user_token.clone(),
            cfg.inventory.collection.clone(),
            cfg.request_timeout(),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    /// Current session token, opening a session first if there is none.
    async fn session_token(&self) -> Result<String, ClientError> {
        let mut guard = self.session.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.init_session().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Forget `stale` so the next call opens a new session. A token another
    /// caller already replaced is left alone.
    async fn invalidate_session(&self, stale: &str) {
        let mut guard = self.session.lock().await;
        if guard.as_deref() == Some(stale) {
            info!("inventory session expired; reopening");
            *guard = None;
        }
    }

    async fn init_session(&self) -> Result<String, ClientError> {
        let url = self.endpoint("initSession")?;
        let res = self
            .http
            .get(url.clone())
            .header("App-Token", &self.app_token)
            .header("Authorization", format!("user_token {}", self.user_token))
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!("{}: {}", status, body)));
        }
        let payload: Value = check_status(res).await?.json().await?;
        let token = payload
            .get("session_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Auth("response carried no session_token".into()))?;
        info!(url = %url, "inventory session opened");
        Ok(token.to_string())
    }

    fn authed(&self, builder: RequestBuilder, session_token: &str) -> RequestBuilder {
        builder
            .header("App-Token", &self.app_token)
            .header("Session-Token", session_token)
    }

    /// GET with the current session, reopening it once if the server
    /// rejects the token.
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ClientError> {
        let token = self.session_token().await?;
        match self.get_with(&token, path, query).await {
            Err(err) if err.is_session_expired() => {
                self.invalidate_session(&token).await;
                let token = self.session_token().await?;
                self.get_with(&token, path, query).await
            }
            other => other,
        }
    }

    async fn get_with(
        &self,
        session_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ClientError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "inventory GET");
        let res = self
            .authed(self.http.get(url), session_token)
            .query(query)
            .send()
            .await?;
        let res = check_status(res).await?;
        res.json::<Value>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn post_shape(
        &self,
        session_token: &str,
        shape: FollowupShape,
        ticket_id: i64,
        content: &str,
    ) -> Result<(), ClientError> {
        let (path, body) = followup_request(shape, ticket_id, content);
        let url = self.endpoint(&path)?;
        let res = self
            .authed(self.http.post(url), session_token)
            .json(&body)
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }
}

async fn check_status(res: Response) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let url = res.url().to_string();
    let body = res.text().await.unwrap_or_default();
    Err(ClientError::Status { status, url, body })
}

fn into_records(value: Value) -> Vec<RawRecord> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl InventorySource for InventoryClient {
    async fn open_session(&self) -> Result<(), ClientError> {
        self.session_token().await.map(|_| ())
    }

    async fn close_session(&self) {
        let Some(token) = self.session.lock().await.take() else {
            return;
        };
        let url = match self.endpoint("killSession") {
            Ok(url) => url,
            Err(err) => {
                warn!(%err, "cannot build killSession URL; leaving session to expire");
                return;
            }
        };
        match self.authed(self.http.get(url), &token).send().await {
            Ok(res) if res.status().is_success() => debug!("inventory session closed"),
            Ok(res) => warn!(status = %res.status(), "killSession rejected; session will expire"),
            Err(err) => warn!(%err, "killSession failed; session will expire"),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_assets_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ClientError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = [
            ("range", format!("{}-{}", offset, offset.saturating_add(limit - 1))),
            ("expand_dropdowns", "true".to_string()),
        ];
        match self.get_json(&self.collection, &query).await {
            Ok(value) => Ok(into_records(value)),
            Err(ClientError::Status { status, body, .. })
                if status == StatusCode::BAD_REQUEST && body.contains(RANGE_EXCEEDED) =>
            {
                debug!(offset, "range past end of catalog");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_components(
        &self,
        asset_id: i64,
        component_type: ComponentType,
    ) -> Result<Vec<RawRecord>, ClientError> {
        let path = format!("{}/{}/{}", self.collection, asset_id, component_type.tag());
        let query = [("expand_dropdowns", "true".to_string())];
        match self.get_json(&path, &query).await {
            Ok(value) => Ok(into_records(value)),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl FollowupPoster for InventoryClient {
    async fn post_followup(&self, ticket_id: i64, content: &str) -> FollowupOutcome {
        let mut token = match self.session_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(%err, ticket_id, "cannot post follow-up without a session");
                return FollowupOutcome::Rejected {
                    attempts: vec![(FollowupShape::ORDER[0], err.to_string())],
                };
            }
        };

        let mut renewed = false;
        let mut attempts = Vec::new();
        for shape in FollowupShape::ORDER {
            let mut result = self.post_shape(&token, shape, ticket_id, content).await;
            if !renewed && result.as_ref().is_err_and(|err| err.is_session_expired()) {
                renewed = true;
                self.invalidate_session(&token).await;
                match self.session_token().await {
                    Ok(fresh) => {
                        token = fresh;
                        result = self.post_shape(&token, shape, ticket_id, content).await;
                    }
                    Err(err) => {
                        warn!(%err, ticket_id, "cannot reopen inventory session");
                        attempts.push((shape, err.to_string()));
                        return FollowupOutcome::Rejected { attempts };
                    }
                }
            }
            match result {
                Ok(()) => {
                    info!(ticket_id, %shape, "follow-up posted");
                    return FollowupOutcome::Delivered { shape };
                }
                Err(err) => {
                    warn!(%err, ticket_id, %shape, "follow-up shape rejected; trying next");
                    attempts.push((shape, err.to_string()));
                }
            }
        }
        FollowupOutcome::Rejected { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn followup_request_shapes() {
        let (path, body) = followup_request(FollowupShape::TicketSubresource, 9, "done");
        assert_eq!(path, "Ticket/9/ITILFollowup");
        assert_eq!(body["input"]["itemtype"], "Ticket");
        assert_eq!(body["input"]["items_id"], 9);
        assert_eq!(body["input"]["content"], "done");

        let (path, body) = followup_request(FollowupShape::ItilFollowup, 9, "done");
        assert_eq!(path, "ITILFollowup");
        assert_eq!(body["input"]["items_id"], 9);

        let (path, body) = followup_request(FollowupShape::LegacyTicketFollowup, 9, "done");
        assert_eq!(path, "TicketFollowup");
        assert_eq!(body["input"]["tickets_id"], 9);
        assert!(body["input"].get("itemtype").is_none());
    }

    #[test]
    fn session_expiry_is_recognised_by_status_or_marker() {
        let status = |code: u16, body: &str| ClientError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            url: "http://inventory/Computer".into(),
            body: body.into(),
        };
        assert!(status(401, "").is_session_expired());
        assert!(status(400, r#"["ERROR_SESSION_TOKEN_INVALID","session_token seems invalid"]"#)
            .is_session_expired());
        assert!(!status(400, "ERROR_BAD_ARRAY").is_session_expired());
        assert!(!status(404, "").is_session_expired());
        assert!(!ClientError::Auth("nope".into()).is_session_expired());
    }

    #[test]
    fn error_summary_lists_every_attempt() {
        let outcome = FollowupOutcome::Rejected {
            attempts: vec![
                (FollowupShape::TicketSubresource, "404".into()),
                (FollowupShape::ItilFollowup, "500".into()),
            ],
        };
        assert_eq!(
            outcome.error_summary().as_deref(),
            Some("ticket_subresource: 404; itil_followup: 500")
        );
        let ok = FollowupOutcome::Delivered {
            shape: FollowupShape::ItilFollowup,
        };
        assert!(ok.error_summary().is_none());
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let client = InventoryClient::new(
            "http://inventory.local/apirest.php",
            "app-secret".into(),
            "user-secret".into(),
            "Computer".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("initSession").unwrap().as_str(),
            "http://inventory.local/apirest.php/initSession"
        );
        let debug = format!("{:?}", client);
        assert!(!debug.contains("user-secret"));
        assert!(!debug.contains("app-secret"));
    }

    #[test]
    fn records_filter_non_objects() {
        let value = serde_json::json!([{"id": 1}, 2, "x", {"id": 3}]);
        assert_eq!(into_records(value).len(), 2);
        assert!(into_records(serde_json::json!({"id": 1})).is_empty());
    }
}
