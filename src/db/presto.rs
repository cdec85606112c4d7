//! Presto backend over the REST statement protocol.
//!
//! A statement is submitted with `POST /v1/statement`; the coordinator
//! answers with a page of results and a `nextUri` to follow until the query
//! finishes. The cursor buffers whatever rows a page carries and only
//! follows `nextUri` when the caller needs more rows or a fresh status.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{
    ColumnMeta, Connection, Cursor, PollState, Row, StatementPolicy, Submission, Value,
};
use crate::config::BackendConfig;
use crate::connection::{resolve_url, Principal};
use crate::error::{ConduitError, Result};

/// Value sent in `X-Presto-Source`.
const SOURCE_NAME: &str = "db-conduit";

/// Delay before retrying a page the coordinator answered with 503.
const BUSY_RETRY_DELAY_MS: u64 = 100;

/// Per-principal request settings shared by every cursor of a connection.
#[derive(Debug)]
struct PrestoSession {
    client: Client,
    statement_url: Url,
    user: String,
    catalog: Option<String>,
    schema: Option<String>,
    auth: Option<(String, Option<String>)>,
}

impl PrestoSession {
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request
            .header("X-Presto-User", &self.user)
            .header("X-Presto-Source", SOURCE_NAME);
        if let Some(catalog) = &self.catalog {
            request = request.header("X-Presto-Catalog", catalog);
        }
        if let Some(schema) = &self.schema {
            request = request.header("X-Presto-Schema", schema);
        }
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, password.as_ref());
        }
        request
    }
}

/// A connection to a Presto coordinator.
///
/// Construction performs no network I/O; the first request happens when a
/// cursor submits a statement.
#[derive(Debug)]
pub struct PrestoConnection {
    session: Arc<PrestoSession>,
    policy: StatementPolicy,
}

impl PrestoConnection {
    /// Builds a connection for `principal` from the backend definition.
    pub fn new(
        backend: &BackendConfig,
        principal: &Principal,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let base = match (&backend.url, &backend.host) {
            (Some(template), _) => resolve_url(template, principal, &backend.session.properties)?,
            (None, Some(host)) => format!("http://{host}:{}", backend.port_or_default()),
            (None, None) => {
                return Err(ConduitError::config(
                    "Presto backend needs either 'url' or 'host'",
                ))
            }
        };
        let statement_url = Url::parse(&base)
            .and_then(|url| url.join("/v1/statement"))
            .map_err(|e| ConduitError::config(format!("Invalid Presto url '{base}': {e}")))?;

        let user = if backend.has_impersonation {
            principal.username.clone()
        } else {
            backend
                .auth_username
                .clone()
                .unwrap_or_else(|| principal.username.clone())
        };

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConduitError::connection(format!("Failed to create HTTP client: {e}")))?;

        let auth = backend
            .auth_username
            .clone()
            .map(|username| (username, backend.auth_password.clone()));

        Ok(Self {
            session: Arc::new(PrestoSession {
                client,
                statement_url,
                user,
                catalog: backend.catalog.clone(),
                schema: backend.schema.clone(),
                auth,
            }),
            policy: StatementPolicy::from_backend(backend),
        })
    }

    /// User name sent with every request.
    pub fn user(&self) -> &str {
        &self.session.user
    }

    /// Endpoint statements are submitted to.
    pub fn statement_url(&self) -> &Url {
        &self.session.statement_url
    }
}

#[async_trait]
impl Connection for PrestoConnection {
    async fn open_cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(PrestoCursor::new(self.session.clone())))
    }

    fn prepare_statement(&self, statement: &str) -> String {
        self.policy.apply(statement)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One page of the statement protocol.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    id: String,
    next_uri: Option<String>,
    columns: Option<Vec<PrestoColumn>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    stats: Option<QueryStats>,
    error: Option<QueryErrorInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct PrestoColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct QueryStats {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryErrorInfo {
    message: String,
    error_name: Option<String>,
}

/// Cursor following one statement's `nextUri` chain.
pub struct PrestoCursor {
    session: Arc<PrestoSession>,
    query_id: Option<String>,
    next_uri: Option<String>,
    columns: Vec<PrestoColumn>,
    buffer: VecDeque<Row>,
    state: String,
    error_name: Option<String>,
}

impl PrestoCursor {
    fn new(session: Arc<PrestoSession>) -> Self {
        Self {
            session,
            query_id: None,
            next_uri: None,
            columns: Vec::new(),
            buffer: VecDeque::new(),
            state: String::new(),
            error_name: None,
        }
    }

    /// Folds one page into the cursor state.
    fn absorb(&mut self, page: QueryResults) -> Result<()> {
        if self.query_id.is_none() {
            debug!("Presto query id {}", page.id);
            self.query_id = Some(page.id);
        }
        if let Some(columns) = page.columns {
            if self.columns.is_empty() {
                self.columns = columns;
            }
        }
        if let Some(stats) = page.stats {
            self.state = stats.state;
        }
        if let Some(data) = page.data {
            for raw in data {
                let row = raw
                    .iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let type_name = self
                            .columns
                            .get(i)
                            .map(|c| c.type_name.as_str())
                            .unwrap_or("varchar");
                        convert_json(value, type_name)
                    })
                    .collect();
                self.buffer.push_back(row);
            }
        }
        self.next_uri = page.next_uri;

        if let Some(error) = page.error {
            self.next_uri = None;
            self.error_name = error.error_name.clone();
            return Err(ConduitError::query(match error.error_name {
                Some(name) => format!("{name}: {}", error.message),
                None => error.message,
            }));
        }
        Ok(())
    }

    /// Reads a protocol response, mapping HTTP failures into the taxonomy.
    async fn read_page(response: reqwest::Response) -> Result<Option<QueryResults>> {
        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| ConduitError::connection(format!("Failed to read response: {e}")))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConduitError::auth(format!("Presto rejected credentials: {body}")));
        }
        if !status.is_success() {
            return Err(ConduitError::query(format!("Presto error ({status}): {body}")));
        }

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ConduitError::query(format!("Failed to parse Presto response: {e}")))
    }

    /// Follows `nextUri` once.
    async fn advance(&mut self) -> Result<()> {
        let Some(next) = self.next_uri.clone() else {
            return Ok(());
        };
        let response = self
            .session
            .decorate(self.session.client.get(&next))
            .send()
            .await
            .map_err(|e| ConduitError::connection(format!("Presto request failed: {e}")))?;

        match Self::read_page(response).await? {
            Some(page) => self.absorb(page),
            None => {
                tokio::time::sleep(Duration::from_millis(BUSY_RETRY_DELAY_MS)).await;
                Ok(())
            }
        }
    }

    fn current_state(&self) -> PollState {
        if self.error_name.as_deref() == Some("USER_CANCELED") {
            return PollState::Canceled;
        }
        if self.error_name.is_some() {
            return PollState::Failed;
        }
        if !self.buffer.is_empty() {
            return PollState::Available;
        }
        if self.next_uri.is_none() {
            return match map_state(&self.state) {
                PollState::Failed | PollState::Canceled => map_state(&self.state),
                _ => PollState::Available,
            };
        }
        map_state(&self.state)
    }
}

#[async_trait]
impl Cursor for PrestoCursor {
    async fn execute(&mut self, statement: &str) -> Result<Submission> {
        let response = self
            .session
            .decorate(self.session.client.post(self.session.statement_url.clone()))
            .body(statement.to_string())
            .send()
            .await
            .map_err(|e| ConduitError::connection(format!("Presto request failed: {e}")))?;

        let page = Self::read_page(response)
            .await?
            .ok_or_else(|| ConduitError::query("Presto coordinator is busy"))?;
        self.absorb(page)?;

        Ok(if self.next_uri.is_some() {
            Submission::Pending
        } else {
            Submission::Finished
        })
    }

    async fn status(&mut self) -> Result<PollState> {
        if self.buffer.is_empty() && self.next_uri.is_some() {
            self.advance().await?;
        }
        Ok(self.current_state())
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        while self.buffer.len() < n && self.next_uri.is_some() {
            self.advance().await?;
        }
        let take = n.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    fn describe(&self) -> Vec<ColumnMeta> {
        self.columns.iter().map(|c| ColumnMeta::new(&c.name)).collect()
    }

    async fn close(&mut self) -> Result<()> {
        self.buffer.clear();
        if let Some(next) = self.next_uri.take() {
            let result = self
                .session
                .decorate(self.session.client.delete(&next))
                .send()
                .await;
            if let Err(e) = result {
                warn!("Failed to cancel Presto query {:?}: {}", self.query_id, e);
            }
        }
        Ok(())
    }
}

/// Maps a coordinator query state to a poll state.
fn map_state(state: &str) -> PollState {
    match state {
        "QUEUED" | "WAITING_FOR_RESOURCES" | "WAITING_FOR_PREREQUISITES" => PollState::Waiting,
        "PLANNING" | "STARTING" | "DISPATCHING" => PollState::Submitted,
        "FINISHED" => PollState::Available,
        "FAILED" => PollState::Failed,
        "CANCELED" => PollState::Canceled,
        _ => PollState::Running,
    }
}

/// Converts a JSON cell to a Value using the column's declared type.
fn convert_json(value: &serde_json::Value, type_name: &str) -> Value {
    use serde_json::Value as Json;

    if value.is_null() {
        return Value::Null;
    }
    let base = type_name
        .split('(')
        .next()
        .unwrap_or(type_name)
        .trim()
        .to_lowercase();
    let fallback = || match value {
        Json::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    };

    match base.as_str() {
        "tinyint" | "smallint" | "integer" => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::Int)
            .unwrap_or_else(fallback),
        "bigint" => value.as_i64().map(Value::BigInt).unwrap_or_else(fallback),
        "real" | "double" => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
            .map(Value::Float)
            .unwrap_or_else(fallback),
        "boolean" => value.as_bool().map(Value::Bool).unwrap_or_else(fallback),
        b if b == "date" || b.starts_with("time") => value
            .as_str()
            .map(|s| Value::Timestamp(s.to_string()))
            .unwrap_or_else(fallback),
        _ => fallback(),
    }
}
