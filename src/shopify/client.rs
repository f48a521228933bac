use crate::config::{HttpConfig, ShopifyConfig};
use crate::http::build_client;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

// Upstream bodies are logged and reported up to this many bytes.
const BODY_PREVIEW_LIMIT: usize = 2048;

#[derive(Debug, Error)]
pub enum ShopifyError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("graphql errors: {}", .0.join("; "))]
    Graphql(Vec<String>),
    #[error("user errors: {}", join_user_errors(.0))]
    UserErrors(Vec<UserError>),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("response is missing {0}")]
    MissingData(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserError {
    #[serde(default)]
    pub field: Option<Vec<String>>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl UserError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: Some(vec![field.to_string()]),
            message: message.to_string(),
            code: None,
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(path) if !path.is_empty() => write!(f, "{}: {}", path.join("."), self.message),
            _ => f.write_str(&self.message),
        }
    }
}

fn join_user_errors(errors: &[UserError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Turns a non-empty `userErrors` list into an error. Shopify reports
/// business failures this way inside an HTTP 200 response.
pub fn check_user_errors(errors: Vec<UserError>) -> Result<(), ShopifyError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ShopifyError::UserErrors(errors))
    }
}

#[derive(Serialize)]
struct GraphqlRequest<'a, V> {
    query: &'a str,
    variables: V,
}

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlErrorEntry>,
}

#[derive(Deserialize)]
struct GraphqlErrorEntry {
    message: String,
}

/// Admin API client bound to one store.
#[derive(Debug, Clone)]
pub struct ShopifyClient {
    http: Client,
    endpoint: String,
    access_token: String,
    pub(crate) owner_id: String,
}

impl ShopifyClient {
    pub fn new(config: &ShopifyConfig, http: &HttpConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: build_client(http)?,
            endpoint: config.graphql_endpoint(),
            access_token: config.access_token.clone(),
            owner_id: config.owner_id.clone(),
        })
    }

    /// Posts one GraphQL operation and returns its `data` member.
    pub async fn execute<V, T>(
        &self,
        operation: &'static str,
        query: &str,
        variables: V,
    ) -> Result<T, ShopifyError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(&GraphqlRequest { query, variables })
            .send()
            .await
            .map_err(|err| {
                warn!(target: "appraisal.shopify", operation, error = %err, "transport_failed");
                ShopifyError::Transport(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ShopifyError::Transport(err.to_string()))?;
        debug!(
            target: "appraisal.shopify",
            operation,
            status = status.as_u16(),
            bytes = body.len(),
            "graphql_response"
        );
        let parsed = parse_response(status, &body);
        if let Err(err) = &parsed {
            warn!(
                target: "appraisal.shopify",
                operation,
                status = status.as_u16(),
                error = %err,
                body = %preview(&body),
                "graphql_call_failed"
            );
        }
        parsed
    }
}

pub(crate) fn parse_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
) -> Result<T, ShopifyError> {
    if !status.is_success() {
        return Err(ShopifyError::Status {
            status: status.as_u16(),
            body: preview(body),
        });
    }
    let envelope: GraphqlResponse<T> =
        serde_json::from_str(body).map_err(|err| ShopifyError::Decode(err.to_string()))?;
    if !envelope.errors.is_empty() {
        return Err(ShopifyError::Graphql(
            envelope.errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    envelope.data.ok_or(ShopifyError::MissingData("data"))
}

fn preview(body: &str) -> String {
    if body.len() <= BODY_PREVIEW_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_PREVIEW_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
