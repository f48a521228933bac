//! Service configuration loaded from environment variables.
//!
//! Everything is read once at startup into [`AppConfig`] and handed to the
//! components that need it. Nothing below `main` looks at the environment.

use lettre::message::Mailbox;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_VERSION: &str = "2024-10";
const DEFAULT_NAMESPACE: &str = "item_submissions";
const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
const DEFAULT_BODY_LIMIT: usize = 50 * 1024 * 1024;
const DEFAULT_MAX_IMAGES: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the metafield key is chosen for each submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// A fresh time-derived key per submission; nothing is overwritten.
    PerSubmission,
    /// Every submission writes the same key; the latest one wins.
    Fixed(String),
}

/// What a failed notification email does to the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    Required,
    BestEffort,
}

impl NotifyPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "required" | "strict" => Some(Self::Required),
            "best_effort" | "warn" => Some(Self::BestEffort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub store_domain: String,
    pub access_token: String,
    pub api_version: String,
    /// GID of the shop object that owns every submission metafield.
    pub owner_id: String,
    pub namespace: String,
    pub key_strategy: KeyStrategy,
}

impl ShopifyConfig {
    pub fn graphql_endpoint(&self) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            self.store_domain, self.api_version
        )
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: Mailbox,
    pub to: Mailbox,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub shopify: ShopifyConfig,
    pub smtp: SmtpConfig,
    pub http: HttpConfig,
    pub notify_policy: NotifyPolicy,
    pub max_body_bytes: usize,
    pub max_images: usize,
    pub request_deadline: Duration,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let store_domain = normalize_domain(&require("SHOPIFY_STORE_DOMAIN")?);
        let access_token = require("SHOPIFY_ACCESS_TOKEN")?;
        let owner_id = shop_gid(&require("SHOPIFY_SHOP_ID")?);
        let username = require("SMTP_USERNAME")?;
        let password = require("SMTP_PASSWORD")?;
        let to = parse_mailbox("NOTIFY_EMAIL_TO", &require("NOTIFY_EMAIL_TO")?)?;
        let from_raw = get("NOTIFY_EMAIL_FROM").unwrap_or_else(|| username.clone());
        let from = parse_mailbox("NOTIFY_EMAIL_FROM", &from_raw)?;

        let key_strategy = match get("METAFIELD_KEY") {
            Some(key) => KeyStrategy::Fixed(metafield_handle("METAFIELD_KEY", key, 2, 64)?),
            None => KeyStrategy::PerSubmission,
        };
        let namespace = match get("METAFIELD_NAMESPACE") {
            Some(namespace) => metafield_handle("METAFIELD_NAMESPACE", namespace, 3, 255)?,
            None => DEFAULT_NAMESPACE.to_string(),
        };
        let notify_policy = match get("NOTIFY_FAILURE_POLICY") {
            Some(raw) => NotifyPolicy::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "NOTIFY_FAILURE_POLICY",
                reason: format!("expected `required` or `best_effort`, got `{raw}`"),
            })?,
            None => NotifyPolicy::Required,
        };

        let max_images = parse_or("MAX_IMAGES", get("MAX_IMAGES"), DEFAULT_MAX_IMAGES)?;
        if max_images == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_IMAGES",
                reason: "must be at least 1".into(),
            });
        }

        let allowed_origins = match get("CORS_ALLOWED_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            None => default_origins(&store_domain),
        };

        Ok(Self {
            port: parse_or("PORT", get("PORT"), 3000)?,
            shopify: ShopifyConfig {
                store_domain,
                access_token,
                api_version: get("SHOPIFY_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
                owner_id,
                namespace,
                key_strategy,
            },
            smtp: SmtpConfig {
                host: get("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
                port: parse_or("SMTP_PORT", get("SMTP_PORT"), 587)?,
                username,
                password,
                from,
                to,
                timeout: Duration::from_secs(parse_or(
                    "SMTP_TIMEOUT_SECS",
                    get("SMTP_TIMEOUT_SECS"),
                    20,
                )?),
            },
            http: HttpConfig {
                timeout: Duration::from_secs(parse_or(
                    "HTTP_TIMEOUT_SECS",
                    get("HTTP_TIMEOUT_SECS"),
                    15,
                )?),
                connect_timeout: Duration::from_secs(parse_or(
                    "HTTP_CONNECT_TIMEOUT_SECS",
                    get("HTTP_CONNECT_TIMEOUT_SECS"),
                    5,
                )?),
            },
            notify_policy,
            max_body_bytes: parse_or(
                "REQUEST_MAX_BYTES",
                get("REQUEST_MAX_BYTES"),
                DEFAULT_BODY_LIMIT,
            )?,
            max_images,
            request_deadline: Duration::from_secs(parse_or(
                "REQUEST_DEADLINE_SECS",
                get("REQUEST_DEADLINE_SECS"),
                120,
            )?),
            allowed_origins,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a valid number"),
        }),
        None => Ok(default),
    }
}

/// Metafield namespaces and keys: ASCII alphanumerics, `-` and `_`, within
/// the store's length bounds.
fn metafield_handle(
    key: &'static str,
    value: String,
    min: usize,
    max: usize,
) -> Result<String, ConfigError> {
    if !(min..=max).contains(&value.len()) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("must be {min}-{max} characters, got {}", value.len()),
        });
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("`{bad}` is not allowed; use letters, digits, `-` or `_`"),
        });
    }
    Ok(value)
}

fn parse_mailbox(key: &'static str, raw: &str) -> Result<Mailbox, ConfigError> {
    raw.parse().map_err(|err| ConfigError::Invalid {
        key,
        reason: format!("{err}"),
    })
}

fn normalize_domain(raw: &str) -> String {
    raw.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

fn shop_gid(raw: &str) -> String {
    if raw.starts_with("gid://") {
        raw.to_string()
    } else {
        format!("gid://shopify/Shop/{raw}")
    }
}

fn default_origins(store_domain: &str) -> Vec<String> {
    vec![
        format!("https://{store_domain}"),
        "https://admin.shopify.com".to_string(),
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig::from_lookup(|key| base_env(key).map(str::to_string)).expect("test config")
}

#[cfg(test)]
fn base_env(key: &str) -> Option<&'static str> {
    match key {
        "SHOPIFY_STORE_DOMAIN" => Some("demo-store.myshopify.com"),
        "SHOPIFY_ACCESS_TOKEN" => Some("shpat_test"),
        "SHOPIFY_SHOP_ID" => Some("12345"),
        "SMTP_USERNAME" => Some("mailer@example.com"),
        "SMTP_PASSWORD" => Some("app-password"),
        "NOTIFY_EMAIL_TO" => Some("staff@example.com"),
        _ => None,
    }
}
