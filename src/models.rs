use crate::intake::SubmissionOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Contact fields that must be present and non-blank.
pub const REQUIRED_FIELDS: [&str; 4] = ["firstName", "lastName", "email", "phone"];

/// Contact fields stored under `customer` in the record. Everything else
/// the form sends is treated as an item detail.
pub const CONTACT_FIELDS: [&str; 5] = ["firstName", "lastName", "email", "phone", "referralSource"];

// Spellings older form revisions used, mapped to the canonical names.
const FIELD_ALIASES: [(&str, &str); 12] = [
    ("first_name", "firstName"),
    ("last_name", "lastName"),
    ("phone_number", "phone"),
    ("phoneNumber", "phone"),
    ("referral_source", "referralSource"),
    ("hearAboutUs", "referralSource"),
    ("item_type", "itemType"),
    ("asking_price", "askingPrice"),
    ("year_of_purchase", "yearOfPurchase"),
    ("purchaseYear", "yearOfPurchase"),
    ("message", "notes"),
    ("comments", "notes"),
];

pub fn canonical_field_name(name: &str) -> &str {
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// A form submission as received, before anything leaves the process.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub fields: BTreeMap<String, Value>,
    pub images: Vec<ImageAttachment>,
    // canonical name -> alias whose value currently occupies it
    aliased: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub slot: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    /// A multipart file part.
    Raw {
        bytes: Vec<u8>,
        content_type: Option<String>,
        filename: Option<String>,
    },
    /// A base64 string, optionally carrying a `data:<mime>;base64,` prefix.
    Encoded(String),
}

impl Submission {
    /// Inserts a field under its canonical name. Nulls are dropped.
    ///
    /// An alias never displaces another value: if the canonical name is
    /// taken, the value is kept under the name it was sent with, and a
    /// later exact-name value moves an aliased one back to its own name.
    pub fn set_field(&mut self, name: &str, value: Value) {
        if value.is_null() {
            return;
        }
        let name = name.trim();
        let canonical = canonical_field_name(name);
        if canonical == name {
            if let Some(alias) = self.aliased.remove(canonical) {
                if let Some(previous) = self.fields.remove(canonical) {
                    self.fields.insert(alias, previous);
                }
            }
            self.fields.insert(name.to_string(), value);
        } else if self.fields.contains_key(canonical) {
            self.fields.insert(name.to_string(), value);
        } else {
            self.aliased
                .insert(canonical.to_string(), name.to_string());
            self.fields.insert(canonical.to_string(), value);
        }
    }

    /// Renders a field as text; numbers and booleans are stringified.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn full_name(&self) -> String {
        let first = self.text("firstName").unwrap_or_default();
        let last = self.text("lastName").unwrap_or_default();
        format!("{} {}", first.trim(), last.trim()).trim().to_string()
    }

    /// Returns the required fields that are absent or blank.
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|name| {
                self.text(name)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Checks the required contact fields. Runs before any remote call.
    pub fn validate(&self) -> Result<(), Vec<&'static str>> {
        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}

/// An image that made it to the store, keyed by the slot it was sent under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedImage {
    pub slot: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotFailure {
    pub slot: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<UploadedImage>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_images: Vec<SlotFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_sent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl SubmitResponse {
    pub fn failure(message: impl Into<String>, error: impl Into<String>, stage: &str) -> Self {
        Self {
            success: false,
            message: message.into(),
            uploaded_images: None,
            images: None,
            failed_images: Vec::new(),
            record_key: None,
            notification_sent: None,
            error: Some(error.into()),
            stage: Some(stage.to_string()),
        }
    }
}

impl From<SubmissionOutcome> for SubmitResponse {
    fn from(outcome: SubmissionOutcome) -> Self {
        Self {
            success: true,
            message: "Form submitted successfully".to_string(),
            uploaded_images: Some(outcome.images.iter().map(|i| i.url.clone()).collect()),
            images: Some(outcome.images),
            failed_images: outcome.failed_images,
            record_key: Some(outcome.record_key),
            notification_sent: Some(outcome.notification_sent),
            error: None,
            stage: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub shop_domain: String,
    pub api_version: String,
    pub metafield_namespace: String,
    pub smtp_configured: bool,
}
