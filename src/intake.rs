use crate::config::{AppConfig, KeyStrategy, NotifyPolicy};
use crate::mailer::MailError;
use crate::metrics;
use crate::models::{
    CONTACT_FIELDS, ImageAttachment, ImageSource, SlotFailure, Submission, UploadedImage,
};
use crate::notify::{self, NotificationEmail};
use crate::shopify::{MetafieldRecord, ShopifyError};
use async_trait::async_trait;
use base64::{
    Engine, alphabet,
    engine::{
        DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig,
        general_purpose::STANDARD as BASE64,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

// Browsers and mobile clients disagree on padding; accept both.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const DEFAULT_ENCODED_MIME: &str = "image/jpeg";
const FALLBACK_MIME: &str = "application/octet-stream";

#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload_image(&self, upload: &ImageUpload) -> Result<RemoteFile, ShopifyError>;
}

#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Writes the record and returns the remote identifier.
    async fn write_record(&self, record: &MetafieldRecord) -> Result<String, ShopifyError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(&self, email: &NotificationEmail) -> Result<(), MailError>;
}

#[async_trait]
pub trait ShopDiagnostics: Send + Sync {
    async fn shop_info(&self) -> Result<Value, ShopifyError>;
}

/// One image ready to be sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub slot: String,
    pub filename: String,
    pub content_type: String,
    /// Length of the decoded image, not of the base64 text.
    pub byte_size: usize,
    pub data_base64: String,
}

impl ImageUpload {
    fn from_bytes(slot: &str, filename: String, content_type: String, bytes: &[u8]) -> Self {
        Self {
            slot: slot.to_string(),
            filename,
            content_type,
            byte_size: bytes.len(),
            data_base64: BASE64.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: Option<String>,
    pub url: String,
}

/// Outcome of a relay batch. Failed images never abort the batch.
#[derive(Debug, Default)]
pub struct RelayReport {
    pub succeeded: Vec<UploadedImage>,
    pub failed: Vec<SlotFailure>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("data uri has no payload separator")]
    MalformedDataUri,
    #[error("data uri is not base64 encoded")]
    NotBase64DataUri,
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("image is empty")]
    Empty,
}

/// Splits an optional `data:<mime>;base64,` prefix from the payload.
pub fn split_data_uri(raw: &str) -> Result<(Option<String>, &str), DecodeError> {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Ok((None, trimmed));
    };
    let (header, payload) = rest
        .split_once(',')
        .ok_or(DecodeError::MalformedDataUri)?;
    let mut params = header.split(';');
    let mime = params
        .next()
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .map(str::to_ascii_lowercase);
    if !params.any(|param| param.trim().eq_ignore_ascii_case("base64")) {
        return Err(DecodeError::NotBase64DataUri);
    }
    Ok((mime, payload))
}

pub fn decode_base64_image(raw: &str) -> Result<(Option<String>, Vec<u8>), DecodeError> {
    let (mime, payload) = split_data_uri(raw)?;
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = LENIENT_BASE64
        .decode(compact.as_bytes())
        .map_err(|err| DecodeError::InvalidBase64(err.to_string()))?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok((mime, bytes))
}

pub fn prepare_upload(attachment: &ImageAttachment) -> Result<ImageUpload, DecodeError> {
    let slot = attachment.slot.as_str();
    match &attachment.source {
        ImageSource::Raw {
            bytes,
            content_type,
            filename,
        } => {
            if bytes.is_empty() {
                return Err(DecodeError::Empty);
            }
            let filename = filename.clone().filter(|name| !name.trim().is_empty());
            let content_type = content_type
                .clone()
                .filter(|ct| !ct.is_empty() && ct != FALLBACK_MIME)
                .or_else(|| {
                    filename
                        .as_deref()
                        .and_then(mime_from_filename)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| FALLBACK_MIME.to_string());
            let filename =
                filename.unwrap_or_else(|| format!("{slot}.{}", extension_for(&content_type)));
            Ok(ImageUpload::from_bytes(slot, filename, content_type, bytes))
        }
        ImageSource::Encoded(raw) => {
            let (mime, bytes) = decode_base64_image(raw)?;
            let content_type = mime.unwrap_or_else(|| DEFAULT_ENCODED_MIME.to_string());
            let filename = format!("{slot}.{}", extension_for(&content_type));
            Ok(ImageUpload::from_bytes(slot, filename, content_type, &bytes))
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "image/heif" => "heif",
        "image/avif" => "avif",
        _ => "bin",
    }
}

fn mime_from_filename(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

/// Uploads every attachment in order, one at a time. No retries.
pub async fn relay_images(
    uploader: &dyn ImageUploader,
    attachments: &[ImageAttachment],
) -> RelayReport {
    let mut report = RelayReport::default();
    for attachment in attachments {
        let upload = match prepare_upload(attachment) {
            Ok(upload) => upload,
            Err(err) => {
                warn!(
                    target: "appraisal.intake",
                    slot = %attachment.slot,
                    error = %err,
                    "image_decode_failed"
                );
                report.failed.push(SlotFailure {
                    slot: attachment.slot.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };
        match uploader.upload_image(&upload).await {
            Ok(file) => report.succeeded.push(UploadedImage {
                slot: upload.slot,
                url: file.url,
                id: file.id,
            }),
            Err(err) => {
                warn!(
                    target: "appraisal.intake",
                    slot = %upload.slot,
                    filename = %upload.filename,
                    bytes = upload.byte_size,
                    error = %err,
                    "image_upload_failed"
                );
                report.failed.push(SlotFailure {
                    slot: upload.slot,
                    error: err.to_string(),
                });
            }
        }
    }
    metrics::images_relayed(report.succeeded.len(), report.failed.len());
    report
}

/// Contact values exactly as submitted, numbers included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub first_name: Value,
    pub last_name: Value,
    pub email: Value,
    pub phone: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_source: Option<Value>,
}

/// Item fields; only the ones relevant to the submitted category are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asking_price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_of_purchase: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Value>,
    /// Any other field the form sent, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The JSON document stored in the submission metafield.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    /// Taken right before the remote write, not at request receipt.
    pub submitted_at: DateTime<Utc>,
    pub customer: CustomerInfo,
    pub item: ItemDetails,
    pub images: Vec<UploadedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_images: Vec<SlotFailure>,
}

pub fn build_record(
    submission: &Submission,
    report: &RelayReport,
    submitted_at: DateTime<Utc>,
) -> Result<SubmissionRecord, IntakeError> {
    let item_fields: Map<String, Value> = submission
        .fields
        .iter()
        .filter(|(name, _)| !CONTACT_FIELDS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let item: ItemDetails = serde_json::from_value(Value::Object(item_fields))
        .map_err(|err| IntakeError::internal("write_record", err.to_string()))?;
    let field = |name: &str| submission.fields.get(name).cloned();

    Ok(SubmissionRecord {
        submitted_at,
        customer: CustomerInfo {
            first_name: field("firstName").unwrap_or_default(),
            last_name: field("lastName").unwrap_or_default(),
            email: field("email").unwrap_or_default(),
            phone: field("phone").unwrap_or_default(),
            referral_source: field("referralSource"),
        },
        item,
        images: report.succeeded.clone(),
        failed_images: report.failed.clone(),
    })
}

pub fn record_key(strategy: &KeyStrategy, now: DateTime<Utc>) -> String {
    match strategy {
        KeyStrategy::Fixed(key) => key.clone(),
        KeyStrategy::PerSubmission => {
            let suffix = Uuid::new_v4().simple().to_string();
            format!(
                "submission_{}_{}",
                now.format("%Y%m%d%H%M%S"),
                &suffix[..8]
            )
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct IntakeError {
    stage: &'static str,
    message: String,
    kind: IntakeErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeErrorKind {
    InvalidInput,
    Upstream,
    Internal,
}

impl IntakeError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: IntakeErrorKind::InvalidInput,
        }
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: IntakeErrorKind::Upstream,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: IntakeErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> IntakeErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub namespace: String,
    pub key_strategy: KeyStrategy,
    pub notify_policy: NotifyPolicy,
}

impl IntakeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            namespace: config.shopify.namespace.clone(),
            key_strategy: config.shopify.key_strategy.clone(),
            notify_policy: config.notify_policy,
        }
    }
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub record_key: String,
    pub record_id: String,
    pub images: Vec<UploadedImage>,
    pub failed_images: Vec<SlotFailure>,
    pub notification_sent: bool,
}

#[derive(Clone)]
pub struct IntakeService {
    uploader: Arc<dyn ImageUploader>,
    writer: Arc<dyn RecordWriter>,
    notifier: Arc<dyn Notifier>,
    settings: IntakeSettings,
}

impl IntakeService {
    pub fn new(
        uploader: Arc<dyn ImageUploader>,
        writer: Arc<dyn RecordWriter>,
        notifier: Arc<dyn Notifier>,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            uploader,
            writer,
            notifier,
            settings,
        }
    }

    /// validate → relay images → write record → notify.
    pub async fn submit(&self, submission: Submission) -> Result<SubmissionOutcome, IntakeError> {
        submission.validate().map_err(|missing| {
            IntakeError::invalid_input(
                "validate",
                format!("missing required fields: {}", missing.join(", ")),
            )
        })?;

        let started = Instant::now();
        let report = relay_images(self.uploader.as_ref(), &submission.images).await;
        metrics::stage_elapsed("upload_images", started.elapsed().as_millis());

        let started = Instant::now();
        let submitted_at = Utc::now();
        let key = record_key(&self.settings.key_strategy, submitted_at);
        let record = build_record(&submission, &report, submitted_at)?;
        let value = serde_json::to_string(&record)
            .map_err(|err| IntakeError::internal("write_record", err.to_string()))?;
        let metafield = MetafieldRecord {
            namespace: self.settings.namespace.clone(),
            key: key.clone(),
            value,
        };
        let record_id = self
            .writer
            .write_record(&metafield)
            .await
            .map_err(|err| {
                error!(
                    target: "appraisal.intake",
                    namespace = %metafield.namespace,
                    key = %metafield.key,
                    error = %err,
                    "record_write_failed"
                );
                IntakeError::upstream("write_record", err.to_string())
            })?;
        metrics::stage_elapsed("write_record", started.elapsed().as_millis());

        let started = Instant::now();
        let email = notify::compose(&submission, &report.succeeded);
        let notification_sent = match self.notifier.send_notification(&email).await {
            Ok(()) => true,
            Err(err) => match self.settings.notify_policy {
                NotifyPolicy::Required => {
                    error!(
                        target: "appraisal.intake",
                        key = %key,
                        error = %err,
                        "notification_failed"
                    );
                    return Err(IntakeError::upstream("notify", err.to_string()));
                }
                NotifyPolicy::BestEffort => {
                    warn!(
                        target: "appraisal.intake",
                        key = %key,
                        error = %err,
                        "notification_failed_ignored"
                    );
                    false
                }
            },
        };
        metrics::stage_elapsed("notify", started.elapsed().as_millis());

        info!(
            target: "appraisal.intake",
            key = %key,
            images = report.succeeded.len(),
            failed_images = report.failed.len(),
            notification_sent,
            "submission_stored"
        );

        Ok(SubmissionOutcome {
            record_key: key,
            record_id,
            images: report.succeeded,
            failed_images: report.failed,
            notification_sent,
        })
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::shopify::UserError;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeShop {
        pub reject_slots: Vec<&'static str>,
        pub record_errors: Vec<UserError>,
        /// Added to every upload, for deadline tests.
        pub upload_delay: Option<Duration>,
        pub fail_diagnostics: bool,
        pub uploads: Mutex<Vec<ImageUpload>>,
        pub records: Mutex<Vec<MetafieldRecord>>,
    }

    impl FakeShop {
        pub fn upload_count(&self) -> usize {
            self.uploads.lock().unwrap().len()
        }

        pub fn record_count(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub fn last_record_value(&self) -> Value {
            let records = self.records.lock().unwrap();
            let record = records.last().expect("a record was written");
            serde_json::from_str(&record.value).expect("record value is json")
        }
    }

    #[async_trait]
    impl ImageUploader for FakeShop {
        async fn upload_image(&self, upload: &ImageUpload) -> Result<RemoteFile, ShopifyError> {
            if let Some(delay) = self.upload_delay {
                tokio::time::sleep(delay).await;
            }
            self.uploads.lock().unwrap().push(upload.clone());
            if self.reject_slots.contains(&upload.slot.as_str()) {
                return Err(ShopifyError::UserErrors(vec![UserError::new(
                    "originalSource",
                    "Image could not be processed",
                )]));
            }
            Ok(RemoteFile {
                id: Some(format!("gid://shopify/MediaImage/{}", upload.slot)),
                url: format!("https://cdn.shopify.com/s/files/{}", upload.filename),
            })
        }
    }

    #[async_trait]
    impl RecordWriter for FakeShop {
        async fn write_record(&self, record: &MetafieldRecord) -> Result<String, ShopifyError> {
            self.records.lock().unwrap().push(record.clone());
            if !self.record_errors.is_empty() {
                return Err(ShopifyError::UserErrors(self.record_errors.clone()));
            }
            Ok("gid://shopify/Metafield/1".to_string())
        }
    }

    #[async_trait]
    impl ShopDiagnostics for FakeShop {
        async fn shop_info(&self) -> Result<Value, ShopifyError> {
            if self.fail_diagnostics {
                return Err(ShopifyError::Status {
                    status: 401,
                    body: r#"{"errors":"[API] Invalid API key or access token"}"#.into(),
                });
            }
            Ok(serde_json::json!({ "id": "gid://shopify/Shop/12345", "name": "Demo Store" }))
        }
    }

    #[derive(Default)]
    pub struct FakeMailer {
        pub fail: bool,
        pub sent: Mutex<Vec<NotificationEmail>>,
    }

    impl FakeMailer {
        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for FakeMailer {
        async fn send_notification(&self, email: &NotificationEmail) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Send("535 authentication failed".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }
}
