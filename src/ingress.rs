//! Turns an incoming `/submit-form` request into a [`Submission`].
//!
//! Multipart, JSON and urlencoded bodies are accepted. Every rejection here
//! is a client error tagged with the `ingress` stage.

use crate::intake::IntakeError;
use crate::models::{ImageAttachment, ImageSource, Submission};
use axum::{
    Form,
    body::Bytes,
    extract::{FromRequest, Multipart, Request},
    http::header::CONTENT_TYPE,
};
use serde_json::Value;
use tracing::debug;

const STAGE: &str = "ingress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Multipart,
    Json,
    UrlEncoded,
    Other,
}

fn body_kind(content_type: Option<&str>) -> BodyKind {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match essence.as_str() {
        "multipart/form-data" => BodyKind::Multipart,
        "application/x-www-form-urlencoded" => BodyKind::UrlEncoded,
        ct if ct == "application/json" || ct.ends_with("+json") => BodyKind::Json,
        _ => BodyKind::Other,
    }
}

/// How a named form part is treated.
#[derive(Debug, PartialEq, Eq)]
enum PartRole {
    Field,
    /// An image; `None` means the slot is assigned by position.
    Image(Option<String>),
}

fn part_role(name: &str) -> PartRole {
    let rest = name
        .strip_prefix("images")
        .or_else(|| name.strip_prefix("image"));
    match rest {
        Some("") | Some("[]") => PartRole::Image(None),
        Some(rest) => {
            let slot = rest
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .or_else(|| rest.strip_prefix('.'))
                .map(str::trim)
                .filter(|slot| !slot.is_empty());
            match slot {
                Some(slot) => PartRole::Image(Some(slot.to_string())),
                None => PartRole::Field,
            }
        }
        None => PartRole::Field,
    }
}

fn push_image(
    submission: &mut Submission,
    slot: Option<String>,
    source: ImageSource,
    max_images: usize,
) -> Result<(), IntakeError> {
    if submission.images.len() >= max_images {
        return Err(IntakeError::invalid_input(
            STAGE,
            format!("too many images: at most {max_images} are accepted"),
        ));
    }
    let slot = slot.unwrap_or_else(|| format!("image_{}", submission.images.len() + 1));
    submission.images.push(ImageAttachment { slot, source });
    Ok(())
}

pub async fn extract_submission(
    request: Request,
    max_images: usize,
) -> Result<Submission, IntakeError> {
    let kind = body_kind(
        request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
    );
    debug!(target: "appraisal.ingress", ?kind, "parsing submission body");

    match kind {
        BodyKind::Multipart => {
            let multipart = Multipart::from_request(request, &())
                .await
                .map_err(|rejection| IntakeError::invalid_input(STAGE, rejection.body_text()))?;
            from_multipart(multipart, max_images).await
        }
        BodyKind::UrlEncoded => {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
                .await
                .map_err(|rejection| IntakeError::invalid_input(STAGE, rejection.body_text()))?;
            from_pairs(pairs, max_images)
        }
        BodyKind::Json => {
            let body = read_body(request).await?;
            let value: Value = serde_json::from_slice(&body).map_err(|err| {
                IntakeError::invalid_input(STAGE, format!("malformed JSON body: {err}"))
            })?;
            from_json(value, max_images)
        }
        BodyKind::Other => {
            let body = read_body(request).await?;
            match serde_json::from_slice::<Value>(&body) {
                Ok(value @ Value::Object(_)) => from_json(value, max_images),
                // Fall through to validation, which names the missing fields.
                _ => Ok(Submission::default()),
            }
        }
    }
}

async fn read_body(request: Request) -> Result<Bytes, IntakeError> {
    Bytes::from_request(request, &())
        .await
        .map_err(|rejection| IntakeError::invalid_input(STAGE, rejection.body_text()))
}

async fn from_multipart(
    mut multipart: Multipart,
    max_images: usize,
) -> Result<Submission, IntakeError> {
    let mut submission = Submission::default();
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        IntakeError::invalid_input(STAGE, format!("failed to read multipart: {}", err.body_text()))
    })? {
        let name = field.name().map(str::to_string).unwrap_or_default();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        let role = match (part_role(&name), &filename) {
            (PartRole::Field, Some(_)) => PartRole::Image(Some(name.clone())),
            (role, _) => role,
        };

        match role {
            PartRole::Image(slot) if filename.is_some() => {
                let bytes = field.bytes().await.map_err(|err| {
                    IntakeError::invalid_input(
                        STAGE,
                        format!("failed to read image `{name}`: {}", err.body_text()),
                    )
                })?;
                if bytes.is_empty() {
                    continue;
                }
                let source = ImageSource::Raw {
                    bytes: bytes.to_vec(),
                    content_type,
                    filename,
                };
                push_image(&mut submission, slot, source, max_images)?;
            }
            role => {
                let text = field.text().await.map_err(|err| {
                    IntakeError::invalid_input(
                        STAGE,
                        format!("failed to read field `{name}`: {}", err.body_text()),
                    )
                })?;
                match role {
                    PartRole::Image(slot) => {
                        if !text.trim().is_empty() {
                            push_image(
                                &mut submission,
                                slot,
                                ImageSource::Encoded(text),
                                max_images,
                            )?;
                        }
                    }
                    PartRole::Field => submission.set_field(&name, Value::String(text)),
                }
            }
        }
    }
    Ok(submission)
}

fn from_pairs(pairs: Vec<(String, String)>, max_images: usize) -> Result<Submission, IntakeError> {
    let mut submission = Submission::default();
    for (name, value) in pairs {
        match part_role(&name) {
            PartRole::Image(slot) => {
                if !value.trim().is_empty() {
                    push_image(&mut submission, slot, ImageSource::Encoded(value), max_images)?;
                }
            }
            PartRole::Field => submission.set_field(&name, Value::String(value)),
        }
    }
    Ok(submission)
}

fn from_json(value: Value, max_images: usize) -> Result<Submission, IntakeError> {
    let Value::Object(map) = value else {
        return Err(IntakeError::invalid_input(
            STAGE,
            "request body must be a JSON object",
        ));
    };
    let mut submission = Submission::default();
    for (name, value) in map {
        if name == "images" {
            collect_encoded_images(&mut submission, value, max_images)?;
        } else {
            submission.set_field(&name, value);
        }
    }
    Ok(submission)
}

fn collect_encoded_images(
    submission: &mut Submission,
    images: Value,
    max_images: usize,
) -> Result<(), IntakeError> {
    let entries: Vec<(String, Value)> = match images {
        Value::Null => return Ok(()),
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (format!("image_{}", index + 1), item))
            .collect(),
        Value::String(single) => vec![("image_1".to_string(), Value::String(single))],
        _ => {
            return Err(IntakeError::invalid_input(
                STAGE,
                "`images` must be an object of slot to base64 string",
            ));
        }
    };

    for (slot, entry) in entries {
        match entry {
            Value::Null => {}
            Value::String(data) if data.trim().is_empty() => {}
            Value::String(data) => {
                push_image(submission, Some(slot), ImageSource::Encoded(data), max_images)?;
            }
            _ => {
                return Err(IntakeError::invalid_input(
                    STAGE,
                    format!("image `{slot}` must be a base64 string"),
                ));
            }
        }
    }
    Ok(())
}
