use crate::models::{Submission, UploadedImage};
use std::fmt::Write as _;

pub const SUBJECT: &str = "New item submission";

/// A rendered staff notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

// Label, field pairs listed under the contact block when present.
const SUMMARY_FIELDS: [(&str, &str); 4] = [
    ("Phone", "phone"),
    ("Category", "category"),
    ("Asking price", "askingPrice"),
    ("Year of purchase", "yearOfPurchase"),
];

pub fn compose(submission: &Submission, images: &[UploadedImage]) -> NotificationEmail {
    let name = submission.full_name();
    let email = submission.text("email").unwrap_or_default();
    let notes = submission.text("notes").unwrap_or_default();

    let mut html = String::new();
    html.push_str("<h2>New item submission</h2>\n");
    let _ = writeln!(html, "<p><strong>Name:</strong> {}</p>", escape_html(&name));
    let _ = writeln!(
        html,
        "<p><strong>Email:</strong> {}</p>",
        escape_html(&email)
    );
    for (label, field) in SUMMARY_FIELDS {
        if let Some(value) = submission.text(field).filter(|v| !v.trim().is_empty()) {
            let _ = writeln!(
                html,
                "<p><strong>{label}:</strong> {}</p>",
                escape_html(&value)
            );
        }
    }
    let _ = writeln!(
        html,
        "<p><strong>Message:</strong></p>\n<p>{}</p>",
        escape_html(&notes).replace('\n', "<br>")
    );
    if !images.is_empty() {
        html.push_str("<h3>Images</h3>\n<div>\n");
        for image in images {
            let _ = writeln!(
                html,
                "<p>{slot}</p>\n<img src=\"{url}\" alt=\"{slot}\" style=\"max-width:400px;margin:8px 0;\">",
                slot = escape_html(&image.slot),
                url = escape_html(&image.url),
            );
        }
        html.push_str("</div>\n");
    }

    let mut text = format!("New item submission\n\nName: {name}\nEmail: {email}\n");
    for (label, field) in SUMMARY_FIELDS {
        if let Some(value) = submission.text(field).filter(|v| !v.trim().is_empty()) {
            let _ = writeln!(text, "{label}: {value}");
        }
    }
    let _ = writeln!(text, "\nMessage:\n{notes}");
    if !images.is_empty() {
        text.push_str("\nImages:\n");
        for image in images {
            let _ = writeln!(text, "- {}: {}", image.slot, image.url);
        }
    }

    NotificationEmail {
        subject: SUBJECT.to_string(),
        html,
        text,
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> Submission {
        let mut s = Submission::default();
        s.set_field("firstName", json!("Ada"));
        s.set_field("lastName", json!("Lovelace"));
        s.set_field("email", json!("ada@example.com"));
        s.set_field("phone", json!("555-0100"));
        s.set_field("notes", json!("Box & papers\nincluded <original>"));
        s
    }

    #[test]
    fn images_block_is_omitted_without_images() {
        let email = compose(&submission(), &[]);
        assert_eq!(email.subject, SUBJECT);
        assert!(email.html.contains("Ada Lovelace"));
        assert!(email.html.contains("ada@example.com"));
        assert!(!email.html.contains("<img"));
        assert!(!email.html.contains("Images"));
        assert!(!email.text.contains("Images:"));
    }

    #[test]
    fn each_image_gets_a_tag() {
        let images = vec![
            UploadedImage {
                slot: "front".into(),
                url: "https://cdn.shopify.com/f.jpg".into(),
                id: None,
            },
            UploadedImage {
                slot: "back".into(),
                url: "https://cdn.shopify.com/b.jpg".into(),
                id: None,
            },
        ];
        let email = compose(&submission(), &images);
        assert_eq!(email.html.matches("<img").count(), 2);
        assert!(email.html.contains("src=\"https://cdn.shopify.com/b.jpg\""));
        assert!(email.text.contains("- front: https://cdn.shopify.com/f.jpg"));
    }

    #[test]
    fn user_text_is_escaped() {
        let email = compose(&submission(), &[]);
        assert!(email.html.contains("Box &amp; papers<br>included &lt;original&gt;"));
        assert!(!email.html.contains("<original>"));
        assert!(email.html.contains("<strong>Phone:</strong> 555-0100"));
    }
}
