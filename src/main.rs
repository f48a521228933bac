mod config;
mod cors;
mod http;
mod ingress;
mod intake;
mod mailer;
mod metrics;
mod models;
mod notify;
mod shopify;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use eyre::WrapErr;
use intake::{IntakeError, IntakeErrorKind, IntakeService, IntakeSettings, ShopDiagnostics};
use mailer::SmtpNotifier;
use models::{ConnectivityResponse, HealthResponse, SubmitResponse};
use shopify::ShopifyClient;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target: "appraisal.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().wrap_err("invalid configuration")?;
    let shop = Arc::new(
        ShopifyClient::new(&config.shopify, &config.http)
            .wrap_err("failed to build admin api client")?,
    );
    let notifier =
        Arc::new(SmtpNotifier::new(&config.smtp).wrap_err("failed to set up smtp notifier")?);
    let intake = IntakeService::new(
        shop.clone(),
        shop.clone(),
        notifier,
        IntakeSettings::from_config(&config),
    );

    info!(
        target: "appraisal.api",
        shop = %config.shopify.store_domain,
        api_version = %config.shopify.api_version,
        namespace = %config.shopify.namespace,
        "configuration loaded"
    );

    let port = config.port;
    let app = build_router(AppState {
        intake: Arc::new(intake),
        diagnostics: shop,
        config: Arc::new(config),
    });

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target: "appraisal.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("server error")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    intake: Arc<IntakeService>,
    diagnostics: Arc<dyn ShopDiagnostics>,
    config: Arc<AppConfig>,
}

fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors::build_cors(&state.config.allowed_origins))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/test", get(test_connection).post(test_connection))
        .route("/submit-form", post(submit_form))
        .with_state(state)
        .layer(middleware)
}

async fn root() -> &'static str {
    "appraisal api is running"
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Checks that the Admin API token works by reading the shop.
///
/// - Method: `GET` or `POST`
/// - Path: `/test`
///
/// Never echoes credentials; reports whether SMTP settings are present.
async fn test_connection(State(state): State<AppState>) -> (StatusCode, Json<ConnectivityResponse>) {
    metrics::inc_requests("/test");
    let cfg = &state.config;
    let (status, shop, error) = match state.diagnostics.shop_info().await {
        Ok(shop) => (StatusCode::OK, Some(shop), None),
        Err(err) => {
            warn!(target: "appraisal.api", error = %err, "shop connectivity check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, None, Some(err.to_string()))
        }
    };
    let body = ConnectivityResponse {
        success: error.is_none(),
        shop,
        error,
        shop_domain: cfg.shopify.store_domain.clone(),
        api_version: cfg.shopify.api_version.clone(),
        metafield_namespace: cfg.shopify.namespace.clone(),
        smtp_configured: !cfg.smtp.username.is_empty() && !cfg.smtp.password.is_empty(),
    };
    (status, Json(body))
}

/// Accepts an item submission.
///
/// - Method: `POST`
/// - Path: `/submit-form`
/// - Body: multipart form, JSON object or urlencoded form
/// - Response: `SubmitResponse`
///
/// Images are relayed one by one, the record is written, then staff are
/// emailed. The whole run is bounded by the request deadline.
async fn submit_form(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<SubmitResponse>, AppError> {
    metrics::inc_requests("/submit-form");
    let started = Instant::now();
    let deadline = state.config.request_deadline;

    let run = async {
        let submission = ingress::extract_submission(request, state.config.max_images).await?;
        info!(
            target: "appraisal.api",
            images = submission.images.len(),
            fields = submission.fields.len(),
            "submission received"
        );
        state.intake.submit(submission).await
    };
    let outcome = tokio::time::timeout(deadline, run).await.map_err(|_| {
        IntakeError::internal(
            "deadline",
            format!("submission did not finish within {deadline:?}"),
        )
    })??;

    metrics::stage_elapsed("submit_form", started.elapsed().as_millis());
    info!(
        target: "appraisal.api",
        record_key = %outcome.record_key,
        record_id = %outcome.record_id,
        "submission completed"
    );
    Ok(Json(SubmitResponse::from(outcome)))
}

#[derive(Debug)]
enum AppError {
    Intake(IntakeError),
}

impl From<IntakeError> for AppError {
    fn from(value: IntakeError) -> Self {
        Self::Intake(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Intake(err) => {
                let (status, message) = match err.kind() {
                    IntakeErrorKind::InvalidInput => {
                        warn!(
                            target: "appraisal.api",
                            stage = err.stage(),
                            detail = err.detail(),
                            "submission rejected"
                        );
                        (StatusCode::BAD_REQUEST, "Invalid submission")
                    }
                    IntakeErrorKind::Upstream | IntakeErrorKind::Internal => {
                        error!(
                            target: "appraisal.api",
                            stage = err.stage(),
                            detail = err.detail(),
                            "submission failed"
                        );
                        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to process submission")
                    }
                };
                let payload = SubmitResponse::failure(message, err.detail(), err.stage());
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::intake::fakes::{FakeMailer, FakeShop};
    use crate::shopify::UserError;
    use axum::http::Method;
    use axum_test::TestServer;
    use axum_test::multipart::{MultipartForm, Part};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde_json::{Value, json};
    use std::time::Duration;

    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0, 0x10, b'J', b'F', b'I', b'F'];

    fn server_with(shop: Arc<FakeShop>, mailer: Arc<FakeMailer>, config: AppConfig) -> TestServer {
        let intake = IntakeService::new(
            shop.clone(),
            shop.clone(),
            mailer,
            IntakeSettings::from_config(&config),
        );
        let state = AppState {
            intake: Arc::new(intake),
            diagnostics: shop,
            config: Arc::new(config),
        };
        TestServer::new(build_router(state).into_make_service()).expect("test server")
    }

    fn server(shop: &Arc<FakeShop>, mailer: &Arc<FakeMailer>) -> TestServer {
        server_with(shop.clone(), mailer.clone(), test_config())
    }

    fn contact() -> Value {
        json!({
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": "ada@example.com",
            "phone": "555-0100",
            "category": "watch",
            "askingPrice": "4500"
        })
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_any_remote_call() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let response = server(&shop, &mailer)
            .post("/submit-form")
            .json(&json!({ "firstName": "Ada", "images": { "front": BASE64.encode(JPEG) } }))
            .await;

        assert_eq!(response.status_code(), 400);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["stage"], "validate");
        assert!(body["error"].as_str().unwrap().contains("lastName"));
        assert_eq!(shop.upload_count(), 0);
        assert_eq!(shop.record_count(), 0);
        assert_eq!(mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn json_submission_succeeds() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let mut body = contact();
        body["images"] = json!({
            "front": format!("data:image/jpeg;base64,{}", BASE64.encode(JPEG)),
            "back": BASE64.encode(JPEG),
        });

        let response = server(&shop, &mailer).post("/submit-form").json(&body).await;
        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["notificationSent"], true);
        assert_eq!(body["uploadedImages"].as_array().map(Vec::len), Some(2));
        let mut slots: Vec<&str> = body["images"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|image| image["slot"].as_str())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec!["back", "front"]);
        assert!(body.get("failedImages").is_none());
        assert!(body["recordKey"].as_str().unwrap().starts_with("submission_"));
        assert_eq!(mailer.sent_count(), 1);
    }

    #[tokio::test]
    async fn multipart_submission_succeeds() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let form = MultipartForm::new()
            .add_text("firstName", "Ada")
            .add_text("lastName", "Lovelace")
            .add_text("email", "ada@example.com")
            .add_text("phone", "555-0100")
            .add_text("notes", "Box and papers")
            .add_part(
                "images[front]",
                Part::bytes(JPEG.to_vec())
                    .file_name("front.jpg")
                    .mime_type("image/jpeg"),
            )
            .add_part(
                "images",
                Part::bytes(JPEG.to_vec())
                    .file_name("extra.jpg")
                    .mime_type("image/jpeg"),
            );

        let response = server(&shop, &mailer)
            .post("/submit-form")
            .multipart(form)
            .await;
        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["images"][0]["slot"], "front");
        assert_eq!(body["images"][1]["slot"], "image_2");

        let uploads = shop.uploads.lock().unwrap();
        assert_eq!(uploads[0].filename, "front.jpg");
        assert_eq!(uploads[0].byte_size, JPEG.len());
        assert_eq!(uploads[0].data_base64, BASE64.encode(JPEG));

        let record = shop.last_record_value();
        assert_eq!(record["item"]["notes"], "Box and papers");
    }

    #[tokio::test]
    async fn partial_upload_failure_still_succeeds() {
        let shop = Arc::new(FakeShop {
            reject_slots: vec!["back"],
            ..FakeShop::default()
        });
        let mailer = Arc::new(FakeMailer::default());
        let mut body = contact();
        body["images"] = json!({
            "front": BASE64.encode(JPEG),
            "back": BASE64.encode(JPEG),
            "accessories": BASE64.encode(JPEG),
        });

        let response = server(&shop, &mailer).post("/submit-form").json(&body).await;
        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["uploadedImages"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["failedImages"][0]["slot"], "back");
    }

    #[tokio::test]
    async fn metafield_user_errors_return_500() {
        let shop = Arc::new(FakeShop {
            record_errors: vec![UserError::new("value", "Value is invalid JSON")],
            ..FakeShop::default()
        });
        let mailer = Arc::new(FakeMailer::default());
        let response = server(&shop, &mailer)
            .post("/submit-form")
            .json(&contact())
            .await;

        assert_eq!(response.status_code(), 500);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["stage"], "write_record");
        assert!(body["error"].as_str().unwrap().contains("Value is invalid JSON"));
        assert_eq!(mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn best_effort_notification_failure_succeeds() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer {
            fail: true,
            ..FakeMailer::default()
        });
        let mut config = test_config();
        config.notify_policy = crate::config::NotifyPolicy::BestEffort;
        let response = server_with(shop, mailer, config)
            .post("/submit-form")
            .json(&contact())
            .await;
        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["notificationSent"], false);
    }

    #[tokio::test]
    async fn too_many_images_is_a_client_error() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let mut body = contact();
        body["images"] = json!(vec![BASE64.encode(JPEG); 6]);

        let response = server(&shop, &mailer).post("/submit-form").json(&body).await;
        assert_eq!(response.status_code(), 400);
        let body: Value = response.json();
        assert_eq!(body["stage"], "ingress");
        assert_eq!(shop.upload_count(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_a_client_error() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let mut config = test_config();
        config.max_body_bytes = 1024;
        let mut body = contact();
        body["notes"] = json!("x".repeat(4096));

        let response = server_with(shop.clone(), mailer, config)
            .post("/submit-form")
            .json(&body)
            .await;
        assert_eq!(response.status_code(), 400);
        assert_eq!(shop.record_count(), 0);
    }

    #[tokio::test]
    async fn deadline_expiry_returns_500() {
        let shop = Arc::new(FakeShop {
            upload_delay: Some(Duration::from_millis(500)),
            ..FakeShop::default()
        });
        let mailer = Arc::new(FakeMailer::default());
        let mut config = test_config();
        config.request_deadline = Duration::from_millis(10);
        let mut body = contact();
        body["images"] = json!({ "front": BASE64.encode(JPEG) });

        let response = server_with(shop.clone(), mailer.clone(), config)
            .post("/submit-form")
            .json(&body)
            .await;
        assert_eq!(response.status_code(), 500);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["stage"], "deadline");
        assert_eq!(shop.record_count(), 0);
        assert_eq!(mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn preflight_echoes_allowed_origin() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let response = server(&shop, &mailer)
            .method(Method::OPTIONS, "/submit-form")
            .add_header("Origin", "http://localhost:3000")
            .add_header("Access-Control-Request-Method", "POST")
            .add_header("Access-Control-Request-Headers", "content-type")
            .await;

        assert_eq!(response.status_code(), 200);
        let headers = response.headers();
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(
            headers.get("access-control-allow-credentials").unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn unknown_origin_is_not_echoed() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let response = server(&shop, &mailer)
            .get("/health")
            .add_header("Origin", "https://evil.example")
            .await;
        assert_eq!(response.status_code(), 200);
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn health_and_root() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let server = server(&shop, &mailer);

        let health: Value = server.get("/health").await.json();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
        assert!(chrono::DateTime::parse_from_rfc3339(health["timestamp"].as_str().unwrap()).is_ok());

        let root = server.get("/").await;
        assert_eq!(root.text(), "appraisal api is running");
    }

    #[tokio::test]
    async fn connectivity_check_reports_shop() {
        let shop = Arc::new(FakeShop::default());
        let mailer = Arc::new(FakeMailer::default());
        let server = server(&shop, &mailer);

        for response in [server.get("/test").await, server.post("/test").await] {
            assert_eq!(response.status_code(), 200);
            let body: Value = response.json();
            assert_eq!(body["success"], true);
            assert_eq!(body["shop"]["name"], "Demo Store");
            assert_eq!(body["shopDomain"], "demo-store.myshopify.com");
            assert_eq!(body["metafieldNamespace"], "item_submissions");
            assert_eq!(body["smtpConfigured"], true);
            assert!(!response.text().contains("shpat_test"));
        }
    }

    #[tokio::test]
    async fn connectivity_failure_returns_500() {
        let shop = Arc::new(FakeShop {
            fail_diagnostics: true,
            ..FakeShop::default()
        });
        let mailer = Arc::new(FakeMailer::default());
        let response = server(&shop, &mailer).get("/test").await;

        assert_eq!(response.status_code(), 500);
        let text = response.text();
        assert!(!text.contains("shpat_test"));
        assert!(!text.contains("app-password"));
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert!(body.get("shop").is_none());
        assert!(body["error"].as_str().unwrap().contains("HTTP 401"));
        assert_eq!(body["shopDomain"], "demo-store.myshopify.com");
    }
}
