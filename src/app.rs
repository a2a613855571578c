use axum::{
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit},
    http::Request,
    response::Redirect,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{OnResponse, TraceLayer},
};
use tracing::{info, Level, Span};

use crate::config::{Config, ProxyConfig};
use crate::handlers;
use crate::openapi;
use crate::services::meme::MemeService;

#[derive(Clone)]
struct CustomOnResponse;

impl<B> OnResponse<B> for CustomOnResponse {
    fn on_response(self, response: &axum::response::Response<B>, latency: Duration, span: &Span) {
        let status = response.status();
        info!(parent: span,
            status = %status,
            latency = ?latency,
            "响应完成"
        );
    }
}

fn client_ip(request: &Request<Body>, proxy: &ProxyConfig) -> String {
    if proxy.enabled {
        request
            .headers()
            .get(&proxy.ip_header)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// 构建应用路由
pub fn build_router(service: Arc<MemeService>, config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let proxy = config.server.proxy.clone();
    let swagger_endpoint = config.swagger.endpoint.clone();

    Router::new()
        .route(
            "/",
            get(move || {
                let endpoint = swagger_endpoint.clone();
                async move { Redirect::to(&endpoint) }
            }),
        )
        .route("/memes/compose", post(handlers::meme::compose_meme))
        .route("/memes/save", post(handlers::meme::save_meme))
        .route("/memes/share", post(handlers::meme::share_meme))
        .route("/memes/list", get(handlers::meme::list_memes))
        .route("/memes/get/:id", get(handlers::meme::get_meme_by_id))
        .route("/memes/health", get(handlers::meme::health_check))
        .route("/memes/count", get(handlers::meme::get_meme_count))
        .route("/statistics", get(handlers::statistics::get_statistics))
        .route("/metrics", get(handlers::meme::get_metrics))
        .merge(openapi::create_swagger_ui(&config.swagger))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<Body>| {
                    let remote_addr = client_ip(request, &proxy);
                    tracing::span!(
                        Level::INFO,
                        "请求",
                        method = %request.method(),
                        uri = %request.uri(),
                        ip = %remote_addr,
                    )
                })
                .on_response(CustomOnResponse),
        )
        .layer(cors)
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::meme::SavedMeme;
    use crate::services::composer::MemeComposer;
    use crate::services::library::MemeLibrary;
    use axum::http::{header, StatusCode};
    use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
    use std::io::Cursor;
    use tower::ServiceExt;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([10, 200, 90, 255]),
        ));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn app(dir: &std::path::Path) -> Router {
        let mut config = Config::default();
        config.storage.library_dir = dir.to_string_lossy().into_owned();
        config.storage.watch = false;
        config.server.max_upload_bytes = 64 * 1024;

        let composer = Arc::new(MemeComposer::new(&config.compose));
        let library = MemeLibrary::new(dir, 16, 60, false).await.unwrap();
        let service = Arc::new(MemeService::new(composer, library, 16, 60));
        build_router(service, &config)
    }

    fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> axum::body::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_root_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app.clone().oneshot(get("/memes/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/")).await.unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(response.headers()[header::LOCATION], "/swagger-ui");
    }

    #[tokio::test]
    async fn compose_returns_png_of_same_size() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .oneshot(post("/memes/compose?top=hello&bottom=world", png(48, 32)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let body = body_bytes(response).await;
        let image = image::load_from_memory(&body).unwrap();
        assert_eq!(image.dimensions(), (48, 32));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn compose_rejects_bad_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .clone()
            .oneshot(post("/memes/compose", b"not an image".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"], "Unsupported or corrupt image");

        let response = app
            .clone()
            .oneshot(post("/memes/compose", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post("/memes/compose", vec![0u8; 128 * 1024]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn save_then_list_count_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .clone()
            .oneshot(post("/memes/save?top=a&bottom=b", png(40, 40)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let saved: SavedMeme = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(saved.mime_type, "image/png");

        let response = app.clone().oneshot(get("/memes/count")).await.unwrap();
        let count: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(count["count"], 1);

        let response = app.clone().oneshot(get("/memes/list")).await.unwrap();
        let list: Vec<SavedMeme> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, saved.id);

        let response = app
            .clone()
            .oneshot(get(&format!("/memes/get/{}?width=10", saved.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let image = image::load_from_memory(&body_bytes(response).await).unwrap();
        assert_eq!(image.dimensions(), (10, 10));

        let response = app.oneshot(get("/memes/get/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn share_returns_attachment_and_optionally_saves() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .clone()
            .oneshot(post("/memes/share?top=x", png(20, 20)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"meme.png\""
        );
        assert!(response.headers().get("x-meme-id").is_none());

        let response = app
            .clone()
            .oneshot(post("/memes/share?top=x&save=true", png(20, 20)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()["x-meme-id"].to_str().unwrap().to_string();
        assert!(dir.path().join(format!("{}.png", id)).is_file());

        let response = app.oneshot(get("/statistics")).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(stats["total_memes"], 1);
        assert_eq!(stats["memes_saved"], 1);
        assert_eq!(stats["memes_composed"], 2);
    }

    #[tokio::test]
    async fn overlong_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let uri = format!("/memes/compose?top={}", "a".repeat(300));
        let response = app.oneshot(post(&uri, png(8, 8))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
