use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::metrics::{Timer, REQUEST_COUNTER, RESPONSE_TIME};
use crate::models::meme::SavedMeme;
use crate::services::meme::MemeService;
use crate::utils::error::{AppError, Result};

#[derive(Deserialize, ToSchema, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ComposeQuery {
    /// 上方文字，缺省为 "TOP"
    #[schema(example = "ONE DOES NOT SIMPLY")]
    top: Option<String>,
    /// 下方文字，缺省为 "BOTTOM"
    #[schema(example = "WALK INTO MORDOR")]
    bottom: Option<String>,
}

#[derive(Deserialize, ToSchema, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ShareQuery {
    #[schema(example = "ONE DOES NOT SIMPLY")]
    top: Option<String>,
    #[schema(example = "WALK INTO MORDOR")]
    bottom: Option<String>,
    /// 分享完成后是否保存到表情包库
    #[schema(example = true)]
    save: Option<bool>,
}

#[derive(Deserialize, ToSchema, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GetMemeQuery {
    #[schema(example = 300)]
    width: Option<u32>,
    #[schema(example = 300)]
    height: Option<u32>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MemeCount {
    #[schema(example = 100)]
    pub count: usize,
}

/// 合成表情包（不保存）
#[utoipa::path(
    post,
    path = "/memes/compose",
    tag = "memes",
    params(ComposeQuery),
    request_body(content = Vec<u8>, description = "背景图片", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "合成后的表情包", content_type = "image/png"),
        (status = 400, description = "图片无法解码或文字过长"),
        (status = 413, description = "图片过大")
    )
)]
pub async fn compose_meme(
    State(service): State<Arc<MemeService>>,
    Query(query): Query<ComposeQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    REQUEST_COUNTER.inc();
    let _timer = Timer::new(&RESPONSE_TIME);

    let text = service.meme_text(query.top, query.bottom);
    let png = service.preview(body, text).await?;

    info!(file_size = png.len(), "Serving composed meme");
    Ok(([(header::CONTENT_TYPE, HeaderValue::from_static("image/png"))], png))
}

/// 合成并保存到表情包库
#[utoipa::path(
    post,
    path = "/memes/save",
    tag = "memes",
    params(ComposeQuery),
    request_body(content = Vec<u8>, description = "背景图片", content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "保存成功", body = SavedMeme),
        (status = 400, description = "图片无法解码或文字过长"),
        (status = 500, description = "保存失败")
    )
)]
pub async fn save_meme(
    State(service): State<Arc<MemeService>>,
    Query(query): Query<ComposeQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    REQUEST_COUNTER.inc();
    let _timer = Timer::new(&RESPONSE_TIME);

    let text = service.meme_text(query.top, query.bottom);
    let saved = service.save(body, text).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// 分享表情包：以附件形式返回图片
#[utoipa::path(
    post,
    path = "/memes/share",
    tag = "memes",
    params(ShareQuery),
    request_body(content = Vec<u8>, description = "背景图片", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "合成后的表情包附件", content_type = "image/png", headers(
            ("X-Meme-Id" = String, description = "保存成功时的表情包ID")
        )),
        (status = 400, description = "图片无法解码或文字过长")
    )
)]
pub async fn share_meme(
    State(service): State<Arc<MemeService>>,
    Query(query): Query<ShareQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    REQUEST_COUNTER.inc();
    let _timer = Timer::new(&RESPONSE_TIME);

    let save = query.save.unwrap_or(false);
    let text = service.meme_text(query.top, query.bottom);
    let shared = service.share(body, text, save).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));

    let filename = match &shared.saved {
        Some(saved) => {
            let id = HeaderValue::from_str(&saved.id)
                .map_err(|e| AppError::Internal(format!("Invalid meme id header: {}", e)))?;
            headers.insert("x-meme-id", id);
            saved.filename.clone()
        }
        None => {
            if save {
                warn!("分享完成但保存失败");
            }
            "meme.png".to_string()
        }
    };
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .map_err(|e| AppError::Internal(format!("Invalid content disposition: {}", e)))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    info!(
        file_size = shared.png.len(),
        saved = shared.saved.is_some(),
        "Sharing meme"
    );
    Ok((headers, shared.png))
}

/// 获取表情包列表
#[utoipa::path(
    get,
    path = "/memes/list",
    tag = "memes",
    responses(
        (status = 200, description = "成功返回表情包列表", body = Vec<SavedMeme>)
    )
)]
pub async fn list_memes(State(service): State<Arc<MemeService>>) -> Json<Vec<SavedMeme>> {
    Json(service.library().list())
}

/// 根据ID获取已保存的表情包
#[utoipa::path(
    get,
    path = "/memes/get/{id}",
    tag = "memes",
    params(
        ("id" = String, Path, description = "表情包ID"),
        GetMemeQuery
    ),
    responses(
        (status = 200, description = "成功返回指定表情包图片", content_type = "image/*"),
        (status = 404, description = "表情包不存在"),
        (status = 500, description = "服务器内部错误")
    )
)]
pub async fn get_meme_by_id(
    State(service): State<Arc<MemeService>>,
    Path(id): Path<String>,
    Query(query): Query<GetMemeQuery>,
) -> Result<impl IntoResponse> {
    REQUEST_COUNTER.inc();
    let _timer = Timer::new(&RESPONSE_TIME);

    let resized = query.width.is_some() || query.height.is_some();
    let (meme, content) = service
        .library()
        .get_resized(&id, query.width, query.height)
        .await?;

    let content_type = HeaderValue::from_str(&meme.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    info!(
        meme_id = %meme.id,
        mime_type = %meme.mime_type,
        file_size = meme.size_bytes,
        resized,
        "Serving meme by ID"
    );

    Ok(([(header::CONTENT_TYPE, content_type)], content))
}

/// 获取表情包总数
#[utoipa::path(
    get,
    path = "/memes/count",
    tag = "memes",
    responses(
        (status = 200, description = "成功返回表情包总数", body = MemeCount)
    )
)]
pub async fn get_meme_count(State(service): State<Arc<MemeService>>) -> Json<MemeCount> {
    Json(MemeCount {
        count: service.library().count(),
    })
}

/// 健康检查
#[utoipa::path(
    get,
    path = "/memes/health",
    tag = "memes",
    responses(
        (status = 200, description = "服务健康")
    )
)]
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// 获取Prometheus指标
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "monitoring",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
pub async fn get_metrics() -> impl IntoResponse {
    let metrics = crate::metrics::get_metrics();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics,
    )
}
