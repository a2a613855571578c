use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::services::library::format_time;
use crate::services::meme::MemeService;

#[derive(Serialize, ToSchema)]
pub struct Statistics {
    total_requests: u64,
    requests_last_minute: u64,
    requests_last_5_minutes: u64,
    requests_last_15_minutes: u64,
    service_uptime_seconds: u64,
    total_memes: usize,
    memes_composed: u64,
    memes_saved: u64,
    save_failures: u64,
    render_cache_hits: u64,
    render_cache_misses: u64,
    library_last_updated: String,
}

/// 获取服务统计信息
#[utoipa::path(
    get,
    path = "/statistics",
    tag = "statistics",
    responses(
        (status = 200, description = "成功返回统计信息", body = Statistics)
    )
)]
pub async fn get_statistics(State(service): State<Arc<MemeService>>) -> Json<Statistics> {
    let service_uptime_seconds = service
        .get_start_time()
        .elapsed()
        .unwrap_or_default()
        .as_secs();
    let (render_cache_hits, render_cache_misses) = service.get_cache_stats();
    let (memes_composed, memes_saved, save_failures) = service.get_meme_counters();
    let library = service.library();

    Json(Statistics {
        total_requests: service.get_request_count(),
        requests_last_minute: service.get_requests_last_minute(),
        requests_last_5_minutes: service.get_requests_last_5_minutes(),
        requests_last_15_minutes: service.get_requests_last_15_minutes(),
        service_uptime_seconds,
        total_memes: library.count(),
        memes_composed,
        memes_saved,
        save_failures,
        render_cache_hits,
        render_cache_misses,
        library_last_updated: format_time(library.last_updated()),
    })
}
