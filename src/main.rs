use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::services::{composer::MemeComposer, library::MemeLibrary, meme::MemeService};
use crate::utils::error::AppError;

mod app;
mod config;
mod handlers;
mod metrics;
mod models;
mod openapi;
mod services;
mod utils;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // 初始化指标
    metrics::init_metrics()?;
    metrics::set_service_start_time(SystemTime::now());

    // 加载配置文件
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yml".to_string());
    let config = config::Config::load_from_file(&config_path)?;

    // 确保日志目录存在
    std::fs::create_dir_all(&config.logging.directory)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.logging.file_prefix)
        .filename_suffix("log")
        .build(&config.logging.directory)?;

    // 初始化日志系统
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    tracing::info!("日志系统初始化完成");
    tracing::info!(path = %config_path, "Configuration loaded successfully");

    // 初始化合成器、表情包库与服务
    let composer = Arc::new(MemeComposer::new(&config.compose));
    tracing::info!(faces = composer.font_face_count(), "合成器初始化完成");

    let library = MemeLibrary::new(
        &config.storage.library_dir,
        config.cache.max_size,
        config.cache.ttl_secs,
        config.storage.watch,
    )
    .await?;

    let service = Arc::new(MemeService::new(
        composer,
        library,
        config.cache.max_size,
        config.cache.ttl_secs,
    ));

    let app = app::build_router(service, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("服务器启动在 {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("服务器已关闭");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
}
