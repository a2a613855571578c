use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::SwaggerConfig;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::meme::compose_meme,
        crate::handlers::meme::save_meme,
        crate::handlers::meme::share_meme,
        crate::handlers::meme::list_memes,
        crate::handlers::meme::get_meme_by_id,
        crate::handlers::meme::get_meme_count,
        crate::handlers::meme::health_check,
        crate::handlers::meme::get_metrics,
        crate::handlers::statistics::get_statistics
    ),
    components(
        schemas(
            crate::handlers::meme::ComposeQuery,
            crate::handlers::meme::ShareQuery,
            crate::handlers::meme::GetMemeQuery,
            crate::handlers::meme::MemeCount,
            crate::models::meme::SavedMeme,
            crate::handlers::statistics::Statistics
        )
    ),
    tags(
        (name = "memes", description = "表情包合成、保存与分享"),
        (name = "statistics", description = "统计信息API"),
        (name = "monitoring", description = "Prometheus 指标")
    )
)]
pub struct ApiDoc;

pub fn create_openapi_spec(config: &SwaggerConfig) -> utoipa::openapi::OpenApi {
    let mut openapi = ApiDoc::openapi();

    openapi.info.title = config.title.clone();
    openapi.info.description = Some(config.description.clone());
    openapi.info.version = config.version.clone();

    openapi
}

pub fn create_swagger_ui(config: &SwaggerConfig) -> SwaggerUi {
    SwaggerUi::new(config.endpoint.clone())
        .url("/api-docs/openapi.json", create_openapi_spec(config))
}
