// Web服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;

/// 分片请求体上限
///
/// 给最大可配置分片留足余量；axum 默认 2MB 装不下 5MiB 分片
const MAX_CHUNK_BODY_BYTES: usize = 64 * 1024 * 1024;

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

/// 健康检查处理器
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "chunkflow-rust".to_string(),
    })
}

/// 组装路由
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/upload/init", post(handlers::init_upload))
        .route("/api/v1/upload/chunk", put(handlers::upload_chunk))
        .route("/api/v1/upload/merge", post(handlers::merge_upload))
        .route("/api/v1/upload/sessions/:hash", get(handlers::get_session))
        .route(
            "/api/v1/upload/sessions/:hash",
            delete(handlers::delete_session),
        )
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_CHUNK_BODY_BYTES))
        .with_state(state)
}
