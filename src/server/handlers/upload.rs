// 上传API处理器
//
// 所有处理器都返回统一响应格式；错误走 UploadError 的分类码，
// HTTP 状态保持 200，客户端按 code 字段判别（与参考前端一致）。

use crate::error::UploadError;
use crate::protocol::{
    ApiResponse, ChunkAckResponse, InitRequest, InitResponse, MergeRequest, MergeResponse,
    SessionView, HEADER_CHUNK_INDEX, HEADER_FILE_HASH,
};
use crate::server::AppState;
use crate::store::SessionInit;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use tracing::{info, warn};

/// 把存储层错误折叠进统一响应格式
fn error_response<T>(e: UploadError) -> Json<ApiResponse<T>> {
    warn!("上传请求被拒绝: {}", e);
    Json(ApiResponse::error(e.code(), e.to_string()))
}

/// 初始化/续传查询
///
/// POST /api/v1/upload/init
pub async fn init_upload(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Json<ApiResponse<InitResponse>> {
    info!(
        "API: 上传初始化 hash={}, name={}, size={}, chunks={}",
        request.file_hash, request.file_name, request.file_size, request.total_chunks
    );

    let declared = SessionInit {
        fingerprint: request.file_hash,
        file_name: request.file_name,
        file_size: request.file_size,
        chunk_size: request.chunk_size,
        total_chunks: request.total_chunks,
    };

    match state.store.init(declared).await {
        Ok(outcome) => Json(ApiResponse::success(InitResponse {
            complete: outcome.complete,
            uploaded: outcome.uploaded,
        })),
        Err(e) => error_response(e),
    }
}

/// 接收一个分片
///
/// PUT /api/v1/upload/chunk
/// 指纹和索引在请求头里，分片本体是原始字节流
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ApiResponse<ChunkAckResponse>> {
    let Some(file_hash) = headers.get(HEADER_FILE_HASH).and_then(|v| v.to_str().ok()) else {
        return error_response(UploadError::Validation(format!(
            "缺少 {} 请求头",
            HEADER_FILE_HASH
        )));
    };
    let index = match headers
        .get(HEADER_CHUNK_INDEX)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(index) => index,
        None => {
            return error_response(UploadError::Validation(format!(
                "缺少或无法解析 {} 请求头",
                HEADER_CHUNK_INDEX
            )));
        }
    };

    match state.store.put_chunk(file_hash, index, &body).await {
        Ok(ack) => Json(ApiResponse::success(ChunkAckResponse {
            index: ack.index,
            received: ack.received,
        })),
        Err(e) => error_response(e),
    }
}

/// 合并分片
///
/// POST /api/v1/upload/merge
pub async fn merge_upload(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Json<ApiResponse<MergeResponse>> {
    info!("API: 请求合并 hash={}", request.file_hash);

    match state.store.merge(&request.file_hash).await {
        Ok(final_path) => Json(ApiResponse::success(MergeResponse {
            ok: true,
            final_path: Some(final_path.to_string_lossy().into_owned()),
        })),
        Err(e) => error_response(e),
    }
}

/// 查询会话状态
///
/// GET /api/v1/upload/sessions/:hash
/// 下游消费方（文本提取等）由此解析成品路径
pub async fn get_session(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> Json<ApiResponse<SessionView>> {
    match state.store.session(&file_hash).await {
        Ok(session) => Json(ApiResponse::success(SessionView::from(&session))),
        Err(e) => error_response(e),
    }
}

/// 取消未完成的上传会话
///
/// DELETE /api/v1/upload/sessions/:hash
pub async fn delete_session(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> Json<ApiResponse<bool>> {
    info!("API: 取消上传会话 hash={}", file_hash);

    match state.store.remove(&file_hash).await {
        Ok(()) => Json(ApiResponse::success(true)),
        Err(e) => error_response(e),
    }
}
