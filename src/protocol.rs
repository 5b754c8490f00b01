// 上传协议 wire 类型
//
// 客户端和服务端共用的请求/响应定义。JSON 字段用 camelCase，
// 与参考前端保持一致；分片本体走原始字节流，索引和指纹放在
// x-file-hash / x-chunk-index 请求头里。

use crate::error::UploadError;
use serde::{Deserialize, Serialize};

/// 分片上传请求头：内容指纹
pub const HEADER_FILE_HASH: &str = "x-file-hash";
/// 分片上传请求头：分片索引
pub const HEADER_CHUNK_INDEX: &str = "x-chunk-index";

/// 统一API响应格式
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }

    /// 客户端侧解包：成功取出 data，失败还原为 UploadError
    pub fn into_data(self) -> Result<T, UploadError> {
        if self.code == 0 {
            self.data
                .ok_or_else(|| UploadError::Transport("响应缺少 data 字段".to_string()))
        } else {
            Err(error_from_code(self.code, self.message))
        }
    }
}

/// 按响应码还原错误分类
///
/// 服务端丢失的结构化信息（期望/实际长度等）不再还原，
/// 分类本身足够客户端决定是否重试
fn error_from_code(code: i32, message: String) -> UploadError {
    match code {
        400 => UploadError::Validation(message),
        404 => UploadError::SessionNotFound(message),
        409 => UploadError::Incomplete { missing: 0 },
        _ => UploadError::Transport(format!("服务端错误 ({}): {}", code, message)),
    }
}

/// init 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

/// init 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// 是否秒传命中
    pub complete: bool,
    /// 服务端已持久化的分片索引
    pub uploaded: Vec<u64>,
}

/// 分片上传确认
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckResponse {
    pub index: u64,
    /// 当前已收到的分片数
    pub received: u64,
}

/// merge 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
}

/// merge 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
}

/// 会话状态视图（下游消费方由此解析成品路径）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploaded: Vec<u64>,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
}

impl From<&crate::store::UploadSession> for SessionView {
    fn from(session: &crate::store::UploadSession) -> Self {
        Self {
            file_hash: session.fingerprint.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            uploaded: session.received.iter().copied().collect(),
            complete: session.is_complete(),
            final_path: session
                .final_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}
