// 上传协议客户端
//
// 对服务端三个核心端点的薄封装。每个请求都挂在调度器的取消令牌上，
// 暂停会立刻中止在途请求，并以 Cancelled 区别于真正的传输失败。

use crate::error::{UploadError, UploadResult};
use crate::protocol::{
    ApiResponse, ChunkAckResponse, InitRequest, InitResponse, MergeRequest, MergeResponse,
    SessionView, HEADER_CHUNK_INDEX, HEADER_FILE_HASH,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 上传 API 客户端
#[derive(Debug, Clone)]
pub struct UploadApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl UploadApiClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - 服务端地址，如 `http://127.0.0.1:18080`
    /// * `request_timeout_secs` - 单请求超时；超时按可重试的传输失败处理
    pub fn new(base_url: impl Into<String>, request_timeout_secs: u64) -> UploadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| UploadError::Transport(format!("构建 HTTP 客户端失败: {}", e)))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/upload{}", self.base_url, path)
    }

    /// 初始化/续传查询
    pub async fn init(
        &self,
        request: &InitRequest,
        token: &CancellationToken,
    ) -> UploadResult<InitResponse> {
        let fut = self.client.post(self.url("/init")).json(request).send();
        let response = Self::send_cancellable(fut, token).await?;
        Self::decode::<InitResponse>(response).await
    }

    /// 上传一个分片（原始字节体 + 指纹/索引请求头）
    pub async fn upload_chunk(
        &self,
        file_hash: &str,
        index: u64,
        bytes: Vec<u8>,
        token: &CancellationToken,
    ) -> UploadResult<ChunkAckResponse> {
        debug!(
            "上传分片请求: hash={}, index={}, size={} bytes",
            file_hash,
            index,
            bytes.len()
        );
        let fut = self
            .client
            .put(self.url("/chunk"))
            .header(HEADER_FILE_HASH, file_hash)
            .header(HEADER_CHUNK_INDEX, index.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send();
        let response = Self::send_cancellable(fut, token).await?;
        Self::decode::<ChunkAckResponse>(response).await
    }

    /// 请求合并
    pub async fn merge(
        &self,
        file_hash: &str,
        token: &CancellationToken,
    ) -> UploadResult<MergeResponse> {
        let request = MergeRequest {
            file_hash: file_hash.to_string(),
        };
        let fut = self.client.post(self.url("/merge")).json(&request).send();
        let response = Self::send_cancellable(fut, token).await?;
        Self::decode::<MergeResponse>(response).await
    }

    /// 查询会话状态
    pub async fn session(&self, file_hash: &str) -> UploadResult<SessionView> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{}", file_hash)))
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode::<SessionView>(response).await
    }

    /// 发送请求，同时监听取消令牌
    ///
    /// 取消发生时丢弃在途请求，返回 Cancelled 而不是传输失败
    async fn send_cancellable(
        fut: impl std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
        token: &CancellationToken,
    ) -> UploadResult<reqwest::Response> {
        tokio::select! {
            _ = token.cancelled() => Err(UploadError::Cancelled),
            result = fut => result.map_err(transport_error),
        }
    }

    /// 解包统一响应格式
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> UploadResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        let envelope: ApiResponse<T> = serde_json::from_str(&body).map_err(|e| {
            UploadError::Transport(format!(
                "解析响应失败: status={}, body={}, 错误: {}",
                status, body, e
            ))
        })?;
        envelope.into_data()
    }
}

/// reqwest 错误统一归类为可重试的传输失败
fn transport_error(e: reqwest::Error) -> UploadError {
    UploadError::Transport(e.to_string())
}
