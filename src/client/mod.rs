// 客户端上传管线
//
// 选择文件 → 后台计算指纹 → 调度器分片上传（支持暂停/恢复/秒传）

pub mod api;
pub mod scheduler;
pub mod task;

pub use api::UploadApiClient;
pub use scheduler::{SchedulerConfig, TransferScheduler};
pub use task::{UploadTask, UploadTaskStatus};

use crate::error::{UploadError, UploadResult};
use crate::hasher::FingerprintWorker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// 从本地文件构建调度器：后台算指纹，算完即可 start
///
/// 指纹计算在独立执行环境进行，调用方的交互线程不被大文件阻塞
pub async fn prepare_upload(
    api: Arc<UploadApiClient>,
    config: SchedulerConfig,
    local_path: impl Into<PathBuf>,
) -> UploadResult<TransferScheduler> {
    let local_path = local_path.into();

    let metadata = tokio::fs::metadata(&local_path).await?;
    let file_size = metadata.len();
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| UploadError::Validation("文件名无法识别".to_string()))?
        .to_string();

    info!(
        "准备上传: path={:?}, size={} bytes, 开始计算指纹",
        local_path, file_size
    );
    let fingerprint = FingerprintWorker::spawn(&local_path, config.chunk_size.max(1))
        .wait()
        .await?;
    info!("指纹计算完成: {}", fingerprint);

    Ok(TransferScheduler::new(
        api,
        config,
        fingerprint,
        local_path,
        file_name,
        file_size,
    ))
}
