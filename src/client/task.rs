// 上传任务定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 计算指纹中
    Hashing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 秒传完成（指纹命中，零分片传输）
    Deduplicated,
    /// 失败
    Failed,
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 声明的文件名
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 内容指纹（指纹计算完成后填充）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,

    // === 分片信息字段 ===
    /// 总分片数
    #[serde(default)]
    pub total_chunks: u64,
    /// 已完成分片数
    #[serde(default)]
    pub completed_chunks: u64,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(local_path: PathBuf, file_name: String, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            uploaded_size: 0,
            fingerprint: None,
            status: UploadTaskStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
            total_chunks: 0,
            completed_chunks: 0,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == UploadTaskStatus::Completed
                || self.status == UploadTaskStatus::Deduplicated
            {
                100.0
            } else {
                0.0
            };
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 标记为指纹计算中
    pub fn mark_hashing(&mut self) {
        self.status = UploadTaskStatus::Hashing;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = UploadTaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.total_size;
        self.completed_chunks = self.total_chunks;
    }

    /// 标记为秒传完成
    pub fn mark_deduplicated(&mut self) {
        self.status = UploadTaskStatus::Deduplicated;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.total_size;
        self.completed_chunks = self.total_chunks;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
    }

    /// 标记为暂停
    ///
    /// 暂停不是失败，error 字段保持为空
    pub fn mark_paused(&mut self) {
        self.status = UploadTaskStatus::Paused;
    }

    /// 设置内容指纹
    pub fn set_fingerprint(&mut self, fingerprint: String) {
        self.fingerprint = Some(fingerprint);
    }
}
