// 上传错误类型定义
//
// 错误分类决定调度器的处理策略：
// - 传输类错误可重试（指数退避）
// - 取消不是错误，前端显示"已暂停"
// - 校验类错误立即拒绝，不产生部分状态

use thiserror::Error;

/// 上传管线统一错误类型
#[derive(Debug, Error)]
pub enum UploadError {
    /// 参数校验失败（指纹格式、分片大小、索引越界等）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 分片长度与编解码器计算的期望长度不一致
    #[error("分片 #{index} 长度不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
    ChunkLengthMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },

    /// 网络传输失败（连接中断、非成功状态码等）
    #[error("传输失败: {0}")]
    Transport(String),

    /// 用户主动暂停/取消，中止了进行中的请求
    #[error("上传已取消")]
    Cancelled,

    /// 分片未集齐时请求合并
    #[error("分片未集齐: 还缺 {missing} 个分片")]
    Incomplete { missing: u64 },

    /// 合并后字节数与声明的文件大小不一致
    #[error("合并校验失败: 期望 {expected} 字节, 实际 {actual} 字节")]
    AssemblyFailed { expected: u64, actual: u64 },

    /// 指纹对应的上传会话不存在
    #[error("上传会话不存在: {0}")]
    SessionNotFound(String),

    /// 磁盘 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// 是否可重试
    ///
    /// 只有传输类错误值得重试；重复上传分片是幂等的，所以重试安全
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::Transport(_))
    }

    /// 是否由用户取消引起
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// API 响应错误码（统一响应格式的 code 字段）
    pub fn code(&self) -> i32 {
        match self {
            UploadError::Validation(_) => 400,
            UploadError::ChunkLengthMismatch { .. } => 400,
            UploadError::SessionNotFound(_) => 404,
            UploadError::Incomplete { .. } => 409,
            UploadError::Cancelled => 499,
            UploadError::Transport(_) => 502,
            UploadError::AssemblyFailed { .. } => 500,
            UploadError::Io(_) => 500,
        }
    }
}

/// 上传管线 Result 别名
pub type UploadResult<T> = Result<T, UploadError>;
