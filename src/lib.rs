// Chunkflow Rust Library
// 可续传分片上传管线核心库

// 配置管理模块
pub mod config;

// 错误类型模块
pub mod error;

// 日志模块
pub mod logging;

// 分片编解码器模块
pub mod codec;

// 内容指纹模块
pub mod hasher;

// 上传协议 wire 类型模块
pub mod protocol;

// 客户端上传管线模块
pub mod client;

// 服务端存储模块
pub mod store;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use client::{
    prepare_upload, SchedulerConfig, TransferScheduler, UploadApiClient, UploadTask,
    UploadTaskStatus,
};
pub use config::AppConfig;
pub use error::{UploadError, UploadResult};
pub use hasher::{FingerprintHandle, FingerprintWorker, HashEvent};
pub use server::AppState;
pub use store::{
    ChunkBackend, FsChunkBackend, SessionState, UploadSession, UploadStore,
};
