// 应用状态

use crate::config::AppConfig;
use crate::store::UploadStore;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 上传存储
    pub store: Arc<UploadStore>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 创建新的应用状态
    ///
    /// 打开数据目录并恢复磁盘上的既有会话
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = UploadStore::open(config.storage.data_dir.clone()).await?;
        Ok(Self {
            store: Arc::new(store),
            config: Arc::new(config),
        })
    }

    /// 用现成的 store 组装状态（测试用）
    #[cfg(test)]
    pub fn for_tests(store: Arc<UploadStore>) -> Self {
        Self {
            store,
            config: Arc::new(AppConfig::default()),
        }
    }
}
