// 上传会话元数据存储
//
// 每个内容指纹对应一条权威的会话记录，落盘为 JSON `.meta` 文件
// （先写临时文件再原子改名），进程重启后可恢复。
//
// 并发纪律：每个指纹一把 tokio Mutex，挂在 DashMap 里。
// 同一指纹的 mark_received / merge 串行化，不同指纹互不阻塞。

use crate::error::{UploadError, UploadResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 元数据文件扩展名
const META_EXTENSION: &str = "meta";

/// 会话状态机: Collecting -> Merging -> Complete
///
/// 每接受一个分片是 Collecting 上的自环；
/// 只有全部分片就位才允许进入 Merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 收集分片中
    Collecting,
    /// 正在合并
    Merging,
    /// 已完成（final_path 一定已发布）
    Complete,
}

/// 上传会话记录
///
/// 不变式:
/// - received ⊆ [0, total_chunks)
/// - state == Complete 蕴含 received 满集且 final_path 已设置，
///   且 final_path 指向的文件恰好 file_size 字节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// 内容指纹（主键）
    pub fingerprint: String,
    /// 声明的文件名
    pub file_name: String,
    /// 声明的文件大小
    pub file_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 分片总数
    pub total_chunks: u64,
    /// 已收到的分片索引集合
    pub received: BTreeSet<u64>,
    /// 会话状态
    pub state: SessionState,
    /// 合并完成后的成品文件路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<PathBuf>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl UploadSession {
    /// 创建新会话
    pub fn new(
        fingerprint: String,
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        total_chunks: u64,
    ) -> Self {
        Self {
            fingerprint,
            file_name,
            file_size,
            chunk_size,
            total_chunks,
            received: BTreeSet::new(),
            state: SessionState::Collecting,
            final_path: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }

    /// 是否已收齐全部分片
    pub fn all_received(&self) -> bool {
        self.received.len() as u64 == self.total_chunks
    }

    /// 还缺多少个分片
    pub fn missing_count(&self) -> u64 {
        self.total_chunks - self.received.len() as u64
    }

    /// 是否已完成
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    /// 记录一个已收到的分片（集合加法，可交换，重复记录无影响）
    pub fn mark_received(&mut self, index: u64) {
        self.received.insert(index);
    }

    /// 发布合并结果
    ///
    /// Complete 状态和 final_path 同时落位，读者不会观察到
    /// complete 为真而路径缺失的中间态
    pub fn mark_complete(&mut self, final_path: PathBuf) {
        self.final_path = Some(final_path);
        self.state = SessionState::Complete;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}

/// 会话存储
///
/// 内存中的 DashMap 提供每指纹互斥，磁盘上的 `.meta` 文件提供持久性
pub struct SessionStore {
    sessions_dir: PathBuf,
    entries: DashMap<String, Arc<Mutex<UploadSession>>>,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            entries: DashMap::new(),
        }
    }

    /// 元数据文件路径: `{sessions_dir}/{fingerprint}.meta`
    fn meta_path(&self, fingerprint: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.{}", fingerprint, META_EXTENSION))
    }

    /// 从磁盘恢复全部会话记录，返回恢复数量
    pub async fn load_from_disk(&self) -> UploadResult<usize> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;

        let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
        let mut loaded = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_meta = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == META_EXTENSION)
                .unwrap_or(false);
            if !is_meta {
                continue;
            }

            match Self::read_meta(&path).await {
                Ok(session) => {
                    debug!(
                        "恢复上传会话: fingerprint={}, state={:?}, received={}/{}",
                        session.fingerprint,
                        session.state,
                        session.received.len(),
                        session.total_chunks
                    );
                    self.entries.insert(
                        session.fingerprint.clone(),
                        Arc::new(Mutex::new(session)),
                    );
                    loaded += 1;
                }
                Err(e) => {
                    warn!("会话元数据损坏，跳过: {:?}, 错误: {}", path, e);
                }
            }
        }

        Ok(loaded)
    }

    /// 读取单个元数据文件
    async fn read_meta(path: &Path) -> UploadResult<UploadSession> {
        let content = tokio::fs::read_to_string(path).await?;
        let session: UploadSession = serde_json::from_str(&content)
            .map_err(|e| UploadError::Validation(format!("元数据解析失败: {}", e)))?;
        Ok(session)
    }

    /// 查找会话
    pub fn get(&self, fingerprint: &str) -> Option<Arc<Mutex<UploadSession>>> {
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }

    /// 查找或创建会话（对同一指纹幂等）
    ///
    /// 返回 (entry, created)；created 为 false 表示会话已存在
    pub fn get_or_create(
        &self,
        fingerprint: &str,
        make: impl FnOnce() -> UploadSession,
    ) -> (Arc<Mutex<UploadSession>>, bool) {
        let mut created = false;
        let entry = self
            .entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(make()))
            })
            .value()
            .clone();
        (entry, created)
    }

    /// 持久化会话记录（调用方应持有该会话的锁）
    ///
    /// 先写临时文件再原子改名，崩溃不会留下半截 JSON
    pub async fn persist(&self, session: &UploadSession) -> UploadResult<()> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;

        let path = self.meta_path(&session.fingerprint);
        let tmp_path = self.sessions_dir.join(format!(
            ".{}.{}.tmp",
            session.fingerprint, META_EXTENSION
        ));

        let json = serde_json::to_string_pretty(session)
            .map_err(|e| UploadError::Validation(format!("元数据序列化失败: {}", e)))?;

        tokio::fs::write(&tmp_path, json.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    /// 删除会话及其元数据文件
    pub async fn remove(&self, fingerprint: &str) -> UploadResult<()> {
        self.entries.remove(fingerprint);
        match tokio::fs::remove_file(self.meta_path(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_session() -> UploadSession {
        UploadSession::new(
            "f".repeat(64),
            "video.mp4".to_string(),
            12_000_000,
            5_000_000,
            3,
        )
    }

    #[test]
    fn test_session_invariants() {
        let mut session = sample_session();
        assert_eq!(session.state, SessionState::Collecting);
        assert!(!session.all_received());
        assert_eq!(session.missing_count(), 3);

        session.mark_received(0);
        session.mark_received(2);
        // 重复记录不产生重复元素
        session.mark_received(0);
        assert_eq!(session.received.len(), 2);
        assert_eq!(session.missing_count(), 1);

        session.mark_received(1);
        assert!(session.all_received());

        session.mark_complete(PathBuf::from("/data/files/out.mp4"));
        assert!(session.is_complete());
        assert!(session.final_path.is_some());
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_get_or_create_idempotent() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let (_, created) = store.get_or_create(&"a".repeat(64), sample_session);
        assert!(created);
        let (_, created) = store.get_or_create(&"a".repeat(64), sample_session);
        assert!(!created);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut session = sample_session();
        session.mark_received(0);
        session.mark_received(2);
        store.persist(&session).await.unwrap();

        // 新 store 实例模拟进程重启
        let store2 = SessionStore::new(dir.path());
        let loaded = store2.load_from_disk().await.unwrap();
        assert_eq!(loaded, 1);

        let entry = store2.get(&session.fingerprint).unwrap();
        let restored = entry.lock().await;
        assert_eq!(restored.file_name, "video.mp4");
        assert_eq!(restored.received.iter().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(restored.state, SessionState::Collecting);
    }

    #[tokio::test]
    async fn test_remove_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let session = sample_session();
        let fp = session.fingerprint.clone();
        store.get_or_create(&fp, || session.clone());
        store.persist(&session).await.unwrap();

        store.remove(&fp).await.unwrap();
        assert!(store.get(&fp).is_none());

        let store2 = SessionStore::new(dir.path());
        assert_eq!(store2.load_from_disk().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_mark_received_commutative() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let (entry, _) = store.get_or_create(&"b".repeat(64), || {
            UploadSession::new("b".repeat(64), "f.bin".to_string(), 100, 10, 10)
        });

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let entry = entry.clone();
            handles.push(tokio::spawn(async move {
                entry.lock().await.mark_received(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // 任意交错顺序都收敛到同一个满集
        let session = entry.lock().await;
        assert!(session.all_received());
    }
}
