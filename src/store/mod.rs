// 服务端上传存储
//
// 对外暴露上传协议的三个核心操作（init / put_chunk / merge），
// 组合分片存储后端、会话元数据存储和合并引擎。
//
// 共享可变资源只有每指纹的分片目录和会话记录，互斥范围也按指纹
// 划分：同一指纹的元数据更新串行，不同指纹的上传互不竞争。

pub mod backend;
pub mod merge;
pub mod session;

pub use backend::{ChunkBackend, FsChunkBackend};
pub use merge::MergeEngine;
pub use session::{SessionState, SessionStore, UploadSession};

use crate::codec;
use crate::error::{UploadError, UploadResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// init 操作的声明元数据
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

/// init 操作的结果
#[derive(Debug, Clone)]
pub struct InitOutcome {
    /// 该指纹是否已有完整成品（秒传）
    pub complete: bool,
    /// 已持久化的分片索引（升序）
    pub uploaded: Vec<u64>,
}

/// put_chunk 操作的确认
#[derive(Debug, Clone)]
pub struct ChunkAck {
    pub index: u64,
    /// 当前已收到的分片数
    pub received: u64,
}

/// 上传存储
pub struct UploadStore {
    backend: Arc<dyn ChunkBackend>,
    sessions: SessionStore,
    merge: MergeEngine,
}

impl UploadStore {
    /// 打开数据目录并恢复既有会话
    ///
    /// 目录布局:
    /// - `{data_dir}/chunks/{fingerprint}/{index}.part`
    /// - `{data_dir}/sessions/{fingerprint}.meta`
    /// - `{data_dir}/files/{fingerprint}_{文件名}`
    pub async fn open(data_dir: impl Into<PathBuf>) -> UploadResult<Self> {
        let data_dir = data_dir.into();
        let store = Self::with_backend(
            Arc::new(FsChunkBackend::new(data_dir.join("chunks"))),
            &data_dir,
        );
        let restored = store.sessions.load_from_disk().await?;
        if restored > 0 {
            info!("已恢复 {} 个上传会话", restored);
        }
        Ok(store)
    }

    /// 用指定的分片后端组装存储（后端替换点）
    pub fn with_backend(backend: Arc<dyn ChunkBackend>, data_dir: &Path) -> Self {
        Self {
            backend,
            sessions: SessionStore::new(data_dir.join("sessions")),
            merge: MergeEngine::new(data_dir.join("files")),
        }
    }

    /// 初始化/续传查询
    ///
    /// 首次调用创建会话；重复调用幂等。已完成的指纹直接报告
    /// complete（秒传），否则返回磁盘上已有的分片索引集合，
    /// 客户端据此只传缺失的分片。
    pub async fn init(&self, declared: SessionInit) -> UploadResult<InitOutcome> {
        validate_fingerprint(&declared.fingerprint)?;
        if declared.chunk_size == 0 {
            return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
        }
        if declared.file_name.trim().is_empty() {
            return Err(UploadError::Validation("文件名不能为空".to_string()));
        }
        // 服务端重新计算分片总数，不信任客户端声明
        let expected_total = codec::total_chunks(declared.file_size, declared.chunk_size);
        if declared.total_chunks != expected_total {
            return Err(UploadError::Validation(format!(
                "分片总数不一致: 声明 {}, 计算 {}",
                declared.total_chunks, expected_total
            )));
        }

        let (entry, created) = self.sessions.get_or_create(&declared.fingerprint, || {
            UploadSession::new(
                declared.fingerprint.clone(),
                declared.file_name.clone(),
                declared.file_size,
                declared.chunk_size,
                declared.total_chunks,
            )
        });

        let mut session = entry.lock().await;

        // 秒传优先：指纹与分片大小无关，成品已在就直接短路，
        // 即使这次声明了不同的分片参数
        if session.is_complete() {
            debug!("秒传命中: fingerprint={}", declared.fingerprint);
            return Ok(InitOutcome {
                complete: true,
                uploaded: session.received.iter().copied().collect(),
            });
        }

        if !created {
            // 同一指纹的未完成会话：声明的尺寸参数必须与既有会话一致，
            // 否则分片边界对不上
            if session.file_size != declared.file_size
                || session.chunk_size != declared.chunk_size
                || session.total_chunks != declared.total_chunks
            {
                return Err(UploadError::Validation(format!(
                    "会话元数据不一致: 既有 (size={}, chunk={}, total={}), 声明 (size={}, chunk={}, total={})",
                    session.file_size,
                    session.chunk_size,
                    session.total_chunks,
                    declared.file_size,
                    declared.chunk_size,
                    declared.total_chunks
                )));
            }
        }

        // 以磁盘扫描为准同步已收分片集合——元数据可能落后于分片目录，
        // 反过来不会（分片先落盘、元数据后写）
        let on_disk = self.backend.list_received(&declared.fingerprint).await?;
        session.received = on_disk
            .into_iter()
            .filter(|&i| i < session.total_chunks)
            .collect();
        self.sessions.persist(&session).await?;

        debug!(
            "init: fingerprint={}, created={}, received={}/{}",
            declared.fingerprint,
            created,
            session.received.len(),
            session.total_chunks
        );

        Ok(InitOutcome {
            complete: false,
            uploaded: session.received.iter().copied().collect(),
        })
    }

    /// 接收一个分片
    ///
    /// 幂等：重传已有索引返回成功而非错误，容忍重试造成的重复投递。
    /// 长度与编解码器计算的期望不符时同步拒绝，不产生部分状态。
    pub async fn put_chunk(
        &self,
        fingerprint: &str,
        index: u64,
        bytes: &[u8],
    ) -> UploadResult<ChunkAck> {
        validate_fingerprint(fingerprint)?;
        let entry = self
            .sessions
            .get(fingerprint)
            .ok_or_else(|| UploadError::SessionNotFound(fingerprint.to_string()))?;

        // 校验阶段：会话的尺寸参数创建后不可变，读完即可放锁
        let (file_size, chunk_size, total_chunks) = {
            let session = entry.lock().await;
            if session.is_complete() {
                // 合并完成后迟到的重传：按幂等成功处理
                return Ok(ChunkAck {
                    index,
                    received: session.received.len() as u64,
                });
            }
            (session.file_size, session.chunk_size, session.total_chunks)
        };

        if index >= total_chunks {
            return Err(UploadError::Validation(format!(
                "分片索引越界: index={}, total={}",
                index, total_chunks
            )));
        }
        let expected = codec::chunk_len(index, file_size, chunk_size)?;
        if bytes.len() as u64 != expected {
            return Err(UploadError::ChunkLengthMismatch {
                index,
                expected,
                actual: bytes.len() as u64,
            });
        }

        // 分片写盘不持会话锁，同一指纹的多个分片可以并行落盘
        self.backend.put_chunk(fingerprint, index, bytes).await?;

        let mut session = entry.lock().await;
        session.mark_received(index);
        self.sessions.persist(&session).await?;

        Ok(ChunkAck {
            index,
            received: session.received.len() as u64,
        })
    }

    /// 合并分片为成品文件
    ///
    /// 并发调用在会话锁上串行，恰好执行一次拼装；
    /// 分片未集齐返回 Incomplete，会话不变
    pub async fn merge(&self, fingerprint: &str) -> UploadResult<PathBuf> {
        validate_fingerprint(fingerprint)?;
        let entry = self
            .sessions
            .get(fingerprint)
            .ok_or_else(|| UploadError::SessionNotFound(fingerprint.to_string()))?;

        let mut session = entry.lock().await;
        let final_path = self.merge.assemble(&mut session, self.backend.as_ref()).await?;
        self.sessions.persist(&session).await?;
        Ok(final_path)
    }

    /// 查询会话快照（下游消费方由此解析成品路径）
    pub async fn session(&self, fingerprint: &str) -> UploadResult<UploadSession> {
        validate_fingerprint(fingerprint)?;
        let entry = self
            .sessions
            .get(fingerprint)
            .ok_or_else(|| UploadError::SessionNotFound(fingerprint.to_string()))?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// 取消未完成的上传，丢弃已收分片
    pub async fn remove(&self, fingerprint: &str) -> UploadResult<()> {
        validate_fingerprint(fingerprint)?;
        let entry = self
            .sessions
            .get(fingerprint)
            .ok_or_else(|| UploadError::SessionNotFound(fingerprint.to_string()))?;

        {
            let session = entry.lock().await;
            if session.is_complete() {
                return Err(UploadError::Validation(
                    "已完成的会话不可取消".to_string(),
                ));
            }
        }

        self.backend.remove_all(fingerprint).await?;
        self.sessions.remove(fingerprint).await?;
        info!("已取消上传会话: fingerprint={}", fingerprint);
        Ok(())
    }
}

/// 校验内容指纹格式（64 位十六进制，SHA-256）
///
/// 指纹会成为磁盘路径的一部分，这里同时挡住路径穿越
fn validate_fingerprint(fingerprint: &str) -> UploadResult<()> {
    if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UploadError::Validation(format!(
            "指纹格式无效: {:?}",
            fingerprint
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn fingerprint_of(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    fn declared(content: &[u8], chunk_size: u64) -> SessionInit {
        SessionInit {
            fingerprint: fingerprint_of(content),
            file_name: "sample.bin".to_string(),
            file_size: content.len() as u64,
            chunk_size,
            total_chunks: codec::total_chunks(content.len() as u64, chunk_size),
        }
    }

    async fn put_indices(store: &UploadStore, content: &[u8], chunk_size: u64, indices: &[u64]) {
        let fp = fingerprint_of(content);
        for &index in indices {
            let range = codec::chunk_range(index, content.len() as u64, chunk_size).unwrap();
            store
                .put_chunk(&fp, index, &content[range.start as usize..range.end as usize])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_init_idempotent() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![5u8; 4096];

        let first = store.init(declared(&content, 1024)).await.unwrap();
        assert!(!first.complete);
        assert!(first.uploaded.is_empty());

        // 完全相同的声明重复 init：无新副作用，结果一致
        let second = store.init(declared(&content, 1024)).await.unwrap();
        assert!(!second.complete);
        assert_eq!(second.uploaded, first.uploaded);
    }

    #[tokio::test]
    async fn test_init_rejects_inconsistent_metadata() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![5u8; 4096];

        store.init(declared(&content, 1024)).await.unwrap();

        // 同一指纹声明不同的分片大小
        let mut conflicting = declared(&content, 2048);
        conflicting.fingerprint = fingerprint_of(&content);
        let err = store.init(conflicting).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_init_rejects_wrong_total_chunks() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();

        let mut init = declared(&vec![1u8; 4096], 1024);
        init.total_chunks += 1;
        let err = store.init(init).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_init_rejects_bad_fingerprint() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();

        let mut init = declared(&vec![1u8; 128], 64);
        init.fingerprint = "../escape".to_string();
        assert!(store.init(init).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_after_partial_upload() {
        // fileSize=12_000_000, chunkSize=5_000_000 → 3 片 [5M, 5M, 2M]
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content: Vec<u8> = (0..12_000_000u64).map(|i| (i % 251) as u8).collect();
        let fp = fingerprint_of(&content);

        let init = store.init(declared(&content, 5_000_000)).await.unwrap();
        assert_eq!(init.uploaded, Vec::<u64>::new());

        // 先传 0 和 2
        put_indices(&store, &content, 5_000_000, &[0, 2]).await;

        // 再次 init：uploaded=[0,2]
        let resumed = store.init(declared(&content, 5_000_000)).await.unwrap();
        assert!(!resumed.complete);
        assert_eq!(resumed.uploaded, vec![0, 2]);

        // 只补传缺失的 1，合并成功，成品大小精确
        put_indices(&store, &content, 5_000_000, &[1]).await;
        let final_path = store.merge(&fp).await.unwrap();
        let assembled = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(assembled.len(), 12_000_000);
        assert_eq!(assembled, content);

        let session = store.session(&fp).await.unwrap();
        assert!(session.is_complete());
        assert_eq!(session.final_path.as_deref(), Some(final_path.as_path()));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_upload_is_success() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![3u8; 3000];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();
        put_indices(&store, &content, 1000, &[1]).await;
        // 重传同一索引
        put_indices(&store, &content, 1000, &[1]).await;

        let session = store.session(&fp).await.unwrap();
        assert_eq!(session.received.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_chunk_uploads() {
        let dir = tempdir().unwrap();
        let store = Arc::new(UploadStore::open(dir.path()).await.unwrap());
        let content = Arc::new(vec![8u8; 4000]);
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            let content = content.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                store.put_chunk(&fp, 1, &content[1000..2000]).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // 两个并发重试都返回成功；received 里恰好一个 1
        let session = store.session(&fp).await.unwrap();
        assert_eq!(session.received.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_chunk_length_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![4u8; 2500];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();

        // 中间分片必须是整分片长度
        let err = store.put_chunk(&fp, 0, &content[0..999]).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::ChunkLengthMismatch {
                index: 0,
                expected: 1000,
                actual: 999
            }
        ));

        // 合法的短尾片被接受
        store.put_chunk(&fp, 2, &content[2000..2500]).await.unwrap();

        // 越界索引被拒绝
        assert!(store.put_chunk(&fp, 3, &[0u8; 1000]).await.is_err());
    }

    #[tokio::test]
    async fn test_put_chunk_unknown_session() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();

        let err = store
            .put_chunk(&"9".repeat(64), 0, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_merge_incomplete_rejected() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![6u8; 3000];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();
        put_indices(&store, &content, 1000, &[0, 2]).await;

        let err = store.merge(&fp).await.unwrap_err();
        assert!(matches!(err, UploadError::Incomplete { missing: 1 }));

        // 会话未被污染，补齐后合并成功
        put_indices(&store, &content, 1000, &[1]).await;
        store.merge(&fp).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_merges_exactly_one_artifact() {
        let dir = tempdir().unwrap();
        let store = Arc::new(UploadStore::open(dir.path()).await.unwrap());
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 4096)).await.unwrap();
        let total = codec::total_chunks(content.len() as u64, 4096);
        put_indices(
            &store,
            &content,
            4096,
            &(0..total).collect::<Vec<_>>(),
        )
        .await;

        // N 个并发 merge 全部成功，指向同一个成品
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move { store.merge(&fp).await.unwrap() }));
        }
        let mut paths = Vec::new();
        for h in handles {
            paths.push(h.await.unwrap());
        }
        paths.dedup();
        assert_eq!(paths.len(), 1);

        let assembled = tokio::fs::read(&paths[0]).await.unwrap();
        assert_eq!(assembled, content);

        let session = store.session(&fp).await.unwrap();
        assert!(session.is_complete());
    }

    #[tokio::test]
    async fn test_dedup_after_complete() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![1u8; 2048];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1024)).await.unwrap();
        put_indices(&store, &content, 1024, &[0, 1]).await;
        store.merge(&fp).await.unwrap();

        // 同内容再次 init：直接报告 complete，客户端零传输
        let again = store.init(declared(&content, 1024)).await.unwrap();
        assert!(again.complete);

        // 合并后迟到的分片重传按成功处理
        store.put_chunk(&fp, 0, &content[0..1024]).await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_independent_of_chunk_size() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![0x42u8; 4096];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1024)).await.unwrap();
        put_indices(&store, &content, 1024, &[0, 1, 2, 3]).await;
        store.merge(&fp).await.unwrap();

        // 指纹与分片大小无关：换一个分片大小 init，仍然秒传
        let again = store.init(declared(&content, 2048)).await.unwrap();
        assert!(again.complete);
    }

    #[tokio::test]
    async fn test_received_set_survives_restart() {
        let dir = tempdir().unwrap();
        let content = vec![2u8; 5000];

        {
            let store = UploadStore::open(dir.path()).await.unwrap();
            store.init(declared(&content, 1000)).await.unwrap();
            put_indices(&store, &content, 1000, &[0, 3]).await;
        }

        // 新实例模拟进程重启：init 从磁盘报告同样的集合
        let store = UploadStore::open(dir.path()).await.unwrap();
        let outcome = store.init(declared(&content, 1000)).await.unwrap();
        assert_eq!(outcome.uploaded, vec![0, 3]);
    }

    #[tokio::test]
    async fn test_complete_state_survives_restart() {
        let dir = tempdir().unwrap();
        let content = vec![9u8; 1500];
        let fp = fingerprint_of(&content);

        {
            let store = UploadStore::open(dir.path()).await.unwrap();
            store.init(declared(&content, 1000)).await.unwrap();
            put_indices(&store, &content, 1000, &[0, 1]).await;
            store.merge(&fp).await.unwrap();
        }

        let store = UploadStore::open(dir.path()).await.unwrap();
        let outcome = store.init(declared(&content, 1000)).await.unwrap();
        assert!(outcome.complete);

        let session = store.session(&fp).await.unwrap();
        let final_path = session.final_path.unwrap();
        assert_eq!(
            tokio::fs::read(&final_path).await.unwrap().len(),
            content.len()
        );
    }

    #[tokio::test]
    async fn test_remove_incomplete_session() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![7u8; 3000];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();
        put_indices(&store, &content, 1000, &[0]).await;

        store.remove(&fp).await.unwrap();
        assert!(matches!(
            store.session(&fp).await.unwrap_err(),
            UploadError::SessionNotFound(_)
        ));

        // 取消后重新 init 从零开始
        let outcome = store.init(declared(&content, 1000)).await.unwrap();
        assert!(outcome.uploaded.is_empty());
    }

    #[tokio::test]
    async fn test_remove_complete_session_refused() {
        let dir = tempdir().unwrap();
        let store = UploadStore::open(dir.path()).await.unwrap();
        let content = vec![7u8; 1000];
        let fp = fingerprint_of(&content);

        store.init(declared(&content, 1000)).await.unwrap();
        put_indices(&store, &content, 1000, &[0]).await;
        store.merge(&fp).await.unwrap();

        assert!(store.remove(&fp).await.is_err());
    }
}
