// 分片存储后端
//
// 以 (指纹, 分片索引) 为键的内容寻址存储。写入幂等且并发安全：
// 每个索引占据独立的文件槽位，不同索引的并发写互不干扰，
// 重复写同一索引被接受为 no-op。
//
// ChunkBackend trait 是存储层的替换点，默认实现落在本地文件系统；
// 接入对象存储等后端时实现同一 trait 即可。

use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 分片文件扩展名
const PART_EXTENSION: &str = "part";

/// 分片存储后端抽象
#[async_trait]
pub trait ChunkBackend: Send + Sync {
    /// 持久化一个分片
    ///
    /// 返回 true 表示本次写入了新分片，false 表示该索引已存在（幂等 no-op）
    async fn put_chunk(&self, fingerprint: &str, index: u64, bytes: &[u8]) -> UploadResult<bool>;

    /// 读取一个分片的完整内容
    async fn read_chunk(&self, fingerprint: &str, index: u64) -> UploadResult<Vec<u8>>;

    /// 列出已持久化的分片索引
    ///
    /// 反映磁盘上的持久状态而非内存缓存，进程重启后依然正确
    async fn list_received(&self, fingerprint: &str) -> UploadResult<BTreeSet<u64>>;

    /// 删除该指纹名下的全部分片
    async fn remove_all(&self, fingerprint: &str) -> UploadResult<()>;
}

/// 本地文件系统分片存储
///
/// 目录布局: `{chunks_dir}/{fingerprint}/{index}.part`
#[derive(Debug)]
pub struct FsChunkBackend {
    chunks_dir: PathBuf,
}

impl FsChunkBackend {
    pub fn new(chunks_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunks_dir: chunks_dir.into(),
        }
    }

    /// 指纹对应的分片目录
    fn fingerprint_dir(&self, fingerprint: &str) -> PathBuf {
        self.chunks_dir.join(fingerprint)
    }

    /// 分片文件路径
    fn chunk_path(&self, fingerprint: &str, index: u64) -> PathBuf {
        self.fingerprint_dir(fingerprint)
            .join(format!("{}.{}", index, PART_EXTENSION))
    }

    /// 确保目录存在
    async fn ensure_dir(dir: &Path) -> UploadResult<()> {
        fs::create_dir_all(dir).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkBackend for FsChunkBackend {
    async fn put_chunk(&self, fingerprint: &str, index: u64, bytes: &[u8]) -> UploadResult<bool> {
        let path = self.chunk_path(fingerprint, index);
        if fs::try_exists(&path).await? {
            // 重传的分片：接受为成功，不覆盖已持久化的数据
            debug!("分片 #{} 已存在，忽略重复写入: {}", index, fingerprint);
            return Ok(false);
        }

        Self::ensure_dir(&self.fingerprint_dir(fingerprint)).await?;

        // 先写临时文件再原子改名，避免读到写了一半的分片；
        // 临时文件名带唯一后缀，并发的重复写不会互相覆盖
        let tmp_path = self.fingerprint_dir(fingerprint).join(format!(
            ".{}.{}.tmp-{}",
            index,
            PART_EXTENSION,
            uuid::Uuid::new_v4()
        ));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(e));
        }

        debug!(
            "分片已持久化: fingerprint={}, index={}, size={} bytes",
            fingerprint,
            index,
            bytes.len()
        );
        Ok(true)
    }

    async fn read_chunk(&self, fingerprint: &str, index: u64) -> UploadResult<Vec<u8>> {
        let path = self.chunk_path(fingerprint, index);
        let bytes = fs::read(&path).await?;
        Ok(bytes)
    }

    async fn list_received(&self, fingerprint: &str) -> UploadResult<BTreeSet<u64>> {
        let dir = self.fingerprint_dir(fingerprint);
        let mut received = BTreeSet::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // 目录还不存在：一个分片都没收到
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(received),
            Err(e) => return Err(UploadError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // 跳过残留的临时文件
            let Some(stem) = name.strip_suffix(&format!(".{}", PART_EXTENSION)) else {
                continue;
            };
            match stem.parse::<u64>() {
                Ok(index) => {
                    received.insert(index);
                }
                Err(_) => {
                    warn!("分片目录下发现无法识别的文件: {:?}", entry.path());
                }
            }
        }

        Ok(received)
    }

    async fn remove_all(&self, fingerprint: &str) -> UploadResult<()> {
        let dir = self.fingerprint_dir(fingerprint);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Io(e)),
        }
    }
}
