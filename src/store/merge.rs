// 合并引擎
//
// 分片集齐后按索引顺序拼装成品文件。调用方持有该指纹的会话锁，
// 并发的合并请求在锁上串行：第一个完成拼装，后来者看到 Complete
// 直接返回成功，绝不二次拼装。
//
// 原子发布：拼装写入 `.assembling` 临时文件，校验字节数后 rename
// 到最终路径，读者看不到半成品。

use crate::codec;
use crate::error::{UploadError, UploadResult};
use crate::store::backend::ChunkBackend;
use crate::store::session::{SessionState, UploadSession};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// 合并引擎
pub struct MergeEngine {
    files_dir: PathBuf,
}

impl MergeEngine {
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
        }
    }

    /// 成品文件路径: `{files_dir}/{fingerprint}_{文件名}`
    ///
    /// 文件名只取最后一段路径成分，防止声明的名字携带目录穿越
    fn final_path(&self, session: &UploadSession) -> PathBuf {
        let name = Path::new(&session.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin");
        self.files_dir
            .join(format!("{}_{}", session.fingerprint, name))
    }

    /// 拼装临时文件路径（每指纹一个，锁内独占）
    fn assembling_path(&self, fingerprint: &str) -> PathBuf {
        self.files_dir.join(format!(".{}.assembling", fingerprint))
    }

    /// 执行合并
    ///
    /// 前置条件：调用方持有该指纹的会话锁。
    /// - 已是 Complete：幂等返回已发布的路径
    /// - 分片未集齐：返回 Incomplete，会话保持 Collecting
    /// - 字节数校验失败：丢弃半成品，回退 Collecting，返回 AssemblyFailed
    pub async fn assemble(
        &self,
        session: &mut UploadSession,
        backend: &dyn ChunkBackend,
    ) -> UploadResult<PathBuf> {
        if session.is_complete() {
            // 重复 merge 调用视为成功
            if let Some(path) = &session.final_path {
                return Ok(path.clone());
            }
            // 不变式被破坏才会走到这里
            return Err(UploadError::Validation(
                "会话标记完成但缺少成品路径".to_string(),
            ));
        }

        if !session.all_received() {
            return Err(UploadError::Incomplete {
                missing: session.missing_count(),
            });
        }

        session.state = SessionState::Merging;
        info!(
            "开始合并: fingerprint={}, total_chunks={}, file_size={}",
            session.fingerprint, session.total_chunks, session.file_size
        );

        fs::create_dir_all(&self.files_dir).await?;
        let tmp_path = self.assembling_path(&session.fingerprint);

        let assembled = self.write_chunks(session, backend, &tmp_path).await;

        let written = match assembled {
            Ok(written) => written,
            Err(e) => {
                // 拼装中途失败：清掉半成品，回到收集态
                let _ = fs::remove_file(&tmp_path).await;
                session.state = SessionState::Collecting;
                error!("合并失败: fingerprint={}, 错误: {}", session.fingerprint, e);
                return Err(e);
            }
        };

        if written != session.file_size {
            let _ = fs::remove_file(&tmp_path).await;
            session.state = SessionState::Collecting;
            warn!(
                "合并字节数校验失败: fingerprint={}, 期望 {} 实际 {}",
                session.fingerprint, session.file_size, written
            );
            return Err(UploadError::AssemblyFailed {
                expected: session.file_size,
                actual: written,
            });
        }

        let final_path = self.final_path(session);
        fs::rename(&tmp_path, &final_path).await?;
        session.mark_complete(final_path.clone());

        info!(
            "合并完成: fingerprint={}, final_path={:?}, size={} bytes",
            session.fingerprint, final_path, written
        );
        Ok(final_path)
    }

    /// 按索引顺序把所有分片写入输出文件，返回写入的总字节数
    async fn write_chunks(
        &self,
        session: &UploadSession,
        backend: &dyn ChunkBackend,
        tmp_path: &Path,
    ) -> UploadResult<u64> {
        let mut out = fs::File::create(tmp_path).await?;
        let mut written = 0u64;

        for index in 0..session.total_chunks {
            let bytes = backend.read_chunk(&session.fingerprint, index).await?;

            // 逐片复核长度，磁盘上被篡改/截断的分片在这里暴露
            let expected = codec::chunk_len(index, session.file_size, session.chunk_size)?;
            if bytes.len() as u64 != expected {
                return Err(UploadError::ChunkLengthMismatch {
                    index,
                    expected,
                    actual: bytes.len() as u64,
                });
            }

            out.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }
}
