// 内容指纹计算器
//
// 在阻塞线程池中按分片顺序流式读取文件，计算 SHA-256 内容指纹，
// 通过 channel 向调用方回报进度，不与调用方共享任何可变状态，
// 大文件哈希不会卡住交互线程。
//
// 指纹对整个字节流计算，与分片大小无关：同一份内容无论用什么
// 分片大小上报进度，指纹都一致，去重才有意义。

use crate::codec;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 哈希过程事件
///
/// 若干个 Progress 之后是恰好一个终态事件（Done 或 Failed）；
/// 被取消的计算不产生终态事件，调用方以 channel 关闭感知
#[derive(Debug, Clone)]
pub enum HashEvent {
    /// 进度（0.0 ~ 1.0）
    Progress { fraction: f64 },
    /// 计算完成，携带十六进制指纹
    Done { hash: String },
    /// 读取失败（I/O 错误、文件被删除等）
    Failed { error: String },
}

/// 指纹计算句柄
///
/// 每次选择文件创建一个新句柄，旧句柄 cancel 后丢弃即可，
/// 不会泄漏上一次的计算任务
pub struct FingerprintHandle {
    rx: mpsc::UnboundedReceiver<HashEvent>,
    token: CancellationToken,
}

impl FingerprintHandle {
    /// 接收下一个事件；worker 退出后返回 None
    pub async fn recv(&mut self) -> Option<HashEvent> {
        self.rx.recv().await
    }

    /// 取消计算，进行中的读取在下一个分片边界被放弃
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 等待终态事件，返回指纹
    ///
    /// 计算被取消时 channel 无终态事件直接关闭，返回 Cancelled
    pub async fn wait(mut self) -> crate::error::UploadResult<String> {
        while let Some(event) = self.rx.recv().await {
            match event {
                HashEvent::Progress { .. } => continue,
                HashEvent::Done { hash } => return Ok(hash),
                HashEvent::Failed { error } => {
                    return Err(crate::error::UploadError::Validation(error))
                }
            }
        }
        Err(crate::error::UploadError::Cancelled)
    }
}

impl Drop for FingerprintHandle {
    fn drop(&mut self) {
        // 句柄丢弃视同取消
        self.token.cancel();
    }
}

/// 指纹计算器
pub struct FingerprintWorker;

impl FingerprintWorker {
    /// 启动一次指纹计算
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `chunk_size` - 分片大小（只影响进度上报粒度，不影响指纹值）
    pub fn spawn(path: impl Into<PathBuf>, chunk_size: u64) -> FingerprintHandle {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let worker_token = token.clone();

        tokio::task::spawn_blocking(move || {
            Self::run_sync(&path, chunk_size, tx, worker_token);
        });

        FingerprintHandle { rx, token }
    }

    /// 同步计算主体（在阻塞线程池中运行）
    fn run_sync(
        path: &Path,
        chunk_size: u64,
        tx: mpsc::UnboundedSender<HashEvent>,
        token: CancellationToken,
    ) {
        let result = Self::hash_file(path, chunk_size, &tx, &token);
        match result {
            Ok(Some(hash)) => {
                debug!("指纹计算完成: path={:?}, hash={}", path, hash);
                let _ = tx.send(HashEvent::Done { hash });
            }
            Ok(None) => {
                // 被取消：不发终态事件，channel 随 worker 退出关闭
                debug!("指纹计算已取消: path={:?}", path);
            }
            Err(e) => {
                let _ = tx.send(HashEvent::Failed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// 按分片顺序读取并哈希；返回 Ok(None) 表示被取消
    fn hash_file(
        path: &Path,
        chunk_size: u64,
        tx: &mpsc::UnboundedSender<HashEvent>,
        token: &CancellationToken,
    ) -> std::io::Result<Option<String>> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let total = codec::total_chunks(file_size, chunk_size.max(1));

        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 65536];

        for index in 0..total {
            if token.is_cancelled() {
                return Ok(None);
            }

            // 读取当前分片
            let chunk_len = codec::chunk_len(index, file_size, chunk_size.max(1))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
            let mut remaining = chunk_len;
            while remaining > 0 {
                let to_read = remaining.min(buffer.len() as u64) as usize;
                let bytes_read = reader.read(&mut buffer[..to_read])?;
                if bytes_read == 0 {
                    // 文件在读取过程中被截断
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("文件在读取分片 #{} 时被截断", index),
                    ));
                }
                hasher.update(&buffer[..bytes_read]);
                remaining -= bytes_read as u64;
            }

            let _ = tx.send(HashEvent::Progress {
                fraction: (index + 1) as f64 / total as f64,
            });
        }

        Ok(Some(hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_hash_small_file() {
        let f = write_temp(b"Hello, World!");
        let handle = FingerprintWorker::spawn(f.path(), 4);
        let hash = handle.wait().await.unwrap();
        // SHA-256("Hello, World!")
        assert_eq!(
            hash,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[tokio::test]
    async fn test_hash_deterministic_across_chunk_sizes() {
        let content = vec![0xabu8; 300 * 1024];
        let f = write_temp(&content);

        let h1 = FingerprintWorker::spawn(f.path(), 64 * 1024)
            .wait()
            .await
            .unwrap();
        let h2 = FingerprintWorker::spawn(f.path(), 7 * 1024)
            .wait()
            .await
            .unwrap();
        // 分片大小不同，指纹相同
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_progress_then_done() {
        let content = vec![1u8; 10 * 1024];
        let f = write_temp(&content);

        let mut handle = FingerprintWorker::spawn(f.path(), 1024);
        let mut progress_count = 0usize;
        let mut last_fraction = 0.0f64;
        let mut done = false;

        while let Some(event) = handle.recv().await {
            match event {
                HashEvent::Progress { fraction } => {
                    // 进度单调不减
                    assert!(fraction >= last_fraction);
                    last_fraction = fraction;
                    progress_count += 1;
                }
                HashEvent::Done { .. } => {
                    done = true;
                    break;
                }
                HashEvent::Failed { error } => panic!("不应失败: {}", error),
            }
        }

        assert!(done);
        assert_eq!(progress_count, 10);
        assert!((last_fraction - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_hash_nonexistent_file() {
        let handle = FingerprintWorker::spawn("/nonexistent/file.bin", 1024);
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_hash_empty_file() {
        let f = write_temp(b"");
        let hash = FingerprintWorker::spawn(f.path(), 1024).wait().await.unwrap();
        // SHA-256 空串
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_cancel_before_terminal() {
        let content = vec![2u8; 1024 * 1024];
        let f = write_temp(&content);

        let handle = FingerprintWorker::spawn(f.path(), 4 * 1024);
        handle.cancel();
        // 取消后不保证终态事件；wait 返回 Cancelled 或（竞争下）已完成的结果
        match handle.wait().await {
            Ok(_) | Err(crate::error::UploadError::Cancelled) => {}
            Err(e) => panic!("意外错误: {}", e),
        }
    }
}
