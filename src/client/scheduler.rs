// 传输调度器
//
// 有界并发的分片上传工作池：固定数量的 worker 循环从共享 FIFO
// 队列原子取号，传完一片立刻取下一片（自给自足，不是批量等齐），
// 既打满链路又限制同时打开的连接数。
//
// 暂停 = 停止派发 + 取消令牌中止在途请求；已落盘的分片留在服务端。
// 恢复 = 换新令牌重新 init，缺失集合以服务端上报为准，从不信任
// 客户端跨暂停/重载边界的本地记账。

use crate::client::api::UploadApiClient;
use crate::client::task::{UploadTask, UploadTaskStatus};
use crate::codec;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::protocol::InitRequest;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试配置
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
fn calculate_backoff_delay(retry_count: u32) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS * 2u64.pow(retry_count.min(16));
    base_delay.min(MAX_BACKOFF_MS)
}

/// 调度器配置
///
/// 分片大小与并发数来自配置，不是模块级常量
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 最大并发分片数
    pub max_concurrency: usize,
    /// 单分片最大重试次数
    pub max_retries: u32,
}

impl From<&UploadConfig> for SchedulerConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes(),
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
        }
    }
}

/// 传输调度器
///
/// 每个上传尝试一个实例；暂停后 resume 在同一实例上重建派发状态
pub struct TransferScheduler {
    api: Arc<UploadApiClient>,
    config: SchedulerConfig,
    task: Arc<Mutex<UploadTask>>,
    fingerprint: String,
    local_path: PathBuf,
    file_size: u64,
    total_chunks: u64,
    /// 是否处于暂停
    paused: Arc<AtomicBool>,
    /// 当前尝试的取消令牌；resume 时整体换新
    token: std::sync::Mutex<CancellationToken>,
    /// 合并只触发一次
    is_merging: AtomicBool,
}

impl TransferScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `fingerprint` - 已算好的内容指纹
    /// * `local_path` - 本地文件路径
    /// * `file_name` - 声明给服务端的文件名
    /// * `file_size` - 文件大小
    pub fn new(
        api: Arc<UploadApiClient>,
        config: SchedulerConfig,
        fingerprint: String,
        local_path: PathBuf,
        file_name: String,
        file_size: u64,
    ) -> Self {
        let total_chunks = codec::total_chunks(file_size, config.chunk_size.max(1));
        let mut task = UploadTask::new(local_path.clone(), file_name, file_size);
        task.set_fingerprint(fingerprint.clone());
        task.total_chunks = total_chunks;

        Self {
            api,
            config,
            task: Arc::new(Mutex::new(task)),
            fingerprint,
            local_path,
            file_size,
            total_chunks,
            paused: Arc::new(AtomicBool::new(false)),
            token: std::sync::Mutex::new(CancellationToken::new()),
            is_merging: AtomicBool::new(false),
        }
    }

    /// 任务记录（进度展示用）
    pub fn task(&self) -> Arc<Mutex<UploadTask>> {
        self.task.clone()
    }

    /// 是否处于暂停
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 暂停：停止派发并中止在途请求
    ///
    /// 服务端已持久化的分片不回滚
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.token.lock().unwrap().cancel();
        info!("上传已暂停: fingerprint={}", self.fingerprint);
    }

    /// 恢复：换新令牌，重新向服务端查询缺失集合后继续
    pub async fn resume(&self) -> UploadResult<UploadTaskStatus> {
        *self.token.lock().unwrap() = CancellationToken::new();
        self.paused.store(false, Ordering::SeqCst);
        info!("上传恢复: fingerprint={}", self.fingerprint);
        self.start().await
    }

    /// 执行一次上传尝试
    ///
    /// 返回终态: Completed / Deduplicated / Paused；
    /// 真正的失败（传输中断且重试耗尽、校验被拒）作为 Err 返回，
    /// 任务同时标记 Failed
    pub async fn start(&self) -> UploadResult<UploadTaskStatus> {
        match self.run().await {
            Ok(status) => Ok(status),
            Err(e) if e.is_cancelled() => {
                // 暂停不是失败
                self.task.lock().await.mark_paused();
                Ok(UploadTaskStatus::Paused)
            }
            Err(e) => {
                self.task.lock().await.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run(&self) -> UploadResult<UploadTaskStatus> {
        let token = self.token.lock().unwrap().clone();
        let file_name = {
            let mut task = self.task.lock().await;
            task.mark_uploading();
            task.file_name.clone()
        };

        // 1. init：创建/查询会话，拿到权威的已传集合
        let init = self
            .api
            .init(
                &InitRequest {
                    file_hash: self.fingerprint.clone(),
                    file_name,
                    file_size: self.file_size,
                    chunk_size: self.config.chunk_size,
                    total_chunks: self.total_chunks,
                },
                &token,
            )
            .await?;

        // 2. 秒传短路：零分片传输
        if init.complete {
            info!("秒传完成: fingerprint={}", self.fingerprint);
            self.task.lock().await.mark_deduplicated();
            return Ok(UploadTaskStatus::Deduplicated);
        }

        let uploaded: BTreeSet<u64> = init.uploaded.into_iter().collect();

        // 3. 以服务端集合重建进度和缺失队列（FIFO 派发序）
        let mut pending = VecDeque::new();
        let mut uploaded_bytes = 0u64;
        for index in 0..self.total_chunks {
            if uploaded.contains(&index) {
                uploaded_bytes +=
                    codec::chunk_len(index, self.file_size, self.config.chunk_size)?;
            } else {
                pending.push_back(index);
            }
        }
        {
            let mut task = self.task.lock().await;
            task.uploaded_size = uploaded_bytes;
            task.completed_chunks = uploaded.len() as u64;
        }

        info!(
            "开始派发: fingerprint={}, 缺失 {}/{} 片, 并发 {}",
            self.fingerprint,
            pending.len(),
            self.total_chunks,
            self.config.max_concurrency
        );

        // 4. 有界工作池抽干队列
        if !pending.is_empty() {
            self.drain_queue(pending, &token).await?;
        }

        // 5. 全部分片就位，触发合并（compare_exchange 保证只有一处执行）
        if self
            .is_merging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let merge_result = self.api.merge(&self.fingerprint, &token).await;
            // 无论成败都放开守卫，失败后允许重试合并
            self.is_merging.store(false, Ordering::SeqCst);

            let merge = merge_result?;
            if !merge.ok {
                return Err(UploadError::Transport("服务端拒绝合并".to_string()));
            }
            debug!(
                "合并完成: fingerprint={}, final_path={:?}",
                self.fingerprint, merge.final_path
            );
        }

        self.task.lock().await.mark_completed();
        info!("上传完成: fingerprint={}", self.fingerprint);
        Ok(UploadTaskStatus::Completed)
    }

    /// 工作池主体：spawn max_concurrency 个 worker 循环消费队列
    ///
    /// 任一 worker 真失败即取消令牌停止其余派发（全有或全无的 join）；
    /// 传播第一个非取消错误
    async fn drain_queue(
        &self,
        pending: VecDeque<u64>,
        token: &CancellationToken,
    ) -> UploadResult<()> {
        let queue = Arc::new(Mutex::new(pending));
        let worker_count = self.config.max_concurrency.min(queue.lock().await.len()).max(1);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 1..=worker_count {
            let api = self.api.clone();
            let queue = queue.clone();
            let token = token.clone();
            let task = self.task.clone();
            let fingerprint = self.fingerprint.clone();
            let local_path = self.local_path.clone();
            let file_size = self.file_size;
            let chunk_size = self.config.chunk_size;
            let max_retries = self.config.max_retries;

            workers.push(tokio::spawn(async move {
                loop {
                    if token.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    // 原子取号：谁拿到下一个索引在锁内决定，没有竞态
                    let index = { queue.lock().await.pop_front() };
                    let Some(index) = index else {
                        debug!("[上传线程{}] 队列已空，退出", worker_id);
                        return Ok(());
                    };

                    let chunk_len = match upload_one_chunk(
                        &api,
                        &fingerprint,
                        &local_path,
                        file_size,
                        chunk_size,
                        index,
                        max_retries,
                        worker_id,
                        &token,
                    )
                    .await
                    {
                        Ok(len) => len,
                        Err(e) => {
                            if !e.is_cancelled() {
                                // 真失败：取消令牌，停止所有 worker 的后续派发
                                token.cancel();
                            }
                            return Err(e);
                        }
                    };

                    // 分片完成立即更新进度
                    let mut t = task.lock().await;
                    t.uploaded_size += chunk_len;
                    t.completed_chunks += 1;
                    info!(
                        "[上传线程{}] ✓ 分片 #{} 上传成功 ({}/{} 完成)",
                        worker_id, index, t.completed_chunks, t.total_chunks
                    );
                }
            }));
        }

        // Promise.all 式 join：等全部 worker 落定，传播第一个真失败
        let joined = futures::future::join_all(workers).await;

        let mut first_error: Option<UploadError> = None;
        for result in joined {
            let result: UploadResult<()> = result
                .map_err(|e| UploadError::Transport(format!("worker 异常退出: {}", e)))?;
            if let Err(e) = result {
                match &first_error {
                    None => first_error = Some(e),
                    // 兄弟 worker 的取消是派发停止的结果，真实原因优先
                    Some(f) if f.is_cancelled() && !e.is_cancelled() => first_error = Some(e),
                    Some(_) => {}
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// 上传单个分片（带重试）
///
/// 只有可重试的传输失败才退避重试；取消立即中止。
/// 重传幂等由服务端保证，重试不会破坏已存储的状态。
#[allow(clippy::too_many_arguments)]
async fn upload_one_chunk(
    api: &UploadApiClient,
    fingerprint: &str,
    local_path: &std::path::Path,
    file_size: u64,
    chunk_size: u64,
    index: u64,
    max_retries: u32,
    worker_id: usize,
    token: &CancellationToken,
) -> UploadResult<u64> {
    let range = codec::chunk_range(index, file_size, chunk_size)?;
    let chunk_len = range.end - range.start;

    debug!(
        "[上传线程{}] 分片 #{} 开始上传 (范围: {}-{}, 大小: {} bytes)",
        worker_id,
        index,
        range.start,
        range.end,
        chunk_len
    );

    let data = read_chunk_data(local_path, range.start, chunk_len as usize).await?;

    let mut last_error = None;
    for retry in 0..=max_retries {
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        match api.upload_chunk(fingerprint, index, data.clone(), token).await {
            Ok(_ack) => return Ok(chunk_len),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if e.is_retriable() && retry < max_retries => {
                let backoff_ms = calculate_backoff_delay(retry);
                warn!(
                    "[上传线程{}] 分片 #{} 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                    worker_id,
                    index,
                    backoff_ms,
                    retry + 1,
                    max_retries,
                    e
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last_error = Some(e);
            }
            Err(e) => {
                error!(
                    "[上传线程{}] 分片 #{} 上传失败（不再重试）: {}",
                    worker_id, index, e
                );
                return Err(e);
            }
        }
    }

    error!(
        "[上传线程{}] 分片 #{} 上传失败，已达最大重试次数 ({})",
        worker_id, index, max_retries
    );
    Err(last_error.unwrap_or_else(|| UploadError::Transport("上传失败".to_string())))
}

/// 读取分片数据（阻塞线程池中 seek + read_exact）
async fn read_chunk_data(
    local_path: &std::path::Path,
    start: u64,
    size: usize,
) -> UploadResult<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let local_path = local_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&local_path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    })
    .await
    .map_err(|e| UploadError::Transport(format!("读分片任务执行失败: {}", e)))?
}
