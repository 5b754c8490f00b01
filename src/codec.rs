// 分片编解码器
//
// 文件到字节区间序列的纯函数映射，客户端和服务端用同样的三元组
// (file_size, chunk_size, index) 计算出完全一致的区间，
// 服务端据此校验收到的分片长度，不信任客户端声明的边界。

use crate::error::{UploadError, UploadResult};
use std::ops::Range;

/// 计算分片总数: ceil(file_size / chunk_size)
///
/// 空文件返回 0 个分片
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    debug_assert!(chunk_size > 0);
    file_size.div_ceil(chunk_size)
}

/// 计算指定分片的字节区间
///
/// 区间连续划分 [0, file_size)，除最后一个分片外长度均为 chunk_size
pub fn chunk_range(index: u64, file_size: u64, chunk_size: u64) -> UploadResult<Range<u64>> {
    if chunk_size == 0 {
        return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
    }
    let total = total_chunks(file_size, chunk_size);
    if index >= total {
        return Err(UploadError::Validation(format!(
            "分片索引越界: index={}, total={}",
            index, total
        )));
    }
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file_size);
    Ok(start..end)
}

/// 计算指定分片的期望长度
pub fn chunk_len(index: u64, file_size: u64, chunk_size: u64) -> UploadResult<u64> {
    let range = chunk_range(index, file_size, chunk_size)?;
    Ok(range.end - range.start)
}

/// 分片描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// 分片索引
    pub index: u64,
    /// 字节区间
    pub range: Range<u64>,
}

impl ChunkSpec {
    /// 分片长度
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 是否为空分片
    pub fn is_empty(&self) -> bool {
        self.range.start == self.range.end
    }
}

/// 枚举文件的全部分片描述，按索引升序
pub fn split(file_size: u64, chunk_size: u64) -> UploadResult<Vec<ChunkSpec>> {
    if chunk_size == 0 {
        return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
    }
    let total = total_chunks(file_size, chunk_size);
    let mut chunks = Vec::with_capacity(total as usize);
    for index in 0..total {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(file_size);
        chunks.push(ChunkSpec {
            index,
            range: start..end,
        });
    }
    Ok(chunks)
}
