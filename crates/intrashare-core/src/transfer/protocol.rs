//! 分块上传协议
//!
//! 每个分块是一次独立的 HTTPS 请求，元数据全部放在请求头里，
//! 请求体是（压缩+加密后的）原始字节片段。

use thiserror::Error;

/// 请求头名称
pub mod headers {
    pub const FILE_NAME: &str = "file-name";
    pub const FILE_SIZE: &str = "file-size";
    pub const CHUNK_INDEX: &str = "chunk-index";
    pub const TOTAL_CHUNKS: &str = "total-chunks";
    /// 对端令牌
    pub const AUTHORIZATION: &str = "authorization";
    pub const ENCRYPTION_KEY: &str = "encryption-key";
    /// base64 编码的 `user:password`
    pub const USER_AUTH: &str = "user-auth";
    pub const SESSION_ID: &str = "session-id";
    pub const FILE_HASH: &str = "file-hash";
    /// 负载已加密的标记
    pub const ENCRYPTED_REQUEST: &str = "x-encrypted-request";
}

/// 文件名长度上限
pub const MAX_FILE_NAME_LEN: usize = 255;

/// 传输失败分类
///
/// Authorization / Validation / Capacity 对该请求是终态，绝不重试；
/// Integrity 丢弃整个传输；Network 只由发送端做有限重试；
/// Cancelled 永远优先于重试。
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unauthorized: {0}")]
    Authorization(&'static str),
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("transfer cancelled")]
    Cancelled,
}

/// 按白名单清洗文件名：只保留字母数字和 `.` `_` `-`
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// 文件名是否可接受
///
/// 清洗不是"尽力修复"：任何与清洗结果的偏差都直接拒绝，防止路径注入。
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_FILE_NAME_LEN && name == sanitize_file_name(name)
}

/// 一次逻辑传输在所有分块间稳定的标识
///
/// 由会话 ID、文件名和分块总数确定性导出，而不是每个请求重新计算。
pub fn transfer_key(session_id: &str, file_name: &str, total_chunks: u32) -> String {
    format!("{}:{}:{}", session_id, file_name, total_chunks)
}

/// 64 KiB
const KIB_64: u64 = 64 * 1024;
/// 512 KiB
const KIB_512: u64 = 512 * 1024;
/// 1 MiB
const MIB_1: u64 = 1024 * 1024;
/// 5 MiB
const MIB_5: u64 = 5 * 1024 * 1024;
/// 快速链路下分块大小的增长上限：8 MiB
const MAX_CHUNK: u64 = 8 * 1024 * 1024;
/// 慢速链路下的分块上限
const SLOW_LINK_CAP: u64 = KIB_64;

/// 测得的链路速度档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSpeed {
    #[default]
    Unknown,
    Slow,
    Fast,
}

/// 按原始文件大小查分块大小分级表
pub fn base_chunk_size(file_size: u64) -> u64 {
    if file_size < MIB_1 {
        KIB_64
    } else if file_size < 100 * MIB_1 {
        KIB_512
    } else if file_size < 1024 * MIB_1 {
        MIB_1
    } else {
        MIB_5
    }
}

/// 有效分块大小 = 分级值经链路调整后，再取所有适用上限的最小值
///
/// - 快速链路：分级值翻倍，封顶 8 MiB
/// - 配置的带宽上限（KiB）：作为上限之一
/// - 慢速链路：封顶 64 KiB
pub fn effective_chunk_size(
    file_size: u64,
    bandwidth_limit_kib: u64,
    link: LinkSpeed,
) -> u64 {
    let mut size = base_chunk_size(file_size);

    if link == LinkSpeed::Fast {
        size = (size * 2).min(MAX_CHUNK);
    }
    if bandwidth_limit_kib > 0 {
        size = size.min(bandwidth_limit_kib * 1024);
    }
    if link == LinkSpeed::Slow {
        size = size.min(SLOW_LINK_CAP);
    }
    size
}
