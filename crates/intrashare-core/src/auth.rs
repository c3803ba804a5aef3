//! 会话与令牌机构
//!
//! 管理两类短期凭证：
//! - **令牌 (token)**: 每个广播周期铸造一枚，随 mDNS 广播发布，授权对端上传
//! - **会话 (session)**: 一次客户端运行的批次凭证，摄入端在其他校验之前检查
//!
//! 两者结构相同，所以用同一个 [`Authority`] 各自实例化。状态只存活于进程
//! 生命周期内，过期条目由后台清扫任务按固定间隔移除。

use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 凭证默认存活时间：1 小时
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

/// 清扫间隔：1 分钟
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 短期凭证机构
///
/// 令牌表和会话表在校验与清扫之间并发访问，因此内部用互斥锁保护。
pub struct Authority {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Authority {
    pub fn new() -> Self {
        Self::with_ttl(CREDENTIAL_TTL)
    }

    /// 指定 TTL 构造（测试用，或需要更短存活期的场合）
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 铸造一枚新凭证：16 个加密随机字节的十六进制编码
    pub async fn issue(&self) -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let id = bytes.iter().fold(String::with_capacity(32), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });

        self.entries.lock().await.insert(id.clone(), Instant::now());
        id
    }

    /// 登记一枚外部提供的凭证（预共享会话 ID 走这条路径）
    pub async fn register(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        self.entries
            .lock()
            .await
            .insert(id.to_string(), Instant::now());
    }

    /// 凭证是否存在且未过期
    ///
    /// 缺失或过期不是异常，而是向调用方报告的授权失败。
    pub async fn is_valid(&self, id: &str) -> bool {
        match self.entries.lock().await.get(id) {
            Some(issued_at) => issued_at.elapsed() <= self.ttl,
            None => false,
        }
    }

    /// 移除所有过期条目，返回移除数量
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, issued_at| issued_at.elapsed() <= ttl);
        before - entries.len()
    }

    /// 当前存活条目数
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// 后台清扫循环，每分钟清理一次过期凭证
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = self.sweep_expired().await;
            if removed > 0 {
                debug!("Swept {} expired credentials", removed);
            }
        }
    }
}

impl Default for Authority {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_validate() {
        let authority = Authority::new();
        let token = authority.issue().await;

        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(authority.is_valid(&token).await);
        assert!(!authority.is_valid("deadbeef").await);
    }

    #[tokio::test]
    async fn test_tokens_are_unpredictable() {
        let authority = Authority::new();
        let a = authority.issue().await;
        let b = authority.issue().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_expired_credential_rejected() {
        let authority = Authority::with_ttl(Duration::ZERO);
        let token = authority.issue().await;

        // TTL 为零，凭证立即过期
        assert!(!authority.is_valid(&token).await);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let authority = Authority::with_ttl(Duration::ZERO);
        authority.issue().await;
        authority.issue().await;

        assert_eq!(authority.len().await, 2);
        assert_eq!(authority.sweep_expired().await, 2);
        assert!(authority.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_external_session() {
        let authority = Authority::new();
        authority.register("pre-shared-session").await;
        assert!(authority.is_valid("pre-shared-session").await);

        // 空 ID 不登记
        authority.register("").await;
        assert!(!authority.is_valid("").await);
    }
}
