//! Intra Share Daemon
//!
//! 后台守护进程，负责：
//! - TLS 摄入服务器（接收文件）
//! - mDNS 广播与在场跟踪
//! - 令牌/会话签发与清扫
//! - 延期传输（离线队列、定时传输）的派发

mod service;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（intrashare-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,intrashare_core=debug")),
        )
        .try_init();

    tracing::info!("Intra Share Daemon starting...");

    service::run_service().await
}
