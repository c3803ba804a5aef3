//! Intra Share Core Library
//!
//! 局域网点对点文件传输服务的核心实现库
//!
//! # 模块
//!
//! - **auth**: 令牌/会话签发与过期清扫
//! - **config**: 设置快照、用户凭证、离线/定时队列的持久化
//! - **discovery**: mDNS 广播与发现、在场探测、延迟传输释放
//! - **fileops**: 哈希、压缩、AES-CTR 加密与落盘后处理
//! - **transfer**: 分块上传协议、摄入服务器、发送引擎
//! - **events**: 核心出站事件总线
//!
//! # 使用示例
//!
//! ## 接收文件
//!
//! ```ignore
//! use intrashare_core::{Authority, EventBus, IngestServer, ensure_certificate};
//!
//! // 1. 准备证书和共享状态
//! let (cert, key) = ensure_certificate(&config_dir).await?;
//! let tokens = Arc::new(Authority::new());
//! let sessions = Arc::new(Authority::new());
//!
//! // 2. 启动 TLS 摄入服务器
//! let server = IngestServer::new(snapshot, tokens, sessions, events);
//! server.serve_tls(addr, &cert, &key, handle).await?;
//! ```
//!
//! ## 发送文件
//!
//! ```ignore
//! use intrashare_core::{SendEngine, SendOutcome};
//!
//! let engine = SendEngine::new(registry, events)?;
//! match engine.send_file(&peer, "report.pdf", &content, &snapshot, cancel).await? {
//!     SendOutcome::Sent { total_chunks } => println!("sent in {} chunks", total_chunks),
//!     other => eprintln!("transfer ended: {:?}", other),
//! }
//! ```

pub mod auth;
pub mod config;
pub mod discovery;
pub mod events;
pub mod fileops;
pub mod transfer;

// Auth re-exports
pub use auth::{Authority, CREDENTIAL_TTL, SWEEP_INTERVAL};

// Config re-exports
pub use config::{
    DeferredTransfer, PathPermissions, ScheduledTransfer, Settings, SettingsSnapshot,
};

// Discovery re-exports
pub use discovery::{
    DeferredQueues, DispatchRequest, Peer, PeerRegistry, PeerStatus, PresenceTracker,
    SERVICE_TYPE, is_internal_host,
};

// Events re-exports
pub use events::{CoreEvent, EventBus, NoticeLevel, TransferProgress};

// Transfer re-exports
pub use transfer::{
    DEFAULT_PORT, IngestServer, IngestState, LinkSpeed, OutboundTransfer, SendConfig,
    SendEngine, SendOutcome, TransferError, ensure_certificate,
};
