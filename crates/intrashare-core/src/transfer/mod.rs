//! 文件传输模块
//!
//! 包含:
//! - 分块上传协议（请求头、分块大小分级、错误分类）
//! - HTTPS 接收服务器（验证链、组装、落盘后处理）
//! - 发送引擎（压缩+加密管线、顺序分块、重试与取消）

pub mod protocol;
pub mod sender;
pub mod server;

pub use protocol::{LinkSpeed, TransferError, transfer_key};
pub use sender::{OutboundTransfer, SendConfig, SendEngine, SendOutcome};
pub use server::{DEFAULT_PORT, IngestServer, IngestState, ensure_certificate};
