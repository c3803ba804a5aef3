//! 核心出站事件
//!
//! 核心不直接操纵任何 UI：所有需要呈现或持久化的状态变化都通过
//! [`EventBus`] 广播出去，由被排除在核心之外的表现层/存储层订阅。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::discovery::{Peer, PeerStatus};

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// 单个出站传输的进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub file_name: String,
    pub peer_name: String,
    /// 已确认的分块数
    pub chunks_sent: u32,
    pub total_chunks: u32,
    /// 0-100
    pub percentage: u8,
    /// 瞬时吞吐量（MiB/s）= 分块大小 / 往返耗时
    pub throughput: f64,
}

/// 核心发布的事件
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// 文件已接收并完成后处理
    FileReceived {
        name: String,
        path: std::path::PathBuf,
        /// RFC 3339 时间戳，存储层以此追加传输历史
        timestamp: String,
    },
    /// 文件已组装完毕，等待人工批准
    FilePending { transfer_id: String, name: String },
    /// 发现新设备
    DeviceFound(Peer),
    /// 设备状态变化
    DeviceStatusUpdate { name: String, status: PeerStatus },
    /// 面向操作者的通知
    Notification {
        message: String,
        level: NoticeLevel,
    },
    /// 出站传输进度
    TransferProgress(TransferProgress),
}

/// 事件总线：broadcast 通道的薄封装
///
/// 发布永不阻塞，没有订阅者时静默丢弃。
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// 发出一条通知事件
    pub fn notify(&self, message: impl Into<String>, level: NoticeLevel) {
        self.emit(CoreEvent::Notification {
            message: message.into(),
            level,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // 不应 panic 也不应阻塞
        bus.notify("nobody listening", NoticeLevel::Info);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.notify("hello", NoticeLevel::Success);

        match rx.recv().await.unwrap() {
            CoreEvent::Notification { message, level } => {
                assert_eq!(message, "hello");
                assert_eq!(level, NoticeLevel::Success);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
