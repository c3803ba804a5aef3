//! 在场跟踪（Presence Tracker）
//!
//! - 通过 mDNS 广播本节点的名称、监听端口和当前令牌
//! - 浏览同一服务类型发现对端，拒绝任何非内网地址的通告
//! - 对每个已知设备按固定间隔做 TLS 可达性探测（/ping）
//! - 每个周期扫描两类延期工作：离线队列（设备转为在线时重放）
//!   和定时传输（到达触发时间即重放）
//!
//! 设备从 mDNS 消失不会立刻被移出已知集合——只有探测失败才会把它翻为
//! Offline，避免发现层抖动导致排队的工作丢失。

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::config::{DeferredTransfer, ScheduledTransfer, SettingsSnapshot};
use crate::events::{CoreEvent, EventBus, NoticeLevel};

/// mDNS 服务类型
pub const SERVICE_TYPE: &str = "_intra-share._tcp.local.";

/// 探测与重放扫描间隔：10 秒
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// 单次可达性探测的超时上限
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// 设备可达性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PeerStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// 内网中的一台对端设备，身份以名称为准
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// 对端随广播发布的上传令牌
    pub token: String,
    pub status: PeerStatus,
}

/// 主机是否在内网范围或为回环名
///
/// 允许 192.168/16、10/8、172.16-31 和字面量 `localhost`，其他一律拒绝。
pub fn is_internal_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            let [a, b, _, _] = ip.octets();
            matches!((a, b), (192, 168) | (10, _) | (172, 16..=31))
        }
        Err(_) => false,
    }
}

/// 共享的已知设备集合
///
/// 在场跟踪、发送引擎和重放扫描共用，状态变更与读取互斥。
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或更新设备（只有在场跟踪调用）
    pub async fn upsert(&self, peer: Peer) {
        self.peers.lock().await.insert(peer.name.clone(), peer);
    }

    /// 更新设备状态，返回之前的状态
    pub async fn set_status(&self, name: &str, status: PeerStatus) -> Option<PeerStatus> {
        let mut peers = self.peers.lock().await;
        peers.get_mut(name).map(|peer| {
            let previous = peer.status;
            peer.status = status;
            previous
        })
    }

    pub async fn status_of(&self, name: &str) -> PeerStatus {
        self.peers
            .lock()
            .await
            .get(name)
            .map(|p| p.status)
            .unwrap_or(PeerStatus::Unknown)
    }

    pub async fn get(&self, name: &str) -> Option<Peer> {
        self.peers.lock().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

/// 延期工作队列（离线队列 + 定时传输）
///
/// 条目的取出和派发在同一把锁下原子完成，保证恰好派发一次。
#[derive(Default)]
pub struct DeferredQueues {
    offline: Mutex<Vec<DeferredTransfer>>,
    scheduled: Mutex<Vec<ScheduledTransfer>>,
}

impl DeferredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从设置快照初始化队列内容
    pub fn from_snapshot(snapshot: &SettingsSnapshot) -> Self {
        Self {
            offline: Mutex::new(snapshot.offline_queue.clone()),
            scheduled: Mutex::new(snapshot.scheduled_transfers.clone()),
        }
    }

    pub async fn queue_offline(&self, transfer: DeferredTransfer) {
        self.offline.lock().await.push(transfer);
    }

    pub async fn queue_scheduled(&self, transfer: ScheduledTransfer) {
        self.scheduled.lock().await.push(transfer);
    }

    /// 取出并移除指定设备的全部离线条目
    pub async fn take_offline_for(&self, peer_name: &str) -> Vec<DeferredTransfer> {
        let mut queue = self.offline.lock().await;
        let (due, rest): (Vec<_>, Vec<_>) = queue
            .drain(..)
            .partition(|t| t.peer_name == peer_name);
        *queue = rest;
        due
    }

    /// 取出并移除所有已到触发时间的定时条目
    pub async fn take_due_scheduled(&self, now: DateTime<Utc>) -> Vec<ScheduledTransfer> {
        let mut queue = self.scheduled.lock().await;
        let (due, rest): (Vec<_>, Vec<_>) =
            queue.drain(..).partition(|t| t.schedule_time <= now);
        *queue = rest;
        due
    }

    pub async fn offline_len(&self) -> usize {
        self.offline.lock().await.len()
    }

    pub async fn scheduled_len(&self) -> usize {
        self.scheduled.lock().await.len()
    }
}

/// 重放的延期工作，交给守护进程的派发循环去调用发送引擎
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub peer_name: String,
    pub file_path: PathBuf,
}

/// 在场跟踪器
pub struct PresenceTracker {
    node_name: String,
    port: u16,
    registry: Arc<PeerRegistry>,
    queues: Arc<DeferredQueues>,
    events: EventBus,
    client: reqwest::Client,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
}

impl PresenceTracker {
    pub fn new(
        node_name: String,
        port: u16,
        registry: Arc<PeerRegistry>,
        queues: Arc<DeferredQueues>,
        events: EventBus,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> anyhow::Result<Self> {
        // 对端使用自签名证书，跳过验证
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(PROBE_TIMEOUT)
            .build()?;

        Ok(Self {
            node_name,
            port,
            registry,
            queues,
            events,
            client,
            dispatch_tx,
        })
    }

    /// 广播本节点：主机名作为实例名，TXT 携带当前令牌
    ///
    /// 返回的 daemon 须由调用方持有以维持广播和浏览。
    pub fn advertise(&self, token: &str) -> anyhow::Result<ServiceDaemon> {
        let daemon = ServiceDaemon::new()?;

        let mut txt = HashMap::new();
        txt.insert("token".to_string(), token.to_string());

        let host_name = format!("{}.local.", self.node_name);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.node_name,
            &host_name,
            "",
            self.port,
            txt,
        )?
        .enable_addr_auto();

        daemon.register(info)?;
        info!(
            "Advertising '{}' on {} port {}",
            self.node_name, SERVICE_TYPE, self.port
        );
        Ok(daemon)
    }

    /// 浏览循环：处理解析到的服务通告
    pub async fn run_browser(&self, daemon: &ServiceDaemon) -> anyhow::Result<()> {
        let receiver = daemon.browse(SERVICE_TYPE)?;

        while let Ok(event) = receiver.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                self.handle_resolved(&info).await;
            }
        }
        Ok(())
    }

    async fn handle_resolved(&self, info: &ServiceInfo) {
        let name = info
            .get_fullname()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() || name == self.node_name {
            return;
        }

        let Some(address) = info.get_addresses().iter().next() else {
            debug!("Announcement for '{}' carried no address", name);
            return;
        };
        let host = address.to_string();

        // 非内网地址：记录安全通知，绝不进入设备集合
        if !is_internal_host(&host) {
            warn!("External device detected: {}, ignoring", host);
            self.events.notify(
                "External device access is not allowed",
                NoticeLevel::Error,
            );
            return;
        }

        let token = info
            .get_property_val_str("token")
            .unwrap_or_default()
            .to_string();
        let port = info.get_port();

        let mut peer = Peer {
            name: name.clone(),
            host: host.clone(),
            port,
            token,
            status: PeerStatus::Unknown,
        };

        // 发现即探测一次
        let online = self.probe(&host, port).await;
        peer.status = if online {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        };

        info!("Device found: {} at {}:{} ({:?})", name, host, port, peer.status);
        self.registry.upsert(peer.clone()).await;
        self.events.emit(CoreEvent::DeviceFound(peer));

        if online {
            self.release_offline_for(&name).await;
        }
    }

    /// 周期循环：重探所有已知设备并扫描延期工作
    pub async fn run_probe_loop(&self) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        loop {
            interval.tick().await;
            self.scan_once().await;
        }
    }

    /// 单轮扫描（循环体拆出来便于测试）
    pub async fn scan_once(&self) {
        for peer in self.registry.snapshot().await {
            let online = self.probe(&peer.host, peer.port).await;
            let status = if online {
                PeerStatus::Online
            } else {
                PeerStatus::Offline
            };

            let previous = self.registry.set_status(&peer.name, status).await;
            self.events.emit(CoreEvent::DeviceStatusUpdate {
                name: peer.name.clone(),
                status,
            });

            // Online 转换是离线队列重放的唯一触发条件
            if online && previous != Some(PeerStatus::Online) {
                self.release_offline_for(&peer.name).await;
            }
        }

        self.release_due_scheduled().await;
    }

    /// TLS 可达性探测，超时按 Offline 处理
    async fn probe(&self, host: &str, port: u16) -> bool {
        if !is_internal_host(host) {
            return false;
        }
        let url = format!("https://{}:{}/ping", host, port);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn release_offline_for(&self, peer_name: &str) {
        for transfer in self.queues.take_offline_for(peer_name).await {
            info!(
                "Releasing offline transfer for '{}': {:?}",
                peer_name, transfer.file_path
            );
            let _ = self
                .dispatch_tx
                .send(DispatchRequest {
                    peer_name: transfer.peer_name,
                    file_path: transfer.file_path,
                })
                .await;
        }
    }

    async fn release_due_scheduled(&self) {
        for transfer in self.queues.take_due_scheduled(Utc::now()).await {
            info!(
                "Releasing scheduled transfer for '{}': {:?}",
                transfer.peer_name, transfer.file_path
            );
            let _ = self
                .dispatch_tx
                .send(DispatchRequest {
                    peer_name: transfer.peer_name,
                    file_path: transfer.file_path,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_host_ranges() {
        assert!(is_internal_host("192.168.0.10"));
        assert!(is_internal_host("10.0.0.1"));
        assert!(is_internal_host("172.16.0.1"));
        assert!(is_internal_host("172.31.255.254"));
        assert!(is_internal_host("localhost"));

        assert!(!is_internal_host("8.8.8.8"));
        assert!(!is_internal_host("172.32.0.1"));
        assert!(!is_internal_host("172.15.0.1"));
        assert!(!is_internal_host("191.168.0.1"));
        assert!(!is_internal_host("example.com"));
        assert!(!is_internal_host(""));
    }

    #[tokio::test]
    async fn test_registry_status_transition() {
        let registry = PeerRegistry::new();
        registry
            .upsert(Peer {
                name: "laptop".to_string(),
                host: "192.168.1.5".to_string(),
                port: 3000,
                token: "t".to_string(),
                status: PeerStatus::Unknown,
            })
            .await;

        let previous = registry.set_status("laptop", PeerStatus::Online).await;
        assert_eq!(previous, Some(PeerStatus::Unknown));
        assert_eq!(registry.status_of("laptop").await, PeerStatus::Online);

        // 未知设备
        assert_eq!(registry.set_status("ghost", PeerStatus::Online).await, None);
        assert_eq!(registry.status_of("ghost").await, PeerStatus::Unknown);
    }

    #[tokio::test]
    async fn test_offline_queue_released_exactly_once() {
        let queues = DeferredQueues::new();
        queues
            .queue_offline(DeferredTransfer {
                peer_name: "laptop".to_string(),
                file_path: PathBuf::from("/tmp/a.bin"),
            })
            .await;
        queues
            .queue_offline(DeferredTransfer {
                peer_name: "desktop".to_string(),
                file_path: PathBuf::from("/tmp/b.bin"),
            })
            .await;

        let released = queues.take_offline_for("laptop").await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].file_path, PathBuf::from("/tmp/a.bin"));

        // 第二次取空，不会重复派发
        assert!(queues.take_offline_for("laptop").await.is_empty());
        // 其他设备的条目不受影响
        assert_eq!(queues.offline_len().await, 1);
    }

    #[tokio::test]
    async fn test_scheduled_release_by_time() {
        let queues = DeferredQueues::new();
        let now = Utc::now();

        queues
            .queue_scheduled(ScheduledTransfer {
                schedule_time: now - chrono::Duration::seconds(5),
                peer_name: "laptop".to_string(),
                file_path: PathBuf::from("/tmp/due.bin"),
            })
            .await;
        queues
            .queue_scheduled(ScheduledTransfer {
                schedule_time: now + chrono::Duration::hours(1),
                peer_name: "laptop".to_string(),
                file_path: PathBuf::from("/tmp/later.bin"),
            })
            .await;

        let due = queues.take_due_scheduled(now).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].file_path, PathBuf::from("/tmp/due.bin"));
        assert_eq!(queues.scheduled_len().await, 1);

        // 未到期的条目留在队列里
        assert!(queues.take_due_scheduled(now).await.is_empty());
    }
}
