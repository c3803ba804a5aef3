//! 传输发送引擎（客户端角色）
//!
//! 发送管线：内容哈希 → 压缩（≥1 MiB）→ 新随机密钥加密 →
//! 按分级表+带宽上限切块 → 逐块顺序发送。
//!
//! 每个分块发送前检查取消令牌；任何非取消失败都会把整个分块序列
//! 从头重试（最多 3 次，固定间隔），重试耗尽后按设备当前状态分类为
//! 设备离线或传输失败。进度通过事件总线发布。

use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SettingsSnapshot;
use crate::discovery::{Peer, PeerRegistry, PeerStatus, is_internal_host};
use crate::events::{CoreEvent, EventBus, NoticeLevel, TransferProgress};
use crate::fileops;
use crate::transfer::protocol::{
    LinkSpeed, TransferError, effective_chunk_size, headers,
};

/// 单个分块请求的超时
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// 整个分块序列的最大重试次数
pub const MAX_RETRIES: u32 = 3;

/// 两次重试之间的固定间隔
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// 发送引擎配置；测试可缩短重试间隔和超时
#[derive(Debug, Clone)]
pub struct SendConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    /// 测得的链路速度档位，影响分块大小
    pub link_speed: LinkSpeed,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            request_timeout: CHUNK_TIMEOUT,
            link_speed: LinkSpeed::Unknown,
        }
    }
}

/// 一次进行中的出站传输
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub transfer_id: String,
    pub file_name: String,
    pub peer_name: String,
    pub total_chunks: u32,
    pub chunks_sent: u32,
    pub percentage: u8,
    /// MiB/s
    pub throughput: f64,
}

/// 发送的终态
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// 全部分块已确认
    Sent { total_chunks: u32 },
    /// 用户取消，未做任何重试
    Cancelled,
    /// 重试耗尽且在场跟踪当前标记该设备离线
    PeerOffline,
    /// 重试耗尽的其他失败
    Failed(String),
}

/// 传输发送引擎
pub struct SendEngine {
    client: reqwest::Client,
    registry: Arc<PeerRegistry>,
    events: EventBus,
    config: SendConfig,
    active: Mutex<HashMap<String, OutboundTransfer>>,
}

impl SendEngine {
    pub fn new(registry: Arc<PeerRegistry>, events: EventBus) -> anyhow::Result<Self> {
        Self::with_config(registry, events, SendConfig::default())
    }

    pub fn with_config(
        registry: Arc<PeerRegistry>,
        events: EventBus,
        config: SendConfig,
    ) -> anyhow::Result<Self> {
        // 对端使用自签名证书，跳过验证
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            registry,
            events,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// 当前进行中的出站传输数
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// 发送一个文件到指定设备
    ///
    /// 前置条件（凭证、内网地址、大小上限）不满足时立即失败，
    /// 不产生任何网络活动。通过后进入发送管线，终态以
    /// [`SendOutcome`] 返回，进度经事件总线发布。
    pub async fn send_file(
        &self,
        peer: &Peer,
        file_name: &str,
        content: &[u8],
        snapshot: &SettingsSnapshot,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransferError> {
        let settings = &snapshot.settings;

        // 前置检查：本机凭证
        if settings.auth_username.is_empty()
            || settings.auth_password.is_empty()
            || settings.session_id.is_empty()
        {
            return Err(TransferError::Authorization("missing local credentials"));
        }
        // 前置检查：内网地址
        if !is_internal_host(&peer.host) {
            self.events.notify(
                "External network access is not allowed",
                NoticeLevel::Error,
            );
            return Err(TransferError::Validation(
                "peer host is outside private ranges",
            ));
        }
        // 前置检查：大小上限
        if content.len() as u64 > settings.max_file_size {
            return Err(TransferError::Capacity(format!(
                "file size {} exceeds limit {}",
                content.len(),
                settings.max_file_size
            )));
        }

        // 管线：哈希 → 压缩 → 加密
        let file_hash = fileops::calculate_hash(content);
        let compressed = fileops::compress(content)
            .map_err(|e| TransferError::Network(e.to_string()))?;
        let encryption_key = fileops::generate_key();
        let payload = fileops::encrypt_buffer(&compressed, &encryption_key)
            .map_err(|e| TransferError::Network(e.to_string()))?;

        // 分块大小按原始文件大小分级，再套用各上限
        let chunk_size = effective_chunk_size(
            content.len() as u64,
            settings.bandwidth_limit,
            self.config.link_speed,
        ) as usize;
        let total_chunks = payload.len().div_ceil(chunk_size).max(1) as u32;

        let transfer_id = uuid::Uuid::new_v4().to_string();
        self.active.lock().await.insert(
            transfer_id.clone(),
            OutboundTransfer {
                transfer_id: transfer_id.clone(),
                file_name: file_name.to_string(),
                peer_name: peer.name.clone(),
                total_chunks,
                chunks_sent: 0,
                percentage: 0,
                throughput: 0.0,
            },
        );

        let request = ChunkRequest {
            peer,
            file_name,
            raw_size: content.len() as u64,
            file_hash: &file_hash,
            encryption_key: &encryption_key,
            username: &settings.auth_username,
            password: &settings.auth_password,
            session_id: &settings.session_id,
        };

        let mut attempt = 0;
        let outcome = loop {
            match self
                .send_chunks(&transfer_id, &request, &payload, chunk_size, total_chunks, &cancel)
                .await
            {
                Ok(()) => {
                    info!("File sent: {} -> {}", file_name, peer.name);
                    break SendOutcome::Sent { total_chunks };
                }
                // 取消永远优先于重试
                Err(TransferError::Cancelled) => break SendOutcome::Cancelled,
                Err(err) => {
                    if attempt < self.config.max_retries {
                        attempt += 1;
                        warn!(
                            "Send failed ({}), retrying {} (attempt {}/{})",
                            err, file_name, attempt, self.config.max_retries
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    } else {
                        break if self.registry.status_of(&peer.name).await
                            == PeerStatus::Offline
                        {
                            info!("Peer '{}' offline, giving up on {}", peer.name, file_name);
                            SendOutcome::PeerOffline
                        } else {
                            SendOutcome::Failed(err.to_string())
                        };
                    }
                }
            }
        };

        self.active.lock().await.remove(&transfer_id);
        Ok(outcome)
    }

    /// 顺序发送全部分块；任何失败都让整个序列从第 0 块重来
    async fn send_chunks(
        &self,
        transfer_id: &str,
        request: &ChunkRequest<'_>,
        payload: &[u8],
        chunk_size: usize,
        total_chunks: u32,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        use base64::{Engine as _, engine::general_purpose};

        let url = format!("https://{}:{}/upload", request.peer.host, request.peer.port);
        let user_auth = general_purpose::STANDARD
            .encode(format!("{}:{}", request.username, request.password));

        for index in 0..total_chunks {
            // 协作式取消，只在分块边界检查
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let start = (index as usize) * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            let chunk = &payload[start..end];

            let started_at = Instant::now();
            let response = self
                .client
                .post(&url)
                .header(headers::FILE_NAME, request.file_name)
                .header(headers::FILE_SIZE, request.raw_size.to_string())
                .header(headers::CHUNK_INDEX, index.to_string())
                .header(headers::TOTAL_CHUNKS, total_chunks.to_string())
                .header(headers::AUTHORIZATION, &request.peer.token)
                .header(headers::ENCRYPTION_KEY, request.encryption_key)
                .header(headers::USER_AUTH, &user_auth)
                .header(headers::SESSION_ID, request.session_id)
                .header(headers::FILE_HASH, request.file_hash)
                .header(headers::ENCRYPTED_REQUEST, "true")
                .body(chunk.to_vec())
                .send()
                .await
                .map_err(|e| TransferError::Network(e.to_string()))?;

            if !response.status().is_success() {
                return Err(TransferError::Network(format!(
                    "chunk {}/{} rejected with {}",
                    index + 1,
                    total_chunks,
                    response.status()
                )));
            }

            // 瞬时吞吐量 = 分块大小 / 往返耗时
            let elapsed = started_at.elapsed().as_secs_f64().max(f64::EPSILON);
            let throughput = (chunk.len() as f64 / 1024.0 / 1024.0) / elapsed;
            self.publish_progress(transfer_id, index + 1, total_chunks, throughput)
                .await;
        }

        Ok(())
    }

    async fn publish_progress(
        &self,
        transfer_id: &str,
        chunks_sent: u32,
        total_chunks: u32,
        throughput: f64,
    ) {
        let mut active = self.active.lock().await;
        let Some(entry) = active.get_mut(transfer_id) else {
            return;
        };
        entry.chunks_sent = chunks_sent;
        entry.percentage = ((chunks_sent * 100) / total_chunks) as u8;
        entry.throughput = throughput;

        let progress = TransferProgress {
            transfer_id: entry.transfer_id.clone(),
            file_name: entry.file_name.clone(),
            peer_name: entry.peer_name.clone(),
            chunks_sent,
            total_chunks,
            percentage: entry.percentage,
            throughput,
        };
        drop(active);

        self.events.emit(CoreEvent::TransferProgress(progress));
    }
}

/// 一次传输中对每个分块都相同的请求参数
struct ChunkRequest<'a> {
    peer: &'a Peer,
    file_name: &'a str,
    raw_size: u64,
    file_hash: &'a str,
    encryption_key: &'a str,
    username: &'a str,
    password: &'a str,
    session_id: &'a str,
}
