//! 传输摄入引擎（服务端角色）
//!
//! 在 TLS 端点上逐分块接受上传，按严格顺序校验，重组文件后交给
//! 后处理管线。校验一旦失败立即短路，每种失败都有独立的状态码和
//! 消息，并带上对端地址记录日志。
//!
//! 一次逻辑传输的所有分块共享一个稳定标识（由会话 ID、文件名和
//! 分块总数导出），摄入状态以该标识为键，互不干扰地并发进行。

use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};

use crate::auth::Authority;
use crate::config::{Settings, SettingsSnapshot, verify_user_header};
use crate::events::{CoreEvent, EventBus, NoticeLevel};
use crate::fileops;
use crate::transfer::protocol::{headers, is_valid_file_name, transfer_key};

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 3000;

/// 单个分块请求体的大小上限（最大分级 8 MiB 加余量）
const MAX_CHUNK_BODY: usize = 16 * 1024 * 1024;

/// 无活动的入站传输的存活上限
///
/// 发送端在约 30 秒内就会耗尽全部重试，之后不会再有分块到达。
pub const STALE_TRANSFER_TTL: Duration = Duration::from_secs(60);

/// 服务端持有的一次进行中的入站传输
///
/// 在第一个分块到达时创建，由摄入引擎独占，完成、显式拒绝或
/// 连接错误时销毁。
struct InboundTransfer {
    path: PathBuf,
    name: String,
    remote_addr: String,
    /// 缓冲的原始分块（尚未解密）
    chunks: Vec<Vec<u8>>,
    /// 单调递增，不会超过 `total_chunks`
    received_chunks: u32,
    total_chunks: u32,
    /// 发送端声明的原始文件大小，决定组装时是否解压
    declared_size: u64,
    encryption_key: String,
    expected_hash: String,
    /// 负载是否带 `x-encrypted-request` 标记
    encrypted: bool,
    /// 最近一个分块到达的时刻，清扫任务据此识别被遗弃的传输
    last_activity: Instant,
}

/// 摄入引擎的共享状态
pub struct IngestState {
    snapshot: Arc<RwLock<SettingsSnapshot>>,
    tokens: Arc<Authority>,
    sessions: Arc<Authority>,
    transfers: Mutex<HashMap<String, InboundTransfer>>,
    pending: Mutex<HashMap<String, InboundTransfer>>,
    events: EventBus,
}

/// 传输摄入服务器
pub struct IngestServer {
    state: Arc<IngestState>,
}

impl IngestServer {
    pub fn new(
        snapshot: Arc<RwLock<SettingsSnapshot>>,
        tokens: Arc<Authority>,
        sessions: Arc<Authority>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(IngestState {
                snapshot,
                tokens,
                sessions,
                transfers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/upload", post(handle_upload))
            .route("/ping", get(handle_ping))
            .layer(DefaultBodyLimit::max(MAX_CHUNK_BODY))
            .with_state(self.state.clone())
    }

    /// 在给定地址上以 TLS 方式服务
    ///
    /// 通过 `handle` 可以查询实际绑定的端口以及发起关停。
    pub async fn serve_tls(
        &self,
        addr: SocketAddr,
        cert_path: &Path,
        key_path: &Path,
        handle: axum_server::Handle,
    ) -> anyhow::Result<()> {
        let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
        info!("Ingest server (TLS) listening on {}", addr);
        axum_server::bind_rustls(addr, config)
            .handle(handle)
            .serve(
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
        Ok(())
    }

    /// 明文 HTTP 版本，用于测试
    pub async fn serve_plain(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Ingest server (plain) listening on {}",
            listener.local_addr()?
        );
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    /// 进行中的入站传输数量
    pub async fn inflight_count(&self) -> usize {
        self.state.transfers.lock().await.len()
    }

    /// 等待批准的传输数量
    pub async fn pending_count(&self) -> usize {
        self.state.pending.lock().await.len()
    }

    /// 批准一个挂起的传输，执行完整的解密/校验/落盘流程
    pub async fn accept_pending(&self, transfer_id: &str) -> anyhow::Result<PathBuf> {
        let record = self
            .state
            .pending
            .lock()
            .await
            .remove(transfer_id)
            .ok_or_else(|| anyhow::anyhow!("no pending transfer '{}'", transfer_id))?;

        let settings = self.state.snapshot.read().await.settings.clone();
        let events = self.state.events.clone();
        let result =
            tokio::task::spawn_blocking(move || finalize_transfer(record, &settings, &events))
                .await?;
        match result {
            Ok(path) => Ok(path),
            Err(err) => Err(anyhow::anyhow!("{}", err.1)),
        }
    }

    /// 移除超过 `ttl` 无活动的入站传输，返回移除数量
    pub async fn sweep_stale(&self, ttl: Duration) -> usize {
        let mut transfers = self.state.transfers.lock().await;
        let before = transfers.len();
        transfers.retain(|_, record| record.last_activity.elapsed() <= ttl);
        let removed = before - transfers.len();
        if removed > 0 {
            warn!("Dropped {} abandoned inbound transfer(s)", removed);
        }
        removed
    }

    /// 后台清扫循环：发送端中途消失的传输不会永久占用缓冲
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(crate::auth::SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sweep_stale(STALE_TRANSFER_TTL).await;
        }
    }

    /// 拒绝并丢弃一个挂起的传输
    pub async fn reject_pending(&self, transfer_id: &str) -> bool {
        let removed = self.state.pending.lock().await.remove(transfer_id);
        if let Some(record) = &removed {
            info!("Rejected pending transfer: {}", record.name);
        }
        removed.is_some()
    }
}

async fn handle_ping() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// 校验失败：记录日志、发通知、返回响应
fn reject(
    state: &IngestState,
    addr: SocketAddr,
    status: StatusCode,
    message: String,
) -> (StatusCode, String) {
    warn!("{} (from {})", message, addr);
    state.events.notify(message.clone(), NoticeLevel::Error);
    (status, message)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_upload(
    State(state): State<Arc<IngestState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let snapshot = state.snapshot.read().await;
    let settings = snapshot.settings.clone();

    // 1. 会话
    let session_id = header_str(&request_headers, headers::SESSION_ID).unwrap_or_default();
    if session_id.is_empty() || !state.sessions.is_valid(session_id).await {
        return reject(
            &state,
            addr,
            StatusCode::UNAUTHORIZED,
            "Invalid session".to_string(),
        );
    }

    // 2. 用户凭证
    match header_str(&request_headers, headers::USER_AUTH) {
        Some(user_auth) => {
            if let Err(message) = verify_user_header(&snapshot.users, user_auth) {
                return reject(&state, addr, StatusCode::UNAUTHORIZED, message.to_string());
            }
        }
        None => {
            return reject(
                &state,
                addr,
                StatusCode::UNAUTHORIZED,
                "Missing user authentication".to_string(),
            );
        }
    }
    drop(snapshot);

    // 3. 对端令牌
    let token = header_str(&request_headers, headers::AUTHORIZATION).unwrap_or_default();
    if token.is_empty() || !state.tokens.is_valid(token).await {
        return reject(
            &state,
            addr,
            StatusCode::UNAUTHORIZED,
            "Unauthorized".to_string(),
        );
    }

    // 4. 文件名
    let file_name = header_str(&request_headers, headers::FILE_NAME).unwrap_or_default();
    if !is_valid_file_name(file_name) {
        return reject(
            &state,
            addr,
            StatusCode::BAD_REQUEST,
            "Invalid file name".to_string(),
        );
    }

    // 5. 声明的文件大小
    let Some(file_size) =
        header_str(&request_headers, headers::FILE_SIZE).and_then(|v| v.parse::<u64>().ok())
    else {
        return reject(
            &state,
            addr,
            StatusCode::BAD_REQUEST,
            "Invalid file size".to_string(),
        );
    };
    if file_size > settings.max_file_size {
        return reject(
            &state,
            addr,
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "File size exceeds {}GB limit",
                settings.max_file_size / (1024 * 1024 * 1024)
            ),
        );
    }

    // 6. 分块元数据
    let chunk_index =
        header_str(&request_headers, headers::CHUNK_INDEX).and_then(|v| v.parse::<u32>().ok());
    let total_chunks =
        header_str(&request_headers, headers::TOTAL_CHUNKS).and_then(|v| v.parse::<u32>().ok());
    let (chunk_index, total_chunks) = match (chunk_index, total_chunks) {
        (Some(index), Some(total)) if total > 0 && index < total => (index, total),
        _ => {
            return reject(
                &state,
                addr,
                StatusCode::BAD_REQUEST,
                "Invalid chunk data".to_string(),
            );
        }
    };

    // 7. 加密元数据
    let Some(encryption_key) = header_str(&request_headers, headers::ENCRYPTION_KEY) else {
        return reject(
            &state,
            addr,
            StatusCode::BAD_REQUEST,
            "Missing encryption key".to_string(),
        );
    };
    let Some(file_hash) = header_str(&request_headers, headers::FILE_HASH) else {
        return reject(
            &state,
            addr,
            StatusCode::BAD_REQUEST,
            "Missing file hash".to_string(),
        );
    };

    // 8. 磁盘空间
    if fileops::disk_free(&settings.save_path) < fileops::MIN_FREE_SPACE {
        return reject(
            &state,
            addr,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Insufficient disk space".to_string(),
        );
    }

    let encrypted = header_str(&request_headers, headers::ENCRYPTED_REQUEST) == Some("true");
    let key = transfer_key(session_id, file_name, total_chunks);

    let completed = {
        let mut transfers = state.transfers.lock().await;

        // 新传输必须从第 0 块开始，不为乱序的首块建立记录
        if chunk_index != 0 && !transfers.contains_key(&key) {
            drop(transfers);
            return reject(
                &state,
                addr,
                StatusCode::BAD_REQUEST,
                "Invalid chunk data".to_string(),
            );
        }

        let record = transfers.entry(key.clone()).or_insert_with(|| {
            let stored_name = format!(
                "shared-{}-{}",
                chrono::Utc::now().timestamp_millis(),
                file_name
            );
            InboundTransfer {
                path: settings.save_path.join(stored_name),
                name: file_name.to_string(),
                remote_addr: addr.to_string(),
                chunks: Vec::with_capacity(total_chunks as usize),
                received_chunks: 0,
                total_chunks,
                declared_size: file_size,
                encryption_key: encryption_key.to_string(),
                expected_hash: file_hash.to_string(),
                encrypted,
                last_activity: Instant::now(),
            }
        });

        // 发送端失败后把整个序列从第 0 块重来：
        // 再次收到第 0 块即作废已缓冲的半成品，重新开始组装
        if chunk_index == 0 && record.received_chunks > 0 {
            info!(
                "Transfer restarted from chunk 0: {} (had {}/{})",
                record.name, record.received_chunks, record.total_chunks
            );
            record.chunks.clear();
            record.received_chunks = 0;
        }

        // 分块顺序发送，期望的下一块就是已收到的数量
        if chunk_index != record.received_chunks {
            drop(transfers);
            return reject(
                &state,
                addr,
                StatusCode::BAD_REQUEST,
                "Invalid chunk data".to_string(),
            );
        }

        record.chunks.push(body.to_vec());
        record.received_chunks += 1;
        record.last_activity = Instant::now();

        if record.received_chunks == record.total_chunks {
            transfers.remove(&key)
        } else {
            None
        }
    };

    let Some(record) = completed else {
        return (StatusCode::OK, "Chunk received".to_string());
    };

    // 最后一个分块：组装。解密/解压/哈希是 CPU 密集操作，移出异步工作线程
    if settings.auto_accept {
        let events = state.events.clone();
        let outcome =
            tokio::task::spawn_blocking(move || finalize_transfer(record, &settings, &events))
                .await;
        match outcome {
            Ok(Ok(_)) => (StatusCode::OK, "File received".to_string()),
            Ok(Err((status, message))) => reject(&state, addr, status, message),
            Err(e) => {
                error!("Finalize task failed: {}", e);
                reject(
                    &state,
                    addr,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server error".to_string(),
                )
            }
        }
    } else {
        let name = record.name.clone();
        state.pending.lock().await.insert(key.clone(), record);
        info!("File pending approval: {} from {}", name, addr);
        state.events.emit(CoreEvent::FilePending {
            transfer_id: key,
            name,
        });
        (StatusCode::OK, "File pending approval".to_string())
    }
}

/// 解密、解压、校验哈希并落盘；任何失败都丢弃整个传输，绝不持久化半成品
fn finalize_transfer(
    record: InboundTransfer,
    settings: &Settings,
    events: &EventBus,
) -> Result<PathBuf, (StatusCode, String)> {
    let server_error = |err: &dyn std::fmt::Display| {
        error!("Failed to finalize transfer: {}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server error".to_string(),
        )
    };

    // 分块拼回单一的 IV 前缀密文流，整体解密一次
    let payload: Vec<u8> = record.chunks.concat();
    let decrypted = if record.encrypted {
        fileops::decrypt_buffer(&payload, &record.encryption_key)
            .map_err(|e| server_error(&e))?
    } else {
        payload
    };
    // 压缩与否取决于原始大小，不是（可能远小于阈值的）压缩后大小
    let content = if record.declared_size >= fileops::COMPRESSION_THRESHOLD as u64 {
        fileops::decompress(&decrypted).map_err(|e| server_error(&e))?
    } else {
        decrypted
    };

    let received_hash = fileops::calculate_hash(&content);
    if received_hash != record.expected_hash {
        error!(
            "File hash mismatch: {} from {}",
            record.name, record.remote_addr
        );
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "File hash mismatch".to_string(),
        ));
    }

    std::fs::write(&record.path, &content).map_err(|e| server_error(&e))?;

    let organized = fileops::organize_file(&record.path, settings).map_err(|e| server_error(&e))?;
    let final_path = fileops::encrypt_at_rest(&organized, settings).map_err(|e| server_error(&e))?;

    info!(
        "File auto-received: {} from {}",
        record.name, record.remote_addr
    );
    events.emit(CoreEvent::FileReceived {
        name: record.name,
        path: final_path.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    });
    Ok(final_path)
}

/// 确保 TLS 证书存在，首次运行时生成自签名证书
pub async fn ensure_certificate(dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    if !cert_path.exists() || !key_path.exists() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&cert_path, certified.cert.pem()).await?;
        tokio::fs::write(&key_path, certified.key_pair.serialize_pem()).await?;
        info!("Generated self-signed certificate in {:?}", dir);
    }

    Ok((cert_path, key_path))
}
