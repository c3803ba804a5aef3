//! Core Service - 摄入/在场/派发的装配

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use intrashare_core::{
    Authority, CoreEvent, DEFAULT_PORT, DeferredQueues, DeferredTransfer, EventBus, IngestServer,
    NoticeLevel, PeerRegistry, PresenceTracker, SendEngine, SendOutcome, SettingsSnapshot,
    ensure_certificate,
};

/// 配置与证书目录
fn data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("intrashare")
}

pub async fn run_service() -> Result<()> {
    tracing::info!("核心服务初始化...");

    // 1. 设置快照；首次运行时补齐会话 ID 并回写
    let mut snapshot = SettingsSnapshot::load();
    let sessions = Arc::new(Authority::new());
    if snapshot.settings.session_id.is_empty() {
        snapshot.settings.session_id = sessions.issue().await;
        if let Err(e) = snapshot.save() {
            tracing::warn!("Failed to persist settings: {}", e);
        }
    } else {
        sessions.register(&snapshot.settings.session_id).await;
    }

    let events = EventBus::new();
    let tokens = Arc::new(Authority::new());
    tokio::spawn(tokens.clone().run_sweeper());
    tokio::spawn(sessions.clone().run_sweeper());

    // 2. TLS 摄入服务器
    let (cert, key) = ensure_certificate(&data_dir()).await?;
    let queues = Arc::new(DeferredQueues::from_snapshot(&snapshot));
    let snapshot = Arc::new(RwLock::new(snapshot));
    let server = Arc::new(IngestServer::new(
        snapshot.clone(),
        tokens.clone(),
        sessions,
        events.clone(),
    ));
    tokio::spawn(server.clone().run_sweeper());
    {
        let server = server.clone();
        let handle = axum_server::Handle::new();
        let addr: SocketAddr = ([0, 0, 0, 0], DEFAULT_PORT).into();
        tokio::spawn(async move {
            if let Err(e) = server.serve_tls(addr, &cert, &key, handle).await {
                tracing::error!("Ingest server exited: {}", e);
            }
        });
    }

    // 3. 在场跟踪：广播、浏览、周期探测
    let node_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "intrashare-node".to_string());
    let token = tokens.issue().await;
    let registry = Arc::new(PeerRegistry::new());
    let (dispatch_tx, mut dispatch_rx) = mpsc::channel(32);

    let tracker = Arc::new(PresenceTracker::new(
        node_name,
        DEFAULT_PORT,
        registry.clone(),
        queues.clone(),
        events.clone(),
        dispatch_tx,
    )?);
    let mdns = tracker.advertise(&token)?;
    {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            if let Err(e) = tracker.run_browser(&mdns).await {
                tracing::error!("mDNS browser exited: {}", e);
            }
        });
    }
    {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.run_probe_loop().await });
    }

    // 4. 派发循环：把重放的延期传输交给发送引擎
    let engine = Arc::new(SendEngine::new(registry.clone(), events.clone())?);
    {
        let registry = registry.clone();
        let snapshot = snapshot.clone();
        let queues = queues.clone();
        tokio::spawn(async move {
            while let Some(request) = dispatch_rx.recv().await {
                let Some(peer) = registry.get(&request.peer_name).await else {
                    tracing::warn!("Dispatch for unknown peer '{}'", request.peer_name);
                    continue;
                };
                let content = match tokio::fs::read(&request.file_path).await {
                    Ok(content) => content,
                    Err(e) => {
                        tracing::warn!("Cannot read {:?}: {}", request.file_path, e);
                        continue;
                    }
                };
                let file_name = request
                    .file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let current = snapshot.read().await.clone();
                match engine
                    .send_file(&peer, &file_name, &content, &current, CancellationToken::new())
                    .await
                {
                    // 派发时又掉线了：放回离线队列等下一次上线
                    Ok(SendOutcome::PeerOffline) => {
                        tracing::info!("Peer '{}' went offline, re-queueing", peer.name);
                        queues
                            .queue_offline(DeferredTransfer {
                                peer_name: request.peer_name,
                                file_path: request.file_path,
                            })
                            .await;
                    }
                    Ok(outcome) => {
                        tracing::info!("Deferred transfer of {:?} ended: {:?}", file_name, outcome);
                    }
                    Err(e) => {
                        tracing::warn!("Deferred transfer of {:?} failed: {}", file_name, e);
                    }
                }
            }
        });
    }

    tracing::info!("服务就绪，监听核心事件...");

    // 5. 事件循环：核心事件落到日志
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(CoreEvent::FileReceived { name, path, timestamp }) => {
                tracing::info!("Received '{}' at {:?} ({})", name, path, timestamp);
            }
            Ok(CoreEvent::FilePending { transfer_id, name }) => {
                tracing::info!("'{}' awaiting approval (id {})", name, transfer_id);
            }
            Ok(CoreEvent::DeviceFound(peer)) => {
                tracing::info!("Device '{}' at {}:{}", peer.name, peer.host, peer.port);
            }
            Ok(CoreEvent::DeviceStatusUpdate { name, status }) => {
                tracing::debug!("Device '{}' is now {:?}", name, status);
            }
            Ok(CoreEvent::Notification { message, level }) => match level {
                NoticeLevel::Error => tracing::error!("{}", message),
                NoticeLevel::Warn => tracing::warn!("{}", message),
                _ => tracing::info!("{}", message),
            },
            Ok(CoreEvent::TransferProgress(progress)) => {
                tracing::debug!(
                    "{}: {}/{} chunks ({}%)",
                    progress.file_name,
                    progress.chunks_sent,
                    progress.total_chunks,
                    progress.percentage
                );
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, skipped {} events", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    Ok(())
}
