//! 设置快照
//!
//! 核心只消费一份设置快照，不负责持久化的键值存储（那是外围壳层的职责）。
//! 提供 TOML 格式的读写，便于守护进程在启动时加载。

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// 默认最大文件大小：10 GiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// 落盘文件的权限策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PathPermissions {
    /// 可读写 (0o666)
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
    /// 只读 (0o444)
    #[serde(rename = "ro")]
    ReadOnly,
}

/// 传输相关设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 是否自动接受收到的文件
    pub auto_accept: bool,
    /// 最大文件大小（字节）
    pub max_file_size: u64,
    /// 带宽上限（KiB，0 表示不限制）
    pub bandwidth_limit: u64,
    /// 文件保存目录
    pub save_path: PathBuf,
    /// 是否按日期/类别自动整理
    pub auto_organize: bool,
    /// 是否对落盘文件做静态加密
    pub path_encryption: bool,
    /// 落盘文件权限策略
    pub path_permissions: PathPermissions,
    /// 本机出站认证用户名
    pub auth_username: String,
    /// 本机出站认证密码（明文，仅存在于快照中）
    pub auth_password: String,
    /// 预共享会话 ID（一次客户端运行的批次凭证）
    pub session_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_accept: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            bandwidth_limit: 0,
            save_path: std::env::temp_dir(),
            auto_organize: false,
            path_encryption: false,
            path_permissions: PathPermissions::default(),
            auth_username: "admin".to_string(),
            auth_password: "password123".to_string(),
            session_id: String::new(),
        }
    }
}

/// 离线队列条目：目标设备重新上线时重放
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTransfer {
    /// 目标设备名称
    pub peer_name: String,
    /// 待发送的文件路径
    pub file_path: PathBuf,
}

/// 定时传输条目：到达 `schedule_time` 后重放（不关心设备状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTransfer {
    /// 触发时间
    pub schedule_time: DateTime<Utc>,
    /// 目标设备名称
    pub peer_name: String,
    /// 待发送的文件路径
    pub file_path: PathBuf,
}

/// 核心消费的完整设置快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub settings: Settings,
    /// 用户名 -> SHA-256 十六进制密码哈希
    pub users: HashMap<String, String>,
    /// 离线队列
    pub offline_queue: Vec<DeferredTransfer>,
    /// 定时传输
    pub scheduled_transfers: Vec<ScheduledTransfer>,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), hash_password("password123"));
        Self {
            settings: Settings::default(),
            users,
            offline_queue: Vec::new(),
            scheduled_transfers: Vec::new(),
        }
    }
}

impl SettingsSnapshot {
    /// 获取配置文件路径
    fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("intrashare");
        config_dir.join("settings.toml")
    }

    /// 加载快照（文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(snapshot) => {
                        debug!("Loaded settings from {:?}", path);
                        return snapshot;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存快照
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// 计算密码的 SHA-256 十六进制哈希
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// 校验 `user-auth` 头（base64 编码的 `user:password`）
///
/// 返回 `Ok(username)`，失败时返回具体的拒绝原因字符串。
pub fn verify_user_header(
    users: &HashMap<String, String>,
    header: &str,
) -> Result<String, &'static str> {
    use base64::{Engine as _, engine::general_purpose};

    let decoded = general_purpose::STANDARD
        .decode(header)
        .map_err(|_| "Unauthorized user")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "Unauthorized user")?;

    let (username, password) = decoded.split_once(':').ok_or("Unauthorized user")?;

    match users.get(username) {
        Some(stored) if *stored == hash_password(password) => Ok(username.to_string()),
        _ => Err("Unauthorized user"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose};

    #[test]
    fn test_default_snapshot() {
        let snapshot = SettingsSnapshot::default();
        assert_eq!(snapshot.settings.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(!snapshot.settings.auto_accept);
        assert_eq!(
            snapshot.users.get("admin").unwrap(),
            &hash_password("password123")
        );
    }

    #[test]
    fn test_verify_user_header() {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), hash_password("secret"));

        let good = general_purpose::STANDARD.encode("admin:secret");
        assert_eq!(verify_user_header(&users, &good).unwrap(), "admin");

        let bad_password = general_purpose::STANDARD.encode("admin:wrong");
        assert!(verify_user_header(&users, &bad_password).is_err());

        let unknown_user = general_purpose::STANDARD.encode("nobody:secret");
        assert!(verify_user_header(&users, &unknown_user).is_err());

        assert!(verify_user_header(&users, "not-base64!!").is_err());
    }

    #[test]
    fn test_snapshot_toml_roundtrip() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.offline_queue.push(DeferredTransfer {
            peer_name: "laptop".to_string(),
            file_path: PathBuf::from("/tmp/report.pdf"),
        });

        let text = toml::to_string_pretty(&snapshot).unwrap();
        let parsed: SettingsSnapshot = toml::from_str(&text).unwrap();
        assert_eq!(parsed.offline_queue, snapshot.offline_queue);
        assert_eq!(
            parsed.settings.path_permissions,
            snapshot.settings.path_permissions
        );
    }
}
