//! 文件后处理管线
//!
//! 摄入端和发送端共用的纯工具函数：
//! - SHA-256 内容哈希
//! - zlib 压缩/解压（小于 1 MiB 的文件不压缩，避免小文件开销）
//! - AES-256-CTR 加密/解密（每次加密生成随机 IV 并前置到密文）
//! - 按日期/类别整理落盘文件、静态加密、磁盘空间检查

use aes::cipher::{KeyIvInit, StreamCipher};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::{PathPermissions, Settings};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// 压缩阈值：小于 1 MiB 的缓冲区不压缩
pub const COMPRESSION_THRESHOLD: usize = 1024 * 1024;

/// 目标卷最低剩余空间：1 MiB
pub const MIN_FREE_SPACE: u64 = 1024 * 1024;

/// AES IV 长度
const IV_LEN: usize = 16;

/// 计算缓冲区的 SHA-256 哈希（小写十六进制）
pub fn calculate_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// 生成一把新的随机对称密钥：32 字节的十六进制编码
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    encode_hex(&bytes)
}

/// zlib 压缩；低于阈值的缓冲区原样返回
pub fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    if data.len() < COMPRESSION_THRESHOLD {
        return Ok(data.to_vec());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// zlib 解压
///
/// 是否压缩由原始文件大小决定（压缩结果可能远小于阈值），
/// 因此透传判断归调用方，这里总是做 inflate。
pub fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// AES-256-CTR 加密，随机 IV 前置到密文
pub fn encrypt_buffer(data: &[u8], key_hex: &str) -> anyhow::Result<Vec<u8>> {
    let key = decode_key(key_hex)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = data.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buffer);

    let mut out = Vec::with_capacity(IV_LEN + buffer.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// AES-256-CTR 解密，从密文头部取出 IV
pub fn decrypt_buffer(data: &[u8], key_hex: &str) -> anyhow::Result<Vec<u8>> {
    if data.len() < IV_LEN {
        anyhow::bail!("ciphertext shorter than IV");
    }
    let key = decode_key(key_hex)?;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&data[..IV_LEN]);

    let mut buffer = data[IV_LEN..].to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buffer);
    Ok(buffer)
}

/// 按日期和扩展名类别整理文件，返回新路径
///
/// 未开启 `auto_organize` 时原样返回。移动后按 `path_permissions`
/// 应用权限策略。
pub fn organize_file(path: &Path, settings: &Settings) -> anyhow::Result<PathBuf> {
    if !settings.auto_organize {
        return Ok(path.to_path_buf());
    }

    let date_folder = chrono::Local::now().format("%Y-%m-%d").to_string();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let new_dir = settings
        .save_path
        .join(date_folder)
        .join(category_for_extension(&ext));

    fs::create_dir_all(&new_dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {:?}", path))?;
    let new_path = new_dir.join(file_name);
    fs::rename(path, &new_path)?;

    apply_permissions(&new_path, settings.path_permissions)?;

    debug!("Organized {:?} -> {:?}", path, new_path);
    Ok(new_path)
}

/// 扩展名到类别目录的映射，兜底为 "Others"
fn category_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" => "Images",
        "pdf" | "doc" | "docx" | "txt" | "md" | "odt" | "xls" | "xlsx" => "Documents",
        "mp4" | "mkv" | "avi" | "mov" | "webm" => "Videos",
        "mp3" | "flac" | "ogg" | "wav" => "Music",
        "zip" | "tar" | "gz" | "xz" | "7z" | "rar" => "Archives",
        _ => "Others",
    }
}

#[cfg(unix)]
fn apply_permissions(path: &Path, policy: PathPermissions) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = match policy {
        PathPermissions::ReadWrite => 0o666,
        PathPermissions::ReadOnly => 0o444,
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_permissions(path: &Path, policy: PathPermissions) -> anyhow::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(matches!(policy, PathPermissions::ReadOnly));
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// 静态加密：用一把不保留的新随机密钥重新加密文件，
/// 以混淆名写入并删除明文原件。未开启 `path_encryption` 时原样返回。
pub fn encrypt_at_rest(path: &Path, settings: &Settings) -> anyhow::Result<PathBuf> {
    if !settings.path_encryption {
        return Ok(path.to_path_buf());
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {:?}", path))?
        .to_string_lossy();
    let encrypted_path = settings.save_path.join(format!(
        "encrypted-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        file_name
    ));

    let data = fs::read(path)?;
    // 密钥用后即弃，解密是持钥方的职责
    let encrypted = encrypt_buffer(&data, &generate_key())?;
    fs::write(&encrypted_path, encrypted)?;
    fs::remove_file(path)?;

    debug!("Encrypted at rest: {:?} -> {:?}", path, encrypted_path);
    Ok(encrypted_path)
}

/// 目标路径所在卷的剩余字节数
#[cfg(unix)]
pub fn disk_free(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc == 0 {
        stat.f_bavail as u64 * stat.f_frsize as u64
    } else {
        0
    }
}

#[cfg(not(unix))]
pub fn disk_free(_path: &Path) -> u64 {
    u64::MAX
}

/// 十六进制编码
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// 十六进制解码 32 字节密钥
fn decode_key(key_hex: &str) -> anyhow::Result<[u8; 32]> {
    if key_hex.len() != 64 || !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("encryption key must be 64 hex chars");
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&key_hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = calculate_hash(b"hello");
        let b = calculate_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, calculate_hash(b"hello!"));
    }

    #[test]
    fn test_small_buffer_not_compressed() {
        let data = vec![0u8; 1024];
        let compressed = compress(&data).unwrap();
        assert_eq!(compressed, data);
    }

    #[test]
    fn test_compress_roundtrip_large() {
        // 2 MiB 的可压缩数据
        let data: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let data = b"some chunked payload".to_vec();

        let encrypted = encrypt_buffer(&data, &key).unwrap();
        assert_ne!(&encrypted[IV_LEN..], data.as_slice());
        assert_eq!(decrypt_buffer(&encrypted, &key).unwrap(), data);
    }

    #[test]
    fn test_encryption_uses_random_iv() {
        let key = generate_key();
        let a = encrypt_buffer(b"same input", &key).unwrap();
        let b = encrypt_buffer(b"same input", &key).unwrap();
        // IV 随机，两次加密结果不同
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_bad_key() {
        assert!(encrypt_buffer(b"data", "not-a-key").is_err());
        assert!(decrypt_buffer(&[0u8; 8], &generate_key()).is_err());
    }

    #[test]
    fn test_organize_file_by_date_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("photo.jpg");
        fs::write(&src, b"fake image").unwrap();

        let settings = Settings {
            auto_organize: true,
            save_path: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let new_path = organize_file(&src, &settings).unwrap();
        assert!(!src.exists());
        assert!(new_path.exists());

        let date_folder = chrono::Local::now().format("%Y-%m-%d").to_string();
        assert!(new_path.starts_with(dir.path().join(&date_folder).join("Images")));
    }

    #[test]
    fn test_organize_disabled_is_noop() {
        let settings = Settings::default();
        let path = Path::new("/tmp/whatever.bin");
        assert_eq!(organize_file(path, &settings).unwrap(), path);
    }

    #[test]
    fn test_unknown_extension_goes_to_others() {
        assert_eq!(category_for_extension("xyz"), "Others");
        assert_eq!(category_for_extension(""), "Others");
        assert_eq!(category_for_extension("pdf"), "Documents");
    }

    #[test]
    fn test_encrypt_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("secret.txt");
        fs::write(&src, b"plaintext contents").unwrap();

        let settings = Settings {
            path_encryption: true,
            save_path: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let new_path = encrypt_at_rest(&src, &settings).unwrap();
        assert!(!src.exists());
        assert!(new_path.exists());
        let stored = fs::read(&new_path).unwrap();
        assert_ne!(stored, b"plaintext contents");
        assert!(
            new_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("encrypted-")
        );
    }

    #[test]
    fn test_disk_free_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(disk_free(dir.path()) > MIN_FREE_SPACE);
    }
}
