//! 按内容寻址的二进制缓存
//!
//! 缓存目录下的文件以其 SHA-256 摘要命名。命中时流式复验摘要，
//! 未命中时下载到同目录临时文件、边下边算摘要，校验通过后
//! 原子改名入缓存，超出字节预算时按最近访问时间做 LRU 淘汰。
//! 同一缓存目录不支持跨进程并发使用。

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use executr_errors::{ExecutrError, ExecutrResult};

struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
}

pub struct BinaryCache {
    cache_dir: PathBuf,
    max_size_mb: u64,
    http: reqwest::Client,
    // 下载占绝对大头，整表互斥即可；摘要级并发没有收益
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl BinaryCache {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_mb: u64) -> ExecutrResult<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        let cache = Self {
            cache_dir,
            max_size_mb,
            http: reqwest::Client::new(),
            entries: Mutex::new(HashMap::new()),
        };

        match cache.load_entries() {
            Ok(entries) => {
                *cache.entries.try_lock().expect("fresh mutex") = entries;
            }
            Err(e) => warn!("加载缓存索引失败: {}", e),
        }

        Ok(cache)
    }

    /// 扫描缓存目录重建索引，文件名即摘要，mtime 作为最近访问时间
    fn load_entries(&self) -> ExecutrResult<HashMap<String, CacheEntry>> {
        let mut entries = HashMap::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            // 下载中断留下的临时文件不进索引
            if !is_hex_digest(&name) {
                continue;
            }
            entries.insert(
                name,
                CacheEntry {
                    path: entry.path(),
                    size: metadata.len(),
                    last_access: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }
        Ok(entries)
    }

    /// 取得摘要匹配的可执行文件路径，必要时下载
    pub async fn get_binary(&self, url: &str, expected_sha256: &str) -> ExecutrResult<PathBuf> {
        let expected = expected_sha256.to_lowercase();
        let mut entries = self.entries.lock().await;

        // 命中：复验摘要后返回
        if let Some(entry) = entries.get_mut(&expected) {
            match verify_sha256(&entry.path, &expected).await {
                Ok(()) => {
                    let now = SystemTime::now();
                    entry.last_access = now;
                    touch(&entry.path, now);
                    debug!("缓存命中: {}", expected);
                    return Ok(entry.path.clone());
                }
                Err(e) => {
                    warn!("缓存条目摘要复验失败，移除: {} ({})", expected, e);
                    let path = entry.path.clone();
                    entries.remove(&expected);
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("删除损坏的缓存文件失败: {} ({})", path.display(), e);
                    }
                }
            }
        }

        // 未命中：下载并校验
        info!("下载二进制: {} 摘要: {}", url, expected);
        let final_path = self.cache_dir.join(&expected);
        let size = self.download_verified(url, &expected, &final_path).await?;

        entries.insert(
            expected.clone(),
            CacheEntry {
                path: final_path.clone(),
                size,
                last_access: SystemTime::now(),
            },
        );

        self.evict_if_needed(&mut entries);

        info!("二进制已入缓存: {} ({} 字节)", expected, size);
        Ok(final_path)
    }

    /// 下载到临时文件并流式计算摘要；校验通过后置可执行位并原子改名
    async fn download_verified(
        &self,
        url: &str,
        expected: &str,
        final_path: &Path,
    ) -> ExecutrResult<u64> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ExecutrError::Download(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ExecutrError::Download(format!(
                "下载失败，HTTP 状态 {}",
                resp.status()
            )));
        }

        let mut temp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.cache_dir)?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ExecutrError::Download(e.to_string()))?;
            hasher.update(&chunk);
            temp.write_all(&chunk)?;
            size += chunk.len() as u64;
        }
        temp.flush()?;

        let actual = format!("{:x}", hasher.finalize());
        if actual != expected {
            // NamedTempFile 丢弃时自动删除
            return Err(ExecutrError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o755))?;
        }

        temp.persist(final_path)
            .map_err(|e| ExecutrError::Io(e.error))?;

        Ok(size)
    }

    /// 超出字节预算时按 last_access 从旧到新淘汰
    fn evict_if_needed(&self, entries: &mut HashMap<String, CacheEntry>) {
        let max_bytes = self.max_size_mb * 1024 * 1024;
        let mut total: u64 = entries.values().map(|e| e.size).sum();
        if total <= max_bytes {
            return;
        }

        info!(
            "缓存超出预算，执行 LRU 淘汰: 当前 {} 字节, 上限 {} 字节",
            total, max_bytes
        );

        let mut by_age: Vec<(String, SystemTime, u64, PathBuf)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access, e.size, e.path.clone()))
            .collect();
        by_age.sort_by_key(|(_, last_access, _, _)| *last_access);

        for (digest, _, size, path) in by_age {
            if total <= max_bytes {
                break;
            }
            debug!("淘汰缓存条目: {} ({} 字节)", digest, size);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("删除缓存文件失败: {} ({})", path.display(), e);
            }
            entries.remove(&digest);
            total -= size;
        }
    }

    /// 当前索引中的摘要集合（测试与诊断用）
    pub async fn cached_digests(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }
}

fn is_hex_digest(name: &str) -> bool {
    name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// 流式计算文件 SHA-256 并与期望值比对
async fn verify_sha256(path: &Path, expected: &str) -> ExecutrResult<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if actual != expected {
        return Err(ExecutrError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// 更新文件访问/修改时间，失败只记日志
fn touch(path: &Path, now: SystemTime) {
    let times = std::fs::FileTimes::new().set_accessed(now).set_modified(now);
    match std::fs::File::options().write(true).open(path) {
        Ok(file) => {
            if let Err(e) = file.set_times(times) {
                debug!("更新缓存文件时间失败: {} ({})", path.display(), e);
            }
        }
        Err(e) => debug!("打开缓存文件失败: {} ({})", path.display(), e),
    }
}
