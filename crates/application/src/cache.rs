//! 旁路缓存与防击穿锁（single-flight）
//!
//! 键空间约定：值存放在 `cache:{type}:{args...}`，计算锁存放在
//! `lock:{type}:{args...}`。锁通过 set-if-not-exists 抢占并带短 TTL，
//! 持有者崩溃后锁自行过期，保证活性。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::ApplicationError;

/// 缓存后端端口。Redis 实现位于基础设施层，内存实现用于测试。
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ApplicationError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ApplicationError>;

    /// set-if-not-exists，返回是否抢占成功。用于计算锁。
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, ApplicationError>;

    async fn del(&self, key: &str) -> Result<(), ApplicationError>;
}

/// `get_or_set` 的调节参数
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub lock_ttl: Duration,
    /// 锁被他人持有时的轮询次数上限，超过后直接执行 fetcher 兜底
    pub max_retries: u32,
    /// 每次轮询之间的固定等待
    pub retry_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            max_retries: 10,
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// 旁路缓存。对每个键保证同一时刻全局至多一个 fetcher 在执行
/// （锁 TTL 过期窗口内可能短暂重叠，这是活性兜底而不是线性化互斥）。
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    fn cache_key(kind: &str, args: &[&str]) -> String {
        format!("cache:{}:{}", kind, args.join(":"))
    }

    fn lock_key(kind: &str, args: &[&str]) -> String {
        format!("lock:{}:{}", kind, args.join(":"))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: &str,
        args: &[&str],
    ) -> Result<Option<T>, ApplicationError> {
        let raw = self.store.get(&Self::cache_key(kind, args)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        kind: &str,
        args: &[&str],
        value: &T,
        ttl: Duration,
    ) -> Result<(), ApplicationError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&Self::cache_key(kind, args), &raw, ttl).await
    }

    pub async fn del(&self, kind: &str, args: &[&str]) -> Result<(), ApplicationError> {
        self.store.del(&Self::cache_key(kind, args)).await
    }

    /// 防击穿读取：命中返回缓存值，未命中时恰好一个调用方执行 fetcher，
    /// 其余调用方轮询等待。轮询次数耗尽后直接执行 fetcher 保证前进性。
    pub async fn get_or_set<T, F, Fut>(
        &self,
        kind: &str,
        args: &[&str],
        fetcher: F,
        options: CacheOptions,
    ) -> Result<T, ApplicationError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApplicationError>>,
    {
        let cache_key = Self::cache_key(kind, args);
        let lock_key = Self::lock_key(kind, args);

        // 有界循环而不是递归，争用再激烈调用栈也不增长
        let mut attempts = 0u32;
        loop {
            if let Some(raw) = self.store.get(&cache_key).await? {
                return Ok(serde_json::from_str(&raw)?);
            }

            if self.store.set_nx(&lock_key, "1", options.lock_ttl).await? {
                // 本调用方是锁持有者；无论 fetcher 成败都必须释放锁
                let outcome = async {
                    let value = fetcher().await?;
                    let raw = serde_json::to_string(&value)?;
                    self.store.set(&cache_key, &raw, options.ttl).await?;
                    Ok(value)
                }
                .await;

                if let Err(err) = self.store.del(&lock_key).await {
                    warn!(key = %lock_key, error = %err, "释放缓存锁失败，等待 TTL 过期");
                }
                return outcome;
            }

            // 别的持有者正在计算，等一拍再查缓存
            tokio::time::sleep(options.retry_interval).await;
            if let Some(raw) = self.store.get(&cache_key).await? {
                return Ok(serde_json::from_str(&raw)?);
            }

            attempts += 1;
            if attempts > options.max_retries {
                // 兜底：绕过缓存直接取数，避免无界等待
                return fetcher().await;
            }
        }
    }
}

/// 内存缓存后端，按需惰性清理过期键。
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<std::time::Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => std::time::Instant::now() >= at,
            None => false,
        }
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ApplicationError> {
        let mut entries = self.entries.lock().expect("cache store poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ApplicationError> {
        let mut entries = self.entries.lock().expect("cache store poisoned");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(std::time::Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ApplicationError> {
        let mut entries = self.entries.lock().expect("cache store poisoned");
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired() {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(std::time::Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), ApplicationError> {
        let mut entries = self.entries.lock().expect("cache store poisoned");
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> CacheOptions {
        CacheOptions {
            ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_millis(200),
            max_retries: 20,
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn keys_follow_namespace_convention() {
        assert_eq!(
            Cache::cache_key("rooms", &["available"]),
            "cache:rooms:available"
        );
        assert_eq!(
            Cache::lock_key("user", &["a", "b"]),
            "lock:user:a:b"
        );
    }

    #[tokio::test]
    async fn get_or_set_populates_and_hits() {
        let cache = Cache::new(Arc::new(MemoryCacheStore::new()));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: u32 = cache
                .get_or_set(
                    "rooms",
                    &["available"],
                    move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(42u32)
                        }
                    },
                    fast_options(),
                )
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        // 第一次未命中后写入，后续全部命中
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_run_fetcher_exactly_once() {
        let cache = Cache::new(Arc::new(MemoryCacheStore::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "user",
                        &["hot-key"],
                        move || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                // 模拟慢查询，拉长竞争窗口
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok("value".to_string())
                            }
                        },
                        fast_options(),
                    )
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn crashed_holder_lock_expires() {
        let store = Arc::new(MemoryCacheStore::new());

        // 模拟崩溃的持有者：锁存在但永远不会被释放
        assert!(store
            .set_nx("lock:user:dead", "1", Duration::from_millis(50))
            .await
            .unwrap());
        assert!(!store
            .set_nx("lock:user:dead", "1", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store
            .set_nx("lock:user:dead", "1", Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_direct_fetch() {
        let store = Arc::new(MemoryCacheStore::new());
        // 长期被他人持有的锁
        store
            .set_nx("lock:rooms:stuck", "1", Duration::from_secs(60))
            .await
            .unwrap();

        let cache = Cache::new(store.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let value: u32 = cache
            .get_or_set(
                "rooms",
                &["stuck"],
                move || {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7u32)
                    }
                },
                CacheOptions {
                    max_retries: 2,
                    retry_interval: Duration::from_millis(5),
                    ..fast_options()
                },
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 兜底路径绕过缓存，不写值
        assert!(store.get("cache:rooms:stuck").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetcher_error_releases_lock() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = Cache::new(store.clone());

        let result: Result<u32, _> = cache
            .get_or_set(
                "rooms",
                &["boom"],
                || async { Err(ApplicationError::storage("db down")) },
                fast_options(),
            )
            .await;
        assert!(result.is_err());

        // 锁已释放，后续调用方能立即抢到
        assert!(store
            .set_nx("lock:rooms:boom", "1", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
