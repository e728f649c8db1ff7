use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, warn};

use crate::error::CacheError;

/// 快取後端需要提供的操作
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// 計數器加一；`ttl` 只在計數器新建時套用
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Redis 協定後端，第一次使用時才連線
pub struct RedisBackend {
    url: String,
    connection: OnceCell<ConnectionManager>,
}

impl RedisBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())?;
                let manager = ConnectionManager::new(client).await?;
                debug!(url = %self.url, "已連線到快取後端");
                Ok::<_, CacheError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_seconds(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        let value = redis::cmd("INCR").arg(key).query_async::<i64>(&mut conn).await?;
        if value == 1 {
            if let Some(ttl) = ttl {
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_seconds(ttl))
                    .query_async::<i64>(&mut conn)
                    .await?;
            }
        }
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let count = redis::cmd("EXISTS").arg(key).query_async::<i64>(&mut conn).await?;
        Ok(count > 0)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    /// 到期時間（epoch 毫秒）
    pub expires_at_ms: Option<u64>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|t| now_ms().saturating_add(t.as_millis() as u64)),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.map_or(false, |at| now >= at)
    }
}

/// 後端失效後使用的行程內儲存
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    /// 取得未過期的項目；已過期的先移除
    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &str,
    ) -> Option<&'a mut CacheEntry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now_ms())) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl CacheBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| CacheError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current.checked_add(1).ok_or_else(|| CacheError::Overflow {
                    key: key.to_string(),
                })?;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(key.to_string(), CacheEntry::new("1".to_string(), ttl));
                Ok(1)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key).is_some())
    }
}

enum CacheState {
    Live(Arc<dyn CacheBackend>),
    Fallback,
}

/// 啟動時建立並交給使用者的快取服務。
///
/// 一開始是 `Live`，後端第一次出錯就永久切換到 `Fallback`，
/// 之後所有操作都由記憶體處理，不會再回到 `Live`。
pub struct ResilientCache {
    state: RwLock<CacheState>,
    memory: MemoryStore,
}

impl ResilientCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            state: RwLock::new(CacheState::Live(backend)),
            memory: MemoryStore::default(),
        }
    }

    /// 連到 `url` 的 Redis 協定伺服器
    pub fn connect(url: &str) -> Self {
        Self::new(Arc::new(RedisBackend::new(url)))
    }

    /// 只使用記憶體的快取
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(CacheState::Fallback),
            memory: MemoryStore::default(),
        }
    }

    pub async fn is_fallback(&self) -> bool {
        matches!(*self.state.read().await, CacheState::Fallback)
    }

    async fn backend(&self) -> Option<Arc<dyn CacheBackend>> {
        match &*self.state.read().await {
            CacheState::Live(backend) => Some(backend.clone()),
            CacheState::Fallback => None,
        }
    }

    async fn trip(&self, op: &str, error: &CacheError) {
        let mut state = self.state.write().await;
        if matches!(*state, CacheState::Live(_)) {
            warn!(op, error = %error, "快取後端失敗，改用記憶體儲存");
            *state = CacheState::Fallback;
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(backend) = self.backend().await {
            match backend.get(key).await {
                Ok(value) => return Ok(value),
                Err(e) => self.trip("get", &e).await,
            }
        }
        self.memory.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        if let Some(backend) = self.backend().await {
            match backend.set(key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => self.trip("set", &e).await,
            }
        }
        self.memory.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if let Some(backend) = self.backend().await {
            match backend.delete(key).await {
                Ok(()) => return Ok(()),
                Err(e) => self.trip("delete", &e).await,
            }
        }
        self.memory.delete(key).await
    }

    pub async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, CacheError> {
        if let Some(backend) = self.backend().await {
            match backend.incr(key, ttl).await {
                Ok(value) => return Ok(value),
                Err(e) => self.trip("increment", &e).await,
            }
        }
        self.memory.incr(key, ttl).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        if let Some(backend) = self.backend().await {
            match backend.exists(key).await {
                Ok(found) => return Ok(found),
                Err(e) => self.trip("exists", &e).await,
            }
        }
        self.memory.exists(key).await
    }
}
