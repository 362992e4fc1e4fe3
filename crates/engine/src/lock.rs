//! Distributed lock manager.
//!
//! A lock is a meta entry whose presence marks ownership. Claiming rides
//! entirely on the backend's atomic check-and-set, so any number of
//! processes sharing one backend contend correctly without coordination
//! traffic between them. Each acquisition carries a fresh fencing token;
//! release deletes only the exact record this process wrote, so a lock
//! that was lost to lease expiry and re-acquired elsewhere cannot be
//! clobbered by the stale holder.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use uuid::Uuid;

use procstore_core::{keys, lock_id_for_name, KvBackend, LockId, LockRecord, StoreError};

/// Acquisition wait behavior.
///
/// Contenders poll with exponential backoff; there is no fairness queue,
/// so arrival order does not decide who wins a contended lock.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Default wait budget for [`LockManager::acquire`].
    pub max_wait: Duration,
    /// First delay between claim attempts.
    pub initial_poll: Duration,
    /// Multiplier applied to the poll delay after each miss.
    pub backoff: f64,
    /// Upper bound on the poll delay.
    pub max_poll: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            initial_poll: Duration::from_millis(100),
            backoff: 2.0,
            max_poll: Duration::from_secs(5),
        }
    }
}

/// Manages distributed locks over one backend.
pub struct LockManager {
    backend: Arc<dyn KvBackend>,
    settings: LockSettings,
    pid: u32,
    // Exact records this process wrote, keyed by lock id. Release fences
    // on the stored text, not on current backend state.
    held: DashMap<u64, String>,
}

impl LockManager {
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, settings: LockSettings) -> Self {
        Self {
            backend,
            settings,
            pid: std::process::id(),
            held: DashMap::new(),
        }
    }

    /// Register a lock name and return its id. Idempotent; the id is
    /// derived from the name, so every process computes the same one.
    pub async fn create_or_get_lock(&self, name: &str) -> Result<LockId, StoreError> {
        let lock = lock_id_for_name(name);
        // First registrant wins; later calls find the name already there.
        self.backend
            .meta_check_and_set(&keys::lock_name_key(lock), name, None)
            .await?;
        Ok(lock)
    }

    /// Acquire `lock`, waiting up to the configured default budget.
    ///
    /// `lease` bounds how long the lock survives if this process dies
    /// without releasing; `None` means only an explicit release frees it.
    ///
    /// # Errors
    ///
    /// [`StoreError::AcquisitionTimeout`] when the budget elapses first.
    pub async fn acquire(&self, lock: LockId, lease: Option<Duration>) -> Result<(), StoreError> {
        self.acquire_within(lock, lease, self.settings.max_wait)
            .await
    }

    /// Acquire `lock` with an explicit wait budget.
    pub async fn acquire_within(
        &self,
        lock: LockId,
        lease: Option<Duration>,
        max_wait: Duration,
    ) -> Result<(), StoreError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut poll = self.settings.initial_poll;
        loop {
            if self.try_acquire(lock, lease).await? {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(lock = %lock, waited = ?max_wait, "lock acquisition timed out");
                return Err(StoreError::AcquisitionTimeout(max_wait));
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
            poll = poll.mul_f64(self.settings.backoff).min(self.settings.max_poll);
        }
    }

    /// Single claim attempt, no waiting. Returns `true` on ownership.
    ///
    /// A present but lease-expired record is fenced out with a
    /// compare-and-delete before the claim retries, which recovers locks
    /// on backends that emulate expiry rather than enforce it natively.
    pub async fn try_acquire(
        &self,
        lock: LockId,
        lease: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let key = keys::lock_key(lock);
        let name = self
            .backend
            .meta_get(&keys::lock_name_key(lock))
            .await?
            .unwrap_or_default();
        let record = LockRecord {
            pid: self.pid,
            token: Uuid::new_v4().to_string(),
            name,
            expires_at: lease.map(|l| now_epoch().saturating_add(lease_secs(l))),
        };
        let doc = serde_json::to_string(&record)
            .map_err(|e| StoreError::Data(format!("lock record encoding failed: {e}")))?;

        if self.backend.meta_check_and_set(&key, &doc, lease).await? {
            self.held.insert(lock.value(), doc);
            return Ok(true);
        }

        if let Some(current) = self.backend.meta_get(&key).await? {
            let holder: LockRecord = serde_json::from_str(&current)
                .map_err(|e| StoreError::Data(format!("corrupt lock record for {lock}: {e}")))?;
            if holder.is_expired_at(now_epoch())
                && self.backend.meta_compare_and_delete(&key, &current).await?
                && self.backend.meta_check_and_set(&key, &doc, lease).await?
            {
                tracing::debug!(lock = %lock, stale_pid = holder.pid, "reclaimed expired lock");
                self.held.insert(lock.value(), doc);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Release a lock this process holds.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockNotHeld`] when this process never acquired the
    /// lock, or when its lease expired and another process took over.
    pub async fn release(&self, lock: LockId) -> Result<(), StoreError> {
        let doc = match self.held.get(&lock.value()) {
            Some(entry) => entry.value().clone(),
            None => return Err(StoreError::LockNotHeld(lock.to_string())),
        };
        let deleted = self
            .backend
            .meta_compare_and_delete(&keys::lock_key(lock), &doc)
            .await?;
        // The claim is forgotten only once the backend answered; a
        // transient failure above keeps it so a retried release can
        // still delete the record.
        self.held.remove(&lock.value());
        if deleted {
            Ok(())
        } else {
            Err(StoreError::LockNotHeld(lock.to_string()))
        }
    }

    /// Process id of the current owner of the lock named `name`, or zero
    /// when nobody holds it.
    pub async fn pid_for_lock(&self, name: &str) -> Result<u32, StoreError> {
        let lock = lock_id_for_name(name);
        match self.backend.meta_get(&keys::lock_key(lock)).await? {
            None => Ok(0),
            Some(raw) => {
                let record: LockRecord = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Data(format!("corrupt lock record for {lock}: {e}")))?;
                Ok(if record.is_expired_at(now_epoch()) {
                    0
                } else {
                    record.pid
                })
            }
        }
    }

    /// Delete a lock and its name registration, regardless of ownership.
    /// Returns `true` if the lock was held by someone at the time.
    pub async fn remove_lock(&self, lock: LockId) -> Result<bool, StoreError> {
        self.held.remove(&lock.value());
        let was_held = self.backend.meta_delete(&keys::lock_key(lock)).await?;
        self.backend.meta_delete(&keys::lock_name_key(lock)).await?;
        Ok(was_held)
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn lease_secs(lease: Duration) -> i64 {
    i64::try_from(lease.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use procstore_core::StoreId;
    use procstore_memory::MemoryBackend;

    /// Memory backend whose next compare-and-delete calls fail as if the
    /// node went away.
    struct FlakyDeletes {
        inner: MemoryBackend,
        failures: AtomicU32,
    }

    impl FlakyDeletes {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl KvBackend for FlakyDeletes {
        fn product_name(&self) -> &'static str {
            "flaky"
        }

        async fn put(&self, store: StoreId, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
            self.inner.put(store, key, value).await
        }

        async fn get(&self, store: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(store, key).await
        }

        async fn remove(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
            self.inner.remove(store, key).await
        }

        async fn has(&self, store: StoreId, key: &[u8]) -> Result<bool, StoreError> {
            self.inner.has(store, key).await
        }

        async fn clear(&self, store: StoreId) -> Result<(), StoreError> {
            self.inner.clear(store).await
        }

        async fn size(&self, store: StoreId) -> Result<u64, StoreError> {
            self.inner.size(store).await
        }

        async fn put_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StoreError> {
            self.inner.put_ttl(key, value, ttl).await
        }

        async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_ttl(key).await
        }

        async fn remove_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
            self.inner.remove_ttl(key).await
        }

        async fn has_ttl(&self, key: &[u8]) -> Result<bool, StoreError> {
            self.inner.has_ttl(key).await
        }

        async fn meta_check_and_set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, StoreError> {
            self.inner.meta_check_and_set(key, value, ttl).await
        }

        async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.meta_get(key).await
        }

        async fn meta_set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            self.inner.meta_set(key, value, ttl).await
        }

        async fn meta_delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.meta_delete(key).await
        }

        async fn meta_compare_and_delete(
            &self,
            key: &str,
            expected: &str,
        ) -> Result<bool, StoreError> {
            if self.failures.load(Ordering::Relaxed) > 0 {
                self.failures.fetch_sub(1, Ordering::Relaxed);
                return Err(StoreError::Connection("node went away".into()));
            }
            self.inner.meta_compare_and_delete(key, expected).await
        }

        async fn meta_increment(&self, key: &str) -> Result<u64, StoreError> {
            self.inner.meta_increment(key).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    fn manager(backend: &Arc<MemoryBackend>) -> LockManager {
        manager_with(
            backend,
            LockSettings {
                max_wait: Duration::from_millis(500),
                initial_poll: Duration::from_millis(50),
                ..LockSettings::default()
            },
        )
    }

    fn manager_with(backend: &Arc<MemoryBackend>, settings: LockSettings) -> LockManager {
        let shared: Arc<dyn KvBackend> = Arc::clone(backend) as Arc<dyn KvBackend>;
        LockManager::new(shared, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_and_release_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = manager(&backend);

        let lock = locks.create_or_get_lock("writer").await.unwrap();
        locks
            .acquire(lock, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(locks.pid_for_lock("writer").await.unwrap(), std::process::id());

        locks.release(lock).await.unwrap();
        assert_eq!(locks.pid_for_lock("writer").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn contender_times_out_on_a_held_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let holder = manager(&backend);
        let contender = manager(&backend);

        let lock = holder.create_or_get_lock("writer").await.unwrap();
        holder.acquire(lock, None).await.unwrap();

        let err = contender.acquire(lock, None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::AcquisitionTimeout(d) if d == Duration::from_millis(500)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_lets_a_contender_take_over() {
        let backend = Arc::new(MemoryBackend::new());
        let holder = manager(&backend);
        let contender = manager(&backend);

        let lock = holder.create_or_get_lock("writer").await.unwrap();
        holder
            .acquire(lock, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!contender
            .try_acquire(lock, Some(Duration::from_secs(5)))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(contender
            .try_acquire(lock, Some(Duration::from_secs(5)))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn short_wait_fails_then_succeeds_after_lease_runs_out() {
        let backend = Arc::new(MemoryBackend::new());
        let holder = manager(&backend);
        let contender = manager(&backend);

        let lock = holder.create_or_get_lock("writer").await.unwrap();
        holder
            .acquire(lock, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let err = contender
            .acquire_within(lock, None, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AcquisitionTimeout(_)));

        tokio::time::advance(Duration::from_millis(700)).await;
        contender
            .acquire_within(lock, None, Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_without_backend_ttl_is_reclaimed() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = manager(&backend);
        let lock = locks.create_or_get_lock("writer").await.unwrap();

        // A crashed holder on an emulated-TTL backend leaves a record with
        // a past deadline but no backend expiry.
        let stale = serde_json::to_string(&LockRecord {
            pid: 1,
            token: "stale".into(),
            name: "writer".into(),
            expires_at: Some(1),
        })
        .unwrap();
        backend
            .meta_set(&keys::lock_key(lock), &stale, None)
            .await
            .unwrap();

        assert!(locks.try_acquire(lock, None).await.unwrap());
        assert_eq!(locks.pid_for_lock("writer").await.unwrap(), std::process::id());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_release_after_takeover() {
        let backend = Arc::new(MemoryBackend::new());
        let holder = manager(&backend);
        let contender = manager(&backend);

        let lock = holder.create_or_get_lock("writer").await.unwrap();
        holder
            .acquire(lock, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(contender.try_acquire(lock, None).await.unwrap());

        assert!(matches!(
            holder.release(lock).await,
            Err(StoreError::LockNotHeld(_))
        ));
        // The new owner's claim survives the stale release attempt.
        assert_eq!(
            contender.pid_for_lock("writer").await.unwrap(),
            std::process::id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn release_can_be_retried_after_a_transient_failure() {
        let backend: Arc<dyn KvBackend> = Arc::new(FlakyDeletes::new(1));
        let locks = LockManager::new(backend, LockSettings::default());

        let lock = locks.create_or_get_lock("writer").await.unwrap();
        locks.acquire(lock, None).await.unwrap();

        let err = locks.release(lock).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));

        // The claim survived the failed attempt, so the retry finishes
        // the release instead of reporting the lock as not held.
        locks.release(lock).await.unwrap();
        assert_eq!(locks.pid_for_lock("writer").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_contender_succeeds_once_the_holder_releases() {
        let backend = Arc::new(MemoryBackend::new());
        let holder = manager(&backend);
        let contender = Arc::new(manager(&backend));

        let lock = holder.create_or_get_lock("writer").await.unwrap();
        holder.acquire(lock, None).await.unwrap();

        let waiter = {
            let contender = Arc::clone(&contender);
            tokio::spawn(async move {
                contender
                    .acquire_within(lock, None, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        holder.release(lock).await.unwrap();

        waiter.await.unwrap().unwrap();
        assert_eq!(
            contender.pid_for_lock("writer").await.unwrap(),
            std::process::id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_an_unheld_lock_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = manager(&backend);

        let lock = locks.create_or_get_lock("writer").await.unwrap();
        assert!(matches!(
            locks.release(lock).await,
            Err(StoreError::LockNotHeld(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_lock_deletes_record_and_registration() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = manager(&backend);

        let lock = locks.create_or_get_lock("writer").await.unwrap();
        locks.acquire(lock, None).await.unwrap();

        assert!(locks.remove_lock(lock).await.unwrap());
        assert_eq!(locks.pid_for_lock("writer").await.unwrap(), 0);
        assert!(backend
            .meta_get(&keys::lock_name_key(lock))
            .await
            .unwrap()
            .is_none());
    }
}
