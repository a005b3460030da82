//! Brute-force protection for master-password entry.
//!
//! Every vault file path gets a [`SecurityRecord`] counting consecutive
//! failures. The whole map is JSON-serialized, encrypted under a host supplied
//! [`SystemKey`] and handed to a [`SecurityStore`] after every mutation, so a
//! lockout survives restarts without the user typing anything.
//!
//! A permanent lock cannot be lifted from inside the application. The only
//! way out is deleting the persisted store, whose location is surfaced in
//! [`StatusSnapshot::recovery_hint`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::CoreConfig;
use crate::crypto::EncryptionEngine;
use crate::error::{VaultError, VaultResult};

/// Delay in milliseconds indexed by the failure count right after it was
/// incremented.
pub const LOCKOUT_SCHEDULE_MS: [i64; 10] = [
    0, 0, 0, 5_000, 15_000, 30_000, 60_000, 300_000, 600_000, 1_800_000,
];
pub const PERMANENT_LOCK_THRESHOLD: u32 = 10;
/// Reported as the lockout duration once the lock has no expiry.
pub const NO_EXPIRY: i64 = -1;

pub fn lockout_duration_ms(failed_attempts: u32) -> i64 {
    if failed_attempts >= PERMANENT_LOCK_THRESHOLD {
        return NO_EXPIRY;
    }
    LOCKOUT_SCHEDULE_MS[failed_attempts as usize]
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LockoutState {
    Unlocked,
    SoftLocked,
    PermanentlyLocked,
}

impl LockoutState {
    pub fn from_failures(failed_attempts: u32) -> Self {
        match failed_attempts {
            0..=2 => LockoutState::Unlocked,
            n if n < PERMANENT_LOCK_THRESHOLD => LockoutState::SoftLocked,
            _ => LockoutState::PermanentlyLocked,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityRecord {
    pub failed_attempts: u32,
    pub last_failed_attempt: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub permanently_locked: bool,
    pub attempts: VecDeque<AttemptRecord>,
}

impl SecurityRecord {
    fn push_attempt(&mut self, attempt: AttemptRecord, limit: usize) {
        self.attempts.push_back(attempt);
        while self.attempts.len() > limit {
            self.attempts.pop_front();
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.permanently_locked || self.locked_until.is_some_and(|until| now < until)
    }

    fn remaining_ms_at(&self, now: DateTime<Utc>) -> u64 {
        if self.permanently_locked {
            return 0;
        }
        self.locked_until
            .map(|until| (until - now).num_milliseconds())
            .filter(|ms| *ms > 0)
            .map_or(0, |ms| ms as u64)
    }
}

/// What the UI needs to render the unlock prompt.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub failed_attempts: u32,
    pub is_locked: bool,
    pub is_permanently_locked: bool,
    /// Milliseconds, or [`NO_EXPIRY`] once permanently locked.
    pub lockout_duration: i64,
    pub remaining_attempts: u32,
    pub remaining_lockout_ms: u64,
    pub state: LockoutState,
    pub recovery_hint: Option<String>,
}

/// Byte-level persistence for the encrypted security store. Owned by the host.
pub trait SecurityStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<String>>;
    fn save(&self, blob: &str) -> anyhow::Result<()>;
    /// Where an operator can find the persisted store, if it has a location.
    fn location(&self) -> Option<String> {
        None
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default)]
pub struct MemorySecurityStore {
    blob: Mutex<Option<String>>,
}

impl MemorySecurityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<String> {
        self.blob.lock().clone()
    }
}

impl SecurityStore for MemorySecurityStore {
    fn load(&self) -> anyhow::Result<Option<String>> {
        Ok(self.blob.lock().clone())
    }

    fn save(&self, blob: &str) -> anyhow::Result<()> {
        *self.blob.lock() = Some(blob.to_string());
        Ok(())
    }
}

/// Opaque credential the security store is encrypted under. Never the
/// user's master password.
#[derive(Clone)]
pub struct SystemKey(Arc<Zeroizing<String>>);

impl SystemKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::new(Zeroizing::new(secret.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for SystemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SystemKey(<redacted>)")
    }
}

type SecurityMap = BTreeMap<String, SecurityRecord>;

/// Lockout coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LockoutService {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    engine: EncryptionEngine,
    system_key: SystemKey,
    history_limit: usize,
    records: Arc<Mutex<SecurityMap>>,
    // Held across mutate + persist so blobs reach the store in mutation order.
    writer: Arc<Mutex<()>>,
}

impl LockoutService {
    pub fn open(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        system_key: SystemKey,
        engine: EncryptionEngine,
        history_limit: usize,
    ) -> Self {
        let records = load_records(store.as_ref(), &engine, &system_key);
        debug!(paths = records.len(), "security store loaded");
        Self {
            store,
            clock,
            engine,
            system_key,
            history_limit: history_limit.max(1),
            records: Arc::new(Mutex::new(records)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        system_key: SystemKey,
        config: &CoreConfig,
    ) -> Self {
        Self::open(
            store,
            clock,
            system_key,
            EncryptionEngine::from_config(config),
            config.attempt_history_limit,
        )
    }

    pub fn record_failed_attempt(&self, file_path: &str) -> StatusSnapshot {
        let _writer = self.writer.lock();
        let now = self.clock.now();
        let (snapshot, serialized) = {
            let mut records = self.records.lock();
            let record = records.entry(file_path.to_string()).or_default();
            record.failed_attempts = record.failed_attempts.saturating_add(1);
            record.last_failed_attempt = Some(now);
            record.push_attempt(
                AttemptRecord {
                    timestamp: now,
                    success: false,
                },
                self.history_limit,
            );

            let duration = lockout_duration_ms(record.failed_attempts);
            if record.failed_attempts >= PERMANENT_LOCK_THRESHOLD {
                if !record.permanently_locked {
                    warn!(path = file_path, "vault permanently locked after repeated failures");
                }
                record.permanently_locked = true;
                record.locked_until = None;
            } else if duration > 0 {
                record.locked_until = Some(now + Duration::milliseconds(duration));
                info!(
                    path = file_path,
                    failed_attempts = record.failed_attempts,
                    lockout_ms = duration,
                    "vault temporarily locked"
                );
            } else {
                record.locked_until = None;
            }

            let snapshot = self.snapshot(record, now);
            (snapshot, serde_json::to_string(&*records))
        };
        self.persist(serialized);
        snapshot
    }

    pub fn record_successful_attempt(&self, file_path: &str) {
        let _writer = self.writer.lock();
        let now = self.clock.now();
        let serialized = {
            let mut records = self.records.lock();
            let record = records.entry(file_path.to_string()).or_default();
            if record.failed_attempts > 0 {
                debug!(path = file_path, previous = record.failed_attempts, "failure counter reset");
            }
            record.failed_attempts = 0;
            record.locked_until = None;
            record.permanently_locked = false;
            record.push_attempt(
                AttemptRecord {
                    timestamp: now,
                    success: true,
                },
                self.history_limit,
            );
            serde_json::to_string(&*records)
        };
        self.persist(serialized);
    }

    /// Pure read, safe to poll.
    pub fn security_status(&self, file_path: &str) -> StatusSnapshot {
        let now = self.clock.now();
        let records = self.records.lock();
        match records.get(file_path) {
            Some(record) => self.snapshot(record, now),
            None => self.snapshot(&SecurityRecord::default(), now),
        }
    }

    pub fn is_locked(&self, file_path: &str) -> bool {
        let now = self.clock.now();
        self.records
            .lock()
            .get(file_path)
            .is_some_and(|record| record.is_locked_at(now))
    }

    /// Gate for an unlock attempt: `Err(Locked)` while a delay or a
    /// permanent lock is active.
    pub fn ensure_unlocked(&self, file_path: &str) -> VaultResult<()> {
        let status = self.security_status(file_path);
        if status.is_locked {
            return Err(VaultError::Locked {
                remaining_ms: status.remaining_lockout_ms,
                permanent: status.is_permanently_locked,
            });
        }
        Ok(())
    }

    pub fn attempt_history(&self, file_path: &str) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .get(file_path)
            .map(|record| record.attempts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn store_location(&self) -> Option<String> {
        self.store.location()
    }

    pub async fn record_failed_attempt_async(&self, file_path: String) -> VaultResult<StatusSnapshot> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.record_failed_attempt(&file_path))
            .await
            .map_err(|e| VaultError::Encryption(format!("worker task failed: {e}")))
    }

    pub async fn record_successful_attempt_async(&self, file_path: String) -> VaultResult<()> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.record_successful_attempt(&file_path))
            .await
            .map_err(|e| VaultError::Encryption(format!("worker task failed: {e}")))
    }

    fn snapshot(&self, record: &SecurityRecord, now: DateTime<Utc>) -> StatusSnapshot {
        let permanent = record.permanently_locked;
        let recovery_hint = permanent.then(|| match self.store.location() {
            Some(location) => format!(
                "This vault is permanently locked. Delete the security store at {location} to reset it."
            ),
            None => "This vault is permanently locked. Delete the persisted security store to reset it."
                .to_string(),
        });
        StatusSnapshot {
            failed_attempts: record.failed_attempts,
            is_locked: record.is_locked_at(now),
            is_permanently_locked: permanent,
            lockout_duration: if permanent {
                NO_EXPIRY
            } else {
                lockout_duration_ms(record.failed_attempts)
            },
            remaining_attempts: PERMANENT_LOCK_THRESHOLD.saturating_sub(record.failed_attempts),
            remaining_lockout_ms: record.remaining_ms_at(now),
            state: if permanent {
                LockoutState::PermanentlyLocked
            } else {
                LockoutState::from_failures(record.failed_attempts)
            },
            recovery_hint,
        }
    }

    // Failures are logged, never returned: the in-memory count stays
    // authoritative for this process even if the write is lost.
    fn persist(&self, serialized: Result<String, serde_json::Error>) {
        let json = match serialized {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize security store: {e}");
                return;
            }
        };
        let wire = self
            .engine
            .encrypt(&json, self.system_key.expose())
            .and_then(|envelope| envelope.to_wire());
        match wire {
            Ok(wire) => {
                if let Err(e) = self.store.save(&wire) {
                    error!("failed to persist security store: {e:#}");
                }
            }
            Err(e) => error!("failed to encrypt security store: {e}"),
        }
    }
}

fn load_records(
    store: &dyn SecurityStore,
    engine: &EncryptionEngine,
    system_key: &SystemKey,
) -> SecurityMap {
    let blob = match store.load() {
        Ok(Some(blob)) => blob,
        Ok(None) => return SecurityMap::new(),
        Err(e) => {
            warn!("security store unreadable, starting empty: {e:#}");
            return SecurityMap::new();
        }
    };
    let decrypted = match engine.decrypt(&blob, system_key.expose()) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            warn!("security store could not be decrypted, starting empty: {e}");
            return SecurityMap::new();
        }
    };
    serde_json::from_str(&decrypted.plaintext).unwrap_or_else(|e| {
        warn!("security store is malformed, starting empty: {e}");
        SecurityMap::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: &str = "/home/user/passwords.vault";

    struct TestClock(Mutex<DateTime<Utc>>);

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance_ms(&self, ms: i64) {
            let mut now = self.0.lock();
            *now = *now + Duration::milliseconds(ms);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    struct LocatedStore(MemorySecurityStore);

    impl SecurityStore for LocatedStore {
        fn load(&self) -> anyhow::Result<Option<String>> {
            self.0.load()
        }

        fn save(&self, blob: &str) -> anyhow::Result<()> {
            self.0.save(blob)
        }

        fn location(&self) -> Option<String> {
            Some("/data/security.dat".to_string())
        }
    }

    struct BrokenStore;

    impl SecurityStore for BrokenStore {
        fn load(&self) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("disk on fire"))
        }

        fn save(&self, _blob: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    fn service_with(
        store: Arc<dyn SecurityStore>,
        clock: Arc<TestClock>,
        key: &str,
    ) -> LockoutService {
        LockoutService::open(
            store,
            clock,
            SystemKey::new(key),
            EncryptionEngine::with_iterations(10),
            50,
        )
    }

    fn fail_times(service: &LockoutService, path: &str, n: u32) -> StatusSnapshot {
        let mut last = service.security_status(path);
        for _ in 0..n {
            last = service.record_failed_attempt(path);
        }
        last
    }

    #[test]
    fn fresh_path_is_unlocked() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
        let status = service.security_status(VAULT);
        assert_eq!(status.failed_attempts, 0);
        assert_eq!(status.state, LockoutState::Unlocked);
        assert_eq!(status.remaining_attempts, 10);
        assert!(!status.is_locked);
        assert!(!service.is_locked(VAULT));
    }

    #[test]
    fn schedule_matches_table() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");

        let status = fail_times(&service, VAULT, 2);
        assert_eq!(status.lockout_duration, 0);
        assert!(!status.is_locked);

        let status = fail_times(&service, VAULT, 1);
        assert_eq!(status.failed_attempts, 3);
        assert_eq!(status.lockout_duration, 5_000);
        assert_eq!(status.state, LockoutState::SoftLocked);
        assert!(status.is_locked);
        assert_eq!(status.remaining_lockout_ms, 5_000);

        let status = fail_times(&service, VAULT, 4);
        assert_eq!(status.failed_attempts, 7);
        assert_eq!(status.lockout_duration, 300_000);
        assert_eq!(status.remaining_attempts, 3);

        let status = fail_times(&service, VAULT, 3);
        assert!(status.is_permanently_locked);
        assert_eq!(status.lockout_duration, NO_EXPIRY);
        assert_eq!(status.state, LockoutState::PermanentlyLocked);
        assert_eq!(status.remaining_attempts, 0);
        assert!(status.recovery_hint.is_some());
    }

    #[test]
    fn soft_lock_expires_with_time() {
        let clock = TestClock::new();
        let service = service_with(Arc::new(MemorySecurityStore::new()), clock.clone(), "k");
        fail_times(&service, VAULT, 4);
        assert!(service.is_locked(VAULT));

        clock.advance_ms(14_999);
        assert!(service.is_locked(VAULT));
        assert_eq!(service.security_status(VAULT).remaining_lockout_ms, 1);

        clock.advance_ms(1);
        assert!(!service.is_locked(VAULT));
        assert!(service.ensure_unlocked(VAULT).is_ok());
        // the count survives the delay
        assert_eq!(service.security_status(VAULT).failed_attempts, 4);
    }

    #[test]
    fn permanent_lock_does_not_expire() {
        let clock = TestClock::new();
        let service = service_with(Arc::new(MemorySecurityStore::new()), clock.clone(), "k");
        fail_times(&service, VAULT, 10);
        clock.advance_ms(365 * 24 * 3_600_000);
        assert!(service.is_locked(VAULT));
        match service.ensure_unlocked(VAULT) {
            Err(VaultError::Locked { permanent, .. }) => assert!(permanent),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_resets_from_any_count() {
        for failures in [1, 3, 9, 10, 12] {
            let service =
                service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
            fail_times(&service, VAULT, failures);
            service.record_successful_attempt(VAULT);

            let status = service.security_status(VAULT);
            assert_eq!(status.failed_attempts, 0, "after {failures} failures");
            assert!(!status.is_locked);
            assert!(!status.is_permanently_locked);
            assert_eq!(status.recovery_hint, None);
        }
    }

    #[test]
    fn paths_are_independent() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
        fail_times(&service, "/a.vault", 5);
        assert_eq!(service.security_status("/b.vault").failed_attempts, 0);
        assert!(!service.is_locked("/b.vault"));
    }

    #[test]
    fn status_reads_do_not_mutate() {
        let store = Arc::new(MemorySecurityStore::new());
        let service = service_with(store.clone(), TestClock::new(), "k");
        for _ in 0..5 {
            service.security_status(VAULT);
            service.is_locked(VAULT);
        }
        assert!(store.contents().is_none());
        assert!(service.attempt_history(VAULT).is_empty());
    }

    #[test]
    fn state_survives_restart() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = TestClock::new();
        let first = service_with(store.clone(), clock.clone(), "system-key");
        fail_times(&first, VAULT, 3);

        let blob = store.contents().unwrap();
        assert!(!blob.contains(VAULT), "store must be encrypted");

        let second = service_with(store, clock, "system-key");
        let status = second.security_status(VAULT);
        assert_eq!(status.failed_attempts, 3);
        assert!(status.is_locked);
    }

    #[test]
    fn changed_system_key_fails_soft() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = TestClock::new();
        fail_times(&service_with(store.clone(), clock.clone(), "old"), VAULT, 5);

        let service = service_with(store.clone(), clock.clone(), "new");
        assert_eq!(service.security_status(VAULT).failed_attempts, 0);

        store.save("definitely not an envelope").unwrap();
        let service = service_with(store, clock, "new");
        assert_eq!(service.security_status(VAULT).failed_attempts, 0);
    }

    #[test]
    fn persistence_failures_do_not_break_accounting() {
        let service = service_with(Arc::new(BrokenStore), TestClock::new(), "k");
        let status = fail_times(&service, VAULT, 3);
        assert_eq!(status.failed_attempts, 3);
        assert!(status.is_locked);
    }

    #[test]
    fn attempt_history_is_bounded() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
        fail_times(&service, VAULT, 55);
        service.record_successful_attempt(VAULT);
        let history = service.attempt_history(VAULT);
        assert_eq!(history.len(), 50);
        assert!(history.last().unwrap().success);
        assert!(!history.first().unwrap().success);
    }

    #[test]
    fn recovery_hint_names_store_location() {
        let store = Arc::new(LocatedStore(MemorySecurityStore::new()));
        let service = service_with(store, TestClock::new(), "k");
        assert_eq!(service.store_location().as_deref(), Some("/data/security.dat"));
        let status = fail_times(&service, VAULT, 10);
        assert!(status.recovery_hint.unwrap().contains("/data/security.dat"));
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let service = service.clone();
                scope.spawn(move || {
                    for _ in 0..2 {
                        service.record_failed_attempt(VAULT);
                    }
                });
            }
        });
        assert_eq!(service.security_status(VAULT).failed_attempts, 8);
    }

    #[tokio::test]
    async fn async_mutations_run_off_thread() {
        let service = service_with(Arc::new(MemorySecurityStore::new()), TestClock::new(), "k");
        let status = service
            .record_failed_attempt_async(VAULT.to_string())
            .await
            .unwrap();
        assert_eq!(status.failed_attempts, 1);
        service
            .record_successful_attempt_async(VAULT.to_string())
            .await
            .unwrap();
        assert_eq!(service.security_status(VAULT).failed_attempts, 0);
    }

    #[test]
    fn state_boundaries() {
        assert_eq!(LockoutState::from_failures(2), LockoutState::Unlocked);
        assert_eq!(LockoutState::from_failures(3), LockoutState::SoftLocked);
        assert_eq!(LockoutState::from_failures(9), LockoutState::SoftLocked);
        assert_eq!(LockoutState::from_failures(10), LockoutState::PermanentlyLocked);
        assert_eq!(lockout_duration_ms(9), 1_800_000);
        assert_eq!(lockout_duration_ms(42), NO_EXPIRY);
    }
}
