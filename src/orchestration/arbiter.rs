// Resource arbiter - exclusive and shared leases over the local accelerator
//
// GPU-heavy work takes the write side of a fair RwLock, GPU-light work the
// read side. Waiters are queued in arrival order. Only an exclusive holder
// changes the residency record. Blocking device work that may outlive its
// caller carries a `DeviceHold`, so the lock stays taken until the device
// is actually idle.

use super::error::ProviderError;
use super::types::ResourceClass;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

tokio::task_local! {
    static DEVICE_HOLD: DeviceHold;
}

/// Device residency control implemented by local adapters
#[async_trait]
pub trait ResidentModel: Send + Sync {
    /// Release the model's device memory
    async fn offload(&self) -> Result<(), ProviderError>;

    /// Bring the model back onto the device
    async fn restore(&self) -> Result<(), ProviderError>;

    /// Settle work left on the device by the previous call, keeping the weights
    async fn clear_transient(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("No lease granted within {waited:?}")]
    Exhausted { waited: Duration },
}

/// Acquire/release balance plus the current resident model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub acquired: u64,
    pub released: u64,
    pub resident: Option<String>,
}

impl ArbiterStats {
    pub fn in_flight(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Clone)]
enum Guard {
    Free,
    Shared(#[allow(dead_code)] Arc<OwnedRwLockReadGuard<()>>),
    Exclusive(#[allow(dead_code)] Arc<OwnedRwLockWriteGuard<()>>),
}

/// Keeps a lease's side of the lock taken while device work is running
///
/// Cloned out of a lease and moved into blocking work; the lock is given
/// back once the lease and every hold are dropped.
#[derive(Clone)]
pub struct DeviceHold {
    #[allow(dead_code)]
    guard: Guard,
}

impl DeviceHold {
    /// Hold of the lease driving the current provider call, if any
    pub fn current() -> Option<DeviceHold> {
        DEVICE_HOLD.try_with(|hold| hold.clone()).ok()
    }

    /// Run `future` with `hold` visible to `DeviceHold::current`
    pub async fn scope<F: Future>(hold: Option<DeviceHold>, future: F) -> F::Output {
        match hold {
            Some(hold) => DEVICE_HOLD.scope(hold, future).await,
            None => future.await,
        }
    }
}

/// Access to the accelerator for the duration of one provider call
pub struct ArbiterLease {
    class: ResourceClass,
    model_id: String,
    acquired_at: Instant,
    counters: Arc<Counters>,
    guard: Guard,
}

impl ArbiterLease {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Guard::Exclusive(_))
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Hold for device work started under this lease; None for remote leases
    pub fn hold(&self) -> Option<DeviceHold> {
        match self.guard {
            Guard::Free => None,
            _ => Some(DeviceHold {
                guard: self.guard.clone(),
            }),
        }
    }
}

impl Drop for ArbiterLease {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        if !matches!(self.guard, Guard::Free) {
            tracing::debug!(
                "Released {:?} lease for {} after {:?}",
                self.class,
                self.model_id,
                self.held_for()
            );
        }
    }
}

impl std::fmt::Debug for ArbiterLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterLease")
            .field("class", &self.class)
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Single point of access control for the local accelerator
pub struct ResourceArbiter {
    lock: Arc<RwLock<()>>,
    resident: Mutex<Option<String>>,
    hooks: HashMap<String, Arc<dyn ResidentModel>>,
    counters: Arc<Counters>,
    lease_timeout: Duration,
}

impl ResourceArbiter {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            resident: Mutex::new(None),
            hooks: HashMap::new(),
            counters: Arc::new(Counters::default()),
            lease_timeout,
        }
    }

    /// Register residency control for a heavy model
    pub fn with_resident(mut self, model_id: impl Into<String>, hook: Arc<dyn ResidentModel>) -> Self {
        self.hooks.insert(model_id.into(), hook);
        self
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Wait for a lease of the given class, bounded by the lease timeout
    ///
    /// For heavy leases the bound also covers the residency switch.
    pub async fn acquire(&self, class: ResourceClass, model_id: &str) -> Result<ArbiterLease, ArbiterError> {
        let started = Instant::now();
        let guard = match class {
            ResourceClass::None => Guard::Free,
            ResourceClass::GpuLight => {
                let guard = tokio::time::timeout(self.lease_timeout, self.lock.clone().read_owned())
                    .await
                    .map_err(|_| self.exhausted(class, model_id, started))?;
                Guard::Shared(Arc::new(guard))
            }
            ResourceClass::GpuHeavy => {
                let guard = tokio::time::timeout(self.lease_timeout, self.lock.clone().write_owned())
                    .await
                    .map_err(|_| self.exhausted(class, model_id, started))?;
                let guard = Guard::Exclusive(Arc::new(guard));

                let remaining = self.lease_timeout.saturating_sub(started.elapsed());
                let hold = DeviceHold { guard: guard.clone() };
                let switched =
                    tokio::time::timeout(remaining, DeviceHold::scope(Some(hold), self.make_resident(model_id))).await;
                if switched.is_err() {
                    tracing::warn!("Residency switch to {} did not finish in time", model_id);
                    return Err(self.exhausted(class, model_id, started));
                }
                guard
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        if !matches!(guard, Guard::Free) {
            tracing::debug!("Granted {:?} lease for {} after {:?}", class, model_id, started.elapsed());
        }

        Ok(ArbiterLease {
            class,
            model_id: model_id.to_string(),
            acquired_at: Instant::now(),
            counters: self.counters.clone(),
            guard,
        })
    }

    /// Give a lease back early; dropping it does the same
    pub fn release(&self, lease: ArbiterLease) {
        drop(lease);
    }

    /// Heavy model currently occupying the device
    pub fn resident(&self) -> Option<String> {
        self.resident.lock().map(|r| r.clone()).unwrap_or(None)
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            resident: self.resident(),
        }
    }

    fn exhausted(&self, class: ResourceClass, model_id: &str, started: Instant) -> ArbiterError {
        let waited = started.elapsed();
        tracing::warn!("Gave up waiting {:?} for a {:?} lease for {}", waited, class, model_id);
        ArbiterError::Exhausted { waited }
    }

    fn set_resident(&self, model_id: Option<&str>) {
        if let Ok(mut resident) = self.resident.lock() {
            *resident = model_id.map(str::to_string);
        }
    }

    // Runs with the exclusive guard held. The record is only advanced after a
    // hook returns, so a switch cut short is retried by the next heavy lease.
    async fn make_resident(&self, model_id: &str) {
        let current = self.resident();
        if current.as_deref() != Some(model_id) {
            if let Some(previous) = current {
                if let Some(hook) = self.hooks.get(&previous) {
                    tracing::info!("Offloading {} to make room for {}", previous, model_id);
                    if let Err(e) = hook.offload().await {
                        tracing::warn!("Failed to offload {}: {}", previous, e);
                    }
                }
                self.set_resident(None);
            }
            if let Some(hook) = self.hooks.get(model_id) {
                tracing::info!("Restoring {} onto the device", model_id);
                if let Err(e) = hook.restore().await {
                    tracing::warn!("Failed to restore {}: {}", model_id, e);
                }
            }
            self.set_resident(Some(model_id));
        }

        if let Some(hook) = self.hooks.get(model_id) {
            if let Err(e) = hook.clear_transient().await {
                tracing::warn!("Failed to settle the device for {}: {}", model_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Hook {
        name: &'static str,
        log: EventLog,
        fail_restore: bool,
    }

    #[async_trait]
    impl ResidentModel for Hook {
        async fn offload(&self) -> Result<(), ProviderError> {
            self.log.push(format!("offload:{}", self.name));
            Ok(())
        }

        async fn restore(&self) -> Result<(), ProviderError> {
            self.log.push(format!("restore:{}", self.name));
            if self.fail_restore {
                return Err(ProviderError::Local("no memory".into()));
            }
            Ok(())
        }

        async fn clear_transient(&self) -> Result<(), ProviderError> {
            self.log.push(format!("clear:{}", self.name));
            Ok(())
        }
    }

    fn hook(name: &'static str, log: &EventLog) -> Arc<dyn ResidentModel> {
        Arc::new(Hook {
            name,
            log: log.clone(),
            fail_restore: false,
        })
    }

    #[tokio::test]
    async fn test_remote_leases_never_wait() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(20));
        let _heavy = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();
        let free = arbiter.acquire(ResourceClass::None, "gpt4o-mini").await.unwrap();
        assert!(!free.is_exclusive());
    }

    #[tokio::test]
    async fn test_heavy_leases_are_exclusive() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(50));
        let lease = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();
        assert!(lease.is_exclusive());

        let err = arbiter
            .acquire(ResourceClass::GpuHeavy, "stable-diffusion")
            .await
            .unwrap_err();
        let ArbiterError::Exhausted { waited } = err;
        assert!(waited >= Duration::from_millis(50));

        arbiter.release(lease);
        assert!(arbiter.acquire(ResourceClass::GpuHeavy, "stable-diffusion").await.is_ok());
    }

    #[tokio::test]
    async fn test_light_leases_share_but_yield_to_heavy() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(30));
        let a = arbiter.acquire(ResourceClass::GpuLight, "local-tts").await.unwrap();
        let b = arbiter.acquire(ResourceClass::GpuLight, "local-whisper").await.unwrap();
        assert!(arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.is_err());
        drop((a, b));

        let heavy = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();
        assert!(arbiter.acquire(ResourceClass::GpuLight, "local-tts").await.is_err());
        drop(heavy);
        assert!(arbiter.acquire(ResourceClass::GpuLight, "local-tts").await.is_ok());
    }

    #[tokio::test]
    async fn test_switching_heavy_models_offloads_the_resident_one() {
        let log = EventLog::default();
        let arbiter = ResourceArbiter::new(Duration::from_secs(1))
            .with_resident("llama", hook("llama", &log))
            .with_resident("stable-diffusion", hook("sd", &log));

        drop(arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap());
        assert_eq!(arbiter.resident().as_deref(), Some("llama"));
        drop(arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap());
        drop(arbiter.acquire(ResourceClass::GpuHeavy, "stable-diffusion").await.unwrap());
        assert_eq!(arbiter.resident().as_deref(), Some("stable-diffusion"));

        assert_eq!(
            log.events(),
            vec![
                "restore:llama",
                "clear:llama",
                "clear:llama",
                "offload:llama",
                "restore:sd",
                "clear:sd",
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_fail_the_lease() {
        let log = EventLog::default();
        let failing: Arc<dyn ResidentModel> = Arc::new(Hook {
            name: "sd",
            log: log.clone(),
            fail_restore: true,
        });
        let arbiter = ResourceArbiter::new(Duration::from_secs(1)).with_resident("stable-diffusion", failing);
        assert!(arbiter.acquire(ResourceClass::GpuHeavy, "stable-diffusion").await.is_ok());
    }

    struct SlowHook {
        restore: Duration,
        offload: Duration,
    }

    #[async_trait]
    impl ResidentModel for SlowHook {
        async fn offload(&self) -> Result<(), ProviderError> {
            tokio::time::sleep(self.offload).await;
            Ok(())
        }

        async fn restore(&self) -> Result<(), ProviderError> {
            tokio::time::sleep(self.restore).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_restore_is_bounded_by_the_lease_timeout() {
        let slow: Arc<dyn ResidentModel> = Arc::new(SlowHook {
            restore: Duration::from_secs(2),
            offload: Duration::ZERO,
        });
        let arbiter = ResourceArbiter::new(Duration::from_millis(50)).with_resident("llama", slow);

        let started = Instant::now();
        let err = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, ArbiterError::Exhausted { .. }));

        assert_eq!(arbiter.resident(), None);
        assert_eq!(arbiter.stats().acquired, 0);
        assert!(arbiter.acquire(ResourceClass::GpuLight, "local-tts").await.is_ok());
    }

    #[tokio::test]
    async fn test_interrupted_offload_keeps_the_previous_resident() {
        let log = EventLog::default();
        let slow: Arc<dyn ResidentModel> = Arc::new(SlowHook {
            restore: Duration::ZERO,
            offload: Duration::from_secs(2),
        });
        let arbiter = ResourceArbiter::new(Duration::from_millis(50))
            .with_resident("llama", slow)
            .with_resident("stable-diffusion", hook("sd", &log));

        drop(arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap());
        assert!(arbiter.acquire(ResourceClass::GpuHeavy, "stable-diffusion").await.is_err());
        assert_eq!(arbiter.resident().as_deref(), Some("llama"));
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_device_hold_outlives_the_lease() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(30));
        let lease = arbiter.acquire(ResourceClass::GpuHeavy, "stable-diffusion").await.unwrap();

        let job = DeviceHold::scope(lease.hold(), async {
            let hold = DeviceHold::current();
            assert!(hold.is_some());
            tokio::task::spawn_blocking(move || {
                let _hold = hold;
                std::thread::sleep(Duration::from_millis(200));
            })
        })
        .await;
        arbiter.release(lease);
        assert_eq!(arbiter.stats().in_flight(), 0);

        assert!(arbiter.acquire(ResourceClass::GpuLight, "local-whisper").await.is_err());
        job.await.unwrap();
        assert!(arbiter.acquire(ResourceClass::GpuLight, "local-whisper").await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_leases_have_no_hold() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(10));
        let lease = arbiter.acquire(ResourceClass::None, "dall-e-3").await.unwrap();
        assert!(lease.hold().is_none());
        assert!(DeviceHold::current().is_none());
    }

    #[tokio::test]
    async fn test_counts_balance_after_drop_and_release() {
        let arbiter = ResourceArbiter::new(Duration::from_millis(10));
        let a = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();
        assert!(arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.is_err());
        assert_eq!(arbiter.stats().in_flight(), 1);
        arbiter.release(a);

        let b = arbiter.acquire(ResourceClass::GpuLight, "local-tts").await.unwrap();
        let c = arbiter.acquire(ResourceClass::None, "tts-1").await.unwrap();
        drop((b, c));

        let stats = arbiter.stats();
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_heavy_waiters_are_served_in_arrival_order() {
        let arbiter = Arc::new(ResourceArbiter::new(Duration::from_secs(5)));
        let order = EventLog::default();
        let first = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();

        let mut handles = Vec::new();
        for name in ["one", "two", "three"] {
            let arbiter = arbiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _lease = arbiter.acquire(ResourceClass::GpuHeavy, "llama").await.unwrap();
                order.push(name.to_string());
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(order.events(), vec!["one", "two", "three"]);
    }
}
