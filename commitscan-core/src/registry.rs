//! Analysis instance pool: capacity accounting and instance selection.
//!
//! Each configured instance carries its own in-flight counter. `acquire`
//! hands out an [`InstanceToken`] for the least-loaded healthy instance; ties
//! rotate round-robin starting after the last pick. Dropping the token gives
//! the slot back.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::InstanceConfig,
    error::{OrchestratorError, Result},
};

/// Upper bound between selection retries while waiting, so cool-downs that
/// lapse without a release are still noticed.
const WAIT_RECHECK: Duration = Duration::from_millis(250);

/// Resolved credential for an analysis instance.
#[derive(Clone)]
pub struct InstanceCredential(String);

impl InstanceCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstanceCredential(<redacted>)")
    }
}

/// One external analysis backend.
#[derive(Clone, Debug)]
pub struct AnalysisInstance {
    pub id: String,
    pub base_url: Url,
    pub credential: InstanceCredential,
    pub capacity: usize,
}

impl AnalysisInstance {
    /// Resolve the credential of an enabled instance. Disabled instances are
    /// never selected, so their token is not looked up.
    pub fn from_config(config: &InstanceConfig) -> Result<Self> {
        let token = match (&config.token, &config.token_env) {
            _ if !config.enabled => String::new(),
            (Some(token), _) if !token.is_empty() => token.clone(),
            (_, Some(var)) => std::env::var(var).map_err(|_| {
                OrchestratorError::Configuration(format!(
                    "instance '{}' expects its token in ${var}",
                    config.id
                ))
            })?,
            _ => {
                return Err(OrchestratorError::Configuration(format!(
                    "instance '{}' has neither token nor token_env",
                    config.id
                )));
            }
        };

        Ok(Self {
            id: config.id.clone(),
            base_url: config.base_url.clone(),
            credential: InstanceCredential::new(token),
            capacity: config.capacity,
        })
    }
}

/// Point-in-time view of an instance for stats endpoints.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub base_url: String,
    pub capacity: usize,
    pub in_flight: usize,
    pub healthy: bool,
}

#[derive(Debug)]
struct Slot {
    instance: Arc<AnalysisInstance>,
    enabled: bool,
    in_flight: usize,
    unhealthy_until: Option<Instant>,
}

impl Slot {
    fn healthy(&self, now: Instant) -> bool {
        self.enabled
            && self.instance.capacity > 0
            && self.unhealthy_until.is_none_or(|until| until <= now)
    }

    fn has_room(&self) -> bool {
        self.in_flight < self.instance.capacity
    }
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Index the next tie-break scan starts from.
    cursor: usize,
}

impl PoolState {
    fn select(&mut self, now: Instant) -> Option<usize> {
        let n = self.slots.len();
        let mut best: Option<(usize, usize)> = None;
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let slot = &self.slots[idx];
            if !slot.healthy(now) || !slot.has_room() {
                continue;
            }
            if best.is_none_or(|(_, load)| slot.in_flight < load) {
                best = Some((idx, slot.in_flight));
            }
        }

        let (idx, _) = best?;
        self.cursor = (idx + 1) % n;
        self.slots[idx].in_flight += 1;
        Some(idx)
    }

    fn any_selectable(&self, now: Instant) -> bool {
        self.slots.iter().any(|slot| slot.healthy(now))
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolInner {
    fn release(&self, index: usize) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(index) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }
}

/// Shared registry of analysis instances.
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InstancePool");
        match self.inner.state.try_lock() {
            Some(state) => {
                debug
                    .field("instances", &state.slots.len())
                    .field("cursor", &state.cursor);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InstancePool {
    pub fn new(instances: Vec<AnalysisInstance>) -> Self {
        let slots = instances
            .into_iter()
            .map(|instance| Slot {
                instance: Arc::new(instance),
                enabled: true,
                in_flight: 0,
                unhealthy_until: None,
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState { slots, cursor: 0 }),
                released: Notify::new(),
            }),
        }
    }

    /// Build from config, resolving credentials. Disabled instances are kept
    /// (they show up in stats) but never selected.
    pub fn from_config(configs: &[InstanceConfig]) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        let mut instances = Vec::with_capacity(configs.len());
        let mut disabled = Vec::new();
        for config in configs {
            if !seen.insert(config.id.as_str()) {
                return Err(OrchestratorError::Configuration(format!(
                    "duplicate instance id '{}'",
                    config.id
                )));
            }
            if !config.enabled {
                disabled.push(config.id.clone());
            }
            instances.push(AnalysisInstance::from_config(config)?);
        }

        let pool = Self::new(instances);
        {
            let mut state = pool.inner.state.lock();
            for slot in state.slots.iter_mut() {
                slot.enabled = !disabled.contains(&slot.instance.id);
            }
        }
        Ok(pool)
    }

    /// Non-blocking selection. `None` when every healthy instance is full or
    /// nothing is selectable.
    pub fn try_acquire(&self) -> Option<InstanceToken> {
        let mut state = self.inner.state.lock();
        let index = state.select(Instant::now())?;
        let instance = Arc::clone(&state.slots[index].instance);
        debug!(
            instance = %instance.id,
            in_flight = state.slots[index].in_flight,
            "instance acquired"
        );
        Some(InstanceToken {
            pool: Arc::clone(&self.inner),
            instance,
            index,
        })
    }

    /// Wait up to `wait` for a slot.
    ///
    /// Fails immediately when no instance is selectable at all (all disabled,
    /// cooling down or zero capacity), and with the same error once `wait`
    /// elapses while every healthy instance stays full.
    pub async fn acquire(&self, wait: Duration) -> Result<InstanceToken> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let released = self.inner.released.notified();
            if let Some(token) = self.try_acquire() {
                return Ok(token);
            }
            if !self.inner.state.lock().any_selectable(Instant::now()) {
                return Err(OrchestratorError::InstanceUnavailable(
                    "no healthy analysis instance".into(),
                ));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::InstanceUnavailable(
                    "all analysis instances are at capacity".into(),
                ));
            }
            let recheck = (now + WAIT_RECHECK).min(deadline);
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep_until(recheck) => {}
            }
        }
    }

    /// Return a slot. Equivalent to dropping the token.
    pub fn release(&self, token: InstanceToken) {
        drop(token);
    }

    /// Take an instance out of selection for `cooldown`.
    pub fn mark_unhealthy(&self, instance_id: &str, cooldown: Duration) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|slot| slot.instance.id == instance_id)
        {
            warn!(
                instance = instance_id,
                cooldown_secs = cooldown.as_secs_f32(),
                "marking analysis instance unhealthy"
            );
            slot.unhealthy_until = Some(Instant::now() + cooldown);
        }
    }

    pub fn mark_healthy(&self, instance_id: &str) {
        {
            let mut state = self.inner.state.lock();
            if let Some(slot) = state
                .slots
                .iter_mut()
                .find(|slot| slot.instance.id == instance_id)
            {
                slot.unhealthy_until = None;
            }
        }
        self.inner.released.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let state = self.inner.state.lock();
        let now = Instant::now();
        state
            .slots
            .iter()
            .map(|slot| InstanceSnapshot {
                id: slot.instance.id.clone(),
                base_url: slot.instance.base_url.to_string(),
                capacity: slot.instance.capacity,
                in_flight: slot.in_flight,
                healthy: slot.healthy(now),
            })
            .collect()
    }

    /// Sum of capacities over enabled instances.
    pub fn max_concurrency(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| slot.instance.capacity)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().slots.is_empty()
    }
}

/// Proof of one in-flight slot on an instance.
pub struct InstanceToken {
    pool: Arc<PoolInner>,
    instance: Arc<AnalysisInstance>,
    index: usize,
}

impl InstanceToken {
    pub fn instance(&self) -> &Arc<AnalysisInstance> {
        &self.instance
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }
}

impl fmt::Debug for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceToken")
            .field("instance", &self.instance.id)
            .finish()
    }
}

impl Drop for InstanceToken {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, capacity: usize) -> AnalysisInstance {
        AnalysisInstance {
            id: id.into(),
            base_url: Url::parse(&format!("http://{id}:9000")).unwrap(),
            credential: InstanceCredential::new("t"),
            capacity,
        }
    }

    fn load_of(pool: &InstancePool, id: &str) -> usize {
        pool.snapshot()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap()
            .in_flight
    }

    #[test]
    fn picks_least_loaded_then_rotates_ties() {
        let pool = InstancePool::new(vec![
            instance("a", 2),
            instance("b", 2),
            instance("c", 2),
        ]);

        let first = pool.try_acquire().unwrap();
        let second = pool.try_acquire().unwrap();
        let third = pool.try_acquire().unwrap();
        assert_eq!(
            [first.id(), second.id(), third.id()],
            ["a", "b", "c"]
        );

        drop(second);
        let next = pool.try_acquire().unwrap();
        assert_eq!(next.id(), "b", "b is the only instance with load 0");
    }

    #[test]
    fn never_selects_zero_capacity_or_unhealthy() {
        let pool =
            InstancePool::new(vec![instance("zero", 0), instance("ok", 1)]);
        pool.mark_unhealthy("ok", Duration::from_secs(60));
        assert!(pool.try_acquire().is_none());

        pool.mark_healthy("ok");
        let token = pool.try_acquire().unwrap();
        assert_eq!(token.id(), "ok");
        assert!(pool.try_acquire().is_none(), "ok is at capacity");
    }

    #[test]
    fn release_decrements_load() {
        let pool = InstancePool::new(vec![instance("a", 3)]);
        let t1 = pool.try_acquire().unwrap();
        let _t2 = pool.try_acquire().unwrap();
        assert_eq!(load_of(&pool, "a"), 2);
        pool.release(t1);
        assert_eq!(load_of(&pool, "a"), 1);
    }

    #[tokio::test]
    async fn sole_unhealthy_instance_signals_unavailable() {
        let pool = InstancePool::new(vec![instance("only", 4)]);
        pool.mark_unhealthy("only", Duration::from_secs(60));

        let started = std::time::Instant::now();
        let err = pool.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InstanceUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn full_pool_times_out_with_backpressure() {
        let pool = InstancePool::new(vec![instance("a", 1)]);
        let _held = pool.try_acquire().unwrap();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InstanceUnavailable(_)));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let pool = InstancePool::new(vec![instance("a", 1)]);
        let held = pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.id(), "a");
    }

    #[test]
    fn disabled_instances_are_reported_but_not_selected() {
        let configs = vec![
            InstanceConfig {
                id: "on".into(),
                base_url: Url::parse("http://on:9000").unwrap(),
                token: Some("t".into()),
                token_env: None,
                capacity: 2,
                enabled: true,
            },
            InstanceConfig {
                id: "off".into(),
                base_url: Url::parse("http://off:9000").unwrap(),
                token: Some("t".into()),
                token_env: None,
                capacity: 5,
                enabled: false,
            },
        ];
        let pool = InstancePool::from_config(&configs).unwrap();
        assert_eq!(pool.max_concurrency(), 2);
        assert_eq!(pool.snapshot().len(), 2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!((a.id(), b.id()), ("on", "on"));
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn disabled_instance_needs_no_credential() {
        let configs = vec![
            InstanceConfig {
                id: "on".into(),
                base_url: Url::parse("http://on:9000").unwrap(),
                token: Some("t".into()),
                token_env: None,
                capacity: 1,
                enabled: true,
            },
            InstanceConfig {
                id: "parked".into(),
                base_url: Url::parse("http://parked:9000").unwrap(),
                token: None,
                token_env: Some("COMMITSCAN_TEST_UNSET_PARKED_TOKEN".into()),
                capacity: 3,
                enabled: false,
            },
        ];
        let pool = InstancePool::from_config(&configs).unwrap();
        assert_eq!(pool.max_concurrency(), 1);
        let parked = pool
            .snapshot()
            .into_iter()
            .find(|s| s.id == "parked")
            .unwrap();
        assert!(!parked.healthy);
        assert_eq!(pool.try_acquire().unwrap().id(), "on");
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn missing_credential_is_a_configuration_error() {
        let config = InstanceConfig {
            id: "x".into(),
            base_url: Url::parse("http://x:9000").unwrap(),
            token: None,
            token_env: None,
            capacity: 1,
            enabled: true,
        };
        assert!(matches!(
            InstancePool::from_config(&[config]),
            Err(OrchestratorError::Configuration(_))
        ));
    }
}
