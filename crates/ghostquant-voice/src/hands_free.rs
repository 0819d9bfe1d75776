//! **Hands-free mode** — the persisted wake-loop preference and its usage stats.
//!
//! The enabled flag decides whether the pipeline rests in `wake_listening` or
//! `idle`. While the pipeline is actually wake-listening the mode is *active*;
//! activation edges count sessions and deactivation edges add the elapsed
//! interval to the accumulated active time.

use crate::error::VoiceResult;
use crate::preferences::{get_parsed, keys, PreferenceStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Wall-clock source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(step) = chrono::Duration::from_std(by) {
            *now += step;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot returned by [`HandsFreeModeManager::get_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandsFreeModeState {
    pub is_enabled: bool,
    pub is_active: bool,
    pub last_toggle_time: Option<DateTime<Utc>>,
    /// Includes the currently open interval, if any.
    pub total_active_time: Duration,
    pub session_count: u64,
}

struct Inner {
    enabled: bool,
    auto_start: bool,
    active_since: Option<DateTime<Utc>>,
    last_toggle: Option<DateTime<Utc>>,
    total_active: Duration,
    session_count: u64,
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

pub struct HandsFreeModeManager {
    store: Arc<dyn PreferenceStore>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    enabled_tx: watch::Sender<bool>,
}

impl HandsFreeModeManager {
    /// Load persisted state from `store`.
    pub fn new(store: Arc<dyn PreferenceStore>) -> VoiceResult<Self> {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn PreferenceStore>, clock: Arc<dyn Clock>) -> VoiceResult<Self> {
        let enabled = get_parsed::<bool>(store.as_ref(), keys::HANDS_FREE_ENABLED)?.unwrap_or(false);
        let auto_start =
            get_parsed::<bool>(store.as_ref(), keys::HANDS_FREE_AUTO_START)?.unwrap_or(false);
        let total_ms = get_parsed::<u64>(store.as_ref(), keys::HANDS_FREE_ACTIVE_MS)?.unwrap_or(0);
        let session_count =
            get_parsed::<u64>(store.as_ref(), keys::HANDS_FREE_SESSIONS)?.unwrap_or(0);
        debug!(enabled, auto_start, total_ms, session_count, "hands-free state loaded");

        let (enabled_tx, _) = watch::channel(enabled);
        Ok(Self {
            store,
            clock,
            inner: Mutex::new(Inner {
                enabled,
                auto_start,
                active_since: None,
                last_toggle: None,
                total_active: Duration::from_millis(total_ms),
                session_count,
            }),
            enabled_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_active(&self) -> bool {
        self.lock().active_since.is_some()
    }

    pub fn enable(&self) -> VoiceResult<()> {
        self.set_enabled(true)
    }

    /// Turn the mode off. An open active interval is flushed exactly once.
    pub fn disable(&self) -> VoiceResult<()> {
        self.set_enabled(false)
    }

    /// Flip the preference; returns the new value.
    pub fn toggle(&self) -> VoiceResult<bool> {
        let next = !self.is_enabled();
        self.set_enabled(next)?;
        Ok(next)
    }

    /// The flag is persisted before anything changes in memory. A failed
    /// interval flush afterwards leaves the interval open, so the next
    /// `set_active(false)` still counts it.
    fn set_enabled(&self, enabled: bool) -> VoiceResult<()> {
        let mut inner = self.lock();
        if inner.enabled == enabled {
            return Ok(());
        }
        self.store
            .set(keys::HANDS_FREE_ENABLED, if enabled { "true" } else { "false" })?;
        inner.enabled = enabled;
        inner.last_toggle = Some(self.clock.now());
        let flushed = if enabled {
            Ok(())
        } else {
            self.deactivate(&mut inner)
        };
        drop(inner);

        info!(enabled, "🙌 hands-free mode");
        self.enabled_tx.send_replace(enabled);
        flushed
    }

    /// Track whether the wake loop is actually running.
    pub fn set_active(&self, active: bool) -> VoiceResult<()> {
        let mut inner = self.lock();
        if active {
            if inner.active_since.is_none() {
                inner.active_since = Some(self.clock.now());
                inner.session_count += 1;
                self.store
                    .set(keys::HANDS_FREE_SESSIONS, &inner.session_count.to_string())?;
                debug!(sessions = inner.session_count, "hands-free session started");
            }
            Ok(())
        } else {
            self.deactivate(&mut inner)
        }
    }

    /// Close the open interval. Nothing changes unless the new total is stored.
    fn deactivate(&self, inner: &mut Inner) -> VoiceResult<()> {
        if let Some(since) = inner.active_since {
            let total = inner.total_active + elapsed(since, self.clock.now());
            self.store
                .set(keys::HANDS_FREE_ACTIVE_MS, &total.as_millis().to_string())?;
            inner.active_since = None;
            inner.total_active = total;
            debug!(?total, "hands-free session ended");
        }
        Ok(())
    }

    /// Accumulated active time, including the open interval.
    pub fn total_active_time(&self) -> Duration {
        let inner = self.lock();
        let open = inner
            .active_since
            .map(|since| elapsed(since, self.clock.now()))
            .unwrap_or_default();
        inner.total_active + open
    }

    pub fn get_state(&self) -> HandsFreeModeState {
        let total_active_time = self.total_active_time();
        let inner = self.lock();
        HandsFreeModeState {
            is_enabled: inner.enabled,
            is_active: inner.active_since.is_some(),
            last_toggle_time: inner.last_toggle,
            total_active_time,
            session_count: inner.session_count,
        }
    }

    /// Clear time and session count. The enabled preference is untouched.
    pub fn reset_stats(&self) -> VoiceResult<()> {
        let mut inner = self.lock();
        inner.total_active = Duration::ZERO;
        inner.session_count = 0;
        if inner.active_since.is_some() {
            inner.active_since = Some(self.clock.now());
        }
        self.store.set(keys::HANDS_FREE_ACTIVE_MS, "0")?;
        self.store.set(keys::HANDS_FREE_SESSIONS, "0")?;
        Ok(())
    }

    pub fn set_auto_start(&self, auto_start: bool) -> VoiceResult<()> {
        self.lock().auto_start = auto_start;
        self.store.set(
            keys::HANDS_FREE_AUTO_START,
            if auto_start { "true" } else { "false" },
        )
    }

    pub fn should_auto_start(&self) -> bool {
        let inner = self.lock();
        inner.auto_start && inner.enabled
    }

    /// Watch the enabled preference.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;
    use crate::preferences::MemoryPreferenceStore;
    use chrono::TimeZone;

    /// Memory store whose writes to one key can be made to fail.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryPreferenceStore,
        failing: Arc<Mutex<Option<&'static str>>>,
    }

    impl FlakyStore {
        fn fail_writes_to(&self, key: Option<&'static str>) {
            *self.failing.lock().unwrap() = key;
        }
    }

    impl PreferenceStore for FlakyStore {
        fn get(&self, key: &str) -> VoiceResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> VoiceResult<()> {
            if *self.failing.lock().unwrap() == Some(key) {
                return Err(VoiceError::Preferences(format!("{} is read-only", key)));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> VoiceResult<()> {
            self.inner.remove(key)
        }
    }

    fn flaky_manager() -> (HandsFreeModeManager, ManualClock, FlakyStore) {
        let store = FlakyStore::default();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        let manager =
            HandsFreeModeManager::with_clock(Arc::new(store.clone()), Arc::new(clock.clone()))
                .unwrap();
        (manager, clock, store)
    }

    fn manager() -> (HandsFreeModeManager, ManualClock, MemoryPreferenceStore) {
        let store = MemoryPreferenceStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        let manager =
            HandsFreeModeManager::with_clock(Arc::new(store.clone()), Arc::new(clock.clone()))
                .unwrap();
        (manager, clock, store)
    }

    #[test]
    fn toggle_persists_preference() {
        let (manager, _clock, store) = manager();
        assert!(manager.toggle().unwrap());
        assert_eq!(
            store.get(keys::HANDS_FREE_ENABLED).unwrap().as_deref(),
            Some("true")
        );
        assert!(!manager.toggle().unwrap());
        assert!(manager.get_state().last_toggle_time.is_some());
    }

    #[test]
    fn disable_while_active_flushes_once() {
        let (manager, clock, _store) = manager();
        manager.enable().unwrap();
        manager.set_active(true).unwrap();
        clock.advance(Duration::from_secs(10));

        manager.disable().unwrap();
        manager.disable().unwrap();
        manager.set_active(false).unwrap();
        clock.advance(Duration::from_secs(30));

        let state = manager.get_state();
        assert_eq!(state.total_active_time, Duration::from_secs(10));
        assert_eq!(state.session_count, 1);
        assert!(!state.is_active);
    }

    #[test]
    fn open_interval_is_included_and_monotonic() {
        let (manager, clock, _store) = manager();
        manager.set_active(true).unwrap();
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            clock.advance(Duration::from_millis(700));
            let now = manager.get_state().total_active_time;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, Duration::from_millis(3500));
    }

    #[test]
    fn activation_edges_count_sessions() {
        let (manager, clock, _store) = manager();
        for _ in 0..3 {
            manager.set_active(true).unwrap();
            manager.set_active(true).unwrap();
            clock.advance(Duration::from_secs(2));
            manager.set_active(false).unwrap();
        }
        let state = manager.get_state();
        assert_eq!(state.session_count, 3);
        assert_eq!(state.total_active_time, Duration::from_secs(6));
    }

    #[test]
    fn reset_stats_keeps_enabled_flag() {
        let (manager, clock, _store) = manager();
        manager.enable().unwrap();
        manager.set_active(true).unwrap();
        clock.advance(Duration::from_secs(5));
        manager.reset_stats().unwrap();

        let state = manager.get_state();
        assert!(state.is_enabled);
        assert_eq!(state.session_count, 0);
        assert_eq!(state.total_active_time, Duration::ZERO);
    }

    #[test]
    fn stats_reload_from_store() {
        let (manager, clock, store) = manager();
        manager.enable().unwrap();
        manager.set_auto_start(true).unwrap();
        manager.set_active(true).unwrap();
        clock.advance(Duration::from_secs(4));
        manager.set_active(false).unwrap();

        let reloaded = HandsFreeModeManager::new(Arc::new(store)).unwrap();
        let state = reloaded.get_state();
        assert!(state.is_enabled);
        assert!(reloaded.should_auto_start());
        assert_eq!(state.total_active_time, Duration::from_secs(4));
        assert_eq!(state.session_count, 1);
    }

    #[tokio::test]
    async fn subscribers_see_preference_changes() {
        let (manager, _clock, _store) = manager();
        let mut rx = manager.subscribe();
        manager.enable().unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn failed_flag_write_leaves_mode_running() {
        let (manager, clock, store) = flaky_manager();
        manager.enable().unwrap();
        manager.set_active(true).unwrap();
        clock.advance(Duration::from_secs(10));

        store.fail_writes_to(Some(keys::HANDS_FREE_ENABLED));
        assert!(manager.disable().is_err());
        let state = manager.get_state();
        assert!(state.is_enabled);
        assert!(state.is_active);
        assert_eq!(state.total_active_time, Duration::from_secs(10));
    }

    #[test]
    fn failed_interval_flush_keeps_the_time() {
        let (manager, clock, store) = flaky_manager();
        manager.enable().unwrap();
        manager.set_active(true).unwrap();
        clock.advance(Duration::from_secs(10));

        store.fail_writes_to(Some(keys::HANDS_FREE_ACTIVE_MS));
        assert!(manager.disable().is_err());
        assert!(!manager.is_enabled());
        assert!(manager.is_active());
        assert_eq!(
            store.get(keys::HANDS_FREE_ENABLED).unwrap().as_deref(),
            Some("false")
        );

        store.fail_writes_to(None);
        clock.advance(Duration::from_secs(5));
        manager.set_active(false).unwrap();
        assert_eq!(manager.total_active_time(), Duration::from_secs(15));
        assert_eq!(
            store.get(keys::HANDS_FREE_ACTIVE_MS).unwrap().as_deref(),
            Some("15000")
        );
    }
}
