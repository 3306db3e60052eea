//! Connectivity oracle: process-wide reachability of the remote backend.
//!
//! State starts as `Unknown` and changes only through [`ConnectivityOracle::report`]
//! (fed by a [`ConnectivityProbe`] or the platform's reachability callback).
//! Listeners are invoked synchronously, in subscription order, once per
//! transition. Notification rounds are serialized: a second report waits
//! until every listener has seen the first one.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;

pub use crate::types::ConnectivityState;

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Holder of the current [`ConnectivityState`].
///
/// Share it with `Arc`; there is exactly one per process.
pub struct ConnectivityOracle {
    state: RwLock<ConnectivityState>,
    notify: Mutex<()>,
    registry: Arc<Mutex<Registry>>,
}

impl core::fmt::Debug for ConnectivityOracle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectivityOracle")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectivityOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectivityOracle {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectivityState::Unknown),
            notify: Mutex::new(()),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn current_state(&self) -> ConnectivityState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for transitions.
    ///
    /// Listeners must not call [`report`](Self::report) themselves.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, listener));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Record a probe result. Returns `true` if this was a transition.
    pub fn report(&self, observed: ConnectivityState) -> bool {
        let _round = lock(&self.notify);

        let previous = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state == observed {
                return false;
            }
            std::mem::replace(&mut *state, observed)
        };
        tracing::info!(from = ?previous, to = ?observed, "connectivity changed");

        // Snapshot so listeners may subscribe/unsubscribe while being notified.
        let listeners: Vec<Listener> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(observed);
        }
        true
    }

    /// Record the platform's opaque reachability signal.
    pub fn report_reachability(&self, reachable: Option<bool>) -> bool {
        self.report(ConnectivityState::from_reachability(reachable))
    }

    /// Run `probe` once and record its result.
    pub async fn refresh(&self, probe: &dyn ConnectivityProbe) -> ConnectivityState {
        let reachable = probe.probe().await;
        self.report_reachability(reachable);
        self.current_state()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

/// Handle returned by [`ConnectivityOracle::subscribe`].
///
/// Dropping it unsubscribes the listener.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Source of reachability observations.
///
/// `None` means the probe could not tell (maps to `Unknown`).
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Option<bool>;
}

#[async_trait]
impl<P> ConnectivityProbe for Arc<P>
where
    P: ConnectivityProbe + ?Sized,
{
    async fn probe(&self) -> Option<bool> {
        (**self).probe().await
    }
}

/// Probe that hits a lightweight endpoint of the API.
///
/// A 2xx answer counts as reachable. Error statuses (a gateway in front of a
/// down backend) and transport errors count as offline.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(
        base_url: &str,
        ping_path: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                ping_path.trim_start_matches('/')
            ),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpHealthProbe {
    async fn probe(&self) -> Option<bool> {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => Some(true),
            Ok(resp) => {
                tracing::debug!(url = %self.url, status = %resp.status(), "connectivity probe got an error status");
                Some(false)
            }
            Err(err) => {
                tracing::debug!(url = %self.url, error = %err, "connectivity probe failed");
                Some(false)
            }
        }
    }
}
