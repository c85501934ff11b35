//! Online/offline signal and the probe loop that drives it

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use servefirst_auth::Auth;

/// Shared online flag; clones observe the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
    sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            online: Arc::new(AtomicBool::new(online)),
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true when the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            self.sender.send_replace(online);
            info!(online, "connectivity changed");
            true
        } else {
            false
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Reachability check against the backend.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[async_trait]
impl Probe for Auth {
    async fn probe(&self) -> bool {
        match self.health().await {
            Ok(()) => true,
            Err(e) => {
                debug!("health probe failed: {}", e);
                false
            }
        }
    }
}

/// Called when the backend becomes reachable again.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_reconnect(&self);
}

/// Polls a [`Probe`] and keeps a [`Connectivity`] up to date.
pub struct ConnectivityMonitor {
    connectivity: Connectivity,
    probe: Arc<dyn Probe>,
    hook: Option<Arc<dyn ReconnectHook>>,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(connectivity: Connectivity, probe: Arc<dyn Probe>) -> Self {
        Self {
            connectivity,
            probe,
            hook: None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_reconnect(mut self, hook: Arc<dyn ReconnectHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Probes once, records the result and runs the hook on an
    /// offline to online transition.
    pub async fn check_now(&self) -> bool {
        let reachable = tokio::time::timeout(self.timeout, self.probe.probe())
            .await
            .unwrap_or(false);
        let was_online = self.connectivity.is_online();
        self.connectivity.set_online(reachable);

        if reachable && !was_online {
            if let Some(hook) = &self.hook {
                hook.on_reconnect().await;
            }
        }
        reachable
    }

    /// Runs the probe loop on the tokio runtime until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_now().await;
            }
        })
    }
}
