//! ServeFirst client library
//!
//! Offline-first client for managing community theater groups: groups,
//! rehearsal calendars, events and script/scenery/costume documents, backed
//! by a Supabase-compatible cloud and a local key-value mirror.

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod groups;
pub mod importer;
pub mod local;
pub mod models;
pub mod offline;
pub mod repository;

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};

use servefirst_auth::{Auth, AuthOptions};

use crate::auth::AuthProvider;
use crate::config::{AppConfig, RepositoryMode};
use crate::connectivity::{Connectivity, ConnectivityMonitor, ReconnectHook};
use crate::error::{Error, Result};
use crate::events::{EventService, PostgrestEventStore};
use crate::groups::GroupService;
use crate::local::{FileStore, LocalStore, MemoryStore};
use crate::offline::OfflineCache;
use crate::repository::{
    CloudGroupRepository, GroupRepository, LocalGroupRepository, OfflineFirstGroupRepository,
    PostgrestGroupStore, SyncReport,
};

/// Application state: the signed-in user, the group repository picked by
/// [`RepositoryMode`], and the services built on top of them.
pub struct ServeFirst {
    config: AppConfig,
    local: Arc<dyn LocalStore>,
    auth: Arc<AuthProvider>,
    connectivity: Connectivity,
    repository: Arc<dyn GroupRepository>,
    groups: GroupService<dyn GroupRepository>,
    events: EventService,
}

impl ServeFirst {
    /// Builds the client, opening the file store under `data_dir` when one
    /// is configured and keeping everything in memory otherwise.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use servefirst::{config::AppConfig, ServeFirst};
    ///
    /// # async fn run() -> servefirst::error::Result<()> {
    /// let config = AppConfig::new("https://your-project.supabase.co", "anon-key")?
    ///     .with_data_dir("/var/lib/servefirst");
    /// let app = ServeFirst::new(config).await?;
    /// app.auth().restore_session().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: AppConfig) -> Result<Self> {
        let local: Arc<dyn LocalStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStore::open(dir).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_local_store(config, local)
    }

    pub fn with_local_store(config: AppConfig, local: Arc<dyn LocalStore>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        let url = config.base_url().to_string();
        let key = config.anon_key.clone();

        let auth_client = Arc::new(Auth::new(
            &url,
            &key,
            http_client.clone(),
            AuthOptions::default(),
        ));
        let auth = Arc::new(AuthProvider::new(
            &config,
            http_client.clone(),
            auth_client.clone(),
            local.clone(),
        ));

        let connectivity = Connectivity::default();
        let cache = Arc::new(OfflineCache::new(local.clone()));
        let group_store =
            PostgrestGroupStore::new(&url, &key, http_client.clone()).with_auth(auth_client.clone());

        let repository: Arc<dyn GroupRepository> = match config.options.mode {
            RepositoryMode::OfflineFirst => Arc::new(OfflineFirstGroupRepository::new(
                group_store,
                cache,
                connectivity.clone(),
            )),
            RepositoryMode::CloudOnly => Arc::new(CloudGroupRepository::new(group_store)),
            RepositoryMode::LocalOnly => Arc::new(LocalGroupRepository::new(cache)),
        };
        info!(mode = ?config.options.mode, url = %url, "ServeFirst client ready");

        let event_store = PostgrestEventStore::new(&url, &key, http_client).with_auth(auth_client);
        let events = EventService::new(Arc::new(event_store), local.clone());

        Ok(Self {
            groups: GroupService::new(repository.clone()),
            config,
            local,
            auth,
            connectivity,
            repository,
            events,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthProvider {
        &self.auth
    }

    pub fn groups(&self) -> &GroupService<dyn GroupRepository> {
        &self.groups
    }

    pub fn events(&self) -> &EventService {
        &self.events
    }

    pub fn repository(&self) -> &Arc<dyn GroupRepository> {
        &self.repository
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Replays the pending queue for the signed-in user.
    pub async fn sync(&self) -> Result<SyncReport> {
        let user = self.auth.require_user()?;
        self.repository.sync(&user.id).await
    }

    /// Health-probe monitor that syncs whenever the backend comes back.
    /// Call [`ConnectivityMonitor::spawn`] to start it.
    pub fn monitor(&self) -> ConnectivityMonitor {
        let hook = Arc::new(SyncOnReconnect {
            auth: self.auth.clone(),
            repository: self.repository.clone(),
        });
        ConnectivityMonitor::new(self.connectivity.clone(), self.auth.auth().clone())
            .with_interval(self.config.options.probe_interval)
            .with_timeout(self.config.options.probe_timeout)
            .on_reconnect(hook)
    }
}

struct SyncOnReconnect {
    auth: Arc<AuthProvider>,
    repository: Arc<dyn GroupRepository>,
}

#[async_trait]
impl ReconnectHook for SyncOnReconnect {
    async fn on_reconnect(&self) {
        let Some(user_id) = self.auth.user_id() else {
            return;
        };
        match self.repository.sync(&user_id).await {
            Ok(report) if report.is_success() => {
                info!(applied = report.applied(), "pending changes synced")
            }
            Ok(report) => warn!(
                failures = report.failures.len(),
                deferred = report.deferred.len(),
                "sync after reconnect left changes pending"
            ),
            Err(e) => warn!("sync after reconnect failed: {}", e),
        }
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{AuthProvider, RegisterForm, Registration};
    pub use crate::config::{AppConfig, AppOptions, RepositoryMode};
    pub use crate::error::{Error, Result};
    pub use crate::events::EventService;
    pub use crate::groups::{GroupForm, GroupService, ImportField};
    pub use crate::importer::{DocumentImporter, ImportSession};
    pub use crate::models::{Event, EventPatch, Group, GroupPatch, NewEvent, NewGroup, Role, UserProfile};
    pub use crate::repository::{GroupRepository, SyncReport, WriteOutcome};
    pub use crate::ServeFirst;
}
