//! Configuration for the ServeFirst client

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

/// Which group repository strategy the client is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepositoryMode {
    /// Cloud when reachable, local mirror and pending queue otherwise
    #[default]
    OfflineFirst,
    /// Cloud only; failures are returned to the caller
    CloudOnly,
    /// Local mirror only; every mutation waits in the pending queue
    LocalOnly,
}

impl std::str::FromStr for RepositoryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "offline-first" => Ok(Self::OfflineFirst),
            "cloud-only" | "cloud" => Ok(Self::CloudOnly),
            "local-only" | "local" => Ok(Self::LocalOnly),
            other => Err(Error::config(format!("unknown repository mode: {}", other))),
        }
    }
}

/// Options for the ServeFirst client
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Timeout applied to every HTTP request
    pub request_timeout: Option<Duration>,

    /// How often the connectivity monitor probes the backend
    pub probe_interval: Duration,

    /// Timeout of a single connectivity probe
    pub probe_timeout: Duration,

    /// Group repository strategy
    pub mode: RepositoryMode,

    /// Storage bucket for profile pictures
    pub profile_bucket: String,

    /// Keep the auth session in the local store across restarts
    pub persist_session: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            mode: RepositoryMode::OfflineFirst,
            profile_bucket: "profile-images".to_string(),
            persist_session: true,
        }
    }
}

impl AppOptions {
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_probe_interval(mut self, value: Duration) -> Self {
        self.probe_interval = value;
        self
    }

    pub fn with_probe_timeout(mut self, value: Duration) -> Self {
        self.probe_timeout = value;
        self
    }

    pub fn with_mode(mut self, value: RepositoryMode) -> Self {
        self.mode = value;
        self
    }

    pub fn with_profile_bucket(mut self, value: &str) -> Self {
        self.profile_bucket = value.to_string();
        self
    }

    pub fn with_persist_session(mut self, value: bool) -> Self {
        self.persist_session = value;
        self
    }
}

/// Project coordinates plus client options.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub url: Url,
    pub anon_key: String,
    /// Directory of the file-backed local store; `None` keeps it in memory.
    pub data_dir: Option<PathBuf>,
    pub options: AppOptions,
}

impl AppConfig {
    /// Creates a new configuration, validating the URL and key.
    pub fn new(url_str: &str, anon_key: &str) -> Result<Self> {
        let url = Url::parse(url_str)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        if anon_key.trim().is_empty() {
            return Err(Error::config("anon_key cannot be empty"));
        }
        Ok(Self {
            url,
            anon_key: anon_key.to_string(),
            data_dir: None,
            options: AppOptions::default(),
        })
    }

    /// Reads `SERVEFIRST_URL`, `SERVEFIRST_ANON_KEY` and the optional
    /// `SERVEFIRST_DATA_DIR`, `SERVEFIRST_MODE`, `SERVEFIRST_PROBE_INTERVAL_SECS`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SERVEFIRST_URL")
            .map_err(|_| Error::config("SERVEFIRST_URL environment variable not found"))?;
        let key = std::env::var("SERVEFIRST_ANON_KEY")
            .map_err(|_| Error::config("SERVEFIRST_ANON_KEY environment variable not found"))?;

        let mut config = Self::new(&url, &key)?;

        if let Ok(dir) = std::env::var("SERVEFIRST_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(mode) = std::env::var("SERVEFIRST_MODE") {
            config.options.mode = mode.parse()?;
        }
        if let Ok(secs) = std::env::var("SERVEFIRST_PROBE_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::config(format!("invalid SERVEFIRST_PROBE_INTERVAL_SECS: {}", secs))
            })?;
            if secs == 0 {
                return Err(Error::config("SERVEFIRST_PROBE_INTERVAL_SECS must be positive"));
            }
            config.options.probe_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_options(mut self, options: AppOptions) -> Self {
        self.options = options;
        self
    }

    /// Base URL without the trailing slash `Url` adds.
    pub fn base_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }
}
