use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use crate::core::{Authorizer, ErrorKind, RemoteUploadService, Result, UploadError};
use crate::utils::atomic::write_atomic;
use crate::utils::retry::{Retrier, RetryPolicy};
use super::credential::{Credential, TokenKey, TokenStore};
use super::types::{
    Channel, ChannelCatalogue, ChannelSettings, ChannelStatistics, SettingsCatalogue, CATALOGUE_VERSION,
};

/// Where the channel manager keeps its durable state.
#[derive(Debug, Clone)]
pub struct ChannelPaths {
    pub tokens_dir: PathBuf,
    pub channels_file: PathBuf,
    pub settings_file: PathBuf,
}

impl ChannelPaths {
    /// Default layout under one data directory.
    pub fn under(data_dir: &Path) -> Self {
        Self {
            tokens_dir: data_dir.join("tokens"),
            channels_file: data_dir.join("channels.json"),
            settings_file: data_dir.join("channel_settings.json"),
        }
    }
}

/// Remote service handle bound to one channel's credential.
#[derive(Clone)]
pub struct AuthenticatedTransport {
    pub channel_id: String,
    pub credential: Credential,
    pub service: Arc<dyn RemoteUploadService>,
}

impl std::fmt::Debug for AuthenticatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedTransport")
            .field("channel_id", &self.channel_id)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ChannelState {
    channels: BTreeMap<String, Channel>,
    settings: BTreeMap<String, ChannelSettings>,
    active: Option<String>,
}

/// 频道与凭证管理器
///
/// Hands out an [`AuthenticatedTransport`] per channel. Credentials are looked
/// up in memory first, then in the [`TokenStore`], refreshed when possible and
/// only as a last resort obtained from the [`Authorizer`].
pub struct ChannelManager {
    paths: ChannelPaths,
    store: TokenStore,
    service: Arc<dyn RemoteUploadService>,
    authorizer: Arc<dyn Authorizer>,
    scopes: Vec<String>,
    default_settings: ChannelSettings,
    api_retry: RetryPolicy,
    state: RwLock<ChannelState>,
    credentials: Mutex<HashMap<TokenKey, Credential>>,
    /// One lock per identity, held across its refresh/authorize sequence.
    /// Other identities and cache hits never wait on it.
    flows: Mutex<HashMap<TokenKey, Arc<AsyncMutex<()>>>>,
    persist_lock: AsyncMutex<()>,
}

impl ChannelManager {
    /// Loads the channel and settings catalogues. Unreadable catalogues are
    /// logged and treated as empty.
    pub async fn open(
        paths: ChannelPaths,
        service: Arc<dyn RemoteUploadService>,
        authorizer: Arc<dyn Authorizer>,
        scopes: Vec<String>,
    ) -> Result<Self> {
        let catalogue: Option<ChannelCatalogue> = load_catalogue(&paths.channels_file).await?;
        let settings: Option<SettingsCatalogue> = load_catalogue(&paths.settings_file).await?;

        let mut state = ChannelState::default();
        if let Some(catalogue) = catalogue {
            state.channels = catalogue.channels;
            state.active = catalogue.active.filter(|id| state.channels.contains_key(id));
        }
        if let Some(settings) = settings {
            state.settings = settings.settings;
        }
        debug!(channels = state.channels.len(), "channel catalogue loaded");

        Ok(Self {
            store: TokenStore::new(paths.tokens_dir.clone()),
            paths,
            service,
            authorizer,
            scopes,
            default_settings: ChannelSettings::new(""),
            api_retry: RetryPolicy::api(),
            state: RwLock::new(state),
            credentials: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
            persist_lock: AsyncMutex::new(()),
        })
    }

    /// Template for settings created on discovery; its `channel_id` is ignored.
    pub fn with_default_settings(mut self, defaults: ChannelSettings) -> Self {
        self.default_settings = defaults;
        self
    }

    /// Retry policy used for remote metadata calls.
    pub fn with_api_retry(mut self, policy: RetryPolicy) -> Self {
        self.api_retry = policy;
        self
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns a transport for `channel_id`, or for the active channel when
    /// `None` is given.
    pub async fn get_transport(&self, channel_id: Option<&str>) -> Result<AuthenticatedTransport> {
        let channel_id = match channel_id {
            Some(id) => id.to_string(),
            None => self
                .active_channel_id()
                .ok_or_else(|| UploadError::auth("no channel given and no active channel selected"))?,
        };

        let credential = self.credential_for(&TokenKey::Channel(channel_id.clone())).await?;
        Ok(AuthenticatedTransport {
            channel_id,
            credential,
            service: self.service.clone(),
        })
    }

    /// Cache, then store, then refresh, then interactive authorization.
    async fn credential_for(&self, key: &TokenKey) -> Result<Credential> {
        if let Some(cached) = self.cached(key) {
            return Ok(cached);
        }

        let flow = self.flows.lock().entry(key.clone()).or_default().clone();
        let _flow = flow.lock().await;

        // Someone else may have finished the flow while we waited.
        if let Some(cached) = self.cached(key) {
            return Ok(cached);
        }

        let cached = self.credentials.lock().remove(key);
        let candidate = match cached {
            Some(cached) => Some(cached),
            None => self.store.load(key).await?,
        };

        let mut fresh = None;
        if let Some(candidate) = candidate {
            if candidate.is_valid() {
                self.credentials.lock().insert(key.clone(), candidate.clone());
                return Ok(candidate);
            }

            if candidate.can_refresh() {
                match self.authorizer.refresh(&candidate).await {
                    Ok(mut refreshed) => {
                        if refreshed.refresh_token.is_none() {
                            refreshed.refresh_token = candidate.refresh_token.clone();
                        }
                        info!(key = %key, "credential refreshed");
                        fresh = Some(refreshed);
                    }
                    Err(err) => warn!(key = %key, error = %err, "credential refresh failed, re-authorizing"),
                }
            }
        }

        let credential = match fresh {
            Some(credential) => credential,
            None => {
                info!(key = %key, "requesting interactive authorization");
                self.authorizer.authorize(&self.scopes).await.map_err(|err| match err.kind() {
                    ErrorKind::Authentication | ErrorKind::Cancelled => err,
                    _ => UploadError::auth(format!("authorization failed: {}", err)),
                })?
            }
        };

        self.store.save(key, &credential).await?;
        self.credentials.lock().insert(key.clone(), credential.clone());
        Ok(credential)
    }

    fn cached(&self, key: &TokenKey) -> Option<Credential> {
        self.credentials.lock().get(key).filter(|credential| credential.is_valid()).cloned()
    }

    /// Lists the channels reachable by the primary login and merges them into
    /// the catalogue, creating default settings for new channels.
    pub async fn discover_channels(&self) -> Result<Vec<Channel>> {
        let primary = self.credential_for(&TokenKey::Primary).await?;

        let discovered = Retrier::new(self.api_retry.clone())
            .name("list_channels")
            .run(|| {
                let service = self.service.clone();
                let primary = primary.clone();
                async move { service.list_channels(&primary).await.map_err(UploadError::from_remote) }
            })
            .await?;

        {
            let mut state = self.state.write();
            for channel in &discovered {
                let id = channel.channel_id.clone();
                state.channels.insert(id.clone(), channel.clone());
                if !state.settings.contains_key(&id) {
                    let mut settings = self.default_settings.clone();
                    settings.channel_id = id.clone();
                    state.settings.insert(id, settings);
                }
            }
            if state.active.is_none() {
                state.active = discovered.first().map(|c| c.channel_id.clone());
            }
        }

        self.seed_channel_credentials(&discovered, &primary).await?;
        self.persist().await?;

        info!(count = discovered.len(), "channels discovered");
        Ok(discovered)
    }

    /// Channels without their own credential start out with the primary one.
    async fn seed_channel_credentials(&self, channels: &[Channel], primary: &Credential) -> Result<()> {
        for channel in channels {
            let key = TokenKey::Channel(channel.channel_id.clone());
            let cached = self.credentials.lock().contains_key(&key);
            if cached || self.store.load(&key).await?.is_some() {
                continue;
            }
            self.store.save(&key, primary).await?;
            self.credentials.lock().insert(key, primary.clone());
            debug!(channel = %channel.channel_id, "seeded channel credential from primary login");
        }
        Ok(())
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        self.state.read().channels.get(channel_id).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.state.read().channels.values().cloned().collect()
    }

    pub fn active_channel_id(&self) -> Option<String> {
        self.state.read().active.clone()
    }

    pub fn active_channel(&self) -> Option<Channel> {
        let state = self.state.read();
        state.active.as_ref().and_then(|id| state.channels.get(id).cloned())
    }

    pub async fn set_active_channel(&self, channel_id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.channels.contains_key(channel_id) {
                return Err(UploadError::validation("channel_id", format!("unknown channel '{}'", channel_id)));
            }
            state.active = Some(channel_id.to_string());
        }
        info!(channel = %channel_id, "active channel set");
        self.persist().await
    }

    /// Upload defaults for a channel, falling back to the global defaults.
    pub fn channel_settings(&self, channel_id: &str) -> ChannelSettings {
        match self.state.read().settings.get(channel_id) {
            Some(settings) => settings.clone(),
            None => {
                let mut settings = self.default_settings.clone();
                settings.channel_id = channel_id.to_string();
                settings
            }
        }
    }

    pub async fn update_channel_settings(&self, settings: ChannelSettings) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.channels.contains_key(&settings.channel_id) {
                return Err(UploadError::validation(
                    "channel_id",
                    format!("unknown channel '{}'", settings.channel_id),
                ));
            }
            state.settings.insert(settings.channel_id.clone(), settings);
        }
        self.persist().await
    }

    /// Forgets a channel and deletes its credential. Returns whether the
    /// channel was known.
    pub async fn remove_channel(&self, channel_id: &str) -> Result<bool> {
        let known = {
            let mut state = self.state.write();
            let known = state.channels.remove(channel_id).is_some();
            state.settings.remove(channel_id);
            if state.active.as_deref() == Some(channel_id) {
                state.active = state.channels.keys().next().cloned();
            }
            known
        };

        let key = TokenKey::Channel(channel_id.to_string());
        self.credentials.lock().remove(&key);
        self.store.remove(&key).await?;
        self.persist().await?;

        if known {
            info!(channel = %channel_id, "channel removed");
        }
        Ok(known)
    }

    /// Deletes every persisted credential and clears all channel state.
    /// Safe to call repeatedly.
    pub async fn logout(&self) -> Result<()> {
        let removed = self.store.clear().await?;
        self.credentials.lock().clear();
        *self.state.write() = ChannelState::default();
        self.persist().await?;
        info!(removed, "logged out");
        Ok(())
    }

    pub fn statistics(&self) -> ChannelStatistics {
        let state = self.state.read();
        let mut stats = ChannelStatistics {
            total_channels: state.channels.len(),
            active_channel: state.active.clone(),
            ..Default::default()
        };
        for channel in state.channels.values() {
            stats.total_subscribers += channel.subscriber_count;
            stats.total_videos += channel.video_count;
            stats.total_views += channel.view_count;
        }
        stats
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;

        let (catalogue, settings) = {
            let state = self.state.read();
            (
                ChannelCatalogue {
                    version: CATALOGUE_VERSION,
                    active: state.active.clone(),
                    channels: state.channels.clone(),
                },
                SettingsCatalogue {
                    version: CATALOGUE_VERSION,
                    settings: state.settings.clone(),
                },
            )
        };

        write_atomic(&self.paths.channels_file, &serde_json::to_vec_pretty(&catalogue)?).await?;
        write_atomic(&self.paths.settings_file, &serde_json::to_vec_pretty(&settings)?).await?;
        Ok(())
    }
}

async fn load_catalogue<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(UploadError::file_op(path, "read_catalogue", err)),
    };

    match serde_json::from_slice::<serde_json::Value>(&data) {
        Ok(value) => {
            let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
            if version > CATALOGUE_VERSION as u64 {
                warn!(file = %path.display(), version, "catalogue has a newer schema, ignoring");
                return Ok(None);
            }
            match serde_json::from_value(value) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "malformed catalogue, starting empty");
                    Ok(None)
                }
            }
        }
        Err(err) => {
            warn!(file = %path.display(), error = %err, "unreadable catalogue, starting empty");
            Ok(None)
        }
    }
}
