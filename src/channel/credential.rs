//! Renewable credentials and their per-channel persistence.

use std::path::{Path, PathBuf};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use crate::core::{Result, UploadError};
use crate::utils::atomic::write_atomic;

/// Current schema version of persisted token records.
pub const TOKEN_RECORD_VERSION: u32 = 1;

const PRIMARY_TOKEN_FILE: &str = "primary.json";
const CHANNEL_TOKEN_PREFIX: &str = "token_";
const TOKEN_FILE_SUFFIX: &str = ".json";

/// Credentials expiring within this window are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Opaque, renewable proof of authorization scoped to one channel or to the
/// primary login.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// `None` means the token does not expire
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= Utc::now(),
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.is_expired()
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|token| !token.is_empty())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Which identity a token record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenKey {
    /// The initial login used for channel discovery
    Primary,
    Channel(String),
}

impl std::fmt::Display for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKey::Primary => f.write_str("primary"),
            TokenKey::Channel(id) => write!(f, "channel:{}", id),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenRecord {
    version: u32,
    credential: Credential,
}

/// Durable token store: one JSON record per channel plus a primary record.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &TokenKey) -> PathBuf {
        match key {
            TokenKey::Primary => self.dir.join(PRIMARY_TOKEN_FILE),
            TokenKey::Channel(id) => {
                let safe: String = id
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect();
                self.dir.join(format!("{}{}{}", CHANNEL_TOKEN_PREFIX, safe, TOKEN_FILE_SUFFIX))
            }
        }
    }

    /// Loads a persisted credential. Unreadable or corrupt records are logged
    /// and reported as absent so the caller falls back to authorization.
    pub async fn load(&self, key: &TokenKey) -> Result<Option<Credential>> {
        let path = self.path_for(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UploadError::file_op(path, "read_token", err)),
        };

        match serde_json::from_slice::<TokenRecord>(&data) {
            Ok(record) if record.version <= TOKEN_RECORD_VERSION => {
                debug!(key = %key, "loaded persisted credential");
                Ok(Some(record.credential))
            }
            Ok(record) => {
                warn!(key = %key, version = record.version, "token record has a newer schema, ignoring");
                Ok(None)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to parse token record, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, key: &TokenKey, credential: &Credential) -> Result<()> {
        let record = TokenRecord {
            version: TOKEN_RECORD_VERSION,
            credential: credential.clone(),
        };
        let data = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.path_for(key), &data).await?;
        debug!(key = %key, "persisted credential");
        Ok(())
    }

    /// Deletes a record; a missing record is not an error.
    pub async fn remove(&self, key: &TokenKey) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UploadError::file_op(path, "remove_token", err)),
        }
    }

    /// Deletes every token record in the store. Returns how many were removed.
    ///
    /// Every record is attempted; the first failure is returned afterwards.
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(UploadError::file_op(&self.dir, "list_tokens", err)),
        };

        let mut removed = 0;
        let mut first_error = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::file_op(&self.dir, "list_tokens", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_token = name == PRIMARY_TOKEN_FILE
                || (name.starts_with(CHANNEL_TOKEN_PREFIX) && name.ends_with(TOKEN_FILE_SUFFIX));
            if !is_token {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(file = %name, error = %err, "failed to delete token file");
                    first_error.get_or_insert_with(|| UploadError::file_op(entry.path(), "remove_token", err));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn test_store() -> (tempfile::TempDir, TokenStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::new(tmp.path().join("tokens"));
        (tmp, store)
    }

    #[test]
    fn validity_follows_expiry() {
        let fresh = Credential::new("abc").with_expiry(Utc::now() + Duration::hours(1));
        assert!(fresh.is_valid());

        let stale = Credential::new("abc").with_expiry(Utc::now() - Duration::minutes(5));
        assert!(stale.is_expired());
        assert!(!stale.is_valid());
        assert!(!stale.can_refresh());
        assert!(stale.with_refresh_token("r").can_refresh());

        assert!(!Credential::new("").is_valid());
    }

    #[test]
    fn debug_output_hides_tokens() {
        let cred = Credential::new("secret-access").with_refresh_token("secret-refresh");
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn save_load_and_remove() {
        let (_tmp, store) = test_store();
        let key = TokenKey::Channel("UC123".to_string());
        assert!(store.load(&key).await.unwrap().is_none());

        let cred = Credential::new("tok").with_refresh_token("ref");
        store.save(&key, &cred).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(cred));

        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_absent() {
        let (_tmp, store) = test_store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.path_for(&TokenKey::Primary), b"{not json").unwrap();

        assert!(store.load(&TokenKey::Primary).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_only_touches_token_files() {
        let (_tmp, store) = test_store();
        store.save(&TokenKey::Primary, &Credential::new("p")).await.unwrap();
        store.save(&TokenKey::Channel("a".into()), &Credential::new("a")).await.unwrap();
        std::fs::write(store.dir().join("notes.txt"), b"keep").unwrap();

        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(store.clear().await.unwrap(), 0);
        assert!(store.dir().join("notes.txt").exists());
    }

    #[test]
    fn channel_ids_are_sanitized_into_file_names() {
        let store = TokenStore::new("/tokens");
        let path = store.path_for(&TokenKey::Channel("../evil id".to_string()));
        assert_eq!(path, PathBuf::from("/tokens/token____evil_id.json"));
    }

    #[tokio::test]
    async fn clear_reports_records_it_could_not_delete() {
        let (_tmp, store) = test_store();
        let channel = TokenKey::Channel("UC1".to_string());
        store.save(&channel, &Credential::new("tok")).await.unwrap();
        // A directory in place of the primary record cannot be unlinked
        std::fs::create_dir_all(store.path_for(&TokenKey::Primary)).unwrap();

        let err = store.clear().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOperation);
        assert!(!store.path_for(&channel).exists(), "other records are still removed");
        assert!(store.path_for(&TokenKey::Primary).exists());
    }
}
