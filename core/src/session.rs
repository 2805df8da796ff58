/// Session store: the authenticated identity and its credential, persisted
/// between runs as a small versioned JSON file
use crate::error::{ChatError, Result};
use crate::messenger_types::{Identity, UserId};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Authenticated identity plus the bearer credential for the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub credential: String,
}

impl Session {
    /// Expiry read from the credential's `exp` claim. The token is not
    /// verified here; the server stays the authority.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let payload = self.credential.split('.').nth(1)?;
        let raw = general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&raw).ok()?;
        let exp = claims.get("exp")?.as_i64()?;
        DateTime::from_timestamp(exp, 0)
    }

    /// Tokens without a readable expiry are assumed valid
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Login and registration against the server
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Session>;
    async fn register(&self, username: &str, password: &str) -> Result<Identity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u8,
    user_id: i64,
    username: String,
    credential: String,
}

/// Where the session lives on disk
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("session.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored session, if any
    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(ChatError::Io)?;
        let parsed: SessionFileV1 =
            serde_json::from_str(&raw).map_err(ChatError::Serialization)?;
        if parsed.version != 1 {
            return Err(ChatError::Session(format!(
                "Unsupported session file version: {}",
                parsed.version
            )));
        }

        Ok(Some(Session {
            identity: Identity {
                id: UserId(parsed.user_id),
                username: parsed.username,
            },
            credential: parsed.credential,
        }))
    }

    /// Persist a session created at login
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(ChatError::Io)?;
        }
        let file = SessionFileV1 {
            version: 1,
            user_id: session.identity.id.0,
            username: session.identity.username.clone(),
            credential: session.credential.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(ChatError::Serialization)?;
        fs::write(&self.path, json).map_err(ChatError::Io)?;

        // Best-effort file permissions (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }

        debug!("Saved session for {} to {}", session.identity.username, self.path.display());
        Ok(())
    }

    /// Forget the session (logout). Returns whether one was stored.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ChatError::Io(e)),
        }
    }
}
