//! Durable session state: the cookie map, scalar login flags and the
//! opt-in credential pair.
//!
//! The store is backend-agnostic on purpose: whichever networking backend
//! captured the cookies, the rest of the crate sees one key→value map that
//! survives a process restart. Reads fail open (an empty or corrupted file
//! yields `{}`), cookie writes are logged and swallowed — omitting a cookie
//! degrades session quality but must never crash the caller.
//!
//! Individual `get`/`set`/`save_cookies` calls are the finest unit of
//! atomicity; there is no locking across await points.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::PortalError;

/// Storage key holding the serialized cookie map.
pub const COOKIES_KEY: &str = "app_cookies";
/// Storage key holding the persisted logged-in flag.
pub const LOGGED_IN_KEY: &str = "isLoggedIn";
/// Storage key holding the last-known institutional user id.
pub const USER_NO_KEY: &str = "userNo";
/// Storage key holding the cached session-scoped form token.
pub const FORM_TOKEN_KEY: &str = "enteranceInfoSeq";

/// Opt-in secret material for automatic re-login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_no: String,
    pub password: String,
}

#[derive(Clone)]
enum Backend {
    /// Two JSON files under one directory: `state.json` for plain entries and
    /// `credentials.json` for the secret half.
    File { state: PathBuf, secrets: PathBuf },
    /// Isolated maps for tests.
    Memory {
        state: Arc<Mutex<HashMap<String, String>>>,
        secrets: Arc<Mutex<HashMap<String, String>>>,
    },
}

/// Persistent key→value store for session state.
///
/// Cheap to clone; clones share the same backing storage.
#[derive(Clone)]
pub struct SessionStore {
    backend: Backend,
}

impl SessionStore {
    /// File-backed store rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            backend: Backend::File {
                state: dir.join("state.json"),
                secrets: dir.join("credentials.json"),
            },
        }
    }

    /// In-memory store, isolated per instance. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory {
                state: Arc::new(Mutex::new(HashMap::new())),
                secrets: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    /// Read one plain entry. Fails open to `None`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.read_half(false).await.remove(key)
    }

    /// Write one plain entry. Completes only after the durable write succeeds.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        let mut map = self.read_half(false).await;
        map.insert(key.to_string(), value.to_string());
        self.write_half(false, &map).await
    }

    /// Remove one plain entry.
    pub async fn remove(&self, key: &str) -> Result<(), PortalError> {
        let mut map = self.read_half(false).await;
        map.remove(key);
        self.write_half(false, &map).await
    }

    /// Merge `new` into the persisted cookie map. Previously stored unrelated
    /// cookies persist unless overwritten. Failure is logged and swallowed.
    pub async fn save_cookies(&self, new: &HashMap<String, String>) {
        if new.is_empty() {
            return;
        }
        let mut cookies = self.load_cookies().await;
        for (name, value) in new {
            cookies.insert(name.clone(), value.clone());
        }
        let serialized = match serde_json::to_string(&cookies) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize cookie map");
                return;
            }
        };
        if let Err(e) = self.set(COOKIES_KEY, &serialized).await {
            warn!(error = %e, "failed to persist cookies");
        } else {
            debug!(count = cookies.len(), "cookies persisted");
        }
    }

    /// The persisted cookie map, or `{}` when nothing is stored or the stored
    /// value is unreadable.
    pub async fn load_cookies(&self) -> HashMap<String, String> {
        match self.get(COOKIES_KEY).await {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "stored cookies are corrupted; starting empty");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        }
    }

    /// Drop all persisted cookie state. Used on logout.
    pub async fn clear_cookies(&self) -> Result<(), PortalError> {
        self.remove(COOKIES_KEY).await
    }

    /// Store the opt-in credential pair in the secret half.
    pub async fn save_credentials(&self, creds: &Credentials) -> Result<(), PortalError> {
        let mut map = self.read_half(true).await;
        map.insert(USER_NO_KEY.to_string(), creds.user_no.clone());
        map.insert("password".to_string(), creds.password.clone());
        self.write_half(true, &map).await
    }

    /// The saved credential pair, or `None` when either half is missing.
    pub async fn load_credentials(&self) -> Option<Credentials> {
        let map = self.read_half(true).await;
        let user_no = map.get(USER_NO_KEY)?.clone();
        let password = map.get("password")?.clone();
        Some(Credentials { user_no, password })
    }

    /// Delete the stored credential pair.
    pub async fn clear_credentials(&self) -> Result<(), PortalError> {
        self.write_half(true, &HashMap::new()).await
    }

    async fn read_half(&self, secret: bool) -> HashMap<String, String> {
        match &self.backend {
            Backend::File { state, secrets } => {
                let path = if secret { secrets } else { state };
                match tokio::fs::read_to_string(path).await {
                    Ok(raw) => match serde_json::from_str(&raw) {
                        Ok(map) => map,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "store file corrupted; starting empty");
                            HashMap::new()
                        }
                    },
                    // Missing file is the normal first-run case.
                    Err(_) => HashMap::new(),
                }
            }
            Backend::Memory { state, secrets } => {
                let map = if secret { secrets } else { state };
                map.lock().await.clone()
            }
        }
    }

    async fn write_half(
        &self,
        secret: bool,
        map: &HashMap<String, String>,
    ) -> Result<(), PortalError> {
        match &self.backend {
            Backend::File { state, secrets } => {
                let path = if secret { secrets } else { state };
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let raw = serde_json::to_string_pretty(map)?;
                tokio::fs::write(path, raw).await?;
                Ok(())
            }
            Backend::Memory { state, secrets } => {
                let target = if secret { secrets } else { state };
                *target.lock().await = map.clone();
                Ok(())
            }
        }
    }
}
