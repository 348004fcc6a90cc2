//! JSON file credential store.
//!
//! One JSON document per credential inside a configured directory. The
//! document is the auth's metadata map with the identity fields overlaid
//! (`id`, `type`, `label`, `disabled`, `proxy_url`, `attributes`), so
//! provider-specific token fields survive untouched. All writes are atomic
//! (temp file + rename) with 0600 permissions; a tokio Mutex serializes
//! writers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{Auth, Status};
use crate::runtime_state::{hydrate_runtime_state_from_metadata, sync_runtime_state_to_metadata};

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential io error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("credential not found: {0}")]
    NotFound(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable credential storage consumed by the auth manager.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Load every credential with its runtime state hydrated.
    async fn list(&self) -> StoreResult<Vec<Auth>>;

    /// Persist one credential. Assigns a file name on first save and syncs
    /// the runtime state into metadata before writing.
    async fn save(&self, auth: &mut Auth) -> StoreResult<PathBuf>;

    /// Remove the credential with the given id.
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Directory-of-JSON-files credential store.
pub struct FileAuthStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuthStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("creating credential dir: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&self.dir, perms)
                .await
                .map_err(|e| StoreError::Io(format!("setting credential dir permissions: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn list(&self) -> StoreResult<Vec<Auth>> {
        if !self.dir.exists() {
            info!(dir = %self.dir.display(), "credential dir not found, starting empty");
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("reading credential dir: {e}")))?;
        let mut auths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("reading credential dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable credential file");
                    continue;
                }
            };
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            match document_to_auth(&contents, &file_name) {
                Ok(auth) => auths.push(auth),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable credential file");
                }
            }
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        info!(dir = %self.dir.display(), accounts = auths.len(), "loaded credentials");
        Ok(auths)
    }

    async fn save(&self, auth: &mut Auth) -> StoreResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        self.ensure_dir().await?;

        sync_runtime_state_to_metadata(auth);
        if auth.file_name.trim().is_empty() {
            auth.file_name = generate_file_name(auth);
        }
        if auth.id.trim().is_empty() {
            auth.id = auth.file_name.trim_end_matches(".json").to_string();
        }

        let doc = auth_to_document(auth);
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| StoreError::Parse(format!("serializing credential: {e}")))?;

        let path = self.dir.join(&auth.file_name);
        let tmp_path = self
            .dir
            .join(format!(".{}.tmp.{}", auth.file_name, std::process::id()));
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| StoreError::Io(format!("writing temp credential file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| StoreError::Io(format!("setting credential file permissions: {e}")))?;
        }
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::Io(format!("renaming temp credential file: {e}")))?;
        debug!(path = %path.display(), auth_id = %auth.id, "persisted credential");
        Ok(path)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let auths = self.list().await?;
        let Some(auth) = auths.iter().find(|a| a.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let path = self.dir.join(&auth.file_name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::Io(format!("removing credential file: {e}")))?;
        debug!(path = %path.display(), auth_id = id, "removed credential");
        Ok(())
    }
}

/// Reserved keys overlaid on the metadata map in the on-disk document.
const RESERVED_KEYS: &[&str] = &["id", "type", "label", "disabled", "proxy_url", "attributes"];

fn auth_to_document(auth: &Auth) -> Value {
    let mut doc = auth.metadata.clone();
    doc.insert("id".into(), Value::String(auth.id.clone()));
    doc.insert("type".into(), Value::String(auth.provider.clone()));
    doc.insert("disabled".into(), Value::Bool(auth.disabled));
    if auth.label.trim().is_empty() {
        doc.remove("label");
    } else {
        doc.insert("label".into(), Value::String(auth.label.clone()));
    }
    if auth.proxy_url.trim().is_empty() {
        doc.remove("proxy_url");
    } else {
        doc.insert("proxy_url".into(), Value::String(auth.proxy_url.clone()));
    }
    if auth.attributes.is_empty() {
        doc.remove("attributes");
    } else {
        let attrs: Map<String, Value> = auth
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        doc.insert("attributes".into(), Value::Object(attrs));
    }
    Value::Object(doc)
}

fn document_to_auth(contents: &str, file_name: &str) -> StoreResult<Auth> {
    let doc: Map<String, Value> = serde_json::from_str(contents)
        .map_err(|e| StoreError::Parse(format!("parsing credential document: {e}")))?;

    let mut auth = Auth {
        id: doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(file_name.trim_end_matches(".json"))
            .to_string(),
        provider: doc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        label: doc
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        file_name: file_name.to_string(),
        disabled: doc.get("disabled").and_then(Value::as_bool).unwrap_or(false),
        proxy_url: doc
            .get("proxy_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        ..Auth::default()
    };
    if let Some(attrs) = doc.get("attributes").and_then(Value::as_object) {
        for (key, value) in attrs {
            if let Some(v) = value.as_str() {
                auth.attributes.insert(key.clone(), v.to_string());
            }
        }
    }
    auth.metadata = doc
        .into_iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .collect();

    hydrate_runtime_state_from_metadata(&mut auth);
    if auth.disabled && auth.status != Status::Disabled {
        auth.status = Status::Disabled;
        auth.unavailable = true;
    }
    Ok(auth)
}

/// Generate a stable, collision-free file name.
///
/// OAuth-backed providers can hold several credentials per (email, project),
/// so those names carry a random 6-byte-hex suffix segment. Legacy names
/// without the suffix remain readable because loading never parses names.
fn generate_file_name(auth: &Auth) -> String {
    let provider = sanitize_segment(&auth.provider);
    if let Some(email) = auth.metadata_str("email") {
        let email = sanitize_segment(email);
        let suffix = random_hex_suffix();
        return match auth.metadata_str("project_id") {
            Some(project) => {
                format!("{provider}-{email}-{}--{suffix}.json", sanitize_segment(project))
            }
            None => format!("{provider}-{email}--{suffix}.json"),
        };
    }
    format!("{provider}-{}.json", sanitize_segment(&auth.id))
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "credential".to_string()
    } else {
        cleaned
    }
}

fn random_hex_suffix() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
