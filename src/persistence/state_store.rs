use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key-value state of one integration
pub type State = Map<String, Value>;

pub const DEFAULT_STATE_PATH: &str = "~/.cache/homeline.json";

const WRITE_CHECK_FILE: &str = ".homeline-write-check";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The state file exists but cannot be parsed. Fatal at startup:
    /// resetting it would throw away tokens and force re-authentication.
    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("No write access to {0}")]
    NotWritable(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Expands a leading `~` to the home directory. `~alias/...` is left alone.
pub fn resolve_path(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };

    match rest {
        Some(rest) => {
            let mut home = dirs::home_dir().unwrap_or_else(|| {
                warn!("Could not determine home directory, using current directory");
                PathBuf::from(".")
            });
            if !rest.is_empty() {
                home.push(rest);
            }
            home
        }
        None => PathBuf::from(path),
    }
}

/// Namespaced state persisted as one JSON document
///
/// ```json
/// { "simplisafe": { "token": "..." }, "luxor": { "groups": [1, 2] } }
/// ```
///
/// Every mutation rewrites the whole file before returning. The document
/// lock is held across the write, so writes never overlap even when
/// different namespaces are updated concurrently.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: Option<PathBuf>,
    document: Mutex<Map<String, Value>>,
}

impl StateStore {
    /// Opens the store at `path` (a leading `~` is resolved).
    ///
    /// Creates the directory if needed and checks it is writable. A missing
    /// file is a fresh install; an unparseable one is [`StoreError::Corrupt`].
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let path = resolve_path(path);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;
        check_writable(&dir).await?;

        let document = if tokio::fs::try_exists(&path).await.map_err(io_error(&path))? {
            info!("Loading cached state from {}", path.display());
            let content = tokio::fs::read(&path).await.map_err(io_error(&path))?;
            parse_document(&path, &content)?
        } else {
            debug!("No state file at {}, starting empty", path.display());
            Map::new()
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                path: Some(path),
                document: Mutex::new(document),
            }),
        })
    }

    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: None,
                document: Mutex::new(Map::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Merges `partial` into `namespace` and persists the whole document.
    ///
    /// Keys in `partial` overwrite, absent keys are kept, other namespaces
    /// are untouched. On a failed write the in-memory state is unchanged.
    pub async fn set_state(&self, namespace: &str, partial: State) -> Result<(), StoreError> {
        let mut document = self.inner.document.lock().await;

        let mut updated = document.clone();
        let entry = updated
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(state) = entry {
            for (key, value) in partial {
                state.insert(key, value);
            }
        }

        if let Some(path) = &self.inner.path {
            write_document(path, &updated).await?;
        }
        *document = updated;
        Ok(())
    }

    /// Current state of `namespace`, empty if it was never written
    pub async fn get_state(&self, namespace: &str) -> State {
        match self.inner.document.lock().await.get(namespace) {
            Some(Value::Object(state)) => state.clone(),
            _ => State::new(),
        }
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.inner.document.lock().await.keys().cloned().collect()
    }
}

fn parse_document(path: &Path, content: &[u8]) -> Result<Map<String, Value>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let value: Value = serde_json::from_slice(content).map_err(|e| corrupt(e.to_string()))?;
    let Value::Object(document) = value else {
        return Err(corrupt("top level is not an object".to_string()));
    };
    if let Some((name, _)) = document.iter().find(|(_, v)| !v.is_object()) {
        return Err(corrupt(format!("namespace '{}' is not an object", name)));
    }
    Ok(document)
}

/// Mode bits say nothing about the current user, so actually write.
async fn check_writable(dir: &Path) -> Result<(), StoreError> {
    let check = dir.join(WRITE_CHECK_FILE);
    let not_writable = |e: std::io::Error| {
        warn!("Cannot write to {}: {}", dir.display(), e);
        StoreError::NotWritable(dir.to_path_buf())
    };

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&check)
        .await
        .map_err(not_writable)?;
    drop(file);
    tokio::fs::remove_file(&check).await.map_err(not_writable)?;
    Ok(())
}

/// Write to a sibling temp file, then rename over the target.
async fn write_document(path: &Path, document: &Map<String, Value>) -> Result<(), StoreError> {
    info!("Writing state to {}", path.display());
    let content = serde_json::to_vec(document)?;

    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
    file.write_all(&content).await.map_err(io_error(&tmp))?;
    file.sync_all().await.map_err(io_error(&tmp))?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}
