//! The persisted connections list (§4.6): two indexed maps, active and
//! imported, per configured tracker.

mod descriptor;

pub use descriptor::{ConnectionDescriptor, ConnectionRole, ConnectionsFile, TrackerConnections};

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Owns the full connections list and its persistence. Shared resource per
/// §5: the tracker client and control RPC both mutate it through these
/// operations, never by reaching into the file directly.
pub struct ConnectionsList {
    path: PathBuf,
    file: RwLock<ConnectionsFile>,
}

impl ConnectionsList {
    /// Load from `path` if it exists, starting fresh otherwise.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "connections file corrupt, starting fresh");
                ConnectionsFile::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConnectionsFile::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read connections file, starting fresh");
                ConnectionsFile::new()
            }
        };
        Self {
            path,
            file: RwLock::new(file),
        }
    }

    pub async fn get(&self, tracker: &str) -> TrackerConnections {
        self.file
            .read()
            .await
            .trackers
            .get(tracker)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_import(&self, tracker: &str, path: &str) -> Option<ConnectionDescriptor> {
        self.file
            .read()
            .await
            .trackers
            .get(tracker)
            .and_then(|t| t.imported.get(path))
            .cloned()
    }

    /// `is_server` is not used to pick a map: the active map is keyed
    /// uniformly by connection name regardless of role, which the
    /// descriptor itself already records.
    pub async fn update(&self, tracker: &str, name: &str, _is_server: bool, descriptor: ConnectionDescriptor) {
        let mut file = self.file.write().await;
        let entry = file.trackers.entry(tracker.to_string()).or_default();
        entry.active.insert(name.to_string(), descriptor);
    }

    pub async fn import(&self, tracker: &str, path: &str, descriptor: ConnectionDescriptor) {
        let mut file = self.file.write().await;
        let entry = file.trackers.entry(tracker.to_string()).or_default();
        entry.imported.insert(path.to_string(), descriptor);
    }

    pub async fn delete(&self, tracker: &str, name: &str, _is_server: bool) {
        let mut file = self.file.write().await;
        if let Some(entry) = file.trackers.get_mut(tracker) {
            entry.active.remove(name);
        }
    }

    pub async fn update_server_name(&self, tracker: &str, name: &str, peer_name: &str) {
        let mut file = self.file.write().await;
        if let Some(entry) = file.trackers.get_mut(tracker) {
            if let Some(descriptor) = entry.active.get_mut(name) {
                descriptor.server_name = Some(peer_name.to_string());
            }
        }
    }

    pub async fn all_connection_names(&self, tracker: &str) -> Vec<String> {
        self.file
            .read()
            .await
            .trackers
            .get(tracker)
            .map(|t| t.active.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Atomically persist the full connections list: write to a temp file
    /// in the same directory, then rename over the target, the same
    /// temp-and-rename pattern the original state file used for a single
    /// flat struct.
    pub async fn save(&self) -> Result<(), ConfigError> {
        let file = self.file.read().await;
        let json = serde_json::to_string_pretty(&*file)
            .map_err(|e| ConfigError::ParseError { line: 0, message: e.to_string() })?;
        drop(file);

        save_atomically(&self.path, &json).map_err(ConfigError::Io)
    }
}

fn save_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o640))?;
    }

    std::fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), "connections list saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            tracker: "t1".into(),
            path: "alice/bob".into(),
            role: ConnectionRole::Server,
            encrypted: true,
            fixed: true,
            connect_address: "127.0.0.1".into(),
            connect_port: 8080,
            listen_address: "0.0.0.0".into(),
            listen_port: 0,
            peers: vec!["bob@t1".into()],
            server_name: None,
        }
    }

    #[tokio::test]
    async fn update_and_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let list = ConnectionsList::load(dir.path().join("connections.json"));

        list.update("t1", "alice/bob", true, descriptor()).await;
        let fetched = list.get("t1").await;
        assert!(fetched.active.contains_key("alice/bob"));
    }

    #[tokio::test]
    async fn save_and_reload_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");

        let list = ConnectionsList::load(&path);
        list.update("t1", "alice/bob", true, descriptor()).await;
        list.save().await.unwrap();

        let reloaded = ConnectionsList::load(&path);
        let fetched = reloaded.get("t1").await;
        assert_eq!(fetched.active.get("alice/bob").unwrap().connect_port, 8080);
    }

    #[tokio::test]
    async fn update_server_name_sets_field() {
        let dir = tempfile::tempdir().unwrap();
        let list = ConnectionsList::load(dir.path().join("connections.json"));
        list.update("t1", "alice/bob", true, descriptor()).await;
        list.update_server_name("t1", "alice/bob", "bob@t1").await;

        let fetched = list.get("t1").await;
        assert_eq!(
            fetched.active.get("alice/bob").unwrap().server_name.as_deref(),
            Some("bob@t1")
        );
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let list = ConnectionsList::load(dir.path().join("missing.json"));
        let fetched = list.get("t1").await;
        assert!(fetched.active.is_empty());
    }
}
