//! Tenant labels from a YAML file mapping users and groups to tenants.
//!
//! ```yaml
//! users:
//!   alice: [team-a]
//! groups:
//!   platform: ["#cluster-wide"]
//!   developers: [team-a, team-b]
//! ```
//!
//! The file is held as an immutable snapshot. [`StaticLabelStore::reload`]
//! parses the file again and swaps the snapshot in one step, so a lookup sees
//! either the old map or the new one, never a mix.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{LabelError, LabelResult};
use crate::identity::Identity;
use crate::provider::{CLUSTER_WIDE, ProviderKind, TenantDecision, TenantProvider};

#[derive(Debug, Default, Deserialize)]
struct LabelFile {
    #[serde(default)]
    users: HashMap<String, Vec<String>>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

/// Parsed user and group mapping. Group names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    users: HashMap<String, BTreeSet<String>>,
    groups: HashMap<String, BTreeSet<String>>,
}

impl LabelMap {
    /// Parses the YAML mapping.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        let file: LabelFile = if source.trim().is_empty() {
            LabelFile::default()
        } else {
            serde_yaml::from_str(source)?
        };

        let users = file
            .users
            .into_iter()
            .map(|(user, tenants)| (user, tenants.into_iter().collect()))
            .collect();

        let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (group, tenants) in file.groups {
            groups
                .entry(group.to_lowercase())
                .or_default()
                .extend(tenants);
        }

        Ok(Self { users, groups })
    }

    /// Number of users and groups in the map.
    pub fn len(&self) -> usize {
        self.users.len() + self.groups.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unions the tenants of the user and each of their groups. Any list
    /// holding [`CLUSTER_WIDE`] makes the decision cluster-wide.
    pub fn resolve(&self, identity: &Identity) -> TenantDecision {
        let user = self.users.get(&identity.username);
        let groups = identity
            .groups
            .iter()
            .filter_map(|group| self.groups.get(&group.to_lowercase()));

        let mut tenants = BTreeSet::new();
        for list in user.into_iter().chain(groups) {
            if list.contains(CLUSTER_WIDE) {
                return TenantDecision::cluster_wide();
            }
            tenants.extend(list.iter().cloned());
        }
        TenantDecision::scoped(tenants)
    }
}

/// Label store backed by a YAML file that can be reloaded at runtime.
#[derive(Debug)]
pub struct StaticLabelStore {
    path: PathBuf,
    map: ArcSwap<LabelMap>,
    modified: Mutex<Option<SystemTime>>,
    healthy: AtomicBool,
}

impl StaticLabelStore {
    /// Loads the label file at `path`.
    pub fn load(path: impl AsRef<Path>) -> LabelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (map, modified) = read_map(&path)?;
        info!(path = %path.display(), entries = map.len(), "loaded label file");
        Ok(Self {
            path,
            map: ArcSwap::from_pointee(map),
            modified: Mutex::new(modified),
            healthy: AtomicBool::new(true),
        })
    }

    /// Re-reads the label file and swaps in the new mapping.
    ///
    /// On failure the previous mapping stays in place and the store reports
    /// unhealthy until a later reload succeeds.
    pub fn reload(&self) -> LabelResult<()> {
        match read_map(&self.path) {
            Ok((map, modified)) => {
                let entries = map.len();
                self.map.store(Arc::new(map));
                *self.modified.lock() = modified;
                self.healthy.store(true, Ordering::Release);
                info!(path = %self.path.display(), entries, "reloaded label file");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Reloads if the file's modification time changed since the last load.
    /// Returns true if a reload was attempted.
    pub fn reload_if_changed(&self) -> LabelResult<bool> {
        let current = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if current.is_some() && current == *self.modified.lock() {
            return Ok(false);
        }
        debug!(path = %self.path.display(), "label file changed");
        self.reload().map(|()| true)
    }

    /// Polls the file every `interval` and reloads it when it changes.
    pub fn spawn_watcher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reload_if_changed() {
                    error!(path = %self.path.display(), error = %e, "failed to reload label file");
                }
            }
        })
    }
}

fn read_map(path: &Path) -> LabelResult<(LabelMap, Option<SystemTime>)> {
    let source = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let map = LabelMap::from_yaml(&source).map_err(|source| LabelError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok((map, modified))
}

#[async_trait]
impl TenantProvider for StaticLabelStore {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn tenants(&self, identity: &Identity) -> LabelResult<TenantDecision> {
        Ok(self.map.load().resolve(identity))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}
