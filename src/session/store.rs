use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::valid_tab_id;

/// UI-visible tab topology for one user: ordered tab ids plus the active tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabTopology {
    pub tabs: Vec<String>,
    pub active_tab: String,
}

impl TabTopology {
    /// Topology handed to users with nothing persisted yet.
    pub fn default_topology() -> Self {
        Self {
            tabs: vec!["1".to_string()],
            active_tab: "1".to_string(),
        }
    }

    /// Drop malformed tab ids and repair the active tab. Returns None when
    /// nothing usable remains.
    pub fn sanitized(&self) -> Option<Self> {
        let tabs: Vec<String> = self
            .tabs
            .iter()
            .filter(|t| valid_tab_id(t))
            .cloned()
            .collect();
        if tabs.is_empty() {
            return None;
        }
        let active_tab = if tabs.contains(&self.active_tab) {
            self.active_tab.clone()
        } else {
            tabs[0].clone()
        };
        Some(Self { tabs, active_tab })
    }
}

/// Durable per-user tab topology, one JSON file per user under the data dir.
/// Writes go through a temp file and rename so a crash mid-write never
/// leaves a torn topology behind.
pub struct TabStore {
    dir: PathBuf,
}

impl TabStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        // User ids are emails; flatten to a safe file name
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    pub fn save(&self, user_id: &str, topology: &TabTopology) -> Result<()> {
        let Some(clean) = topology.sanitized() else {
            bail!("refusing to persist empty tab topology");
        };

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&clean)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;
        Ok(())
    }

    /// Load a user's persisted topology. Missing or unusable data yields None;
    /// callers fall back to the default topology.
    pub fn load(&self, user_id: &str) -> Option<TabTopology> {
        let path = self.path_for(user_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<TabTopology>(&raw) {
            Ok(topo) => topo.sanitized(),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Discarding corrupt tab topology");
                None
            }
        }
    }
}
