use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use log::{debug, info};
use serde_derive::{Deserialize, Serialize};

use crate::topics::DeviceId;

/// On-disk layout of the registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    mac_to_id: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First registration of this hardware id.
    Assigned(DeviceId),
    /// Hardware id seen before; the same identity is re-sent.
    Known(DeviceId),
    /// Capacity reached, the device is ignored.
    Full,
}

#[derive(Debug)]
pub struct Registry {
    assignments: BTreeMap<String, DeviceId>,
    heartbeats: HashMap<DeviceId, u64>,
    next_id: u32,
    max_devices: usize,
    ack_every: u64,
    path: Option<PathBuf>,
}

impl Registry {
    pub fn new(max_devices: usize, ack_every: u64) -> Self {
        Registry {
            assignments: BTreeMap::new(),
            heartbeats: HashMap::new(),
            next_id: 1,
            max_devices,
            ack_every,
            path: None,
        }
    }

    /// Registry persisted at `path`. A missing file starts an empty registry.
    pub fn open(path: impl Into<PathBuf>, max_devices: usize, ack_every: u64) -> anyhow::Result<Self> {
        let path = path.into();
        let mut registry = Registry::new(max_devices, ack_every);

        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading registry {}", path.display()))?;
            let file: RegistryFile = serde_json::from_str(&contents)
                .with_context(|| format!("parsing registry {}", path.display()))?;
            registry.assignments = file
                .mac_to_id
                .into_iter()
                .map(|(hwid, id)| (hwid, DeviceId(id)))
                .collect();
            registry.next_id = registry
                .assignments
                .values()
                .map(|id| id.0)
                .max()
                .unwrap_or(0)
                + 1;
            registry.heartbeats = registry.assignments.values().map(|id| (*id, 0)).collect();
            info!(
                "[REGISTRY] Loaded {} device(s). Next ID: {}",
                registry.assignments.len(),
                registry.next_id
            );
        }

        registry.path = Some(path);
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn get(&self, hwid: &str) -> Option<DeviceId> {
        self.assignments.get(hwid).copied()
    }

    pub fn register(&mut self, hwid: &str) -> anyhow::Result<Admission> {
        if let Some(id) = self.get(hwid) {
            return Ok(Admission::Known(id));
        }
        if self.assignments.len() >= self.max_devices {
            return Ok(Admission::Full);
        }

        let id = DeviceId(self.next_id);
        let mut assignments = self.assignments.clone();
        assignments.insert(hwid.to_string(), id);
        // Nothing is committed in memory unless it reached the disk.
        self.save(&assignments)?;

        self.assignments = assignments;
        self.next_id += 1;
        self.heartbeats.insert(id, 0);
        Ok(Admission::Assigned(id))
    }

    /// Count a heartbeat from `id`; returns whether it should be acked.
    /// Ids that were never assigned are neither counted nor acked.
    pub fn record_heartbeat(&mut self, id: DeviceId) -> bool {
        let Some(count) = self.heartbeats.get_mut(&id) else {
            debug!("[REGISTRY] Heartbeat from unassigned ID {}", id);
            return false;
        };
        *count += 1;
        *count % self.ack_every == 0
    }

    fn save(&self, assignments: &BTreeMap<String, DeviceId>) -> anyhow::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        write_registry(path, assignments)?;
        debug!("[REGISTRY] Saved device assignments to {}", path.display());
        Ok(())
    }
}

fn write_registry(path: &Path, assignments: &BTreeMap<String, DeviceId>) -> anyhow::Result<()> {
    let file = RegistryFile {
        mac_to_id: assignments
            .iter()
            .map(|(hwid, id)| (hwid.clone(), id.0))
            .collect(),
    };
    let contents = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, contents)
        .with_context(|| format!("writing registry {}", path.display()))
}
