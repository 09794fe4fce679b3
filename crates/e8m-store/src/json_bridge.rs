use std::fs;
use std::path::Path;

use e8m_core::{EngineConfig, MemoryStore, Snapshot, export_json, import_json};

use crate::error::Result;
use crate::store::Store;

impl Store {
    /// Import a snapshot JSON file, replacing the stored engine state.
    pub fn import_json_file(&self, path: &Path) -> Result<Snapshot> {
        let json = fs::read_to_string(path)?;
        self.import_json_str(&json)
    }

    /// Import a snapshot JSON string, replacing the stored engine state.
    pub fn import_json_str(&self, json: &str) -> Result<Snapshot> {
        let snapshot = import_json(json)?;
        // Reject snapshots the engine could not resume from before touching the DB.
        MemoryStore::restore(EngineConfig::default(), &snapshot)?;
        self.save_snapshot(&snapshot)?;
        tracing::info!(nodes = snapshot.nodes.len(), "snapshot imported");
        Ok(snapshot)
    }

    /// Export the stored engine state to a JSON file. Returns `false` when
    /// there is nothing to export.
    pub fn export_json_file(&self, path: &Path) -> Result<bool> {
        match self.export_json_string()? {
            Some(json) => {
                fs::write(path, json)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn export_json_string(&self) -> Result<Option<String>> {
        self.load_snapshot()?
            .map(|snapshot| export_json(&snapshot).map_err(Into::into))
            .transpose()
    }
}
