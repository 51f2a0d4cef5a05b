//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stride_common::config::{load_config, OrchestratorConfig};
use stride_orchestrator::AdminService;
use stride_store::{FileStore, StoreManager, TimeoutStore};
use tracing::debug;

use crate::{Error, Result};

pub mod goal_state;
pub mod init;
pub mod status;
pub mod upgrade;

/// Configuration and store access shared by the commands
pub struct Environment {
    pub config: OrchestratorConfig,
    pub admin: AdminService,
}

impl Environment {
    /// Load configuration and open the record store under the data root
    pub fn open(config_path: Option<&Path>, data_root: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => load_config(path)?,
            None => OrchestratorConfig::default(),
        };
        if let Some(root) = data_root {
            config.data_root = root;
        }

        let root = config.data_root.join("store");
        debug!(root = %root.display(), "opening record store");
        let store = TimeoutStore::new(FileStore::open(root)?, config.store_timeout());
        let admin = AdminService::new(StoreManager::new(Arc::new(store), config.retry.clone()));
        Ok(Self { config, admin })
    }
}

/// Read a whole file, naming it in the error
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Input {
        path: path.to_path_buf(),
        source,
    })
}
