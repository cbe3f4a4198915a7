//! Configuration schema definitions.

use serde::{Deserialize, Serialize};

use crate::loader::ConfigLoader;

mod schema_fleet;
mod schema_process;

pub use schema_fleet::*;
pub use schema_process::*;

/// Shared default helper used by submodules.
pub(crate) fn default_true() -> bool {
    true
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodefleetConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub blocking: BlockingConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub features: FeaturesConfig,
}

impl NodefleetConfig {
    /// Expand `~` in every configured path.
    pub fn expand_paths(&mut self) {
        for path in [
            &mut self.daemon.pid_file,
            &mut self.daemon.log_dir,
            &mut self.images.store_dir,
            &mut self.images.mount_dir,
            &mut self.images.lock_file,
            &mut self.services.exports_file,
            &mut self.features.spec_file,
        ] {
            *path = ConfigLoader::expand_path(path);
        }
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
