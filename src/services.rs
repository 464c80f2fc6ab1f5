use std::sync::Arc;

use crate::{
    backup::BackupManager,
    catalog::MockResponseCatalog,
    config::{Config, NetworkConfig, SharedNetworkConfig},
    connection::ConnectionManager,
    network_log::NetworkRecorder,
    store::RecordStore,
};

/// Every component of the mock layer, wired to one connection manager.
#[derive(Debug, Clone)]
pub struct MockServices {
    pub store: RecordStore,
    pub catalog: MockResponseCatalog,
    pub recorder: NetworkRecorder,
    pub backup: BackupManager,
    network: SharedNetworkConfig,
}

impl MockServices {
    pub fn new(connections: Arc<ConnectionManager>, network: SharedNetworkConfig) -> Self {
        let store = RecordStore::new(connections);
        let catalog = MockResponseCatalog::new(store.clone());
        let recorder = NetworkRecorder::new(store.clone(), catalog.clone(), Arc::clone(&network));
        let backup = BackupManager::new(store.clone());
        Self {
            store,
            catalog,
            recorder,
            backup,
            network,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ConnectionManager::from_config(&config.storage)),
            config.shared_network(),
        )
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.store.connections()
    }

    pub fn network(&self) -> &SharedNetworkConfig {
        &self.network
    }

    /// Snapshot of the network flags at this instant.
    pub fn network_flags(&self) -> NetworkConfig {
        self.network
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
