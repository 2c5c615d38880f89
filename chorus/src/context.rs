use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use chorus_protocol::control::PeerDescriptor;

use crate::config::Config;
use crate::peer::manager::PeerManager;
use crate::peer::PeerHandle;

/// Everything a running node hangs off: configuration, the peer
/// manager, and the local peer. Passed explicitly wherever it is
/// needed; there are no global singletons.
pub struct Context {
    config: Config,
    manager: Arc<PeerManager>,
}

impl Context {
    /// Builds a context with a freshly minted identity. Embedders that
    /// persist the stable uuid across restarts use
    /// [`Context::with_identity`] instead.
    pub fn new(config: Config) -> Context {
        let descriptor = PeerDescriptor {
            uuid: Uuid::new_v4(),
            instance_uuid: Uuid::new_v4(),
            name: config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capacities: vec![],
        };

        Context::with_identity(config, descriptor)
    }

    pub fn with_identity(config: Config, descriptor: PeerDescriptor) -> Context {
        let timeout = Duration::from_millis(config.no_response_timeout_ms);
        let manager = PeerManager::new(descriptor, timeout);

        Context { config, manager }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<PeerManager> {
        &self.manager
    }

    pub fn local_peer(&self) -> &PeerHandle {
        self.manager.local()
    }
}
