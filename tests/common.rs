//! Test utilities & fixtures.
//! Builds a relay with loopback clients already connected.

use std::collections::HashMap;
use std::sync::Arc;

use friendrelay::config::Config;
use friendrelay::relay::{
    InMemoryPermissionStore, LoopbackClient, PermissionEdge, PermissionSet, PermissionStore,
    RelayServer,
};

pub struct Harness {
    pub server: RelayServer,
    pub store: Arc<InMemoryPermissionStore>,
    pub clients: HashMap<String, LoopbackClient>,
}

impl Harness {
    pub fn client(&self, code: &str) -> &LoopbackClient {
        &self.clients[code]
    }

    /// `issuer` lets `target` do everything in `set`.
    pub async fn grant(&self, issuer: &str, target: &str, set: PermissionSet) {
        self.store
            .update_single_permissions(PermissionEdge::allowing(issuer, target, set))
            .await
            .expect("grant");
    }

    #[allow(dead_code)] // not every test file adds clients late
    pub async fn connect(&mut self, code: &str) {
        let client = LoopbackClient::spawn(code, &format!("{code} Name"), "World");
        self.server
            .connect(code, Arc::new(client.connection()), &format!("{code} Name"), "World")
            .await
            .expect("connect");
        self.clients.insert(code.to_string(), client);
    }
}

/// Short deadlines so timeout paths finish quickly under paused time.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.relay.forward_timeout_ms = 200;
    config.relay.body_swap_query_timeout_ms = 200;
    config.relay.possession_timeout_ms = 200;
    config.logging.file = None;
    config.logging.security_file = None;
    config
}

pub async fn harness(online: &[&str]) -> Harness {
    harness_with(test_config(), online).await
}

pub async fn harness_with(config: Config, online: &[&str]) -> Harness {
    let store = Arc::new(InMemoryPermissionStore::new());
    let server = RelayServer::new(config, store.clone());
    let mut h = Harness {
        server,
        store,
        clients: HashMap::new(),
    };
    for code in online {
        h.connect(code).await;
    }
    h
}
