//! Composition root: wires the network, event bus, and extensions together
//! and drives the `start`/`shutdown` lifecycle described in the server
//! design notes.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::ServerError;
use crate::event_bus::EventBus;
use crate::extensions::endpoint::EndpointExtension;
use crate::extensions::server_ext::ServerExtension;
use crate::extensions::table::TableExtension;
use crate::extensions::{ExtensionRegistry, ServerListener};
use crate::network::Network;
use crate::wire::Address;

/// A running (or not-yet-started) hub: one [`Network`] listener, one
/// [`EventBus`], and the three built-in extensions.
///
/// Extensions are registered into `registry` in the order the spec gives
/// their dependency chain — Endpoint, Table, Server — so a later one can
/// `registry.get::<T>()` an earlier one. Lifecycle listeners fire in a
/// *different* order — Table before Endpoint — because `TableExtension`'s
/// `on_initialized` must load every table from disk before
/// `EndpointExtension`'s reconciles its locally-bound endpoints into the
/// now-shared `endpoints` table; loading after that reconciliation would
/// silently clobber the freshly-registered entries with stale disk state.
pub struct Server {
    pub address: Address,
    pub network: Arc<Network>,
    pub bus: Arc<EventBus>,
    pub registry: ExtensionRegistry,
    listeners: Vec<Arc<dyn ServerListener>>,
}

impl Server {
    pub async fn new(config: &Config) -> Result<Self, ServerError> {
        let bus = Arc::new(EventBus::new());
        let network = Network::new(config.address.clone(), bus.clone());

        let endpoint_ext = EndpointExtension::new(bus.clone(), &config.data_path)?;
        let table_ext = TableExtension::new(bus.clone(), config.data_path.clone(), endpoint_ext.clone()).await;
        endpoint_ext.register_endpoints_table(&table_ext).await;
        let server_ext = ServerExtension::new(&config.data_path, table_ext.clone()).await?;

        let mut registry = ExtensionRegistry::new();
        registry.register(endpoint_ext.clone())?;
        registry.register(table_ext.clone())?;
        registry.register(server_ext.clone())?;

        let listeners: Vec<Arc<dyn ServerListener>> = vec![
            table_ext.clone() as Arc<dyn ServerListener>,
            endpoint_ext.clone() as Arc<dyn ServerListener>,
            server_ext.clone() as Arc<dyn ServerListener>,
        ];

        let connect_ext = server_ext.clone();
        network
            .add_connect_listener(Arc::new(move |session| {
                let ext = connect_ext.clone();
                Box::pin(async move { ext.on_connected(session).await })
            }))
            .await;

        let disconnect_ext = server_ext.clone();
        network
            .add_disconnect_listener(Arc::new(move |session| {
                let ext = disconnect_ext.clone();
                Box::pin(async move { ext.on_session_disconnected(session).await })
            }))
            .await;

        let purge_ext = endpoint_ext.clone();
        network
            .add_disconnect_listener(Arc::new(move |session| {
                let ext = purge_ext.clone();
                Box::pin(async move { ext.purge_caller(&session.key()).await })
            }))
            .await;

        Ok(Self { address: config.address.clone(), network, bus, registry, listeners })
    }

    /// Binds the listener, then runs every extension's `on_initialized` in
    /// dependency order (Table, Endpoint, Server — see the struct docs).
    /// Returns the bound address, which may differ from `self.address` when
    /// the configured port is `0`.
    pub async fn start(&self) -> Result<std::net::SocketAddr, ServerError> {
        let bound = self.network.clone().start().await.map_err(ServerError::Bind)?;
        for listener in &self.listeners {
            listener.on_initialized().await;
        }
        info!(address = %self.address, bound = %bound, "hub started");
        Ok(bound)
    }

    /// Runs every extension's `on_shutdown` in the same order as
    /// `on_initialized`, flushing every table before the process exits.
    pub async fn shutdown(&self) {
        for listener in &self.listeners {
            listener.on_shutdown().await;
        }
        info!("hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_wires_every_extension_into_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.address.port = 0;
        config.data_path = dir.path().to_path_buf();

        let server = Server::new(&config).await.unwrap();
        assert!(server.registry.get::<EndpointExtension>().is_some());
        assert!(server.registry.get::<TableExtension>().is_some());
        assert!(server.registry.get::<ServerExtension>().is_some());
    }
}
