//! The server extension: a persisted `apps` table mirroring whichever
//! sessions are currently connected, keyed by `App::key()`.

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::error::TableError;
use crate::event_bus::BoxFuture;
use crate::extensions::table::{ServerTable, TableExtension};
use crate::extensions::ServerListener;
use crate::session::Session;
use crate::wire::{App, TableInfo};

fn apps_table_info() -> TableInfo {
    TableInfo { extension: "server".into(), name: "apps".into(), use_database: false, cache: false, cache_size: None }
}

/// Keeps a `server:apps` table in sync with live connections: one entry per
/// connected session, added on connect and removed on disconnect.
pub struct ServerExtension {
    apps_table: Arc<ServerTable<App>>,
}

impl ServerExtension {
    pub async fn new(data_path: &Path, table_ext: Arc<TableExtension>) -> Result<Arc<Self>, TableError> {
        let apps_table = ServerTable::new(apps_table_info(), data_path)?;
        table_ext.register_existing(apps_table.clone()).await;
        Ok(Arc::new(Self { apps_table }))
    }

    pub fn apps_table(&self) -> Arc<ServerTable<App>> {
        self.apps_table.clone()
    }

    pub async fn on_connected(&self, session: Arc<Session>) {
        let app = session.app();
        if let Err(err) = self.apps_table.add_one(app.key(), app).await {
            warn!(error = %err, "failed to record connected app");
        }
    }

    pub async fn on_session_disconnected(&self, session: Arc<Session>) {
        if let Err(err) = self.apps_table.remove_one(&session.key()).await {
            warn!(error = %err, "failed to remove disconnected app");
        }
    }
}

impl ServerListener for ServerExtension {
    /// A restarted hub has no ghost entries for sessions that died with the
    /// previous process, so the table is cleared immediately after load,
    /// before any client has had a chance to reconnect.
    fn on_initialized<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.apps_table.load().await {
                warn!(error = %err, "failed to load apps table");
            }
            if let Err(err) = self.apps_table.clear().await {
                warn!(error = %err, "failed to clear apps table on startup");
            }
        })
    }

    fn on_shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.apps_table.save().await {
                warn!(error = %err, "failed to save apps table on shutdown");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::extensions::endpoint::EndpointExtension;

    fn test_app(name: &str) -> App {
        App { name: name.into(), group: "g".into(), version: "1".into() }
    }

    async fn new_extension() -> (Arc<ServerExtension>, tempfile::TempDir) {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let endpoint_ext = EndpointExtension::new(bus.clone(), dir.path()).unwrap();
        let table_ext = TableExtension::new(bus, dir.path().to_path_buf(), endpoint_ext).await;
        let server_ext = ServerExtension::new(dir.path(), table_ext).await.unwrap();
        (server_ext, dir)
    }

    #[tokio::test]
    async fn connect_then_disconnect_round_trips_through_apps_table() {
        let (ext, _dir) = new_extension().await;
        let (session, _rx) = Session::new_for_test(test_app("a"));

        ext.on_connected(session.clone()).await;
        assert_eq!(ext.apps_table().get("g/a").await.unwrap(), Some(test_app("a")));

        ext.on_session_disconnected(session).await;
        assert_eq!(ext.apps_table().get("g/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn on_initialized_clears_any_previously_persisted_entries() {
        let (ext, _dir) = new_extension().await;
        ext.apps_table().add_one("g/stale".into(), test_app("stale")).await.unwrap();
        ext.apps_table().save().await.unwrap();

        ext.on_initialized().await;

        assert_eq!(ext.apps_table().size().await.unwrap(), 0);
    }
}
