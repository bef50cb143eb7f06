use std::collections::HashMap;
use std::sync::Arc;

use port_bus::PortHandle;
use wallet_proto::PortSessionId;

use super::pending::PendingSlot;

/// A tab's content-script connection, stamped at handshake time.
pub struct Connection {
    pub connection_id: String,
    pub tab_id: Option<u32>,
    pub page_authority: Option<String>,
    pub session_id: PortSessionId,
    pub port: Arc<PortHandle>,
}

/// A connection from the extension's own UI process. Not scoped to a tab;
/// paired with a [`Connection`] by equal page authority.
pub struct AppConnection {
    pub connection_id: String,
    pub page_authority: Option<String>,
    pub port: Arc<PortHandle>,
}

/// Everything the background worker holds. All of it is volatile (the
/// browser may tear the worker down between any two messages), so it is an
/// explicit value constructed per worker lifetime, never ambient state.
#[derive(Default)]
pub struct RouterState {
    pub connections: HashMap<String, Connection>,
    pub apps: HashMap<String, AppConnection>,
    pub pending: PendingSlot,
}

impl RouterState {
    pub fn connection_by_authority(&self, authority: &str) -> Option<&Connection> {
        self.connections
            .values()
            .find(|conn| conn.page_authority.as_deref() == Some(authority))
    }

    /// Drop every connection belonging to a closed tab, and the pending
    /// request if one of them owned it.
    pub fn remove_tab(&mut self, tab_id: u32) -> Vec<Connection> {
        let ids: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.tab_id == Some(tab_id))
            .map(|(id, _)| id.clone())
            .collect();
        let removed: Vec<Connection> = ids
            .iter()
            .filter_map(|id| self.connections.remove(id))
            .collect();
        if let Some(pending) = self.pending.current() {
            if removed
                .iter()
                .any(|conn| conn.connection_id == pending.connection_id)
            {
                self.pending.take();
            }
        }
        removed
    }
}
