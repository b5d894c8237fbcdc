//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::directory::DirectoryService;
use crate::ws::{ChatHub, HubConfig};

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Room connection hub.
    pub hub: Arc<ChatHub>,
    /// Users and registered rooms.
    pub directory: Arc<DirectoryService>,
    /// Token issue and validation.
    pub auth: AuthState,
}

impl AppState {
    /// Wire the hub to the directory and bundle everything for the router.
    pub fn new(hub_config: HubConfig, directory: DirectoryService, auth: AuthState) -> Self {
        let directory = Arc::new(directory);
        let hub = ChatHub::new(hub_config).with_directory(directory.clone());
        Self {
            hub: Arc::new(hub),
            directory,
            auth,
        }
    }
}
