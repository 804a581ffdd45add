//! Shared application state

use std::sync::Arc;
use tokio::task::JoinHandle;

use parley_shared::Store;

use crate::auth::{IdentityResolver, JwtIdentityResolver, JwtManager};
use crate::config::Config;
use crate::websocket::{durability, presence, Gateway, MessageRouter, PresenceHandle, TypingRelay};

/// Lifetime of credentials minted by [`JwtManager::issue`]
pub const CREDENTIAL_TTL_HOURS: i64 = 24;

/// State shared by every request handler and connection
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub gateway: Arc<Gateway>,
    pub presence: PresenceHandle,
    pub router: Arc<MessageRouter>,
    pub typing: Arc<TypingRelay>,
}

/// Background actors started alongside the state
pub struct BackgroundTasks {
    pub presence: JoinHandle<()>,
    pub durability: JoinHandle<()>,
}

impl AppState {
    /// Wire up the gateway with JWT credentials and start its actors
    pub fn start(config: Config, store: Arc<dyn Store>) -> (Self, BackgroundTasks) {
        let jwt = JwtManager::new(&config.jwt_secret, CREDENTIAL_TTL_HOURS);
        let resolver = Arc::new(JwtIdentityResolver::new(jwt, Arc::clone(&store)));
        Self::with_resolver(config, store, resolver)
    }

    pub fn with_resolver(
        config: Config,
        store: Arc<dyn Store>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> (Self, BackgroundTasks) {
        let gateway = Arc::new(Gateway::new());

        let (presence, presence_task) =
            presence::spawn(config.presence(), Arc::clone(&gateway), Arc::clone(&store));
        let (durability, durability_task) =
            durability::spawn(config.durability(), Arc::clone(&store), Arc::clone(&gateway));

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&gateway),
            durability,
            config.message_limits(),
        ));
        let typing = Arc::new(TypingRelay::new(Arc::clone(&gateway)));

        let state = Self {
            config: Arc::new(config),
            store,
            resolver,
            gateway,
            presence,
            router,
            typing,
        };
        let tasks = BackgroundTasks {
            presence: presence_task,
            durability: durability_task,
        };
        (state, tasks)
    }
}
