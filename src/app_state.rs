use std::sync::Arc;

use crate::{
    auth::AuthVerifier,
    config::Config,
    rate_limit::RateLimiter,
    services::{
        AiProvider, ConnectionService, EventService, HttpAiProvider, MatchService,
        MessagingService, UserService,
    },
    store::MeetStore,
    sync::SyncOrchestrator,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MeetStore>,
    pub users: UserService,
    pub events: EventService,
    pub connections: ConnectionService,
    pub messaging: MessagingService,
    pub matching: MatchService,
    pub sync: SyncOrchestrator,
    pub auth: AuthVerifier,
    pub limiter: RateLimiter,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let provider: Arc<dyn AiProvider> = Arc::new(HttpAiProvider::new(&config.ai));
        Self::with_provider(config, provider).await
    }

    /// Construction seam: tests inject a deterministic provider here.
    pub async fn with_provider(
        config: Config,
        provider: Arc<dyn AiProvider>,
    ) -> anyhow::Result<Self> {
        let store = MeetStore::new(&config.database.url, config.cache.capacity).await?;
        store.init().await?;
        let store = Arc::new(store);

        let users = UserService::new(store.clone());
        let events = EventService::new(store.clone());
        let connections = ConnectionService::new(store.clone());
        let messaging = MessagingService::new(store.clone());
        let matching = MatchService::new(store.clone(), provider, config.ai.embed_concurrency);
        let sync = SyncOrchestrator::new(store.clone(), events.clone(), users.clone());
        let auth = AuthVerifier::new(&config.auth.jwt_secret);

        let limiter = RateLimiter::new(&config.rate_limit);

        Ok(Self {
            store,
            users,
            events,
            connections,
            messaging,
            matching,
            sync,
            auth,
            limiter,
            config,
        })
    }
}
