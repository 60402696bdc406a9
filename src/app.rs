//! Application Wiring
//!
//! Builds every service from configuration over one set of stores.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{
    AuthConfig, AuthService, CodeDelivery, InlineDelivery, LogDelivery, OtpChallenge, SessionCoordinator,
    SessionRepository, SessionSweeper, TokenError, TokenService,
};
use crate::contest::{
    ContestJoinHandler, GameSeeder, JoinRepository, MatchNotifier, MatchmakingConfig, MatchmakingScheduler,
    OpponentService,
};
use crate::core::Clock;
use crate::network::ServerConfig;
use crate::store::{timed_table, CacheStore, MemoryCache, MemoryTable, SharedTable, StoreConfig, StoreError, Timed};

/// Full application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Transport.
    pub server: ServerConfig,
    /// Authentication.
    pub auth: AuthConfig,
    /// Matchmaking.
    pub matchmaking: MatchmakingConfig,
    /// Storage.
    pub store: StoreConfig,
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            auth: AuthConfig::from_env(),
            matchmaking: MatchmakingConfig::from_env(),
            store: StoreConfig::from_env(),
        }
    }
}

/// Every request-facing service plus the background workers.
pub struct Services {
    /// Login and verification.
    pub auth: Arc<AuthService>,
    /// Per-request authorization, restore and logout.
    pub sessions: Arc<SessionCoordinator>,
    /// Contest joins.
    pub joins: Arc<ContestJoinHandler>,
    /// Opponent lookup and cancellation.
    pub opponents: Arc<OpponentService>,
    /// Pairing loop.
    pub scheduler: Arc<MatchmakingScheduler>,
    /// Expired session cleanup.
    pub sweeper: Arc<SessionSweeper>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

fn table<K, V>(after: Duration) -> SharedTable<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    timed_table(MemoryTable::<K, V>::new(), after)
}

impl Services {
    /// Wire the services over in-memory tables and `cache`.
    pub fn build(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        cache: Arc<dyn CacheStore>,
        notifier: Arc<dyn MatchNotifier>,
    ) -> Result<Self, TokenError> {
        let t = config.store.op_timeout;

        let tokens = Arc::new(TokenService::new(&config.auth, clock.clone())?);
        let repo = Arc::new(SessionRepository::new(table(t), table(t), cache, clock.clone()));
        let sessions = Arc::new(SessionCoordinator::new(repo.clone(), tokens.clone(), clock.clone()));

        let delivery: Arc<dyn CodeDelivery> = if config.auth.inline_code_delivery {
            warn!("One-time codes are returned inline; disable OTP_INLINE_DELIVERY in production");
            Arc::new(InlineDelivery)
        } else {
            Arc::new(LogDelivery)
        };
        let challenges: SharedTable<String, OtpChallenge> = table(t);
        let auth = Arc::new(AuthService::new(
            config.auth.clone(),
            table(t),
            challenges.clone(),
            sessions.clone(),
            tokens,
            delivery,
            clock.clone(),
        ));
        let sweeper = Arc::new(SessionSweeper::new(
            repo,
            challenges,
            clock.clone(),
            config.auth.sweep_interval,
            config.auth.sweep_batch,
        ));

        let join_repo = Arc::new(JoinRepository::new(table(t), table(t)));
        let seeder = Arc::new(GameSeeder::new(table(t), clock.clone()));
        let scheduler = Arc::new(MatchmakingScheduler::new(
            config.matchmaking.clone(),
            join_repo.clone(),
            table(t),
            table(t),
            seeder.clone(),
            notifier,
            clock.clone(),
        ));
        let joins = Arc::new(
            ContestJoinHandler::new(join_repo.clone(), clock.clone()).with_trigger(scheduler.run_now_handle()),
        );
        let opponents = Arc::new(OpponentService::new(join_repo, seeder, clock.clone()));

        Ok(Self { auth, sessions, joins, opponents, scheduler, sweeper, clock })
    }
}

/// Open the cache tier named by `config`, bounded by the store timeout.
pub async fn connect_cache(config: &StoreConfig) -> Result<Arc<dyn CacheStore>, StoreError> {
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &config.redis_url {
        let redis = crate::store::redis::RedisCache::connect(url, "dice-duel").await?;
        info!("Session cache: redis");
        return Ok(Arc::new(Timed::new(Arc::new(redis), config.op_timeout)));
    }

    #[cfg(not(feature = "redis-backend"))]
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis-backend feature is off; using the in-memory cache");
    }

    info!("Session cache: in-memory");
    Ok(Arc::new(Timed::new(Arc::new(MemoryCache::new()), config.op_timeout)))
}
