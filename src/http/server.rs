//! Gateway server: dependency wiring, router assembly, and the
//! bind/serve/shutdown lifecycle (§5, §6), grounded on the teacher's
//! `gateway::server::Gateway`/`gateway::router::create_router` split.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use ipnet::IpNet;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::authorize::handler::{self as authorize_handler, AuthorizeState};
use crate::config::Config;
use crate::crypto::CookieCipher;
use crate::external::{Alerter, LoggingAlerter};
use crate::oidc_provider::authorization::AuthorizationStore;
use crate::oidc_provider::clients::ClientRegistry;
use crate::oidc_provider::handler::{self as oidc_provider_handler, OidcProviderState};
use crate::oidc_provider::service::OidcProviderService;
use crate::oidc_provider::signing::SigningKey;
use crate::oidc_rp::handler::{self as oidc_rp_handler, OidcRpState};
use crate::oidc_rp::provider::{GithubProvider, OidcProvider, Provider};
use crate::store::db::{PostgresStore, RelationalStore};
use crate::store::docstore::{DocStore, PostgresDocStore};
use crate::store::kv::{KvStore, RedisKvStore};
use crate::store::ldap::LdapAdapter;
use crate::token::handler::{self as token_handler, TokenManagementState};
use crate::token::{TokenService, spawn_reaper};
use crate::userinfo::{IdCache, UserInfoService};
use crate::{Error, Result};

/// An assembled, not-yet-running gateway. Construction resolves every
/// `*_file`-indirected secret and opens every outbound connection up
/// front, so a misconfiguration fails at startup rather than on the first
/// request that happens to need the broken collaborator.
pub struct Gateway {
    config: Config,
    router: Router,
    token_service: Arc<TokenService>,
}

impl Gateway {
    /// Build the gateway from a validated [`Config`] (§6): load secrets,
    /// connect the key-value/relational/LDAP adapters, assemble every
    /// module's state, and merge their routers.
    ///
    /// # Errors
    ///
    /// Returns an error if a secret file cannot be read, a connection
    /// cannot be established, or the signing key cannot be loaded.
    pub async fn new(config: Config) -> Result<Self> {
        let redis_password = config
            .redis_password_file
            .as_deref()
            .map(Config::read_secret_file)
            .transpose()?;
        let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::connect(&config.redis_url, redis_password.as_deref()).await?);

        let db = Arc::new(PostgresStore::connect(&config.database_url).await?);
        let relational_store: Arc<dyn RelationalStore> = Arc::clone(&db);
        let docstore: Arc<dyn DocStore> = Arc::new(PostgresDocStore::new(db.pool()));

        let ldap = match &config.ldap {
            Some(ldap_config) => Some(Arc::new(LdapAdapter::new(ldap_config.clone())?)),
            None => None,
        };

        let id_cache = Arc::new(IdCache::new());
        let userinfo_service = Arc::new(UserInfoService::new(
            ldap,
            Some(docstore),
            id_cache,
            config.username_claim.clone(),
            config.uid_claim.clone(),
        ));

        let token_service = Arc::new(TokenService::new(
            Arc::clone(&kv),
            Arc::clone(&relational_store),
            config.token_lifetime,
            config.minimum_lifetime_floor,
        ));

        let session_secret = Config::read_secret_file(&config.session_secret_file)?;
        let cookie_cipher = CookieCipher::from_base64(&session_secret)?;

        let provider = Self::build_rp_provider(&config).await?;

        let alerter: Arc<dyn Alerter> = Arc::new(LoggingAlerter);

        let authorize_state = Arc::new(AuthorizeState {
            token_service: Arc::clone(&token_service),
            userinfo_service: Arc::clone(&userinfo_service),
            cookie_cipher: cookie_cipher.clone(),
            realm: config.realm.clone(),
            alerter: Arc::clone(&alerter),
        });

        let oidc_provider_state = Arc::new(OidcProviderState {
            service: Self::build_oidc_provider_service(&config, Arc::clone(&token_service), Arc::clone(&kv))?,
            cookie_cipher: cookie_cipher.clone(),
        });

        let oidc_rp_state = Arc::new(OidcRpState {
            provider,
            token_service: Arc::clone(&token_service),
            userinfo_service,
            db: Arc::clone(&relational_store),
            cookie_cipher: cookie_cipher.clone(),
            group_to_scopes: config.group_to_scopes(),
            initial_admins: config.initial_admins.clone(),
            after_logout_url: config.after_logout_url.clone(),
            alerter,
        });

        let token_management_state = Arc::new(TokenManagementState {
            token_service: Arc::clone(&token_service),
            cookie_cipher,
        });

        let app = Router::new()
            .merge(authorize_handler::routes(authorize_state))
            .merge(oidc_provider_handler::routes(oidc_provider_state))
            .merge(oidc_rp_handler::routes(oidc_rp_state))
            .merge(token_handler::routes(token_management_state));

        let router = Self::with_middleware(app, &config);

        Ok(Self { config, router, token_service })
    }

    async fn build_rp_provider(config: &Config) -> Result<Provider> {
        match (&config.github, &config.oidc) {
            (Some(github), None) => {
                let secret = Config::read_secret_file(&github.client_secret_file)?;
                Ok(Provider::Github(GithubProvider::new(
                    github.clone(),
                    secret,
                    config.username_claim.clone(),
                    config.uid_claim.clone(),
                )))
            }
            (None, Some(oidc)) => {
                let secret = Config::read_secret_file(&oidc.client_secret_file)?;
                Ok(Provider::Oidc(OidcProvider::new(oidc.clone(), secret)))
            }
            _ => Err(Error::Config(
                "exactly one of `github` or `oidc` must be configured".to_string(),
            )),
        }
    }

    fn build_oidc_provider_service(config: &Config, tokens: Arc<TokenService>, kv: Arc<dyn KvStore>) -> Result<OidcProviderService> {
        let clients = match &config.oidc_server_secrets_file {
            Some(path) => ClientRegistry::load(path)?,
            None => ClientRegistry::empty(),
        };
        let signing = SigningKey::load(&config.issuer.key_file, &config.issuer.key_id)?;
        let known_scopes: Vec<String> = config.known_scopes.keys().cloned().collect();

        Ok(OidcProviderService::new(
            clients,
            AuthorizationStore::new(kv),
            signing,
            tokens,
            config.issuer.clone(),
            known_scopes,
        ))
    }

    fn with_middleware(app: Router, config: &Config) -> Router {
        let proxies: Arc<Vec<IpNet>> = Arc::new(config.proxies.clone());
        app.layer(axum::middleware::from_fn_with_state(proxies, crate::http::trusted_proxy::middleware))
            .layer(CatchPanicLayer::new())
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::new(config.server.request_timeout))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the gateway until a shutdown signal arrives, then drain
    /// in-flight requests for up to `server.shutdown_timeout` (§5).
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid server.host/port: {e}")))?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let reaper = spawn_reaper(
            Arc::clone(&self.token_service),
            self.config.reaper_interval,
            self.config.history_retention,
            shutdown_tx.subscribe(),
        );

        let listener = TcpListener::bind(addr).await?;
        info!(host = %self.config.server.host, port = self.config.server.port, realm = %self.config.realm, "gafaelfawr-rs listening");

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Err(error) = reaper.await {
            warn!(%error, "token reaper task did not shut down cleanly");
        }

        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}
