//! Process wiring.
//!
//! [`App`] builds every component from a finalized [`ServerConfig`] and binds
//! all sockets up front, so a port that cannot be bound is a startup error.
//! [`App::run`] then spawns one task per listener plus the background tasks
//! and waits for shutdown.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ricochet_config::{ConfigError, SecurityPolicy, ServerConfig};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::acme::{
    AcmeClient, AcmeCoordinator, AcmeError, CertificateStorage, ChallengePublisher,
    PropagationCheck, RenewalScheduler,
};
use crate::auth::{AuthError, AuthGate};
use crate::capture::{CaptureSink, Listener, ListenerError, PostProcessor};
use crate::companion::CompanionTail;
use crate::dns::{DnsAnswerer, DnsListener, TxtRecordCell};
use crate::http::{HttpHandler, HttpListener};
use crate::metrics::{MetricsError, ServerMetrics};
use crate::shutdown::ShutdownCoordinator;
use crate::smtp::SmtpListener;
use crate::store::{EvictionSweeper, Store, StoreError, StoreHooks};
use crate::tls::{self, CertificateResolver, TlsError};
use crate::zone::ZoneMatcher;

/// Default bound on waiting for in-flight captures at shutdown
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fatal startup errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("metrics setup failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("DNS zone setup failed: {0}")]
    Zone(#[from] hickory_proto::error::ProtoError),
}

/// Addresses the listeners actually bound
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub dns: SocketAddr,
    pub http: SocketAddr,
    pub https: Option<SocketAddr>,
    pub smtp: SocketAddr,
    pub smtps: Option<SocketAddr>,
}

/// Builder for [`App`]
pub struct AppBuilder {
    config: ServerConfig,
    post: Option<Arc<dyn PostProcessor>>,
    hooks: Option<Arc<dyn StoreHooks>>,
    drain_timeout: Duration,
}

impl AppBuilder {
    /// Extension stage run after every stored interaction
    pub fn with_post_processor(mut self, post: Arc<dyn PostProcessor>) -> Self {
        self.post = Some(post);
        self
    }

    /// Callbacks for auxiliary per-id state kept by the post-processor
    pub fn with_store_hooks(mut self, hooks: Arc<dyn StoreHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Validate the configuration, build every component and bind every
    /// listener. No network call to the certificate authority happens here.
    pub async fn build(self) -> Result<App, AppError> {
        let config = self.config.finalize()?;
        for warning in config.warnings() {
            warn!("{}", warning.message);
        }

        let policy = SecurityPolicy::from_config(&config);
        let gate = AuthGate::from_policy(&policy)?;

        let mut store = Store::builder(config.eviction()).global_token(gate.token().cloned());
        if let Some(hooks) = self.hooks {
            store = store.hooks(hooks);
        }
        let store = Arc::new(store.build());
        gate.install(&store)?;

        let zone = ZoneMatcher::new(config.domain.clone(), config.root_tld);
        if config.root_tld {
            store.register_persistent(&zone.domain_id(), None)?;
            info!(domain = %zone.domain(), "Root-TLD interactions enabled");
        }

        let metrics = ServerMetrics::new()?;
        let shutdown = ShutdownCoordinator::new(self.drain_timeout);

        let mut sink = CaptureSink::new(Arc::clone(&store))
            .with_fallback(gate.token_bucket())
            .with_metrics(metrics.clone())
            .with_shutdown(shutdown.clone());
        if let Some(post) = self.post {
            sink = sink.with_post_processor(post);
        }

        // DNS first: the ACME coordinator publishes challenges through it
        let txt = TxtRecordCell::new();
        let answerer = DnsAnswerer::new(
            zone.clone(),
            config.public_ip,
            &config.hostmaster,
            Arc::clone(&txt),
        )?;
        let dns = DnsListener::bind(
            config.listen_addr(config.ports.dns),
            answerer,
            txt,
            sink.clone(),
        )
        .await?;
        let dns_addr = dns.local_addr();

        let resolver = CertificateResolver::new();
        let coordinator = build_coordinator(
            &config,
            &zone,
            ChallengePublisher::new(dns.txt_handle()),
            Arc::clone(&resolver),
            dns_addr,
            &metrics,
        );

        let handler = Arc::new(
            HttpHandler::new(sink.clone(), zone.clone(), gate.clone(), &config.origin_url)
                .with_metrics(metrics.clone()),
        );
        let http = HttpListener::bind(
            config.listen_addr(config.ports.http),
            Arc::clone(&handler),
            sink.clone(),
        )
        .await?;

        let zone = Arc::new(zone);
        let smtp = SmtpListener::bind(
            config.listen_addr(config.ports.smtp),
            Arc::clone(&zone),
            sink.clone(),
        )
        .await?;

        let mut addrs = BoundAddrs {
            dns: dns_addr,
            http: http.local_addr(),
            https: None,
            smtp: smtp.local_addr(),
            smtps: None,
        };
        let mut listeners: Vec<Box<dyn Listener>> =
            vec![Box::new(dns), Box::new(http), Box::new(smtp)];

        // TLS listeners exist whenever a certificate is or may become available
        if config.acme.enabled || resolver.is_ready() {
            let https = HttpListener::bind_tls(
                config.listen_addr(config.ports.https),
                handler,
                tls::server_config(Arc::clone(&resolver), &[b"http/1.1".as_slice()])?,
                sink.clone(),
            )
            .await?;
            let smtps = SmtpListener::bind_tls(
                config.listen_addr(config.ports.smtps),
                Arc::clone(&zone),
                tls::server_config(Arc::clone(&resolver), &[])?,
                sink.clone(),
            )
            .await?;
            addrs.https = Some(https.local_addr());
            addrs.smtps = Some(smtps.local_addr());
            listeners.push(Box::new(https));
            listeners.push(Box::new(smtps));
        } else {
            warn!("No certificate available and ACME disabled, serving plaintext only");
        }

        let scheduler = coordinator
            .filter(|_| config.acme.enabled)
            .map(|c| RenewalScheduler::new(c, config.acme.renew_before_days));

        let companion = match &config.companion {
            Some(companion) => Some(
                CompanionTail::new(companion.mode, companion.log_path.clone(), sink.clone())
                    .await,
            ),
            None => None,
        };

        let sweeper = EvictionSweeper::new(Arc::clone(&store)).with_metrics(metrics.clone());

        info!(
            domain = %config.domain,
            dns = %addrs.dns,
            http = %addrs.http,
            smtp = %addrs.smtp,
            tls = addrs.https.is_some(),
            auth_required = gate.required(),
            eviction_days = config.eviction_days,
            "Listeners bound"
        );

        Ok(App {
            store,
            gate,
            metrics,
            shutdown,
            resolver,
            addrs,
            listeners,
            scheduler,
            companion,
            sweeper,
        })
    }
}

/// A fully wired server, ready to run
pub struct App {
    store: Arc<Store>,
    gate: AuthGate,
    metrics: ServerMetrics,
    shutdown: ShutdownCoordinator,
    resolver: Arc<CertificateResolver>,
    addrs: BoundAddrs,
    listeners: Vec<Box<dyn Listener>>,
    scheduler: Option<RenewalScheduler>,
    companion: Option<CompanionTail>,
    sweeper: EvictionSweeper,
}

impl App {
    pub fn builder(config: ServerConfig) -> AppBuilder {
        AppBuilder {
            config,
            post: None,
            hooks: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    pub fn tls_ready(&self) -> bool {
        self.resolver.is_ready()
    }

    /// Handle used to trigger and observe shutdown
    pub fn shutdown(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Serve until shutdown is requested, then stop accepting and drain.
    pub async fn run(self) {
        let token = self.shutdown.token();
        let mut tasks = JoinSet::new();

        for listener in self.listeners {
            let protocol = listener.protocol();
            let addr = listener.local_addr();
            let token = token.clone();
            tasks.spawn(async move {
                if let Err(e) = listener.run(token).await {
                    error!(protocol = %protocol, addr = %addr, error = %e, "Listener failed");
                }
            });
        }

        tasks.spawn(self.sweeper.run(token.clone()));
        if let Some(companion) = self.companion {
            tasks.spawn(companion.run(token.clone()));
        }

        // Issuance can outlast the drain window; it is aborted, not awaited
        let scheduler = self
            .scheduler
            .map(|scheduler| tokio::spawn(scheduler.run(token.clone())));

        info!("Ricochet started");
        token.cancelled().await;

        if let Some(scheduler) = scheduler {
            scheduler.abort();
        }
        while tasks.join_next().await.is_some() {}

        self.shutdown.wait_for_drain().await;
        info!(stats = ?self.store.stats(), "Ricochet stopped");
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("addrs", &self.addrs)
            .field("auth_required", &self.gate.required())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Build the ACME coordinator and install any stored certificate.
///
/// Storage problems disable TLS rather than aborting startup.
fn build_coordinator(
    config: &ServerConfig,
    zone: &ZoneMatcher,
    publisher: ChallengePublisher,
    resolver: Arc<CertificateResolver>,
    dns_addr: SocketAddr,
    metrics: &ServerMetrics,
) -> Option<Arc<AcmeCoordinator>> {
    let storage = match CertificateStorage::new(&config.acme.storage_path) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            warn!(
                path = %config.acme.storage_path.display(),
                error = %e,
                "Certificate storage unavailable, TLS disabled"
            );
            return None;
        }
    };

    let directory = config.acme.directory();
    let client = AcmeClient::new(directory, &config.hostmaster, Arc::clone(&storage));
    let coordinator = AcmeCoordinator::new(Arc::new(client), publisher, resolver, zone.domain())
        .with_storage(storage, directory)
        .with_validation_timeout(config.acme.validation_timeout())
        .with_propagation_check(PropagationCheck::new(
            loopback_for(dns_addr),
            &zone.acme_challenge_name(),
        ))
        .with_metrics(metrics.clone());

    match coordinator.install_stored() {
        Ok(_) => {}
        Err(AcmeError::Storage(e)) => warn!(error = %e, "Could not read stored certificate"),
        Err(e) => warn!(error = %e, "Stored certificate unusable"),
    }
    Some(Arc::new(coordinator))
}

/// Address that reaches a listener bound to `addr` from this host
fn loopback_for(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
