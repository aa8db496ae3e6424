//! SMTP and implicit-TLS SMTP listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ricochet_common::Protocol;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::session::SmtpSession;
use crate::capture::{accept_failed, contain, CaptureSink, Listener, ListenerError};
use crate::zone::ZoneMatcher;

/// Time allowed for a TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SmtpListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    zone: Arc<ZoneMatcher>,
    tls: Option<TlsAcceptor>,
    sink: CaptureSink,
}

impl SmtpListener {
    pub async fn bind(
        addr: SocketAddr,
        zone: Arc<ZoneMatcher>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        Self::bind_inner(addr, zone, None, sink).await
    }

    /// Bind a listener that performs the TLS handshake before the greeting
    pub async fn bind_tls(
        addr: SocketAddr,
        zone: Arc<ZoneMatcher>,
        config: Arc<rustls::ServerConfig>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        Self::bind_inner(addr, zone, Some(TlsAcceptor::from(config)), sink).await
    }

    async fn bind_inner(
        addr: SocketAddr,
        zone: Arc<ZoneMatcher>,
        tls: Option<TlsAcceptor>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                protocol: Protocol::Smtp,
                addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ListenerError::io(Protocol::Smtp, e))?;

        info!(addr = %local_addr, tls = tls.is_some(), "SMTP listener bound");

        Ok(Self {
            listener,
            local_addr,
            zone,
            tls,
            sink,
        })
    }
}

#[async_trait]
impl Listener for SmtpListener {
    fn protocol(&self) -> Protocol {
        Protocol::Smtp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ListenerError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "SMTP listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        accept_failed(Protocol::Smtp, &e, &shutdown).await;
                        continue;
                    }
                },
            };

            let zone = Arc::clone(&self.zone);
            let sink = self.sink.clone();
            let tls = self.tls.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let _guard = sink.track();
                match tls {
                    None => converse(stream, peer, &zone, &sink, shutdown).await,
                    Some(acceptor) => {
                        let handshake =
                            tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
                        match handshake {
                            Ok(Ok(stream)) => converse(stream, peer, &zone, &sink, shutdown).await,
                            Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                            Err(_) => trace!(peer = %peer, "TLS handshake timed out"),
                        }
                    }
                }
            });
        }
    }
}

async fn converse<S>(
    stream: S,
    peer: SocketAddr,
    zone: &ZoneMatcher,
    sink: &CaptureSink,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = SmtpSession::new(zone, sink, peer).run(stream, shutdown).await {
        contain(Protocol::Smtp, peer, e);
    }
}
