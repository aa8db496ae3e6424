//! HTTP and HTTPS listeners.
//!
//! One accept loop serves both; the HTTPS variant wraps each connection in
//! a TLS handshake against the hot-reloadable certificate resolver. Until a
//! certificate is installed those handshakes fail and are logged.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use ricochet_common::Protocol;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::handler::HttpHandler;
use crate::capture::{accept_failed, contain, CaptureSink, Listener, ListenerError};

/// Time allowed for a client to send its request headers
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Plaintext or TLS HTTP listener
pub struct HttpListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<HttpHandler>,
    tls: Option<TlsAcceptor>,
    sink: CaptureSink,
}

impl HttpListener {
    /// Bind a plaintext listener
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<HttpHandler>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        Self::bind_inner(addr, handler, None, sink).await
    }

    /// Bind an HTTPS listener using `config` for every handshake
    pub async fn bind_tls(
        addr: SocketAddr,
        handler: Arc<HttpHandler>,
        config: Arc<rustls::ServerConfig>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        Self::bind_inner(addr, handler, Some(TlsAcceptor::from(config)), sink).await
    }

    async fn bind_inner(
        addr: SocketAddr,
        handler: Arc<HttpHandler>,
        tls: Option<TlsAcceptor>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                protocol: Protocol::Http,
                addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ListenerError::io(Protocol::Http, e))?;

        info!(addr = %local_addr, tls = tls.is_some(), "HTTP listener bound");

        Ok(Self {
            listener,
            local_addr,
            handler,
            tls,
            sink,
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ListenerError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "HTTP listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        accept_failed(Protocol::Http, &e, &shutdown).await;
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            let tls = self.tls.clone();
            let guard = self.sink.track();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let _guard = guard;
                match tls {
                    None => serve(stream, peer, handler, shutdown).await,
                    Some(acceptor) => {
                        let handshake =
                            tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
                        match handshake {
                            Ok(Ok(stream)) => serve(stream, peer, handler, shutdown).await,
                            Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                            Err(_) => trace!(peer = %peer, "TLS handshake timed out"),
                        }
                    }
                }
            });
        }
    }
}

/// Serve HTTP/1.1 on one connection until it closes or shutdown completes it
async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    handler: Arc<HttpHandler>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(request, peer).await) }
    });

    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        if !e.is_incomplete_message() {
            contain(Protocol::Http, peer, e);
        }
    }
}
