//! UDP DNS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use ricochet_common::{InteractionRecord, Protocol, ProtocolDetails};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::answer::{describe, DnsAnswerer};
use super::txt::{TxtRecordCell, TxtRecordHandle};
use crate::capture::{CaptureSink, Listener, ListenerError};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 4096;

/// Authoritative DNS listener for the zone.
pub struct DnsListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    answerer: Arc<DnsAnswerer>,
    txt: Arc<TxtRecordCell>,
    sink: CaptureSink,
}

impl DnsListener {
    /// Bind the UDP socket. Failure is a fatal startup error.
    pub async fn bind(
        addr: SocketAddr,
        answerer: DnsAnswerer,
        txt: Arc<TxtRecordCell>,
        sink: CaptureSink,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                protocol: Protocol::Dns,
                addr,
                source,
            })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ListenerError::io(Protocol::Dns, e))?;

        info!(
            addr = %local_addr,
            zone = %answerer.zone().domain(),
            "DNS listener bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            answerer: Arc::new(answerer),
            txt,
            sink,
        })
    }

    /// Setter for the challenge TXT values served by this listener
    pub fn txt_handle(&self) -> TxtRecordHandle {
        TxtRecordHandle::new(Arc::clone(&self.txt))
    }
}

#[async_trait]
impl Listener for DnsListener {
    fn protocol(&self) -> Protocol {
        Protocol::Dns
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ListenerError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "DNS listener stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        debug!(error = %e, "DNS receive error");
                        continue;
                    }
                },
            };

            let datagram = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let answerer = Arc::clone(&self.answerer);
            let sink = self.sink.clone();

            tokio::spawn(async move {
                let _guard = sink.track();
                handle_datagram(&socket, &answerer, &sink, &datagram, peer).await;
            });
        }
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    answerer: &DnsAnswerer,
    sink: &CaptureSink,
    datagram: &[u8],
    peer: SocketAddr,
) {
    let request = match Message::from_bytes(datagram) {
        Ok(request) => request,
        Err(e) => {
            trace!(peer = %peer, error = %e, "Dropping malformed DNS datagram");
            return;
        }
    };

    let answer = answerer.answer(&request);
    let bytes = match answer.response.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to encode DNS response");
            return;
        }
    };

    if let Some(captured) = answer.capture {
        let record = InteractionRecord::new(Protocol::Dns, captured.id.clone(), peer)
            .with_full_id(captured.full_id)
            .with_raw_request(describe(&request))
            .with_raw_response(describe(&answer.response))
            .with_details(ProtocolDetails::Dns {
                query_type: captured.query_type.to_string(),
            });
        sink.capture(Some(captured.id), record);
    } else if answerer.zone().is_in_zone(
        &request
            .queries()
            .first()
            .map(|q| q.name().to_ascii())
            .unwrap_or_default(),
    ) {
        sink.dropped(Protocol::Dns);
    }

    if let Err(e) = socket.send_to(&bytes, peer).await {
        debug!(peer = %peer, error = %e, "Failed to send DNS response");
    }
}
