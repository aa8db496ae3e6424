//! SMB / responder companion ingestion
//!
//! The companion agent runs as its own process and appends one line per
//! captured event to a log file. [`CompanionTail`] follows that file and
//! stores each new line in the token bucket.

use std::io::SeekFrom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ricochet_common::{InteractionRecord, Protocol};
use ricochet_config::CompanionMode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capture::CaptureSink;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Protocol tag for records produced by a companion
pub fn protocol_for(mode: CompanionMode) -> Protocol {
    match mode {
        CompanionMode::Smb => Protocol::Smb,
        CompanionMode::Responder => Protocol::Responder,
    }
}

/// Follows a companion log file
pub struct CompanionTail {
    protocol: Protocol,
    path: PathBuf,
    sink: CaptureSink,
    poll_interval: Duration,
    offset: u64,
    partial: String,
}

impl CompanionTail {
    /// Start following `path` from its current end. A missing file is
    /// followed from the start once it appears.
    pub async fn new(mode: CompanionMode, path: impl Into<PathBuf>, sink: CaptureSink) -> Self {
        let path = path.into();
        let offset = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Self {
            protocol: protocol_for(mode),
            path,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            offset,
            partial: String::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            protocol = %self.protocol,
            path = %self.path.display(),
            "Following companion log"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(protocol = %self.protocol, "Companion tail stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        trace!(path = %self.path.display(), error = %e, "Companion log not readable");
                    }
                }
            }
        }
    }

    /// Ingest lines appended since the last poll; returns the number stored
    pub async fn poll_once(&mut self) -> std::io::Result<usize> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();

        if len < self.offset {
            warn!(path = %self.path.display(), "Companion log truncated, reading from start");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut appended = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut appended).await?;
        self.offset += appended.len() as u64;
        self.partial.push_str(&String::from_utf8_lossy(&appended));

        let mut stored = 0;
        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() && self.ingest(line) {
                stored += 1;
            }
        }
        Ok(stored)
    }

    fn ingest(&self, line: &str) -> bool {
        let Some(id) = self.sink.fallback().cloned() else {
            self.sink.dropped(self.protocol);
            return false;
        };
        let remote = SocketAddr::new(
            first_ip(line).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            0,
        );
        let record = InteractionRecord::new(self.protocol, id, remote).with_raw_request(line);
        self.sink.capture(None, record)
    }
}

impl std::fmt::Debug for CompanionTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionTail")
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish()
    }
}

/// First token of `line` that parses as an IP address
fn first_ip(line: &str) -> Option<IpAddr> {
    line.split(|c: char| !(c.is_ascii_hexdigit() || c == '.' || c == ':'))
        .filter(|token| token.len() >= 3)
        .find_map(|token| {
            token
                .parse::<IpAddr>()
                .ok()
                .or_else(|| token.trim_matches(':').parse().ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use ricochet_common::CorrelationId;
    use std::io::Write;
    use std::sync::Arc;

    fn sink(fallback: Option<&str>) -> CaptureSink {
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        CaptureSink::new(store).with_fallback(fallback.map(CorrelationId::from_trusted))
    }

    #[test]
    fn test_first_ip() {
        assert_eq!(
            first_ip("[SMB] NTLMv2 Client   : 10.0.0.5"),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(
            first_ip("Incoming connection (2001:db8::7,445)"),
            Some("2001:db8::7".parse().unwrap())
        );
        assert_eq!(first_ip("no address here"), None);
    }

    #[tokio::test]
    async fn test_only_new_lines_ingested() {
        let mut log = tempfile::NamedTempFile::new().unwrap();
        writeln!(log, "old event 192.0.2.1").unwrap();
        log.flush().unwrap();

        let sink = sink(Some("token-bucket"));
        let store = Arc::clone(sink.store());
        let mut tail = CompanionTail::new(CompanionMode::Smb, log.path(), sink).await;

        assert_eq!(tail.poll_once().await.unwrap(), 0);

        writeln!(log, "Incoming connection (198.51.100.4,51234)").unwrap();
        write!(log, "partial").unwrap();
        log.flush().unwrap();
        assert_eq!(tail.poll_once().await.unwrap(), 1);

        writeln!(log, " line").unwrap();
        log.flush().unwrap();
        assert_eq!(tail.poll_once().await.unwrap(), 1);

        let records = store
            .get(&CorrelationId::from_trusted("token-bucket"), None)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].protocol, Protocol::Smb);
        assert_eq!(records[0].remote_address, "198.51.100.4");
        assert_eq!(records[1].raw_request, "partial line");
    }

    #[tokio::test]
    async fn test_truncation_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responder.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let sink = sink(Some("bucket"));
        let store = Arc::clone(sink.store());
        let mut tail = CompanionTail::new(CompanionMode::Responder, &path, sink).await;

        std::fs::write(&path, "fresh\n").unwrap();
        assert_eq!(tail.poll_once().await.unwrap(), 1);

        let records = store.get(&CorrelationId::from_trusted("bucket"), None).unwrap();
        assert_eq!(records[0].protocol, Protocol::Responder);
        assert_eq!(records[0].raw_request, "fresh");
    }

    #[tokio::test]
    async fn test_missing_file_followed_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let mut tail = CompanionTail::new(CompanionMode::Smb, &path, sink(Some("b"))).await;
        assert!(tail.poll_once().await.is_err());

        std::fs::write(&path, "event\n").unwrap();
        assert_eq!(tail.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_without_fallback_nothing_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smb.log");
        let sink = sink(None);
        let store = Arc::clone(sink.store());

        let mut tail = CompanionTail::new(CompanionMode::Smb, &path, sink).await;
        std::fs::write(&path, "event\n").unwrap();
        assert_eq!(tail.poll_once().await.unwrap(), 0);
        assert_eq!(store.stats().buckets, 0);
    }
}
