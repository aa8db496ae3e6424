//! One SMTP dialogue.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use ricochet_common::{InteractionRecord, Protocol, ProtocolDetails};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::capture::CaptureSink;
use crate::zone::ZoneMatcher;

/// Longest accepted command or data line
const MAX_LINE: usize = 4096;

/// Message data kept per transaction; the rest is read and discarded
const MAX_DATA: usize = 1024 * 1024;

/// Recipients accepted per transaction
const MAX_RECIPIENTS: usize = 100;

/// Idle time allowed between client lines
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope of the transaction in progress
#[derive(Debug, Default)]
struct Envelope {
    mail_from: Option<String>,
    recipients: Vec<String>,
    transcript: String,
    data_len: usize,
}

impl Envelope {
    fn record_line(&mut self, line: &str) {
        if self.data_len < MAX_DATA {
            self.data_len += line.len() + 2;
            self.transcript.push_str(line);
            self.transcript.push_str("\r\n");
        }
    }
}

/// SMTP server side of one connection
pub struct SmtpSession<'a> {
    zone: &'a ZoneMatcher,
    sink: &'a CaptureSink,
    peer: SocketAddr,
}

impl<'a> SmtpSession<'a> {
    pub fn new(zone: &'a ZoneMatcher, sink: &'a CaptureSink, peer: SocketAddr) -> Self {
        Self { zone, sink, peer }
    }

    /// Run the dialogue until `QUIT`, disconnect, idle timeout or shutdown
    pub async fn run<S>(&self, stream: S, shutdown: CancellationToken) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE));

        reply(
            &mut write,
            &format!("220 {} ESMTP ricochet", self.zone.domain()),
        )
        .await?;

        let mut envelope = Envelope::default();
        let mut in_data = false;

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => {
                    reply(&mut write, "421 Service shutting down").await?;
                    return Ok(());
                }
                next = tokio::time::timeout(IDLE_TIMEOUT, lines.next()) => match next {
                    Err(_) => {
                        reply(&mut write, "421 Idle timeout").await?;
                        return Ok(());
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(line)) => line?,
                },
            };

            if in_data {
                if line == "." {
                    in_data = false;
                    envelope.record_line(".");
                    let stored = self.deliver(&envelope);
                    trace!(peer = %self.peer, stored, "Message accepted");
                    envelope = Envelope::default();
                    reply(&mut write, "250 OK: queued").await?;
                } else {
                    // Dot-stuffing
                    let line = if line.starts_with("..") { &line[1..] } else { line.as_str() };
                    envelope.record_line(line);
                }
                continue;
            }

            envelope.record_line(&line);
            let (verb, argument) = split_command(&line);

            let response = match verb.as_str() {
                "HELO" | "EHLO" => {
                    envelope.mail_from = None;
                    envelope.recipients.clear();
                    format!("250 {} Hello", self.zone.domain())
                }
                "MAIL" => match address_argument(argument, "FROM:") {
                    Some(from) => {
                        envelope.mail_from = Some(from);
                        envelope.recipients.clear();
                        "250 OK".to_string()
                    }
                    None => "501 Syntax: MAIL FROM:<address>".to_string(),
                },
                "RCPT" => match (&envelope.mail_from, address_argument(argument, "TO:")) {
                    (None, _) => "503 Need MAIL before RCPT".to_string(),
                    (Some(_), Some(_)) if envelope.recipients.len() >= MAX_RECIPIENTS => {
                        "452 Too many recipients".to_string()
                    }
                    (Some(_), Some(to)) => {
                        envelope.recipients.push(to);
                        "250 OK".to_string()
                    }
                    (Some(_), None) => "501 Syntax: RCPT TO:<address>".to_string(),
                },
                "DATA" if envelope.recipients.is_empty() => {
                    "503 Need RCPT before DATA".to_string()
                }
                "DATA" => {
                    in_data = true;
                    "354 End data with <CR><LF>.<CR><LF>".to_string()
                }
                "RSET" => {
                    envelope = Envelope::default();
                    "250 OK".to_string()
                }
                "NOOP" => "250 OK".to_string(),
                "QUIT" => {
                    reply(&mut write, "221 Bye").await?;
                    return Ok(());
                }
                _ => "502 Command not implemented".to_string(),
            };
            reply(&mut write, &response).await?;
        }
    }

    /// Capture one record per distinct correlation id among the recipients.
    /// Returns the number stored.
    fn deliver(&self, envelope: &Envelope) -> usize {
        let mail_from = envelope.mail_from.clone().unwrap_or_default();
        let mut seen = HashSet::new();
        let mut stored = 0;

        for recipient in &envelope.recipients {
            let Some(id) = self.zone.smtp_id(recipient) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            let record = InteractionRecord::new(Protocol::Smtp, id.clone(), self.peer)
                .with_full_id(recipient.clone())
                .with_raw_request(envelope.transcript.clone())
                .with_details(ProtocolDetails::Smtp {
                    mail_from: mail_from.clone(),
                });
            if self.sink.capture(Some(id), record) {
                stored += 1;
            }
        }

        if stored == 0 {
            debug!(peer = %self.peer, recipients = envelope.recipients.len(), "Mail without correlation id");
            self.sink.dropped(Protocol::Smtp);
        }
        stored
    }
}

async fn reply<W: AsyncWrite + Unpin>(write: &mut W, line: &str) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\r\n").await?;
    write.flush().await
}

/// Uppercased verb and the rest of the line
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Address from `FROM:<a@b> SIZE=1` style arguments
fn address_argument(argument: &str, keyword: &str) -> Option<String> {
    let prefix = argument.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = argument[keyword.len()..].trim_start();
    let address = match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>')?.0,
        None => rest.split_whitespace().next().unwrap_or_default(),
    };
    Some(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use ricochet_common::CorrelationId;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn expect(&mut self, code: &str) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with(code), "expected {code}, got {line:?}");
            line
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        }

        async fn command(&mut self, line: &str, code: &str) -> String {
            self.send(line).await;
            self.expect(code).await
        }
    }

    fn spawn_session(store: Arc<Store>, root_tld: bool) -> (Client, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let zone = ZoneMatcher::new("example.com", root_tld);
            let sink = CaptureSink::new(store);
            let peer = "192.0.2.1:2525".parse().unwrap();
            SmtpSession::new(&zone, &sink, peer)
                .run(server, CancellationToken::new())
                .await
                .unwrap();
        });
        let (read, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(read),
                writer,
            },
            handle,
        )
    }

    #[test]
    fn test_address_argument() {
        assert_eq!(
            address_argument("FROM:<a@b.com> SIZE=10", "FROM:").as_deref(),
            Some("a@b.com")
        );
        assert_eq!(
            address_argument("to: x@abc.example.com", "TO:").as_deref(),
            Some("x@abc.example.com")
        );
        assert_eq!(address_argument("FROM:<>", "FROM:").as_deref(), Some(""));
        assert!(address_argument("TO:<x>", "FROM:").is_none());
    }

    #[tokio::test]
    async fn test_dialogue_captures_each_id_once() {
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        let (mut client, handle) = spawn_session(Arc::clone(&store), false);

        client.expect("220").await;
        client.command("EHLO scanner.test", "250").await;
        client.command("MAIL FROM:<sender@scanner.test>", "250").await;
        client.command("RCPT TO:<x@abc.example.com>", "250").await;
        client.command("RCPT TO:<y@abc.example.com>", "250").await;
        client.command("RCPT TO:<def@example.com>", "250").await;
        client.command("RCPT TO:<nobody@elsewhere.test>", "250").await;
        client.command("DATA", "354").await;
        client.send("Subject: hello").await;
        client.send("").await;
        client.send("..leading dot").await;
        client.command(".", "250").await;
        client.command("QUIT", "221").await;
        handle.await.unwrap();

        let abc = store.get(&CorrelationId::parse("abc").unwrap(), None).unwrap();
        assert_eq!(abc.len(), 1);
        assert_eq!(
            abc[0].details,
            ProtocolDetails::Smtp {
                mail_from: "sender@scanner.test".to_string()
            }
        );
        assert!(abc[0].raw_request.contains("Subject: hello"));
        assert!(abc[0].raw_request.contains("\r\n.leading dot\r\n"));

        let def = store.get(&CorrelationId::parse("def").unwrap(), None).unwrap();
        assert_eq!(def.len(), 1);
        assert_eq!(store.stats().buckets, 2);
    }

    #[tokio::test]
    async fn test_recipients_capped() {
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        let (mut client, handle) = spawn_session(Arc::clone(&store), false);

        client.expect("220").await;
        client.command("HELO x", "250").await;
        client.command("MAIL FROM:<a@b>", "250").await;
        for i in 0..MAX_RECIPIENTS {
            client
                .command(&format!("RCPT TO:<r{}@id{}.example.com>", i, i), "250")
                .await;
        }
        client.command("RCPT TO:<late@over.example.com>", "452").await;
        client.command("DATA", "354").await;
        client.command(".", "250").await;

        // A new transaction starts with an empty list
        client.command("MAIL FROM:<a@b>", "250").await;
        client.command("RCPT TO:<x@again.example.com>", "250").await;
        client.command("QUIT", "221").await;
        handle.await.unwrap();

        assert_eq!(store.stats().buckets, MAX_RECIPIENTS);
        assert!(!store.contains(&CorrelationId::parse("over").unwrap()));
    }

    #[tokio::test]
    async fn test_sequence_errors() {
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        let (mut client, handle) = spawn_session(Arc::clone(&store), false);

        client.expect("220").await;
        client.command("RCPT TO:<x@abc.example.com>", "503").await;
        client.command("MAIL FROM:<a@b>", "250").await;
        client.command("DATA", "503").await;
        client.command("VRFY root", "502").await;
        client.command("NOOP", "250").await;
        client.command("RSET", "250").await;
        client.command("QUIT", "221").await;
        handle.await.unwrap();

        assert_eq!(store.stats().buckets, 0);
    }

    #[tokio::test]
    async fn test_apex_mail_in_root_tld_mode() {
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        let (mut client, handle) = spawn_session(Arc::clone(&store), true);

        client.expect("220").await;
        client.command("HELO x", "250").await;
        client.command("MAIL FROM:<a@b>", "250").await;
        client.command("RCPT TO:<not_an_id@example.com>", "250").await;
        client.command("DATA", "354").await;
        client.command(".", "250").await;
        client.command("QUIT", "221").await;
        handle.await.unwrap();

        let zone = ZoneMatcher::new("example.com", true);
        assert_eq!(store.get(&zone.domain_id(), None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let (client, server) = tokio::io::duplex(1024);
        let store = Arc::new(Store::new(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let zone = ZoneMatcher::new("example.com", false);
            let sink = CaptureSink::new(store);
            SmtpSession::new(&zone, &sink, "192.0.2.1:1".parse().unwrap())
                .run(server, token)
                .await
        });

        let (read, _write) = tokio::io::split(client);
        let mut reader = BufReader::new(read);
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await.unwrap();
        shutdown.cancel();

        handle.await.unwrap().unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("421"));
    }
}
