//! SMTP transport built on lettre's low-level async connection.
//!
//! The envelope is driven one command at a time so a refused `RCPT TO`
//! only fails that recipient. The rest of the chunk still gets `DATA`.

use super::{
    DeliveryReport, OutgoingMessage, Transport, TransportError, TransportFactory,
    looks_like_connection_error,
};
use crate::config::{SmtpSecurity, SmtpSettings};
use lettre::Message;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::Error as SmtpError;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::{Data, Mail, Rcpt, Rset};
use lettre::transport::smtp::extension::ClientId;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// SMTP reply code for "service not available", which providers also use for
/// connection limits.
const SERVICE_UNAVAILABLE: &str = "421";

const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpTransportFactory;

pub struct SmtpTransport {
    host: String,
    port: u16,
    security: SmtpSecurity,
    tls: Option<TlsParameters>,
    credentials: Option<Credentials>,
    connection_timeout: Duration,
    verify_timeout: Duration,
    socket_timeout: Duration,
    conn: Option<AsyncSmtpConnection>,
}

impl TransportFactory for SmtpTransportFactory {
    type Transport = SmtpTransport;

    /// Prepares the connection parameters. Nothing touches the network until
    /// `verify`.
    fn open(&self, settings: &SmtpSettings) -> Result<SmtpTransport, TransportError> {
        let tls = match settings.security {
            SmtpSecurity::StartTls | SmtpSecurity::Tls => {
                Some(TlsParameters::new(settings.host.clone()).map_err(classify)?)
            }
            SmtpSecurity::None => None,
        };

        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        };

        debug!(host = %settings.host, port = settings.port, "Opening SMTP transport");

        Ok(SmtpTransport {
            host: settings.host.clone(),
            port: settings.port,
            security: settings.security,
            tls,
            credentials,
            connection_timeout: settings.connection_timeout,
            verify_timeout: settings.connection_timeout + settings.greeting_timeout,
            socket_timeout: settings.socket_timeout,
            conn: None,
        })
    }
}

impl SmtpTransport {
    /// Connect, read the greeting, EHLO, upgrade to TLS if configured, and
    /// authenticate.
    async fn connect(&self) -> Result<AsyncSmtpConnection, TransportError> {
        let hello = ClientId::default();
        let implicit_tls = match self.security {
            SmtpSecurity::Tls => self.tls.clone(),
            SmtpSecurity::StartTls | SmtpSecurity::None => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            Some(self.connection_timeout),
            &hello,
            implicit_tls,
            None,
        )
        .await
        .map_err(classify)?;

        if let (SmtpSecurity::StartTls, Some(tls)) = (self.security, &self.tls) {
            if !conn.can_starttls() {
                return Err(TransportError::Connection(
                    "server does not offer STARTTLS".to_string(),
                ));
            }
            conn.starttls(tls.clone(), &hello).await.map_err(classify)?;
        }

        if let Some(credentials) = &self.credentials {
            conn.auth(AUTH_MECHANISMS, credentials)
                .await
                .map_err(classify)?;
        }

        Ok(conn)
    }
}

impl Transport for SmtpTransport {
    async fn verify(&mut self) -> Result<(), TransportError> {
        let connected = tokio::time::timeout(self.verify_timeout, self.connect()).await;
        match connected {
            Ok(Ok(conn)) => {
                self.conn = Some(conn);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Connection(
                "connection or greeting timed out".to_string(),
            )),
        }
    }

    /// `MAIL FROM`, one `RCPT TO` per envelope address, then `DATA` for the
    /// accepted ones. Refused recipients land in the report. A refused sender,
    /// a refused `DATA` or a dropped connection fails the whole message.
    async fn send(&mut self, message: &OutgoingMessage) -> Result<DeliveryReport, TransportError> {
        let email = build_message(message)?;
        let envelope = email.envelope();
        let limit = self.socket_timeout;
        let conn = self
            .conn
            .as_mut()
            .filter(|conn| !conn.has_broken())
            .ok_or_else(|| TransportError::Connection("connection is not open".to_string()))?;

        within(limit, conn.command(Mail::new(envelope.from().cloned(), vec![]))).await?;

        let mut report = DeliveryReport::default();
        let mut accepted = 0;
        for recipient in envelope.to() {
            match within(limit, conn.command(Rcpt::new(recipient.clone(), vec![]))).await {
                Ok(_) => accepted += 1,
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    debug!(recipient = %recipient, error = %e, "Recipient refused");
                    report.rejected.push((recipient.to_string(), e.to_string()));
                }
            }
        }

        if accepted == 0 {
            within(limit, conn.command(Rset)).await?;
            return Ok(report);
        }

        within(limit, conn.command(Data)).await?;
        within(limit, conn.message(&email.formatted())).await?;
        Ok(report)
    }

    fn close(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // Say goodbye in the background; dropping the connection closes the
        // socket either way.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = conn.quit().await;
            });
        }
    }
}

/// Bound one command/reply exchange by the socket timeout.
async fn within<T>(
    limit: Duration,
    exchange: impl Future<Output = Result<T, SmtpError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(limit, exchange).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(TransportError::Connection("socket timed out".to_string())),
    }
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, TransportError> {
    raw.parse()
        .map_err(|e| TransportError::Message(format!("invalid address '{}': {}", raw, e)))
}

fn build_message(message: &OutgoingMessage) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&message.from)?)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_HTML);

    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }
    for to in &message.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for bcc in &message.bcc {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }

    builder
        .body(message.html_body.clone())
        .map_err(|e| TransportError::Message(format!("failed to build message: {}", e)))
}

fn classify(err: SmtpError) -> TransportError {
    let text = err.to_string();
    let unavailable = err
        .status()
        .is_some_and(|code| code.to_string() == SERVICE_UNAVAILABLE);

    if err.is_timeout() || unavailable || looks_like_connection_error(&text) {
        TransportError::Connection(text)
    } else if err.is_transient() || err.is_permanent() {
        TransportError::Rejected(text)
    } else if err.is_client() {
        TransportError::Message(text)
    } else {
        // network, TLS and protocol errors below the SMTP reply layer
        TransportError::Connection(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_sender::BatchSender;
    use crate::config::{PipelineConfig, SenderIdentity};
    use crate::types::Chunk;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn message(to: &[&str], bcc: &[&str]) -> OutgoingMessage {
        OutgoingMessage {
            from: "Example News <news@example.com>".to_string(),
            reply_to: Some("editor@example.com".to_string()),
            to: to.iter().map(|s| s.to_string()).collect(),
            bcc: bcc.iter().map(|s| s.to_string()).collect(),
            subject: "Weekly".to_string(),
            html_body: "<p>Hello</p>".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // A minimal SMTP server on loopback
    // ------------------------------------------------------------------

    #[derive(Clone, Copy)]
    enum Greeting {
        Ready,
        Busy,
        Silent,
    }

    #[derive(Default)]
    struct Seen {
        accepted: Vec<String>,
        messages: Vec<String>,
    }

    struct LocalSmtp {
        addr: SocketAddr,
        seen: Arc<Mutex<Seen>>,
    }

    impl LocalSmtp {
        async fn start(greeting: Greeting) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let seen = Arc::new(Mutex::new(Seen::default()));
            let shared = Arc::clone(&seen);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(session(socket, greeting, Arc::clone(&shared)));
                }
            });
            Self { addr, seen }
        }

        fn settings(&self) -> SmtpSettings {
            loopback_settings(self.addr.port())
        }

        fn accepted(&self) -> Vec<String> {
            self.seen.lock().unwrap().accepted.clone()
        }

        fn messages(&self) -> Vec<String> {
            self.seen.lock().unwrap().messages.clone()
        }
    }

    fn loopback_settings(port: u16) -> SmtpSettings {
        SmtpSettings {
            host: "127.0.0.1".to_string(),
            port,
            username: None,
            password: None,
            security: SmtpSecurity::None,
            connection_timeout: Duration::from_millis(500),
            greeting_timeout: Duration::from_millis(500),
            socket_timeout: Duration::from_secs(2),
        }
    }

    /// Refuses any recipient whose address starts with `bad` and any sender
    /// starting with `blocked`.
    async fn session(socket: TcpStream, greeting: Greeting, seen: Arc<Mutex<Seen>>) {
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        match greeting {
            Greeting::Ready => {
                if write.write_all(b"220 fake.test ESMTP\r\n").await.is_err() {
                    return;
                }
            }
            Greeting::Busy => {
                let _ = write.write_all(b"421 too many connections\r\n").await;
                return;
            }
            Greeting::Silent => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return;
            }
        }

        while let Ok(Some(line)) = lines.next_line().await {
            let command = line.to_ascii_uppercase();
            let address = line
                .split(['<', '>'])
                .nth(1)
                .unwrap_or_default()
                .to_string();

            let reply: &[u8] = if command.starts_with("EHLO") || command.starts_with("HELO") {
                b"250 fake.test\r\n"
            } else if command.starts_with("MAIL FROM") {
                if address.starts_with("blocked") {
                    b"550 sender blocked\r\n"
                } else {
                    b"250 ok\r\n"
                }
            } else if command.starts_with("RCPT TO") {
                if address.starts_with("bad") {
                    b"550 no such user\r\n"
                } else {
                    seen.lock().unwrap().accepted.push(address);
                    b"250 ok\r\n"
                }
            } else if command == "DATA" {
                if write.write_all(b"354 go ahead\r\n").await.is_err() {
                    return;
                }
                let mut body = String::new();
                while let Ok(Some(data)) = lines.next_line().await {
                    if data == "." {
                        break;
                    }
                    body.push_str(&data);
                    body.push('\n');
                }
                seen.lock().unwrap().messages.push(body);
                b"250 queued\r\n"
            } else if command == "QUIT" {
                let _ = write.write_all(b"221 bye\r\n").await;
                return;
            } else {
                b"250 ok\r\n"
            };

            if write.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    fn identity(from: &str) -> SenderIdentity {
        SenderIdentity {
            from_email: from.to_string(),
            from_name: None,
            reply_to_email: None,
        }
    }

    fn chunk(emails: &[&str]) -> Chunk {
        Chunk {
            index: 0,
            total: 1,
            recipients: emails.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn verified(server: &LocalSmtp) -> SmtpTransport {
        let mut transport = SmtpTransportFactory.open(&server.settings()).unwrap();
        transport.verify().await.unwrap();
        transport
    }

    // ------------------------------------------------------------------
    // Message building
    // ------------------------------------------------------------------

    #[test]
    fn blind_copy_recipients_go_to_the_envelope_only() {
        let email = build_message(&message(
            &["news@example.com"],
            &["a@example.com", "b@example.com"],
        ))
        .unwrap();

        let envelope: Vec<String> = email.envelope().to().iter().map(|a| a.to_string()).collect();
        assert!(envelope.contains(&"a@example.com".to_string()));
        assert!(envelope.contains(&"b@example.com".to_string()));
        assert!(envelope.contains(&"news@example.com".to_string()));

        let formatted = String::from_utf8(email.formatted()).unwrap();
        assert!(!formatted.contains("a@example.com"));
        assert!(!formatted.contains("b@example.com"));
    }

    #[test]
    fn invalid_recipient_is_a_message_error() {
        let result = build_message(&message(&["not an address"], &[]));
        assert!(matches!(result, Err(TransportError::Message(_))));
    }

    #[tokio::test]
    async fn factory_builds_plaintext_transport_without_network() {
        let settings = SmtpSettings {
            host: "localhost".to_string(),
            port: 1025,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            security: SmtpSecurity::None,
            connection_timeout: Duration::from_secs(5),
            greeting_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(10),
        };
        let transport = SmtpTransportFactory.open(&settings).unwrap();
        assert_eq!(transport.verify_timeout, Duration::from_secs(10));
        assert!(transport.credentials.is_some());
        assert!(transport.conn.is_none());
        transport.close();
    }

    // ------------------------------------------------------------------
    // Against the loopback server
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn refused_recipients_fail_alone() {
        let server = LocalSmtp::start(Greeting::Ready).await;
        let sender = BatchSender::new(
            SmtpTransportFactory,
            server.settings(),
            identity("news@example.com"),
            PipelineConfig::default(),
        );
        let chunk = chunk(&[
            "ann@example.com",
            "bad1@example.com",
            "cat@example.com",
            "bad2@example.com",
            "dan@example.com",
        ]);

        let batch = sender
            .send_batch(&chunk, "Issue", "<p>Hi</p>", &HashMap::new())
            .await;

        assert_eq!(batch.succeeded(), 3);
        assert_eq!(batch.failed(), 2);
        for outcome in batch.results.iter().filter(|r| !r.success) {
            assert!(outcome.email.starts_with("bad"));
            assert!(outcome.error.as_deref().unwrap().contains("550"));
        }

        // one DATA for the three accepted recipients plus the sender copy
        assert_eq!(server.messages().len(), 1);
        let accepted = server.accepted();
        assert!(accepted.contains(&"ann@example.com".to_string()));
        assert!(accepted.contains(&"dan@example.com".to_string()));
        assert!(!accepted.iter().any(|a| a.starts_with("bad")));
    }

    #[tokio::test]
    async fn every_recipient_refused_skips_data() {
        let server = LocalSmtp::start(Greeting::Ready).await;
        let mut transport = verified(&server).await;

        let report = transport
            .send(&message(&["bad@example.com"], &[]))
            .await
            .unwrap();

        assert!(report.rejection_for("bad@example.com").is_some());
        assert!(server.messages().is_empty());
        transport.close();
    }

    #[tokio::test]
    async fn refused_sender_is_a_rejection() {
        let server = LocalSmtp::start(Greeting::Ready).await;
        let mut transport = verified(&server).await;

        let mut outgoing = message(&["ann@example.com"], &[]);
        outgoing.from = "blocked@example.com".to_string();
        let err = transport.send(&outgoing).await.unwrap_err();

        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(err.to_string().contains("550"));
        transport.close();
    }

    #[tokio::test]
    async fn busy_greeting_is_a_connection_error() {
        let server = LocalSmtp::start(Greeting::Busy).await;
        let mut transport = SmtpTransportFactory.open(&server.settings()).unwrap();

        let err = transport.verify().await.unwrap_err();
        assert!(err.is_connection(), "got {:?}", err);
    }

    #[tokio::test]
    async fn silent_server_times_out_as_a_connection_error() {
        let server = LocalSmtp::start(Greeting::Silent).await;
        let mut transport = SmtpTransportFactory.open(&server.settings()).unwrap();

        let err = transport.verify().await.unwrap_err();
        assert!(err.is_connection(), "got {:?}", err);
    }

    #[tokio::test]
    async fn nothing_listening_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = SmtpTransportFactory.open(&loopback_settings(port)).unwrap();

        let err = transport.verify().await.unwrap_err();
        assert!(err.is_connection(), "got {:?}", err);
    }

    #[tokio::test]
    async fn send_before_verify_is_a_connection_error() {
        let server = LocalSmtp::start(Greeting::Ready).await;
        let mut transport = SmtpTransportFactory.open(&server.settings()).unwrap();

        let err = transport
            .send(&message(&["ann@example.com"], &[]))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }
}
