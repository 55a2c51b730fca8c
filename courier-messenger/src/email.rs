//! SMTP pool messenger.
//!
//! Carries messages over one or more configured SMTP relays, selected
//! round-robin per message. Each server has its own hello hostname, optional
//! AUTH PLAIN credentials, and TLS policy (none, STARTTLS upgrade, or
//! implicit TLS).

use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine;
use courier_common::models::Message;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, crypto, pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use uuid::Uuid;

use crate::{
    error::{MessengerError, PermanentError, Result, TransientError},
    Messenger,
};

/// Replies larger than this abort the exchange.
const MAX_REPLY_BYTES: usize = 64 * 1024;

const fn default_port() -> u16 {
    25
}

fn default_hello_hostname() -> String {
    "localhost".to_string()
}

const fn default_timeout_secs() -> u64 {
    15
}

/// TLS policy for one SMTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain TCP for the whole session.
    #[default]
    None,
    /// Plain TCP, upgraded with the STARTTLS command.
    StartTls,
    /// Implicit TLS from the first byte.
    Tls,
}

/// Configuration for a single SMTP relay in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Hostname announced in EHLO.
    #[serde(default = "default_hello_hostname")]
    pub hello_hostname: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: TlsMode,

    /// Skip certificate chain validation. For relays with self-signed
    /// certificates in test setups.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Timeout for the whole SMTP transaction, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// The built-in email messenger: a pool of SMTP relays.
#[derive(Debug)]
pub struct EmailMessenger {
    name: String,
    servers: Vec<SmtpServerConfig>,
    next: AtomicUsize,
}

impl EmailMessenger {
    /// Build a pool from one or more server configs.
    ///
    /// # Errors
    /// If no servers are configured.
    pub fn new(name: impl Into<String>, servers: Vec<SmtpServerConfig>) -> Result<Self> {
        if servers.is_empty() {
            return Err(MessengerError::Permanent(PermanentError::Configuration(
                "no SMTP servers configured".to_string(),
            )));
        }
        Ok(Self {
            name: name.into(),
            servers,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &SmtpServerConfig {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[index]
    }
}

#[async_trait]
impl Messenger for EmailMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &Message) -> Result<()> {
        let server = self.pick();
        let timeout = Duration::from_secs(server.timeout_secs);

        match tokio::time::timeout(timeout, deliver(server, message)).await {
            Ok(result) => result,
            Err(_) => Err(MessengerError::Transient(TransientError::Timeout(format!(
                "SMTP transaction to {}:{} exceeded {}s",
                server.host, server.port, server.timeout_secs
            )))),
        }
    }
}

/// Run one full SMTP transaction against the chosen relay.
///
/// The TLS policy shapes the exchange: `Tls` encrypts before the greeting,
/// `StartTls` upgrades after the first EHLO and greets again, `None` stays
/// in the clear throughout.
async fn deliver(server: &SmtpServerConfig, message: &Message) -> Result<()> {
    let mut exchange = Exchange::open(server).await?;

    let hello = format!("EHLO {}", server.hello_hostname);
    exchange.command(&hello, false).await?;

    if server.tls == TlsMode::StartTls {
        exchange.command("STARTTLS", false).await?;
        exchange.encrypt(server).await?;
        exchange.command(&hello, false).await?;
    }

    if let (Some(username), Some(password)) = (&server.username, &server.password) {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("\0{username}\0{password}"));
        exchange.command(&format!("AUTH PLAIN {token}"), false).await?;
    }

    let sender = extract_address(&message.from);
    exchange
        .command(&format!("MAIL FROM:<{sender}>"), false)
        .await?;
    for recipient in &message.to {
        let recipient = extract_address(recipient);
        exchange
            .command(&format!("RCPT TO:<{recipient}>"), true)
            .await?;
    }

    exchange.command("DATA", false).await?;
    exchange.write(assemble(message).as_bytes()).await?;
    exchange.write(b"\r\n.\r\n").await?;

    let (code, text) = exchange.reply().await?;
    if !(200..=299).contains(&code) {
        return Err(match code {
            400..=499 => {
                MessengerError::Transient(TransientError::ServerBusy(format!("{code} {text}")))
            }
            _ => MessengerError::Permanent(PermanentError::Rejected(format!("{code} {text}"))),
        });
    }

    // Best effort; the message is already accepted.
    let _ = exchange.command("QUIT", false).await;

    Ok(())
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A line-oriented SMTP exchange with one relay.
///
/// Owns the socket (plain or TLS) and a reply buffer; replies are parsed
/// incrementally out of the buffer so a slow relay can split a reply across
/// reads without confusing the state machine.
struct Exchange {
    stream: Option<Stream>,
    buffer: Vec<u8>,
}

impl Exchange {
    /// Connect and consume the 220 greeting. Implicit-TLS servers are
    /// encrypted before the first byte is read.
    async fn open(server: &SmtpServerConfig) -> Result<Self> {
        let tcp = TcpStream::connect((server.host.as_str(), server.port)).await?;
        let mut exchange = Self {
            stream: Some(Stream::Plain(tcp)),
            buffer: Vec::new(),
        };

        if server.tls == TlsMode::Tls {
            exchange.encrypt(server).await?;
        }

        let (code, greeting) = exchange.reply().await?;
        if code != 220 {
            return Err(MessengerError::Transient(TransientError::ConnectionFailed(
                format!("unexpected greeting: {code} {greeting}"),
            )));
        }

        Ok(exchange)
    }

    /// Wrap the current stream in TLS using the server's trust settings.
    async fn encrypt(&mut self, server: &SmtpServerConfig) -> Result<()> {
        let Some(Stream::Plain(tcp)) = self.stream.take() else {
            return Err(MessengerError::Transient(TransientError::TlsHandshakeFailed(
                "session is already encrypted".to_string(),
            )));
        };

        let connector = tls_connector(server.accept_invalid_certs)?;
        let name = ServerName::try_from(server.host.clone()).map_err(|e| {
            MessengerError::Transient(TransientError::TlsHandshakeFailed(format!(
                "invalid server name: {e}"
            )))
        })?;

        let tls = connector.connect(name, tcp).await.map_err(|e| {
            MessengerError::Transient(TransientError::TlsHandshakeFailed(e.to_string()))
        })?;

        self.stream = Some(Stream::Tls(Box::new(tls)));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.stream.as_mut() {
            Some(Stream::Plain(stream)) => stream.write_all(data).await?,
            Some(Stream::Tls(stream)) => stream.write_all(data).await?,
            None => return Err(connection_lost()),
        }
        Ok(())
    }

    /// Read the next complete reply, continuation lines included.
    async fn reply(&mut self) -> Result<(u16, String)> {
        loop {
            if let Some((code, text, consumed)) = parse_reply(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok((code, text));
            }
            if self.buffer.len() > MAX_REPLY_BYTES {
                return Err(MessengerError::Transient(TransientError::ConnectionFailed(
                    "oversized SMTP reply".to_string(),
                )));
            }

            let mut chunk = [0u8; 4096];
            let n = match self.stream.as_mut() {
                Some(Stream::Plain(stream)) => stream.read(&mut chunk).await?,
                Some(Stream::Tls(stream)) => stream.read(&mut chunk).await?,
                None => return Err(connection_lost()),
            };
            if n == 0 {
                return Err(connection_lost());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send one command line and classify the reply. A rejection of RCPT is
    /// an addressing failure; other 5xx replies are hard rejections.
    async fn command(&mut self, line: &str, rcpt: bool) -> Result<(u16, String)> {
        self.write(line.as_bytes()).await?;
        self.write(b"\r\n").await?;

        let (code, text) = self.reply().await?;
        match code {
            200..=399 => Ok((code, text)),
            400..=499 => Err(MessengerError::Transient(TransientError::ServerBusy(
                format!("{code} {text}"),
            ))),
            _ if rcpt => Err(MessengerError::Permanent(PermanentError::InvalidRecipient(
                format!("{code} {text}"),
            ))),
            _ => Err(MessengerError::Permanent(PermanentError::Rejected(format!(
                "{code} {text}"
            )))),
        }
    }
}

fn connection_lost() -> MessengerError {
    MessengerError::Transient(TransientError::ConnectionFailed(
        "connection closed unexpectedly".to_string(),
    ))
}

/// Parse one complete reply off the front of `buf`: zero or more `NNN-text`
/// continuation lines followed by a final `NNN text` line. Returns the code,
/// the final line's text, and how many bytes were consumed; `None` until a
/// full reply has arrived.
fn parse_reply(buf: &[u8]) -> Result<Option<(u16, String, usize)>> {
    let mut offset = 0;
    loop {
        let Some(eol) = buf[offset..].windows(2).position(|win| win == b"\r\n") else {
            return Ok(None);
        };
        let line = &buf[offset..offset + eol];
        let end = offset + eol + 2;

        if line.len() > 3 && line[3] == b'-' {
            offset = end;
            continue;
        }

        let code = std::str::from_utf8(line.get(..3).unwrap_or_default())
            .ok()
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| {
                MessengerError::Transient(TransientError::ConnectionFailed(format!(
                    "malformed SMTP reply: {}",
                    String::from_utf8_lossy(line)
                )))
            })?;
        let text = String::from_utf8_lossy(line.get(4..).unwrap_or_default()).into_owned();
        return Ok(Some((code, text, end)));
    }
}

/// TLS client setup against the native trust store.
///
/// `accept_invalid_certs` swaps in a verifier that still checks handshake
/// signatures through the active crypto provider but trusts any chain.
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        roots.add(cert).map_err(|e| {
            MessengerError::Transient(TransientError::TlsHandshakeFailed(format!(
                "failed to add certificate: {e}"
            )))
        })?;
    }
    if !loaded.errors.is_empty() {
        tracing::warn!(errors = ?loaded.errors, "some native certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if accept_invalid_certs {
        let provider = crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(crypto::aws_lc_rs::default_provider()));
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(ChainBlindVerifier { provider }));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that skips chain validation but delegates handshake signature
/// checks to the crypto provider. Only reachable via `accept_invalid_certs`.
#[derive(Debug)]
struct ChainBlindVerifier {
    provider: Arc<crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for ChainBlindVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Pull the bare address out of a `Name <addr>` display form.
fn extract_address(raw: &str) -> &str {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw.trim(),
    }
}

/// Assemble the RFC 822 document: headers, then the body with dot-stuffing.
/// `alt_body` turns an HTML message into multipart/alternative.
fn assemble(message: &Message) -> String {
    let mut out = String::with_capacity(message.body.len() + 512);

    let _ = write!(out, "Date: {}\r\n", chrono::Utc::now().to_rfc2822());
    let _ = write!(out, "From: {}\r\n", message.from);
    let _ = write!(out, "To: {}\r\n", message.to.join(", "));
    let _ = write!(out, "Subject: {}\r\n", message.subject);
    let _ = write!(out, "Message-ID: <{}@courier>\r\n", Uuid::new_v4());
    out.push_str("MIME-Version: 1.0\r\n");

    for (name, value) in &message.headers {
        let _ = write!(out, "{name}: {value}\r\n");
    }

    if let Some(alt) = &message.alt_body {
        let boundary = format!("courier-{}", Uuid::new_v4().simple());
        let _ = write!(
            out,
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        );
        let _ = write!(
            out,
            "--{boundary}\r\nContent-Type: text/plain; charset=\"utf-8\"\r\n\r\n"
        );
        out.push_str(&dot_stuff(alt));
        let _ = write!(
            out,
            "\r\n--{boundary}\r\nContent-Type: {}; charset=\"utf-8\"\r\n\r\n",
            message.content_type.mime()
        );
        out.push_str(&dot_stuff(&message.body));
        let _ = write!(out, "\r\n--{boundary}--");
    } else {
        let _ = write!(
            out,
            "Content-Type: {}; charset=\"utf-8\"\r\n\r\n",
            message.content_type.mime()
        );
        out.push_str(&dot_stuff(&message.body));
    }

    out
}

/// Escape leading dots so the body cannot terminate DATA early.
fn dot_stuff(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    let mut out = String::with_capacity(normalized.len());
    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use courier_common::models::{ContentType, Headers};

    use super::*;

    fn server(host: &str) -> SmtpServerConfig {
        SmtpServerConfig {
            host: host.to_string(),
            port: 25,
            hello_hostname: "localhost".to_string(),
            username: None,
            password: None,
            tls: TlsMode::None,
            accept_invalid_certs: false,
            timeout_secs: 15,
        }
    }

    #[test]
    fn round_robin_over_servers() {
        let pool = EmailMessenger::new(
            "email",
            vec![server("a.example.com"), server("b.example.com")],
        )
        .unwrap();

        assert_eq!(pool.pick().host, "a.example.com");
        assert_eq!(pool.pick().host, "b.example.com");
        assert_eq!(pool.pick().host, "a.example.com");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(EmailMessenger::new("email", Vec::new()).is_err());
    }

    #[test]
    fn reply_parsing() {
        // Incomplete: no CRLF-terminated final line yet.
        assert!(parse_reply(b"250-PIPELINING\r\n250 ").unwrap().is_none());
        assert!(parse_reply(b"").unwrap().is_none());

        // Single line.
        let (code, text, consumed) = parse_reply(b"220 relay ready\r\n").unwrap().unwrap();
        assert_eq!((code, text.as_str(), consumed), (220, "relay ready", 17));

        // Continuations are skipped up to the final line.
        let reply = b"250-relay\r\n250-SIZE 1000000\r\n250 OK\r\n";
        let (code, text, consumed) = parse_reply(reply).unwrap().unwrap();
        assert_eq!((code, text.as_str()), (250, "OK"));
        assert_eq!(consumed, reply.len());

        // A bare code with no text is legal.
        let (code, text, _) = parse_reply(b"250\r\n").unwrap().unwrap();
        assert_eq!((code, text.as_str()), (250, ""));

        // Garbage is an error, not a hang.
        assert!(parse_reply(b"garbage\r\n").is_err());
    }

    #[test]
    fn dot_stuffing() {
        assert_eq!(dot_stuff(".hidden\nvisible\n..two"), "..hidden\r\nvisible\r\n...two");
        assert_eq!(dot_stuff("plain"), "plain");
    }

    #[test]
    fn address_extraction() {
        assert_eq!(extract_address("Anil <anil@example.com>"), "anil@example.com");
        assert_eq!(extract_address("anil@example.com"), "anil@example.com");
        assert_eq!(extract_address("  anil@example.com "), "anil@example.com");
    }

    #[test]
    fn assembled_message_carries_headers_and_body() {
        let mut headers = Headers::new();
        headers.push("List-Unsubscribe", "<https://x/u>");

        let message = Message {
            from: "Courier <c@example.com>".to_string(),
            to: vec!["anil@example.com".to_string()],
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            alt_body: None,
            content_type: ContentType::Html,
            headers,
            messenger: "email".to_string(),
            campaign: None,
            subscriber: None,
            retries: 0,
        };

        let doc = assemble(&message);
        assert!(doc.contains("From: Courier <c@example.com>\r\n"));
        assert!(doc.contains("Subject: Hello\r\n"));
        assert!(doc.contains("List-Unsubscribe: <https://x/u>\r\n"));
        assert!(doc.contains("Content-Type: text/html; charset=\"utf-8\"\r\n\r\n<p>Hi</p>"));
    }

    #[test]
    fn alt_body_builds_multipart() {
        let message = Message {
            from: "c@example.com".to_string(),
            to: vec!["anil@example.com".to_string()],
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            alt_body: Some("Hi".to_string()),
            content_type: ContentType::Html,
            headers: Headers::new(),
            messenger: "email".to_string(),
            campaign: None,
            subscriber: None,
            retries: 0,
        };

        let doc = assemble(&message);
        assert!(doc.contains("multipart/alternative"));
        assert!(doc.contains("Content-Type: text/plain; charset=\"utf-8\"\r\n\r\nHi"));
        assert!(doc.contains("Content-Type: text/html; charset=\"utf-8\"\r\n\r\n<p>Hi</p>"));
    }
}
