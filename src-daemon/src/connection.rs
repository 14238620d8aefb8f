use async_native_tls::TlsConnector;
use async_std::net::TcpStream;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, Tokio1Executor};
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tracing::{info, warn};

use quotemail_core::MailError;

use crate::config::{ImapConfig, SmtpConfig};

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;
pub type ImapSession = async_imap::Session<async_native_tls::TlsStream<TcpStream>>;

/// Owns both network handles: the outbound SMTP transport and the inbound
/// IMAP session. Initialization is lazy and single-flight — the slot mutex is
/// held across connect/auth, so overlapping callers wait for the in-flight
/// attempt instead of opening duplicates. Cached handles are probed before
/// reuse and replaced when stale. Configuration errors fail fast and are
/// never retried here.
pub struct ConnectionManager {
    smtp_override: Option<SmtpConfig>,
    imap_override: Option<ImapConfig>,
    smtp_config: OnceCell<SmtpConfig>,
    imap_config: OnceCell<ImapConfig>,
    smtp: Mutex<Option<SmtpTransport>>,
    imap: Mutex<Option<ImapSession>>,
}

impl ConnectionManager {
    /// Env-backed manager; settings are read at first use.
    pub fn new() -> Self {
        Self::with_config(None, None)
    }

    /// Injected settings, used by the daemon when config comes from elsewhere.
    pub fn with_config(smtp: Option<SmtpConfig>, imap: Option<ImapConfig>) -> Self {
        Self {
            smtp_override: smtp,
            imap_override: imap,
            smtp_config: OnceCell::new(),
            imap_config: OnceCell::new(),
            smtp: Mutex::new(None),
            imap: Mutex::new(None),
        }
    }

    pub fn smtp_config(&self) -> Result<&SmtpConfig, MailError> {
        self.smtp_config.get_or_try_init(|| match &self.smtp_override {
            Some(cfg) => Ok(cfg.clone()),
            None => SmtpConfig::from_env(),
        })
    }

    pub fn imap_config(&self) -> Result<&ImapConfig, MailError> {
        self.imap_config.get_or_try_init(|| match &self.imap_override {
            Some(cfg) => Ok(cfg.clone()),
            None => ImapConfig::from_env(),
        })
    }

    /// Ready, verified SMTP transport. Cached transports are probed with a
    /// connection test; a failed probe discards the handle and reconnects.
    pub async fn acquire_outbound(&self) -> Result<SmtpTransport, MailError> {
        let mut slot = self.smtp.lock().await;

        if let Some(transport) = slot.as_ref() {
            match transport.test_connection().await {
                Ok(true) => return Ok(transport.clone()),
                Ok(false) => warn!("cached SMTP transport rejected probe, reconnecting"),
                Err(e) => warn!("cached SMTP transport stale ({}), reconnecting", e),
            }
            *slot = None;
        }

        let config = self.smtp_config()?;
        let transport = build_smtp_transport(config)?;
        match transport.test_connection().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(MailError::transient(format!(
                    "SMTP server {} refused connection test",
                    config.host
                )))
            }
            Err(e) => return Err(crate::smtp::classify_smtp_error(&e)),
        }

        info!("SMTP transport ready for {}:{}", config.host, config.port);
        *slot = Some(transport.clone());
        Ok(transport)
    }

    /// Drop a transport that produced a send failure so the next attempt
    /// reconnects.
    pub async fn invalidate_outbound(&self) {
        *self.smtp.lock().await = None;
    }

    /// Ready, verified IMAP session. The caller holds it exclusively and
    /// hands it back with [`release_inbound`](Self::release_inbound); a
    /// session that errored should be dropped instead.
    pub async fn acquire_inbound(&self) -> Result<ImapSession, MailError> {
        let mut slot = self.imap.lock().await;

        if let Some(mut session) = slot.take() {
            match session.noop().await {
                Ok(_) => return Ok(session),
                Err(e) => {
                    warn!("cached IMAP session stale ({}), reconnecting", e);
                    let _ = session.logout().await;
                }
            }
        }

        let config = self.imap_config()?;
        let session = create_imap_session(config).await?;
        Ok(session)
    }

    pub async fn release_inbound(&self, session: ImapSession) {
        // Log out whatever was in the slot so connections never leak.
        if let Some(mut old) = self.imap.lock().await.replace(session) {
            let _ = old.logout().await;
        }
    }

    /// Close both handles. Pending callers see fresh connections afterwards.
    pub async fn shutdown(&self) {
        if let Some(mut session) = self.imap.lock().await.take() {
            info!("closing IMAP session");
            let _ = session.logout().await;
        }
        *self.smtp.lock().await = None;
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_smtp_transport(config: &SmtpConfig) -> Result<SmtpTransport, MailError> {
    let tls_params = TlsParameters::builder(config.host.clone())
        .build_rustls()
        .map_err(|e| MailError::Configuration(format!("TLS parameters: {}", e)))?;

    let builder = if config.implicit_tls {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| MailError::Configuration(format!("SMTP relay: {}", e)))?
            .port(config.port)
            .tls(Tls::Wrapper(tls_params))
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| MailError::Configuration(format!("SMTP STARTTLS relay: {}", e)))?
            .port(config.port)
            .tls(Tls::Required(tls_params))
    };

    Ok(builder
        .credentials(Credentials::new(config.user.clone(), config.password.clone()))
        .build())
}

async fn create_imap_session(config: &ImapConfig) -> Result<ImapSession, MailError> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("[IMAP] connecting to {}", addr);

    // Resolve to IPv4 only — avoids IPv6 hangs with some providers.
    use async_std::net::ToSocketAddrs;
    let addrs: Vec<std::net::SocketAddr> = addr
        .to_socket_addrs()
        .await
        .map_err(|e| MailError::transient(format!("DNS resolve failed for {}: {}", addr, e)))?
        .filter(|a| a.is_ipv4())
        .collect();

    if addrs.is_empty() {
        return Err(MailError::transient(format!(
            "no IPv4 address found for {}",
            config.host
        )));
    }

    let tcp = async_std::io::timeout(
        std::time::Duration::from_secs(15),
        TcpStream::connect(&addrs[..]),
    )
    .await
    .map_err(|e| MailError::transient(format!("TCP connect to {} failed: {}", addr, e)))?;

    let tls = TlsConnector::new();
    let tls_stream = tls
        .connect(&config.host, tcp)
        .await
        .map_err(|e| MailError::transient(format!("TLS handshake with {} failed: {}", config.host, e)))?;

    let client = async_imap::Client::new(tls_stream);
    let session = client
        .login(&config.user, &config.password)
        .await
        .map_err(|(e, _)| MailError::transient(format!("IMAP login failed for {}: {}", config.user, e)))?;

    info!("[IMAP] session established for {}", config.user);
    Ok(session)
}
