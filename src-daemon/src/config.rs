use serde::Deserialize;

use quotemail_core::MailError;

/// Outbound (mail submission) settings. Read from the environment at first
/// transport use, never at process start; a deployment without SMTP settings
/// fails only when it tries to send.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Implicit TLS (port 465) vs STARTTLS (587).
    pub implicit_tls: bool,
}

impl SmtpConfig {
    pub fn from_env() -> Result<Self, MailError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, MailError> {
        let host = require(&get, "SMTP_HOST")?;
        let port = parse_port(&get, "SMTP_PORT", 587)?;
        let user = require(&get, "SMTP_USER")?;
        let password = require(&get, "SMTP_PASSWORD")?;
        Ok(Self {
            host,
            port,
            user,
            password,
            implicit_tls: port == 465,
        })
    }

    /// Sender address; the submission user is the account address.
    pub fn sender(&self) -> &str {
        &self.user
    }
}

/// Inbound (mailbox) settings; reuses the SMTP user/credential.
#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl ImapConfig {
    pub fn from_env() -> Result<Self, MailError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, MailError> {
        let host = require(&get, "IMAP_HOST")?;
        let port = parse_port(&get, "IMAP_PORT", 993)?;
        let user = require(&get, "SMTP_USER")?;
        let password = require(&get, "SMTP_PASSWORD")?;
        Ok(Self {
            host,
            port,
            user,
            password,
        })
    }
}

fn require(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, MailError> {
    match get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MailError::Configuration(format!("{} is not set", name))),
    }
}

fn parse_port(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u16,
) -> Result<u16, MailError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| MailError::Configuration(format!("{} is not a valid port: {}", name, raw))),
    }
}
