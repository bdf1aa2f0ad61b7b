//! Mail collaborator.
//!
//! `SmtpMailer` authenticates with an address + app password over STARTTLS;
//! the host comes from a named provider profile. `OutboxMailer` writes `.eml`
//! files instead, for rehearsing a run without touching the network.

use crate::error::{DmsError, Result};
use crate::template::RenderedMessage;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{FileTransport, SmtpTransport, Transport};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ADDRESS: &str = "MY_EMAIL";
pub const ENV_PASSWORD: &str = "MY_PASSWORD";

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

pub trait Mailer {
    fn send(&self, message: &RenderedMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Provider profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provider {
    pub domain: &'static str,
    pub host: &'static str,
    pub port: u16,
}

pub const PROVIDERS: &[Provider] = &[
    Provider {
        domain: "gmail.com",
        host: "smtp.gmail.com",
        port: 587,
    },
    Provider {
        domain: "icloud.com",
        host: "smtp.mail.me.com",
        port: 587,
    },
    Provider {
        domain: "outlook.com",
        host: "smtp-mail.outlook.com",
        port: 587,
    },
    Provider {
        domain: "yahoo.com",
        host: "smtp.mail.yahoo.com",
        port: 587,
    },
    Provider {
        domain: "hotmail.com",
        host: "smtp-mail.outlook.com",
        port: 587,
    },
];

impl Provider {
    /// Look up by name (`gmail`) or domain (`gmail.com`), case-insensitive.
    pub fn by_name(name: &str) -> Result<Provider> {
        let name = name.trim().to_ascii_lowercase();
        PROVIDERS
            .iter()
            .find(|p| p.domain == name || p.domain.split('.').next() == Some(name.as_str()))
            .copied()
            .ok_or_else(|| unsupported(&name))
    }

    /// Derive the provider from the sender's address domain.
    pub fn for_address(address: &str) -> Result<Provider> {
        let domain = address
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default();
        PROVIDERS
            .iter()
            .find(|p| p.domain == domain)
            .copied()
            .ok_or_else(|| unsupported(&domain))
    }
}

fn unsupported(name: &str) -> DmsError {
    let supported: Vec<&str> = PROVIDERS.iter().map(|p| p.domain).collect();
    DmsError::MailSetup(format!(
        "unsupported email provider '{name}'; supported: {}",
        supported.join(", ")
    ))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Credentials {
    pub address: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: password.into(),
        }
    }

    /// The operator's address alone; enough for test-mode routing and dry runs.
    pub fn address_from_env<I, K, V>(vars: I) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        lookup(vars, ENV_ADDRESS).ok_or_else(|| {
            DmsError::MailSetup(format!(
                "{ENV_ADDRESS} is not set; set it to your email address"
            ))
        })
    }

    pub fn from_env<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: Vec<(K, V)> = vars.into_iter().collect();
        let address = Self::address_from_env(vars.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))?;
        let password = lookup(vars.iter().map(|(k, v)| (k.as_ref(), v.as_ref())), ENV_PASSWORD)
            .ok_or_else(|| {
                DmsError::MailSetup(format!(
                    "{ENV_PASSWORD} is not set; for Gmail use an App Password \
                     (enable 2FA first, then generate one)"
                ))
            })?;
        Ok(Self::new(address, password))
    }
}

fn lookup<I, K, V>(vars: I, key: &str) -> Option<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    vars.into_iter()
        .find(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Message building
// ---------------------------------------------------------------------------

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse::<Mailbox>()
        .map_err(|e| DmsError::MailSetup(format!("invalid sender address '{address}': {e}")))
}

fn build_message(from: &Mailbox, msg: &RenderedMessage) -> Result<Message> {
    let delivery = |reason: String| DmsError::Delivery {
        recipient: msg.recipient.clone(),
        reason,
    };
    let to: Mailbox = msg
        .recipient
        .parse()
        .map_err(|e| delivery(format!("invalid address: {e}")))?;
    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(msg.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(msg.body.clone())
        .map_err(|e| delivery(e.to_string()))
}

// ---------------------------------------------------------------------------
// SmtpMailer
// ---------------------------------------------------------------------------

pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport and verify the server accepts a connection, so
    /// setup problems surface before the first message of a batch.
    pub fn connect(creds: &Credentials, provider: Provider, timeout: Duration) -> Result<Self> {
        let from = mailbox(&creds.address)?;
        let transport = SmtpTransport::starttls_relay(provider.host)
            .map_err(|e| DmsError::MailSetup(format!("{}: {e}", provider.host)))?
            .port(provider.port)
            .credentials(SmtpCredentials::new(
                creds.address.clone(),
                creds.password.clone(),
            ))
            .timeout(Some(timeout))
            .build();

        match transport.test_connection() {
            Ok(true) => {}
            Ok(false) => {
                return Err(DmsError::MailSetup(format!(
                    "{}:{} did not accept the connection",
                    provider.host, provider.port
                )))
            }
            Err(e) => {
                return Err(DmsError::MailSetup(format!(
                    "failed to connect to {}:{}: {e}; check the address and app password",
                    provider.host, provider.port
                )))
            }
        }

        tracing::info!(host = provider.host, port = provider.port, "connected to mail server");
        Ok(Self { transport, from })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, message: &RenderedMessage) -> Result<()> {
        let email = build_message(&self.from, message)?;
        self.transport
            .send(&email)
            .map(|_| ())
            .map_err(|e| DmsError::Delivery {
                recipient: message.recipient.clone(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// OutboxMailer
// ---------------------------------------------------------------------------

pub struct OutboxMailer {
    transport: FileTransport,
    from: Mailbox,
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(dir: impl AsRef<Path>, from: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            transport: FileTransport::new(&dir),
            from: mailbox(from)?,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Mailer for OutboxMailer {
    fn send(&self, message: &RenderedMessage) -> Result<()> {
        let email = build_message(&self.from, message)?;
        self.transport
            .send(&email)
            .map(|_| ())
            .map_err(|e| DmsError::Delivery {
                recipient: message.recipient.clone(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
