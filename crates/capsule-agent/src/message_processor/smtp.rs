// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SMTP [`Mailer`] backed by lettre.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::email_worker::{EmailPayload, MailError, Mailer};

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmtpTls {
    /// TLS from the first byte (SMTPS, port 465)
    Wrapper,
    /// Plain connection upgraded with STARTTLS (port 587)
    #[default]
    StartTls,
    /// Plaintext; local relays only
    None,
}

impl FromStr for SmtpTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrapper" | "tls" | "smtps" => Ok(Self::Wrapper),
            "starttls" => Ok(Self::StartTls),
            "none" | "plain" => Ok(Self::None),
            other => Err(format!("unknown SMTP TLS mode '{other}'")),
        }
    }
}

/// SMTP relay settings.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Relay host name
    pub host: String,
    /// Port override; the TLS mode picks the default
    pub port: Option<u16>,
    /// Login, if the relay requires authentication
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<String>,
    /// Sender mailbox
    pub from: String,
    /// Connection security
    pub tls: SmtpTls,
    /// Upper bound for one SMTP command
    pub timeout: Duration,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from", &self.from)
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Sends email through an SMTP relay over a pooled connection.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport. No connection is made until the first send.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MailError::InvalidMessage(format!("invalid sender '{}': {e}", config.from)))?;

        let mut builder = match config.tls {
            SmtpTls::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::InvalidMessage(e.to_string()))?,
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::InvalidMessage(e.to_string()))?,
            SmtpTls::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
            }
        };
        if let Some(port) = config.port {
            builder = builder.port(port);
        }
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            transport: builder.timeout(Some(config.timeout)).build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &EmailPayload) -> Result<(), MailError> {
        let message = build_message(&self.from, email)?;
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| classify(&e))
    }
}

fn build_message(from: &Mailbox, email: &EmailPayload) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(email.subject.as_str())
        .header(ContentType::TEXT_PLAIN);
    for to in email.to.iter().filter(|to| !to.trim().is_empty()) {
        let mailbox: Mailbox = to
            .parse()
            .map_err(|e| MailError::InvalidMessage(format!("invalid recipient '{to}': {e}")))?;
        builder = builder.to(mailbox);
    }
    builder
        .body(email.body.clone())
        .map_err(|e| MailError::InvalidMessage(e.to_string()))
}

/// 5xx replies and client-side errors are final; connection, TLS, timeout and
/// 4xx failures may clear up.
fn classify(err: &smtp::Error) -> MailError {
    if err.is_permanent() || err.is_client() {
        MailError::Rejected(err.to_string())
    } else {
        MailError::Unavailable(err.to_string())
    }
}
