// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Email summaries of finished runs.

use crate::config::format_duration;
use crate::report::Report;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Validated SMTP delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSettings {
    pub from: String,
    pub to: Vec<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub starttls: bool,
    pub subject_prefix: String,
}

/// A composed message, independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// File name and bytes of the JSON report.
    pub attachment: Option<(String, Vec<u8>)>,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("invalid content type: {0}")]
    ContentType(String),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

pub fn compose(report: &Report, settings: &EmailSettings) -> Result<Notification, MailError> {
    let subject = format!(
        "{} {} - {} (backend={} reboot={})",
        settings.subject_prefix, report.hostname, report.status, report.backend, report.reboot_required
    );
    let name = report
        .report_path
        .as_deref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report.json".to_string());

    Ok(Notification {
        from: settings.from.clone(),
        to: settings.to.clone(),
        subject,
        body: body(report),
        attachment: Some((name, report.to_json()?)),
    })
}

fn rfc3339(t: time::OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.to_string())
}

fn body(report: &Report) -> String {
    let mut lines = vec![
        format!("{} report", report.app),
        String::new(),
        format!("Host: {}", report.hostname),
        format!("Status: {}", report.status),
        format!("Backend: {}", report.backend),
        format!("Patched: {}", report.patched),
        format!("Reboot required: {}", report.reboot_required),
    ];
    if let Some(reason) = &report.reboot_reason {
        lines.push(format!("Reboot reason: {}", reason.trim()));
    }
    lines.push(format!("Started: {}", rfc3339(report.started)));
    lines.push(format!("Ended:   {}", rfc3339(report.ended)));
    lines.push(format!(
        "Duration: {}",
        format_duration(report.whole_seconds())
    ));
    lines.push(String::new());
    lines.push("Notes:".to_string());
    lines.extend(report.notes.iter().map(|n| format!("- {n}")));
    lines.push("- The attached JSON contains full command output and step timing.".to_string());
    lines.push(
        "- If you enable reboot_policy=reboot, the service may reboot the host automatically."
            .to_string(),
    );
    if let Some(error) = &report.error {
        lines.push(String::new());
        lines.push("Error:".to_string());
        lines.push(error.clone());
    }
    lines.join("\n")
}

/// Multipart message: plain-text summary plus the JSON attachment.
pub fn build_message(n: &Notification) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(n.from.parse::<Mailbox>()?)
        .subject(n.subject.clone());
    for to in &n.to {
        builder = builder.to(to.parse::<Mailbox>()?);
    }

    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(n.body.clone()));
    if let Some((name, bytes)) = &n.attachment {
        let json = ContentType::parse("application/json")
            .map_err(|e| MailError::ContentType(e.to_string()))?;
        parts = parts.singlepart(Attachment::new(name.clone()).body(bytes.clone(), json));
    }
    Ok(builder.multipart(parts)?)
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    settings: EmailSettings,
}

impl SmtpMailer {
    pub fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let s = &self.settings;
        let tls = if s.starttls {
            Tls::Opportunistic(TlsParameters::new(s.smtp_host.clone())?)
        } else {
            Tls::None
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&s.smtp_host)
            .port(s.smtp_port)
            .tls(tls)
            .timeout(Some(SMTP_TIMEOUT));
        if !s.username.is_empty() || !s.password.is_empty() {
            builder = builder.credentials(Credentials::new(s.username.clone(), s.password.clone()));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, notification: &Notification) -> Result<(), MailError> {
        let message = build_message(notification)?;
        let transport = self.transport()?;
        let response = transport.send(message).await?;
        debug!(
            "smtp accepted report for {} recipient(s): {}",
            notification.to.len(),
            response.code()
        );
        Ok(())
    }
}
