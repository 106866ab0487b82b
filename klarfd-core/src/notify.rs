//! Operator alerts for quarantined files.
//!
//! Alerts are advisory. [`FailureNotifier::notify_failure`] never returns an
//! error; delivery problems are logged and dropped.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Where alerts go.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSettings {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub receiver: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail transport is not configured")]
    NotConfigured,

    #[error("mail transport IO error: {0}")]
    Io(#[from] io::Error),

    #[error("mail server did not answer within {0:?}")]
    Timeout(Duration),

    #[error("mail server rejected {stage}: {reply}")]
    Rejected { stage: &'static str, reply: String },
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(
        &self,
        recipient: &MailSettings,
        subject: &str,
        html_body: &str,
    ) -> Result<(), NotifyError>;
}

/// Used when no mail server is configured: the alert only reaches the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyTransport;

#[async_trait]
impl AlertTransport for LogOnlyTransport {
    async fn send(
        &self,
        _recipient: &MailSettings,
        subject: &str,
        _html_body: &str,
    ) -> Result<(), NotifyError> {
        warn!(target: "quarantine", %subject, "mailing disabled, alert not sent");
        Ok(())
    }
}

/// Minimal SMTP client: one message per connection, no auth, no TLS.
#[derive(Clone, Debug)]
pub struct SmtpTransport {
    timeout: Duration,
    helo_name: String,
}

impl Default for SmtpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl SmtpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            helo_name: "klarfd".to_string(),
        }
    }

    async fn deliver(
        &self,
        recipient: &MailSettings,
        subject: &str,
        html_body: &str,
    ) -> Result<(), NotifyError> {
        let stream = TcpStream::connect((recipient.host.as_str(), recipient.port)).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        read_reply(&mut reader, "greeting", &[220]).await?;
        command(&mut writer, &format!("HELO {}", self.helo_name)).await?;
        read_reply(&mut reader, "HELO", &[250]).await?;
        command(&mut writer, &format!("MAIL FROM:<{}>", recipient.sender)).await?;
        read_reply(&mut reader, "MAIL FROM", &[250]).await?;
        command(&mut writer, &format!("RCPT TO:<{}>", recipient.receiver)).await?;
        read_reply(&mut reader, "RCPT TO", &[250, 251]).await?;
        command(&mut writer, "DATA").await?;
        read_reply(&mut reader, "DATA", &[354]).await?;

        let message = compose(recipient, subject, html_body);
        writer.write_all(message.as_bytes()).await?;
        writer.write_all(b".\r\n").await?;
        writer.flush().await?;
        read_reply(&mut reader, "message", &[250]).await?;

        // The message is accepted at this point; a sloppy QUIT is not a failure.
        if command(&mut writer, "QUIT").await.is_ok() {
            let _ = read_reply(&mut reader, "QUIT", &[221]).await;
        }
        Ok(())
    }
}

#[async_trait]
impl AlertTransport for SmtpTransport {
    async fn send(
        &self,
        recipient: &MailSettings,
        subject: &str,
        html_body: &str,
    ) -> Result<(), NotifyError> {
        if recipient.host.trim().is_empty() || recipient.receiver.trim().is_empty() {
            return Err(NotifyError::NotConfigured);
        }
        tokio::time::timeout(self.timeout, self.deliver(recipient, subject, html_body))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))?
    }
}

async fn command<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(target: "quarantine", smtp = %line, "smtp command");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// Read one (possibly multi-line) reply and check its code.
async fn read_reply<R>(
    reader: &mut R,
    stage: &'static str,
    accepted: &[u16],
) -> Result<(), NotifyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut reply = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(NotifyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed during {stage}"),
            )));
        }
        let line = line.trim_end();
        reply.push_str(line);
        // "250-..." continues, "250 ..." ends the reply.
        if line.as_bytes().get(3) != Some(&b'-') {
            break;
        }
        reply.push(' ');
    }

    let code = reply.get(..3).and_then(|code| code.parse::<u16>().ok());
    match code {
        Some(code) if accepted.contains(&code) => Ok(()),
        _ => Err(NotifyError::Rejected { stage, reply }),
    }
}

fn compose(recipient: &MailSettings, subject: &str, html_body: &str) -> String {
    let mut message = String::new();
    message.push_str(&format!("From: {}\r\n", recipient.sender));
    message.push_str(&format!("To: {}\r\n", recipient.receiver));
    message.push_str(&format!("Subject: {subject}\r\n"));
    message.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/html; charset=\"utf-8\"\r\n\r\n");
    for line in html_body.lines() {
        // Dot-stuffing so a body line cannot end the DATA section.
        if line.starts_with('.') {
            message.push('.');
        }
        message.push_str(line);
        message.push_str("\r\n");
    }
    message
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Composes failure alerts and hands them to a transport.
#[derive(Clone)]
pub struct FailureNotifier {
    transport: Arc<dyn AlertTransport>,
    recipient: MailSettings,
}

impl fmt::Debug for FailureNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureNotifier")
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

impl FailureNotifier {
    pub fn new(transport: Arc<dyn AlertTransport>, recipient: MailSettings) -> Self {
        Self {
            transport,
            recipient,
        }
    }

    /// Notifier that only logs.
    pub fn log_only() -> Self {
        Self::new(Arc::new(LogOnlyTransport), MailSettings::default())
    }

    pub fn subject(file: &str) -> String {
        format!("Clustering - Error on {file}")
    }

    pub fn message(file: &str, error_dir: &Path) -> String {
        format!("{file} processing failed, moved to {}", error_dir.display())
    }

    /// Send a best-effort alert about `file`. Returns the alert text so it
    /// can be logged alongside the failure.
    pub async fn notify_failure(&self, file: &str, error_dir: &Path) -> String {
        let message = Self::message(file, error_dir);
        let html = format!(
            "<html>\n  <body>\n    <p>{}</p>\n  </body>\n</html>\n",
            escape_html(&message)
        );

        match self
            .transport
            .send(&self.recipient, &Self::subject(file), &html)
            .await
        {
            Ok(()) => debug!(target: "quarantine", %file, "failure alert sent"),
            Err(err) => error!(
                target: "quarantine",
                %file,
                error = %err,
                critical = true,
                "failed to send failure alert"
            ),
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake SMTP server: replies with `script` in order and returns what the client sent.
    async fn fake_server(script: Vec<&'static str>) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut transcript = String::new();
            let mut in_data = false;

            writer.write_all(b"220 fake ready\r\n").await.unwrap();
            let mut replies = script.into_iter();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                transcript.push_str(&line);
                if in_data && line != ".\r\n" {
                    continue;
                }
                in_data = false;
                let Some(reply) = replies.next() else { break };
                writer.write_all(reply.as_bytes()).await.unwrap();
                writer.write_all(b"\r\n").await.unwrap();
                if reply.starts_with("354") {
                    in_data = true;
                }
            }
            transcript
        });
        (port, handle)
    }

    fn settings(port: u16) -> MailSettings {
        MailSettings {
            host: "127.0.0.1".into(),
            port,
            sender: "klarfd@fab.local".into(),
            receiver: "ops@fab.local".into(),
        }
    }

    #[tokio::test]
    async fn smtp_dialogue_delivers_html_message() {
        let (port, server) = fake_server(vec![
            "250-fake\r\n250 OK",
            "250 sender ok",
            "250 rcpt ok",
            "354 go ahead",
            "250 queued",
            "221 bye",
        ])
        .await;

        SmtpTransport::new(Duration::from_secs(5))
            .send(&settings(port), "Clustering - Error on a.klarf", "<p>x</p>\n.hidden")
            .await
            .unwrap();

        let transcript = server.await.unwrap();
        assert!(transcript.contains("MAIL FROM:<klarfd@fab.local>\r\n"));
        assert!(transcript.contains("RCPT TO:<ops@fab.local>\r\n"));
        assert!(transcript.contains("Subject: Clustering - Error on a.klarf\r\n"));
        assert!(transcript.contains("Content-Type: text/html"));
        assert!(transcript.contains("\r\n..hidden\r\n"));
        assert!(transcript.ends_with("QUIT\r\n"));
    }

    #[tokio::test]
    async fn rejected_recipient_is_an_error() {
        let (port, _server) = fake_server(vec!["250 hi", "250 ok", "550 no such user"]).await;

        let err = SmtpTransport::new(Duration::from_secs(5))
            .send(&settings(port), "s", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { stage: "RCPT TO", .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_host_is_not_configured() {
        let err = SmtpTransport::default()
            .send(&MailSettings::default(), "s", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }

    #[tokio::test]
    async fn notifier_swallows_transport_failures() {
        let notifier =
            FailureNotifier::new(Arc::new(SmtpTransport::default()), MailSettings::default());
        let message = notifier
            .notify_failure("a.klarf", Path::new("/data/error"))
            .await;
        assert_eq!(message, "a.klarf processing failed, moved to /data/error");
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }
}
