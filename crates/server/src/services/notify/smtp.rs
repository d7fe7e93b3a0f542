//! Email delivery over SMTP.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, MultiPart, SinglePart, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use secrecy::ExposeSecret;

use super::{BuildError, Channel, Destination, Notifier, NotifyError, OtpMessage};
use crate::config::SmtpConfig;

/// Sends codes as multipart (text + HTML) email through a STARTTLS relay.
///
/// Building the transport does not open a connection; the relay is first
/// contacted on `send`.
#[derive(Clone)]
pub struct SmtpNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    /// Create a notifier from SMTP settings.
    ///
    /// # Errors
    ///
    /// Returns `BuildError` if the from-address does not parse or the relay
    /// host is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self, BuildError> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|_| BuildError::InvalidAddress(config.from_address.clone()))?;

        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(credentials)
            .build();

        Ok(Self { mailer, from })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &OtpMessage,
    ) -> Result<(), NotifyError> {
        let Destination::Email(to) = destination else {
            return Err(NotifyError::UnsupportedDestination {
                channel: self.channel(),
                destination: destination.masked(),
            });
        };

        let to: Mailbox = to
            .as_str()
            .parse()
            .map_err(|_| NotifyError::InvalidAddress(to.masked()))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(message.render_text()?),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(message.render_html()?),
                    ),
            )
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        tracing::info!(to = %destination.masked(), reference = %message.reference, "Sent login code email");
        Ok(())
    }
}
