//! SMS delivery through the Twilio Messages API.

use async_trait::async_trait;
use otp_login_core::PhoneNumber;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use super::{BuildError, Channel, Destination, Notifier, NotifyError, OtpMessage};
use crate::config::TwilioConfig;

const TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Longest provider error body kept in a [`NotifyError::Provider`].
const MAX_ERROR_BODY: usize = 512;

/// Sends codes as SMS via `POST /2010-04-01/Accounts/{sid}/Messages.json`.
#[derive(Clone)]
pub struct TwilioNotifier {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: SecretString,
    from_number: PhoneNumber,
}

impl TwilioNotifier {
    /// Create a notifier from Twilio settings.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Http` if the HTTP client cannot be built.
    pub fn new(config: &TwilioConfig) -> Result<Self, BuildError> {
        let client = Client::builder()
            .user_agent(concat!("otp-login/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: TWILIO_API_BASE.to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        })
    }

    /// Point the notifier at a different API host (test doubles, regional
    /// edges).
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &OtpMessage,
    ) -> Result<(), NotifyError> {
        let Destination::Phone(to) = destination else {
            return Err(NotifyError::UnsupportedDestination {
                channel: self.channel(),
                destination: destination.masked(),
            });
        };

        let body = message.render_sms()?;
        let form = [
            ("To", to.as_str()),
            ("From", self.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(
                body.char_indices()
                    .nth(MAX_ERROR_BODY)
                    .map_or(body.len(), |(i, _)| i),
            );
            tracing::warn!(status = %status, to = %to.masked(), "Twilio rejected message");
            return Err(NotifyError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(to = %to.masked(), reference = %message.reference, "Sent login code SMS");
        Ok(())
    }
}
