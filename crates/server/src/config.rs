//! OTP login configuration loaded from environment variables.
//!
//! Loaded once at startup into [`OtpLoginConfig`] and passed around inside
//! `AppState`; nothing reads the environment after that.
//!
//! # Environment Variables
//!
//! ## Required
//! - `OTP_BASE_URL` - Public URL of the application (decides secure cookies)
//! - `OTP_SERVICES` - Service table, `name=kind` pairs separated by commas,
//!   e.g. `sms=twilio,email=smtp`. Kinds: `smtp`, `twilio`, `log`
//! - `OTP_DEFAULT_SERVICE` - Service used when the form issues a code
//!
//! ## Optional
//! - `OTP_HOST` - Bind address (default: 127.0.0.1)
//! - `OTP_PORT` - Listen port (default: 3000)
//! - `OTP_DATABASE_URL` - `PostgreSQL` session store (fallback: `DATABASE_URL`,
//!   otherwise sessions are kept in memory)
//! - `OTP_ENABLED` - Set to `false` to let every session through the guard
//! - `OTP_CODE_LENGTH` - Digits per code (default: 6, range 4-10)
//! - `OTP_TTL_SECS` - Code lifetime (default: 300)
//! - `OTP_MAX_ATTEMPTS` - Wrong submissions before lockout (default: 5)
//! - `OTP_SEND_TIMEOUT_SECS` - Transport timeout (default: 10)
//! - `OTP_REDIRECT_TO` - Where to go after verification (default: /)
//! - `OTP_LOGIN_URL` - First-factor login page (default: /login)
//! - `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`, `SMTP_FROM`
//! - `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN`, `TWILIO_FROM_NUMBER`
//! - `SENTRY_DSN`, `SENTRY_ENVIRONMENT`, `SENTRY_SAMPLE_RATE`,
//!   `SENTRY_TRACES_SAMPLE_RATE`

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use otp_login_core::{OtpPolicy, PhoneNumber};
use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "xxx",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Transport implementation a service name points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Email over SMTP.
    Smtp,
    /// SMS through the Twilio Messages API.
    Twilio,
    /// Log the code instead of sending it (development).
    Log,
}

impl ServiceKind {
    /// Name used in `OTP_SERVICES`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Twilio => "twilio",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smtp" | "email" => Ok(Self::Smtp),
            "twilio" | "sms" => Ok(Self::Twilio),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown service kind '{other}'")),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct OtpLoginConfig {
    /// `PostgreSQL` URL for the session store (contains password)
    pub database_url: Option<SecretString>,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Public base URL
    pub base_url: String,
    /// Verification flow settings
    pub otp: OtpSettings,
    /// SMTP transport settings (required by `smtp` services)
    pub smtp: Option<SmtpConfig>,
    /// Twilio transport settings (required by `twilio` services)
    pub twilio: Option<TwilioConfig>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "production")
    pub sentry_environment: Option<String>,
    /// Sentry error sample rate (0.0 to 1.0)
    pub sentry_sample_rate: f32,
    /// Sentry traces sample rate (0.0 to 1.0)
    pub sentry_traces_sample_rate: f32,
}

/// Settings for issuing and checking codes.
#[derive(Debug, Clone)]
pub struct OtpSettings {
    /// When false the verification guard lets everyone through
    pub enabled: bool,
    /// Service name to path-of-implementation table
    pub services: BTreeMap<String, ServiceKind>,
    /// Service used when the form issues a code
    pub default_service: String,
    /// Code length, lifetime and attempt limit
    pub policy: OtpPolicy,
    /// Upper bound on a single transport call
    pub send_timeout: Duration,
    /// Redirect target after successful verification
    pub redirect_to: String,
    /// First-factor login page for unauthenticated visitors
    pub login_url: String,
}

/// SMTP relay configuration.
///
/// Implements `Debug` manually to redact the password.
#[derive(Clone)]
pub struct SmtpConfig {
    /// SMTP server hostname
    pub host: String,
    /// SMTP server port
    pub port: u16,
    /// SMTP authentication username
    pub username: String,
    /// SMTP authentication password
    pub password: SecretString,
    /// Sender address (From header)
    pub from_address: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// Twilio Messages API configuration.
///
/// Implements `Debug` manually to redact the auth token.
#[derive(Clone)]
pub struct TwilioConfig {
    /// Account SID (used as the basic-auth username)
    pub account_sid: String,
    /// Auth token
    pub auth_token: SecretString,
    /// Sending number in E.164 format
    pub from_number: PhoneNumber,
}

impl fmt::Debug for TwilioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("from_number", &self.from_number)
            .finish()
    }
}

impl OtpLoginConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid,
    /// if the service table is malformed, or if a secret fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("OTP_DATABASE_URL");
        let host = parse_env_or("OTP_HOST", IpAddr::from([127, 0, 0, 1]))?;
        let port = parse_env_or("OTP_PORT", 3000_u16)?;
        let base_url = get_required_env("OTP_BASE_URL")?;
        Url::parse(&base_url)
            .map_err(|e| ConfigError::InvalidEnvVar("OTP_BASE_URL".to_string(), e.to_string()))?;

        let otp = OtpSettings::from_env()?;
        let smtp = SmtpConfig::from_env()?;
        let twilio = TwilioConfig::from_env()?;
        validate_transports(&otp.services, smtp.as_ref(), twilio.as_ref())?;

        let sentry_dsn = get_optional_env("SENTRY_DSN");
        let sentry_environment = get_optional_env("SENTRY_ENVIRONMENT");
        let sentry_sample_rate = get_optional_env("SENTRY_SAMPLE_RATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1.0);
        let sentry_traces_sample_rate = get_optional_env("SENTRY_TRACES_SAMPLE_RATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.1);

        Ok(Self {
            database_url,
            host,
            port,
            base_url,
            otp,
            smtp,
            twilio,
            sentry_dsn,
            sentry_environment,
            sentry_sample_rate,
            sentry_traces_sample_rate,
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether cookies should be marked `Secure`.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

impl OtpSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let services = parse_services(&get_required_env("OTP_SERVICES")?)?;
        let default_service = get_required_env("OTP_DEFAULT_SERVICE")?;
        validate_default_service(&services, &default_service)?;

        let policy = OtpPolicy::new(
            parse_env_or("OTP_CODE_LENGTH", OtpPolicy::DEFAULT_CODE_LENGTH)?,
            parse_env_or("OTP_TTL_SECS", OtpPolicy::DEFAULT_TTL_SECS)?,
            parse_env_or("OTP_MAX_ATTEMPTS", OtpPolicy::DEFAULT_MAX_ATTEMPTS)?,
        )
        .map_err(|e| ConfigError::InvalidEnvVar("OTP_*".to_string(), e.to_string()))?;

        let timeout_secs: u64 = parse_env_or("OTP_SEND_TIMEOUT_SECS", 10)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "OTP_SEND_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            enabled: parse_env_or("OTP_ENABLED", true)?,
            services,
            default_service,
            policy,
            send_timeout: Duration::from_secs(timeout_secs),
            redirect_to: get_env_or_default("OTP_REDIRECT_TO", "/"),
            login_url: get_env_or_default("OTP_LOGIN_URL", "/login"),
        })
    }
}

impl SmtpConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let host = get_optional_env("SMTP_HOST");
        let username = get_optional_env("SMTP_USERNAME");
        let password = get_optional_env("SMTP_PASSWORD");
        let from_address = get_optional_env("SMTP_FROM");

        match (host, username, password, from_address) {
            (Some(host), Some(username), Some(password), Some(from_address)) => Ok(Some(Self {
                host,
                port: parse_env_or("SMTP_PORT", 587)?,
                username,
                password: SecretString::from(password),
                from_address,
            })),
            (None, None, None, None) => Ok(None),
            _ => Err(ConfigError::InvalidEnvVar(
                "SMTP_*".to_string(),
                "SMTP_HOST, SMTP_USERNAME, SMTP_PASSWORD and SMTP_FROM must be set together"
                    .to_string(),
            )),
        }
    }
}

impl TwilioConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let account_sid = get_optional_env("TWILIO_ACCOUNT_SID");
        let auth_token = get_optional_env("TWILIO_AUTH_TOKEN");
        let from_number = get_optional_env("TWILIO_FROM_NUMBER");

        match (account_sid, auth_token, from_number) {
            (Some(account_sid), Some(token), Some(from)) => {
                validate_secret_strength(&token, "TWILIO_AUTH_TOKEN")?;
                let from_number = PhoneNumber::parse(&from).map_err(|e| {
                    ConfigError::InvalidEnvVar("TWILIO_FROM_NUMBER".to_string(), e.to_string())
                })?;
                Ok(Some(Self {
                    account_sid,
                    auth_token: SecretString::from(token),
                    from_number,
                }))
            }
            (None, None, None) => Ok(None),
            _ => Err(ConfigError::InvalidEnvVar(
                "TWILIO_*".to_string(),
                "TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_FROM_NUMBER must be set together"
                    .to_string(),
            )),
        }
    }
}

// =============================================================================
// Service Table Parsing
// =============================================================================

/// Parse `OTP_SERVICES` (`name=kind,name=kind`).
///
/// Names are lowercase ASCII letters, digits, `-` or `_`. Duplicate names
/// and an empty table are rejected.
pub fn parse_services(raw: &str) -> Result<BTreeMap<String, ServiceKind>, ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidEnvVar("OTP_SERVICES".to_string(), msg);
    let mut services = BTreeMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, kind) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected name=kind, got '{entry}'")))?;
        let name = name.trim();

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid(format!("invalid service name '{name}'")));
        }

        let kind = kind.parse::<ServiceKind>().map_err(invalid)?;

        if services.insert(name.to_string(), kind).is_some() {
            return Err(invalid(format!("service '{name}' is listed twice")));
        }
    }

    if services.is_empty() {
        return Err(invalid("at least one service must be configured".to_string()));
    }

    Ok(services)
}

/// Check that the default service is one of the configured names.
pub fn validate_default_service(
    services: &BTreeMap<String, ServiceKind>,
    default_service: &str,
) -> Result<(), ConfigError> {
    if services.contains_key(default_service) {
        Ok(())
    } else {
        Err(ConfigError::InvalidEnvVar(
            "OTP_DEFAULT_SERVICE".to_string(),
            format!("'{default_service}' is not listed in OTP_SERVICES"),
        ))
    }
}

/// Check that every configured service has the settings its transport needs.
pub fn validate_transports(
    services: &BTreeMap<String, ServiceKind>,
    smtp: Option<&SmtpConfig>,
    twilio: Option<&TwilioConfig>,
) -> Result<(), ConfigError> {
    for (name, kind) in services {
        let missing = match kind {
            ServiceKind::Smtp if smtp.is_none() => "SMTP_*",
            ServiceKind::Twilio if twilio.is_none() => "TWILIO_*",
            _ => continue,
        };
        return Err(ConfigError::InvalidEnvVar(
            "OTP_SERVICES".to_string(),
            format!("service '{name}' uses {kind} but {missing} is not configured"),
        ));
    }
    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable. Empty values count as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    get_optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Parse an optional environment variable, falling back to `default`.
fn parse_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get_optional_env(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    })
}

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Option<SecretString> {
    get_optional_env(primary_key)
        .or_else(|| get_optional_env("DATABASE_URL"))
        .map(SecretString::from)
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1})"
            ),
        ));
    }

    Ok(())
}
