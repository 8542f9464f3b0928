//! Configuration types for broker clients

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use herald_config::Vars;
use serde::{Deserialize, Serialize};

use crate::{BrokerError, RetryPolicy};

/// Client id used when `KAFKA_SERVICE_ID` is not set.
pub const DEFAULT_CLIENT_ID: &str = "default-service";

/// Broker list used when `KAFKA_BROKERS` is not set.
pub const DEFAULT_BROKER: &str = "localhost:9092";

/// Broker client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Client identity reported to the broker
    pub client_id: String,
    /// Bootstrap endpoints (`host:port`)
    pub brokers: Vec<String>,
    /// Consumer group used when a subscription does not name one
    pub group_id: Option<String>,
    /// Whether to use TLS
    #[serde(default)]
    pub tls: bool,
    /// TLS configuration
    pub tls_config: Option<TlsConfig>,
    /// SASL credentials; absent means unauthenticated plaintext
    pub credentials: Option<Credentials>,
    /// Timeout for establishing a connection
    pub connection_timeout: Duration,
    /// Timeout for the SASL handshake
    pub authentication_timeout: Duration,
    /// Timeout for a single broker request (one send attempt)
    pub request_timeout: Duration,
    /// Backoff applied to transient failures
    pub retry: RetryPolicy,
    /// Wait before a nacked message is delivered again
    pub redelivery_delay: Duration,
    /// Backend-specific options passed through verbatim
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            brokers: vec![DEFAULT_BROKER.to_string()],
            group_id: None,
            tls: false,
            tls_config: None,
            credentials: None,
            connection_timeout: Duration::from_millis(1000),
            authentication_timeout: Duration::from_millis(10_000),
            request_timeout: Duration::from_millis(30_000),
            retry: RetryPolicy::default(),
            redelivery_delay: Duration::from_millis(5000),
            options: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Create a new configuration for the given client id
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Load from `KAFKA_*` environment variables (after `.env`, if present).
    pub fn from_env() -> Result<Self, BrokerError> {
        let loader = herald_config::EnvLoader::with_prefix("KAFKA");
        loader.load_dotenv(None)?;
        Self::from_vars(&loader.load()?)
    }

    /// Build from variables loaded with the `KAFKA` prefix stripped.
    ///
    /// Supplying both `username` and `password` switches to the authenticated
    /// profile (TLS, SCRAM-SHA-256, 30 s timeouts, 100 ms x 8 retries) before
    /// explicit overrides are applied.
    pub fn from_vars(vars: &Vars) -> Result<Self, BrokerError> {
        let client_id = vars.get("service_id").unwrap_or(DEFAULT_CLIENT_ID).to_string();
        let mut config = Self::new(client_id.clone());

        if let Some(brokers) = vars.list("brokers").filter(|b| !b.is_empty()) {
            config.brokers = brokers;
        }
        config.group_id = Some(vars.get("group_id").unwrap_or(client_id.as_str()).to_string());

        match (vars.get("username"), vars.get("password")) {
            (Some(username), Some(password)) => {
                config = config.with_credentials(Credentials::scram_sha_256(username, password));
            }
            (None, None) => {}
            _ => {
                return Err(BrokerError::Configuration(
                    "KAFKA_USERNAME and KAFKA_PASSWORD must be set together".to_string(),
                ));
            }
        }

        if let Some(tls) = vars.flag("ssl")? {
            config.tls = tls;
        }
        if let Some(ms) = vars.parse::<u64>("connection_timeout_ms")? {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>("authentication_timeout_ms")? {
            config.authentication_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>("request_timeout_ms")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse::<u64>("retry_initial_delay_ms")? {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = vars.parse::<u32>("retry_retries")? {
            config.retry.retries = retries;
        }
        if let Some(factor) = vars.parse::<f64>("retry_factor")? {
            config.retry.factor = factor;
        }
        if let Some(multiplier) = vars.parse::<f64>("retry_multiplier")? {
            config.retry.multiplier = multiplier;
        }
        // `retry_delay_ms` is the older name for the redelivery delay.
        let redelivery = match vars.parse::<u64>("redelivery_delay_ms")? {
            Some(ms) => Some(ms),
            None => vars.parse::<u64>("retry_delay_ms")?,
        };
        if let Some(ms) = redelivery {
            config.redelivery_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the broker list
    pub fn with_brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default consumer group
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Apply credentials and the authenticated connection profile
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self.tls = true;
        self.connection_timeout = Duration::from_millis(30_000);
        self.authentication_timeout = Duration::from_millis(30_000);
        self.request_timeout = Duration::from_millis(30_000);
        self.retry.initial_delay = Duration::from_millis(100);
        self.retry.retries = 8;
        self
    }

    /// Enable TLS
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Set TLS configuration
    pub fn with_tls_config(mut self, config: TlsConfig) -> Self {
        self.tls = true;
        self.tls_config = Some(config);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the redelivery delay for nacked messages
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Set a custom option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Whether SASL authentication is configured
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Comma-separated broker list, as expected by `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.client_id.trim().is_empty() {
            return Err(BrokerError::Configuration("client id must not be empty".to_string()));
        }
        if self.brokers.is_empty() {
            return Err(BrokerError::Configuration(
                "at least one broker endpoint is required".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    /// Name as understood by librdkafka's `sasl.mechanism`
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Credentials {
    /// SCRAM-SHA-256 credentials
    pub fn scram_sha_256(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: SaslMechanism::ScramSha256,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to CA certificate file
    pub ca_cert: Option<String>,
    /// Path to client certificate file
    pub client_cert: Option<String>,
    /// Path to client key file
    pub client_key: Option<String>,
}

impl TlsConfig {
    /// Create a new TLS configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA certificate path
    pub fn with_ca_cert(mut self, path: impl Into<String>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    /// Set client certificate and key paths
    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        self.client_cert = Some(cert_path.into());
        self.client_key = Some(key_path.into());
        self
    }
}
