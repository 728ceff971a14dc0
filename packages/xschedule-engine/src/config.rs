//! Per-device connection configuration

use std::time::Duration;

use xschedule_client::hash_credential;

/// Default interval between heartbeat status polls over the push channel
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Floor for the heartbeat interval; polling faster than this loads the
/// device for no benefit since it pushes real changes anyway
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// First reconnect delay after a lost push channel
const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Ceiling for the doubling reconnect delay
const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// WebSocket connect timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiescence window for coalescing status updates
const DEFAULT_UPDATE_DEBOUNCE: Duration = Duration::from_millis(200);

/// Configuration for one xSchedule device connection
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device hostname or IP address
    pub host: String,

    /// Device web port
    pub port: u16,

    /// Optional device credential (hashed before it leaves the process)
    pub password: Option<String>,

    /// Interval between heartbeat status queries on the push channel
    pub heartbeat_interval: Duration,

    /// First reconnect delay; doubles on each consecutive failure
    pub reconnect_initial_delay: Duration,

    /// Reconnect delay ceiling
    pub reconnect_max_delay: Duration,

    /// WebSocket connect timeout
    pub connect_timeout: Duration,

    /// Quiescence window for the debounced update notification
    pub update_debounce: Duration,
}

impl DeviceConfig {
    /// Configuration with defaults for a device at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            update_debounce: DEFAULT_UPDATE_DEBOUNCE,
        }
    }

    /// Set the device credential
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
        self
    }

    /// Set the heartbeat interval, clamped to the 30 s floor
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    /// Set the reconnect backoff range
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max.max(initial);
        self
    }

    /// Set the update debounce window
    pub fn with_update_debounce(mut self, window: Duration) -> Self {
        self.update_debounce = window;
        self
    }

    /// Base URL of the device HTTP API
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL of the device push channel
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    /// MD5 hex digest of the credential, if one is configured
    pub(crate) fn password_hash(&self) -> Option<String> {
        self.password.as_deref().map(hash_credential)
    }
}
