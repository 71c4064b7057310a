use std::net::IpAddr;
use std::time::Duration;

/// Well-known port TFTP servers listen on for new requests.
pub const DEFAULT_PORT: u16 = 69;
const TIMEOUT_SECS: u64 = 5;
const MAX_RETRIES: usize = 3;

/// Client configuration. The remote endpoint is fixed for the lifetime of a client, the rest
/// applies to every upload it performs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote host name or IP address.
    pub host: String,

    /// Port the server accepts requests on.
    pub port: u16,

    /// How long to wait for an acknowledgement before retransmitting.
    pub timeout: Duration,

    /// Retransmissions allowed per packet. The packet is sent `max_retries + 1` times at most.
    pub max_retries: usize,

    /// Local address to bind. Defaults to the unspecified address of the server's family.
    pub local_ip: Option<IpAddr>,

    /// Local port (our transfer identifier). A random one is picked when unset.
    pub local_port: Option<u16>,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> ClientConfig {
        ClientConfig {
            host: host.into(),
            ..ClientConfig::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            local_ip: None,
            local_port: None,
        }
    }
}
