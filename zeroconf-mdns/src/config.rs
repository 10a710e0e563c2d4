use std::net::IpAddr;
use std::time::Duration;

/// Engine configuration.
#[derive(Default, Debug, Clone)]
pub struct DnsSdConfig {
    /// Host name to defend on the link. Only the first label is kept
    /// and qualified under `.local.`; defaults to `computer`.
    pub host_name: Option<String>,

    /// Interface address advertised in our A/AAAA record. Without one
    /// the engine can browse and resolve but publishes no address.
    pub local_addr: Option<IpAddr>,

    /// How long [`request_service_info`](crate::DnsSd::request_service_info)
    /// waits before reporting a resolve timeout. Defaults to 3 seconds.
    pub resolve_timeout: Option<Duration>,

    /// Seed for response jitter and probe backoff, for reproducible
    /// tests. Defaults to an OS-provided seed.
    pub seed: Option<u64>,
}

impl DnsSdConfig {
    pub fn new() -> Self {
        DnsSdConfig::default()
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn with_local_addr(mut self, local_addr: IpAddr) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    pub fn with_resolve_timeout(mut self, resolve_timeout: Duration) -> Self {
        self.resolve_timeout = Some(resolve_timeout);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
