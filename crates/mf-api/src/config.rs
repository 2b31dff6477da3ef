use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    /// Deadline applied to calls whose body carries no `timeout_secs`.
    pub default_timeout: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".into())
            .parse()
            .expect("LISTEN_ADDR must be a valid socket address");

        // 0 leaves each backend's own poller bounds in charge.
        let default_timeout = env::var("CALL_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse::<u64>().expect("CALL_TIMEOUT_SECS must be a valid u64"))
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            listen_addr,
            control_plane_api_key: env::var("CONTROL_PLANE_API_KEY")
                .expect("CONTROL_PLANE_API_KEY must be set"),
            default_timeout,
        }
    }
}
