pub mod envelope;
pub mod http_poll;
pub mod socket;

pub use envelope::{Command, Envelope};
pub use http_poll::HttpPollTransport;
pub use socket::{backoff_delay, SocketTransport};

use serde::{Deserialize, Serialize};

/// Which wire transport a slave uses to talk to the master. Chosen at slave
/// startup; a slave never switches mode mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Socket,
    HttpPoll,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Socket
    }
}
