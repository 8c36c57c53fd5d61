//! Fan-out of completed frames to every other connection.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::framing::Frame;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Result of delivering one frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Peers that received the full frame.
    pub delivered: Vec<ConnectionId>,
    /// Peers whose write failed or timed out; now marked closed.
    pub failed: Vec<ConnectionId>,
}

/// Writes frames to every peer except the one they came from.
///
/// Each write runs to completion or until `write_timeout` elapses. A peer that
/// errors or stalls is marked closed and the fan-out carries on with the rest.
#[derive(Debug, Clone, Copy)]
pub struct Broadcaster {
    write_timeout: Duration,
}

impl Broadcaster {
    /// Create a broadcaster that gives each peer `write_timeout` per frame.
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }

    /// Deliver `frame` unmodified to every active connection except `origin`.
    pub async fn broadcast(
        &self,
        registry: &mut ConnectionRegistry,
        origin: ConnectionId,
        frame: &Frame,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        for peer in registry.all_except(origin) {
            let Some(conn) = registry.get_mut(peer) else {
                continue;
            };

            let write = conn.stream.write_all(frame.as_bytes());
            match tokio::time::timeout(self.write_timeout, write).await {
                Ok(Ok(())) => delivery.delivered.push(peer),
                Ok(Err(e)) => {
                    log::warn!("[Relay] Write error for {peer}: {e}");
                    conn.close();
                    delivery.failed.push(peer);
                }
                Err(_) => {
                    log::warn!(
                        "[Relay] Write to {peer} timed out after {:?}, dropping",
                        self.write_timeout
                    );
                    conn.close();
                    delivery.failed.push(peer);
                }
            }
        }

        log::debug!(
            "[Relay] Frame from {origin} ({} bytes) delivered to {} peer(s)",
            frame.as_bytes().len(),
            delivery.delivered.len()
        );
        delivery
    }
}
