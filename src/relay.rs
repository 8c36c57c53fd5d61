//! The bus relay event loop.
//!
//! A single task owns the listener and every connection. Each iteration:
//!
//! ```text
//! wait_for_readiness ──► service_listener ──► service_connections ──► extract_and_broadcast
//!        ▲                                                                     │
//!        └─────────────────────────── reap closed ◄────────────────────────────┘
//! ```
//!
//! Waiting is the only suspension point apart from writes to peers. Frames
//! from one connection are relayed in the order they arrived; frames from
//! different connections are relayed in the order the sweep reaches them.
//!
//! Buffers are capped per connection (`max_buffered_bytes`), but there is no
//! outbound queue: a slow reader stalls the loop for up to the write timeout on
//! each frame before it is dropped.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::select_all;
use tokio::net::{UnixListener, UnixStream};

use crate::broadcast::{Broadcaster, Delivery};
use crate::config::Config;
use crate::framing::{Frame, FrameBuffer};
use crate::message::Message;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};

/// What woke the loop up.
#[derive(Debug)]
enum Readiness {
    /// The listener produced a connection (or an accept error).
    Listener(io::Result<UnixStream>),
    /// A connection became readable or hung up.
    Connection(ConnectionId, io::Result<()>),
}

/// One frame relayed during an iteration, with its log description.
#[derive(Debug)]
struct Relayed {
    origin: ConnectionId,
    message: Message,
    delivery: Delivery,
}

/// Local-socket relay that rebroadcasts each frame to every other client.
#[derive(Debug)]
pub struct Relay {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: ConnectionRegistry,
    broadcaster: Broadcaster,
    max_buffered_bytes: usize,
    read_buf: Vec<u8>,
}

impl Relay {
    /// Bind the relay's listening socket.
    ///
    /// Removes any stale socket file left by a previous run before binding.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or the socket cannot
    /// be bound.
    pub fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        let socket_path = config.socket_path.clone();

        // There can be only one relay per path
        match std::fs::remove_file(&socket_path) {
            Ok(()) => log::info!("[Relay] Removed stale socket: {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket: {}", socket_path.display())
                });
            }
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        // Convert std listener to tokio async listener
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Relay] Listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            registry: ConnectionRegistry::new(),
            broadcaster: Broadcaster::new(config.write_timeout()),
            max_buffered_bytes: config.max_buffered_bytes,
            read_buf: vec![0u8; config.read_chunk_size],
        })
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connections currently registered.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run until the process is terminated.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, then remove the socket file.
    ///
    /// Shutdown is only observed while waiting for readiness, so an iteration
    /// that has started always finishes its fan-out.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let readiness = tokio::select! {
                () = &mut shutdown => None,
                readiness = self.wait_for_readiness() => Some(readiness),
            };
            let Some(readiness) = readiness else {
                break;
            };
            for relayed in self.step(readiness).await {
                if !relayed.delivery.failed.is_empty() {
                    log::warn!(
                        "[Relay] {}: {} missed by {} peer(s)",
                        relayed.origin,
                        relayed.message,
                        relayed.delivery.failed.len()
                    );
                }
            }
        }

        self.shutdown()
    }

    /// Suspend until the listener or any active connection is ready.
    async fn wait_for_readiness(&self) -> Readiness {
        let readable: Vec<_> = self
            .registry
            .iter()
            .filter(|(_, conn)| conn.is_active())
            .map(|(id, conn)| Box::pin(async move { (id, conn.stream.readable().await) }))
            .collect();

        if readable.is_empty() {
            let accepted = self.listener.accept().await;
            return Readiness::Listener(accepted.map(|(stream, _addr)| stream));
        }

        tokio::select! {
            accepted = self.listener.accept() => {
                Readiness::Listener(accepted.map(|(stream, _addr)| stream))
            }
            ((id, result), _index, _rest) = select_all(readable) => {
                Readiness::Connection(id, result)
            }
        }
    }

    /// One full iteration after a wake-up.
    async fn step(&mut self, readiness: Readiness) -> Vec<Relayed> {
        match readiness {
            Readiness::Listener(Ok(stream)) => {
                self.service_listener(stream);
            }
            Readiness::Listener(Err(e)) => {
                log::error!("[Relay] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Readiness::Connection(id, Err(e)) => {
                log::warn!("[Relay] Readiness error for {id}: {e}");
                self.registry.unregister(id);
            }
            Readiness::Connection(_, Ok(())) => {}
        }

        let updated = self.service_connections();
        let relayed = self.extract_and_broadcast(&updated).await;

        for id in self.registry.reap_closed() {
            log::info!("[Relay] Client dropped: {id}");
        }
        relayed
    }

    /// Register a freshly accepted connection.
    fn service_listener(&mut self, stream: UnixStream) -> ConnectionId {
        let buffer = FrameBuffer::with_limit(self.max_buffered_bytes);
        let id = self.registry.register(Connection::new(stream, buffer));
        log::info!(
            "[Relay] Client connected: {id} ({} connected)",
            self.registry.len()
        );
        id
    }

    /// Issue one bounded read on every ready connection.
    ///
    /// Returns the connections that buffered new bytes. Hung-up and failing
    /// connections are unregistered on the spot; the sweep walks a snapshot.
    fn service_connections(&mut self) -> Vec<ConnectionId> {
        let mut updated = Vec::new();

        for id in self.registry.active_ids() {
            let Some(conn) = self.registry.get_mut(id) else {
                continue;
            };

            match conn.stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    // EOF — client disconnected
                    self.registry.unregister(id);
                    log::info!("[Relay] Client disconnected: {id}");
                }
                Ok(n) => match conn.buffer.append(&self.read_buf[..n]) {
                    Ok(()) => updated.push(id),
                    Err(e) => {
                        log::warn!("[Relay] Dropping {id}: {e}");
                        self.registry.unregister(id);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::warn!("[Relay] Read error for {id}: {e}");
                    self.registry.unregister(id);
                }
            }
        }

        updated
    }

    /// Relay every frame completed by this iteration's reads.
    async fn extract_and_broadcast(&mut self, updated: &[ConnectionId]) -> Vec<Relayed> {
        let mut relayed = Vec::new();

        for &origin in updated {
            let frames: Vec<Frame> = match self.registry.get_mut(origin) {
                Some(conn) => conn.buffer.extract_all().collect(),
                None => continue,
            };

            for frame in frames {
                let message = Message::decode(frame.payload());
                log::info!("[Relay] {origin}: {message}");
                let delivery = self
                    .broadcaster
                    .broadcast(&mut self.registry, origin, &frame)
                    .await;
                relayed.push(Relayed {
                    origin,
                    message,
                    delivery,
                });
            }
        }

        relayed
    }

    /// Remove the socket file.
    fn shutdown(self) -> Result<()> {
        log::info!(
            "[Relay] Shutting down with {} client(s) connected",
            self.registry.len()
        );
        drop(self.listener);
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove socket: {}", self.socket_path.display())
            }),
        }
    }
}
