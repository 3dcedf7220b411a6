use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::protocol::{self, Envelope, Message, MAX_DATAGRAM_BYTES};

/// How long `stop` waits for the receive loop before aborting it.
const STOP_DEADLINE: Duration = Duration::from_secs(1);
/// Capacity of the inbound message channel handed to the engine.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Counters over the life of the socket, exposed for introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub send_errors: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    send_errors: AtomicU64,
    decode_errors: AtomicU64,
}

/// UDP transport bound to one local address.
///
/// `start` spawns the receive loop and returns the channel the loop feeds;
/// `stop` unblocks it promptly and leaves the socket bound so a later
/// `start` works on the same address. Both are idempotent.
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    recv_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Transport {
    /// Binds the datagram socket. A bind failure (address in use, bad host)
    /// is the one fatal transport error; everything after this point is
    /// best-effort.
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            recv_task: tokio::sync::Mutex::new(None),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Actual bound address; with a port-0 bind this is the address the
    /// node should advertise as its identity.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Starts the receive loop and returns the inbound message channel.
    /// Returns `None` if the loop is already running.
    pub async fn start(&self) -> Option<mpsc::Receiver<(Envelope, SocketAddr)>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Transport already started on {}", self.local_addr);
            return None;
        }
        self.shutdown_tx.send_replace(false);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let socket = self.socket.clone();
        let running = self.running.clone();
        let counters = self.counters.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES + 1];
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, remote_addr)) => {
                            match protocol::decode(&buf[..len]) {
                                Some(envelope) => {
                                    counters.received.fetch_add(1, Ordering::Relaxed);
                                    if inbound_tx.send((envelope, remote_addr)).await.is_err() {
                                        // Engine went away; nothing left to feed.
                                        break;
                                    }
                                }
                                None => {
                                    counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                                    tracing::warn!(
                                        "Dropping undecodable {}-byte datagram from {}",
                                        len,
                                        remote_addr
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            if !running.load(Ordering::SeqCst) {
                                // Socket errors after stop are expected; absorb.
                                break;
                            }
                            tracing::error!("Failed to receive datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            tracing::debug!("Receive loop exited");
        });

        *self.recv_task.lock().await = Some(handle);
        tracing::info!("Transport listening on {}", self.local_addr);
        Some(inbound_rx)
    }

    /// Signals the receive loop to exit and waits briefly for it. The
    /// socket stays bound, so `start` can be called again afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        if let Some(mut handle) = self.recv_task.lock().await.take() {
            match tokio::time::timeout(STOP_DEADLINE, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("Receive loop missed the stop deadline, aborting it");
                    handle.abort();
                }
            }
        }
        tracing::info!("Transport stopped on {}", self.local_addr);
    }

    /// Encodes and sends one message. Returns whether the datagram left the
    /// socket; failures are logged and counted, never propagated.
    pub async fn send_message(&self, message: Message, addr: &str) -> bool {
        let kind = message.kind();
        let Some(bytes) = protocol::encode(&Envelope::new(message)) else {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match self.socket.send_to(&bytes, addr).await {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Sent {} to {}", kind, addr);
                true
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Failed to send {} to {}: {}", kind, addr, e);
                false
            }
        }
    }

    /// Sends one message to every address, encoding it once. Returns how
    /// many sends succeeded.
    pub async fn broadcast_message(&self, message: Message, addresses: &[String]) -> usize {
        if addresses.is_empty() {
            return 0;
        }
        let kind = message.kind();
        let Some(bytes) = protocol::encode(&Envelope::new(message)) else {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        let mut sent = 0;
        for addr in addresses {
            match self.socket.send_to(&bytes, addr.as_str()).await {
                Ok(_) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    sent += 1;
                }
                Err(e) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Failed to broadcast {} to {}: {}", kind, addr, e);
                }
            }
        }
        tracing::trace!("Broadcast {} to {}/{} peers", kind, sent, addresses.len());
        sent
    }
}
