//! Point-to-point transport over TCP
//!
//! Every process owns one `TcpTransport` bound to its own address. Connections
//! start with a `Hello` exchange that tells each side who the peer is; the
//! peer must be the direct parent or a direct child. Agents listen (the
//! coordinator dials them), workers dial their agent.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{read_frame, write_frame, WireFrame};
use super::router::Router;
use super::{EnvelopeHandler, Transport};
use crate::error::{Result, SimulatorError};
use crate::protocol::{Envelope, SimulatorAddress};

const LINK_CAPACITY: usize = 256;

/// Bounded reconnect policy for outgoing connections
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    /// Attempts before giving up (default: 5)
    pub max_attempts: u32,
    /// Fixed delay between attempts (default: 1s)
    pub delay: Duration,
    /// Consecutive failures after which attempts are logged as warnings (default: 3)
    pub warn_after: u32,
    /// Bound on a single connect attempt (default: 5s)
    pub attempt_timeout: Duration,
    /// Bound on the hello exchange once connected (default: 10s)
    pub handshake_timeout: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            warn_after: 3,
            attempt_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// State shared with connection tasks
struct Shared {
    local: SimulatorAddress,
    router: Router,
    handler: RwLock<Option<Arc<dyn EnvelopeHandler>>>,
    next_link_id: AtomicU64,
    handshake_timeout: Duration,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn EnvelopeHandler>> {
        self.handler.read().ok().and_then(|guard| guard.clone())
    }

    /// Deliver locally and/or forward; `from` is the link the envelope arrived on
    async fn route(&self, envelope: Envelope, from: Option<SimulatorAddress>) -> Result<()> {
        let target = envelope.target();
        let route = self.router.plan(&target, from);

        if route.is_empty() {
            if let Some(address) = target.as_address() {
                warn!("Routing error at {}: no route to {}, dropping {}", self.local, address, envelope);
                return Err(SimulatorError::UnknownRoute(address.to_string()));
            }
            return Ok(());
        }

        for (peer, tx) in &route.hops {
            if tx.send(WireFrame::Envelope(envelope.clone())).await.is_err() {
                warn!("Link {} -> {} closed while forwarding {}", self.local, peer, envelope);
            }
        }

        if route.local {
            match self.handler() {
                Some(handler) => handler.handle(envelope).await,
                None => debug!("{} has no handler, dropping {}", self.local, envelope),
            }
        }
        Ok(())
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
    retry: ConnectRetry,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(local: SimulatorAddress, retry: ConnectRetry) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                local,
                router: Router::new(local),
                handler: RwLock::new(None),
                next_link_id: AtomicU64::new(1),
                handshake_timeout: retry.handshake_timeout,
            }),
            retry,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> SimulatorAddress {
        self.shared.local
    }

    /// Currently connected parent/children
    pub fn peers(&self) -> Vec<SimulatorAddress> {
        self.shared.router.peers()
    }

    /// Listen for incoming connections; returns the bound socket address
    pub async fn bind(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("{} listening on {}", self.shared.local, bound);

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("{} accepted connection from {}", shared.local, remote);
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = run_connection(shared.clone(), stream).await {
                                warn!("{}: inbound connection from {} failed: {}", shared.local, remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("{} accept failed: {}", shared.local, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
        Ok(bound)
    }

    /// Dial `endpoint` with the retry policy; returns the peer's address once linked
    pub async fn connect(&self, endpoint: &str) -> Result<SimulatorAddress> {
        let stream = self.dial(endpoint).await?;
        let (peer_tx, peer_rx) = tokio::sync::oneshot::channel();
        let shared = self.shared.clone();
        let endpoint_name = endpoint.to_string();

        let task = tokio::spawn(async move {
            let result = run_connection_with(shared.clone(), stream, Some(peer_tx)).await;
            if let Err(e) = result {
                warn!("{}: connection to {} ended: {}", shared.local, endpoint_name, e);
            }
        });
        self.tasks.lock().await.push(task);

        match tokio::time::timeout(self.retry.handshake_timeout, peer_rx).await {
            Ok(Ok(peer)) => Ok(peer),
            _ => Err(SimulatorError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                attempts: 1,
                reason: "handshake did not complete".into(),
            }),
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<TcpStream> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts.max(1) {
            let attempted = tokio::time::timeout(self.retry.attempt_timeout, TcpStream::connect(endpoint))
                .await
                .unwrap_or_else(|_| {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.retry.attempt_timeout),
                    ))
                });
            match attempted {
                Ok(stream) => {
                    if attempt > 1 {
                        info!("{} connected to {} after {} attempts", self.shared.local, endpoint, attempt);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt >= self.retry.warn_after {
                        warn!(
                            "{} failed to connect to {} (attempt {}/{}): {}",
                            self.shared.local, endpoint, attempt, self.retry.max_attempts, e
                        );
                    } else {
                        debug!(
                            "{} failed to connect to {} (attempt {}/{}): {}",
                            self.shared.local, endpoint, attempt, self.retry.max_attempts, e
                        );
                    }
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }
        Err(SimulatorError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }
}

async fn run_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    run_connection_with(shared, stream, None).await
}

/// Handshake, register the link, then pump frames until the connection drops
async fn run_connection_with(
    shared: Arc<Shared>,
    stream: TcpStream,
    on_linked: Option<tokio::sync::oneshot::Sender<SimulatorAddress>>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_frame(&mut write_half, &WireFrame::Hello { address: shared.local }).await?;
    let peer = match tokio::time::timeout(shared.handshake_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Some(WireFrame::Hello { address }))) => address,
        Ok(Ok(Some(_))) => {
            return Err(SimulatorError::Protocol("expected hello as first frame".into()))
        }
        Ok(Ok(None)) => return Err(SimulatorError::ConnectionLost("closed during handshake".into())),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(SimulatorError::Protocol("handshake timed out".into())),
    };

    let link_id = shared.next_link_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<WireFrame>(LINK_CAPACITY);
    shared.router.add_link(peer, link_id, tx)?;
    info!("{} linked with {}", shared.local, peer);
    if let Some(on_linked) = on_linked {
        let _ = on_linked.send(peer);
    }

    let writer_local = shared.local;
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                warn!("{} failed writing to {}: {}", writer_local, peer, e);
                break;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(WireFrame::Envelope(envelope))) => {
                // Routing errors for inbound envelopes are logged inside `route`
                let _ = shared.route(envelope, Some(peer)).await;
            }
            Ok(Some(WireFrame::Hello { address })) => {
                warn!("{} ignoring repeated hello from {} ({})", shared.local, peer, address);
            }
            Ok(None) => break Ok(()),
            Err(SimulatorError::MalformedFrame(reason)) => {
                warn!("{} dropping malformed frame from {}: {}", shared.local, peer, reason);
            }
            Err(e) => break Err(e),
        }
    };

    shared.router.remove_link(&peer, link_id);
    writer.abort();
    match &result {
        Ok(()) => info!("{} lost connection to {}", shared.local, peer),
        Err(e) => warn!("{} lost connection to {}: {}", shared.local, peer, e),
    }
    result
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SimulatorError::TransportClosed);
        }
        self.shared.route(envelope, None).await
    }

    fn on_receive(&self, local: SimulatorAddress, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        if local != self.shared.local {
            return Err(SimulatorError::Protocol(format!(
                "transport of {} cannot receive for {}",
                self.shared.local, local
            )));
        }
        let mut slot = self
            .shared
            .handler
            .write()
            .map_err(|_| SimulatorError::Protocol("handler lock poisoned".into()))?;
        *slot = Some(handler);
        Ok(())
    }

    fn detach(&self, local: SimulatorAddress) {
        if local == self.shared.local {
            if let Ok(mut slot) = self.shared.handler.write() {
                *slot = None;
            }
        }
    }

    async fn ensure_route(&self, address: SimulatorAddress, endpoint: &str) -> Result<()> {
        if self.shared.router.has_link(&address) {
            return Ok(());
        }
        let peer = self.connect(endpoint).await?;
        if peer != address {
            return Err(SimulatorError::Protocol(format!(
                "expected {address} at {endpoint}, found {peer}"
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.router.clear();
        self.detach(self.shared.local);
        info!("{} transport closed", self.shared.local);
    }
}
