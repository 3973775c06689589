//! TCP+mTLS transport using tokio-rustls.
//!
//! Wire format: [4-byte LE length][protobuf envelope bytes]
//! A connection carries any number of request/response exchanges, one at a
//! time; the response echoes the request's `msg_id`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use node_crypto::TransportIdentity;
use node_proto::mesh::Envelope;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

pub const MAX_ENVELOPE_BYTES: usize = 4 * 1024 * 1024;

/// A long-lived mTLS client connection to one peer.
///
/// A failed exchange drops the stream; the next request dials again.
pub struct TlsConnection {
    peer_id: String,
    address: String,
    identity: Arc<TransportIdentity>,
    dial_timeout: Duration,
    stream: Mutex<Option<TlsStream<TcpStream>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnection")
            .field("peer_id", &self.peer_id)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TlsConnection {
    /// Dial `address` and complete the handshake, requiring the server
    /// certificate to name `peer_id`.
    pub async fn connect(
        identity: Arc<TransportIdentity>,
        peer_id: &str,
        address: &str,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let stream = dial(&identity, peer_id, address, dial_timeout).await?;
        debug!("connected to {peer_id} at {address}");
        Ok(Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            identity,
            dial_timeout,
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send `envelope` and wait up to `deadline` for the matching response.
    pub async fn request(&self, envelope: &Envelope, deadline: Duration) -> Result<Envelope> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = dial(&self.identity, &self.peer_id, &self.address, self.dial_timeout).await?;
            debug!("redialled {} at {}", self.peer_id, self.address);
            *guard = Some(stream);
            self.connected.store(true, Ordering::Release);
        }
        let Some(stream) = guard.as_mut() else {
            anyhow::bail!("no stream to {}", self.peer_id);
        };

        let exchange = async {
            write_envelope(stream, envelope).await?;
            read_envelope(stream).await
        };
        let result = match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "request {} to {} timed out after {deadline:?}",
                envelope.kind(),
                self.peer_id
            )),
        };

        match result {
            Ok(response) if response.msg_id == envelope.msg_id => Ok(response),
            Ok(response) => {
                self.mark_broken(&mut guard);
                anyhow::bail!(
                    "response id {} does not match request {}",
                    response.msg_id,
                    envelope.msg_id
                )
            }
            Err(e) => {
                self.mark_broken(&mut guard);
                Err(e.context(format!("request to {} at {}", self.peer_id, self.address)))
            }
        }
    }

    fn mark_broken(&self, stream: &mut Option<TlsStream<TcpStream>>) {
        *stream = None;
        self.connected.store(false, Ordering::Release);
    }

    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream
                .shutdown()
                .await
                .with_context(|| format!("close connection to {}", self.peer_id))?;
        }
        Ok(())
    }
}

async fn dial(
    identity: &TransportIdentity,
    peer_id: &str,
    address: &str,
    dial_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(identity.client_config());
    let server_name = identity.server_name_for(peer_id)?;
    let handshake = async {
        let tcp = TcpStream::connect(address)
            .await
            .with_context(|| format!("connect to {address}"))?;
        tcp.set_nodelay(true).ok();
        connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {peer_id} at {address}"))
    };
    tokio::time::timeout(dial_timeout, handshake)
        .await
        .map_err(|_| anyhow::anyhow!("dial {peer_id} at {address} timed out after {dial_timeout:?}"))?
}

/// Answers one request envelope. `caller` is the verified certificate subject
/// of the remote node.
#[async_trait::async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, caller: &str, envelope: Envelope) -> Envelope;
}

/// A TCP+mTLS listener that dispatches envelopes to a handler.
pub struct TcpServer {
    acceptor: TlsAcceptor,
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(identity: &TransportIdentity, addr: &str) -> Result<Self> {
        let acceptor = TlsAcceptor::from(identity.server_config());
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        debug!("TcpServer listening on {}", listener.local_addr()?);
        Ok(Self { acceptor, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `shutdown` turns true, then wait for open
    /// connections to finish their current exchange.
    pub async fn serve(
        self,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut connections = JoinSet::new();
        let draining = shutdown.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (tcp, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let acceptor = self.acceptor.clone();
                    let handler = handler.clone();
                    let shutdown = draining.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(acceptor, tcp, peer_addr, handler, shutdown).await {
                            debug!("connection from {peer_addr} closed: {e:#}");
                        }
                    });
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(self.listener);
        while connections.join_next().await.is_some() {}
        debug!("TcpServer stopped");
        Ok(())
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn EnvelopeHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut tls = acceptor
        .accept(tcp)
        .await
        .with_context(|| format!("TLS accept from {peer_addr}"))?;
    let caller = peer_identity(&tls)?;
    debug!("accepted {caller} from {peer_addr}");

    loop {
        let envelope = tokio::select! {
            read = read_envelope(&mut tls) => match read {
                Ok(envelope) => envelope,
                Err(e) if is_eof(&e) => break,
                Err(e) => return Err(e),
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        debug!("{caller} -> {} ({})", envelope.kind(), envelope.msg_id);
        let response = handler.handle(&caller, envelope).await;
        write_envelope(&mut tls, &response).await?;
    }
    let _ = tls.shutdown().await;
    Ok(())
}

/// Subject of the verified client certificate.
fn peer_identity(tls: &tokio_rustls::server::TlsStream<TcpStream>) -> Result<String> {
    let certs = tls
        .get_ref()
        .1
        .peer_certificates()
        .context("peer presented no certificate")?;
    let leaf = certs.first().context("peer certificate chain is empty")?;
    node_crypto::common_name_from_der(leaf)
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
    })
}

pub async fn write_envelope<W: AsyncWriteExt + Unpin>(writer: &mut W, env: &Envelope) -> Result<()> {
    let data = env.encode_to_vec();
    anyhow::ensure!(
        data.len() <= MAX_ENVELOPE_BYTES,
        "envelope too large: {} bytes",
        data.len()
    );
    let len = (data.len() as u32).to_le_bytes();
    writer.write_all(&len).await.context("write length")?;
    writer.write_all(&data).await.context("write payload")?;
    writer.flush().await.context("flush")?;
    Ok(())
}

pub async fn read_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("read length")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_ENVELOPE_BYTES, "envelope too large: {len} bytes");

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.context("read payload")?;
    Envelope::decode(data.as_slice()).context("decode envelope")
}
