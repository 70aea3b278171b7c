//! Request endpoint of a node.
//!
//! Peers forward bucket operations for keys this node owns, and clients ask
//! it for admission decisions. Every frame is
//! `[u32 payload_len BE][u32 crc32 BE][JSON payload]`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cluster::Cluster;
use crate::error::LimiterError;
use crate::http::{admit, rate_limit_key, HttpReply};
use crate::ratelimit::{BucketCommand, BucketReply, RateLimiterService};
use crate::store::StoreError;

/// Largest accepted frame payload.
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    /// A bucket operation on a key the receiving node owns.
    Bucket(BucketCommand),
    /// Admit one request from `client_address` to `operation`.
    Admit {
        client_address: String,
        operation: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    Bucket(BucketReply),
    Admitted(HttpReply),
    Failed(RemoteError),
}

/// A failure reported by the node that handled a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The node is cut off from the cluster and refuses forwarded operations.
    Partitioned,
    InvalidRequest { requested: u64, capacity: u64 },
    Unavailable(String),
}

impl From<LimiterError> for RemoteError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::InvalidRequest {
                requested,
                capacity,
            } => RemoteError::InvalidRequest {
                requested,
                capacity,
            },
            LimiterError::StoreUnavailable(message) => RemoteError::Unavailable(message),
        }
    }
}

impl From<RemoteError> for LimiterError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Partitioned => StoreError::Partitioned.into(),
            RemoteError::InvalidRequest {
                requested,
                capacity,
            } => LimiterError::InvalidRequest {
                requested,
                capacity,
            },
            RemoteError::Unavailable(message) => LimiterError::StoreUnavailable(message),
        }
    }
}

/// Write one frame holding `value`.
async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload =
        serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes", payload.len()),
            )
        })?;

    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&len.to_be_bytes());
    header[4..].copy_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one frame and decode its payload.
async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    if crc32fast::hash(&payload) != checksum {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame checksum mismatch",
        ));
    }
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serves a node's request endpoint.
pub struct NodeServer {
    service: RateLimiterService,
    cluster: Option<Arc<Cluster>>,
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("node_id", &self.cluster.as_ref().map(|c| c.node_id()))
            .finish()
    }
}

impl NodeServer {
    pub fn new(service: RateLimiterService, cluster: Option<Arc<Cluster>>) -> Self {
        Self { service, cluster }
    }

    /// Answer one request.
    pub async fn handle(&self, request: NodeRequest) -> NodeResponse {
        match request {
            NodeRequest::Bucket(command) => {
                if self.cluster.as_ref().is_some_and(|c| c.is_isolated()) {
                    debug!(key = %command.store_key(), "Refusing forwarded operation while isolated");
                    return NodeResponse::Failed(RemoteError::Partitioned);
                }
                match self.service.engine().apply(command).await {
                    Ok(reply) => NodeResponse::Bucket(reply),
                    Err(err) => NodeResponse::Failed(err.into()),
                }
            }
            NodeRequest::Admit {
                client_address,
                operation,
            } => {
                let facade = self.service.facade(&operation);
                let key = rate_limit_key(&client_address, &operation);
                NodeResponse::Admitted(admit(&facade, &key).await)
            }
        }
    }

    /// Accept connections on `listener` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Request endpoint listening");
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %err, "Connection closed with error");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "Failed to accept connection"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Request endpoint stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        loop {
            let request: NodeRequest = match read_frame(&mut reader).await {
                Ok(request) => request,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            };
            let response = self.handle(request).await;
            write_frame(&mut writer, &response).await?;
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn open(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    async fn exchange(&mut self, request: &NodeRequest) -> io::Result<NodeResponse> {
        write_frame(&mut self.writer, request).await?;
        read_frame(&mut self.reader).await
    }
}

/// Client for another node's request endpoint over one reused connection.
pub struct NodeClient {
    addr: SocketAddr,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient").field("addr", &self.addr).finish()
    }
}

impl NodeClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connection: Mutex::new(None),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// The connection is taken out of the slot for the exchange and only put
    /// back once a response arrived, so a cancelled or failed call never
    /// leaves an unread response behind for the next caller.
    pub async fn call(&self, request: &NodeRequest) -> io::Result<NodeResponse> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => Connection::open(self.addr).await?,
        };
        let response = connection.exchange(request).await?;
        *slot = Some(connection);
        Ok(response)
    }

    /// Run a bucket operation on the remote node.
    pub async fn execute(&self, command: BucketCommand) -> Result<BucketReply, LimiterError> {
        match self.call(&NodeRequest::Bucket(command)).await {
            Ok(NodeResponse::Bucket(reply)) => Ok(reply),
            Ok(NodeResponse::Failed(err)) => Err(err.into()),
            Ok(other) => Err(LimiterError::StoreUnavailable(format!(
                "{} answered a bucket operation with {:?}",
                self.addr, other
            ))),
            Err(err) => Err(StoreError::Unavailable(format!("{}: {}", self.addr, err)).into()),
        }
    }

    /// Ask the remote node to admit one request.
    pub async fn admit(&self, client_address: &str, operation: &str) -> io::Result<HttpReply> {
        let request = NodeRequest::Admit {
            client_address: client_address.to_string(),
            operation: operation.to_string(),
        };
        match self.call(&request).await? {
            NodeResponse::Admitted(reply) => Ok(reply),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected response to admission: {:?}", other),
            )),
        }
    }
}
