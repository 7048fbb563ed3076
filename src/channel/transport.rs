//! Transport bindings for the sync channel.
//!
//! The core only sees `Link`: something that can send one kind of message and
//! receive another. A closed link (`recv` returning `None`) is how both sides
//! learn about a disconnect. `SyncTransport` is the backend-side capability to
//! open such a link to the proxy; the platform-specific bindings implement it.

use super::protocol::{MAX_FRAME_LENGTH, SyncMessage, SyncRequest, decode_line, encode_line};
use crate::error::{Result, SyncError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

#[async_trait]
pub trait Link<Out, In>: Send
where
    Out: Send + 'static,
    In: Send + 'static,
{
    async fn send(&mut self, item: Out) -> Result<()>;

    /// `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<In>>;

    /// Human readable peer address for logs.
    fn peer(&self) -> String;
}

/// Backend end of a connection: sends requests, receives changes.
pub type SyncConnection = Box<dyn Link<SyncRequest, SyncMessage>>;

/// Proxy end of a connection: sends changes, receives requests.
pub type PeerConnection = Box<dyn Link<SyncMessage, SyncRequest>>;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn connect(&self) -> Result<SyncConnection>;

    fn describe(&self) -> String;
}

// --- TCP ---

/// Newline-delimited JSON over a TCP stream.
pub struct FramedLink<Out, In> {
    framed: Framed<TcpStream, LinesCodec>,
    peer: String,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> FramedLink<Out, In> {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
            peer,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Out, In> Link<Out, In> for FramedLink<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn send(&mut self, item: Out) -> Result<()> {
        let line = encode_line(&item)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| SyncError::TransportFailure(format!("send to {}: {}", self.peer, e)))
    }

    async fn recv(&mut self) -> Option<Result<In>> {
        match self.framed.next().await? {
            Ok(line) => Some(decode_line(&line)),
            Err(e) => Some(Err(SyncError::TransportFailure(format!(
                "read from {}: {}",
                self.peer, e
            )))),
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

pub struct TcpTransport {
    proxy_addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }
}

#[async_trait]
impl SyncTransport for TcpTransport {
    async fn connect(&self) -> Result<SyncConnection> {
        let stream = TcpStream::connect(self.proxy_addr).await.map_err(|e| {
            SyncError::TransportFailure(format!("connect to {}: {}", self.proxy_addr, e))
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(FramedLink::<SyncRequest, SyncMessage>::new(stream)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.proxy_addr)
    }
}

/// Accepts backend connections on the proxy side.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<PeerConnection> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!("Accepted sync connection from {}", addr);
        Ok(Box::new(FramedLink::<SyncMessage, SyncRequest>::new(stream)))
    }
}

// --- In-process ---

/// One end of an in-process channel pair.
pub struct MemoryLink<Out, In> {
    tx: mpsc::UnboundedSender<Out>,
    rx: mpsc::UnboundedReceiver<In>,
    peer: String,
}

/// Two connected in-process ends.
pub fn memory_pair<A, B>(label: &str) -> (MemoryLink<A, B>, MemoryLink<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryLink {
            tx: a_tx,
            rx: b_rx,
            peer: format!("memory://{}/proxy", label),
        },
        MemoryLink {
            tx: b_tx,
            rx: a_rx,
            peer: format!("memory://{}/backend", label),
        },
    )
}

#[async_trait]
impl<Out, In> Link<Out, In> for MemoryLink<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    async fn send(&mut self, item: Out) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| SyncError::TransportFailure(format!("{} closed", self.peer)))
    }

    async fn recv(&mut self) -> Option<Result<In>> {
        self.rx.recv().await.map(Ok)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Backend-side transport that hands connections to an in-process proxy.
#[derive(Clone)]
pub struct MemoryTransport {
    acceptor: mpsc::UnboundedSender<PeerConnection>,
    label: String,
}

/// Proxy-side counterpart of `MemoryTransport`.
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<PeerConnection>,
}

impl MemoryTransport {
    pub fn new(label: impl Into<String>) -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                acceptor: tx,
                label: label.into(),
            },
            MemoryAcceptor { incoming: rx },
        )
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn connect(&self) -> Result<SyncConnection> {
        let (backend_end, proxy_end) = memory_pair::<SyncRequest, SyncMessage>(&self.label);
        self.acceptor
            .send(Box::new(proxy_end))
            .map_err(|_| SyncError::TransportFailure("in-process proxy is gone".to_string()))?;
        Ok(Box::new(backend_end))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.label)
    }
}

impl MemoryAcceptor {
    /// `None` once every `MemoryTransport` handle is dropped.
    pub async fn accept(&mut self) -> Option<PeerConnection> {
        self.incoming.recv().await
    }
}
