//! Connection management for the warren client
//!
//! One reader task demultiplexes inbound frames by channel id; one writer task
//! owns the outbound half of the socket and receives whole frame batches, so
//! a publish triplet is never interleaved with another channel's frames.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use warren::protocol::constants::*;
use warren::protocol::{
    ChannelIdAllocator, Close, CodecError, ConnectionMethod, ConnectionOpen, ConnectionStartOk,
    FieldTable, FieldValue, Frame, FrameCodec, FrameType, Method,
};

use crate::channel::{Channel, ChannelShared};
use crate::{ClientConfig, ClientError, Result};

type Transport = Framed<TcpStream, FrameCodec>;
type FrameSink = SplitSink<Transport, Frame>;
type FrameStream = SplitStream<Transport>;

const OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug)]
struct ConnectionState {
    allocator: ChannelIdAllocator,
    channels: HashMap<u16, Arc<ChannelShared>>,
    closed: Option<(u16, String)>,
    close_ok: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct ConnectionInner {
    config: ClientConfig,
    peer: SocketAddr,
    frame_max: usize,
    outbound: mpsc::Sender<Vec<Frame>>,
    state: Mutex<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An open connection to a broker. Clones share the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect with [`ClientConfig::default`].
    pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::dial_with_config(addr, ClientConfig::default()).await
    }

    /// TCP connect, protocol header and the `start/start-ok/open/open-ok`
    /// exchange, all bounded by `connect_timeout`.
    pub async fn dial_with_config<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        timeout(connect_timeout, Self::connect(addr, config))
            .await
            .map_err(|_| ClientError::timeout(connect_timeout.as_millis() as u64))?
    }

    async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        stream.write_all(&PROTOCOL_HEADER).await?;

        let codec = FrameCodec::new(config.frame_max);
        let frame_max = codec.frame_max();
        let mut transport = Framed::new(stream, codec);
        Self::handshake(&mut transport, &config).await?;

        let (sink, frames) = transport.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(async move {
            if let Err(e) = write_loop(sink, outbound_rx).await {
                debug!("Writer stopped: {}", e);
            }
        });

        let inner = Arc::new(ConnectionInner {
            state: Mutex::new(ConnectionState {
                allocator: ChannelIdAllocator::new(config.max_channels),
                channels: HashMap::new(),
                closed: None,
                close_ok: None,
            }),
            config,
            peer,
            frame_max,
            outbound,
            tasks: Mutex::new(Vec::new()),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), frames));
        inner.tasks.lock().extend([reader, writer]);

        info!(%peer, "Connected to warren broker");
        Ok(Self { inner })
    }

    async fn handshake(transport: &mut Transport, config: &ClientConfig) -> Result<()> {
        let start = match next_method(transport).await? {
            Method::Connection(ConnectionMethod::Start(start)) => start,
            other => return Err(ClientError::handshake(format!("unexpected {}", other.name()))),
        };
        if !start
            .mechanisms
            .split_whitespace()
            .any(|mechanism| mechanism == MECHANISM_PLAIN)
        {
            return Err(ClientError::handshake(format!(
                "broker offers no PLAIN mechanism ({})",
                start.mechanisms
            )));
        }
        debug!(
            version = %format!("{}-{}", start.version_major, start.version_minor),
            "Broker sent connection.start"
        );

        let mut client_properties = FieldTable::new();
        client_properties.insert("product".into(), FieldValue::from("warren-client"));
        client_properties.insert("version".into(), FieldValue::from(crate::VERSION));
        let start_ok = Method::Connection(ConnectionMethod::StartOk(ConnectionStartOk {
            client_properties,
            mechanism: MECHANISM_PLAIN.to_string(),
            response: config.plain_response(),
            locale: "en_US".to_string(),
        }));
        let open = Method::Connection(ConnectionMethod::Open(ConnectionOpen {
            virtual_host: config.virtual_host.clone(),
        }));
        transport.feed(Frame::method(CONNECTION_CHANNEL, &start_ok)?).await?;
        transport.send(Frame::method(CONNECTION_CHANNEL, &open)?).await?;

        match next_method(transport).await? {
            Method::Connection(ConnectionMethod::OpenOk) => Ok(()),
            Method::Connection(ConnectionMethod::Close(close)) => {
                let ok = Method::Connection(ConnectionMethod::CloseOk);
                let _ = transport.send(Frame::method(CONNECTION_CHANNEL, &ok)?).await;
                Err(ClientError::handshake(format!(
                    "{} {}",
                    close.reply_code, close.reply_text
                )))
            }
            other => Err(ClientError::handshake(format!("unexpected {}", other.name()))),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().closed.is_none()
    }

    /// Allocate the next channel id and open the channel.
    pub async fn channel(&self) -> Result<Channel> {
        let shared = {
            let mut state = self.inner.state.lock();
            if let Some((code, text)) = &state.closed {
                return Err(ClientError::ConnectionClosed {
                    code: *code,
                    text: text.clone(),
                });
            }
            let id = state.allocator.next()?;
            let shared = Arc::new(ChannelShared::new(
                id,
                self.inner.outbound.clone(),
                self.inner.frame_max,
                &self.inner.config,
            ));
            state.channels.insert(id, Arc::clone(&shared));
            shared
        };

        let channel = Channel::new(shared);
        if let Err(e) = channel.open().await {
            self.inner.state.lock().channels.remove(&channel.id());
            return Err(e);
        }
        debug!(channel = channel.id(), "Channel opened");
        Ok(channel)
    }

    /// Send `connection.close` and wait for `close-ok`. Every channel fails
    /// with [`ClientError::ConnectionClosed`] afterwards.
    pub async fn close(&self) -> Result<()> {
        let (close_ok_tx, close_ok_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed.is_some() {
                return Ok(());
            }
            state.closed = Some((REPLY_SUCCESS, "closed by client".to_string()));
            state.close_ok = Some(close_ok_tx);
        }

        let close = Method::Connection(ConnectionMethod::Close(Close::normal()));
        let frame = Frame::method(CONNECTION_CHANNEL, &close)?;
        if self.inner.outbound.send(vec![frame]).await.is_ok()
            && timeout(self.inner.config.rpc_timeout, close_ok_rx).await.is_err()
        {
            warn!(peer = %self.inner.peer, "No connection.close-ok before timeout");
        }

        self.inner.shutdown();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(peer = %self.inner.peer, "Connection closed");
        Ok(())
    }
}

impl ConnectionInner {
    /// Fail every channel with the recorded close reason.
    fn shutdown(&self) {
        let (channels, code, text) = {
            let mut state = self.state.lock();
            let (code, text) = state
                .closed
                .get_or_insert_with(|| (0, "connection lost".to_string()))
                .clone();
            if let Some(close_ok) = state.close_ok.take() {
                let _ = close_ok.send(());
            }
            let channels: Vec<_> = state.channels.drain().map(|(_, c)| c).collect();
            (channels, code, text)
        };
        for channel in channels {
            channel.fail_connection(code, &text);
        }
    }

    /// Returns `true` when the connection is finished.
    async fn on_connection_frame(&self, frame: Frame) -> bool {
        if frame.frame_type != FrameType::Method {
            warn!("Content frame on channel 0 ignored");
            return false;
        }
        match frame.decode_method() {
            Ok(Method::Connection(ConnectionMethod::Close(close))) => {
                warn!(
                    code = close.reply_code,
                    "Broker closed connection: {}", close.reply_text
                );
                {
                    let mut state = self.state.lock();
                    if state.closed.is_none() {
                        state.closed = Some((close.reply_code, close.reply_text));
                    }
                }
                let ok = Method::Connection(ConnectionMethod::CloseOk);
                if let Ok(frame) = Frame::method(CONNECTION_CHANNEL, &ok) {
                    let _ = self.outbound.send(vec![frame]).await;
                }
                true
            }
            Ok(Method::Connection(ConnectionMethod::CloseOk)) => true,
            Ok(other) => {
                warn!("Unexpected {} on channel 0", other.name());
                false
            }
            Err(e) => {
                warn!("Undecodable method on channel 0: {}", e);
                false
            }
        }
    }
}

async fn next_method(transport: &mut Transport) -> Result<Method> {
    match transport.next().await {
        Some(Ok(frame))
            if frame.channel == CONNECTION_CHANNEL && frame.frame_type == FrameType::Method =>
        {
            Ok(frame.decode_method()?)
        }
        Some(Ok(frame)) => Err(ClientError::handshake(format!(
            "unexpected frame on channel {} during handshake",
            frame.channel
        ))),
        // The broker answers an unknown protocol header with its own header
        Some(Err(CodecError::BadFrameType(_))) => {
            Err(ClientError::handshake("broker rejected the protocol header"))
        }
        Some(Err(e)) => Err(e.into()),
        None => Err(ClientError::handshake("broker closed the socket during handshake")),
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut frames: FrameStream) {
    loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(peer = %inner.peer, "Connection read failed: {}", e);
                break;
            }
            None => {
                debug!(peer = %inner.peer, "Broker closed the socket");
                break;
            }
        };

        if frame.channel == CONNECTION_CHANNEL {
            if inner.on_connection_frame(frame).await {
                break;
            }
            continue;
        }

        let id = frame.channel;
        let channel = inner.state.lock().channels.get(&id).cloned();
        match channel {
            Some(channel) => {
                if channel.handle_frame(frame).await {
                    inner.state.lock().channels.remove(&id);
                }
            }
            None => debug!(channel = id, "Frame for unknown channel dropped"),
        }
    }
    inner.shutdown();
}

/// Single writer for the socket. Batches whatever is queued before flushing.
async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Vec<Frame>>,
) -> std::result::Result<(), CodecError> {
    while let Some(frames) = outbound.recv().await {
        for frame in frames {
            sink.feed(frame).await?;
        }
        while let Ok(frames) = outbound.try_recv() {
            for frame in frames {
                sink.feed(frame).await?;
            }
        }
        sink.flush().await?;
    }
    sink.close().await?;
    Ok(())
}
