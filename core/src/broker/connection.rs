//! Connection state machine.
//!
//! `handshaking -> started -> open -> closing -> closed`. The reader task
//! (this module) owns the inbound half of the socket and demultiplexes frames:
//! channel 0 is handled inline, every other channel id is forwarded to that
//! channel's task, spawning it on first use. All outbound traffic goes
//! through one writer task fed by a bounded queue of frame batches, so a
//! method/header/body triplet is never split by another channel's frames.

use futures::future::join_all;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelContext};
use super::{Broker, Lifecycle};
use crate::protocol::constants::*;
use crate::protocol::{
    Close, ConnectionMethod, ConnectionStart, FieldTable, FieldValue, Frame, FrameCodec,
    FrameType, Method, ProtocolError,
};
use crate::{Result, WarrenError};

type Transport = Framed<TcpStream, FrameCodec>;
type FrameSink = SplitSink<Transport, Frame>;
type FrameStream = SplitStream<Transport>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct ChannelHandle {
    inbox: mpsc::Sender<Frame>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    broker: Arc<Broker>,
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::Sender<Vec<Frame>>,
    channels: HashMap<u16, ChannelHandle>,
    errors_tx: mpsc::Sender<ProtocolError>,
    errors_rx: mpsc::Receiver<ProtocolError>,
    frame_max: usize,
}

impl Connection {
    /// Drive one client connection from the protocol header to teardown.
    pub async fn serve(
        broker: Arc<Broker>,
        mut stream: TcpStream,
        peer: SocketAddr,
        id: u64,
        lifecycle: Arc<Lifecycle>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        if !Self::accept_header(&mut stream).await? {
            warn!(%peer, "Rejected connection with unsupported protocol header");
            return Ok(());
        }

        let codec = FrameCodec::new(broker.config.frame_max);
        let frame_max = codec.frame_max();
        let mut transport = Framed::new(stream, codec);
        let close_timeout = Duration::from_millis(broker.config.close_timeout_ms);

        match timeout(HANDSHAKE_TIMEOUT, Self::handshake(&mut transport)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Ok(()),
            Ok(Err(WarrenError::Protocol(err))) => {
                Self::reject(&mut transport, &err, close_timeout).await;
                return Ok(());
            }
            Ok(Err(WarrenError::Codec(err))) => {
                Self::reject(&mut transport, &err.into(), close_timeout).await;
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(%peer, "Connection handshake timed out");
                return Ok(());
            }
        }

        broker.metrics.broker.connection_opened();
        info!(connection_id = id, %peer, "Connection opened");

        let (sink, frames) = transport.split();
        let (outbound, outbound_rx) = mpsc::channel(broker.config.outbound_capacity);
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let (errors_tx, errors_rx) = mpsc::channel(16);

        let mut connection = Connection {
            id,
            peer,
            broker,
            lifecycle,
            outbound,
            channels: HashMap::new(),
            errors_tx,
            errors_rx,
            frame_max,
        };
        let result = connection.run(frames, shutdown).await;
        connection.teardown().await;
        drop(connection);

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection_id = id, "Writer stopped: {}", e),
            Err(e) => warn!(connection_id = id, "Writer task failed: {}", e),
        }
        result
    }

    /// Read the 5-byte protocol header. A mismatch is answered with the
    /// header we speak and the socket is closed.
    async fn accept_header(stream: &mut TcpStream) -> Result<bool> {
        let mut header = [0u8; PROTOCOL_HEADER.len()];
        stream.read_exact(&mut header).await?;
        if header == PROTOCOL_HEADER {
            return Ok(true);
        }
        stream.write_all(&PROTOCOL_HEADER).await?;
        stream.shutdown().await?;
        Ok(false)
    }

    /// `start -> start-ok -> open -> open-ok`. Returns `false` when the client
    /// closed instead of opening.
    async fn handshake(transport: &mut Transport) -> Result<bool> {
        let mut server_properties = FieldTable::new();
        server_properties.insert("product".into(), FieldValue::from("warren"));
        server_properties.insert(
            "version".into(),
            FieldValue::from(env!("CARGO_PKG_VERSION")),
        );
        let start = Method::Connection(ConnectionMethod::Start(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: MECHANISM_PLAIN.to_string(),
            locales: "en_US".to_string(),
        }));
        transport.send(Frame::method(CONNECTION_CHANNEL, &start)?).await?;

        let mut started = false;
        loop {
            let Some(frame) = transport.next().await.transpose()? else {
                return Ok(false);
            };
            if frame.channel != CONNECTION_CHANNEL {
                return Err(ProtocolError::unexpected_frame(format!(
                    "frame on channel {} before connection.open",
                    frame.channel
                ))
                .into());
            }
            if frame.frame_type != FrameType::Method {
                return Err(ProtocolError::unexpected_frame("content frame during handshake").into());
            }

            match frame.decode_method()? {
                Method::Connection(ConnectionMethod::StartOk(ok)) if !started => {
                    if ok.mechanism != MECHANISM_PLAIN {
                        return Err(ProtocolError::hard(
                            ACCESS_REFUSED,
                            format!("unsupported mechanism '{}'", ok.mechanism),
                        )
                        .on(CLASS_CONNECTION, CONNECTION_START_OK)
                        .into());
                    }
                    started = true;
                }
                Method::Connection(ConnectionMethod::Open(open)) if started => {
                    debug!(virtual_host = %open.virtual_host, "Connection open requested");
                    let ok = Method::Connection(ConnectionMethod::OpenOk);
                    transport.send(Frame::method(CONNECTION_CHANNEL, &ok)?).await?;
                    return Ok(true);
                }
                Method::Connection(ConnectionMethod::Close(_)) => {
                    let ok = Method::Connection(ConnectionMethod::CloseOk);
                    transport.send(Frame::method(CONNECTION_CHANNEL, &ok)?).await?;
                    return Ok(false);
                }
                other => {
                    let (class_id, method_id) = other.id();
                    return Err(ProtocolError::command_invalid(format!(
                        "unexpected {} during handshake",
                        other.name()
                    ))
                    .on(class_id, method_id)
                    .into());
                }
            }
        }
    }

    /// Hard-close a connection that never opened.
    async fn reject(transport: &mut Transport, err: &ProtocolError, close_timeout: Duration) {
        warn!(code = err.code, "Rejecting connection: {}", err.text);
        let close = Method::Connection(ConnectionMethod::Close(Close::from(err)));
        let Ok(frame) = Frame::method(CONNECTION_CHANNEL, &close) else {
            return;
        };
        if transport.send(frame).await.is_err() {
            return;
        }
        let _ = timeout(close_timeout, async {
            while let Some(Ok(frame)) = transport.next().await {
                if is_close_reply(&frame) {
                    break;
                }
            }
        })
        .await;
    }

    async fn run(
        &mut self,
        mut frames: FrameStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                frame = frames.next() => frame,
                Some(err) = self.errors_rx.recv() => {
                    return self.hard_close(&mut frames, err).await;
                }
                _ = shutdown.recv() => {
                    let err = ProtocolError::hard(CONNECTION_FORCED, "broker shutting down");
                    return self.hard_close(&mut frames, err).await;
                }
            };

            let step = match next {
                None => {
                    debug!(connection_id = self.id, "Peer closed the socket");
                    return Ok(());
                }
                Some(Err(err)) => Err(WarrenError::Codec(err)),
                Some(Ok(frame)) if frame.channel == CONNECTION_CHANNEL => {
                    self.on_connection_frame(frame).await
                }
                Some(Ok(frame)) => self.route(frame).await.map(|()| Step::Continue),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Closed) => return Ok(()),
                Err(WarrenError::Protocol(err)) => return self.hard_close(&mut frames, err).await,
                Err(WarrenError::Codec(err)) => {
                    return self.hard_close(&mut frames, err.into()).await
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn on_connection_frame(&mut self, frame: Frame) -> Result<Step> {
        if frame.frame_type != FrameType::Method {
            return Err(ProtocolError::unexpected_frame("content frame on channel 0").into());
        }
        match frame.decode_method()? {
            Method::Connection(ConnectionMethod::Close(close)) => {
                info!(
                    connection_id = self.id,
                    code = close.reply_code,
                    "Client closed connection: {}",
                    close.reply_text
                );
                self.lifecycle.begin_close();
                self.stop_channels().await;
                let ok = Frame::method(
                    CONNECTION_CHANNEL,
                    &Method::Connection(ConnectionMethod::CloseOk),
                )?;
                let _ = self.outbound.send(vec![ok]).await;
                Ok(Step::Closed)
            }
            Method::Connection(ConnectionMethod::CloseOk) => Ok(Step::Closed),
            other => {
                let (class_id, method_id) = other.id();
                Err(ProtocolError::command_invalid(format!(
                    "unexpected {} on channel 0",
                    other.name()
                ))
                .on(class_id, method_id)
                .into())
            }
        }
    }

    /// Forward a frame to its channel, spawning the channel on first use.
    async fn route(&mut self, frame: Frame) -> Result<()> {
        let id = frame.channel;
        if id > self.broker.config.max_channels {
            return Err(ProtocolError::channel_error(format!(
                "channel {} exceeds channel_max {}",
                id, self.broker.config.max_channels
            ))
            .into());
        }

        let frame = match self.channels.get(&id) {
            Some(handle) => match handle.inbox.send(frame).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        reap_finished(&mut self.channels);

        let ctx = ChannelContext {
            id,
            connection_id: self.id,
            broker: Arc::clone(&self.broker),
            outbound: self.outbound.clone(),
            errors: self.errors_tx.clone(),
            frame_max: self.frame_max,
        };
        let (inbox, task) = Channel::spawn(ctx, self.broker.config.channel_inbox_capacity);
        inbox
            .send(frame)
            .await
            .map_err(|_| WarrenError::ChannelClosed)?;
        self.channels.insert(id, ChannelHandle { inbox, task });
        Ok(())
    }

    /// Stop every channel, send `connection.close` and wait a bounded time
    /// for `close-ok`, ignoring everything else.
    async fn hard_close(&mut self, frames: &mut FrameStream, err: ProtocolError) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        if err.code == CONNECTION_FORCED {
            info!(connection_id = self.id, "Closing connection: {}", err.text);
        } else {
            warn!(
                connection_id = self.id,
                peer = %self.peer,
                code = err.code,
                "Hard error, closing connection: {}",
                err.text
            );
            self.broker.metrics.broker.hard_error();
        }

        self.stop_channels().await;

        let close = Method::Connection(ConnectionMethod::Close(Close::from(&err)));
        let frame = Frame::method(CONNECTION_CHANNEL, &close)?;
        if self.outbound.send(vec![frame]).await.is_err() {
            return Ok(());
        }

        let close_timeout = Duration::from_millis(self.broker.config.close_timeout_ms);
        let waited = timeout(close_timeout, async {
            while let Some(Ok(frame)) = frames.next().await {
                if frame.channel != CONNECTION_CHANNEL || frame.frame_type != FrameType::Method {
                    continue;
                }
                match frame.decode_method() {
                    Ok(Method::Connection(ConnectionMethod::CloseOk)) => break,
                    Ok(Method::Connection(ConnectionMethod::Close(_))) => {
                        if let Ok(ok) = Frame::method(
                            CONNECTION_CHANNEL,
                            &Method::Connection(ConnectionMethod::CloseOk),
                        ) {
                            let _ = self.outbound.send(vec![ok]).await;
                        }
                        break;
                    }
                    _ => {}
                }
            }
        })
        .await;
        if waited.is_err() {
            debug!(connection_id = self.id, "No close-ok before timeout");
        }
        Ok(())
    }

    /// Drop every channel inbox and wait for the channel tasks to release
    /// their consumers and unacked deliveries.
    async fn stop_channels(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        let mut tasks: Vec<JoinHandle<()>> =
            self.channels.drain().map(|(_, handle)| handle.task).collect();
        let grace = Duration::from_millis(self.broker.config.close_timeout_ms);
        if timeout(grace, join_all(tasks.iter_mut())).await.is_err() {
            warn!(connection_id = self.id, "Channels did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
        }
    }

    async fn teardown(&mut self) {
        self.stop_channels().await;
        if self.lifecycle.finish_close() {
            self.broker.registry.connection_closed(self.id);
            self.broker.metrics.broker.connection_closed();
            info!(connection_id = self.id, peer = %self.peer, "Connection closed");
        }
    }
}

fn is_close_reply(frame: &Frame) -> bool {
    frame.channel == CONNECTION_CHANNEL
        && frame.frame_type == FrameType::Method
        && matches!(
            frame.decode_method(),
            Ok(Method::Connection(
                ConnectionMethod::CloseOk | ConnectionMethod::Close(_)
            ))
        )
}

/// Single writer for the socket. Batches whatever is queued before flushing.
async fn write_loop(mut sink: FrameSink, mut outbound: mpsc::Receiver<Vec<Frame>>) -> Result<()> {
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

/// Forget channels whose task has ended. Returns how many were dropped.
fn reap_finished(channels: &mut HashMap<u16, ChannelHandle>) -> usize {
    let before = channels.len();
    channels.retain(|_, handle| !handle.task.is_finished());
    before - channels.len()
}
