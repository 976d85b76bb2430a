//! Event driven duplex byte channel.
//!
//! WHY: The client engine needs one established connection per exchange,
//! driven without blocking: inbound bytes must flow through a protocol
//! pipeline to whatever currently owns the connection, and outbound writes
//! must suspend the writer when the transport is saturated.
//!
//! WHAT: `Channel`, a cheaply cloneable handle over an established stream,
//! holding the operations slot, the pipeline, the redirect history stamped
//! by the redirect bridge and the close signal. `ChannelLease` closes the
//! channel once its last holder lets go.
//!
//! HOW: `Channel::start` splits the stream and spawns two tasks. The reader
//! decodes through the pipeline and awaits each delivery to the bound
//! operations before reading again. The writer drains a bounded queue of
//! write requests into a buffered writer, flushing where a request asks for
//! it. Closing flips a `watch` flag every channel task selects on.

#[cfg(any(test, feature = "testing"))]
mod duplex;
mod errors;
pub mod pipeline;
pub mod slot;
#[cfg(feature = "ssl-rustls")]
pub mod tls;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub use duplex::{DuplexConnector, DuplexServer};
pub use errors::{ChannelError, ChannelResult};
pub use pipeline::{ChannelStage, Pipeline, HTTP_AGGREGATOR, HTTP_CODEC, REACTIVE_BRIDGE};
pub use slot::{ChannelOperations, OperationsSlot};
#[cfg(feature = "ssl-rustls")]
pub use tls::RustlsWrapper;
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector, TlsWrapper};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::RedirectHistory;
use crate::config::ClientConfig;
use crate::sync::lock;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct WriteRequest {
    data: Bytes,
    flush: bool,
    ack: oneshot::Sender<ChannelResult<()>>,
}

struct ChannelIo {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    queue: mpsc::Receiver<WriteRequest>,
}

struct ChannelInner {
    id: u64,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    read_buffer_size: usize,
    slot: OperationsSlot,
    pipeline: Mutex<Pipeline>,
    history: Mutex<RedirectHistory>,
    writes: mpsc::Sender<WriteRequest>,
    closed: watch::Sender<bool>,
    io: Mutex<Option<ChannelIo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_read: Mutex<Instant>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("secure", &self.inner.secure)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wraps an established stream. Nothing is read or written until [`Channel::start`].
    pub fn new<S>(stream: S, remote_addr: Option<SocketAddr>, secure: bool, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let (writes, queue) = mpsc::channel(config.outbound_buffer.max(1));
        let (closed, _) = watch::channel(false);

        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Channel {id} established (remote: {remote_addr:?}, secure: {secure})");

        Self {
            inner: Arc::new(ChannelInner {
                id,
                remote_addr,
                secure,
                read_buffer_size: config.read_buffer_size.max(64),
                slot: OperationsSlot::default(),
                pipeline: Mutex::new(Pipeline::new()),
                history: Mutex::new(RedirectHistory::default()),
                writes,
                closed,
                io: Mutex::new(Some(ChannelIo {
                    reader,
                    writer,
                    queue,
                })),
                tasks: Mutex::new(Vec::new()),
                last_read: Mutex::new(Instant::now()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    #[must_use]
    pub fn slot(&self) -> &OperationsSlot {
        &self.inner.slot
    }

    /// Runs `f` with exclusive access to the pipeline.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        f(&mut lock(&self.inner.pipeline))
    }

    /// Records the redirect history this channel's exchange should report.
    pub fn stamp_redirect_history(&self, history: RedirectHistory) {
        *lock(&self.inner.history) = history;
    }

    #[must_use]
    pub fn redirect_history(&self) -> RedirectHistory {
        lock(&self.inner.history).clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Spawns the reader and writer tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(io) = lock(&self.inner.io).take() else {
            return;
        };
        if self.is_closed() {
            return;
        }

        let reader = tokio::spawn(Self::read_loop(self.clone(), io.reader));
        let writer = tokio::spawn(Self::write_loop(self.clone(), io.writer, io.queue));
        lock(&self.inner.tasks).extend([reader, writer]);
    }

    /// Queues `data` and waits until it was written and flushed.
    ///
    /// Waiting for queue capacity is the outbound backpressure point.
    ///
    /// # Errors
    ///
    /// `ChannelError::Closed` when the channel closed first, or the I/O
    /// error the writer hit.
    pub async fn write_and_flush(&self, data: Bytes) -> ChannelResult<()> {
        self.enqueue(data, true).await
    }

    /// Queues `data` and waits until it sits in the write buffer.
    ///
    /// The bytes reach the peer on the next flush, or earlier once the
    /// buffer fills.
    ///
    /// # Errors
    ///
    /// See [`Channel::write_and_flush`].
    pub async fn write(&self, data: Bytes) -> ChannelResult<()> {
        self.enqueue(data, false).await
    }

    /// Flushes everything written so far.
    ///
    /// # Errors
    ///
    /// See [`Channel::write_and_flush`].
    pub async fn flush(&self) -> ChannelResult<()> {
        self.enqueue(Bytes::new(), true).await
    }

    async fn enqueue(&self, data: Bytes, flush: bool) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let (ack, done) = oneshot::channel();
        self.inner
            .writes
            .send(WriteRequest { data, flush, ack })
            .await
            .map_err(|_| ChannelError::Closed)?;
        done.await.map_err(|_| ChannelError::Closed)?
    }

    /// Runs `on_idle` each time `idle` passes without anything read from the peer.
    ///
    /// The watch starts now and stops when the channel closes. A reader held
    /// back by a slow body consumer counts as idle.
    pub fn on_read_idle<F>(&self, idle: Duration, mut on_idle: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let channel = self.clone();
        let watcher = tokio::spawn(async move {
            let mut closed = channel.inner.closed.subscribe();
            let mut armed_at = Instant::now();
            loop {
                tokio::select! {
                    biased;
                    () = wait_closed(&mut closed) => break,
                    () = tokio::time::sleep_until(armed_at + idle) => {}
                }
                let last_read = *lock(&channel.inner.last_read);
                if last_read > armed_at {
                    armed_at = last_read;
                    continue;
                }
                tracing::debug!("Channel {} read idle for {idle:?}", channel.inner.id);
                on_idle();
                armed_at = Instant::now();
            }
        });
        lock(&self.inner.tasks).push(watcher);
    }

    /// Closes the channel and notifies and unbinds the current operations.
    ///
    /// Safe to call from any thread and any number of times; only the first
    /// call has an effect.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        tracing::debug!("Channel {} closing", self.inner.id);

        // Never started: dropping the halves shuts the stream.
        drop(lock(&self.inner.io).take());

        if let Some(operations) = self.inner.slot.take() {
            operations.on_channel_closed();
        }
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        let mut signal = self.inner.closed.subscribe();
        wait_closed(&mut signal).await;
    }

    async fn read_loop(channel: Channel, mut reader: ReadHalf<BoxedStream>) {
        let mut closed = channel.inner.closed.subscribe();
        let mut buf = BytesMut::with_capacity(channel.inner.read_buffer_size);

        loop {
            buf.reserve(channel.inner.read_buffer_size);
            let read = tokio::select! {
                biased;
                () = wait_closed(&mut closed) => break,
                read = reader.read_buf(&mut buf) => read,
            };

            let processed = match read {
                Ok(0) => {
                    tracing::debug!("Channel {} reached end of stream", channel.inner.id);
                    let processed = channel.with_pipeline(|pipeline| pipeline.process_eof(&mut buf));
                    channel.dispatch(processed).await;
                    break;
                }
                Ok(_) => {
                    *lock(&channel.inner.last_read) = Instant::now();
                    channel.with_pipeline(|pipeline| pipeline.process(&mut buf))
                }
                Err(err) => Err(ChannelError::from(err)),
            };

            if !channel.dispatch(processed).await {
                break;
            }
        }

        channel.close();
    }

    /// Hands decoded messages to the bound operations one by one.
    ///
    /// Returns false once the inbound side has failed.
    async fn dispatch(&self, processed: ChannelResult<Vec<crate::http::InboundMessage>>) -> bool {
        match processed {
            Ok(messages) => {
                for message in messages {
                    // Re-read per message: a protocol upgrade may swap the owner mid-batch.
                    match self.inner.slot.get() {
                        Some(operations) => operations.on_inbound_next(message).await,
                        None => tracing::debug!(
                            "Channel {} dropping inbound message with no operations bound",
                            self.inner.id
                        ),
                    }
                }
                true
            }
            Err(err) => {
                self.notify_error(err);
                false
            }
        }
    }

    fn notify_error(&self, err: ChannelError) {
        tracing::debug!("Channel {} inbound failure: {err}", self.inner.id);
        if let Some(operations) = self.inner.slot.get() {
            operations.on_inbound_error(err);
        }
    }

    async fn write_loop(
        channel: Channel,
        writer: WriteHalf<BoxedStream>,
        mut queue: mpsc::Receiver<WriteRequest>,
    ) {
        let mut closed = channel.inner.closed.subscribe();
        let mut writer = BufWriter::with_capacity(channel.inner.read_buffer_size, writer);

        loop {
            let request = tokio::select! {
                biased;
                () = wait_closed(&mut closed) => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let written = async {
                writer.write_all(&request.data).await?;
                if request.flush {
                    writer.flush().await?;
                }
                Ok::<(), std::io::Error>(())
            }
            .await
            .map_err(ChannelError::from);

            let failed = written.is_err();
            if request.ack.send(written).is_err() {
                tracing::debug!("Channel {} write acknowledged after waiter left", channel.inner.id);
            }
            if failed {
                channel.close();
                break;
            }
        }

        queue.close();
        while let Ok(request) = queue.try_recv() {
            let _ = request.ack.send(Err(ChannelError::Closed));
        }
        if let Err(err) = writer.shutdown().await {
            tracing::debug!("Channel {} shutdown: {err}", channel.inner.id);
        }
    }
}

async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    loop {
        let closed = *signal.borrow_and_update();
        if closed || signal.changed().await.is_err() {
            return;
        }
    }
}

struct LeaseGuard {
    channel: Channel,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.channel.close();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Shared claim on a channel: once every clone is dropped the channel closes
/// and any task attached to the lease is aborted.
#[derive(Clone)]
pub struct ChannelLease {
    guard: Arc<LeaseGuard>,
}

impl ChannelLease {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            guard: Arc::new(LeaseGuard {
                channel,
                task: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.guard.channel
    }

    /// Ties `task` to the lease; it is aborted when the lease ends.
    pub fn attach(&self, task: JoinHandle<()>) {
        if let Some(previous) = lock(&self.guard.task).replace(task) {
            previous.abort();
        }
    }
}
