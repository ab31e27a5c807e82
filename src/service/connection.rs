//! Client connection.
//!
//! A [`Connection`] owns one authenticated byte stream. A single background task
//! reads and dispatches every inbound message; callers write through a shared
//! writer lock, so any number of tasks may issue calls concurrently and each
//! receives exactly its own reply.
//!
//! ```no_run
//! use bus_protocol::config::BusConfig;
//! use bus_protocol::service::Connection;
//!
//! # async fn run() -> bus_protocol::error::Result<()> {
//! let conn = Connection::session(&BusConfig::default()).await?;
//! let reply = conn
//!     .call(
//!         Some("org.freedesktop.DBus"),
//!         "/org/freedesktop/DBus",
//!         Some("org.freedesktop.DBus"),
//!         "ListNames",
//!         vec![],
//!         None,
//!     )
//!     .await?;
//! println!("{:?}", reply.body);
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::BusConfig;
use crate::core::codec::MessageCodec;
use crate::core::marshal::Endian;
use crate::core::message::{Message, MessageType};
use crate::core::value::Value;
use crate::error::{constants, BusError, Result};
use crate::protocol::dispatcher::{Dispatcher, ReplyReceiver, SubscriptionId};
use crate::protocol::filter::SignalFilter;
use crate::protocol::handshake;
use crate::transport::address::{self, BusAddress};
use crate::transport::local::{self, BoxedTransport, Transport};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Framed, FramedParts, FramedWrite};
use tracing::{debug, error, info, instrument, trace, warn};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";
const BUS_INTERFACE: &str = "org.freedesktop.DBus";

type Reader = Framed<ReadHalf<BoxedTransport>, MessageCodec>;
type Writer = FramedWrite<WriteHalf<BoxedTransport>, MessageCodec>;

/// Identifies a signal subscription made through [`Connection::subscribe`]
pub type SubscriptionHandle = SubscriptionId;

/// Signals delivered to a [`Connection::subscribe_stream`] subscription
pub type SignalStream = UnboundedReceiverStream<Message>;

/// Hands out message serials: never zero, wrapping from `u32::MAX` back to 1
#[derive(Debug)]
struct SerialCounter {
    next: AtomicU32,
}

impl SerialCounter {
    fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    /// Next serial for which `in_flight` is false
    fn next(&self, in_flight: impl Fn(u32) -> bool) -> u32 {
        loop {
            let serial = self
                .next
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                    Some(if s == u32::MAX { 1 } else { s + 1 })
                })
                .unwrap_or_else(|s| s);
            if serial != 0 && !in_flight(serial) {
                return serial;
            }
        }
    }
}

/// State shared by caller handles and the receive task
struct Shared {
    writer: tokio::sync::Mutex<Writer>,
    dispatcher: Arc<Dispatcher>,
    serials: SerialCounter,
    byte_order: Endian,
    metrics: Arc<Metrics>,
}

impl Shared {
    /// Assign a serial and write `msg`, registering it for a reply when one is expected
    async fn send(&self, msg: Message, deadline: Option<Instant>) -> Result<u32> {
        let (serial, _) = self.start(msg, deadline, false).await?;
        Ok(serial)
    }

    /// Like [`send`](Self::send), but claims the completion slot before writing
    async fn send_claimed(&self, msg: Message, deadline: Option<Instant>) -> Result<(u32, ReplyReceiver)> {
        let (serial, rx) = self.start(msg, deadline, true).await?;
        let rx = rx.ok_or_else(|| {
            BusError::Custom(format!("{}: {serial}", constants::ERR_UNKNOWN_SERIAL))
        })?;
        Ok((serial, rx))
    }

    async fn start(
        &self,
        mut msg: Message,
        deadline: Option<Instant>,
        claim: bool,
    ) -> Result<(u32, Option<ReplyReceiver>)> {
        let serial = self.serials.next(|s| self.dispatcher.is_pending(s));
        msg.serial = serial;
        msg.endian = self.byte_order;

        // Registered before writing so a fast reply always finds its slot
        let expects_reply = msg.expects_reply();
        let mut rx = None;
        if expects_reply {
            self.dispatcher.register(serial, deadline)?;
            if claim {
                match self.dispatcher.take_receiver(serial) {
                    Ok(slot) => rx = Some(slot),
                    Err(e) => {
                        self.dispatcher.forget(serial);
                        return Err(e);
                    }
                }
            }
        }
        if let Err(e) = self.write(msg).await {
            if expects_reply {
                self.dispatcher.forget(serial);
            }
            return Err(e);
        }
        Ok((serial, rx))
    }

    async fn write(&self, msg: Message) -> Result<()> {
        if self.dispatcher.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let serial = msg.serial;
        let mut writer = self.writer.lock().await;
        let before = writer.write_buffer().len();
        writer.feed(msg).await?;
        let bytes = writer.write_buffer().len().saturating_sub(before);
        writer.flush().await?;

        self.metrics.message_sent(bytes as u64);
        trace!(serial, bytes, "Message written");
        Ok(())
    }
}

struct Inner {
    shared: Arc<Shared>,
    server_guid: String,
    unique_name: OnceLock<String>,
    call_timeout: Duration,
    close_started: AtomicBool,
    shutdown_tx: mpsc::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.dispatcher.close();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Handle to an authenticated connection; clones share the same stream
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server_guid", &self.inner.server_guid)
            .field("unique_name", &self.inner.unique_name.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Authenticate over an already open stream and start the receive loop.
    ///
    /// No `Hello` is sent; use [`hello`](Self::hello) when the peer is a bus.
    #[instrument(skip(stream, config))]
    pub async fn from_stream<S: Transport>(mut stream: S, config: &BusConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        metrics.handshake_attempt();
        let authenticated = match handshake::authenticate(
            &mut stream,
            config.client.auth_mechanism,
            config.client.connection_timeout,
        )
        .await
        {
            Ok(authenticated) => {
                metrics.handshake_success();
                authenticated
            }
            Err(e) => {
                metrics.handshake_failed();
                error!(error = %e, "Handshake failed");
                return Err(e);
            }
        };

        let boxed: BoxedTransport = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let codec = MessageCodec::new(config.transport.max_message_size);
        // Bytes that arrived with the OK line already belong to the message stream
        let mut parts = FramedParts::new::<Message>(read_half, codec);
        parts.read_buf = authenticated.leftover;
        let reader = Framed::from_parts(parts);
        let writer = FramedWrite::new(write_half, codec);

        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&metrics))
                .with_unknown_method_replies(config.client.reply_unknown_methods),
        );
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            dispatcher,
            serials: SerialCounter::starting_at(1),
            byte_order: config.transport.byte_order,
            metrics,
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&shared),
            shutdown_rx,
            config.client.pending_sweep_interval,
        ));

        info!(guid = %authenticated.guid, "Connection ready");
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                server_guid: authenticated.guid,
                unique_name: OnceLock::new(),
                call_timeout: config.client.call_timeout,
                close_started: AtomicBool::new(false),
                shutdown_tx,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Connect to a bus address string, trying `;`-separated alternatives in order
    #[instrument(skip(config))]
    pub async fn connect(address: &str, config: &BusConfig) -> Result<Self> {
        let _timer = Timer::start("connect");
        let addresses = BusAddress::parse_list(address)?;
        let (stream, used) =
            with_timeout_error(local::connect_any(&addresses), config.client.connection_timeout)
                .await?;
        let conn = Self::from_stream(stream, config).await?;

        if let Some(expected) = &used.guid {
            if *expected != conn.inner.server_guid {
                warn!(
                    expected = %expected,
                    actual = %conn.inner.server_guid,
                    "Server GUID differs from the address"
                );
            }
        }
        if config.client.auto_hello {
            conn.hello().await?;
        }
        Ok(conn)
    }

    /// Connect to the session bus, or to `client.address` when configured
    pub async fn session(config: &BusConfig) -> Result<Self> {
        let address = match &config.client.address {
            Some(address) => address.clone(),
            None => address::session_bus_address()?,
        };
        Self::connect(&address, config).await
    }

    /// Connect to the system bus, or to `client.address` when configured
    pub async fn system(config: &BusConfig) -> Result<Self> {
        let address = config
            .client
            .address
            .clone()
            .unwrap_or_else(address::system_bus_address);
        Self::connect(&address, config).await
    }

    /// Register with the bus and learn this connection's unique name
    pub async fn hello(&self) -> Result<String> {
        if let Some(name) = self.inner.unique_name.get() {
            return Ok(name.clone());
        }
        let reply = self
            .call(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), "Hello", vec![], None)
            .await?;
        let name = reply
            .body
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| BusError::Custom("Hello reply carries no name".into()))?
            .to_string();

        let name = self.inner.unique_name.get_or_init(|| name).clone();
        info!(unique_name = %name, "Registered on the bus");
        Ok(name)
    }

    /// Write a message and return its serial.
    ///
    /// A method call expecting a reply stays pending until
    /// [`await_reply`](Self::await_reply) collects it. A reply that arrives first
    /// is kept for the caller. Until `await_reply` is called, the configured call
    /// timeout bounds how long the call may stay unanswered or uncollected.
    pub async fn send(&self, msg: Message) -> Result<u32> {
        let deadline = Instant::now() + self.inner.call_timeout;
        self.inner.shared.send(msg, Some(deadline)).await
    }

    /// Wait for the reply to a call previously written with [`send`](Self::send).
    ///
    /// `timeout` counts from this call and replaces the deadline set by `send`,
    /// so it may be longer than the configured call timeout. A call that already
    /// timed out before this point still resolves with [`BusError::Timeout`].
    pub async fn await_reply(&self, serial: u32, timeout: Duration) -> Result<Message> {
        let dispatcher = &self.inner.shared.dispatcher;
        let rx = dispatcher.take_receiver(serial)?;
        // Backstop for a waiter that is dropped before the reply arrives
        dispatcher.set_deadline(serial, Some(Instant::now() + timeout));
        wait_for_reply(dispatcher, serial, rx, timeout).await
    }

    /// Write a method call and return a handle to its reply
    pub async fn send_call(&self, msg: Message) -> Result<PendingReply> {
        if msg.message_type != MessageType::MethodCall || !msg.expects_reply() {
            return Err(BusError::Custom(
                "send_call needs a method call that expects a reply".into(),
            ));
        }
        let shared = &self.inner.shared;
        let (serial, rx) = shared.send_claimed(msg, None).await?;
        Ok(PendingReply {
            serial,
            rx: Some(rx),
            dispatcher: Arc::clone(&shared.dispatcher),
            default_timeout: self.inner.call_timeout,
        })
    }

    /// Send a method call and wait for its reply; error replies become [`BusError::Remote`]
    pub async fn call_message(&self, msg: Message, timeout: Option<Duration>) -> Result<Message> {
        let member = msg.member.clone().unwrap_or_default();
        let reply = self.send_call(msg).await?.wait(timeout).await?;
        if reply.message_type == MessageType::Error {
            let name = reply.error_name.clone().unwrap_or_default();
            debug!(member = %member, error_name = %name, "Call returned an error");
            return Err(BusError::Remote {
                name,
                message: reply.error_text(),
            });
        }
        Ok(reply)
    }

    /// Call `member` on the object at `path`.
    ///
    /// `timeout` defaults to the configured call timeout.
    #[instrument(skip(self, args, timeout), level = "debug")]
    pub async fn call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let mut msg = Message::method_call(path, member)?.with_body(args)?;
        if let Some(destination) = destination {
            msg = msg.with_destination(destination)?;
        }
        if let Some(interface) = interface {
            msg = msg.with_interface(interface)?;
        }
        self.call_message(msg, timeout).await
    }

    /// Emit a signal; no reply is expected
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<u32> {
        let msg = Message::signal(path, interface, member)?.with_body(args)?;
        self.inner.shared.send(msg, None).await
    }

    /// Run `handler` for every received signal matching `filter`.
    ///
    /// Handlers run on the receive task in arrival order and should return quickly.
    pub fn subscribe<F>(&self, filter: SignalFilter, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.shared.dispatcher.subscribe(filter, handler)
    }

    /// Receive matching signals as a stream; it ends when the connection closes
    pub fn subscribe_stream(&self, filter: SignalFilter) -> Result<(SubscriptionHandle, SignalStream)> {
        let (id, rx) = self.inner.shared.dispatcher.subscribe_channel(filter)?;
        Ok((id, UnboundedReceiverStream::new(rx)))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.shared.dispatcher.unsubscribe(handle)
    }

    /// Ask the bus to route signals matching `filter` to this connection
    pub async fn add_match(&self, filter: &SignalFilter) -> Result<()> {
        self.bus_match_call("AddMatch", filter).await
    }

    pub async fn remove_match(&self, filter: &SignalFilter) -> Result<()> {
        self.bus_match_call("RemoveMatch", filter).await
    }

    async fn bus_match_call(&self, member: &str, filter: &SignalFilter) -> Result<()> {
        let rule = filter.to_match_rule();
        debug!(member, rule = %rule, "Updating bus match rules");
        self.call(
            Some(BUS_NAME),
            BUS_PATH,
            Some(BUS_INTERFACE),
            member,
            vec![Value::from(rule.as_str())],
            None,
        )
        .await
        .map(|_| ())
    }

    /// Serve method calls to `member` of `interface` on the object at `path`
    pub fn register_method<F>(&self, path: &str, interface: &str, member: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.inner
            .shared
            .dispatcher
            .register_method(path, interface, member, handler)
    }

    /// Shut the connection down.
    ///
    /// Pending calls resolve with [`BusError::ConnectionClosed`]. Only the first
    /// call does any work; later and concurrent calls return immediately.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.inner.shared;

        // The loop may already be gone if the peer hung up
        let _ = self.inner.shutdown_tx.try_send(());
        shared.dispatcher.close();

        if let Err(e) = shared.writer.lock().await.close().await {
            debug!(error = %e, "Writer already closed");
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Receive task ended abnormally");
            }
        }

        shared.metrics.log_metrics();
        info!("Connection closed");
        Ok(())
    }

    /// Whether the connection was closed locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.inner.shared.dispatcher.is_closed()
    }

    /// Unique bus name, known after [`hello`](Self::hello)
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    pub fn server_guid(&self) -> &str {
        &self.inner.server_guid
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.shared.metrics
    }
}

/// Reply handle for a call written with [`Connection::send_call`].
///
/// Dropping it before the reply arrives abandons the call; a late reply is discarded.
pub struct PendingReply {
    serial: u32,
    rx: Option<ReplyReceiver>,
    dispatcher: Arc<Dispatcher>,
    default_timeout: Duration,
}

impl PendingReply {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Wait for the reply, up to `timeout` or the configured call timeout
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Message> {
        let rx = self.rx.take().ok_or(BusError::Cancelled)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        wait_for_reply(&self.dispatcher, self.serial, rx, timeout).await
    }

    /// Abandon the call, resolving it with [`BusError::Cancelled`]
    pub fn cancel(self) -> bool {
        self.dispatcher.cancel(self.serial, BusError::Cancelled)
    }

    /// Handle that cancels the call from another task while it is being awaited
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            serial: self.serial,
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.dispatcher.forget(self.serial) {
            trace!(serial = self.serial, "Abandoned pending call");
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("serial", &self.serial)
            .finish()
    }
}

#[derive(Clone)]
pub struct CancelHandle {
    serial: u32,
    dispatcher: Arc<Dispatcher>,
}

impl CancelHandle {
    /// Resolve the call with [`BusError::Cancelled`]; false if it already resolved
    pub fn cancel(&self) -> bool {
        self.dispatcher.cancel(self.serial, BusError::Cancelled)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("serial", &self.serial)
            .finish()
    }
}

async fn wait_for_reply(
    dispatcher: &Dispatcher,
    serial: u32,
    mut rx: ReplyReceiver,
    timeout: Duration,
) -> Result<Message> {
    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(Ok(result)) => result,
        // Slot dropped without a result: the call was forgotten
        Ok(Err(_)) => Err(BusError::Cancelled),
        Err(_) => {
            if dispatcher.cancel(serial, BusError::Timeout) {
                debug!(serial, "Call timed out");
                return Err(BusError::Timeout);
            }
            // Resolved between the deadline and the cancel
            rx.try_recv().unwrap_or(Err(BusError::Timeout))
        }
    }
}

/// Closes the dispatcher however the receive task ends, a panicking handler included
struct CloseOnExit {
    dispatcher: Arc<Dispatcher>,
    finished: bool,
}

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        // Already closed means a deliberate teardown aborted the task
        if !self.finished && !self.dispatcher.is_closed() {
            error!("Receive task aborted, closing connection");
        }
        self.dispatcher.close();
    }
}

async fn receive_loop(
    mut reader: Reader,
    shared: Arc<Shared>,
    mut shutdown_rx: mpsc::Receiver<()>,
    sweep_interval: Duration,
) {
    let mut guard = CloseOnExit {
        dispatcher: Arc::clone(&shared.dispatcher),
        finished: false,
    };
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Receive loop stopping");
                break;
            }
            _ = sweep.tick() => {
                shared.dispatcher.expire(Instant::now());
            }
            frame = reader.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        shared.metrics.message_received();
                        trace!(
                            serial = msg.serial,
                            message_type = ?msg.message_type,
                            "Message received"
                        );
                        if let Some(reply) = shared.dispatcher.dispatch(msg) {
                            // Writing from here could stall reads behind a slow writer
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = shared.send(reply, None).await {
                                    warn!(error = %e, "Failed to send method reply");
                                }
                            });
                        }
                    }
                    Some(Err(e)) => {
                        shared.metrics.protocol_error();
                        error!(error = %e, "Receive failed, closing connection");
                        break;
                    }
                    None => {
                        info!("Peer closed the connection");
                        break;
                    }
                }
            }
        }
    }
    guard.finished = true;
}
