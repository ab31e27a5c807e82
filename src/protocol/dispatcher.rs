//! Routing of inbound messages.
//!
//! The [`Dispatcher`] owns three tables:
//! - pending calls, keyed by serial, each resolved exactly once by a reply,
//!   a timeout, a cancellation, or connection close. A result that arrives
//!   before the caller claims the completion slot stays parked in the table
//!   until it is claimed, the call deadline passes, or the table is closed.
//! - signal subscriptions, each a [`SignalFilter`] plus a callback or channel
//! - method handlers for calls addressed to this connection, keyed by
//!   object path, interface and member
//!
//! Locks are held only while the tables are read or mutated. Signal callbacks
//! and method handlers run after the lock is released, so a handler may call
//! back into the dispatcher.

use crate::core::message::{Message, MessageFlags, MessageType};
use crate::core::names;
use crate::core::value::{ObjectPath, Value};
use crate::error::{constants, BusError, Result};
use crate::protocol::filter::SignalFilter;
use crate::utils::metrics::Metrics;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Error name sent for calls nobody handles
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Error name sent when a method handler fails with a local error
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Completion slot of one call
pub type ReplyReceiver = oneshot::Receiver<Result<Message>>;

type SignalFn = dyn Fn(&Message) + Send + Sync + 'static;
type MethodFn = dyn Fn(&Message) -> Result<Vec<Value>> + Send + Sync + 'static;

struct PendingCall {
    /// None once the call is resolved
    tx: Option<oneshot::Sender<Result<Message>>>,
    /// Parked until the waiter claims it with `take_receiver`
    rx: Option<ReplyReceiver>,
    deadline: Option<Instant>,
}

type ReplySender = oneshot::Sender<Result<Message>>;

/// Take the sender of an unresolved call. A claimed entry leaves the table;
/// an unclaimed one stays so the buffered result can still be collected.
fn take_sender(pending: &mut HashMap<u32, PendingCall>, serial: u32) -> Option<ReplySender> {
    let call = pending.get_mut(&serial)?;
    let tx = call.tx.take()?;
    if call.rx.is_none() {
        pending.remove(&serial);
    }
    Some(tx)
}

/// Identifies one signal subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum SignalSink {
    Callback(Arc<SignalFn>),
    Channel(mpsc::UnboundedSender<Message>),
}

struct Subscription {
    filter: SignalFilter,
    sink: SignalSink,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    path: ObjectPath,
    interface: String,
    member: String,
}

pub struct Dispatcher {
    pending: Mutex<HashMap<u32, PendingCall>>,
    // BTreeMap keeps delivery in subscription order
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    methods: RwLock<HashMap<MethodKey, Arc<MethodFn>>>,
    next_subscription: AtomicU64,
    reply_unknown_methods: bool,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::new()))
    }
}

impl Dispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(BTreeMap::new()),
            methods: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            reply_unknown_methods: false,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Answer unrouted method calls with `UnknownMethod` instead of dropping them
    pub fn with_unknown_method_replies(mut self, enabled: bool) -> Self {
        self.reply_unknown_methods = enabled;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Track a call awaiting its reply; `deadline` is enforced by [`expire`](Self::expire)
    pub fn register(&self, serial: u32, deadline: Option<Instant>) -> Result<()> {
        let mut pending = self.lock_pending();
        // Checked under the lock so close() cannot miss this entry
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        if pending.contains_key(&serial) {
            return Err(BusError::Custom(format!(
                "{}: {serial}",
                constants::ERR_SERIAL_IN_FLIGHT
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            serial,
            PendingCall {
                tx: Some(tx),
                rx: Some(rx),
                deadline,
            },
        );
        trace!(serial, "Registered pending call");
        Ok(())
    }

    /// Claim the completion slot of a registered call; only the first claim succeeds.
    ///
    /// The slot may already hold the result if the call resolved before the claim.
    pub fn take_receiver(&self, serial: u32) -> Result<ReplyReceiver> {
        let mut pending = self.lock_pending();
        let (rx, resolved) = match pending.get_mut(&serial) {
            Some(call) => (call.rx.take(), call.tx.is_none()),
            None => (None, false),
        };
        if rx.is_some() && resolved {
            pending.remove(&serial);
        }
        rx.ok_or_else(|| {
            if self.is_closed() {
                BusError::ConnectionClosed
            } else {
                BusError::Custom(format!("{}: {serial}", constants::ERR_UNKNOWN_SERIAL))
            }
        })
    }

    /// Move the deadline of an unresolved call. Returns false if it already resolved.
    pub fn set_deadline(&self, serial: u32, deadline: Option<Instant>) -> bool {
        match self.lock_pending().get_mut(&serial) {
            Some(call) if call.tx.is_some() => {
                call.deadline = deadline;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, serial: u32) -> bool {
        self.lock_pending().contains_key(&serial)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Resolve the call `reply` answers. Returns false when no call is waiting.
    pub fn complete(&self, reply: Message) -> bool {
        let Some(serial) = reply.reply_serial else {
            return false;
        };
        let tx = take_sender(&mut self.lock_pending(), serial);
        let Some(tx) = tx else {
            debug!(
                reply_serial = serial,
                "Discarding reply with no pending call"
            );
            self.metrics.reply_discarded();
            return false;
        };

        if reply.message_type == MessageType::Error {
            self.metrics.remote_error();
        }
        self.metrics.call_completed();
        // The waiter may have gone away; nothing else to notify
        let _ = tx.send(Ok(reply));
        true
    }

    /// Resolve a pending call with `err`
    pub fn cancel(&self, serial: u32, err: BusError) -> bool {
        let tx = take_sender(&mut self.lock_pending(), serial);
        let Some(tx) = tx else {
            return false;
        };
        match err {
            BusError::Timeout => self.metrics.call_timed_out(),
            BusError::Cancelled => self.metrics.call_cancelled(),
            _ => {}
        }
        let _ = tx.send(Err(err));
        true
    }

    /// Drop a pending call without resolving it
    pub fn forget(&self, serial: u32) -> bool {
        self.lock_pending().remove(&serial).is_some()
    }

    /// Resolve every call whose deadline has passed with [`BusError::Timeout`].
    ///
    /// Results that were parked and never claimed are dropped once their deadline
    /// passes. Returns the number of calls resolved with a timeout.
    pub fn expire(&self, now: Instant) -> usize {
        let (expired, stale) = {
            let mut pending = self.lock_pending();
            let due: Vec<u32> = pending
                .iter()
                .filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
                .map(|(serial, _)| *serial)
                .collect();

            let mut expired = Vec::new();
            let mut stale = Vec::new();
            for serial in due {
                match take_sender(&mut pending, serial) {
                    Some(tx) => expired.push(tx),
                    None => stale.extend(pending.remove(&serial).and_then(|call| call.rx)),
                }
            }
            (expired, stale)
        };

        let count = expired.len();
        for tx in expired {
            self.metrics.call_timed_out();
            let _ = tx.send(Err(BusError::Timeout));
        }
        for mut rx in stale {
            if matches!(rx.try_recv(), Ok(Ok(_))) {
                self.metrics.reply_discarded();
            }
        }
        if count > 0 {
            debug!(count, "Expired pending calls");
        }
        count
    }

    /// Resolve everything with [`BusError::ConnectionClosed`] and refuse new calls.
    ///
    /// Unclaimed slots stay parked so a late [`take_receiver`](Self::take_receiver)
    /// still sees how the call ended.
    pub fn close(&self) {
        let senders: Vec<ReplySender> = {
            let mut pending = self.lock_pending();
            self.closed.store(true, Ordering::SeqCst);
            let senders = pending
                .values_mut()
                .filter_map(|call| call.tx.take())
                .collect();
            pending.retain(|_, call| call.rx.is_some());
            senders
        };
        let count = senders.len();
        for tx in senders {
            let _ = tx.send(Err(BusError::ConnectionClosed));
        }

        // Dropping channel senders ends subscription streams
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        debug!(resolved = count, "Dispatcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver matching signals to `handler`
    pub fn subscribe<F>(&self, filter: SignalFilter, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.insert_subscription(filter, SignalSink::Callback(Arc::new(handler)))
    }

    /// Deliver matching signals into a channel
    pub fn subscribe_channel(
        &self,
        filter: SignalFilter,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Message>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.insert_subscription(filter, SignalSink::Channel(tx))?;
        Ok((id, rx))
    }

    fn insert_subscription(&self, filter: SignalFilter, sink: SignalSink) -> Result<SubscriptionId> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|_| BusError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        // close() sets the flag before clearing this table under the same lock
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        subscriptions.insert(id, Subscription { filter, sink });
        Ok(id)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Handle method calls to `member` of `interface` on the object at `path`.
    ///
    /// The handler returns the reply body. A [`BusError::Remote`] error becomes an
    /// error reply with that name; any other error is sent as `Error.Failed`.
    /// Registering the same triple again replaces the previous handler.
    pub fn register_method<F>(&self, path: &str, interface: &str, member: &str, handler: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        names::validate_interface_name(interface)?;
        names::validate_member_name(member)?;
        let key = MethodKey {
            path: ObjectPath::new(path)?,
            interface: interface.to_string(),
            member: member.to_string(),
        };

        let mut methods = self
            .methods
            .write()
            .map_err(|_| BusError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        methods.insert(key, Arc::new(handler));
        Ok(())
    }

    pub fn unregister_method(&self, path: &str, interface: &str, member: &str) -> bool {
        let Ok(path) = ObjectPath::new(path) else {
            return false;
        };
        let key = MethodKey {
            path,
            interface: interface.to_string(),
            member: member.to_string(),
        };
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    /// Route one inbound message. Returns the reply to send, if any.
    pub fn dispatch(&self, msg: Message) -> Option<Message> {
        match msg.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                self.complete(msg);
                None
            }
            MessageType::Signal => {
                self.deliver_signal(&msg);
                None
            }
            MessageType::MethodCall => self.route_call(&msg),
        }
    }

    fn deliver_signal(&self, msg: &Message) {
        let sinks: Vec<(SubscriptionId, SignalSink)> = {
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscriptions
                .iter()
                .filter(|(_, sub)| sub.filter.matches(msg))
                .map(|(id, sub)| (*id, sub.sink.clone()))
                .collect()
        };

        let mut delivered = 0u64;
        let mut dead = Vec::new();
        for (id, sink) in sinks {
            match sink {
                SignalSink::Callback(handler) => {
                    handler(msg);
                    delivered += 1;
                }
                SignalSink::Channel(tx) => {
                    if tx.send(msg.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(id);
                    }
                }
            }
        }

        for id in dead {
            trace!(?id, "Dropping subscription with closed receiver");
            self.unsubscribe(id);
        }
        self.metrics.signal_delivered(delivered);
        trace!(
            member = msg.member.as_deref().unwrap_or_default(),
            delivered,
            "Signal dispatched"
        );
    }

    fn route_call(&self, call: &Message) -> Option<Message> {
        let interface = call.interface.as_deref();
        let member = call.member.as_deref().unwrap_or_default();

        if interface == Some(PEER_INTERFACE) && member == "Ping" {
            return self.reply_to(call, Ok(Vec::new()));
        }

        let handler = self.find_method(call);
        match handler {
            Some(handler) => {
                self.metrics.method_call_routed();
                let result = handler(call);
                self.reply_to(call, result)
            }
            None if self.reply_unknown_methods => {
                debug!(member, interface, "No handler for method call");
                let text = format!(
                    "No such method '{member}' in interface '{}' at object path '{}'",
                    interface.unwrap_or_default(),
                    call.path.as_ref().map(ObjectPath::as_str).unwrap_or_default()
                );
                self.reply_to(
                    call,
                    Err(BusError::Remote {
                        name: ERROR_UNKNOWN_METHOD.to_string(),
                        message: text,
                    }),
                )
            }
            None => {
                trace!(member, interface, "Ignoring unrouted method call");
                None
            }
        }
    }

    fn find_method(&self, call: &Message) -> Option<Arc<MethodFn>> {
        let path = call.path.as_ref()?;
        let member = call.member.as_deref()?;
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);

        match call.interface.as_deref() {
            Some(interface) => methods
                .get(&MethodKey {
                    path: path.clone(),
                    interface: interface.to_string(),
                    member: member.to_string(),
                })
                .cloned(),
            // Without an interface any handler for the path and member will do
            None => methods
                .iter()
                .find(|(key, _)| &key.path == path && key.member == member)
                .map(|(_, handler)| Arc::clone(handler)),
        }
    }

    fn reply_to(&self, call: &Message, result: Result<Vec<Value>>) -> Option<Message> {
        if call.flags.contains(MessageFlags::NO_REPLY_EXPECTED) {
            return None;
        }
        let reply = match result {
            Ok(body) => Message::method_return(call).with_body(body),
            Err(BusError::Remote { name, message }) => Message::error(call, &name, &message),
            Err(e) => Message::error(call, ERROR_FAILED, &e.to_string()),
        };
        match reply {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "Failed to build method reply");
                Message::error(call, ERROR_FAILED, &e.to_string()).ok()
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
