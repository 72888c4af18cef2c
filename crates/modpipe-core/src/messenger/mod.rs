//! Typed publish/subscribe message bus.
//!
//! Modules never call each other: a sender dispatches an immutable payload,
//! the bus routes it to every matching delegate, and neither side knows the
//! other exists. Routing is keyed by the payload's compile-time type plus a
//! runtime device scope:
//!
//! - a delegate registered with [`DeliveryScope::Any`] receives every message
//!   of its type;
//! - a delegate scoped to a device receives only messages dispatched by a
//!   module bound to that device;
//! - a message without a scope (sent by a global module) reaches wildcard
//!   delegates only.
//!
//! Matching delegates are invoked in registration order. Single-slot
//! bindings accept at most one message per event unless registered with
//! [`MsgFlags::ALLOW_OVERWRITE`]; their per-event state is reset by
//! [`Messenger::begin_event`] at every event boundary.
//!
//! The bus never owns a module. Delegates carry the owner's [`InstanceId`]
//! as a plain token, and the module manager removes an instance's delegates
//! (`remove_delegates_of`) before the instance itself is dropped, so no
//! delegate can outlive its owner.
//!
//! Execution is single-threaded and cooperative: dispatch, registration, and
//! removal are never interleaved. Listener callbacks run while the bus lock
//! is held and therefore must not dispatch themselves.

mod delegates;

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::module::InstanceId;

pub use delegates::{DeliveryScope, MsgFlags, MultiBinding, SingleBinding};

use delegates::{DelegateSink, ListenerSink, MultiSink, SingleSink};

/// Errors raised while dispatching a message.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A single-slot binding received a second message within one event
    /// without `ALLOW_OVERWRITE`.
    #[error("double delivery of `{message_type}` dispatched by `{owner}` within one event (ALLOW_OVERWRITE not set)")]
    DoubleDelivery {
        message_type: &'static str,
        owner: String,
    },

    /// A `REQUIRED` dispatch found no matching receiver.
    #[error("no receiver registered for `{message_type}` dispatched by `{owner}`")]
    NoReceiver {
        message_type: &'static str,
        owner: String,
    },
}

struct DelegateEntry {
    owner: InstanceId,
    scope: DeliveryScope,
    sink: Box<dyn DelegateSink>,
}

/// The message bus.
#[derive(Default)]
pub struct Messenger {
    buckets: HashMap<TypeId, Vec<DelegateEntry>>,
}

impl Messenger {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener callback for messages of type `M`.
    ///
    /// The callback runs during dispatch, while the bus is borrowed: it must
    /// not dispatch messages itself.
    pub fn subscribe<M, F>(&mut self, owner: InstanceId, scope: DeliveryScope, callback: F)
    where
        M: Any + Send + Sync,
        F: Fn(Arc<M>) + Send + 'static,
    {
        self.add_entry::<M>(DelegateEntry {
            owner,
            scope,
            sink: Box::new(ListenerSink::new(callback)),
        });
    }

    /// Registers a single-slot binding and returns its subscriber handle.
    pub fn bind_single<M>(
        &mut self,
        owner: InstanceId,
        scope: DeliveryScope,
        flags: MsgFlags,
    ) -> SingleBinding<M>
    where
        M: Any + Send + Sync,
    {
        let binding = SingleBinding::new();
        self.add_entry::<M>(DelegateEntry {
            owner,
            scope,
            sink: Box::new(SingleSink::new(&binding, flags)),
        });
        binding
    }

    /// Registers a multi-slot binding and returns its subscriber handle.
    pub fn bind_multi<M>(&mut self, owner: InstanceId, scope: DeliveryScope) -> MultiBinding<M>
    where
        M: Any + Send + Sync,
    {
        let binding = MultiBinding::new();
        self.add_entry::<M>(DelegateEntry {
            owner,
            scope,
            sink: Box::new(MultiSink::new(&binding)),
        });
        binding
    }

    fn add_entry<M: Any>(&mut self, entry: DelegateEntry) {
        self.buckets
            .entry(TypeId::of::<M>())
            .or_default()
            .push(entry);
    }

    /// Dispatches a message to every matching delegate, in registration
    /// order. Returns the number of deliveries.
    ///
    /// `sender_label` identifies the dispatching module in diagnostics;
    /// `scope` is the sender's bound device, if any. With
    /// [`MsgFlags::REQUIRED`] an empty match set is an error.
    pub fn dispatch<M: Any + Send + Sync>(
        &self,
        sender_label: &str,
        scope: Option<&str>,
        flags: MsgFlags,
        message: M,
    ) -> Result<usize, DispatchError> {
        let matching: Vec<&DelegateEntry> = self
            .buckets
            .get(&TypeId::of::<M>())
            .map(|entries| entries.iter().filter(|e| e.scope.matches(scope)).collect())
            .unwrap_or_default();

        if matching.is_empty() {
            if flags.contains(MsgFlags::REQUIRED) {
                return Err(DispatchError::NoReceiver {
                    message_type: type_name::<M>(),
                    owner: sender_label.to_string(),
                });
            }
            tracing::trace!(message_type = type_name::<M>(), sender = sender_label, "no receiver");
            return Ok(0);
        }

        let payload: Arc<dyn Any + Send + Sync> = Arc::new(message);
        for entry in &matching {
            entry.sink.deliver(&payload, sender_label)?;
        }
        Ok(matching.len())
    }

    /// Whether at least one delegate would receive a message of type `M`
    /// with the given scope. Performs the match without delivering, so
    /// senders can skip building expensive payloads nobody listens to.
    pub fn has_receiver<M: Any>(&self, scope: Option<&str>) -> bool {
        self.buckets
            .get(&TypeId::of::<M>())
            .is_some_and(|entries| entries.iter().any(|e| e.scope.matches(scope)))
    }

    /// Removes every delegate owned by the given instance. Removing an owner
    /// with no registrations is a no-op.
    pub fn remove_delegates_of(&mut self, owner: InstanceId) {
        for entries in self.buckets.values_mut() {
            entries.retain(|e| e.owner != owner);
        }
    }

    /// Marks an event boundary: clears the per-event delivery state of every
    /// binding. Called by the lifecycle driver before each event iteration.
    pub fn begin_event(&mut self, event: u64) {
        tracing::trace!(event, "resetting per-event delegate state");
        for entries in self.buckets.values() {
            for entry in entries {
                entry.sink.reset();
            }
        }
    }

    /// Total number of registered delegates, across all message types.
    pub fn delegate_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("message_types", &self.buckets.len())
            .field("delegates", &self.delegate_count())
            .finish()
    }
}

// =============================================================================
// Per-module bus handle
// =============================================================================

/// A module's handle onto the bus.
///
/// Created by the module manager for every instance before its constructor
/// runs. The handle pins the owner token and the module's bound device, so
/// registrations are scoped to the module's own device automatically and
/// dispatched messages carry it as their scope.
#[derive(Clone)]
pub struct BusClient {
    messenger: Arc<Mutex<Messenger>>,
    owner: InstanceId,
    label: String,
    device: Option<String>,
}

impl BusClient {
    pub(crate) fn new(
        messenger: Arc<Mutex<Messenger>>,
        owner: InstanceId,
        label: String,
        device: Option<String>,
    ) -> Self {
        Self {
            messenger,
            owner,
            label,
            device,
        }
    }

    fn scope(&self) -> DeliveryScope {
        match &self.device {
            Some(device) => DeliveryScope::Device(device.clone()),
            None => DeliveryScope::Any,
        }
    }

    /// The device this handle is bound to, if any.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Registers a listener callback for messages of type `M`.
    pub fn subscribe<M, F>(&self, callback: F)
    where
        M: Any + Send + Sync,
        F: Fn(Arc<M>) + Send + 'static,
    {
        self.messenger
            .lock()
            .subscribe::<M, F>(self.owner, self.scope(), callback);
    }

    /// Registers a single-slot binding for messages of type `M`.
    pub fn bind_single<M>(&self, flags: MsgFlags) -> SingleBinding<M>
    where
        M: Any + Send + Sync,
    {
        self.messenger
            .lock()
            .bind_single::<M>(self.owner, self.scope(), flags)
    }

    /// Registers a multi-slot binding for messages of type `M`.
    pub fn bind_multi<M>(&self) -> MultiBinding<M>
    where
        M: Any + Send + Sync,
    {
        self.messenger
            .lock()
            .bind_multi::<M>(self.owner, self.scope())
    }

    /// Dispatches a message. Its scope is this module's bound device.
    pub fn dispatch<M: Any + Send + Sync>(&self, message: M) -> Result<usize, DispatchError> {
        self.dispatch_flagged(MsgFlags::NONE, message)
    }

    /// Dispatches a message with explicit flags ([`MsgFlags::REQUIRED`]
    /// turns an empty match set into an error).
    pub fn dispatch_flagged<M: Any + Send + Sync>(
        &self,
        flags: MsgFlags,
        message: M,
    ) -> Result<usize, DispatchError> {
        self.messenger
            .lock()
            .dispatch(&self.label, self.device.as_deref(), flags, message)
    }

    /// Whether a message of type `M` dispatched here would reach anyone.
    pub fn has_receiver<M: Any>(&self) -> bool {
        self.messenger.lock().has_receiver::<M>(self.device.as_deref())
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("owner", &self.owner)
            .field("label", &self.label)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Ping(u32);

    fn owner(raw: u64) -> InstanceId {
        InstanceId::new(raw)
    }

    #[test]
    fn unscoped_message_reaches_wildcard_only() {
        let mut bus = Messenger::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let wildcard_hits = Arc::clone(&hits);
        bus.subscribe::<Ping, _>(owner(1), DeliveryScope::Any, move |_| {
            wildcard_hits.fetch_add(1, Ordering::SeqCst);
        });
        let scoped_hits = Arc::clone(&hits);
        bus.subscribe::<Ping, _>(owner(2), DeliveryScope::Device("d0".into()), move |_| {
            scoped_hits.fetch_add(100, Ordering::SeqCst);
        });

        let delivered = bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_message_reaches_wildcard_and_exact_scope() {
        let mut bus = Messenger::new();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for (who, scope) in [
            ("wildcard", DeliveryScope::Any),
            ("d0", DeliveryScope::Device("d0".into())),
            ("d1", DeliveryScope::Device("d1".into())),
        ] {
            let log = Arc::clone(&log);
            bus.subscribe::<Ping, _>(owner(1), scope, move |_| log.lock().push(who));
        }

        bus.dispatch("sender", Some("d0"), MsgFlags::NONE, Ping(1)).unwrap();
        assert_eq!(*log.lock(), vec!["wildcard", "d0"]);
    }

    #[test]
    fn delivery_follows_registration_order() {
        let mut bus = Messenger::new();
        let log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        for raw in [3u64, 1, 2] {
            let log = Arc::clone(&log);
            bus.subscribe::<Ping, _>(owner(raw), DeliveryScope::Any, move |_| {
                log.lock().push(raw);
            });
        }

        bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        assert_eq!(*log.lock(), vec![3, 1, 2]);
    }

    #[test]
    fn has_receiver_reports_without_delivering() {
        let mut bus = Messenger::new();
        assert!(!bus.has_receiver::<Ping>(None));

        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = Arc::clone(&hits);
        bus.subscribe::<Ping, _>(owner(1), DeliveryScope::Any, move |_| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.has_receiver::<Ping>(None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn required_dispatch_fails_without_receiver() {
        let bus = Messenger::new();
        let err = bus
            .dispatch("sender", None, MsgFlags::REQUIRED, Ping(1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoReceiver { .. }));
    }

    #[test]
    fn double_delivery_raised_on_second_set() {
        let mut bus = Messenger::new();
        let binding = bus.bind_single::<Ping>(owner(1), DeliveryScope::Any, MsgFlags::NONE);

        bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        let err = bus
            .dispatch("sender", None, MsgFlags::NONE, Ping(2))
            .unwrap_err();
        assert!(matches!(err, DispatchError::DoubleDelivery { .. }));
        assert_eq!(binding.get().map(|m| m.0), Some(1));
    }

    #[test]
    fn overwrite_keeps_latest_value() {
        let mut bus = Messenger::new();
        let binding =
            bus.bind_single::<Ping>(owner(1), DeliveryScope::Any, MsgFlags::ALLOW_OVERWRITE);

        bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        bus.dispatch("sender", None, MsgFlags::NONE, Ping(2)).unwrap();
        assert_eq!(binding.get().map(|m| m.0), Some(2));
    }

    #[test]
    fn event_boundary_resets_single_slot() {
        let mut bus = Messenger::new();
        let binding = bus.bind_single::<Ping>(owner(1), DeliveryScope::Any, MsgFlags::NONE);

        bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        bus.begin_event(2);
        assert!(binding.get().is_none());
        bus.dispatch("sender", None, MsgFlags::NONE, Ping(2)).unwrap();
        assert_eq!(binding.get().map(|m| m.0), Some(2));
    }

    #[test]
    fn removal_stops_further_deliveries() {
        let mut bus = Messenger::new();
        let binding = bus.bind_multi::<Ping>(owner(1), DeliveryScope::Any);

        bus.dispatch("sender", None, MsgFlags::NONE, Ping(1)).unwrap();
        bus.remove_delegates_of(owner(1));
        let delivered = bus.dispatch("sender", None, MsgFlags::NONE, Ping(2)).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(binding.len(), 1);
        assert_eq!(bus.delegate_count(), 0);

        // removing an owner that has nothing registered is a no-op
        bus.remove_delegates_of(owner(42));
    }

    #[test]
    fn multi_binding_collects_all_matches_of_event() {
        let mut bus = Messenger::new();
        let binding = bus.bind_multi::<Ping>(owner(1), DeliveryScope::Any);

        bus.dispatch("a", None, MsgFlags::NONE, Ping(1)).unwrap();
        bus.dispatch("b", Some("d0"), MsgFlags::NONE, Ping(2)).unwrap();
        assert_eq!(binding.len(), 2);

        bus.begin_event(2);
        assert!(binding.is_empty());
    }
}
