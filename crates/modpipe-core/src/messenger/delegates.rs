//! Delegate storage for the message bus.
//!
//! A delegate is one registered receiver: a listener callback, a single-slot
//! binding, or a multi-slot binding. The bus stores delegates type-erased
//! behind [`DelegateSink`]; each sink knows its payload type and downcasts
//! on delivery. Binding handles ([`SingleBinding`], [`MultiBinding`]) are the
//! subscriber-side view of the same cell: the bus writes into the cell, the
//! owning module reads from its handle during `run`.

use std::any::{type_name, Any};
use std::marker::PhantomData;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use super::DispatchError;

bitflags! {
    /// Delivery options recognized by the bus.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// A single-slot binding may receive more than one message per
        /// event; the last write wins.
        const ALLOW_OVERWRITE = 1 << 0;
        /// Dispatch-side assertion: fail when no receiver matches.
        const REQUIRED = 1 << 1;
    }
}

impl MsgFlags {
    /// Default single-delivery enforcement.
    pub const NONE: Self = Self::empty();
}

impl Default for MsgFlags {
    fn default() -> Self {
        Self::NONE
    }
}

/// Which messages a delegate matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryScope {
    /// Matches every message of the subscribed type.
    Any,
    /// Matches only messages scoped to the named device.
    Device(String),
}

impl DeliveryScope {
    /// Whether a message with the given scope is delivered here.
    ///
    /// Wildcard delegates match everything; device-scoped delegates match
    /// only messages carrying exactly that device. A message without a scope
    /// never reaches a device-scoped delegate.
    pub fn matches(&self, message_scope: Option<&str>) -> bool {
        match self {
            DeliveryScope::Any => true,
            DeliveryScope::Device(device) => message_scope == Some(device.as_str()),
        }
    }
}

/// Type-erased delivery target stored by the bus.
pub(super) trait DelegateSink: Send {
    /// Delivers one message. `owner_label` is only used for diagnostics.
    fn deliver(
        &self,
        message: &Arc<dyn Any + Send + Sync>,
        owner_label: &str,
    ) -> Result<(), DispatchError>;

    /// Clears per-event delivery state. Called at every event boundary.
    fn reset(&self);
}

// =============================================================================
// Listener
// =============================================================================

pub(super) struct ListenerSink<M, F> {
    callback: F,
    _marker: PhantomData<fn(M)>,
}

impl<M, F> ListenerSink<M, F>
where
    M: Any + Send + Sync,
    F: Fn(Arc<M>) + Send,
{
    pub(super) fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<M, F> DelegateSink for ListenerSink<M, F>
where
    M: Any + Send + Sync,
    F: Fn(Arc<M>) + Send,
{
    fn deliver(
        &self,
        message: &Arc<dyn Any + Send + Sync>,
        _owner_label: &str,
    ) -> Result<(), DispatchError> {
        if let Ok(typed) = Arc::clone(message).downcast::<M>() {
            (self.callback)(typed);
        }
        Ok(())
    }

    fn reset(&self) {}
}

// =============================================================================
// Single-slot binding
// =============================================================================

struct SingleState<M> {
    value: Option<Arc<M>>,
    delivered: bool,
}

struct SingleCell<M> {
    state: Mutex<SingleState<M>>,
}

/// Subscriber-side handle of a single-slot binding.
///
/// Holds at most one message of the current event. Unless registered with
/// [`MsgFlags::ALLOW_OVERWRITE`], a second delivery within one event is a
/// [`DispatchError::DoubleDelivery`].
pub struct SingleBinding<M> {
    cell: Arc<SingleCell<M>>,
}

impl<M> Clone for SingleBinding<M> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<M> SingleBinding<M> {
    pub(super) fn new() -> Self {
        Self {
            cell: Arc::new(SingleCell {
                state: Mutex::new(SingleState {
                    value: None,
                    delivered: false,
                }),
            }),
        }
    }

    /// The message delivered this event, if any.
    pub fn get(&self) -> Option<Arc<M>> {
        self.cell.state.lock().value.clone()
    }

    /// Whether a message was delivered this event.
    pub fn is_set(&self) -> bool {
        self.cell.state.lock().delivered
    }
}

pub(super) struct SingleSink<M> {
    cell: Arc<SingleCell<M>>,
    flags: MsgFlags,
}

impl<M> SingleSink<M> {
    pub(super) fn new(binding: &SingleBinding<M>, flags: MsgFlags) -> Self {
        Self {
            cell: Arc::clone(&binding.cell),
            flags,
        }
    }
}

impl<M: Any + Send + Sync> DelegateSink for SingleSink<M> {
    fn deliver(
        &self,
        message: &Arc<dyn Any + Send + Sync>,
        owner_label: &str,
    ) -> Result<(), DispatchError> {
        let Ok(typed) = Arc::clone(message).downcast::<M>() else {
            return Ok(());
        };
        let mut state = self.cell.state.lock();
        if state.delivered && !self.flags.contains(MsgFlags::ALLOW_OVERWRITE) {
            return Err(DispatchError::DoubleDelivery {
                message_type: type_name::<M>(),
                owner: owner_label.to_string(),
            });
        }
        state.value = Some(typed);
        state.delivered = true;
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.cell.state.lock();
        state.value = None;
        state.delivered = false;
    }
}

// =============================================================================
// Multi-slot binding
// =============================================================================

struct MultiCell<M> {
    messages: Mutex<Vec<Arc<M>>>,
}

/// Subscriber-side handle of a multi-slot binding.
///
/// Collects every matching message of the current event, in delivery order.
pub struct MultiBinding<M> {
    cell: Arc<MultiCell<M>>,
}

impl<M> Clone for MultiBinding<M> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<M> MultiBinding<M> {
    pub(super) fn new() -> Self {
        Self {
            cell: Arc::new(MultiCell {
                messages: Mutex::new(Vec::new()),
            }),
        }
    }

    /// All messages delivered this event, in delivery order.
    pub fn messages(&self) -> Vec<Arc<M>> {
        self.cell.messages.lock().clone()
    }

    /// Number of messages delivered this event.
    pub fn len(&self) -> usize {
        self.cell.messages.lock().len()
    }

    /// Returns true when nothing was delivered this event.
    pub fn is_empty(&self) -> bool {
        self.cell.messages.lock().is_empty()
    }
}

pub(super) struct MultiSink<M> {
    cell: Arc<MultiCell<M>>,
}

impl<M> MultiSink<M> {
    pub(super) fn new(binding: &MultiBinding<M>) -> Self {
        Self {
            cell: Arc::clone(&binding.cell),
        }
    }
}

impl<M: Any + Send + Sync> DelegateSink for MultiSink<M> {
    fn deliver(
        &self,
        message: &Arc<dyn Any + Send + Sync>,
        _owner_label: &str,
    ) -> Result<(), DispatchError> {
        if let Ok(typed) = Arc::clone(message).downcast::<M>() {
            self.cell.messages.lock().push(typed);
        }
        Ok(())
    }

    fn reset(&self) {
        self.cell.messages.lock().clear();
    }
}
