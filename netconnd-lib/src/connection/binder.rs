//! Disconnect propagating links between connections.
//!
//! A [`ConnectionBinder`] is owned by whoever created it (a connection's lower
//! binding, a VPN driver, ...). The registry only keeps weak references to it
//! in the bound connection's inbound list, so a binder dropped by its owner is
//! detached implicitly and never notified.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::ConnectionHandle;
use super::registry::ConnectionRegistry;

pub type DisconnectCallback = Box<dyn FnMut(&mut ConnectionRegistry)>;

pub struct ConnectionBinder {
    name: String,
    connection: Cell<Option<ConnectionHandle>>,
    on_disconnect: RefCell<Option<DisconnectCallback>>,
}

impl ConnectionBinder {
    pub fn new(name: impl Into<String>, on_disconnect: Option<DisconnectCallback>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            connection: Cell::new(None),
            on_disconnect: RefCell::new(on_disconnect),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection this binder is attached to.
    ///
    /// Use [`ConnectionRegistry::get`] to check the handle is still alive.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection.get()
    }

    pub fn is_bound(&self) -> bool {
        self.connection.get().is_some()
    }

    pub(super) fn set_connection(&self, connection: Option<ConnectionHandle>) {
        self.connection.set(connection);
    }

    /// Unbinds and runs the owner's callback. The binding is cleared first, so
    /// a second notification for the same binding cannot happen.
    pub(super) fn on_disconnect(&self, registry: &mut ConnectionRegistry) {
        tracing::info!(binder = %self.name, "bound connection disconnected");
        self.connection.set(None);

        let callback = self.on_disconnect.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback(registry);
            let mut slot = self.on_disconnect.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl fmt::Debug for ConnectionBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBinder")
            .field("name", &self.name)
            .field("connection", &self.connection.get())
            .finish_non_exhaustive()
    }
}
