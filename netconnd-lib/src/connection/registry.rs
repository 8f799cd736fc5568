//! Arena owning every [`Connection`].
//!
//! Connections refer to each other only through generation checked
//! [`ConnectionHandle`]s, so a removed connection is observably gone instead of
//! dangling. Operations spanning several connections live here.

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::rc::Rc;

use super::binder::ConnectionBinder;
use super::{Collaborators, Connection};
use crate::device::Technology;
use crate::routing::RouteEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle {
    index: usize,
    generation: u32,
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    connection: Option<Connection>,
}

pub struct ConnectionRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    collaborators: Collaborators,
}

impl ConnectionRegistry {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            collaborators,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn create(
        &mut self,
        interface_index: u32,
        interface_name: &str,
        technology: Technology,
        fixed_ip_params: bool,
    ) -> ConnectionHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    connection: None,
                });
                self.slots.len() - 1
            }
        };
        let handle = ConnectionHandle {
            index,
            generation: self.slots[index].generation,
        };

        // a lower disconnect propagates to everything bound on top of us
        let lower_binder = ConnectionBinder::new(
            interface_name,
            Some(Box::new(move |registry: &mut ConnectionRegistry| {
                registry.notify_binders_on_disconnect(handle)
            })),
        );
        let connection = Connection::new(
            handle,
            interface_index,
            interface_name.to_string(),
            technology,
            fixed_ip_params,
            lower_binder,
            self.collaborators.clone(),
        );
        self.slots[index].connection = Some(connection);
        handle
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.connection.as_ref())
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.connection.as_mut())
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.connection.is_some())
            .map(|(index, slot)| ConnectionHandle {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.connection.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_interface(&self, interface_index: u32) -> Option<ConnectionHandle> {
        self.handles()
            .into_iter()
            .find(|handle| self.get(*handle).is_some_and(|c| c.interface_index() == interface_index))
    }

    /// Tears a connection down: bound connections are notified first, then
    /// dropping the connection removes its kernel state.
    pub fn remove(&mut self, handle: ConnectionHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        self.notify_binders_on_disconnect(handle);

        // a disconnect callback may already have removed it
        let Some(slot) = self.slots.get_mut(handle.index) else {
            return true;
        };
        if slot.generation != handle.generation {
            return true;
        }
        let Some(connection) = slot.connection.take() else {
            return true;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        drop(connection);
        true
    }

    /// Binds `binder` to `to`, unbinding it from its previous connection.
    /// `None` only unbinds.
    pub fn attach_binder(&mut self, binder: &Rc<ConnectionBinder>, to: Option<ConnectionHandle>) {
        if let Some(current) = binder.connection() {
            if let Some(connection) = self.get_mut(current) {
                connection
                    .inbound_binders
                    .retain(|weak| weak.upgrade().is_some_and(|b| !Rc::ptr_eq(&b, binder)));
                tracing::info!(binder = %binder.name(), interface = %connection.interface_name(), "unbound from connection");
            }
            binder.set_connection(None);
        }

        let Some(target) = to else {
            return;
        };
        let Some(connection) = self.get_mut(target) else {
            tracing::warn!(binder = %binder.name(), %target, "cannot bind to a removed connection");
            return;
        };
        connection.inbound_binders.push_back(Rc::downgrade(binder));
        binder.set_connection(Some(target));
        tracing::info!(binder = %binder.name(), interface = %connection.interface_name(), "bound to connection");
    }

    pub fn detach_binder(&mut self, binder: &Rc<ConnectionBinder>) {
        self.attach_binder(binder, None);
    }

    /// Unbinds the connection from its lower connection, then notifies each
    /// binder bound to it exactly once.
    pub fn notify_binders_on_disconnect(&mut self, handle: ConnectionHandle) {
        let Some(connection) = self.get(handle) else {
            return;
        };
        // unbinding first keeps a circular binding from re-entering us
        let lower_binder = Rc::clone(&connection.lower_binder);
        self.detach_binder(&lower_binder);

        while let Some(weak) = self.get_mut(handle).and_then(|c| c.inbound_binders.pop_front()) {
            if let Some(binder) = weak.upgrade() {
                binder.on_disconnect(self);
            }
        }
    }

    /// Binders currently bound to `handle`, in binding order.
    pub fn inbound_binders(&self, handle: ConnectionHandle) -> Vec<Rc<ConnectionBinder>> {
        self.get(handle)
            .map(|c| c.inbound_binders.iter().filter_map(|weak| weak.upgrade()).collect())
            .unwrap_or_default()
    }

    pub fn lower_connection(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.get(handle)?
            .lower_binder
            .connection()
            .filter(|lower| self.contains(*lower))
    }

    /// Follows lower connections down to the one that carries the traffic of
    /// `handle`. `None` if the chain loops.
    pub fn carrier_connection(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut visited = HashSet::new();
        let mut carrier = handle;
        self.get(carrier)?;
        while let Some(lower) = self.lower_connection(carrier) {
            if !visited.insert(carrier) {
                tracing::error!(%handle, "circular connection chain");
                return None;
            }
            carrier = lower;
        }
        Some(carrier)
    }

    fn chain_contains(&self, start: ConnectionHandle, needle: ConnectionHandle) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(start);
        while let Some(handle) = current {
            if handle == needle {
                return true;
            }
            if !visited.insert(handle) {
                return false;
            }
            current = self.lower_connection(handle);
        }
        false
    }

    /// Answer to a host route query issued by `handle`: binds it to the
    /// connection of the interface the route leaves through.
    pub fn on_route_query_response(&mut self, handle: ConnectionHandle, interface_index: u32, entry: &RouteEntry) {
        let Some(connection) = self.get(handle) else {
            tracing::debug!(%handle, interface_index, "route query answered after its connection went away");
            return;
        };
        tracing::debug!(interface = %connection.interface_name(), interface_index, ?entry, "route query response");
        let lower_binder = Rc::clone(&connection.lower_binder);
        self.detach_binder(&lower_binder);

        let Some(device) = self.collaborators.device_info.get_device(interface_index) else {
            tracing::error!(interface_index, "no device for route query response");
            return;
        };
        let Some(target) = device.connection().filter(|target| self.contains(*target)) else {
            tracing::error!(link = %device.link_name(), "device has no connection");
            return;
        };
        if target == handle {
            tracing::error!(link = %device.link_name(), "refusing to bind connection to itself");
            return;
        }
        if self.chain_contains(target, handle) {
            tracing::error!(link = %device.link_name(), "refusing to bind connection below itself");
            return;
        }

        self.attach_binder(&lower_binder, Some(target));
        if let Some(lower) = self.get(target)
            && !lower.create_gateway_route()
        {
            tracing::debug!(lower_interface = %lower.interface_name(), "no gateway route created on lower connection");
        }
        device.on_connection_updated();

        if let Some(connection) = self.get(handle) {
            connection.install_deferred_exclusions(interface_index, entry.gateway);
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        for handle in self.handles() {
            self.remove(handle);
        }
    }
}
