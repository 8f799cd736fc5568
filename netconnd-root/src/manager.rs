//! Owns every connection of the daemon and maps the configuration onto them.

use std::collections::BTreeMap;
use std::sync::Arc;

use netconnd_lib::config::{Config, Interface};
use netconnd_lib::connection::{
    Collaborators, Connection, ConnectionHandle, ConnectionRegistry, DEFAULT_METRIC, NON_DEFAULT_METRIC_BASE,
};
use netconnd_lib::device::{Device, Technology};
use netconnd_lib::resolver::Resolver;
use netconnd_lib::rtnl::RtnlHandler;

use crate::device_info::{NetDevice, SystemDeviceInfo};
use crate::routing::{KernelRoutingTable, RouteAnswer};

struct Managed {
    handle: ConnectionHandle,
    device: Arc<NetDevice>,
    technology: Technology,
    fixed_ip_params: bool,
}

pub struct Manager {
    registry: ConnectionRegistry,
    routing_table: Arc<KernelRoutingTable>,
    device_info: Arc<SystemDeviceInfo>,
    interfaces: BTreeMap<String, Managed>,
    default_interface: Option<String>,
}

impl Manager {
    pub fn new(
        routing_table: Arc<KernelRoutingTable>,
        device_info: Arc<SystemDeviceInfo>,
        rtnl: Arc<dyn RtnlHandler>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let collaborators = Collaborators::new(routing_table.clone(), device_info.clone(), rtnl, resolver);
        Self {
            registry: ConnectionRegistry::new(collaborators),
            routing_table,
            device_info,
            interfaces: BTreeMap::new(),
            default_interface: None,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.interfaces
            .get(name)
            .and_then(|managed| self.registry.get(managed.handle))
    }

    pub fn default_interface(&self) -> Option<&str> {
        self.default_interface.as_deref()
    }

    /// Brings the connections in line with `config`.
    ///
    /// Interfaces that disappeared from the configuration, changed their
    /// technology or addressing mode, or whose link went away lose their
    /// connection. Every remaining interface gets its ip configuration
    /// applied again, then the default connection is elected.
    pub fn apply_config(&mut self, config: &Config) {
        let stale: Vec<String> = self
            .interfaces
            .iter()
            .filter(|(name, managed)| match config.interface(name) {
                None => true,
                Some(interface) => {
                    interface.technology != managed.technology
                        || interface.fixed_ip_params != managed.fixed_ip_params
                        || !self
                            .device_info
                            .device(managed.device.interface_index())
                            .is_some_and(|device| Arc::ptr_eq(&device, &managed.device))
                }
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.remove_interface(&name);
        }

        for interface in &config.interfaces {
            self.apply_interface(interface);
        }
        self.elect_default(config);
    }

    fn apply_interface(&mut self, interface: &Interface) {
        let handle = match self.interfaces.get(&interface.name) {
            Some(managed) => managed.handle,
            None => {
                let Some(device) = self.device_info.device_by_name(&interface.name) else {
                    tracing::warn!(interface = %interface.name, "configured interface has no link, skipping");
                    return;
                };
                device.set_technology(interface.technology);
                let handle = self.registry.create(
                    device.interface_index(),
                    &interface.name,
                    interface.technology,
                    interface.fixed_ip_params,
                );
                device.set_connection(Some(handle));
                tracing::info!(interface = %interface.name, %handle, "created connection");
                self.interfaces.insert(
                    interface.name.clone(),
                    Managed {
                        handle,
                        device,
                        technology: interface.technology,
                        fixed_ip_params: interface.fixed_ip_params,
                    },
                );
                handle
            }
        };

        let Some(connection) = self.registry.get_mut(handle) else {
            return;
        };
        if let Err(error) = connection.update_from_ipconfig(&interface.ipconfig) {
            tracing::warn!(%error, interface = %interface.name, "keeping previous ip configuration");
        }
    }

    fn remove_interface(&mut self, name: &str) {
        let Some(managed) = self.interfaces.remove(name) else {
            return;
        };
        self.registry.remove(managed.handle);
        managed.device.set_connection(None);
        if self.default_interface.as_deref() == Some(name) {
            self.default_interface = None;
        }
        tracing::info!(interface = %name, "removed connection");
    }

    fn elect_default(&mut self, config: &Config) {
        let default = config
            .default_interface(|interface| self.interfaces.contains_key(&interface.name))
            .map(|interface| interface.name.clone());

        // demote first so the resolver ends up with the default's servers
        for (name, managed) in &self.interfaces {
            if default.as_ref() == Some(name) {
                continue;
            }
            if let Some(connection) = self.registry.get_mut(managed.handle) {
                connection.set_use_dns(false);
                connection.set_metric(NON_DEFAULT_METRIC_BASE);
            }
        }
        if let Some(name) = &default
            && let Some(connection) = self
                .interfaces
                .get(name)
                .and_then(|managed| self.registry.get_mut(managed.handle))
        {
            connection.set_use_dns(true);
            connection.set_metric(DEFAULT_METRIC);
        }

        if default != self.default_interface {
            tracing::info!(from = ?self.default_interface, to = ?default, "default connection changed");
        }
        self.default_interface = default;
    }

    /// Pins the route found for a host route query and hands the answer to
    /// the connection that asked.
    pub fn on_route_answer(&mut self, answer: RouteAnswer) {
        let requester = answer.query.requester;
        if !self.registry.contains(requester) {
            tracing::debug!(%requester, address = %answer.query.address, "dropping route answer for a removed connection");
            return;
        }
        let entry = self.routing_table.complete_route_query(&answer);
        self.registry
            .on_route_query_response(requester, answer.if_index, &entry);
    }

    /// Removes every connection and with it all kernel state they installed.
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.interfaces.keys().cloned().collect();
        for name in names {
            self.remove_interface(&name);
        }
        tracing::info!("all connections removed");
    }
}
