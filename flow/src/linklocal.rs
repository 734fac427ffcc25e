// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-local services: locally significant addresses that VMs reach through the fabric.

use ahash::RandomState;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// A service VMs reach at `service_ip:service_port`, served at `fabric_ip:fabric_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLocalService {
    pub name: &'static str,
    pub service_ip: IpAddr,
    pub service_port: u16,
    pub fabric_ip: IpAddr,
    pub fabric_port: u16,
}

type ServiceMap = HashMap<(IpAddr, u16), LinkLocalService, RandomState>;

/// Lock-free readable service table, replaced as a whole on configuration change.
pub struct LinkLocalServices {
    table: ArcSwap<ServiceMap>,
}

impl Default for LinkLocalServices {
    fn default() -> Self {
        Self {
            table: ArcSwap::from_pointee(ServiceMap::default()),
        }
    }
}

impl LinkLocalServices {
    #[must_use]
    pub fn new(services: &[LinkLocalService]) -> Self {
        let table = Self::default();
        table.replace(services);
        table
    }

    pub fn replace(&self, services: &[LinkLocalService]) {
        let map: ServiceMap = services
            .iter()
            .map(|s| ((s.service_ip, s.service_port), *s))
            .collect();
        info!("Link-local service table now has {} services", map.len());
        self.table.store(Arc::new(map));
    }

    #[must_use]
    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<LinkLocalService> {
        self.table.load().get(&(ip, port)).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn replace_swaps_whole_table() {
        let metadata = LinkLocalService {
            name: "metadata",
            service_ip: IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
            service_port: 80,
            fabric_ip: IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
            fabric_port: 8775,
        };
        let services = LinkLocalServices::new(&[metadata]);
        assert_eq!(
            services.lookup(metadata.service_ip, 80).map(|s| s.fabric_port),
            Some(8775)
        );
        assert!(services.lookup(metadata.service_ip, 81).is_none());
        services.replace(&[]);
        assert!(services.is_empty());
    }
}
