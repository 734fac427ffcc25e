// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow limit enforcement.
//!
//! The ceiling of an interface is its own override if set, else the one of its virtual
//! network, else the global per-VM ceiling. It is cached on the interface until a configuration
//! change invalidates it. Short flows count like any other flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

use crate::scope::{EffectiveLimit, LimitSource, Scopes, VmInterface};
use crate::Interface;

pub struct FlowLimits {
    scopes: Arc<Scopes>,
    max_vm_flows: AtomicU32,
    refused: AtomicU64,
}

impl FlowLimits {
    #[must_use]
    pub fn new(scopes: Arc<Scopes>, max_vm_flows: u32) -> Self {
        Self {
            scopes,
            max_vm_flows: AtomicU32::new(max_vm_flows),
            refused: AtomicU64::new(0),
        }
    }

    pub fn set_max_vm_flows(&self, max_vm_flows: u32) {
        self.max_vm_flows.store(max_vm_flows, Ordering::Relaxed);
        for intf in self.scopes.interfaces() {
            intf.invalidate_limit();
            self.refresh(&intf);
        }
    }

    /// The ceiling in force for `intf`, computed once and cached on it.
    pub fn effective_limit(&self, intf: &VmInterface) -> EffectiveLimit {
        if let Some(limit) = intf.cached_limit() {
            return limit;
        }
        let vn_max = intf
            .vn()
            .and_then(|vn| self.scopes.vn(vn))
            .map_or(0, |vn| vn.max_flows());
        let limit = if intf.max_flows() > 0 {
            EffectiveLimit {
                limit: intf.max_flows(),
                source: LimitSource::Interface,
            }
        } else if vn_max > 0 {
            EffectiveLimit {
                limit: vn_max,
                source: LimitSource::Vn,
            }
        } else {
            EffectiveLimit {
                limit: self.max_vm_flows.load(Ordering::Relaxed),
                source: LimitSource::Vm,
            }
        };
        debug!(
            "Interface {}: flow limit {} from {:?}",
            intf.id(),
            limit.limit,
            limit.source
        );
        intf.cache_limit(limit);
        limit
    }

    fn count(&self, intf: &VmInterface, source: LimitSource) -> u32 {
        match source {
            LimitSource::Vm => self.scopes.vm_flow_count(intf.vm()),
            LimitSource::Interface | LimitSource::Vn => intf.flow_count(),
        }
    }

    /// Whether one more flow may be charged to `intf`. A refusal turns `drop_new_flows` on.
    pub fn admit(&self, intf: &VmInterface) -> bool {
        let EffectiveLimit { limit, source } = self.effective_limit(intf);
        if limit == 0 {
            return true;
        }
        let count = self.count(intf, source);
        if count >= limit {
            debug!(
                "Interface {}: flow refused ({count}/{limit} from {source:?})",
                intf.id()
            );
            self.refused.fetch_add(1, Ordering::Relaxed);
            intf.set_drop_new_flows(true);
            return false;
        }
        true
    }

    /// Recompute `drop_new_flows` after the count of `intf` changed.
    pub fn refresh(&self, intf: &VmInterface) {
        let EffectiveLimit { limit, source } = self.effective_limit(intf);
        let drop = limit > 0 && self.count(intf, source) >= limit;
        intf.set_drop_new_flows(drop);
    }

    /// Flows refused so far.
    #[must_use]
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::VmInterfaceConfigBuilder;
    use std::net::{IpAddr, Ipv4Addr};

    fn intf(scopes: &Scopes, id: u32, vm: u32, vn: u32, max_flows: u32) -> Arc<VmInterface> {
        scopes.add_interface(
            VmInterfaceConfigBuilder::default()
                .id(id)
                .vm(vm)
                .vn(vn)
                .vrf(1_u32)
                .ip(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))
                .max_flows(max_flows)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn precedence_interface_vn_global() {
        let scopes = Arc::new(Scopes::new());
        let limits = FlowLimits::new(scopes.clone(), 10);
        let a = intf(&scopes, 1, 1, 7, 5);
        let b = intf(&scopes, 2, 2, 7, 0);
        let c = intf(&scopes, 3, 3, 8, 0);
        scopes.set_vn_max_flows(7, 3);

        assert_eq!(limits.effective_limit(&a).source, LimitSource::Interface);
        assert_eq!(
            limits.effective_limit(&b),
            EffectiveLimit {
                limit: 3,
                source: LimitSource::Vn
            }
        );
        assert_eq!(
            limits.effective_limit(&c),
            EffectiveLimit {
                limit: 10,
                source: LimitSource::Vm
            }
        );
        assert_eq!(b.effective_max_flows(), 3);
    }

    #[test]
    fn cached_until_invalidated() {
        let scopes = Arc::new(Scopes::new());
        let limits = FlowLimits::new(scopes.clone(), 0);
        let a = intf(&scopes, 1, 1, 7, 0);
        assert_eq!(limits.effective_limit(&a).limit, 0);
        scopes.set_vn_max_flows(7, 2);
        assert_eq!(limits.effective_limit(&a).limit, 0);
        a.invalidate_limit();
        assert_eq!(limits.effective_limit(&a).limit, 2);
    }

    #[test]
    fn admission_sets_and_clears_drop() {
        let scopes = Arc::new(Scopes::new());
        let limits = FlowLimits::new(scopes.clone(), 0);
        let a = intf(&scopes, 1, 1, 7, 2);
        for _ in 0..2 {
            assert!(limits.admit(&a));
            scopes.flow_added(&a);
        }
        assert!(!limits.admit(&a));
        assert!(a.drop_new_flows());
        assert_eq!(limits.refused(), 1);
        scopes.flow_removed(&a);
        limits.refresh(&a);
        assert!(!a.drop_new_flows());
    }

    #[test]
    fn global_ceiling_counts_the_whole_vm() {
        let scopes = Arc::new(Scopes::new());
        let limits = FlowLimits::new(scopes.clone(), 2);
        let a = intf(&scopes, 1, 9, 7, 0);
        let b = intf(&scopes, 2, 9, 7, 0);
        assert!(limits.admit(&a));
        scopes.flow_added(&a);
        assert!(limits.admit(&b));
        scopes.flow_added(&b);
        assert!(!limits.admit(&a));
        assert_eq!(scopes.vm_flow_count(9), 2);

        // raising the ceiling lifts the drop on every interface of the vm
        limits.set_max_vm_flows(3);
        assert!(!a.drop_new_flows());
        assert!(!b.drop_new_flows());
        assert!(limits.admit(&b));
    }
}
