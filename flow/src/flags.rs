// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow flags, actions and short-flow reasons

use bitflags::bitflags;
use strum::{Display as StrumDisplay, EnumCount, EnumIter, IntoStaticStr};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowFlags: u32 {
        const NAT_FLOW                       = 1 << 0;
        const LOCAL_FLOW                     = 1 << 1;
        const SHORT_FLOW                     = 1 << 2;
        const LINK_LOCAL_FLOW                = 1 << 3;
        const REVERSE_FLOW                   = 1 << 4;
        const ECMP_FLOW                      = 1 << 5;
        const INGRESS_DIR                    = 1 << 6;
        const TRAP                           = 1 << 7;
        const MULTICAST                      = 1 << 8;
        const LINK_LOCAL_BIND_LOCAL_SRC_PORT = 1 << 9;
        const TCP_ACK_FLOW                   = 1 << 10;
        const UNKNOWN_UNICAST_FLOOD          = 1 << 11;
        const BGP_ROUTER_SERVICE             = 1 << 12;
        const ALIAS_IP_FLOW                  = 1 << 13;
    }
}

bitflags! {
    /// Action bitmap resulting from policy evaluation.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowAction: u8 {
        const PASS = 1 << 0;
        const DENY = 1 << 1;
        const NAT  = 1 << 2;
        const TRAP = 1 << 3;
    }
}

/// Why a flow is short. Only meaningful with [`FlowFlags::SHORT_FLOW`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumCount,
    EnumIter,
    IntoStaticStr,
    StrumDisplay,
)]
#[strum(serialize_all = "snake_case")]
pub enum ShortFlowReason {
    Unknown,
    UnavailableInterface,
    Ipv4FwdDisabled,
    UnavailableVrf,
    NoSrcRoute,
    NoDstRoute,
    AuditEntry,
    VrfChange,
    NoReverseFlow,
    ReverseFlowChange,
    NatChange,
    FlowLimit,
    LinkLocalSrcNat,
    FailedVrouterInstall,
    InvalidL2Flow,
    FlowOnTsn,
    NoMirrorEntry,
    SameFlowRflowKey,
    PortMapDrop,
    NoSrcRouteL2Rpf,
}
