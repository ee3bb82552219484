//! Shared data model for address sets, rule chains, and the objects the
//! controllers track from informer events.

use std::collections::BTreeMap;

/// The kind of kernel-backed address set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetType {
    /// Members are IPs or CIDR blocks.
    IpHash,
    /// Members are `ip,proto:port` pairs.
    IpPortHash,
    /// Members are names of other sets. Must not contain another set-list.
    SetList,
}

impl SetType {
    pub fn kernel_type_flag(self) -> &'static str {
        match self {
            SetType::IpHash => "hash:net",
            SetType::IpPortHash => "hash:ip,port",
            SetType::SetList => "list:set",
        }
    }
}

/// One of the nine rule chains this system owns, plus the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainKind {
    Dispatcher,
    Accept,
    Ingress,
    IngressPort,
    IngressFrom,
    IngressDrops,
    Egress,
    EgressPort,
    EgressTo,
    EgressDrops,
}

impl ChainKind {
    pub const ALL_OWNED: [ChainKind; 9] = [
        ChainKind::Accept,
        ChainKind::Ingress,
        ChainKind::IngressPort,
        ChainKind::IngressFrom,
        ChainKind::IngressDrops,
        ChainKind::Egress,
        ChainKind::EgressPort,
        ChainKind::EgressTo,
        ChainKind::EgressDrops,
    ];

    pub fn chain_name(self) -> &'static str {
        match self {
            ChainKind::Dispatcher => "AZURE-NPM",
            ChainKind::Accept => "AZURE-NPM-ACCEPT",
            ChainKind::Ingress => "AZURE-NPM-INGRESS",
            ChainKind::IngressPort => "AZURE-NPM-INGRESS-PORT",
            ChainKind::IngressFrom => "AZURE-NPM-INGRESS-FROM",
            ChainKind::IngressDrops => "AZURE-NPM-INGRESS-DROPS",
            ChainKind::Egress => "AZURE-NPM-EGRESS",
            ChainKind::EgressPort => "AZURE-NPM-EGRESS-PORT",
            ChainKind::EgressTo => "AZURE-NPM-EGRESS-TO",
            ChainKind::EgressDrops => "AZURE-NPM-EGRESS-DROPS",
        }
    }

    /// True for chains that hold the trailing catch-all drop rules, which are
    /// appended rather than inserted at the head.
    pub fn is_drop_chain(self) -> bool {
        matches!(self, ChainKind::IngressDrops | ChainKind::EgressDrops)
    }
}

/// Placement mode for the dispatcher jump on the host `FORWARD` chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherPlacement {
    First,
    AfterPeer,
}

/// Mark values threaded between a direction's port/peer chains and its own
/// drops chain. Each direction's bit is independent: a connection that never
/// enters a direction's pipeline (no policy selects the pod for it) carries
/// neither bit and that direction's drops chain never runs against it, which
/// preserves the "unselected direction is wide open" default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    EgressAllow,
    IngressAllow,
}

impl Mark {
    pub fn value(self) -> u32 {
        match self {
            Mark::EgressAllow => 0x1000,
            Mark::IngressAllow => 0x2000,
        }
    }
}

/// An action a rule performs on a matching packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Accept,
    Drop,
    Jump(ChainKind),
    MarkAndReturn(Mark),
}

/// Whether a set-membership match applies to the source or destination
/// address of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchQualifier {
    Source,
    Destination,
}

/// One membership predicate: match iff the given address is a member of `set`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetMatch {
    pub set: String,
    pub qualifier: MatchQualifier,
    pub negate: bool,
}

/// A port constraint on a rule: either a literal number (`--dport`) or
/// membership in a named-port set (populated from `ContainerPort.name` by
/// the pod controller, per spec §4.3 step 2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortMatch {
    Number(u16),
    NamedSet(String),
}

/// A single rule, carrying no identity beyond its exact textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: ChainKind,
    pub protocol: Option<Protocol>,
    pub port: Option<PortMatch>,
    pub set_matches: Vec<SetMatch>,
    pub action: RuleAction,
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl SetMatch {
    fn push_args(&self, args: &mut Vec<String>) {
        let dir = match self.qualifier {
            MatchQualifier::Source => "src",
            MatchQualifier::Destination => "dst",
        };
        if self.negate {
            args.push("!".to_string());
        }
        args.push("-m".to_string());
        args.push("set".to_string());
        args.push("--match-set".to_string());
        args.push(self.set.clone());
        args.push(dir.to_string());
    }
}

impl PortMatch {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            PortMatch::Number(port) => {
                args.push("--dport".to_string());
                args.push(port.to_string());
            }
            PortMatch::NamedSet(set) => {
                args.push("-m".to_string());
                args.push("set".to_string());
                args.push("--match-set".to_string());
                args.push(set.clone());
                args.push("dst".to_string());
            }
        }
    }
}

impl RuleAction {
    /// The `-j`/`-g` suffix for actions that map onto a single iptables
    /// target. [`RuleAction::MarkAndReturn`] has no single-target form and
    /// is rendered by the engine as two physical rules instead.
    fn target_args(self) -> Option<Vec<String>> {
        match self {
            RuleAction::Accept => Some(vec!["-j".to_string(), "ACCEPT".to_string()]),
            RuleAction::Drop => Some(vec!["-j".to_string(), "DROP".to_string()]),
            RuleAction::Jump(chain) => Some(vec!["-j".to_string(), chain.chain_name().to_string()]),
            RuleAction::MarkAndReturn(_) => None,
        }
    }
}

impl Rule {
    /// The match specification shared by every physical iptables rule this
    /// logical `Rule` expands to: protocol, port, set memberships, comment.
    /// Excludes the trailing `-j`/target, which differs per physical rule.
    pub fn match_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(protocol) = self.protocol {
            args.push("-p".to_string());
            args.push(protocol.as_str().to_string());
        }
        if let Some(port) = &self.port {
            port.push_args(&mut args);
        }
        for set_match in &self.set_matches {
            set_match.push_args(&mut args);
        }
        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(self.comment.clone());
        args
    }

    /// One set of target args per physical iptables rule this logical `Rule`
    /// expands to. A plain action is one rule; `MarkAndReturn` is two
    /// (`MARK --set-xmark` then `RETURN`) sharing the same match spec.
    pub fn target_variants(&self) -> Vec<Vec<String>> {
        match self.action.target_args() {
            Some(args) => vec![args],
            None => {
                let RuleAction::MarkAndReturn(mark) = self.action else {
                    unreachable!("target_args() only returns None for MarkAndReturn");
                };
                let mask = format!("{:#x}", mark.value());
                vec![
                    vec!["-j".to_string(), "MARK".to_string(), "--set-xmark".to_string(), format!("{mask}/{mask}")],
                    vec!["-j".to_string(), "RETURN".to_string()],
                ]
            }
        }
    }
}

/// The kind of peer a `NetworkPolicyPeer` resolves to, per spec §9 sum types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerKind {
    Cidr {
        cidr: String,
        excepts: Vec<String>,
    },
    NamespaceSelector(Option<BTreeMap<String, String>>),
    PodSelector(Option<BTreeMap<String, String>>),
    Intersection {
        namespace: Option<BTreeMap<String, String>>,
        pod: Option<BTreeMap<String, String>>,
    },
}

/// A declaration the translator emits asking the engine to create a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDeclaration {
    pub name: String,
    pub set_type: SetType,
}

/// A declaration for a `list:set` whose members are other sets.
///
/// `selector` records the label predicate namespace membership follows, so
/// the Namespace controller can maintain membership as labels change
/// without needing to re-derive it from the set's hashed name. `None` means
/// "all namespaces" (every namespace set is always a member).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetListDeclaration {
    pub name: String,
    pub members: Vec<String>,
    pub selector: Option<BTreeMap<String, String>>,
}

/// Cached container port on an [`NpmPod`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
}

/// A pod observed from the informer stream, reduced to the fields the
/// translator and controllers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmPod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub ip: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub container_ports: Vec<ContainerPort>,
    pub host_network: bool,
    pub phase_terminal: bool,
    pub deletion_grace_seconds: Option<i64>,
}

impl NpmPod {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// A pod is usable once it has an IP and hasn't exited the pipeline.
    pub fn is_usable(&self) -> bool {
        self.ip.is_some() && !self.host_network && !self.is_deleted()
    }

    /// Terminal phase or zero deletion grace is treated as already deleted
    /// so a lost delete event doesn't leave stale set membership behind.
    pub fn is_deleted(&self) -> bool {
        self.phase_terminal || self.deletion_grace_seconds == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmNamespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl NpmNamespace {
    pub fn set_name(&self) -> String {
        format!("ns-{}", self.name)
    }
}
