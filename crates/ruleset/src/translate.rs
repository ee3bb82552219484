//! Pure translation from an admitted `NetworkPolicy` to the set and rule
//! declarations the engine needs to materialise it.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::model::{
    ChainKind, Mark, MatchQualifier, PeerKind, PortMatch, Protocol, Rule, RuleAction,
    SetDeclaration, SetListDeclaration, SetMatch, SetType,
};

/// Output of translating a single `NetworkPolicy`: everything the engine
/// needs to create before installing the rules, plus the rules themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    pub sets: Vec<SetDeclaration>,
    pub set_lists: Vec<SetListDeclaration>,
    pub rules: Vec<Rule>,
}

/// Translate a policy into its rule-set representation. Pure and
/// deterministic: same input yields byte-identical output including comment
/// strings, which participate in equality.
pub fn translate(policy: &NetworkPolicy) -> Translation {
    let namespace = policy
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let name = policy.metadata.name.clone().unwrap_or_default();
    let spec = match &policy.spec {
        Some(spec) => spec,
        None => return Translation::default(),
    };

    let policy_types: Vec<&str> = spec
        .policy_types
        .as_ref()
        .map(|types| types.iter().map(String::as_str).collect())
        .filter(|types: &Vec<&str>| !types.is_empty())
        .unwrap_or_else(|| vec!["Ingress", "Egress"]);

    let mut out = Translation::default();

    if policy_types.contains(&"Ingress") {
        translate_ingress(&namespace, &name, spec.ingress.as_deref(), &mut out);
    }
    if policy_types.contains(&"Egress") {
        translate_egress(&namespace, &name, spec.egress.as_deref(), &mut out);
    }

    out
}

fn translate_ingress(namespace: &str, policy_name: &str, rules: Option<&[NetworkPolicyIngressRule]>, out: &mut Translation) {
    let rules = rules.unwrap_or(&[]);
    if rules.is_empty() {
        // An ingress field present-but-empty (or the policyType declared with
        // no rules) denies everything; only the trailing drop applies.
        out.rules.push(drop_rule(ChainKind::IngressDrops, namespace, policy_name));
        return;
    }

    for (rule_idx, rule) in rules.iter().enumerate() {
        let ports = rule.ports.as_deref().unwrap_or(&[]);
        let peers = rule.from.as_deref();
        translate_direction(
            namespace,
            policy_name,
            rule_idx,
            ports,
            peers,
            ChainKind::IngressPort,
            ChainKind::IngressFrom,
            MatchQualifier::Source,
            Mark::IngressAllow,
            out,
        );
    }
    out.rules.push(drop_rule(ChainKind::IngressDrops, namespace, policy_name));
}

fn translate_egress(namespace: &str, policy_name: &str, rules: Option<&[NetworkPolicyEgressRule]>, out: &mut Translation) {
    let rules = rules.unwrap_or(&[]);
    if rules.is_empty() {
        out.rules.push(drop_rule(ChainKind::EgressDrops, namespace, policy_name));
        return;
    }

    for (rule_idx, rule) in rules.iter().enumerate() {
        let ports = rule.ports.as_deref().unwrap_or(&[]);
        let peers = rule.to.as_deref();
        translate_direction(
            namespace,
            policy_name,
            rule_idx,
            ports,
            peers,
            ChainKind::EgressPort,
            ChainKind::EgressTo,
            MatchQualifier::Destination,
            Mark::EgressAllow,
            out,
        );
    }
    out.rules.push(drop_rule(ChainKind::EgressDrops, namespace, policy_name));
}

#[allow(clippy::too_many_arguments)]
fn translate_direction(
    namespace: &str,
    policy_name: &str,
    rule_idx: usize,
    ports: &[NetworkPolicyPort],
    peers: Option<&[NetworkPolicyPeer]>,
    port_chain: ChainKind,
    peer_chain: ChainKind,
    qualifier: MatchQualifier,
    mark: Mark,
    out: &mut Translation,
) {
    let peers = match peers {
        None => {
            // No peer selector at all: allow from/to all namespaces, scoped
            // by port if one was given.
            emit_port_only_rules(namespace, policy_name, rule_idx, ports, port_chain, mark, out);
            return;
        }
        Some(peers) if peers.is_empty() => {
            // An explicit empty peer list matches nothing; nothing to emit.
            return;
        }
        Some(peers) => peers,
    };

    if ports.is_empty() {
        for (peer_idx, peer) in peers.iter().enumerate() {
            emit_peer_rule(namespace, policy_name, rule_idx, peer_idx, peer, None, peer_chain, qualifier, mark, out);
        }
    } else {
        for (peer_idx, peer) in peers.iter().enumerate() {
            for port in ports {
                emit_peer_rule(namespace, policy_name, rule_idx, peer_idx, peer, Some(port), peer_chain, qualifier, mark, out);
            }
        }
    }

    // Reverse the emitted peer rules for this logical rule so that, once the
    // engine inserts each at the chain head, kernel order matches intuition:
    // earliest-declared peer matches first.
    let start = out.rules.len().saturating_sub(peers.len().max(1) * ports.len().max(1));
    out.rules[start..].reverse();
}

#[allow(clippy::too_many_arguments)]
fn emit_port_only_rules(
    namespace: &str,
    policy_name: &str,
    rule_idx: usize,
    ports: &[NetworkPolicyPort],
    chain: ChainKind,
    mark: Mark,
    out: &mut Translation,
) {
    if ports.is_empty() {
        out.rules.push(Rule {
            chain,
            protocol: None,
            port: None,
            set_matches: vec![],
            action: RuleAction::MarkAndReturn(mark),
            comment: format!("{namespace}/{policy_name} rule {rule_idx}: allow from all namespaces"),
        });
        return;
    }
    for port in ports {
        out.rules.push(port_rule(namespace, policy_name, rule_idx, port, chain, vec![], mark));
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_peer_rule(
    namespace: &str,
    policy_name: &str,
    rule_idx: usize,
    peer_idx: usize,
    peer: &NetworkPolicyPeer,
    port: Option<&NetworkPolicyPort>,
    chain: ChainKind,
    qualifier: MatchQualifier,
    mark: Mark,
    out: &mut Translation,
) {
    let kind = classify_peer(peer);
    match kind {
        PeerKind::Cidr { cidr, excepts } => {
            let set_name = cidr_set_name(namespace, policy_name, rule_idx, peer_idx);
            out.sets.push(SetDeclaration {
                name: set_name.clone(),
                set_type: SetType::IpHash,
            });
            let comment = format!("{namespace}/{policy_name} rule {rule_idx} peer {peer_idx}: cidr {cidr} except {excepts:?}");
            out.rules.push(build_rule(chain, port, &set_name, qualifier, mark, &comment));
        }
        PeerKind::NamespaceSelector(selector) => {
            let set_list_name = namespace_selector_set_list(namespace, &selector);
            out.set_lists.push(SetListDeclaration {
                name: set_list_name.clone(),
                members: vec![],
                selector: effective_selector(&selector),
            });
            let comment = format!("{namespace}/{policy_name} rule {rule_idx} peer {peer_idx}: namespace selector {selector:?}");
            out.rules.push(build_rule(chain, port, &set_list_name, qualifier, mark, &comment));
        }
        PeerKind::PodSelector(selector) => {
            let set_name = pod_selector_set_name(namespace, &selector);
            out.sets.push(SetDeclaration {
                name: set_name.clone(),
                set_type: SetType::IpHash,
            });
            let comment = format!("{namespace}/{policy_name} rule {rule_idx} peer {peer_idx}: pod selector in {namespace} {selector:?}");
            out.rules.push(build_rule(chain, port, &set_name, qualifier, mark, &comment));
        }
        PeerKind::Intersection { namespace: ns_sel, pod: pod_sel } => {
            let ns_set_list = namespace_selector_set_list(namespace, &ns_sel);
            let pod_set = pod_selector_set_name(namespace, &pod_sel);
            out.set_lists.push(SetListDeclaration {
                name: ns_set_list.clone(),
                members: vec![],
                selector: effective_selector(&ns_sel),
            });
            out.sets.push(SetDeclaration {
                name: pod_set.clone(),
                set_type: SetType::IpHash,
            });
            let comment = format!(
                "{namespace}/{policy_name} rule {rule_idx} peer {peer_idx}: namespace {ns_sel:?} intersect pod {pod_sel:?}"
            );
            out.rules.push(Rule {
                chain,
                protocol: port.map(protocol_of),
                port: port.and_then(port_match_of),
                set_matches: vec![
                    SetMatch { set: ns_set_list, qualifier, negate: false },
                    SetMatch { set: pod_set, qualifier, negate: false },
                ],
                action: RuleAction::MarkAndReturn(mark),
                comment,
            });
        }
    }
}

fn classify_peer(peer: &NetworkPolicyPeer) -> PeerKind {
    if let Some(block) = &peer.ip_block {
        return PeerKind::Cidr {
            cidr: block.cidr.clone(),
            excepts: block.except.clone().unwrap_or_default(),
        };
    }
    let ns = peer.namespace_selector.as_ref().map(selector_to_map);
    let pod = peer.pod_selector.as_ref().map(selector_to_map);
    match (peer.namespace_selector.is_some(), peer.pod_selector.is_some()) {
        (true, true) => PeerKind::Intersection { namespace: ns, pod },
        (true, false) => PeerKind::NamespaceSelector(ns),
        (false, true) => PeerKind::PodSelector(pod),
        (false, false) => PeerKind::NamespaceSelector(None),
    }
}

fn selector_to_map(selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector) -> BTreeMap<String, String> {
    selector.match_labels.clone().unwrap_or_default().into_iter().collect()
}

fn port_rule(
    namespace: &str,
    policy_name: &str,
    rule_idx: usize,
    port: &NetworkPolicyPort,
    chain: ChainKind,
    set_matches: Vec<SetMatch>,
    mark: Mark,
) -> Rule {
    let comment = match &port.port {
        Some(p) => format!("{namespace}/{policy_name} rule {rule_idx}: port {p:?}"),
        None => format!("{namespace}/{policy_name} rule {rule_idx}: all ports"),
    };
    Rule {
        chain,
        protocol: Some(protocol_of(port)),
        port: port_match_of(port),
        set_matches,
        action: RuleAction::MarkAndReturn(mark),
        comment,
    }
}

fn build_rule(
    chain: ChainKind,
    port: Option<&NetworkPolicyPort>,
    set_name: &str,
    qualifier: MatchQualifier,
    mark: Mark,
    comment: &str,
) -> Rule {
    Rule {
        chain,
        protocol: port.map(protocol_of),
        port: port.and_then(port_match_of),
        set_matches: vec![SetMatch {
            set: set_name.to_string(),
            qualifier,
            negate: false,
        }],
        action: RuleAction::MarkAndReturn(mark),
        comment: comment.to_string(),
    }
}

fn protocol_of(port: &NetworkPolicyPort) -> Protocol {
    match port.protocol.as_deref() {
        Some("UDP") => Protocol::Udp,
        _ => Protocol::Tcp,
    }
}

/// Converts a `NetworkPolicyPort.port` into the match this engine enforces:
/// a literal number for `IntOrString::Int`, or membership in the named-port
/// set the Pod controller maintains for `IntOrString::String`.
fn port_match_of(port: &NetworkPolicyPort) -> Option<PortMatch> {
    match port.port.as_ref()? {
        IntOrString::Int(n) => Some(PortMatch::Number(*n as u16)),
        IntOrString::String(name) => Some(PortMatch::NamedSet(named_port_set_name(name))),
    }
}

fn drop_rule(chain: ChainKind, namespace: &str, policy_name: &str) -> Rule {
    Rule {
        chain,
        protocol: None,
        port: None,
        set_matches: vec![],
        action: RuleAction::Drop,
        comment: format!("{namespace}/{policy_name}: default drop"),
    }
}

fn cidr_set_name(namespace: &str, policy_name: &str, rule_idx: usize, peer_idx: usize) -> String {
    format!("cidr-{namespace}-{policy_name}-{rule_idx}-{peer_idx}")
}

/// Set name a pod-selector predicate maps to. Exposed so the Pod controller
/// can compute, for a single label key or key=value pair it observes, the
/// exact set name a policy selecting on that same predicate would reference.
pub fn pod_selector_set_name(namespace: &str, selector: &Option<BTreeMap<String, String>>) -> String {
    match selector {
        None => format!("ns-{namespace}"),
        Some(map) if map.is_empty() => format!("ns-{namespace}"),
        Some(map) => format!("podselector-{namespace}-{}", hash_label_map(map)),
    }
}

fn effective_selector(selector: &Option<BTreeMap<String, String>>) -> Option<BTreeMap<String, String>> {
    selector.clone().filter(|map| !map.is_empty())
}

fn namespace_selector_set_list(_namespace: &str, selector: &Option<BTreeMap<String, String>>) -> String {
    match selector {
        None => "all-namespaces".to_string(),
        Some(map) if map.is_empty() => "all-namespaces".to_string(),
        Some(map) => format!("nsselector-{}", hash_label_map(map)),
    }
}

/// A stable hash of a compound label predicate, used to name the synthetic
/// set-of-sets it produces.
fn hash_label_map(map: &BTreeMap<String, String>) -> String {
    let mut hasher = DefaultHasher::new();
    for (k, v) in map {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Splits `0.0.0.0/0` into the two halves the underlying set implementation
/// accepts, since it refuses the full address range as a single member.
pub fn cidr_members(cidr: &str) -> Vec<String> {
    if cidr == "0.0.0.0/0" {
        vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()]
    } else {
        vec![cidr.to_string()]
    }
}

/// Set name for "pod carries this label key, any value" membership.
pub fn label_key_set_name(namespace: &str, key: &str) -> String {
    format!("labelkey-{namespace}-{key}")
}

/// The synthetic set name used for a pod's named port, matched by membership
/// rather than by literal port so a pod's named port can change without
/// reprogramming the kernel rule.
pub fn named_port_set_name(port_name: &str) -> String {
    format!("namedport-{port_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_route_cidr_splits_into_two_halves() {
        assert_eq!(cidr_members("0.0.0.0/0"), vec!["0.0.0.0/1", "128.0.0.0/1"]);
    }

    #[test]
    fn ordinary_cidr_is_unchanged() {
        assert_eq!(cidr_members("10.0.0.0/16"), vec!["10.0.0.0/16"]);
    }

    #[test]
    fn hash_label_map_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("role".to_string(), "prod".to_string());
        let mut b = BTreeMap::new();
        b.insert("role".to_string(), "prod".to_string());
        assert_eq!(hash_label_map(&a), hash_label_map(&b));
    }

    #[test]
    fn empty_policy_produces_no_output() {
        let policy = NetworkPolicy::default();
        let translation = translate(&policy);
        assert!(translation.rules.is_empty());
        assert!(translation.sets.is_empty());
    }

    #[test]
    fn translate_is_pure_and_deterministic() {
        let mut policy = NetworkPolicy::default();
        policy.metadata.name = Some("deny-all".to_string());
        policy.metadata.namespace = Some("a".to_string());
        policy.spec = Some(k8s_openapi::api::networking::v1::NetworkPolicySpec {
            pod_selector: Default::default(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: None,
            egress: None,
        });
        let first = translate(&policy);
        let second = translate(&policy);
        assert_eq!(first, second);
        assert_eq!(first.rules.len(), 1);
        assert_eq!(first.rules[0].action, RuleAction::Drop);
    }

    #[test]
    fn numeric_port_translates_to_a_literal_port_match() {
        let port = NetworkPolicyPort {
            port: Some(IntOrString::Int(443)),
            protocol: Some("TCP".to_string()),
            end_port: None,
        };
        let rule = port_rule("a", "p", 0, &port, ChainKind::IngressPort, vec![], Mark::IngressAllow);
        assert_eq!(rule.port, Some(PortMatch::Number(443)));
        assert_eq!(rule.action, RuleAction::MarkAndReturn(Mark::IngressAllow));
    }

    #[test]
    fn named_port_translates_to_named_set_membership() {
        let port = NetworkPolicyPort {
            port: Some(IntOrString::String("https".to_string())),
            protocol: None,
            end_port: None,
        };
        let rule = port_rule("a", "p", 0, &port, ChainKind::EgressPort, vec![], Mark::EgressAllow);
        assert_eq!(rule.port, Some(PortMatch::NamedSet(named_port_set_name("https"))));
    }

    #[test]
    fn peer_rule_without_a_port_carries_no_port_match() {
        let rule = build_rule(ChainKind::IngressFrom, None, "cidr-a-p-0-0", MatchQualifier::Source, Mark::IngressAllow, "comment");
        assert_eq!(rule.port, None);
        assert_eq!(rule.action, RuleAction::MarkAndReturn(Mark::IngressAllow));
    }

    #[test]
    fn ingress_rule_with_peer_and_cidr_emits_mark_and_return_not_accept() {
        let mut policy = NetworkPolicy::default();
        policy.metadata.name = Some("allow-cidr".to_string());
        policy.metadata.namespace = Some("a".to_string());
        policy.spec = Some(k8s_openapi::api::networking::v1::NetworkPolicySpec {
            pod_selector: Default::default(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                ports: None,
                from: Some(vec![NetworkPolicyPeer {
                    ip_block: Some(k8s_openapi::api::networking::v1::IPBlock {
                        cidr: "10.0.0.0/16".to_string(),
                        except: None,
                    }),
                    namespace_selector: None,
                    pod_selector: None,
                }]),
            }]),
            egress: None,
        });
        let translation = translate(&policy);
        let peer_rule = translation.rules.iter().find(|r| r.chain == ChainKind::IngressFrom).unwrap();
        assert_eq!(peer_rule.action, RuleAction::MarkAndReturn(Mark::IngressAllow));
        assert!(translation.rules.iter().all(|r| r.action != RuleAction::Accept));
    }
}
