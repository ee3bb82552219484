//! The rule-set engine: owns named address sets and the six owned rule
//! chains, and mediates every kernel mutation through one process-wide mutex
//! plus the advisory file lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, RulesetError};
use crate::model::{ChainKind, DispatcherPlacement, Mark, Rule, SetType};
use crate::runner::{CommandOutcome, CommandRunner, FileLock};

const IPTABLES: &str = "iptables";
const IPSET: &str = "ipset";
const FORWARD_CHAIN: &str = "FORWARD";
const PEER_CHAIN_NAME: &str = "KUBE-SERVICES";

/// Seconds `iptables` waits for the xtables lock before giving up, per spec
/// §6's contractual `<tool> -w <wait-seconds> <op> <chain> <spec…>` order.
/// `ipset` has its own locking and doesn't take this flag.
const IPTABLES_WAIT_SECONDS: &str = "5";

fn iptables_args(rest: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut args = vec!["-w".to_string(), IPTABLES_WAIT_SECONDS.to_string()];
    args.extend(rest);
    args
}

#[derive(Debug)]
struct SetEntry {
    set_type: SetType,
    ref_count: u32,
    members: HashSet<String>,
}

#[derive(Default)]
struct EngineState {
    sets: HashMap<String, SetEntry>,
    /// Rules currently installed, used to make `Add` idempotent and to
    /// answer `Exists` without a kernel round-trip in tests.
    rules: HashSet<Rule>,
}

/// Owns all in-memory bookkeeping for sets and rules; every method takes the
/// internal mutex before talking to the command runner, and the whole
/// critical section is additionally covered by the file lock for mutating
/// operations.
pub struct RulesetEngine<R: CommandRunner> {
    runner: R,
    lock: FileLock,
    state: Mutex<EngineState>,
    placement: DispatcherPlacement,
}

impl<R: CommandRunner> RulesetEngine<R> {
    pub fn new(runner: R, lock_path: impl Into<std::path::PathBuf>, placement: DispatcherPlacement) -> Self {
        Self {
            runner,
            lock: FileLock::new(lock_path),
            state: Mutex::new(EngineState::default()),
            placement,
        }
    }

    /// Idempotent: increments the reference count; materialises the set in
    /// the kernel only on the first reference.
    pub async fn create_set(&self, name: &str, set_type: SetType) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        let mut state = self.state.lock().await;
        let entry = state.sets.entry(name.to_string()).or_insert_with(|| SetEntry {
            set_type,
            ref_count: 0,
            members: HashSet::new(),
        });
        let first_reference = entry.ref_count == 0;
        entry.ref_count += 1;
        if first_reference {
            let args = vec![
                "create".to_string(),
                name.to_string(),
                set_type.kernel_type_flag().to_string(),
                "-exist".to_string(),
            ];
            self.run_idempotent(IPSET, &args).await?;
        }
        Ok(())
    }

    /// Decrements the reference count; removes from the kernel only when the
    /// count reaches zero and no rule still references it.
    pub async fn destroy_set(&self, name: &str) -> Result<u32> {
        let _guard = self.lock.acquire().await?;
        let mut state = self.state.lock().await;
        let still_referenced_by_rule = state
            .rules
            .iter()
            .any(|r| r.set_matches.iter().any(|m| m.set == name));
        let Some(entry) = state.sets.get_mut(name) else {
            return Ok(0);
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        let count = entry.ref_count;
        if count == 0 && !still_referenced_by_rule {
            state.sets.remove(name);
            drop(state);
            self.run_idempotent(IPSET, &["destroy".to_string(), name.to_string()])
                .await?;
        }
        Ok(count)
    }

    /// Adding a member that names another set (for `set-list` membership)
    /// requires that set to already exist and forbids nesting set-lists.
    pub async fn add_to_set(&self, name: &str, member: &str) -> Result<()> {
        {
            let state = self.state.lock().await;
            let entry = state.sets.get(name).ok_or_else(|| RulesetError::UnknownSet(name.to_string()))?;
            if entry.set_type == SetType::SetList {
                let member_entry = state
                    .sets
                    .get(member)
                    .ok_or_else(|| RulesetError::UnknownSet(member.to_string()))?;
                if member_entry.set_type == SetType::SetList {
                    return Err(RulesetError::NestedSetList {
                        name: name.to_string(),
                        member: member.to_string(),
                    });
                }
            }
        }
        let _guard = self.lock.acquire().await?;
        let args = vec![
            "add".to_string(),
            name.to_string(),
            member.to_string(),
            "-exist".to_string(),
        ];
        self.run_idempotent(IPSET, &args).await?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sets.get_mut(name) {
            entry.members.insert(member.to_string());
        }
        Ok(())
    }

    pub async fn delete_from_set(&self, name: &str, member: &str) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        let args = vec!["del".to_string(), name.to_string(), member.to_string()];
        self.run_idempotent(IPSET, &args).await?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sets.get_mut(name) {
            entry.members.remove(member);
        }
        Ok(())
    }

    /// Creates the dispatcher and owned chains, wires the static jumps
    /// between them (dispatcher -> ingress/egress/accept, each direction's
    /// wrapper -> its port/peer/drops sub-chains, each drops chain's
    /// skip-if-already-allowed guard, and the accept chain's terminal
    /// `ACCEPT`), and installs the forward jump at its configured placement.
    pub async fn init_chains(&self) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        for chain in std::iter::once(ChainKind::Dispatcher).chain(ChainKind::ALL_OWNED) {
            self.run_idempotent(IPTABLES, &iptables_args(["-N".to_string(), chain.chain_name().to_string()]))
                .await?;
        }
        self.append(ChainKind::Dispatcher, &["-j", ChainKind::Ingress.chain_name()]).await?;
        self.append(ChainKind::Dispatcher, &["-j", ChainKind::Egress.chain_name()]).await?;
        self.append(ChainKind::Dispatcher, &["-j", ChainKind::Accept.chain_name()]).await?;
        self.append(ChainKind::Ingress, &["-j", ChainKind::IngressPort.chain_name()]).await?;
        self.append(ChainKind::Ingress, &["-j", ChainKind::IngressFrom.chain_name()]).await?;
        self.append(ChainKind::Ingress, &["-j", ChainKind::IngressDrops.chain_name()]).await?;
        self.append(ChainKind::Egress, &["-j", ChainKind::EgressPort.chain_name()]).await?;
        self.append(ChainKind::Egress, &["-j", ChainKind::EgressTo.chain_name()]).await?;
        self.append(ChainKind::Egress, &["-j", ChainKind::EgressDrops.chain_name()]).await?;
        self.append_mark_guard(ChainKind::IngressDrops, Mark::IngressAllow).await?;
        self.append_mark_guard(ChainKind::EgressDrops, Mark::EgressAllow).await?;
        self.append(ChainKind::Accept, &["-j", "ACCEPT"]).await?;
        drop(_guard);
        self.ensure_forward_jump(self.placement).await
    }

    async fn append(&self, chain: ChainKind, spec: &[&str]) -> Result<()> {
        let mut args = vec!["-A".to_string(), chain.chain_name().to_string()];
        args.extend(spec.iter().map(ToString::to_string));
        self.run_idempotent(IPTABLES, &iptables_args(args)).await?;
        Ok(())
    }

    /// Lets a packet already carrying `mark`'s bit skip straight past a
    /// drops chain's catch-all, so a direction's default-deny only applies
    /// when none of that direction's port/peer rules matched.
    async fn append_mark_guard(&self, chain: ChainKind, mark: Mark) -> Result<()> {
        let bits = format!("{:#x}", mark.value());
        let mark_arg = format!("{bits}/{bits}");
        self.append(chain, &["-m", "mark", "--mark", &mark_arg, "-j", "RETURN"]).await
    }

    /// Reverse of `init_chains`; tolerant of "does not exist" on every step.
    pub async fn flush_and_remove_chains(&self) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        for chain in ChainKind::ALL_OWNED.into_iter().chain(std::iter::once(ChainKind::Dispatcher)) {
            self.run_idempotent(IPTABLES, &iptables_args(["-F".to_string(), chain.chain_name().to_string()]))
                .await?;
            self.run_idempotent(IPTABLES, &iptables_args(["-X".to_string(), chain.chain_name().to_string()]))
                .await?;
        }
        Ok(())
    }

    /// On add, drop-chain rules are appended; others are inserted at the
    /// head so newer allows take precedence while the trailing drop still
    /// catches anything unmatched. A `MarkAndReturn` action expands to two
    /// physical rules (set-mark, then return) sharing the same match spec
    /// and op. Re-adding the same logical rule is a no-op.
    pub async fn add(&self, rule: Rule) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.rules.contains(&rule) {
                return Ok(());
            }
        }
        let _guard = self.lock.acquire().await?;
        let op = if rule.chain.is_drop_chain() { "-A" } else { "-I" };
        let match_args = rule.match_args();
        for target_args in rule.target_variants() {
            let mut args = vec![op.to_string(), rule.chain.chain_name().to_string()];
            args.extend(match_args.clone());
            args.extend(target_args);
            self.run_idempotent(IPTABLES, &iptables_args(args)).await?;
        }
        let mut state = self.state.lock().await;
        state.rules.insert(rule);
        Ok(())
    }

    pub async fn delete(&self, rule: &Rule) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        let match_args = rule.match_args();
        for target_args in rule.target_variants() {
            let mut args = vec!["-D".to_string(), rule.chain.chain_name().to_string()];
            args.extend(match_args.clone());
            args.extend(target_args);
            self.run_idempotent(IPTABLES, &iptables_args(args)).await?;
        }
        let mut state = self.state.lock().await;
        state.rules.remove(rule);
        Ok(())
    }

    pub async fn exists(&self, rule: &Rule) -> bool {
        self.state.lock().await.rules.contains(rule)
    }

    /// Dispatcher placement algorithm (spec §4.2): find the peer's line on
    /// `FORWARD`, compute the target line for our mode, and reposition only
    /// if we're not already there. All steps share one lock acquisition.
    pub async fn ensure_forward_jump(&self, mode: DispatcherPlacement) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        let listing = self
            .run_idempotent(IPTABLES, &iptables_args(["-L".to_string(), FORWARD_CHAIN.to_string(), "-n".to_string(), "--line-numbers".to_string()]))
            .await?;
        let peer_line = find_peer_line(&listing);
        let target_line = match mode {
            DispatcherPlacement::First => 1,
            DispatcherPlacement::AfterPeer => peer_line.map_or(1, |l| l + 1),
        };
        let current_line = find_dispatcher_line(&listing);
        if current_line == Some(target_line) {
            return Ok(());
        }
        if current_line.is_some() {
            self.run_idempotent(
                IPTABLES,
                &iptables_args(["-D".to_string(), FORWARD_CHAIN.to_string(), "-j".to_string(), ChainKind::Dispatcher.chain_name().to_string()]),
            )
            .await?;
        }
        self.run_idempotent(
            IPTABLES,
            &iptables_args([
                "-I".to_string(),
                FORWARD_CHAIN.to_string(),
                target_line.to_string(),
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                "NEW".to_string(),
                "-j".to_string(),
                ChainKind::Dispatcher.chain_name().to_string(),
            ]),
        )
        .await?;
        info!(target_line, ?mode, "repositioned dispatcher jump");
        Ok(())
    }

    async fn run_idempotent(&self, program: &str, args: &[String]) -> Result<String> {
        match self.runner.run(program, args).await? {
            CommandOutcome::Ok { stdout } => Ok(stdout),
            CommandOutcome::AlreadyExistsOrNotFound => Ok(String::new()),
            CommandOutcome::Failed { stderr } => Err(RulesetError::Command {
                program: program.to_string(),
                args: args.to_vec(),
                stderr,
            }),
        }
    }
}

/// Drift reconciliation: called on a timer; logs and silently corrects drift
/// from the configured placement.
pub async fn reconcile_dispatcher_placement<R: CommandRunner>(engine: &Arc<RulesetEngine<R>>, mode: DispatcherPlacement) {
    if let Err(err) = engine.ensure_forward_jump(mode).await {
        warn!("dispatcher placement reconcile failed: {err}");
    }
}

/// Parses a `-L FORWARD -n --line-numbers` listing for the peer's line,
/// looking for a jump target that isn't our own dispatcher.
fn find_peer_line(listing: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let line_no: u32 = fields.next()?.parse().ok()?;
        if line.contains(PEER_CHAIN_NAME) {
            Some(line_no)
        } else {
            None
        }
    })
}

fn find_dispatcher_line(listing: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let line_no: u32 = fields.next()?.parse().ok()?;
        if line.contains(ChainKind::Dispatcher.chain_name()) {
            Some(line_no)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainKind, RuleAction};
    use crate::runner::CommandOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for CountingRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutcome::Ok { stdout: String::new() })
        }
    }

    fn temp_lock_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ruleset-engine-test-{tag}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn create_set_materialises_only_on_first_reference() {
        let engine = RulesetEngine::new(CountingRunner::default(), temp_lock_path("create"), DispatcherPlacement::First);
        engine.create_set("ns-a", SetType::IpHash).await.unwrap();
        engine.create_set("ns-a", SetType::IpHash).await.unwrap();
        assert_eq!(engine.runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_set_removes_kernel_object_only_at_zero_refcount() {
        let engine = RulesetEngine::new(CountingRunner::default(), temp_lock_path("destroy"), DispatcherPlacement::First);
        engine.create_set("ns-a", SetType::IpHash).await.unwrap();
        engine.create_set("ns-a", SetType::IpHash).await.unwrap();
        let after_first = engine.destroy_set("ns-a").await.unwrap();
        assert_eq!(after_first, 1);
        let after_second = engine.destroy_set("ns-a").await.unwrap();
        assert_eq!(after_second, 0);
    }

    #[tokio::test]
    async fn add_to_nested_set_list_is_rejected() {
        let engine = RulesetEngine::new(CountingRunner::default(), temp_lock_path("nested"), DispatcherPlacement::First);
        engine.create_set("outer", SetType::SetList).await.unwrap();
        engine.create_set("inner", SetType::SetList).await.unwrap();
        let err = engine.add_to_set("outer", "inner").await.unwrap_err();
        assert!(matches!(err, RulesetError::NestedSetList { .. }));
    }

    #[tokio::test]
    async fn add_rule_twice_is_idempotent() {
        let engine = RulesetEngine::new(CountingRunner::default(), temp_lock_path("add-rule"), DispatcherPlacement::First);
        let rule = Rule {
            chain: ChainKind::IngressPort,
            protocol: None,
            port: None,
            set_matches: vec![],
            action: RuleAction::Accept,
            comment: "allow all".to_string(),
        };
        engine.add(rule.clone()).await.unwrap();
        engine.add(rule.clone()).await.unwrap();
        assert_eq!(engine.runner.calls.load(Ordering::SeqCst), 1);
        assert!(engine.exists(&rule).await);
    }

    #[derive(Default)]
    struct RecordingRunner {
        calls: tokio::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutcome> {
            self.calls.lock().await.push(args.to_vec());
            Ok(CommandOutcome::Ok { stdout: String::new() })
        }
    }

    #[tokio::test]
    async fn add_rule_serialises_protocol_port_sets_action_and_wait_flag() {
        use crate::model::{MatchQualifier, PortMatch, SetMatch};

        let engine = RulesetEngine::new(RecordingRunner::default(), temp_lock_path("serialise"), DispatcherPlacement::First);
        let rule = Rule {
            chain: ChainKind::IngressFrom,
            protocol: Some(crate::model::Protocol::Tcp),
            port: Some(PortMatch::Number(443)),
            set_matches: vec![SetMatch {
                set: "ns-prod".to_string(),
                qualifier: MatchQualifier::Source,
                negate: false,
            }],
            action: RuleAction::Drop,
            comment: "prod/deny-all rule 0".to_string(),
        };
        engine.add(rule).await.unwrap();
        let calls = engine.runner.calls.lock().await;
        assert_eq!(calls.len(), 1);
        let args = &calls[0];
        assert_eq!(args[0], "-w");
        assert_eq!(args[1], "5");
        assert!(args.windows(2).any(|w| w == ["-p", "tcp"]));
        assert!(args.windows(2).any(|w| w == ["--dport", "443"]));
        assert!(args.windows(3).any(|w| w == ["--match-set", "ns-prod", "src"]));
        assert!(args.windows(2).any(|w| w == ["-j", "DROP"]));
    }

    #[tokio::test]
    async fn mark_and_return_expands_to_two_physical_rules_sharing_the_match_spec() {
        let engine = RulesetEngine::new(RecordingRunner::default(), temp_lock_path("mark"), DispatcherPlacement::First);
        let rule = Rule {
            chain: ChainKind::IngressPort,
            protocol: None,
            port: None,
            set_matches: vec![],
            action: RuleAction::MarkAndReturn(crate::model::Mark::IngressAllow),
            comment: "prod/allow-ingress rule 0".to_string(),
        };
        engine.add(rule).await.unwrap();
        let calls = engine.runner.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].windows(2).any(|w| w == ["--set-xmark", "0x2000/0x2000"]));
        assert!(calls[1].ends_with(&["-j".to_string(), "RETURN".to_string()]));
    }

    #[tokio::test]
    async fn init_chains_wires_dispatcher_into_ingress_egress_and_accept() {
        let engine = RulesetEngine::new(RecordingRunner::default(), temp_lock_path("init"), DispatcherPlacement::First);
        engine.init_chains().await.unwrap();
        let calls = engine.runner.calls.lock().await;
        let joined: Vec<String> = calls.iter().map(|a| a.join(" ")).collect();
        assert!(joined.iter().any(|c| c.contains("-A AZURE-NPM -j AZURE-NPM-INGRESS")));
        assert!(joined.iter().any(|c| c.contains("-A AZURE-NPM -j AZURE-NPM-EGRESS")));
        assert!(joined.iter().any(|c| c.contains("-A AZURE-NPM -j AZURE-NPM-ACCEPT")));
        assert!(joined.iter().any(|c| c.contains("AZURE-NPM-INGRESS-DROPS") && c.contains("--mark 0x2000/0x2000") && c.contains("RETURN")));
        assert!(joined.iter().any(|c| c.contains("-A AZURE-NPM-ACCEPT -j ACCEPT")));
    }
}
