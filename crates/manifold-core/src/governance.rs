//! Manifest governance state machine.
//!
//! Lifecycle: `commit_root` → activation delay → audit gate → `activate_committed_root`.
//! Routes are applied under Merkle proof against the active root. `freeze` is terminal.
//!
//! The core is a pure function `transition(&state, &command, &env)` returning the next state
//! and emitted events. `ManifestStateMachine` owns the state and replaces it only when a
//! transition succeeds, so every operation is all-or-nothing.
//!
//! # Security: Fail-Closed Behavior
//!
//! - No configured audit registry, a registry error, or a "not approved" answer all block
//!   activation unless maintenance mode is on; each such bypass is recorded in the
//!   hash-chained `BypassLog`.
//! - An unset audit registry is not treated as "no audit required": activation without one
//!   needs maintenance mode and is logged as `BypassKind::MissingAuditRegistry`. Deployments
//!   that relied on an unset registry letting activation through must configure one.
//! - A pinned code identity that differs from the deployed code rejects the whole batch.

use crate::codehash::observed_identity;
use crate::config::GovernanceConfig;
use crate::maintenance::{BypassKind, BypassLog, BypassRecord};
use crate::merkle::{check_proof_shape, fold_path, RouteLeaf, MAX_PROOF_DEPTH};
use crate::{
    Address, AuditRegistry, CodeIdentity, CodeSource, Hash32, LedgerClock, ManifoldError,
    Result, Selector,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

// =============================================================================
// State
// =============================================================================

/// The authoritative root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRoot {
    pub root: Hash32,
    pub epoch: u64,
    /// Leaf count, when committed alongside the root. Enables proof-shape checks.
    pub leaf_count: Option<u32>,
    pub created_at: u64,
}

/// A committed root awaiting delay and audit approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRoot {
    pub root: Hash32,
    pub epoch: u64,
    pub leaf_count: Option<u32>,
    pub committed_at: u64,
}

/// Live routing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub facet: Address,
    /// Code identity checked at apply time; `None` when applied unpinned.
    pub pinned: Option<CodeIdentity>,
}

/// Complete governance state. Owned; threaded through `transition`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceState {
    pub active: Option<ManifestRoot>,
    pub pending: Option<PendingRoot>,
    pub routes: BTreeMap<Selector, Route>,
    pub activation_delay: u64,
    pub max_activation_delay: u64,
    /// Identifier of the configured audit registry, if any.
    pub audit_registry: Option<Address>,
    pub dev_registrar_enabled: bool,
    pub paused: bool,
    pub frozen: bool,
    pub bypass_log: BypassLog,
}

impl GovernanceState {
    pub fn new(config: &GovernanceConfig) -> Self {
        Self {
            active: None,
            pending: None,
            routes: BTreeMap::new(),
            activation_delay: config.activation_delay_secs,
            max_activation_delay: config.max_activation_delay_secs,
            audit_registry: None,
            dev_registrar_enabled: false,
            paused: false,
            frozen: false,
            bypass_log: BypassLog::new(),
        }
    }

    /// Zero while uninitialized.
    pub fn active_epoch(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.epoch)
    }
}

// =============================================================================
// Commands and events
// =============================================================================

/// Parallel arrays submitted to `apply_routes`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBatch {
    pub selectors: Vec<Selector>,
    pub facets: Vec<Address>,
    /// Zero means "do not pin".
    pub code_identities: Vec<CodeIdentity>,
    pub proofs: Vec<Vec<Hash32>>,
    pub positions: Vec<u64>,
}

impl RouteBatch {
    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    fn check_lengths(&self) -> Result<()> {
        let n = self.selectors.len();
        let lens = [
            ("facets", self.facets.len()),
            ("code_identities", self.code_identities.len()),
            ("proofs", self.proofs.len()),
            ("positions", self.positions.len()),
        ];
        for (name, len) in lens {
            if len != n {
                return Err(ManifoldError::LengthMismatch(format!(
                    "{n} selectors but {len} {name}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CommitRoot {
        root: Hash32,
        epoch: u64,
        leaf_count: Option<u32>,
    },
    ActivateCommittedRoot,
    ApplyRoutes(RouteBatch),
    RemoveRoutes { selectors: Vec<Selector> },
    SetPaused(bool),
    AdminRegisterUnsafe {
        facets: Vec<Address>,
        selectors: Vec<Vec<Selector>>,
    },
    SetDevRegistrarEnabled(bool),
    SetAuditRegistry { registry: Option<Address> },
    SetActivationDelay { seconds: u64 },
    Freeze,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RootCommitted {
        root: Hash32,
        epoch: u64,
        committed_at: u64,
    },
    RootActivated {
        root: Hash32,
        epoch: u64,
    },
    RoutesInvalidated {
        count: usize,
    },
    RouteAdded {
        selector: Selector,
        facet: Address,
        pinned: Option<CodeIdentity>,
    },
    RouteRemoved {
        selector: Selector,
    },
    PausedSet {
        paused: bool,
    },
    DevRegistrarSet {
        enabled: bool,
    },
    AuditRegistrySet {
        registry: Option<Address>,
    },
    ActivationDelaySet {
        seconds: u64,
    },
    Frozen,
    CheckBypassed {
        seq: u64,
        record_hash: Hash32,
    },
}

/// Read-only collaborators visible to a transition.
pub struct Env<'a> {
    pub now: u64,
    pub code: &'a dyn CodeSource,
    pub audit: Option<&'a dyn AuditRegistry>,
}

/// Successful transition output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub state: GovernanceState,
    pub events: Vec<Event>,
}

// =============================================================================
// Transition function
// =============================================================================

fn record_bypass(state: &mut GovernanceState, events: &mut Vec<Event>, at: u64, kind: BypassKind) {
    warn!(?kind, "Maintenance bypass");
    let record: &BypassRecord = state.bypass_log.append(at, kind);
    events.push(Event::CheckBypassed {
        seq: record.seq,
        record_hash: record.record_hash,
    });
}

/// Compute the state after `command`. Fails without side effects on any guard violation.
///
/// Preconditions:
/// - `env.audit` is the registry bound to `state.audit_registry` (or `None` when unset).
///
/// Postconditions:
/// - On `Ok`, the returned state satisfies every governance invariant.
/// - On `Err`, nothing observable changed (the caller's state is untouched).
pub fn transition(state: &GovernanceState, command: &Command, env: &Env<'_>) -> Result<Transition> {
    if state.frozen {
        return Err(ManifoldError::FrozenContract);
    }

    let mut next = state.clone();
    let mut events = Vec::new();

    match command {
        Command::CommitRoot {
            root,
            epoch,
            leaf_count,
        } => {
            if root.is_zero() {
                return Err(ManifoldError::ZeroRoot);
            }
            let expected = state
                .active_epoch()
                .checked_add(1)
                .ok_or(ManifoldError::EpochOutOfOrder {
                    expected: u64::MAX,
                    got: *epoch,
                })?;
            if *epoch != expected {
                return Err(ManifoldError::EpochOutOfOrder {
                    expected,
                    got: *epoch,
                });
            }
            next.pending = Some(PendingRoot {
                root: *root,
                epoch: *epoch,
                leaf_count: *leaf_count,
                committed_at: env.now,
            });
            events.push(Event::RootCommitted {
                root: *root,
                epoch: *epoch,
                committed_at: env.now,
            });
        }

        Command::ActivateCommittedRoot => {
            let pending = state.pending.clone().ok_or(ManifoldError::NoPendingRoot)?;
            let ready_at = pending.committed_at.saturating_add(state.activation_delay);
            if env.now < ready_at {
                return Err(ManifoldError::ActivationNotReady {
                    ready_at,
                    now: env.now,
                });
            }

            let bypass = state.dev_registrar_enabled;
            let root = pending.root;
            let denied = match env.audit {
                // Unset registry blocks activation outside maintenance mode.
                None => Some((
                    "no audit registry configured".to_string(),
                    BypassKind::MissingAuditRegistry { root },
                )),
                Some(registry) => match registry.audit_status(&root) {
                    Ok(status) if status.approved => None,
                    Ok(_) => Some((
                        "registry has not approved root".to_string(),
                        BypassKind::AuditNotApproved { root },
                    )),
                    Err(e) => Some((
                        e.to_string(),
                        BypassKind::AuditRegistryError {
                            root,
                            error: e.to_string(),
                        },
                    )),
                },
            };
            if let Some((reason, kind)) = denied {
                if !bypass {
                    return Err(ManifoldError::AuditNotApproved { root, reason });
                }
                record_bypass(&mut next, &mut events, env.now, kind);
            }

            let invalidated = next.routes.len();
            next.routes.clear();
            next.active = Some(ManifestRoot {
                root,
                epoch: pending.epoch,
                leaf_count: pending.leaf_count,
                created_at: env.now,
            });
            next.pending = None;
            events.push(Event::RootActivated {
                root,
                epoch: pending.epoch,
            });
            events.push(Event::RoutesInvalidated { count: invalidated });
        }

        Command::ApplyRoutes(batch) => {
            if state.paused {
                return Err(ManifoldError::Paused);
            }
            batch.check_lengths()?;
            let active = state.active.as_ref().ok_or(ManifoldError::NoActiveRoot)?;

            for i in 0..batch.len() {
                let leaf = RouteLeaf::new(batch.selectors[i], batch.facets[i], batch.code_identities[i]);
                let siblings = &batch.proofs[i];
                let positions = batch.positions[i];

                match active.leaf_count {
                    Some(n) => check_proof_shape(leaf.selector, siblings.len(), positions, n as usize)?,
                    None if siblings.len() > MAX_PROOF_DEPTH => {
                        return Err(ManifoldError::MalformedProof {
                            selector: leaf.selector,
                            reason: format!("{} siblings exceeds maximum depth", siblings.len()),
                        });
                    }
                    None => {}
                }
                if fold_path(leaf.leaf_hash(), siblings, positions) != active.root {
                    return Err(ManifoldError::ProofVerificationFailed {
                        selector: leaf.selector,
                    });
                }

                let pinned = (!leaf.code_identity.is_zero()).then_some(leaf.code_identity);
                if let Some(expected) = pinned {
                    let deployed = match observed_identity(env.code, &leaf.facet) {
                        Ok(id) => id,
                        Err(ManifoldError::NoCodeAtAddress { .. }) => Hash32::ZERO,
                        Err(e) => return Err(e),
                    };
                    if deployed != expected {
                        return Err(ManifoldError::CodehashMismatch {
                            selector: leaf.selector,
                            facet: leaf.facet,
                            pinned: expected,
                            deployed,
                        });
                    }
                }

                next.routes.insert(
                    leaf.selector,
                    Route {
                        facet: leaf.facet,
                        pinned,
                    },
                );
                events.push(Event::RouteAdded {
                    selector: leaf.selector,
                    facet: leaf.facet,
                    pinned,
                });
            }
        }

        Command::RemoveRoutes { selectors } => {
            if state.paused {
                return Err(ManifoldError::Paused);
            }
            for selector in selectors {
                if next.routes.remove(selector).is_none() {
                    return Err(ManifoldError::UnknownSelector {
                        selector: *selector,
                    });
                }
                events.push(Event::RouteRemoved {
                    selector: *selector,
                });
            }
        }

        Command::SetPaused(paused) => {
            next.paused = *paused;
            events.push(Event::PausedSet { paused: *paused });
        }

        Command::AdminRegisterUnsafe { facets, selectors } => {
            if state.paused {
                return Err(ManifoldError::Paused);
            }
            if !state.dev_registrar_enabled {
                return Err(ManifoldError::DevRegistrarDisabled);
            }
            if facets.len() != selectors.len() {
                return Err(ManifoldError::LengthMismatch(format!(
                    "{} facets but {} selector groups",
                    facets.len(),
                    selectors.len()
                )));
            }
            for (facet, group) in facets.iter().zip(selectors) {
                for selector in group {
                    next.routes.insert(
                        *selector,
                        Route {
                            facet: *facet,
                            pinned: None,
                        },
                    );
                    events.push(Event::RouteAdded {
                        selector: *selector,
                        facet: *facet,
                        pinned: None,
                    });
                }
                record_bypass(
                    &mut next,
                    &mut events,
                    env.now,
                    BypassKind::UnsafeRegistration {
                        facet: *facet,
                        selectors: group.clone(),
                    },
                );
            }
        }

        Command::SetDevRegistrarEnabled(enabled) => {
            next.dev_registrar_enabled = *enabled;
            events.push(Event::DevRegistrarSet { enabled: *enabled });
        }

        Command::SetAuditRegistry { registry } => {
            next.audit_registry = registry.filter(|a| *a != Address::ZERO);
            events.push(Event::AuditRegistrySet {
                registry: next.audit_registry,
            });
        }

        Command::SetActivationDelay { seconds } => {
            if *seconds > state.max_activation_delay {
                return Err(ManifoldError::ActivationDelayOutOfRange {
                    requested: *seconds,
                    max: state.max_activation_delay,
                });
            }
            next.activation_delay = *seconds;
            events.push(Event::ActivationDelaySet { seconds: *seconds });
        }

        Command::Freeze => {
            next.frozen = true;
            events.push(Event::Frozen);
        }
    }

    Ok(Transition {
        state: next,
        events,
    })
}

// =============================================================================
// State machine
// =============================================================================

/// Single-writer owner of `GovernanceState`.
pub struct ManifestStateMachine {
    state: GovernanceState,
    events: Vec<Event>,
    audit: Option<Arc<dyn AuditRegistry>>,
    code: Arc<dyn CodeSource>,
    clock: Arc<dyn LedgerClock>,
}

impl ManifestStateMachine {
    pub fn new(
        config: &GovernanceConfig,
        code: Arc<dyn CodeSource>,
        clock: Arc<dyn LedgerClock>,
    ) -> Self {
        Self::with_state(GovernanceState::new(config), code, clock)
    }

    /// Resume from a persisted state. The audit registry implementation must be re-bound with
    /// `set_audit_registry`.
    pub fn with_state(
        state: GovernanceState,
        code: Arc<dyn CodeSource>,
        clock: Arc<dyn LedgerClock>,
    ) -> Self {
        Self {
            state,
            events: Vec::new(),
            audit: None,
            code,
            clock,
        }
    }

    fn execute(&mut self, command: Command) -> Result<Vec<Event>> {
        let audit = match self.state.audit_registry {
            Some(_) => self.audit.as_deref(),
            None => None,
        };
        let env = Env {
            now: self.clock.now(),
            code: self.code.as_ref(),
            audit,
        };

        let result = transition(&self.state, &command, &env);
        match result {
            Ok(Transition { state, events }) => {
                self.state = state;
                for event in &events {
                    info!(?event, "Governance event");
                }
                self.events.extend(events.iter().cloned());
                Ok(events)
            }
            Err(e) => {
                warn!(error = %e, "Governance call rejected");
                Err(e)
            }
        }
    }

    pub fn commit_root(&mut self, root: Hash32, epoch: u64) -> Result<Vec<Event>> {
        self.execute(Command::CommitRoot {
            root,
            epoch,
            leaf_count: None,
        })
    }

    /// Commit a root together with its leaf count so route proofs are shape-checked.
    pub fn commit_manifest(&mut self, root: Hash32, epoch: u64, leaf_count: u32) -> Result<Vec<Event>> {
        self.execute(Command::CommitRoot {
            root,
            epoch,
            leaf_count: Some(leaf_count),
        })
    }

    pub fn activate_committed_root(&mut self) -> Result<Vec<Event>> {
        self.execute(Command::ActivateCommittedRoot)
    }

    pub fn apply_routes(
        &mut self,
        selectors: &[Selector],
        facets: &[Address],
        code_identities: &[CodeIdentity],
        proofs: &[Vec<Hash32>],
        positions: &[u64],
    ) -> Result<Vec<Event>> {
        self.execute(Command::ApplyRoutes(RouteBatch {
            selectors: selectors.to_vec(),
            facets: facets.to_vec(),
            code_identities: code_identities.to_vec(),
            proofs: proofs.to_vec(),
            positions: positions.to_vec(),
        }))
    }

    pub fn apply_batch(&mut self, batch: RouteBatch) -> Result<Vec<Event>> {
        self.execute(Command::ApplyRoutes(batch))
    }

    pub fn remove_routes(&mut self, selectors: &[Selector]) -> Result<Vec<Event>> {
        self.execute(Command::RemoveRoutes {
            selectors: selectors.to_vec(),
        })
    }

    pub fn set_paused(&mut self, paused: bool) -> Result<Vec<Event>> {
        self.execute(Command::SetPaused(paused))
    }

    pub fn admin_register_unsafe(
        &mut self,
        facets: &[Address],
        selectors: &[Vec<Selector>],
    ) -> Result<Vec<Event>> {
        self.execute(Command::AdminRegisterUnsafe {
            facets: facets.to_vec(),
            selectors: selectors.to_vec(),
        })
    }

    pub fn set_dev_registrar_enabled(&mut self, enabled: bool) -> Result<Vec<Event>> {
        self.execute(Command::SetDevRegistrarEnabled(enabled))
    }

    /// Bind `registry` under identifier `address`. The binding only changes on success.
    pub fn set_audit_registry(
        &mut self,
        address: Address,
        registry: Arc<dyn AuditRegistry>,
    ) -> Result<Vec<Event>> {
        let events = self.execute(Command::SetAuditRegistry {
            registry: Some(address),
        })?;
        self.audit = self.state.audit_registry.map(|_| registry);
        Ok(events)
    }

    pub fn clear_audit_registry(&mut self) -> Result<Vec<Event>> {
        let events = self.execute(Command::SetAuditRegistry { registry: None })?;
        self.audit = None;
        Ok(events)
    }

    pub fn set_activation_delay(&mut self, seconds: u64) -> Result<Vec<Event>> {
        self.execute(Command::SetActivationDelay { seconds })
    }

    pub fn freeze(&mut self) -> Result<Vec<Event>> {
        self.execute(Command::Freeze)
    }

    // Read-only queries

    pub fn get_route(&self, selector: &Selector) -> Option<Address> {
        self.state.routes.get(selector).map(|r| r.facet)
    }

    pub fn route(&self, selector: &Selector) -> Option<&Route> {
        self.state.routes.get(selector)
    }

    pub fn active_root(&self) -> Option<Hash32> {
        self.state.active.as_ref().map(|a| a.root)
    }

    pub fn active_epoch(&self) -> u64 {
        self.state.active_epoch()
    }

    pub fn pending_root(&self) -> Option<Hash32> {
        self.state.pending.as_ref().map(|p| p.root)
    }

    pub fn pending_since(&self) -> Option<u64> {
        self.state.pending.as_ref().map(|p| p.committed_at)
    }

    pub fn frozen(&self) -> bool {
        self.state.frozen
    }

    pub fn paused(&self) -> bool {
        self.state.paused
    }

    pub fn activation_delay(&self) -> u64 {
        self.state.activation_delay
    }

    pub fn state(&self) -> &GovernanceState {
        &self.state
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn bypass_log(&self) -> &BypassLog {
        &self.state.bypass_log
    }
}

// =============================================================================
// In-process collaborators
// =============================================================================

/// Manually advanced ledger clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl LedgerClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Audit registry backed by a map; can be told to fail every query.
#[derive(Default)]
pub struct InMemoryAuditRegistry {
    approved: RwLock<HashMap<Hash32, bool>>,
    failing: AtomicBool,
}

impl InMemoryAuditRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, root: Hash32, approved: bool) {
        if let Ok(mut map) = self.approved.write() {
            map.insert(root, approved);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AuditRegistry for InMemoryAuditRegistry {
    fn audit_status(&self, root: &Hash32) -> Result<crate::AuditStatus> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ManifoldError::AuditRegistry("registry unavailable".into()));
        }
        let map = self
            .approved
            .read()
            .map_err(|_| ManifoldError::AuditRegistry("lock poisoned".into()))?;
        Ok(crate::AuditStatus {
            approved: map.get(root).copied().unwrap_or(false),
            report: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codehash::{predicted_identity, InMemoryCodeSource};
    use crate::merkle::OrderedMerkleTree;

    const DELAY: u64 = 100;

    struct Fixture {
        sm: ManifestStateMachine,
        clock: Arc<ManualClock>,
        audit: Arc<InMemoryAuditRegistry>,
        code: Arc<InMemoryCodeSource>,
    }

    fn fixture() -> Fixture {
        let config = GovernanceConfig {
            activation_delay_secs: DELAY,
            max_activation_delay_secs: 1_000,
        };
        let clock = Arc::new(ManualClock::new(1_000));
        let code = Arc::new(InMemoryCodeSource::new());
        let audit = Arc::new(InMemoryAuditRegistry::new());
        let mut sm = ManifestStateMachine::new(&config, code.clone(), clock.clone());
        sm.set_audit_registry(Address([0xa0; 20]), audit.clone()).unwrap();
        Fixture {
            sm,
            clock,
            audit,
            code,
        }
    }

    fn root(b: u8) -> Hash32 {
        Hash32([b; 32])
    }

    fn activate(f: &mut Fixture, r: Hash32, epoch: u64) {
        f.sm.commit_root(r, epoch).unwrap();
        f.audit.set_status(r, true);
        f.clock.advance(DELAY);
        f.sm.activate_committed_root().unwrap();
    }

    #[test]
    fn commit_requires_next_epoch() {
        let mut f = fixture();
        assert!(f.sm.commit_root(root(1), 1).is_ok());
        // Idempotent re-affirmation.
        assert!(f.sm.commit_root(root(1), 1).is_ok());
        assert!(matches!(
            f.sm.commit_root(root(1), 3),
            Err(ManifoldError::EpochOutOfOrder { expected: 1, got: 3 })
        ));
        assert_eq!(f.sm.pending_root(), Some(root(1)));
    }

    #[test]
    fn zero_root_rejected() {
        let mut f = fixture();
        assert!(matches!(
            f.sm.commit_root(Hash32::ZERO, 1),
            Err(ManifoldError::ZeroRoot)
        ));
    }

    #[test]
    fn recommit_resets_delay_clock() {
        let mut f = fixture();
        f.sm.commit_root(root(1), 1).unwrap();
        f.audit.set_status(root(2), true);
        f.clock.advance(DELAY - 1);
        f.sm.commit_root(root(2), 1).unwrap();
        f.clock.advance(1);

        assert!(matches!(
            f.sm.activate_committed_root(),
            Err(ManifoldError::ActivationNotReady { .. })
        ));
        f.clock.advance(DELAY);
        f.sm.activate_committed_root().unwrap();
        assert_eq!(f.sm.active_root(), Some(root(2)));
    }

    #[test]
    fn activation_gates_in_order() {
        let mut f = fixture();
        assert!(matches!(
            f.sm.activate_committed_root(),
            Err(ManifoldError::NoPendingRoot)
        ));

        f.sm.commit_root(root(1), 1).unwrap();
        assert!(matches!(
            f.sm.activate_committed_root(),
            Err(ManifoldError::ActivationNotReady { .. })
        ));

        f.clock.advance(DELAY);
        assert!(matches!(
            f.sm.activate_committed_root(),
            Err(ManifoldError::AuditNotApproved { .. })
        ));
        assert_eq!(f.sm.active_root(), None);

        f.audit.set_status(root(1), true);
        let events = f.sm.activate_committed_root().unwrap();
        assert!(events.contains(&Event::RootActivated {
            root: root(1),
            epoch: 1
        }));
        assert_eq!(f.sm.active_root(), Some(root(1)));
        assert_eq!(f.sm.active_epoch(), 1);
        assert_eq!(f.sm.pending_root(), None);
    }

    #[test]
    fn missing_registry_fails_closed() {
        let config = GovernanceConfig {
            activation_delay_secs: 0,
            max_activation_delay_secs: 10,
        };
        let clock = Arc::new(ManualClock::new(5));
        let mut sm = ManifestStateMachine::new(&config, Arc::new(InMemoryCodeSource::new()), clock);
        sm.commit_root(root(1), 1).unwrap();
        assert!(matches!(
            sm.activate_committed_root(),
            Err(ManifoldError::AuditNotApproved { .. })
        ));

        sm.set_dev_registrar_enabled(true).unwrap();
        sm.activate_committed_root().unwrap();
        assert_eq!(sm.bypass_log().len(), 1);
        assert!(matches!(
            sm.bypass_log().records()[0].kind,
            BypassKind::MissingAuditRegistry { .. }
        ));
    }

    #[test]
    fn failing_registry_tolerated_only_in_maintenance() {
        let mut f = fixture();
        f.audit.set_failing(true);
        f.sm.commit_root(root(1), 1).unwrap();
        f.clock.advance(DELAY);

        assert!(matches!(
            f.sm.activate_committed_root(),
            Err(ManifoldError::AuditNotApproved { .. })
        ));

        f.sm.set_dev_registrar_enabled(true).unwrap();
        f.sm.activate_committed_root().unwrap();
        assert!(matches!(
            f.sm.bypass_log().records()[0].kind,
            BypassKind::AuditRegistryError { .. }
        ));
        assert!(f.sm.bypass_log().verify_chain().is_ok());
    }

    #[test]
    fn freeze_is_terminal() {
        let mut f = fixture();
        f.sm.commit_root(root(1), 1).unwrap();
        f.sm.freeze().unwrap();

        assert!(f.sm.frozen());
        assert!(matches!(f.sm.commit_root(root(2), 1), Err(ManifoldError::FrozenContract)));
        f.audit.set_status(root(1), true);
        f.clock.advance(DELAY);
        assert!(matches!(f.sm.activate_committed_root(), Err(ManifoldError::FrozenContract)));
        assert!(matches!(f.sm.set_activation_delay(1), Err(ManifoldError::FrozenContract)));
        assert!(matches!(f.sm.set_dev_registrar_enabled(true), Err(ManifoldError::FrozenContract)));
        assert!(matches!(f.sm.freeze(), Err(ManifoldError::FrozenContract)));
    }

    #[test]
    fn activation_delay_is_bounded() {
        let mut f = fixture();
        assert!(matches!(
            f.sm.set_activation_delay(1_001),
            Err(ManifoldError::ActivationDelayOutOfRange { .. })
        ));
        f.sm.set_activation_delay(0).unwrap();
        assert_eq!(f.sm.activation_delay(), 0);
    }

    #[test]
    fn unsafe_registration_requires_maintenance() {
        let mut f = fixture();
        let sel = Selector([1, 2, 3, 4]);
        let facet = Address([0xf1; 20]);
        assert!(matches!(
            f.sm.admin_register_unsafe(&[facet], &[vec![sel]]),
            Err(ManifoldError::DevRegistrarDisabled)
        ));

        f.sm.set_dev_registrar_enabled(true).unwrap();
        f.sm.admin_register_unsafe(&[facet], &[vec![sel]]).unwrap();
        assert_eq!(f.sm.get_route(&sel), Some(facet));
        assert_eq!(f.sm.bypass_log().len(), 1);
    }

    fn two_leaf_tree(f: &Fixture) -> (OrderedMerkleTree, Vec<RouteLeaf>) {
        let f1 = Address([0xf1; 20]);
        let f2 = Address([0xf2; 20]);
        f.code.set_code(f1, vec![0x60, 0x01]);
        f.code.set_code(f2, vec![0x60, 0x02]);
        let leaves = vec![
            RouteLeaf::new("0xaaaaaaaa".parse().unwrap(), f1, predicted_identity(&[0x60, 0x01])),
            RouteLeaf::new("0xbbbbbbbb".parse().unwrap(), f2, predicted_identity(&[0x60, 0x02])),
        ];
        (OrderedMerkleTree::build(leaves.clone()).unwrap(), leaves)
    }

    fn batch_for(tree: &OrderedMerkleTree, leaves: &[RouteLeaf]) -> RouteBatch {
        let mut batch = RouteBatch::default();
        for leaf in leaves {
            let proof = tree.prove_of(&leaf.selector).unwrap();
            batch.selectors.push(leaf.selector);
            batch.facets.push(leaf.facet);
            batch.code_identities.push(leaf.code_identity);
            batch.proofs.push(proof.siblings);
            batch.positions.push(proof.positions);
        }
        batch
    }

    #[test]
    fn apply_routes_under_active_root() {
        let mut f = fixture();
        let (tree, leaves) = two_leaf_tree(&f);
        let batch = batch_for(&tree, &leaves);

        assert!(matches!(
            f.sm.apply_batch(batch.clone()),
            Err(ManifoldError::NoActiveRoot)
        ));

        f.sm.commit_manifest(tree.root(), 1, 2).unwrap();
        f.audit.set_status(tree.root(), true);
        f.clock.advance(DELAY);
        f.sm.activate_committed_root().unwrap();

        f.sm.apply_batch(batch).unwrap();
        assert_eq!(f.sm.get_route(&leaves[0].selector), Some(leaves[0].facet));
        assert_eq!(
            f.sm.route(&leaves[1].selector).unwrap().pinned,
            Some(leaves[1].code_identity)
        );
    }

    #[test]
    fn codehash_mismatch_writes_nothing() {
        let mut f = fixture();
        let (tree, leaves) = two_leaf_tree(&f);
        activate(&mut f, tree.root(), 1);

        // Facet 2 is redeployed with different code.
        f.code.set_code(leaves[1].facet, vec![0xfe]);
        let err = f.sm.apply_batch(batch_for(&tree, &leaves)).unwrap_err();
        assert!(matches!(err, ManifoldError::CodehashMismatch { .. }));
        assert_eq!(f.sm.get_route(&leaves[0].selector), None);
        assert_eq!(f.sm.get_route(&leaves[1].selector), None);
    }

    #[test]
    fn bad_proof_and_lengths_rejected() {
        let mut f = fixture();
        let (tree, leaves) = two_leaf_tree(&f);
        f.sm.commit_manifest(tree.root(), 1, 2).unwrap();
        f.audit.set_status(tree.root(), true);
        f.clock.advance(DELAY);
        f.sm.activate_committed_root().unwrap();

        let mut wrong_facet = batch_for(&tree, &leaves[..1]);
        wrong_facet.facets[0] = Address([0xee; 20]);
        assert!(matches!(
            f.sm.apply_batch(wrong_facet),
            Err(ManifoldError::ProofVerificationFailed { .. })
        ));

        let mut short = batch_for(&tree, &leaves[..1]);
        short.proofs[0].clear();
        assert!(matches!(
            f.sm.apply_batch(short),
            Err(ManifoldError::MalformedProof { .. })
        ));

        let mut ragged = batch_for(&tree, &leaves);
        ragged.positions.pop();
        assert!(matches!(
            f.sm.apply_batch(ragged),
            Err(ManifoldError::LengthMismatch(_))
        ));
    }

    #[test]
    fn pause_blocks_route_changes() {
        let mut f = fixture();
        let (tree, leaves) = two_leaf_tree(&f);
        activate(&mut f, tree.root(), 1);
        f.sm.apply_batch(batch_for(&tree, &leaves)).unwrap();

        f.sm.set_paused(true).unwrap();
        assert!(matches!(
            f.sm.remove_routes(&[leaves[0].selector]),
            Err(ManifoldError::Paused)
        ));
        f.sm.set_paused(false).unwrap();
        f.sm.remove_routes(&[leaves[0].selector]).unwrap();
        assert_eq!(f.sm.get_route(&leaves[0].selector), None);
        assert!(matches!(
            f.sm.remove_routes(&[leaves[0].selector]),
            Err(ManifoldError::UnknownSelector { .. })
        ));
    }

    #[test]
    fn activation_invalidates_routes() {
        let mut f = fixture();
        let (tree, leaves) = two_leaf_tree(&f);
        activate(&mut f, tree.root(), 1);
        f.sm.apply_batch(batch_for(&tree, &leaves)).unwrap();

        f.sm.commit_root(root(9), 2).unwrap();
        f.audit.set_status(root(9), true);
        f.clock.advance(DELAY);
        let events = f.sm.activate_committed_root().unwrap();

        assert!(events.contains(&Event::RoutesInvalidated { count: 2 }));
        assert_eq!(f.sm.get_route(&leaves[0].selector), None);
        assert_eq!(f.sm.active_epoch(), 2);
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let f = fixture();
        let before = f.sm.state().clone();
        let env = Env {
            now: 0,
            code: f.code.as_ref(),
            audit: None,
        };
        assert!(transition(&before, &Command::CommitRoot { root: root(1), epoch: 7, leaf_count: None }, &env).is_err());
        assert_eq!(f.sm.state(), &before);
    }
}
