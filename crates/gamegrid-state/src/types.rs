//! Domain types for the GameGrid registry.
//!
//! VM and session records as persisted in the redb tables, plus the
//! outcome enums returned by conditional registry mutations. All
//! timestamps are Unix epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Provider-assigned instance identifier. Immutable, never reused.
pub type VmId = String;

/// Unique identifier for a session.
pub type SessionId = String;

/// Opaque reference to the owning user (authentication is external).
pub type UserId = String;

/// Opaque reference to a catalog entry.
pub type GameId = String;

// ── VM ────────────────────────────────────────────────────────────

/// Lifecycle state of a VM.
///
/// ```text
/// Provisioning ──> Running ──> Stopped ──> Terminated
///      │                                       ▲
///      └───────────── (failed) ────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Provisioning,
    Running,
    Stopped,
    Terminated,
}

impl VmState {
    /// Whether `self -> next` is a forward edge of the lifecycle.
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Terminated)
                | (Running, Stopped)
                | (Stopped, Terminated)
        )
    }

    /// States in which sessions may be bound to the VM.
    pub fn accepts_sessions(self) -> bool {
        matches!(self, VmState::Provisioning | VmState::Running)
    }
}

/// A VM known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub id: VmId,
    pub state: VmState,
    /// Maximum concurrent sessions; also the capacity class the VM serves.
    pub capacity: u32,
    /// Current concurrent sessions, `0..=capacity`.
    pub load: u32,
    /// Most recent session start/end/heartbeat touching this VM.
    pub last_activity: u64,
    /// Network address, once the provider reports one.
    pub address: Option<String>,
    /// Set while the reclaimer is stopping this VM. Draining VMs accept no new load.
    #[serde(default)]
    pub draining: bool,
    pub created_at: u64,
    /// When `state` last changed.
    pub state_changed_at: u64,
}

impl VmRecord {
    /// A fresh record for a VM the provider is still booting.
    pub fn provisioning(id: impl Into<VmId>, capacity: u32, now: u64) -> Self {
        Self {
            id: id.into(),
            state: VmState::Provisioning,
            capacity,
            load: 0,
            last_activity: now,
            address: None,
            draining: false,
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Whether a new session of `capacity_class` may be placed here.
    pub fn is_eligible(&self, capacity_class: u32) -> bool {
        self.state == VmState::Running
            && !self.draining
            && self.capacity == capacity_class
            && self.load < self.capacity
    }

    /// Monotonic activity update: earlier timestamps are ignored.
    pub fn touch(&mut self, at: u64) -> bool {
        if at > self.last_activity {
            self.last_activity = at;
            true
        } else {
            false
        }
    }
}

// ── Session ───────────────────────────────────────────────────────

/// One user's occupancy of a VM for one game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_id: UserId,
    pub vm_id: VmId,
    pub game_id: GameId,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    /// Connect URL handed to the client; meaningful only while active.
    pub connect_endpoint: String,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ── Outcomes ──────────────────────────────────────────────────────

/// Result of a conditional load increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A slot was claimed; the record reflects the new load.
    Claimed(VmRecord),
    /// The VM has no spare capacity or no longer accepts sessions.
    Full,
    NotFound,
}

/// Result of asking the registry whether a VM may be stopped now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopGate {
    /// The VM is marked draining; the caller may stop it at the provider.
    Draining(VmRecord),
    /// Sessions were attached between listing and the re-check.
    Busy { load: u32 },
    /// Activity arrived after the idle threshold.
    Recent { last_activity: u64 },
    /// The VM is not `Running`.
    NotRunning(VmState),
    NotFound,
}

/// Result of ending a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The session was ended and the VM load released.
    Closed { session: SessionRecord, vm: VmRecord },
    /// The session had already ended; nothing changed.
    AlreadyEnded(SessionRecord),
    /// The session belongs to another user.
    Forbidden,
    NotFound,
}
