//! Registry: redb-backed VM and session records.
//!
//! Every mutating method runs as one write transaction: read the record,
//! check the precondition, write the result, commit. A failed check
//! returns before commit and the transaction is discarded.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe VM registry backed by redb.
#[derive(Clone)]
pub struct Registry {
    db: Arc<Database>,
}

impl Registry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!(?path, "registry opened");
        Ok(registry)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!("in-memory registry opened");
        Ok(registry)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.transact(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(VMS).map_err(map_err!(Table))?;
            txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn transact<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Read-modify-write a single VM record.
    fn with_vm<R>(
        &self,
        vm_id: &str,
        f: impl FnOnce(&mut VmRecord) -> StateResult<(R, bool)>,
    ) -> StateResult<Option<R>> {
        self.transact(|txn| {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let Some(mut vm) = get_record::<VmRecord, _>(&vms, vm_id)? else {
                return Ok(None);
            };
            let (result, dirty) = f(&mut vm)?;
            if dirty {
                put_record(&mut vms, vm_id, &vm)?;
            }
            Ok(Some(result))
        })
    }

    // ── VM reads ───────────────────────────────────────────────────

    /// Get a VM by instance id.
    pub fn get(&self, vm_id: &str) -> StateResult<Option<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        get_record(&table, vm_id)
    }

    /// List every VM ever recorded, terminated ones included.
    pub fn list_vms(&self) -> StateResult<Vec<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        scan(&table)
    }

    /// Find the best `Running` VM with a free slot for `capacity_class`.
    ///
    /// Prefers the most loaded candidate so existing VMs fill up before
    /// new ones are used. Ties go to the smallest instance id.
    pub fn find_eligible(&self, capacity_class: u32) -> StateResult<Option<VmRecord>> {
        let best = self
            .list_vms()?
            .into_iter()
            .filter(|vm| vm.is_eligible(capacity_class))
            .max_by(|a, b| a.load.cmp(&b.load).then_with(|| b.id.cmp(&a.id)));
        Ok(best)
    }

    /// `Running`, empty VMs whose last activity is older than `threshold`.
    pub fn list_idle_candidates(&self, threshold: u64) -> StateResult<Vec<VmRecord>> {
        Ok(self
            .list_vms()?
            .into_iter()
            .filter(|vm| vm.state == VmState::Running && vm.load == 0 && vm.last_activity < threshold)
            .collect())
    }

    /// `Stopped` VMs that entered that state before `threshold`.
    pub fn list_stopped_before(&self, threshold: u64) -> StateResult<Vec<VmRecord>> {
        Ok(self
            .list_vms()?
            .into_iter()
            .filter(|vm| vm.state == VmState::Stopped && vm.state_changed_at < threshold)
            .collect())
    }

    /// VMs still `Provisioning` that were created before `threshold`.
    pub fn list_provisioning_before(&self, threshold: u64) -> StateResult<Vec<VmRecord>> {
        Ok(self
            .list_vms()?
            .into_iter()
            .filter(|vm| vm.state == VmState::Provisioning && vm.created_at < threshold)
            .collect())
    }

    // ── VM mutations ───────────────────────────────────────────────

    /// Record a VM the provider has just started booting.
    ///
    /// Instance ids are never reused, so an existing id (in any state,
    /// `Terminated` included) is rejected.
    pub fn create(&self, vm_id: &str, capacity: u32) -> StateResult<VmRecord> {
        if capacity == 0 {
            return Err(StateError::Invalid(format!("vm {vm_id}: capacity must be positive")));
        }
        let vm = VmRecord::provisioning(vm_id, capacity, epoch_millis());
        self.transact(|txn| {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            if get_record::<VmRecord, _>(&vms, vm_id)?.is_some() {
                return Err(StateError::AlreadyExists(vm_id.to_string()));
            }
            put_record(&mut vms, vm_id, &vm)
        })?;
        info!(%vm_id, capacity, "vm recorded as provisioning");
        Ok(vm)
    }

    /// Claim one session slot if the VM is `Running`, not draining, and below capacity.
    pub fn increment_load(&self, vm_id: &str) -> StateResult<LoadOutcome> {
        let now = epoch_millis();
        let outcome = self.with_vm(vm_id, |vm| {
            if vm.state != VmState::Running || vm.draining || vm.load >= vm.capacity {
                return Ok((LoadOutcome::Full, false));
            }
            vm.load += 1;
            vm.touch(now);
            Ok((LoadOutcome::Claimed(vm.clone()), true))
        })?;
        let outcome = outcome.unwrap_or(LoadOutcome::NotFound);
        if let LoadOutcome::Claimed(vm) = &outcome {
            debug!(%vm_id, load = vm.load, capacity = vm.capacity, "slot claimed");
        }
        Ok(outcome)
    }

    /// Release one session slot.
    ///
    /// Releasing from an empty VM means the bookkeeping is already broken;
    /// it fails with [`StateError::NegativeLoad`] and nothing is written.
    pub fn decrement_load(&self, vm_id: &str) -> StateResult<VmRecord> {
        let now = epoch_millis();
        let vm = self
            .with_vm(vm_id, |vm| {
                release_slot(vm, now)?;
                Ok((vm.clone(), true))
            })?
            .ok_or_else(|| StateError::NotFound(vm_id.to_string()))?;
        debug!(%vm_id, load = vm.load, "slot released");
        Ok(vm)
    }

    /// Mark activity on a VM now. Returns whether `last_activity` advanced.
    pub fn touch_activity(&self, vm_id: &str) -> StateResult<bool> {
        self.touch_activity_at(vm_id, epoch_millis())
    }

    /// Mark activity at an explicit timestamp. Earlier timestamps are a no-op.
    pub fn touch_activity_at(&self, vm_id: &str, at: u64) -> StateResult<bool> {
        self.with_vm(vm_id, |vm| {
            let advanced = vm.touch(at);
            Ok((advanced, advanced))
        })?
        .ok_or_else(|| StateError::NotFound(vm_id.to_string()))
    }

    /// Move a VM forward through its lifecycle.
    ///
    /// Setting the current state again is a no-op. Leaving service
    /// (`Stopped`, `Terminated`) requires zero load. Any transition clears
    /// the draining mark.
    pub fn set_state(&self, vm_id: &str, to: VmState) -> StateResult<VmRecord> {
        let now = epoch_millis();
        let vm = self
            .with_vm(vm_id, |vm| {
                if vm.state == to {
                    return Ok((vm.clone(), false));
                }
                if !vm.state.can_transition_to(to) {
                    return Err(StateError::InvalidTransition {
                        vm_id: vm.id.clone(),
                        from: vm.state,
                        to,
                    });
                }
                if matches!(to, VmState::Stopped | VmState::Terminated) && vm.load > 0 {
                    return Err(StateError::LoadNotZero {
                        vm_id: vm.id.clone(),
                        load: vm.load,
                    });
                }
                vm.state = to;
                vm.draining = false;
                vm.state_changed_at = now;
                Ok((vm.clone(), true))
            })?
            .ok_or_else(|| StateError::NotFound(vm_id.to_string()))?;
        info!(%vm_id, state = ?vm.state, "vm state changed");
        Ok(vm)
    }

    /// `Provisioning -> Running`, recording the address and claiming the
    /// creator's slot in the same transaction.
    pub fn activate(&self, vm_id: &str, address: &str) -> StateResult<VmRecord> {
        let now = epoch_millis();
        let vm = self
            .with_vm(vm_id, |vm| {
                if vm.state != VmState::Provisioning {
                    return Err(StateError::InvalidTransition {
                        vm_id: vm.id.clone(),
                        from: vm.state,
                        to: VmState::Running,
                    });
                }
                vm.state = VmState::Running;
                vm.state_changed_at = now;
                vm.address = Some(address.to_string());
                vm.load = 1;
                vm.touch(now);
                Ok((vm.clone(), true))
            })?
            .ok_or_else(|| StateError::NotFound(vm_id.to_string()))?;
        info!(%vm_id, %address, capacity = vm.capacity, "vm running");
        Ok(vm)
    }

    /// Re-check that a VM is still idle and mark it draining.
    ///
    /// Draining VMs are skipped by [`find_eligible`](Self::find_eligible)
    /// and refused by [`increment_load`](Self::increment_load), which closes
    /// the window between this check and the provider stop call. An already
    /// draining VM passes again.
    pub fn begin_stop(&self, vm_id: &str, threshold: u64) -> StateResult<StopGate> {
        let gate = self.with_vm(vm_id, |vm| {
            if vm.state != VmState::Running {
                return Ok((StopGate::NotRunning(vm.state), false));
            }
            if vm.load > 0 {
                return Ok((StopGate::Busy { load: vm.load }, false));
            }
            if vm.last_activity >= threshold {
                return Ok((
                    StopGate::Recent {
                        last_activity: vm.last_activity,
                    },
                    false,
                ));
            }
            vm.draining = true;
            Ok((StopGate::Draining(vm.clone()), true))
        })?;
        Ok(gate.unwrap_or(StopGate::NotFound))
    }

    /// Clear the draining mark after a failed stop; the VM stays `Running`.
    pub fn abort_stop(&self, vm_id: &str) -> StateResult<()> {
        self.with_vm(vm_id, |vm| {
            let was = vm.draining;
            vm.draining = false;
            Ok(((), was))
        })?
        .ok_or_else(|| StateError::NotFound(vm_id.to_string()))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Record a new session bound to a VM that accepts sessions.
    pub fn open_session(&self, session: &SessionRecord) -> StateResult<()> {
        self.transact(|txn| {
            let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;

            let vm = get_record::<VmRecord, _>(&vms, &session.vm_id)?
                .ok_or_else(|| StateError::NotFound(session.vm_id.clone()))?;
            if !vm.state.accepts_sessions() {
                return Err(StateError::Invalid(format!(
                    "vm {} is {:?} and cannot host sessions",
                    vm.id, vm.state
                )));
            }
            if get_record::<SessionRecord, _>(&sessions, &session.id)?.is_some() {
                return Err(StateError::AlreadyExists(session.id.clone()));
            }
            put_record(&mut sessions, &session.id, session)
        })?;
        debug!(session_id = %session.id, vm_id = %session.vm_id, "session opened");
        Ok(())
    }

    /// End a session owned by `user_id` and release its slot atomically.
    pub fn close_session(&self, session_id: &str, user_id: &str) -> StateResult<CloseOutcome> {
        let now = epoch_millis();
        let outcome = self.transact(|txn| {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;

            let Some(mut session) = get_record::<SessionRecord, _>(&sessions, session_id)? else {
                return Ok(CloseOutcome::NotFound);
            };
            if session.user_id != user_id {
                return Ok(CloseOutcome::Forbidden);
            }
            if !session.is_active() {
                return Ok(CloseOutcome::AlreadyEnded(session));
            }

            let mut vm = get_record::<VmRecord, _>(&vms, &session.vm_id)?
                .ok_or_else(|| StateError::NotFound(session.vm_id.clone()))?;
            release_slot(&mut vm, now)?;
            session.ended_at = Some(now);

            put_record(&mut vms, &vm.id, &vm)?;
            put_record(&mut sessions, &session.id, &session)?;
            Ok(CloseOutcome::Closed { session, vm })
        })?;
        if let CloseOutcome::Closed { vm, .. } = &outcome {
            debug!(%session_id, vm_id = %vm.id, load = vm.load, "session closed");
        }
        Ok(outcome)
    }

    /// Get a session by id.
    pub fn get_session(&self, session_id: &str) -> StateResult<Option<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        get_record(&table, session_id)
    }

    /// List all sessions, ended ones included.
    pub fn list_sessions(&self) -> StateResult<Vec<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        scan(&table)
    }

    /// Active sessions bound to a VM.
    pub fn active_sessions_for_vm(&self, vm_id: &str) -> StateResult<Vec<SessionRecord>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.vm_id == vm_id && s.is_active())
            .collect())
    }
}

/// Decrement load and touch activity, refusing to go below zero.
fn release_slot(vm: &mut VmRecord, now: u64) -> StateResult<()> {
    if vm.load == 0 {
        error!(vm_id = %vm.id, "load decrement below zero refused");
        return Err(StateError::NegativeLoad(vm.id.clone()));
    }
    vm.load -= 1;
    vm.touch(now);
    Ok(())
}

fn get_record<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn scan<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn put_record<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
