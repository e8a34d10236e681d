//! Session binder: turns a start request into a session on a VM.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gamegrid_activity::ActivityTracker;
use gamegrid_core::{EndpointVars, StreamingSettings};
use gamegrid_state::{CloseOutcome, Registry, SessionRecord, VmRecord, VmState, epoch_millis};

use crate::allocator::Allocator;
use crate::catalog::GameCatalog;
use crate::error::{OrchestratorError, OrchestratorResult};

/// What a client needs to connect to a freshly started session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTicket {
    pub session_id: String,
    pub vm_id: String,
    pub vm_address: String,
    pub connect_endpoint: String,
    /// Whether a VM was provisioned for this session.
    pub provisioned: bool,
}

/// Read-only view of a session and the VM it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session: SessionRecord,
    pub vm_state: Option<VmState>,
    pub vm_address: Option<String>,
    /// Present only while the session is active.
    pub connect_endpoint: Option<String>,
}

pub struct SessionBinder {
    registry: Registry,
    allocator: Allocator,
    catalog: Arc<dyn GameCatalog>,
    streaming: StreamingSettings,
    tracker: ActivityTracker,
}

impl SessionBinder {
    pub fn new(
        registry: Registry,
        allocator: Allocator,
        catalog: Arc<dyn GameCatalog>,
        streaming: StreamingSettings,
        tracker: ActivityTracker,
    ) -> Self {
        Self {
            registry,
            allocator,
            catalog,
            streaming,
            tracker,
        }
    }

    /// Start a session of `game_id` for `user_id`, using the game's capacity class.
    pub async fn start_session(
        &self,
        user_id: &str,
        game_id: &str,
    ) -> OrchestratorResult<SessionTicket> {
        let capacity_class = self
            .catalog
            .capacity_class(game_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("game {game_id}")))?;
        self.start_session_with_class(user_id, game_id, capacity_class)
            .await
    }

    /// Start a session with an explicit capacity class, bypassing the catalog.
    pub async fn start_session_with_class(
        &self,
        user_id: &str,
        game_id: &str,
        capacity_class: u32,
    ) -> OrchestratorResult<SessionTicket> {
        if user_id.is_empty() {
            return Err(OrchestratorError::InvalidRequest("user id is empty".into()));
        }

        let allocation = self.allocator.allocate(capacity_class).await?;
        let vm = allocation.vm;

        let session = match self.bind(user_id, game_id, &vm) {
            Ok(session) => session,
            Err(e) => {
                // The slot was claimed but no session owns it.
                if let Err(release) = self.registry.decrement_load(&vm.id) {
                    error!(vm_id = %vm.id, error = %release, "could not release unbound slot");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.tracker.touch(&vm.id) {
            warn!(vm_id = %vm.id, error = %e, "activity touch failed");
        }
        self.tracker.watch(&session.id, &vm.id).await;

        info!(
            session_id = %session.id,
            %user_id,
            %game_id,
            vm_id = %vm.id,
            load = vm.load,
            provisioned = allocation.provisioned,
            "session started"
        );

        Ok(SessionTicket {
            vm_address: vm.address.clone().unwrap_or_default(),
            session_id: session.id,
            vm_id: vm.id,
            connect_endpoint: session.connect_endpoint,
            provisioned: allocation.provisioned,
        })
    }

    fn bind(&self, user_id: &str, game_id: &str, vm: &VmRecord) -> OrchestratorResult<SessionRecord> {
        let vm_address = vm.address.as_deref().ok_or_else(|| {
            OrchestratorError::InvariantViolation(format!("running vm {} has no address", vm.id))
        })?;
        let session_id = Uuid::new_v4().to_string();
        let connect_endpoint = self.streaming.connect_endpoint(EndpointVars {
            vm_address,
            vm_id: &vm.id,
            game_id,
            session_id: &session_id,
            user_id,
        });

        let session = SessionRecord {
            id: session_id,
            user_id: user_id.to_string(),
            vm_id: vm.id.clone(),
            game_id: game_id.to_string(),
            started_at: epoch_millis(),
            ended_at: None,
            connect_endpoint,
        };
        self.registry.open_session(&session)?;
        Ok(session)
    }

    /// End a session owned by `user_id`.
    ///
    /// Ending an already-ended session returns it unchanged.
    pub async fn end_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<SessionRecord> {
        match self.registry.close_session(session_id, user_id)? {
            CloseOutcome::Closed { session, vm } => {
                self.tracker.unwatch(session_id).await;
                info!(%session_id, vm_id = %vm.id, load = vm.load, "session ended");
                Ok(session)
            }
            CloseOutcome::AlreadyEnded(session) => {
                self.tracker.unwatch(session_id).await;
                debug!(%session_id, "session already ended");
                Ok(session)
            }
            CloseOutcome::Forbidden => {
                warn!(%session_id, %user_id, "end requested by non-owner");
                Err(OrchestratorError::Forbidden(session_id.to_string()))
            }
            CloseOutcome::NotFound => Err(OrchestratorError::NotFound(format!(
                "session {session_id}"
            ))),
        }
    }

    /// Status of a session owned by `user_id`.
    pub fn session_status(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<SessionStatus> {
        let session = self.owned_session(session_id, user_id)?;
        let vm = self.registry.get(&session.vm_id)?;

        Ok(SessionStatus {
            vm_state: vm.as_ref().map(|v| v.state),
            vm_address: vm.and_then(|v| v.address),
            connect_endpoint: session
                .is_active()
                .then(|| session.connect_endpoint.clone()),
            session,
        })
    }

    /// Client keep-alive: marks the session's VM as active now.
    pub fn heartbeat(&self, session_id: &str, user_id: &str) -> OrchestratorResult<()> {
        let session = self.owned_session(session_id, user_id)?;
        if !session.is_active() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "session {session_id} has ended"
            )));
        }
        self.tracker.touch(&session.vm_id)?;
        Ok(())
    }

    /// Stop background heartbeats (for graceful shutdown).
    pub async fn shutdown(&self) {
        self.tracker.stop_all().await;
    }

    fn owned_session(&self, session_id: &str, user_id: &str) -> OrchestratorResult<SessionRecord> {
        let session = self
            .registry
            .get_session(session_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
        if session.user_id != user_id {
            return Err(OrchestratorError::Forbidden(session_id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gamegrid_core::{GameEntry, PoolSettings};
    use gamegrid_provider::SimulatedProvider;

    use super::*;
    use crate::catalog::StaticCatalog;

    fn binder(registry: &Registry, heartbeat: Option<Duration>) -> SessionBinder {
        let settings = PoolSettings {
            poll_interval: Duration::from_millis(5),
            max_poll_backoff: Duration::from_millis(20),
            provision_timeout: Duration::from_millis(500),
            heartbeat_interval: heartbeat,
            ..PoolSettings::default()
        };
        let allocator = Allocator::new(
            registry.clone(),
            Arc::new(SimulatedProvider::new()),
            settings,
        );
        let catalog = StaticCatalog::new([
            GameEntry {
                id: "racer".into(),
                name: Some("Racer".into()),
                max_sessions_per_vm: 1,
            },
            GameEntry {
                id: "chess".into(),
                name: None,
                max_sessions_per_vm: 2,
            },
        ]);
        SessionBinder::new(
            registry.clone(),
            allocator,
            Arc::new(catalog),
            StreamingSettings {
                endpoint_template: "wss://{vm_address}/play/{game_id}/{session_id}".into(),
            },
            ActivityTracker::new(registry.clone(), heartbeat),
        )
    }

    #[tokio::test]
    async fn start_binds_session_and_builds_endpoint() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);

        let ticket = binder.start_session("alice", "racer").await.unwrap();
        assert!(ticket.provisioned);
        assert_eq!(
            ticket.connect_endpoint,
            format!("wss://{}/play/racer/{}", ticket.vm_address, ticket.session_id)
        );

        let session = registry.get_session(&ticket.session_id).unwrap().unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.vm_id, ticket.vm_id);
        assert!(session.is_active());
        assert_eq!(registry.get(&ticket.vm_id).unwrap().unwrap().load, 1);
    }

    #[tokio::test]
    async fn unknown_game_is_not_found() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);

        assert!(matches!(
            binder.start_session("alice", "tetris").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(registry.list_vms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_vm_for_multi_seat_games() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);

        let a = binder.start_session("alice", "chess").await.unwrap();
        let b = binder.start_session("bob", "chess").await.unwrap();
        assert_eq!(a.vm_id, b.vm_id);
        assert!(!b.provisioned);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(registry.get(&a.vm_id).unwrap().unwrap().load, 2);
    }

    #[tokio::test]
    async fn end_releases_slot_and_is_idempotent() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);
        let ticket = binder.start_session("alice", "racer").await.unwrap();

        let ended = binder.end_session(&ticket.session_id, "alice").await.unwrap();
        assert!(ended.ended_at.is_some());
        assert_eq!(registry.get(&ticket.vm_id).unwrap().unwrap().load, 0);

        let again = binder.end_session(&ticket.session_id, "alice").await.unwrap();
        assert_eq!(again.ended_at, ended.ended_at);
        assert_eq!(registry.get(&ticket.vm_id).unwrap().unwrap().load, 0);
    }

    #[tokio::test]
    async fn only_the_owner_may_end_or_inspect() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);
        let ticket = binder.start_session("alice", "racer").await.unwrap();

        assert!(matches!(
            binder.end_session(&ticket.session_id, "mallory").await,
            Err(OrchestratorError::Forbidden(_))
        ));
        assert!(matches!(
            binder.session_status(&ticket.session_id, "mallory"),
            Err(OrchestratorError::Forbidden(_))
        ));
        assert_eq!(registry.get(&ticket.vm_id).unwrap().unwrap().load, 1);
        assert!(matches!(
            binder.end_session("no-such-session", "alice").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_hides_endpoint_after_end() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);
        let ticket = binder.start_session("alice", "racer").await.unwrap();

        let status = binder.session_status(&ticket.session_id, "alice").unwrap();
        assert_eq!(status.vm_state, Some(VmState::Running));
        assert_eq!(status.vm_address.as_deref(), Some(ticket.vm_address.as_str()));
        assert_eq!(status.connect_endpoint, Some(ticket.connect_endpoint.clone()));

        binder.end_session(&ticket.session_id, "alice").await.unwrap();
        let status = binder.session_status(&ticket.session_id, "alice").unwrap();
        assert_eq!(status.connect_endpoint, None);
        assert!(!status.session.is_active());
    }

    #[tokio::test]
    async fn heartbeat_requires_active_session() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);
        let ticket = binder.start_session("alice", "racer").await.unwrap();

        binder.heartbeat(&ticket.session_id, "alice").unwrap();
        binder.end_session(&ticket.session_id, "alice").await.unwrap();
        assert!(matches!(
            binder.heartbeat(&ticket.session_id, "alice"),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn background_heartbeat_follows_session() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, Some(Duration::from_secs(60)));
        let ticket = binder.start_session("alice", "racer").await.unwrap();
        assert!(binder.tracker.is_watching(&ticket.session_id).await);

        binder.end_session(&ticket.session_id, "alice").await.unwrap();
        assert!(!binder.tracker.is_watching(&ticket.session_id).await);
    }

    #[tokio::test]
    async fn empty_user_is_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        let binder = binder(&registry, None);
        assert!(matches!(
            binder.start_session("", "racer").await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }
}
