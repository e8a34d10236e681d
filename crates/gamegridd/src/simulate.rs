//! `simulate`: exercise the whole pool against an in-memory registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::{info, warn};

use gamegrid_activity::ActivityTracker;
use gamegrid_core::{GameEntry, parse_duration};
use gamegrid_provider::SimulatedProvider;
use gamegrid_reclaim::IdleReclaimer;
use gamegrid_scheduler::{Allocator, SessionBinder, SessionTicket, StaticCatalog};
use gamegrid_state::{Registry, epoch_millis};

use crate::inspect::load_config;

/// Game used when the config has no catalog.
const DEMO_GAME: &str = "demo";

pub async fn run(
    config_path: Option<PathBuf>,
    users: usize,
    game: Option<String>,
    hold: &str,
) -> anyhow::Result<()> {
    let config = load_config(config_path.as_deref())?;
    let mut settings = config.pool_settings()?;
    let mut games = config.games()?;
    let hold = parse_duration(hold).ok_or_else(|| anyhow!("invalid --hold value `{hold}`"))?;

    if games.is_empty() {
        games.push(GameEntry {
            id: DEMO_GAME.to_string(),
            name: Some("Demo".to_string()),
            max_sessions_per_vm: 2,
        });
    }
    let game = game.unwrap_or_else(|| games[0].id.clone());

    // Simulated instances boot in a few polls; real-world poll periods would
    // only make the run slow.
    settings.poll_interval = settings.poll_interval.min(Duration::from_millis(20));
    settings.max_poll_backoff = settings.max_poll_backoff.min(Duration::from_millis(200));

    let registry = Registry::open_in_memory()?;
    let provider = Arc::new(SimulatedProvider::new().with_boot_polls(2));
    let binder = Arc::new(SessionBinder::new(
        registry.clone(),
        Allocator::new(registry.clone(), provider.clone(), settings.clone()),
        Arc::new(StaticCatalog::new(games)),
        config.streaming_settings(),
        ActivityTracker::new(registry.clone(), settings.heartbeat_interval),
    ));
    let reclaimer = IdleReclaimer::new(registry.clone(), provider.clone(), settings.clone());

    info!(users, %game, ?hold, "starting simulated sessions");
    let tickets = start_all(&binder, users, &game).await?;

    tokio::time::sleep(hold).await;
    for (user, ticket) in &tickets {
        binder.end_session(&ticket.session_id, user).await?;
    }
    binder.shutdown().await;

    let idle_ms = u64::try_from(settings.idle_timeout.as_millis()).unwrap_or(u64::MAX);
    let report = reclaimer
        .run_cycle_at(epoch_millis().saturating_add(idle_ms).saturating_add(1))
        .await?;

    let summary = serde_json::json!({
        "tickets": tickets.iter().map(|(_, ticket)| ticket).collect::<Vec<_>>(),
        "vms": registry.list_vms()?,
        "provision_calls": provider.provision_calls(),
        "reclaim": report,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn start_all(
    binder: &Arc<SessionBinder>,
    users: usize,
    game: &str,
) -> anyhow::Result<Vec<(String, SessionTicket)>> {
    let mut set = JoinSet::new();
    for i in 0..users {
        let binder = binder.clone();
        let game = game.to_string();
        set.spawn(async move {
            let user = format!("user-{i}");
            binder
                .start_session(&user, &game)
                .await
                .map(|ticket| (user, ticket))
        });
    }

    let mut tickets = Vec::with_capacity(users);
    while let Some(joined) = set.join_next().await {
        match joined? {
            Ok(pair) => tickets.push(pair),
            Err(e) => warn!(error = %e, "session start failed"),
        }
    }
    Ok(tickets)
}
