//! Standalone command - master and node managers in one process

use super::{
    common::{build_tokio_runtime, CleanupGuard},
    signal_handler::run_until_terminated,
};
use crate::cli::{
    config::{load_runtime_config, RuntimeConfig},
    options::StandaloneArgs,
};
use eyre::WrapErr;
use futures::future::join_all;
use mpf_cluster::{
    channel::{local::LocalSubstrate, Substrate},
    child::{NodeManager, NodeManagerSettings},
    launcher::{LogFileReceiver, OutputHooks},
    master::{
        config::desired_state, ClusterConfig, Master, MasterCoordinator, MasterOptions,
        MasterSettings,
    },
    process::CleanupRegistry,
    state::ClusterEvent,
    util::{log_dir::create_log_dir, logging::is_verbose},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub fn handle_standalone(args: &StandaloneArgs) -> eyre::Result<()> {
    let runtime_config = load_runtime_config(args.common.config.as_deref())?;
    let cluster_config = ClusterConfig::load(&args.nodes)?;

    info!("Configuration:");
    info!("  Cluster: {}", runtime_config.cluster_name);
    info!("  Broker: {}", runtime_config.broker_uri);
    info!("  Node managers: {}", cluster_config.node_managers.len());
    if let Some(dir) = &runtime_config.service_log_dir {
        info!("  Service logs: {}", dir.display());
    }

    let run_for = match args.run_for {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => eyre::bail!("--run-for must be a positive number of seconds, got {}", secs),
        None => None,
    };

    let registry = Arc::new(CleanupRegistry::new());
    let guard = CleanupGuard::new(registry.clone());

    let runtime = build_tokio_runtime()?;
    runtime.block_on(run_standalone(
        args,
        runtime_config,
        cluster_config,
        run_for,
        registry,
    ))?;

    guard.disable();
    Ok(())
}

async fn run_standalone(
    args: &StandaloneArgs,
    runtime_config: RuntimeConfig,
    cluster_config: ClusterConfig,
    run_for: Option<Duration>,
    registry: Arc<CleanupRegistry>,
) -> eyre::Result<()> {
    #[cfg(unix)]
    let anchor = match mpf_cluster::process::ProcessGroupAnchor::spawn() {
        Ok(anchor) => Some(anchor),
        Err(e) => {
            warn!("Services will run in their own process groups: {:#}", e);
            None
        }
    };
    #[cfg(unix)]
    let pgid = anchor.as_ref().map(|a| a.pgid());
    #[cfg(not(unix))]
    let pgid: Option<i32> = None;

    let hooks = match &runtime_config.service_log_dir {
        Some(base) => {
            let run_dir = create_log_dir(base)?;
            info!("Writing service output under {}", run_dir.display());
            OutputHooks {
                receiver: Some(Arc::new(LogFileReceiver::new(run_dir))),
                ..Default::default()
            }
        }
        None => OutputHooks::default(),
    };

    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let host = local_hostname();

    let (listener_tx, listener_rx) = mpsc::unbounded_channel();
    let master = Master::start(
        substrate.clone(),
        MasterSettings {
            host: host.clone(),
            description: runtime_config.cluster_name.clone(),
            connect_timeout: runtime_config.connect_timeout(),
            options: MasterOptions {
                broker_uri: runtime_config.broker_uri.clone(),
                default_min_up_time_millis: runtime_config.launcher.min_service_up_time_ms,
                drain_interval: runtime_config.drain_interval(),
                auto_configure: runtime_config.auto_configure,
                auto_unconfigure: runtime_config.auto_unconfigure,
                launch_on_join: runtime_config.launch_on_join && !args.no_launch,
                config_path: Some(args.nodes.clone()),
            },
        },
        None,
        Some(listener_tx),
    )
    .await?;
    let master = Arc::new(master);
    let listener = tokio::spawn(log_cluster_events(master.clone(), listener_rx));

    let summary = master.coordinator().apply_config(cluster_config.clone());
    debug!("Initial config apply: {:?}", summary);

    let desired = desired_state(
        &cluster_config,
        &runtime_config.broker_uri,
        runtime_config.launcher.min_service_up_time_ms,
    );
    let launcher_settings = {
        let mut settings = runtime_config.launcher_settings();
        settings.pgid = pgid;
        settings.cleanup = Some(registry.clone());
        settings
    };

    let mut node_managers = Vec::with_capacity(desired.nodes.len());
    for node in &desired.nodes {
        let settings = NodeManagerSettings {
            host: node.hostname.clone(),
            description: std::process::id().to_string(),
            connect_timeout: runtime_config.connect_timeout(),
            reconcile_interval: runtime_config.reconcile_interval(),
            launcher: launcher_settings.clone(),
            hooks: hooks.clone(),
        };
        match NodeManager::start(substrate.clone(), settings).await {
            Ok(nm) => node_managers.push(nm),
            Err(e) => error!("Node manager for {} did not start: {:#}", node.hostname, e),
        }
    }
    info!(
        "Cluster up: {} node managers, {} services configured",
        node_managers.len(),
        desired.services.len()
    );

    let coordinator: MasterCoordinator = master.coordinator().clone();
    let graceful = async {
        coordinator.shutdown_all().await;
        join_all(node_managers.iter().map(|nm| nm.shutdown())).await;
        master.stop().await;
    };
    run_until_terminated(run_for, pgid, graceful)
        .await
        .wrap_err("shutdown did not complete")?;

    listener.abort();
    if !registry.is_empty() {
        warn!("Processes still registered after shutdown: {:?}", registry.pids());
    }
    info!("{}", master.status().summary());
    Ok(())
}

async fn log_cluster_events(master: Arc<Master>, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            ClusterEvent::NewService { service } => {
                info!("Service {} is running", service.fully_qualified_name());
            }
            ClusterEvent::ServiceDown { service } if service.fatal_issue => {
                warn!("Service {} stopped with a fatal issue", service.fully_qualified_name());
            }
            ClusterEvent::ServiceDown { service } => {
                info!("Service {} stopped", service.fully_qualified_name());
            }
            ClusterEvent::ServiceReadyToRemove { service } => {
                info!("Service {} removed", service.fully_qualified_name());
            }
            ClusterEvent::NewManager { node } => info!("Node manager {} joined", node.hostname),
            ClusterEvent::ManagerDown { node } => info!("Node manager {} is down", node.hostname),
            ClusterEvent::ViewUpdated { .. } => {
                if is_verbose() {
                    debug!("{}", master.status().summary());
                }
            }
        }
    }
}

fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Unable to read hostname, using localhost: {}", e);
            "localhost".to_string()
        }
    }
}
