#![cfg(unix)]

mod common;

use common::{fast_settings, wait_until, within, BROKER};
use mpf_cluster::{
    channel::{local::LocalSubstrate, Substrate},
    child::{NodeManager, NodeManagerSettings},
    launcher::OutputHooks,
    master::{ClusterConfig, ConfigFormat, Master, MasterOptions, MasterSettings},
    state::{ClusterEvent, States},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

const LONG: Duration = Duration::from_secs(10);

const SLEEPER_CONFIG: &str = r#"
node_managers:
  - target: mpf1
    min_service_up_time_millis: 10000
    services:
      - name: Markup
        cmd: /bin/sleep
        args: ["30"]
"#;

async fn start_master(
    substrate: &Arc<dyn Substrate>,
    listener: Option<mpsc::UnboundedSender<ClusterEvent>>,
) -> Master {
    let settings = MasterSettings {
        host: "master".to_string(),
        description: "test".to_string(),
        connect_timeout: Duration::from_secs(2),
        options: MasterOptions {
            broker_uri: BROKER.to_string(),
            drain_interval: Duration::from_millis(500),
            launch_on_join: true,
            ..Default::default()
        },
    };
    Master::start(substrate.clone(), settings, None, listener)
        .await
        .unwrap()
}

async fn start_node_manager(substrate: &Arc<dyn Substrate>, host: &str) -> NodeManager {
    let settings = NodeManagerSettings {
        host: host.to_string(),
        description: "1".to_string(),
        connect_timeout: Duration::from_secs(2),
        reconcile_interval: Duration::from_millis(200),
        launcher: fast_settings(),
        hooks: OutputHooks::default(),
    };
    NodeManager::start(substrate.clone(), settings).await.unwrap()
}

fn service_state(master: &Master, fqn: &str) -> Option<States> {
    master.state().service(fqn).map(|s| s.last_known_state)
}

// ---- Lifecycle ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_runs_and_shuts_down() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let master = start_master(&substrate, Some(events_tx)).await;

    let config = ClusterConfig::parse(SLEEPER_CONFIG, ConfigFormat::Yaml).unwrap();
    let summary = master.coordinator().apply_config(config);
    assert_eq!(summary.nodes_added, 1);
    assert_eq!(summary.services_added, 1);
    assert_eq!(service_state(&master, "mpf1:Markup:1"), Some(States::Configured));

    let nm = start_node_manager(&substrate, "mpf1").await;

    // the joiner got the master's tables during connect
    assert!(nm.state().service("mpf1:Markup:1").is_some());

    assert!(
        wait_until(LONG, || service_state(&master, "mpf1:Markup:1")
            == Some(States::Running))
        .await
    );
    assert_eq!(nm.coordinator().tracked(), vec!["mpf1:Markup:1".to_string()]);
    let launcher = nm.coordinator().launcher("mpf1:Markup:1").unwrap();
    assert!(wait_until(LONG, || launcher.is_alive()).await);

    within(LONG, master.coordinator().shutdown_all()).await;
    assert!(
        wait_until(LONG, || service_state(&master, "mpf1:Markup:1")
            == Some(States::Inactive))
        .await
    );
    assert!(!launcher.is_alive());
    assert!(nm.coordinator().tracked().is_empty());

    within(LONG, nm.shutdown()).await;
    assert!(
        wait_until(LONG, || master
            .state()
            .node("mpf1")
            .is_some_and(|n| n.last_known_state == States::Inactive))
        .await
    );

    // events reach the listener after the master has handled them
    let mut events = Vec::new();
    let saw_all = wait_until(LONG, || {
        events.extend(std::iter::from_fn(|| events_rx.try_recv().ok()));
        let joined = events
            .iter()
            .any(|e| matches!(e, ClusterEvent::NewManager { node } if node.hostname == "mpf1"));
        let running = events.iter().any(|e| {
            matches!(e, ClusterEvent::NewService { service }
                if service.fully_qualified_name() == "mpf1:Markup:1")
        });
        let left = events
            .iter()
            .any(|e| matches!(e, ClusterEvent::ManagerDown { node } if node.hostname == "mpf1"));
        joined && running && left
    })
    .await;
    assert!(saw_all, "missing lifecycle events in {:?}", events);
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unconfigured_service_is_deleted() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let master = start_master(&substrate, None).await;
    let config = ClusterConfig::parse(SLEEPER_CONFIG, ConfigFormat::Yaml).unwrap();
    master.coordinator().apply_config(config.clone());
    let nm = start_node_manager(&substrate, "mpf1").await;

    assert!(
        wait_until(LONG, || service_state(&master, "mpf1:Markup:1")
            == Some(States::Running))
        .await
    );

    let mut pruned = config;
    pruned.node_managers[0].services.clear();
    let summary = master.coordinator().apply_config(pruned);
    assert_eq!(summary.services_removed, 1);

    assert!(wait_until(LONG, || master.state().service("mpf1:Markup:1").is_none()).await);
    assert!(wait_until(LONG, || nm.state().service("mpf1:Markup:1").is_none()).await);
    assert!(nm.coordinator().tracked().is_empty());

    nm.shutdown().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unlaunchable_service_is_flagged_and_not_relaunched() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let master = start_master(&substrate, None).await;
    let config = ClusterConfig::parse(
        r#"
node_managers:
  - target: mpf1
    services:
      - name: Broken
        cmd: /nonexistent/mpf/bin/broken
"#,
        ConfigFormat::Yaml,
    )
    .unwrap();
    master.coordinator().apply_config(config);
    let nm = start_node_manager(&substrate, "mpf1").await;

    assert!(
        wait_until(LONG, || service_state(&master, "mpf1:Broken:1")
            == Some(States::InactiveNoStart))
        .await
    );
    let service = master.state().service("mpf1:Broken:1").unwrap();
    assert!(service.fatal_issue);
    assert_eq!(master.coordinator().launch_all(), 0);

    nm.shutdown().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finished_service_is_reported_inactive() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let master = start_master(&substrate, None).await;
    let config = ClusterConfig::parse(
        r#"
node_managers:
  - target: mpf1
    services:
      - name: Once
        cmd: /bin/sleep
        args: ["0.3"]
"#,
        ConfigFormat::Yaml,
    )
    .unwrap();
    master.coordinator().apply_config(config);
    let nm = start_node_manager(&substrate, "mpf1").await;

    // picked up by the periodic reconcile once the process exits
    assert!(
        wait_until(LONG, || service_state(&master, "mpf1:Once:1") == Some(States::Inactive))
            .await
    );
    assert!(nm.coordinator().tracked().is_empty());

    nm.shutdown().await;
    master.stop().await;
}

// ---- Configuration ----

#[tokio::test]
async fn test_reapplying_config_changes_nothing() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let master = start_master(&substrate, None).await;
    let config = ClusterConfig::parse(SLEEPER_CONFIG, ConfigFormat::Yaml).unwrap();

    assert!(!master.coordinator().apply_config(config.clone()).is_empty());
    let services = master.state().services();
    assert!(master.coordinator().apply_config(config).is_empty());
    assert_eq!(master.state().services(), services);

    // no node manager is running, so nothing launches
    assert_eq!(master.coordinator().launch_all(), 0);
    master.stop().await;
}

#[tokio::test]
async fn test_status_reports_members_and_services() {
    let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::new());
    let master = start_master(&substrate, None).await;
    let config = ClusterConfig::parse(SLEEPER_CONFIG, ConfigFormat::Yaml).unwrap();
    master.coordinator().apply_config(config);

    let status = master.status();
    assert_eq!(status.members, vec!["MasterNode:master:test".to_string()]);
    assert_eq!(status.services.len(), 1);
    assert_eq!(status.summary(), "1 members, 1 nodes, Configured=1");
    master.stop().await;
}
