//! Node-manager side of the lifecycle
//!
//! The child coordinator turns service states addressed to its host into
//! launcher actions and reports the outcome back through the tables. Slow
//! work (command resolution, process shutdown) runs in spawned tasks so the
//! event loop only ever takes short table locks.

use crate::{
    channel::{messages::ClusterMessage, ChannelEvent},
    launcher::{LauncherSettings, OutputHooks, ProcessLauncher},
    state::{
        descriptors::now_millis, ClusterState, ServiceDescriptor, States, UpdateOutcome,
    },
    util::logging::is_verbose,
};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct ChildCoordinator {
    host: String,
    state: Arc<ClusterState>,
    launchers: Arc<DashMap<String, Arc<ProcessLauncher>>>,
    settings: LauncherSettings,
    hooks: OutputHooks,
}

impl ChildCoordinator {
    pub fn new(
        host: impl Into<String>,
        state: Arc<ClusterState>,
        settings: LauncherSettings,
        hooks: OutputHooks,
    ) -> Self {
        Self {
            host: host.into(),
            state,
            launchers: Arc::new(DashMap::new()),
            settings,
            hooks,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Fully qualified names of the services supervised here
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.launchers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn launcher(&self, fqn: &str) -> Option<Arc<ProcessLauncher>> {
        self.launchers.get(fqn).map(|e| e.value().clone())
    }

    /// Announce this node manager and pick up launches it may have missed.
    pub fn start(&self) {
        if let Err(e) = self.state.update_node_state(&self.host, States::Running) {
            warn!("[node {}] Failed to announce as running: {}", self.host, e);
        }

        for service in self.state.services_on_host(&self.host) {
            if service.last_known_state == States::Launching {
                info!(
                    "[{}] Was launching before this node manager started, launching now",
                    service.fully_qualified_name()
                );
                self.launch(service);
            }
        }
    }

    pub fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { src, message } => self.handle_message(&src, message),
            ChannelEvent::View(view) => {
                self.state.reconcile_view(&view, false);
            }
        }
    }

    pub fn handle_message(&self, src: &str, message: ClusterMessage) {
        match message {
            ClusterMessage::ServiceStatusUpdate { service } => {
                let local = service.host == self.host;
                let fqn = service.fully_qualified_name().to_string();
                let state = service.last_known_state;

                let outcome = self.state.apply_service_update(service.clone());
                if outcome == UpdateOutcome::Stale {
                    debug!("[{}] Stale {} from {} ignored", fqn, state, src);
                    return;
                }
                if local {
                    self.handle_local_service(service);
                }
            }
            ClusterMessage::NodeStatusUpdate { hostname, node } => {
                if hostname == self.host {
                    debug!("[node {}] Ignoring report about this node from {}", hostname, src);
                    return;
                }
                self.state.apply_node_update(&hostname, node);
            }
            ClusterMessage::StreamingJob(job) => {
                debug!("Streaming job {:?} {} from {}", job.kind, job.job_id, src);
            }
        }
    }

    /// Act on a command for a service on this host.
    fn handle_local_service(&self, service: ServiceDescriptor) {
        match service.last_known_state {
            States::Launching => self.launch(service),
            States::ShuttingDown => self.stop(service, States::Inactive),
            States::ShuttingDownNoRestart => self.stop(service, States::InactiveNoStart),
            States::Delete => self.stop(service, States::DeleteInactive),
            _ => {}
        }
    }

    /// Start supervising a service. A second launch for a tracked service
    /// does nothing.
    pub fn launch(&self, service: ServiceDescriptor) {
        let fqn = service.fully_qualified_name().to_string();
        let launcher = match self.launchers.entry(fqn.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("[{}] Already launched", fqn);
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let launcher = Arc::new(ProcessLauncher::new(
                    service,
                    self.settings.clone(),
                    self.hooks.clone(),
                ));
                entry.insert(launcher.clone());
                launcher
            }
        };

        let min_up = Duration::from_millis(self.min_service_up_time_millis());
        let this = self.clone();
        tokio::spawn(async move {
            let started = launcher.startup(min_up);

            // Holding the entry keeps a concurrent stop from untracking the
            // launcher between the check and the report.
            let vanished = {
                let Some(entry) = this.launchers.get(&fqn) else {
                    debug!("[{}] Stopped while launching, leaving the report to stop", fqn);
                    return;
                };
                if !Arc::ptr_eq(entry.value(), &launcher) {
                    debug!("[{}] Replaced while launching", fqn);
                    return;
                }
                match this.state.service(&fqn) {
                    None => true,
                    Some(current) if current.last_known_state != States::Launching => {
                        debug!(
                            "[{}] Now {} instead of launching, not reporting",
                            fqn, current.last_known_state
                        );
                        return;
                    }
                    Some(mut current) if started => {
                        if is_verbose() {
                            info!("[{}] Launched", fqn);
                        }
                        current.start_time_millis = match launcher.start_time_millis() {
                            0 => now_millis(),
                            millis => millis,
                        };
                        current.fatal_issue = false;
                        this.report(current, States::Running);
                        return;
                    }
                    Some(mut current) => {
                        error!("[{}] Launch failed, not retrying", fqn);
                        current.fatal_issue = true;
                        this.report(current, States::InactiveNoStart);
                        false
                    }
                }
            };

            this.launchers
                .remove_if(&fqn, |_, tracked| Arc::ptr_eq(tracked, &launcher));
            if vanished {
                warn!("[{}] Removed from the table while launching", fqn);
                launcher.shutdown().await;
            }
        });
    }

    /// Shut a service down and report `done` once it has stopped.
    fn stop(&self, service: ServiceDescriptor, done: States) {
        let fqn = service.fully_qualified_name().to_string();
        // untrack first so reconcile does not report the exit as well
        let launcher = self.launchers.remove(&fqn).map(|(_, launcher)| launcher);
        let this = self.clone();
        tokio::spawn(async move {
            let mut current = this.state.service(&fqn).unwrap_or(service);
            if let Some(launcher) = launcher {
                launcher.shutdown().await;
                current.restarts = launcher.restarts();
                current.fatal_issue |= launcher.has_fatal_issue();
            }
            this.report(current, done);
        });
    }

    /// Compare tracked launchers with the tables.
    ///
    /// Finished launchers are dropped and their service reported `Inactive`
    /// (`InactiveNoStart` if fatal). Restart counts that grew are
    /// re-broadcast. Launchers whose service vanished are shut down.
    pub fn reconcile(&self) {
        let tracked: Vec<(String, Arc<ProcessLauncher>)> = self
            .launchers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (fqn, launcher) in tracked {
            let Some(mut current) = self.state.service(&fqn) else {
                warn!("[{}] No longer in the service table, stopping", fqn);
                self.launchers.remove(&fqn);
                tokio::spawn(async move { launcher.shutdown().await });
                continue;
            };

            // the launch task has not reported Running yet
            if current.last_known_state == States::Launching {
                continue;
            }

            if launcher.is_run_to_completion() {
                self.launchers.remove(&fqn);
                let fatal = launcher.has_fatal_issue();
                current.restarts = launcher.restarts();
                current.fatal_issue |= fatal;
                let state = if fatal {
                    States::InactiveNoStart
                } else {
                    States::Inactive
                };
                info!("[{}] Process finished, reporting {}", fqn, state);
                self.report(current, state);
            } else if launcher.restarts() > current.restarts {
                current.restarts = launcher.restarts();
                current.start_time_millis = launcher.start_time_millis();
                let state = current.last_known_state;
                debug!("[{}] Restart count now {}", fqn, current.restarts);
                self.report(current, state);
            }
        }
    }

    /// Shut down every tracked launcher, reporting each service `Inactive`.
    pub async fn shutdown_all(&self) {
        let tracked: Vec<(String, Arc<ProcessLauncher>)> = self
            .launchers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.launchers.clear();

        let stops = tracked.into_iter().map(|(fqn, launcher)| {
            let this = self.clone();
            async move {
                launcher.shutdown().await;
                if let Some(mut current) = this.state.service(&fqn) {
                    current.restarts = launcher.restarts();
                    this.report(current, States::Inactive);
                }
            }
        });
        futures::future::join_all(stops).await;
    }

    fn min_service_up_time_millis(&self) -> u64 {
        self.state
            .node(&self.host)
            .map(|n| n.min_service_up_time_millis)
            .unwrap_or(crate::state::descriptors::DEFAULT_MIN_SERVICE_UP_TIME_MILLIS)
    }

    fn report(&self, service: ServiceDescriptor, state: States) {
        let fqn = service.fully_qualified_name().to_string();
        if let Err(e) = self.state.update_service_state(service, state) {
            warn!("[{}] Failed to report {}: {}", fqn, state, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::{
        descriptors::{LauncherKind, NodeDescriptor, ServiceDefinition},
        tables::tests::RecordingPublisher,
    };
    use std::time::Instant;

    fn coordinator() -> ChildCoordinator {
        coordinator_with_publisher().0
    }

    fn coordinator_with_publisher() -> (ChildCoordinator, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let state = Arc::new(ClusterState::new(publisher.clone()));
        let settings = LauncherSettings {
            shutdown_wait: Duration::from_secs(2),
            restart_backoff: Duration::from_millis(50),
            ..Default::default()
        };
        let coordinator = ChildCoordinator::new("mpf1", state, settings, OutputHooks::default());
        (coordinator, publisher)
    }

    fn service(host: &str, name: &str, cmd: &str, args: &[&str], state: States) -> ServiceDescriptor {
        let def = ServiceDefinition {
            name: name.to_string(),
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            launcher: LauncherKind::Generic,
            env: vec![],
            working_dir: None,
            description: None,
        };
        let mut service = ServiceDescriptor::new(def, host, 1, "tcp://localhost:61616");
        service.last_known_state = state;
        service
    }

    fn command(service: ServiceDescriptor) -> ClusterMessage {
        ClusterMessage::ServiceStatusUpdate { service }
    }

    fn state_of(coordinator: &ChildCoordinator, fqn: &str) -> Option<States> {
        coordinator.state().service(fqn).map(|s| s.last_known_state)
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_launch_command_starts_and_reports_running() {
        let coordinator = coordinator();
        let svc = service("mpf1", "Sleeper", "/bin/sleep", &["30"], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc.clone()));

        assert!(wait_for(|| state_of(&coordinator, "mpf1:Sleeper:1") == Some(States::Running)).await);
        assert_eq!(coordinator.tracked(), vec!["mpf1:Sleeper:1".to_string()]);
        let started = coordinator.state().service("mpf1:Sleeper:1").unwrap();
        assert!(started.start_time_millis > 0);

        // a repeated command does not start a second process
        coordinator.launch(svc);
        assert_eq!(coordinator.tracked().len(), 1);

        coordinator.shutdown_all().await;
        assert!(coordinator.tracked().is_empty());
        assert_eq!(state_of(&coordinator, "mpf1:Sleeper:1"), Some(States::Inactive));
    }

    #[tokio::test]
    async fn test_commands_for_other_hosts_are_only_mirrored() {
        let coordinator = coordinator();
        let svc = service("mpf2", "Sleeper", "/bin/sleep", &["30"], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc));

        assert_eq!(state_of(&coordinator, "mpf2:Sleeper:1"), Some(States::Launching));
        assert!(coordinator.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_command_reports_fatal() {
        let coordinator = coordinator();
        let svc = service("mpf1", "Broken", "/nonexistent/bin/broken", &[], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc));

        assert!(wait_for(
            || state_of(&coordinator, "mpf1:Broken:1") == Some(States::InactiveNoStart)
        )
        .await);
        assert!(coordinator.state().service("mpf1:Broken:1").unwrap().fatal_issue);
        assert!(coordinator.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_delete_stops_and_removes() {
        let coordinator = coordinator();
        let svc = service("mpf1", "Sleeper", "/bin/sleep", &["30"], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc));
        assert!(wait_for(|| state_of(&coordinator, "mpf1:Sleeper:1") == Some(States::Running)).await);

        let mut delete = coordinator.state().service("mpf1:Sleeper:1").unwrap();
        delete.last_known_state = States::Delete;
        coordinator.handle_message("MasterNode:m:1", command(delete));

        assert!(coordinator.tracked().is_empty());
        assert!(wait_for(|| coordinator.state().service("mpf1:Sleeper:1").is_none()).await);
    }

    #[tokio::test]
    async fn test_reconcile_reports_finished_process() {
        let coordinator = coordinator();
        let svc = service("mpf1", "Once", "/bin/true", &[], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc));
        assert!(wait_for(|| state_of(&coordinator, "mpf1:Once:1") == Some(States::Running)).await);

        let launcher = coordinator.launcher("mpf1:Once:1").unwrap();
        launcher.wait_for_completion().await;
        coordinator.reconcile();

        assert_eq!(state_of(&coordinator, "mpf1:Once:1"), Some(States::Inactive));
        assert!(coordinator.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_stale_command_is_ignored() {
        let coordinator = coordinator();
        let svc = service("mpf1", "Sleeper", "/bin/sleep", &["30"], States::ShuttingDown);
        coordinator
            .state()
            .update_service_state(svc.clone(), States::ShuttingDownNoRestart)
            .unwrap();

        coordinator.handle_message("MasterNode:m:1", command(svc));
        assert_eq!(
            state_of(&coordinator, "mpf1:Sleeper:1"),
            Some(States::ShuttingDownNoRestart)
        );
    }

    #[test]
    fn test_reports_about_own_node_are_ignored() {
        let coordinator = coordinator();
        coordinator
            .state()
            .update_node_state("mpf1", States::Running)
            .unwrap();

        let mut down = NodeDescriptor::new("mpf1");
        down.last_known_state = States::Inactive;
        coordinator.handle_message(
            "MasterNode:m:1",
            ClusterMessage::NodeStatusUpdate {
                hostname: "mpf1".to_string(),
                node: down.clone(),
            },
        );
        assert!(coordinator.state().is_node_running("mpf1"));

        down.hostname = "mpf2".to_string();
        coordinator.handle_message(
            "MasterNode:m:1",
            ClusterMessage::NodeStatusUpdate {
                hostname: "mpf2".to_string(),
                node: down,
            },
        );
        assert_eq!(
            coordinator.state().node("mpf2").unwrap().last_known_state,
            States::Inactive
        );
    }

    #[tokio::test]
    async fn test_repeated_launch_command_broadcasts_nothing() {
        let (coordinator, publisher) = coordinator_with_publisher();
        let svc = service("mpf1", "Sleeper", "/bin/sleep", &["30"], States::Launching);
        coordinator.handle_message("MasterNode:m:1", command(svc.clone()));
        assert!(wait_for(|| state_of(&coordinator, "mpf1:Sleeper:1") == Some(States::Running)).await);
        let sent = publisher.count();

        coordinator.handle_message("MasterNode:m:1", command(svc.clone()));
        coordinator.launch(svc);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(publisher.count(), sent);
        assert_eq!(coordinator.tracked().len(), 1);
        assert_eq!(state_of(&coordinator, "mpf1:Sleeper:1"), Some(States::Running));
        coordinator.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_right_after_launch_stays_inactive() {
        let coordinator = coordinator();
        let names: Vec<String> = (0..30).map(|i| format!("Sleeper{}", i)).collect();

        for name in &names {
            let launching = service("mpf1", name, "/bin/sleep", &["30"], States::Launching);
            let mut stopping = launching.clone();
            stopping.last_known_state = States::ShuttingDown;
            coordinator.handle_message("MasterNode:m:1", command(launching));
            coordinator.handle_message("MasterNode:m:1", command(stopping));
        }

        let all_inactive = || {
            names.iter().all(|name| {
                state_of(&coordinator, &format!("mpf1:{}:1", name)) == Some(States::Inactive)
            })
        };
        assert!(wait_for(all_inactive).await);

        // a late launch report must not resurrect any of them
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(all_inactive());
        assert!(coordinator.tracked().is_empty());
    }
}
