//! Check-config command - validate a cluster config and print its expansion

use crate::cli::{config::load_runtime_config, options::CheckConfigArgs};
use itertools::Itertools;
use mpf_cluster::master::{config::desired_state, ClusterConfig};
use tracing::info;

pub fn handle_check_config(args: &CheckConfigArgs) -> eyre::Result<()> {
    let runtime_config = load_runtime_config(args.common.config.as_deref())?;
    let config = ClusterConfig::load(&args.nodes)?;
    let desired = desired_state(
        &config,
        &runtime_config.broker_uri,
        runtime_config.launcher.min_service_up_time_ms,
    );

    let dropped_nodes = config.node_managers.len() - desired.nodes.len();
    if dropped_nodes > 0 {
        info!("{} node manager entries were ignored", dropped_nodes);
    }

    for node in &desired.nodes {
        println!(
            "{} (min service up time {}ms)",
            node.hostname, node.min_service_up_time_millis
        );
        let services = desired
            .services
            .iter()
            .filter(|s| s.host == node.hostname)
            .sorted_by_key(|s| (s.name().to_string(), s.rank));
        for service in services {
            println!(
                "  {} [{:?}] {} {}",
                service.fully_qualified_name(),
                service.service.launcher,
                service.service.cmd,
                service.service.args.join(" ")
            );
        }
    }
    println!(
        "{} nodes, {} services",
        desired.nodes.len(),
        desired.services.len()
    );
    Ok(())
}
