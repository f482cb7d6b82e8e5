#![allow(dead_code)]

use mpf_cluster::{
    launcher::{LauncherSettings, OutputReceiver, StreamKind},
    state::{LauncherKind, ServiceDefinition, ServiceDescriptor},
};
use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

pub const BROKER: &str = "tcp://localhost:61616";

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await `future`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("did not finish within {:?}", timeout),
    }
}

pub fn definition(name: &str, cmd: &str, args: &[&str]) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        cmd: cmd.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        launcher: LauncherKind::Generic,
        env: vec![],
        working_dir: None,
        description: None,
    }
}

pub fn service(host: &str, name: &str, cmd: &str, args: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor::new(definition(name, cmd, args), host, 1, BROKER)
}

/// Short waits so failures show up quickly
pub fn fast_settings() -> LauncherSettings {
    LauncherSettings {
        shutdown_wait: Duration::from_secs(2),
        restart_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Collects every output line it receives
#[derive(Default)]
pub struct CollectingReceiver {
    pub lines: Mutex<Vec<(String, StreamKind, String)>>,
}

impl CollectingReceiver {
    pub fn contains(&self, stream: StreamKind, text: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, s, line)| *s == stream && line == text)
    }
}

impl OutputReceiver for CollectingReceiver {
    fn receive(&self, fqn: &str, stream: StreamKind, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((fqn.to_string(), stream, line.to_string()));
    }
}
