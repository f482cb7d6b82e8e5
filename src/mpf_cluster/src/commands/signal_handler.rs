//! Termination signals and shutdown escalation.
//!
//! The first SIGINT/SIGTERM starts a graceful cluster shutdown. While that
//! runs, a second signal sends SIGTERM to the whole service process group
//! and a third sends SIGKILL and exits immediately.

use eyre::WrapErr;
use futures::stream::{Stream, StreamExt};
use std::{future::Future, time::Duration};
use tracing::{debug, info, warn};

/// Ignore signals this soon after we signalled our own process group
const SIGNAL_DEBOUNCE: Duration = Duration::from_millis(200);

/// SIGINT and SIGTERM fused into one stream
#[cfg(unix)]
fn termination_signals() -> eyre::Result<impl Stream<Item = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;

    let sigint_stream = async_stream::stream! {
        while let Some(()) = sigint.recv().await {
            yield ();
        }
    };
    let sigterm_stream = async_stream::stream! {
        while let Some(()) = sigterm.recv().await {
            yield ();
        }
    };
    Ok(futures::stream::select(sigint_stream, sigterm_stream))
}

#[cfg(not(unix))]
fn termination_signals() -> eyre::Result<impl Stream<Item = ()>> {
    Ok(async_stream::stream! {
        while tokio::signal::ctrl_c().await.is_ok() {
            yield ();
        }
    })
}

/// Run until a termination signal arrives or `run_for` elapses, then run
/// `graceful` with escalation on further signals.
pub(crate) async fn run_until_terminated<G>(
    run_for: Option<Duration>,
    pgid: Option<i32>,
    graceful: G,
) -> eyre::Result<()>
where
    G: Future<Output = ()>,
{
    let signals = termination_signals()?;
    tokio::pin!(signals);

    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = signals.next() => info!("Shutting down gracefully, press Ctrl-C again to force"),
        _ = deadline => info!("Run time elapsed, shutting down"),
    }

    tokio::pin!(graceful);
    let mut kill_level = 0u8;
    let mut last_signal_sent: Option<std::time::Instant> = None;

    loop {
        tokio::select! {
            biased;

            Some(()) = signals.next() => {
                if last_signal_sent.is_some_and(|t| t.elapsed() < SIGNAL_DEBOUNCE) {
                    debug!("Ignoring signal feedback from our own kill");
                    continue;
                }
                kill_level += 1;
                last_signal_sent = Some(std::time::Instant::now());
                match kill_level {
                    1 => {
                        warn!("Force terminating services, press Ctrl-C once more to kill");
                        signal_group(pgid, Escalation::Terminate);
                    }
                    _ => {
                        warn!("Immediate kill");
                        signal_group(pgid, Escalation::Kill);
                        std::process::exit(1);
                    }
                }
            }

            () = &mut graceful => {
                debug!("Graceful shutdown finished");
                return Ok(());
            }
        }
    }
}

enum Escalation {
    Terminate,
    Kill,
}

fn signal_group(pgid: Option<i32>, escalation: Escalation) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        use nix::sys::signal::Signal;
        let signal = match escalation {
            Escalation::Terminate => Signal::SIGTERM,
            Escalation::Kill => Signal::SIGKILL,
        };
        mpf_cluster::process::kill_process_group(pgid, signal);
        return;
    }

    let _ = (pgid, escalation);
    debug!("No process group to signal");
}
