//! Stdout/stderr draining
//!
//! Both pipes of a launched process are always read to the end; a pipe that
//! nobody reads eventually blocks the child. Lines can be rewritten or
//! dropped by a [`LineFilter`] and handed to an [`OutputReceiver`]. With no
//! receiver the bytes are discarded.

use crate::util::log_dir::service_log_dir;
use std::{
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "out",
            StreamKind::Stderr => "err",
        }
    }
}

/// Rewrites a line before it reaches the receiver; `None` drops it.
pub trait LineFilter: Send + Sync {
    fn filter(&self, fully_qualified_name: &str, stream: StreamKind, line: &str) -> Option<String>;
}

/// Consumes output lines of launched processes.
pub trait OutputReceiver: Send + Sync {
    fn receive(&self, fully_qualified_name: &str, stream: StreamKind, line: &str);
}

/// Optional output hooks shared by the launchers of a node manager
#[derive(Clone, Default)]
pub struct OutputHooks {
    pub filter: Option<Arc<dyn LineFilter>>,
    pub receiver: Option<Arc<dyn OutputReceiver>>,
}

impl fmt::Debug for OutputHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputHooks")
            .field("filter", &self.filter.is_some())
            .field("receiver", &self.receiver.is_some())
            .finish()
    }
}

/// Read `reader` until end of stream.
pub async fn drain_stream<R>(reader: R, fqn: &str, stream: StreamKind, hooks: &OutputHooks)
where
    R: AsyncRead + Unpin,
{
    let Some(receiver) = &hooks.receiver else {
        let mut reader = reader;
        if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
            warn!("[{}] Error draining {:?}: {}", fqn, stream, e);
        }
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                match &hooks.filter {
                    Some(filter) => {
                        if let Some(line) = filter.filter(fqn, stream, line) {
                            receiver.receive(fqn, stream, &line);
                        }
                    }
                    None => receiver.receive(fqn, stream, line),
                }
            }
            Err(e) => {
                warn!("[{}] Error reading {:?}: {}", fqn, stream, e);
                break;
            }
        }
    }
}

enum LogRecord {
    Line {
        fqn: String,
        stream: StreamKind,
        line: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Appends each service's lines to `<run_dir>/<fqn>/out` and `.../err`
///
/// Lines are queued to a blocking writer so the drain tasks never touch the
/// filesystem themselves.
pub struct LogFileReceiver {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl LogFileReceiver {
    /// Start the writer. Inside a runtime it runs on the blocking pool,
    /// otherwise on its own thread.
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        let run_dir = run_dir.into();
        let (tx, rx) = mpsc::unbounded_channel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_logs(&run_dir, rx));
            }
            Err(_) => {
                std::thread::spawn(move || write_logs(&run_dir, rx));
            }
        }
        Self { tx }
    }

    /// Resolves once every line received so far is written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogRecord::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl OutputReceiver for LogFileReceiver {
    fn receive(&self, fqn: &str, stream: StreamKind, line: &str) {
        let record = LogRecord::Line {
            fqn: fqn.to_string(),
            stream,
            line: line.to_string(),
        };
        if self.tx.send(record).is_err() {
            warn!("[{}] Log writer has stopped, dropping {:?} line", fqn, stream);
        }
    }
}

/// Writer loop; ends when every [`LogFileReceiver`] handle is dropped.
fn write_logs(run_dir: &Path, mut rx: mpsc::UnboundedReceiver<LogRecord>) {
    let mut files: HashMap<(String, StreamKind), File> = HashMap::new();
    while let Some(record) = rx.blocking_recv() {
        match record {
            LogRecord::Line { fqn, stream, line } => {
                let key = (fqn, stream);
                if !files.contains_key(&key) {
                    match open_log(run_dir, &key.0, stream) {
                        Ok(file) => {
                            files.insert(key.clone(), file);
                        }
                        Err(e) => {
                            warn!("[{}] Unable to open {:?} log: {}", key.0, stream, e);
                            continue;
                        }
                    }
                }
                if let Some(file) = files.get_mut(&key) {
                    if let Err(e) = writeln!(file, "{}", line) {
                        warn!("[{}] Unable to write {:?} log: {}", key.0, stream, e);
                    }
                }
            }
            LogRecord::Flush(done) => {
                for file in files.values_mut() {
                    let _ = file.flush();
                }
                let _ = done.send(());
            }
        }
    }
    debug!("Service log writer for {} finished", run_dir.display());
}

fn open_log(run_dir: &Path, fqn: &str, stream: StreamKind) -> std::io::Result<File> {
    let dir = service_log_dir(run_dir, fqn);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(stream.file_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(StreamKind, String)>>);

    impl OutputReceiver for Collect {
        fn receive(&self, _fqn: &str, stream: StreamKind, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }
    }

    struct DropDebug;

    impl LineFilter for DropDebug {
        fn filter(&self, _fqn: &str, _stream: StreamKind, line: &str) -> Option<String> {
            (!line.starts_with("DEBUG")).then(|| line.to_uppercase())
        }
    }

    #[tokio::test]
    async fn test_lines_are_filtered_then_received() {
        let collect = Arc::new(Collect::default());
        let hooks = OutputHooks {
            filter: Some(Arc::new(DropDebug)),
            receiver: Some(collect.clone() as Arc<dyn OutputReceiver>),
        };
        let input: &[u8] = b"hello\r\nDEBUG noise\nlast without newline";
        drain_stream(input, "mpf1:Markup:1", StreamKind::Stdout, &hooks).await;

        let lines = collect.0.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                (StreamKind::Stdout, "HELLO".to_string()),
                (StreamKind::Stdout, "LAST WITHOUT NEWLINE".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_receiver_discards() {
        let input: &[u8] = b"ignored\n";
        drain_stream(input, "mpf1:Markup:1", StreamKind::Stderr, &OutputHooks::default()).await;
    }

    #[tokio::test]
    async fn test_log_file_receiver_appends() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = LogFileReceiver::new(dir.path());
        receiver.receive("mpf1:Markup:1", StreamKind::Stdout, "one");
        receiver.receive("mpf1:Markup:1", StreamKind::Stdout, "two");
        receiver.receive("mpf1:Markup:1", StreamKind::Stderr, "oops");
        receiver.flush().await;

        let out = std::fs::read_to_string(dir.path().join("mpf1_Markup_1/out")).unwrap();
        assert_eq!(out, "one\ntwo\n");
        let err = std::fs::read_to_string(dir.path().join("mpf1_Markup_1/err")).unwrap();
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn test_log_file_receiver_writes_off_the_drain_task() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = Arc::new(LogFileReceiver::new(dir.path()));
        let hooks = OutputHooks {
            filter: None,
            receiver: Some(receiver.clone() as Arc<dyn OutputReceiver>),
        };
        let input: &[u8] = b"first\nsecond\n";
        drain_stream(input, "mpf2:Speech:3", StreamKind::Stdout, &hooks).await;
        receiver.flush().await;

        let out = std::fs::read_to_string(dir.path().join("mpf2_Speech_3/out")).unwrap();
        assert_eq!(out, "first\nsecond\n");
    }

    #[test]
    fn test_log_file_receiver_works_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = LogFileReceiver::new(dir.path());
        receiver.receive("mpf1:Markup:1", StreamKind::Stdout, "plain");
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(receiver.flush());

        let out = std::fs::read_to_string(dir.path().join("mpf1_Markup_1/out")).unwrap();
        assert_eq!(out, "plain\n");
    }
}
