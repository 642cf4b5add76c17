//! Transaction log: timestamped, line-oriented, append-only
//!
//! Every event is formatted on the calling task and handed to a single writer task over an
//! unbounded channel, so recording never blocks a transaction and never fails it. One event
//! (possibly several lines, e.g. headers) is written with a single append, so concurrent
//! transactions never interleave inside an event.

use crate::relay::LogText;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode, Uri};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Something worth recording about the proxy or a single transaction
#[derive(Debug)]
pub enum LogEvent<'a> {
    Startup(&'a str),
    RequestLine { method: &'a Method, uri: &'a Uri },
    RequestEncoding { inbound: &'a str, outbound: &'a str },
    RequestHeaders(&'a HeaderMap),
    RequestBody(&'a str),
    ForwardTarget(&'a Uri),
    ResponseLine(StatusCode),
    ResponseHeaders(&'a HeaderMap),
    ResponseBody { text: &'a LogText, complete: bool },
    Error { stage: &'a str, message: &'a str },
}

impl LogEvent<'_> {
    fn lines(&self) -> Vec<String> {
        match self {
            LogEvent::Startup(message) => vec![message.to_string()],
            LogEvent::RequestLine { method, uri } => vec![format!(">>> {} {}", method, uri)],
            LogEvent::RequestEncoding { inbound, outbound } => vec![
                format!(">>> Client encoding:  {}", inbound),
                format!(">>> Forward encoding: {}", outbound),
            ],
            LogEvent::RequestHeaders(headers) => header_lines(">>>", headers),
            LogEvent::RequestBody(body) => vec![format!(">>> Body: {}", body)],
            LogEvent::ForwardTarget(uri) => vec![format!(">>> Forward target: {}", uri)],
            LogEvent::ResponseLine(status) => vec![format!(
                "<<< {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string()],
            LogEvent::ResponseHeaders(headers) => header_lines("<<<", headers),
            LogEvent::ResponseBody { text, complete } => {
                let suffix = if *complete { "" } else { " [incomplete]" };
                let line = match text {
                    LogText::Plain(body) => format!("<<< Body{}: {}", suffix, body),
                    LogText::Decompressed(body) => {
                        format!("<<< Body (decompressed){}: {}", suffix, body)
                    }
                    LogText::Undecodable { encoding, len } => {
                        format!("<<< Body{}: <{} bytes, {} encoded>", suffix, len, encoding)
                    }
                };
                vec![line]
            }
            LogEvent::Error { stage, message } => {
                vec![format!("[ERROR] {} failed: {}", stage, message)]
            }
        }
    }
}

fn header_lines(prefix: &str, headers: &HeaderMap) -> Vec<String> {
    let mut lines = Vec::with_capacity(headers.keys_len() + 1);
    lines.push(format!("{} Headers:", prefix));
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        lines.push(format!("{} {}: {}", prefix, name, values.join(", ")));
    }
    lines
}

enum SinkMessage {
    Append(String),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Shared handle to the transaction log. Cheap to clone.
#[derive(Clone)]
pub struct TransactionLogger {
    tx: mpsc::UnboundedSender<SinkMessage>,
    path: Arc<PathBuf>,
}

impl TransactionLogger {
    /// Start the writer task appending to `path`. Must be called inside a tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = Arc::new(path.into());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start logging a new transaction under a fresh id
    pub fn transaction(&self) -> TransactionLog {
        let id = uuid::Uuid::new_v4().simple().to_string();
        TransactionLog {
            logger: self.clone(),
            id: id[..8].to_string(),
        }
    }

    pub fn record(&self, event: LogEvent<'_>) {
        self.append(None, &event);
    }

    /// Wait until everything recorded so far has been handed to the sink
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush and stop the writer task. Events recorded afterwards are dropped.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn append(&self, transaction: Option<&str>, event: &LogEvent<'_>) {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let mut chunk = String::new();
        for line in event.lines() {
            let line = match transaction {
                Some(id) => format!("[{}] {}", id, line),
                None => line,
            };
            info!(target: "relay::transaction", "{}", line);
            chunk.push_str(&format!("[{}] {}\n", timestamp, line));
        }
        // Fails only after close
        let _ = self.tx.send(SinkMessage::Append(chunk));
    }
}

/// Per-transaction view of the logger; prefixes every line with the transaction id
#[derive(Clone)]
pub struct TransactionLog {
    logger: TransactionLogger,
    id: String,
}

impl TransactionLog {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&self, event: LogEvent<'_>) {
        self.logger.append(Some(&self.id), &event);
    }
}

async fn write_loop(path: Arc<PathBuf>, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    let mut file: Option<tokio::fs::File> = None;
    let mut failing = false;

    while let Some(message) = rx.recv().await {
        let chunk = match message {
            SinkMessage::Append(chunk) => chunk,
            SinkMessage::Flush(done) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush().await;
                }
                let _ = done.send(());
                continue;
            }
            SinkMessage::Close(done) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush().await;
                }
                let _ = done.send(());
                break;
            }
        };

        if file.is_none() {
            match open_log(&path).await {
                Ok(f) => file = Some(f),
                Err(e) => {
                    if !failing {
                        warn!("Cannot open log file {}: {}", path.display(), e);
                        failing = true;
                    }
                    continue;
                }
            }
        }

        if let Some(f) = file.as_mut() {
            match f.write_all(chunk.as_bytes()).await {
                Ok(()) => failing = false,
                Err(e) => {
                    if !failing {
                        warn!("Cannot write log file {}: {}", path.display(), e);
                        failing = true;
                    }
                    // Reopen on the next line
                    file = None;
                }
            }
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}
