use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

use botvisor_process::BotId;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

use crate::config::AgentConfig;

const MAX_LINE_BYTES: usize = 4096;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[derive(Debug)]
struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }
}

/// Segment `n` of a rotating log file: 0 is the live file, 1 the newest
/// rotation, and so on.
fn segment_path(path: &Path, n: usize) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    PathBuf::from(format!("{}.{n}", path.display()))
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// On-disk copy of a bot's output. Once the live segment would pass `limit`
/// bytes every segment shifts up by one and the oldest past `keep` is lost.
struct RotatingLog {
    path: PathBuf,
    limit: u64,
    keep: usize,
    written: u64,
    file: tokio::fs::File,
}

impl RotatingLog {
    async fn open(path: PathBuf, limit: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let written = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
        let file = open_append(&path).await?;
        Ok(Self {
            path,
            limit,
            keep,
            written,
            file,
        })
    }

    async fn shift_segments(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        for n in (0..self.keep).rev() {
            let from = segment_path(&self.path, n);
            match tokio::fs::rename(&from, segment_path(&self.path, n + 1)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.limit > 0
            && self.written > 0
            && self.written.saturating_add(len) > self.limit
            && let Err(err) = self.shift_segments().await
        {
            tracing::debug!(path = %self.path.display(), %err, "log rotation failed");
        }
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf).await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

/// Write handle for one bot's captured output.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    pub async fn emit(&self, line: impl Into<String>) {
        let line = truncate_utf8(&line.into(), MAX_LINE_BYTES);
        self.buffer.lock().await.push_line(line.clone());
        let _ = self.file_tx.send(line);
    }
}

/// Per-bot log capture: a bounded in-memory tail plus a bounded on-disk copy.
#[derive(Clone)]
pub struct LogHub {
    config: Arc<AgentConfig>,
    sinks: Arc<Mutex<HashMap<BotId, LogSink>>>,
}

impl LogHub {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            config,
            sinks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn dir(&self, id: &BotId) -> PathBuf {
        self.config.logs_dir().join(&id.0)
    }

    pub fn log_path(&self, id: &BotId) -> PathBuf {
        self.dir(id).join("console.log")
    }

    pub async fn sink(&self, id: &BotId) -> LogSink {
        let mut sinks = self.sinks.lock().await;
        if let Some(s) = sinks.get(id) {
            return s.clone();
        }

        let (file_tx, mut file_rx) = mpsc::unbounded_channel::<String>();
        let path = self.log_path(id);
        let max_bytes = self.config.log_file_max_bytes;
        let max_files = self.config.log_file_max_files;
        tokio::spawn(async move {
            let mut disk = match RotatingLog::open(path.clone(), max_bytes, max_files).await {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "log file unavailable");
                    // Keep draining so the queue cannot grow without bound.
                    while file_rx.recv().await.is_some() {}
                    return;
                }
            };
            while let Some(line) = file_rx.recv().await {
                let _ = disk.append(&line).await;
            }
        });

        let sink = LogSink {
            buffer: Arc::new(Mutex::new(LogBuffer::new(self.config.log_max_lines))),
            file_tx,
        };
        sinks.insert(id.clone(), sink.clone());
        sink
    }

    pub async fn emit(&self, id: &BotId, line: impl Into<String>) {
        self.sink(id).await.emit(line).await;
    }

    /// Last `max_lines` captured lines, oldest first. Reads the on-disk copy
    /// when nothing is buffered in memory (e.g. after a supervisor restart).
    pub async fn tail(&self, id: &BotId, max_lines: usize) -> Vec<String> {
        if max_lines == 0 {
            return Vec::new();
        }
        let buffer = self.sinks.lock().await.get(id).map(|s| s.buffer.clone());
        if let Some(buffer) = buffer {
            return buffer.lock().await.tail(max_lines);
        }
        self.tail_from_disk(id, max_lines).await
    }

    async fn tail_from_disk(&self, id: &BotId, max_lines: usize) -> Vec<String> {
        let path = self.log_path(id);
        let mut out: VecDeque<String> = VecDeque::new();
        for segment in (0..=self.config.log_file_max_files).map(|n| segment_path(&path, n)) {
            if out.len() >= max_lines {
                break;
            }
            let Ok(raw) = tokio::fs::read(&segment).await else {
                continue;
            };
            let text = String::from_utf8_lossy(&raw);
            let lines: Vec<&str> = text.lines().collect();
            for line in lines.iter().rev() {
                if out.len() >= max_lines {
                    break;
                }
                out.push_front((*line).to_string());
            }
        }
        out.into_iter().collect()
    }

    /// Drops the buffer and deletes the on-disk copy.
    pub async fn remove(&self, id: &BotId) {
        self.sinks.lock().await.remove(id);
        let dir = self.dir(id);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %dir.display(), %err, "failed to remove bot logs");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn hub(root: &Path, max_lines: usize, max_bytes: u64) -> LogHub {
        LogHub::new(Arc::new(AgentConfig {
            data_root: root.to_path_buf(),
            log_max_lines: max_lines,
            log_file_max_bytes: max_bytes,
            log_file_max_files: 1,
            ..AgentConfig::default()
        }))
    }

    #[test]
    fn buffer_discards_oldest_lines() {
        let mut b = LogBuffer::new(3);
        for i in 0..5 {
            b.push_line(format!("line {i}"));
        }
        assert_eq!(b.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(b.tail(1), vec!["line 4"]);
    }

    #[test]
    fn long_lines_are_truncated_on_char_boundary() {
        let s = "é".repeat(MAX_LINE_BYTES);
        let t = truncate_utf8(&s, MAX_LINE_BYTES);
        assert!(t.len() <= MAX_LINE_BYTES);
        assert!(t.ends_with("…(truncated)"));
    }

    #[tokio::test]
    async fn tail_reads_memory_then_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let id = BotId::new();
        let logs = hub(tmp.path(), 100, 1024 * 1024);
        for i in 0..10 {
            logs.emit(&id, format!("out {i}")).await;
        }
        assert_eq!(logs.tail(&id, 2).await, vec!["out 8", "out 9"]);

        // Let the writer task flush, then read through a fresh hub.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let fresh = hub(tmp.path(), 100, 1024 * 1024);
        assert_eq!(fresh.tail(&id, 3).await, vec!["out 7", "out 8", "out 9"]);
    }

    #[tokio::test]
    async fn disk_copy_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let id = BotId::new();
        let logs = hub(tmp.path(), 100, 64);
        for i in 0..50 {
            logs.emit(&id, format!("line number {i:03}")).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let path = logs.log_path(&id);
        let current = std::fs::metadata(&path).unwrap().len();
        let rotated = std::fs::metadata(segment_path(&path, 1)).unwrap().len();
        assert!(current <= 64);
        assert!(rotated <= 64);
        assert!(!segment_path(&path, 2).exists());
    }

    #[tokio::test]
    async fn remove_drops_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let id = BotId::new();
        let logs = hub(tmp.path(), 100, 1024);
        logs.emit(&id, "hello").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        logs.remove(&id).await;
        assert!(logs.tail(&id, 10).await.is_empty());
        assert!(!logs.log_path(&id).exists());
    }
}
