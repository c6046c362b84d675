use std::path::PathBuf;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::mpsc,
};

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
pub const DEFAULT_MAX_FILES: usize = 3;

/// Size-rotated append-only log file: `console.log`, `console.log.1`, ...
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl RotatingFile {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{n}", self.path.display()))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, self.rotated(i + 1)).await;
            }
        }
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, self.rotated(1)).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        // Flushed per line: the tail of the log is what explains a crashed
        // server, so it must reach the file before the next line arrives.
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(len);
        Ok(())
    }
}

/// Handle to a background writer task. Cloning is cheap; the task exits once
/// every handle and every attached stream is gone.
#[derive(Clone)]
pub struct ConsoleLog {
    tx: mpsc::UnboundedSender<String>,
}

impl ConsoleLog {
    pub fn spawn(path: PathBuf, max_bytes: u64, max_files: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut writer = match RotatingFile::open(path.clone(), max_bytes, max_files).await {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "console log unavailable");
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                let _ = writer.write_line(&line).await;
            }
            let _ = writer.file.flush().await;
        });
        Self { tx }
    }

    pub fn emit(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }

    /// Copies every line of `stream` into the log, tagged with `label`.
    pub fn attach<R>(&self, label: &'static str, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log.emit(format!("[{label}] {line}"));
            }
        });
    }
}
