use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::{Mutex, mpsc},
};

const LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILE_KEEP: usize = 3;
const FILE_TAIL_MAX_BYTES: u64 = 512 * 1024;

/// Bounded, sequence-numbered console lines of one instance.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Lines after `cursor`, oldest first, and the cursor to pass next time.
    /// `cursor == 0` returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Fan-out of console lines to the ring buffer and the rotating file.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(buffer: Arc<Mutex<LogBuffer>>, file_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { buffer, file_tx }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    /// Supervisor-originated line.
    pub async fn event(&self, msg: impl AsRef<str>) {
        self.emit(format!("[hive] {}", msg.as_ref())).await;
    }
}

/// Size-based rotation: the live file rolls to `.1`, older generations
/// shift up by one and whatever would land past `keep` is dropped.
#[derive(Debug, Clone, Copy)]
struct Rotation {
    max_bytes: u64,
    keep: usize,
}

fn generation(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn missing_ok(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn roll(path: &Path, keep: usize) -> io::Result<()> {
    missing_ok(tokio::fs::remove_file(generation(path, keep)).await)?;
    for n in (1..keep).rev() {
        missing_ok(tokio::fs::rename(generation(path, n), generation(path, n + 1)).await)?;
    }
    missing_ok(tokio::fs::rename(path, generation(path, 1)).await)
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// On-disk half of a [`LogSink`]: `logs/console.log` plus its rotations.
struct ConsoleFile {
    path: PathBuf,
    rotation: Rotation,
    written: u64,
    out: BufWriter<tokio::fs::File>,
}

impl ConsoleFile {
    async fn open(path: PathBuf, rotation: Rotation) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            rotation,
            written,
            out: BufWriter::new(file),
        })
    }

    /// Append a batch of lines and flush once.
    async fn append(&mut self, lines: &[String]) -> io::Result<()> {
        for line in lines {
            let len = line.len() as u64 + 1;
            if self.written > 0 && self.written + len > self.rotation.max_bytes {
                self.out.flush().await?;
                roll(&self.path, self.rotation.keep).await?;
                self.out = BufWriter::new(open_append(&self.path).await?);
                self.written = 0;
            }
            self.out.write_all(line.as_bytes()).await?;
            self.out.write_all(b"\n").await?;
            self.written += len;
        }
        self.out.flush().await
    }
}

/// Starts the background writer for `path`. Returns `None` if the file cannot
/// be opened; the instance then logs to memory only.
pub async fn spawn_file_writer(path: PathBuf) -> Option<mpsc::UnboundedSender<String>> {
    let rotation = Rotation {
        max_bytes: LOG_FILE_MAX_BYTES,
        keep: LOG_FILE_KEEP,
    };
    let mut file = match ConsoleFile::open(path.clone(), rotation).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "console log file unavailable");
            return None;
        }
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(line) = rx.try_recv() {
                batch.push(line);
            }
            if let Err(e) = file.append(&batch).await {
                tracing::warn!(path = %file.path.display(), error = %e, "console log write failed");
                break;
            }
        }
    });
    Some(tx)
}

#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
    pub source: &'static str,
}

/// Last `limit` lines of a console file, reading at most the final 512 KiB.
pub async fn tail_file(path: &Path, limit: usize) -> io::Result<Vec<String>> {
    use tokio::io::AsyncSeekExt;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    let skip_partial = len > FILE_TAIL_MAX_BYTES;
    if skip_partial {
        file.seek(io::SeekFrom::Start(len - FILE_TAIL_MAX_BYTES))
            .await?;
    }

    let mut lines = BufReader::new(file).lines();
    let mut out = VecDeque::new();
    let mut first = true;
    while let Some(line) = lines.next_line().await? {
        if first && skip_partial {
            first = false;
            continue;
        }
        first = false;
        out.push_back(line);
        if out.len() > limit {
            out.pop_front();
        }
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_after_follows_cursor() {
        let mut b = LogBuffer::new(3);
        for i in 1..=5 {
            b.push_line(format!("l{i}"));
        }
        let (lines, cursor) = b.tail_after(0, 10);
        assert_eq!(lines, vec!["l3", "l4", "l5"]);
        assert_eq!(cursor, 5);

        b.push_line("l6".to_string());
        let (lines, cursor) = b.tail_after(cursor, 10);
        assert_eq!(lines, vec!["l6"]);
        assert_eq!(cursor, 6);

        let (lines, cursor) = b.tail_after(cursor, 10);
        assert!(lines.is_empty());
        assert_eq!(cursor, 6);
    }

    #[tokio::test]
    async fn console_file_rolls_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let rotation = Rotation {
            max_bytes: 16,
            keep: 2,
        };
        let mut f = ConsoleFile::open(path.clone(), rotation).await.unwrap();
        let lines: Vec<String> = (0..6).map(|i| format!("line-{i}")).collect();
        f.append(&lines).await.unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "line-4\nline-5\n");
        assert_eq!(read(generation(&path, 1)), "line-2\nline-3\n");
        assert_eq!(read(generation(&path, 2)), "line-0\nline-1\n");

        f.append(&["line-6".to_string()]).await.unwrap();
        assert_eq!(read(generation(&path, 2)), "line-2\nline-3\n");
        assert!(!generation(&path, 3).exists());
    }

    #[tokio::test]
    async fn tail_file_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        tokio::fs::write(&path, "a\nb\nc\nd\n").await.unwrap();
        assert_eq!(tail_file(&path, 2).await.unwrap(), vec!["c", "d"]);
        assert!(
            tail_file(&dir.path().join("missing.log"), 5)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
