use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podtail_types::ReadFrom;

use crate::handler::LineHandler;
use crate::state::StateRecorder;

/// Timing and start-position knobs for a tailer
#[derive(Clone, Debug)]
pub struct TailerOptions {
    /// How long to wait at end of file before looking for new bytes
    pub poll_interval: Duration,

    /// How often the read position is persisted
    pub checkpoint_interval: Duration,

    /// Start position for files without a recorded offset
    pub read_from: ReadFrom,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            checkpoint_interval: Duration::from_secs(1),
            read_from: ReadFrom::Beginning,
        }
    }
}

/// Follows a single file, passing each complete line to a handler
pub struct Tailer {
    path: PathBuf,
    state: Option<StateRecorder>,
    options: TailerOptions,

    /// Positioned file, until `run` moves it into the read loop
    follower: Option<FileFollower>,

    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Tailer {
    /// Open `path` and seek to its recorded offset.
    ///
    /// A store failure counts as "no offset". A recorded offset past the
    /// end of the file means the file was replaced while nobody was
    /// watching, so reading restarts at zero.
    pub async fn open(
        path: impl Into<PathBuf>,
        state: Option<StateRecorder>,
        options: TailerOptions,
    ) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;

        let recorded = state.as_ref().and_then(|state| match state.get(&path) {
            Ok(offset) => offset,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read recorded offset, starting fresh");
                None
            }
        });

        let offset = match recorded {
            Some(offset) if offset <= metadata.len() => offset,
            Some(offset) => {
                info!(path = %path.display(), offset, len = metadata.len(), "recorded offset is past end of file, starting over");
                0
            }
            None => match options.read_from {
                ReadFrom::Beginning => 0,
                ReadFrom::End => metadata.len(),
            },
        };

        let follower = FileFollower::new(file, &metadata, offset).await?;
        info!(path = %path.display(), offset, "tailing file");

        Ok(Self {
            path,
            state,
            options,
            follower: Some(follower),
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    /// Spawn the read loop. Only the first call has any effect.
    pub fn run(&mut self, handler: Box<dyn LineHandler>) {
        let Some(follower) = self.follower.take() else {
            return;
        };

        self.task = Some(tokio::spawn(follow(
            follower,
            handler,
            self.path.clone(),
            self.state.clone(),
            self.options.clone(),
            self.cancel.clone(),
        )));
    }

    /// Stop the read loop and wait for its final checkpoint
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(path = %self.path.display(), %error, "tailer task failed");
            }
        }
    }

    /// Forget this path's offset; used once the file is known to be gone
    pub fn clear(&self) {
        if let Some(state) = &self.state {
            if let Err(error) = state.delete(&self.path) {
                warn!(path = %self.path.display(), %error, "failed to delete recorded offset");
            }
        }
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow(
    mut follower: FileFollower,
    mut handler: Box<dyn LineHandler>,
    path: PathBuf,
    state: Option<StateRecorder>,
    options: TailerOptions,
    cancel: CancellationToken,
) {
    let mut checkpoint = tokio::time::interval(options.checkpoint_interval);
    checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(options.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut recorded = follower.offset;

    loop {
        if let Err(error) = follower.read_lines(handler.as_mut(), &cancel).await {
            warn!(path = %path.display(), %error, "error reading file");
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = checkpoint.tick() => {
                if follower.offset != recorded {
                    record(state.as_ref(), &path, follower.offset);
                    recorded = follower.offset;
                }
            }

            _ = poll.tick() => {
                if let Err(error) = follower.check_replaced(&path, handler.as_mut(), &cancel).await {
                    warn!(path = %path.display(), %error, "failed to reopen file");
                }
            }
        }
    }

    record(state.as_ref(), &path, follower.offset);
    info!(path = %path.display(), offset = follower.offset, "done tailing file");
}

fn record(state: Option<&StateRecorder>, path: &Path, offset: u64) {
    let Some(state) = state else {
        return;
    };
    if let Err(error) = state.record(path, offset) {
        warn!(path = %path.display(), offset, %error, "failed to record offset");
    }
}

/// Identity of the file behind a path, to notice rotation by replacement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

/// Read side of a tailer: an open file plus the offset of the last
/// delivered line. Bytes of an unterminated trailing line wait in
/// `pending` and are not counted in `offset`.
struct FileFollower {
    reader: BufReader<File>,
    id: Option<FileId>,
    offset: u64,
    pending: Vec<u8>,
}

impl FileFollower {
    async fn new(mut file: File, metadata: &Metadata, offset: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            reader: BufReader::new(file),
            id: FileId::of(metadata),
            offset,
            pending: Vec::new(),
        })
    }

    /// Deliver every complete line currently available
    async fn read_lines(
        &mut self,
        handler: &mut dyn LineHandler,
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        let mut delivered = 0;
        while !cancel.is_cancelled() {
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            if read == 0 || self.pending.last() != Some(&b'\n') {
                break;
            }

            let consumed = self.pending.len() as u64;
            let line = String::from_utf8_lossy(trim_line_ending(&self.pending));
            handler.handle(&line);

            self.offset += consumed;
            self.pending.clear();
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Reopen if the path now names a different file, rewind if it shrank.
    /// Lines still left in a replaced file are delivered before switching.
    async fn check_replaced(
        &mut self,
        path: &Path,
        handler: &mut dyn LineHandler,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            // gone for now; the path watcher decides when to give up
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        };

        if FileId::of(&metadata) != self.id {
            self.read_lines(handler, cancel).await?;
            if !self.pending.is_empty() {
                debug!(path = %path.display(), bytes = self.pending.len(), "dropping unterminated tail of replaced file");
            }

            debug!(path = %path.display(), "file replaced, reopening");
            let file = File::open(path).await?;
            let metadata = file.metadata().await?;
            *self = Self::new(file, &metadata, 0).await?;
            return Ok(());
        }

        // a copytruncate that grows back past `offset` within one poll is missed
        if metadata.len() < self.offset + self.pending.len() as u64 {
            debug!(path = %path.display(), len = metadata.len(), offset = self.offset, "file truncated, rewinding");
            self.reader.seek(SeekFrom::Start(0)).await?;
            self.offset = 0;
            self.pending.clear();
        }
        Ok(())
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
