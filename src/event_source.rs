use std::future::Future;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader, Lines, SeekFrom,
};
use tokio::time::{sleep, Duration};

pub type LineFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Option<String>>> + Send + 'a>>;

/// Sequence of log lines, read by a single consumer. `None` marks the end of the source.
pub trait EventSource: Send {
    fn next_line(&mut self) -> LineFuture<'_>;
}

impl<R> EventSource for Lines<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn next_line(&mut self) -> LineFuture<'_> {
        Box::pin(Lines::next_line(self))
    }
}

/// Lines longer than this are dropped, kernel log lines are far shorter
const MAX_LINE_LEN: usize = 16 * 1024;

/// Follows a growing log file, starting at its current end.
///
/// Replacement of the file (log rotation) and truncation in place (copytruncate) make the
/// follower start over at the beginning of the new content.
pub struct LogFollower {
    path: PathBuf,
    reader: BufReader<File>,
    inode: u64,
    position: u64,
    pending: Vec<u8>,
    /// Set while the remainder of an overlong line is being skipped
    discarding: bool,
    /// Whether the last consumed byte was a newline
    at_line_end: bool,
    poll_interval: Duration,
}

impl LogFollower {
    pub async fn open(path: &Path, poll_interval: Duration) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let inode = file.metadata().await?.ino();
        let position = file.seek(SeekFrom::End(0)).await?;

        log::debug!("Following {} from offset {}", path.display(), position);

        let mut follower = Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            inode,
            position,
            pending: Vec::new(),
            discarding: false,
            at_line_end: true,
            poll_interval,
        };
        // The file may end in a line that is still being written
        follower.at_line_end = position == 0 || follower.continues_after_last_line().await?;
        Ok(follower)
    }

    /// Cancel safe: bytes are only consumed from the reader once they have been moved to `pending`
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            // Before reading fresh data, make sure the file still continues where the last line
            // ended. A file truncated and refilled beyond the old offset looks like plain growth
            // otherwise.
            if self.reader.buffer().is_empty()
                && self.at_line_end
                && self.position > 0
                && !self.continues_after_last_line().await?
            {
                log::info!("{} was truncated, following it from the start", self.path.display());
                self.reopen().await?;
                continue;
            }

            let available = self.reader.fill_buf().await?;

            if available.is_empty() {
                // A partial line stays pending until its newline is written
                self.reopen_if_rotated().await?;
                sleep(self.poll_interval).await;
                continue;
            }

            let (consumed, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(newline) => (newline + 1, true),
                None => (available.len(), false),
            };
            if !self.discarding {
                self.pending.extend_from_slice(&available[..consumed]);
            }
            self.reader.consume(consumed);
            self.position += consumed as u64;
            self.at_line_end = complete;

            if !complete {
                if self.pending.len() > MAX_LINE_LEN {
                    log::warn!(
                        "Skipping line of more than {} bytes in {}",
                        MAX_LINE_LEN,
                        self.path.display()
                    );
                    self.pending.clear();
                    self.discarding = true;
                }
                continue;
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let line = String::from_utf8_lossy(&self.pending)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            self.pending.clear();
            return Ok(Some(line));
        }
    }

    /// Checks that the byte before the read position still is the newline that ended the last line
    async fn continues_after_last_line(&self) -> io::Result<bool> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };

        // A replaced file is picked up once the old one has been read to its end
        if file.metadata().await?.ino() != self.inode {
            return Ok(true);
        }

        file.seek(SeekFrom::Start(self.position - 1)).await?;
        let mut last = [0u8; 1];
        match file.read_exact(&mut last).await {
            Ok(_) => Ok(last[0] == b'\n'),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn reopen_if_rotated(&mut self) -> io::Result<()> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // The file is about to be recreated
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if metadata.ino() == self.inode && metadata.len() >= self.position {
            return Ok(());
        }

        log::info!("{} was rotated, following the new file", self.path.display());
        self.reopen().await
    }

    async fn reopen(&mut self) -> io::Result<()> {
        let file = File::open(&self.path).await?;
        self.inode = file.metadata().await?.ino();
        self.reader = BufReader::new(file);
        self.position = 0;
        self.pending.clear();
        self.discarding = false;
        self.at_line_end = true;
        Ok(())
    }
}

impl EventSource for LogFollower {
    fn next_line(&mut self) -> LineFuture<'_> {
        Box::pin(self.read_line())
    }
}
