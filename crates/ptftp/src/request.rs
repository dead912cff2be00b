use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::delivery::ReliableStream;
use crate::endpoint::Endpoint;
use crate::error::{Result, TftpError};
use crate::options::{self, AckTimeout, BlockSize, FileSize};
use crate::packet::IndexedMessage;
use crate::server::SessionSettings;

/// A decoded request from the well-known port. Read requests are the only
/// kind this server accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read(ReadRequest),
}

impl Request {
    pub async fn open_file(&self, root: &Path) -> Result<File> {
        match self {
            Request::Read(request) => request.open_file(root).await,
        }
    }

    pub async fn execute(
        &self,
        endpoint: &mut Endpoint,
        file: File,
        settings: &SessionSettings,
    ) -> Result<TransferSummary> {
        match self {
            Request::Read(request) => request.execute(endpoint, file, settings).await,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Request::Read(request) => request.filename(),
        }
    }

    pub fn options(&self) -> &HashMap<String, String> {
        match self {
            Request::Read(request) => request.options(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Read(request) => fmt::Display::fmt(request, f),
        }
    }
}

/// RRQ: a filename relative to the client's root plus the options it asked
/// for, keyed by lowercased option name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    filename: String,
    options: HashMap<String, String>,
}

/// Outcome of a completed read transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes_sent: u64,
    pub blocks_sent: u64,
    pub block_size: usize,
    pub elapsed: Duration,
}

impl ReadRequest {
    pub fn new(filename: impl Into<String>, options: HashMap<String, String>) -> Self {
        Self {
            filename: filename.into(),
            options,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    /// Open the requested file under `root`.
    ///
    /// A leading `/` is ignored so absolute-looking names are still served
    /// from the root; `..` components are refused.
    pub async fn open_file(&self, root: &Path) -> Result<File> {
        let path = resolve_path(root, &self.filename)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{}: {} not exist", self, path.display());
                return Err(TftpError::file_not_found(format!(
                    "File '{}' not found",
                    self.filename
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!("{}: {} is not readable", self, path.display());
                return Err(TftpError::access_violation(format!(
                    "File '{}' is not readable",
                    self.filename
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(TftpError::access_violation(format!(
                "'{}' is not a regular file",
                self.filename
            )));
        }
        Ok(file)
    }

    /// Negotiate options (when any were requested) and send the file block
    /// by block, each one acknowledged before the next is sent.
    pub async fn execute(
        &self,
        endpoint: &mut Endpoint,
        file: File,
        settings: &SessionSettings,
    ) -> Result<TransferSummary> {
        info!("{}: Sending {} to {} ...", self, self.filename, endpoint);
        let started = Instant::now();

        let ack_timeout = AckTimeout::from_options(&self.options, settings.default_timeout);
        let block_size = BlockSize::from_options(&self.options)?;
        let file_len = if FileSize::is_requested_in(&self.options) {
            Some(file.metadata().await?.len())
        } else {
            None
        };
        let file_size = FileSize::from_options(&self.options, file_len);

        let mut stream = ReliableStream::new(endpoint, ack_timeout.value(), settings.retry_count);
        match options::gather([
            ack_timeout.requested(),
            block_size.requested(),
            file_size.requested(),
        ]) {
            None => debug!("{}: No options are requested", self),
            Some(options) => {
                let oack = IndexedMessage::OptionsAck { options };
                info!("{}: Acknowledge options: {}", self, oack);
                stream.send_acknowledged(&oack).await?;
            }
        }

        let block_size = block_size.value();
        let mut reader = BufReader::with_capacity(block_size.max(8192), file);
        let mut index: u16 = 1;
        let mut bytes_sent = 0u64;
        let mut blocks_sent = 0u64;
        loop {
            let chunk = read_chunk(&mut reader, block_size).await?;
            let last = chunk.len() < block_size;
            let chunk_len = chunk.len() as u64;
            stream
                .send_acknowledged(&IndexedMessage::Block {
                    index,
                    payload: chunk,
                })
                .await?;
            bytes_sent += chunk_len;
            blocks_sent += 1;
            if last {
                break;
            }
            // Wraps 65535 -> 0, not back to 1: tftpd-hpa and the GRUB2
            // client both count this way.
            index = index.wrapping_add(1);
        }

        let summary = TransferSummary {
            bytes_sent,
            blocks_sent,
            block_size,
            elapsed: started.elapsed(),
        };
        info!(
            "{}: Successfully sent {} to {}. Elapsed: {:.3} sec",
            self,
            self.filename,
            endpoint,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}

impl fmt::Display for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ReadRequest: {:?}>", self.filename)
    }
}

fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    let relative = Path::new(filename.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(TftpError::access_violation(format!(
            "Invalid filename '{}'",
            filename
        )));
    }
    Ok(root.join(relative))
}

/// Read up to `size` bytes; fewer only at end of file.
async fn read_chunk(reader: &mut BufReader<File>, size: usize) -> std::io::Result<Bytes> {
    let mut chunk = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut chunk).await?;
    Ok(Bytes::from(chunk))
}
