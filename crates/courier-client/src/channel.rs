//! Ephemeral command channels
//!
//! Every directory query and every file submission dials its own
//! connection, performs exactly one exchange and hangs up. Nothing here
//! touches the persistent session socket.

use courier_core::proto::{self, Framing};
use courier_core::transfer::send_file;
use courier_core::transport::with_timeout;
use courier_core::{
    sanitize_file_name, Dialer, Direction, Error, FileTransferDescriptor, FrameReader, PeerId,
    Result,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// Outcome of an acknowledged submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub transfer: FileTransferDescriptor,
    /// Free-text acknowledgment from the relay
    pub response: String,
}

pub struct CommandChannel<D> {
    dialer: Arc<D>,
    local: PeerId,
    framing: Framing,
    io_timeout: Option<Duration>,
}

impl<D> Clone for CommandChannel<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
            local: self.local.clone(),
            framing: self.framing,
            io_timeout: self.io_timeout,
        }
    }
}

impl<D: Dialer> CommandChannel<D> {
    pub fn new(dialer: Arc<D>, local: PeerId, framing: Framing, io_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            local,
            framing,
            io_timeout,
        }
    }

    /// Ask the relay who is online.
    ///
    /// An empty set means nobody else is connected; failing to reach the
    /// relay is an error instead.
    pub async fn list_peers(&self) -> Result<BTreeSet<PeerId>> {
        let stream = self.dialer.dial().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = BufWriter::new(write_half);
        let mut reader = FrameReader::new(read_half);

        let exchange = async {
            self.framing.write_str(&mut writer, proto::LIST_CLIENTS).await?;
            flush(&mut writer).await?;
            self.framing.read_str(&mut reader).await
        };
        let response = with_timeout(self.io_timeout, exchange).await?;
        tracing::debug!("Directory response: {:?}", response);

        let peers = proto::parse_peer_list(&response, &self.local);
        tracing::info!("{} peer(s) online", peers.len());
        Ok(peers)
    }

    /// Submit a prepared file to the relay and wait for its acknowledgment.
    ///
    /// Writes the submission tag, recipient, file name and declared size,
    /// then exactly `declared_size` bytes, then reads one response.
    pub async fn submit<F>(
        &self,
        source: &mut File,
        transfer: &FileTransferDescriptor,
        on_progress: F,
    ) -> Result<String>
    where
        F: FnMut(u8),
    {
        let stream = self.dialer.dial().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = BufWriter::new(write_half);
        let mut reader = FrameReader::new(read_half);

        tracing::info!(
            "Submitting {} ({} bytes) to {}",
            transfer.file_name,
            transfer.declared_size,
            transfer.peer
        );

        let header = async {
            self.framing.write_str(&mut writer, proto::START_FILE).await?;
            self.framing.write_str(&mut writer, &transfer.peer).await?;
            self.framing.write_str(&mut writer, &transfer.file_name).await?;
            self.framing.write_size(&mut writer, transfer.declared_size).await
        };
        with_timeout(self.io_timeout, header).await?;

        send_file(
            &mut writer,
            source,
            transfer.declared_size,
            self.io_timeout,
            on_progress,
        )
        .await?;

        let response = with_timeout(self.io_timeout, self.framing.read_str(&mut reader)).await?;
        tracing::info!("Relay acknowledged {}: {}", transfer.file_name, response);
        Ok(response)
    }

    /// Prepare and submit `source` in one go
    pub async fn submit_file<F>(
        &self,
        source: &Path,
        recipient: &PeerId,
        on_progress: F,
    ) -> Result<Submission>
    where
        F: FnMut(u8),
    {
        let (mut file, mut transfer) = prepare_submission(source, recipient).await?;
        transfer.start();
        match self.submit(&mut file, &transfer, on_progress).await {
            Ok(response) => {
                transfer.complete();
                Ok(Submission { transfer, response })
            }
            Err(e) => {
                transfer.fail();
                Err(e)
            }
        }
    }
}

/// Open `source` and describe it as an outbound transfer to `recipient`.
/// The declared size is the file's length at this moment.
pub async fn prepare_submission(
    source: &Path,
    recipient: &PeerId,
) -> Result<(File, FileTransferDescriptor)> {
    let file_name = source
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(sanitize_file_name)
        .ok_or_else(|| Error::Filesystem(format!("not a usable file name: {}", source.display())))?;

    let file = File::open(source)
        .await
        .map_err(|e| Error::filesystem(format!("open {}", source.display()), e))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|e| Error::filesystem(format!("stat {}", source.display()), e))?;
    if !metadata.is_file() {
        return Err(Error::Filesystem(format!("not a regular file: {}", source.display())));
    }

    let transfer = FileTransferDescriptor::new(
        file_name,
        metadata.len(),
        Direction::Outbound,
        recipient.as_str(),
    );
    Ok((file, transfer))
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer
        .flush()
        .await
        .map_err(|e| Error::connection("flush failed", e))
}
