//! Persistent relay session
//!
//! Logs in once, then a single listen task owns the read side of the
//! socket for the lifetime of the session: plain lines become log events,
//! `FILE:` announcements are streamed into the user's `Received/` folder.

use crate::events::{ClientEvent, Notifier};
use crate::layout::UserDirs;
use courier_core::proto::{self, ControlLine};
use courier_core::transfer::receive_file;
use courier_core::transport::with_timeout;
use courier_core::{
    sanitize_file_name, Dialer, Direction, Error, ErrorKind, FileTransferDescriptor, FrameReader,
    PeerId, Result, SessionState,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    username: PeerId,
    writer: BoxedWriter,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

impl Session {
    /// Dial the relay, send the login line and start listening.
    ///
    /// The relay sends no acknowledgment, so the session counts as
    /// authenticated as soon as the login line is flushed. `stall` bounds
    /// each payload read of an inbound file; idle control reads are never
    /// timed out.
    pub async fn connect<D: Dialer>(
        dialer: &D,
        username: PeerId,
        dirs: UserDirs,
        stall: Option<Duration>,
        notifier: Notifier,
    ) -> Result<Self> {
        tracing::debug!("Session state: {:?}", SessionState::Connecting);
        tracing::info!("Connecting to {} as {}", dialer.remote(), username);
        let stream = dialer.dial().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer: BoxedWriter = Box::new(write_half);

        let login = async {
            writer
                .write_all(proto::login_line(&username).as_bytes())
                .await
                .map_err(|e| Error::connection("login failed", e))?;
            writer
                .flush()
                .await
                .map_err(|e| Error::connection("login failed", e))
        };
        with_timeout(stall, login).await?;

        let (state_tx, state) = watch::channel(SessionState::Authenticated);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tracing::debug!("Session state: {:?}", SessionState::Authenticated);
        notifier.emit(ClientEvent::Connected {
            username: username.clone(),
        });

        let listen = ListenLoop {
            reader: FrameReader::new(read_half),
            dirs,
            relay: dialer.remote(),
            stall,
            notifier: notifier.clone(),
            active: None,
        };
        let listener = tokio::spawn(async move {
            let reason = listen.run(shutdown_rx).await;
            match &reason {
                Some(reason) => tracing::warn!("Session closed: {}", reason),
                None => tracing::info!("Session closed"),
            }
            state_tx.send_replace(SessionState::Closed);
            notifier.emit(ClientEvent::Disconnected { reason });
        });

        Ok(Self {
            username,
            writer,
            shutdown,
            state,
            listener: Some(listener),
            closed: false,
        })
    }

    pub fn username(&self) -> &PeerId {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        let finished = self
            .listener
            .as_ref()
            .map_or(true, |listener| listener.is_finished());
        if self.closed || finished {
            SessionState::Closed
        } else {
            *self.state.borrow()
        }
    }

    /// Wait until the listen task has ended
    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        // An error means the listen task is gone already
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Stop listening and close the socket. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!("Disconnecting {}", self.username);

        self.shutdown.send_replace(true);
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Socket shutdown failed: {}", e);
        }
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                if e.is_panic() {
                    tracing::warn!("Listen task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

struct ListenLoop<R> {
    reader: FrameReader<R>,
    dirs: UserDirs,
    relay: String,
    stall: Option<Duration>,
    notifier: Notifier,
    /// Inbound transfer currently streaming, if any
    active: Option<FileTransferDescriptor>,
}

impl<R: AsyncRead + Unpin> ListenLoop<R> {
    /// Returns `None` on an explicit disconnect, otherwise why the session
    /// ended.
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Option<String> {
        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break None,
                step = self.step() => match step {
                    Ok(true) => {}
                    Ok(false) => break Some("server closed the connection".to_string()),
                    Err(e) => break Some(e.to_string()),
                },
            }
        };

        // A receive interrupted by shutdown never reached its own failure path
        if let Some(mut transfer) = self.active.take() {
            transfer.fail();
            self.notifier.emit(ClientEvent::TransferFailed {
                transfer,
                reason: "session disconnected".to_string(),
            });
        }
        reason
    }

    /// Handle one control line. `Ok(false)` means the relay hung up.
    async fn step(&mut self) -> Result<bool> {
        let Some(line) = self.reader.read_line().await? else {
            return Ok(false);
        };
        tracing::info!("Server: {}", line);

        match ControlLine::parse(&line) {
            ControlLine::Log(text) => self.notifier.emit(ClientEvent::Log(text)),
            ControlLine::FileAnnounce { name } => self.receive(name).await?,
        }
        Ok(true)
    }

    /// Receive an announced file. Errors returned from here end the session;
    /// failures local to the transfer are reported and swallowed.
    async fn receive(&mut self, announced: String) -> Result<()> {
        let size_line = self.reader.read_line().await?;
        let declared = proto::parse_declared_size(size_line.as_deref())?;

        let safe_name = sanitize_file_name(&announced);
        let mut transfer = FileTransferDescriptor::new(
            safe_name.clone().unwrap_or_else(|| announced.clone()),
            declared,
            Direction::Inbound,
            self.relay.clone(),
        );
        self.notifier.emit(ClientEvent::TransferStarted(transfer.clone()));
        transfer.start();

        let Some(name) = safe_name else {
            self.reader.skip(declared, self.stall).await?;
            transfer.fail();
            let err = Error::Protocol(format!("unusable file name: {:?}", announced));
            tracing::warn!("{}", err);
            self.notifier.emit(ClientEvent::TransferFailed {
                transfer,
                reason: err.to_string(),
            });
            return Ok(());
        };

        let dest = self.dirs.received().join(&name);
        tracing::info!("Receiving {} ({} bytes) into {}", name, declared, dest.display());
        self.active = Some(transfer.clone());

        let notifier = self.notifier.clone();
        let outcome = receive_file(&mut self.reader, &dest, declared, self.stall, |percent| {
            notifier.emit(ClientEvent::TransferProgress {
                file_name: name.clone(),
                direction: Direction::Inbound,
                percent,
            })
        })
        .await;
        self.active = None;

        match outcome {
            Ok(_) => {
                transfer.complete();
                self.notifier.emit(ClientEvent::TransferCompleted {
                    transfer,
                    path: dest,
                });
                Ok(())
            }
            Err(e) => {
                transfer.fail();
                tracing::warn!("Receive of {} failed: {}", transfer.file_name, e);
                self.notifier.emit(ClientEvent::TransferFailed {
                    transfer,
                    reason: e.to_string(),
                });
                match e.kind() {
                    ErrorKind::Connection | ErrorKind::Protocol => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }
}
