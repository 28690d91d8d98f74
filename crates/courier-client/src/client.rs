//! Client facade
//!
//! Ties the session, the command channels and the cipher together behind
//! one object a front end can drive. Long-running work is spawned as a
//! [`TaskHandle`] and reports back through [`ClientEvent`]s only.

use crate::channel::{prepare_submission, CommandChannel};
use crate::config::Config;
use crate::events::{next_task_id, ClientEvent, EventReceiver, Notifier, TaskId};
use crate::layout::{Folder, UserDirs};
use crate::session::Session;
use courier_core::{
    sanitize_file_name, AesGcmCipher, CipherOperation, CipherRequest, Dialer, Direction, Error,
    FileCipher, Framing, KeyLength, PeerId, Result, SessionState, TcpDialer,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Settings shared by every connection the client opens
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub username: PeerId,
    pub data_dir: PathBuf,
    pub framing: Framing,
    pub io_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn from_config(config: &Config, username: PeerId) -> Self {
        Self {
            username,
            data_dir: config.data_dir(),
            framing: config.server.framing,
            io_timeout: config.io_timeout(),
        }
    }
}

/// A cancellable unit of background work
pub struct TaskHandle {
    id: TaskId,
    handle: JoinHandle<()>,
    notifier: Notifier,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task. Any ephemeral socket it owns is closed when its
    /// future is dropped.
    pub fn cancel(&self) {
        if self.handle.is_finished() {
            return;
        }
        self.handle.abort();
        tracing::debug!("Task {} cancelled", self.id);
        self.notifier.emit(ClientEvent::TaskCancelled { task: self.id });
    }

    /// Wait for the task to end, whether it finished or was cancelled
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::warn!("Task {} panicked: {}", self.id, e);
            }
        }
    }
}

pub struct Client<D = TcpDialer, C = AesGcmCipher> {
    options: ClientOptions,
    dirs: UserDirs,
    dialer: Arc<D>,
    cipher: Arc<C>,
    notifier: Notifier,
    session: Option<Session>,
}

impl Client {
    /// Build a TCP client from configuration
    pub fn from_config(config: &Config, username: PeerId) -> (Self, EventReceiver) {
        let dialer = TcpDialer::new(config.server.address.clone(), config.connect_timeout());
        let cipher = AesGcmCipher::new(config.cipher.kdf);
        Self::new(ClientOptions::from_config(config, username), dialer, cipher)
    }
}

impl<D, C> Client<D, C>
where
    D: Dialer + 'static,
    C: FileCipher + 'static,
{
    /// Create a client and the receiving end of its event channel
    pub fn new(options: ClientOptions, dialer: D, cipher: C) -> (Self, EventReceiver) {
        let (notifier, events) = Notifier::channel();
        let dirs = UserDirs::new(&options.data_dir, &options.username);
        let client = Self {
            options,
            dirs,
            dialer: Arc::new(dialer),
            cipher: Arc::new(cipher),
            notifier,
            session: None,
        };
        (client, events)
    }

    pub fn username(&self) -> &PeerId {
        &self.options.username
    }

    pub fn dirs(&self) -> &UserDirs {
        &self.dirs
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Open the persistent session. A no-op while one is already running.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state() == SessionState::Authenticated {
            tracing::debug!("Already connected as {}", self.options.username);
            return Ok(());
        }
        // Reap a session that ended on its own
        self.disconnect().await;

        let session = Session::connect(
            self.dialer.as_ref(),
            self.options.username.clone(),
            self.dirs.clone(),
            self.options.io_timeout,
            self.notifier.clone(),
        )
        .await?;
        self.session = Some(session);
        Ok(())
    }

    /// Close the persistent session, if any. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Disconnected, Session::state)
    }

    /// Wait until the persistent session ends. Returns at once if there is
    /// none.
    pub async fn wait_closed(&self) {
        if let Some(session) = &self.session {
            session.wait_closed().await;
        }
    }

    /// A command channel bound to this client's relay and identity
    pub fn command_channel(&self) -> CommandChannel<D> {
        CommandChannel::new(
            Arc::clone(&self.dialer),
            self.options.username.clone(),
            self.options.framing,
            self.options.io_timeout,
        )
    }

    /// Query the relay directory, waiting for the answer
    pub async fn list_peers(&self) -> Result<BTreeSet<PeerId>> {
        self.command_channel().list_peers().await
    }

    /// Query the relay directory in the background. Reports
    /// [`ClientEvent::PeersListed`] or [`ClientEvent::TaskFailed`].
    pub fn spawn_list_peers(&self) -> TaskHandle {
        let channel = self.command_channel();
        self.spawn_task(move |task, notifier| async move {
            let peers = channel.list_peers().await?;
            notifier.emit(ClientEvent::PeersListed { task, peers });
            Ok(())
        })
    }

    /// Submit `source` to `recipient` as-is, in the background
    pub fn spawn_send_file(&self, source: PathBuf, recipient: PeerId) -> TaskHandle {
        let channel = self.command_channel();
        self.spawn_task(move |task, notifier| async move {
            submit_with_events(&channel, &notifier, task, &source, &recipient).await
        })
    }

    /// Encrypt `source` into `Encrypt/` and submit the encrypted copy to
    /// `recipient`, in the background
    pub fn spawn_send_encrypted(
        &self,
        source: PathBuf,
        recipient: PeerId,
        password: String,
        key_length: KeyLength,
    ) -> TaskHandle {
        let channel = self.command_channel();
        let cipher = Arc::clone(&self.cipher);
        let dirs = self.dirs.clone();
        self.spawn_task(move |task, notifier| async move {
            let encrypted =
                encrypt_into(cipher, &dirs, &source, password, key_length).await?;
            submit_with_events(&channel, &notifier, task, &encrypted, &recipient).await
        })
    }

    /// Encrypt `source` into `Encrypt/`, keeping its file name
    pub async fn encrypt_file(
        &self,
        source: &Path,
        password: String,
        key_length: KeyLength,
    ) -> Result<PathBuf> {
        encrypt_into(Arc::clone(&self.cipher), &self.dirs, source, password, key_length).await
    }

    /// Decrypt `Received/<file_name>` into `Decrypt/<file_name>`
    pub async fn decrypt_received(
        &self,
        file_name: &str,
        password: String,
        key_length: KeyLength,
    ) -> Result<PathBuf> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| Error::Filesystem(format!("not a usable file name: {:?}", file_name)))?;
        let source = self.dirs.received().join(&name);
        let dest = self.dirs.ensure(Folder::Decrypt).await?.join(&name);
        let request = CipherRequest {
            source,
            dest: dest.clone(),
            password,
            key_length,
            operation: CipherOperation::Decrypt,
        };
        run_cipher(Arc::clone(&self.cipher), request).await?;
        Ok(dest)
    }

    fn spawn_task<F, Fut>(&self, work: F) -> TaskHandle
    where
        F: FnOnce(TaskId, Notifier) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = next_task_id();
        let notifier = self.notifier.clone();
        let fut = work(id, notifier.clone());
        let reporter = notifier.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!("Task {} failed: {}", id, e);
                reporter.emit(ClientEvent::TaskFailed {
                    task: id,
                    reason: e.to_string(),
                });
            }
        });
        TaskHandle {
            id,
            handle,
            notifier,
        }
    }
}

async fn submit_with_events<D: Dialer>(
    channel: &CommandChannel<D>,
    notifier: &Notifier,
    task: TaskId,
    source: &Path,
    recipient: &PeerId,
) -> Result<()> {
    let (mut file, mut transfer) = prepare_submission(source, recipient).await?;
    notifier.emit(ClientEvent::TransferStarted(transfer.clone()));
    transfer.start();

    let file_name = transfer.file_name.clone();
    let outcome = channel
        .submit(&mut file, &transfer, |percent| {
            notifier.emit(ClientEvent::TransferProgress {
                file_name: file_name.clone(),
                direction: Direction::Outbound,
                percent,
            })
        })
        .await;

    match outcome {
        Ok(response) => {
            transfer.complete();
            notifier.emit(ClientEvent::SubmissionAcknowledged {
                task,
                transfer,
                response,
            });
            Ok(())
        }
        Err(e) => {
            transfer.fail();
            notifier.emit(ClientEvent::TransferFailed {
                transfer,
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}

async fn encrypt_into<C: FileCipher + 'static>(
    cipher: Arc<C>,
    dirs: &UserDirs,
    source: &Path,
    password: String,
    key_length: KeyLength,
) -> Result<PathBuf> {
    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(sanitize_file_name)
        .ok_or_else(|| Error::Filesystem(format!("not a usable file name: {}", source.display())))?;
    let dest = dirs.ensure(Folder::Encrypt).await?.join(name);
    let request = CipherRequest {
        source: source.to_path_buf(),
        dest: dest.clone(),
        password,
        key_length,
        operation: CipherOperation::Encrypt,
    };
    run_cipher(cipher, request).await?;
    Ok(dest)
}

/// Run a cipher request off the async workers
async fn run_cipher<C: FileCipher + 'static>(cipher: Arc<C>, request: CipherRequest) -> Result<()> {
    tracing::info!(
        "{:?} {} -> {} ({})",
        request.operation,
        request.source.display(),
        request.dest.display(),
        request.key_length
    );
    tokio::task::spawn_blocking(move || cipher.run(&request))
        .await
        .map_err(|e| Error::Filesystem(format!("cipher task failed: {}", e)))??;
    Ok(())
}
