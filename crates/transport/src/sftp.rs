//! SFTP-over-SSH transport.
//!
//! libssh2 sessions are blocking, so each remote write runs on a blocking
//! task fed by the async copy engine through an in-memory duplex pipe.
//! Live sessions are pooled per host and leased exclusively; a session
//! that fails in use is dropped rather than returned.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ssh2::{KeyboardInteractivePrompt, KnownHostFileKind, OpenFlags, OpenType, Prompt, Session};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use fastcopy_core::{SftpTarget, TransferError};
use transfer::{CopyContext, ProgressFn, SEGMENT_SIZE, copy_stream};

use crate::TransportConfig;

/// Idle sessions retained per host endpoint.
const MAX_POOLED_PER_HOST: usize = 10;

/// Key files probed under `~/.ssh` when none is configured, modern
/// algorithms first.
const DISCOVERED_KEYS: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Per-host pool of authenticated SSH sessions.
///
/// All methods are called from blocking tasks; the map lock is only held
/// for pool bookkeeping, never across network I/O.
pub struct SftpPool {
    config: TransportConfig,
    idle: Mutex<HashMap<String, Vec<Session>>>,
}

impl std::fmt::Debug for SftpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpPool").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SftpPool {
    /// Creates an empty pool with the given transport configuration.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config, idle: Mutex::new(HashMap::new()) }
    }

    /// Leases a live session for `target`, reconnecting when the pool has
    /// none.
    fn lease(&self, target: &SftpTarget) -> Result<Session, TransferError> {
        let key = pool_key(target);
        loop {
            let pooled = self
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&key)
                .and_then(Vec::pop);
            let Some(session) = pooled else { break };
            if session.keepalive_send().is_ok() {
                debug!(endpoint = %target.endpoint(), "reusing pooled ssh session");
                return Ok(session);
            }
            // Dead session; drop it and try the next one.
        }
        self.connect(target)
    }

    /// Returns a session to the pool, keeping at most
    /// [`MAX_POOLED_PER_HOST`] per endpoint.
    fn release(&self, target: &SftpTarget, session: Session) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = idle.entry(pool_key(target)).or_default();
        if slot.len() < MAX_POOLED_PER_HOST {
            slot.push(session);
        }
    }

    fn connect(&self, target: &SftpTarget) -> Result<Session, TransferError> {
        let address = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|error| {
                TransferError::network(format!("cannot resolve {}: {error}", target.endpoint()))
            })?
            .next()
            .ok_or_else(|| {
                TransferError::network(format!("no address for {}", target.endpoint()))
            })?;

        let tcp = TcpStream::connect_timeout(&address, self.config.operation_timeout)
            .map_err(|error| {
                TransferError::network(format!("connect to {} failed: {error}", target.endpoint()))
            })?;

        let mut session = Session::new().map_err(ssh_error)?;
        session.set_timeout(self.config.operation_timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_error)?;

        self.verify_host_key(&session, target)?;
        authenticate(&session, target, self.config.ssh_key_file.as_deref())?;
        debug!(endpoint = %target.endpoint(), "established ssh session");
        Ok(session)
    }

    /// Checks the server key against `~/.ssh/known_hosts`.
    ///
    /// With verification off every host key is trusted, which is the test
    /// mode the configuration knob exists for.
    fn verify_host_key(&self, session: &Session, target: &SftpTarget) -> Result<(), TransferError> {
        if !self.config.verify_host_keys {
            return Ok(());
        }

        let mut known_hosts = session.known_hosts().map_err(ssh_error)?;
        if let Some(path) = known_hosts_path() {
            if path.exists() {
                known_hosts.read_file(&path, KnownHostFileKind::OpenSSH).map_err(ssh_error)?;
            }
        }

        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| TransferError::auth("server presented no host key"))?;
        match known_hosts.check_port(&target.host, target.port, key) {
            ssh2::CheckResult::Match => Ok(()),
            ssh2::CheckResult::NotFound => Err(TransferError::auth(format!(
                "host key for {} not in known_hosts",
                target.endpoint()
            ))),
            ssh2::CheckResult::Mismatch => Err(TransferError::auth(format!(
                "host key mismatch for {}",
                target.endpoint()
            ))),
            ssh2::CheckResult::Failure => Err(TransferError::auth(format!(
                "host key check failed for {}",
                target.endpoint()
            ))),
        }
    }
}

fn pool_key(target: &SftpTarget) -> String {
    format!("{}@{}", target.user.as_deref().unwrap_or_default(), target.endpoint())
}

fn known_hosts_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
}

fn ssh_error(error: ssh2::Error) -> TransferError {
    TransferError::network(format!("ssh: {error}"))
}

struct PasswordPrompter {
    password: String,
}

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Runs the authentication ladder: explicit key file, discovered keys
/// (modern algorithms first), password, keyboard-interactive, agent,
/// empty password.
fn authenticate(
    session: &Session,
    target: &SftpTarget,
    key_file: Option<&Path>,
) -> Result<(), TransferError> {
    let user = target
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());

    if let Some(key) = key_file {
        if session.userauth_pubkey_file(&user, None, key, None).is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
        warn!(key = %key.display(), "configured ssh key was rejected");
    }

    if let Some(home) = std::env::var_os("HOME") {
        let ssh_dir = PathBuf::from(home).join(".ssh");
        for name in DISCOVERED_KEYS {
            let key = ssh_dir.join(name);
            if key.exists()
                && session.userauth_pubkey_file(&user, None, &key, None).is_ok()
                && session.authenticated()
            {
                return Ok(());
            }
        }
    }

    if let Some(password) = &target.password {
        if session.userauth_password(&user, password).is_ok() && session.authenticated() {
            return Ok(());
        }
        let mut prompter = PasswordPrompter { password: password.clone() };
        if session.userauth_keyboard_interactive(&user, &mut prompter).is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
    }

    if let Ok(mut agent) = session.agent() {
        if agent.connect().is_ok() && agent.list_identities().is_ok() {
            for identity in agent.identities().into_iter().flatten() {
                if agent.userauth(&user, &identity).is_ok() && session.authenticated() {
                    return Ok(());
                }
            }
        }
    }

    if session.userauth_password(&user, "").is_ok() && session.authenticated() {
        return Ok(());
    }

    Err(TransferError::auth(format!(
        "all authentication methods rejected for {user}@{}",
        target.endpoint()
    )))
}

/// SFTP transport bound to one parsed `ssh://` destination.
#[derive(Debug, Clone)]
pub struct SftpTransport {
    target: SftpTarget,
    pool: Arc<SftpPool>,
}

impl SftpTransport {
    pub(crate) fn new(target: SftpTarget, pool: Arc<SftpPool>) -> Self {
        Self { target, pool }
    }

    /// Streams `source` into the remote path.
    ///
    /// The copy engine runs on the async side of a duplex pipe and keeps
    /// ownership of pacing and progress; the blocking side drains the pipe
    /// into the remote file.
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        ctx: &CopyContext,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (remote_reader, mut pipe) = tokio::io::duplex(4 * SEGMENT_SIZE);

        let pool = Arc::clone(&self.pool);
        let target = self.target.clone();
        let writer =
            tokio::task::spawn_blocking(move || write_remote(&pool, &target, remote_reader));

        let copy_result = copy_stream(source, &mut pipe, size, ctx, on_progress).await;
        let _ = pipe.shutdown().await;
        drop(pipe);

        let remote_result = writer.await.map_err(|error| {
            TransferError::remote(format!("sftp writer task failed: {error}"))
        })?;

        match (copy_result, remote_result) {
            (Ok(total), Ok(_)) => Ok(total),
            // Cancellation wins so a cancelled job is never dead-lettered.
            (Err(error @ TransferError::Cancelled), _) => Err(error),
            (_, Err(remote_error)) => Err(remote_error),
            (Err(copy_error), Ok(_)) => Err(copy_error),
        }
    }
}

/// Blocking half: lease a session, prepare remote directories, and drain
/// the pipe into the remote file.
fn write_remote(
    pool: &SftpPool,
    target: &SftpTarget,
    reader: DuplexStream,
) -> Result<u64, TransferError> {
    let mut reader = SyncIoBridge::new(reader);
    let session = pool.lease(target)?;
    match write_remote_file(&session, target, &mut reader) {
        Ok(copied) => {
            pool.release(target, session);
            Ok(copied)
        }
        // The session may be mid-operation; drop it instead of pooling.
        Err(error) => Err(error),
    }
}

fn write_remote_file(
    session: &Session,
    target: &SftpTarget,
    reader: &mut impl Read,
) -> Result<u64, TransferError> {
    let sftp = session.sftp().map_err(ssh_error)?;
    let path = Path::new(&target.path);

    if let Some(parent) = path.parent() {
        ensure_remote_dirs(&sftp, parent)?;
    }

    let mut remote = sftp
        .open_mode(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(ssh_error)?;
    let copied = std::io::copy(reader, &mut remote)?;
    let _ = remote.fsync();
    Ok(copied)
}

/// Creates each missing component of `dir`, tolerating races with other
/// workers targeting the same host.
fn ensure_remote_dirs(sftp: &ssh2::Sftp, dir: &Path) -> Result<(), TransferError> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        if sftp.stat(&current).is_ok() {
            continue;
        }
        if let Err(error) = sftp.mkdir(&current, 0o755) {
            if sftp.stat(&current).is_err() {
                return Err(ssh_error(error));
            }
        }
    }
    Ok(())
}
