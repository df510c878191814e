// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Background proxy process: PID file, start/stop/reload, and the run loop.
//!
//! The running daemon holds an exclusive lock on its PID file for its whole
//! lifetime, so a live lock is the authoritative "running" signal. `reload`
//! (SIGHUP) clears the route table and rebuilds it from `config.toml`.

use crate::ca::RootAuthority;
use crate::config::{Config, Paths};
use crate::error::{Error, Result};
use crate::proxy::ProxyServer;
use crate::routes::RouteTable;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Delay between lock retries
const LOCK_RETRY_DELAY_MS: u64 = 100;

/// Retries the child makes while the parent still holds the lock (~3 seconds).
const LOCK_HANDOFF_RETRIES: u32 = 30;

/// How long `stop` waits for a graceful exit before killing.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `start` waits before checking that the child survived startup.
const START_SETTLE: Duration = Duration::from_millis(500);

/// Holds an exclusive lock on the PID file.
/// The lock is released when this struct is dropped.
pub struct DaemonLock {
    file: File,
}

impl DaemonLock {
    /// Try to acquire the lock once. Fails if another daemon holds it.
    pub fn try_acquire(paths: &Paths) -> Result<Self> {
        Self::try_acquire_with_retries(paths, 0)
    }

    /// Try to acquire the lock with retries, covering the handoff from `start`.
    pub fn try_acquire_with_retries(paths: &Paths, max_retries: u32) -> Result<Self> {
        paths.ensure_dir()?;
        let pid_path = paths.pid_path();

        let mut attempts = 0;
        loop {
            // No truncate here: the holder's PID must survive a failed attempt.
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&pid_path)
                .map_err(|e| Error::from_io("Opening the daemon PID file", &pid_path, e, true))?;

            match file.try_lock_exclusive() {
                Ok(()) => return Ok(DaemonLock { file }),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if attempts >= max_retries {
                        return Err(Error::Daemon(
                            "Another daemon instance is already running".to_string(),
                        ));
                    }
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS));
                }
                Err(e) => {
                    return Err(Error::Daemon(format!(
                        "Failed to lock {}: {}",
                        pid_path.display(),
                        e
                    )));
                }
            }
        }
    }

    /// Replace the PID file contents with `pid`.
    pub fn write_pid(&mut self, pid: u32, paths: &Paths) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        let pid_path = paths.pid_path();
        let pid_content = format!("{}\n", pid);
        let write_err = |e| Error::WriteFile {
            path: pid_path.clone(),
            source: e,
        };

        self.file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        self.file
            .write_all(pid_content.as_bytes())
            .map_err(write_err)?;
        self.file
            .set_len(pid_content.len() as u64)
            .map_err(write_err)?;
        self.file.flush().map_err(write_err)?;

        Ok(())
    }
}

/// Check if the PID file is locked by another live holder
fn is_pid_file_locked(paths: &Paths) -> bool {
    let pid_path = paths.pid_path();
    match OpenOptions::new().read(true).write(true).open(&pid_path) {
        Ok(file) => file.try_lock_exclusive().is_err(),
        Err(_) => false,
    }
}

#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
}

/// Read the PID from the PID file
pub fn read_pid(paths: &Paths) -> Option<u32> {
    let mut contents = String::new();
    File::open(paths.pid_path())
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;

    contents.trim().parse().ok()
}

fn remove_pid(paths: &Paths) -> Result<()> {
    crate::fs::remove_if_exists(&paths.pid_path())
}

/// Check if a process with the given PID is running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // 0 and negative values address process groups, never a single daemon
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill(pid, 0) only checks process existence, no signal is sent
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| {
                let output = String::from_utf8_lossy(&o.stdout);
                // Whole-word match so 123 does not match 1234
                let pid_str = pid.to_string();
                output.split_whitespace().any(|word| word == pid_str)
            })
            .unwrap_or(false)
    }
}

pub fn status(paths: &Paths) -> DaemonStatus {
    let pid = read_pid(paths);
    let locked = is_pid_file_locked(paths);
    let running = locked || pid.map(is_process_running).unwrap_or(false);

    // Clean up a stale PID file, but only if we can prove nobody holds it.
    if !running && pid.is_some() {
        if let Ok(_lock) = DaemonLock::try_acquire(paths) {
            let _ = remove_pid(paths);
        }
    }

    DaemonStatus {
        running,
        pid: if running { pid } else { None },
        log_path: paths.log_path(),
    }
}

pub fn is_running(paths: &Paths) -> bool {
    status(paths).running
}

/// Launch the daemon in the background.
///
/// Returns the new PID, or `None` when a daemon was already running.
pub fn start(paths: &Paths) -> Result<Option<u32>> {
    // Held across the spawn so a concurrent start cannot sneak in
    let mut lock = match DaemonLock::try_acquire(paths) {
        Ok(lock) => lock,
        Err(_) if is_pid_file_locked(paths) => {
            info!(pid = ?read_pid(paths), "daemon already running");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let exe = std::env::current_exe()
        .map_err(|e| Error::Daemon(format!("Cannot find current executable: {}", e)))?;

    let mut child = spawn_daemon(&exe, paths)?;
    let pid = child.id();

    lock.write_pid(pid, paths)?;
    // The child takes over the lock with retries
    drop(lock);

    std::thread::sleep(START_SETTLE);
    if let Ok(Some(exit)) = child.try_wait() {
        return Err(Error::Daemon(format!(
            "Daemon exited during startup ({}). See {}",
            exit,
            paths.log_path().display()
        )));
    }

    info!(pid, log = %paths.log_path().display(), "daemon started");
    Ok(Some(pid))
}

fn open_log(paths: &Paths) -> Result<(File, File)> {
    let log_path = paths.log_path();
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| Error::from_io("Opening the daemon log", &log_path, e, true))?;
    let log_file_clone = log_file
        .try_clone()
        .map_err(|e| Error::from_io("Opening the daemon log", &log_path, e, true))?;
    Ok((log_file, log_file_clone))
}

#[cfg(unix)]
fn spawn_daemon(exe: &Path, paths: &Paths) -> Result<Child> {
    use std::os::unix::process::CommandExt;

    let (stdout, stderr) = open_log(paths)?;

    let mut cmd = Command::new(exe);
    cmd.arg("daemon")
        .env("BLAST_ROOT", &paths.base)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // SAFETY: pre_exec closure only calls setsid() which is async-signal-safe
    unsafe {
        cmd.pre_exec(|| {
            // New session: detach from the controlling terminal
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| Error::Daemon(format!("Failed to spawn daemon: {}", e)))
}

#[cfg(windows)]
fn spawn_daemon(exe: &Path, paths: &Paths) -> Result<Child> {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const DETACHED_PROCESS: u32 = 0x00000008;

    let (stdout, stderr) = open_log(paths)?;

    Command::new(exe)
        .arg("daemon")
        .env("BLAST_ROOT", &paths.base)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS)
        .spawn()
        .map_err(|e| Error::Daemon(format!("Failed to spawn daemon: {}", e)))
}

/// Stop the running daemon. Returns `false` when there was nothing to stop.
pub fn stop(paths: &Paths) -> Result<bool> {
    let Some(pid) = read_pid(paths) else {
        return Ok(false);
    };

    if !is_process_running(pid) {
        remove_pid(paths)?;
        return Ok(false);
    }

    terminate(pid);

    let start = Instant::now();
    while is_process_running(pid) {
        if start.elapsed() > STOP_TIMEOUT {
            warn!(pid, "daemon did not exit in time, killing it");
            kill(pid);
            break;
        }
        std::thread::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS));
    }

    remove_pid(paths)?;
    info!(pid, "daemon stopped");
    Ok(true)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: is_process_running validated pid as a positive i32; ESRCH is harmless
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill(pid: u32) {
    // SAFETY: as above
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn terminate(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

#[cfg(windows)]
fn kill(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output();
}

/// Ask the running daemon to reload its routes from `config.toml`.
pub fn reload(paths: &Paths) -> Result<()> {
    let pid = read_pid(paths)
        .filter(|pid| is_process_running(*pid))
        .ok_or_else(|| Error::Daemon("Daemon is not running".into()))?;

    #[cfg(unix)]
    {
        // SAFETY: pid was just confirmed to be a live positive PID
        if unsafe { libc::kill(pid as i32, libc::SIGHUP) } != 0 {
            return Err(Error::Daemon(format!(
                "Failed to signal daemon (PID: {}): {}",
                pid,
                std::io::Error::last_os_error()
            )));
        }
        info!(pid, "daemon reload requested");
        Ok(())
    }

    #[cfg(windows)]
    {
        Err(Error::Daemon(format!(
            "Live reload is not supported on Windows; restart the daemon (PID: {})",
            pid
        )))
    }
}

/// Replace every route with the mappings in `config`. Returns how many loaded.
///
/// A mapping that fails to issue is logged and skipped; the others still load.
pub fn load_routes(routes: &RouteTable, config: &Config) -> usize {
    let proxies = config.list_proxies();
    let failed = routes.replace_routes(
        proxies
            .iter()
            .map(|m| (m.full_domain.as_str(), m.local_port.as_str())),
    );

    for (domain, e) in &failed {
        error!(%domain, error = %e, "failed to load route");
    }
    proxies.len() - failed.len()
}

fn reload_from_disk(paths: &Paths, routes: &RouteTable) {
    match Config::load(&paths.config) {
        Ok(config) => {
            let loaded = load_routes(routes, &config);
            info!(routes = loaded, "configuration reloaded");
        }
        Err(e) => error!(error = %e, "reload failed, keeping current routes"),
    }
}

/// Run the proxy in the foreground until SIGTERM or SIGINT.
pub async fn run(paths: &Paths) -> Result<()> {
    let mut lock = DaemonLock::try_acquire_with_retries(paths, LOCK_HANDOFF_RETRIES)?;
    lock.write_pid(std::process::id(), paths)?;
    info!(pid = std::process::id(), "daemon starting");

    let result = serve(paths).await;

    drop(lock);
    remove_pid(paths)?;
    match &result {
        Ok(()) => info!("daemon stopped"),
        Err(e) => error!(error = %e, "daemon failed"),
    }
    result
}

async fn serve(paths: &Paths) -> Result<()> {
    let config = Config::load(&paths.config)?;
    let root = Arc::new(RootAuthority::ensure(paths)?);
    let routes = Arc::new(RouteTable::new(root));

    let loaded = load_routes(&routes, &config);
    info!(routes = loaded, "routes loaded");

    let handle = ProxyServer::new(Arc::clone(&routes), config.listen.socket_addr()?)
        .with_max_connections(config.listen.max_connections)
        .start()
        .await?;

    wait_for_shutdown(paths, &routes).await?;

    handle.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(paths: &Paths, routes: &RouteTable) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let install = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| Error::Daemon(format!("Failed to install {} handler: {}", name, e)))
    };
    let mut hangup = install(SignalKind::hangup(), "SIGHUP")?;
    let mut terminate = install(SignalKind::terminate(), "SIGTERM")?;
    let mut interrupt = install(SignalKind::interrupt(), "SIGINT")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading");
                reload_from_disk(paths, routes);
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return Ok(());
            }
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_paths: &Paths, _routes: &RouteTable) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Daemon(format!("Failed to wait for Ctrl+C: {}", e)))?;
    info!("Ctrl+C received, shutting down");
    Ok(())
}
