//! Session state persistence.
//!
//! Each running session owns `<dir>/devstate.<pid>.json`. The legacy
//! `<dir>/devstate.json` is also written while it is free or owned by this
//! session. Files are replaced atomically, so a concurrent reader sees either
//! the previous or the new content.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::{ForwardedPort, Platform};
use crate::error::{Error, Result};

/// Default directory of state files, relative to the component directory.
pub const DEFAULT_STATE_DIR: &str = ".odo";

/// State file kept for tools reading a single well-known path.
pub const LEGACY_STATE_FILE: &str = "devstate.json";

fn session_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^devstate\.[0-9]+\.json$").expect("valid regex"))
}

fn any_state_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^devstate(\.[0-9]+)?\.json$").expect("valid regex"))
}

/// Content of a state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Seconds since the epoch of the last change to the forwarded ports.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,
}

/// Whether a process with this pid is alive.
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_exists(_pid: u32) -> bool {
    true
}

/// Reads a state file, treating empty or corrupt content as an empty state.
async fn read_state_file(path: &Path) -> Result<SessionState> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content).unwrap_or_else(|e| {
        debug!(path = %path.display(), error = %e, "ignoring unreadable state file");
        SessionState::default()
    }))
}

/// Lists state files of `dir` whose name matches `re`, sorted by name.
async fn list_state_files(dir: &Path, re: &Regex) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_str().is_some_and(|name| re.is_match(name)) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Persists the forwarded ports of one session.
pub struct StateStore {
    dir: PathBuf,
    pid: u32,
    platform: Platform,
    content: Mutex<SessionState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>, pid: u32, platform: Platform) -> Self {
        Self {
            dir: dir.into(),
            pid,
            platform,
            content: Mutex::new(SessionState {
                pid,
                platform: Some(platform),
                ..Default::default()
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store for the running process.
    pub fn for_current_process(dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self::new(dir, std::process::id(), platform)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Path of this session's state file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("devstate.{}.json", self.pid))
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_STATE_FILE)
    }

    /// Snapshot of the state as last written by this store.
    pub fn current(&self) -> SessionState {
        self.content.lock().clone()
    }

    /// Writes the session identity with no forwarded port.
    pub async fn init(&self) -> Result<()> {
        self.update(|c| {
            c.forwarded_ports.clear();
            c.timestamp = Utc::now().timestamp();
        })
        .await
    }

    /// Replaces the forwarded ports, keeping the other fields.
    pub async fn set_forwarded_ports(&self, ports: Vec<ForwardedPort>) -> Result<()> {
        debug!(count = ports.len(), "saving forwarded ports");
        self.update(|c| {
            c.forwarded_ports = ports;
            c.timestamp = Utc::now().timestamp();
        })
        .await
    }

    /// Records a clean exit: no port is forwarded anymore, the file stays.
    pub async fn save_exit(&self) -> Result<()> {
        self.update(|c| c.forwarded_ports.clear()).await
    }

    async fn update(&self, apply: impl FnOnce(&mut SessionState)) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut content = self.content.lock();
            apply(&mut *content);
            content.pid = self.pid;
            content.platform = Some(self.platform);
            content.clone()
        };
        self.save(&snapshot).await
    }

    async fn save(&self, content: &SessionState) -> Result<()> {
        self.check_first_in_platform().await?;
        fs::create_dir_all(&self.dir).await?;
        if self.is_legacy_free_or_owned().await? {
            self.write_file(&self.legacy_path(), content).await?;
        }
        self.write_file(&self.path(), content).await
    }

    async fn write_file(&self, path: &Path, content: &SessionState) -> Result<()> {
        let mut json = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut json, formatter);
        content.serialize(&mut serializer)?;

        let temp_path = self.dir.join(format!(".devstate.{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        trace!(path = %path.display(), "state file written");
        Ok(())
    }

    async fn is_legacy_free_or_owned(&self) -> Result<bool> {
        let saved = match read_state_file(&self.legacy_path()).await {
            Ok(saved) => saved,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };
        Ok(saved.pid == 0 || saved.pid == self.pid || !pid_exists(saved.pid))
    }

    /// Fails when another live session already runs on this platform.
    async fn check_first_in_platform(&self) -> Result<()> {
        for path in list_state_files(&self.dir, session_file_regex()).await? {
            let content = read_state_file(&path).await?;
            if content.platform != Some(self.platform) || content.pid == self.pid {
                continue;
            }
            if pid_exists(content.pid) {
                return Err(Error::AlreadyRunning {
                    platform: self.platform.to_string(),
                    pid: content.pid,
                });
            }
        }
        Ok(())
    }

    /// Reads back this session's state file.
    pub async fn read(&self) -> Result<SessionState> {
        read_state_file(&self.path()).await
    }

    /// Forwarded ports of the live sessions on `platform`, or on every platform.
    pub async fn get_forwarded_ports(&self, platform: Option<Platform>) -> Result<Vec<ForwardedPort>> {
        get_forwarded_ports(&self.dir, platform, self.pid).await
    }

    /// State files left behind by sessions whose process is gone.
    pub async fn orphan_files(&self) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for path in list_state_files(&self.dir, any_state_file_regex()).await? {
            let content = read_state_file(&path).await?;
            if content.pid == 0 || content.pid == self.pid || pid_exists(content.pid) {
                continue;
            }
            debug!(pid = content.pid, path = %path.display(), "orphan state file");
            let full = fs::canonicalize(&path).await.unwrap_or(path);
            orphans.push(full);
        }
        Ok(orphans)
    }
}

/// Forwarded ports recorded in `dir` by live sessions.
///
/// `own_pid` is always considered alive. Files of dead sessions are skipped.
pub async fn get_forwarded_ports(
    dir: &Path,
    platform: Option<Platform>,
    own_pid: u32,
) -> Result<Vec<ForwardedPort>> {
    let platforms: Vec<Platform> = match platform {
        Some(p) => vec![p],
        None => Platform::ALL.to_vec(),
    };

    let mut sessions = Vec::new();
    for path in list_state_files(dir, session_file_regex()).await? {
        let content = read_state_file(&path).await?;
        if content.pid != own_pid && !pid_exists(content.pid) {
            trace!(pid = content.pid, "skipping state of finished session");
            continue;
        }
        sessions.push(content);
    }

    let mut result = Vec::new();
    for platform in platforms {
        for content in sessions.iter().filter(|c| c.platform == Some(platform)) {
            result.extend(content.forwarded_ports.iter().cloned());
        }
    }
    Ok(result)
}
