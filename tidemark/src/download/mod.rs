//! Sector download orchestrator.
//!
//! Downloads offline sectors by driving the external archive extraction
//! utility, one subprocess per source, strictly in order. A sector is
//! staged in a dot-prefixed directory and atomically renamed into place
//! only when every source extracted cleanly, so a published sector is
//! always complete. A single worker task owns the queue; cancellation
//! signals the live subprocess and wipes everything.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::coord::Sector;
use crate::source::SourceRegistry;

/// Name of the extraction utility expected on the search path.
pub const EXTRACT_UTILITY: &str = "pmtiles";

/// Size pairs on the utility's stderr, e.g. `12 MB / 340 MB`.
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9][0-9.,]*\s*[KMGTP]?i?B)\s*/\s*([0-9][0-9.,]*\s*[KMGTP]?i?B)").unwrap()
});

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid sector identifier: {0}")]
    Validation(String),

    #[error("sector path escapes the archive root")]
    Forbidden,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live progress of the current extraction.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub sector: String,
    pub source: String,
    pub bytes: String,
}

/// Status report for the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub active: bool,
    pub total: usize,
    pub done: usize,
    pub failed: Vec<String>,
    pub progress: Option<Progress>,
}

#[derive(Default)]
struct DownloadState {
    active: bool,
    queue: VecDeque<Sector>,
    done: Vec<Sector>,
    failed: Vec<Sector>,
    progress: Option<Progress>,
    /// Pid of the live extraction subprocess, for cancellation.
    current_pid: Option<u32>,
    /// 1-based index of the source being extracted, 0 when idle.
    current_source: usize,
    /// Bumped by cancel; a worker holding an older value exits.
    generation: u64,
}

enum SectorOutcome {
    Committed,
    Failed,
    Cancelled,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    sources: Arc<SourceRegistry>,
    utility: String,
    state: Mutex<DownloadState>,
}

impl DownloadManager {
    pub fn new(root: impl Into<PathBuf>, sources: Arc<SourceRegistry>) -> Self {
        Self::with_utility(root, sources, EXTRACT_UTILITY)
    }

    /// Test seam: run a different executable in place of the utility.
    pub fn with_utility(
        root: impl Into<PathBuf>,
        sources: Arc<SourceRegistry>,
        utility: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                sources,
                utility: utility.into(),
                state: Mutex::new(DownloadState::default()),
            }),
        }
    }

    /// Validates and appends sector identifiers, starting the worker when
    /// idle. All identifiers are validated before any is enqueued.
    pub fn enqueue(&self, ids: &str) -> Result<(), DownloadError> {
        let sectors = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|id| Sector::parse(id).map_err(|_| DownloadError::Validation(id.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if sectors.is_empty() {
            return Err(DownloadError::Validation(ids.to_string()));
        }

        let mut state = self.inner.state.lock().unwrap();
        for sector in sectors {
            if !state.queue.contains(&sector) {
                state.queue.push_back(sector);
            }
        }
        if !state.active {
            state.active = true;
            let generation = state.generation;
            drop(state);
            let manager = self.clone();
            tokio::spawn(async move { manager.worker(generation).await });
        }
        Ok(())
    }

    /// Terminates the live subprocess, drops the queue and resets the state.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(pid) = state.current_pid.take() {
            info!(pid, "terminating extraction subprocess");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        state.generation += 1;
        state.active = false;
        state.queue.clear();
        state.done.clear();
        state.failed.clear();
        state.progress = None;
        state.current_source = 0;
    }

    pub fn status(&self) -> DownloadStatus {
        let state = self.inner.state.lock().unwrap();
        let n = self.inner.sources.len();
        let settled = state.done.len() + state.failed.len();
        let total = (state.queue.len() + settled) * n;
        let done = if state.active {
            (settled * n + state.current_source).saturating_sub(1)
        } else {
            settled * n
        };
        DownloadStatus {
            active: state.active,
            total,
            done,
            failed: state.failed.iter().map(Sector::id).collect(),
            progress: state.progress.clone(),
        }
    }

    /// Lists published sector directories. In-progress (dot-prefixed)
    /// entries are invisible.
    pub async fn list_sectors(&self) -> Result<Vec<String>, DownloadError> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.inner.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes a published sector.
    pub async fn delete_sector(&self, id: &str) -> Result<(), DownloadError> {
        let sector =
            Sector::parse(id).map_err(|_| DownloadError::Validation(id.to_string()))?;
        let path = self.inner.root.join(sector.dirname());
        self.guard_inside_root(&path).await?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Rejects any path that resolves outside the archive root after
    /// following symlinks.
    async fn guard_inside_root(&self, path: &Path) -> Result<(), DownloadError> {
        let root = tokio::fs::canonicalize(&self.inner.root).await?;
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(resolved) => resolved,
            // Nothing there; nothing to escape with.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if resolved.starts_with(&root) {
            Ok(())
        } else {
            warn!(path = %path.display(), "rejected path outside archive root");
            Err(DownloadError::Forbidden)
        }
    }

    async fn worker(self, generation: u64) {
        loop {
            let sector = {
                let mut state = self.inner.state.lock().unwrap();
                if state.generation != generation {
                    return;
                }
                match state.queue.front() {
                    Some(sector) => *sector,
                    None => {
                        state.active = false;
                        return;
                    }
                }
            };

            let outcome = self.process_sector(sector, generation).await;

            let mut state = self.inner.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            state.progress = None;
            state.current_source = 0;
            state.current_pid = None;
            match outcome {
                SectorOutcome::Cancelled => return,
                SectorOutcome::Committed => {
                    state.queue.pop_front();
                    state.done.push(sector);
                }
                SectorOutcome::Failed => {
                    state.queue.pop_front();
                    state.failed.push(sector);
                }
            }
            if state.queue.is_empty() {
                state.active = false;
                return;
            }
        }
    }

    fn cancelled(&self, generation: u64) -> bool {
        self.inner.state.lock().unwrap().generation != generation
    }

    async fn process_sector(&self, sector: Sector, generation: u64) -> SectorOutcome {
        let staging = self.inner.root.join(format!(".{}", sector.dirname()));
        // A stale staging directory from a crashed run is replaced.
        let _ = tokio::fs::remove_dir_all(&staging).await;
        if let Err(err) = tokio::fs::create_dir_all(&staging).await {
            warn!(sector = %sector.id(), error = %err, "staging directory create failed");
            return SectorOutcome::Failed;
        }

        let bbox = sector.tile().bbox();
        let mut any_failed = false;

        for (index, source) in self.inner.sources.iter().enumerate() {
            if self.cancelled(generation) {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return SectorOutcome::Cancelled;
            }
            {
                let mut state = self.inner.state.lock().unwrap();
                state.current_source = index + 1;
            }

            match self.extract_source(sector, source, &staging, &bbox).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(sector = %sector.id(), source = source.name, "extraction failed");
                    any_failed = true;
                }
                Err(err) => {
                    warn!(sector = %sector.id(), source = source.name, error = %err,
                        "extraction spawn failed");
                    any_failed = true;
                }
            }
        }

        if self.cancelled(generation) {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return SectorOutcome::Cancelled;
        }

        if any_failed {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return SectorOutcome::Failed;
        }

        let target = self.inner.root.join(sector.dirname());
        let _ = tokio::fs::remove_dir_all(&target).await;
        match tokio::fs::rename(&staging, &target).await {
            Ok(()) => {
                info!(sector = %sector.id(), "sector committed");
                SectorOutcome::Committed
            }
            Err(err) => {
                warn!(sector = %sector.id(), error = %err, "sector commit failed");
                let _ = tokio::fs::remove_dir_all(&staging).await;
                SectorOutcome::Failed
            }
        }
    }

    /// Runs one extraction subprocess to completion, publishing progress
    /// parsed from its stderr. Returns `Ok(false)` on a non-zero exit.
    async fn extract_source(
        &self,
        sector: Sector,
        source: &crate::source::Source,
        staging: &Path,
        bbox: &crate::coord::Bbox,
    ) -> Result<bool, std::io::Error> {
        let out = staging.join(source.output);
        let mut child = Command::new(&self.inner.utility)
            .arg("extract")
            .arg(source.url)
            .arg(&out)
            .arg(format!(
                "--bbox={},{},{},{}",
                bbox.west, bbox.south, bbox.east, bbox.north
            ))
            .arg(format!("--maxzoom={}", source.maxzoom))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.current_pid = child.id();
        }

        if let Some(stderr) = child.stderr.take() {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(captures) = PROGRESS_RE.captures(&line) {
                    let bytes = format!("{} / {}", &captures[1], &captures[2]);
                    let mut state = self.inner.state.lock().unwrap();
                    state.progress = Some(Progress {
                        sector: sector.id(),
                        source: source.name.to_string(),
                        bytes,
                    });
                } else {
                    debug!(source = source.name, line, "extract");
                }
            }
        }

        let status = child.wait().await?;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.current_pid = None;
        }
        Ok(status.success())
    }
}

/// True when the extraction utility is on the search path and executable.
pub fn utility_available() -> bool {
    find_in_path(EXTRACT_UTILITY).is_some()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, utility: &str) -> DownloadManager {
        DownloadManager::with_utility(
            dir.path(),
            Arc::new(SourceRegistry::defaults()),
            utility,
        )
    }

    async fn wait_idle(manager: &DownloadManager) {
        for _ in 0..200 {
            if !manager.status().active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker did not settle");
    }

    #[test]
    fn enqueue_rejects_malformed_identifiers() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");
        // Invalid identifiers never reach the queue, so no worker spawns.
        for bad in ["6/34", "../../etc", "6/34/22/9", "x/y/z", ""] {
            assert!(
                matches!(manager.enqueue(bad), Err(DownloadError::Validation(_))),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn successful_run_commits_atomically() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");

        manager.enqueue("6/34/22").unwrap();
        wait_idle(&manager).await;

        let listed = manager.list_sectors().await.unwrap();
        assert_eq!(listed, vec!["6_34_22"]);
        assert!(!dir.path().join(".6_34_22").exists());

        let status = manager.status();
        assert!(!status.active);
        assert!(status.failed.is_empty());
        assert_eq!(status.done, 5);
        assert_eq!(status.total, 5);
    }

    #[tokio::test]
    async fn failed_source_marks_sector_failed() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "false");

        manager.enqueue("6/34/22").unwrap();
        wait_idle(&manager).await;

        assert!(manager.list_sectors().await.unwrap().is_empty());
        assert!(!dir.path().join(".6_34_22").exists(), "staging must be removed");

        let status = manager.status();
        assert_eq!(status.failed, vec!["6/34/22"]);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");
        manager.enqueue("6/34/22,6/34/22,6/34/23").unwrap();
        wait_idle(&manager).await;
        assert_eq!(manager.status().done, 10);
    }

    #[tokio::test]
    async fn deeper_zoom_reduces_to_sector() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");
        manager.enqueue("8/132/88").unwrap();
        wait_idle(&manager).await;
        assert_eq!(manager.list_sectors().await.unwrap(), vec!["6_33_22"]);
    }

    #[tokio::test]
    async fn cancel_resets_state_and_removes_staging() {
        use std::os::unix::fs::PermissionsExt;

        // A slow stand-in keeps the first sector in flight so the cancel
        // lands mid-extraction. `exec` puts the sleep in the signalled pid.
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow-extract.sh");
        tokio::fs::write(&script, "#!/bin/sh\nexec sleep 5\n")
            .await
            .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let manager = manager(&dir, script.to_str().unwrap());
        manager.enqueue("6/34/22,6/34/23").unwrap();

        let staging = dir.path().join(".6_34_22");
        for _ in 0..100 {
            if staging.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(staging.exists(), "first sector never started");

        manager.cancel();

        let status = manager.status();
        assert!(!status.active);
        assert_eq!(status.total, 0);
        assert_eq!(status.done, 0);
        assert!(status.progress.is_none());

        // The worker notices the cancel once the subprocess dies and must
        // clean up the in-progress directory.
        for _ in 0..300 {
            if !staging.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!staging.exists(), "staging directory must be removed");
        assert!(manager.list_sectors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_hides_in_progress_directories() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");
        tokio::fs::create_dir_all(dir.path().join("6_34_22")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join(".6_99_99")).await.unwrap();

        assert_eq!(manager.list_sectors().await.unwrap(), vec!["6_34_22"]);
    }

    #[tokio::test]
    async fn delete_validates_and_removes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, "true");
        tokio::fs::create_dir_all(dir.path().join("6_34_22")).await.unwrap();

        assert!(matches!(
            manager.delete_sector("../../etc").await,
            Err(DownloadError::Validation(_))
        ));

        manager.delete_sector("6/34/22").await.unwrap();
        assert!(!dir.path().join("6_34_22").exists());
    }

    #[tokio::test]
    async fn symlinked_sector_outside_root_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = dir.path().join("6_40_40");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let manager = manager(&dir, "true");
        assert!(matches!(
            manager.delete_sector("6/40/40").await,
            Err(DownloadError::Forbidden)
        ));
    }

    #[test]
    fn progress_regex_matches_size_pairs() {
        let captures = PROGRESS_RE.captures("downloading 12.5 MB / 340 MB").unwrap();
        assert_eq!(&captures[1], "12.5 MB");
        assert_eq!(&captures[2], "340 MB");
        assert!(PROGRESS_RE.captures("fetching directories").is_none());
    }

    #[tokio::test]
    async fn progress_is_published_from_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-extract.sh");
        tokio::fs::write(
            &script,
            "#!/bin/sh\necho '3 MB / 10 MB' >&2\nsleep 0.4\n",
        )
        .await
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let manager = manager(&dir, script.to_str().unwrap());
        manager.enqueue("6/34/22").unwrap();

        let mut saw_progress = false;
        for _ in 0..100 {
            if let Some(progress) = manager.status().progress {
                assert_eq!(progress.sector, "6/34/22");
                assert_eq!(progress.bytes, "3 MB / 10 MB");
                saw_progress = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_progress, "no progress observed");
        wait_idle(&manager).await;
    }
}
