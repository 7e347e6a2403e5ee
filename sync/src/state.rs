//! Externally observable synchronization states.
//!
//! Both state machines re-derive their label on every observable change; watchers only
//! hear about transitions that change the merged state (consecutive duplicates are
//! suppressed by the coordinator).

use std::fmt;

/// Download-direction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadSyncState {
    NotStarted,
    Backlog,
    SettingRemoteWatcher,
    Idle,
    InProgress,
    TemporaryError,
    PermanentError,
}

impl DownloadSyncState {
    /// Whether the download direction is quiescent: idle, waiting out a backoff, or
    /// permanently stopped.
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::TemporaryError | Self::PermanentError
        )
    }
}

impl fmt::Display for DownloadSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Backlog => "backlog",
            Self::SettingRemoteWatcher => "setting_remote_watcher",
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::TemporaryError => "temporary_error",
            Self::PermanentError => "permanent_error",
        };
        f.write_str(label)
    }
}

/// Upload-direction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSyncState {
    NotStarted,
    WaitRemoteDownload,
    Pending,
    InProgress,
    Idle,
    TemporaryError,
    PermanentError,
}

impl UploadSyncState {
    /// Whether the upload direction is quiescent. Everything except an in-flight batch
    /// counts: not yet enabled, holding for download or a merge, idle, backing off, or
    /// permanently stopped.
    pub fn is_paused(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for UploadSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::WaitRemoteDownload => "wait_remote_download",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Idle => "idle",
            Self::TemporaryError => "temporary_error",
            Self::PermanentError => "permanent_error",
        };
        f.write_str(label)
    }
}

/// The merged state exposed to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub download: DownloadSyncState,
    pub upload: UploadSyncState,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            download: DownloadSyncState::NotStarted,
            upload: UploadSyncState::NotStarted,
        }
    }

    /// Whether both directions are paused.
    pub fn is_paused(&self) -> bool {
        self.download.is_paused() && self.upload.is_paused()
    }

    /// Whether either direction hit an unrecoverable error.
    pub fn is_broken(&self) -> bool {
        self.download == DownloadSyncState::PermanentError
            || self.upload == UploadSyncState::PermanentError
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download={} upload={}", self.download, self.upload)
    }
}
