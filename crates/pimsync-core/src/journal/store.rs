//! File-backed journal of pending notifications

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::codec::{self, DecodedJournal, START_OFFSET_POSITION};
use crate::error::{Error, Result};
use crate::models::Notification;

/// Suffix appended to the settings file name to locate its journal.
pub const JOURNAL_SUFFIX: &str = "_changes.dat";

/// Journal file location for a settings file.
#[must_use]
pub fn journal_path_for(settings_path: &Path) -> PathBuf {
    let mut name = settings_path.as_os_str().to_os_string();
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// Result of loading a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedJournal {
    pub notifications: Vec<Notification>,
    /// The file should be rewritten in full before the next offset patch
    pub needs_full_save: bool,
}

/// Owns the journal file of one recorder.
///
/// Writes go through [`JournalStore::save`], which replaces the whole file,
/// or [`JournalStore::advance_start_offset`], which patches only the start
/// offset word in place.
#[derive(Debug, Clone)]
pub struct JournalStore {
    path: PathBuf,
    start_offset: u64,
}

impl JournalStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            start_offset: 0,
        }
    }

    /// Store for the journal that belongs to a settings file.
    #[must_use]
    pub fn for_settings(settings_path: &Path) -> Self {
        Self::new(journal_path_for(settings_path))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Start offset as last written or loaded.
    #[must_use]
    pub const fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Load pending notifications.
    ///
    /// Never fails: a missing or unreadable file, or one written by an
    /// unsupported format version, loads as empty with `needs_full_save` set.
    pub fn load(&mut self) -> LoadedJournal {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read journal {}: {}", self.path.display(), err);
                }
                self.start_offset = 0;
                return LoadedJournal {
                    notifications: Vec::new(),
                    needs_full_save: true,
                };
            }
        };

        match codec::decode_journal(&bytes) {
            Ok(decoded) => {
                let needs_full_save = decoded.needs_full_save();
                if decoded.header.version < codec::FormatVersion::CURRENT {
                    info!(
                        "Journal {} uses format version {}, it will be rewritten as {}",
                        self.path.display(),
                        decoded.header.version.number(),
                        codec::FormatVersion::CURRENT.number()
                    );
                }
                self.start_offset = decoded.header.start_offset;
                debug!(
                    "Loaded {} notifications from {} (start offset {})",
                    decoded.notifications.len(),
                    self.path.display(),
                    self.start_offset
                );
                LoadedJournal {
                    notifications: decoded.notifications,
                    needs_full_save,
                }
            }
            Err(err) => {
                warn!("Discarding journal {}: {}", self.path.display(), err);
                self.start_offset = 0;
                LoadedJournal {
                    notifications: Vec::new(),
                    needs_full_save: true,
                }
            }
        }
    }

    /// Replace the file with the given notifications and a zero start offset.
    pub fn save<'a, I>(&mut self, notifications: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Notification>,
        I::IntoIter: ExactSizeIterator,
    {
        let bytes = codec::encode_journal(notifications)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.start_offset = 0;
        debug!(
            "Saved journal {} ({} bytes)",
            self.path.display(),
            bytes.len()
        );
        Ok(())
    }

    /// Mark one more leading record as consumed, touching only the offset word.
    pub fn advance_start_offset(&mut self) -> Result<()> {
        let next = self.start_offset + 1;
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(START_OFFSET_POSITION))?;
        file.write_all(&next.to_be_bytes())?;
        file.flush()?;
        self.start_offset = next;
        debug!(
            "Advanced start offset of {} to {}",
            self.path.display(),
            next
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Header facts and recovery statistics of a journal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub version: u16,
    pub declared_count: u32,
    pub start_offset: u64,
    /// Notifications that would be replayed
    pub pending: usize,
    /// Records read but dropped on load
    pub discarded: usize,
    /// Decode error that ended the stream early
    pub truncated: Option<String>,
    pub needs_full_save: bool,
}

fn read_decoded(path: &Path) -> Result<(u64, DecodedJournal)> {
    let bytes = std::fs::read(path)?;
    let decoded = codec::decode_journal(&bytes)?;
    Ok((bytes.len() as u64, decoded))
}

/// Inspect a journal without taking ownership of it.
pub fn inspect_journal(path: &Path) -> Result<JournalInfo> {
    let (size_bytes, decoded) = read_decoded(path)?;
    Ok(JournalInfo {
        path: path.to_path_buf(),
        size_bytes,
        version: decoded.header.version.number(),
        declared_count: decoded.header.count,
        start_offset: decoded.header.start_offset,
        pending: decoded.notifications.len(),
        discarded: decoded.discarded,
        truncated: decoded.truncated.as_ref().map(ToString::to_string),
        needs_full_save: decoded.needs_full_save(),
    })
}

/// Read the pending notifications of a journal another process may be writing.
///
/// A partially written tail ends the stream instead of failing.
pub fn read_journal(path: &Path) -> Result<Vec<Notification>> {
    if !path.exists() {
        return Err(Error::InvalidInput(format!(
            "journal {} does not exist",
            path.display()
        )));
    }
    let (_, decoded) = read_decoded(path)?;
    Ok(decoded.notifications)
}
