//! Notification Log
//!
//! Remembers what was last sent for each aggregation group so unchanged
//! groups are only re-sent after their repeat interval.

use crate::alert::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// File name of the notification log snapshot inside the data directory
pub const NFLOG_FILE: &str = "notifications.json";

/// Minimum time an entry is kept after its last delivery
pub const NFLOG_RETENTION: chrono::Duration = chrono::Duration::hours(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub receiver: String,
    pub group_key: String,
    pub firing: BTreeSet<Fingerprint>,
    pub resolved: BTreeSet<Fingerprint>,
    pub notified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: HashMap<(String, String), NotificationEntry>,
    /// Total deliveries recorded by this log
    sent: u64,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot from `dir`; a missing file yields an empty log
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(NFLOG_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let entries: Vec<NotificationEntry> = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        info!("Loaded {} notification log entries", entries.len());

        Ok(Self {
            entries: entries
                .into_iter()
                .map(|e| ((e.receiver.clone(), e.group_key.clone()), e))
                .collect(),
            sent: 0,
        })
    }

    /// Write the snapshot to `dir`
    pub async fn snapshot(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(NFLOG_FILE);
        let tmp = dir.join(format!("{}.tmp", NFLOG_FILE));
        let entries: Vec<&NotificationEntry> = self.entries.values().collect();
        let data = serde_json::to_vec(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote {} notification log entries", entries.len());
        Ok(())
    }

    /// Whether a group with this content needs to be sent now
    pub fn needs_update(
        &self,
        receiver: &str,
        group_key: &str,
        firing: &BTreeSet<Fingerprint>,
        resolved: &BTreeSet<Fingerprint>,
        repeat_interval: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get(&(receiver.to_string(), group_key.to_string())) else {
            // Nothing sent yet: only worth sending if something fires.
            return !firing.is_empty();
        };

        if firing.is_empty() && resolved.is_empty() {
            return false;
        }
        // Newly firing alerts or newly resolved ones.
        if !firing.is_subset(&entry.firing) || !resolved.is_subset(&entry.resolved) {
            return true;
        }
        entry
            .notified_at
            .checked_add_signed(repeat_interval)
            .map_or(false, |due| due <= now)
    }

    pub fn record(&mut self, entry: NotificationEntry) {
        self.sent += 1;
        self.entries
            .insert((entry.receiver.clone(), entry.group_key.clone()), entry);
    }

    /// Drop entries last notified more than `retention` before `now`;
    /// returns how many were removed
    pub fn gc(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            e.notified_at
                .checked_add_signed(retention)
                .map_or(true, |expires| expires > now)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Garbage collected {} notification log entries", removed);
        }
        removed
    }

    pub fn get(&self, receiver: &str, group_key: &str) -> Option<&NotificationEntry> {
        self.entries.get(&(receiver.to_string(), group_key.to_string()))
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn set(fps: &[u64]) -> BTreeSet<Fingerprint> {
        fps.iter().copied().map(Fingerprint).collect()
    }

    fn entry(firing: &[u64], resolved: &[u64], at: DateTime<Utc>) -> NotificationEntry {
        NotificationEntry {
            receiver: "ops".into(),
            group_key: "root:{}".into(),
            firing: set(firing),
            resolved: set(resolved),
            notified_at: at,
        }
    }

    #[test]
    fn test_first_notification() {
        let log = NotificationLog::new();
        let now = Utc::now();
        let repeat = Duration::hours(4);
        assert!(log.needs_update("ops", "root:{}", &set(&[1]), &set(&[]), repeat, now));
        assert!(!log.needs_update("ops", "root:{}", &set(&[]), &set(&[1]), repeat, now));
    }

    #[test]
    fn test_repeat_interval() {
        let mut log = NotificationLog::new();
        let now = Utc::now();
        log.record(entry(&[1, 2], &[], now));
        let repeat = Duration::hours(4);

        assert!(!log.needs_update("ops", "root:{}", &set(&[1, 2]), &set(&[]), repeat, now));
        assert!(!log.needs_update("ops", "root:{}", &set(&[1]), &set(&[]), repeat, now));
        assert!(log.needs_update("ops", "root:{}", &set(&[1, 3]), &set(&[]), repeat, now));
        assert!(log.needs_update("ops", "root:{}", &set(&[1]), &set(&[2]), repeat, now));
        assert!(log.needs_update(
            "ops",
            "root:{}",
            &set(&[1, 2]),
            &set(&[]),
            Duration::hours(4),
            now + Duration::hours(4)
        ));
        assert_eq!(log.sent(), 1);
    }

    #[test]
    fn test_gc_drops_expired_entries() {
        let mut log = NotificationLog::new();
        let now = Utc::now();
        log.record(entry(&[1], &[], now - Duration::hours(10)));
        let mut recent = entry(&[2], &[], now - Duration::hours(1));
        recent.group_key = "root:{team=\"db\"}".into();
        log.record(recent);

        assert_eq!(log.gc(now, Duration::hours(5)), 1);
        assert!(log.get("ops", "root:{}").is_none());
        assert!(log.get("ops", "root:{team=\"db\"}").is_some());
        assert_eq!(log.gc(now, Duration::MAX), 0);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut log = NotificationLog::new();
        log.record(entry(&[7], &[], now));
        log.snapshot(dir.path()).await.unwrap();

        let loaded = NotificationLog::load(dir.path()).unwrap();
        assert_eq!(loaded.get("ops", "root:{}"), log.get("ops", "root:{}"));
        assert_eq!(loaded.sent(), 0);
    }
}
