//! Silences
//!
//! User-defined suppression windows, persisted as a JSON snapshot in the
//! instance's data directory.

use crate::alert::LabelSet;
use crate::matcher::{matches_all, Matcher};
use crate::AlertError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of the silence snapshot inside the data directory
pub const SILENCES_FILE: &str = "silences.json";

/// How long expired silences are kept before garbage collection
pub const SILENCE_RETENTION: Duration = Duration::hours(120);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    pub id: Uuid,
    pub matchers: Vec<Matcher>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub comment: String,
}

impl Silence {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct Silences {
    silences: Vec<Silence>,
}

impl Silences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot from `dir`; a missing file yields an empty set
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(SILENCES_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No silence snapshot at {}", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e),
        };

        let silences: Vec<Silence> = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        info!("Loaded {} silences from {}", silences.len(), path.display());
        Ok(Self { silences })
    }

    /// Write the snapshot to `dir`, replacing any previous one
    pub async fn snapshot(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(SILENCES_FILE);
        let tmp = dir.join(format!("{}.tmp", SILENCES_FILE));
        let data = serde_json::to_vec_pretty(&self.silences)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote {} silences to {}", self.silences.len(), path.display());
        Ok(())
    }

    /// Add a silence and return its id
    pub fn add(
        &mut self,
        matchers: Vec<Matcher>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<Uuid, AlertError> {
        if matchers.is_empty() {
            return Err(AlertError::InvalidSilence("at least one matcher required".to_string()));
        }
        if ends_at <= starts_at {
            return Err(AlertError::InvalidSilence("end time must be after start time".to_string()));
        }

        let id = Uuid::new_v4();
        self.silences.push(Silence {
            id,
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
        });
        info!("Silence {} added", id);
        Ok(id)
    }

    /// End a silence at `now`
    pub fn expire(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<(), AlertError> {
        let silence = self
            .silences
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;

        if silence.ends_at > now {
            silence.ends_at = now.max(silence.starts_at);
        }
        Ok(())
    }

    /// Add silences unknown to this set; for known ids the earlier end wins,
    /// so expirations carry over
    pub fn merge(&mut self, other: Silences) {
        for silence in other.silences {
            match self.silences.iter_mut().find(|s| s.id == silence.id) {
                Some(existing) => {
                    if silence.ends_at < existing.ends_at {
                        existing.ends_at = silence.ends_at;
                    }
                }
                None => self.silences.push(silence),
            }
        }
    }

    pub fn is_silenced(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        self.silences
            .iter()
            .any(|s| s.is_active(now) && matches_all(&s.matchers, labels))
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<&Silence> {
        self.silences.iter().filter(|s| s.is_active(now)).collect()
    }

    /// Drop silences that expired longer than the retention ago
    pub fn gc(&mut self, now: DateTime<Utc>) {
        let before = self.silences.len();
        self.silences.retain(|s| s.ends_at + SILENCE_RETENTION > now);
        let removed = before - self.silences.len();
        if removed > 0 {
            warn!("Garbage collected {} expired silences", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.silences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.silences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_silence_window() {
        let now = Utc::now();
        let mut silences = Silences::new();
        silences
            .add(
                vec!["alertname=Noisy".parse().unwrap()],
                now,
                now + Duration::hours(1),
                "ops",
                "maintenance",
            )
            .unwrap();

        assert!(silences.is_silenced(&labels(&[("alertname", "Noisy")]), now));
        assert_eq!(silences.active(now).len(), 1);
        assert!(!silences.is_silenced(&labels(&[("alertname", "Other")]), now));
        let later = now + Duration::hours(2);
        assert!(!silences.is_silenced(&labels(&[("alertname", "Noisy")]), later));
    }

    #[test]
    fn test_invalid_silences() {
        let now = Utc::now();
        let mut silences = Silences::new();
        assert!(silences.add(vec![], now, now + Duration::hours(1), "", "").is_err());
        assert!(silences
            .add(vec!["a=b".parse().unwrap()], now, now, "", "")
            .is_err());
    }

    #[test]
    fn test_expire_and_gc() {
        let now = Utc::now();
        let mut silences = Silences::new();
        let id = silences
            .add(
                vec!["a=b".parse().unwrap()],
                now - Duration::hours(1),
                now + Duration::hours(1),
                "",
                "",
            )
            .unwrap();

        silences.expire(id, now).unwrap();
        assert!(!silences.is_silenced(&labels(&[("a", "b")]), now));
        assert!(silences.expire(Uuid::new_v4(), now).is_err());

        silences.gc(now + SILENCE_RETENTION + Duration::seconds(1));
        assert!(silences.is_empty());
    }

    #[test]
    fn test_merge_adds_new_and_carries_expiry() {
        let now = Utc::now();
        let mut old = Silences::new();
        let shared = old
            .add(vec!["a=b".parse().unwrap()], now, now + Duration::hours(1), "", "")
            .unwrap();

        let mut new = old.clone();
        old.add(vec!["c=d".parse().unwrap()], now, now + Duration::hours(1), "", "")
            .unwrap();
        old.expire(shared, now).unwrap();

        new.merge(old);
        assert_eq!(new.len(), 2);
        assert!(!new.is_silenced(&labels(&[("a", "b")]), now));
        assert!(new.is_silenced(&labels(&[("c", "d")]), now));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        assert!(Silences::load(dir.path()).unwrap().is_empty());

        let mut silences = Silences::new();
        silences
            .add(
                vec!["team=~\"db|web\"".parse().unwrap()],
                now,
                now + Duration::hours(1),
                "ops",
                "",
            )
            .unwrap();
        silences.snapshot(dir.path()).await.unwrap();

        let loaded = Silences::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.is_silenced(&labels(&[("team", "web")]), now));
    }
}
