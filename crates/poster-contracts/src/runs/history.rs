use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub job_id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub output_path: String,
    pub aspect_ratio: String,
    pub resolution: String,
    pub output_format: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl HistoryEntry {
    pub fn now(job_id: impl Into<String>, output_path: &Path) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            job_id: job_id.into(),
            label: None,
            output_path: output_path.to_string_lossy().to_string(),
            aspect_ratio: String::new(),
            resolution: String::new(),
            output_format: String::new(),
            bytes: 0,
            sha256: None,
        }
    }
}

/// JSON array of the newest successful generations, oldest first.
#[derive(Debug, Clone)]
pub struct GenerationHistory {
    path: PathBuf,
    limit: usize,
    lock: Arc<Mutex<()>>,
}

impl GenerationHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limit(path, HISTORY_LIMIT)
    }

    pub fn with_limit(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// `<output_dir>/history/generation_history.json`
    pub fn in_output_dir(output_dir: &Path) -> Self {
        Self::new(
            output_dir
                .join("history")
                .join("generation_history.json"),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unreadable or corrupt files read as an empty history.
    pub fn load(&self) -> Vec<HistoryEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let mut entries = self.load();
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        entries.reverse();
        entries
    }

    pub fn append(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        let mut entries = self.load();
        entries.push(entry);
        let overflow = entries.len().saturating_sub(self.limit);
        entries.drain(..overflow);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{GenerationHistory, HistoryEntry};

    fn entry(job_id: &str) -> HistoryEntry {
        let mut entry = HistoryEntry::now(job_id, Path::new("/tmp/out.png"));
        entry.aspect_ratio = "3:4".to_string();
        entry.resolution = "2K".to_string();
        entry.output_format = "png".to_string();
        entry.bytes = 10;
        entry
    }

    #[test]
    fn append_creates_history_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::in_output_dir(temp.path());
        history.append(entry("t-1"))?;

        assert!(temp
            .path()
            .join("history")
            .join("generation_history.json")
            .exists());
        assert_eq!(history.load().len(), 1);
        assert_eq!(history.load()[0].job_id, "t-1");
        Ok(())
    }

    #[test]
    fn append_keeps_only_newest_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::with_limit(temp.path().join("h.json"), 3);
        for idx in 0..5 {
            history.append(entry(&format!("t-{idx}")))?;
        }

        let ids: Vec<String> = history.load().into_iter().map(|e| e.job_id).collect();
        assert_eq!(ids, vec!["t-2", "t-3", "t-4"]);
        Ok(())
    }

    #[test]
    fn corrupt_file_reads_as_empty_and_is_replaced() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("h.json");
        std::fs::write(&path, "{broken")?;
        let history = GenerationHistory::new(&path);
        assert!(history.load().is_empty());

        history.append(entry("t-9"))?;
        assert_eq!(history.load().len(), 1);
        Ok(())
    }

    #[test]
    fn recent_returns_newest_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::new(temp.path().join("h.json"));
        for idx in 0..4 {
            history.append(entry(&format!("t-{idx}")))?;
        }
        let ids: Vec<String> = history.recent(2).into_iter().map(|e| e.job_id).collect();
        assert_eq!(ids, vec!["t-3", "t-2"]);
        Ok(())
    }
}
