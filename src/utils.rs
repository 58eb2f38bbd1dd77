use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One scalar sample in the run's time-series log.
#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    epoch: usize,
    value: f64,
}

/// Append-only JSONL sink for per-epoch scalars (losses, accuracies, lr).
pub struct ScalarLog {
    file: File,
    path: PathBuf,
}

impl ScalarLog {
    /// Create `scalars.jsonl` inside the run directory, creating the
    /// directory itself if needed.
    pub fn create(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let path = run_dir.join("scalars.jsonl");
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> Result<()> {
        let line = serde_json::to_string(&ScalarRecord { tag, epoch, value })?;
        writeln!(self.file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Timestamp suffix for run directories.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_log_appends_one_json_line_per_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ScalarLog::create(dir.path()).unwrap();

        log.add_scalar("train/natural_loss", 1.25, 0).unwrap();
        log.add_scalar("val/best_val", 0.5, 0).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["tag"], "train/natural_loss");
        assert_eq!(record["epoch"], 0);
        assert_eq!(record["value"], 1.25);
    }
}
