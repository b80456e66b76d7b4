//! Table dumper stage
//!
//! Periodically snapshots a table file into an output directory. Each copy is
//! named `<stem>-<YYYYMMDDTHHMMSSZ>.<ext>` after the source file.

use crate::daemon::config::{StageKind, TableDumperSettings};
use crate::signal::ShutdownToken;
use crate::stages::Stage;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub struct TableDumper {
    name: String,
    source: PathBuf,
    output_dir: PathBuf,
    interval: Duration,
    dumps: u64,
}

impl TableDumper {
    /// Creates the output directory
    pub fn new(name: &str, settings: &TableDumperSettings) -> Result<Self> {
        if settings.interval_secs == 0 {
            anyhow::bail!("interval_secs must be positive");
        }
        fs::create_dir_all(&settings.output_dir)
            .with_context(|| format!("cannot create output directory {}", settings.output_dir.display()))?;

        Ok(Self {
            name: name.to_string(),
            source: settings.source.clone(),
            output_dir: settings.output_dir.clone(),
            interval: Duration::from_secs(settings.interval_secs),
            dumps: 0,
        })
    }

    fn snapshot_path(&self) -> PathBuf {
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let name = match self.source.extension() {
            Some(ext) => format!("{}-{}.{}", stem, stamp, ext.to_string_lossy()),
            None => format!("{}-{}", stem, stamp),
        };
        self.output_dir.join(name)
    }

    /// Copy the table once; a missing source is logged and skipped
    fn dump(&mut self) -> Result<()> {
        if !self.source.exists() {
            log::warn!("stage '{}': table {} not found, skipping", self.name, self.source.display());
            return Ok(());
        }

        let target = self.snapshot_path();
        let bytes = fs::copy(&self.source, &target)
            .with_context(|| format!("cannot copy {} to {}", self.source.display(), target.display()))?;
        self.dumps += 1;
        log::debug!("stage '{}' dumped {} bytes to {}", self.name, bytes, target.display());
        Ok(())
    }
}

impl Stage for TableDumper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::TableDumper
    }

    fn run(&mut self, stop: &ShutdownToken) -> Result<()> {
        log::info!(
            "stage '{}' dumping {} every {}s",
            self.name,
            self.source.display(),
            self.interval.as_secs()
        );

        loop {
            if let Err(e) = self.dump() {
                log::error!("stage '{}': {:#}", self.name, e);
            }
            if stop.sleep(self.interval) {
                break;
            }
        }

        log::info!("stage '{}' wrote {} snapshots", self.name, self.dumps);
        Ok(())
    }
}
