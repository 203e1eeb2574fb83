use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Append-only scalar time series, written by the master process only.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

/// One JSON object per line, flushed every `flush_every` records and on close.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    flush_every: usize,
    pending: usize,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P, flush_every: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<ScalarRecord>> {
        let text = fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}

impl ScalarSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            log::warn!("scalar {tag} dropped: sink already closed");
            return Ok(());
        };

        let record = ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            writer.flush()?;
            self.pending = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ScalarSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
