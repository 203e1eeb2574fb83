use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use env_logger::{Builder, Target};
use log::LevelFilter;

use crate::error::{Result, TrainError};

/// Writes every log line to stderr and to the run's log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the global logger. `RUST_LOG` still overrides `level`.
///
/// Returns the path of the text log created in `log_dir`.
pub fn init(log_dir: &Path, level: LevelFilter) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let log_path = log_dir.join(format!("train-{stamp}.log"));
    let file = File::create(&log_path)?;

    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                buf.timestamp(),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .map_err(|err| TrainError::Config(format!("logger already installed: {err}")))?;

    Ok(log_path)
}
