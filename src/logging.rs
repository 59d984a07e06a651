//! Run logging: every record goes to stderr and to `logs/migration_<stamp>.log`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use env_logger::{Builder, Env, Target};

use crate::audit::LOG_DIR;

/// Duplicates every write to stderr and the run log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

pub fn run_log_path(work_dir: &Path) -> PathBuf {
    work_dir
        .join(LOG_DIR)
        .join(format!("migration_{}.log", Local::now().format("%Y%m%d_%H%M%S")))
}

/// Install the global logger. Defaults to `info`; `RUST_LOG` overrides.
/// Returns the run log path.
pub fn init(work_dir: &Path) -> io::Result<PathBuf> {
    let path = run_log_path(work_dir);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(&path)?;

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })));
    if builder.try_init().is_err() {
        log::debug!("Logger already installed; run log {} stays empty", path.display());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_log_lives_under_logs_with_a_timestamp() {
        let path = run_log_path(Path::new("/work"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(path.starts_with("/work/logs"));
        assert!(name.starts_with("migration_") && name.ends_with(".log"));
        assert_eq!(name.len(), "migration_20240101_120000.log".len());
    }
}
