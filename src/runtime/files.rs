//! `watershed.lock` / `watershed.info` / `watershed.log` handling (§6
//! expansion). The lock file is an advisory exclusivity marker created with
//! `create_new`, not a kernel `flock` — good enough to catch "another
//! runtime already owns this directory" without an extra dependency.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::constants::{FILE_INFO, FILE_LOCK, FILE_LOG};
use crate::error::{Result, WatershedError};

/// Held for the lifetime of a running runtime daemon; the lock file is
/// removed when this is dropped.
pub struct RuntimeLock {
    path: PathBuf,
}

impl RuntimeLock {
    pub fn acquire(running_dir: &Path) -> Result<Self> {
        let path = running_dir.join(FILE_LOCK);
        let mut file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                WatershedError::FileOperation(format!(
                    "cannot acquire {path:?} (is a runtime already running here?): {e}"
                ))
            })?;
        write!(file, "{}", std::process::id()).map_err(|e| WatershedError::Io(e))?;
        Ok(RuntimeLock { path })
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Writes the runtime's advertised console port to `watershed.info`,
/// atomically (write to a temp file, then rename over the target) so a
/// concurrent reader never observes a partial write.
pub fn write_info_file(running_dir: &Path, console_port: &str) -> Result<()> {
    let target = running_dir.join(FILE_INFO);
    let tmp = running_dir.join(format!("{FILE_INFO}.tmp"));
    let mut file = File::create(&tmp).map_err(|e| {
        WatershedError::FileOperation(format!("cannot create {tmp:?}: {e}"))
    })?;
    writeln!(file, "{console_port}").map_err(|e| WatershedError::Io(e))?;
    file.sync_all().map_err(|e| WatershedError::Io(e))?;
    fs::rename(&tmp, &target)
        .map_err(|e| WatershedError::FileOperation(format!("cannot rename {tmp:?} -> {target:?}: {e}")))
}

/// Reads the console port a console client should dial, as written by
/// [`write_info_file`].
pub fn read_info_file(running_dir: &Path) -> Result<String> {
    let target = running_dir.join(FILE_INFO);
    let text = fs::read_to_string(&target)
        .map_err(|e| WatershedError::FileOperation(format!("cannot read {target:?}: {e}")))?;
    Ok(text.trim().to_string())
}

pub fn log_file_path(running_dir: &Path) -> PathBuf {
    running_dir.join(FILE_LOG)
}

/// Installs the process-wide `tracing` subscriber: a terminal layer plus a
/// file layer appending to `watershed.log`, via the usual
/// `tracing_subscriber::fmt` + `EnvFilter` setup.
pub fn init_logging(running_dir: &Path) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let log_file = File::options()
        .create(true)
        .append(true)
        .open(log_file_path(running_dir))
        .map_err(|e| WatershedError::FileOperation(format!("cannot open log file: {e}")))?;

    let file_layer = tracing_subscriber::fmt::layer().with_writer(log_file).with_ansi(false);
    let terminal_layer = tracing_subscriber::fmt::layer();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal_layer)
        .with(file_layer)
        .init();
    Ok(())
}
