use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILENAME: &str = ".crossbuild.lock";

/// Exclusive lock on a build directory, held for a whole pipeline run.
///
/// Two runs against one build directory could otherwise both decide the same
/// missing object needs compiling and race on writing it.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    /// Try to take the lock without waiting.
    pub fn acquire(build_dir: &Path) -> Result<Self> {
        fs::create_dir_all(build_dir)
            .with_context(|| format!("creating build directory '{}'", build_dir.display()))?;
        let path = build_dir.join(LOCK_FILENAME);

        // Never unlink the lock file: a second process could then create a
        // fresh file at the same path and lock it independently.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(anyhow!(
                "build directory is locked by another crossbuild run: {}",
                path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._file);
    }
}
