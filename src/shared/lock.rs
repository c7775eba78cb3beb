use anyhow::{Context, Result, bail};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Single-instance guard: an exclusive OS lock on a file holding the owner's pid.
// Two recorders writing into the same directory would interleave files.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file failed: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            let owner = owner.trim();
            bail!(
                "another recorder already holds {} (pid {})",
                path.display(),
                if owner.is_empty() { "unknown" } else { owner }
            );
        }

        let record_owner = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()
        };
        record_owner(&mut file)
            .with_context(|| format!("writing lock file failed: {}", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recorder.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        let owner = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());

        let err = InstanceLock::acquire(&path).err().unwrap();
        assert!(err.to_string().contains("another recorder"));

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
