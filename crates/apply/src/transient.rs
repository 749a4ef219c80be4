use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, warn};

const NAME_ATTEMPTS: usize = 16;

/// A manifest written to a uniquely named scratch file and removed when dropped,
/// whichever way the enclosing call exits.
#[derive(Debug)]
pub struct TransientManifest {
    path: PathBuf,
}

impl TransientManifest {
    /// Writes `content` to `<dir>/<prefix>-NNNNNN`. The file is created exclusively, so
    /// two concurrent calls never end up sharing one.
    pub fn create(dir: &Path, prefix: &str, content: &str) -> io::Result<Self> {
        let mut rng = rand::thread_rng();
        for _ in 0..NAME_ATTEMPTS {
            let path = dir.join(format!("{}-{:06}", prefix, rng.gen_range(0..1_000_000u32)));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Guard exists before the write so a failed write still cleans up.
                    let guard = Self { path };
                    file.write_all(content.as_bytes())?;
                    file.flush()?;
                    debug!(path = %guard.path.display(), bytes = content.len(), "transient manifest written");
                    return Ok(guard);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free {}-NNNNNN name in {}", prefix, dir.display()),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientManifest {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "transient manifest removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove transient manifest"),
        }
    }
}
