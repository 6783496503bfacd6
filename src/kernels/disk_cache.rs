//! On-disk binary cache
//!
//! Binaries survive process restarts under `<dir>/<template>-<sha256>.bin`,
//! where the hash covers the fully rendered source. Writes land in a
//! temporary file first and are renamed into place, so readers never see a
//! partial binary.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::ForgeResult;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> ForgeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(DiskCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a rendered template
    pub fn key(template: &str, rendered: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(rendered.as_bytes());
        format!("{}-{:x}.bin", template, hasher.finalize())
    }

    pub fn path_for(&self, template: &str, rendered: &str) -> PathBuf {
        self.dir.join(Self::key(template, rendered))
    }

    pub fn load(&self, template: &str, rendered: &str) -> ForgeResult<Option<Vec<u8>>> {
        let path = self.path_for(template, rendered);
        match fs::read(&path) {
            Ok(bytes) => {
                tracing::debug!("Disk cache hit: {}", path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self, template: &str, rendered: &str, binary: &[u8]) -> ForgeResult<PathBuf> {
        let path = self.path_for(template, rendered);
        let temp = self.dir.join(format!(
            ".{}.{}-{}.tmp",
            Self::key(template, rendered),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(binary)?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        tracing::debug!("Stored {} bytes at {}", binary.len(), path.display());
        Ok(path)
    }
}
