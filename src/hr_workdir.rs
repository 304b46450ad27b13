// Per-run work directory, also the persistence base directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// A freshly created, empty directory owned by one run
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Delete whatever is at `path`, then create it empty
    pub fn prepare(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_if_present(&path)?;
        fs::create_dir_all(&path)?;
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unable to create {}", path.display()),
            ));
        }
        debug!("work directory {} ready", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory; a directory that is already gone is fine
    pub fn remove(self) -> io::Result<()> {
        remove_if_present(&self.path)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
