use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::{error::TrackError, report::LeakReport};

/// The leak report on disk. The file is emptied when the log is created and
/// written to once, by the shutdown sweep.
#[derive(Debug)]
pub struct LeakLog {
    path: PathBuf,
    file: File,
}

impl LeakLog {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, report: &LeakReport) -> Result<(), TrackError> {
        write!(self.file, "{report}")?;
        self.file.flush()?;
        Ok(())
    }
}
