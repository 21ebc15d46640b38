//! Durable "last processed" history position.
//!
//! # Responsibility
//! - Persist one `ChangeToken` per install in a namespaced directory outside
//!   the store's own files.
//!
//! # Invariants
//! - `store` replaces the file atomically: readers see the old or the new
//!   token, never a partial write.
//! - Every load failure means "no token" (replay from the start of history).
//! - A missing directory degrades the cursor; it never fails construction.

use crate::model::change::ChangeToken;
use log::{debug, error, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TOKEN_FILE_NAME: &str = "token.data";
const TOKEN_TMP_FILE_NAME: &str = "token.data.tmp";

#[derive(Debug)]
pub enum TokenIoError {
    /// The cursor directory could not be created.
    Unavailable { dir: PathBuf },
    Io { path: PathBuf, source: io::Error },
}

impl Display for TokenIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { dir } => {
                write!(f, "history cursor directory unavailable: {}", dir.display())
            }
            Self::Io { path, source } => {
                write!(f, "history cursor io failed at {}: {source}", path.display())
            }
        }
    }
}

impl Error for TokenIoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unavailable { .. } => None,
            Self::Io { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryCursorStore {
    dir: PathBuf,
    available: bool,
}

impl HistoryCursorStore {
    /// Uses `<app_support_dir>/<namespace>/token.data`, creating the
    /// directory on first use.
    pub fn new(app_support_dir: impl AsRef<Path>, namespace: &str) -> Self {
        let dir = app_support_dir.as_ref().join(namespace);
        let available = match fs::create_dir_all(&dir) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "event=cursor_dir_create module=sync status=error dir={} error={}",
                    dir.display(),
                    err
                );
                false
            }
        };
        Self { dir, available }
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE_NAME)
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn load(&self) -> Option<ChangeToken> {
        if !self.available {
            return None;
        }
        let path = self.token_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("event=cursor_load module=sync status=empty");
                return None;
            }
            Err(err) => {
                warn!(
                    "event=cursor_load module=sync status=error path={} error={}",
                    path.display(),
                    err
                );
                return None;
            }
        };
        match ChangeToken::from_bytes(&bytes) {
            Some(token) => {
                debug!(
                    "event=cursor_load module=sync status=ok sequence={}",
                    token.sequence()
                );
                Some(token)
            }
            None => {
                warn!(
                    "event=cursor_load module=sync status=corrupt path={} bytes={}",
                    path.display(),
                    bytes.len()
                );
                None
            }
        }
    }

    pub fn store(&self, token: ChangeToken) -> Result<(), TokenIoError> {
        if !self.available {
            return Err(TokenIoError::Unavailable {
                dir: self.dir.clone(),
            });
        }
        let path = self.token_path();
        write_atomically(&self.dir, &path, &token.to_bytes())?;
        debug!(
            "event=cursor_store module=sync status=ok sequence={}",
            token.sequence()
        );
        Ok(())
    }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), TokenIoError> {
    let tmp = dir.join(TOKEN_TMP_FILE_NAME);
    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err(path))?;

    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(io_err(dir))?;
    }
    Ok(())
}

fn io_err(at: &Path) -> impl FnOnce(io::Error) -> TokenIoError {
    let path = at.to_path_buf();
    move |source| TokenIoError::Io { path, source }
}
