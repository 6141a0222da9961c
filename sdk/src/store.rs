//! Local attachment store layout: each attachment lives at a random
//! relative path below the store root, sharded by the first two characters
//! of its base64url name so no single directory grows unbounded.

use {
    crate::crypto::{Error, Result},
    base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine},
    rand::{rngs::OsRng, TryRngCore},
    std::{
        io::{self, BufWriter, Write},
        path::{Component, Path, PathBuf},
    },
    tracing::error,
};

/// Resolves relative attachment paths against the store's root directory.
pub struct AttachmentRoot {
    root: PathBuf,
}

impl AttachmentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a stored relative path below the root, rejecting anything that
    /// could escape it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        if path.is_absolute()
            || path
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(Error::Io(io::Error::other(format!(
                "invalid relative attachment path: {relative:?}"
            ))));
        }
        Ok(self.root.join(path))
    }

    /// Picks a fresh random relative path and returns it together with its
    /// absolute location. Nothing is created on disk yet.
    pub fn allocate(&self) -> Result<(String, PathBuf)> {
        let relative = generate_relative_path()?;
        let absolute = self.resolve(&relative)?;
        Ok((relative, absolute))
    }
}

pub fn generate_relative_path() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Io(io::Error::other(format!("OsRng error: {err:?}"))))?;
    let name = BASE64_URL_SAFE_NO_PAD.encode(bytes);
    Ok(format!("{}/{name}", &name[..2]))
}

/// Creates `path` (and its parent directory), hands the open file to `f`,
/// and removes the file again if `f` or the final flush fails. A file that
/// is already gone during cleanup is not an error; any other cleanup
/// failure is logged and the original error is re-raised.
pub(crate) fn with_unlink_on_error<T>(
    path: &Path,
    f: impl FnOnce(&mut BufWriter<fs_err::File>) -> Result<T>,
) -> Result<T> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let file = fs_err::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let result = (|| {
        let value = f(&mut writer)?;
        writer.flush()?;
        Ok(value)
    })();
    if result.is_err() {
        drop(writer);
        remove_file_quietly(path);
    }
    result
}

fn remove_file_quietly(path: &Path) {
    if let Err(err) = fs_err::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            error!(?err, "failed to remove partial attachment file");
        }
    }
}
