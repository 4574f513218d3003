use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::definition::{
    DefinitionError, TunnelDefinition,
    codec::{self, DecodeOptions},
};

use super::SyncError;

const EXTENSION: &str = ".ini";
const SCRIPT_EXTENSION: &str = ".js";

/// The directory holding one file per pulled tunnel definition. A file's
/// modification time is the server's mtime of the version it holds.
#[derive(Debug, Clone)]
pub(crate) struct LocalCache {
    dir: PathBuf,
    decode_options: DecodeOptions,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>, decode_options: DecodeOptions) -> Self {
        LocalCache {
            dir: dir.into(),
            decode_options,
        }
    }
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    pub fn decode_options(&self) -> &DecodeOptions {
        &self.decode_options
    }
    pub async fn ensure(&self) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::io(e, &self.dir))
    }
    pub fn path_of(&self, file_name: &str) -> Result<PathBuf, SyncError> {
        check_file_name(file_name)?;
        Ok(self.dir.join(file_name))
    }
    /// mtime of a cached file in milliseconds, `None` when it is not cached
    pub async fn modified_ms(&self, file_name: &str) -> Result<Option<i64>, SyncError> {
        file_mtime_ms(&self.path_of(file_name)?).await
    }
    pub async fn write_entry(
        &self,
        file_name: &str,
        content: String,
        mtime_ms: i64,
    ) -> Result<(), SyncError> {
        let path = self.path_of(file_name)?;
        let modified = UNIX_EPOCH + Duration::from_millis(mtime_ms.max(0) as u64);
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::write(&target, content)?;
            let file = std::fs::File::options().write(true).open(&target)?;
            file.set_modified(modified)
        })
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
        .map_err(|e| SyncError::io(e, &path))
    }
    /// Turns a tunnel name into a file. Names with a path separator are taken
    /// as paths, bare names are looked up in the cache; `.ini` is appended when
    /// no extension is given.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, SyncError> {
        let mut path = if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(name)
        } else {
            self.dir.join(name)
        };
        if !name.ends_with(EXTENSION) && !name.ends_with(SCRIPT_EXTENSION) {
            let ini = with_suffix(&path, EXTENSION);
            let script = with_suffix(&path, SCRIPT_EXTENSION);
            if ini.exists() {
                path = ini;
            } else if script.exists() {
                path = script;
            }
        }
        if path.to_string_lossy().ends_with(SCRIPT_EXTENSION) {
            return Err(SyncError::UnsupportedFormat(path.display().to_string()));
        }
        if !path.is_file() {
            return Err(SyncError::NotFound(name.to_string()));
        }
        Ok(path)
    }
    pub async fn load(&self, name: &str) -> Result<TunnelDefinition, SyncError> {
        let path = self.resolve(name)?;
        tracing::debug!("loading {}", path.display());
        Ok(self.load_path(&path).await?)
    }
    pub async fn load_path(&self, path: &Path) -> Result<TunnelDefinition, DefinitionError> {
        let content = tokio::fs::read_to_string(path).await?;
        codec::decode_with(&tunnel_name(path), &content, &self.decode_options)
    }
    /// Every cached file by name, each with its decode result.
    pub async fn list(
        &self,
    ) -> Result<Vec<(String, Result<TunnelDefinition, DefinitionError>)>, SyncError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SyncError::io(e, &self.dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::io(e, &self.dir))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        let mut tunnels = Vec::with_capacity(names.len());
        for name in names {
            let loaded = self.load_path(&self.dir.join(&name)).await;
            tunnels.push((name, loaded));
        }
        Ok(tunnels)
    }
}

/// Base name of a tunnel file without its `.ini` extension.
pub(crate) fn tunnel_name(file: impl AsRef<Path>) -> String {
    let base = file
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match base.strip_suffix(EXTENSION) {
        Some(stripped) => stripped.to_string(),
        None => base,
    }
}

pub(crate) async fn file_mtime_ms(path: &Path) -> Result<Option<i64>, SyncError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            let modified = metadata.modified().map_err(|e| SyncError::io(e, path))?;
            Ok(Some(system_time_ms(modified)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(e, path)),
    }
}

fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Names come from the server and end up as file names in the cache.
fn check_file_name(name: &str) -> Result<(), SyncError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(SyncError::InvalidName(name.to_string()));
    }
    Ok(())
}
