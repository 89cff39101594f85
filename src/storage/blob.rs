use crate::errors::{store_err, EngineResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Side directory for ciphertext too large to keep inline in a row.
/// File names derive from the message id, so a message owns at most one blob.
pub(crate) struct BlobDir {
    root: PathBuf,
}

impl BlobDir {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn file_name(message_id: &str) -> String {
        format!("{}.bin", URL_SAFE_NO_PAD.encode(message_id))
    }

    /// Writes the ciphertext and returns the stored file name.
    pub(crate) fn write(&self, message_id: &str, ciphertext: &str) -> EngineResult<String> {
        std::fs::create_dir_all(&self.root).map_err(store_err("creating blob directory"))?;
        let name = Self::file_name(message_id);
        std::fs::write(self.root.join(&name), ciphertext).map_err(store_err("writing blob"))?;
        Ok(name)
    }

    pub(crate) fn read(&self, file_name: &str) -> EngineResult<String> {
        std::fs::read_to_string(self.root.join(file_name)).map_err(store_err("reading blob"))
    }

    pub(crate) fn remove(&self, message_id: &str) -> EngineResult<()> {
        match std::fs::remove_file(self.root.join(Self::file_name(message_id))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err("removing blob")(e)),
        }
    }

    pub(crate) fn total_size(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }
}
