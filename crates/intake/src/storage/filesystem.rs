use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

const MAX_NAME_ATTEMPTS: usize = 1000;

/// Reduces an untrusted name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> Result<String, StorageError> {
    let leaf = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = leaf
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(cleaned.to_string())
}

fn candidate_name(filename: &str, counter: usize) -> String {
    if counter == 1 {
        return filename.to_string();
    }
    match filename.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => format!(
            "{}_{}{}",
            &filename[..dot_pos],
            counter,
            &filename[dot_pos..]
        ),
        _ => format!("{}_{}", filename, counter),
    }
}

enum Slot {
    Created(PathBuf, File),
    Existing(PathBuf),
}

/// Materializes uploads and extracted files under a root directory.
///
/// Files are created with `create_new`, so two writers never share a path.
/// Extracted files are idempotent: storing the same bytes under the same
/// name again returns the existing path.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Streams an uploaded archive to `<root>/<job_id>/<archive_name>`.
    pub fn store_upload<R: Read>(
        &self,
        job_id: &str,
        archive_name: &str,
        reader: &mut R,
    ) -> Result<PathBuf, StorageError> {
        let dir_path = self.root.join(sanitize_file_name(job_id)?);
        self.ensure_directory(&dir_path)?;

        let filename = sanitize_file_name(archive_name)?;
        match self.claim_slot(&dir_path, &filename, |_| Ok(false))? {
            Slot::Created(path, mut file) => {
                let written = std::io::copy(reader, &mut file).and_then(|_| file.flush());
                written.map_err(|e| StorageError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
                Ok(path)
            }
            Slot::Existing(path) => Ok(path),
        }
    }

    /// Writes an extracted file to `<root>/<relative_directory>/<name>`.
    ///
    /// A file already holding exactly `content` is reused; a different file
    /// of the same name gets a `_N` suffix.
    pub fn store_extracted(
        &self,
        relative_directory: &str,
        name: &str,
        content: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let mut dir_path = self.root.clone();
        for segment in relative_directory.split('/').filter(|s| !s.is_empty()) {
            dir_path.push(sanitize_file_name(segment)?);
        }
        self.ensure_directory(&dir_path)?;

        let filename = sanitize_file_name(name)?;
        let same_content = |path: &Path| -> Result<bool, StorageError> {
            let existing = std::fs::read(path).map_err(|e| StorageError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(existing == content)
        };

        match self.claim_slot(&dir_path, &filename, same_content)? {
            Slot::Created(path, mut file) => {
                file.write_all(content).map_err(|e| StorageError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
                Ok(path)
            }
            Slot::Existing(path) => {
                log::debug!("Reusing extracted file {}", path.display());
                Ok(path)
            }
        }
    }

    /// Finds the first of `name`, `name_2`, ... that is either free (and
    /// is created) or accepted by `reuse`.
    fn claim_slot<F>(&self, dir_path: &Path, filename: &str, reuse: F) -> Result<Slot, StorageError>
    where
        F: Fn(&Path) -> Result<bool, StorageError>,
    {
        for counter in 1..=MAX_NAME_ATTEMPTS {
            let try_path = dir_path.join(candidate_name(filename, counter));

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&try_path)
            {
                Ok(file) => return Ok(Slot::Created(try_path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if reuse(&try_path)? {
                        return Ok(Slot::Existing(try_path));
                    }
                }
                Err(e) => {
                    return Err(StorageError::WriteFile {
                        path: try_path,
                        source: e,
                    });
                }
            }
        }

        Err(StorageError::NameExhausted(dir_path.join(filename)))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}
