//! Recursive archive traversal.
//!
//! [`Unpacker::open`] returns an [`ArchiveWalk`], a lazy iterator over every
//! leaf member of the uploaded archive and of the archives nested inside it.
//! Nesting is handled with an explicit stack of open containers; a single
//! guard enforces the depth limit and the cumulative decompressed-size budget.
//! Problems with individual members never end the walk, they are yielded as
//! [`UnpackItem::Failed`].

pub mod entry;

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use log::debug;

use crate::config::LimitsConfig;
use crate::error::UnpackError;

pub use entry::{leaf_name, Entry, EntryFailure, FailedEntry, UnpackItem};

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

type Container = zip::ZipArchive<Box<dyn ReadSeek>>;

/// Read at most this much ahead of a member's declared size when allocating.
const INITIAL_BUFFER_CAP: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UnpackLimits {
    pub max_depth: usize,
    /// Budget for one walk. A nested container is charged for its own
    /// decompressed bytes and then again for each member it yields, so a
    /// student zip of N bytes costs roughly 2N. Size this at about twice
    /// the largest expected upload when submissions arrive as nested zips.
    pub max_decompressed_bytes: u64,
    pub container_extensions: Vec<String>,
}

impl UnpackLimits {
    pub fn from_config(limits: &LimitsConfig) -> Self {
        Self {
            max_depth: limits.max_depth,
            max_decompressed_bytes: limits.max_decompressed_bytes,
            container_extensions: limits
                .container_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_container(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.container_extensions.iter().any(|c| *c == ext)
            })
            .unwrap_or(false)
    }
}

impl Default for UnpackLimits {
    fn default() -> Self {
        Self::from_config(&LimitsConfig::default())
    }
}

pub struct Unpacker {
    limits: UnpackLimits,
}

impl Unpacker {
    pub fn new(limits: UnpackLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &UnpackLimits {
        &self.limits
    }

    /// Opens the archive at `path`. Failing to open the root is the only
    /// fatal outcome of unpacking.
    pub fn open(&self, path: &Path) -> Result<ArchiveWalk, UnpackError> {
        let file = File::open(path).map_err(|e| UnpackError::OpenArchive {
            path: path.to_path_buf(),
            source: e,
        })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("archive.zip")
            .to_string();

        self.open_reader(&name, Box::new(BufReader::new(file)))
    }

    pub fn open_reader(
        &self,
        name: &str,
        reader: Box<dyn ReadSeek>,
    ) -> Result<ArchiveWalk, UnpackError> {
        let archive = zip::ZipArchive::new(reader).map_err(|e| UnpackError::NotAContainer {
            path: PathBuf::from(name),
            reason: e.to_string(),
        })?;

        Ok(ArchiveWalk {
            stack: vec![Frame {
                archive,
                next_index: 0,
                origin: vec![name.to_string()],
                depth: 0,
            }],
            limits: self.limits.clone(),
            consumed: 0,
        })
    }
}

struct Frame {
    archive: Container,
    next_index: usize,
    origin: Vec<String>,
    depth: usize,
}

enum Step {
    Skip,
    Emit(UnpackItem),
    Descend(Frame),
}

/// Finite, non-restartable walk over an archive tree.
///
/// Order is depth-first in container listing order: when a nested archive
/// is met its members are yielded before the parent's remaining members.
pub struct ArchiveWalk {
    stack: Vec<Frame>,
    limits: UnpackLimits,
    consumed: u64,
}

impl ArchiveWalk {
    /// Decompressed bytes accepted so far.
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed
    }
}

impl Iterator for ArchiveWalk {
    type Item = UnpackItem;

    fn next(&mut self) -> Option<UnpackItem> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.next_index >= frame.archive.len() {
                self.stack.pop();
                continue;
            }

            let index = frame.next_index;
            frame.next_index += 1;

            let remaining = self
                .limits
                .max_decompressed_bytes
                .saturating_sub(self.consumed);
            let (step, used) = read_member(frame, index, remaining, &self.limits);
            self.consumed += used;

            match step {
                Step::Skip => continue,
                Step::Emit(item) => return Some(item),
                Step::Descend(child) => {
                    debug!(
                        "Descending into nested archive {} (depth {})",
                        child.origin.last().map(String::as_str).unwrap_or(""),
                        child.depth
                    );
                    self.stack.push(child);
                }
            }
        }
    }
}

/// Reads member `index` of the frame's container. Returns the step to take
/// and the number of decompressed bytes charged against the budget.
fn read_member(frame: &mut Frame, index: usize, remaining: u64, limits: &UnpackLimits) -> (Step, u64) {
    let depth = frame.depth;
    let listed_name = frame
        .archive
        .name_for_index(index)
        .unwrap_or("<unnamed>")
        .to_string();

    let fail = |path: String, reason: EntryFailure| {
        Step::Emit(UnpackItem::Failed(FailedEntry {
            name: leaf_name(&path).to_string(),
            path,
            origin: frame.origin.clone(),
            depth,
            reason,
        }))
    };

    let mut member = match frame.archive.by_index(index) {
        Ok(member) => member,
        Err(e) => {
            return (
                fail(listed_name, EntryFailure::Unreadable(e.to_string())),
                0,
            )
        }
    };

    if member.is_dir() {
        return (Step::Skip, 0);
    }

    let path = match member.enclosed_name() {
        Some(p) => p.to_string_lossy().replace('\\', "/"),
        None => {
            drop(member);
            return (fail(listed_name, EntryFailure::UnsafePath), 0);
        }
    };
    let name = leaf_name(&path).to_string();
    let is_container = limits.is_container(&name);

    if is_container && depth + 1 > limits.max_depth {
        drop(member);
        return (
            fail(
                path,
                EntryFailure::DepthExceeded {
                    limit: limits.max_depth,
                },
            ),
            0,
        );
    }

    let declared = member.size();
    if declared > remaining {
        drop(member);
        return (
            fail(
                path,
                EntryFailure::SizeLimitExceeded {
                    limit: limits.max_decompressed_bytes,
                },
            ),
            0,
        );
    }

    // The declared size can lie; never read past the remaining budget + 1.
    let mut content = Vec::with_capacity(declared.min(INITIAL_BUFFER_CAP) as usize);
    let read_result = Read::by_ref(&mut member)
        .take(remaining.saturating_add(1))
        .read_to_end(&mut content);
    drop(member);

    if let Err(e) = read_result {
        return (fail(path, EntryFailure::Unreadable(e.to_string())), 0);
    }
    if content.len() as u64 > remaining {
        return (
            fail(
                path,
                EntryFailure::SizeLimitExceeded {
                    limit: limits.max_decompressed_bytes,
                },
            ),
            0,
        );
    }

    let used = content.len() as u64;

    if is_container {
        let reader: Box<dyn ReadSeek> = Box::new(Cursor::new(content));
        return match zip::ZipArchive::new(reader) {
            Ok(archive) => {
                let mut origin = frame.origin.clone();
                origin.push(path);
                (
                    Step::Descend(Frame {
                        archive,
                        next_index: 0,
                        origin,
                        depth: depth + 1,
                    }),
                    used,
                )
            }
            Err(e) => (
                fail(path, EntryFailure::CorruptContainer(e.to_string())),
                used,
            ),
        };
    }

    (
        Step::Emit(UnpackItem::Leaf(Entry {
            path,
            name,
            content,
            origin: frame.origin.clone(),
            depth,
        })),
        used,
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;

    /// Builds an in-memory zip; members are stored uncompressed so tests can
    /// corrupt their payload bytes in place.
    pub fn build_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in members {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    /// Flips the first byte of `payload` inside `archive`, breaking its CRC.
    pub fn corrupt_payload(archive: &mut [u8], payload: &[u8]) {
        let pos = archive
            .windows(payload.len())
            .position(|w| w == payload)
            .expect("payload present in archive");
        archive[pos] ^= 0xFF;
    }
}
