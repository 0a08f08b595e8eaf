//! In-memory per-student grouping built while a job walks its archive.

use std::io::Cursor;
use std::path::PathBuf;

use crate::dedup::Fingerprint;
use crate::identity::Confidence;
use crate::violations::ViolationDraft;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Returns image metadata when `name` has an image extension. Dimensions
/// are read from the header only; undecodable headers leave them empty.
pub fn detect_image(name: &str, content: &[u8]) -> Option<ImageMeta> {
    let mime = mime_guess::from_path(name).first()?;
    if mime.type_() != mime_guess::mime::IMAGE {
        return None;
    }

    let dimensions = image::ImageReader::new(Cursor::new(content))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok());
    if dimensions.is_none() {
        log::debug!("Could not read image dimensions for {}", name);
    }

    Some(ImageMeta {
        mime_type: mime.essence_str().to_string(),
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    })
}

/// A kept file, already materialized under the job's extract directory.
#[derive(Debug, Clone)]
pub struct DraftFile {
    pub name: String,
    /// Provenance inside the upload, e.g. `session1.zip > S010.zip > essay.txt`.
    pub source_path: String,
    pub stored_path: PathBuf,
    pub size: u64,
    pub fingerprint: Fingerprint,
    pub mime_type: Option<String>,
    pub confidence: Confidence,
    pub naming_violation: Option<ViolationDraft>,
    pub image: Option<ImageMeta>,
}

/// A job-level duplicate attributed to this student. Not persisted as a
/// file; only the detector looks at it.
#[derive(Debug, Clone)]
pub struct DuplicateCopy {
    pub name: String,
    pub fingerprint: Fingerprint,
}

/// A member that failed to extract but whose name points at this student.
#[derive(Debug, Clone)]
pub struct UnreadableRef {
    pub name: String,
    pub source_path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SubmissionDraft {
    pub student_id: String,
    pub files: Vec<DraftFile>,
    pub duplicate_copies: Vec<DuplicateCopy>,
    pub unreadable: Vec<UnreadableRef>,
}

impl SubmissionDraft {
    pub fn new(student_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            files: Vec::new(),
            duplicate_copies: Vec::new(),
            unreadable: Vec::new(),
        }
    }
}
