//! Test harness for isolated ingestion runs.
//!
//! The `TestHarness` struct provides a complete isolated environment:
//! - Temporary upload and extract directories
//! - A file-backed SQLite database
//! - Orchestrator construction and blocking job execution

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use intake::config::{Config, SessionSpec};
use intake::{Database, Orchestrator, ProcessingResult};

use super::builders::ConfigBuilder;

const JOB_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TestHarness {
    temp_dir: TempDir,
    pub upload_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub config: Config,
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ConfigBuilder::new())
    }

    /// Points the builder's directories into a fresh temp directory.
    pub fn with_config(builder: ConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let upload_dir = temp_dir.path().join("uploads");
        let extract_dir = temp_dir.path().join("extracted");
        let db_path = temp_dir.path().join("data").join("intake.db");

        let config = builder
            .upload_directory(upload_dir.to_str().unwrap())
            .extract_directory(extract_dir.to_str().unwrap())
            .database_path(db_path.to_str().unwrap())
            .build();
        let db = Database::open(&db_path).expect("Failed to open database");

        Self {
            temp_dir,
            upload_dir,
            extract_dir,
            config,
            db,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::from_config(&self.config, self.db.clone())
    }

    /// Submits an archive and blocks until its job reports back.
    pub fn ingest(
        &self,
        orchestrator: &Orchestrator,
        session: SessionSpec,
        archive_name: &str,
        archive: Vec<u8>,
    ) -> ProcessingResult {
        let job_id = orchestrator
            .submit(session, archive_name, &mut Cursor::new(archive))
            .expect("Failed to submit archive");
        self.wait_for(orchestrator, &job_id)
    }

    /// Blocks until `job_id` reports back and returns its report.
    pub fn wait_for(&self, orchestrator: &Orchestrator, job_id: &str) -> ProcessingResult {
        let deadline = Instant::now() + JOB_TIMEOUT;
        loop {
            assert!(Instant::now() < deadline, "Job {} did not finish in time", job_id);
            if let Some(outcome) = orchestrator.recv_outcome_timeout(Duration::from_millis(100)) {
                if outcome.job_id == job_id {
                    break;
                }
            }
        }
        orchestrator.get_result(job_id).expect("Failed to load job report")
    }

    /// Blocks until every job in `job_ids` reports back, in any order.
    pub fn wait_for_all(
        &self,
        orchestrator: &Orchestrator,
        job_ids: &[String],
    ) -> Vec<ProcessingResult> {
        let deadline = Instant::now() + JOB_TIMEOUT;
        let mut pending: HashSet<&str> = job_ids.iter().map(String::as_str).collect();
        while !pending.is_empty() {
            assert!(Instant::now() < deadline, "Jobs {:?} did not finish in time", pending);
            if let Some(outcome) = orchestrator.recv_outcome_timeout(Duration::from_millis(100)) {
                pending.remove(outcome.job_id.as_str());
            }
        }
        job_ids
            .iter()
            .map(|id| orchestrator.get_result(id).expect("Failed to load job report"))
            .collect()
    }

    /// Runs one archive on a fresh orchestrator and shuts it down.
    pub fn run_once(
        &self,
        session: SessionSpec,
        archive_name: &str,
        archive: Vec<u8>,
    ) -> ProcessingResult {
        let orchestrator = self.orchestrator();
        let result = self.ingest(&orchestrator, session, archive_name, archive);
        orchestrator.shutdown();
        orchestrator.wait();
        result
    }
}

/// Builds an in-memory zip with stored (uncompressed) members, so tests can
/// corrupt payload bytes in place.
pub fn zip_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
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
pub fn corrupt_member(archive: &mut [u8], payload: &[u8]) {
    let pos = archive
        .windows(payload.len())
        .position(|w| w == payload)
        .expect("payload present in archive");
    archive[pos] ^= 0xFF;
}

/// A small valid PNG.
pub fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("Failed to encode PNG");
    bytes.into_inner()
}
