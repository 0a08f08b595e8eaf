use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::aggregator::{
    detect_image, DraftFile, DuplicateCopy, SubmissionAggregator, SubmissionDraft, UnreadableRef,
};
use crate::config::validate_session;
use crate::db::submission_repo::SubmissionKey;
use crate::db::Database;
use crate::dedup::{Deduplicator, Observation};
use crate::identity::IdentityResolver;
use crate::sanitize;
use crate::storage::FileStorage;
use crate::unpacker::{Entry, FailedEntry, UnpackItem, Unpacker};
use crate::violations::ViolationDetector;
use crate::worker::job::UnassignedFile;

use super::config::PipelineConfig;
use super::context::{JobControl, JobContext, PendingCopy};
use super::error::PipelineError;
use super::progress::{JobPhase, ProgressEvent, ProgressReporter};

/// Drives one job: unpack, deduplicate, classify, materialize, evaluate and
/// persist.
pub struct IngestionPipeline {
    config: Arc<PipelineConfig>,
    unpacker: Unpacker,
    aggregator: SubmissionAggregator,
}

impl IngestionPipeline {
    pub fn new(config: Arc<PipelineConfig>, db: Database) -> Self {
        let unpacker = Unpacker::new(config.limits.clone());
        Self {
            config,
            unpacker,
            aggregator: SubmissionAggregator::new(db),
        }
    }

    /// Runs a full pass over the job's archive.
    ///
    /// The context is returned in every case so the caller can record the
    /// counters of a failed or interrupted pass too.
    pub fn run(
        &self,
        mut ctx: JobContext,
        control: &JobControl,
        progress: &dyn ProgressReporter,
    ) -> (Result<(), PipelineError>, JobContext) {
        let archive = sanitize::redact_path(&ctx.job.upload_path);
        let _pipeline_span = info_span!("pipeline",
            job_id = %ctx.job.id,
            exam_session = %ctx.job.session.exam_session_id,
            archive = %archive,
        )
        .entered();

        let result = self.run_steps(&mut ctx, control, progress);
        match &result {
            Ok(()) => {
                info!(
                    "Job {} finished: {} files, {} processed, {} errors, {} duplicates",
                    ctx.job.id,
                    ctx.counts.total_files,
                    ctx.counts.processed_files,
                    ctx.counts.error_files,
                    ctx.counts.duplicate_files
                );
                progress.report(ProgressEvent::Completed { counts: ctx.counts });
            }
            Err(PipelineError::Interrupted) => {
                info!("Job {} interrupted by shutdown", ctx.job.id);
                progress.report(ProgressEvent::Interrupted);
            }
            Err(e) => {
                warn!("Job {} failed: {}", ctx.job.id, e);
                progress.report(ProgressEvent::Failed {
                    error: e.to_string(),
                });
            }
        }
        (result, ctx)
    }

    fn run_steps(
        &self,
        ctx: &mut JobContext,
        control: &JobControl,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        validate_session(&ctx.job.session, &self.config.naming)?;
        let resolver = IdentityResolver::from_config(&self.config.naming, &ctx.job.session)?;
        let detector = ViolationDetector::from_config(&self.config.violations, &ctx.job.session)?;

        // Step 1: Unpack, deduplicate, classify, materialize
        {
            let _step = info_span!("unpack").entered();
            progress.report(ProgressEvent::Phase {
                phase: JobPhase::Unpacking,
                message: format!("Unpacking {}", ctx.job.archive_name),
            });
            self.step_unpack(ctx, &resolver, control)?;
            ctx.attach_pending();
        }

        // Step 2: Evaluate and persist each student
        {
            let _step = info_span!("persist", students = ctx.drafts.len()).entered();
            progress.report(ProgressEvent::Phase {
                phase: JobPhase::Persisting,
                message: format!("Persisting {} submission(s)", ctx.drafts.len()),
            });
            self.step_persist(ctx, &detector, control)?;
        }

        Ok(())
    }

    fn step_unpack(
        &self,
        ctx: &mut JobContext,
        resolver: &IdentityResolver,
        control: &JobControl,
    ) -> Result<(), PipelineError> {
        let mut walk = self.unpacker.open(&ctx.job.upload_path)?;
        let storage = FileStorage::new(&ctx.job.extract_path);
        let mut dedup = Deduplicator::new();

        loop {
            control.checkpoint()?;
            let Some(item) = walk.next() else {
                break;
            };
            ctx.counts.total_files += 1;

            match item {
                UnpackItem::Leaf(entry) => {
                    self.handle_entry(ctx, resolver, &mut dedup, &storage, entry)?
                }
                UnpackItem::Failed(failed) => self.handle_failed(ctx, resolver, failed),
            }
        }

        debug!(
            "Walk of {} consumed {} decompressed bytes, {} distinct contents",
            ctx.job.archive_name,
            walk.consumed_bytes(),
            dedup.distinct_count()
        );
        Ok(())
    }

    fn handle_entry(
        &self,
        ctx: &mut JobContext,
        resolver: &IdentityResolver,
        dedup: &mut Deduplicator,
        storage: &FileStorage,
        entry: Entry,
    ) -> Result<(), PipelineError> {
        let classification = resolver.classify(&entry);

        // Only entries with an owner take part in deduplication.
        let Some(student_id) = classification.student_id else {
            ctx.counts.error_files += 1;
            let reason = classification
                .naming_violation
                .map(|v| v.description)
                .unwrap_or_else(|| "no student identity".to_string());
            debug!("Unassigned: {}", entry.display_path());
            ctx.unassigned.push(UnassignedFile {
                file_name: entry.name.clone(),
                source_path: entry.display_path(),
                reason,
            });
            return Ok(());
        };

        let (fingerprint, observation) = dedup.observe(&entry);
        if let Observation::DuplicateOf(first) = observation {
            ctx.counts.duplicate_files += 1;
            debug!(
                "{} duplicates {} ({})",
                entry.display_path(),
                first.path,
                fingerprint.short()
            );
            ctx.pending_copies.push(PendingCopy {
                student_id,
                source_path: entry.display_path(),
                first_path: first.path,
                copy: DuplicateCopy {
                    name: entry.name,
                    fingerprint,
                },
            });
            return Ok(());
        }

        let stored_path = storage.store_extracted(&student_id, &entry.name, &entry.content)?;
        let mime_type = mime_guess::from_path(&entry.name)
            .first()
            .map(|m| m.essence_str().to_string());
        let image = detect_image(&entry.name, &entry.content);

        let source_path = entry.display_path();
        let naming_violation = classification
            .naming_violation
            .map(|v| v.for_file(&source_path, &fingerprint));
        let file = DraftFile {
            source_path,
            size: entry.size(),
            name: entry.name,
            stored_path,
            fingerprint,
            mime_type,
            confidence: classification.confidence,
            naming_violation,
            image,
        };
        ctx.drafts
            .entry(student_id)
            .or_insert_with_key(|id| SubmissionDraft::new(id.as_str()))
            .files
            .push(file);
        Ok(())
    }

    fn handle_failed(&self, ctx: &mut JobContext, resolver: &IdentityResolver, failed: FailedEntry) {
        ctx.counts.error_files += 1;
        warn!(
            "Skipping {}: {}",
            sanitize::redact_entry_path(&failed.display_path()),
            failed.reason
        );

        let classification = resolver.classify_failed(&failed);
        let unreadable = UnreadableRef {
            source_path: failed.display_path(),
            reason: failed.reason.to_string(),
            name: failed.name,
        };
        match classification.student_id {
            Some(student_id) => ctx.pending_unreadable.push((student_id, unreadable)),
            None => ctx.unassigned.push(UnassignedFile {
                file_name: unreadable.name,
                source_path: unreadable.source_path,
                reason: unreadable.reason,
            }),
        }
    }

    fn step_persist(
        &self,
        ctx: &mut JobContext,
        detector: &ViolationDetector,
        control: &JobControl,
    ) -> Result<(), PipelineError> {
        let session = &ctx.job.session;
        for (student_id, draft) in &ctx.drafts {
            control.checkpoint()?;

            let violations = detector.evaluate(draft);
            let key = SubmissionKey {
                exam_session_id: session.exam_session_id.clone(),
                exam_id: session.exam_id.clone(),
                student_id: student_id.clone(),
            };
            let applied = self.aggregator.apply_draft(
                &key,
                session.student_name(student_id),
                &ctx.job.id,
                draft,
                &violations,
            )?;

            ctx.counts.processed_files += draft.files.len() as u64;
            ctx.submissions_applied += 1;
            debug!(
                "{}: submission {} ({}), {} violation(s)",
                student_id,
                applied.submission.id,
                if applied.created { "created" } else { "updated" },
                violations.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamingConfig, SessionSpec, ViolationPolicyConfig};
    use crate::db::submission_repo;
    use crate::unpacker::test_support::build_zip;
    use crate::unpacker::UnpackLimits;
    use crate::worker::IngestJob;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    use super::super::progress::NoopProgress;

    /// Cancels the job as soon as it enters `phase`.
    struct CancelAt {
        phase: JobPhase,
        control: JobControl,
    }

    impl ProgressReporter for CancelAt {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Phase { phase, .. } = event {
                if phase == self.phase {
                    self.control.cancel();
                }
            }
        }
    }

    fn setup(root: &Path) -> (IngestionPipeline, Database, JobContext) {
        let config = Arc::new(PipelineConfig {
            upload_directory: root.join("uploads"),
            extract_directory: root.join("extracted"),
            limits: UnpackLimits::default(),
            naming: NamingConfig::default(),
            violations: ViolationPolicyConfig::default(),
        });
        let db = Database::open_in_memory().unwrap();

        let upload_path = root.join("uploads").join("batch.zip");
        std::fs::create_dir_all(upload_path.parent().unwrap()).unwrap();
        let archive = build_zip(&[("S001_essay.txt", b"one"), ("S002_essay.txt", b"two")]);
        std::fs::write(&upload_path, archive).unwrap();

        let ctx = JobContext::new(IngestJob {
            id: "job-1".to_string(),
            session: SessionSpec::new("sess-1", "exam-1"),
            archive_name: "batch.zip".to_string(),
            upload_path,
            extract_path: root.join("extracted").join("job-1"),
        });
        (IngestionPipeline::new(config, db.clone()), db, ctx)
    }

    fn control() -> JobControl {
        JobControl::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_full_pass() {
        let temp_dir = TempDir::new().unwrap();
        let (pipeline, db, ctx) = setup(temp_dir.path());

        let (result, ctx) = pipeline.run(ctx, &control(), &NoopProgress);

        assert!(result.is_ok());
        assert_eq!(ctx.counts.total_files, 2);
        assert_eq!(ctx.counts.processed_files, 2);
        assert_eq!(ctx.submissions_applied, 2);
        assert_eq!(submission_repo::list_for_session(&db, "sess-1").unwrap().len(), 2);
    }

    #[test]
    fn test_cancel_during_unpack_stops_before_next_entry() {
        let temp_dir = TempDir::new().unwrap();
        let (pipeline, db, ctx) = setup(temp_dir.path());
        let control = control();
        let reporter = CancelAt {
            phase: JobPhase::Unpacking,
            control: control.clone(),
        };

        let (result, ctx) = pipeline.run(ctx, &control, &reporter);

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(ctx.counts.total_files, 0);
        assert!(submission_repo::list_for_session(&db, "sess-1").unwrap().is_empty());
    }

    #[test]
    fn test_cancel_during_persist_commits_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (pipeline, db, ctx) = setup(temp_dir.path());
        let control = control();
        let reporter = CancelAt {
            phase: JobPhase::Persisting,
            control: control.clone(),
        };

        let (result, ctx) = pipeline.run(ctx, &control, &reporter);

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(ctx.counts.total_files, 2);
        assert_eq!(ctx.counts.processed_files, 0);
        assert_eq!(ctx.submissions_applied, 0);
        assert!(submission_repo::list_for_session(&db, "sess-1").unwrap().is_empty());
    }
}
