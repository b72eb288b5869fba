//! Transcription job manager
//!
//! Turns `pending` mappings into `active` ones: downloads the audio,
//! transcribes it chunk by chunk through the pluggable transcriber, builds
//! the alignment map, and flips the status. Chunks already on disk are
//! skipped on restart, so an interrupted job resumes where it stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bookbridge_common::db::models::{
    AlignmentSource, BookStatus, JobState, Mapping, TranscriptionJob,
};
use bookbridge_common::db::ProgressStore;
use bookbridge_common::events::{BridgeEvent, EventBus};
use bookbridge_common::{time, Error, Result};

use crate::align::{build_alignment, AlignmentStore};
use crate::clients::abs::AbsClient;
use crate::clients::booklore::BookloreSyncClient;
use crate::ebook::EbookCache;
use crate::transcript::{Transcriber, TranscriptStore};

/// How often the manager looks for work
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct JobConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub model: String,
    pub audio_cache_dir: PathBuf,
    pub epub_cache_dir: PathBuf,
}

pub struct JobManager {
    store: ProgressStore,
    abs: Arc<AbsClient>,
    transcriber: Arc<dyn Transcriber>,
    transcripts: Arc<TranscriptStore>,
    alignments: AlignmentStore,
    ebooks: Arc<EbookCache>,
    booklore: Option<Arc<BookloreSyncClient>>,
    events: EventBus,
    config: JobConfig,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ProgressStore,
        abs: Arc<AbsClient>,
        transcriber: Arc<dyn Transcriber>,
        transcripts: Arc<TranscriptStore>,
        alignments: AlignmentStore,
        ebooks: Arc<EbookCache>,
        booklore: Option<Arc<BookloreSyncClient>>,
        events: EventBus,
        config: JobConfig,
    ) -> Self {
        JobManager {
            store,
            abs,
            transcriber,
            transcripts,
            alignments,
            ebooks,
            booklore,
            events,
            config,
        }
    }

    /// Reset jobs that were interrupted mid-process on a previous run
    pub async fn recover_stale_jobs(&self) -> Result<()> {
        let mut candidates = self
            .store
            .list_mappings_by_status(BookStatus::Processing)
            .await?;
        candidates.extend(
            self.store
                .list_mappings_by_status(BookStatus::FailedRetryLater)
                .await?,
        );

        for mut mapping in candidates {
            if self.alignments.exists(&mapping.book_id) {
                // The job finished but the status update never landed.
                if mapping.status != BookStatus::Active {
                    info!(
                        book_id = %mapping.book_id,
                        "Found orphan alignment, marking mapping active"
                    );
                    mapping.status = BookStatus::Active;
                    self.store.save_mapping(&mapping).await?;
                }
            } else if mapping.status == BookStatus::Processing {
                info!(book_id = %mapping.book_id, "Recovering interrupted job");
                mapping.status = BookStatus::FailedRetryLater;
                self.store.save_mapping(&mapping).await?;

                let mut job = self
                    .store
                    .load_job(&mapping.book_id)
                    .await?
                    .unwrap_or_else(|| TranscriptionJob::queued(mapping.book_id.clone()));
                job.state = JobState::FailedRetryLater;
                job.last_error = Some("Interrupted by restart".into());
                job.last_attempt = time::unix_now();
                self.store.save_job(&job).await?;
            }
        }
        Ok(())
    }

    /// Worker loop: runs at most one job at a time
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Transcription job manager started");
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(mapping) = self.pick_target().await {
                        self.execute(mapping, &cancel).await;
                    }
                }
            }
        }
        info!("Transcription job manager stopped");
    }

    /// One pending or retry-eligible book, oldest first
    async fn pick_target(&self) -> Option<Mapping> {
        let pending = self
            .store
            .list_mappings_by_status(BookStatus::Pending)
            .await
            .ok()?;
        if let Some(mapping) = pending.into_iter().next() {
            return Some(mapping);
        }

        let failed = self
            .store
            .list_mappings_by_status(BookStatus::FailedRetryLater)
            .await
            .ok()?;
        for mapping in failed {
            let job = self.store.load_job(&mapping.book_id).await.ok()?;
            let Some(job) = job else {
                return Some(mapping);
            };
            if job.retry_count >= self.config.max_retries as i64 {
                continue;
            }
            let elapsed = time::unix_now() - job.last_attempt;
            if elapsed > self.config.retry_delay.as_secs_f64() {
                return Some(mapping);
            }
        }
        None
    }

    async fn execute(&self, mut mapping: Mapping, cancel: &CancellationToken) {
        let book_id = mapping.book_id.clone();
        info!(book_id = %book_id, title = %mapping.title, "Starting transcription job");

        mapping.status = BookStatus::Processing;
        if let Err(err) = self.store.save_mapping(&mapping).await {
            error!(book_id = %book_id, %err, "Could not mark mapping processing");
            return;
        }

        let mut job = self
            .store
            .load_job(&book_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| TranscriptionJob::queued(book_id.clone()));
        job.state = JobState::Running;
        job.last_attempt = time::unix_now();
        let _ = self.store.save_job(&job).await;

        match self.run_job(&mut mapping, &mut job, cancel).await {
            Ok(()) => {
                mapping.status = BookStatus::Active;
                mapping.alignment_source = AlignmentSource::Whisper;
                if let Err(err) = self.store.save_mapping(&mapping).await {
                    error!(book_id = %book_id, %err, "Could not activate mapping");
                    return;
                }
                job.state = JobState::Done;
                job.retry_count = 0;
                job.last_error = None;
                job.progress = 1.0;
                let _ = self.store.save_job(&job).await;

                info!(book_id = %book_id, "Transcription job completed");
                self.events.emit_lossy(BridgeEvent::StatusChanged {
                    book_id: book_id.clone(),
                    old_status: BookStatus::Processing.to_string(),
                    new_status: BookStatus::Active.to_string(),
                    timestamp: time::now(),
                });

                // Audio is only needed for transcription; reclaim the space.
                let cache = self.config.audio_cache_dir.join(&book_id);
                if cache.exists() {
                    let _ = std::fs::remove_dir_all(cache);
                }
            }
            Err(err) if cancel.is_cancelled() => {
                // Chunk files stay on disk for resume.
                warn!(book_id = %book_id, %err, "Job cancelled, leaving chunks for resume");
                mapping.status = BookStatus::FailedRetryLater;
                let _ = self.store.save_mapping(&mapping).await;
            }
            Err(err) => {
                error!(book_id = %book_id, %err, "Transcription job failed");
                job.retry_count += 1;
                job.state = JobState::FailedRetryLater;
                job.last_error = Some(err.to_string());
                job.last_attempt = time::unix_now();
                let _ = self.store.save_job(&job).await;

                mapping.status = BookStatus::FailedRetryLater;
                let _ = self.store.save_mapping(&mapping).await;

                if job.retry_count >= self.config.max_retries as i64 {
                    warn!(book_id = %book_id, "Max retries exceeded, reclaiming audio cache");
                    let cache = self.config.audio_cache_dir.join(&book_id);
                    if cache.exists() {
                        let _ = std::fs::remove_dir_all(cache);
                    }
                }
            }
        }
    }

    async fn run_job(
        &self,
        mapping: &mut Mapping,
        job: &mut TranscriptionJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let book_id = mapping.book_id.clone();

        // Phase 1: make sure the ebook is available and parsed.
        let filename = mapping
            .ebook_filename
            .clone()
            .ok_or_else(|| Error::InvalidInput("mapping has no ebook file".into()))?;
        self.ensure_epub(mapping, &filename).await?;
        let parsed = self.ebooks.get(&filename)?;
        self.report_progress(&book_id, job, 0.05, "preparing").await;

        // Phase 2: download audio.
        let files = self
            .abs
            .audio_files(&book_id)
            .await
            .map_err(|e| Error::Internal(format!("audio listing: {e}")))?;
        if files.is_empty() {
            return Err(Error::NotFound(format!("no audio files for {book_id}")));
        }

        let cache_dir = self.config.audio_cache_dir.join(&book_id);
        std::fs::create_dir_all(&cache_dir)?;

        let total_chunks = files.len();
        let mut cumulative = 0.0_f64;

        for (index, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Internal("cancelled".into()));
            }

            // Resume: chunks already transcribed are skipped entirely.
            if self.transcripts.chunk_exists(&book_id, index) {
                debug!(book_id = %book_id, chunk = index, "Chunk already transcribed, skipping");
                let stored = self.transcripts.load_chunk(&book_id, index)?;
                let stored_end = stored.last().map(|w| w.end).unwrap_or(cumulative);
                cumulative = if file.duration > 0.0 {
                    cumulative + file.duration
                } else {
                    stored_end.max(cumulative)
                };
                continue;
            }

            let ext = if file.ext.starts_with('.') {
                file.ext.clone()
            } else {
                format!(".{}", file.ext)
            };
            let local = cache_dir.join(format!("part_{index:03}{ext}"));
            if !local.exists() {
                info!(book_id = %book_id, chunk = index, total = total_chunks, "Downloading audio chunk");
                self.abs
                    .download_audio(file, &local)
                    .await
                    .map_err(|e| Error::Internal(format!("audio download: {e}")))?;
            }

            info!(book_id = %book_id, chunk = index, total = total_chunks, "Transcribing chunk");
            let chunks = self
                .transcriber
                .transcribe(&local, &self.config.model)
                .await?;

            let mut words: Vec<_> = chunks.into_iter().flatten().collect();
            if words.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "chunk {index} produced no words"
                )));
            }
            let chunk_span = words.last().map(|w| w.end).unwrap_or(0.0);
            for word in &mut words {
                word.start += cumulative;
                word.end += cumulative;
            }
            self.transcripts.save_chunk(&book_id, index, &words)?;

            cumulative += if file.duration > 0.0 {
                file.duration
            } else {
                chunk_span
            };

            job.chunks_done = (index + 1) as i64;
            let progress = 0.1 + 0.8 * ((index + 1) as f64 / total_chunks as f64);
            self.report_progress(&book_id, job, progress, "transcribing").await;
        }

        // Phase 3: build and persist the alignment map.
        info!(book_id = %book_id, "Building alignment map");
        let words = self.transcripts.load_words(&book_id)?;
        let alignment = build_alignment(&words, &parsed.full_text)?;
        self.alignments.save(&book_id, &alignment)?;

        let duration = if cumulative > 0.0 {
            cumulative
        } else {
            alignment.duration()
        };
        mapping.duration_seconds = Some(duration);

        self.report_progress(&book_id, job, 0.95, "aligning").await;
        Ok(())
    }

    /// Download the epub from Booklore into the cache when it is not on disk
    async fn ensure_epub(&self, mapping: &Mapping, filename: &str) -> Result<()> {
        if self.ebooks.resolve_book_path(filename).is_ok() {
            return Ok(());
        }
        let Some(booklore) = &self.booklore else {
            return Err(Error::NotFound(format!("ebook file {filename}")));
        };
        let Some(booklore_id) = mapping.booklore_id else {
            return Err(Error::NotFound(format!("ebook file {filename}")));
        };

        info!(book_id = %mapping.book_id, filename, "Downloading epub from Booklore");
        let content = booklore
            .download_book(booklore_id)
            .await
            .map_err(|e| Error::Internal(format!("epub download: {e}")))?;

        std::fs::create_dir_all(&self.config.epub_cache_dir)?;
        std::fs::write(self.config.epub_cache_dir.join(filename), content)?;
        Ok(())
    }

    async fn report_progress(&self, book_id: &str, job: &TranscriptionJob, progress: f64, phase: &str) {
        let mut job = job.clone();
        job.progress = progress;
        let _ = self.store.save_job(&job).await;
        self.events.emit_lossy(BridgeEvent::JobProgress {
            book_id: book_id.to_string(),
            progress,
            phase: phase.to_string(),
            timestamp: time::now(),
        });
    }
}
