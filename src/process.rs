#![forbid(unsafe_code)]

//! Per-record processing pipeline.
//!
//! One record travels `tokenize → (maybe escalate) → claim directory →
//! download video → resolve upload date → persist documents → thumbnail`.
//! The record directory is the unit of idempotency: its existence means
//! "already attempted", a `failed.json` inside means "known bad, never
//! retry", and abandoned records remove their directory so a future run gets
//! a clean second chance.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::assist::{AssistError, MetadataAssist};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::metadata::{self, FailureRecord, THUMBNAIL_FILE, VIDEO_FILE, VideoMetadata};
use crate::probe;
use crate::security::safe_record_id;
use crate::tokenizer::{self, RawFields};

/// Anything that can fetch a URL into a file. The production implementation
/// is [`Fetcher`]; tests script their own.
pub trait Downloader {
    fn download(&self, url: &str, dest: &Path) -> Result<FetchOutcome>;
}

impl Downloader for Fetcher {
    fn download(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        Fetcher::download(self, url, dest)
    }
}

/// Cooperative cancellation shared between the signal handler and the
/// processing loop. Checked at step boundaries; an in-flight record cleans
/// up after itself before yielding.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal state of one record for the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Full bundle persisted.
    Archived,
    /// Directory already existed; nothing to do.
    AlreadyArchived,
    /// A `failed.json` marker from an earlier run says the media is gone.
    SkippedKnownFailure,
    /// The video URL answered with a permanent HTTP error; a failure marker
    /// was written so the record is never retried.
    Failed { status: u16 },
    /// Parsing or date resolution failed terminally for this run. No marker
    /// was written and the directory was removed, so a future run over the
    /// same input retries the record.
    Abandoned,
    /// Cancellation hit while the record was in flight; partial artifacts
    /// were removed.
    Cancelled,
}

impl RecordOutcome {
    /// Whether this outcome counts as a failure in the run totals.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, RecordOutcome::Failed { .. } | RecordOutcome::Abandoned)
    }
}

/// Result of trying to claim the output directory for an id.
enum DirClaim {
    Created(PathBuf),
    AlreadyExists,
    KnownFailure,
    /// `create_dir` failed with something other than "already exists"; the
    /// id itself is suspect.
    Unusable(std::io::Error),
}

/// What the date-resolution chain decided for one record.
struct UploadResolution {
    epoch: i64,
    /// True when the metadata cannot supply the length and it must be
    /// probed from the downloaded file instead.
    length_from_file: bool,
}

/// Date-resolution chain, shared verbatim by the primary and the escalated
/// path so their precedence cannot diverge: the date field wins; failing
/// that, the length field is tried as a date (the shape where the source
/// omitted the length and everything shifted), in which case the real
/// length has to come from the downloaded file.
fn resolve_upload(fields: &RawFields) -> Option<UploadResolution> {
    if let Some(epoch) = metadata::parse_upload_timestamp(&fields.date) {
        return Some(UploadResolution {
            epoch,
            length_from_file: fields.length.is_none(),
        });
    }
    let shifted = fields.length.as_deref()?;
    let epoch = metadata::parse_upload_timestamp(shifted)?;
    Some(UploadResolution {
        epoch,
        length_from_file: true,
    })
}

/// Drives single records through the pipeline. Holds no per-record state;
/// one processor serves the whole run.
pub struct RecordProcessor<'a, D: Downloader, A: MetadataAssist> {
    output_root: &'a Path,
    downloader: &'a D,
    assist: &'a A,
    cancel: &'a CancelFlag,
}

impl<'a, D: Downloader, A: MetadataAssist> RecordProcessor<'a, D, A> {
    pub fn new(
        output_root: &'a Path,
        downloader: &'a D,
        assist: &'a A,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            output_root,
            downloader,
            assist,
            cancel,
        }
    }

    /// Carries one raw record to a terminal state. Per-record trouble is
    /// folded into the returned outcome; only filesystem-level problems
    /// (disk full, permissions) surface as `Err`.
    pub fn process(&self, raw: &str) -> Result<RecordOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(RecordOutcome::Cancelled);
        }

        let tokens = tokenizer::split_record(raw, tokenizer::DELIMITER);

        // The known-failure marker is honored before any parsing effort,
        // escalation included, as long as the tokenizer surfaced a usable id.
        if let Some(id) = tokens.first().filter(|id| safe_record_id(id)) {
            if metadata::has_failure_marker(&self.output_root.join(id.as_str())) {
                println!("Video with ID {id} is unarchived, skipping.");
                return Ok(RecordOutcome::SkippedKnownFailure);
            }
        }

        let mut from_assist = false;
        let mut fields = match RawFields::from_tokens(&tokens).filter(|f| safe_record_id(&f.id)) {
            Some(fields) => fields,
            None => {
                println!("Failed to process input deterministically. Asking the extraction service.");
                from_assist = true;
                match self.escalate(raw) {
                    Some(fields) => fields,
                    None => return Ok(RecordOutcome::Abandoned),
                }
            }
        };

        let dir = match self.claim_record_dir(&fields.id) {
            DirClaim::KnownFailure => {
                println!("Video with ID {} is unarchived, skipping.", fields.id);
                return Ok(RecordOutcome::SkippedKnownFailure);
            }
            DirClaim::AlreadyExists => {
                println!("Video with ID {} already exists, skipping.", fields.id);
                return Ok(RecordOutcome::AlreadyArchived);
            }
            DirClaim::Created(dir) => dir,
            DirClaim::Unusable(err) => {
                if from_assist {
                    eprintln!(
                        "Cannot create a directory for id {}: {err}. Skipping.",
                        fields.id
                    );
                    return Ok(RecordOutcome::Abandoned);
                }
                println!("Failed to process input deterministically. Asking the extraction service.");
                from_assist = true;
                let Some(escalated) = self.escalate(raw) else {
                    return Ok(RecordOutcome::Abandoned);
                };
                fields = escalated;
                match self.claim_record_dir(&fields.id) {
                    DirClaim::Created(dir) => dir,
                    DirClaim::KnownFailure => {
                        println!("Video with ID {} is unarchived, skipping.", fields.id);
                        return Ok(RecordOutcome::SkippedKnownFailure);
                    }
                    DirClaim::AlreadyExists => {
                        println!("Video with ID {} already exists, skipping.", fields.id);
                        return Ok(RecordOutcome::AlreadyArchived);
                    }
                    DirClaim::Unusable(err) => {
                        eprintln!(
                            "Cannot create a directory for id {}: {err}. Skipping.",
                            fields.id
                        );
                        return Ok(RecordOutcome::Abandoned);
                    }
                }
            }
        };

        if self.cancel.is_cancelled() {
            return Ok(self.discard(&dir, RecordOutcome::Cancelled));
        }

        let video_dest = dir.join(VIDEO_FILE);
        let fetched = match self.downloader.download(&fields.video_url, &video_dest) {
            Ok(fetched) => fetched,
            Err(err) => {
                // Structurally broken URL or local filesystem trouble.
                let _ = fs::remove_dir_all(&dir);
                return Err(err).with_context(|| format!("downloading video {}", fields.id));
            }
        };

        if let FetchOutcome::HttpError { status } = fetched {
            println!("Failed to download video {}. Is it archived?", fields.id);
            metadata::write_failure(
                &dir,
                &FailureRecord {
                    id: fields.id.clone(),
                    error: status,
                },
            )?;
            return Ok(RecordOutcome::Failed { status });
        }

        if self.cancel.is_cancelled() {
            return Ok(self.discard(&dir, RecordOutcome::Cancelled));
        }

        let mut resolution = resolve_upload(&fields);
        if resolution.is_none() && !from_assist {
            println!("Failed to interpret the upload date. Asking the extraction service.");
            if let Some(escalated) = self.escalate(raw) {
                resolution = resolve_upload(&escalated);
                if resolution.is_some() {
                    println!("Got a valid response back.");
                    // The claimed directory stays authoritative for the id;
                    // only the field values are taken from the service.
                    fields = RawFields {
                        id: fields.id.clone(),
                        ..escalated
                    };
                }
            }
        }
        let Some(resolution) = resolution else {
            eprintln!("Failed to process video {}. Skipping.", fields.id);
            return Ok(self.discard(&dir, RecordOutcome::Abandoned));
        };

        let length = if resolution.length_from_file {
            println!(
                "Video with ID {}'s meta is missing video length, calculating from file.",
                fields.id
            );
            probe::video_duration(&video_dest)
        } else {
            fields.length.clone()
        };

        metadata::write_metadata(
            &dir,
            &VideoMetadata {
                id: fields.id.clone(),
                title: fields.title.clone(),
                description: fields.description.clone(),
                length,
                uploaded: resolution.epoch,
            },
        )?;

        match self
            .downloader
            .download(&fields.thumbnail_url, &dir.join(THUMBNAIL_FILE))
        {
            Ok(FetchOutcome::Success { .. }) => {}
            Ok(FetchOutcome::HttpError { .. }) => {
                eprintln!("Thumbnail download failed for video {}", fields.id);
            }
            Err(err) => {
                eprintln!("Thumbnail download failed for video {}: {err}", fields.id);
            }
        }

        Ok(RecordOutcome::Archived)
    }

    /// Single escalation policy used by every recovery tier: ask the
    /// service, parse its literal list, and shape-check it through the same
    /// named-field mapping the tokenizer output goes through.
    fn escalate(&self, raw: &str) -> Option<RawFields> {
        match self.assist.extract_fields(raw) {
            Ok(items) => {
                match RawFields::from_tokens(&items).filter(|f| safe_record_id(&f.id)) {
                    Some(fields) => Some(fields),
                    None => {
                        eprintln!(
                            "Extraction service returned {} fields, which fits no known shape. The record stays eligible for a future run.",
                            items.len()
                        );
                        None
                    }
                }
            }
            Err(AssistError::MalformedReply(reply)) => {
                eprintln!(
                    "Extraction service gave an answer that does not parse as a list; the record stays eligible for a future run. The reply was:"
                );
                eprintln!("{reply}");
                None
            }
            Err(err) => {
                eprintln!("{err}");
                None
            }
        }
    }

    fn claim_record_dir(&self, id: &str) -> DirClaim {
        let dir = self.output_root.join(id);
        if metadata::has_failure_marker(&dir) {
            return DirClaim::KnownFailure;
        }
        match fs::create_dir(&dir) {
            Ok(()) => DirClaim::Created(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => DirClaim::AlreadyExists,
            Err(err) => DirClaim::Unusable(err),
        }
    }

    /// Removes the partially built record directory so the idempotency
    /// check stays accurate on the next run.
    fn discard(&self, dir: &Path, outcome: RecordOutcome) -> RecordOutcome {
        if let Err(err) = fs::remove_dir_all(dir) {
            eprintln!("Could not clean up {}: {err}", dir.display());
        }
        outcome
    }
}
