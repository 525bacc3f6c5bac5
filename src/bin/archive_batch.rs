#![forbid(unsafe_code)]

//! Command-line entry point that walks a metadata dump line by line and
//! archives every record it names: one directory per video holding the media
//! file, the thumbnail and the JSON documents.
//!
//! Runs are resumable by construction. Already-archived records are skipped,
//! records with a failure marker are never retried, and an interrupted run
//! leaves no partial directories behind.

use anyhow::{Context, Result, bail};
use gvarchive::assist::AssistClient;
use gvarchive::config::{RuntimeSettings, SettingsOverrides, resolve_runtime_settings};
use gvarchive::fetch::{FetchConfig, Fetcher, TrafficCounter};
use gvarchive::metadata;
use gvarchive::process::{CancelFlag, RecordOutcome, RecordProcessor};
use gvarchive::security::ensure_not_root;
use std::env;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
struct BatchArgs {
    output_root: Option<PathBuf>,
    input_file: Option<PathBuf>,
    max_records: Option<usize>,
    env_path: Option<PathBuf>,
}

impl BatchArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--output-root=") {
                parsed.output_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--input=") {
                parsed.input_file = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--max-records=") {
                parsed.max_records = Some(Self::parse_max_records(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                parsed.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--output-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--output-root requires a value"))?;
                    parsed.output_root = Some(PathBuf::from(value));
                }
                "--input" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--input requires a value"))?;
                    parsed.input_file = Some(PathBuf::from(value));
                }
                "--max-records" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--max-records requires a value"))?;
                    parsed.max_records = Some(Self::parse_max_records(&value)?);
                }
                "--env" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--env requires a value"))?;
                    parsed.env_path = Some(PathBuf::from(value));
                }
                _ => {
                    bail!(
                        "unknown argument: {arg}\nUsage: archive_batch [--output-root <path>] [--input <file>] [--max-records <n>] [--env <file>]"
                    );
                }
            }
        }

        Ok(parsed)
    }

    fn parse_max_records(value: &str) -> Result<usize> {
        value
            .parse::<usize>()
            .with_context(|| format!("--max-records must be a number, got {value:?}"))
    }

    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            output_root: self.output_root,
            input_file: self.input_file,
            max_records: self.max_records,
            env_path: self.env_path,
            ..SettingsOverrides::default()
        }
    }
}

/// Totals reported at the end of a run.
#[derive(Debug, Default)]
struct RunSummary {
    archived: usize,
    skipped: usize,
    failed: usize,
    cancelled: bool,
    megabytes: f64,
    /// Fully archived record directories under the output root after the
    /// run, counted from disk rather than from this run's totals.
    on_disk: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("archive_batch")?;

    let args = BatchArgs::parse()?;
    let settings = resolve_runtime_settings(args.into_overrides())?;

    println!("===================================");
    println!("Video Metadata Archiver");
    println!("===================================");
    println!("Input file: {}", settings.input_file.display());
    println!("Output root: {}", settings.output_root.display());
    println!("Record limit: {}", settings.max_records);
    println!();

    let cancel = CancelFlag::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!();
                println!("Interrupt received, stopping after the current record...");
                cancel.cancel();
            }
        });
    }

    let summary = {
        let settings = settings.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || run_batch(&settings, &cancel))
            .await
            .context("archive task panicked")??
    };

    println!();
    println!("===================================");
    if summary.cancelled {
        println!("Archive run interrupted.");
    } else {
        println!("Archive run complete!");
    }
    println!("===================================");
    println!("Archived this run: {}", summary.archived);
    println!("Skipped: {}", summary.skipped);
    println!("Failed: {}", summary.failed);
    println!("Downloaded: {:.2} MB", summary.megabytes);
    println!(
        "Archived videos in {}: {}",
        settings.output_root.display(),
        summary.on_disk
    );

    Ok(())
}

/// Reads up to `max_records` lines from the input file and drives each one
/// through the processor. Per-record failures are reported and counted but
/// never stop the run.
fn run_batch(settings: &RuntimeSettings, cancel: &CancelFlag) -> Result<RunSummary> {
    fs::create_dir_all(&settings.output_root)
        .with_context(|| format!("creating {}", settings.output_root.display()))?;

    let file = File::open(&settings.input_file)
        .with_context(|| format!("opening {}", settings.input_file.display()))?;
    let reader = BufReader::new(file);

    let traffic = Arc::new(TrafficCounter::default());
    let fetcher = Fetcher::new(FetchConfig::default(), traffic.clone());
    let assist = AssistClient::new(
        settings.assist_api_url.clone(),
        settings.assist_model.clone(),
        settings.assist_api_key.clone(),
    );
    let processor = RecordProcessor::new(&settings.output_root, &fetcher, &assist, cancel);

    let mut summary = RunSummary::default();
    for (index, line) in reader.lines().take(settings.max_records).enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let line = line.with_context(|| format!("reading {}", settings.input_file.display()))?;
        let record = line.trim();
        if record.is_empty() {
            continue;
        }

        println!(
            "[{}/{}] Processing record ({:.2} MB downloaded so far)",
            index + 1,
            settings.max_records,
            traffic.megabytes()
        );

        match processor.process(record) {
            Ok(RecordOutcome::Archived) => summary.archived += 1,
            Ok(RecordOutcome::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Ok(outcome) if outcome.counts_as_failure() => summary.failed += 1,
            Ok(_) => summary.skipped += 1,
            Err(err) => {
                eprintln!("  Warning: record {} failed: {err:#}", index + 1);
                summary.failed += 1;
            }
        }
    }

    summary.megabytes = traffic.megabytes();
    summary.on_disk = count_archived(&settings.output_root);
    Ok(summary)
}

/// Counts record directories that carry a metadata document, i.e. fully
/// archived videos. Directories holding only a failure marker do not count.
fn count_archived(root: &Path) -> usize {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.file_name() == OsStr::new(metadata::METADATA_FILE)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvarchive::metadata::VideoMetadata;
    use std::io::Write;
    use tempfile::tempdir;

    fn settings_with(root: &Path, input: &Path) -> RuntimeSettings {
        RuntimeSettings {
            output_root: root.to_path_buf(),
            input_file: input.to_path_buf(),
            max_records: 100,
            assist_api_url: "http://127.0.0.1:1/v1".to_string(),
            assist_model: "test-model".to_string(),
            assist_api_key: None,
        }
    }

    #[test]
    fn parses_equals_form_arguments() {
        let args = BatchArgs::from_slice(&[
            "--output-root=/data/archive",
            "--input=dump.txt",
            "--max-records=50",
            "--env=/etc/archive.env",
        ])
        .unwrap();
        assert_eq!(args.output_root, Some(PathBuf::from("/data/archive")));
        assert_eq!(args.input_file, Some(PathBuf::from("dump.txt")));
        assert_eq!(args.max_records, Some(50));
        assert_eq!(args.env_path, Some(PathBuf::from("/etc/archive.env")));
    }

    #[test]
    fn parses_space_form_arguments() {
        let args = BatchArgs::from_slice(&["--output-root", "/data", "--max-records", "7"]).unwrap();
        assert_eq!(args.output_root, Some(PathBuf::from("/data")));
        assert_eq!(args.max_records, Some(7));
        assert!(args.input_file.is_none());
    }

    #[test]
    fn rejects_unknown_arguments() {
        let err = BatchArgs::from_slice(&["--bogus"]).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }

    #[test]
    fn rejects_missing_values() {
        let err = BatchArgs::from_slice(&["--input"]).unwrap_err();
        assert!(err.to_string().contains("--input requires a value"));
    }

    #[test]
    fn rejects_non_numeric_record_limit() {
        let err = BatchArgs::from_slice(&["--max-records=plenty"]).unwrap_err();
        assert!(err.to_string().contains("--max-records must be a number"));
    }

    #[test]
    fn empty_invocation_overrides_nothing() {
        let args = BatchArgs::from_slice(&[]).unwrap();
        assert!(args.output_root.is_none());
        assert!(args.input_file.is_none());
        assert!(args.max_records.is_none());
        assert!(args.env_path.is_none());
    }

    #[test]
    fn empty_input_reports_what_is_already_on_disk() {
        let root = tempdir().unwrap();
        let archived_dir = root.path().join("output").join("123");
        fs::create_dir_all(&archived_dir).unwrap();
        metadata::write_metadata(
            &archived_dir,
            &VideoMetadata {
                id: "123".into(),
                title: "t".into(),
                description: "d".into(),
                length: Some("01:30".into()),
                uploaded: 0,
            },
        )
        .unwrap();
        // A directory with only a failure marker does not count.
        let failed_dir = root.path().join("output").join("456");
        fs::create_dir_all(&failed_dir).unwrap();
        fs::write(failed_dir.join(metadata::FAILURE_FILE), "{}").unwrap();

        let input = root.path().join("dump.txt");
        let mut file = File::create(&input).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "   ").unwrap();

        let settings = settings_with(&root.path().join("output"), &input);
        let summary = run_batch(&settings, &CancelFlag::default()).unwrap();

        assert_eq!(summary.archived, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
        assert!(!summary.cancelled);
        assert_eq!(summary.on_disk, 1);
    }

    #[test]
    fn pre_cancelled_run_touches_no_records() {
        let root = tempdir().unwrap();
        let input = root.path().join("dump.txt");
        fs::write(&input, "123;gvibirIDt;gvibirDESCd;gvibirLEN01:30;gvibirDATE20210615120000;gvibirPICp;gvibirURLu\n").unwrap();

        let cancel = CancelFlag::default();
        cancel.cancel();

        let settings = settings_with(&root.path().join("output"), &input);
        let summary = run_batch(&settings, &cancel).unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.archived, 0);
        assert_eq!(summary.on_disk, 0);
    }

    #[test]
    fn missing_input_file_is_an_error() {
        let root = tempdir().unwrap();
        let settings = settings_with(
            &root.path().join("output"),
            &root.path().join("missing.txt"),
        );
        let err = run_batch(&settings, &CancelFlag::default()).unwrap_err();
        assert!(err.to_string().contains("opening"));
    }
}
