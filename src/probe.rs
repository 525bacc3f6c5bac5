#![forbid(unsafe_code)]

//! Derives a display duration from a downloaded media file.
//!
//! Used when the source metadata omitted the length field. The probe shells
//! out to `ffprobe`; any failure is reported and mapped to `None` so the
//! record can still be archived without a length value.

use std::path::Path;
use std::process::Command;
#[cfg(test)]
use std::path::PathBuf;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};

#[cfg(test)]
static FFPROBE_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn ffprobe_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = FFPROBE_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("ffprobe")
}

#[cfg(test)]
pub fn set_ffprobe_stub_path(path: PathBuf) -> FfprobeStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = FFPROBE_STUB.lock().unwrap();
        *lock = Some(path);
    }
    FfprobeStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub struct FfprobeStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for FfprobeStubGuard {
    fn drop(&mut self) {
        *FFPROBE_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Formats whole seconds as `HH:MM:SS` when the duration reaches an hour,
/// `MM:SS` otherwise.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

fn probe_duration_seconds(path: &Path) -> Result<u64> {
    let output = ffprobe_command()
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .with_context(|| format!("running ffprobe on {}", path.display()))?;

    if !output.status.success() {
        bail!(
            "ffprobe failed for {} (status {})",
            path.display(),
            output.status
        );
    }

    let raw = String::from_utf8(output.stdout).context("reading ffprobe output as UTF-8")?;
    let seconds: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("parsing ffprobe duration {:?}", raw.trim()))?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("ffprobe reported a nonsensical duration {seconds}");
    }
    Ok(seconds as u64)
}

/// Returns the formatted duration of a media file, or `None` when the file
/// cannot be decoded. Decode problems are reported, not fatal: the caller
/// archives the record without a length instead of aborting it.
pub fn video_duration(path: &Path) -> Option<String> {
    match probe_duration_seconds(path) {
        Ok(seconds) => Some(format_duration(seconds)),
        Err(err) => {
            eprintln!("Could not determine duration of {}: {err}", path.display());
            None
        }
    }
}
