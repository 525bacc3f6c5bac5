#![forbid(unsafe_code)]

//! Retrying streaming downloader.
//!
//! Transient network trouble is never surfaced to callers: read timeouts and
//! connection failures sleep a fixed backoff and retry the same request
//! forever, trading bounded latency for eventual completion of the batch.
//! Only a non-200 status is permanent. Bodies stream into a `.part` file
//! that is renamed into place on success, so an interrupted attempt never
//! leaves a truncated file that looks finished.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const CHUNK_SIZE: usize = 8192;

/// Process-wide transferred-byte accounting, shared across all downloads.
#[derive(Debug, Default)]
pub struct TrafficCounter(AtomicU64);

impl TrafficCounter {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn megabytes(&self) -> f64 {
        self.total() as f64 / (1024.0 * 1024.0)
    }
}

/// Timeouts and backoffs for one fetcher. Tests shrink these to keep the
/// retry loop bounded; production uses the defaults.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-attempt connect and read timeout.
    pub request_timeout: Duration,
    /// Sleep after a read timeout before retrying.
    pub timeout_backoff: Duration,
    /// Sleep after a connection failure before retrying.
    pub connect_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            timeout_backoff: Duration::from_secs(30),
            connect_backoff: Duration::from_secs(10),
        }
    }
}

/// Terminal result of a download. Transient conditions never produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { bytes: u64 },
    /// The server answered with something other than 200. Permanent for
    /// this resource; no retry.
    HttpError { status: u16 },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

/// Blocking HTTP downloader with infinite fixed-backoff retry.
pub struct Fetcher {
    agent: ureq::Agent,
    config: FetchConfig,
    traffic: Arc<TrafficCounter>,
}

impl Fetcher {
    pub fn new(config: FetchConfig, traffic: Arc<TrafficCounter>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.request_timeout)
            .timeout_read(config.request_timeout)
            .build();
        Self {
            agent,
            config,
            traffic,
        }
    }

    pub fn traffic(&self) -> &TrafficCounter {
        &self.traffic
    }

    /// Streams `url` into `dest`.
    ///
    /// Blocks until the server either serves the full body (success) or
    /// answers with a non-200 status (permanent failure). Filesystem
    /// problems and structurally broken URLs are hard errors.
    pub fn download(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        let part_path = partial_path(dest);

        loop {
            let response = match self.agent.get(url).call() {
                Ok(response) => response,
                Err(ureq::Error::Status(status, _)) => {
                    return Ok(FetchOutcome::HttpError { status });
                }
                Err(ureq::Error::Transport(transport)) => {
                    match transport.kind() {
                        ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                            bail!("unusable download URL {url}: {transport}");
                        }
                        _ => {
                            self.wait_out(transport_backoff(&transport, &self.config));
                            continue;
                        }
                    }
                }
            };

            let status = response.status();
            if status != 200 {
                return Ok(FetchOutcome::HttpError { status });
            }

            match self.stream_body(response, &part_path) {
                Ok(bytes) => {
                    fs::rename(&part_path, dest)
                        .with_context(|| format!("finalizing {}", dest.display()))?;
                    return Ok(FetchOutcome::Success { bytes });
                }
                Err(StreamError::Io(err)) => {
                    // Partial body. Discard it and retry the whole request.
                    let _ = fs::remove_file(&part_path);
                    self.wait_out(io_backoff(&err, &self.config));
                }
                Err(StreamError::File(err)) => {
                    let _ = fs::remove_file(&part_path);
                    return Err(err);
                }
            }
        }
    }

    fn stream_body(
        &self,
        response: ureq::Response,
        part_path: &Path,
    ) -> Result<u64, StreamError> {
        let mut reader = response.into_reader();
        let mut file = File::create(part_path)
            .with_context(|| format!("creating {}", part_path.display()))
            .map_err(StreamError::File)?;

        let mut buffer = [0u8; CHUNK_SIZE];
        let mut bytes: u64 = 0;
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    file.write_all(&buffer[..read])
                        .with_context(|| format!("writing {}", part_path.display()))
                        .map_err(StreamError::File)?;
                    self.traffic.add(read as u64);
                    bytes += read as u64;
                }
                Err(err) => return Err(StreamError::Io(err)),
            }
        }

        file.flush()
            .with_context(|| format!("flushing {}", part_path.display()))
            .map_err(StreamError::File)?;
        Ok(bytes)
    }

    fn wait_out(&self, backoff: Duration) {
        if !backoff.is_zero() {
            eprintln!("Download hiccup, retrying in {} seconds.", backoff.as_secs());
        }
        thread::sleep(backoff);
    }
}

enum StreamError {
    /// Network-side read failure; the attempt is retried.
    Io(std::io::Error),
    /// Local filesystem failure; propagated as a hard error.
    File(anyhow::Error),
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

fn io_backoff(err: &std::io::Error, config: &FetchConfig) -> Duration {
    if is_timeout(err) {
        config.timeout_backoff
    } else {
        config.connect_backoff
    }
}

fn transport_backoff(transport: &ureq::Transport, config: &FetchConfig) -> Duration {
    use std::error::Error as _;
    let timed_out = transport
        .source()
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(is_timeout);
    if timed_out {
        config.timeout_backoff
    } else {
        config.connect_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use tempfile::tempdir;

    /// Behaviors a stub connection can exhibit, in accept order.
    enum Serve {
        /// Accept and immediately close, simulating a dead peer.
        Drop,
        /// Read the request, answer with the given status and body.
        Respond(u16, &'static str),
    }

    fn test_config() -> FetchConfig {
        FetchConfig {
            request_timeout: Duration::from_secs(5),
            timeout_backoff: Duration::ZERO,
            connect_backoff: Duration::ZERO,
        }
    }

    /// One-shot HTTP stub on a loopback port; handles each scripted
    /// connection in order, then exits.
    fn spawn_server(script: Vec<Serve>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for step in script {
                let (stream, _) = listener.accept().unwrap();
                match step {
                    Serve::Drop => drop(stream),
                    Serve::Respond(status, body) => {
                        let mut reader = std::io::BufReader::new(stream);
                        // Consume the request head before answering.
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).unwrap_or(0) == 0
                                || line == "\r\n"
                            {
                                break;
                            }
                        }
                        let mut stream = reader.into_inner();
                        let reason = if status == 200 { "OK" } else { "Not Found" };
                        let head = format!(
                            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        stream.write_all(head.as_bytes()).unwrap();
                        stream.write_all(body.as_bytes()).unwrap();
                        stream.flush().unwrap();
                    }
                }
            }
        });
        format!("http://{addr}/video.flv")
    }

    #[test]
    fn downloads_body_and_counts_traffic() {
        let url = spawn_server(vec![Serve::Respond(200, "hello")]);
        let traffic = Arc::new(TrafficCounter::default());
        let fetcher = Fetcher::new(test_config(), traffic.clone());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("videoplayback.flv");

        let outcome = fetcher.download(&url, &dest).unwrap();
        assert_eq!(outcome, FetchOutcome::Success { bytes: 5 });
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");
        assert_eq!(traffic.total(), 5);
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn non_200_status_is_a_permanent_failure() {
        let url = spawn_server(vec![Serve::Respond(404, "")]);
        let fetcher = Fetcher::new(test_config(), Arc::new(TrafficCounter::default()));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("videoplayback.flv");

        let outcome = fetcher.download(&url, &dest).unwrap();
        assert_eq!(outcome, FetchOutcome::HttpError { status: 404 });
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn retries_dropped_connections_until_success() {
        let url = spawn_server(vec![
            Serve::Drop,
            Serve::Drop,
            Serve::Respond(200, "third time"),
        ]);
        let fetcher = Fetcher::new(test_config(), Arc::new(TrafficCounter::default()));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("videoplayback.flv");

        let outcome = fetcher.download(&url, &dest).unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Success {
                bytes: "third time".len() as u64
            }
        );
        assert_eq!(fs::read_to_string(&dest).unwrap(), "third time");
    }

    #[test]
    fn structurally_broken_url_is_a_hard_error() {
        let fetcher = Fetcher::new(test_config(), Arc::new(TrafficCounter::default()));
        let dir = tempdir().unwrap();
        let err = fetcher
            .download("not-a-url", &dir.path().join("out"))
            .unwrap_err();
        assert!(err.to_string().contains("unusable download URL"));
    }

    #[test]
    fn backoff_class_follows_the_error_kind() {
        let config = FetchConfig {
            request_timeout: Duration::from_secs(5),
            timeout_backoff: Duration::from_secs(30),
            connect_backoff: Duration::from_secs(10),
        };

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(io_backoff(&timed_out, &config), config.timeout_backoff);
        let would_block = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(io_backoff(&would_block, &config), config.timeout_backoff);

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(io_backoff(&refused, &config), config.connect_backoff);
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(io_backoff(&reset, &config), config.connect_backoff);
    }

    #[test]
    fn traffic_counter_accumulates_and_reports_megabytes() {
        let traffic = TrafficCounter::default();
        traffic.add(512 * 1024);
        traffic.add(512 * 1024);
        assert_eq!(traffic.total(), 1024 * 1024);
        assert!((traffic.megabytes() - 1.0).abs() < f64::EPSILON);
    }
}
