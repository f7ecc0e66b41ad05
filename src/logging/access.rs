//! Combined-format access log written to a size-rotated file.

use base64::Engine as _;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderName, AUTHORIZATION, REFERER, USER_AGENT};
use hyper::Request;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::config::Logging;

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// Request fields captured before dispatch, completed when the response ends.
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub vhost: String,
    pub remote_addr: Option<SocketAddr>,
    pub remote_user: Option<String>,
    pub method: String,
    pub uri: String,
    pub proto: String,
    pub referer: String,
    pub user_agent: String,
    pub time: DateTime<Local>,
}

impl AccessEntry {
    pub fn from_request<B>(req: &Request<B>, vhost: &str, remote_addr: Option<SocketAddr>) -> Self {
        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        Self {
            vhost: vhost.to_string(),
            remote_addr,
            remote_user: basic_auth_user(req),
            method: req.method().to_string(),
            uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            proto: format!("{:?}", req.version()),
            referer: header(REFERER),
            user_agent: header(USER_AGENT),
            time: Local::now(),
        }
    }

    /// `vhost remote - user [time] "METHOD URI PROTO" status bytes "referer" "ua" duration_ms`
    pub fn format(&self, status: u16, bytes: u64, duration: Duration) -> String {
        let remote = self
            .remote_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        let user = self.remote_user.as_deref().filter(|u| !u.is_empty()).unwrap_or("-");

        format!(
            "{} {} - {} [{}] \"{} {} {}\" {} {} \"{}\" \"{}\" {}\n",
            self.vhost,
            remote,
            user,
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.uri,
            self.proto,
            status,
            bytes,
            escape(&self.referer),
            escape(&self.user_agent),
            duration.as_millis(),
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn basic_auth_user<B>(req: &Request<B>) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split_once(':').map(|(user, _)| user.to_string())
}

/// Rotation settings derived from the `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_size_bytes: u64,
    pub max_age: Option<Duration>,
    pub max_backups: usize,
    pub compress: bool,
}

impl RotationPolicy {
    pub fn from_config(logging: &Logging) -> Self {
        let max_size_mb = match logging.max_size_mb {
            n if n > 0 => n as u64,
            _ => DEFAULT_MAX_SIZE_MB,
        };
        // An age too large to represent means no age limit.
        let max_age = u64::try_from(logging.max_age_days)
            .ok()
            .filter(|&days| days > 0)
            .and_then(|days| days.checked_mul(24 * 3600))
            .map(Duration::from_secs);
        Self {
            max_size_bytes: max_size_mb.saturating_mul(1024 * 1024),
            max_age,
            max_backups: usize::try_from(logging.max_backups).unwrap_or(0),
            compress: logging.compress,
        }
    }
}

/// Access log sink. The file is opened on first write.
#[derive(Debug)]
pub struct AccessLog {
    file: Mutex<RotatingFile>,
}

impl AccessLog {
    pub fn new(path: impl Into<PathBuf>, policy: RotationPolicy) -> Self {
        Self {
            file: Mutex::new(RotatingFile::new(path.into(), policy)),
        }
    }

    /// Build from config; `None` when no access log path is set.
    pub fn from_config(logging: &Logging) -> Option<Self> {
        let path = logging.access_log.as_ref().filter(|p| !p.as_os_str().is_empty())?;
        Some(Self::new(path, RotationPolicy::from_config(logging)))
    }

    pub fn write(&self, line: &str) {
        let mut file = self.file.lock();
        if let Err(e) = file.write_line(line.as_bytes()) {
            warn!(path = %file.path.display(), error = %e, "can't write access log");
        }
    }

    /// Move the current file aside as a backup and start a fresh one on next write.
    pub fn rotate(&self) {
        let mut file = self.file.lock();
        if let Err(e) = file.rotate() {
            warn!(path = %file.path.display(), error = %e, "can't rotate access log");
        }
    }
}

#[derive(Debug)]
struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    fn new(path: PathBuf, policy: RotationPolicy) -> Self {
        Self {
            path,
            policy,
            file: None,
            size: 0,
        }
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let len = line.len() as u64;
        if len > self.policy.max_size_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write length {len} exceeds maximum file size {}",
                    self.policy.max_size_bytes
                ),
            ));
        }

        if self.file.is_none() {
            self.open()?;
        }
        if self.size + len > self.policy.max_size_bytes {
            self.rotate()?;
            self.open()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "access log is not open"))?;
        file.write_all(line)?;
        self.size += len;
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        self.size = 0;

        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        let backup = backup_path(&self.path, Utc::now());
        fs::rename(&self.path, &backup)?;

        let path = self.path.clone();
        let policy = self.policy.clone();
        std::thread::spawn(move || {
            if let Err(e) = mill(&path, &policy) {
                warn!(path = %path.display(), error = %e, "can't clean up access log backups");
            }
        });
        Ok(())
    }
}

fn name_parts(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// `<dir>/<stem>-<timestamp><ext>`
fn backup_path(path: &Path, time: DateTime<Utc>) -> PathBuf {
    let (stem, ext) = name_parts(path);
    let name = format!("{stem}-{}{ext}", time.format(BACKUP_TIME_FORMAT));
    path.with_file_name(name)
}

#[derive(Debug)]
struct Backup {
    path: PathBuf,
    time: DateTime<Utc>,
    compressed: bool,
}

fn list_backups(path: &Path) -> io::Result<Vec<Backup>> {
    let dir = match path.parent().filter(|d| !d.as_os_str().is_empty()) {
        Some(d) => d.to_path_buf(),
        None => PathBuf::from("."),
    };
    let (stem, ext) = name_parts(path);
    let prefix = format!("{stem}-");

    let mut backups = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let (rest, compressed) = match rest.strip_suffix(".gz") {
            Some(r) => (r, true),
            None => (rest, false),
        };
        let Some(stamp) = rest.strip_suffix(ext.as_str()) else {
            continue;
        };
        let Ok(time) = NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT) else {
            continue;
        };
        backups.push(Backup {
            path: entry.path(),
            time: time.and_utc(),
            compressed,
        });
    }

    backups.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(backups)
}

/// Remove backups beyond the count and age limits, then compress the rest.
fn mill(path: &Path, policy: &RotationPolicy) -> io::Result<()> {
    let mut backups = list_backups(path)?;

    if policy.max_backups > 0 && backups.len() > policy.max_backups {
        for old in backups.split_off(policy.max_backups) {
            fs::remove_file(&old.path)?;
        }
    }

    let cutoff = policy
        .max_age
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .and_then(|age| Utc::now().checked_sub_signed(age));
    if let Some(cutoff) = cutoff {
        let (keep, expired): (Vec<_>, Vec<_>) =
            backups.into_iter().partition(|b| b.time >= cutoff);
        for old in expired {
            fs::remove_file(&old.path)?;
        }
        backups = keep;
    }

    if policy.compress {
        for backup in backups.iter().filter(|b| !b.compressed) {
            compress(&backup.path)?;
        }
    }

    Ok(())
}

fn compress(path: &Path) -> io::Result<()> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    let mut source = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}
