use chrono::DateTime;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

use crate::types::SampleRecord;

const DATA_EXTENSION: &str = "csv";
const LOG_FILE_NAME: &str = "log.txt";

pub fn init(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    info!(dir = %dir.display(), "Local storage ready");
    Ok(())
}

/// Identities name files and URL segments: ASCII letters, digits, `-`, `_` and
/// non-leading `.` only.
pub fn is_safe_identity(identity: &str) -> bool {
    !identity.is_empty()
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn data_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{identity}.{DATA_EXTENSION}"))
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_NAME)
}

/// Append-only data file of one deployment.
#[derive(Debug)]
pub struct DataLog {
    path: PathBuf,
    file: File,
}

impl DataLog {
    pub fn open(dir: &Path, identity: &str) -> io::Result<Self> {
        if !is_safe_identity(identity) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsafe deployment identity {identity:?}"),
            ));
        }
        let path = data_path(dir, identity);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Opened deployment data file");
        Ok(DataLog { path, file })
    }

    pub fn append(&mut self, record: &SampleRecord) -> io::Result<()> {
        writeln!(self.file, "{record}")?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Shared free-text log kept on the device until it is uploaded.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
}

impl DiagnosticLog {
    pub fn new(dir: &Path) -> Self {
        DiagnosticLog {
            path: log_path(dir),
        }
    }

    /// The file is reopened on every line so an upload may delete it in between.
    pub fn append(&self, timestamp: u32, message: impl Display) -> io::Result<()> {
        let stamp = DateTime::from_timestamp(timestamp as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| timestamp.to_string());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{stamp} {message}")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A file waiting to be transferred, with the number of chunks it splits into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub path: PathBuf,
    pub chunks: usize,
}

impl UploadJob {
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> io::Result<Self> {
        let path = path.into();
        let size = fs::metadata(&path)?.len() as usize;
        Ok(UploadJob {
            chunks: size.div_ceil(chunk_size.max(1)),
            path,
        })
    }
}

/// A data file left over from an earlier deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftoverData {
    pub identity: String,
    pub job: UploadJob,
}

/// Data files found in `dir`, oldest first.
pub fn leftover_data(dir: &Path, chunk_size: usize) -> io::Result<Vec<LeftoverData>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
            continue;
        }
        let Some(identity) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        let modified = entry.metadata()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        debug!(identity = %identity, "Found leftover data file");
        found.push((
            modified,
            LeftoverData {
                identity,
                job: UploadJob::new(path, chunk_size)?,
            },
        ));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.identity.cmp(&b.1.identity)));
    Ok(found.into_iter().map(|(_, leftover)| leftover).collect())
}

/// The diagnostic log, if it holds anything to upload.
pub fn leftover_log(dir: &Path, chunk_size: usize) -> io::Result<Option<UploadJob>> {
    let path = log_path(dir);
    if !path.is_file() {
        return Ok(None);
    }
    let job = UploadJob::new(path, chunk_size)?;
    Ok((job.chunks > 0).then_some(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn data_log_appends_parseable_lines() {
        let dir = tempdir().unwrap();
        let record = SampleRecord {
            timestamp: 1_000,
            depth: 12.5,
            temperature: 8.25,
            ticks: 42,
            flow_rate: 120.0,
        };
        {
            let mut log = DataLog::open(dir.path(), "04A1B2C3").unwrap();
            log.append(&record).unwrap();
            log.append(&SampleRecord { timestamp: 1_001, ..record }).unwrap();
        }

        let contents = fs::read_to_string(data_path(dir.path(), "04A1B2C3")).unwrap();
        let parsed: Vec<SampleRecord> = contents.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], record);
        assert_eq!(parsed[1].timestamp, 1_001);
    }

    #[test]
    fn identities_cannot_leave_the_data_directory() {
        assert!(is_safe_identity("04A1B2C3"));
        assert!(is_safe_identity("dive-2024_07.b"));
        for unsafe_identity in ["", "..", "../escape", "a/b", "a\\b", ".hidden", "tag 1"] {
            assert!(!is_safe_identity(unsafe_identity), "{unsafe_identity:?}");
        }

        let dir = tempdir().unwrap();
        let err = DataLog::open(dir.path(), "../escape").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!dir.path().join("../escape.csv").exists());
    }

    #[test]
    fn diagnostic_lines_are_timestamped() {
        let dir = tempdir().unwrap();
        let log = DiagnosticLog::new(dir.path());
        log.append(0, "Powered on").unwrap();
        log.append(60, format_args!("Pump {}", "on")).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, ["1970-01-01T00:00:00+00:00 Powered on", "1970-01-01T00:01:00+00:00 Pump on"]);
    }

    #[test]
    fn upload_job_counts_partial_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.csv");
        fs::write(&path, vec![b'x'; 2048 * 2 + 1]).unwrap();
        assert_eq!(UploadJob::new(&path, 2048).unwrap().chunks, 3);

        fs::write(&path, vec![b'x'; 2048]).unwrap();
        assert_eq!(UploadJob::new(&path, 2048).unwrap().chunks, 1);

        fs::write(&path, b"").unwrap();
        assert_eq!(UploadJob::new(&path, 2048).unwrap().chunks, 0);
    }

    #[test]
    fn leftovers_are_found_by_extension() {
        let dir = tempdir().unwrap();
        fs::write(data_path(dir.path(), "AAA"), b"1,2,3,4,5\n").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(leftover_log(dir.path(), 2048).unwrap(), None);

        DiagnosticLog::new(dir.path()).append(5, "hello").unwrap();

        let data = leftover_data(dir.path(), 2048).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].identity, "AAA");
        assert_eq!(data[0].job.chunks, 1);
        assert!(leftover_log(dir.path(), 2048).unwrap().is_some());
    }
}
