//! Artifact persistence.
//!
//! Writes reassembled conversations and per-direction streams as raw
//! binary files under the configured output root, and credential audit
//! records as JSON lines. I/O failures are logged with context and never
//! propagated past the reader pipeline.

pub mod harvest;

use self::harvest::Credentials;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("creating {0}: {1}")]
    Dir(PathBuf, #[source] std::io::Error),

    #[error("writing {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("encoding credential record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Writes artifacts under one output root.
#[derive(Debug, Clone)]
pub struct Persist {
    out: PathBuf,
}

impl Persist {
    pub fn new(out: impl Into<PathBuf>) -> Self {
        Persist { out: out.into() }
    }

    /// Appends a conversation to
    /// `<out>/tcpConnections/<class>/<ident>.bin`. Returns `true` on
    /// success; failures are logged.
    pub fn save_connection(&self, class: &str, ident: &str, data: &[u8]) -> bool {
        let dir = self.out.join("tcpConnections").join(class);
        match self.append(&dir, ident, data) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("saving connection {}: {}", ident, e);
                false
            }
        }
    }

    /// Appends one direction's bytes to
    /// `<out>/tcpStreams/<class>/<ident>.bin`.
    pub fn save_stream(&self, class: &str, ident: &str, data: &[u8]) -> bool {
        let dir = self.out.join("tcpStreams").join(class);
        match self.append(&dir, ident, data) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("saving stream {}: {}", ident, e);
                false
            }
        }
    }

    /// Appends a credential record to `<out>/credentials.jsonl`.
    pub fn write_credentials(&self, record: &Credentials) -> bool {
        match self.append_credentials(record) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("writing credentials for {}: {}", record.flow, e);
                false
            }
        }
    }

    fn append(&self, dir: &Path, ident: &str, data: &[u8]) -> Result<(), PersistError> {
        ensure_dir(dir)?;
        let path = dir.join(format!("{}.bin", sanitize_ident(ident)));
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| PersistError::Write(path.clone(), e))?;
        file.write_all(data)
            .map_err(|e| PersistError::Write(path, e))
    }

    fn append_credentials(&self, record: &Credentials) -> Result<(), PersistError> {
        ensure_dir(&self.out)?;
        let mut line = serde_json::to_vec(record).map_err(PersistError::Encode)?;
        line.push(b'\n');
        let path = self.out.join("credentials.jsonl");
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| PersistError::Write(path.clone(), e))?;
        file.write_all(&line)
            .map_err(|e| PersistError::Write(path, e))
    }
}

fn ensure_dir(path: &Path) -> Result<(), PersistError> {
    fs::create_dir_all(path).map_err(|e| PersistError::Dir(path.to_path_buf(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

/// Strips path separators from a flow identifier so it is safe as a file
/// name.
pub fn sanitize_ident(ident: &str) -> String {
    ident.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("seine-persist-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_ident("a/b\\c"), "a_b_c");
        assert_eq!(
            sanitize_ident("10.0.0.1:80-10.0.0.2:4242"),
            "10.0.0.1:80-10.0.0.2:4242"
        );
    }

    #[test]
    fn connection_artifacts_append() {
        let root = scratch("conn");
        let persist = Persist::new(&root);
        assert!(persist.save_connection("http", "a:1-b:2", b"hello "));
        assert!(persist.save_connection("http", "a:1-b:2", b"world"));
        let written =
            fs::read(root.join("tcpConnections").join("http").join("a:1-b:2.bin")).unwrap();
        assert_eq!(written, b"hello world");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn credentials_are_json_lines() {
        let root = scratch("creds");
        let persist = Persist::new(&root);
        let record = Credentials {
            timestamp: "2026-01-01T00:00:00Z".into(),
            harvester: "ftp",
            service: "ftp".into(),
            flow: "a:1-b:21".into(),
            user: "alice".into(),
            password: "hunter2".into(),
            notes: None,
        };
        assert!(persist.write_credentials(&record));
        assert!(persist.write_credentials(&record));
        let written = fs::read_to_string(root.join("credentials.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains("\"user\":\"alice\""));
        let _ = fs::remove_dir_all(&root);
    }
}
