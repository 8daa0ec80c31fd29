use crate::types::SyncError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const CONVERTER_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROGRAM_ENV: &str = "CONFLUENCE_CONVERTER";
const DEFAULT_PROGRAM: &str = "cmark-confluence";

/// External markdown <-> storage-format converter, one subprocess per
/// conversion. Arguments are passed as a list, never through a shell;
/// stdin/stdout carry raw bytes.
#[derive(Debug, Clone)]
pub struct DocConverter {
    program: String,
    timeout: Duration,
}

impl DocConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: CONVERTER_TIMEOUT,
        }
    }

    pub fn from_env() -> Self {
        let program =
            std::env::var(PROGRAM_ENV).unwrap_or_else(|_| DEFAULT_PROGRAM.to_string());
        Self::new(program)
    }

    #[cfg(test)]
    pub fn with_timeout(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Load-phase availability check. A missing binary aborts the run before
    /// any remote call.
    pub async fn probe(&self) -> Result<(), SyncError> {
        self.run("--version", b"").await.map(|_| ()).map_err(|e| {
            SyncError::Config {
                path: PathBuf::from(&self.program),
                reason: format!(
                    "converter unavailable ({}); install it or set {}",
                    e, PROGRAM_ENV
                ),
            }
        })
    }

    pub async fn storage_to_markdown(&self, storage: &str) -> Result<String, SyncError> {
        let out = self.run("--to-markdown", storage.as_bytes()).await?;
        decode_utf8(out)
    }

    pub async fn markdown_to_storage(&self, markdown: &str) -> Result<String, SyncError> {
        let out = self.run("--to-storage", markdown.as_bytes()).await?;
        decode_utf8(out)
    }

    async fn run(&self, mode: &str, input: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut child = Command::new(&self.program)
            .arg(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::Conversion {
                reason: format!("failed to spawn {}: {}", self.program, e),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| SyncError::Conversion {
            reason: "converter stdin unavailable".to_string(),
        })?;
        let input = input.to_vec();
        let writer = tokio::spawn(async move {
            // The child closing its end early just ends the write.
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SyncError::Conversion {
                reason: format!(
                    "{} {} timed out after {}s",
                    self.program,
                    mode,
                    self.timeout.as_secs()
                ),
            })?
            .map_err(|e| SyncError::Conversion {
                reason: format!("waiting for {}: {}", self.program, e),
            })?;
        writer.abort();

        if !output.status.success() {
            return Err(SyncError::Conversion {
                reason: format!(
                    "{} {} exited with {}: {}",
                    self.program,
                    mode,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String, SyncError> {
    String::from_utf8(bytes).map_err(|e| SyncError::Conversion {
        reason: format!("converter produced invalid UTF-8: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn fake_converter(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-converter");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn pipes_stdin_to_stdout() {
        let tmp = TempDir::new().unwrap();
        let prog = fake_converter(tmp.path(), "exec tr 'a-z' 'A-Z'");
        let converter = DocConverter::new(prog);
        let out = converter.markdown_to_storage("# heading\n").await.unwrap();
        assert_eq!(out, "# HEADING\n");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let tmp = TempDir::new().unwrap();
        let prog = fake_converter(tmp.path(), "echo 'unsupported macro' >&2; exit 3");
        let converter = DocConverter::new(prog);
        let err = converter.storage_to_markdown("<p/>").await.unwrap_err();
        match err {
            SyncError::Conversion { reason } => assert!(reason.contains("unsupported macro")),
            other => panic!("expected conversion error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn hung_converter_is_killed_on_deadline() {
        let tmp = TempDir::new().unwrap();
        let prog = fake_converter(tmp.path(), "sleep 60");
        let converter = DocConverter::with_timeout(prog, Duration::from_millis(200));
        let err = converter.markdown_to_storage("x").await.unwrap_err();
        match err {
            SyncError::Conversion { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn probe_reports_missing_binary_as_config_error() {
        let converter = DocConverter::new("confluence-sync-no-such-binary");
        let err = converter.probe().await.unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }
}
