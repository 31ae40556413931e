//! Container and pod transports.
//!
//! Both wrap the source in the USTAR framer and pipe the archive into the
//! stdin of an external extract operation: `docker cp -` for containers
//! (the engine's extract-archive-to-path entry point) and
//! `kubectl exec ... tar -xf -` for pods. Stderr is drained completely and
//! the diagnostics are reported verbatim on failure.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use fastcopy_core::TransferError;
use transfer::{CopyContext, ProgressFn, copy_stream};

use crate::tar::{TarFrame, framed_size};

/// How a remote extract process is launched and judged.
struct ExecSpec {
    program: &'static str,
    args: Vec<String>,
    /// When set, any stderr output fails the transfer even on exit 0.
    fail_on_stderr: bool,
    label: String,
}

/// Transport extracting into a Docker container via `docker cp -`.
#[derive(Debug, Clone)]
pub struct ContainerTransport {
    container_id: String,
    path: String,
}

impl ContainerTransport {
    pub(crate) fn new(container_id: String, path: String) -> Self {
        Self { container_id, path }
    }

    fn spec(&self) -> Result<(ExecSpec, String), TransferError> {
        let (parent, name) = split_remote_path(&self.path)?;
        let spec = ExecSpec {
            program: "docker",
            args: vec!["cp".to_string(), "-".to_string(), format!("{}:{parent}", self.container_id)],
            fail_on_stderr: false,
            label: format!("docker cp to {}", self.container_id),
        };
        Ok((spec, name))
    }

    /// Streams `source` into the container as a framed archive.
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        ctx: &CopyContext,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (spec, name) = self.spec()?;
        stream_through_process(spec, source, size, &name, ctx, on_progress).await
    }
}

/// Transport extracting into a Kubernetes pod via `kubectl exec`.
#[derive(Debug, Clone)]
pub struct PodTransport {
    namespace: String,
    pod: String,
    path: String,
}

impl PodTransport {
    pub(crate) fn new(namespace: String, pod: String, path: String) -> Self {
        Self { namespace, pod, path }
    }

    fn spec(&self) -> Result<(ExecSpec, String), TransferError> {
        let (parent, name) = split_remote_path(&self.path)?;
        let spec = ExecSpec {
            program: "kubectl",
            args: vec![
                "exec".to_string(),
                "-i".to_string(),
                "-n".to_string(),
                self.namespace.clone(),
                self.pod.clone(),
                "--".to_string(),
                "tar".to_string(),
                "-xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                parent,
            ],
            fail_on_stderr: true,
            label: format!("kubectl exec in {}/{}", self.namespace, self.pod),
        };
        Ok((spec, name))
    }

    /// Streams `source` into the pod as a framed archive.
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        ctx: &CopyContext,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (spec, name) = self.spec()?;
        stream_through_process(spec, source, size, &name, ctx, on_progress).await
    }
}

/// Splits an in-container path into the extract directory and entry name.
fn split_remote_path(path: &str) -> Result<(String, String), TransferError> {
    let path = Path::new(path);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TransferError::bad_input(format!("destination path has no file name: {path:?}"))
        })?
        .to_string();
    let parent = path
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .filter(|parent| !parent.is_empty())
        .unwrap_or_else(|| "/".to_string());
    Ok((parent, name))
}

/// Frames the source, spawns the extract process, and feeds its stdin.
async fn stream_through_process<R>(
    spec: ExecSpec,
    source: R,
    size: Option<u64>,
    entry_name: &str,
    ctx: &CopyContext,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(size) = size else {
        return Err(TransferError::bad_input(
            "container and pod destinations require a known source size",
        ));
    };
    let frame = TarFrame::new(source, entry_name, size);

    let mut child = Command::new(spec.program)
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            TransferError::remote(format!("failed to start {}: {error}", spec.program))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransferError::remote(format!("{}: stdin unavailable", spec.label)))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransferError::remote(format!("{}: stderr unavailable", spec.label)))?;
    let stderr_task = tokio::spawn(async move {
        let mut output = Vec::new();
        let _ = stderr.read_to_end(&mut output).await;
        output
    });

    let copy_result = copy_stream(frame, &mut stdin, Some(framed_size(size)), ctx, on_progress).await;
    let _ = stdin.shutdown().await;
    drop(stdin);

    if copy_result.is_err() {
        let _ = child.kill().await;
    }
    let status = child.wait().await?;
    let stderr_output =
        String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).trim().to_string();

    let total = copy_result?;
    if !status.success() {
        return Err(TransferError::remote(format!(
            "{} exited with {status}: {stderr_output}",
            spec.label
        )));
    }
    if spec.fail_on_stderr && !stderr_output.is_empty() {
        return Err(TransferError::remote(format!("{}: {stderr_output}", spec.label)));
    }
    debug!(label = %spec.label, total, "remote extract complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn container_command_targets_parent_directory() {
        let transport =
            ContainerTransport::new("web-1".to_string(), "/var/www/index.html".to_string());
        let (spec, name) = transport.spec().expect("spec");
        assert_eq!(spec.program, "docker");
        assert_eq!(spec.args, ["cp", "-", "web-1:/var/www"]);
        assert_eq!(name, "index.html");
        assert!(!spec.fail_on_stderr);
    }

    #[test]
    fn pod_command_execs_tar_extract() {
        let transport = PodTransport::new(
            "prod".to_string(),
            "api-0".to_string(),
            "/etc/app/config.yaml".to_string(),
        );
        let (spec, name) = transport.spec().expect("spec");
        assert_eq!(spec.program, "kubectl");
        assert_eq!(
            spec.args,
            ["exec", "-i", "-n", "prod", "api-0", "--", "tar", "-xf", "-", "-C", "/etc/app"]
        );
        assert_eq!(name, "config.yaml");
        assert!(spec.fail_on_stderr);
    }

    #[test]
    fn root_level_path_extracts_into_root() {
        let (parent, name) = split_remote_path("/payload.bin").expect("split");
        assert_eq!(parent, "/");
        assert_eq!(name, "payload.bin");
    }

    #[tokio::test]
    async fn unknown_size_is_rejected() {
        let transport = ContainerTransport::new("web-1".to_string(), "/srv/a".to_string());
        let result = transport
            .copy_stream_to(Cursor::new(Vec::new()), None, &CopyContext::default(), None)
            .await;
        assert!(matches!(result, Err(TransferError::BadInput { .. })));
    }

    #[tokio::test]
    async fn drains_archive_into_a_consuming_process() {
        let data = vec![0x5Au8; 10_000];
        let spec = ExecSpec {
            program: "sh",
            args: vec!["-c".to_string(), "cat >/dev/null".to_string()],
            fail_on_stderr: true,
            label: "test sink".to_string(),
        };
        let ctx = CopyContext::unpaced(CancellationToken::new());
        let total = stream_through_process(
            spec,
            Cursor::new(data.clone()),
            Some(data.len() as u64),
            "blob.bin",
            &ctx,
            None,
        )
        .await
        .expect("stream");
        assert_eq!(total, framed_size(data.len() as u64));
    }

    #[tokio::test]
    async fn failing_process_reports_stderr_verbatim() {
        let spec = ExecSpec {
            program: "sh",
            args: vec!["-c".to_string(), "cat >/dev/null; echo 'no space left' >&2; exit 3".to_string()],
            fail_on_stderr: false,
            label: "test sink".to_string(),
        };
        let ctx = CopyContext::unpaced(CancellationToken::new());
        let error = stream_through_process(
            spec,
            Cursor::new(vec![1u8; 100]),
            Some(100),
            "blob.bin",
            &ctx,
            None,
        )
        .await
        .expect_err("must fail");
        let TransferError::Remote { message } = error else {
            panic!("expected remote error");
        };
        assert!(message.contains("no space left"));
    }

    #[tokio::test]
    async fn stderr_chatter_fails_strict_transports() {
        let spec = ExecSpec {
            program: "sh",
            args: vec!["-c".to_string(), "cat >/dev/null; echo 'tar: warning' >&2".to_string()],
            fail_on_stderr: true,
            label: "test sink".to_string(),
        };
        let ctx = CopyContext::unpaced(CancellationToken::new());
        let error = stream_through_process(
            spec,
            Cursor::new(vec![1u8; 100]),
            Some(100),
            "blob.bin",
            &ctx,
            None,
        )
        .await
        .expect_err("must fail");
        assert!(matches!(error, TransferError::Remote { .. }));
    }
}
