// Docker CLI Driver
// Implements ContainerDriver by shelling out to the docker binary

use super::{ArchiveReader, CommandOutput, ContainerDriver, DriverError, ImageSummary};

use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{ChildStdout, Command};

/// Driver for one running container, using the `docker` command line
#[derive(Debug, Clone)]
pub struct DockerCliDriver {
    docker: PathBuf,
    container: String,
    /// Daemon holding the image store, e.g. the step's docker service
    docker_host: Option<String>,
}

impl DockerCliDriver {
    /// Locate `docker` on PATH and target `container`
    pub fn new(container: impl Into<String>) -> Result<Self, DriverError> {
        let docker =
            which::which("docker").map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        Ok(Self {
            docker,
            container: container.into(),
            docker_host: None,
        })
    }

    /// Run image-store commands against another daemon (`docker -H <host>`)
    pub fn with_docker_host(mut self, host: impl Into<String>) -> Self {
        self.docker_host = Some(host.into());
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Check that the docker daemon answers
    pub async fn is_available(&self) -> bool {
        let output = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.docker);
        command.kill_on_drop(true);
        command
    }

    fn image_command(&self) -> Command {
        let mut command = self.command();
        if let Some(host) = &self.docker_host {
            command.arg("-H").arg(host);
        }
        command
    }

    /// Feed `archive` to the command's stdin and wait for it
    async fn pipe_into(
        &self,
        mut command: Command,
        mut archive: ArchiveReader,
    ) -> Result<std::process::Output, DriverError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::CommandFailed("stdin not captured".to_string()))?;

        // stdout and stderr drain while stdin is written
        let feed = async move {
            let copied = tokio::io::copy(&mut archive, &mut stdin).await;
            drop(stdin);
            copied
        };
        let (copied, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match copied {
            // the process exiting early closes the pipe; its status tells the story
            Err(e) if output.status.success() => Err(DriverError::IoError(e)),
            _ => Ok(output),
        }
    }

    /// Spawn a command whose stdout is a tar stream
    fn stream_from(&self, mut command: Command, label: String) -> Result<ArchiveReader, DriverError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::CommandFailed("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::CommandFailed("stderr not captured".to_string()))?;

        let captured = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        let exit = async move {
            let status = child.wait().await?;
            let stderr = captured.await.unwrap_or_default();
            Ok::<_, io::Error>((status, stderr))
        };

        Ok(Box::pin(ProcessArchive {
            stdout,
            exit: Some(Box::pin(exit)),
            label,
        }))
    }
}

#[async_trait::async_trait]
impl ContainerDriver for DockerCliDriver {
    async fn run_command(&self, script: &str) -> Result<CommandOutput, DriverError> {
        let output = self
            .command()
            .args(["exec", self.container.as_str(), "sh", "-c", script])
            .output()
            .await
            .map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn put_archive(
        &self,
        destination_dir: &str,
        archive: ArchiveReader,
    ) -> Result<bool, DriverError> {
        let destination = format!("{}:{}", self.container, destination_dir);
        let mut command = self.command();
        command.args(["cp", "-", destination.as_str()]);

        let output = self.pipe_into(command, archive).await?;
        if !output.status.success() {
            return Err(DriverError::CommandFailed(format!(
                "docker cp into {}: {}",
                destination,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(true)
    }

    async fn get_archive(&self, source_path: &str) -> Result<ArchiveReader, DriverError> {
        let source = format!("{}:{}", self.container, source_path);
        let mut command = self.command();
        command.args(["cp", source.as_str(), "-"]);
        self.stream_from(command, format!("docker cp {}", source_path))
    }

    async fn path_exists(&self, path: &str) -> Result<bool, DriverError> {
        let status = self
            .command()
            .args(["exec", self.container.as_str(), "test", "-e", path])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        Ok(status.success())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError> {
        let output = self
            .image_command()
            .args(["image", "ls", "--no-trunc", "--format", "{{json .}}"])
            .output()
            .await
            .map_err(|e| DriverError::DockerNotAvailable(e.to_string()))?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed(format!(
                "docker image ls: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_image_list(&String::from_utf8_lossy(&output.stdout))
    }

    async fn load_image(&self, archive: ArchiveReader) -> Result<(), DriverError> {
        let mut command = self.image_command();
        command.arg("load");

        let output = self.pipe_into(command, archive).await?;
        if !output.status.success() {
            return Err(DriverError::CommandFailed(format!(
                "docker load: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn save_image(&self, image: &ImageSummary) -> Result<ArchiveReader, DriverError> {
        let mut command = self.image_command();
        command.args(["save", image.reference()]);
        self.stream_from(command, format!("docker save {}", image.reference()))
    }
}

type ExitFuture = Pin<Box<dyn Future<Output = io::Result<(ExitStatus, String)>> + Send>>;

/// Stdout of a child process that reports a failed exit, with its stderr, as a read error at EOF
struct ProcessArchive {
    stdout: ChildStdout,
    exit: Option<ExitFuture>,
    label: String,
}

impl AsyncRead for ProcessArchive {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // EOF: the stream is only complete if the process succeeded
        if let Some(exit) = this.exit.as_mut() {
            let (status, stderr) = ready!(exit.as_mut().poll(cx))?;
            this.exit = None;
            if !status.success() {
                let mut message = format!("{} exited with {}", this.label, status);
                if !stderr.is_empty() {
                    message.push_str(": ");
                    message.push_str(&stderr);
                }
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, message)));
            }
        }

        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Deserialize)]
struct ImageLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository", default)]
    repository: String,
    #[serde(rename = "Tag", default)]
    tag: String,
}

/// Parse `docker image ls --format '{{json .}}'`, merging rows of the same image
fn parse_image_list(output: &str) -> Result<Vec<ImageSummary>, DriverError> {
    let mut images: Vec<ImageSummary> = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: ImageLine = serde_json::from_str(line)
            .map_err(|e| DriverError::InvalidOutput(format!("{}: {}", e, line)))?;

        let tag = (row.repository != "<none>" && row.tag != "<none>" && !row.repository.is_empty())
            .then(|| format!("{}:{}", row.repository, row.tag));

        match images.iter_mut().find(|image| image.id == row.id) {
            Some(image) => image.tags.extend(tag),
            None => images.push(ImageSummary {
                id: row.id,
                tags: tag.into_iter().collect(),
            }),
        }
    }

    Ok(images)
}
