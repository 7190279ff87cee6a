// In-memory container driver that records every call

use super::{ArchiveReader, CommandOutput, ContainerDriver, DriverError, ImageSummary};

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    RunCommand(String),
    PutArchive(String),
    GetArchive(String),
    PathExists(String),
    ListImages,
    LoadImage,
    SaveImage(String),
}

/// Archive content served by [`FakeDriver::get_archive`] / [`FakeDriver::save_image`]
#[derive(Debug, Clone)]
pub enum FakeArchive {
    Complete(Vec<u8>),
    /// Yields the bytes, then fails
    Truncated(Vec<u8>),
}

impl FakeArchive {
    fn reader(&self) -> ArchiveReader {
        match self {
            FakeArchive::Complete(bytes) => Box::pin(io::Cursor::new(bytes.clone())),
            FakeArchive::Truncated(bytes) => {
                Box::pin(io::Cursor::new(bytes.clone()).chain(FailingReader))
            }
        }
    }
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "stream interrupted",
        )))
    }
}

#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<DriverCall>>,
    failing_commands: Vec<String>,
    reject_uploads: bool,
    existing_paths: HashSet<String>,
    archives: HashMap<String, FakeArchive>,
    images: Vec<(ImageSummary, FakeArchive)>,
    failing_loads: bool,
    delay: Option<Duration>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    loaded: Mutex<Vec<Vec<u8>>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with status 1
    pub fn fail_commands_containing(mut self, pattern: &str) -> Self {
        self.failing_commands.push(pattern.to_string());
        self
    }

    pub fn reject_uploads(mut self) -> Self {
        self.reject_uploads = true;
        self
    }

    pub fn with_archive(mut self, path: &str, archive: FakeArchive) -> Self {
        self.existing_paths.insert(path.to_string());
        self.archives.insert(path.to_string(), archive);
        self
    }

    pub fn with_image(mut self, image: ImageSummary, archive: FakeArchive) -> Self {
        self.images.push((image, archive));
        self
    }

    pub fn fail_loads(mut self) -> Self {
        self.failing_loads = true;
        self
    }

    /// Sleep before answering every command
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::RunCommand(script) => Some(script),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn loaded(&self) -> Vec<Vec<u8>> {
        self.loaded.lock().unwrap().clone()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ContainerDriver for FakeDriver {
    async fn run_command(&self, script: &str) -> Result<CommandOutput, DriverError> {
        self.record(DriverCall::RunCommand(script.to_string()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self.failing_commands.iter().any(|p| script.contains(p));
        Ok(CommandOutput {
            exit_code: if failed { 1 } else { 0 },
            output: if failed {
                "simulated failure".to_string()
            } else {
                String::new()
            },
        })
    }

    async fn put_archive(
        &self,
        destination_dir: &str,
        mut archive: ArchiveReader,
    ) -> Result<bool, DriverError> {
        self.record(DriverCall::PutArchive(destination_dir.to_string()));

        let mut bytes = Vec::new();
        archive.read_to_end(&mut bytes).await?;
        if self.reject_uploads {
            return Ok(false);
        }

        self.uploads
            .lock()
            .unwrap()
            .push((destination_dir.to_string(), bytes));
        Ok(true)
    }

    async fn get_archive(&self, source_path: &str) -> Result<ArchiveReader, DriverError> {
        self.record(DriverCall::GetArchive(source_path.to_string()));

        self.archives
            .get(source_path)
            .map(FakeArchive::reader)
            .ok_or_else(|| DriverError::CommandFailed(format!("no such path: {}", source_path)))
    }

    async fn path_exists(&self, path: &str) -> Result<bool, DriverError> {
        self.record(DriverCall::PathExists(path.to_string()));
        Ok(self.existing_paths.contains(path))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError> {
        self.record(DriverCall::ListImages);
        Ok(self.images.iter().map(|(image, _)| image.clone()).collect())
    }

    async fn load_image(&self, mut archive: ArchiveReader) -> Result<(), DriverError> {
        self.record(DriverCall::LoadImage);

        let mut bytes = Vec::new();
        archive.read_to_end(&mut bytes).await?;
        if self.failing_loads {
            return Err(DriverError::CommandFailed("load rejected".to_string()));
        }

        self.loaded.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn save_image(&self, image: &ImageSummary) -> Result<ArchiveReader, DriverError> {
        self.record(DriverCall::SaveImage(image.id.clone()));

        self.images
            .iter()
            .find(|(candidate, _)| candidate.id == image.id)
            .map(|(_, archive)| archive.reader())
            .ok_or_else(|| DriverError::CommandFailed(format!("no such image: {}", image.id)))
    }
}
