//! Staged Resource
//!
//! Append-only holding area for one batch's payload. Content is buffered
//! in memory and spills to a file once it outgrows the memory threshold.
//! Marking a resource DONE seals it; the spill file is renamed from
//! `.create` to `.done`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Lifecycle state of a staged resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Being written
    Create,
    /// Sealed, ready for transport
    Done,
}

impl ResourceState {
    fn extension(&self) -> &'static str {
        match self {
            ResourceState::Create => "create",
            ResourceState::Done => "done",
        }
    }
}

struct Inner {
    state: ResourceState,
    buffer: Vec<u8>,
    file: Option<BufWriter<File>>,
    spilled: bool,
    size: u64,
    last_update: DateTime<Utc>,
    deleted: bool,
}

/// Staged payload of one batch
pub struct StagedResource {
    category: String,
    location: String,
    batch_id: i64,
    base_path: PathBuf,
    memory_threshold: usize,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedResource")
            .field("category", &self.category)
            .field("location", &self.location)
            .field("batch_id", &self.batch_id)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl StagedResource {
    pub(crate) fn new(
        category: &str,
        location: &str,
        batch_id: i64,
        base_path: PathBuf,
        memory_threshold: usize,
    ) -> Self {
        Self {
            category: category.to_string(),
            location: location.to_string(),
            batch_id,
            base_path,
            memory_threshold,
            inner: Mutex::new(Inner {
                state: ResourceState::Create,
                buffer: Vec::new(),
                file: None,
                spilled: false,
                size: 0,
                last_update: Utc::now(),
                deleted: false,
            }),
        }
    }

    /// A sealed resource found on disk
    pub(crate) fn existing_done(
        category: &str,
        location: &str,
        batch_id: i64,
        base_path: PathBuf,
        memory_threshold: usize,
    ) -> Result<Self> {
        let resource = Self::new(category, location, batch_id, base_path, memory_threshold);
        let metadata = std::fs::metadata(resource.path_for(ResourceState::Done))?;
        {
            let mut inner = resource.inner.lock();
            inner.state = ResourceState::Done;
            inner.spilled = true;
            inner.size = metadata.len();
            if let Ok(modified) = metadata.modified() {
                inner.last_update = modified.into();
            }
        }
        Ok(resource)
    }

    pub(crate) fn path_for(&self, state: ResourceState) -> PathBuf {
        self.base_path.with_extension(state.extension())
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    /// Bytes written so far
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Whether the content lives in a file rather than memory
    pub fn is_file_resource(&self) -> bool {
        self.inner.lock().spilled
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.inner.lock().last_update
    }

    /// Refresh the last-update time so a purge leaves this resource alone
    pub fn touch(&self) {
        self.inner.lock().last_update = Utc::now();
    }

    /// Path of the spill file, if content was spilled
    pub fn file_path(&self) -> Option<PathBuf> {
        let inner = self.inner.lock();
        inner.spilled.then(|| self.path_for(inner.state))
    }

    /// Open an appending writer
    pub fn writer(self: &Arc<Self>) -> Result<StagedWriter> {
        let inner = self.inner.lock();
        if inner.deleted {
            return Err(Error::Staging(format!("{} was deleted", self.describe())));
        }
        if inner.state == ResourceState::Done {
            return Err(Error::Staging(format!(
                "{} is done and cannot be written",
                self.describe()
            )));
        }
        Ok(StagedWriter {
            resource: Arc::clone(self),
        })
    }

    /// Read the content written so far
    pub fn reader(&self) -> Result<Box<dyn BufRead + Send>> {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return Err(Error::Staging(format!("{} was deleted", self.describe())));
        }
        if !inner.spilled {
            return Ok(Box::new(Cursor::new(inner.buffer.clone())));
        }
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        let file = File::open(self.path_for(inner.state))?;
        Ok(Box::new(BufReader::new(file)))
    }

    /// Whole content as text
    pub fn read_to_string(&self) -> Result<String> {
        let mut content = String::new();
        io::Read::read_to_string(&mut self.reader()?, &mut content)?;
        Ok(content)
    }

    /// Change state. Marking DONE flushes and renames the spill file.
    pub fn set_state(&self, state: ResourceState) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return Ok(());
        }
        if let Some(mut file) = inner.file.take() {
            file.flush()?;
        }
        if inner.spilled {
            std::fs::rename(self.path_for(inner.state), self.path_for(state))?;
        }
        inner.state = state;
        inner.last_update = Utc::now();
        Ok(())
    }

    /// Drop the content, removing any spill file
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file = None;
        inner.buffer = Vec::new();
        if inner.spilled {
            remove_if_exists(&self.path_for(inner.state))?;
        }
        inner.spilled = false;
        inner.size = 0;
        inner.deleted = true;
        Ok(())
    }

    fn append(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.deleted || inner.state == ResourceState::Done {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not writable", self.describe()),
            ));
        }

        if !inner.spilled && inner.buffer.len() + data.len() > self.memory_threshold {
            let path = self.path_for(ResourceState::Create);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            let mut file = BufWriter::new(file);
            file.write_all(&inner.buffer)?;
            tracing::debug!(
                "Spilling {} to {} after {} bytes",
                self.describe(),
                path.display(),
                inner.buffer.len()
            );
            inner.buffer = Vec::new();
            inner.file = Some(file);
            inner.spilled = true;
        }

        match inner.file.as_mut() {
            Some(file) => file.write_all(data)?,
            None => inner.buffer.extend_from_slice(data),
        }
        inner.size += data.len() as u64;
        inner.last_update = Utc::now();
        Ok(())
    }

    fn flush_file(&self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        format!(
            "staged resource {}/{}/{}",
            self.category, self.location, self.batch_id
        )
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Appending writer over a staged resource
pub struct StagedWriter {
    resource: Arc<StagedResource>,
}

impl StagedWriter {
    pub fn resource(&self) -> &Arc<StagedResource> {
        &self.resource
    }
}

impl Write for StagedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.resource.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.resource.flush_file()
    }
}
