//! SFTP request handling.
//!
//! One [`SftpHandler`] serves one SFTP channel. Every request resolves its
//! paths through the [`FilesystemScope`] and is checked against the
//! [`AccessPolicy`] before any filesystem call is made; the blocking calls
//! themselves run on the shared [`WorkerPool`]. Requests on a channel are
//! handled one at a time, so operations on a handle keep request order.
//! Directory listings are returned in batches of [`READDIR_BATCH`] entries.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use filetime::FileTime;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::policy::{AccessPolicy, OperationKind, PermissionError};
use super::scope::{AccessScopeError, FilesystemScope};
use crate::pool::{PoolError, WorkerPool};

/// Largest read served in one response.
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Most entries returned by one `readdir` reply.
pub const READDIR_BATCH: usize = 100;

/// Mode for files and directories created without explicit permissions.
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Errors returned to the SFTP client.
#[derive(Debug, Error)]
pub enum SftpError {
    #[error(transparent)]
    Scope(#[from] AccessScopeError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("end of file")]
    Eof,

    #[error("operation not supported")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<SftpError> for StatusCode {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::Scope(_) | SftpError::Permission(_) => StatusCode::PermissionDenied,
            SftpError::Eof => StatusCode::Eof,
            SftpError::Unsupported => StatusCode::OpUnsupported,
            SftpError::InvalidHandle(_) | SftpError::Pool(_) => StatusCode::Failure,
            SftpError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
        }
    }
}

/// Operation kinds implied by an `open` request.
pub fn open_operations(flags: OpenFlags) -> Vec<OperationKind> {
    let mut ops = Vec::with_capacity(3);
    if flags.contains(OpenFlags::READ) {
        ops.push(OperationKind::Read);
    }
    if flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND) {
        ops.push(OperationKind::Write);
    }
    if flags.intersects(OpenFlags::CREATE | OpenFlags::EXCLUDE) {
        ops.push(OperationKind::Create);
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        ops.push(OperationKind::Truncate);
    }
    if ops.is_empty() {
        ops.push(OperationKind::Read);
    }
    ops
}

enum OpenHandle {
    File {
        file: Arc<fs::File>,
        path: PathBuf,
    },
    /// `entries` is `None` once the listing is exhausted.
    Dir {
        path: PathBuf,
        entries: Option<fs::ReadDir>,
    },
}

/// Serves one SFTP channel.
pub struct SftpHandler {
    scope: Arc<FilesystemScope>,
    policy: AccessPolicy,
    pool: WorkerPool,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    label: String,
    closed: Option<oneshot::Sender<()>>,
}

impl SftpHandler {
    /// Creates a handler; `label` identifies the channel in logs.
    pub fn new(
        scope: Arc<FilesystemScope>,
        policy: AccessPolicy,
        pool: WorkerPool,
        label: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            policy,
            pool,
            handles: HashMap::new(),
            next_handle: 0,
            label: label.into(),
            closed: None,
        }
    }

    /// Number of open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Returns a receiver that completes when this handler is dropped,
    /// which happens once the channel's request loop has ended.
    pub fn on_close(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.closed = Some(tx);
        rx
    }

    fn authorize(&self, path: &str, operations: &[OperationKind]) -> Result<(), SftpError> {
        self.policy.authorize_all(operations).map_err(|e| {
            warn!(channel = %self.label, path, operation = %e.operation, "Denied by read-only policy");
            SftpError::from(e)
        })
    }

    fn scoped<T>(&self, path: &str, result: Result<T, AccessScopeError>) -> Result<T, SftpError> {
        result.map_err(|e| {
            warn!(channel = %self.label, path, error = %e, "Path rejected");
            SftpError::from(e)
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SftpError> {
        self.scoped(path, self.scope.resolve(path))
    }

    fn resolve_entry(&self, path: &str) -> Result<PathBuf, SftpError> {
        self.scoped(path, self.scope.resolve_entry(path))
    }

    fn resolve_child(&self, path: &str) -> Result<PathBuf, SftpError> {
        self.scoped(path, self.scope.resolve_child(path))
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = format!("{:x}", self.next_handle);
        self.handles.insert(id.clone(), handle);
        id
    }

    fn restore_cursor(&mut self, handle: &str, cursor: fs::ReadDir) {
        if let Some(OpenHandle::Dir { entries, .. }) = self.handles.get_mut(handle) {
            *entries = Some(cursor);
        }
    }

    fn file(&self, handle: &str) -> Result<Arc<fs::File>, SftpError> {
        match self.handles.get(handle) {
            Some(OpenHandle::File { file, .. }) => Ok(Arc::clone(file)),
            _ => Err(SftpError::InvalidHandle(handle.to_string())),
        }
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, SftpError>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.pool.run(job).await??)
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

/// Applies every attribute present in `attrs`. Times must be set last.
fn apply_attributes(path: &Path, attrs: &FileAttributes) -> io::Result<()> {
    if let Some(size) = attrs.size {
        OpenOptions::new().write(true).open(path)?.set_len(size)?;
    }
    if attrs.uid.is_some() || attrs.gid.is_some() {
        std::os::unix::fs::chown(path, attrs.uid, attrs.gid)?;
    }
    if let Some(mode) = attrs.permissions {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }

    let unix_time = |secs: u32| FileTime::from_unix_time(i64::from(secs), 0);
    match (attrs.atime, attrs.mtime) {
        (Some(atime), Some(mtime)) => {
            filetime::set_file_times(path, unix_time(atime), unix_time(mtime))?
        }
        (Some(atime), None) => filetime::set_file_atime(path, unix_time(atime))?,
        (None, Some(mtime)) => filetime::set_file_mtime(path, unix_time(mtime))?,
        (None, None) => {}
    }
    Ok(())
}

/// Reads the next batch of entries from a directory cursor, skipping
/// reserved entries. Entries removed since the listing began are skipped.
fn next_batch(entries: &mut fs::ReadDir, scope: &FilesystemScope) -> io::Result<Vec<File>> {
    let mut files = Vec::with_capacity(READDIR_BATCH);
    while files.len() < READDIR_BATCH {
        let entry = match entries.next() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) if files.is_empty() => return Err(e),
            Some(Err(_)) | None => break,
        };
        if scope.is_reserved(&entry.path()) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        files.push(File::new(
            entry.file_name().to_string_lossy().into_owned(),
            FileAttributes::from(&metadata),
        ));
    }
    Ok(files)
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = SftpError;

    fn unimplemented(&self) -> Self::Error {
        SftpError::Unsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(channel = %self.label, version, "SFTP session initialized");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        self.authorize(&filename, &open_operations(pflags))?;
        let path = self.resolve(&filename)?;

        let mut options = OpenOptions::new();
        let writes = pflags.intersects(OpenFlags::WRITE | OpenFlags::APPEND);
        options
            .read(pflags.contains(OpenFlags::READ) || !writes)
            .write(writes)
            .append(pflags.contains(OpenFlags::APPEND))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .mode(attrs.permissions.unwrap_or(DEFAULT_FILE_MODE) & 0o7777);
        if pflags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        } else if pflags.contains(OpenFlags::CREATE) {
            options.create(true);
        }

        let target = path.clone();
        let file = self.blocking(move || options.open(&target)).await?;
        debug!(channel = %self.label, path = %filename, flags = ?pflags, "Opened file");

        let handle = self.insert_handle(OpenHandle::File {
            file: Arc::new(file),
            path,
        });
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(ok_status(id)),
            None => Err(SftpError::InvalidHandle(handle)),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file(&handle)?;
        let len = len.min(MAX_READ_LEN) as usize;

        let data = self
            .blocking(move || {
                let mut buf = vec![0u8; len];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            })
            .await?;

        if data.is_empty() && len > 0 {
            return Err(SftpError::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        self.authorize(&handle, &[OperationKind::Write])?;
        let file = self.file(&handle)?;

        self.blocking(move || file.write_all_at(&data, offset)).await?;
        Ok(ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let target = self.resolve_entry(&path)?;
        let metadata = self.blocking(move || fs::symlink_metadata(target)).await?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.file(&handle)?;
        let metadata = self.blocking(move || file.metadata()).await?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.authorize(&path, &[OperationKind::SetAttributes])?;
        let target = self.resolve(&path)?;

        self.blocking(move || apply_attributes(&target, &attrs)).await?;
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.authorize(&handle, &[OperationKind::SetAttributes])?;
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::File { path, .. }) | Some(OpenHandle::Dir { path, .. }) => {
                path.clone()
            }
            None => return Err(SftpError::InvalidHandle(handle)),
        };

        self.blocking(move || apply_attributes(&path, &attrs)).await?;
        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let target = self.resolve(&path)?;

        let dir = target.clone();
        let entries = self.blocking(move || fs::read_dir(dir)).await?;

        let handle = self.insert_handle(OpenHandle::Dir {
            path: target,
            entries: Some(entries),
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let cursor = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { entries, .. }) => entries.take(),
            _ => return Err(SftpError::InvalidHandle(handle)),
        };
        let Some(mut cursor) = cursor else {
            return Err(SftpError::Eof);
        };

        let scope = Arc::clone(&self.scope);
        let (cursor, batch) = self
            .blocking(move || {
                let batch = next_batch(&mut cursor, &scope);
                Ok((cursor, batch))
            })
            .await?;

        match batch {
            Ok(files) if files.is_empty() => Err(SftpError::Eof),
            Ok(files) => {
                self.restore_cursor(&handle, cursor);
                Ok(Name { id, files })
            }
            Err(e) => {
                self.restore_cursor(&handle, cursor);
                Err(e.into())
            }
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.authorize(&filename, &[OperationKind::Delete])?;
        let target = self.resolve_child(&filename)?;

        self.blocking(move || fs::remove_file(target)).await?;
        debug!(channel = %self.label, path = %filename, "Removed file");
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.authorize(&path, &[OperationKind::Create])?;
        let target = self.resolve_child(&path)?;
        let mode = attrs.permissions.unwrap_or(DEFAULT_DIR_MODE) & 0o7777;

        self.blocking(move || {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().mode(mode).create(target)
        })
        .await?;
        debug!(channel = %self.label, path = %path, "Created directory");
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.authorize(&path, &[OperationKind::Delete])?;
        let target = self.resolve_child(&path)?;

        self.blocking(move || fs::remove_dir(target)).await?;
        debug!(channel = %self.label, path = %path, "Removed directory");
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = self.resolve(&path)?;
        let virtual_path = self.scoped(&path, self.scope.to_virtual(&target))?;
        Ok(Name {
            id,
            files: vec![File::dummy(virtual_path)],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let target = self.resolve(&path)?;
        let metadata = self.blocking(move || fs::metadata(target)).await?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.authorize(&oldpath, &[OperationKind::Rename])?;
        let from = self.resolve_child(&oldpath)?;
        let to = self.resolve_child(&newpath)?;

        self.blocking(move || fs::rename(from, to)).await?;
        debug!(channel = %self.label, from = %oldpath, to = %newpath, "Renamed");
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let link = self.resolve_entry(&path)?;
        let target = self.blocking(move || fs::read_link(link)).await?;

        // Absolute targets are reported as virtual paths; ones outside the root are refused.
        let reported = if target.is_absolute() {
            self.scoped(&path, self.scope.to_virtual(&target))?
        } else {
            target.to_string_lossy().into_owned()
        };

        Ok(Name {
            id,
            files: vec![File::dummy(reported)],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.authorize(&linkpath, &[OperationKind::Create])?;
        let link = self.resolve_child(&linkpath)?;

        // Relative targets are interpreted against the link's own directory.
        let virtual_target = if targetpath.starts_with('/') {
            targetpath.clone()
        } else {
            let link_dir = link.parent().unwrap_or(self.scope.root());
            let link_dir = self.scoped(&linkpath, self.scope.to_virtual(link_dir))?;
            format!("{}/{}", link_dir.trim_end_matches('/'), targetpath)
        };
        let target = self.resolve(&virtual_target)?;

        self.blocking(move || std::os::unix::fs::symlink(target, link)).await?;
        debug!(channel = %self.label, link = %linkpath, target = %targetpath, "Created symlink");
        Ok(ok_status(id))
    }
}

impl Drop for SftpHandler {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug!(channel = %self.label, handles = self.handles.len(), "Dropping open SFTP handles");
        }
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler;
    use tempfile::TempDir;

    fn handler(read_only: bool) -> (TempDir, SftpHandler) {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("docs")).unwrap();
        fs::write(temp_dir.path().join("docs/readme.txt"), b"hello world").unwrap();

        let scope = Arc::new(FilesystemScope::new(temp_dir.path()).unwrap());
        let handler = SftpHandler::new(scope, AccessPolicy::new(read_only), WorkerPool::new(1), "test");
        (temp_dir, handler)
    }

    fn code(err: SftpError) -> StatusCode {
        err.into()
    }

    fn write_flags() -> OpenFlags {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
    }

    #[test]
    fn test_open_operations() {
        assert_eq!(open_operations(OpenFlags::READ), vec![OperationKind::Read]);
        assert_eq!(
            open_operations(write_flags()),
            vec![
                OperationKind::Write,
                OperationKind::Create,
                OperationKind::Truncate
            ]
        );
        assert_eq!(
            open_operations(OpenFlags::APPEND),
            vec![OperationKind::Write]
        );
        assert_eq!(open_operations(OpenFlags::empty()), vec![OperationKind::Read]);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(code(SftpError::Eof), StatusCode::Eof);
        assert_eq!(code(SftpError::Unsupported), StatusCode::OpUnsupported);
        assert_eq!(
            code(SftpError::Permission(PermissionError {
                operation: OperationKind::Write
            })),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            code(SftpError::Scope(AccessScopeError::Escape("..".into()))),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            code(SftpError::Io(io::Error::from(io::ErrorKind::NotFound))),
            StatusCode::NoSuchFile
        );
        assert_eq!(
            code(SftpError::InvalidHandle("x".into())),
            StatusCode::Failure
        );
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let (temp_dir, mut handler) = handler(false);

        let handle = handler
            .open(1, "/upload.bin".into(), write_flags(), FileAttributes::default())
            .await
            .unwrap()
            .handle;
        handler.write(2, handle.clone(), 0, b"abc".to_vec()).await.unwrap();
        handler.write(3, handle.clone(), 3, b"def".to_vec()).await.unwrap();
        handler.close(4, handle).await.unwrap();

        assert_eq!(fs::read(temp_dir.path().join("upload.bin")).unwrap(), b"abcdef");

        let handle = handler
            .open(5, "upload.bin".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        let data = handler.read(6, handle.clone(), 0, 1024).await.unwrap();
        assert_eq!(data.data, b"abcdef");

        let eof = handler.read(7, handle.clone(), 6, 1024).await.unwrap_err();
        assert_eq!(code(eof), StatusCode::Eof);
        handler.close(8, handle).await.unwrap();
        assert_eq!(handler.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_read_only_denies_mutations() {
        let (temp_dir, mut handler) = handler(true);
        let attrs = FileAttributes::default();

        let denied = [
            handler
                .open(1, "/new.txt".into(), write_flags(), attrs.clone())
                .await
                .map(|_| ())
                .unwrap_err(),
            handler.remove(2, "/docs/readme.txt".into()).await.map(|_| ()).unwrap_err(),
            handler.mkdir(3, "/newdir".into(), attrs.clone()).await.map(|_| ()).unwrap_err(),
            handler.rmdir(4, "/docs".into()).await.map(|_| ()).unwrap_err(),
            handler
                .rename(5, "/docs/readme.txt".into(), "/moved.txt".into())
                .await
                .map(|_| ())
                .unwrap_err(),
            handler
                .setstat(6, "/docs/readme.txt".into(), attrs.clone())
                .await
                .map(|_| ())
                .unwrap_err(),
            handler
                .symlink(7, "/link".into(), "/docs/readme.txt".into())
                .await
                .map(|_| ())
                .unwrap_err(),
        ];

        for err in denied {
            assert!(matches!(err, SftpError::Permission(_)), "unexpected {err:?}");
        }

        assert!(!temp_dir.path().join("new.txt").exists());
        assert!(!temp_dir.path().join("newdir").exists());
        assert!(temp_dir.path().join("docs/readme.txt").exists());

        let handle = handler
            .open(8, "/docs/readme.txt".into(), OpenFlags::READ, attrs)
            .await
            .unwrap()
            .handle;
        let data = handler.read(9, handle, 0, 64).await.unwrap();
        assert_eq!(data.data, b"hello world");
    }

    #[tokio::test]
    async fn test_read_only_denies_fsetstat_on_read_handle() {
        let (_temp_dir, mut handler) = handler(true);
        let handle = handler
            .open(1, "/docs/readme.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap()
            .handle;

        let err = handler
            .fsetstat(2, handle.clone(), FileAttributes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SftpError::Permission(_)));

        let err = handler.write(3, handle, 0, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, SftpError::Permission(_)));
    }

    #[tokio::test]
    async fn test_traversal_is_permission_denied() {
        let (_temp_dir, mut handler) = handler(false);

        let err = handler
            .open(1, "../../etc/passwd".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);

        let err = handler.stat(2, "/..".into()).await.map(|_| ()).unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_missing_file_is_no_such_file() {
        let (_temp_dir, mut handler) = handler(false);
        let err = handler
            .open(1, "/missing.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(code(err), StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_realpath_is_virtual() {
        let (_temp_dir, mut handler) = handler(false);

        let name = handler.realpath(1, ".".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/");

        let name = handler.realpath(2, "docs/../docs/readme.txt".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/docs/readme.txt");
    }

    #[tokio::test]
    async fn test_readdir_lists_then_eof() {
        let (_temp_dir, mut handler) = handler(false);
        let handle = handler.opendir(1, "/docs".into()).await.unwrap().handle;

        let listing = handler.readdir(2, handle.clone()).await.unwrap();
        let names: Vec<_> = listing.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["readme.txt"]);

        let err = handler.readdir(3, handle.clone()).await.unwrap_err();
        assert_eq!(code(err), StatusCode::Eof);
        handler.close(4, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_readdir_returns_bounded_batches() {
        let (temp_dir, mut handler) = handler(false);
        let dir = temp_dir.path().join("many");
        fs::create_dir(&dir).unwrap();
        let total = READDIR_BATCH * 2 + 5;
        for i in 0..total {
            fs::write(dir.join(format!("file-{i:04}.txt")), b"x").unwrap();
        }

        let handle = handler.opendir(1, "/many".into()).await.unwrap().handle;
        let mut names = std::collections::HashSet::new();
        let mut batches = 0;
        loop {
            match handler.readdir(2 + batches, handle.clone()).await {
                Ok(listing) => {
                    assert!(!listing.files.is_empty());
                    assert!(listing.files.len() <= READDIR_BATCH);
                    for file in listing.files {
                        assert!(names.insert(file.filename));
                    }
                    batches += 1;
                }
                Err(err) => {
                    assert_eq!(code(err), StatusCode::Eof);
                    break;
                }
            }
        }

        assert_eq!(names.len(), total);
        assert_eq!(batches, 3);

        // The listing stays exhausted.
        let err = handler.readdir(99, handle.clone()).await.unwrap_err();
        assert_eq!(code(err), StatusCode::Eof);
        handler.close(100, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_readdir_on_file_handle_is_invalid() {
        let (_temp_dir, mut handler) = handler(false);
        let handle = handler
            .open(1, "/docs/readme.txt".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap()
            .handle;
        let err = handler.readdir(2, handle).await.unwrap_err();
        assert!(matches!(err, SftpError::InvalidHandle(_)));
    }

    #[tokio::test]
    async fn test_opendir_on_file_fails() {
        let (_temp_dir, mut handler) = handler(false);
        assert!(handler.opendir(1, "/docs/readme.txt".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_mkdir_rename_remove() {
        let (temp_dir, mut handler) = handler(false);
        let attrs = FileAttributes::default();

        handler.mkdir(1, "/a".into(), attrs).await.unwrap();
        handler
            .rename(2, "/docs/readme.txt".into(), "/a/readme.txt".into())
            .await
            .unwrap();
        assert!(temp_dir.path().join("a/readme.txt").exists());

        handler.remove(3, "/a/readme.txt".into()).await.unwrap();
        handler.rmdir(4, "/a".into()).await.unwrap();
        assert!(!temp_dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_root_cannot_be_removed_or_renamed() {
        let (temp_dir, mut handler) = handler(false);

        let err = handler.rmdir(1, "/".into()).await.unwrap_err();
        assert!(matches!(err, SftpError::Scope(AccessScopeError::RootEntry)));

        let err = handler.rename(2, "/".into(), "/moved".into()).await.unwrap_err();
        assert!(matches!(err, SftpError::Scope(AccessScopeError::RootEntry)));
        assert!(temp_dir.path().exists());
    }

    #[tokio::test]
    async fn test_setstat_applies_permissions_and_size() {
        let (temp_dir, mut handler) = handler(false);
        let attrs = FileAttributes {
            permissions: Some(0o600),
            size: Some(5),
            ..FileAttributes::default()
        };

        handler.setstat(1, "/docs/readme.txt".into(), attrs).await.unwrap();

        let metadata = fs::metadata(temp_dir.path().join("docs/readme.txt")).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        assert_eq!(metadata.len(), 5);
    }

    #[tokio::test]
    async fn test_setstat_applies_times() {
        use std::os::unix::fs::MetadataExt;

        let (temp_dir, mut handler) = handler(false);
        let attrs = FileAttributes {
            atime: Some(1_000_000),
            mtime: Some(1_200_000),
            ..FileAttributes::default()
        };

        handler.setstat(1, "/docs/readme.txt".into(), attrs).await.unwrap();

        let metadata = fs::metadata(temp_dir.path().join("docs/readme.txt")).unwrap();
        assert_eq!(metadata.atime(), 1_000_000);
        assert_eq!(metadata.mtime(), 1_200_000);

        let attrs = handler.stat(2, "/docs/readme.txt".into()).await.unwrap().attrs;
        assert_eq!(attrs.mtime, Some(1_200_000));
    }

    #[tokio::test]
    async fn test_setstat_mtime_alone_keeps_atime() {
        use std::os::unix::fs::MetadataExt;

        let (temp_dir, mut handler) = handler(false);
        let path = temp_dir.path().join("docs/readme.txt");
        filetime::set_file_atime(&path, FileTime::from_unix_time(500_000, 0)).unwrap();

        let attrs = FileAttributes {
            mtime: Some(2_000_000),
            ..FileAttributes::default()
        };
        handler.setstat(1, "/docs/readme.txt".into(), attrs).await.unwrap();

        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.mtime(), 2_000_000);
        assert_eq!(metadata.atime(), 500_000);
    }

    #[tokio::test]
    async fn test_fsetstat_applies_mtime() {
        use std::os::unix::fs::MetadataExt;

        let (temp_dir, mut handler) = handler(false);
        let handle = handler
            .open(1, "/stamped.txt".into(), write_flags(), FileAttributes::default())
            .await
            .unwrap()
            .handle;
        handler.write(2, handle.clone(), 0, b"data".to_vec()).await.unwrap();

        let attrs = FileAttributes {
            atime: Some(1_500_000),
            mtime: Some(1_500_000),
            ..FileAttributes::default()
        };
        handler.fsetstat(3, handle.clone(), attrs).await.unwrap();
        handler.close(4, handle).await.unwrap();

        let metadata = fs::metadata(temp_dir.path().join("stamped.txt")).unwrap();
        assert_eq!(metadata.mtime(), 1_500_000);
    }

    #[tokio::test]
    async fn test_setstat_ownership_is_applied() {
        use std::os::unix::fs::MetadataExt;

        let (temp_dir, mut handler) = handler(false);
        let path = temp_dir.path().join("docs/readme.txt");
        let before = fs::metadata(&path).unwrap();

        // Handing a file to its current owner is always permitted.
        let attrs = FileAttributes {
            uid: Some(before.uid()),
            gid: Some(before.gid()),
            ..FileAttributes::default()
        };
        handler.setstat(1, "/docs/readme.txt".into(), attrs).await.unwrap();

        let after = fs::metadata(&path).unwrap();
        assert_eq!((after.uid(), after.gid()), (before.uid(), before.gid()));
    }

    #[tokio::test]
    async fn test_setstat_missing_file_fails() {
        let (_temp_dir, mut handler) = handler(false);
        let attrs = FileAttributes {
            mtime: Some(1),
            atime: Some(1),
            ..FileAttributes::default()
        };
        let err = handler.setstat(1, "/nope.txt".into(), attrs).await.unwrap_err();
        assert_eq!(code(err), StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_on_close_fires_when_dropped() {
        let (_temp_dir, mut handler) = handler(false);
        let closed = handler.on_close();
        drop(handler);
        assert!(closed.await.is_ok());
    }

    #[tokio::test]
    async fn test_reserved_directory_hidden_and_protected() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("keys")).unwrap();
        fs::write(temp_dir.path().join("keys/host_key"), b"secret").unwrap();
        fs::write(temp_dir.path().join("public.txt"), b"hi").unwrap();

        let scope = Arc::new(
            FilesystemScope::new(temp_dir.path())
                .unwrap()
                .with_reserved("keys"),
        );
        let mut handler =
            SftpHandler::new(scope, AccessPolicy::read_write(), WorkerPool::new(1), "test");

        let handle = handler.opendir(1, "/".into()).await.unwrap().handle;
        let listing = handler.readdir(2, handle).await.unwrap();
        let names: Vec<_> = listing.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["public.txt"]);

        let err = handler
            .open(3, "/keys/host_key".into(), OpenFlags::READ, FileAttributes::default())
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);

        let err = handler.remove(4, "/keys/host_key".into()).await.unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);
        let err = handler.rmdir(5, "/keys".into()).await.unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);
        let err = handler
            .rename(6, "/public.txt".into(), "/keys/host_key".into())
            .await
            .unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);
        let err = handler
            .symlink(7, "/peek".into(), "/keys/host_key".into())
            .await
            .unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);

        assert_eq!(fs::read(temp_dir.path().join("keys/host_key")).unwrap(), b"secret");
    }

    #[tokio::test]
    async fn test_symlink_and_readlink() {
        let (temp_dir, mut handler) = handler(false);

        handler
            .symlink(1, "/docs/alias".into(), "readme.txt".into())
            .await
            .unwrap();
        assert!(fs::symlink_metadata(temp_dir.path().join("docs/alias"))
            .unwrap()
            .file_type()
            .is_symlink());

        let name = handler.readlink(2, "/docs/alias".into()).await.unwrap();
        assert_eq!(name.files[0].filename, "/docs/readme.txt");

        let attrs = handler.stat(3, "/docs/alias".into()).await.unwrap();
        assert_eq!(attrs.attrs.size, Some(11));
    }

    #[tokio::test]
    async fn test_symlink_target_outside_root_rejected() {
        let (_temp_dir, mut handler) = handler(false);

        let err = handler
            .symlink(1, "/escape".into(), "../../etc".into())
            .await
            .unwrap_err();
        assert_eq!(code(err), StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let (_temp_dir, mut handler) = handler(false);
        let err = handler.read(1, "nope".into(), 0, 10).await.unwrap_err();
        assert!(matches!(err, SftpError::InvalidHandle(_)));
    }
}
