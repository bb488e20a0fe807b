//! Extraction sinks.
//!
//! The walker drives a `Sink` for every inode it validates. `NullSink`
//! discards everything (validation-only runs); `HostSink` materializes the
//! tree on the host filesystem and applies ownership, mode, and times.

use pfs_error::{FsckError, Result};
use pfs_ondisk::{FileKind, Inode};
use pfs_types::{S_IFMT, S_ISGID, S_ISUID, dev_major, dev_minor};
use rustix::fs::{AtFlags, Mode, Timestamps};
use rustix::time::Timespec;
use std::ffi::OsStr;
use std::fs::{DirBuilder, File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, lchown, symlink};
use std::path::Path;
use tracing::debug;

/// Receiver for the walker's extraction calls.
pub trait Sink {
    fn mkdir(&mut self, path: &Path, mode: u16) -> Result<()>;
    fn begin_file(&mut self, path: &Path, mode: u16) -> Result<()>;
    fn file_data(&mut self, data: &[u8]) -> Result<()>;
    fn end_file(&mut self) -> Result<()>;
    fn symlink(&mut self, target: &OsStr, path: &Path) -> Result<()>;
    fn mknod(&mut self, path: &Path, inode: &Inode) -> Result<()>;
    fn apply_metadata(&mut self, path: &Path, inode: &Inode) -> Result<()>;
}

/// Sink for validation-only runs; every call succeeds without effect.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn mkdir(&mut self, _path: &Path, _mode: u16) -> Result<()> {
        Ok(())
    }
    fn begin_file(&mut self, _path: &Path, _mode: u16) -> Result<()> {
        Ok(())
    }
    fn file_data(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn end_file(&mut self) -> Result<()> {
        Ok(())
    }
    fn symlink(&mut self, _target: &OsStr, _path: &Path) -> Result<()> {
        Ok(())
    }
    fn mknod(&mut self, _path: &Path, _inode: &Inode) -> Result<()> {
        Ok(())
    }
    fn apply_metadata(&mut self, _path: &Path, _inode: &Inode) -> Result<()> {
        Ok(())
    }
}

/// Sink that writes the tree to the host filesystem.
pub struct HostSink {
    out: Option<(File, String)>,
    euid_is_root: bool,
    root_seen: bool,
}

impl HostSink {
    /// Create the sink and clear the process umask so directory and file
    /// modes land exactly as stored in the image.
    #[must_use]
    pub fn new() -> Self {
        rustix::process::umask(Mode::empty());
        Self {
            out: None,
            euid_is_root: rustix::process::geteuid().is_root(),

            root_seen: false,
        }
    }
}

impl Default for HostSink {
    fn default() -> Self {
        Self::new()
    }
}

fn perm_bits(mode: u16) -> u32 {
    u32::from(mode & !S_IFMT)
}

impl Sink for HostSink {
    fn mkdir(&mut self, path: &Path, mode: u16) -> Result<()> {
        let result = DirBuilder::new().mode(perm_bits(mode)).create(path);
        match result {
            Ok(()) => {}
            // The extraction root itself may pre-exist; children may not.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && !self.root_seen => {
                std::fs::set_permissions(path, Permissions::from_mode(perm_bits(mode)))
                    .map_err(|e| FsckError::io(format!("chmod failed: {}", path.display()), e))?;
            }
            Err(err) => {
                return Err(FsckError::io(format!("mkdir failed: {}", path.display()), err));
            }
        }
        self.root_seen = true;
        Ok(())
    }

    fn begin_file(&mut self, path: &Path, mode: u16) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(perm_bits(mode))
            .open(path)
            .map_err(|err| FsckError::io(format!("open failed: {}", path.display()), err))?;
        self.out = Some((file, path.display().to_string()));
        Ok(())
    }

    fn file_data(&mut self, data: &[u8]) -> Result<()> {
        if let Some((file, path)) = self.out.as_mut() {
            file.write_all(data)
                .map_err(|err| FsckError::io(format!("write failed: {path}"), err))?;
        }
        Ok(())
    }

    fn end_file(&mut self) -> Result<()> {
        self.out = None;
        Ok(())
    }

    fn symlink(&mut self, target: &OsStr, path: &Path) -> Result<()> {
        symlink(target, path)
            .map_err(|err| FsckError::io(format!("symlink failed: {}", path.display()), err))
    }

    fn mknod(&mut self, path: &Path, inode: &Inode) -> Result<()> {
        let (file_type, dev) = match inode.kind() {
            FileKind::CharDev => (
                rustix::fs::FileType::CharacterDevice,
                rustix::fs::makedev(dev_major(inode.size), dev_minor(inode.size)),
            ),
            FileKind::BlockDev => (
                rustix::fs::FileType::BlockDevice,
                rustix::fs::makedev(dev_major(inode.size), dev_minor(inode.size)),
            ),
            FileKind::Fifo => (rustix::fs::FileType::Fifo, 0),
            _ => (rustix::fs::FileType::Socket, 0),
        };
        debug!(
            target: "pfs::extract",
            event = "mknod",
            path = %path.display(),
            dev = dev
        );
        rustix::fs::mknodat(
            rustix::fs::CWD,
            path,
            file_type,
            Mode::from_raw_mode(perm_bits(inode.mode)),
            dev,
        )
        .map_err(|err| {
            FsckError::io(format!("mknod failed: {}", path.display()), err.into())
        })
    }

    fn apply_metadata(&mut self, path: &Path, inode: &Inode) -> Result<()> {
        let is_symlink = inode.kind() == FileKind::Symlink;

        if self.euid_is_root {
            lchown(path, Some(u32::from(inode.uid)), Some(u32::from(inode.gid)))
                .map_err(|err| FsckError::io(format!("lchown failed: {}", path.display()), err))?;
            if is_symlink {
                return Ok(());
            }
            if inode.mode & (S_ISUID | S_ISGID) != 0 {
                std::fs::set_permissions(path, Permissions::from_mode(perm_bits(inode.mode)))
                    .map_err(|err| {
                        FsckError::io(format!("chmod failed: {}", path.display()), err)
                    })?;
            }
        }
        if is_symlink {
            return Ok(());
        }

        // Image contents carry no timestamps; everything lands at the epoch.
        let epoch = Timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        rustix::fs::utimensat(
            rustix::fs::CWD,
            path,
            &Timestamps {
                last_access: epoch,
                last_modification: epoch,
            },
            AtFlags::empty(),
        )
        .map_err(|err| FsckError::io(format!("utime failed: {}", path.display()), err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{S_IFDIR, S_IFREG};
    use std::os::unix::fs::MetadataExt;

    fn inode(mode: u16) -> Inode {
        Inode {
            mode,
            uid: 0,
            size: 0,
            gid: 0,
            namelen: 0,
            offset: 0,
        }
    }

    #[test]
    fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.mkdir(Path::new("/nope"), 0o755).expect("mkdir");
        sink.file_data(b"data").expect("data");
        sink.apply_metadata(Path::new("/nope"), &inode(S_IFREG | 0o644))
            .expect("metadata");
    }

    #[test]
    fn host_sink_writes_files_and_dirs() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let root = scratch.path().join("tree");
        let mut sink = HostSink::new();

        sink.mkdir(&root, S_IFDIR | 0o755).expect("mkdir root");
        sink.mkdir(&root.join("sub"), S_IFDIR | 0o700)
            .expect("mkdir sub");

        let file = root.join("sub/data.bin");
        sink.begin_file(&file, S_IFREG | 0o640).expect("create");
        sink.file_data(b"abc").expect("write");
        sink.file_data(b"def").expect("write");
        sink.end_file().expect("close");

        assert_eq!(std::fs::read(&file).expect("read back"), b"abcdef");
        let mode = std::fs::metadata(&file).expect("stat").mode();
        assert_eq!(mode & 0o777, 0o640);

        sink.symlink(OsStr::new("data.bin"), &root.join("sub/link"))
            .expect("symlink");
        assert_eq!(
            std::fs::read_link(root.join("sub/link")).expect("readlink"),
            Path::new("data.bin")
        );
    }

    #[test]
    fn host_sink_tolerates_existing_extraction_root_only() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut sink = HostSink::new();

        // The pre-existing scratch dir stands in for `-x DIR`.
        sink.mkdir(scratch.path(), S_IFDIR | 0o755)
            .expect("existing root accepted");

        let sub = scratch.path().join("sub");
        std::fs::create_dir(&sub).expect("precreate");
        let err = sink.mkdir(&sub, S_IFDIR | 0o755).unwrap_err();
        assert!(err.to_string().starts_with("mkdir failed:"));
    }

    #[test]
    fn metadata_sets_epoch_times() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let file = scratch.path().join("f");
        std::fs::write(&file, b"x").expect("write");

        let mut sink = HostSink::new();
        sink.apply_metadata(&file, &inode(S_IFREG | 0o644))
            .expect("metadata");

        let meta = std::fs::metadata(&file).expect("stat");
        assert_eq!(meta.mtime(), 0);
        assert_eq!(meta.atime(), 0);
    }
}
