// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::statfs::{fstatfs, FsType};
use nix::unistd::{gettid, Pid};

use crate::{Error, Result};

const NSFS_MAGIC: FsType = FsType(0x6e73_6673);

/// An open reference to a network namespace.
///
/// Closing the handle only drops this reference. The namespace itself keeps
/// existing as long as a process lives in it or a bind mount pins it.
#[derive(Debug)]
pub struct NsHandle {
    file: Option<File>,
}

impl std::fmt::Display for NsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let file = match &self.file {
            Some(file) => file,
            None => return write!(f, "NS(none)"),
        };
        match file.metadata() {
            Ok(meta) => write!(
                f,
                "NS(fd: {}, dev: {}, ino: {})",
                file.as_raw_fd(),
                meta.dev(),
                meta.ino()
            ),
            Err(_) => write!(f, "NS(fd: {})", file.as_raw_fd()),
        }
    }
}

/// Two handles are equal when they refer to the same kernel namespace, however
/// each of them was obtained. A closed handle is equal to nothing.
impl PartialEq for NsHandle {
    fn eq(&self, other: &NsHandle) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl NsHandle {
    /// Returns the network namespace of the calling thread.
    pub fn current() -> Result<Self> {
        Self::from_path(current_thread_netns_path())
    }

    /// Opens the network namespace referenced by `ns_path`, either a `/proc`
    /// pseudo-file or a bind mount of one.
    ///
    /// A plain file, such as a registry entry whose bind mount never happened,
    /// fails with [`Error::NotNsError`].
    pub fn from_path<P: AsRef<Path>>(ns_path: P) -> Result<Self> {
        let ns_path = ns_path.as_ref();
        let file = File::open(ns_path).map_err(|e| Error::OpenNsError(ns_path.to_path_buf(), e))?;
        let fs = fstatfs(&file).map_err(|e| Error::OpenNsError(ns_path.to_path_buf(), e.into()))?;
        if fs.filesystem_type() != NSFS_MAGIC {
            return Err(Error::NotNsError(ns_path.to_path_buf()));
        }
        Ok(Self { file: Some(file) })
    }

    /// Returns the network namespace of process `pid`.
    pub fn from_pid(pid: Pid) -> Result<Self> {
        Self::from_path(format!("/proc/{}/ns/net", pid))
    }

    /// Returns the network namespace of thread `tid` in process `pid`.
    pub fn from_thread(pid: Pid, tid: Pid) -> Result<Self> {
        Self::from_path(format!("/proc/{}/task/{}/ns/net", pid, tid))
    }

    /// Creates a new anonymous network namespace, moves the calling thread into
    /// it and returns a handle to it.
    ///
    /// Requires elevated privileges.
    pub fn new_unshared() -> Result<Self> {
        unshare(CloneFlags::CLONE_NEWNET).map_err(Error::UnshareError)?;
        let handle = Self::current()?;
        tracing::debug!(handle = %handle, "unshared a new network namespace");
        Ok(handle)
    }

    /// Returns a closed handle.
    pub fn none() -> Self {
        Self { file: None }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// The raw descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Makes the calling thread enter this network namespace.
    ///
    /// Fails with `EBADF` on a closed handle. Requires elevated privileges.
    pub fn set(&self) -> Result<()> {
        let fd = self.raw_fd().ok_or(Error::SetnsError(Errno::EBADF))?;
        setns(fd, CloneFlags::CLONE_NEWNET).map_err(Error::SetnsError)?;
        tracing::debug!(handle = %self, "switched network namespace");
        Ok(())
    }

    /// Releases this reference. Closing an already closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => nix::unistd::close(file.into_raw_fd()).map_err(Error::CloseNsError),
            None => Ok(()),
        }
    }

    /// Duplicates the descriptor, so both handles can be closed independently.
    pub fn try_clone(&self) -> Result<Self> {
        let file = match &self.file {
            Some(file) => Some(file.try_clone().map_err(Error::DupNsError)?),
            None => None,
        };
        Ok(Self { file })
    }

    /// A string identifying the namespace itself rather than this reference.
    pub fn unique_id(&self) -> String {
        match self.identity() {
            Some((dev, ino)) => format!("NS({}:{})", dev, ino),
            None => String::from("NS(unknown)"),
        }
    }

    fn identity(&self) -> Option<(u64, u64)> {
        let meta = self.file.as_ref()?.metadata().ok()?;
        Some((meta.dev(), meta.ino()))
    }
}

/// `/proc/self` names the thread group leader, so the thread's own entry is
/// needed to see the namespace of the calling thread.
#[inline]
pub(crate) fn current_thread_netns_path() -> PathBuf {
    PathBuf::from(format!("/proc/self/task/{}/ns/net", gettid()))
}
