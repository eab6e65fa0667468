// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! This crate gives Linux network namespaces durable, name-addressable identity.
//! A named namespace is persisted by bind-mounting the namespace pseudo-file of a
//! thread onto an empty file in a registry directory (`/var/run/netns` by default,
//! the same place `ip netns` uses), so it outlives the process that created it.
//! Changing namespaces requires elevated privileges, so in most cases this code
//! needs to be run as root.
//!
//! Network namespace membership is a per-thread property. Every sequence that
//! switches the calling thread and later switches it back should hold a
//! [`NsGuard`], which records the original namespace and restores it on drop.
//!
//! # Examples
//!
//!```no_run
//!use named_netns::{NetNs, NsGuard};
//!
//!// remember where we are, restored when `guard` goes out of scope.
//!let guard = NsGuard::new().unwrap();
//!
//!// attach to `my_netns`, or create it if it does not exist yet. The calling
//!// thread is switched into it either way.
//!let ns = NetNs::set_by_name("my_netns").unwrap();
//!
//!// do something in the netns. eg. ip link add.
//!
//!guard.restore().unwrap();
//!// removes the binding.
//!ns.delete().unwrap();
//!```
//! To bind a name without moving the calling thread, use [`NetNs::add`].
//!```no_run
//!use named_netns::NetNs;
//!
//!let ns = NetNs::add("my_netns").unwrap();
//!ns.run(|_| {
//!    // do something in the netns.
//!}).unwrap();
//!```
//! Handles can also be resolved without a name.
//!```no_run
//!use named_netns::NsHandle;
//!use nix::unistd::Pid;
//!
//!let mine = NsHandle::current().unwrap();
//!let init = NsHandle::from_pid(Pid::from_raw(1)).unwrap();
//!println!("{} {}", mine.unique_id(), mine == init);
//!```

mod guard;
mod handle;
mod netns;

pub use self::guard::NsGuard;
pub use self::handle::NsHandle;
pub use self::netns::*;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("create netns dir failed. {0}")]
    CreateNsDirError(std::io::Error),

    #[error("create netns {0} failed. {1}")]
    CreateNsError(std::path::PathBuf, std::io::Error),

    #[error("open netns {0} failed. {1}")]
    OpenNsError(std::path::PathBuf, std::io::Error),

    #[error("{0} is not a namespace file")]
    NotNsError(std::path::PathBuf),

    #[error("duplicate netns handle failed. {0}")]
    DupNsError(std::io::Error),

    #[error("close netns failed. {0}")]
    CloseNsError(nix::Error),

    #[error("remove netns {0} failed. {1}")]
    RemoveNsError(std::path::PathBuf, std::io::Error),

    #[error("mount {0} failed. {1}")]
    MountError(String, nix::Error),

    #[error("unmount {0} failed. {1}")]
    UnmountError(std::path::PathBuf, nix::Error),

    #[error("unshare failed. {0}")]
    UnshareError(nix::Error),

    #[error("join thread failed. {0}")]
    JoinThreadError(String),

    #[error("setns failed. {0}")]
    SetnsError(nix::Error),

    #[error("invalid netns name {0:?}")]
    InvalidName(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The registry entry, path, process or thread does not exist.
    NotFound,
    /// Another caller registered the same name first.
    AlreadyExists,
    /// The namespace name can never be a registry entry.
    InvalidInput,
    /// Any other failure: permissions, mount errors, closed handles.
    OsFailure,
}

impl Error {
    /// Classifies the underlying OS error.
    ///
    /// Callers attaching to a named namespace rely on [`ErrorKind::NotFound`] to
    /// decide whether the name has to be created, so only a missing file, process
    /// or thread maps to it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CreateNsDirError(e)
            | Error::CreateNsError(_, e)
            | Error::OpenNsError(_, e)
            | Error::DupNsError(e)
            | Error::RemoveNsError(_, e) => classify_io(e),
            Error::CloseNsError(e)
            | Error::MountError(_, e)
            | Error::UnmountError(_, e)
            | Error::UnshareError(e)
            | Error::SetnsError(e) => classify_errno(*e),
            Error::InvalidName(_) => ErrorKind::InvalidInput,
            Error::NotNsError(_) | Error::JoinThreadError(_) => ErrorKind::OsFailure,
        }
    }
}

/// Returns `true` if `err` means that the namespace source does not exist.
pub fn is_not_exist(err: &Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

fn classify_errno(errno: Errno) -> ErrorKind {
    match errno {
        Errno::ENOENT | Errno::ESRCH => ErrorKind::NotFound,
        Errno::EEXIST => ErrorKind::AlreadyExists,
        _ => ErrorKind::OsFailure,
    }
}

fn classify_io(err: &std::io::Error) -> ErrorKind {
    match err.raw_os_error() {
        Some(code) => classify_errno(Errno::from_i32(code)),
        None => match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::OsFailure,
        },
    }
}
