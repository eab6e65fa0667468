// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::handle::current_thread_netns_path;
use crate::{is_not_exist, Error, NsGuard, NsHandle, Result};

/// Defines the registry of named network namespaces.
pub trait Env {
    /// The persist dir holding one bind-mounted file per named namespace.
    fn persist_dir(&self) -> PathBuf;

    /// Returns `true` if the given path is in this Env.
    fn contains<P: AsRef<Path>>(&self, p: P) -> bool {
        p.as_ref().starts_with(self.persist_dir())
    }

    /// Returns the registry entry of `ns_name`.
    fn path_of(&self, ns_name: &str) -> Result<PathBuf> {
        validate_name(ns_name)?;
        Ok(self.persist_dir().join(ns_name))
    }

    /// Initialize the environment.
    fn init(&self) -> Result<()> {
        // Create the directory for mounting network namespaces
        // This needs to be a shared mountpoint in case it is mounted in to
        // other namespaces (containers)
        let persist_dir = self.persist_dir();
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&persist_dir)
            .map_err(Error::CreateNsDirError)?;

        // Remount the namespace directory shared. This will fail if it is not
        // already a mountpoint, so bind-mount it on to itself to "upgrade" it
        // to a mountpoint.
        let mut made_netns_persist_dir_mount: bool = false;
        while let Err(e) = mount(
            Some(""),
            &persist_dir,
            Some("none"),
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            Some(""),
        ) {
            // Fail unless we need to make the mount point
            if e != nix::errno::Errno::EINVAL || made_netns_persist_dir_mount {
                return Err(Error::MountError(
                    format!("--make-rshared {}", persist_dir.display()),
                    e,
                ));
            }
            // Recursively remount the persist dir on itself. The recursive flag
            // is so that any existing netns bindmounts are carried over.
            mount(
                Some(&persist_dir),
                &persist_dir,
                Some("none"),
                MsFlags::MS_BIND | MsFlags::MS_REC,
                Some(""),
            )
            .map_err(|e| {
                Error::MountError(
                    format!(
                        "-rbind {} to {}",
                        persist_dir.display(),
                        persist_dir.display()
                    ),
                    e,
                )
            })?;
            tracing::debug!(dir = %persist_dir.display(), "made netns persist dir a mountpoint");
            made_netns_persist_dir_mount = true;
        }

        Ok(())
    }
}

/// A default network namespace environment. Its persistence directory is `/var/run/netns`,
/// which is for consistency with the `ip-netns` tool.
/// See [ip-netns](https://man7.org/linux/man-pages/man8/ip-netns.8.html) for details.
#[derive(Copy, Clone, Default, Debug)]
pub struct DefaultEnv;

impl Env for DefaultEnv {
    fn persist_dir(&self) -> PathBuf {
        PathBuf::from("/var/run/netns")
    }
}

/// An environment persisting network namespaces in an arbitrary directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathEnv(pub PathBuf);

impl Env for PathEnv {
    fn persist_dir(&self) -> PathBuf {
        self.0.clone()
    }
}

fn validate_name(ns_name: &str) -> Result<()> {
    if ns_name.is_empty()
        || ns_name == "."
        || ns_name == ".."
        || ns_name.contains('/')
        || ns_name.contains('\0')
    {
        return Err(Error::InvalidName(ns_name.to_string()));
    }
    Ok(())
}

/// A network namespace descriptor: a handle plus the name it is registered under.
///
/// Descriptors that are not backed by a registry entry, such as the one returned
/// by [`get_from_current_thread`], have an empty name and no Env.
#[derive(Debug)]
pub struct NetNs<E: Env = DefaultEnv> {
    handle: NsHandle,
    name: String,
    path: PathBuf,
    env: Option<E>,
}

impl<E: Env> std::fmt::Display for NetNs<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Name: {}, Handle: {}", self.name, self.handle)
    }
}

impl<E1: Env, E2: Env> PartialEq<NetNs<E1>> for NetNs<E2> {
    fn eq(&self, other: &NetNs<E1>) -> bool {
        self.handle == other.handle
    }
}

impl<E: Env> NetNs<E> {
    /// Returns the NetNs registered under `ns_name` in `env`.
    ///
    /// Fails with [`ErrorKind::NotFound`] if there is no such entry, and with
    /// [`Error::NotNsError`] if the entry is a plain file that was never bind
    /// mounted (eg. left behind by a crash during creation). Such an entry can
    /// be cleared with [`delete_by_name_in_env`].
    ///
    /// [`ErrorKind::NotFound`]: crate::ErrorKind::NotFound
    pub fn get_from_env<S: AsRef<str>>(ns_name: S, env: E) -> Result<Self> {
        let ns_name = ns_name.as_ref();
        let ns_path = env.path_of(ns_name)?;
        let handle = NsHandle::from_path(&ns_path)?;

        Ok(Self {
            handle,
            name: ns_name.to_string(),
            path: ns_path,
            env: Some(env),
        })
    }

    /// Creates a new network namespace registered under `ns_name` in `env` and
    /// leaves the calling thread in it.
    ///
    /// The registry entry is created exclusively, so when several callers race
    /// for the same name exactly one succeeds and the others fail with
    /// [`ErrorKind::AlreadyExists`]. If a later step fails, the calling thread
    /// is moved back to its original namespace and the entry is removed again.
    ///
    /// Requires elevated privileges.
    ///
    /// [`ErrorKind::AlreadyExists`]: crate::ErrorKind::AlreadyExists
    pub fn create_in_env<S: AsRef<str>>(ns_name: S, env: E) -> Result<Self> {
        let ns_name = ns_name.as_ref();
        let ns_path = env.path_of(ns_name)?;
        env.init()?;

        let origin = NsHandle::current()?;

        // create an empty file at the mount point
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0)
            .open(&ns_path)
            .map_err(|e| Error::CreateNsError(ns_path.clone(), e))?;

        let handle = match Self::persistent(&ns_path) {
            Ok(handle) => handle,
            Err(e) => {
                Self::rollback(&origin, &ns_path);
                return Err(e);
            }
        };
        tracing::info!(name = ns_name, path = %ns_path.display(), "created network namespace");

        Ok(Self {
            handle,
            name: ns_name.to_string(),
            path: ns_path,
            env: Some(env),
        })
    }

    fn persistent(ns_path: &Path) -> Result<NsHandle> {
        // Create a new netns on the current thread.
        let handle = NsHandle::new_unshared()?;
        // bind mount the netns from the current thread (from /proc) onto the
        // mount point. This causes the namespace to persist, even when there
        // are no threads in the ns.
        let src = current_thread_netns_path();
        mount(
            Some(src.as_path()),
            ns_path,
            Some("none"),
            MsFlags::MS_BIND,
            Some(""),
        )
        .map_err(|e| {
            Error::MountError(
                format!("--bind {} to {}", src.display(), ns_path.display()),
                e,
            )
        })?;
        tracing::debug!(src = %src.display(), dst = %ns_path.display(), "bind mounted netns");
        Ok(handle)
    }

    fn rollback(origin: &NsHandle, ns_path: &Path) {
        if let Err(e) = origin.set() {
            tracing::warn!(error = %e, "failed to return to the original netns");
        }
        if let Err(e) = std::fs::remove_file(ns_path) {
            tracing::warn!(
                error = %e,
                path = %ns_path.display(),
                "failed to remove the registry entry of a half-created netns"
            );
        }
    }

    /// Switches the calling thread into the namespace registered under `ns_name`,
    /// creating it first if it does not exist.
    ///
    /// Requires elevated privileges.
    pub fn set_by_name_in_env<S: AsRef<str>>(ns_name: S, env: E) -> Result<Self>
    where
        E: Clone,
    {
        let ns_name = ns_name.as_ref();
        match Self::get_from_env(ns_name, env.clone()) {
            Ok(ns) => {
                ns.set()?;
                Ok(ns)
            }
            // create_in_env() leaves the thread in the new netns
            Err(e) if is_not_exist(&e) => Self::create_in_env(ns_name, env),
            Err(e) => Err(e),
        }
    }

    /// Makes sure a namespace is registered under `ns_name`, creating it if
    /// needed, without moving the calling thread.
    ///
    /// Requires elevated privileges.
    pub fn add_in_env<S: AsRef<str>>(ns_name: S, env: E) -> Result<Self>
    where
        E: Clone + Send + 'static,
    {
        let ns_name = ns_name.as_ref().to_string();
        // Namespace switches are per thread, so let a throwaway thread do them.
        let new_thread: JoinHandle<Result<Self>> =
            thread::spawn(move || Self::set_by_name_in_env(ns_name, env));
        match new_thread.join() {
            Ok(t) => t,
            Err(e) => Err(Error::JoinThreadError(format!("{:?}", e))),
        }
    }

    /// Gets the name of this network namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the path this network namespace was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the Env of this network namespace.
    pub fn env(&self) -> Option<&E> {
        self.env.as_ref()
    }

    /// Gets the handle of this network namespace.
    pub fn handle(&self) -> &NsHandle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn unique_id(&self) -> String {
        self.handle.unique_id()
    }

    /// Makes the current thread enter this network namespace.
    ///
    /// Requires elevated privileges.
    pub fn set(&self) -> Result<()> {
        self.handle.set()
    }

    /// Closes the handle. The namespace and its registry entry are kept.
    pub fn close(&mut self) -> Result<()> {
        self.handle.close()
    }

    /// Returns a descriptor of the same namespace under the same name, with its
    /// own duplicated handle.
    pub fn try_copy(&self) -> Result<Self>
    where
        E: Clone,
    {
        Ok(Self {
            handle: self.handle.try_clone()?,
            name: self.name.clone(),
            path: self.path.clone(),
            env: self.env.clone(),
        })
    }

    /// Removes this network namespace.
    ///
    /// The handle is closed first, so the removal does not depend on it.
    /// Namespaces that are not in a registry (eg. the ones from `/proc`) are
    /// only closed.
    pub fn delete(mut self) -> Result<()> {
        self.close()?;
        // Only unmount if it's been bind-mounted (don't touch namespaces in /proc...)
        match &self.env {
            Some(env) if env.contains(&self.path) => delete_by_name_in_env(&self.name, env),
            _ => Ok(()),
        }
    }

    /// Run a closure in NetNs and switch back to the original namespace afterwards.
    ///
    /// Requires elevated privileges.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> T,
    {
        // do nothing if the thread is already in this namespace
        if NsHandle::current()? == self.handle {
            return Ok(f(self));
        }
        // back to the old namespace on every exit path, panics included
        let guard = NsGuard::enter(&self.handle)?;

        let result = f(self);
        guard.restore()?;

        Ok(result)
    }
}

impl NetNs {
    /// Returns the NetNs registered under `ns_name` in `DefaultEnv`.
    pub fn get<S: AsRef<str>>(ns_name: S) -> Result<Self> {
        Self::get_from_env(ns_name, DefaultEnv)
    }

    /// Creates a new persistent (bind-mounted) network namespace in `DefaultEnv`
    /// and leaves the calling thread in it.
    ///
    /// The persist dir of network namespace will be created if it doesn't already exist.
    ///
    /// Requires elevated privileges.
    pub fn create<S: AsRef<str>>(ns_name: S) -> Result<Self> {
        Self::create_in_env(ns_name, DefaultEnv)
    }

    /// Attaches to, or creates, the network namespace `ns_name` in `DefaultEnv`
    /// and switches the calling thread into it.
    ///
    /// Requires elevated privileges.
    pub fn set_by_name<S: AsRef<str>>(ns_name: S) -> Result<Self> {
        Self::set_by_name_in_env(ns_name, DefaultEnv)
    }

    /// Attaches to, or creates, the network namespace `ns_name` in `DefaultEnv`
    /// without switching the calling thread.
    ///
    /// Requires elevated privileges.
    pub fn add<S: AsRef<str>>(ns_name: S) -> Result<Self> {
        Self::add_in_env(ns_name, DefaultEnv)
    }

    /// Run a closure in NetNs, which is specified by name and `DefaultEnv`.
    ///
    /// Requires elevated privileges.
    pub fn run_in<S, F, T>(ns_name: S, f: F) -> Result<T>
    where
        S: AsRef<str>,
        F: FnOnce(&Self) -> T,
    {
        // get network namespace
        let run_ns = Self::get_from_env(ns_name, DefaultEnv)?;
        run_ns.run(f)
    }
}

/// Removes the network namespace registered under `ns_name` in `DefaultEnv`.
pub fn delete_by_name<S: AsRef<str>>(ns_name: S) -> Result<()> {
    delete_by_name_in_env(ns_name, &DefaultEnv)
}

/// Removes the network namespace registered under `ns_name` in `env`.
///
/// The entry is detached even if it is busy, then removed. The removal is
/// attempted even if unmounting failed, but then the unmount error is returned.
/// A name without an entry fails with [`ErrorKind::NotFound`].
///
/// Requires elevated privileges.
///
/// [`ErrorKind::NotFound`]: crate::ErrorKind::NotFound
pub fn delete_by_name_in_env<S: AsRef<str>, E: Env>(ns_name: S, env: &E) -> Result<()> {
    let ns_name = ns_name.as_ref();
    let ns_path = env.path_of(ns_name)?;

    let unmounted = umount2(&ns_path, MntFlags::MNT_DETACH)
        .map_err(|e| Error::UnmountError(ns_path.clone(), e));
    let removed =
        std::fs::remove_file(&ns_path).map_err(|e| Error::RemoveNsError(ns_path.clone(), e));

    match (unmounted, removed) {
        (Err(e), Err(re)) => {
            if !is_not_exist(&re) {
                tracing::warn!(error = %re, "remove after failed unmount also failed");
            }
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), removed) => {
            removed?;
            tracing::info!(name = ns_name, path = %ns_path.display(), "deleted network namespace");
            Ok(())
        }
    }
}

/// Makes the current thread enter the namespace of `handle`.
pub fn set_by_handle(handle: &NsHandle) -> Result<()> {
    handle.set()
}

/// Returns the NetNs with the specified path.
pub fn get_from_path<P: AsRef<Path>>(ns_path: P) -> Result<NetNs> {
    let ns_path = ns_path.as_ref().to_path_buf();
    let handle = NsHandle::from_path(&ns_path)?;
    Ok(NetNs {
        handle,
        name: String::new(),
        path: ns_path,
        env: None,
    })
}

/// Returns the NetNs of current thread.
pub fn get_from_current_thread() -> Result<NetNs> {
    get_from_path(current_thread_netns_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use caps::{CapSet, Capability};
    use nix::errno::Errno;
    use std::sync::{Arc, Barrier};

    fn test_env(tag: &str) -> PathEnv {
        PathEnv(std::env::temp_dir().join(format!("named_netns_{}", tag)))
    }

    fn entries(env: &PathEnv, ns_name: &str) -> usize {
        std::fs::read_dir(env.persist_dir())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() == ns_name)
            .count()
    }

    struct TestNetNs {
        netns: Option<NetNs<PathEnv>>,
        env: PathEnv,
        ns_name: String,
    }

    impl TestNetNs {
        /// Creates `name` from a helper thread, so the test thread stays put.
        fn new(tag: &str, name: &str) -> Self {
            let env = test_env(tag);
            let netns = NetNs::add_in_env(name, env.clone()).unwrap();
            assert!(netns.path().exists());
            Self {
                netns: Some(netns),
                env,
                ns_name: String::from(name),
            }
        }

        fn netns(&self) -> &NetNs<PathEnv> {
            self.netns.as_ref().unwrap()
        }
    }

    impl Drop for TestNetNs {
        fn drop(&mut self) {
            if let Some(netns) = self.netns.take() {
                netns.delete().unwrap();
            }
            assert!(!self.env.persist_dir().join(&self.ns_name).exists());
        }
    }

    #[test]
    fn test_netns_display() {
        let ns = get_from_current_thread().unwrap();
        let print = format!("{}", ns);
        assert!(print.starts_with("Name: , Handle: NS("));
        assert!(print.contains("ino"));

        let new = TestNetNs::new("display", "test_netns_display");
        let print = format!("{}", new.netns());
        assert!(print.contains("Name: test_netns_display"));
    }

    #[test]
    fn test_netns_eq() {
        let ns1 = get_from_current_thread().unwrap();
        let ns2 = get_from_path("/proc/self/ns/net").unwrap();
        assert_eq!(ns1, ns2);
        assert_eq!(ns1.unique_id(), ns2.unique_id());

        let mut ns3 = get_from_path("/proc/self/ns/net").unwrap();
        ns3.close().unwrap();
        assert!(!ns3.is_open());
        assert_ne!(ns1, ns3);
    }

    #[test]
    fn test_invalid_names() {
        let env = test_env("invalid");
        for name in &["", ".", "..", "a/b", "../etc", "nul\0byte"] {
            let err = NetNs::get_from_env(name, env.clone()).unwrap_err();
            assert!(matches!(err, Error::InvalidName(_)), "{:?}", name);
            assert_eq!(err.kind(), ErrorKind::InvalidInput);

            let err = NetNs::create_in_env(name, env.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);

            let err = delete_by_name_in_env(name, &env).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        assert_eq!(env.path_of("ns-a").unwrap(), env.persist_dir().join("ns-a"));
    }

    #[test]
    fn test_env_contains() {
        let env = test_env("contains");
        assert!(env.contains(env.persist_dir().join("x")));
        assert!(!env.contains("/proc/self/ns/net"));
        assert!(DefaultEnv.contains("/var/run/netns/x"));
    }

    #[test]
    fn test_get_missing() {
        let env = test_env("missing");
        let err = NetNs::get_from_env("test_get_missing", env).unwrap_err();
        assert!(matches!(err, Error::OpenNsError(_, _)));
        assert!(is_not_exist(&err));
    }

    #[test]
    fn test_create_then_get() {
        let env = test_env("create_get");
        let _guard = NsGuard::new().unwrap();

        let created = NetNs::create_in_env("test_create_then_get", env.clone()).unwrap();
        assert_eq!(created.handle(), &NsHandle::current().unwrap());
        assert_eq!(created.name(), "test_create_then_get");
        assert_eq!(created.env(), Some(&env));

        let found = NetNs::get_from_env("test_create_then_get", env.clone()).unwrap();
        assert_eq!(created, found);
        assert_eq!(created.unique_id(), found.unique_id());

        // the name is taken now
        let err = NetNs::create_in_env("test_create_then_get", env.clone()).unwrap_err();
        assert!(matches!(err, Error::CreateNsError(_, _)));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(found.path().exists());

        drop(found);
        created.delete().unwrap();
        assert!(!env.persist_dir().join("test_create_then_get").exists());
    }

    #[test]
    fn test_set_by_name_idempotent() {
        let env = test_env("set_by_name");
        let src = NsHandle::current().unwrap();
        let guard = NsGuard::new().unwrap();

        let ns1 = NetNs::set_by_name_in_env("test_set_by_name", env.clone()).unwrap();
        assert_ne!(ns1.handle(), &src);
        assert_eq!(ns1.handle(), &NsHandle::current().unwrap());

        src.set().unwrap();
        let ns2 = NetNs::set_by_name_in_env("test_set_by_name", env.clone()).unwrap();
        assert_eq!(ns1, ns2);
        assert_eq!(ns2.handle(), &NsHandle::current().unwrap());
        assert_eq!(entries(&env, "test_set_by_name"), 1);

        guard.restore().unwrap();
        assert_eq!(src, NsHandle::current().unwrap());

        drop(ns2);
        ns1.delete().unwrap();
        assert_eq!(entries(&env, "test_set_by_name"), 0);
    }

    #[test]
    fn test_add_does_not_switch() {
        let src = NsHandle::current().unwrap();
        let new = TestNetNs::new("add", "test_add_does_not_switch");

        assert_eq!(src, NsHandle::current().unwrap());
        assert_ne!(&src, new.netns().handle());

        // adding again attaches to the same namespace
        let again = NetNs::add_in_env("test_add_does_not_switch", new.env.clone()).unwrap();
        assert_eq!(new.netns(), &again);
        assert_eq!(src, NsHandle::current().unwrap());
    }

    #[test]
    fn test_switch_and_back() {
        let new = TestNetNs::new("switch", "test_switch_and_back");
        let original = NsHandle::current().unwrap();
        let guard = NsGuard::new().unwrap();

        new.netns().set().unwrap();
        assert_eq!(new.netns().handle(), &NsHandle::current().unwrap());

        set_by_handle(&original).unwrap();
        assert_eq!(original.unique_id(), NsHandle::current().unwrap().unique_id());

        guard.restore().unwrap();
    }

    #[test]
    fn test_delete_by_name() {
        let env = test_env("delete");
        let err = delete_by_name_in_env("test_delete_by_name", &env).unwrap_err();
        assert!(matches!(err, Error::UnmountError(_, _)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut new = TestNetNs::new("delete", "test_delete_by_name");
        delete_by_name_in_env("test_delete_by_name", &env).unwrap();
        assert!(!env.persist_dir().join("test_delete_by_name").exists());

        let err = NetNs::get_from_env("test_delete_by_name", env).unwrap_err();
        assert!(is_not_exist(&err));

        // the descriptor still holds the namespace, only the name is gone
        let mut netns = new.netns.take().unwrap();
        assert!(netns.is_open());
        netns.close().unwrap();
    }

    #[test]
    fn test_delete_by_name_unmounted_entry() {
        let env = test_env("delete_plain");
        std::fs::create_dir_all(env.persist_dir()).unwrap();
        let ns_path = env.persist_dir().join("test_delete_plain");
        std::fs::write(&ns_path, b"").unwrap();

        let err = delete_by_name_in_env("test_delete_plain", &env).unwrap_err();
        assert!(matches!(err, Error::UnmountError(_, Errno::EINVAL)));
        assert_eq!(err.kind(), ErrorKind::OsFailure);
        // removed anyway
        assert!(!ns_path.exists());
    }

    #[test]
    fn test_get_orphaned_entry() {
        let env = test_env("orphan");
        std::fs::create_dir_all(env.persist_dir()).unwrap();
        let ns_path = env.persist_dir().join("test_orphan");
        std::fs::write(&ns_path, b"").unwrap();
        let src = NsHandle::current().unwrap();

        let err = NetNs::get_from_env("test_orphan", env.clone()).unwrap_err();
        assert!(matches!(err, Error::NotNsError(_)));
        assert!(!is_not_exist(&err));

        // neither attached nor recreated
        let err = NetNs::set_by_name_in_env("test_orphan", env.clone()).unwrap_err();
        assert!(matches!(err, Error::NotNsError(_)));
        assert_eq!(src, NsHandle::current().unwrap());

        std::fs::remove_file(&ns_path).unwrap();
    }

    /// A registry that skips the shared mountpoint setup.
    #[derive(Clone)]
    struct PlainDirEnv(PathBuf);

    impl Env for PlainDirEnv {
        fn persist_dir(&self) -> PathBuf {
            self.0.clone()
        }

        fn init(&self) -> Result<()> {
            std::fs::create_dir_all(&self.0).map_err(Error::CreateNsDirError)
        }
    }

    #[test]
    fn test_create_rolls_back_on_failure() {
        let env = PlainDirEnv(std::env::temp_dir().join("named_netns_rollback"));
        let ns_path = env.persist_dir().join("test_create_rollback");
        std::fs::remove_file(&ns_path).ok();

        let (result, origin, after) = thread::spawn(move || {
            // capabilities are per thread, only this one loses the right to unshare
            caps::drop(None, CapSet::Effective, Capability::CAP_SYS_ADMIN).unwrap();
            let origin = NsHandle::current().unwrap();
            let result = NetNs::create_in_env("test_create_rollback", env).map(|_| ());
            let after = NsHandle::current().unwrap();
            (result, origin, after)
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(Error::UnshareError(_))));
        assert!(!ns_path.exists());
        assert_eq!(origin, after);
    }

    #[test]
    fn test_descriptor_copy_close_delete() {
        let env = test_env("copy");
        let src = NsHandle::current().unwrap();
        let mut desc = NetNs::add_in_env("test_descriptor_copy", env.clone()).unwrap();

        let mut other = desc.try_copy().unwrap();
        assert_eq!(desc, other);
        assert_eq!(desc.unique_id(), other.unique_id());
        assert_eq!(desc.name(), other.name());

        other.close().unwrap();
        assert!(!other.is_open());
        assert!(desc.is_open());

        desc.close().unwrap();
        assert!(!desc.is_open());

        // deleting a closed descriptor still removes the binding
        desc.delete().unwrap();
        assert!(!env.persist_dir().join("test_descriptor_copy").exists());
        assert_eq!(src, NsHandle::current().unwrap());
    }

    #[test]
    fn test_delete_unregistered() {
        let ns = get_from_current_thread().unwrap();
        ns.delete().unwrap();
        assert!(NsHandle::current().unwrap().is_open());
    }

    #[test]
    fn test_concurrent_create() {
        let env = test_env("concurrent");
        env.init().unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let env = env.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    NetNs::create_in_env("test_concurrent_create", env)
                })
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let mut created: Vec<_> = results
            .into_iter()
            .filter_map(|r| match r {
                Ok(ns) => Some(ns),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::AlreadyExists);
                    None
                }
            })
            .collect();
        assert_eq!(created.len(), 1);

        let ns = created.pop().unwrap();
        assert!(ns.is_open());
        ns.delete().unwrap();
        assert_eq!(entries(&env, "test_concurrent_create"), 0);
    }

    #[test]
    fn test_netns_run() {
        let new = TestNetNs::new("run", "test_netns_run");

        let src_ns = get_from_current_thread().unwrap();

        let ret = new
            .netns()
            .run(|cur_ns| -> Result<()> {
                let cur_thread = get_from_current_thread().unwrap();
                assert_eq!(cur_ns, &cur_thread);
                // captured variables
                assert_eq!(cur_ns, new.netns());
                assert_ne!(cur_ns, &src_ns);

                Ok(())
            })
            .unwrap();
        assert!(matches!(ret, Ok(_)));
        assert_eq!(src_ns, get_from_current_thread().unwrap());

        // running in the namespace the thread is already in does not switch
        let cur = get_from_current_thread().unwrap();
        assert_eq!(cur.run(|_| 7).unwrap(), 7);
    }

    #[test]
    fn test_end_to_end() {
        let env = test_env("e2e");
        let d = NsHandle::current().unwrap();
        let guard = NsGuard::new().unwrap();

        let ns = NetNs::set_by_name_in_env("ns-a", env.clone()).unwrap();
        assert_ne!(d, NsHandle::current().unwrap());

        d.set().unwrap();
        assert_eq!(d, NsHandle::current().unwrap());

        ns.delete().unwrap();
        let err = NetNs::get_from_env("ns-a", env).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        guard.restore().unwrap();
    }
}
