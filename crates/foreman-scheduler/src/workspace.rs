//! Workspace leasing.
//!
//! A per-node registry that serializes access to named workspace paths.
//! Non-concurrent projects take an exclusive lease so two builds never
//! write the same directory; shared leases may coexist with each other.
//! A lease is released exactly once, on every exit path, because release
//! happens in `Drop`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
struct Occupancy {
    exclusive: bool,
    holders: usize,
}

#[derive(Debug)]
struct Registry {
    occupants: Mutex<HashMap<PathBuf, Occupancy>>,
    // bumped on every release so waiters re-check
    epoch: watch::Sender<u64>,
}

impl Registry {
    fn occupants(&self) -> MutexGuard<'_, HashMap<PathBuf, Occupancy>> {
        self.occupants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, path: &Path) {
        let mut map = self.occupants();
        if let Some(occ) = map.get_mut(path) {
            occ.holders -= 1;
            if occ.holders == 0 {
                map.remove(path);
            }
        }
        drop(map);
        debug!(path = %path.display(), "workspace lease released");
        self.epoch.send_modify(|v| *v += 1);
    }

    fn try_grant(&self, path: &PathBuf, exclusive: bool) -> bool {
        let mut map = self.occupants();
        match map.get_mut(path) {
            None => {
                map.insert(
                    path.clone(),
                    Occupancy {
                        exclusive,
                        holders: 1,
                    },
                );
                true
            }
            Some(occ) if !occ.exclusive && !exclusive => {
                occ.holders += 1;
                true
            }
            Some(_) => false,
        }
    }
}

/// Lease registry for one node's workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceList {
    inner: Arc<Registry>,
}

impl Default for WorkspaceList {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceList {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Registry {
                occupants: Mutex::new(HashMap::new()),
                epoch,
            }),
        }
    }

    /// Acquire a lease on `path`, waiting until the path is compatible
    /// with the request: an exclusive lease needs the path free, a shared
    /// lease joins other shared holders. FIFO fairness is not guaranteed,
    /// only mutual exclusion.
    pub async fn acquire(&self, path: impl Into<PathBuf>, exclusive: bool) -> WorkspaceLease {
        let path = path.into();
        let mut epoch = self.inner.epoch.subscribe();
        loop {
            // mark the current epoch seen before inspecting state, so a
            // release between the check and the await still wakes us
            epoch.borrow_and_update();
            if self.inner.try_grant(&path, exclusive) {
                debug!(path = %path.display(), exclusive, "workspace lease granted");
                return WorkspaceLease {
                    registry: self.inner.clone(),
                    path,
                };
            }
            let _ = epoch.changed().await;
        }
    }

    /// Acquire without waiting; `None` if the path is currently
    /// incompatible with the request.
    pub fn try_acquire(&self, path: impl Into<PathBuf>, exclusive: bool) -> Option<WorkspaceLease> {
        let path = path.into();
        if self.inner.try_grant(&path, exclusive) {
            debug!(path = %path.display(), exclusive, "workspace lease granted");
            Some(WorkspaceLease {
                registry: self.inner.clone(),
                path,
            })
        } else {
            None
        }
    }

    /// Current number of lease holders on a path.
    pub fn holders(&self, path: impl AsRef<Path>) -> usize {
        self.inner
            .occupants()
            .get(path.as_ref())
            .map(|o| o.holders)
            .unwrap_or(0)
    }
}

/// Occupancy token for one workspace path. Dropping it releases the
/// lease.
#[derive(Debug)]
pub struct WorkspaceLease {
    registry: Arc<Registry>,
    path: PathBuf,
}

impl WorkspaceLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release, equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}
