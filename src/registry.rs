use crate::group::{GroupId, GroupShared};
use dashmap::{DashMap, DashSet};
use std::{net::SocketAddr, sync::Arc};

/// Address-indexed lookup of live groups, used for connection reuse.
///
/// Guarded by its own shard locks, never by a group's lock.
#[derive(Debug, Default)]
pub(crate) struct GroupRegistry {
    all: DashMap<GroupId, Arc<GroupShared>>,
    by_local: DashMap<SocketAddr, DashSet<GroupId>>,
    by_remote: DashMap<SocketAddr, DashSet<GroupId>>,
    shareable: DashMap<SocketAddr, DashSet<GroupId>>,
}

impl GroupRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, group: &Arc<GroupShared>, shareable: bool) {
        let id = group.id();
        self.all.insert(id, Arc::clone(group));
        if let Some(local) = group.local_addr() {
            self.by_local.entry(local).or_default().insert(id);
        }
        if let Some(remote) = group.peer_addr() {
            self.by_remote.entry(remote).or_default().insert(id);
            if shareable {
                self.shareable.entry(remote).or_default().insert(id);
            }
        }
    }

    pub(crate) fn remove(&self, group: &GroupShared) {
        let id = group.id();
        if self.all.remove(&id).is_none() {
            return;
        }
        if let Some(local) = group.local_addr() {
            Self::unindex(&self.by_local, local, id);
        }
        if let Some(remote) = group.peer_addr() {
            Self::unindex(&self.by_remote, remote, id);
            Self::unindex(&self.shareable, remote, id);
        }
    }

    fn unindex(index: &DashMap<SocketAddr, DashSet<GroupId>>, addr: SocketAddr, id: GroupId) {
        index.remove_if(&addr, |_, ids| {
            ids.remove(&id);
            ids.is_empty()
        });
    }

    fn resolve(
        &self,
        index: &DashMap<SocketAddr, DashSet<GroupId>>,
        addr: &SocketAddr,
    ) -> Vec<Arc<GroupShared>> {
        let ids: Vec<GroupId> = match index.get(addr) {
            Some(ids) => ids.iter().map(|id| *id).collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.all.get(id).map(|group| Arc::clone(group.value())))
            .collect()
    }

    /// Shareable groups connected to `remote`, bound to `local` if given.
    pub(crate) fn find_shareable(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Vec<Arc<GroupShared>> {
        self.resolve(&self.shareable, &remote)
            .into_iter()
            .filter(|group| local.is_none() || group.local_addr() == local)
            .filter(|group| !group.is_terminated())
            .collect()
    }

    pub(crate) fn by_local(&self, local: &SocketAddr) -> Vec<Arc<GroupShared>> {
        self.resolve(&self.by_local, local)
    }

    pub(crate) fn by_remote(&self, remote: &SocketAddr) -> Vec<Arc<GroupShared>> {
        self.resolve(&self.by_remote, remote)
    }

    pub(crate) fn get(&self, id: GroupId) -> Option<Arc<GroupShared>> {
        self.all.get(&id).map(|group| Arc::clone(group.value()))
    }

    pub(crate) fn groups(&self) -> Vec<Arc<GroupShared>> {
        self.all.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.all.len()
    }
}
