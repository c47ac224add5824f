//! In-memory mapping from network origin to logical identity and active
//! session. Owned by the session tracker; nothing else mutates it.

use std::collections::HashMap;
use std::net::SocketAddr;

use model::{OwnerId, SessionId};

use crate::session::ActiveSession;
use crate::IdentityResolver;

pub struct SourceEntry {
    pub owner: OwnerId,
    pub active: Option<ActiveSession>,
}

/// One entry per distinct origin ever seen. Entries are created lazily on
/// first packet and never evicted; session closure only clears the
/// active-session slot, so a returning source reuses its identity.
pub struct SourceRegistry {
    entries: HashMap<SocketAddr, SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn entry_mut(
        &mut self,
        source: SocketAddr,
        resolver: &dyn IdentityResolver,
    ) -> &mut SourceEntry {
        self.entries.entry(source).or_insert_with(|| SourceEntry {
            owner: resolver.owner_for(source),
            active: None,
        })
    }

    pub fn get(&self, source: &SocketAddr) -> Option<&SourceEntry> {
        self.entries.get(source)
    }

    pub fn current_session(&self, source: &SocketAddr) -> Option<SessionId> {
        self.entries
            .get(source)
            .and_then(|e| e.active.as_ref().map(|a| a.id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut SourceEntry)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
