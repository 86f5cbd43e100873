//! Tracks pending, prepared, committed and current replica-group
//! configurations (membership reconfiguration).
//!
//! Grounded directly on `pbft_config_store.hpp`: a configuration is
//! identified by the hash of its peer list, and moves through the states
//! `accepted -> prepared -> committed -> current -> deprecated` as the
//! corresponding reconfiguration request moves through consensus.

use std::collections::HashMap;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::View;

/// An ordered list of replica peers, plus the quorum size `f` they agree
/// to tolerate. Content-addressed by `hash()`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Configuration {
    peers: Vec<NodeId>,
    f: usize,
}

impl Configuration {
    /// Builds a new configuration from an ordered peer list.
    pub fn new(peers: Vec<NodeId>, f: usize) -> Self {
        Self { peers, f }
    }

    /// The ordered peer list.
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Maximum tolerated faulty replicas under this configuration.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Content hash identifying this configuration.
    pub fn hash(&self) -> Digest {
        let mut ctx = crate::bft::crypto::hash::Context::new();
        for peer in &self.peers {
            ctx.update(&u32::from(*peer).to_le_bytes());
        }
        ctx.update(&(self.f as u64).to_le_bytes());
        ctx.finish()
    }
}

/// A membership-change request, carried through the ordinary consensus
/// pipeline like any other operation: on execution it flips the named
/// configuration to committed and the replica schedules a view-change that
/// installs it as current.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReconfigRequest {
    /// Admits the given configuration (the full resulting peer list).
    Join(Configuration),
    /// Removes a peer from whatever configuration is current at execution.
    Leave(NodeId),
}

/// Lifecycle state of a tracked configuration.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConfigState {
    Unknown,
    Accepted,
    Prepared,
    Committed,
    Current,
    Deprecated,
}

struct ConfigInfo {
    index: u64,
    config: Configuration,
    state: ConfigState,
    views: Vec<View>,
}

/// Tracks every configuration this replica has accepted, and which one is
/// currently active.
pub struct ConfigStore {
    configs: HashMap<Digest, ConfigInfo>,
    view_configs: HashMap<View, Digest>,
    current_config: Option<Digest>,
    next_index: u64,
}

impl ConfigStore {
    /// Creates an empty config store, seeded with the genesis configuration
    /// as the current one.
    pub fn new(genesis: Configuration) -> Self {
        let mut store = Self {
            configs: HashMap::new(),
            view_configs: HashMap::new(),
            current_config: None,
            next_index: 0,
        };
        let hash = genesis.hash();
        store.add(genesis);
        store.set_current(&hash, View::from(0u32));
        store
    }

    /// Adds a new, freshly-accepted configuration to the store.
    pub fn add(&mut self, config: Configuration) -> Digest {
        let hash = config.hash();
        let index = self.next_index;
        self.next_index += 1;
        self.configs.entry(hash).or_insert(ConfigInfo {
            index,
            config,
            state: ConfigState::Accepted,
            views: Vec::new(),
        });
        hash
    }

    /// Returns the configuration with the given hash, if tracked.
    pub fn get(&self, hash: &Digest) -> Option<&Configuration> {
        self.configs.get(hash).map(|info| &info.config)
    }

    /// Returns the configuration applicable to a given (possibly archived)
    /// view.
    pub fn get_for_view(&self, view: View) -> Option<&Configuration> {
        let hash = self.view_configs.get(&view)?;
        self.get(hash)
    }

    /// Marks a configuration as prepared.
    pub fn set_prepared(&mut self, hash: &Digest) -> bool {
        self.set_state(hash, ConfigState::Prepared)
    }

    /// Marks a configuration as committed.
    pub fn set_committed(&mut self, hash: &Digest) -> bool {
        self.set_state(hash, ConfigState::Committed)
    }

    /// Marks a configuration as the currently active one under `view`,
    /// deprecating whatever was current before it.
    pub fn set_current(&mut self, hash: &Digest, view: View) -> bool {
        if !self.configs.contains_key(hash) {
            return false;
        }
        if let Some(previous) = self.current_config.take() {
            if previous != *hash {
                if let Some(info) = self.configs.get_mut(&previous) {
                    info.state = ConfigState::Deprecated;
                }
            }
        }
        self.current_config = Some(*hash);
        self.view_configs.insert(view, *hash);
        if let Some(info) = self.configs.get_mut(hash) {
            info.state = ConfigState::Current;
            info.views.push(view);
        }
        true
    }

    fn set_state(&mut self, hash: &Digest, state: ConfigState) -> bool {
        match self.configs.get_mut(hash) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    /// Returns the state of a tracked configuration.
    pub fn state_of(&self, hash: &Digest) -> ConfigState {
        self.configs
            .get(hash)
            .map(|info| info.state)
            .unwrap_or(ConfigState::Unknown)
    }

    /// Returns the configuration marked as current.
    pub fn current(&self) -> Option<&Configuration> {
        let hash = self.current_config.as_ref()?;
        self.get(hash)
    }

    /// Hash of the most recent configuration that is prepared, committed or
    /// current.
    pub fn newest_prepared(&self) -> Option<Digest> {
        self.newest(&[
            ConfigState::Prepared,
            ConfigState::Committed,
            ConfigState::Current,
        ])
    }

    /// Hash of the most recent configuration that is committed or current.
    pub fn newest_committed(&self) -> Option<Digest> {
        self.newest(&[ConfigState::Committed, ConfigState::Current])
    }

    fn newest(&self, states: &[ConfigState]) -> Option<Digest> {
        self.configs
            .iter()
            .filter(|(_, info)| states.contains(&info.state))
            .max_by_key(|(_, info)| info.index)
            .map(|(hash, _)| *hash)
    }

    /// A configuration is acceptable for a new reconfiguration proposal if
    /// it isn't already tracked, or is tracked but not yet prepared.
    pub fn is_acceptable(&self, hash: &Digest) -> bool {
        match self.configs.get(hash) {
            None => true,
            Some(info) => matches!(info.state, ConfigState::Accepted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(peers: &[u32]) -> Configuration {
        Configuration::new(peers.iter().copied().map(NodeId::from).collect(), 1)
    }

    #[test]
    fn genesis_is_current() {
        let store = ConfigStore::new(config(&[0, 1, 2, 3]));
        assert!(store.current().is_some());
    }

    #[test]
    fn reconfiguration_deprecates_previous() {
        let mut store = ConfigStore::new(config(&[0, 1, 2, 3]));
        let genesis_hash = store.current().unwrap().hash();
        let next = config(&[0, 1, 2, 3, 4]);
        let next_hash = store.add(next);
        store.set_prepared(&next_hash);
        store.set_committed(&next_hash);
        store.set_current(&next_hash, View::from(1u32));

        assert_eq!(store.state_of(&next_hash), ConfigState::Current);
        assert_eq!(store.state_of(&genesis_hash), ConfigState::Deprecated);
        assert_eq!(store.newest_committed(), Some(next_hash));
    }

    #[test]
    fn unprepared_config_is_acceptable() {
        let mut store = ConfigStore::new(config(&[0, 1, 2, 3]));
        let next_hash = store.add(config(&[0, 1, 2, 3, 4]));
        assert!(store.is_acceptable(&next_hash));
        store.set_prepared(&next_hash);
        assert!(!store.is_acceptable(&next_hash));
    }
}
