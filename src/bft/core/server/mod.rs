//! View tracking for the replica group.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::ordering::{Orderable, View};

/// Quorum sizing derived from the group's fault tolerance `f`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone)]
pub struct ViewParams {
    n: usize,
    f: usize,
}

impl ViewParams {
    /// Builds a new `ViewParams`, validating `n >= 3f+1`.
    pub fn new(n: usize, f: usize) -> Option<Self> {
        if n >= 3 * f + 1 {
            Some(Self { n, f })
        } else {
            None
        }
    }

    /// Total number of replicas in the group.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Maximum number of tolerated faulty replicas.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Size of a commit quorum: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Size of a prepare quorum: `2f`.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f
    }
}

/// Identifies the currently active view: which replica is primary, and
/// the quorum parameters of the replica group.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone)]
pub struct ViewInfo {
    view: View,
    params: ViewParams,
}

impl Orderable for ViewInfo {
    fn sequence_number(&self) -> crate::bft::ordering::SeqNo {
        crate::bft::ordering::SeqNo::from(u32::from(self.view))
    }
}

impl ViewInfo {
    /// Builds a new `ViewInfo` for the given view number and quorum params.
    pub fn new(view: View, n: usize, f: usize) -> Option<Self> {
        Some(Self {
            view,
            params: ViewParams::new(n, f)?,
        })
    }

    /// Returns the view number.
    pub fn view(&self) -> View {
        self.view
    }

    /// Returns the quorum params of this view.
    pub fn params(&self) -> &ViewParams {
        &self.params
    }

    /// Returns the id of the replica which is primary under this view,
    /// assuming peers are addressed `0..n`.
    pub fn leader(&self) -> NodeId {
        NodeId::from(self.view.primary_index(self.params.n()) as u32)
    }

    /// Returns the next view, used when a view-change completes.
    pub fn next_view(&self) -> Self {
        Self {
            view: self.view.next(),
            params: self.params,
        }
    }
}
