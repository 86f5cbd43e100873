//! Module to order messages pertaining to sub-protocols other than
//! consensus, plus the view number used to track the current primary.

use std::cmp::{
    PartialOrd,
    PartialEq,
    Ordering,
};

use either::{
    Left,
    Right,
    Either,
};

#[cfg(feature = "serialize_serde")]
use serde::{Serialize, Deserialize};

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

/// Anything that can report the protocol sequence number it pertains to.
pub trait Orderable {
    /// Returns the sequence number of `self`.
    fn sequence_number(&self) -> SeqNo;
}

/// Represents a sequence number attributed to a client request
/// during a `Consensus` instance.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct SeqNo(i32);

/// Represents the view under which a replica believes a given node is
/// primary. Strictly increasing per replica, advanced by the view-change
/// machine.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
pub struct View(i32);

macro_rules! impl_seqno_like {
    ($ty:ident) => {
        impl From<u32> for $ty {
            #[inline]
            fn from(n: u32) -> $ty {
                // FIXME: is this correct?
                $ty(n as i32)
            }
        }

        impl From<$ty> for u32 {
            #[inline]
            fn from(n: $ty) -> u32 {
                n.0 as u32
            }
        }

        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &$ty) -> Option<Ordering> {
                Some(match self.index(*other) {
                    Right(0) => Ordering::Equal,
                    Left(InvalidSeqNo::Small) => Ordering::Less,
                    _ => Ordering::Greater,
                })
            }
        }

        impl $ty {
            /// Returns the following value of this counter.
            #[inline]
            pub(crate) fn next(self) -> $ty {
                let (next, overflow) = (self.0).overflowing_add(1);
                $ty(if overflow { 0 } else { next })
            }

            /// Return an appropriate value to index a `TboQueue`-like
            /// structure, relative to `other`.
            #[inline]
            pub(crate) fn index(self, other: $ty) -> Either<InvalidSeqNo, usize> {
                // TODO: add config param for these consts
                const OVERFLOW_THRES_POS: i32 = 10000;
                const OVERFLOW_THRES_NEG: i32 = -OVERFLOW_THRES_POS;
                // generous enough to span several checkpoint intervals'
                // worth of in-flight, buffered protocol messages
                const DROP_SEQNO_THRES: i32 = 4096;

                let index = {
                    let index = (self.0).wrapping_sub(other.0);
                    if index < OVERFLOW_THRES_NEG || index > OVERFLOW_THRES_POS {
                        // guard against overflows
                        i32::MAX
                            .wrapping_add(index)
                            .wrapping_add(1)
                    } else {
                        index
                    }
                };

                if index < 0 || index > DROP_SEQNO_THRES {
                    // drop old messages or messages whose seq no. is too
                    // large, which may be due to a DoS attack of
                    // a malicious node
                    Left(if index < 0 {
                        InvalidSeqNo::Small
                    } else {
                        InvalidSeqNo::Big
                    })
                } else {
                    Right(index as usize)
                }
            }
        }
    };
}

impl_seqno_like!(SeqNo);
impl_seqno_like!(View);

impl SeqNo {
    /// The zero sequence number, used before any request has been ordered.
    pub const ZERO: SeqNo = SeqNo(0);
}

impl View {
    /// The genesis view, in which replica 0 is primary.
    pub const ZERO: View = View(0);
}

impl View {
    /// Index, within a sorted peer list of `n` members, of the replica
    /// that is primary under this view.
    #[inline]
    pub fn primary_index(self, n: usize) -> usize {
        debug_assert!(n > 0);
        (u32::from(self) as usize) % n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_wraps_on_overflow() {
        let max = SeqNo::from(u32::MAX);
        assert_eq!(max.next(), SeqNo::from(0));
    }

    #[test]
    fn primary_rotates_with_view() {
        assert_eq!(View::from(0).primary_index(4), 0);
        assert_eq!(View::from(1).primary_index(4), 1);
        assert_eq!(View::from(4).primary_index(4), 0);
    }
}