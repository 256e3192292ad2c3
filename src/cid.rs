// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Deterministic, keyed connection-ID namespace.
//!
//! Every connection ID in the system is 12 bytes, and the top bit of byte 0
//! assigns it to a plane: set means HTTP/3 rendezvous traffic, clear means
//! peer-to-peer traffic. That bit is the only demultiplexing signal
//! available at the UDP layer.
//!
//! A [`KeyedCidGenerator`] derives the remaining bits with keyed BLAKE2b
//! over a monotonic counter. Two generators built from the same 16-byte key
//! and plane emit byte-identical sequences, which is what lets the
//! rendezvous pre-compute the CIDs a peer will put on the wire after being
//! told nothing but the key and an upper bound on the count.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blake2::digest::consts::U12;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use quinn_proto::{ConnectionId, ConnectionIdGenerator, InvalidCid};
use rand::RngCore;

/// Length in bytes of every connection ID in the namespace.
pub const CID_LEN: usize = 12;

/// Length in bytes of a namespace key.
pub const KEY_LEN: usize = 16;

/// Bit of byte 0 that assigns a CID to the HTTP/3 control plane.
pub(crate) const PLANE_BIT: u8 = 0x80;

type CidMac = Blake2bMac<U12>;

/// Whether a wire CID belongs to the HTTP/3 control plane.
pub(crate) fn is_control_plane(cid: &[u8]) -> bool {
    cid.first().is_some_and(|byte| byte & PLANE_BIT != 0)
}

/// A 12-byte QUIC connection ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; CID_LEN]);

impl Cid {
    /// Reads a CID from `bytes`, which must be exactly 12 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut cid = [0; CID_LEN];
        if bytes.len() != CID_LEN {
            return None;
        }
        cid.copy_from_slice(bytes);
        Some(Self(cid))
    }

    /// Whether this CID belongs to the HTTP/3 control plane.
    pub fn is_control_plane(&self) -> bool {
        is_control_plane(&self.0)
    }
}

impl AsRef<[u8]> for Cid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Cid> for ConnectionId {
    fn from(cid: Cid) -> Self {
        ConnectionId::new(&cid.0)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Issues the deterministic CID sequence of one endpoint.
///
/// `next_cid` is safe under concurrent callers: the counter advance is
/// atomic and a CID is never reused within the generator's lifetime.
/// Clones share the counter, so handing clones to several consumers cannot
/// fork the sequence.
#[derive(Clone)]
pub struct KeyedCidGenerator {
    key: [u8; KEY_LEN],
    control_plane: bool,
    counter: Arc<AtomicU32>,
}

impl KeyedCidGenerator {
    /// Creates a generator over `key`, drawing a fresh random key when
    /// `None`.
    ///
    /// `control_plane` selects the half of the CID universe the generator
    /// emits: set for HTTP/3 rendezvous traffic, clear for peer-to-peer
    /// traffic.
    pub fn new(key: Option<[u8; KEY_LEN]>, control_plane: bool) -> Self {
        let key = key.unwrap_or_else(|| {
            let mut key = [0; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            key
        });
        Self {
            key,
            control_plane,
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The namespace key. Whoever holds it can reproduce the sequence.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Returns the next CID in the sequence.
    pub fn next_cid(&self) -> Cid {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.derive(counter)
    }

    fn derive(&self, counter: u32) -> Cid {
        let mut mac = CidMac::new_from_slice(&self.key).expect("BLAKE2b accepts 16-byte keys");
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut cid = [0; CID_LEN];
        cid.copy_from_slice(&digest);
        if self.control_plane {
            cid[0] |= PLANE_BIT;
        } else {
            cid[0] &= !PLANE_BIT;
        }
        Cid(cid)
    }

    /// Pre-computes the first `num` data-plane CIDs of the namespace
    /// identified by `key`.
    ///
    /// The result equals the sequence a peer-side generator over the same
    /// key will issue; the rendezvous registers these so it can recognize
    /// the peer's CIDs when they appear in foreign datagrams.
    pub fn derive_data_plane(key: [u8; KEY_LEN], num: usize) -> Vec<Cid> {
        let generator = Self::new(Some(key), false);
        (0..num).map(|_| generator.next_cid()).collect()
    }
}

impl fmt::Debug for KeyedCidGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The key stays out of logs.
        f.debug_struct("KeyedCidGenerator")
            .field("control_plane", &self.control_plane)
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionIdGenerator for KeyedCidGenerator {
    fn generate_cid(&mut self) -> ConnectionId {
        self.next_cid().into()
    }

    fn validate(&self, cid: &ConnectionId) -> Result<(), InvalidCid> {
        if cid.len() == CID_LEN {
            Ok(())
        } else {
            Err(InvalidCid)
        }
    }

    fn cid_len(&self) -> usize {
        CID_LEN
    }

    fn cid_lifetime(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_deterministic() {
        let key = [7; KEY_LEN];
        let a = KeyedCidGenerator::new(Some(key), false);
        let b = KeyedCidGenerator::new(Some(key), false);
        for _ in 0..8 {
            assert_eq!(a.next_cid(), b.next_cid());
        }
    }

    #[test]
    fn derivation_matches_issued_sequence() {
        let key = [3; KEY_LEN];
        let generator = KeyedCidGenerator::new(Some(key), false);
        let issued: Vec<Cid> = (0..5).map(|_| generator.next_cid()).collect();
        assert_eq!(KeyedCidGenerator::derive_data_plane(key, 5), issued);
    }

    #[test]
    fn plane_bit_partitions_the_namespace() {
        let key = [0; KEY_LEN];
        let control = KeyedCidGenerator::new(Some(key), true);
        let data = KeyedCidGenerator::new(Some(key), false);
        for _ in 0..16 {
            let c = control.next_cid();
            let d = data.next_cid();
            assert!(c.is_control_plane());
            assert!(!d.is_control_plane());
            // Same key, same counter: the CIDs differ only in the plane bit.
            assert_eq!(c.as_ref()[0] & !PLANE_BIT, d.as_ref()[0] & !PLANE_BIT);
            assert_eq!(&c.as_ref()[1..], &d.as_ref()[1..]);
        }
    }

    #[test]
    fn derivation_is_keyed_blake2b_of_the_counter() {
        let key = [0; KEY_LEN];
        let generator = KeyedCidGenerator::new(Some(key), false);
        for counter in 1u32..=3 {
            let mut mac = CidMac::new_from_slice(&key).unwrap();
            mac.update(&counter.to_be_bytes());
            let mut expected: [u8; CID_LEN] = mac.finalize().into_bytes().into();
            expected[0] &= !PLANE_BIT;
            assert_eq!(generator.next_cid().as_ref(), expected);
        }
    }

    #[test]
    fn quinn_generator_contract() {
        let mut generator = KeyedCidGenerator::new(None, false);
        let cid = generator.generate_cid();
        assert_eq!(cid.len(), CID_LEN);
        assert_eq!(generator.cid_len(), CID_LEN);
        assert!(generator.validate(&cid).is_ok());
        assert!(generator
            .validate(&ConnectionId::new(&[0; CID_LEN - 1]))
            .is_err());
        assert!(generator.cid_lifetime().is_none());
    }

    #[test]
    fn no_reuse_under_contention() {
        use std::collections::HashSet;

        let generator = KeyedCidGenerator::new(None, false);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..256).map(|_| generator.next_cid()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for cid in handle.join().unwrap() {
                assert!(seen.insert(cid), "duplicate CID issued");
            }
        }
    }
}
