// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! CID-to-address association table for the rendezvous.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::cid::Cid;
use crate::xdp::{XdpError, XdpRedirect};

/// The record binding a peer's CID set to its current UDP address.
///
/// Every CID is data-plane (plane bit clear); the table never holds a
/// control-plane CID.
#[derive(Debug, Clone)]
pub struct Association {
    /// CIDs the peer will place on the wire.
    pub cids: Vec<Cid>,
    /// Where datagrams carrying those CIDs are forwarded.
    pub addr: SocketAddr,
}

/// Association table failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No association exists for the queried CID
    #[error("association for this connection ID does not exist")]
    NotFound,
    /// The kernel redirect backend rejected the update
    #[error("xdp backend: {0}")]
    Xdp(#[from] XdpError),
}

/// Where the splitter resolves destination CIDs to peer addresses.
pub trait AssociationStore: Send + Sync {
    /// Makes every CID of `association` route to its address, atomically
    /// as a batch. Last writer wins per CID.
    fn put(&self, association: Association) -> Result<(), StoreError>;

    /// Resolves a wire CID. Only the address of the returned association
    /// is guaranteed to be populated.
    fn get(&self, cid: &[u8]) -> Result<Association, StoreError>;
}

/// In-memory store backed by a single mutexed map.
///
/// Associations live until the process exits; nothing evicts them. At the
/// expected scale (tens of CIDs per peer) one mutex is sufficient.
#[derive(Default)]
pub struct MapStore {
    map: Mutex<HashMap<Cid, SocketAddr>>,
    xdp: Option<Arc<dyn XdpRedirect>>,
}

impl MapStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with a kernel fast path attached; IPv4
    /// insertions are mirrored into its redirect map.
    pub fn with_xdp(xdp: Arc<dyn XdpRedirect>) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            xdp: Some(xdp),
        }
    }
}

impl AssociationStore for MapStore {
    fn put(&self, association: Association) -> Result<(), StoreError> {
        debug_assert!(association.cids.iter().all(|cid| !cid.is_control_plane()));
        {
            let mut map = self.map.lock().unwrap();
            for cid in &association.cids {
                map.insert(*cid, association.addr);
            }
        }
        debug!(cids = association.cids.len(), addr = %association.addr, "stored association");
        if let Some(xdp) = &self.xdp {
            if let SocketAddr::V4(addr) = association.addr {
                // The map update above stands even if the kernel path
                // rejects the entry; userspace forwarding remains correct.
                xdp.add_ipv4_redirect(addr, &association.cids)?;
            }
        }
        Ok(())
    }

    fn get(&self, cid: &[u8]) -> Result<Association, StoreError> {
        let cid = Cid::from_slice(cid).ok_or(StoreError::NotFound)?;
        let map = self.map.lock().unwrap();
        match map.get(&cid) {
            Some(&addr) => Ok(Association {
                cids: Vec::new(),
                addr,
            }),
            None => Err(StoreError::NotFound),
        }
    }
}
