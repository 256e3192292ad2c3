// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Contract of the optional kernel fast path.
//!
//! An XDP program attached to the rendezvous interface can rewrite and
//! retransmit datagrams whose destination CID matches an installed
//! redirect without waking userspace. The datapath stays correct without
//! it; when it is active, the splitter merely sees fewer datagrams. This
//! module defines only the interface the association store drives;
//! loading and attaching eBPF programs is the embedder's concern.

use std::net::SocketAddrV4;

use thiserror::Error;

use crate::cid::Cid;

/// Backend that mirrors CID routes into a kernel redirect map.
pub trait XdpRedirect: Send + Sync {
    /// Routes datagrams addressed to any of `cids` to `addr` in-kernel.
    fn add_ipv4_redirect(&self, addr: SocketAddrV4, cids: &[Cid]) -> Result<(), XdpError>;

    /// Removes any redirects installed for `cids`.
    fn remove_ipv4_redirect(&self, cids: &[Cid]) -> Result<(), XdpError>;

    /// Releases the backend, reporting every failure rather than the
    /// first.
    fn close(&self) -> Result<(), XdpCloseError> {
        Ok(())
    }
}

/// A backend failure, surfaced verbatim.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct XdpError(Box<dyn std::error::Error + Send + Sync>);

impl XdpError {
    /// Wraps a backend-specific failure.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(source.into())
    }
}

/// The failures hit while releasing a backend; each is retained so callers
/// may inspect them.
#[derive(Debug, Error)]
#[error("xdp close failed: {}", .errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", "))]
pub struct XdpCloseError {
    /// Every failure observed during the close, in order.
    pub errors: Vec<XdpError>,
}
