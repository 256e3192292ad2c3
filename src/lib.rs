// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Rendezvous-assisted end-to-end QUIC through NATs.
//!
//! Two peers behind NATs establish a direct QUIC connection with the help
//! of a rendezvous server both can reach. The rendezvous serves an HTTP/3
//! registration API and forwards raw QUIC datagrams on the same UDP
//! socket, steering them by connection ID: every CID in the system is 12
//! bytes, its top bit separates rendezvous traffic from peer traffic, and
//! data-plane CIDs are derived deterministically from a peer's namespace
//! key. After one registration carrying nothing but the key and a count,
//! the rendezvous recognizes every CID that peer will use.
//!
//! The pieces:
//!
//! - the rendezvous wraps its UDP socket in a [`SplitterSocket`], serves
//!   HTTP/3 over it, and calls [`SplitterSocket::register`] from its
//!   registration handler;
//! - the accepting peer calls [`accept`] with the dialer's Initial
//!   datagram, received out of band over the application's signalling
//!   channel;
//! - the dialing peer calls [`dial`]; its first datagram is intercepted
//!   and carried to the rendezvous inside the HTTP/3 request built by its
//!   hook, and everything after that is plain UDP.
//!
//! The wire format of the registration exchange is left to the
//! application: both sides supply request builders through [`Config`].

mod accept;
mod cid;
mod config;
mod dial;
mod error;
mod gate;
mod packet;
mod relay;
mod shared;
mod splitter;
mod store;
mod xdp;

pub use crate::accept::accept;
pub use crate::cid::{Cid, KeyedCidGenerator, CID_LEN, KEY_LEN};
pub use crate::config::{
    standard_endpoint_config, standard_transport_config, AcceptRequestFn, Config, DialRequestFn,
    HandlerError, ResponseHandler, TlsMutator,
};
pub use crate::dial::dial;
pub use crate::error::{Error, RendezvousError};
pub use crate::splitter::SplitterSocket;
pub use crate::store::{Association, AssociationStore, MapStore, StoreError};
pub use crate::xdp::{XdpCloseError, XdpError, XdpRedirect};

/// An established end-to-end connection and the endpoint that drives it.
///
/// Keep this alive for the life of the connection; the endpoint owns the
/// socket pump underneath it.
#[derive(Debug)]
pub struct P2pConnection {
    pub(crate) endpoint: quinn::Endpoint,
    pub(crate) connection: quinn::Connection,
}

impl P2pConnection {
    /// The end-to-end QUIC connection.
    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    /// The endpoint backing the connection, e.g. for
    /// [`wait_idle`](quinn::Endpoint::wait_idle).
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
