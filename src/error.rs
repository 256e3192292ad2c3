// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Errors surfaced by dialing, accepting, and the rendezvous datapath.

use std::io;

use thiserror::Error;

use crate::config::HandlerError;
use crate::store::StoreError;

/// Top-level failure of a dial, accept, or rendezvous operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A mandatory option is missing or an option is unusable
    #[error("configuration: {0}")]
    Config(&'static str),
    /// The HTTP/3 rendezvous call failed
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    /// The association store failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The supplied TLS configuration cannot back a QUIC handshake
    #[error("crypto: {0}")]
    Crypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    /// The QUIC engine refused to start the connection
    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),
    /// The QUIC connection failed
    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),
    /// The local endpoint closed before a connection arrived
    #[error("endpoint closed")]
    EndpointClosed,
    /// Socket-level failure
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Failure of the HTTP/3 round trip to the rendezvous.
///
/// Surfaced from the first dial-side send or from accept-side setup; the
/// rendezvous transport is torn down on every one of these paths.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RendezvousError {
    /// The request URI names no host to dial
    #[error("rendezvous request has no usable authority")]
    NoAuthority,
    /// The rendezvous host resolved to no address
    #[error("rendezvous host did not resolve")]
    Unresolvable,
    /// The request builder hook failed
    #[error("request builder: {0}")]
    Builder(#[source] HandlerError),
    /// The relay TLS configuration cannot back a QUIC handshake
    #[error("crypto: {0}")]
    Crypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    /// Connecting to the rendezvous failed
    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),
    /// The rendezvous connection failed
    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),
    /// HTTP/3 protocol failure
    #[error("http/3: {0}")]
    Http(#[from] h3::Error),
    /// The rendezvous closed the connection before responding
    #[error("rendezvous connection closed before the response arrived")]
    TransportClosed,
    /// The response handler hook rejected the response
    #[error("response handler: {0}")]
    Handler(#[source] HandlerError),
    /// Socket-level failure
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}
