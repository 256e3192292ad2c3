// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Connection options, rendezvous request hooks, and QUIC defaults.

use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use quinn::{EndpointConfig, TransportConfig};

use crate::cid::{KeyedCidGenerator, KEY_LEN};
use crate::error::Error;

/// Failure type produced by the request and response hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked once with the collected rendezvous response.
pub type ResponseHandler = Box<dyn FnOnce(Response<Bytes>) -> Result<(), HandlerError> + Send>;

/// Builds the dial-side rendezvous request.
///
/// Called once up front with both arguments `None` purely to discover the
/// rendezvous URI (that request is discarded), then once with the captured
/// Initial datagram and the dialer's namespace key. The wire format of the
/// request body is the application's business.
pub type DialRequestFn = Arc<
    dyn Fn(
            Option<&[u8]>,
            Option<&[u8; KEY_LEN]>,
        ) -> Result<(Request<Bytes>, ResponseHandler), HandlerError>
        + Send
        + Sync,
>;

/// Builds the accept-side registration request from the namespace key.
pub type AcceptRequestFn = Arc<
    dyn Fn(&[u8; KEY_LEN]) -> Result<(Request<Bytes>, ResponseHandler), HandlerError>
        + Send
        + Sync,
>;

/// Rewrites the relay TLS configuration before each rendezvous dial.
pub type TlsMutator = Arc<dyn Fn(&mut rustls::ClientConfig) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct RelayOptions {
    pub(crate) transport: Option<Arc<TransportConfig>>,
    pub(crate) tls_mutator: Option<TlsMutator>,
}

/// Options for [`dial`](crate::dial()) and [`accept`](crate::accept()).
///
/// The request builder for the side in use is mandatory; everything else
/// has workable defaults. Transport configurations are accepted from the
/// caller but the datapath's own requirements are forced onto them: CIDs
/// come from the keyed generator and path-MTU discovery stays off.
#[derive(Clone, Default)]
pub struct Config {
    pub(crate) p2p_transport: Option<Arc<TransportConfig>>,
    pub(crate) p2p_client_crypto: Option<rustls::ClientConfig>,
    pub(crate) p2p_server_crypto: Option<rustls::ServerConfig>,
    pub(crate) relay: RelayOptions,
    pub(crate) dial_request: Option<DialRequestFn>,
    pub(crate) accept_request: Option<AcceptRequestFn>,
}

impl Config {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport parameters for the end-to-end connection.
    pub fn p2p_transport(mut self, mut transport: TransportConfig) -> Self {
        transport.mtu_discovery_config(None);
        self.p2p_transport = Some(Arc::new(transport));
        self
    }

    /// TLS client configuration the dialing peer offers its counterpart.
    pub fn p2p_client_crypto(mut self, crypto: rustls::ClientConfig) -> Self {
        self.p2p_client_crypto = Some(crypto);
        self
    }

    /// TLS server configuration the accepting peer presents.
    pub fn p2p_server_crypto(mut self, crypto: rustls::ServerConfig) -> Self {
        self.p2p_server_crypto = Some(crypto);
        self
    }

    /// Transport parameters for the HTTP/3 call to the rendezvous.
    pub fn relay_transport(mut self, mut transport: TransportConfig) -> Self {
        transport.mtu_discovery_config(None);
        self.relay.transport = Some(Arc::new(transport));
        self
    }

    /// Adjusts the relay TLS configuration before each rendezvous dial,
    /// e.g. to install custom roots.
    pub fn relay_tls_mutator(
        mut self,
        mutator: impl Fn(&mut rustls::ClientConfig) + Send + Sync + 'static,
    ) -> Self {
        self.relay.tls_mutator = Some(Arc::new(mutator));
        self
    }

    /// Builder for the dial-side rendezvous request. Mandatory when
    /// dialing.
    pub fn dial_request(
        mut self,
        build: impl Fn(
                Option<&[u8]>,
                Option<&[u8; KEY_LEN]>,
            ) -> Result<(Request<Bytes>, ResponseHandler), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.dial_request = Some(Arc::new(build));
        self
    }

    /// Builder for the accept-side registration request. Mandatory when
    /// accepting.
    pub fn accept_request(
        mut self,
        build: impl Fn(&[u8; KEY_LEN]) -> Result<(Request<Bytes>, ResponseHandler), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.accept_request = Some(Arc::new(build));
        self
    }

    pub(crate) fn require_dial(&self) -> Result<DialRequestFn, Error> {
        self.dial_request
            .clone()
            .ok_or(Error::Config("dial request builder is required to dial"))
    }

    pub(crate) fn require_accept(&self) -> Result<AcceptRequestFn, Error> {
        self.accept_request
            .clone()
            .ok_or(Error::Config("accept request builder is required to accept"))
    }

    pub(crate) fn p2p_transport_or_default(&self) -> Arc<TransportConfig> {
        self.p2p_transport
            .clone()
            .unwrap_or_else(|| Arc::new(standard_transport_config()))
    }
}

/// Endpoint configuration every plane runs with: 12-byte CIDs issued by
/// the keyed generator.
///
/// Clones of `generator` share its counter, so the endpoint continues the
/// generator's sequence rather than restarting it.
pub fn standard_endpoint_config(generator: KeyedCidGenerator) -> EndpointConfig {
    let mut config = EndpointConfig::default();
    config.cid_generator(move || Box::new(generator.clone()));
    config
}

/// Transport defaults for both planes: path-MTU discovery off.
pub fn standard_transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.mtu_discovery_config(None);
    config
}
