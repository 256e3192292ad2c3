// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Dialing peer: the first datagram rides the rendezvous.

use std::io;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, TokioRuntime};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cid::KeyedCidGenerator;
use crate::config::{standard_endpoint_config, Config};
use crate::error::{Error, RendezvousError};
use crate::gate::{GatedSocket, RendezvousLaunch};
use crate::relay;
use crate::shared;
use crate::P2pConnection;

/// Establishes an end-to-end connection to the peer reachable through the
/// rendezvous named by the dial request builder.
///
/// The QUIC engine handshakes over `socket`; its first emitted datagram is
/// the Initial packet, which is intercepted and carried to the rendezvous
/// inside the HTTP/3 request built by [`Config::dial_request`], together
/// with this endpoint's namespace key. The rendezvous thereby learns this
/// peer's CIDs and source address before it starts steering, and every
/// later datagram travels over plain UDP. `server_name` is the TLS name
/// the remote peer presents on the end-to-end connection.
pub async fn dial(
    socket: UdpSocket,
    server_name: &str,
    config: Config,
) -> Result<P2pConnection, Error> {
    let build = config.require_dial()?;
    let crypto = config
        .p2p_client_crypto
        .clone()
        .ok_or(Error::Config("p2p client TLS configuration is required to dial"))?;

    // Preflight solely to learn where the rendezvous lives; the returned
    // request is discarded.
    let (preflight, _) = build(None, None).map_err(|e| Error::from(RendezvousError::Builder(e)))?;
    let rendezvous_addr = relay::resolve(preflight.uri()).await.map_err(Error::from)?;

    let (control_plane, data_plane) = shared::split(socket);

    let generator = KeyedCidGenerator::new(None, false);
    let key = *generator.key();

    let (fail_tx, fail_rx) = oneshot::channel();
    let relay_options = config.relay.clone();
    let launch: RendezvousLaunch = Box::new(move |packet| {
        Box::pin(async move {
            let result = async {
                let (request, handler) = build(Some(&packet), Some(&key))
                    .map_err(RendezvousError::Builder)?;
                relay::call(control_plane, &relay_options, request, handler).await
            }
            .await;
            match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    let message = err.to_string();
                    let _ = fail_tx.send(err);
                    Err(io::Error::new(io::ErrorKind::Other, message))
                }
            }
        })
    });

    let gated = Arc::new(GatedSocket::new(data_plane, launch));
    let endpoint = Endpoint::new_with_abstract_socket(
        standard_endpoint_config(generator),
        None,
        gated,
        Arc::new(TokioRuntime),
    )?;

    let mut client_config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
    client_config.transport_config(config.p2p_transport_or_default());

    let connecting = endpoint.connect_with(client_config, rendezvous_addr, server_name)?;
    tokio::pin!(connecting);
    let mut fail_rx = fail_rx;
    let connection = tokio::select! {
        connection = &mut connecting => connection?,
        failure = &mut fail_rx => match failure {
            Ok(err) => return Err(Error::Rendezvous(err)),
            // Dropped without a failure: the rendezvous succeeded.
            Err(_) => (&mut connecting).await?,
        },
    };

    debug!(peer = %connection.remote_address(), "end-to-end connection established");
    Ok(P2pConnection {
        endpoint,
        connection,
    })
}
