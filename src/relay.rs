// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! HTTP/3 round trip to the rendezvous.
//!
//! Both peers talk to the rendezvous through the control plane of their
//! shared socket, so the rendezvous observes the same source address the
//! peer's data plane will use. The round trip is one request: connect,
//! send, collect the response, hand it to the caller's handler, tear the
//! transport down.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Request, Response, Uri};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{AsyncUdpSocket, ClientConfig, Endpoint, TokioRuntime};
use tracing::debug;

use crate::cid::KeyedCidGenerator;
use crate::config::{standard_endpoint_config, standard_transport_config, RelayOptions, ResponseHandler};
use crate::error::RendezvousError;

/// Resolves the UDP address implied by a rendezvous request URI.
pub(crate) async fn resolve(uri: &Uri) -> Result<SocketAddr, RendezvousError> {
    let host = uri.host().ok_or(RendezvousError::NoAuthority)?;
    let port = uri.port_u16().unwrap_or(443);
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or(RendezvousError::Unresolvable)
}

/// Executes `request` over HTTP/3 through `socket` and runs `handler` on
/// the response.
pub(crate) async fn call(
    socket: Arc<dyn AsyncUdpSocket>,
    options: &RelayOptions,
    request: Request<Bytes>,
    handler: ResponseHandler,
) -> Result<(), RendezvousError> {
    let response = round_trip(socket, options, request).await?;
    handler(response).map_err(RendezvousError::Handler)
}

async fn round_trip(
    socket: Arc<dyn AsyncUdpSocket>,
    options: &RelayOptions,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, RendezvousError> {
    let addr = resolve(request.uri()).await?;
    let host = request
        .uri()
        .host()
        .ok_or(RendezvousError::NoAuthority)?
        .to_string();

    let mut tls = base_tls_config();
    if let Some(mutator) = &options.tls_mutator {
        mutator(&mut tls);
    }

    let endpoint = Endpoint::new_with_abstract_socket(
        standard_endpoint_config(KeyedCidGenerator::new(None, true)),
        None,
        socket,
        Arc::new(TokioRuntime),
    )?;
    let mut client_config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls)?));
    client_config.transport_config(
        options
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(standard_transport_config())),
    );

    let connection = endpoint.connect_with(client_config, addr, &host)?.await?;
    debug!(%addr, "rendezvous transport established");

    let result = exchange(connection.clone(), request).await;

    connection.close(0u32.into(), b"");
    endpoint.wait_idle().await;
    result
}

async fn exchange(
    connection: quinn::Connection,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, RendezvousError> {
    let (mut driver, mut send_request) =
        h3::client::new(h3_quinn::Connection::new(connection)).await?;

    let mut closed = std::pin::pin!(async move { poll_fn(|cx| driver.poll_close(cx)).await });
    let mut exchange = std::pin::pin!(async move {
        let (parts, body) = request.into_parts();
        let mut stream = send_request.send_request(Request::from_parts(parts, ())).await?;
        if !body.is_empty() {
            stream.send_data(body).await?;
        }
        stream.finish().await?;
        let response = stream.recv_response().await?;
        let mut collected = BytesMut::new();
        while let Some(chunk) = stream.recv_data().await? {
            collected.put(chunk);
        }
        Ok::<_, RendezvousError>(response.map(|_| collected.freeze()))
    });

    tokio::select! {
        response = &mut exchange => response,
        closed = &mut closed => {
            closed?;
            Err(RendezvousError::TransportClosed)
        }
    }
}

fn base_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h3".to_vec()];
    config
}
