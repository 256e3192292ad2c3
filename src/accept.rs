// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Accepting peer: registration first, then the out-of-band Initial.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, Endpoint, ServerConfig, TokioRuntime, UdpPoller};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::cid::KeyedCidGenerator;
use crate::config::{standard_endpoint_config, Config};
use crate::error::{Error, RendezvousError};
use crate::relay;
use crate::shared;
use crate::P2pConnection;

/// Accepts an end-to-end connection whose Initial datagram arrived out of
/// band.
///
/// The accepting peer first registers its namespace key with the
/// rendezvous through the HTTP/3 request built by
/// [`Config::accept_request`], so the rendezvous can steer the dialer's
/// datagrams here. The dialer's Initial, received out of band over the
/// application's signalling channel, is then injected into the QUIC
/// engine as if it had been read from the socket, attributed to the
/// rendezvous address, and the handshake completes over plain UDP.
pub async fn accept(
    socket: UdpSocket,
    initial: Bytes,
    config: Config,
) -> Result<P2pConnection, Error> {
    let build = config.require_accept()?;
    let crypto = config
        .p2p_server_crypto
        .clone()
        .ok_or(Error::Config("p2p server TLS configuration is required to accept"))?;

    let generator = KeyedCidGenerator::new(None, false);
    let key = *generator.key();

    let (control_plane, data_plane) = shared::split(socket);

    let (request, handler) =
        build(&key).map_err(|e| Error::from(RendezvousError::Builder(e)))?;
    let rendezvous_addr = relay::resolve(request.uri()).await.map_err(Error::from)?;
    relay::call(control_plane, &config.relay, request, handler)
        .await
        .map_err(Error::from)?;
    debug!(%rendezvous_addr, "registered with rendezvous");

    let oob = Arc::new(OobSocket::new(data_plane, initial, rendezvous_addr));

    let mut server_config = ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
    server_config.transport = config.p2p_transport_or_default();

    let endpoint = Endpoint::new_with_abstract_socket(
        standard_endpoint_config(generator),
        Some(server_config),
        oob,
        Arc::new(TokioRuntime),
    )?;

    let incoming = endpoint.accept().await.ok_or(Error::EndpointClosed)?;
    let connection = incoming.await?;
    debug!(peer = %connection.remote_address(), "end-to-end connection accepted");
    Ok(P2pConnection {
        endpoint,
        connection,
    })
}

/// Packet source that delivers one out-of-band datagram ahead of any
/// socket traffic.
///
/// The injected datagram is attributed to the rendezvous address: that is
/// where the engine's replies must go until the peer's direct address is
/// learned from the wire.
pub(crate) struct OobSocket<S> {
    inner: Arc<S>,
    oob: Mutex<Option<Bytes>>,
    remote: SocketAddr,
}

impl<S: AsyncUdpSocket> OobSocket<S> {
    pub(crate) fn new(inner: Arc<S>, datagram: Bytes, remote: SocketAddr) -> Self {
        Self {
            inner,
            oob: Mutex::new(Some(datagram)),
            remote,
        }
    }
}

impl<S: AsyncUdpSocket> AsyncUdpSocket for OobSocket<S> {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        if bufs.is_empty() || meta.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Some(datagram) = self.oob.lock().unwrap().take() {
            let len = datagram.len().min(bufs[0].len());
            bufs[0][..len].copy_from_slice(&datagram[..len]);
            meta[0] = RecvMeta {
                len,
                stride: len,
                addr: self.remote,
                ecn: None,
                dst_ip: None,
            };
            return Poll::Ready(Ok(1));
        }
        self.inner.poll_recv(cx, bufs, meta)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}

impl<S: fmt::Debug> fmt::Debug for OobSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OobSocket")
            .field("inner", &self.inner)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use super::*;

    /// Inner socket with one canned datagram and a fixed remote.
    #[derive(Debug)]
    struct QueueSocket {
        queued: Mutex<Option<(Vec<u8>, SocketAddr)>>,
    }

    impl AsyncUdpSocket for QueueSocket {
        fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
            Box::pin(quinn::UdpPollHelper::new(|| async { Ok(()) }))
        }

        fn try_send(&self, _transmit: &Transmit) -> io::Result<()> {
            Ok(())
        }

        fn poll_recv(
            &self,
            _cx: &mut Context,
            bufs: &mut [IoSliceMut<'_>],
            meta: &mut [RecvMeta],
        ) -> Poll<io::Result<usize>> {
            match self.queued.lock().unwrap().take() {
                Some((datagram, addr)) => {
                    bufs[0][..datagram.len()].copy_from_slice(&datagram);
                    meta[0] = RecvMeta {
                        len: datagram.len(),
                        stride: datagram.len(),
                        addr,
                        ecn: None,
                        dst_ip: None,
                    };
                    Poll::Ready(Ok(1))
                }
                None => Poll::Pending,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
        }
    }

    async fn recv_one<S: AsyncUdpSocket>(socket: &OobSocket<S>) -> io::Result<(Vec<u8>, SocketAddr)> {
        poll_fn(|cx| {
            let mut storage = [0u8; 1500];
            let mut bufs = [IoSliceMut::new(&mut storage)];
            let mut meta = [RecvMeta::default()];
            match socket.poll_recv(cx, &mut bufs, &mut meta) {
                Poll::Ready(Ok(_)) => {
                    let len = meta[0].len;
                    let addr = meta[0].addr;
                    drop(bufs);
                    Poll::Ready(Ok((storage[..len].to_vec(), addr)))
                }
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    #[tokio::test]
    async fn oob_datagram_precedes_socket_traffic() {
        let peer: SocketAddr = "198.51.100.7:1234".parse().unwrap();
        let rendezvous: SocketAddr = "192.0.2.1:443".parse().unwrap();
        let inner = Arc::new(QueueSocket {
            queued: Mutex::new(Some((b"from-socket".to_vec(), peer))),
        });
        let oob = OobSocket::new(inner, Bytes::from_static(b"initial"), rendezvous);

        let (datagram, addr) = recv_one(&oob).await.unwrap();
        assert_eq!(datagram, b"initial");
        assert_eq!(addr, rendezvous);

        let (datagram, addr) = recv_one(&oob).await.unwrap();
        assert_eq!(datagram, b"from-socket");
        assert_eq!(addr, peer);
    }

    #[tokio::test]
    async fn read_cancellation_is_prompt_once_drained() {
        let rendezvous: SocketAddr = "192.0.2.1:443".parse().unwrap();
        let inner = Arc::new(QueueSocket {
            queued: Mutex::new(None),
        });
        let oob = OobSocket::new(inner, Bytes::from_static(b"initial"), rendezvous);
        let _ = recv_one(&oob).await.unwrap();

        let deadline = Duration::from_millis(50);
        let start = std::time::Instant::now();
        let timed_out = tokio::time::timeout(deadline, recv_one(&oob)).await;
        assert!(timed_out.is_err());
        assert!(start.elapsed() < deadline + Duration::from_millis(100));
    }
}
