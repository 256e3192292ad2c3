// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Rendezvous datapath: HTTP/3 control plane and raw forwarder on one
//! socket.
//!
//! The rendezvous serves its registration API and steers peer-to-peer
//! datagrams from the same UDP port, so peers registering and peers
//! exchanging data observe a single origin. [`SplitterSocket`] makes that
//! work by sitting between the socket and the HTTP/3-serving endpoint:
//! each inbound datagram is classified by the plane bit of its steering
//! CID and either surfaces to the endpoint, gets forwarded to a registered
//! peer, or is dropped.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPollHelper, UdpPoller};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::cid::{self, KeyedCidGenerator, KEY_LEN};
use crate::packet;
use crate::store::{Association, AssociationStore, StoreError};

/// Outcome of classifying one inbound datagram.
enum Verdict {
    /// Surface to the HTTP/3 endpoint reading from this socket.
    Deliver,
    /// Forwarded or dropped; keep reading.
    Consumed,
}

/// Packet source the rendezvous HTTP/3 endpoint reads from.
///
/// Hand an `Arc` of this to [`quinn::Endpoint::new_with_abstract_socket`]
/// and serve HTTP/3 on that endpoint; keep a clone to call
/// [`register`](Self::register) from the registration handler. Datagrams
/// that do not parse as QUIC also surface to the endpoint, which knows
/// best what a non-QUIC datagram means.
pub struct SplitterSocket {
    socket: UdpSocket,
    store: Arc<dyn AssociationStore>,
}

impl SplitterSocket {
    /// Wraps `socket` so the HTTP/3 server reads only its own traffic.
    pub fn new(socket: UdpSocket, store: Arc<dyn AssociationStore>) -> Self {
        Self { socket, store }
    }

    /// Wraps a blocking socket, switching it to non-blocking mode.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_std(
        socket: std::net::UdpSocket,
        store: Arc<dyn AssociationStore>,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self::new(UdpSocket::from_std(socket)?, store))
    }

    /// Registers a peer: derives `num` data-plane CIDs from `key` and
    /// routes them to `addr`.
    ///
    /// Call this from the registration handler with the registering
    /// peer's transport address.
    pub fn register(
        &self,
        key: [u8; KEY_LEN],
        num: usize,
        addr: SocketAddr,
    ) -> Result<(), StoreError> {
        let cids = KeyedCidGenerator::derive_data_plane(key, num);
        debug!(num, %addr, "registering peer namespace");
        self.store.put(Association { cids, addr })
    }

    fn steer(&self, datagram: &[u8], from: SocketAddr) -> io::Result<Verdict> {
        let header = match packet::decode(datagram) {
            Ok(header) => header,
            Err(err) => {
                trace!(%from, %err, "yielding unparseable datagram");
                return Ok(Verdict::Deliver);
            }
        };
        if cid::is_control_plane(header.plane_cid()) {
            trace!(%from, "control-plane datagram");
            return Ok(Verdict::Deliver);
        }
        match self.store.get(header.dst_cid()) {
            Ok(association) => {
                match self.socket.try_send_to(datagram, association.addr) {
                    Ok(_) => trace!(%from, to = %association.addr, len = datagram.len(), "forwarded"),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // Datagram delivery is best effort; the peer
                        // retransmits.
                        warn!(to = %association.addr, "send buffer full, dropping forwarded datagram");
                    }
                    Err(err) => return Err(err),
                }
                Ok(Verdict::Consumed)
            }
            Err(StoreError::NotFound) => {
                trace!(%from, "no association for destination CID, dropping");
                Ok(Verdict::Consumed)
            }
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }
}

impl AsyncUdpSocket for SplitterSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(UdpPollHelper::new(move || {
            let socket = self.clone();
            async move { socket.socket.writable().await }
        }))
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.socket
            .try_send_to(transmit.contents, transmit.destination)
            .map(|_| ())
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
        let mut buf = ReadBuf::new(&mut bufs[0]);
        loop {
            buf.clear();
            let addr = match self.socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(addr)) => addr,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            };
            match self.steer(buf.filled(), addr) {
                Ok(Verdict::Deliver) => {
                    let len = buf.filled().len();
                    meta[0] = RecvMeta {
                        len,
                        stride: len,
                        addr,
                        ecn: None,
                        dst_ip: None,
                    };
                    return Poll::Ready(Ok(1));
                }
                Ok(Verdict::Consumed) => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl fmt::Debug for SplitterSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitterSocket")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}
