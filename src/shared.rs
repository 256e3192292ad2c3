// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Peer-side plane demultiplexer.
//!
//! A peer runs two QUIC connections on one UDP socket: the HTTP/3 call to
//! the rendezvous (control-plane CIDs) and the end-to-end connection
//! (data-plane CIDs). Each needs its own endpoint, and an endpoint owns
//! its packet source, so the socket is split: a pump task reads it and
//! routes every datagram into one of two virtual sockets by the plane bit
//! of its destination CID, which on the receiving side is always locally
//! issued, whatever the header form. Sends from either plane go straight
//! to the socket.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPollHelper, UdpPoller};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::cid;
use crate::packet;

type Datagram = (Bytes, SocketAddr);

/// Aborts the pump when the last plane is dropped.
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One plane of a shared socket; a packet source for exactly one endpoint.
pub(crate) struct PlaneSocket {
    socket: Arc<UdpSocket>,
    rx: Mutex<UnboundedReceiver<Datagram>>,
    _pump: Arc<PumpGuard>,
}

/// Splits `socket` into (control-plane, data-plane) packet sources.
///
/// Must be called within a tokio runtime; the pump task stops once both
/// planes are dropped.
pub(crate) fn split(socket: UdpSocket) -> (Arc<PlaneSocket>, Arc<PlaneSocket>) {
    let socket = Arc::new(socket);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let pump = Arc::new(PumpGuard(tokio::spawn(pump(
        socket.clone(),
        control_tx,
        data_tx,
    ))));
    let control = Arc::new(PlaneSocket {
        socket: socket.clone(),
        rx: Mutex::new(control_rx),
        _pump: pump.clone(),
    });
    let data = Arc::new(PlaneSocket {
        socket,
        rx: Mutex::new(data_rx),
        _pump: pump,
    });
    (control, data)
}

async fn pump(
    socket: Arc<UdpSocket>,
    control: UnboundedSender<Datagram>,
    data: UnboundedSender<Datagram>,
) {
    let mut buf = vec![0; u16::MAX as usize];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                warn!(%err, "shared socket receive failed, stopping pump");
                return;
            }
        };
        let datagram = &buf[..len];
        let control_plane = match packet::decode(datagram) {
            Ok(header) => cid::is_control_plane(header.dst_cid()),
            Err(err) => {
                trace!(%addr, %err, "dropping unparseable datagram");
                continue;
            }
        };
        let tx = if control_plane { &control } else { &data };
        if tx.send((Bytes::copy_from_slice(datagram), addr)).is_err()
            && control.is_closed()
            && data.is_closed()
        {
            return;
        }
    }
}

impl AsyncUdpSocket for PlaneSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(UdpPollHelper::new(move || {
            let socket = self.socket.clone();
            async move { socket.writable().await }
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
        let mut rx = self.rx.lock().unwrap();
        match rx.poll_recv(cx) {
            Poll::Ready(Some((datagram, addr))) => {
                let len = datagram.len().min(bufs[0].len());
                bufs[0][..len].copy_from_slice(&datagram[..len]);
                meta[0] = RecvMeta {
                    len,
                    stride: len,
                    addr,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "shared socket pump stopped",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl fmt::Debug for PlaneSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneSocket")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}
