// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! First-send election for the dialing peer.
//!
//! The first datagram a dialing QUIC engine emits is the Initial packet
//! carrying its chosen destination CID. [`GatedSocket`] intercepts exactly
//! one send (an atomic counter elects the winner under any interleaving)
//! and trades it for a rendezvous round trip instead of putting it on the
//! wire. Until the round trip resolves, the socket reports itself
//! unwritable and queued sends would-block, so no later datagram can
//! overtake the registration. Failure poisons the gate; success opens it
//! and every subsequent send delegates to the wrapped socket.

use std::fmt;
use std::future::Future;
use std::io::{self, IoSliceMut};
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tracing::{trace, warn};

/// Runs the rendezvous round trip for the captured Initial datagram.
pub(crate) type RendezvousLaunch = Box<
    dyn FnOnce(Bytes) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> + Send + Sync,
>;

enum GateState {
    /// No send has won the election yet.
    Idle,
    /// The round trip is running; sends block.
    InFlight { wakers: Vec<Waker> },
    /// The round trip succeeded; sends delegate.
    Open,
    /// The round trip failed; sends report it.
    Poisoned(String),
}

struct GateShared {
    state: Mutex<GateState>,
}

impl GateShared {
    fn resolve(&self, result: io::Result<()>) {
        let mut state = self.state.lock().unwrap();
        let wakers = match &mut *state {
            GateState::InFlight { wakers } => mem::take(wakers),
            _ => Vec::new(),
        };
        *state = match result {
            Ok(()) => {
                trace!("rendezvous complete, gate open");
                GateState::Open
            }
            Err(err) => {
                warn!(%err, "rendezvous failed, poisoning gate");
                GateState::Poisoned(err.to_string())
            }
        };
        drop(state);
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Packet source for a dialing endpoint whose first send is tunneled to
/// the rendezvous.
pub(crate) struct GatedSocket<S> {
    inner: Arc<S>,
    shared: Arc<GateShared>,
    tx_count: AtomicU32,
    launch: Mutex<Option<RendezvousLaunch>>,
}

impl<S: AsyncUdpSocket> GatedSocket<S> {
    pub(crate) fn new(inner: Arc<S>, launch: RendezvousLaunch) -> Self {
        Self {
            inner,
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState::Idle),
            }),
            tx_count: AtomicU32::new(0),
            launch: Mutex::new(Some(launch)),
        }
    }

    fn send_initial(&self, transmit: &Transmit) -> io::Result<()> {
        let launch = self
            .launch
            .lock()
            .unwrap()
            .take()
            .expect("the counter admits exactly one first send");
        *self.shared.state.lock().unwrap() = GateState::InFlight { wakers: Vec::new() };
        let packet = Bytes::copy_from_slice(transmit.contents);
        trace!(len = packet.len(), "first datagram captured for rendezvous");
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = launch(packet).await;
            shared.resolve(result);
        });
        // The datagram is reported sent; it travels inside the rendezvous
        // request, and the engine retransmits if no reply arrives.
        Ok(())
    }
}

impl<S: AsyncUdpSocket> AsyncUdpSocket for GatedSocket<S> {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(GatedPoller {
            shared: self.shared.clone(),
            inner: self.inner.clone().create_io_poller(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let tx = self.tx_count.fetch_add(1, Ordering::Relaxed) + 1;
        if tx == 1 {
            return self.send_initial(transmit);
        }
        match &*self.shared.state.lock().unwrap() {
            GateState::Open => self.inner.try_send(transmit),
            GateState::Idle | GateState::InFlight { .. } => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            GateState::Poisoned(reason) => {
                Err(io::Error::new(io::ErrorKind::Other, reason.clone()))
            }
        }
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        self.inner.poll_recv(cx, bufs, meta)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}

impl<S: fmt::Debug> fmt::Debug for GatedSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedSocket")
            .field("inner", &self.inner)
            .field("tx_count", &self.tx_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct GatedPoller {
    shared: Arc<GateShared>,
    inner: Pin<Box<dyn UdpPoller>>,
}

impl UdpPoller for GatedPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        match &mut *state {
            GateState::Idle | GateState::Open => {
                drop(state);
                this.inner.as_mut().poll_writable(cx)
            }
            GateState::InFlight { wakers } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
            GateState::Poisoned(reason) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                reason.clone(),
            ))),
        }
    }
}

impl fmt::Debug for GatedPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedPoller").finish_non_exhaustive()
    }
}
