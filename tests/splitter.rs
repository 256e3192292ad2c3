//! Integration tests for the rendezvous datapath splitter.
//!
//! These drive the splitter's packet-source contract directly over
//! loopback UDP sockets with hand-built datagrams, verifying the demux
//! rules: control-plane and unparseable datagrams surface to the HTTP/3
//! stack, registered data-plane datagrams are forwarded verbatim, and
//! unregistered ones vanish.

use std::future::poll_fn;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use quinn::udp::RecvMeta;
use quinn::AsyncUdpSocket;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use quicsteer::{
    Association, AssociationStore, KeyedCidGenerator, MapStore, SplitterSocket, StoreError,
    XdpError, CID_LEN, KEY_LEN,
};

fn long_header(dst_cid: &[u8], src_cid: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0xc0];
    pkt.extend_from_slice(&1u32.to_be_bytes());
    pkt.push(dst_cid.len() as u8);
    pkt.extend_from_slice(dst_cid);
    pkt.push(src_cid.len() as u8);
    pkt.extend_from_slice(src_cid);
    pkt.push(0x00); // token length
    pkt.push(24); // payload length
    pkt.extend_from_slice(&[0xaa; 24]);
    pkt
}

fn short_header(dst_cid: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x40];
    pkt.extend_from_slice(dst_cid);
    pkt.extend_from_slice(&[0xaa; 20]);
    pkt
}

async fn splitter_with_store(
    store: Arc<dyn AssociationStore>,
) -> (Arc<SplitterSocket>, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Arc::new(SplitterSocket::new(socket, store)), addr)
}

/// Polls one upward datagram out of the splitter.
async fn recv_upward(splitter: &SplitterSocket) -> io::Result<(Vec<u8>, SocketAddr)> {
    poll_fn(|cx| {
        let mut storage = [0u8; 1500];
        let mut bufs = [IoSliceMut::new(&mut storage)];
        let mut meta = [RecvMeta::default()];
        match splitter.poll_recv(cx, &mut bufs, &mut meta) {
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
async fn control_plane_long_header_surfaces_unchanged() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut src_cid = [0x01; CID_LEN];
    src_cid[0] = 0x81;
    let pkt = long_header(&[0x33; 8], &src_cid);
    sender.send_to(&pkt, addr).await.unwrap();

    let (received, from) = recv_upward(&splitter).await.unwrap();
    assert_eq!(received, pkt);
    assert_eq!(from, sender.local_addr().unwrap());
}

#[tokio::test]
async fn control_plane_short_header_surfaces_unchanged() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let pkt = short_header(&[0xff; CID_LEN]);
    sender.send_to(&pkt, addr).await.unwrap();

    let (received, _) = recv_upward(&splitter).await.unwrap();
    assert_eq!(received, pkt);
}

#[tokio::test]
async fn unparseable_datagram_surfaces_unchanged() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let pkt = [0x0f, 1, 2, 3, 4, 5, 6];
    sender.send_to(&pkt, addr).await.unwrap();

    let (received, _) = recv_upward(&splitter).await.unwrap();
    assert_eq!(received, pkt);
}

#[tokio::test]
async fn registered_datagrams_are_forwarded_not_surfaced() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let key = [0x42; KEY_LEN];
    splitter
        .register(key, 3, peer.local_addr().unwrap())
        .unwrap();

    // Second CID of the namespace, exactly as the registering peer's own
    // generator would issue it.
    let cids = KeyedCidGenerator::derive_data_plane(key, 3);
    let pkt = short_header(cids[1].as_ref());
    sender.send_to(&pkt, addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], pkt.as_slice());
    // The forward goes out the rendezvous socket itself.
    assert_eq!(from, addr);

    // Nothing surfaced to the control plane.
    let upward = timeout(Duration::from_millis(100), recv_upward(&splitter)).await;
    assert!(upward.is_err());
}

#[tokio::test]
async fn long_header_data_plane_routes_by_destination_cid() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let key = [0x17; KEY_LEN];
    splitter
        .register(key, 1, peer.local_addr().unwrap())
        .unwrap();
    let cids = KeyedCidGenerator::derive_data_plane(key, 1);

    // A handshake reply: data-plane source CID, destination CID of the
    // registered namespace.
    let src_cid = [0x07; CID_LEN];
    let pkt = long_header(cids[0].as_ref(), &src_cid);
    sender.send_to(&pkt, addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], pkt.as_slice());
}

#[tokio::test]
async fn unregistered_data_plane_datagram_is_dropped() {
    let (splitter, addr) = splitter_with_store(Arc::new(MapStore::new())).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sender
        .send_to(&short_header(&[0x29; CID_LEN]), addr)
        .await
        .unwrap();
    // Follow with a control-plane marker; if the drop leaked upward, the
    // marker would not be the first datagram surfaced.
    let marker = short_header(&[0x81; CID_LEN]);
    sender.send_to(&marker, addr).await.unwrap();

    let (received, _) = recv_upward(&splitter).await.unwrap();
    assert_eq!(received, marker);
}

struct FailingStore;

impl AssociationStore for FailingStore {
    fn put(&self, _association: Association) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, _cid: &[u8]) -> Result<Association, StoreError> {
        Err(StoreError::Xdp(XdpError::new("backend lost")))
    }
}

#[tokio::test]
async fn store_failure_surfaces_as_read_error() {
    let (splitter, addr) = splitter_with_store(Arc::new(FailingStore)).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sender
        .send_to(&short_header(&[0x2a; CID_LEN]), addr)
        .await
        .unwrap();

    let err = recv_upward(&splitter).await.unwrap_err();
    assert!(err.to_string().contains("backend lost"));
}
