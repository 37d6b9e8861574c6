//! Bulk reliable multicast primitive: per-sender transfer groups over
//! persistent member-to-member links.
//!
//! Each shard sender owns one transfer group whose member list is rotated so
//! the sender sits at the root. Receivers register a destination-select
//! callback that claims an incoming buffer, and a completion callback run
//! once the transfer's bytes have fully arrived. The root's own completion
//! fires through a local loopback, after the frame has been handed to every
//! link. All completions for one hub run on a single delivery task, so
//! callbacks never race each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::multicast::NodeId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, ShardcastError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifier of one transfer group; unique within a hub.
pub(crate) type BulkGroupId = u16;

/// Claims a receive destination for an incoming transfer of the given size.
/// Returning false means no buffer could be supplied and the transfer is
/// dropped.
pub(crate) type DestinationSelect = Box<dyn FnMut(usize) -> bool + Send>;

/// Runs when a transfer's bytes have fully arrived (or, at the root, when
/// the send has been handed to every link).
pub(crate) type CompletionUpcall = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BulkFrame {
    group: BulkGroupId,
    bytes: Vec<u8>,
}

struct BulkGroupState {
    /// Rotated member list; the sender/root is first.
    members: Vec<NodeId>,
    dest_select: DestinationSelect,
    completion: CompletionUpcall,
}

/// Transfer-group hub for one view.
pub(crate) struct BulkHub {
    me: NodeId,

    tx_links: flashmap::ReadHandle<NodeId, mpsc::UnboundedSender<BulkFrame>>,
    tx_deliver: mpsc::UnboundedSender<(NodeId, BulkFrame)>,

    groups: Arc<Mutex<HashMap<BulkGroupId, BulkGroupState>>>,

    /// Kept alive so the acceptor's connect channel never closes under it.
    _tx_connect: mpsc::UnboundedSender<(NodeId, SocketAddr)>,

    _acceptor_handle: JoinHandle<()>,
    _deliver_handle: JoinHandle<()>,
    link_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BulkHub {
    /// Creates the hub for one view: binds this member's bulk port, links up
    /// with every other member, and spawns the delivery task.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        members: &[NodeId],
        addrs: &[SocketAddr],
        vid: i32,
    ) -> Result<Arc<Self>, ShardcastError> {
        let my_pos = members.iter().position(|&m| m == me);
        let Some(my_pos) = my_pos else {
            return logged_err!("node {} not in bulk member list", me);
        };

        let (tx_links_write, tx_links_read) =
            flashmap::new::<NodeId, mpsc::UnboundedSender<BulkFrame>>();
        let (tx_deliver, rx_deliver) = mpsc::unbounded_channel();
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();
        let (tx_handle, mut rx_handle) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, mut rx_connack) = mpsc::unbounded_channel();

        let groups: Arc<Mutex<HashMap<BulkGroupId, BulkGroupState>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let listener = tcp_bind_with_retry(addrs[my_pos], 10).await?;
        let mut acceptor = BulkAcceptorTask {
            me,
            vid,
            listener,
            tx_links: tx_links_write,
            tx_deliver: tx_deliver.clone(),
            tx_exit,
            rx_exit,
            rx_connect,
            tx_connack,
            tx_handle,
        };
        let acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        let groups_ref = groups.clone();
        let deliver_handle = tokio::spawn(async move {
            Self::deliver_loop(me, rx_deliver, groups_ref).await;
        });

        let hub = Arc::new(BulkHub {
            me,
            tx_links: tx_links_read,
            tx_deliver,
            groups,
            _tx_connect: tx_connect.clone(),
            _acceptor_handle: acceptor_handle,
            _deliver_handle: deliver_handle,
            link_handles: Mutex::new(Vec::new()),
        });

        // proactively link up with every member listed before me
        for pos in 0..my_pos {
            tx_connect
                .send((members[pos], addrs[pos]))
                .map_err(ShardcastError::msg)?;
            match rx_connack.recv().await {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(e),
                None => return logged_err!("bulk connack channel closed"),
            }
        }

        // wait for the rest to link up with me
        while hub.tx_links.guard().len() + 1 < members.len() {
            while let Ok(handle) = rx_handle.try_recv() {
                hub.link_handles.lock().unwrap().push(handle);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        while let Ok(handle) = rx_handle.try_recv() {
            hub.link_handles.lock().unwrap().push(handle);
        }

        Ok(hub)
    }

    /// Registers a transfer group. Returns false if the id is taken.
    pub(crate) fn create_group(
        &self,
        group: BulkGroupId,
        members: Vec<NodeId>,
        dest_select: DestinationSelect,
        completion: CompletionUpcall,
    ) -> bool {
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(&group) {
            return false;
        }
        groups.insert(
            group,
            BulkGroupState {
                members,
                dest_select,
                completion,
            },
        );
        true
    }

    /// Removes a transfer group. Idempotent.
    pub(crate) fn destroy_group(&self, group: BulkGroupId) {
        self.groups.lock().unwrap().remove(&group);
    }

    /// Sends a transfer as the root of the given group. The frame is handed
    /// to every member link, then the root's own completion is scheduled
    /// through the loopback. Fails if the group is unknown, this node is not
    /// its root, or any member link has broken.
    pub(crate) fn send(
        &self,
        group: BulkGroupId,
        bytes: &[u8],
    ) -> Result<(), ShardcastError> {
        let members = {
            let groups = self.groups.lock().unwrap();
            let Some(state) = groups.get(&group) else {
                return logged_err!("bulk send in unknown group {}", group);
            };
            if state.members.first() != Some(&self.me) {
                return logged_err!(
                    "bulk send in group {} from non-root {}",
                    group,
                    self.me
                );
            }
            state.members.clone()
        };

        let frame = BulkFrame {
            group,
            bytes: bytes.to_vec(),
        };
        {
            let guard = self.tx_links.guard();
            for &member in &members {
                if member == self.me {
                    continue;
                }
                match guard.get(&member) {
                    Some(tx) => {
                        if tx.send(frame.clone()).is_err() {
                            return Err(ShardcastError::msg(format!(
                                "bulk link to {} closed",
                                member
                            )));
                        }
                    }
                    None => {
                        return Err(ShardcastError::msg(format!(
                            "bulk link to {} broken",
                            member
                        )));
                    }
                }
            }
        }

        // self-receive: completion fires on the delivery task
        self.tx_deliver
            .send((self.me, frame))
            .map_err(ShardcastError::msg)?;
        Ok(())
    }

    /// Tears down all hub tasks.
    pub(crate) fn stop(&self) {
        self._acceptor_handle.abort();
        self._deliver_handle.abort();
        for handle in self.link_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.groups.lock().unwrap().clear();
    }

    async fn deliver_loop(
        me: NodeId,
        mut rx_deliver: mpsc::UnboundedReceiver<(NodeId, BulkFrame)>,
        groups: Arc<Mutex<HashMap<BulkGroupId, BulkGroupState>>>,
    ) {
        pf_debug!("bulk delivery task spawned");
        while let Some((origin, frame)) = rx_deliver.recv().await {
            let mut groups = groups.lock().unwrap();
            let Some(state) = groups.get_mut(&frame.group) else {
                pf_warn!(
                    "dropping bulk frame for unknown group {}",
                    frame.group
                );
                continue;
            };

            if origin == me {
                // root self-receive: no destination selection
                (state.completion)(&frame.bytes);
            } else if (state.dest_select)(frame.bytes.len()) {
                (state.completion)(&frame.bytes);
            } else {
                pf_error!(
                    "no receive destination for bulk frame in group {}",
                    frame.group
                );
            }
        }
        pf_debug!("bulk delivery task exited");
    }
}

/// Acceptor task mirroring the SST exchange's: accepts links from members
/// listed after this node, connects proactively to those before it.
struct BulkAcceptorTask {
    me: NodeId,
    vid: i32,
    listener: TcpListener,
    tx_links: flashmap::WriteHandle<NodeId, mpsc::UnboundedSender<BulkFrame>>,
    tx_deliver: mpsc::UnboundedSender<(NodeId, BulkFrame)>,
    tx_exit: mpsc::UnboundedSender<NodeId>,
    rx_exit: mpsc::UnboundedReceiver<NodeId>,
    rx_connect: mpsc::UnboundedReceiver<(NodeId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<Result<(), ShardcastError>>,
    tx_handle: mpsc::UnboundedSender<JoinHandle<()>>,
}

impl BulkAcceptorTask {
    fn spawn_link(&mut self, peer: NodeId, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut guard = self.tx_links.guard();
        guard.insert(peer, tx_send);

        let mut link = BulkLinkTask::new(
            peer,
            stream,
            rx_send,
            self.tx_deliver.clone(),
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { link.run().await });
        let _ = self.tx_handle.send(handle);
    }

    async fn connect_link(
        &mut self,
        peer: NodeId,
        addr: SocketAddr,
    ) -> Result<(), ShardcastError> {
        let mut stream = tcp_connect_with_retry(addr, 25).await?;
        stream.write_u32(self.me).await?;
        stream.write_i32(self.vid).await?;
        let peer_vid = stream.read_i32().await?;
        if peer_vid != self.vid {
            return logged_err!(
                "bulk vid mismatch connecting to {}: {} != {}",
                peer,
                peer_vid,
                self.vid
            );
        }
        self.spawn_link(peer, stream);
        Ok(())
    }

    async fn accept_link(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), ShardcastError> {
        let peer = stream.read_u32().await?;
        let peer_vid = stream.read_i32().await?;
        if peer_vid != self.vid {
            return logged_err!(
                "bulk vid mismatch from {}: {} != {}",
                peer,
                peer_vid,
                self.vid
            );
        }
        stream.write_i32(self.vid).await?;
        self.spawn_link(peer, stream);
        Ok(())
    }

    async fn run(&mut self) {
        pf_debug!("bulk acceptor task spawned");
        loop {
            tokio::select! {
                to_connect = self.rx_connect.recv() => {
                    let Some((peer, addr)) = to_connect else { break; };
                    let ack = self.connect_link(peer, addr).await;
                    if self.tx_connack.send(ack).is_err() {
                        break;
                    }
                },

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_link(stream).await {
                                pf_error!("error accepting bulk link: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_warn!("error accepting bulk connection: {}", e);
                        }
                    }
                },

                peer = self.rx_exit.recv() => {
                    let Some(peer) = peer else { break; };
                    let mut guard = self.tx_links.guard();
                    guard.remove(peer);
                    pf_warn!("bulk link to {} broke", peer);
                },
            }
        }
    }
}

/// Per-link task: writes queued frames out, forwards incoming frames to the
/// delivery task.
struct BulkLinkTask {
    peer: NodeId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<BulkFrame>,
    tx_deliver: mpsc::UnboundedSender<(NodeId, BulkFrame)>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<NodeId>,
}

impl BulkLinkTask {
    fn new(
        peer: NodeId,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<BulkFrame>,
        tx_deliver: mpsc::UnboundedSender<(NodeId, BulkFrame)>,
        tx_exit: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        BulkLinkTask {
            peer,
            conn_read,
            conn_write,
            rx_send,
            tx_deliver,
            read_buf: BytesMut::with_capacity(8 + 4096),
            write_buf: BytesMut::with_capacity(8 + 4096),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    async fn run(&mut self) {
        pf_debug!("bulk link task for {} spawned", self.peer);

        loop {
            tokio::select! {
                frame = self.rx_send.recv(), if !self.retrying => {
                    match frame {
                        Some(frame) => {
                            match safe_tcp_write(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&frame),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    self.retrying = true;
                                }
                                Err(_e) => break,
                            }
                        },
                        None => break,
                    }
                },

                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<BulkFrame, _>(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => break,
                    }
                },

                frame = safe_tcp_read::<BulkFrame, _>(
                    &mut self.read_buf, &mut self.conn_read
                ) => {
                    match frame {
                        Ok(frame) => {
                            if self.tx_deliver
                                .send((self.peer, frame))
                                .is_err()
                            {
                                break;
                            }
                        },
                        Err(_e) => break,
                    }
                },
            }
        }

        let _ = self.tx_exit.send(self.peer);
        pf_debug!("bulk link task for {} exited", self.peer);
    }
}

#[cfg(test)]
mod bulk_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;
    use tokio::time::{self, Duration};

    fn test_addrs(base_port: u16, n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", base_port + i as u16)
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn root_and_receiver_complete() -> Result<(), ShardcastError> {
        let members: Vec<NodeId> = vec![5, 9];
        let addrs = test_addrs(30871, 2);
        let addrs1 = addrs.clone();
        let members1 = members.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            // node 9: receiver
            let hub =
                BulkHub::new_and_setup(9, &members1, &addrs1, 0).await?;
            let selected = Arc::new(AtomicUsize::new(0));
            let received = Arc::new(AtomicUsize::new(0));
            let selected_ref = selected.clone();
            let received_ref = received.clone();
            hub.create_group(
                0,
                vec![5, 9],
                Box::new(move |size| {
                    selected_ref.store(size, Ordering::Release);
                    true
                }),
                Box::new(move |bytes| {
                    received_ref.store(bytes.len(), Ordering::Release);
                }),
            );
            barrier1.wait().await;
            let mut seen = 0;
            for _ in 0..200 {
                seen = received.load(Ordering::Acquire);
                if seen > 0 {
                    break;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(seen, 11);
            assert_eq!(selected.load(Ordering::Acquire), 11);
            barrier1.wait().await;
            hub.stop();
            Ok::<(), ShardcastError>(())
        });

        // node 5: root
        let hub = BulkHub::new_and_setup(5, &members, &addrs, 0).await?;
        let self_done = Arc::new(AtomicUsize::new(0));
        let self_done_ref = self_done.clone();
        hub.create_group(
            0,
            vec![5, 9],
            Box::new(|_| {
                panic!("destination select must not run at the root");
            }),
            Box::new(move |bytes| {
                self_done_ref.store(bytes.len(), Ordering::Release);
            }),
        );
        hub.send(0, b"hello bulk!")?;
        let mut seen = 0;
        for _ in 0..200 {
            seen = self_done.load(Ordering::Acquire);
            if seen > 0 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen, 11);
        barrier.wait().await;
        barrier.wait().await;
        hub.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_from_non_root_rejected() -> Result<(), ShardcastError> {
        let members: Vec<NodeId> = vec![3];
        let addrs = test_addrs(30881, 1);
        let hub = BulkHub::new_and_setup(3, &members, &addrs, 0).await?;
        hub.create_group(
            1,
            vec![7, 3],
            Box::new(|_| true),
            Box::new(|_| {}),
        );
        assert!(hub.send(1, b"nope").is_err());
        assert!(hub.send(2, b"unknown").is_err());
        hub.stop();
        Ok(())
    }
}
