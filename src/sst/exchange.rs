//! Peer-to-peer row replication links for the shared-state table.
//!
//! Each pair of members keeps one TCP link. A `put` on the owning table
//! becomes an `Update` frame carrying a byte range of the writer's row;
//! the receiving link task copies the bytes into its local replica of that
//! row at the same offset. Per-link FIFO delivery yields the table's
//! single-column write-ordering guarantee. Write completions are probed
//! with ping/pong tokens; a broken or unresponsive link is the failure
//! signal consumed by the membership layer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, ShardcastError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Frame exchanged between table replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum SstFrame {
    /// One-sided write of a byte range of the sender's row.
    Update { offset: usize, bytes: Vec<u8> },

    /// Write-completion probe.
    Ping { token: u64 },

    /// Probe acknowledgement.
    Pong { token: u64 },

    /// Initialization barrier marker.
    Sync,
}

/// Shared bookkeeping between the exchange handle and its link tasks.
struct ExchangeShared {
    /// Replicated rows; index = member rank in the current view.
    rows: Arc<RwLock<Vec<Box<[u8]>>>>,

    /// Nudges the predicate loop after an applied update.
    pred_notify: Arc<Notify>,

    /// Outstanding completion probes: token -> (target rank, waker).
    pending_pings: Mutex<HashMap<u64, (usize, oneshot::Sender<bool>)>>,

    /// Ranks whose link has broken.
    dead: Mutex<HashSet<usize>>,

    /// Initialization barrier: count of Sync markers seen.
    sync_seen: Mutex<usize>,
}

impl ExchangeShared {
    /// Fails all outstanding probes aimed at a now-dead rank.
    fn fail_pings_for(&self, rank: usize) {
        let mut pending = self.pending_pings.lock().unwrap();
        let tokens: Vec<u64> = pending
            .iter()
            .filter_map(|(t, (r, _))| if *r == rank { Some(*t) } else { None })
            .collect();
        for token in tokens {
            if let Some((_, tx)) = pending.remove(&token) {
                let _ = tx.send(false);
            }
        }
    }
}

/// Row replication hub for one table instance.
pub(crate) struct SstExchange {
    me: usize,
    num_members: usize,

    /// Per-rank senders feeding the link writer tasks.
    tx_links: flashmap::ReadHandle<usize, mpsc::UnboundedSender<SstFrame>>,

    shared: Arc<ExchangeShared>,

    next_ping: AtomicU64,

    /// Kept alive so the acceptor's connect channel never closes under it.
    _tx_connect: mpsc::UnboundedSender<(usize, SocketAddr)>,

    _acceptor_handle: JoinHandle<()>,
    link_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SstExchange {
    /// Creates the exchange for one table instance: binds this member's SST
    /// port, connects to every lower-ranked member, and accepts connections
    /// from every higher-ranked one. Returns once all links are up.
    pub(crate) async fn new_and_setup(
        me: usize,
        vid: i32,
        addrs: &[SocketAddr],
        rows: Arc<RwLock<Vec<Box<[u8]>>>>,
        pred_notify: Arc<Notify>,
    ) -> Result<Arc<Self>, ShardcastError> {
        let num_members = addrs.len();
        if me >= num_members {
            return logged_err!(
                "invalid rank {} among {} members",
                me,
                num_members
            );
        }

        let shared = Arc::new(ExchangeShared {
            rows,
            pred_notify,
            pending_pings: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            sync_seen: Mutex::new(0),
        });

        let (tx_links_write, tx_links_read) =
            flashmap::new::<usize, mpsc::UnboundedSender<SstFrame>>();

        let listener = tcp_bind_with_retry(addrs[me], 10).await?;
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();
        let (tx_handle, mut rx_handle) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, mut rx_connack) = mpsc::unbounded_channel();

        let mut acceptor = ExchangeAcceptorTask {
            me,
            vid,
            listener,
            tx_links: tx_links_write,
            shared: shared.clone(),
            tx_exit,
            rx_exit,
            rx_connect,
            tx_connack,
            tx_handle,
        };
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        let exchange = Arc::new(SstExchange {
            me,
            num_members,
            tx_links: tx_links_read,
            shared,
            next_ping: AtomicU64::new(1),
            _tx_connect: tx_connect.clone(),
            _acceptor_handle: acceptor_handle,
            link_handles: Mutex::new(Vec::new()),
        });

        // proactively connect to all lower-ranked members
        for (rank, addr) in addrs.iter().enumerate().take(me) {
            tx_connect
                .send((rank, *addr))
                .map_err(ShardcastError::msg)?;
            match rx_connack.recv().await {
                Some(Ok(ack_rank)) if ack_rank == rank => {}
                Some(Ok(ack_rank)) => {
                    return logged_err!(
                        "rank mismatch connecting: expected {}, got {}",
                        rank,
                        ack_rank
                    );
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return logged_err!("sst connack channel closed");
                }
            }
        }

        // wait until every link is up
        while exchange.connected_count() + 1 < num_members {
            while let Ok(handle) = rx_handle.try_recv() {
                exchange.link_handles.lock().unwrap().push(handle);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        while let Ok(handle) = rx_handle.try_recv() {
            exchange.link_handles.lock().unwrap().push(handle);
        }

        Ok(exchange)
    }

    fn connected_count(&self) -> usize {
        self.tx_links.guard().len()
    }

    /// Sends a one-sided row write to the given target rank. Writes to a
    /// dead or missing link vanish silently, matching one-sided semantics.
    pub(crate) fn send_update(
        &self,
        target: usize,
        offset: usize,
        bytes: Vec<u8>,
    ) {
        if target == self.me {
            return;
        }
        let guard = self.tx_links.guard();
        if let Some(tx) = guard.get(&target) {
            let _ = tx.send(SstFrame::Update { offset, bytes });
        }
    }

    /// Probes write completion on the given targets. Returns the ranks whose
    /// link is broken or failed to acknowledge within the timeout.
    pub(crate) async fn probe_completion(
        &self,
        targets: &[usize],
        timeout: Duration,
    ) -> Vec<usize> {
        let mut waiters = Vec::new();
        let mut failed = Vec::new();

        for &target in targets {
            if target == self.me {
                continue;
            }
            if self.shared.dead.lock().unwrap().contains(&target) {
                failed.push(target);
                continue;
            }
            let guard = self.tx_links.guard();
            match guard.get(&target) {
                Some(tx) => {
                    let token =
                        self.next_ping.fetch_add(1, Ordering::AcqRel);
                    let (tx_done, rx_done) = oneshot::channel();
                    self.shared
                        .pending_pings
                        .lock()
                        .unwrap()
                        .insert(token, (target, tx_done));
                    if tx.send(SstFrame::Ping { token }).is_err() {
                        self.shared
                            .pending_pings
                            .lock()
                            .unwrap()
                            .remove(&token);
                        failed.push(target);
                    } else {
                        waiters.push((target, rx_done));
                    }
                }
                None => failed.push(target),
            }
        }

        for (target, rx_done) in waiters {
            match time::timeout(timeout, rx_done).await {
                Ok(Ok(true)) => {}
                _ => failed.push(target),
            }
        }

        failed
    }

    /// Barrier ensuring each member has initialized its row: sends a Sync
    /// marker to all links and waits for one from every other member.
    pub(crate) async fn sync_barrier(&self) {
        {
            let guard = self.tx_links.guard();
            for (_, tx) in guard.iter() {
                let _ = tx.send(SstFrame::Sync);
            }
        }
        while *self.shared.sync_seen.lock().unwrap() + 1 < self.num_members
        {
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Tears down all link tasks.
    pub(crate) fn stop(&self) {
        self._acceptor_handle.abort();
        for handle in self.link_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Acceptor task: accepts links from higher-ranked members and registers
/// proactive connections handed over from setup.
struct ExchangeAcceptorTask {
    me: usize,
    vid: i32,
    listener: TcpListener,
    tx_links: flashmap::WriteHandle<usize, mpsc::UnboundedSender<SstFrame>>,
    shared: Arc<ExchangeShared>,
    tx_exit: mpsc::UnboundedSender<usize>,
    rx_exit: mpsc::UnboundedReceiver<usize>,
    rx_connect: mpsc::UnboundedReceiver<(usize, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<Result<usize, ShardcastError>>,
    tx_handle: mpsc::UnboundedSender<JoinHandle<()>>,
}

impl ExchangeAcceptorTask {
    /// Connects to a lower-ranked peer proactively.
    async fn connect_link(
        &mut self,
        rank: usize,
        addr: SocketAddr,
    ) -> Result<usize, ShardcastError> {
        let mut stream = tcp_connect_with_retry(addr, 25).await?;
        stream.write_u64(self.me as u64).await?;
        stream.write_i32(self.vid).await?;
        let peer_vid = stream.read_i32().await?;
        if peer_vid != self.vid {
            return logged_err!(
                "vid mismatch connecting to rank {}: {} != {}",
                rank,
                peer_vid,
                self.vid
            );
        }
        self.spawn_link(rank, stream);
        Ok(rank)
    }

    fn spawn_link(&mut self, rank: usize, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut guard = self.tx_links.guard();
        guard.insert(rank, tx_send.clone());

        let mut link = ExchangeLinkTask::new(
            rank,
            stream,
            tx_send,
            rx_send,
            self.shared.clone(),
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { link.run().await });
        let _ = self.tx_handle.send(handle);
    }

    async fn accept_link(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), ShardcastError> {
        let rank = stream.read_u64().await? as usize;
        let peer_vid = stream.read_i32().await?;
        if peer_vid != self.vid {
            return logged_err!(
                "vid mismatch from rank {}: {} != {}",
                rank,
                peer_vid,
                self.vid
            );
        }
        stream.write_i32(self.vid).await?;
        if rank <= self.me {
            return logged_err!("unexpected link from lower rank {}", rank);
        }
        self.spawn_link(rank, stream);
        Ok(())
    }

    async fn run(&mut self) {
        pf_debug!("sst exchange acceptor task spawned");
        loop {
            tokio::select! {
                // proactive connection request from setup
                to_connect = self.rx_connect.recv() => {
                    let Some((rank, addr)) = to_connect else { break; };
                    let ack = self.connect_link(rank, addr).await;
                    if self.tx_connack.send(ack).is_err() {
                        break;
                    }
                },

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_link(stream).await {
                                pf_error!("error accepting sst link: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_warn!("error accepting sst connection: {}", e);
                        }
                    }
                },

                rank = self.rx_exit.recv() => {
                    let Some(rank) = rank else { break; };
                    let mut guard = self.tx_links.guard();
                    guard.remove(rank);
                    self.shared.dead.lock().unwrap().insert(rank);
                    self.shared.fail_pings_for(rank);
                    pf_warn!("sst link to rank {} broke", rank);
                },
            }
        }
    }
}

/// Per-link task: writes queued frames out and applies incoming ones.
struct ExchangeLinkTask {
    rank: usize,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_send: mpsc::UnboundedSender<SstFrame>,
    rx_send: mpsc::UnboundedReceiver<SstFrame>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    shared: Arc<ExchangeShared>,
    tx_exit: mpsc::UnboundedSender<usize>,
}

impl ExchangeLinkTask {
    fn new(
        rank: usize,
        conn: TcpStream,
        tx_send: mpsc::UnboundedSender<SstFrame>,
        rx_send: mpsc::UnboundedReceiver<SstFrame>,
        shared: Arc<ExchangeShared>,
        tx_exit: mpsc::UnboundedSender<usize>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        ExchangeLinkTask {
            rank,
            conn_read,
            conn_write,
            tx_send,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            shared,
            tx_exit,
        }
    }

    /// Applies an incoming one-sided write into this peer's row replica.
    fn apply_update(&self, offset: usize, bytes: &[u8]) {
        {
            let mut rows = self.shared.rows.write().unwrap();
            if self.rank >= rows.len()
                || offset + bytes.len() > rows[self.rank].len()
            {
                pf_error!(
                    "update from rank {} out of bounds: offset {} len {}",
                    self.rank,
                    offset,
                    bytes.len()
                );
                return;
            }
            rows[self.rank][offset..offset + bytes.len()]
                .copy_from_slice(bytes);
        }
        self.shared.pred_notify.notify_one();
    }

    fn handle_frame(&mut self, frame: SstFrame) {
        match frame {
            SstFrame::Update { offset, bytes } => {
                self.apply_update(offset, &bytes);
            }
            SstFrame::Ping { token } => {
                let _ = self.tx_send.send(SstFrame::Pong { token });
            }
            SstFrame::Pong { token } => {
                if let Some((_, tx)) = self
                    .shared
                    .pending_pings
                    .lock()
                    .unwrap()
                    .remove(&token)
                {
                    let _ = tx.send(true);
                }
            }
            SstFrame::Sync => {
                *self.shared.sync_seen.lock().unwrap() += 1;
            }
        }
    }

    async fn run(&mut self) {
        pf_debug!("sst link task for rank {} spawned", self.rank);

        loop {
            tokio::select! {
                // gets a frame to send out
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
                        None => break, // channel closed
                    }
                },

                // retrying last unsuccessful write
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<SstFrame, _>(
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

                // receives new frame from peer
                frame = safe_tcp_read::<SstFrame, _>(
                    &mut self.read_buf, &mut self.conn_read
                ) => {
                    match frame {
                        Ok(frame) => self.handle_frame(frame),
                        Err(_e) => break, // peer went away
                    }
                },
            }
        }

        let _ = self.tx_exit.send(self.rank);
        pf_debug!("sst link task for rank {} exited", self.rank);
    }
}
