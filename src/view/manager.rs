//! Membership management: failure detection, view proposal/commit through
//! the shared-state table, join handling, ragged-edge cleanup, and view
//! installation.
//!
//! The view-change protocol walks each member through Steady -> Proposed
//! (leader bumps `n_changes`, everyone acks) -> Committed (leader observes
//! all acks) -> Installed (everyone runs ragged-edge cleanup and rebuilds
//! the multicast group under the next view). Predicate triggers never touch
//! sockets; the heavy tail of a view change runs on a dedicated worker
//! task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::group::GroupConfig;
use crate::multicast::{
    BulkHub, DeliveryCallbacks, GroupParams, Medium, Mode, MulticastGroup,
    NodeId, SendBuffer, SubgroupId, HEADER_SIZE,
};
use crate::persist::PersistWriter;
use crate::sst::{
    LayoutParams, PredicateKind, RowLayout, SharedStateTable, SstSnapshot,
};
use crate::utils::{
    tcp_bind_with_retry, tcp_connect_with_retry, Bitmap, ShardcastError,
    Timer,
};
use crate::view::subgroup::{make_subgroup_maps, SubgroupMaps};
use crate::view::{persist_view, StateRegistry, SubgroupInfo, View};

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Bytes reserved in the SST for each joiner contact string.
const CONTACT_CAPACITY: usize = 64;

/// First message on a GMS socket, identifying the caller's intent.
#[derive(Debug, Serialize, Deserialize)]
enum GmsHello {
    /// Request to join the group; carries the joiner's contact string.
    Join { contact: String },

    /// Request for a subgroup's replicated-object state.
    FetchState { subgroup: u64 },
}

/// A join socket awaiting proposal by the leader.
struct PendingJoin {
    stream: TcpStream,
    contact: String,
}

/// A join the leader has proposed but not yet committed.
struct ProposedJoin {
    stream: TcpStream,
    id: NodeId,
    contact: String,
}

/// The engine instances backing one installed view.
struct ViewRuntime {
    sst: Arc<SharedStateTable>,
    bulk: Arc<BulkHub>,
    mcast: Option<MulticastGroup>,
    maps: SubgroupMaps,
}

type ViewUpcall = Box<dyn Fn(&View) + Send + Sync>;

/// Shared state of the view manager.
struct VmInner {
    my_id: NodeId,
    my_contact: String,
    config: GroupConfig,
    subgroup_info: SubgroupInfo,
    registry: Arc<StateRegistry>,
    callbacks: DeliveryCallbacks,

    /// The current view. Reads share; installation is the only writer.
    curr_view: RwLock<Arc<View>>,

    /// Engine instances of the current view; `None` while a view change is
    /// rebuilding them.
    runtime: Mutex<Option<ViewRuntime>>,

    pending_joins: Mutex<VecDeque<PendingJoin>>,
    proposed_joins: Mutex<Vec<ProposedJoin>>,

    /// Cached copy of the suspicions already acted upon.
    last_suspected: Mutex<Bitmap>,

    view_upcalls: Mutex<Vec<ViewUpcall>>,

    tx_view_event: mpsc::UnboundedSender<()>,
    tx_failure: mpsc::UnboundedSender<(i32, usize)>,

    change_in_progress: AtomicBool,

    /// Subgroup tag -> mode recorded at first install; changing a
    /// subgroup's mode later is a validation error.
    pinned_modes: Mutex<HashMap<String, Mode>>,

    next_node_id: AtomicU32,
    shutdown: AtomicBool,
}

/// Owns the current view and the engine instances serving it.
pub(crate) struct ViewManager {
    inner: Arc<VmInner>,
    _listener_handle: JoinHandle<()>,
    _failure_handle: JoinHandle<()>,
    _worker_handle: JoinHandle<()>,
}

impl ViewManager {
    /// Starts with a pre-agreed initial membership (vid 0). Every listed
    /// member runs this with the same arguments; construction completes
    /// once all members have linked up.
    pub(crate) async fn start_fresh(
        my_id: NodeId,
        initial_members: Vec<(NodeId, String)>,
        config: GroupConfig,
        subgroup_info: SubgroupInfo,
        registry: Arc<StateRegistry>,
        callbacks: DeliveryCallbacks,
    ) -> Result<Self, ShardcastError> {
        let members: Vec<NodeId> =
            initial_members.iter().map(|(id, _)| *id).collect();
        let contacts: Vec<String> = initial_members
            .iter()
            .map(|(_, contact)| contact.clone())
            .collect();
        let Some(my_rank) = members.iter().position(|&m| m == my_id) else {
            return logged_err!(
                "node {} not in initial member list",
                my_id
            );
        };
        let my_contact = contacts[my_rank].clone();
        let view = Arc::new(View::new(
            0,
            members,
            contacts,
            my_rank as i32,
        ));

        let writer = Self::make_writer(&config).await?;
        Self::start_with_view(
            my_id,
            my_contact,
            view,
            config,
            subgroup_info,
            registry,
            callbacks,
            writer,
            Vec::new(),
        )
        .await
    }

    /// Joins an existing group through its leader's GMS socket. Returns
    /// the manager along with the node id the leader assigned.
    pub(crate) async fn start_join(
        my_contact: String,
        leader_contact: &str,
        config: GroupConfig,
        subgroup_info: SubgroupInfo,
        registry: Arc<StateRegistry>,
        callbacks: DeliveryCallbacks,
    ) -> Result<(Self, NodeId), ShardcastError> {
        let leader = crate::view::Contact::parse(leader_contact)?;
        let mut stream =
            tcp_connect_with_retry(leader.gms_addr()?, 25).await?;

        // (i) announce intent and contact, receive assigned node id
        write_framed(
            &mut stream,
            &rmp_serde::encode::to_vec(&GmsHello::Join {
                contact: my_contact.clone(),
            })?,
        )
        .await?;
        let my_id = stream.read_u32().await?;
        pf_info!("assigned node id {} by the group leader", my_id);

        // (ii) the new view, (iii) the group parameters
        let view = Arc::new(View::decode(&read_framed(&mut stream).await?)?);
        let leader_config: GroupConfig =
            rmp_serde::decode::from_slice(&read_framed(&mut stream).await?)?;
        let config = config.merged_with_leader(&leader_config);

        // (iv) shard leaders to pull object state from
        let shard_leaders: Vec<(u64, NodeId)> =
            rmp_serde::decode::from_slice(&read_framed(&mut stream).await?)?;

        if view.rank_of(my_id).is_none() {
            return logged_err!(
                "joined view {} does not contain my id {}",
                view.vid,
                my_id
            );
        }

        let writer = Self::make_writer(&config).await?;
        let manager = Self::start_with_view(
            my_id,
            my_contact,
            view.clone(),
            config,
            subgroup_info,
            registry.clone(),
            callbacks,
            writer,
            Vec::new(),
        )
        .await?;

        // pull replicated state from each listed shard leader on a
        // separately established socket
        let maps_tags: Vec<String> = {
            let runtime = manager.inner.runtime.lock().unwrap();
            runtime.as_ref().unwrap().maps.tags.clone()
        };
        for (subgroup, leader_id) in shard_leaders {
            let subgroup = subgroup as SubgroupId;
            let fetched = time::timeout(
                Duration::from_secs(10),
                Self::fetch_subgroup_state(
                    &view,
                    &maps_tags,
                    &registry,
                    subgroup,
                    leader_id,
                ),
            )
            .await
            .unwrap_or_else(|e| Err(ShardcastError::from(e)));
            if let Err(e) = fetched {
                pf_error!(
                    "failed fetching state of subgroup {} from {}: {}",
                    subgroup,
                    leader_id,
                    e
                );
            }
        }

        Ok((manager, my_id))
    }

    /// Common tail of all construction paths.
    #[allow(clippy::too_many_arguments)]
    async fn start_with_view(
        my_id: NodeId,
        my_contact: String,
        view: Arc<View>,
        config: GroupConfig,
        subgroup_info: SubgroupInfo,
        registry: Arc<StateRegistry>,
        callbacks: DeliveryCallbacks,
        writer: Option<Arc<PersistWriter>>,
        view_upcalls: Vec<ViewUpcall>,
    ) -> Result<Self, ShardcastError> {
        let (tx_view_event, rx_view_event) = mpsc::unbounded_channel();
        let (tx_failure, rx_failure) = mpsc::unbounded_channel();

        let max_member = view.members.iter().copied().max().unwrap_or(0);
        let num_members = view.num_members();

        let inner = Arc::new(VmInner {
            my_id,
            my_contact: my_contact.clone(),
            config,
            subgroup_info,
            registry,
            callbacks,
            curr_view: RwLock::new(view.clone()),
            runtime: Mutex::new(None),
            pending_joins: Mutex::new(VecDeque::new()),
            proposed_joins: Mutex::new(Vec::new()),
            last_suspected: Mutex::new(Bitmap::new(
                num_members.max(1),
                false,
            )),
            view_upcalls: Mutex::new(view_upcalls),
            tx_view_event,
            tx_failure,
            change_in_progress: AtomicBool::new(false),
            pinned_modes: Mutex::new(HashMap::new()),
            next_node_id: AtomicU32::new(max_member + 1),
            shutdown: AtomicBool::new(false),
        });

        let runtime =
            Self::build_runtime(&inner, &view, writer, None).await?;
        Self::register_view_predicates(&inner, &runtime.sst);
        Self::ensure_objects(&inner, &runtime.maps);
        *inner.runtime.lock().unwrap() = Some(runtime);

        // bind the GMS listener before spawning so bind errors surface
        let gms_addr =
            crate::view::Contact::parse(&my_contact)?.gms_addr()?;
        let listener = tcp_bind_with_retry(gms_addr, 10).await?;

        let listener_inner = inner.clone();
        let listener_handle = tokio::spawn(async move {
            Self::client_listener_task(listener_inner, listener).await;
        });
        let failure_inner = inner.clone();
        let failure_handle = tokio::spawn(async move {
            Self::failure_watcher_task(failure_inner, rx_failure).await;
        });
        let worker_inner = inner.clone();
        let worker_handle = tokio::spawn(async move {
            Self::view_change_worker_task(worker_inner, rx_view_event)
                .await;
        });

        Ok(ViewManager {
            inner,
            _listener_handle: listener_handle,
            _failure_handle: failure_handle,
            _worker_handle: worker_handle,
        })
    }

    async fn make_writer(
        config: &GroupConfig,
    ) -> Result<Option<Arc<PersistWriter>>, ShardcastError> {
        if config.persist_path.is_empty() {
            return Ok(None);
        }
        let writer = PersistWriter::new_and_setup(std::path::Path::new(
            &config.persist_path,
        ))
        .await?;
        Ok(Some(Arc::new(writer)))
    }

    /// Builds the table, bulk hub, and multicast group for a view. With an
    /// old group given, transitions through `handoff` instead of starting
    /// fresh.
    async fn build_runtime(
        inner: &Arc<VmInner>,
        view: &Arc<View>,
        writer: Option<Arc<PersistWriter>>,
        old_mcast: Option<MulticastGroup>,
    ) -> Result<ViewRuntime, ShardcastError> {
        let specs = (inner.subgroup_info)(view)?;

        // mode is pinned at subgroup creation
        {
            let mut pinned = inner.pinned_modes.lock().unwrap();
            for spec in &specs {
                match pinned.get(&spec.tag) {
                    Some(&mode) if mode != spec.mode => {
                        return logged_err!(
                            "subgroup '{}' changed mode across views; mode \
                             is pinned at creation",
                            spec.tag
                        );
                    }
                    Some(_) => {}
                    None => {
                        pinned.insert(spec.tag.clone(), spec.mode);
                    }
                }
            }
        }

        let maps = make_subgroup_maps(view, &specs, inner.my_id)?;
        let my_rank = view.rank_of(inner.my_id).unwrap();

        let layout = RowLayout::new(LayoutParams {
            num_members: view.num_members(),
            change_capacity: inner.config.change_capacity,
            contact_capacity: CONTACT_CAPACITY,
            total_senders: maps.total_senders.max(1),
            num_subgroups: specs.len().max(1),
            window_size: inner.config.window_size,
            max_slot_msg_size: inner.config.slot_payload_cap + HEADER_SIZE,
        });

        let mut sst_addrs = Vec::with_capacity(view.num_members());
        let mut bulk_addrs = Vec::with_capacity(view.num_members());
        for rank in 0..view.num_members() {
            let contact = view.contact(rank)?;
            sst_addrs.push(contact.sst_addr()?);
            bulk_addrs.push(contact.bulk_addr()?);
        }

        let sst = SharedStateTable::new_and_setup(
            my_rank, view.vid, &sst_addrs, layout,
        )
        .await?;
        let bulk = BulkHub::new_and_setup(
            inner.my_id,
            &view.members,
            &bulk_addrs,
            view.vid,
        )
        .await?;

        let params = GroupParams {
            my_node_id: inner.my_id,
            members: view.members.clone(),
            sst: sst.clone(),
            bulk: bulk.clone(),
            total_num_subgroups: specs.len(),
            subgroups: maps.settings.clone(),
            callbacks: inner.callbacks.clone(),
            window_size: inner.config.window_size,
            max_payload_size: inner.config.max_payload_size,
            heartbeat_interval: Duration::from_millis(
                inner.config.heartbeat_interval_ms,
            ),
            already_failed: view.failed.clone(),
            writer,
            tx_peer_failure: Some(inner.tx_failure.clone()),
        };

        let mcast = match old_mcast {
            None => MulticastGroup::new_and_setup(params).await?,
            Some(old) => MulticastGroup::handoff(old, params).await?,
        };

        Ok(ViewRuntime {
            sst,
            bulk,
            mcast: Some(mcast),
            maps,
        })
    }

    /// Constructs a replicated object for every subgroup this node now
    /// belongs to (no-op for objects that already exist).
    fn ensure_objects(inner: &Arc<VmInner>, maps: &SubgroupMaps) {
        for (&subgroup, settings) in &maps.settings {
            if settings.my_shard_rank.is_none() {
                continue;
            }
            if let Err(e) = inner
                .registry
                .ensure_object(subgroup, &maps.tags[subgroup])
            {
                pf_warn!(
                    "no replicated object for subgroup {}: {}",
                    subgroup,
                    e
                );
            }
        }
    }

    /// Appends a membership change to this node's proposal columns.
    /// Surfaces `CapacityExhausted` as an error so the caller can defer
    /// and retry after the next commit.
    fn propose_change(
        inner: &Arc<VmInner>,
        sst: &SharedStateTable,
        node: NodeId,
        join_contact: Option<&str>,
    ) -> Result<(), ShardcastError> {
        let me = sst.my_rank();
        let n_changes = sst.n_changes(me);
        for idx in 0..(n_changes as usize) {
            if sst.change(me, idx) == node {
                return Ok(()); // already proposed
            }
        }
        let idx = n_changes as usize;
        if idx >= inner.config.change_capacity {
            return Err(ShardcastError(format!(
                "changes array full ({} pending)",
                idx
            )));
        }
        sst.set_change(idx, node);
        if let Some(contact) = join_contact {
            sst.set_joiner_id(idx, node);
            sst.set_joiner_contact(idx, contact);
        }
        sst.set_n_changes(n_changes + 1);

        let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
        let layout = sst.layout().clone();
        sst.put(&all_rows, layout.change_block());
        pf_debug!("proposed change {} as entry {}", node, idx);
        Ok(())
    }

    /// Registers the five membership predicates on a view's table.
    fn register_view_predicates(
        inner: &Arc<VmInner>,
        sst: &Arc<SharedStateTable>,
    ) {
        let me = sst.my_rank();

        // suspected_changed: act on any new suspicion seen in any row
        let pred_inner = inner.clone();
        let suspected_pred = Box::new(move |snap: &SstSnapshot| {
            let last = pred_inner.last_suspected.lock().unwrap();
            for row in 0..snap.num_rows() {
                for member in 0..snap.num_rows() {
                    if snap.suspected(row, member)
                        && !last.get(member).unwrap_or(true)
                    {
                        return true;
                    }
                }
            }
            false
        });
        let trig_inner = inner.clone();
        let suspected_trig = Box::new(move |sst: &SharedStateTable| {
            let snap = sst.snapshot();
            let mut newly = Vec::new();
            {
                let mut last = trig_inner.last_suspected.lock().unwrap();
                for member in 0..snap.num_rows() {
                    if last.get(member).unwrap_or(true) {
                        continue;
                    }
                    let seen = (0..snap.num_rows())
                        .any(|row| snap.suspected(row, member));
                    if seen {
                        let _ = last.set(member, true);
                        newly.push(member);
                    }
                }
            }
            if newly.is_empty() {
                return;
            }

            // mark failures in the current view
            {
                let mut view_guard =
                    trig_inner.curr_view.write().unwrap();
                let mut view = (**view_guard).clone();
                for &member in &newly {
                    if !view.failed[member] {
                        pf_warn!(
                            "member {} (node {}) now suspected as failed",
                            member,
                            view.members[member]
                        );
                        view.failed[member] = true;
                        view.num_failed += 1;
                    }
                }
                if view.num_failed * 2 > view.num_members() {
                    pf_error!(
                        "{} of {} members failed; potential partition",
                        view.num_failed,
                        view.num_members()
                    );
                }
                *view_guard = Arc::new(view);
            }

            // gossip the sticky suspicion bits
            for &member in &newly {
                sst.set_suspected(member, true);
            }
            let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
            let layout = sst.layout().clone();
            sst.put(&all_rows, layout.suspected_all());

            // the leader proposes removing the failed members
            let view = trig_inner.curr_view.read().unwrap().clone();
            if view.i_am_leader() {
                for &member in &newly {
                    let node = view.members[member];
                    if let Err(e) =
                        Self::propose_change(&trig_inner, sst, node, None)
                    {
                        pf_warn!(
                            "deferring removal of {} until after the next \
                             commit: {}",
                            node,
                            e
                        );
                    }
                }
            }
        });
        sst.predicates.insert(
            suspected_pred,
            suspected_trig,
            PredicateKind::Recurrent,
        );

        // start_join (leader-only): drain pending join sockets into
        // proposals
        let pred_inner = inner.clone();
        let join_pred = Box::new(move |_: &SstSnapshot| {
            pred_inner.curr_view.read().unwrap().i_am_leader()
                && !pred_inner.pending_joins.lock().unwrap().is_empty()
        });
        let trig_inner = inner.clone();
        let join_trig = Box::new(move |sst: &SharedStateTable| {
            if !trig_inner.curr_view.read().unwrap().i_am_leader() {
                return;
            }
            loop {
                let Some(pending) =
                    trig_inner.pending_joins.lock().unwrap().pop_front()
                else {
                    break;
                };
                let id =
                    trig_inner.next_node_id.fetch_add(1, Ordering::AcqRel);
                match Self::propose_change(
                    &trig_inner,
                    sst,
                    id,
                    Some(&pending.contact),
                ) {
                    Ok(()) => {
                        pf_info!(
                            "proposed join of node {} from '{}'",
                            id,
                            pending.contact
                        );
                        trig_inner.proposed_joins.lock().unwrap().push(
                            ProposedJoin {
                                stream: pending.stream,
                                id,
                                contact: pending.contact,
                            },
                        );
                    }
                    Err(e) => {
                        pf_warn!(
                            "deferring join until after the next commit: {}",
                            e
                        );
                        trig_inner
                            .pending_joins
                            .lock()
                            .unwrap()
                            .push_front(pending);
                        break;
                    }
                }
            }
        });
        sst.predicates
            .insert(join_pred, join_trig, PredicateKind::Recurrent);

        // change_commit_ready (leader-only)
        let pred_inner = inner.clone();
        let commit_pred = Box::new(move |snap: &SstSnapshot| {
            let view = pred_inner.curr_view.read().unwrap().clone();
            if !view.i_am_leader() {
                return false;
            }
            let n_changes = snap.n_changes(me);
            if n_changes <= snap.n_committed(me) {
                return false;
            }
            for rank in 0..view.num_members() {
                if view.failed[rank] {
                    continue;
                }
                if snap.n_acked(rank) < n_changes {
                    return false;
                }
            }
            true
        });
        let commit_trig = Box::new(move |sst: &SharedStateTable| {
            let n_changes = sst.n_changes(sst.my_rank());
            pf_debug!("committing {} membership changes", n_changes);
            sst.set_n_committed(n_changes);
            let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
            let layout = sst.layout().clone();
            sst.put(&all_rows, layout.n_committed());
        });
        sst.predicates.insert(
            commit_pred,
            commit_trig,
            PredicateKind::Recurrent,
        );

        // leader_proposed: copy the leader's proposal and ack it
        let pred_inner = inner.clone();
        let proposed_pred = Box::new(move |snap: &SstSnapshot| {
            let view = pred_inner.curr_view.read().unwrap().clone();
            let Some(leader_row) = view.leader_rank() else {
                return false;
            };
            snap.n_changes(leader_row) > snap.n_acked(me)
        });
        let trig_inner = inner.clone();
        let proposed_trig = Box::new(move |sst: &SharedStateTable| {
            let view = trig_inner.curr_view.read().unwrap().clone();
            let Some(leader_row) = view.leader_rank() else {
                return;
            };
            if leader_row != me {
                sst.copy_change_block_from(leader_row);
            }
            let n_changes = sst.n_changes(me);
            sst.set_n_acked(n_changes);
            let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
            let layout = sst.layout().clone();
            sst.put(&all_rows, layout.change_block());
            pf_debug!("acked {} proposed changes", n_changes);
        });
        sst.predicates.insert(
            proposed_pred,
            proposed_trig,
            PredicateKind::Recurrent,
        );

        // leader_committed: kick the view-change worker exactly once
        let pred_inner = inner.clone();
        let committed_pred = Box::new(move |snap: &SstSnapshot| {
            if pred_inner.change_in_progress.load(Ordering::Acquire) {
                return false;
            }
            let view = pred_inner.curr_view.read().unwrap().clone();
            let Some(leader_row) = view.leader_rank() else {
                return false;
            };
            snap.n_committed(leader_row) > snap.n_installed(me)
        });
        let trig_inner = inner.clone();
        let committed_trig = Box::new(move |_: &SharedStateTable| {
            if !trig_inner
                .change_in_progress
                .swap(true, Ordering::AcqRel)
            {
                let _ = trig_inner.tx_view_event.send(());
            }
        });
        sst.predicates.insert(
            committed_pred,
            committed_trig,
            PredicateKind::Recurrent,
        );
    }

    /// GMS listener task: accepts join sockets onto the pending queue and
    /// serves replicated-state fetches.
    async fn client_listener_task(
        inner: Arc<VmInner>,
        listener: TcpListener,
    ) {
        pf_debug!("gms listener task spawned");
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            let (mut stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!("error accepting gms connection: {}", e);
                    continue;
                }
            };

            // a stalled client must not block the listener
            let watchdog = Timer::new();
            let _ = watchdog.kickoff(Duration::from_secs(5));
            let hello = tokio::select! {
                bytes = read_framed(&mut stream) => bytes,
                () = watchdog.timeout() => {
                    pf_warn!("gms client '{}' stalled, dropping", addr);
                    continue;
                }
            };
            let hello: GmsHello = match hello
                .and_then(|b| Ok(rmp_serde::decode::from_slice(&b)?))
            {
                Ok(hello) => hello,
                Err(e) => {
                    pf_warn!("bad gms hello from '{}': {}", addr, e);
                    continue;
                }
            };

            match hello {
                GmsHello::Join { contact } => {
                    pf_info!(
                        "join request from '{}' (contact '{}')",
                        addr,
                        contact
                    );
                    inner
                        .pending_joins
                        .lock()
                        .unwrap()
                        .push_back(PendingJoin { stream, contact });
                }
                GmsHello::FetchState { subgroup } => {
                    let subgroup = subgroup as SubgroupId;
                    match inner.registry.object(subgroup) {
                        Some(object) => match object.send_state() {
                            Ok(bytes) => {
                                if let Err(e) =
                                    write_framed(&mut stream, &bytes).await
                                {
                                    pf_warn!(
                                        "error sending subgroup {} state: {}",
                                        subgroup,
                                        e
                                    );
                                }
                            }
                            Err(e) => {
                                pf_error!(
                                    "error serializing subgroup {} state: {}",
                                    subgroup,
                                    e
                                );
                            }
                        },
                        None => {
                            pf_warn!(
                                "no object to serve for subgroup {}",
                                subgroup
                            );
                        }
                    }
                }
            }
        }
        pf_debug!("gms listener task exited");
    }

    /// Applies heartbeat-completion failures (and explicit reports) as
    /// sticky suspicions in the current table.
    async fn failure_watcher_task(
        inner: Arc<VmInner>,
        mut rx_failure: mpsc::UnboundedReceiver<(i32, usize)>,
    ) {
        pf_debug!("failure watcher task spawned");
        while let Some((vid, rank)) = rx_failure.recv().await {
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            let sst = {
                let runtime = inner.runtime.lock().unwrap();
                let Some(runtime) = runtime.as_ref() else {
                    continue;
                };
                if runtime.sst.vid() != vid {
                    continue; // stale report from a superseded view
                }
                runtime.sst.clone()
            };
            if rank >= sst.num_rows() {
                continue;
            }
            sst.set_suspected(rank, true);
            let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
            let layout = sst.layout().clone();
            sst.put(&all_rows, layout.suspected_all());
            sst.nudge();
        }
        pf_debug!("failure watcher task exited");
    }

    /// Worker running the committed tail of the view-change protocol.
    async fn view_change_worker_task(
        inner: Arc<VmInner>,
        mut rx_view_event: mpsc::UnboundedReceiver<()>,
    ) {
        pf_debug!("view change worker task spawned");
        while rx_view_event.recv().await.is_some() {
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = Self::execute_view_change(&inner).await {
                pf_error!("view change failed: {}", e);
            }
            inner
                .change_in_progress
                .store(false, Ordering::Release);
        }
        pf_debug!("view change worker task exited");
    }

    /// Runs ragged-edge cleanup, constructs and installs the next view,
    /// and rebuilds the engine instances under it.
    async fn execute_view_change(
        inner: &Arc<VmInner>,
    ) -> Result<(), ShardcastError> {
        let old_view = inner.curr_view.read().unwrap().clone();
        let Some(mut runtime) = inner.runtime.lock().unwrap().take()
        else {
            return logged_err!("view change with no active runtime");
        };
        let sst = runtime.sst.clone();
        let me = sst.my_rank();
        let snap = sst.snapshot();
        let Some(leader_row) = old_view.leader_rank() else {
            *inner.runtime.lock().unwrap() = Some(runtime);
            return logged_err!("view change with every member failed");
        };

        // read the committed changes from this node's acked copy
        let n_committed = snap.n_committed(leader_row);
        let count =
            (n_committed.max(0) as usize).min(inner.config.change_capacity);
        let mut departed: Vec<NodeId> = Vec::new();
        let mut joins: Vec<(NodeId, String)> = Vec::new();
        for idx in 0..count {
            let node = snap.change(me, idx);
            if old_view.members.contains(&node) {
                departed.push(node);
            } else if snap.joiner_id(me, idx) == node {
                joins.push((node, snap.joiner_contact(me, idx)));
            } else {
                pf_warn!("committed change {} matches no member or joiner", node);
            }
        }
        if departed.is_empty() && joins.is_empty() {
            *inner.runtime.lock().unwrap() = Some(runtime);
            return logged_err!("committed view change carries no changes");
        }
        pf_info!(
            "executing view change: {} departures, {} joins",
            departed.len(),
            joins.len()
        );

        // 1. wedge the old group: no new sends, receipts, or deliveries
        runtime.mcast.as_ref().unwrap().wedge();

        // 2. ragged-edge cleanup over every ordered subgroup we belong to
        Self::ragged_edge_cleanup(inner, &runtime, &old_view).await;

        // 3. drain delivered-but-unpersisted messages through the writer
        let drain_deadline = time::Instant::now() + Duration::from_secs(5);
        while !runtime.mcast.as_ref().unwrap().pending_persistence_empty()
        {
            if time::Instant::now() > drain_deadline {
                pf_error!("timed out draining the persistence queue");
                break;
            }
            time::sleep(Duration::from_millis(2)).await;
        }

        // 4. construct the next view
        let mut members = Vec::new();
        let mut member_ips = Vec::new();
        for rank in 0..old_view.num_members() {
            if departed.contains(&old_view.members[rank]) {
                continue;
            }
            members.push(old_view.members[rank]);
            member_ips.push(old_view.member_ips[rank].clone());
        }
        let joined: Vec<NodeId> = joins.iter().map(|(id, _)| *id).collect();
        for (id, contact) in &joins {
            members.push(*id);
            member_ips.push(contact.clone());
        }
        let Some(my_rank) = members.iter().position(|&m| m == inner.my_id)
        else {
            pf_warn!("this node left view {}; shutting down", old_view.vid);
            inner.shutdown.store(true, Ordering::Release);
            runtime.bulk.stop();
            runtime.sst.stop();
            return Ok(());
        };
        let num_new_members = members.len();
        let next_view = Arc::new(View {
            vid: old_view.vid + 1,
            members,
            member_ips,
            failed: vec![false; num_new_members],
            num_failed: 0,
            joined,
            departed: departed.clone(),
            my_rank: my_rank as i32,
        });

        // 5. the leader commits joiners before rebuilding, so they can
        //    take part in the next view's table bring-up
        let committed_joins: Vec<ProposedJoin> = {
            let mut proposed = inner.proposed_joins.lock().unwrap();
            let (committed, kept): (Vec<_>, Vec<_>) = proposed
                .drain(..)
                .partition(|pj| next_view.members.contains(&pj.id));
            // uncommitted proposals go back for the next round
            let mut pending = inner.pending_joins.lock().unwrap();
            for pj in kept {
                pending.push_back(PendingJoin {
                    stream: pj.stream,
                    contact: pj.contact,
                });
            }
            committed
        };
        if old_view.i_am_leader() {
            for pj in committed_joins {
                if let Err(e) = Self::commit_join(
                    inner, pj, &next_view, &old_view, &runtime.maps,
                )
                .await
                {
                    pf_error!("error committing joiner: {}", e);
                }
            }
        }

        // 6. record Installed on the outgoing table, then tear down its
        //    links and rebuild under the new view
        sst.set_n_installed(n_committed);
        let all_rows: Vec<usize> = (0..sst.num_rows()).collect();
        sst.put(&all_rows, sst.layout().n_installed());
        runtime.bulk.stop();
        runtime.sst.stop();
        let old_mcast = runtime.mcast.take().unwrap();
        let new_runtime =
            Self::build_runtime(inner, &next_view, None, Some(old_mcast))
                .await?;
        Self::register_view_predicates(inner, &new_runtime.sst);
        Self::ensure_objects(inner, &new_runtime.maps);

        // 7. install (vid-gated: re-installing an old view is a no-op)
        {
            let mut view_guard = inner.curr_view.write().unwrap();
            if next_view.vid <= view_guard.vid {
                pf_warn!(
                    "ignoring install of stale view {} (current {})",
                    next_view.vid,
                    view_guard.vid
                );
            } else {
                *view_guard = next_view.clone();
            }
        }
        *inner.last_suspected.lock().unwrap() =
            Bitmap::new(next_view.num_members(), false);
        let max_member =
            next_view.members.iter().copied().max().unwrap_or(0);
        inner
            .next_node_id
            .fetch_max(max_member + 1, Ordering::AcqRel);
        *inner.runtime.lock().unwrap() = Some(new_runtime);

        if !inner.config.view_path.is_empty() {
            if let Err(e) =
                persist_view(&next_view, &inner.config.view_path)
            {
                pf_warn!("error persisting view file: {}", e);
            }
        }

        pf_info!(
            "installed view {} with {} members",
            next_view.vid,
            next_view.num_members()
        );
        for upcall in inner.view_upcalls.lock().unwrap().iter() {
            upcall(&next_view);
        }
        Ok(())
    }

    /// Computes (or learns) the per-sender agreement frontier of every
    /// ordered subgroup this node belongs to and delivers up to it.
    async fn ragged_edge_cleanup(
        inner: &Arc<VmInner>,
        runtime: &ViewRuntime,
        old_view: &Arc<View>,
    ) {
        let sst = &runtime.sst;
        let mcast = runtime.mcast.as_ref().unwrap();
        let layout = sst.layout().clone();

        let mut subgroup_ids: Vec<SubgroupId> =
            runtime.maps.settings.keys().copied().collect();
        subgroup_ids.sort_unstable();

        for subgroup in subgroup_ids {
            let settings = &runtime.maps.settings[&subgroup];
            if settings.my_shard_rank.is_none()
                || settings.mode != Mode::Ordered
            {
                continue;
            }
            let ns = settings.num_senders();
            let off = settings.num_received_offset;
            let shard_rows: Vec<usize> = settings
                .members
                .iter()
                .map(|&node| old_view.rank_of(node).unwrap())
                .collect();

            // the shard leader is its lowest-ranked live member
            let live_view = inner.curr_view.read().unwrap().clone();
            let leader_shard_row = shard_rows
                .iter()
                .copied()
                .find(|&row| !live_view.failed[row]);
            let Some(leader_row) = leader_shard_row else {
                pf_error!(
                    "every member of subgroup {} shard failed",
                    subgroup
                );
                continue;
            };

            let mins: Vec<i64> = if leader_row == sst.my_rank() {
                // leader role: compute and publish the frontier
                let mins: Vec<i64> = (0..ns)
                    .map(|sender| {
                        shard_rows
                            .iter()
                            .filter(|&&row| !live_view.failed[row])
                            .map(|&row| sst.num_received(row, off + sender))
                            .min()
                            .unwrap_or(-1)
                    })
                    .collect();
                for (sender, &min) in mins.iter().enumerate() {
                    sst.set_global_min(off + sender, min);
                }
                sst.set_global_min_ready(subgroup, true);
                sst.put(&shard_rows, layout.global_min_cols(off, ns));
                sst.put(&shard_rows, layout.global_min_ready(subgroup));
                pf_debug!(
                    "leading ragged-edge cleanup of subgroup {}: {:?}",
                    subgroup,
                    mins
                );
                mins
            } else {
                // follower role: wait for the leader's frontier
                let mut mins = None;
                let deadline =
                    time::Instant::now() + Duration::from_secs(2);
                while time::Instant::now() < deadline {
                    let snap = sst.snapshot();
                    if snap.global_min_ready(leader_row, subgroup) {
                        mins = Some(
                            (0..ns)
                                .map(|sender| {
                                    snap.global_min(
                                        leader_row,
                                        off + sender,
                                    )
                                })
                                .collect::<Vec<i64>>(),
                        );
                        break;
                    }
                    time::sleep(Duration::from_millis(2)).await;
                }
                match mins {
                    Some(mins) => mins,
                    None => {
                        // leader presumed gone; fall back to computing the
                        // frontier from the live rows ourselves
                        pf_warn!(
                            "shard leader silent during cleanup of \
                             subgroup {}; computing frontier locally",
                            subgroup
                        );
                        (0..ns)
                            .map(|sender| {
                                shard_rows
                                    .iter()
                                    .filter(|&&row| !live_view.failed[row])
                                    .map(|&row| {
                                        sst.num_received(row, off + sender)
                                    })
                                    .min()
                                    .unwrap_or(-1)
                            })
                            .collect()
                    }
                }
            };

            mcast.deliver_messages_upto(&mins, subgroup);
        }
    }

    /// Sends a committed joiner everything it needs over its buffered
    /// socket: the assigned id, the next view, the group parameters, and
    /// the shard leaders to fetch object state from.
    async fn commit_join(
        inner: &Arc<VmInner>,
        mut pj: ProposedJoin,
        next_view: &Arc<View>,
        old_view: &Arc<View>,
        old_maps: &SubgroupMaps,
    ) -> Result<(), ShardcastError> {
        pj.stream.write_u32(pj.id).await?;

        let mut view_for_joiner = (**next_view).clone();
        view_for_joiner.my_rank =
            next_view.rank_of(pj.id).unwrap() as i32;
        write_framed(&mut pj.stream, &view_for_joiner.encode()).await?;

        write_framed(
            &mut pj.stream,
            &rmp_serde::encode::to_vec(&inner.config)?,
        )
        .await?;

        // shard leaders (lowest live old-view member) per subgroup the
        // joiner newly belongs to
        let specs = (inner.subgroup_info)(next_view)?;
        let mut shard_leaders: Vec<(u64, NodeId)> = Vec::new();
        for (subgroup, spec) in specs.iter().enumerate() {
            if !spec.members.contains(&pj.id) {
                continue;
            }
            let Some(old_settings) = old_maps.settings.get(&subgroup)
            else {
                continue;
            };
            let leader = old_settings.members.iter().copied().find(|&m| {
                old_view
                    .rank_of(m)
                    .map(|rank| !old_view.failed[rank])
                    .unwrap_or(false)
            });
            if let Some(leader) = leader {
                shard_leaders.push((subgroup as u64, leader));
            }
        }
        write_framed(
            &mut pj.stream,
            &rmp_serde::encode::to_vec(&shard_leaders)?,
        )
        .await?;

        pf_info!("committed joiner {} into view {}", pj.id, next_view.vid);
        Ok(())
    }

    /// Joiner-side fetch of one subgroup's object state from its shard
    /// leader.
    async fn fetch_subgroup_state(
        view: &Arc<View>,
        tags: &[String],
        registry: &Arc<StateRegistry>,
        subgroup: SubgroupId,
        leader_id: NodeId,
    ) -> Result<(), ShardcastError> {
        let Some(leader_rank) = view.rank_of(leader_id) else {
            return logged_err!(
                "shard leader {} not in view {}",
                leader_id,
                view.vid
            );
        };
        let contact = view.contact(leader_rank)?;
        let mut stream =
            tcp_connect_with_retry(contact.gms_addr()?, 10).await?;
        write_framed(
            &mut stream,
            &rmp_serde::encode::to_vec(&GmsHello::FetchState {
                subgroup: subgroup as u64,
            })?,
        )
        .await?;
        let state_bytes = read_framed(&mut stream).await?;

        let tag = tags.get(subgroup).ok_or_else(|| {
            ShardcastError(format!("no tag for subgroup {}", subgroup))
        })?;
        let object = registry.ensure_object(subgroup, tag)?;
        object.receive_state(&state_bytes)?;
        pf_info!(
            "received {} state bytes for subgroup {} from node {}",
            state_bytes.len(),
            subgroup,
            leader_id
        );
        Ok(())
    }

    // ---- public surface used by Group ----

    pub(crate) fn curr_view(&self) -> Arc<View> {
        self.inner.curr_view.read().unwrap().clone()
    }

    pub(crate) fn get_sendbuffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        medium: Medium,
        pause_sending_turns: u32,
        cooked_send: bool,
        null_send: bool,
    ) -> Option<SendBuffer> {
        let runtime = self.inner.runtime.lock().unwrap();
        runtime.as_ref()?.mcast.as_ref()?.get_sendbuffer(
            subgroup,
            payload_size,
            medium,
            pause_sending_turns,
            cooked_send,
            null_send,
        )
    }

    pub(crate) fn send(&self, buffer: SendBuffer) -> bool {
        let runtime = self.inner.runtime.lock().unwrap();
        match runtime.as_ref().and_then(|rt| rt.mcast.as_ref()) {
            Some(mcast) => mcast.send(buffer),
            None => false,
        }
    }

    pub(crate) fn stability_frontier(
        &self,
        subgroup: SubgroupId,
    ) -> Option<i64> {
        let runtime = self.inner.runtime.lock().unwrap();
        Some(
            runtime
                .as_ref()?
                .mcast
                .as_ref()?
                .stability_frontier(subgroup),
        )
    }

    /// Reports a node as failed, as if its heartbeat had failed.
    pub(crate) fn report_failure(&self, node: NodeId) {
        let view = self.curr_view();
        let Some(rank) = view.rank_of(node) else {
            pf_warn!("cannot report unknown node {} as failed", node);
            return;
        };
        let vid = {
            let runtime = self.inner.runtime.lock().unwrap();
            match runtime.as_ref() {
                Some(runtime) => runtime.sst.vid(),
                None => return,
            }
        };
        let _ = self.inner.tx_failure.send((vid, rank));
    }

    /// Cleanly leaves the group by reporting this node itself as failed.
    pub(crate) fn leave(&self) {
        pf_info!(
            "node {} ('{}') leaving by self-reporting failure",
            self.inner.my_id,
            self.inner.my_contact
        );
        self.report_failure(self.inner.my_id);
    }

    pub(crate) fn add_view_upcall(&self, upcall: ViewUpcall) {
        self.inner.view_upcalls.lock().unwrap().push(upcall);
    }

    pub(crate) fn my_id(&self) -> NodeId {
        self.inner.my_id
    }

    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let mut runtime = self.inner.runtime.lock().unwrap();
        if let Some(runtime) = runtime.as_mut() {
            if let Some(mcast) = runtime.mcast.as_ref() {
                mcast.wedge();
            }
            runtime.bulk.stop();
            runtime.sst.stop();
        }
        self._listener_handle.abort();
        self._failure_handle.abort();
        self._worker_handle.abort();
    }
}

impl Drop for ViewManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes one length-prefixed frame on a GMS socket.
async fn write_framed(
    stream: &mut TcpStream,
    bytes: &[u8],
) -> Result<(), ShardcastError> {
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

/// Reads one length-prefixed frame from a GMS socket.
async fn read_framed(
    stream: &mut TcpStream,
) -> Result<Vec<u8>, ShardcastError> {
    let len = stream.read_u64().await? as usize;
    if len > 64 * 1024 * 1024 {
        return Err(ShardcastError(format!(
            "unreasonable gms frame of {} bytes",
            len
        )));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}
