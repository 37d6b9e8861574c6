//! Top-level group handle: owns the view manager (which owns the current
//! multicast group) and exposes the public send/deliver surface.

use std::sync::Arc;

use crate::multicast::{
    DeliveryCallbacks, Medium, NodeId, SendBuffer, SubgroupId,
};
use crate::utils::ShardcastError;
use crate::view::{
    load_view, StateRegistry, SubgroupInfo, View, ViewManager,
};

use serde::{Deserialize, Serialize};

/// Configuration parameters struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Largest payload (in bytes) a single message may carry.
    pub max_payload_size: usize,

    /// Number of outstanding messages a sender may have in flight.
    pub window_size: usize,

    /// Largest payload that fits the SST slot transport path.
    pub slot_payload_cap: usize,

    /// Interval of the heartbeat write used for failure detection.
    pub heartbeat_interval_ms: u64,

    /// Capacity of the pending membership-changes array.
    pub change_capacity: usize,

    /// Port of the group-management (join) service.
    pub gms_port: u16,

    /// Port of the shared-state table replication links.
    pub sst_port: u16,

    /// Port of the bulk transfer links.
    pub bulk_port: u16,

    /// Path of the delivered-message persistence log; empty disables
    /// persistence.
    pub persist_path: String,

    /// Path the installed view is mirrored to for recovery; empty disables
    /// the mirror.
    pub view_path: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            max_payload_size: 8192,
            window_size: 3,
            slot_payload_cap: 1024,
            heartbeat_interval_ms: 100,
            change_capacity: 8,
            gms_port: 12345,
            sst_port: 12346,
            bulk_port: 12348,
            persist_path: "".into(),
            view_path: "".into(),
        }
    }
}

impl GroupConfig {
    /// Composes a config from defaults overlaid with a TOML string.
    pub fn parse(
        config_str: Option<&str>,
    ) -> Result<Self, ShardcastError> {
        let config = parsed_config!(config_str => GroupConfig;
                                    max_payload_size, window_size,
                                    slot_payload_cap, heartbeat_interval_ms,
                                    change_capacity, gms_port, sst_port,
                                    bulk_port, persist_path, view_path)?;
        config.sanitize()?;
        Ok(config)
    }

    fn sanitize(&self) -> Result<(), ShardcastError> {
        if self.window_size == 0 {
            return logged_err!("invalid config.window_size 0");
        }
        if self.max_payload_size == 0 {
            return logged_err!("invalid config.max_payload_size 0");
        }
        if self.slot_payload_cap > self.max_payload_size {
            return logged_err!(
                "config.slot_payload_cap {} exceeds max_payload_size {}",
                self.slot_payload_cap,
                self.max_payload_size
            );
        }
        if self.heartbeat_interval_ms == 0 {
            return logged_err!("invalid config.heartbeat_interval_ms 0");
        }
        if self.change_capacity == 0 {
            return logged_err!("invalid config.change_capacity 0");
        }
        if self.gms_port == self.sst_port
            || self.gms_port == self.bulk_port
            || self.sst_port == self.bulk_port
        {
            return logged_err!(
                "gms/sst/bulk ports must be distinct, got {}/{}/{}",
                self.gms_port,
                self.sst_port,
                self.bulk_port
            );
        }
        Ok(())
    }

    /// This node's contact string for the given IP.
    pub fn my_contact(&self, ip: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            ip, self.gms_port, self.sst_port, self.bulk_port
        )
    }

    /// Group-wide engine parameters are taken from the leader; per-node
    /// settings (ports, file paths) stay local.
    pub(crate) fn merged_with_leader(
        &self,
        leader: &GroupConfig,
    ) -> GroupConfig {
        GroupConfig {
            max_payload_size: leader.max_payload_size,
            window_size: leader.window_size,
            slot_payload_cap: leader.slot_payload_cap,
            heartbeat_interval_ms: leader.heartbeat_interval_ms,
            change_capacity: leader.change_capacity,
            ..self.clone()
        }
    }
}

/// User callbacks for delivery events; unset entries become no-ops.
#[derive(Default, Clone)]
pub struct CallbackSet {
    /// Fired for every delivered raw payload, in global order.
    pub global_stability:
        Option<Arc<dyn Fn(SubgroupId, NodeId, i64, &[u8]) + Send + Sync>>,

    /// Fired once a delivered payload has been made durable.
    pub local_persistence:
        Option<Arc<dyn Fn(SubgroupId, NodeId, i64, &[u8]) + Send + Sync>>,
}

/// Per-send knobs of `get_sendbuffer`.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Transport path for this message.
    pub medium: Medium,

    /// Sequence slots this sender reserves but will not fill.
    pub pause_sending_turns: u32,

    /// Route the payload to the replicated object's RPC dispatch instead
    /// of the raw-delivery callback.
    pub cooked_send: bool,

    /// Header-only message: consumes a sequence slot without a payload.
    pub null_send: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            medium: Medium::Bulk,
            pause_sending_turns: 0,
            cooked_send: false,
            null_send: false,
        }
    }
}

fn build_delivery_callbacks(
    callbacks: CallbackSet,
    registry: &Arc<StateRegistry>,
) -> DeliveryCallbacks {
    let global_stability = callbacks
        .global_stability
        .unwrap_or_else(|| Arc::new(|_, _, _, _| {}));
    let local_persistence = callbacks
        .local_persistence
        .unwrap_or_else(|| Arc::new(|_, _, _, _| {}));
    let registry = registry.clone();
    let rpc = Arc::new(
        move |subgroup: SubgroupId, sender: NodeId, payload: &[u8]| {
            match registry.object(subgroup) {
                Some(object) => object.apply_rpc(sender, payload),
                None => pf_warn!(
                    "cooked payload for subgroup {} with no object",
                    subgroup
                ),
            }
        },
    );
    DeliveryCallbacks {
        global_stability,
        rpc,
        local_persistence,
    }
}

/// The top-level object of a shardcast participant.
pub struct Group {
    vm: ViewManager,
    registry: Arc<StateRegistry>,
}

impl Group {
    /// Starts a new group with this node as its only member and leader.
    pub async fn new_leader(
        my_id: NodeId,
        my_ip: &str,
        config_str: Option<&str>,
        subgroup_info: SubgroupInfo,
        callbacks: CallbackSet,
        registry: Arc<StateRegistry>,
    ) -> Result<Self, ShardcastError> {
        let config = GroupConfig::parse(config_str)?;
        let contact = config.my_contact(my_ip);
        let delivery = build_delivery_callbacks(callbacks, &registry);
        let vm = ViewManager::start_fresh(
            my_id,
            vec![(my_id, contact)],
            config,
            subgroup_info,
            registry.clone(),
            delivery,
        )
        .await?;
        Ok(Group { vm, registry })
    }

    /// Starts with a pre-agreed initial membership; every listed member
    /// runs this with the same member list (contacts are
    /// `ip:gms:sst:bulk` strings).
    pub async fn new_static(
        my_id: NodeId,
        members: Vec<(NodeId, String)>,
        config_str: Option<&str>,
        subgroup_info: SubgroupInfo,
        callbacks: CallbackSet,
        registry: Arc<StateRegistry>,
    ) -> Result<Self, ShardcastError> {
        let config = GroupConfig::parse(config_str)?;
        let delivery = build_delivery_callbacks(callbacks, &registry);
        let vm = ViewManager::start_fresh(
            my_id,
            members,
            config,
            subgroup_info,
            registry.clone(),
            delivery,
        )
        .await?;
        Ok(Group { vm, registry })
    }

    /// Joins an existing group through its leader; the node id is assigned
    /// by the leader.
    pub async fn join(
        my_ip: &str,
        leader_contact: &str,
        config_str: Option<&str>,
        subgroup_info: SubgroupInfo,
        callbacks: CallbackSet,
        registry: Arc<StateRegistry>,
    ) -> Result<Self, ShardcastError> {
        let config = GroupConfig::parse(config_str)?;
        let contact = config.my_contact(my_ip);
        let delivery = build_delivery_callbacks(callbacks, &registry);
        let (vm, _my_id) = ViewManager::start_join(
            contact,
            leader_contact,
            config,
            subgroup_info,
            registry.clone(),
            delivery,
        )
        .await?;
        Ok(Group { vm, registry })
    }

    /// Recovers from a persisted view file by rejoining the group through
    /// the lowest-ranked member recorded as live in it.
    pub async fn recover(
        view_file: &str,
        my_ip: &str,
        config_str: Option<&str>,
        subgroup_info: SubgroupInfo,
        callbacks: CallbackSet,
        registry: Arc<StateRegistry>,
    ) -> Result<Self, ShardcastError> {
        let view = load_view(view_file)?;
        let Some(leader_rank) = view.leader_rank() else {
            return logged_err!(
                "view file '{}' records no live members",
                view_file
            );
        };
        let leader_contact = view.member_ips[leader_rank].clone();
        Self::join(
            my_ip,
            &leader_contact,
            config_str,
            subgroup_info,
            callbacks,
            registry,
        )
        .await
    }

    /// Returns a writable buffer of exactly `payload_size` bytes for the
    /// next message in a subgroup, or `None` if there is no capacity or
    /// the group is wedged.
    pub fn get_sendbuffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        opts: SendOptions,
    ) -> Option<SendBuffer> {
        self.vm.get_sendbuffer(
            subgroup,
            payload_size,
            opts.medium,
            opts.pause_sending_turns,
            opts.cooked_send,
            opts.null_send,
        )
    }

    /// Commits a prepared buffer for sending. Returns false if the group
    /// has wedged.
    pub fn send(&self, buffer: SendBuffer) -> bool {
        self.vm.send(buffer)
    }

    /// Nodes that are currently members of the group.
    pub fn members(&self) -> Vec<NodeId> {
        self.vm.curr_view().members.clone()
    }

    /// A copy of the current view.
    pub fn current_view(&self) -> View {
        (*self.vm.curr_view()).clone()
    }

    /// This node's id (assigned by the leader when joining).
    pub fn node_id(&self) -> NodeId {
        self.vm.my_id()
    }

    /// Min of the shard's published stability frontiers for a subgroup.
    pub fn stability_frontier(&self, subgroup: SubgroupId) -> Option<i64> {
        self.vm.stability_frontier(subgroup)
    }

    /// Reports a node as failed to the membership service.
    pub fn report_failure(&self, node: NodeId) {
        self.vm.report_failure(node);
    }

    /// Cleanly leaves the group by reporting this node itself as failed.
    pub fn leave(&self) {
        self.vm.leave();
    }

    /// Adds a function called with every newly installed view.
    pub fn add_view_upcall<F>(&self, upcall: F)
    where
        F: Fn(&View) + Send + Sync + 'static,
    {
        self.vm.add_view_upcall(Box::new(upcall));
    }

    /// The replicated-object registry backing this group.
    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    /// Tears the whole participant down.
    pub fn shutdown(&self) {
        self.vm.shutdown();
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;
    use crate::view::{StateCapability, SubgroupSpec};
    use crate::Mode;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::{self, Duration};

    /// Trivial replicated object: remembers the bytes it was handed.
    struct Blob(Mutex<Vec<u8>>);

    impl StateCapability for Blob {
        fn send_state(&self) -> Result<Vec<u8>, ShardcastError> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn receive_state(&self, bytes: &[u8]) -> Result<(), ShardcastError> {
            *self.0.lock().unwrap() = bytes.to_vec();
            Ok(())
        }
        fn apply_rpc(&self, _sender: NodeId, payload: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(payload);
        }
    }

    fn everyone_sends_policy() -> SubgroupInfo {
        Arc::new(|view: &View| {
            Ok(vec![SubgroupSpec {
                tag: "blob".into(),
                mode: Mode::Ordered,
                members: view.members.clone(),
                senders: vec![true; view.num_members()],
            }])
        })
    }

    fn blob_registry() -> Arc<StateRegistry> {
        let registry = Arc::new(StateRegistry::new());
        registry.register_factory(
            "blob",
            Arc::new(|| {
                Arc::new(Blob(Mutex::new(b"genesis".to_vec())))
                    as Arc<dyn StateCapability>
            }),
        );
        registry
    }

    type Log = Arc<Mutex<Vec<(NodeId, i64, Vec<u8>)>>>;

    fn logging_callbacks() -> (CallbackSet, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let log_ref = log.clone();
        let callbacks = CallbackSet {
            global_stability: Some(Arc::new(
                move |_, sender, index, payload| {
                    log_ref.lock().unwrap().push((
                        sender,
                        index,
                        payload.to_vec(),
                    ));
                },
            )),
            local_persistence: None,
        };
        (callbacks, log)
    }

    async fn send_text(group: &Group, payload: &[u8]) {
        loop {
            if let Some(mut buffer) = group.get_sendbuffer(
                0,
                payload.len(),
                SendOptions::default(),
            ) {
                buffer.payload_mut().copy_from_slice(payload);
                assert!(group.send(buffer));
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn await_log_len(log: &Log, len: usize) {
        for _ in 0..5000 {
            if log.lock().unwrap().len() >= len {
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn join_mid_run() -> Result<(), ShardcastError> {
        let contacts = vec![
            (0u32, "127.0.0.1:33211:33212:33213".to_string()),
            (1u32, "127.0.0.1:33221:33222:33223".to_string()),
        ];
        let config = "heartbeat_interval_ms = 50";

        // node 1 in its own task
        let contacts1 = contacts.clone();
        let (tx_done, mut rx_done) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (callbacks, log) = logging_callbacks();
            let group = Group::new_static(
                1,
                contacts1,
                Some(config),
                everyone_sends_policy(),
                callbacks,
                blob_registry(),
            )
            .await?;
            send_text(&group, b"one-says-hi").await;
            // two pre-join messages, then the joiner's first message
            await_log_len(&log, 3).await;
            let log = log.lock().unwrap().clone();
            tx_done.send(log).unwrap();
            time::sleep(Duration::from_secs(2)).await;
            group.shutdown();
            Ok::<(), ShardcastError>(())
        });

        let (callbacks, log) = logging_callbacks();
        let group0 = Group::new_static(
            0,
            contacts,
            Some(config),
            everyone_sends_policy(),
            callbacks,
            blob_registry(),
        )
        .await?;
        send_text(&group0, b"zero-says-hi").await;
        await_log_len(&log, 2).await;
        assert_eq!(log.lock().unwrap().len(), 2);

        // node 2 joins through the leader
        let (join_callbacks, join_log) = logging_callbacks();
        let registry2 = blob_registry();
        let group2 = Group::join(
            "127.0.0.1",
            "127.0.0.1:33211:33212:33213",
            Some(
                "heartbeat_interval_ms = 50\ngms_port = 33231\n\
                 sst_port = 33232\nbulk_port = 33233",
            ),
            everyone_sends_policy(),
            join_callbacks,
            registry2.clone(),
        )
        .await?;

        // the leader assigned a fresh monotonic id and a sender rank
        assert_eq!(group2.node_id(), 2);
        let view = group2.current_view();
        assert_eq!(view.members, vec![0, 1, 2]);
        assert_eq!(view.joined, vec![2]);
        // replicated state arrived from the shard leader
        let blob = registry2.object(0).unwrap();
        assert_eq!(blob.send_state()?, b"genesis".to_vec());

        // the joiner's sends start at index 0 and reach everyone
        send_text(&group2, b"two-says-hi").await;
        await_log_len(&log, 3).await;
        {
            let log = log.lock().unwrap();
            assert_eq!(log[2], (2, 0, b"two-says-hi".to_vec()));
        }
        await_log_len(&join_log, 1).await;
        assert_eq!(
            join_log.lock().unwrap()[0],
            (2, 0, b"two-says-hi".to_vec())
        );

        // node 1 saw the same three messages
        let log1 = rx_done.recv().await.unwrap();
        assert_eq!(log1.len(), 3);
        assert_eq!(log1[2], (2, 0, b"two-says-hi".to_vec()));

        time::sleep(Duration::from_millis(500)).await;
        group2.shutdown();
        group0.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn failure_installs_next_view() -> Result<(), ShardcastError> {
        let contacts = vec![
            (0u32, "127.0.0.1:34211:34212:34213".to_string()),
            (1u32, "127.0.0.1:34221:34222:34223".to_string()),
            (2u32, "127.0.0.1:34231:34232:34233".to_string()),
        ];
        let config = "heartbeat_interval_ms = 50";

        let (tx_view, mut rx_view) = mpsc::unbounded_channel();
        for node_id in [1u32, 2u32] {
            let contacts = contacts.clone();
            let tx_view = tx_view.clone();
            tokio::spawn(async move {
                let (callbacks, log) = logging_callbacks();
                let group = Group::new_static(
                    node_id,
                    contacts,
                    Some(config),
                    everyone_sends_policy(),
                    callbacks,
                    blob_registry(),
                )
                .await?;
                if node_id == 1 {
                    let tx_view_ref = tx_view.clone();
                    group.add_view_upcall(move |view| {
                        let _ = tx_view_ref
                            .send((1u32, view.vid, view.members.clone()));
                    });
                }
                send_text(
                    &group,
                    format!("hello-from-{}", node_id).as_bytes(),
                )
                .await;
                await_log_len(&log, 3).await;
                if node_id == 2 {
                    // node 2 dies abruptly after everything delivered
                    group.shutdown();
                    return Ok::<(), ShardcastError>(());
                }
                // node 1 outlives the view change
                time::sleep(Duration::from_secs(8)).await;
                group.shutdown();
                Ok::<(), ShardcastError>(())
            });
        }

        let (callbacks, log) = logging_callbacks();
        let group0 = Group::new_static(
            0,
            contacts,
            Some(config),
            everyone_sends_policy(),
            callbacks,
            blob_registry(),
        )
        .await?;
        let tx_view_ref = tx_view.clone();
        group0.add_view_upcall(move |view| {
            let _ = tx_view_ref.send((0u32, view.vid, view.members.clone()));
        });
        send_text(&group0, b"hello-from-0").await;
        await_log_len(&log, 3).await;

        // node 2 stops heartbeating; survivors agree on the next view
        let mut installs = Vec::new();
        for _ in 0..2 {
            let installed = tokio::time::timeout(
                Duration::from_secs(15),
                rx_view.recv(),
            )
            .await
            .map_err(ShardcastError::msg)?
            .unwrap();
            installs.push(installed);
        }
        installs.sort();
        assert_eq!(
            installs,
            vec![(0, 1, vec![0, 1]), (1, 1, vec![0, 1])]
        );
        let view = group0.current_view();
        assert_eq!(view.vid, 1);
        assert_eq!(view.members, vec![0, 1]);
        assert_eq!(view.departed, vec![2]);
        // re-installing the same view is a no-op: vid keeps increasing or
        // stays put, never regresses
        assert!(group0.current_view().vid >= 1);

        time::sleep(Duration::from_millis(500)).await;
        group0.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn parse_defaults() -> Result<(), ShardcastError> {
        let config = GroupConfig::parse(None)?;
        assert_eq!(config.window_size, 3);
        assert_eq!(config.gms_port, 12345);
        assert!(config.persist_path.is_empty());
        Ok(())
    }

    #[test]
    fn parse_overlay() -> Result<(), ShardcastError> {
        let config = GroupConfig::parse(Some(
            "window_size = 5\npersist_path = '/tmp/shardcast.plog'",
        ))?;
        assert_eq!(config.window_size, 5);
        assert_eq!(config.persist_path, "/tmp/shardcast.plog");
        assert_eq!(config.max_payload_size, 8192);
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_values() {
        assert!(GroupConfig::parse(Some("window_size = 0")).is_err());
        assert!(GroupConfig::parse(Some("unknown_field = 1")).is_err());
        // colliding ports
        assert!(GroupConfig::parse(Some(
            "gms_port = 7000\nsst_port = 7000"
        ))
        .is_err());
    }

    #[test]
    fn merge_keeps_node_fields_local() {
        let local = GroupConfig {
            gms_port: 9000,
            sst_port: 9001,
            bulk_port: 9002,
            persist_path: "/tmp/mine.plog".into(),
            ..Default::default()
        };
        let leader = GroupConfig {
            window_size: 7,
            max_payload_size: 1 << 16,
            ..Default::default()
        };
        let merged = local.merged_with_leader(&leader);
        assert_eq!(merged.window_size, 7);
        assert_eq!(merged.max_payload_size, 1 << 16);
        assert_eq!(merged.gms_port, 9000);
        assert_eq!(merged.persist_path, "/tmp/mine.plog");
    }

    #[test]
    fn contact_string_shape() {
        let config = GroupConfig::default();
        assert_eq!(
            config.my_contact("10.0.0.1"),
            "10.0.0.1:12345:12346:12348"
        );
    }
}
