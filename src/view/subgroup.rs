//! Subgroup layout policy and the replicated-object state registry.
//!
//! A `SubgroupInfo` policy derives, for a given view, one shard per
//! subgroup id: its ordered membership, sender set, delivery mode, and the
//! stable string tag of the replicated type it carries. Logical objects
//! sharded more than one way appear as several subgroup ids sharing a tag.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::multicast::{Mode, NodeId, SubgroupId, SubgroupSettings};
use crate::utils::{Bitmap, ShardcastError};
use crate::view::View;

/// One subgroup's shard layout as reported by the user policy.
#[derive(Debug, Clone)]
pub struct SubgroupSpec {
    /// Stable tag of the replicated-type factory backing this subgroup.
    pub tag: String,

    /// Delivery discipline; pinned once the subgroup first appears.
    pub mode: Mode,

    /// Shard members in rank order.
    pub members: Vec<NodeId>,

    /// Which shard ranks send; parallel to `members`.
    pub senders: Vec<bool>,
}

/// User policy deriving subgroup layouts from a view.
pub type SubgroupInfo =
    Arc<dyn Fn(&View) -> Result<Vec<SubgroupSpec>, ShardcastError> + Send + Sync>;

/// Everything the engine derives from the policy output for one view.
pub(crate) struct SubgroupMaps {
    /// Per-subgroup settings, covering every subgroup id.
    pub settings: HashMap<SubgroupId, SubgroupSettings>,

    /// Sum of shard senders across subgroups (the `num_received` width).
    pub total_senders: usize,

    /// Subgroup id -> replicated-type tag.
    pub tags: Vec<String>,
}

/// Validates policy output against a view and computes the engine's
/// per-subgroup maps, including each subgroup's `num_received` column
/// offset.
pub(crate) fn make_subgroup_maps(
    view: &View,
    specs: &[SubgroupSpec],
    my_id: NodeId,
) -> Result<SubgroupMaps, ShardcastError> {
    let mut settings = HashMap::new();
    let mut tags = Vec::new();
    let mut seen_tags = HashSet::new();
    let mut num_received_offset = 0;

    for (subgroup, spec) in specs.iter().enumerate() {
        if spec.members.is_empty() {
            return logged_err!("subgroup {} has no members", subgroup);
        }
        if spec.members.len() != spec.senders.len() {
            return logged_err!(
                "subgroup {} sender set not parallel to members",
                subgroup
            );
        }
        if !spec.senders.iter().any(|&s| s) {
            return logged_err!("subgroup {} has no senders", subgroup);
        }
        for &member in &spec.members {
            if view.rank_of(member).is_none() {
                return logged_err!(
                    "subgroup {} member {} not in view {}",
                    subgroup,
                    member,
                    view.vid
                );
            }
        }
        if !seen_tags.insert(spec.tag.clone()) {
            return logged_err!(
                "duplicate subgroup tag '{}'; shard a tag by listing one \
                 subgroup per shard",
                spec.tag
            );
        }

        let my_shard_rank = spec.members.iter().position(|&m| m == my_id);
        let my_sender_rank = my_shard_rank.and_then(|shard_rank| {
            if !spec.senders[shard_rank] {
                return None;
            }
            Some(
                spec.senders[..shard_rank]
                    .iter()
                    .filter(|&&s| s)
                    .count(),
            )
        });

        let mut senders = Bitmap::new(spec.members.len(), false);
        for (rank, &is_sender) in spec.senders.iter().enumerate() {
            senders.set(rank, is_sender)?;
        }
        let num_senders = senders.count();

        settings.insert(
            subgroup,
            SubgroupSettings {
                members: spec.members.clone(),
                senders,
                my_shard_rank,
                my_sender_rank,
                num_received_offset,
                mode: spec.mode,
            },
        );
        tags.push(spec.tag.clone());
        num_received_offset += num_senders;
    }

    Ok(SubgroupMaps {
        settings,
        total_senders: num_received_offset,
        tags,
    })
}

/// Capability interface of one replicated object: byte-level state
/// transfer for joiners plus dispatch of cooked (RPC-path) payloads.
pub trait StateCapability: Send + Sync {
    /// Serializes the current object state for a joining shard member.
    fn send_state(&self) -> Result<Vec<u8>, ShardcastError>;

    /// Replaces the object state with bytes from a shard leader.
    fn receive_state(&self, bytes: &[u8]) -> Result<(), ShardcastError>;

    /// Applies one delivered cooked payload.
    fn apply_rpc(&self, sender: NodeId, payload: &[u8]);
}

/// Factory constructing a fresh replicated object for its tag.
pub type StateFactory = Arc<dyn Fn() -> Arc<dyn StateCapability> + Send + Sync>;

/// Tagged-variant registry of replicated-type factories and the live
/// objects built from them, keyed by subgroup id.
pub struct StateRegistry {
    factories: Mutex<HashMap<String, StateFactory>>,
    objects: Mutex<HashMap<SubgroupId, Arc<dyn StateCapability>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        StateRegistry {
            factories: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the factory for a tag; replaces any previous one.
    pub fn register_factory(&self, tag: impl Into<String>, factory: StateFactory) {
        self.factories.lock().unwrap().insert(tag.into(), factory);
    }

    /// The live object for a subgroup, if constructed.
    pub fn object(
        &self,
        subgroup: SubgroupId,
    ) -> Option<Arc<dyn StateCapability>> {
        self.objects.lock().unwrap().get(&subgroup).cloned()
    }

    /// Returns the subgroup's object, constructing it from the tag's
    /// factory on first use.
    pub(crate) fn ensure_object(
        &self,
        subgroup: SubgroupId,
        tag: &str,
    ) -> Result<Arc<dyn StateCapability>, ShardcastError> {
        if let Some(object) = self.object(subgroup) {
            return Ok(object);
        }
        let factory = self
            .factories
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| {
                ShardcastError(format!(
                    "no factory registered for tag '{}'",
                    tag
                ))
            })?;
        let object = factory();
        self.objects
            .lock()
            .unwrap()
            .insert(subgroup, object.clone());
        Ok(object)
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod subgroup_tests {
    use super::*;

    fn three_node_view() -> View {
        View::new(
            0,
            vec![0, 1, 2],
            vec![
                "127.0.0.1:1:2:3".into(),
                "127.0.0.1:4:5:6".into(),
                "127.0.0.1:7:8:9".into(),
            ],
            0,
        )
    }

    #[test]
    fn maps_assign_offsets_and_ranks() {
        let view = three_node_view();
        let specs = vec![
            SubgroupSpec {
                tag: "kv".into(),
                mode: Mode::Ordered,
                members: vec![0, 1, 2],
                senders: vec![true, true, true],
            },
            SubgroupSpec {
                tag: "log".into(),
                mode: Mode::Raw,
                members: vec![1, 2],
                senders: vec![false, true],
            },
        ];

        let maps = make_subgroup_maps(&view, &specs, 2).unwrap();
        assert_eq!(maps.total_senders, 4);
        assert_eq!(maps.tags, vec!["kv".to_string(), "log".to_string()]);

        let kv = &maps.settings[&0];
        assert_eq!(kv.num_received_offset, 0);
        assert_eq!(kv.my_shard_rank, Some(2));
        assert_eq!(kv.my_sender_rank, Some(2));

        let log = &maps.settings[&1];
        assert_eq!(log.num_received_offset, 3);
        assert_eq!(log.my_shard_rank, Some(1));
        assert_eq!(log.my_sender_rank, Some(0));
        assert_eq!(log.num_senders(), 1);
    }

    #[test]
    fn maps_for_non_member() {
        let view = three_node_view();
        let specs = vec![SubgroupSpec {
            tag: "kv".into(),
            mode: Mode::Ordered,
            members: vec![0, 1],
            senders: vec![true, false],
        }];
        let maps = make_subgroup_maps(&view, &specs, 2).unwrap();
        let kv = &maps.settings[&0];
        assert_eq!(kv.my_shard_rank, None);
        assert_eq!(kv.my_sender_rank, None);
        // rank 1 is a member but not a sender
        let maps = make_subgroup_maps(&view, &specs, 1).unwrap();
        assert_eq!(maps.settings[&0].my_shard_rank, Some(1));
        assert_eq!(maps.settings[&0].my_sender_rank, None);
    }

    #[test]
    fn maps_reject_bad_specs() {
        let view = three_node_view();
        let no_senders = vec![SubgroupSpec {
            tag: "kv".into(),
            mode: Mode::Ordered,
            members: vec![0, 1],
            senders: vec![false, false],
        }];
        assert!(make_subgroup_maps(&view, &no_senders, 0).is_err());

        let stranger = vec![SubgroupSpec {
            tag: "kv".into(),
            mode: Mode::Ordered,
            members: vec![0, 9],
            senders: vec![true, true],
        }];
        assert!(make_subgroup_maps(&view, &stranger, 0).is_err());

        let dup_tag = vec![
            SubgroupSpec {
                tag: "kv".into(),
                mode: Mode::Ordered,
                members: vec![0],
                senders: vec![true],
            },
            SubgroupSpec {
                tag: "kv".into(),
                mode: Mode::Ordered,
                members: vec![1],
                senders: vec![true],
            },
        ];
        assert!(make_subgroup_maps(&view, &dup_tag, 0).is_err());
    }

    #[test]
    fn registry_builds_objects_by_tag() {
        struct Dummy;
        impl StateCapability for Dummy {
            fn send_state(&self) -> Result<Vec<u8>, ShardcastError> {
                Ok(vec![7])
            }
            fn receive_state(
                &self,
                _bytes: &[u8],
            ) -> Result<(), ShardcastError> {
                Ok(())
            }
            fn apply_rpc(&self, _sender: NodeId, _payload: &[u8]) {}
        }

        let registry = StateRegistry::new();
        assert!(registry.ensure_object(0, "kv").is_err());
        registry.register_factory(
            "kv",
            Arc::new(|| Arc::new(Dummy) as Arc<dyn StateCapability>),
        );
        let object = registry.ensure_object(0, "kv").unwrap();
        assert_eq!(object.send_state().unwrap(), vec![7]);
        assert!(registry.object(0).is_some());
        assert!(registry.object(1).is_none());
    }
}
