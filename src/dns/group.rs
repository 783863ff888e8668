//! Client groups and first-fit group assignment
//!
//! Clients are partitioned into groups of bounded size. Members of a group
//! answer each other's cache misses before anyone asks upstream. The manager
//! fills the oldest group with room first and opens a new group only when every
//! existing one is full; a client never changes group once assigned.
//!
//! Groups own their members. A client only remembers the id of its group, and
//! the manager turns that id back into the member list when a query needs the
//! peers, so there is no ownership cycle between the two.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use derive_more::{Display, Error};
use parking_lot::{Mutex, RwLock};

use crate::dns::client::{Client, Resolution, ResolveError};

/// Members per group
pub const GROUP_SIZE: usize = 15;

#[derive(Debug, Display, Error)]
pub enum GroupError {
    #[display(fmt = "client {} is already a member of {}", client_id, group)]
    AlreadyAssigned { client_id: String, group: GroupId },
    #[display(fmt = "a client with id {} already exists", client_id)]
    DuplicateClientId { client_id: String },
}

type Result<T> = std::result::Result<T, GroupError>;

/// Sequential group number, starting at 1 in creation order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group-{}", self.0)
    }
}

pub struct Group {
    id: GroupId,
    capacity: usize,
    members: RwLock<Vec<Arc<Client>>>,
}

impl Group {
    fn new(id: GroupId, capacity: usize) -> Group {
        Group {
            id,
            capacity,
            members: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Member list in join order. The lock is released before this returns.
    pub fn members(&self) -> Vec<Arc<Client>> {
        self.members.read().clone()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members
            .read()
            .iter()
            .map(|client| client.id().to_string())
            .collect()
    }

    /// Appends `client` if there is room. Membership add is the only mutation.
    fn try_add(&self, client: Arc<Client>) -> bool {
        let mut members = self.members.write();
        if members.len() >= self.capacity {
            return false;
        }

        members.push(client);
        true
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("members", &self.member_ids())
            .finish()
    }
}

#[derive(Default)]
struct Topology {
    groups: Vec<Arc<Group>>,
    clients: HashMap<String, Arc<Client>>,
}

/// Owns every group and the registry of clients by id
pub struct GroupManager {
    group_size: usize,
    topology: Mutex<Topology>,
}

impl Default for GroupManager {
    fn default() -> Self {
        GroupManager::new()
    }
}

impl GroupManager {
    pub fn new() -> GroupManager {
        GroupManager::with_group_size(GROUP_SIZE)
    }

    pub fn with_group_size(group_size: usize) -> GroupManager {
        GroupManager {
            group_size: group_size.max(1),
            topology: Mutex::new(Topology::default()),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Places `client` in the first group with room, opening a new group if
    /// all are full.
    ///
    /// The manager lock is held for the whole scan-and-append, so concurrent
    /// assignments never overfill a group.
    pub fn assign(&self, client: Arc<Client>) -> Result<GroupId> {
        let mut topology = self.topology.lock();

        if let Some(group) = client.group_id() {
            return Err(GroupError::AlreadyAssigned {
                client_id: client.id().to_string(),
                group,
            });
        }

        if topology.clients.contains_key(client.id()) {
            return Err(GroupError::DuplicateClientId {
                client_id: client.id().to_string(),
            });
        }

        let existing = topology
            .groups
            .iter()
            .find(|group| group.try_add(client.clone()))
            .map(|group| group.id());

        let group_id = match existing {
            Some(id) => id,
            None => {
                let id = GroupId(topology.groups.len() + 1);
                let group = Arc::new(Group::new(id, self.group_size));
                group.try_add(client.clone());
                topology.groups.push(group);

                log::info!("Created {}", id);
                id
            }
        };

        client.join_group(group_id);
        topology
            .clients
            .insert(client.id().to_string(), client.clone());

        log::info!("Assigned client {} to {}", client.id(), group_id);

        Ok(group_id)
    }

    pub fn add_client(&self, client: Arc<Client>) -> Result<GroupId> {
        self.assign(client)
    }

    /// Groups in creation order
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.topology.lock().groups.clone()
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<Group>> {
        // Ids are sequential, so the id is the position plus one
        let idx = id.0.checked_sub(1)?;
        self.topology.lock().groups.get(idx).cloned()
    }

    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.topology.lock().clients.get(id).cloned()
    }

    /// Every registered client, in group then join order
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.groups()
            .iter()
            .flat_map(|group| group.members())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.topology.lock().clients.len()
    }

    /// The members of `client`'s group, itself included. Empty if unassigned.
    pub fn peers_of(&self, client: &Client) -> Vec<Arc<Client>> {
        client
            .group_id()
            .and_then(|id| self.group(id))
            .map(|group| group.members())
            .unwrap_or_default()
    }

    fn registered(&self, client_id: &str) -> std::result::Result<Arc<Client>, ResolveError> {
        self.client(client_id)
            .ok_or_else(|| ResolveError::UnknownClient {
                client_id: client_id.to_string(),
            })
    }

    /// Resolves `domain` on behalf of the client registered as `client_id`.
    ///
    /// This is the only way in to the resolution pipeline: the peers swept
    /// are always the members of that client's own group.
    pub fn resolve(
        &self,
        client_id: &str,
        domain: &str,
    ) -> std::result::Result<Resolution, ResolveError> {
        let client = self.registered(client_id)?;
        let peers = self.peers_of(&client);

        client.resolve_with_source(domain, &peers)
    }

    pub fn resolve_address(
        &self,
        client_id: &str,
        domain: &str,
    ) -> std::result::Result<IpAddr, ResolveError> {
        let client = self.registered(client_id)?;
        let peers = self.peers_of(&client);

        client.resolve(domain, &peers)
    }
}
