//! The room roster: every client record known to this server, local or
//! hosted by a peer, keyed by uuid.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one attached socket, unique per process.
pub type SessionId = u64;

/// A client record.
///
/// Records survive disconnects so the `(uuid, pin)` pair can re-attach;
/// they are only dropped when the hosting server is declared dead. The pin
/// is shared between servers of a room but never with end-user clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub uuid: Uuid,
    pub pin: String,
    pub name: String,
    pub remote_addr: String,
    pub is_online: bool,
    pub server_id: Uuid,
}

impl Client {
    /// The projection safe to send to end-user clients.
    pub fn dist(&self) -> DistClient {
        DistClient {
            uuid: self.uuid,
            name: self.name.clone(),
            server_id: self.server_id,
        }
    }
}

/// Public projection of a [`Client`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistClient {
    pub uuid: Uuid,
    pub name: String,
    pub server_id: Uuid,
}

/// Result of a bind attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub uuid: Uuid,
    /// False when an existing record was re-attached.
    pub created: bool,
    /// Session that held the uuid before a takeover, to be disconnected.
    pub kicked: Option<SessionId>,
}

/// Set of clients with uuid as primary key, plus the uuid -> session index
/// for locally hosted clients.
#[derive(Debug, Default)]
pub struct Roster {
    clients: HashMap<Uuid, Client>,
    sessions: HashMap<Uuid, SessionId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Client> {
        self.clients.get(uuid)
    }

    pub fn session_of(&self, uuid: &Uuid) -> Option<SessionId> {
        self.sessions.get(uuid).copied()
    }

    /// Attach a session to a client record.
    ///
    /// A presented `(uuid, pin)` that matches an existing record re-attaches
    /// it, taking it over from a peer server if needed and kicking any
    /// session previously holding the uuid. Anything else creates a fresh
    /// record with a new uuid and pin.
    pub fn bind(
        &mut self,
        uuid: Option<&str>,
        pin: Option<&str>,
        name: &str,
        remote_addr: &str,
        session: SessionId,
        self_id: Uuid,
    ) -> Bound {
        let presented = uuid
            .filter(|u| u.len() == 36)
            .and_then(|u| Uuid::parse_str(u).ok());
        let matched = match presented {
            Some(u) => self.clients.get_mut(&u),
            None => None,
        };
        if let Some(client) = matched {
            if Some(client.pin.as_str()) == pin {
                client.name = name.to_string();
                client.remote_addr = remote_addr.to_string();
                client.is_online = true;
                client.server_id = self_id;
                let existing = client.uuid;
                let kicked = self.sessions.insert(existing, session);
                return Bound {
                    uuid: existing,
                    created: false,
                    kicked,
                };
            }
        }

        let new_uuid = Uuid::new_v4();
        self.clients.insert(
            new_uuid,
            Client {
                uuid: new_uuid,
                pin: generate_pin(),
                name: name.to_string(),
                remote_addr: remote_addr.to_string(),
                is_online: true,
                server_id: self_id,
            },
        );
        self.sessions.insert(new_uuid, session);
        Bound {
            uuid: new_uuid,
            created: true,
            kicked: None,
        }
    }

    /// Drop the session index entry and flag the record offline; the record
    /// itself stays so the uuid/pin can rebind later.
    pub fn mark_offline(&mut self, uuid: &Uuid) {
        self.sessions.remove(uuid);
        if let Some(client) = self.clients.get_mut(uuid) {
            client.is_online = false;
        }
    }

    /// Replace every record hosted by `peer` with the peer's authoritative
    /// list. Returns sessions whose uuid was taken over by the peer; they
    /// must be disconnected by the caller.
    pub fn reconcile(&mut self, peer: Uuid, clients: Vec<Client>) -> Vec<SessionId> {
        self.clients.retain(|_, c| c.server_id != peer);
        let mut kicked = Vec::new();
        for client in clients {
            if let Some(session) = self.sessions.remove(&client.uuid) {
                kicked.push(session);
            }
            self.clients.insert(client.uuid, client);
        }
        kicked
    }

    /// Remove every record hosted by any of the given dead servers.
    pub fn prune_dead_servers(&mut self, dead: &[Uuid]) {
        self.clients.retain(|_, c| !dead.contains(&c.server_id));
        let clients = &self.clients;
        self.sessions.retain(|uuid, _| clients.contains_key(uuid));
    }

    /// Online clients only, as public projections, in stable order.
    pub fn snapshot_online(&self) -> Vec<DistClient> {
        let mut online: Vec<DistClient> = self
            .clients
            .values()
            .filter(|c| c.is_online)
            .map(Client::dist)
            .collect();
        online.sort_by_key(|c| c.uuid);
        online
    }

    /// Full records hosted by this server, in stable order.
    pub fn local_clients(&self, self_id: Uuid) -> Vec<Client> {
        let mut local: Vec<Client> = self
            .clients
            .values()
            .filter(|c| c.server_id == self_id)
            .cloned()
            .collect();
        local.sort_by_key(|c| c.uuid);
        local
    }

    /// Distinct ids of peer servers hosting clients in this roster.
    pub fn remote_server_ids(&self, self_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .clients
            .values()
            .map(|c| c.server_id)
            .filter(|id| *id != self_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn generate_pin() -> String {
    format!("{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
}

#[cfg(test)]
mod test {
    use super::*;

    fn self_id() -> Uuid {
        Uuid::parse_str("00000000-0000-4000-8000-000000000001").unwrap()
    }

    fn peer_id() -> Uuid {
        Uuid::parse_str("00000000-0000-4000-8000-000000000002").unwrap()
    }

    fn peer_client(uuid: Uuid, name: &str) -> Client {
        Client {
            uuid,
            pin: "00000000".to_string(),
            name: name.to_string(),
            remote_addr: "10.0.0.9".to_string(),
            is_online: true,
            server_id: peer_id(),
        }
    }

    #[test]
    fn bind_creates_and_rebinds() {
        let mut roster = Roster::new();
        let first = roster.bind(None, None, "a", "127.0.0.1", 1, self_id());
        assert!(first.created);
        assert_eq!(Some(1), roster.session_of(&first.uuid));

        let pin = roster.get(&first.uuid).unwrap().pin.clone();
        roster.mark_offline(&first.uuid);
        assert!(!roster.get(&first.uuid).unwrap().is_online);
        assert_eq!(None, roster.session_of(&first.uuid));

        let again = roster.bind(
            Some(&first.uuid.to_string()),
            Some(&pin),
            "a2",
            "127.0.0.1",
            2,
            self_id(),
        );
        assert!(!again.created);
        assert_eq!(first.uuid, again.uuid);
        assert_eq!(None, again.kicked);
        let client = roster.get(&first.uuid).unwrap();
        assert!(client.is_online);
        assert_eq!("a2", client.name);
        assert_eq!(Some(2), roster.session_of(&first.uuid));
    }

    #[test]
    fn rebind_while_online_kicks_old_session() {
        let mut roster = Roster::new();
        let bound = roster.bind(None, None, "a", "127.0.0.1", 1, self_id());
        let pin = roster.get(&bound.uuid).unwrap().pin.clone();

        let takeover = roster.bind(
            Some(&bound.uuid.to_string()),
            Some(&pin),
            "a",
            "127.0.0.2",
            2,
            self_id(),
        );
        assert_eq!(bound.uuid, takeover.uuid);
        assert_eq!(Some(1), takeover.kicked);
        assert_eq!(Some(2), roster.session_of(&bound.uuid));
    }

    #[test]
    fn pin_mismatch_allocates_fresh_uuid() {
        let mut roster = Roster::new();
        let bound = roster.bind(None, None, "a", "127.0.0.1", 1, self_id());
        let original = roster.get(&bound.uuid).unwrap().clone();

        let other = roster.bind(
            Some(&bound.uuid.to_string()),
            Some("wrong"),
            "c",
            "127.0.0.1",
            2,
            self_id(),
        );
        assert!(other.created);
        assert_ne!(bound.uuid, other.uuid);
        assert_eq!(&original, roster.get(&bound.uuid).unwrap());
    }

    #[test]
    fn no_two_records_share_a_uuid() {
        let mut roster = Roster::new();
        let a = roster.bind(None, None, "a", "127.0.0.1", 1, self_id());
        let b = roster.bind(None, None, "b", "127.0.0.1", 2, self_id());
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(2, roster.snapshot_online().len());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut roster = Roster::new();
        roster.bind(None, None, "local", "127.0.0.1", 1, self_id());
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let list = vec![peer_client(u1, "p1"), peer_client(u2, "p2")];

        roster.reconcile(peer_id(), list.clone());
        let first = roster.snapshot_online();
        roster.reconcile(peer_id(), list);
        assert_eq!(first, roster.snapshot_online());
        assert_eq!(3, first.len());
    }

    #[test]
    fn reconcile_reports_taken_over_sessions() {
        let mut roster = Roster::new();
        let bound = roster.bind(None, None, "a", "127.0.0.1", 7, self_id());
        let kicked = roster.reconcile(peer_id(), vec![peer_client(bound.uuid, "a")]);
        assert_eq!(vec![7], kicked);
        assert_eq!(None, roster.session_of(&bound.uuid));
        assert_eq!(peer_id(), roster.get(&bound.uuid).unwrap().server_id);
    }

    #[test]
    fn prune_dead_servers_drops_their_clients() {
        let mut roster = Roster::new();
        let local = roster.bind(None, None, "local", "127.0.0.1", 1, self_id());
        roster.reconcile(peer_id(), vec![peer_client(Uuid::new_v4(), "p1")]);
        assert_eq!(2, roster.snapshot_online().len());

        roster.prune_dead_servers(&[peer_id()]);
        let online = roster.snapshot_online();
        assert_eq!(1, online.len());
        assert_eq!(local.uuid, online[0].uuid);
    }

    #[test]
    fn snapshot_online_filters_and_projects() {
        let mut roster = Roster::new();
        let a = roster.bind(None, None, "a", "127.0.0.1", 1, self_id());
        let b = roster.bind(None, None, "b", "127.0.0.1", 2, self_id());
        roster.mark_offline(&b.uuid);

        let online = roster.snapshot_online();
        assert_eq!(1, online.len());
        assert_eq!(a.uuid, online[0].uuid);
        // The projection carries no pin.
        let json = serde_json::to_value(&online[0]).unwrap();
        assert!(json.get("pin").is_none());
        assert!(json.get("serverId").is_some());
    }

    #[test]
    fn remote_server_ids_are_distinct() {
        let mut roster = Roster::new();
        roster.bind(None, None, "local", "127.0.0.1", 1, self_id());
        roster.reconcile(
            peer_id(),
            vec![
                peer_client(Uuid::new_v4(), "p1"),
                peer_client(Uuid::new_v4(), "p2"),
            ],
        );
        assert_eq!(vec![peer_id()], roster.remote_server_ids(self_id()));
    }
}
