//! Room -> online sessions index.
//!
//! Owned and mutated only by the arbiter. A session is listed under exactly one room;
//! `relocate` removes before inserting, so a reader never sees it in two rooms.

use std::collections::{BTreeMap, HashMap};

use crate::session::SessionId;
use crate::world::{Location, RoomKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    pub nickname: String,
    pub position: String,
}

#[derive(Debug, Default, Clone)]
pub struct Occupancy {
    // BTreeMap keeps fan-out order stable across runs.
    rooms: HashMap<RoomKey, BTreeMap<SessionId, Occupant>>,
}

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: SessionId, at: &Location, nickname: &str) {
        self.rooms.entry(at.room_key()).or_default().insert(
            session,
            Occupant {
                nickname: nickname.to_string(),
                position: at.position.clone(),
            },
        );
    }

    pub fn remove(&mut self, session: SessionId, room: &RoomKey) -> Option<Occupant> {
        let members = self.rooms.get_mut(room)?;
        let out = members.remove(&session);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        out
    }

    pub fn relocate(&mut self, session: SessionId, from: &RoomKey, to: &Location) {
        let nickname = self
            .remove(session, from)
            .map(|o| o.nickname)
            .unwrap_or_default();
        self.insert(session, to, &nickname);
    }

    /// Sessions located in `(area, room)`, in session-id order.
    pub fn locate(&self, area: &str, room: &str) -> Vec<SessionId> {
        self.members(area, room).map(|(sid, _)| sid).collect()
    }

    pub fn members<'a>(
        &'a self,
        area: &str,
        room: &str,
    ) -> impl Iterator<Item = (SessionId, &'a Occupant)> + 'a {
        let key = RoomKey {
            area: area.to_string(),
            room: room.to_string(),
        };
        self.rooms
            .get(&key)
            .into_iter()
            .flat_map(|m| m.iter().map(|(sid, o)| (*sid, o)))
    }

    /// Who, if anyone, stands on `cube`.
    pub fn occupant_of(&self, area: &str, room: &str, cube: &str) -> Option<(SessionId, &Occupant)> {
        self.members(area, room).find(|(_, o)| o.position == cube)
    }

    /// Nickname of the session holding `cube`, if any.
    pub fn is_occupied(&self, area: &str, room: &str, cube: &str) -> Option<&str> {
        self.occupant_of(area, room, cube)
            .map(|(_, o)| o.nickname.as_str())
    }

    pub fn len(&self) -> usize {
        self.rooms.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Every `(room, session)` pair; used by invariant checks.
    pub fn entries(&self) -> impl Iterator<Item = (&RoomKey, SessionId, &Occupant)> {
        self.rooms
            .iter()
            .flat_map(|(k, m)| m.iter().map(move |(sid, o)| (k, *sid, o)))
    }
}
