//! Login/logout bookkeeping: who is online, and hand-off to the player store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::player::{Player, PlayerStore, is_valid_nickname};
use crate::session::SessionId;
use crate::world::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    InvalidNickname,
    NicknameInUse,
}

impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginError::InvalidNickname => write!(
                f,
                "invalid nickname (1-40 characters: letters, digits, '_' or '-')"
            ),
            LoginError::NicknameInUse => write!(f, "nickname already in use"),
        }
    }
}

impl std::error::Error for LoginError {}

#[derive(Debug, Clone)]
struct OnlineEntry {
    nickname: String,
    session: SessionId,
}

#[derive(Debug)]
pub struct Registry {
    // Keyed by lowercased nickname so "Alice" and "alice" collide.
    online: RwLock<HashMap<String, OnlineEntry>>,
    store: PlayerStore,
    start: Location,
}

impl Registry {
    pub fn new(store: PlayerStore, start: Location) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            store,
            start,
        }
    }

    pub fn start(&self) -> &Location {
        &self.start
    }

    pub fn store(&self) -> &PlayerStore {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, OnlineEntry>> {
        self.online.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, OnlineEntry>> {
        self.online.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and reserve `nickname`, then load the player (or create one at the start).
    pub fn login(&self, session: SessionId, nickname: &str) -> Result<Player, LoginError> {
        let nickname = nickname.trim();
        if !is_valid_nickname(nickname) {
            return Err(LoginError::InvalidNickname);
        }
        {
            let mut online = self.write();
            let k = nickname.to_ascii_lowercase();
            if online.contains_key(&k) {
                return Err(LoginError::NicknameInUse);
            }
            online.insert(
                k,
                OnlineEntry {
                    nickname: nickname.to_string(),
                    session,
                },
            );
        }

        let player = match self.store.load(nickname) {
            Ok(Some(p)) => p,
            Ok(None) => {
                info!(session = %session, nick = %nickname, "new player");
                Player::new(nickname, self.start.clone())
            }
            Err(e) => {
                warn!(nick = %nickname, err = %format!("{e:#}"), "unreadable player file; starting fresh");
                Player::new(nickname, self.start.clone())
            }
        };
        Ok(player)
    }

    /// Free `nickname` if `session` still holds it.
    pub fn release(&self, session: SessionId, nickname: &str) {
        let mut online = self.write();
        let k = nickname.to_ascii_lowercase();
        if online.get(&k).is_some_and(|e| e.session == session) {
            online.remove(&k);
        }
    }

    /// Persist and evict. Persistence failures are logged; the nickname is freed regardless.
    pub fn logout(&self, session: SessionId, player: &Player) {
        match self.store.save(player) {
            Ok(()) => info!(
                session = %session,
                nick = %player.nickname,
                at = %player.location(),
                "player saved"
            ),
            Err(e) => warn!(
                session = %session,
                nick = %player.nickname,
                err = %format!("{e:#}"),
                "failed to save player"
            ),
        }
        self.release(session, &player.nickname);
    }

    pub fn is_online(&self, nickname: &str) -> bool {
        self.read().contains_key(&nickname.to_ascii_lowercase())
    }

    /// Online nicknames, sorted.
    pub fn online(&self) -> Vec<String> {
        let mut v = self
            .read()
            .values()
            .map(|e| e.nickname.clone())
            .collect::<Vec<_>>();
        v.sort();
        v
    }
}
