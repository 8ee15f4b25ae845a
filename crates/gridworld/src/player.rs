use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::world::Location;

/// Character attributes. Owned by the (separate) character generator; carried as-is here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Attributes {
    pub str: u8,
    pub dex: u8,
    pub con: u8,
    pub int: u8,
    pub wis: u8,
    pub cha: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    pub area: String,
    pub room: String,
    pub position: String,
    #[serde(default)]
    pub previous_area: String,
    #[serde(default)]
    pub previous_room: String,
}

impl Player {
    pub fn new(nickname: impl Into<String>, at: Location) -> Self {
        Self {
            nickname: nickname.into(),
            attributes: None,
            previous_area: at.area.clone(),
            previous_room: at.room.clone(),
            area: at.area,
            room: at.room,
            position: at.position,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(&self.area, &self.room, &self.position)
    }

    /// Move to `to`, remembering the room we left.
    pub fn relocate(&mut self, to: Location) {
        self.previous_area = std::mem::replace(&mut self.area, to.area);
        self.previous_room = std::mem::replace(&mut self.room, to.room);
        self.position = to.position;
    }
}

/// Nicknames: 1..=40 of `[A-Za-z0-9_-]`.
pub fn is_valid_nickname(s: &str) -> bool {
    (1..=40).contains(&s.len())
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// One JSON document per player under `dir`: `<nick>.json`, with the nickname lowercased
/// so that file names follow the same rule as online uniqueness. The record keeps the
/// nickname's case.
#[derive(Debug, Clone)]
pub struct PlayerStore {
    dir: PathBuf,
}

impl PlayerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, nickname: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", nickname.to_ascii_lowercase()))
    }

    /// `Ok(None)` when the player has never been saved.
    pub fn load(&self, nickname: &str) -> anyhow::Result<Option<Player>> {
        let path = self.path_for(nickname);
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let p: Player =
            serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        if !p.nickname.eq_ignore_ascii_case(nickname) {
            anyhow::bail!(
                "{} belongs to {:?}, not {nickname:?}",
                path.display(),
                p.nickname
            );
        }
        Ok(Some(p))
    }

    pub fn save(&self, p: &Player) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create players dir {}", self.dir.display()))?;
        let path = self.path_for(&p.nickname);
        let s = serde_json::to_string_pretty(p)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }
}
