use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::viewport::MapMode;
use crate::world::{Location, World};

pub const CONFIG_FILE: &str = "server.yaml";

/// `static/server.yaml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where new players appear. Defaults to the first cube of the first room.
    pub start: Option<Location>,
    pub map: MapMode,
    /// Player documents. Relative paths are resolved against the static dir.
    pub players_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            start: None,
            map: MapMode::Full,
            players_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    /// Read `<static_dir>/server.yaml`; a missing file means defaults.
    pub fn load(static_dir: &Path) -> anyhow::Result<Self> {
        let path = static_dir.join(CONFIG_FILE);
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no server config; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Self::parse(&s).with_context(|| format!("parse {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn players_dir(&self, static_dir: &Path) -> PathBuf {
        match &self.players_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => static_dir.join(p),
            None => static_dir.join("player"),
        }
    }

    /// The configured start, checked against `world`, or the world's first cube.
    pub fn start_location(&self, world: &World) -> anyhow::Result<Location> {
        match &self.start {
            Some(loc) if world.is_standable(loc) => Ok(loc.clone()),
            Some(loc) => anyhow::bail!("start location {loc} is not a normal cube"),
            None => world
                .first_location()
                .context("world has no cube to start on"),
        }
    }
}
