//! Static world model: areas, rooms, cubes and the per-room lookup grid.
//!
//! Loaded once at startup from `areas/*.yaml` and shared read-only (`Arc<World>`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

/// Grids are at least this many cells on a side (before the border).
const GRID_MIN_SIDE: usize = 6;
/// Empty cells appended past the largest coordinate.
const GRID_BORDER: usize = 1;
/// Largest `posx`/`posy` an area may use.
pub const MAX_COORD: u32 = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exit {
    pub to_area: String,
    pub to_room: String,
    pub to_cube: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CubeKind {
    Normal,
    /// A door: stepping onto it moves the player to the exit.
    Portal(Exit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cube {
    pub id: String,
    pub posx: usize,
    pub posy: usize,
    pub kind: CubeKind,
}

impl Cube {
    pub fn is_portal(&self) -> bool {
        matches!(self.kind, CubeKind::Portal(_))
    }

    pub fn exit(&self) -> Option<&Exit> {
        match &self.kind {
            CubeKind::Portal(ex) => Some(ex),
            CubeKind::Normal => None,
        }
    }
}

/// Empty ids, and ids that parse to an integer `<= 0`, mean "no cube here".
pub fn is_placeholder_id(id: &str) -> bool {
    let id = id.trim();
    id.is_empty() || id.parse::<i64>().is_ok_and(|n| n <= 0)
}

/// Square lookup grid indexed `[x][y]` (x = posx, y = posy).
#[derive(Debug, Clone)]
pub struct Grid {
    side: usize,
    cells: Vec<Vec<Option<usize>>>,
}

impl Grid {
    fn build(cubes: &[Cube]) -> anyhow::Result<Self> {
        let max = cubes
            .iter()
            .map(|c| c.posx.max(c.posy))
            .max()
            .unwrap_or(0);
        let side = (max + 1).max(GRID_MIN_SIDE) + GRID_BORDER;
        let mut cells: Vec<Vec<Option<usize>>> = vec![vec![None; side]; side];
        for (i, c) in cubes.iter().enumerate() {
            let slot = &mut cells[c.posx][c.posy];
            if let Some(prev) = *slot {
                anyhow::bail!(
                    "cubes {:?} and {:?} share position ({}, {})",
                    cubes[prev].id,
                    c.id,
                    c.posx,
                    c.posy
                );
            }
            *slot = Some(i);
        }
        Ok(Self { side, cells })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// Cube index at `(x, y)`; out of bounds and empty cells are `None`.
    pub fn index_at(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        if x >= self.side || y >= self.side {
            return None;
        }
        self.cells[x][y]
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    /// Key under `rooms:`; this is what exits refer to.
    pub key: String,
    pub name: String,
    pub description: String,
    pub cubes: Vec<Cube>,
    grid: Grid,
    by_id: HashMap<String, usize>,
}

impl Room {
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn cube(&self, id: &str) -> Option<&Cube> {
        self.by_id.get(id).map(|i| &self.cubes[*i])
    }

    pub fn cube_at(&self, x: i64, y: i64) -> Option<&Cube> {
        self.grid.index_at(x, y).map(|i| &self.cubes[i])
    }

    /// Normal cubes in row-major `[x][y]` grid order.
    pub fn standable_cubes(&self) -> impl Iterator<Item = &Cube> + '_ {
        let side = self.grid.side() as i64;
        (0..side)
            .flat_map(move |x| (0..side).map(move |y| (x, y)))
            .filter_map(|(x, y)| self.cube_at(x, y))
            .filter(|c| !c.is_portal())
    }
}

#[derive(Debug, Clone)]
pub struct Area {
    pub name: String,
    pub intro: String,
    pub rooms: BTreeMap<String, Room>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub area: String,
    pub room: String,
    pub position: String,
}

impl Location {
    pub fn new(area: impl Into<String>, room: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            room: room.into(),
            position: position.into(),
        }
    }

    pub fn room_key(&self) -> RoomKey {
        RoomKey {
            area: self.area.clone(),
            room: self.room.clone(),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.area, self.room, self.position)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    pub area: String,
    pub room: String,
}

#[derive(Debug, Clone, Default)]
pub struct World {
    areas: BTreeMap<String, Area>,
}

impl World {
    pub fn from_areas(areas: impl IntoIterator<Item = Area>) -> Self {
        let mut w = Self::default();
        for a in areas {
            w.areas.insert(a.name.clone(), a);
        }
        w
    }

    /// Load every `*.yaml` under `dir`, skipping (and logging) malformed areas.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let rd = std::fs::read_dir(dir)
            .with_context(|| format!("read areas dir {}", dir.display()))?;
        let mut paths = rd
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("yaml"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut world = Self::default();
        for p in paths {
            let area = std::fs::read_to_string(&p)
                .with_context(|| format!("read {}", p.display()))
                .and_then(|s| parse_area(&s).with_context(|| format!("parse {}", p.display())));
            match area {
                Ok(a) => {
                    if world.areas.contains_key(&a.name) {
                        warn!(file = %p.display(), area = %a.name, "duplicate area name; skipping");
                        continue;
                    }
                    let cubes: usize = a.rooms.values().map(|r| r.cubes.len()).sum();
                    info!(area = %a.name, rooms = a.rooms.len(), cubes, "area loaded");
                    world.areas.insert(a.name.clone(), a);
                }
                Err(e) => warn!(file = %p.display(), err = %format!("{e:#}"), "skipping area"),
            }
        }

        if world.areas.is_empty() {
            anyhow::bail!("no areas loaded from {}", dir.display());
        }
        for (room, cube, ex) in world.dangling_exits() {
            warn!(
                room = %format!("{}/{}", room.area, room.room),
                cube = %cube,
                to = %format!("{}/{}#{}", ex.to_area, ex.to_room, ex.to_cube),
                "portal exit leads nowhere"
            );
        }
        Ok(world)
    }

    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.areas.values()
    }

    pub fn area(&self, name: &str) -> Option<&Area> {
        self.areas.get(name)
    }

    pub fn room(&self, area: &str, room: &str) -> Option<&Room> {
        self.areas.get(area)?.rooms.get(room)
    }

    /// A location is valid when it names a declared normal cube.
    pub fn is_standable(&self, loc: &Location) -> bool {
        self.room(&loc.area, &loc.room)
            .and_then(|r| r.cube(&loc.position))
            .is_some_and(|c| !c.is_portal())
    }

    /// First area by name, its first room by key, first normal cube in declaration order.
    pub fn first_location(&self) -> Option<Location> {
        self.areas.values().find_map(|a| {
            a.rooms.values().find_map(|r| {
                r.cubes
                    .iter()
                    .find(|c| !c.is_portal())
                    .map(|c| Location::new(&a.name, &r.key, &c.id))
            })
        })
    }

    /// Portal exits that do not lead to a standable cube.
    pub fn dangling_exits(&self) -> Vec<(RoomKey, String, Exit)> {
        let mut out = Vec::new();
        for a in self.areas.values() {
            for r in a.rooms.values() {
                for c in &r.cubes {
                    let Some(ex) = c.exit() else {
                        continue;
                    };
                    let to = Location::new(&ex.to_area, &ex.to_room, &ex.to_cube);
                    if !self.is_standable(&to) {
                        out.push((
                            RoomKey {
                                area: a.name.clone(),
                                room: r.key.clone(),
                            },
                            c.id.clone(),
                            ex.clone(),
                        ));
                    }
                }
            }
        }
        out
    }
}

pub fn parse_area(s: &str) -> anyhow::Result<Area> {
    let f: AreaFile = serde_yaml::from_str(s)?;
    let name = f.name.trim().to_string();
    if name.is_empty() {
        anyhow::bail!("area has no name");
    }

    let mut rooms = BTreeMap::new();
    for (key, r) in f.rooms {
        let room = build_room(&key, r).with_context(|| format!("room {key:?}"))?;
        rooms.insert(key, room);
    }

    Ok(Area {
        name,
        intro: f.intro.trim().to_string(),
        rooms,
    })
}

fn build_room(key: &str, r: RoomFile) -> anyhow::Result<Room> {
    let mut cubes = Vec::with_capacity(r.cubes.len());
    let mut by_id = HashMap::new();
    for c in r.cubes {
        if is_placeholder_id(&c.id) {
            continue;
        }
        let kind = match c.kind.as_deref().map(str::trim).unwrap_or("") {
            "" | "cube" | "normal" => {
                if !c.exits.is_empty() {
                    anyhow::bail!("cube {:?} has exits but is not a door", c.id);
                }
                CubeKind::Normal
            }
            "door" => {
                let Some(ex) = c.exits.into_iter().next() else {
                    anyhow::bail!("door {:?} has no exits", c.id);
                };
                if ex.toarea.trim().is_empty() || ex.toroom.trim().is_empty() {
                    anyhow::bail!("door {:?} has an incomplete exit", c.id);
                }
                CubeKind::Portal(Exit {
                    to_area: ex.toarea.trim().to_string(),
                    to_room: ex.toroom.trim().to_string(),
                    to_cube: ex.tocubeid,
                })
            }
            other => anyhow::bail!("cube {:?} has unknown type {other:?}", c.id),
        };
        if c.posx > MAX_COORD || c.posy > MAX_COORD {
            anyhow::bail!(
                "cube {:?} at ({}, {}) is past the {MAX_COORD} coordinate limit",
                c.id,
                c.posx,
                c.posy
            );
        }
        if by_id.insert(c.id.clone(), cubes.len()).is_some() {
            anyhow::bail!("duplicate cube id {:?}", c.id);
        }
        cubes.push(Cube {
            id: c.id,
            posx: c.posx as usize,
            posy: c.posy as usize,
            kind,
        });
    }

    let grid = Grid::build(&cubes)?;
    let name = r
        .name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| key.to_string());
    Ok(Room {
        key: key.to_string(),
        name,
        description: r.description.trim().to_string(),
        cubes,
        grid,
        by_id,
    })
}

#[derive(Debug, Deserialize)]
struct AreaFile {
    name: String,
    #[serde(default)]
    intro: String,
    #[serde(default)]
    rooms: BTreeMap<String, RoomFile>,
}

#[derive(Debug, Deserialize)]
struct RoomFile {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    cubes: Vec<CubeFile>,
}

#[derive(Debug, Deserialize)]
struct CubeFile {
    #[serde(deserialize_with = "de_id")]
    id: String,
    posx: u32,
    posy: u32,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    exits: Vec<ExitFile>,
}

#[derive(Debug, Deserialize)]
struct ExitFile {
    toarea: String,
    toroom: String,
    #[serde(deserialize_with = "de_id")]
    tocubeid: String,
}

// Authors write ids both as `id: 7` and `id: "7"`.
fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Str(String),
        Int(i64),
    }
    Ok(match IdRepr::deserialize(d)? {
        IdRepr::Str(s) => s.trim().to_string(),
        IdRepr::Int(n) => n.to_string(),
    })
}
