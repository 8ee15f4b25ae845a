//! Movement resolution over the static grid plus live occupancy.

use crate::occupancy::Occupancy;
use crate::world::{CubeKind, Location, World, is_placeholder_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    /// Grid step: north is towards `posy == 0`.
    pub fn delta(self) -> (i64, i64) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
        }
    }

    pub fn letter(self) -> char {
        match self {
            Direction::North => 'N',
            Direction::South => 'S',
            Direction::East => 'E',
            Direction::West => 'W',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    NoWay,
    Blocked { by: String },
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::NoWay => write!(f, "You can't go that way"),
            Refusal::Blocked { by } => write!(f, "{by} is blocking the way"),
        }
    }
}

impl std::error::Error for Refusal {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Cube,
    Door,
}

impl CellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Cube => "cube",
            CellKind::Door => "door",
        }
    }
}

/// Where one compass direction leads. `to_cube == "0"` means there is no exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub to_area: String,
    pub to_cube: String,
    pub to_room: String,
    pub kind: CellKind,
}

impl ExitInfo {
    pub const NONE_CUBE: &'static str = "0";

    pub fn none() -> Self {
        Self {
            to_area: String::new(),
            to_cube: Self::NONE_CUBE.to_string(),
            to_room: String::new(),
            kind: CellKind::Cube,
        }
    }

    pub fn is_open(&self) -> bool {
        self.to_cube != Self::NONE_CUBE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exits {
    pub north: ExitInfo,
    pub south: ExitInfo,
    pub east: ExitInfo,
    pub west: ExitInfo,
}

impl Exits {
    pub fn get(&self, dir: Direction) -> &ExitInfo {
        match dir {
            Direction::North => &self.north,
            Direction::South => &self.south,
            Direction::East => &self.east,
            Direction::West => &self.west,
        }
    }
}

/// Pure geometry: the location one step in `dir` leads to, ignoring occupancy.
///
/// A portal neighbour leads to its exit. Missing, placeholder, dangling, or
/// portal-to-portal targets are `None`.
pub fn step_target(world: &World, from: &Location, dir: Direction) -> Option<(Location, CellKind)> {
    let room = world.room(&from.area, &from.room)?;
    let src = room.cube(&from.position)?;
    let (dx, dy) = dir.delta();
    let n = room.cube_at(src.posx as i64 + dx, src.posy as i64 + dy)?;
    let (to, kind) = match &n.kind {
        CubeKind::Normal => (
            Location::new(&from.area, &from.room, &n.id),
            CellKind::Cube,
        ),
        CubeKind::Portal(ex) => (
            Location::new(&ex.to_area, &ex.to_room, &ex.to_cube),
            CellKind::Door,
        ),
    };
    if is_placeholder_id(&to.position) || !world.is_standable(&to) {
        return None;
    }
    Some((to, kind))
}

/// Resolve a move for `nickname` standing at `from`.
pub fn resolve(
    world: &World,
    occupancy: &Occupancy,
    from: &Location,
    nickname: &str,
    dir: Direction,
) -> Result<Location, Refusal> {
    let (to, _) = step_target(world, from, dir).ok_or(Refusal::NoWay)?;
    if let Some(by) = occupancy.is_occupied(&to.area, &to.room, &to.position) {
        if by != nickname {
            return Err(Refusal::Blocked { by: by.to_string() });
        }
    }
    Ok(to)
}

/// Compass summary for someone standing at `at`.
pub fn available_exits(world: &World, at: &Location) -> Exits {
    let info = |dir| match step_target(world, at, dir) {
        Some((to, kind)) => ExitInfo {
            to_area: to.area,
            to_cube: to.position,
            to_room: to.room,
            kind,
        },
        None => ExitInfo::none(),
    };
    Exits {
        north: info(Direction::North),
        south: info(Direction::South),
        east: info(Direction::East),
        west: info(Direction::West),
    }
}
