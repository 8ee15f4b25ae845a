//! Per-recipient view of a room: map, intro, exits and the event line.

use std::collections::HashMap;

use serde::Deserialize;

use crate::movement::{Exits, available_exits};
use crate::occupancy::Occupancy;
use crate::session::SessionId;
use crate::world::{Location, Room, World};

pub const DEFAULT_RADIUS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    Portal,
    SelfOccupied,
    OtherOccupied,
    /// Empty and surrounded by empty cells: not drawn.
    Outside,
    /// Empty but next to a cube.
    Hole,
    Floor,
}

impl CellClass {
    pub fn glyph(self) -> char {
        match self {
            CellClass::Portal => '+',
            CellClass::SelfOccupied => '@',
            CellClass::OtherOccupied => '&',
            CellClass::Outside => ' ',
            CellClass::Hole => '#',
            CellClass::Floor => '.',
        }
    }
}

/// Map rows in display order: `rows[y][x]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapView {
    pub rows: Vec<Vec<CellClass>>,
}

impl MapView {
    pub fn lines(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.iter().map(|c| c.glyph()).collect())
            .collect()
    }

    pub fn count(&self, class: CellClass) -> usize {
        self.rows.iter().flatten().filter(|c| **c == class).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intro {
    pub area: String,
    pub title: String,
    pub description: String,
}

/// Everything one recipient needs to paint a frame. Each value is a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewport {
    pub world: MapView,
    pub intro: Intro,
    pub exits: Exits,
    pub events: String,
    /// Index of the last event reflected in this snapshot.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum MapMode {
    #[default]
    Full,
    Centered {
        #[serde(default = "default_radius")]
        radius: u32,
    },
}

fn default_radius() -> u32 {
    DEFAULT_RADIUS
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Composer {
    mode: MapMode,
}

impl Composer {
    pub fn new(mode: MapMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Compose the view for `recipient` standing at `at`. `None` if `at` is not a known room.
    pub fn compose(
        &self,
        world: &World,
        occupancy: &Occupancy,
        recipient: SessionId,
        at: &Location,
        events: &str,
        seq: u64,
    ) -> Option<Viewport> {
        let area = world.area(&at.area)?;
        let room = area.rooms.get(&at.room)?;
        Some(Viewport {
            world: self.render_map(room, occupancy, recipient, at),
            intro: Intro {
                area: area.name.clone(),
                title: room.name.clone(),
                description: room.description.clone(),
            },
            exits: available_exits(world, at),
            events: events.to_string(),
            seq,
        })
    }

    fn render_map(
        &self,
        room: &Room,
        occupancy: &Occupancy,
        recipient: SessionId,
        at: &Location,
    ) -> MapView {
        let occupied = occupancy
            .members(&at.area, &at.room)
            .map(|(sid, o)| (o.position.as_str(), sid))
            .collect::<HashMap<_, _>>();
        let side = room.grid().side() as i64;
        let me = room.cube(&at.position).map(|c| (c.posx as i64, c.posy as i64));

        let mut rows = Vec::with_capacity(side as usize);
        for y in 0..side {
            let mut row = Vec::with_capacity(side as usize);
            let mut visible = false;
            for x in 0..side {
                if let (MapMode::Centered { radius }, Some((px, py))) = (self.mode, me) {
                    let r = i64::from(radius);
                    if (x - px).pow(2) + (y - py).pow(2) > r.saturating_mul(r) {
                        row.push(CellClass::Outside);
                        continue;
                    }
                }
                visible = true;
                row.push(classify(room, &occupied, recipient, x, y));
            }
            if visible || self.mode == MapMode::Full {
                rows.push(row);
            }
        }
        MapView { rows }
    }
}

fn classify(
    room: &Room,
    occupied: &HashMap<&str, SessionId>,
    recipient: SessionId,
    x: i64,
    y: i64,
) -> CellClass {
    match room.cube_at(x, y) {
        Some(c) if c.is_portal() => CellClass::Portal,
        Some(c) => match occupied.get(c.id.as_str()) {
            Some(sid) if *sid == recipient => CellClass::SelfOccupied,
            Some(_) => CellClass::OtherOccupied,
            None => CellClass::Floor,
        },
        None => {
            let near_cube = (-1..=1)
                .flat_map(|dx| (-1..=1).map(move |dy| (dx, dy)))
                .filter(|d| *d != (0, 0))
                .any(|(dx, dy)| room.cube_at(x + dx, y + dy).is_some());
            if near_cube {
                CellClass::Hole
            } else {
                CellClass::Outside
            }
        }
    }
}
