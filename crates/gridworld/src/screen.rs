//! Double-buffered terminal painter for one session.
//!
//! A frame is painted into `back`, diffed against `front` (what the terminal shows), and
//! only changed cells are emitted as cursor moves plus text. The first frame and every
//! resize clear the terminal.

use std::io;

use crossterm::{
    cursor::MoveTo,
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use tracing::warn;

use crate::movement::{CellKind, Direction, Exits};
use crate::viewport::{CellClass, MapView, Viewport};

pub const MIN_WIDTH: u16 = 30;
pub const MIN_HEIGHT: u16 = 30;
// Window sizes come straight from the client; anything larger is painted at this size.
pub const MAX_WIDTH: u16 = 512;
pub const MAX_HEIGHT: u16 = 256;

const DESCRIPTION_LINES: usize = 3;
// Unchanged cells shorter than this between two changes are rewritten instead of
// jumped over with a cursor move.
const MAX_GAP: usize = 4;
const PROMPT: &str = "> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    ch: char,
    fg: Color,
}

impl Cell {
    const BLANK: Cell = Cell {
        ch: ' ',
        fg: Color::Reset,
    };
}

#[derive(Debug)]
pub struct Screen {
    width: u16,
    height: u16,
    front: Vec<Cell>,
    back: Vec<Cell>,
    fresh: bool,
}

impl Screen {
    pub fn new(width: u16, height: u16) -> Self {
        let (width, height) = clamp_size(width, height);
        let n = width as usize * height as usize;
        Self {
            width,
            height,
            front: vec![Cell::BLANK; n],
            back: vec![Cell::BLANK; n],
            fresh: true,
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn resize(&mut self, width: u16, height: u16) {
        let (width, height) = clamp_size(width, height);
        if (width, height) == (self.width, self.height) {
            return;
        }
        *self = Self::new(width, height);
    }

    pub fn too_small(&self) -> bool {
        self.width < MIN_WIDTH || self.height < MIN_HEIGHT
    }

    /// Paint `v` and return the bytes that bring the terminal up to date.
    pub fn render(&mut self, v: &Viewport) -> Vec<u8> {
        self.back.fill(Cell::BLANK);
        if self.too_small() {
            self.put(0, 0, "terminal too small", Color::Red);
            let need = format!("need {MIN_WIDTH}x{MIN_HEIGHT}");
            self.put(0, 1, &need, Color::Red);
        } else {
            self.paint(v);
        }
        let mut out = Vec::new();
        if let Err(e) = self.flush(&mut out) {
            warn!(err = %e, "frame encode failed");
            self.fresh = true;
        }
        out
    }

    pub fn goodbye(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = queue!(
            out,
            ResetColor,
            MoveTo(0, self.height - 1),
            Clear(ClearType::CurrentLine),
            Print("bye\r\n")
        );
        out
    }

    /// What the terminal currently shows, one string per row with trailing blanks cut.
    pub fn lines(&self) -> Vec<String> {
        self.front
            .chunks(self.width as usize)
            .map(|row| {
                row.iter()
                    .map(|c| c.ch)
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .collect()
    }

    fn put(&mut self, x: usize, y: usize, s: &str, fg: Color) {
        let (w, h) = (self.width as usize, self.height as usize);
        if y >= h {
            return;
        }
        for (i, ch) in s.chars().enumerate() {
            if x + i >= w {
                break;
            }
            self.back[y * w + x + i] = Cell { ch, fg };
        }
    }

    // Layout, top to bottom: title, description, blank, map, blank, exits, events, prompt.
    fn paint(&mut self, v: &Viewport) {
        let w = self.width as usize;
        let h = self.height as usize;

        let title = format!("{} :: {}", v.intro.area, v.intro.title);
        self.put(0, 0, &title, Color::Yellow);
        let mut y = 1;
        for line in wrap(&v.intro.description, w)
            .into_iter()
            .take(DESCRIPTION_LINES)
        {
            self.put(0, y, &line, Color::Grey);
            y += 1;
        }

        let map_top = y + 1;
        let map_bottom = h.saturating_sub(4);
        if map_bottom > map_top {
            self.paint_map(&v.world, map_top, map_bottom - map_top);
        }

        self.put(0, h - 3, &exits_line(&v.exits), Color::Cyan);
        self.put(0, h - 2, &v.events, Color::White);
    }

    fn paint_map(&mut self, map: &MapView, top: usize, avail: usize) {
        let w = self.width as usize;
        let rows = map.rows.len();
        let cols = map.rows.first().map_or(0, Vec::len);
        let me = map.rows.iter().enumerate().find_map(|(y, r)| {
            r.iter()
                .position(|c| *c == CellClass::SelfOccupied)
                .map(|x| (x, y))
        });
        let (mx, my) = me.unwrap_or((0, 0));
        let y0 = window_start(my, rows, avail);
        let x0 = window_start(mx, cols, w);

        for (dy, row) in map.rows.iter().skip(y0).take(avail).enumerate() {
            for (dx, class) in row.iter().skip(x0).take(w).enumerate() {
                self.back[(top + dy) * w + dx] = Cell {
                    ch: class.glyph(),
                    fg: glyph_color(*class),
                };
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        let w = self.width as usize;
        if self.fresh {
            queue!(out, ResetColor, Clear(ClearType::All))?;
            self.front.fill(Cell::BLANK);
            self.fresh = false;
        }

        let mut fg = Color::Reset;
        for y in 0..self.height as usize {
            let row = y * w;
            let changed = |x: usize| self.back[row + x] != self.front[row + x];
            let mut x = 0;
            while x < w {
                if !changed(x) {
                    x += 1;
                    continue;
                }
                let mut end = x + 1;
                let mut k = end;
                while k < w && k - end < MAX_GAP {
                    if changed(k) {
                        end = k + 1;
                    }
                    k += 1;
                }

                queue!(out, MoveTo(x as u16, y as u16))?;
                let mut run = String::new();
                for cell in &self.back[row + x..row + end] {
                    if cell.fg != fg {
                        if !run.is_empty() {
                            queue!(out, Print(&run))?;
                            run.clear();
                        }
                        queue!(out, SetForegroundColor(cell.fg))?;
                        fg = cell.fg;
                    }
                    run.push(cell.ch);
                }
                queue!(out, Print(&run))?;
                x = end;
            }
        }

        queue!(
            out,
            ResetColor,
            MoveTo(0, self.height - 1),
            Clear(ClearType::UntilNewLine),
            Print(PROMPT)
        )?;
        self.front.copy_from_slice(&self.back);
        Ok(())
    }
}

fn clamp_size(width: u16, height: u16) -> (u16, u16) {
    (width.clamp(1, MAX_WIDTH), height.clamp(1, MAX_HEIGHT))
}

fn glyph_color(c: CellClass) -> Color {
    match c {
        CellClass::Portal => Color::Magenta,
        CellClass::SelfOccupied => Color::Green,
        CellClass::OtherOccupied => Color::Cyan,
        CellClass::Outside => Color::Reset,
        CellClass::Hole => Color::DarkGrey,
        CellClass::Floor => Color::Grey,
    }
}

// First index of a `len`-wide window over `total` items that keeps `focus` centred.
fn window_start(focus: usize, total: usize, len: usize) -> usize {
    if total <= len {
        return 0;
    }
    focus.saturating_sub(len / 2).min(total - len)
}

pub fn exits_line(exits: &Exits) -> String {
    Direction::ALL
        .iter()
        .map(|d| {
            let e = exits.get(*d);
            match (e.is_open(), e.kind) {
                (false, _) => format!("{}:-", d.letter()),
                (true, CellKind::Door) => format!("{}:{}(door)", d.letter(), e.to_cube),
                (true, CellKind::Cube) => format!("{}:{}", d.letter(), e.to_cube),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut cur = String::new();
    let mut cur_len = 0;
    for word in text.split_whitespace() {
        let n = word.chars().count();
        if cur_len > 0 && cur_len + 1 + n > width {
            lines.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        if cur_len > 0 {
            cur.push(' ');
            cur_len += 1;
        }
        cur.push_str(word);
        cur_len += n;
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}
