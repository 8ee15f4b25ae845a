use crate::movement::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Look,
    Move(Direction),
    Quit,
    Unknown,
}

impl Command {
    /// Parse one input line. Whitespace-only input is `None`.
    pub fn parse(line: &str) -> Option<Command> {
        let t = line.trim();
        if t.is_empty() {
            return None;
        }
        Some(match t.to_ascii_lowercase().as_str() {
            "l" | "look" | "map" => Command::Look,
            "e" | "east" => Command::Move(Direction::East),
            "w" | "west" => Command::Move(Direction::West),
            "n" | "north" => Command::Move(Direction::North),
            "s" | "south" => Command::Move(Direction::South),
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Look => "look",
            Command::Move(Direction::East) => "move_east",
            Command::Move(Direction::West) => "move_west",
            Command::Move(Direction::North) => "move_north",
            Command::Move(Direction::South) => "move_south",
            Command::Quit => "quit",
            Command::Unknown => "unknown",
        }
    }
}
