//! Line-oriented commands for the headless client.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Position one step away from `(row, col)`. Rows grow downwards.
    pub fn apply(self, row: i32, col: i32) -> (i32, i32) {
        match self {
            Direction::Up => (row.saturating_sub(1), col),
            Direction::Down => (row.saturating_add(1), col),
            Direction::Left => (row, col.saturating_sub(1)),
            Direction::Right => (row, col.saturating_add(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Move(Direction),
    /// Print the other players.
    Show,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command {0:?} (w/a/s/d move, p show players, q quit)")]
pub struct UnknownCommand(pub String);

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, UnknownCommand> {
    let command = match line.trim().to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "w" => Command::Move(Direction::Up),
        "s" => Command::Move(Direction::Down),
        "a" => Command::Move(Direction::Left),
        "d" => Command::Move(Direction::Right),
        "p" => Command::Show,
        "q" | "quit" | "exit" => Command::Quit,
        other => return Err(UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moves() {
        assert_eq!(parse_command("w"), Ok(Some(Command::Move(Direction::Up))));
        assert_eq!(parse_command(" D \n"), Ok(Some(Command::Move(Direction::Right))));
        assert_eq!(parse_command("p"), Ok(Some(Command::Show)));
        assert_eq!(parse_command("quit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn test_blank_and_unknown() {
        assert_eq!(parse_command("   "), Ok(None));
        let err = parse_command("jump").unwrap_err();
        assert_eq!(err, UnknownCommand("jump".to_string()));
        assert!(err.to_string().contains("q quit"));
    }

    #[test]
    fn test_direction_steps() {
        assert_eq!(Direction::Up.apply(3, 4), (2, 4));
        assert_eq!(Direction::Down.apply(3, 4), (4, 4));
        assert_eq!(Direction::Left.apply(3, 4), (3, 3));
        assert_eq!(Direction::Right.apply(3, 4), (3, 5));
        // No bounds checking: the grid edge is not the client's concern.
        assert_eq!(Direction::Up.apply(0, 0), (-1, 0));
    }
}
