//! Undo/redo records.
//!
//! Overlap resolution can trim or destroy neighbours of the edited clip, so an
//! inverse delta alone cannot restore a track. Every command therefore keeps
//! the affected tracks' clip lists from before and after the edit; the
//! [`CommandKind`] describes what the user did.

use std::collections::VecDeque;
use std::path::PathBuf;

use daw_transport::{Clip, Track, TrackId};

#[derive(Debug, Clone)]
pub enum CommandKind {
    AddTrack(TrackId),
    DeleteTrack(TrackId),
    AddClip {
        track: TrackId,
        index: usize,
    },
    MoveClip {
        from: TrackId,
        to: TrackId,
        index: usize,
        /// Beats to move by to get back.
        inverse_delta: f64,
    },
    ResizeClip {
        track: TrackId,
        index: usize,
        inverse_delta: f64,
        left_side: bool,
    },
    DeleteClip {
        track: TrackId,
        clip: Clip,
    },
    EditClip {
        track: TrackId,
        index: usize,
    },
    MoveClips {
        count: usize,
        inverse_delta: f64,
    },
    DeleteClips {
        clips: Vec<(TrackId, Clip)>,
    },
    ImportTake {
        path: PathBuf,
        tracks: Vec<TrackId>,
    },
}

impl CommandKind {
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::AddTrack(_) => "add track",
            CommandKind::DeleteTrack(_) => "delete track",
            CommandKind::AddClip { .. } => "add clip",
            CommandKind::MoveClip { .. } => "move clip",
            CommandKind::ResizeClip { .. } => "resize clip",
            CommandKind::DeleteClip { .. } => "delete clip",
            CommandKind::EditClip { .. } => "edit clip",
            CommandKind::MoveClips { .. } => "move clips",
            CommandKind::DeleteClips { .. } => "delete clips",
            CommandKind::ImportTake { .. } => "record",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Change {
    Clips {
        track: TrackId,
        before: Vec<Clip>,
        after: Vec<Clip>,
    },
    TrackAdded {
        index: usize,
        track: Track,
    },
    TrackRemoved {
        index: usize,
        track: Track,
    },
}

#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub changes: Vec<Change>,
}

impl Command {
    pub fn new(kind: CommandKind, changes: Vec<Change>) -> Self {
        Self { kind, changes }
    }
}

/// Bounded undo stack. The oldest command is evicted once capacity is
/// reached; recording a new command discards the redo tail.
#[derive(Debug)]
pub struct CommandHistory {
    commands: VecDeque<Command>,
    /// Number of commands currently applied.
    cursor: usize,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            commands: VecDeque::with_capacity(capacity),
            cursor: 0,
            capacity,
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.truncate(self.cursor);
        if self.commands.len() == self.capacity {
            self.commands.pop_front();
        }
        self.commands.push_back(command);
        self.cursor = self.commands.len();
    }

    /// Step back; returns the command to revert.
    pub fn undo(&mut self) -> Option<&Command> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.commands.get(self.cursor)
    }

    /// Step forward; returns the command to re-apply.
    pub fn redo(&mut self) -> Option<&Command> {
        let command = self.commands.get(self.cursor)?;
        self.cursor += 1;
        Some(command)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.commands.len()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: u64) -> Command {
        Command::new(CommandKind::AddTrack(TrackId(id)), Vec::new())
    }

    fn track_of(command: Option<&Command>) -> Option<u64> {
        match command?.kind {
            CommandKind::AddTrack(id) => Some(id.0),
            _ => None,
        }
    }

    #[test]
    fn undo_redo_walks_the_stack() {
        let mut history = CommandHistory::new(8);
        history.push(command(1));
        history.push(command(2));

        assert_eq!(track_of(history.undo()), Some(2));
        assert_eq!(track_of(history.undo()), Some(1));
        assert!(history.undo().is_none());
        assert_eq!(track_of(history.redo()), Some(1));
        assert!(history.can_redo());
    }

    #[test]
    fn new_command_discards_redo_tail() {
        let mut history = CommandHistory::new(8);
        history.push(command(1));
        history.push(command(2));
        history.undo();
        history.push(command(3));

        assert!(!history.can_redo());
        assert_eq!(history.len(), 2);
        assert_eq!(track_of(history.undo()), Some(3));
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut history = CommandHistory::new(3);
        for id in 1..=5 {
            history.push(command(id));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(track_of(history.undo()), Some(5));
        assert_eq!(track_of(history.undo()), Some(4));
        assert_eq!(track_of(history.undo()), Some(3));
        assert!(history.undo().is_none());
    }
}
