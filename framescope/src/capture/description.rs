//! Process-wide board of interned event descriptions.
//!
//! Descriptions are created once per name and live for the rest of the
//! process, so recorded events can hold a `&'static` reference to them and
//! the wire format can refer to them by a dense numeric id.

use crate::capture::events::Color;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::{Mutex, OnceLock};

#[derive(Debug)]
pub struct EventDescription {
    id: u32,
    name: String,
    file: &'static str,
    line: u32,
    color: Color,
}

#[derive(Default)]
struct DescriptionBoard {
    by_name: HashMap<String, &'static EventDescription>,
    by_id: Vec<&'static EventDescription>,
}

fn board() -> &'static Mutex<DescriptionBoard> {
    static BOARD: OnceLock<Mutex<DescriptionBoard>> = OnceLock::new();
    BOARD.get_or_init(|| Mutex::new(DescriptionBoard::default()))
}

impl EventDescription {
    /// Intern a description by `name`. The first registration of a name fixes
    /// its file, line and color; later calls return the same description.
    pub fn create(
        name: &str,
        file: &'static str,
        line: u32,
        color: Color,
    ) -> &'static EventDescription {
        let mut board = board().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&existing) = board.by_name.get(name) {
            return existing;
        }
        let description: &'static EventDescription = Box::leak(Box::new(EventDescription {
            id: board.by_id.len() as u32,
            name: name.to_owned(),
            file,
            line,
            color,
        }));
        board.by_id.push(description);
        board.by_name.insert(name.to_owned(), description);
        description
    }

    /// Intern a description located at the caller.
    #[track_caller]
    pub fn here(name: &str, color: Color) -> &'static EventDescription {
        let location = Location::caller();
        Self::create(name, location.file(), location.line(), color)
    }

    pub fn get(id: u32) -> Option<&'static EventDescription> {
        let board = board().lock().unwrap_or_else(|e| e.into_inner());
        board.by_id.get(id as usize).copied()
    }

    pub fn count() -> usize {
        board().lock().unwrap_or_else(|e| e.into_inner()).by_id.len()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn color(&self) -> Color {
        self.color
    }
}
