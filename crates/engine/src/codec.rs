//! Checklist text codec and the in-memory document model.
//!
//! The grammar is one item per line: `- [<flag>] <text>` where `<flag>` is a
//! space (open) or `x`/`X` (done).  Blank lines are skipped on parse and never
//! emitted on serialize.  Parsing is all-or-nothing: the first bad line aborts
//! the whole document.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LineError;

/// Leading marker shared with the vault scanner.
pub const ITEM_MARKER: &str = "- [";

/// Session-local item identity.  Fresh on every parse; never derived from
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.0.to_string();
        f.write_str(&full[..8])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: ItemId,
    pub text: String,
    pub completed: bool,
    pub order: usize,
    /// Flag character as read from the source line.
    #[serde(skip)]
    flag: char,
}

impl ChecklistItem {
    /// The source flag is kept while it still agrees with `completed`, so an
    /// untouched `X` is written back as `X`.
    pub fn to_line(&self) -> String {
        let flag = match (self.completed, self.flag) {
            (true, flag @ ('x' | 'X')) => flag,
            (true, _) => 'x',
            (false, _) => ' ',
        };
        format!("{ITEM_MARKER}{flag}] {}", self.text)
    }

    fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
        self.flag = if completed { 'x' } else { ' ' };
    }
}

/// A parsed checklist line before it is given an id and position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub completed: bool,
    pub flag: char,
    pub text: &'a str,
}

/// Match a single line against the checklist grammar.
///
/// Returns a human-readable reason on mismatch; the caller attaches the line
/// number.
pub fn parse_line(line: &str) -> std::result::Result<ParsedLine<'_>, String> {
    let Some(rest) = line.strip_prefix(ITEM_MARKER) else {
        return Err(format!("expected a line starting with `{ITEM_MARKER}`"));
    };
    let mut chars = rest.chars();
    let (completed, flag) = match chars.next() {
        Some(' ') => (false, ' '),
        Some(flag @ ('x' | 'X')) => (true, flag),
        Some(other) => {
            return Err(format!(
                "invalid completion flag `{other}` (expected space, `x` or `X`)"
            ));
        }
        None => return Err("line ends before the completion flag".to_string()),
    };
    let Some(text) = chars.as_str().strip_prefix("] ") else {
        return Err("expected `] ` after the completion flag".to_string());
    };
    Ok(ParsedLine {
        completed,
        flag,
        text,
    })
}

/// Parse a whole checklist document.
pub fn parse(text: &str) -> Result<Vec<ChecklistItem>, LineError> {
    let mut items = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = parse_line(line).map_err(|message| LineError {
            line: idx + 1,
            message,
        })?;
        items.push(ChecklistItem {
            id: ItemId::new(),
            text: parsed.text.to_string(),
            completed: parsed.completed,
            order: items.len(),
            flag: parsed.flag,
        });
    }
    Ok(items)
}

/// Render items in ascending `order`, newline-joined, no trailing newline.
pub fn serialize(items: &[ChecklistItem]) -> String {
    let mut sorted: Vec<&ChecklistItem> = items.iter().collect();
    sorted.sort_by_key(|item| item.order);
    sorted
        .iter()
        .map(|item| item.to_line())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ordered checklist whose `order` fields stay dense after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistDocument {
    items: Vec<ChecklistItem>,
}

impl ChecklistDocument {
    pub fn parse(text: &str) -> Result<Self, LineError> {
        parse(text).map(|items| Self { items })
    }

    pub fn from_items(mut items: Vec<ChecklistItem>) -> Self {
        items.sort_by_key(|item| item.order);
        let mut doc = Self { items };
        doc.renumber();
        doc
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: ItemId) -> Option<&ChecklistItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&ChecklistItem> {
        self.items.get(index)
    }

    pub fn to_text(&self) -> String {
        serialize(&self.items)
    }

    /// Flip an item's completion flag.  Returns the new state.
    pub fn toggle(&mut self, id: ItemId) -> Option<bool> {
        let item = self.items.iter_mut().find(|item| item.id == id)?;
        item.set_completed(!item.completed);
        Some(item.completed)
    }

    pub fn set_completed(&mut self, id: ItemId, completed: bool) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.set_completed(completed);
                true
            }
            None => false,
        }
    }

    /// Replace an item's label.  Labels are single-line.  `Ok(false)` when
    /// no item has `id`.
    pub fn rename(&mut self, id: ItemId, text: impl Into<String>) -> Result<bool, LineError> {
        let text = text.into();
        let Some(pos) = self.position(id) else {
            return Ok(false);
        };
        check_label(&text, pos + 1)?;
        self.items[pos].text = text;
        Ok(true)
    }

    /// Insert a new open item at `index` (clamped to the end).
    pub fn insert(&mut self, index: usize, text: impl Into<String>) -> Result<ItemId, LineError> {
        let text = text.into();
        let index = index.min(self.items.len());
        check_label(&text, index + 1)?;
        let id = ItemId::new();
        self.items.insert(
            index,
            ChecklistItem {
                id,
                text,
                completed: false,
                order: index,
                flag: ' ',
            },
        );
        self.renumber();
        Ok(id)
    }

    pub fn push(&mut self, text: impl Into<String>) -> Result<ItemId, LineError> {
        self.insert(self.items.len(), text)
    }

    pub fn remove(&mut self, id: ItemId) -> Option<ChecklistItem> {
        let pos = self.position(id)?;
        let removed = self.items.remove(pos);
        self.renumber();
        Some(removed)
    }

    /// Move an item to `new_index` (clamped), shifting the others.
    pub fn move_item(&mut self, id: ItemId, new_index: usize) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let item = self.items.remove(pos);
        let new_index = new_index.min(self.items.len());
        self.items.insert(new_index, item);
        self.renumber();
        true
    }

    /// Carry ids over from a previous version of the document where the item
    /// at the same position has the same label.  Keeps identity stable for
    /// unchanged rows after a full reparse.
    pub fn reconcile_ids(&mut self, previous: &ChecklistDocument) -> usize {
        let mut reused = 0;
        for (item, old) in self.items.iter_mut().zip(previous.items.iter()) {
            if item.text == old.text {
                item.id = old.id;
                reused += 1;
            }
        }
        reused
    }

    fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn renumber(&mut self) {
        for (idx, item) in self.items.iter_mut().enumerate() {
            item.order = idx;
        }
    }
}

fn check_label(text: &str, line: usize) -> Result<(), LineError> {
    if text.contains('\n') || text.contains('\r') {
        return Err(LineError {
            line,
            message: "item text must not contain a line break".to_string(),
        });
    }
    Ok(())
}

/// What the orchestrator exposes for the current document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentView {
    Items(ChecklistDocument),
    /// Raw-edit fallback for text that does not follow the grammar.
    Raw { text: String, error: LineError },
}

impl DocumentView {
    /// Parse `text`, falling back to raw-edit mode on a grammar violation.
    pub fn from_text(text: &str) -> Self {
        match ChecklistDocument::parse(text) {
            Ok(doc) => Self::Items(doc),
            Err(error) => Self::Raw {
                text: text.to_string(),
                error,
            },
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Self::Items(doc) => doc.to_text(),
            Self::Raw { text, .. } => text.clone(),
        }
    }

    pub fn checklist(&self) -> Option<&ChecklistDocument> {
        match self {
            Self::Items(doc) => Some(doc),
            Self::Raw { .. } => None,
        }
    }

    pub fn checklist_mut(&mut self) -> Option<&mut ChecklistDocument> {
        match self {
            Self::Items(doc) => Some(doc),
            Self::Raw { .. } => None,
        }
    }

    pub fn format_error(&self) -> Option<&LineError> {
        match self {
            Self::Items(_) => None,
            Self::Raw { error, .. } => Some(error),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. })
    }

    /// Replace the raw text.  Leaves raw-edit mode once the text parses.
    pub fn set_raw_text(&mut self, text: impl Into<String>) {
        *self = Self::from_text(&text.into());
    }
}
