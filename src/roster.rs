//! Editable recipient table with a bounded undo/redo history.
//!
//! The roster is what a user reviews before rendering: clean records first,
//! flagged records after them grouped by flag, each row numbered from 1.
//! Editing a flagged row counts as resolving the collision and clears its
//! flags, so the row becomes eligible for rendering and mailing.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::userlist::{split_flagged, Recipient, UserRecord};

/// Number of edits kept for undo.
pub const HISTORY_CAPACITY: usize = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("row {index} is out of range (roster has {len} rows)")]
    OutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Name,
    Email,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryStatus::Pending => "",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRow {
    /// 1-based position in the roster.
    pub index: usize,
    pub name: String,
    pub email: String,
    pub flags: String,
    pub status: DeliveryStatus,
}

impl RosterRow {
    fn from_record(record: UserRecord) -> Self {
        Self {
            index: 0,
            name: record.name,
            email: record.email,
            flags: record.flags,
            status: DeliveryStatus::Pending,
        }
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    fn cell_mut(&mut self, column: Column) -> &mut String {
        match column {
            Column::Name => &mut self.name,
            Column::Email => &mut self.email,
        }
    }
}

/// A recorded mutation. Positions are 0-based offsets into the row vector.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Edit {
    Insert {
        position: usize,
        row: RosterRow,
    },
    Delete {
        position: usize,
        row: RosterRow,
    },
    Edit {
        position: usize,
        column: Column,
        old: String,
        new: String,
        old_flags: String,
    },
}

#[derive(Debug, Default)]
pub struct Roster {
    rows: Vec<RosterRow>,
    undo: VecDeque<Edit>,
    redo: Vec<Edit>,
}

impl Roster {
    pub fn from_ulist(ulist: &[UserRecord]) -> Self {
        let (clean, flagged) = split_flagged(ulist);
        let rows = clean
            .into_iter()
            .chain(flagged)
            .map(RosterRow::from_record)
            .collect();
        let mut roster = Self {
            rows,
            ..Self::default()
        };
        roster.reindex();
        roster
    }

    pub fn rows(&self) -> &[RosterRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RosterRow> {
        index.checked_sub(1).and_then(|pos| self.rows.get(pos))
    }

    pub fn flagged_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_flagged()).count()
    }

    /// Insert a blank-flagged row so that it ends up at `index`.
    /// `index == len() + 1` appends.
    pub fn insert(
        &mut self,
        index: usize,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Result<(), RosterError> {
        if index == 0 || index > self.rows.len() + 1 {
            return Err(self.out_of_range(index));
        }
        let row = RosterRow {
            index,
            name: name.into().trim().to_string(),
            email: email.into().trim().to_string(),
            flags: String::new(),
            status: DeliveryStatus::Pending,
        };
        self.record(Edit::Insert {
            position: index - 1,
            row,
        });
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<RosterRow, RosterError> {
        let position = self.position(index)?;
        let row = self.rows[position].clone();
        self.record(Edit::Delete {
            position,
            row: row.clone(),
        });
        Ok(row)
    }

    /// Change one cell. Returns `false` when the value is unchanged, in which
    /// case nothing is recorded and flags are kept.
    pub fn edit(
        &mut self,
        index: usize,
        column: Column,
        value: impl Into<String>,
    ) -> Result<bool, RosterError> {
        let position = self.position(index)?;
        let new = value.into().trim().to_string();
        let row = &mut self.rows[position];
        let old = row.cell_mut(column).clone();
        if old == new {
            return Ok(false);
        }
        let old_flags = row.flags.clone();
        self.record(Edit::Edit {
            position,
            column,
            old,
            new,
            old_flags,
        });
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(edit) = self.undo.pop_back() else {
            return false;
        };
        self.revert(&edit);
        self.redo.push(edit);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(edit) = self.redo.pop() else {
            return false;
        };
        self.apply(&edit);
        self.undo.push_back(edit);
        true
    }

    /// Rows that are ready to be rendered and mailed.
    pub fn valid_entries(&self) -> Vec<Recipient> {
        self.rows
            .iter()
            .filter(|row| !row.is_flagged() && !row.name.is_empty() && !row.email.is_empty())
            .map(|row| Recipient::new(row.index, row.name.clone(), row.email.clone()))
            .collect()
    }

    pub fn mark_delivery(&mut self, index: usize, success: bool) -> Result<(), RosterError> {
        let position = self.position(index)?;
        self.rows[position].status = if success {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        Ok(())
    }

    fn record(&mut self, edit: Edit) {
        self.apply(&edit);
        self.redo.clear();
        self.undo.push_back(edit);
        while self.undo.len() > HISTORY_CAPACITY {
            self.undo.pop_front();
        }
    }

    fn apply(&mut self, edit: &Edit) {
        match edit {
            Edit::Insert { position, row } => {
                self.rows.insert(*position, row.clone());
                self.reindex();
            }
            Edit::Delete { position, .. } => {
                self.rows.remove(*position);
                self.reindex();
            }
            Edit::Edit {
                position,
                column,
                new,
                ..
            } => {
                let row = &mut self.rows[*position];
                *row.cell_mut(*column) = new.clone();
                row.flags.clear();
            }
        }
    }

    fn revert(&mut self, edit: &Edit) {
        match edit {
            Edit::Insert { position, .. } => {
                self.rows.remove(*position);
                self.reindex();
            }
            Edit::Delete { position, row } => {
                self.rows.insert(*position, row.clone());
                self.reindex();
            }
            Edit::Edit {
                position,
                column,
                old,
                old_flags,
                ..
            } => {
                let row = &mut self.rows[*position];
                *row.cell_mut(*column) = old.clone();
                row.flags = old_flags.clone();
            }
        }
    }

    fn reindex(&mut self) {
        for (pos, row) in self.rows.iter_mut().enumerate() {
            row.index = pos + 1;
        }
    }

    fn position(&self, index: usize) -> Result<usize, RosterError> {
        match index.checked_sub(1) {
            Some(pos) if pos < self.rows.len() => Ok(pos),
            _ => Err(self.out_of_range(index)),
        }
    }

    fn out_of_range(&self, index: usize) -> RosterError {
        RosterError::OutOfRange {
            index,
            len: self.rows.len(),
        }
    }
}
