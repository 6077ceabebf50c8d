//! Keyset pagination shared by every list query.
//!
//! Stores receive a [`KeysetWindow`] and return at most `limit + 1` rows in
//! window order; [`Page::from_rows`] trims the probe row, restores ascending
//! order and mints the cursors for the neighbouring pages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cursor::{self, CursorError, CursorKey};

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("limit must be >= 0, got {0}")]
    InvalidLimit(i64),
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: i64,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

impl PageRequest {
    pub fn first(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn after(limit: i64, cursor: &str) -> Self {
        Self {
            limit,
            next_cursor: Some(cursor.to_string()),
            prev_cursor: None,
        }
    }

    pub fn before(limit: i64, cursor: &str) -> Self {
        Self {
            limit,
            next_cursor: None,
            prev_cursor: Some(cursor.to_string()),
        }
    }

    /// Resolves the request into a window. `next_cursor` wins when both are set.
    pub fn window<K: CursorKey>(&self) -> Result<KeysetWindow<K>, PaginationError> {
        let limit = match self.limit {
            l if l < 0 => return Err(PaginationError::InvalidLimit(l)),
            0 => DEFAULT_LIMIT,
            l => l as usize,
        };

        if let Some(token) = self.next_cursor.as_deref().filter(|t| !t.is_empty()) {
            return Ok(KeysetWindow {
                after: Some(cursor::decode(token)?),
                before: None,
                direction: Direction::Forward,
                limit,
            });
        }
        if let Some(token) = self.prev_cursor.as_deref().filter(|t| !t.is_empty()) {
            return Ok(KeysetWindow {
                after: None,
                before: Some(cursor::decode(token)?),
                direction: Direction::Backward,
                limit,
            });
        }
        Ok(KeysetWindow::first_page(limit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending, strictly after `after`.
    Forward,
    /// Descending, strictly before `before`.
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetWindow<K> {
    pub after: Option<K>,
    pub before: Option<K>,
    pub direction: Direction,
    pub limit: usize,
}

impl<K> KeysetWindow<K> {
    pub fn first_page(limit: usize) -> Self {
        Self {
            after: None,
            before: None,
            direction: Direction::Forward,
            limit,
        }
    }

    /// Rows a store should return: one extra to detect a further page.
    pub fn fetch_size(&self) -> usize {
        self.limit + 1
    }

    pub fn is_descending(&self) -> bool {
        self.direction == Direction::Backward
    }
}

impl<K: Ord> KeysetWindow<K> {
    pub fn admits(&self, key: &K) -> bool {
        self.after.as_ref().map_or(true, |a| key > a) && self.before.as_ref().map_or(true, |b| key < b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn from_rows<K, F>(mut rows: Vec<T>, window: &KeysetWindow<K>, key_of: F) -> Result<Self, CursorError>
    where
        K: CursorKey,
        F: Fn(&T) -> K,
    {
        let has_more = rows.len() > window.limit;
        rows.truncate(window.limit);
        let first = |rows: &[T]| rows.first().map(|r| cursor::encode(&key_of(r))).transpose();
        let last = |rows: &[T]| rows.last().map(|r| cursor::encode(&key_of(r))).transpose();

        Ok(match window.direction {
            Direction::Forward => {
                let next_cursor = if has_more { last(&rows)? } else { None };
                let prev_cursor = if window.after.is_some() { first(&rows)? } else { None };
                Page { items: rows, next_cursor, prev_cursor }
            }
            Direction::Backward => {
                rows.reverse();
                let prev_cursor = if has_more { first(&rows)? } else { None };
                let next_cursor = last(&rows)?;
                Page { items: rows, next_cursor, prev_cursor }
            }
        })
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
            prev_cursor: self.prev_cursor,
        }
    }
}
