//! Region addressing and cell-update validation.
//!
//! Everything here is pure: parsing never panics and never normalizes, it
//! either yields a well-formed value or says why the input was rejected.
//!
//! Region keys go beyond a plain split on `-`: either coordinate may carry a
//! leading minus, so `"-1--2"` is `(-1, -2)`. The separator is the first `-`
//! that does not open a coordinate.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const REGION_WIDTH: usize = 72;
pub const REGION_HEIGHT: usize = 48;
pub const REGION_CELLS: usize = REGION_WIDTH * REGION_HEIGHT;
pub const MAX_ACTIVE_REGIONS: usize = 32;
pub const BLANK_CELL: char = ' ';

/// Integer address of one block of the grid, written `"<col>-<row>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub col: i32,
    pub row: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionKeyError {
    #[error("region key must have the form <col>-<row>, got {0:?}")]
    Shape(String),
    #[error("region coordinate {0:?} is not a canonical integer")]
    NotInteger(String),
}

impl RegionKey {
    pub const fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// Parse the canonical textual form. Coordinates may be negative, so the
    /// separator is the first `-` that does not start a coordinate.
    pub fn parse(value: &str) -> Result<Self, RegionKeyError> {
        let separator = value
            .char_indices()
            .skip(1)
            .find(|&(idx, ch)| ch == '-' && value.as_bytes()[idx - 1] != b'-')
            .map(|(idx, _)| idx)
            .ok_or_else(|| RegionKeyError::Shape(value.to_string()))?;
        let (col, row) = (&value[..separator], &value[separator + 1..]);
        if col.is_empty() || row.is_empty() {
            return Err(RegionKeyError::Shape(value.to_string()));
        }
        Ok(Self {
            col: parse_coordinate(col)?,
            row: parse_coordinate(row)?,
        })
    }
}

// Only the exact decimal rendering of an i32 is accepted: "3.0", "+3", "03"
// and "-0" are rejected rather than rewritten.
fn parse_coordinate(raw: &str) -> Result<i32, RegionKeyError> {
    match raw.parse::<i32>() {
        Ok(value) if value.to_string() == raw => Ok(value),
        _ => Err(RegionKeyError::NotInteger(raw.to_string())),
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.col, self.row)
    }
}

impl FromStr for RegionKey {
    type Err = RegionKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for RegionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Cell coordinates inside a region, column-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

impl Position {
    /// Row-major offset into a region buffer.
    pub fn offset(&self) -> usize {
        self.y as usize * REGION_WIDTH + self.x as usize
    }
}

/// A validated single-cell edit. Always rebuilt from the client payload so
/// that extra fields never travel further than the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellUpdate {
    pub region: RegionKey,
    pub position: Position,
    pub value: char,
}

/// Validate one raw update object: a region key, an in-bounds integral
/// position and a single-character value.
pub fn validate_update(raw: &Value) -> Option<CellUpdate> {
    let object = raw.as_object()?;
    let region = RegionKey::parse(object.get("region")?.as_str()?).ok()?;
    let position = object.get("position")?.as_object()?;
    let x = integral_coordinate(position.get("x")?, REGION_WIDTH)?;
    let y = integral_coordinate(position.get("y")?, REGION_HEIGHT)?;

    let mut chars = object.get("value")?.as_str()?.chars();
    let value = chars.next()?;
    if chars.next().is_some() {
        return None;
    }

    Some(CellUpdate {
        region,
        position: Position { x, y },
        value,
    })
}

// JSON clients may send `3` or `3.0`; both mean the same cell.
fn integral_coordinate(raw: &Value, bound: usize) -> Option<u32> {
    let value = match raw.as_u64() {
        Some(value) => value,
        None => {
            let float = raw.as_f64()?;
            if float.fract() != 0.0 || float < 0.0 {
                return None;
            }
            float as u64
        }
    };
    if value >= bound as u64 {
        return None;
    }
    u32::try_from(value).ok()
}

/// A region with every cell blank.
pub fn blank_cells() -> Vec<char> {
    vec![BLANK_CELL; REGION_CELLS]
}
