//! Result accumulator filled by protocol definitions
//!
//! A [`QueryResult`] holds flat key/value settings plus two ordered lists of
//! sub-records (players and teams). Keys keep their insertion order so output
//! is stable across runs.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;

/// Scalar value stored in a record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Float(v) => Some(*v as i64),
            Value::Text(v) => v.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(_) => None,
            Value::Text(v) => v.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

macro_rules! value_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Int(i64::from(value))
            }
        })*
    };
}

value_from_int!(u8, i8, u16, i16, u32, i32, i64);

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Text(value.to_string()),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// Insertion-ordered key/value mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`; a duplicate key is overwritten in place (last write wins)
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.fields.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copies every field of `other` into this record
    pub fn extend(&mut self, other: Record) {
        for (key, value) in other.fields {
            self.insert(key, value);
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.insert(key, value);
        }
        record
    }
}

/// Which repeated sub-record list a column-oriented write goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubGroup {
    Players,
    Teams,
}

/// Everything a protocol definition learned about one server
///
/// Only the definition's parsers write here; the engine reads it afterwards.
/// Record boundaries inside `players`/`teams` are decided by the caller:
/// [`QueryResult::new_player`] opens a fresh entry, [`QueryResult::add_player`]
/// writes into the latest one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    #[serde(flatten)]
    general: Record,
    players: Vec<Record>,
    teams: Vec<Record>,
}

impl QueryResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.general.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.general.get(key)
    }

    pub fn general(&self) -> &Record {
        &self.general
    }

    pub fn players(&self) -> &[Record] {
        &self.players
    }

    pub fn teams(&self) -> &[Record] {
        &self.teams
    }

    pub fn new_player(&mut self) -> &mut Record {
        self.players.push(Record::new());
        let last = self.players.len() - 1;
        &mut self.players[last]
    }

    pub fn new_team(&mut self) -> &mut Record {
        self.teams.push(Record::new());
        let last = self.teams.len() - 1;
        &mut self.teams[last]
    }

    /// Adds a field to the most recent player, opening one if none exists
    pub fn add_player(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if self.players.is_empty() {
            self.players.push(Record::new());
        }
        let last = self.players.len() - 1;
        self.players[last].insert(key, value);
    }

    /// Adds a field to the most recent team, opening one if none exists
    pub fn add_team(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if self.teams.is_empty() {
            self.teams.push(Record::new());
        }
        let last = self.teams.len() - 1;
        self.teams[last].insert(key, value);
    }

    /// Column-oriented write for protocols that send one field for every
    /// player before moving on to the next field: the value lands in the first
    /// entry that lacks `key`, or in a new entry when all of them have it.
    pub fn add_column(&mut self, group: SubGroup, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let entries = match group {
            SubGroup::Players => &mut self.players,
            SubGroup::Teams => &mut self.teams,
        };
        match entries.iter_mut().find(|entry| !entry.contains_key(&key)) {
            Some(entry) => entry.insert(key, value),
            None => {
                let mut entry = Record::new();
                entry.insert(key, value);
                entries.push(entry);
            }
        }
    }

    /// Merges a later phase into this one: settings overwrite, sub-records append
    pub fn merge(&mut self, other: QueryResult) {
        self.general.extend(other.general);
        self.players.extend(other.players);
        self.teams.extend(other.teams);
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.players.is_empty() && self.teams.is_empty()
    }

    /// Visits every value, general settings first, then players, then teams
    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        let records = std::iter::once(&mut self.general)
            .chain(self.players.iter_mut())
            .chain(self.teams.iter_mut());
        for record in records {
            for (_, value) in record.iter_mut() {
                f(value);
            }
        }
    }

    pub(crate) fn from_parts(general: Record, players: Vec<Record>, teams: Vec<Record>) -> Self {
        Self {
            general,
            players,
            teams,
        }
    }
}
