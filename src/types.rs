use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker value of a row that has never been leased.
pub const UNASSIGNED: &str = "unassigned";

/// `locked_until` of a row that has never been leased.
pub const UNLOCKED: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// One row of the jobs table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct JobRow {
    pub id: i64,
    pub queue: String,
    pub data: String,
    pub worker: String,
    pub locked_until: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl JobRow {
    /// A row can be claimed once its lease is strictly in the past.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.locked_until < now
    }
}

/// Set of queue names an operation applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNames(Vec<String>);

impl QueueNames {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.0.iter().any(|name| name == queue)
    }
}

impl std::fmt::Display for QueueNames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl From<&str> for QueueNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for QueueNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<&String> for QueueNames {
    fn from(name: &String) -> Self {
        Self(vec![name.clone()])
    }
}

impl From<Vec<String>> for QueueNames {
    fn from(names: Vec<String>) -> Self {
        Self(dedup(names))
    }
}

impl From<Vec<&str>> for QueueNames {
    fn from(names: Vec<&str>) -> Self {
        names.as_slice().into()
    }
}

impl From<&[&str]> for QueueNames {
    fn from(names: &[&str]) -> Self {
        Self(dedup(names.iter().map(|name| name.to_string()).collect()))
    }
}

impl<const N: usize> From<[&str; N]> for QueueNames {
    fn from(names: [&str; N]) -> Self {
        names.as_slice().into()
    }
}

impl From<&QueueNames> for QueueNames {
    fn from(names: &QueueNames) -> Self {
        names.clone()
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}
