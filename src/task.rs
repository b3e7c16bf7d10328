use rusqlite::{Row, Statement};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::row::{column, RowDecoder};
use crate::sqlite::{Params, SqlQuery};

pub const TASKS_TABLE: &str = "tasks";

const MILLIS_PER_DAY: i64 = 86_400_000;

/// A persisted to-do item.
///
/// `id == 0` means "not yet assigned"; the store picks the next id on insert.
/// `created_at` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub text: String,
    pub completed: bool,
    pub created_at: i64,
}

impl Task {
    /// An unsaved, incomplete task stamped with the current time.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: 0,
            text: text.into(),
            completed: false,
            created_at: now_millis(),
        }
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// The same task with `completed` flipped.
    pub fn toggled(&self) -> Self {
        Self {
            completed: !self.completed,
            ..self.clone()
        }
    }

    /// Column values in `id, text, completed, createdAt` order. An unassigned
    /// id binds as NULL so SQLite allocates one.
    pub fn to_params(&self) -> Params {
        Params::new()
            .with_value((self.id != 0).then_some(self.id))
            .with_value(self.text.as_str())
            .with_value(self.completed)
            .with_value(self.created_at)
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// UTC midnight at or before `millis`.
pub fn start_of_day(millis: i64) -> i64 {
    millis - millis.rem_euclid(MILLIS_PER_DAY)
}

/// Decodes `tasks` rows.
pub struct TaskColumns {
    id: usize,
    text: usize,
    completed: usize,
    created_at: usize,
}

impl RowDecoder for TaskColumns {
    type Output = Task;

    fn resolve(stmt: &Statement<'_>) -> Result<Self> {
        Ok(Self {
            id: column(stmt, "id")?,
            text: column(stmt, "text")?,
            completed: column(stmt, "completed")?,
            created_at: column(stmt, "createdAt")?,
        })
    }

    fn decode(&self, row: &Row<'_>) -> Result<Task> {
        Ok(Task {
            id: row.get(self.id)?,
            text: row.get(self.text)?,
            completed: row.get(self.completed)?,
            created_at: row.get(self.created_at)?,
        })
    }
}

/// Statements over the `tasks` table.
pub mod queries {
    use super::*;

    const COLUMNS: &str = "id, text, completed, createdAt";

    pub fn upsert(task: &Task) -> SqlQuery {
        SqlQuery::new(&format!(
            "INSERT OR REPLACE INTO tasks ({COLUMNS}) VALUES (?1, ?2, ?3, ?4)"
        ))
        .with_params(task.to_params())
    }

    pub fn update(task: &Task) -> SqlQuery {
        SqlQuery::new(
            "UPDATE tasks SET id = ?1, text = ?2, completed = ?3, createdAt = ?4 WHERE id = ?1",
        )
        .with_params(task.to_params())
    }

    pub fn delete(task: &Task) -> SqlQuery {
        SqlQuery::new("DELETE FROM tasks WHERE id = ?1").bind(task.id)
    }

    pub fn all() -> SqlQuery {
        SqlQuery::new(&format!(
            "SELECT {COLUMNS} FROM tasks ORDER BY createdAt DESC, id DESC"
        ))
        .reads(TASKS_TABLE)
    }

    pub fn page(limit: u32, offset: u32) -> SqlQuery {
        SqlQuery::new(&format!(
            "SELECT {COLUMNS} FROM tasks ORDER BY createdAt DESC, id DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(offset)
        .reads(TASKS_TABLE)
    }

    pub fn count_since(timestamp: i64) -> SqlQuery {
        SqlQuery::new("SELECT COUNT(*) FROM tasks WHERE createdAt >= ?1")
            .bind(timestamp)
            .reads(TASKS_TABLE)
    }

    pub fn completed_count() -> SqlQuery {
        SqlQuery::new("SELECT COUNT(*) FROM tasks WHERE completed = 1").reads(TASKS_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::Value;

    #[test]
    fn unassigned_id_binds_null() {
        let params = Task::new("write tests").with_created_at(5).to_params();
        assert_eq!(
            params.values,
            vec![
                Value::Null,
                Value::Text("write tests".into()),
                Value::Boolean(false),
                Value::Integer(5),
            ]
        );
        assert_eq!(Task::new("x").with_id(9).to_params().values[0], Value::Integer(9));
    }

    #[test]
    fn toggled_only_flips_completed() {
        let task = Task::new("ship").with_id(3).with_created_at(10);
        let done = task.toggled();
        assert!(done.completed);
        assert_eq!(done.toggled(), task);
    }

    #[test]
    fn start_of_day_truncates_to_utc_midnight() {
        let noon = 19_000 * MILLIS_PER_DAY + MILLIS_PER_DAY / 2;
        assert_eq!(start_of_day(noon), 19_000 * MILLIS_PER_DAY);
        assert_eq!(start_of_day(19_000 * MILLIS_PER_DAY), 19_000 * MILLIS_PER_DAY);
        assert_eq!(start_of_day(-1), -MILLIS_PER_DAY);
    }
}
