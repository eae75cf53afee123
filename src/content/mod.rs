// src/content/mod.rs
// Session-tagged demo content: boards, tasks, comments. Every record
// carries the session id it was created under as its `tag`; a per-tag
// index makes purging cheap, with a full key scan as fallback when the
// index is missing or stale. Official boards are shared fixtures: they
// are never deleted, only reset to baseline.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::store::{get_json, set_json, KeyValueStore};

pub const TASK_PREFIX: &str = "content:task:";
pub const BOARD_PREFIX: &str = "content:board:";
pub const COMMENT_PREFIX: &str = "content:comment:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardColumn {
    pub name: String,
    /// Terminal columns represent completed work; baseline progress for
    /// tasks sitting in them is 100.
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardRecord {
    pub id: String,
    /// Session id this board was created under.
    pub tag: String,
    #[serde(default)]
    pub official: bool,
    pub name: String,
    pub columns: Vec<BoardColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    pub tag: String,
    pub board_id: String,
    pub column: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub progress: u8,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRecord {
    pub id: String,
    pub tag: String,
    pub task_id: String,
    pub body: String,
}

pub fn task_key(id: &str) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

pub fn board_key(id: &str) -> String {
    format!("{}{}", BOARD_PREFIX, id)
}

pub fn comment_key(id: &str) -> String {
    format!("{}{}", COMMENT_PREFIX, id)
}

fn index_key(tag: &str) -> String {
    format!("content_index:{}", tag)
}

fn index_add<S: KeyValueStore>(store: &S, tag: &str, content_key: &str) -> Result<(), ()> {
    let mut keys =
        get_json::<S, Vec<String>>(store, &index_key(tag))?.unwrap_or_default();
    if !keys.iter().any(|k| k == content_key) {
        keys.push(content_key.to_string());
    }
    set_json(store, &index_key(tag), &keys)
}

pub fn put_board<S: KeyValueStore>(store: &S, board: &BoardRecord) -> Result<(), ()> {
    let key = board_key(&board.id);
    set_json(store, &key, board)?;
    index_add(store, &board.tag, &key)
}

pub fn put_task<S: KeyValueStore>(store: &S, task: &TaskRecord) -> Result<(), ()> {
    let key = task_key(&task.id);
    set_json(store, &key, task)?;
    index_add(store, &task.tag, &key)
}

pub fn put_comment<S: KeyValueStore>(store: &S, comment: &CommentRecord) -> Result<(), ()> {
    let key = comment_key(&comment.id);
    set_json(store, &key, comment)?;
    index_add(store, &comment.tag, &key)
}

#[derive(Debug, Deserialize)]
struct TagOnly {
    tag: String,
}

/// Content keys carrying any of `tags`. Prefers the per-tag indexes;
/// when an index entry is missing the full content keyspace is scanned
/// so historically mis-tagged or unindexed rows are still found.
pub fn keys_tagged<S: KeyValueStore>(store: &S, tags: &HashSet<String>) -> Result<Vec<String>, ()> {
    let mut found: HashSet<String> = HashSet::new();
    let mut any_index_missing = false;

    for tag in tags {
        match get_json::<S, Vec<String>>(store, &index_key(tag))? {
            Some(keys) => found.extend(keys),
            None => any_index_missing = true,
        }
    }

    if any_index_missing {
        for key in store.get_keys()? {
            if !key.starts_with("content:") || found.contains(&key) {
                continue;
            }
            if let Some(record) = get_json::<S, TagOnly>(store, &key)? {
                if tags.contains(&record.tag) {
                    found.insert(key);
                }
            }
        }
    }

    let mut keys: Vec<String> = found.into_iter().collect();
    keys.sort();
    Ok(keys)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub comments_deleted: u32,
    pub tasks_deleted: u32,
    pub boards_deleted: u32,
    pub official_boards_kept: u32,
}

impl PurgeSummary {
    pub fn total_deleted(&self) -> u32 {
        self.comments_deleted + self.tasks_deleted + self.boards_deleted
    }
}

/// Delete everything tagged with one of `tags`, respecting referential
/// order: comments, then tasks, then boards. Official boards survive.
pub fn purge_tagged<S: KeyValueStore>(
    store: &S,
    tags: &HashSet<String>,
) -> Result<PurgeSummary, ()> {
    let keys = keys_tagged(store, tags)?;
    let mut summary = PurgeSummary::default();

    for key in keys.iter().filter(|k| k.starts_with(COMMENT_PREFIX)) {
        store.delete(key)?;
        summary.comments_deleted += 1;
    }
    for key in keys.iter().filter(|k| k.starts_with(TASK_PREFIX)) {
        store.delete(key)?;
        summary.tasks_deleted += 1;
    }
    for key in keys.iter().filter(|k| k.starts_with(BOARD_PREFIX)) {
        match get_json::<S, BoardRecord>(store, key)? {
            Some(board) if board.official => {
                summary.official_boards_kept += 1;
            }
            Some(_) => {
                store.delete(key)?;
                summary.boards_deleted += 1;
            }
            None => {}
        }
    }

    for tag in tags {
        store.delete(&index_key(tag))?;
    }
    Ok(summary)
}

pub fn official_boards<S: KeyValueStore>(store: &S) -> Result<Vec<BoardRecord>, ()> {
    let mut boards = Vec::new();
    for key in store.get_keys()? {
        if !key.starts_with(BOARD_PREFIX) {
            continue;
        }
        if let Some(board) = get_json::<S, BoardRecord>(store, &key)? {
            if board.official {
                boards.push(board);
            }
        }
    }
    Ok(boards)
}

/// Restore an official board's tasks to the canonical baseline: no
/// assignee, progress dictated by the column (terminal 100, rest 0).
/// Returns the number of tasks touched.
pub fn reset_official_board<S: KeyValueStore>(
    store: &S,
    board: &BoardRecord,
) -> Result<u32, ()> {
    let mut touched = 0u32;
    for key in store.get_keys()? {
        if !key.starts_with(TASK_PREFIX) {
            continue;
        }
        let Some(mut task) = get_json::<S, TaskRecord>(store, &key)? else {
            continue;
        };
        if task.board_id != board.id {
            continue;
        }
        let terminal = board
            .columns
            .iter()
            .any(|c| c.terminal && c.name == task.column);
        let baseline_progress = if terminal { 100 } else { 0 };
        if task.assignee.is_some() || task.progress != baseline_progress {
            task.assignee = None;
            task.progress = baseline_progress;
            set_json(store, &key, &task)?;
            touched += 1;
        }
    }
    Ok(touched)
}
