//! `bulletin` plugin: a small in-memory bulletin board.
//!
//! Commands: `boards`, `board [name]`, `post <text>`, `read [n]`. Each
//! caller's active board lives in a [`SessionStore`] keyed by node id, so a
//! node that goes quiet for the session TTL drops back to the default board.
//! The `digest` method summarizes posts since the previous digest and is
//! meant to be driven by a PLUGIN_CALL scheduled broadcast.
//!
//! Settings (`[plugins.settings.bulletin]`):
//! `boards` (default `["general"]`), `max_posts_per_board` (50),
//! `session_ttl_seconds` (3600, 0 keeps sessions until restart).

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::plugin::{Plugin, PluginCallResult, PluginContext, PluginMetadata, SessionStore};
use crate::router::{command_fn, HandlerContext, HandlerOutcome};
use crate::scheduler::task_fn;
use crate::validation::truncate_utf8;

const DEFAULT_BOARD: &str = "general";
const MAX_POST_BYTES: usize = 160;
const MAX_READ: usize = 10;

#[derive(Debug, Clone)]
struct Post {
    id: u64,
    author: String,
    text: String,
    at: DateTime<Utc>,
}

#[derive(Debug)]
struct BoardSet {
    boards: BTreeMap<String, VecDeque<Post>>,
    max_posts: usize,
    next_id: u64,
    last_digest: Option<DateTime<Utc>>,
}

impl BoardSet {
    fn post(&mut self, board: &str, author: &str, text: &str) -> Option<u64> {
        let max = self.max_posts.max(1);
        let posts = self.boards.get_mut(board)?;
        self.next_id += 1;
        posts.push_back(Post {
            id: self.next_id,
            author: author.to_string(),
            text: truncate_utf8(text, MAX_POST_BYTES).to_string(),
            at: Utc::now(),
        });
        while posts.len() > max {
            posts.pop_front();
        }
        Some(self.next_id)
    }

    fn digest(&mut self, only: Option<&str>, now: DateTime<Utc>) -> Vec<(String, usize)> {
        let since = self.last_digest;
        self.last_digest = Some(now);
        self.boards
            .iter()
            .filter(|(name, _)| only.map_or(true, |b| b == name.as_str()))
            .map(|(name, posts)| {
                let fresh = posts
                    .iter()
                    .filter(|p| since.map_or(true, |s| p.at > s))
                    .count();
                (name.clone(), fresh)
            })
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

type Boards = Arc<Mutex<BoardSet>>;

fn lock(boards: &Boards) -> MutexGuard<'_, BoardSet> {
    boards.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BulletinPlugin {
    boards: Boards,
    sessions: RwLock<Arc<SessionStore<String>>>,
}

impl Default for BulletinPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl BulletinPlugin {
    pub fn new() -> Self {
        let mut boards = BTreeMap::new();
        boards.insert(DEFAULT_BOARD.to_string(), VecDeque::new());
        Self {
            boards: Arc::new(Mutex::new(BoardSet {
                boards,
                max_posts: 50,
                next_id: 0,
                last_digest: None,
            })),
            sessions: RwLock::new(Arc::new(SessionStore::new(None))),
        }
    }

    fn sessions(&self) -> Arc<SessionStore<String>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn active_board(sessions: &SessionStore<String>, ctx: &HandlerContext) -> String {
    sessions
        .get(&ctx.sender_id)
        .unwrap_or_else(|| DEFAULT_BOARD.to_string())
}

fn list_boards(boards: &Boards) -> String {
    let set = lock(boards);
    let names: Vec<String> = set
        .boards
        .iter()
        .map(|(name, posts)| format!("{}({})", name, posts.len()))
        .collect();
    format!("Boards: {}", names.join(" "))
}

fn read_posts(boards: &Boards, board: &str, count: usize) -> String {
    let set = lock(boards);
    let Some(posts) = set.boards.get(board) else {
        return format!("No board '{board}'");
    };
    if posts.is_empty() {
        return format!("{board}: no posts");
    }
    let skip = posts.len().saturating_sub(count);
    let lines: Vec<String> = posts
        .iter()
        .skip(skip)
        .map(|p| format!("#{} {}: {}", p.id, p.author, p.text))
        .collect();
    format!("{}: {}", board, lines.join(" | "))
}

#[async_trait]
impl Plugin for BulletinPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("bulletin", env!("CARGO_PKG_VERSION"), "In-memory bulletin boards")
            .author("meshgate")
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["core".to_string()]
    }

    async fn initialize(&self, ctx: &PluginContext) -> Result<bool> {
        {
            let mut set = lock(&self.boards);
            if let Some(max) = ctx.setting::<usize>("max_posts_per_board") {
                set.max_posts = max;
            }
            for name in ctx.setting::<Vec<String>>("boards").unwrap_or_default() {
                set.boards.entry(name.to_lowercase()).or_default();
            }
        }
        let ttl = ctx
            .setting::<u64>("session_ttl_seconds")
            .unwrap_or(3600);
        let sessions = Arc::new(SessionStore::new(
            (ttl > 0).then(|| Duration::from_secs(ttl)),
        ));
        *self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sessions.clone();

        let priority = self.metadata().priority;

        let boards = self.boards.clone();
        ctx.register_command(
            "boards",
            "boards - list bulletin boards",
            priority,
            command_fn(move |_args, _msg| {
                let reply = list_boards(&boards);
                async move { HandlerOutcome::reply(reply) }
            }),
        )
        .await?;

        let (boards, store) = (self.boards.clone(), sessions.clone());
        ctx.register_command(
            "board",
            "board [name] - show or switch board",
            priority,
            command_fn(move |args, msg| {
                let reply = match args.first() {
                    None => format!("Active board: {}", active_board(&store, &msg)),
                    Some(name) => {
                        let name = name.to_lowercase();
                        if lock(&boards).boards.contains_key(&name) {
                            store.set(&msg.sender_id, name.clone());
                            format!("Now on {name}")
                        } else {
                            format!("No board '{name}'. Try: boards")
                        }
                    }
                };
                async move { HandlerOutcome::reply(reply) }
            }),
        )
        .await?;

        let (boards, store) = (self.boards.clone(), sessions.clone());
        ctx.register_command(
            "post",
            "post <text> - post to the active board",
            priority,
            command_fn(move |args, msg| {
                let outcome = if args.is_empty() {
                    HandlerOutcome::reply("Usage: post <text>")
                } else {
                    let board = active_board(&store, &msg);
                    match lock(&boards).post(&board, &msg.sender_id, &args.join(" ")) {
                        Some(id) => HandlerOutcome::reply(format!("Posted #{id} to {board}")),
                        None => HandlerOutcome::error(format!("board {board} no longer exists")),
                    }
                };
                async move { outcome }
            }),
        )
        .await?;

        let (boards, store) = (self.boards.clone(), sessions.clone());
        ctx.register_command(
            "read",
            "read [n] - last n posts (default 3)",
            priority,
            command_fn(move |args, msg| {
                let count = args
                    .first()
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(3)
                    .clamp(1, MAX_READ);
                let reply = read_posts(&boards, &active_board(&store, &msg), count);
                async move { HandlerOutcome::reply(reply) }
            }),
        )
        .await?;

        let store = sessions.clone();
        ctx.register_scheduled_task(
            "bulletin session purge",
            300,
            task_fn(move || {
                let purged = store.purge_expired();
                async move {
                    if purged > 0 {
                        debug!("bulletin: purged {} idle sessions", purged);
                    }
                    Ok(())
                }
            }),
        )
        .await?;
        Ok(true)
    }

    async fn get_status(&self) -> Map<String, Value> {
        let (boards, posts) = {
            let set = lock(&self.boards);
            (
                set.boards.len(),
                set.boards.values().map(VecDeque::len).sum::<usize>(),
            )
        };
        let mut status = Map::new();
        status.insert("boards".into(), Value::from(boards));
        status.insert("posts".into(), Value::from(posts));
        status.insert("sessions".into(), Value::from(self.sessions().len()));
        status
    }

    async fn call(&self, method: &str, args: &Map<String, Value>) -> Result<PluginCallResult> {
        match method {
            "digest" => {
                let only = args.get("board").and_then(Value::as_str);
                let fresh = lock(&self.boards).digest(only, Utc::now());
                if fresh.is_empty() {
                    return Ok(PluginCallResult::Status {
                        success: false,
                        message: "no new bulletin posts".to_string(),
                    });
                }
                let parts: Vec<String> = fresh.iter().map(|(b, n)| format!("{b} {n}")).collect();
                Ok(PluginCallResult::Status {
                    success: true,
                    message: format!("Bulletin digest: {}", parts.join(", ")),
                })
            }
            other => bail!("bulletin has no method '{other}'"),
        }
    }
}
