//! Identifier lifecycle management
//!
//! Generates structured identifiers of the form
//! `<prefix>_<type>_<counter>_<8 hex>` and keeps track of which are active.
//! Counters are process-wide atomics (one per [`IdType`]) so ids never collide
//! while the process lives. Released ids keep their metadata for audit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Kinds of identifiers handed out by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    Execution,
    User,
    Thread,
    Run,
    Request,
    Session,
    Websocket,
    Agent,
    Tool,
}

const ID_TYPE_COUNT: usize = 9;

impl IdType {
    pub const ALL: [IdType; ID_TYPE_COUNT] = [
        IdType::Execution,
        IdType::User,
        IdType::Thread,
        IdType::Run,
        IdType::Request,
        IdType::Session,
        IdType::Websocket,
        IdType::Agent,
        IdType::Tool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Execution => "execution",
            IdType::User => "user",
            IdType::Thread => "thread",
            IdType::Run => "run",
            IdType::Request => "request",
            IdType::Session => "session",
            IdType::Websocket => "websocket",
            IdType::Agent => "agent",
            IdType::Tool => "tool",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry for a generated identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMetadata {
    pub id: String,
    pub id_type: IdType,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub context: HashMap<String, serde_json::Value>,
}

impl IdMetadata {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

/// Operator-facing snapshot of the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdStats {
    pub total_registered: usize,
    pub active_by_type: HashMap<String, usize>,
    pub counters_by_type: HashMap<String, u64>,
}

/// Generates and tracks identifiers
pub struct IdManager {
    counters: [AtomicU64; ID_TYPE_COUNT],
    registry: RwLock<HashMap<String, IdMetadata>>,
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IdManager {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Generate and register a new identifier
    pub fn generate_id(&self, id_type: IdType, prefix: &str) -> String {
        let counter = self.counters[id_type.index()].fetch_add(1, Ordering::SeqCst) + 1;
        let random = Uuid::new_v4().simple().to_string();
        let id = format!("{}_{}_{}_{}", prefix, id_type.as_str(), counter, &random[..8]);

        let metadata = IdMetadata {
            id: id.clone(),
            id_type,
            created_at: Utc::now(),
            released_at: None,
            context: HashMap::new(),
        };
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), metadata);

        debug!(id = %id, id_type = %id_type, "Generated identifier");
        id
    }

    /// Merge contextual metadata into a registered id. Returns false for unknown ids.
    pub fn register_metadata(&self, id: &str, context: HashMap<String, serde_json::Value>) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        match registry.get_mut(id) {
            Some(entry) => {
                entry.context.extend(context);
                true
            }
            None => false,
        }
    }

    /// Metadata for an id, active or released
    pub fn get_metadata(&self, id: &str) -> Option<IdMetadata> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Mark an id released. Returns false when unknown or already released.
    pub fn release_id(&self, id: &str) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        match registry.get_mut(id) {
            Some(entry) if entry.is_active() => {
                entry.released_at = Some(Utc::now());
                debug!(id = %id, "Released identifier");
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(IdMetadata::is_active)
            .unwrap_or(false)
    }

    pub fn active_ids(&self, id_type: IdType) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| m.id_type == id_type && m.is_active())
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn count_active(&self, id_type: IdType) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| m.id_type == id_type && m.is_active())
            .count()
    }

    /// Check that `id` is structurally an identifier of `id_type`.
    ///
    /// The prefix may itself contain underscores, so parsing works from the right.
    pub fn is_valid(&self, id: &str, id_type: IdType) -> bool {
        let mut parts = id.rsplitn(4, '_');
        let (Some(hex), Some(counter), Some(kind), Some(prefix)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        !prefix.is_empty()
            && kind == id_type.as_str()
            && !counter.is_empty()
            && counter.bytes().all(|b| b.is_ascii_digit())
            && hex.len() == 8
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    pub fn get_stats(&self) -> IdStats {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());

        let mut active_by_type = HashMap::new();
        for meta in registry.values().filter(|m| m.is_active()) {
            *active_by_type.entry(meta.id_type.to_string()).or_insert(0) += 1;
        }

        let counters_by_type = IdType::ALL
            .iter()
            .map(|t| (t.to_string(), self.counters[t.index()].load(Ordering::SeqCst)))
            .filter(|(_, count)| *count > 0)
            .collect();

        IdStats {
            total_registered: registry.len(),
            active_by_type,
            counters_by_type,
        }
    }
}
