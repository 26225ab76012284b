//! Participant identity cached per room code, so a reload rejoins as the same
//! participant instead of creating a new one.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use std::{collections::HashMap, env, fs, path::PathBuf};
use uuid::Uuid;

use crate::protocol::Participant;
use crate::utils::{color_for, default_display_name, HOST_COLOR};

pub trait SessionRepository: Send + Sync {
    fn get(&self, room_code: &str) -> Option<Participant>;
    fn put(&self, room_code: &str, participant: &Participant) -> Result<()>;
}

/// Return the cached participant for this room, or create and persist one.
/// A cached identity always wins over `wants_host`: host status belongs to
/// whoever created the room.
pub fn resolve_participant(
    repo: &dyn SessionRepository,
    room_code: &str,
    display_name: Option<String>,
    wants_host: bool,
) -> Result<Participant> {
    if let Some(existing) = repo.get(room_code) {
        tracing::debug!(
            "Rejoining room {} as {} ({})",
            room_code,
            existing.display_name,
            existing.id
        );
        return Ok(existing);
    }

    let id = Uuid::new_v4().to_string();
    let display_name = display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(default_display_name);
    let color_tag = if wants_host {
        HOST_COLOR.to_string()
    } else {
        color_for(&id).to_string()
    };
    let participant = Participant {
        id,
        display_name,
        is_host: wants_host,
        color_tag,
    };
    repo.put(room_code, &participant)?;
    Ok(participant)
}

/// JSON file keyed by room code
pub struct FileSessionRepository {
    path: PathBuf,
    cached: Mutex<HashMap<String, Participant>>,
}

impl FileSessionRepository {
    pub fn new() -> Self {
        Self::at(Self::resolve_path())
    }

    pub fn at(path: PathBuf) -> Self {
        let cached = Self::read_from_disk(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_from_disk(path: &PathBuf) -> HashMap<String, Participant> {
        fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }

    fn resolve_path() -> PathBuf {
        // Check for portable mode first
        if let Some(portable_path) = Self::portable_data_path() {
            return portable_path;
        }

        if let Some(dirs) = ProjectDirs::from("com", "watchparty", "WatchParty") {
            dirs.data_dir().join("participants.json")
        } else {
            env::temp_dir().join("watchparty-participants.json")
        }
    }

    /// Portable mode: portable.txt next to the executable
    fn portable_data_path() -> Option<PathBuf> {
        let exe_path = env::current_exe().ok()?;
        let exe_dir = exe_path.parent()?;
        if !exe_dir.join("portable.txt").exists() {
            return None;
        }
        Some(exe_dir.join("data").join("participants.json"))
    }
}

impl Default for FileSessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRepository for FileSessionRepository {
    fn get(&self, room_code: &str) -> Option<Participant> {
        self.cached.lock().get(room_code).cloned()
    }

    fn put(&self, room_code: &str, participant: &Participant) -> Result<()> {
        let mut cached = self.cached.lock();
        cached.insert(room_code.to_string(), participant.clone());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create session cache directory")?;
        }
        let payload = serde_json::to_vec_pretty(&*cached)?;
        fs::write(&self.path, payload).context("Failed to write session cache")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionRepository {
    entries: Mutex<HashMap<String, Participant>>,
}

impl SessionRepository for MemorySessionRepository {
    fn get(&self, room_code: &str) -> Option<Participant> {
        self.entries.lock().get(room_code).cloned()
    }

    fn put(&self, room_code: &str, participant: &Participant) -> Result<()> {
        self.entries
            .lock()
            .insert(room_code.to_string(), participant.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_reused_per_room() {
        let repo = MemorySessionRepository::default();
        let first = resolve_participant(&repo, "123-456", Some("  Ana ".into()), true).unwrap();
        assert_eq!(first.display_name, "Ana");
        assert!(first.is_host);
        assert_eq!(first.color_tag, HOST_COLOR);

        // a later visit keeps the original host flag and id
        let again = resolve_participant(&repo, "123-456", Some("Other".into()), false).unwrap();
        assert_eq!(again, first);

        let elsewhere = resolve_participant(&repo, "999-000", None, false).unwrap();
        assert_ne!(elsewhere.id, first.id);
        assert!(!elsewhere.is_host);
        assert!(elsewhere.display_name.starts_with("Guest-"));
    }

    #[test]
    fn file_repository_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("participants.json");

        let repo = FileSessionRepository::at(path.clone());
        let participant = resolve_participant(&repo, "abc", None, false).unwrap();

        let reloaded = FileSessionRepository::at(path);
        assert_eq!(reloaded.get("abc"), Some(participant));
        assert_eq!(reloaded.get("other"), None);
    }
}
