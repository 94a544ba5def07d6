//! Character registry: directory loading and atomic roster replacement.
//!
//! Each session owns its own registry instance; reloading one session's
//! roster never affects another. One process-wide instance exists solely
//! to answer the discovery endpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::events::CharacterInfo;
use crate::metrics;

use super::{Character, CharacterSpec};

type Roster = HashMap<String, Arc<Character>>;

/// Result of one load/reload cycle.
pub struct CharacterLoadResult {
    pub characters: Roster,
    pub total_files: usize,
    pub loaded_count: usize,
    pub error_count: usize,
    pub load_duration: Duration,
}

// `Character` holds trait-object fields that cannot derive `Debug`, so the
// result type gets a hand-written `Debug` that summarizes the roster by the
// loaded character names instead of recursing into each `Character`.
impl std::fmt::Debug for CharacterLoadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterLoadResult")
            .field("characters", &self.characters.keys().collect::<Vec<_>>())
            .field("total_files", &self.total_files)
            .field("loaded_count", &self.loaded_count)
            .field("error_count", &self.error_count)
            .field("load_duration", &self.load_duration)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CharacterLoadError {
    #[error("character directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("no valid characters found in directory: {0}")]
    NoValidCharacters(PathBuf),

    #[error("failed to load characters: {0}")]
    Failed(String),
}

impl CharacterLoadError {
    /// Stable code carried on the wire so clients can distinguish causes.
    pub fn code(&self) -> &'static str {
        match self {
            CharacterLoadError::DirectoryNotFound(_) => "directory_not_found",
            CharacterLoadError::NotADirectory(_) => "invalid_directory_format",
            CharacterLoadError::NoValidCharacters(_) => "no_valid_characters",
            CharacterLoadError::Failed(_) => "character_reload_failed",
        }
    }
}

#[derive(Default)]
pub struct CharacterRegistry {
    roster: ArcSwap<Roster>,
    current_directory: Mutex<Option<PathBuf>>,
}

impl CharacterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a directory, replacing the roster wholesale. An empty directory
    /// is tolerated here (the process can start with no characters); use
    /// [`reload`](Self::reload) for the stricter mid-session semantics.
    pub async fn load(&self, directory: &Path) -> Result<CharacterLoadResult, CharacterLoadError> {
        let result = self.scan(directory).await?;

        if result.loaded_count == 0 {
            warn!(
                directory = %directory.display(),
                "No characters loaded; starting with an empty roster"
            );
        }

        self.install(directory, &result);
        Ok(result)
    }

    /// Reload a directory mid-session. A directory yielding zero valid
    /// characters is rejected without touching the current roster.
    pub async fn reload(
        &self,
        directory: &Path,
    ) -> Result<CharacterLoadResult, CharacterLoadError> {
        let result = self.scan(directory).await?;

        if result.loaded_count == 0 {
            return Err(CharacterLoadError::NoValidCharacters(
                directory.to_path_buf(),
            ));
        }

        self.install(directory, &result);
        Ok(result)
    }

    fn install(&self, directory: &Path, result: &CharacterLoadResult) {
        self.roster.store(Arc::new(result.characters.clone()));
        *self.current_directory.lock() = Some(directory.to_path_buf());
        metrics::CHARACTERS_LOADED.set(result.loaded_count as i64);
        metrics::CHARACTER_LOAD_DURATION.observe(result.load_duration.as_secs_f64());
        info!(
            directory = %directory.display(),
            loaded = result.loaded_count,
            errors = result.error_count,
            total_files = result.total_files,
            duration_ms = result.load_duration.as_millis() as u64,
            "Character roster installed"
        );
    }

    async fn scan(&self, directory: &Path) -> Result<CharacterLoadResult, CharacterLoadError> {
        let metadata = tokio::fs::metadata(directory)
            .await
            .map_err(|_| CharacterLoadError::DirectoryNotFound(directory.to_path_buf()))?;
        if !metadata.is_dir() {
            return Err(CharacterLoadError::NotADirectory(directory.to_path_buf()));
        }

        let started = Instant::now();

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(directory)
            .await
            .map_err(|e| CharacterLoadError::Failed(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CharacterLoadError::Failed(e.to_string()))?
        {
            let path = entry.path();
            let is_character_file = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_character_file {
                files.push(path);
            }
        }
        // Deterministic load order regardless of filesystem enumeration.
        files.sort();

        let total_files = files.len();
        let loaded = join_all(files.iter().map(|path| load_single(path.clone()))).await;

        let mut characters: Roster = HashMap::new();
        let mut loaded_count = 0;
        let mut error_count = 0;

        for (path, character) in files.iter().zip(loaded) {
            let Some(character) = character else {
                error_count += 1;
                continue;
            };
            if characters.contains_key(&character.name) {
                // First-loaded wins, matching the sorted file order.
                error!(
                    file = %path.display(),
                    name = character.name,
                    "Duplicate character name, skipping"
                );
                error_count += 1;
                continue;
            }
            characters.insert(character.name.clone(), Arc::new(character));
            loaded_count += 1;
            metrics::CHARACTER_LOADS.inc();
        }

        Ok(CharacterLoadResult {
            characters,
            total_files,
            loaded_count,
            error_count,
            load_duration: started.elapsed(),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Character>> {
        self.roster.load().get(name).cloned()
    }

    /// All characters, sorted by name.
    pub fn all(&self) -> Vec<Arc<Character>> {
        let mut characters: Vec<Arc<Character>> = self.roster.load().values().cloned().collect();
        characters.sort_by(|a, b| a.name.cmp(&b.name));
        characters
    }

    /// Characters marked good, for discovery listings.
    pub fn visible(&self) -> Vec<Arc<Character>> {
        self.all()
            .into_iter()
            .filter(|c| c.good == Some(true))
            .collect()
    }

    pub fn infos(&self) -> Vec<CharacterInfo> {
        self.all().iter().map(|c| c.info()).collect()
    }

    pub fn current_directory(&self) -> Option<PathBuf> {
        self.current_directory.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.roster.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn load_single(path: PathBuf) -> Option<Character> {
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed to read character file");
            return None;
        }
    };
    let spec: CharacterSpec = match serde_yaml::from_str(&text) {
        Ok(spec) => spec,
        Err(e) => {
            error!(file = %path.display(), error = %e, "Invalid character file");
            return None;
        }
    };
    match Character::from_spec(spec) {
        Ok(character) => Some(character),
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed to build character");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_character(dir: &Path, file: &str, name: &str) {
        let yaml = format!(
            "name: {name}\n\
             voice:\n  type: file\n  path_on_server: voices/{name}.wav\n\
             instructions:\n  type: constant\n  text: You are {name}.\n\
             good: true\n"
        );
        std::fs::write(dir.join(file), yaml).expect("write character");
    }

    #[tokio::test]
    async fn test_load_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_character(dir.path(), "a.yaml", "alice");
        write_character(dir.path(), "b.yml", "bob");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let registry = CharacterRegistry::new();
        let result = registry.load(dir.path()).await.expect("load");

        assert_eq!(result.total_files, 2);
        assert_eq!(result.loaded_count, 2);
        assert_eq!(result.error_count, 0);
        assert!(registry.get("alice").is_some());
        assert!(registry.get("bob").is_some());
        assert_eq!(registry.current_directory(), Some(dir.path().to_path_buf()));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let registry = CharacterRegistry::new();
        let err = registry
            .load(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "directory_not_found");
    }

    #[tokio::test]
    async fn test_not_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("file.yaml");
        std::fs::write(&file, "name: x").expect("write");

        let registry = CharacterRegistry::new();
        let err = registry.load(&file).await.unwrap_err();
        assert_eq!(err.code(), "invalid_directory_format");
    }

    #[tokio::test]
    async fn test_invalid_files_counted_as_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_character(dir.path(), "good.yaml", "alice");
        std::fs::write(dir.path().join("bad.yaml"), "not: [valid").expect("write");

        let registry = CharacterRegistry::new();
        let result = registry.load(dir.path()).await.expect("load");
        assert_eq!(result.loaded_count, 1);
        assert_eq!(result.error_count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_first_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_character(dir.path(), "a.yaml", "alice");
        write_character(dir.path(), "z.yaml", "alice");

        let registry = CharacterRegistry::new();
        let result = registry.load(dir.path()).await.expect("load");
        assert_eq!(result.loaded_count, 1);
        assert_eq!(result.error_count, 1);
    }

    #[tokio::test]
    async fn test_reload_rejects_empty_roster_and_keeps_old() {
        let good_dir = tempfile::tempdir().expect("tempdir");
        write_character(good_dir.path(), "a.yaml", "alice");
        let empty_dir = tempfile::tempdir().expect("tempdir");

        let registry = CharacterRegistry::new();
        registry.load(good_dir.path()).await.expect("load");

        let err = registry.reload(empty_dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "no_valid_characters");
        // The previous roster survives a failed reload.
        assert!(registry.get("alice").is_some());
        assert_eq!(
            registry.current_directory(),
            Some(good_dir.path().to_path_buf())
        );
    }

    #[tokio::test]
    async fn test_reload_replaces_roster_atomically() {
        let first = tempfile::tempdir().expect("tempdir");
        write_character(first.path(), "a.yaml", "alice");
        let second = tempfile::tempdir().expect("tempdir");
        write_character(second.path(), "b.yaml", "bob");

        let registry = CharacterRegistry::new();
        registry.load(first.path()).await.expect("load");
        registry.reload(second.path()).await.expect("reload");

        assert!(registry.get("alice").is_none());
        assert!(registry.get("bob").is_some());
    }

    #[tokio::test]
    async fn test_visible_filters_good() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_character(dir.path(), "a.yaml", "alice");
        std::fs::write(
            dir.path().join("b.yaml"),
            "name: bob\n\
             voice:\n  type: file\n  path_on_server: voices/bob.wav\n\
             instructions:\n  type: constant\n  text: You are Bob.\n",
        )
        .expect("write");

        let registry = CharacterRegistry::new();
        registry.load(dir.path()).await.expect("load");

        let visible = registry.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "alice");
    }
}
