//! User Settings
//!
//! SQLite-Datenbank für lokale Benutzereinstellungen: Anzeigename, Tag
//! und die Audio-Flags, die zur Connect-Zeit in die Mikrofon-Constraints
//! und die Presence-Metadaten einfließen.

use crate::media::MicrophoneConstraints;
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create settings directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Could not determine project directories")]
    NoProjectDirs,
}

// ============================================================================
// USER SETTINGS
// ============================================================================

/// Lokale Benutzereinstellungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub display_name: String,
    /// Diskriminator im Stil "#0001"
    pub tag: String,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl UserSettings {
    /// Constraints für die Mikrofon-Aufnahme aus den Flags ableiten
    pub fn microphone_constraints(&self) -> MicrophoneConstraints {
        MicrophoneConstraints {
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
        }
    }
}

impl Default for UserSettings {
    fn default() -> Self {
        let tag: u16 = rand::thread_rng().gen_range(0..10000);
        Self {
            display_name: "User".to_string(),
            tag: format!("#{:04}", tag),
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

// ============================================================================
// SETTINGS STORE
// ============================================================================

/// SQLite-Store für Einstellungen (Thread-safe durch Mutex)
pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    /// Öffnet oder erstellt die Datenbank
    pub fn open() -> Result<Self, SettingsError> {
        let db_path = Self::get_database_path()?;

        // Parent-Verzeichnis erstellen
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening settings database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SettingsError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_database_path() -> Result<PathBuf, SettingsError> {
        let proj_dirs = directories::ProjectDirs::from("com", "chorus", "chorus")
            .ok_or(SettingsError::NoProjectDirs)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("settings.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), SettingsError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                display_name TEXT NOT NULL,
                tag TEXT NOT NULL,
                echo_cancellation INTEGER NOT NULL DEFAULT 1,
                noise_suppression INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;
        Ok(())
    }

    /// Lädt die Einstellungen; existiert noch keine Zeile, werden
    /// Defaults erzeugt und persistiert
    pub fn load(&self) -> Result<UserSettings, SettingsError> {
        let existing = {
            let conn = self.conn.lock();
            conn.query_row(
                r#"
                SELECT display_name, tag, echo_cancellation, noise_suppression
                FROM settings WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(UserSettings {
                        display_name: row.get(0)?,
                        tag: row.get(1)?,
                        echo_cancellation: row.get::<_, i64>(2)? != 0,
                        noise_suppression: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?
        };

        match existing {
            Some(settings) => Ok(settings),
            None => {
                let defaults = UserSettings::default();
                self.save(&defaults)?;
                Ok(defaults)
            }
        }
    }

    /// Speichert die Einstellungen (Upsert auf die Einzelzeile)
    pub fn save(&self, settings: &UserSettings) -> Result<(), SettingsError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO settings (id, display_name, tag, echo_cancellation, noise_suppression, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                tag = excluded.tag,
                echo_cancellation = excluded.echo_cancellation,
                noise_suppression = excluded.noise_suppression,
                updated_at = excluded.updated_at
            "#,
            params![
                settings.display_name,
                settings.tag,
                settings.echo_cancellation as i64,
                settings.noise_suppression as i64,
            ],
        )?;
        Ok(())
    }
}

// SQLite-Connection steckt hinter dem Mutex
unsafe impl Send for SettingsStore {}
unsafe impl Sync for SettingsStore {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_defaults() {
        let store = SettingsStore::open_in_memory().unwrap();

        let settings = store.load().unwrap();
        assert_eq!(settings.display_name, "User");
        assert!(settings.tag.starts_with('#'));
        assert_eq!(settings.tag.len(), 5);
        assert!(settings.echo_cancellation);
        assert!(settings.noise_suppression);

        // Zweiter Load liefert dieselbe Zeile
        let again = store.load().unwrap();
        assert_eq!(settings, again);
    }

    #[test]
    fn test_save_and_reload() -> anyhow::Result<()> {
        let store = SettingsStore::open_in_memory()?;

        let settings = UserSettings {
            display_name: "Alice".to_string(),
            tag: "#4253".to_string(),
            echo_cancellation: false,
            noise_suppression: true,
        };
        store.save(&settings)?;

        let loaded = store.load()?;
        assert_eq!(loaded, settings);
        Ok(())
    }

    #[test]
    fn test_constraints_follow_flags() {
        let settings = UserSettings {
            display_name: "Bob".to_string(),
            tag: "#7890".to_string(),
            echo_cancellation: false,
            noise_suppression: false,
        };

        let constraints = settings.microphone_constraints();
        assert!(!constraints.echo_cancellation);
        assert!(!constraints.noise_suppression);
    }
}
