//! SQLite database for inbounds, accounts and settings
//!
//! Uniqueness of ports and tags among enabled inbounds is enforced by partial
//! unique indexes, so concurrent writers that both pass the registry's
//! pre-check still cannot persist duplicates.

use crate::error::{Error, Result};
use crate::inbound::{hash_password, Inbound, NewUser, ProtocolSettings, Role, User};
use crate::registry::ConfigStore;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const INBOUND_COLUMNS: &str = "id, user_id, remark, enable, listen, port, protocol, settings, \
                               stream_settings, sniffing, tag";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::StorageFailure(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: accounts and inbounds
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'viewer',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS inbounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                remark TEXT NOT NULL DEFAULT '',
                enable INTEGER NOT NULL DEFAULT 1,
                listen TEXT,
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                settings TEXT NOT NULL,
                stream_settings TEXT,
                sniffing TEXT,
                tag TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- The engine rejects duplicate listeners and tags
            CREATE UNIQUE INDEX IF NOT EXISTS idx_inbounds_enabled_port
                ON inbounds(port) WHERE enable = 1;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_inbounds_enabled_tag
                ON inbounds(tag) WHERE enable = 1;
            CREATE INDEX IF NOT EXISTS idx_inbounds_user ON inbounds(user_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: panel settings
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: settings");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    // ==================== User Operations ====================

    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        let conn = self.conn.lock();
        let password_hash = hash_password(&user.password);
        conn.execute(
            "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
            params![user.username, password_hash, user.role.as_str()],
        )?;
        Ok(User {
            id: conn.last_insert_rowid(),
            username: user.username.clone(),
            password_hash,
            role: user.role,
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, role FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, role FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Look up an account by credentials
    pub fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        Ok(self
            .get_user_by_username(username)?
            .filter(|user| user.password_matches(password)))
    }

    /// Change username and password of an existing account
    pub fn update_user(&self, id: i64, username: &str, password: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET username = ?2, password_hash = ?3 WHERE id = ?1",
            params![id, username, hash_password(password)],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    pub fn remove_user(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Oldest administrator account, if any
    pub fn first_admin(&self) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, role FROM users
                 WHERE role = 'admin' ORDER BY id LIMIT 1",
                [],
                user_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Return the seeded administrator, creating it only when no admin exists
    ///
    /// An administrator that renamed itself keeps its id and credentials.
    pub fn ensure_admin(&self, username: &str, password: &str) -> Result<User> {
        if let Some(user) = self.get_user_by_username(username)?.filter(User::is_admin) {
            return Ok(user);
        }
        if let Some(user) = self.first_admin()? {
            return Ok(user);
        }
        info!(username, "Seeding administrator account");
        self.create_user(&NewUser {
            username: username.to_string(),
            password: password.to_string(),
            role: Role::Admin,
        })
    }

    // ==================== Setting Operations ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut settings = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    // ==================== Inbound Operations ====================

    fn query_inbounds(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Inbound>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, InboundRow::from_row)?;

        let mut inbounds = Vec::new();
        for row in rows {
            inbounds.push(row?.into_inbound()?);
        }
        Ok(inbounds)
    }
}

impl ConfigStore for Database {
    fn list_inbounds(&self, owner: Option<i64>) -> Result<Vec<Inbound>> {
        match owner {
            Some(user_id) => self.query_inbounds(
                &format!("SELECT {} FROM inbounds WHERE user_id = ?1 ORDER BY id", INBOUND_COLUMNS),
                &[&user_id],
            ),
            None => self.query_inbounds(
                &format!("SELECT {} FROM inbounds ORDER BY id", INBOUND_COLUMNS),
                &[],
            ),
        }
    }

    fn get_inbound(&self, id: i64) -> Result<Option<Inbound>> {
        Ok(self
            .query_inbounds(
                &format!("SELECT {} FROM inbounds WHERE id = ?1", INBOUND_COLUMNS),
                &[&id],
            )?
            .into_iter()
            .next())
    }

    fn find_enabled_by_port(&self, port: u16) -> Result<Option<Inbound>> {
        Ok(self
            .query_inbounds(
                &format!(
                    "SELECT {} FROM inbounds WHERE port = ?1 AND enable = 1",
                    INBOUND_COLUMNS
                ),
                &[&port],
            )?
            .into_iter()
            .next())
    }

    fn insert_inbound(&self, inbound: &Inbound) -> Result<i64> {
        let row = InboundRow::from_inbound(inbound)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inbounds (user_id, remark, enable, listen, port, protocol, settings,
                                   stream_settings, sniffing, tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.user_id, row.remark, row.enable, row.listen, row.port, row.protocol,
                row.settings, row.stream_settings, row.sniffing, row.tag
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_inbound(&self, inbound: &Inbound) -> Result<()> {
        let row = InboundRow::from_inbound(inbound)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE inbounds SET user_id = ?2, remark = ?3, enable = ?4, listen = ?5, port = ?6,
                    protocol = ?7, settings = ?8, stream_settings = ?9, sniffing = ?10,
                    tag = ?11, updated_at = datetime('now')
             WHERE id = ?1",
            params![
                row.id, row.user_id, row.remark, row.enable, row.listen, row.port, row.protocol,
                row.settings, row.stream_settings, row.sniffing, row.tag
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("inbound {}", inbound.id)));
        }
        Ok(())
    }

    fn delete_inbound(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM inbounds WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.get_user_by_username(username)
    }

    fn insert_user(&self, user: &NewUser) -> Result<User> {
        self.create_user(user)
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        self.remove_user(id)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Database::get_setting(self, key)
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<Result<User>> {
    let id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let password_hash: String = row.get(2)?;
    let role: String = row.get(3)?;
    Ok(match Role::parse(&role) {
        Some(role) => Ok(User {
            id,
            username,
            password_hash,
            role,
        }),
        None => Err(Error::StorageFailure(format!(
            "user {} has unknown role '{}'",
            id, role
        ))),
    })
}

/// Column-level representation of an inbound; JSON payloads are stored as text
struct InboundRow {
    id: i64,
    user_id: i64,
    remark: String,
    enable: bool,
    listen: Option<String>,
    port: u16,
    protocol: String,
    settings: String,
    stream_settings: Option<String>,
    sniffing: Option<String>,
    tag: String,
}

impl InboundRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            remark: row.get(2)?,
            enable: row.get(3)?,
            listen: row.get(4)?,
            port: row.get(5)?,
            protocol: row.get(6)?,
            settings: row.get(7)?,
            stream_settings: row.get(8)?,
            sniffing: row.get(9)?,
            tag: row.get(10)?,
        })
    }

    fn from_inbound(inbound: &Inbound) -> Result<Self> {
        let encode = |value: &serde_json::Value| {
            serde_json::to_string(value).map_err(|e| Error::StorageFailure(e.to_string()))
        };
        Ok(Self {
            id: inbound.id,
            user_id: inbound.user_id,
            remark: inbound.remark.clone(),
            enable: inbound.enable,
            listen: inbound.listen.clone(),
            port: inbound.port,
            protocol: inbound.protocol.protocol().to_string(),
            settings: encode(&inbound.protocol.settings_value())?,
            stream_settings: inbound.stream_settings.as_ref().map(encode).transpose()?,
            sniffing: inbound.sniffing.as_ref().map(encode).transpose()?,
            tag: inbound.tag.clone(),
        })
    }

    fn into_inbound(self) -> Result<Inbound> {
        let decode = |column: &str, text: &str| {
            serde_json::from_str::<serde_json::Value>(text).map_err(|e| {
                Error::StorageFailure(format!("inbound {} has corrupt {}: {}", self.id, column, e))
            })
        };
        let settings = decode("settings", &self.settings)?;
        let stream_settings = self
            .stream_settings
            .as_deref()
            .map(|text| decode("stream_settings", text))
            .transpose()?;
        let sniffing = self
            .sniffing
            .as_deref()
            .map(|text| decode("sniffing", text))
            .transpose()?;
        let protocol = ProtocolSettings::from_parts(&self.protocol, settings)
            .map_err(|e| Error::StorageFailure(format!("inbound {}: {}", self.id, e)))?;

        Ok(Inbound {
            id: self.id,
            user_id: self.user_id,
            remark: self.remark,
            enable: self.enable,
            listen: self.listen,
            port: self.port,
            protocol,
            stream_settings,
            sniffing,
            tag: self.tag,
        })
    }
}
