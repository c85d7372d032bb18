// Persistent store for SSO sessions and context mappings (SQLite)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::models::{Account, ContextMapping, SsoSession, UpsertContextMappingRequest};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sso_sessions (
    name            TEXT PRIMARY KEY,
    start_url       TEXT NOT NULL,
    region          TEXT NOT NULL,
    access_token    TEXT,
    refresh_token   TEXT,
    client_id       TEXT,
    client_secret   TEXT,
    token_expiry    TEXT,
    last_synced     TEXT,
    accounts        TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS context_mappings (
    context_name    TEXT PRIMARY KEY,
    cluster_name    TEXT NOT NULL,
    session_name    TEXT NOT NULL,
    account_id      TEXT NOT NULL,
    account_name    TEXT,
    role_name       TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
"#;

const SESSION_COLUMNS: &str = "name, start_url, region, access_token, refresh_token, client_id, \
                               client_secret, token_expiry, last_synced, accounts";

const MAPPING_COLUMNS: &str =
    "context_name, cluster_name, session_name, account_id, account_name, role_name, updated_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("no mapping for context '{0}'")]
    MappingNotFound(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("database lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// SSO token material kept beside a session. Never serialised to API clients.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Full server-side view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub name: String,
    pub start_url: String,
    pub region: String,
    pub token: Option<StoredToken>,
    pub last_synced: Option<DateTime<Utc>>,
    pub accounts: Vec<Account>,
}

impl StoredSession {
    /// A token exists and has not expired
    pub fn is_logged_in(&self, now: DateTime<Utc>) -> bool {
        self.token.as_ref().is_some_and(|t| t.expires_at > now)
    }

    /// Public view without token material
    pub fn to_api(&self, now: DateTime<Utc>) -> SsoSession {
        SsoSession {
            name: self.name.clone(),
            start_url: self.start_url.clone(),
            region: self.region.clone(),
            is_logged_in: self.is_logged_in(now),
            token_expiry: self.token.as_ref().map(|t| t.expires_at),
            last_synced: self.last_synced,
            accounts: self.accounts.clone(),
        }
    }
}

/// Raw row as read from SQLite, before timestamp and JSON decoding
struct SessionRow {
    name: String,
    start_url: String,
    region: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_expiry: Option<String>,
    last_synced: Option<String>,
    accounts: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            start_url: row.get(1)?,
            region: row.get(2)?,
            access_token: row.get(3)?,
            refresh_token: row.get(4)?,
            client_id: row.get(5)?,
            client_secret: row.get(6)?,
            token_expiry: row.get(7)?,
            last_synced: row.get(8)?,
            accounts: row.get(9)?,
        })
    }

    fn decode(self) -> StoreResult<StoredSession> {
        let token = match (self.access_token, self.token_expiry) {
            (Some(access_token), Some(expiry)) => Some(StoredToken {
                access_token,
                refresh_token: self.refresh_token,
                client_id: self.client_id,
                client_secret: self.client_secret,
                expires_at: parse_datetime(&expiry)?,
            }),
            _ => None,
        };

        let accounts: Vec<Account> = serde_json::from_str(&self.accounts)
            .map_err(|e| StoreError::Corrupt(format!("accounts of '{}': {}", self.name, e)))?;

        Ok(StoredSession {
            last_synced: self.last_synced.as_deref().map(parse_datetime).transpose()?,
            name: self.name,
            start_url: self.start_url,
            region: self.region,
            token,
            accounts,
        })
    }
}

struct MappingRow {
    context_name: String,
    cluster_name: String,
    session_name: String,
    account_id: String,
    account_name: Option<String>,
    role_name: String,
    updated_at: String,
}

impl MappingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            context_name: row.get(0)?,
            cluster_name: row.get(1)?,
            session_name: row.get(2)?,
            account_id: row.get(3)?,
            account_name: row.get(4)?,
            role_name: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> StoreResult<ContextMapping> {
        Ok(ContextMapping {
            updated_at: parse_datetime(&self.updated_at)?,
            context_name: self.context_name,
            cluster_name: self.cluster_name,
            session_name: self.session_name,
            account_id: self.account_id,
            account_name: self.account_name,
            role_name: self.role_name,
        })
    }
}

/// SQLite-backed store. Sessions and context mappings are independent tables:
/// deleting a session never touches its mappings.
pub struct SsoStore {
    conn: Mutex<Connection>,
}

impl SsoStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening session store: {}", path.display());
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ==============================================================================================
    // Sessions
    // ==============================================================================================

    pub fn list_sessions(&self) -> StoreResult<Vec<StoredSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sso_sessions ORDER BY name",
            SESSION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], SessionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SessionRow::decode).collect()
    }

    pub fn get_session(&self, name: &str) -> StoreResult<StoredSession> {
        self.find_session(name)?
            .ok_or_else(|| StoreError::SessionNotFound(name.to_string()))
    }

    pub fn find_session(&self, name: &str) -> StoreResult<Option<StoredSession>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM sso_sessions WHERE name = ?1", SESSION_COLUMNS),
                [name],
                SessionRow::from_row,
            )
            .optional()?;
        row.map(SessionRow::decode).transpose()
    }

    /// Sessions registered for a start URL, most recently expiring token first
    pub fn find_sessions_by_start_url(&self, start_url: &str) -> StoreResult<Vec<StoredSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sso_sessions WHERE start_url = ?1 ORDER BY token_expiry DESC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([start_url], SessionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SessionRow::decode).collect()
    }

    /// Create a logged-out session record
    pub fn create_session(
        &self,
        name: &str,
        start_url: &str,
        region: &str,
    ) -> StoreResult<StoredSession> {
        {
            let conn = self.conn()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sso_sessions (name, start_url, region) VALUES (?1, ?2, ?3)",
                params![name, start_url, region],
            )?;
            if inserted == 0 {
                return Err(StoreError::SessionExists(name.to_string()));
            }
        }
        self.get_session(name)
    }

    /// Store a freshly issued token, creating the session when absent.
    /// Accounts and last sync time of an existing session are kept.
    pub fn save_login(
        &self,
        name: &str,
        start_url: &str,
        region: &str,
        token: &StoredToken,
    ) -> StoreResult<StoredSession> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO sso_sessions
                    (name, start_url, region, access_token, refresh_token, client_id, client_secret, token_expiry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(name) DO UPDATE SET
                    start_url = excluded.start_url,
                    region = excluded.region,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    client_id = excluded.client_id,
                    client_secret = excluded.client_secret,
                    token_expiry = excluded.token_expiry",
                params![
                    name,
                    start_url,
                    region,
                    token.access_token,
                    token.refresh_token,
                    token.client_id,
                    token.client_secret,
                    token.expires_at.to_rfc3339(),
                ],
            )?;
        }
        self.get_session(name)
    }

    /// Replace the token of an existing session (refresh grant)
    pub fn update_token(&self, name: &str, token: &StoredToken) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sso_sessions
             SET access_token = ?2, refresh_token = ?3, client_id = ?4, client_secret = ?5, token_expiry = ?6
             WHERE name = ?1",
            params![
                name,
                token.access_token,
                token.refresh_token,
                token.client_id,
                token.client_secret,
                token.expires_at.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Replace the account tree after a sync
    pub fn update_accounts(
        &self,
        name: &str,
        accounts: &[Account],
        synced_at: DateTime<Utc>,
    ) -> StoreResult<StoredSession> {
        let json = serde_json::to_string(accounts)
            .map_err(|e| StoreError::Corrupt(format!("accounts of '{}': {}", name, e)))?;
        {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE sso_sessions SET accounts = ?2, last_synced = ?3 WHERE name = ?1",
                params![name, json, synced_at.to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(StoreError::SessionNotFound(name.to_string()));
            }
        }
        self.get_session(name)
    }

    /// Delete a session. Context mappings referencing it are left in place.
    pub fn delete_session(&self, name: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sso_sessions WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    // ==============================================================================================
    // Context mappings
    // ==============================================================================================

    pub fn list_mappings(&self) -> StoreResult<Vec<ContextMapping>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM context_mappings ORDER BY context_name",
            MAPPING_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], MappingRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(MappingRow::decode).collect()
    }

    pub fn get_mapping(&self, context_name: &str) -> StoreResult<ContextMapping> {
        self.find_mapping(context_name)?
            .ok_or_else(|| StoreError::MappingNotFound(context_name.to_string()))
    }

    pub fn find_mapping(&self, context_name: &str) -> StoreResult<Option<ContextMapping>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM context_mappings WHERE context_name = ?1",
                    MAPPING_COLUMNS
                ),
                [context_name],
                MappingRow::from_row,
            )
            .optional()?;
        row.map(MappingRow::decode).transpose()
    }

    /// Insert or overwrite the mapping for a context.
    /// Returns the stored mapping and the one it replaced, if any.
    pub fn upsert_mapping(
        &self,
        request: &UpsertContextMappingRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<(ContextMapping, Option<ContextMapping>)> {
        let previous = self.find_mapping(&request.context_name)?;
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO context_mappings
                    (context_name, cluster_name, session_name, account_id, account_name, role_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(context_name) DO UPDATE SET
                    cluster_name = excluded.cluster_name,
                    session_name = excluded.session_name,
                    account_id = excluded.account_id,
                    account_name = excluded.account_name,
                    role_name = excluded.role_name,
                    updated_at = excluded.updated_at",
                params![
                    request.context_name,
                    request.cluster_name,
                    request.session_name,
                    request.account_id,
                    request.account_name,
                    request.role_name,
                    now.to_rfc3339(),
                ],
            )?;
        }
        let stored = self.get_mapping(&request.context_name)?;
        Ok((stored, previous))
    }

    pub fn delete_mapping(&self, context_name: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM context_mappings WHERE context_name = ?1",
            [context_name],
        )?;
        if deleted == 0 {
            return Err(StoreError::MappingNotFound(context_name.to_string()));
        }
        Ok(())
    }
}

/// Parse an RFC 3339 timestamp, accepting a `Z` suffix
fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_at: DateTime<Utc>) -> StoredToken {
        StoredToken {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            expires_at,
        }
    }

    fn mapping_request(context: &str, account: &str, role: &str) -> UpsertContextMappingRequest {
        UpsertContextMappingRequest {
            context_name: context.to_string(),
            cluster_name: format!("{}-cluster", context),
            session_name: "corp".to_string(),
            account_id: account.to_string(),
            account_name: None,
            role_name: role.to_string(),
        }
    }

    #[test]
    fn test_parse_datetime() {
        let dt = parse_datetime("2025-01-12T10:30:00Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-12T10:30:00+00:00");

        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn test_create_and_get_session() {
        let store = SsoStore::open_in_memory().unwrap();
        let created = store
            .create_session("corp", "https://corp.awsapps.com/start", "us-east-1")
            .unwrap();

        assert_eq!(created.name, "corp");
        assert!(created.token.is_none());
        assert!(!created.is_logged_in(Utc::now()));

        let err = store
            .create_session("corp", "https://corp.awsapps.com/start", "us-east-1")
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionExists(_)));
    }

    #[test]
    fn test_save_login_keeps_accounts() {
        let store = SsoStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_login("corp", "https://corp.awsapps.com/start", "us-east-1", &token(now + Duration::hours(1)))
            .unwrap();

        let accounts = vec![Account {
            account_id: "111111111111".to_string(),
            account_name: "Prod".to_string(),
            email: None,
            roles: vec!["Admin".to_string()],
        }];
        store.update_accounts("corp", &accounts, now).unwrap();

        // Re-authentication replaces the token only
        let later = now + Duration::hours(8);
        let session = store
            .save_login("corp", "https://corp.awsapps.com/start", "us-east-1", &token(later))
            .unwrap();

        assert_eq!(session.accounts, accounts);
        assert!(session.last_synced.is_some());
        assert_eq!(
            session.token.unwrap().expires_at.timestamp(),
            later.timestamp()
        );
    }

    #[test]
    fn test_to_api_hides_token() {
        let store = SsoStore::open_in_memory().unwrap();
        let expiry = Utc::now() + Duration::hours(1);
        let session = store
            .save_login("corp", "https://corp.awsapps.com/start", "us-east-1", &token(expiry))
            .unwrap();

        let api = session.to_api(Utc::now());
        assert!(api.is_logged_in);
        assert_eq!(api.token_expiry.unwrap().timestamp(), expiry.timestamp());

        let json = serde_json::to_string(&api).unwrap();
        assert!(!json.contains("access"));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_expired_token_is_logged_out() {
        let store = SsoStore::open_in_memory().unwrap();
        let session = store
            .save_login(
                "corp",
                "https://corp.awsapps.com/start",
                "us-east-1",
                &token(Utc::now() - Duration::minutes(1)),
            )
            .unwrap();
        assert!(!session.is_logged_in(Utc::now()));
    }

    #[test]
    fn test_delete_session_keeps_mappings() {
        let store = SsoStore::open_in_memory().unwrap();
        store
            .create_session("corp", "https://corp.awsapps.com/start", "us-east-1")
            .unwrap();
        store
            .upsert_mapping(&mapping_request("prod", "111111111111", "Admin"), Utc::now())
            .unwrap();

        store.delete_session("corp").unwrap();

        assert!(store.find_session("corp").unwrap().is_none());
        let mappings = store.list_mappings().unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].session_name, "corp");
    }

    #[test]
    fn test_upsert_mapping_overwrites() {
        let store = SsoStore::open_in_memory().unwrap();
        let (first, previous) = store
            .upsert_mapping(&mapping_request("prod", "111111111111", "Admin"), Utc::now())
            .unwrap();
        assert!(previous.is_none());
        assert_eq!(first.role_name, "Admin");

        let (second, previous) = store
            .upsert_mapping(&mapping_request("prod", "222222222222", "ReadOnly"), Utc::now())
            .unwrap();
        assert_eq!(previous.unwrap().account_id, "111111111111");
        assert_eq!(second.account_id, "222222222222");
        assert_eq!(store.list_mappings().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_rows() {
        let store = SsoStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_session("nope"),
            Err(StoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.delete_mapping("nope"),
            Err(StoreError::MappingNotFound(_))
        ));
        assert!(matches!(
            store.update_token("nope", &token(Utc::now())),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_find_sessions_by_start_url() {
        let store = SsoStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_login("a", "https://corp.awsapps.com/start", "us-east-1", &token(now + Duration::hours(1)))
            .unwrap();
        store
            .save_login("b", "https://corp.awsapps.com/start", "us-east-1", &token(now + Duration::hours(5)))
            .unwrap();
        store
            .create_session("c", "https://other.awsapps.com/start", "us-east-1")
            .unwrap();

        let found = store
            .find_sessions_by_start_url("https://corp.awsapps.com/start")
            .unwrap();
        let names: Vec<_> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
