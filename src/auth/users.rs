use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::keys;
use crate::auth::AuthUser;
use crate::db::Database;
use crate::error::AppError;

/// A user row as stored in the database (minus the key hash).
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: String,
    pub status: String,
    pub key_prefix: String,
    pub created_at: String,
}

/// A freshly created user together with its one-time plaintext API key.
#[derive(Debug)]
pub struct CreatedUser {
    pub user: User,
    pub plaintext_key: String,
}

/// Create a user with a generated API key.
pub fn create_user(db: &Database, name: &str, role: &str) -> Result<CreatedUser, AppError> {
    if name.trim().is_empty() {
        return Err(AppError::BadRequest("user name cannot be empty".to_string()));
    }
    if role != "admin" && role != "member" {
        return Err(AppError::BadRequest(format!("invalid role: {role}")));
    }

    let id = Uuid::new_v4().to_string();
    let key = keys::generate_api_key();

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO users (id, name, role, api_key_hash, key_prefix) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name.trim(), role, key.hash, key.prefix],
        )?;
        Ok(())
    })
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::BadRequest(format!("user '{name}' already exists"))
        }
        other => other.into(),
    })?;

    let user = get_user_by_id(db, &id)?.ok_or_else(|| {
        AppError::Internal("user row missing immediately after insert".to_string())
    })?;

    tracing::info!(user_id = %user.id, name = %user.name, role = %user.role, "User created");
    Ok(CreatedUser {
        user,
        plaintext_key: key.plaintext,
    })
}

/// Validate a plaintext API key against the user table.
///
/// Lookup is an indexed equality match on the key digest; only active
/// accounts authenticate.
pub fn validate_api_key(db: &Database, plaintext: &str) -> Result<AuthUser, AppError> {
    let hash = keys::hash_key(plaintext);
    let row = db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, name, role, status FROM users WHERE api_key_hash = ?1",
            params![hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
    })?;

    match row {
        Some((user_id, name, role, status)) => {
            if status != "active" {
                return Err(AppError::Unauthorized("account is not active".to_string()));
            }
            Ok(AuthUser {
                user_id,
                name,
                role,
            })
        }
        None => Err(AppError::Unauthorized("Invalid API key".to_string())),
    }
}

/// Fetch a user by id.
pub fn get_user_by_id(db: &Database, id: &str) -> Result<Option<User>, AppError> {
    let user = db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, name, role, status, key_prefix, created_at FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
    })?;
    Ok(user)
}

/// Fetch a user by name.
pub fn get_user_by_name(db: &Database, name: &str) -> Result<Option<User>, AppError> {
    let user = db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, name, role, status, key_prefix, created_at FROM users WHERE name = ?1",
            params![name],
            row_to_user,
        )
        .optional()
    })?;
    Ok(user)
}

/// Create the default admin on an empty user table. Returns `None` when
/// users already exist; the caller prints the key exactly once.
pub fn bootstrap_admin(db: &Database, name: &str) -> Result<Option<CreatedUser>, AppError> {
    let count: i64 =
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))?;
    if count > 0 {
        return Ok(None);
    }
    Ok(Some(create_user(db, name, "admin")?))
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        status: row.get(3)?,
        key_prefix: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_user_and_fetch() {
        let db = test_db();
        let created = create_user(&db, "alice", "member").unwrap();
        assert_eq!(created.user.name, "alice");
        assert_eq!(created.user.role, "member");
        assert_eq!(created.user.status, "active");
        assert!(created.plaintext_key.starts_with("sk-mule-"));

        let fetched = get_user_by_id(&db, &created.user.id).unwrap().unwrap();
        assert_eq!(fetched.name, "alice");
        let by_name = get_user_by_name(&db, "alice").unwrap().unwrap();
        assert_eq!(by_name.id, created.user.id);
    }

    #[test]
    fn test_create_user_duplicate_name() {
        let db = test_db();
        create_user(&db, "alice", "member").unwrap();
        let err = create_user(&db, "alice", "member").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_create_user_rejects_bad_role() {
        let db = test_db();
        assert!(create_user(&db, "alice", "root").is_err());
        assert!(create_user(&db, "  ", "member").is_err());
    }

    #[test]
    fn test_validate_api_key_success() {
        let db = test_db();
        let created = create_user(&db, "alice", "admin").unwrap();

        let auth_user = validate_api_key(&db, &created.plaintext_key).unwrap();
        assert_eq!(auth_user.user_id, created.user.id);
        assert_eq!(auth_user.name, "alice");
        assert!(auth_user.is_admin());
    }

    #[test]
    fn test_validate_api_key_invalid() {
        let db = test_db();
        create_user(&db, "alice", "admin").unwrap();
        assert!(validate_api_key(&db, "sk-mule-invalid0000000000000000000").is_err());
    }

    #[test]
    fn test_validate_api_key_suspended() {
        let db = test_db();
        let created = create_user(&db, "alice", "member").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET status = 'suspended' WHERE id = ?1",
                params![created.user.id],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(validate_api_key(&db, &created.plaintext_key).is_err());
    }

    #[test]
    fn test_bootstrap_admin_first_run_only() {
        let db = test_db();
        let first = bootstrap_admin(&db, "admin").unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().user.role, "admin");

        let second = bootstrap_admin(&db, "admin").unwrap();
        assert!(second.is_none());
    }
}
