use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db;

#[derive(Debug)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        AuthError {
            code,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        AuthError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Coordinator,
    Student,
    Parent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Teacher => "Teacher",
            Role::Coordinator => "Coordinator",
            Role::Student => "Student",
            Role::Parent => "Parent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verified {
    pub subject: String,
    pub role: Role,
    pub user_id: Option<String>,
    pub display_name: String,
}

/// Verification seam. Request handling only ever sees this trait, so the
/// backing store can be swapped without touching the login handler.
pub trait CredentialStore {
    fn verify(&self, username: &str, password: &str) -> Result<Option<Verified>, AuthError>;
}

/// Database-backed store. Checks, in order: the admin entry in settings,
/// teachers (email or matricula), coordinators (email), students (email
/// or matricula), guardians (email or mobile phone). Accounts without a
/// stored digest cannot log in; there are no fallback passwords.
pub struct DbCredentialStore<'a> {
    pub conn: &'a Connection,
}

impl DbCredentialStore<'_> {
    fn verify_admin(&self, username: &str, digest: &str) -> Result<Option<Verified>, AuthError> {
        let admin = db::settings_get_json(self.conn, "auth.admin")
            .map_err(|e| AuthError::new("db_query_failed", e.to_string()))?;
        let Some(admin) = admin else {
            return Ok(None);
        };
        let stored_user = admin.get("username").and_then(|v| v.as_str());
        let stored_digest = admin.get("passwordSha256").and_then(|v| v.as_str());
        if stored_user == Some(username) && stored_digest == Some(digest) {
            let display = admin
                .get("displayName")
                .and_then(|v| v.as_str())
                .unwrap_or(username);
            return Ok(Some(Verified {
                subject: username.to_string(),
                role: Role::Admin,
                user_id: None,
                display_name: display.to_string(),
            }));
        }
        Ok(None)
    }

    fn verify_teacher(&self, username: &str, digest: &str) -> Result<Option<Verified>, AuthError> {
        let row: Option<(String, String, Option<String>, i64)> = self
            .conn
            .query_row(
                "SELECT id, full_name, password_hash, is_active
                 FROM teachers WHERE email = ? OR matricula = ?",
                [username, username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((id, full_name, hash, is_active)) = row else {
            return Ok(None);
        };
        if is_active == 0 || hash.as_deref() != Some(digest) {
            return Ok(None);
        }
        Ok(Some(Verified {
            subject: username.to_string(),
            role: Role::Teacher,
            user_id: Some(id),
            display_name: full_name,
        }))
    }

    fn verify_coordinator(
        &self,
        username: &str,
        digest: &str,
    ) -> Result<Option<Verified>, AuthError> {
        let row: Option<(String, String, Option<String>, i64)> = self
            .conn
            .query_row(
                "SELECT id, full_name, password_hash, is_active
                 FROM coordinators WHERE email = ?",
                [username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((id, full_name, hash, is_active)) = row else {
            return Ok(None);
        };
        if is_active == 0 || hash.as_deref() != Some(digest) {
            return Ok(None);
        }
        Ok(Some(Verified {
            subject: username.to_string(),
            role: Role::Coordinator,
            user_id: Some(id),
            display_name: full_name,
        }))
    }

    fn verify_student(&self, username: &str, digest: &str) -> Result<Option<Verified>, AuthError> {
        let row: Option<(String, String, String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, first_name, paternal_surname, password_hash
                 FROM students WHERE email = ? OR matricula = ?",
                [username, username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((id, first, paternal, hash)) = row else {
            return Ok(None);
        };
        if hash.as_deref() != Some(digest) {
            return Ok(None);
        }
        Ok(Some(Verified {
            subject: username.to_string(),
            role: Role::Student,
            user_id: Some(id),
            display_name: format!("{} {}", first, paternal),
        }))
    }

    fn verify_guardian(&self, username: &str, digest: &str) -> Result<Option<Verified>, AuthError> {
        let row: Option<(String, String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, full_name, password_hash
                 FROM guardians WHERE email = ? OR mobile_phone = ?",
                [username, username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((id, full_name, hash)) = row else {
            return Ok(None);
        };
        if hash.as_deref() != Some(digest) {
            return Ok(None);
        }
        Ok(Some(Verified {
            subject: username.to_string(),
            role: Role::Parent,
            user_id: Some(id),
            display_name: full_name,
        }))
    }
}

impl CredentialStore for DbCredentialStore<'_> {
    fn verify(&self, username: &str, password: &str) -> Result<Option<Verified>, AuthError> {
        let digest = db::sha256_hex(password);
        if let Some(v) = self.verify_admin(username, &digest)? {
            return Ok(Some(v));
        }
        if let Some(v) = self.verify_teacher(username, &digest)? {
            return Ok(Some(v));
        }
        if let Some(v) = self.verify_coordinator(username, &digest)? {
            return Ok(Some(v));
        }
        if let Some(v) = self.verify_student(username, &digest)? {
            return Ok(Some(v));
        }
        if let Some(v) = self.verify_guardian(username, &digest)? {
            return Ok(Some(v));
        }
        Ok(None)
    }
}

const TOKEN_TTL_HOURS: i64 = 8;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(secret: &str, verified: &Verified) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = Claims {
        sub: verified.subject.clone(),
        role: verified.role.as_str().to_string(),
        uid: verified.user_id.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::new("unauthorized", format!("token encoding failed: {}", e)))
}

pub fn validate_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| AuthError::new("unauthorized", format!("invalid token: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_schema() -> Connection {
        let conn = Connection::open_in_memory().expect("open memory db");
        db::init_schema(&conn).expect("schema");
        db::seed_default_settings(&conn).expect("seed");
        conn
    }

    #[test]
    fn admin_logs_in_from_settings_entry() {
        let conn = conn_with_schema();
        let store = DbCredentialStore { conn: &conn };
        let v = store
            .verify("admin@edu.com", "password")
            .expect("verify")
            .expect("admin matches");
        assert_eq!(v.role, Role::Admin);
        assert!(v.user_id.is_none());

        assert!(store
            .verify("admin@edu.com", "wrong")
            .expect("verify")
            .is_none());
    }

    #[test]
    fn teacher_requires_stored_digest_and_active_flag() {
        let conn = conn_with_schema();
        conn.execute(
            "INSERT INTO teachers(id, full_name, email, password_hash, is_active, created_at)
             VALUES('t1', 'Profe Uno', 'profe@edu.com', ?, 1, '2025-01-01T00:00:00+00:00')",
            [db::sha256_hex("secreto")],
        )
        .expect("teacher");
        conn.execute(
            "INSERT INTO teachers(id, full_name, email, password_hash, is_active, created_at)
             VALUES('t2', 'Profe Dos', 'baja@edu.com', ?, 0, '2025-01-01T00:00:00+00:00')",
            [db::sha256_hex("secreto")],
        )
        .expect("inactive teacher");
        conn.execute(
            "INSERT INTO teachers(id, full_name, email, is_active, created_at)
             VALUES('t3', 'Profe Tres', 'sinclave@edu.com', 1, '2025-01-01T00:00:00+00:00')",
            [],
        )
        .expect("teacher without digest");

        let store = DbCredentialStore { conn: &conn };
        let v = store
            .verify("profe@edu.com", "secreto")
            .expect("verify")
            .expect("teacher matches");
        assert_eq!(v.role, Role::Teacher);
        assert_eq!(v.user_id.as_deref(), Some("t1"));
        assert_eq!(v.display_name, "Profe Uno");

        assert!(store.verify("baja@edu.com", "secreto").expect("verify").is_none());
        // No digest on file means no login, regardless of the password.
        assert!(store
            .verify("sinclave@edu.com", "cualquier")
            .expect("verify")
            .is_none());
    }

    #[test]
    fn student_logs_in_by_matricula() {
        let conn = conn_with_schema();
        conn.execute(
            "INSERT INTO students(id, matricula, first_name, paternal_surname, password_hash, created_at, updated_at)
             VALUES('s1', 'MAT-001', 'Ana', 'López', ?, '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
            [db::sha256_hex("clave")],
        )
        .expect("student");

        let store = DbCredentialStore { conn: &conn };
        let v = store
            .verify("MAT-001", "clave")
            .expect("verify")
            .expect("student matches");
        assert_eq!(v.role, Role::Student);
        assert_eq!(v.display_name, "Ana López");
    }

    #[test]
    fn token_roundtrip_and_tamper_rejection() {
        let verified = Verified {
            subject: "profe@edu.com".to_string(),
            role: Role::Teacher,
            user_id: Some("t1".to_string()),
            display_name: "Profe Uno".to_string(),
        };
        let token = issue_token("secret-key", &verified).expect("issue");
        let claims = validate_token("secret-key", &token).expect("validate");
        assert_eq!(claims.sub, "profe@edu.com");
        assert_eq!(claims.role, "Teacher");
        assert_eq!(claims.uid.as_deref(), Some("t1"));
        assert!(claims.exp > claims.iat);

        assert!(validate_token("other-key", &token).is_err());
        assert!(validate_token("secret-key", "garbage.token.here").is_err());
    }
}
