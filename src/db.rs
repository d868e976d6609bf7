use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("escolar.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    seed_default_settings(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Also used by unit tests against in-memory
/// connections, so it must not touch the filesystem.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_levels(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_grades(
            id TEXT PRIMARY KEY,
            level_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(level_id) REFERENCES school_levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_grades_level ON school_grades(level_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_groups(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES school_grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_groups_grade ON school_groups(grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS families(
            id TEXT PRIMARY KEY,
            family_number TEXT,
            family_name TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS guardians(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            password_hash TEXT,
            workplace TEXT,
            occupation TEXT,
            work_phone TEXT,
            mobile_phone TEXT,
            is_mother INTEGER NOT NULL DEFAULT 0,
            is_father INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            matricula TEXT,
            first_name TEXT NOT NULL,
            paternal_surname TEXT NOT NULL,
            maternal_surname TEXT,
            gender TEXT,
            birth_date TEXT,
            curp TEXT,
            email TEXT UNIQUE,
            phone TEXT,
            street_address TEXT,
            city TEXT,
            state TEXT,
            zip_code TEXT,
            photo_url TEXT,
            status TEXT NOT NULL DEFAULT 'Activo',
            admission_date TEXT,
            notes TEXT,
            family_id TEXT,
            group_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(family_id) REFERENCES families(id) ON DELETE SET NULL,
            FOREIGN KEY(group_id) REFERENCES school_groups(id) ON DELETE SET NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_family ON students(family_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;
    ensure_students_iq_score(conn)?;
    ensure_students_password_hash(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_guardians(
            student_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            relationship TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY(student_id, guardian_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(guardian_id) REFERENCES guardians(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_guardians_guardian ON student_guardians(guardian_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            matricula TEXT,
            password_hash TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS coordinators(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT,
            password_hash TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS coordinator_groups(
            id TEXT PRIMARY KEY,
            coordinator_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            UNIQUE(coordinator_id, group_id),
            FOREIGN KEY(coordinator_id) REFERENCES coordinators(id) ON DELETE CASCADE,
            FOREIGN KEY(group_id) REFERENCES school_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coordinator_groups_coordinator ON coordinator_groups(coordinator_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_teacher ON courses(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            UNIQUE(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendances(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            class_date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, course_id, class_date),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendances_student ON attendances(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendances_course_date ON attendances(course_id, class_date)",
        [],
    )?;
    // The emotion column arrived after the first schema cut.
    ensure_attendances_emotion(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incident_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_incidents(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            type_id TEXT NOT NULL,
            reporter_id TEXT,
            date TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'Abierto',
            action_taken TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(type_id) REFERENCES incident_types(id),
            FOREIGN KEY(reporter_id) REFERENCES teachers(id) ON DELETE SET NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_incidents_student ON student_incidents(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_incidents_date ON student_incidents(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_grading_criteria(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            component_type TEXT NOT NULL,
            weight_percentage REAL NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_criteria_course ON course_grading_criteria(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_evaluations(
            id TEXT PRIMARY KEY,
            criteria_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            start_date TEXT,
            end_date TEXT,
            max_score REAL NOT NULL DEFAULT 100,
            created_at TEXT NOT NULL,
            FOREIGN KEY(criteria_id) REFERENCES course_grading_criteria(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_evaluations_criteria ON course_evaluations(criteria_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_course_evaluations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            evaluation_id TEXT NOT NULL,
            score REAL,
            feedback TEXT,
            graded_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, evaluation_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(evaluation_id) REFERENCES course_evaluations(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_evaluations_student ON student_course_evaluations(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_evaluations_evaluation ON student_course_evaluations(evaluation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS interest_categories(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS interests(
            id TEXT PRIMARY KEY,
            category_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(category_id) REFERENCES interest_categories(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_interests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            interest_id TEXT NOT NULL,
            preference_level INTEGER,
            notes TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, interest_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(interest_id) REFERENCES interests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_interests_student ON student_interests(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'General',
            reference_id TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS iq_tests(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            total_time_minutes INTEGER NOT NULL DEFAULT 45,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS iq_questions(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            text TEXT NOT NULL,
            order_index INTEGER NOT NULL DEFAULT 0,
            points INTEGER NOT NULL DEFAULT 1,
            correct_option TEXT NOT NULL,
            options TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(test_id) REFERENCES iq_tests(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_iq_questions_test ON iq_questions(test_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS iq_test_attempts(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            score INTEGER,
            FOREIGN KEY(test_id) REFERENCES iq_tests(id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_iq_attempts_student ON iq_test_attempts(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS iq_attempt_answers(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            selected_option TEXT NOT NULL,
            is_correct INTEGER NOT NULL,
            UNIQUE(attempt_id, question_id),
            FOREIGN KEY(attempt_id) REFERENCES iq_test_attempts(id) ON DELETE CASCADE,
            FOREIGN KEY(question_id) REFERENCES iq_questions(id)
        )",
        [],
    )?;

    Ok(())
}

fn ensure_attendances_emotion(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendances", "emotion")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendances ADD COLUMN emotion TEXT", [])?;
    Ok(())
}

fn ensure_students_iq_score(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "iq_score")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN iq_score INTEGER", [])?;
    Ok(())
}

fn ensure_students_password_hash(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "password_hash")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN password_hash TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// First-run settings: token signing secret and the bootstrap admin
/// credential. Both live in the settings table so they can be rotated
/// through `config.set` without touching code.
pub fn seed_default_settings(conn: &Connection) -> anyhow::Result<()> {
    if settings_get_json(conn, "auth.jwt_secret")?.is_none() {
        let secret = uuid::Uuid::new_v4().to_string();
        settings_set_json(conn, "auth.jwt_secret", &serde_json::json!(secret))?;
    }
    if settings_get_json(conn, "auth.admin")?.is_none() {
        settings_set_json(
            conn,
            "auth.admin",
            &serde_json::json!({
                "username": "admin@edu.com",
                "passwordSha256": sha256_hex("password"),
                "displayName": "Administrador"
            }),
        )?;
    }
    Ok(())
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        assert!(settings_get_json(&conn, "missing").expect("get").is_none());

        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        let v = settings_get_json(&conn, "k").expect("get").expect("some");
        assert_eq!(v["a"], 1);

        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("set again");
        let v = settings_get_json(&conn, "k").expect("get").expect("some");
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }

    #[test]
    fn seeded_admin_is_present_once() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        seed_default_settings(&conn).expect("seed");
        let admin = settings_get_json(&conn, "auth.admin")
            .expect("get")
            .expect("seeded");
        assert_eq!(admin["username"], "admin@edu.com");

        // A second seeding pass must not rotate the secret.
        let secret_before = settings_get_json(&conn, "auth.jwt_secret").expect("get");
        seed_default_settings(&conn).expect("seed again");
        let secret_after = settings_get_json(&conn, "auth.jwt_secret").expect("get");
        assert_eq!(secret_before, secret_after);
    }
}
