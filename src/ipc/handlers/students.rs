use crate::db;
use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct StudentInput {
    matricula: Option<String>,
    first_name: String,
    paternal_surname: String,
    maternal_surname: Option<String>,
    gender: Option<String>,
    birth_date: Option<String>,
    curp: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    street_address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    photo_url: Option<String>,
    status: String,
    admission_date: Option<String>,
    notes: Option<String>,
    family_id: Option<String>,
    group_id: Option<String>,
    password_hash: Option<String>,
}

fn parse_input(payload: &serde_json::Value) -> Result<StudentInput, HandlerErr> {
    Ok(StudentInput {
        matricula: optional_str(payload, "matricula"),
        first_name: required_str(payload, "firstName")?,
        paternal_surname: required_str(payload, "paternalSurname")?,
        maternal_surname: optional_str(payload, "maternalSurname"),
        gender: optional_str(payload, "gender"),
        birth_date: optional_str(payload, "birthDate"),
        curp: optional_str(payload, "curp"),
        email: optional_str(payload, "email"),
        phone: optional_str(payload, "phone"),
        street_address: optional_str(payload, "streetAddress"),
        city: optional_str(payload, "city"),
        state: optional_str(payload, "state"),
        zip_code: optional_str(payload, "zipCode"),
        photo_url: optional_str(payload, "photoUrl"),
        status: optional_str(payload, "status").unwrap_or_else(|| "Activo".to_string()),
        admission_date: optional_str(payload, "admissionDate"),
        notes: optional_str(payload, "notes"),
        family_id: optional_str(payload, "familyId"),
        group_id: optional_str(payload, "groupId"),
        password_hash: optional_str(payload, "password").map(|p| db::sha256_hex(&p)),
    })
}

fn check_references(conn: &Connection, input: &StudentInput) -> Result<(), HandlerErr> {
    if let Some(family_id) = &input.family_id {
        require_row(conn, "families", family_id, "family")?;
    }
    if let Some(group_id) = &input.group_id {
        require_row(conn, "school_groups", group_id, "group")?;
    }
    Ok(())
}

fn email_taken(conn: &Connection, email: &str, exclude_id: Option<&str>) -> Result<bool, HandlerErr> {
    let taken = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM students WHERE email = ? AND id != ?",
                (email, id),
                |r| r.get::<_, i64>(0),
            )
            .optional(),
        None => conn
            .query_row("SELECT 1 FROM students WHERE email = ?", [email], |r| {
                r.get::<_, i64>(0)
            })
            .optional(),
    }
    .map_err(HandlerErr::query)?;
    Ok(taken.is_some())
}

fn student_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, matricula, first_name, paternal_surname, maternal_surname, gender,
                birth_date, curp, email, phone, street_address, city, state, zip_code,
                photo_url, status, admission_date, notes, family_id, group_id, iq_score,
                created_at, updated_at
         FROM students WHERE id = ?",
        [id],
        |r| {
            let first: String = r.get(2)?;
            let paternal: String = r.get(3)?;
            let maternal: Option<String> = r.get(4)?;
            let full_name = match &maternal {
                Some(m) => format!("{} {} {}", first, paternal, m),
                None => format!("{} {}", first, paternal),
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "matricula": r.get::<_, Option<String>>(1)?,
                "firstName": first,
                "paternalSurname": paternal,
                "maternalSurname": maternal,
                "fullName": full_name,
                "gender": r.get::<_, Option<String>>(5)?,
                "birthDate": r.get::<_, Option<String>>(6)?,
                "curp": r.get::<_, Option<String>>(7)?,
                "email": r.get::<_, Option<String>>(8)?,
                "phone": r.get::<_, Option<String>>(9)?,
                "streetAddress": r.get::<_, Option<String>>(10)?,
                "city": r.get::<_, Option<String>>(11)?,
                "state": r.get::<_, Option<String>>(12)?,
                "zipCode": r.get::<_, Option<String>>(13)?,
                "photoUrl": r.get::<_, Option<String>>(14)?,
                "status": r.get::<_, String>(15)?,
                "admissionDate": r.get::<_, Option<String>>(16)?,
                "notes": r.get::<_, Option<String>>(17)?,
                "familyId": r.get::<_, Option<String>>(18)?,
                "groupId": r.get::<_, Option<String>>(19)?,
                "iqScore": r.get::<_, Option<i64>>(20)?,
                "createdAt": r.get::<_, String>(21)?,
                "updatedAt": r.get::<_, String>(22)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = optional_str(params, "status");
    let group_id = optional_str(params, "groupId");

    let mut sql = String::from(
        "SELECT id, first_name, paternal_surname, matricula, status, group_id
         FROM students WHERE 1=1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(s) = &status {
        sql.push_str(" AND status = ?");
        args.push(s.clone());
    }
    if let Some(g) = &group_id {
        sql.push_str(" AND group_id = ?");
        args.push(g.clone());
    }
    sql.push_str(" ORDER BY paternal_surname, first_name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let first: String = r.get(1)?;
            let paternal: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": format!("{} {}", first, paternal),
                "matricula": r.get::<_, Option<String>>(3)?,
                "status": r.get::<_, String>(4)?,
                "groupId": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let Some(mut student) = student_row(conn, &id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };

    if let Some(family_id) = student["familyId"].as_str() {
        let family = conn
            .query_row(
                "SELECT id, family_number, family_name FROM families WHERE id = ?",
                [family_id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "familyNumber": r.get::<_, Option<String>>(1)?,
                        "familyName": r.get::<_, Option<String>>(2)?
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::query)?;
        student["family"] = family.unwrap_or(serde_json::Value::Null);
    } else {
        student["family"] = serde_json::Value::Null;
    }

    if let Some(group_id) = student["groupId"].as_str() {
        let chain = conn
            .query_row(
                "SELECT g.id, g.name, gr.name, lvl.name
                 FROM school_groups g
                 LEFT JOIN school_grades gr ON gr.id = g.grade_id
                 LEFT JOIN school_levels lvl ON lvl.id = gr.level_id
                 WHERE g.id = ?",
                [group_id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "gradeName": r.get::<_, Option<String>>(2)?,
                        "levelName": r.get::<_, Option<String>>(3)?
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::query)?;
        student["group"] = chain.unwrap_or(serde_json::Value::Null);
    } else {
        student["group"] = serde_json::Value::Null;
    }

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.full_name, sg.relationship
             FROM student_guardians sg
             JOIN guardians g ON g.id = sg.guardian_id
             WHERE sg.student_id = ?
             ORDER BY g.full_name",
        )
        .map_err(HandlerErr::query)?;
    let guardians = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "relationship": r.get::<_, Option<String>>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    student["guardians"] = json!(guardians);

    Ok(student)
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_input(params)?;
    check_references(conn, &input)?;
    if let Some(email) = &input.email {
        if email_taken(conn, email, None)? {
            return Err(HandlerErr::conflict("student email already registered"));
        }
    }

    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO students(id, matricula, first_name, paternal_surname, maternal_surname,
                gender, birth_date, curp, email, phone, street_address, city, state, zip_code,
                photo_url, status, admission_date, notes, family_id, group_id, password_hash,
                created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &input.matricula,
            &input.first_name,
            &input.paternal_surname,
            &input.maternal_surname,
            &input.gender,
            &input.birth_date,
            &input.curp,
            &input.email,
            &input.phone,
            &input.street_address,
            &input.city,
            &input.state,
            &input.zip_code,
            &input.photo_url,
            &input.status,
            &input.admission_date,
            &input.notes,
            &input.family_id,
            &input.group_id,
            &input.password_hash,
            &now,
            &now,
        ],
    )
    .map_err(|e| HandlerErr::update(e, "students"))?;
    Ok(student_row(conn, &id)?.expect("inserted student"))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("student")
        .ok_or_else(|| HandlerErr::bad_params("missing student"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "students", &id, "student")?;

    let input = parse_input(payload)?;
    check_references(conn, &input)?;
    if let Some(email) = &input.email {
        if email_taken(conn, email, Some(&id))? {
            return Err(HandlerErr::conflict("student email already registered"));
        }
    }

    conn.execute(
        "UPDATE students SET matricula = ?, first_name = ?, paternal_surname = ?,
                maternal_surname = ?, gender = ?, birth_date = ?, curp = ?, email = ?,
                phone = ?, street_address = ?, city = ?, state = ?, zip_code = ?,
                photo_url = ?, status = ?, admission_date = ?, notes = ?, family_id = ?,
                group_id = ?, password_hash = COALESCE(?, password_hash), updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            &input.matricula,
            &input.first_name,
            &input.paternal_surname,
            &input.maternal_surname,
            &input.gender,
            &input.birth_date,
            &input.curp,
            &input.email,
            &input.phone,
            &input.street_address,
            &input.city,
            &input.state,
            &input.zip_code,
            &input.photo_url,
            &input.status,
            &input.admission_date,
            &input.notes,
            &input.family_id,
            &input.group_id,
            &input.password_hash,
            now_rfc3339(),
            &id,
        ],
    )
    .map_err(|e| HandlerErr::update(e, "students"))?;
    Ok(student_row(conn, &id)?.expect("updated student"))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "students"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(dispatch(state, req, list)),
        "students.get" => Some(dispatch(state, req, get)),
        "students.create" => Some(dispatch(state, req, create)),
        "students.update" => Some(dispatch(state, req, update)),
        "students.delete" => Some(dispatch(state, req, delete)),
        _ => None,
    }
}
