use crate::ipc::helpers::{dispatch, optional_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, GradeRow};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Denormalized read-model for one student: demographics, family,
/// level chain, guardians, courses, and the per-course grade breakdown.
fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;

    let base = conn
        .query_row(
            "SELECT s.id, s.first_name, s.paternal_surname, s.maternal_surname, s.gender,
                    s.birth_date, s.curp, s.photo_url, s.email, s.phone, s.street_address,
                    s.city, s.state, s.zip_code, s.matricula, s.status,
                    g.name, gr.name, lvl.name,
                    s.family_id, s.iq_score
             FROM students s
             LEFT JOIN school_groups g ON g.id = s.group_id
             LEFT JOIN school_grades gr ON gr.id = g.grade_id
             LEFT JOIN school_levels lvl ON lvl.id = gr.level_id
             WHERE s.id = ?",
            [&id],
            |r| {
                let first: String = r.get(1)?;
                let paternal: String = r.get(2)?;
                let maternal: Option<String> = r.get(3)?;
                let full_name = match &maternal {
                    Some(m) => format!("{} {} {}", first, paternal, m),
                    None => format!("{} {}", first, paternal),
                };
                Ok((
                    json!({
                        "id": r.get::<_, String>(0)?,
                        "firstName": first,
                        "paternalSurname": paternal,
                        "maternalSurname": maternal,
                        "fullName": full_name,
                        "gender": r.get::<_, Option<String>>(4)?,
                        "birthDate": r.get::<_, Option<String>>(5)?,
                        "curp": r.get::<_, Option<String>>(6)?,
                        "photoUrl": r.get::<_, Option<String>>(7)?,
                        "email": r.get::<_, Option<String>>(8)?,
                        "phone": r.get::<_, Option<String>>(9)?,
                        "streetAddress": r.get::<_, Option<String>>(10)?,
                        "city": r.get::<_, Option<String>>(11)?,
                        "state": r.get::<_, Option<String>>(12)?,
                        "zipCode": r.get::<_, Option<String>>(13)?,
                        "matricula": r.get::<_, Option<String>>(14)?,
                        "status": r.get::<_, String>(15)?,
                        "group": r.get::<_, Option<String>>(16)?,
                        "grade": r.get::<_, Option<String>>(17)?,
                        "level": r.get::<_, Option<String>>(18)?,
                        "iqScore": r.get::<_, Option<i64>>(20)?
                    }),
                    r.get::<_, Option<String>>(19)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((mut profile, family_id)) = base else {
        return Err(HandlerErr::not_found("student not found"));
    };

    profile["family"] = match family_id {
        Some(fid) => conn
            .query_row(
                "SELECT id, family_name, family_number FROM families WHERE id = ?",
                [&fid],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "familyName": r.get::<_, Option<String>>(1)?,
                        "familyNumber": r.get::<_, Option<String>>(2)?
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::query)?
            .unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    };

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.full_name, g.phone, g.email, sg.relationship, g.is_mother, g.is_father
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
                "phone": r.get::<_, Option<String>>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "relationship": r.get::<_, Option<String>>(4)?,
                "isMother": r.get::<_, i64>(5)? != 0,
                "isFather": r.get::<_, i64>(6)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    profile["guardians"] = json!(guardians);

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.grade, t.full_name
             FROM enrollments e
             JOIN courses c ON c.id = e.course_id
             JOIN teachers t ON t.id = c.teacher_id
             WHERE e.student_id = ?
             ORDER BY c.name",
        )
        .map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "grade": r.get::<_, String>(2)?,
                "teacher": r.get::<_, String>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    profile["courses"] = json!(courses);

    let mut stmt = conn
        .prepare(
            "SELECT c.name, e.title, g.score, cr.component_type, cr.weight_percentage
             FROM student_course_evaluations g
             JOIN course_evaluations e ON e.id = g.evaluation_id
             JOIN course_grading_criteria cr ON cr.id = e.criteria_id
             JOIN courses c ON c.id = cr.course_id
             WHERE g.student_id = ?
             ORDER BY datetime(g.created_at)",
        )
        .map_err(HandlerErr::query)?;
    let grade_rows = stmt
        .query_map([&id], |r| {
            Ok(GradeRow {
                course: r.get(0)?,
                title: r.get(1)?,
                score: r.get(2)?,
                component_type: r.get(3)?,
                weight_percentage: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let grades: Vec<serde_json::Value> = stats::group_grades_by_course(grade_rows)
        .into_iter()
        .map(|subject| {
            let evaluations: Vec<serde_json::Value> = subject
                .evaluations
                .iter()
                .map(|e| {
                    json!({
                        "title": e.title,
                        "score": e.score,
                        "componentType": e.component_type,
                        "weight": e.weight_percentage
                    })
                })
                .collect();
            json!({
                "subject": subject.subject,
                "evaluations": evaluations,
                "average": subject.average
            })
        })
        .collect();
    profile["grades"] = json!(grades);

    Ok(profile)
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = optional_str(params, "courseId");
    let group_id = optional_str(params, "groupId");
    let status = optional_str(params, "status");

    let mut sql = String::from(
        "SELECT s.id, s.first_name, s.paternal_surname, s.maternal_surname, s.photo_url,
                s.email, s.phone, s.status, g.name, gr.name, lvl.name
         FROM students s
         LEFT JOIN school_groups g ON g.id = s.group_id
         LEFT JOIN school_grades gr ON gr.id = g.grade_id
         LEFT JOIN school_levels lvl ON lvl.id = gr.level_id
         WHERE 1=1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(cid) = &course_id {
        sql.push_str(" AND EXISTS(SELECT 1 FROM enrollments e WHERE e.student_id = s.id AND e.course_id = ?)");
        args.push(cid.clone());
    }
    if let Some(gid) = &group_id {
        sql.push_str(" AND s.group_id = ?");
        args.push(gid.clone());
    }
    if let Some(st) = &status {
        sql.push_str(" AND s.status = ?");
        args.push(st.clone());
    }
    sql.push_str(" ORDER BY s.paternal_surname, s.first_name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let first: String = r.get(1)?;
            let paternal: String = r.get(2)?;
            let maternal: Option<String> = r.get(3)?;
            let full_name = match &maternal {
                Some(m) => format!("{} {} {}", first, paternal, m),
                None => format!("{} {}", first, paternal),
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": full_name,
                "photoUrl": r.get::<_, Option<String>>(4)?,
                "email": r.get::<_, Option<String>>(5)?,
                "phone": r.get::<_, Option<String>>(6)?,
                "status": r.get::<_, String>(7)?,
                "group": r.get::<_, Option<String>>(8)?,
                "grade": r.get::<_, Option<String>>(9)?,
                "level": r.get::<_, Option<String>>(10)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "studentProfile.get" => Some(dispatch(state, req, get)),
        "studentProfile.list" => Some(dispatch(state, req, list)),
        _ => None,
    }
}
