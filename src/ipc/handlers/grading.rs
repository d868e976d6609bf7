use crate::ipc::helpers::{
    check_id_match, dispatch, new_id, now_rfc3339, optional_f64, optional_str, require_row,
    required_f64, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn criteria_list_by_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    require_row(conn, "courses", &course_id, "course")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, component_type, weight_percentage, description, created_at, updated_at
             FROM course_grading_criteria WHERE course_id = ?
             ORDER BY component_type",
        )
        .map_err(HandlerErr::query)?;
    let criteria = stmt
        .query_map([&course_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "componentType": r.get::<_, String>(1)?,
                "weightPercentage": r.get::<_, f64>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "updatedAt": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "criteria": criteria }))
}

fn criteria_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let component_type = required_str(params, "componentType")?;
    let weight = required_f64(params, "weightPercentage")?;
    let description = optional_str(params, "description");
    require_row(conn, "courses", &course_id, "course")?;

    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO course_grading_criteria(id, course_id, component_type, weight_percentage,
                description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &course_id, &component_type, weight, &description, &now, &now),
    )
    .map_err(|e| HandlerErr::update(e, "course_grading_criteria"))?;
    Ok(json!({
        "id": id,
        "courseId": course_id,
        "componentType": component_type,
        "weightPercentage": weight
    }))
}

fn criteria_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("criteria")
        .ok_or_else(|| HandlerErr::bad_params("missing criteria"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "course_grading_criteria", &id, "grading criteria")?;

    let component_type = required_str(payload, "componentType")?;
    let weight = required_f64(payload, "weightPercentage")?;
    let description = optional_str(payload, "description");
    conn.execute(
        "UPDATE course_grading_criteria SET component_type = ?, weight_percentage = ?,
                description = ?, updated_at = ?
         WHERE id = ?",
        (&component_type, weight, &description, now_rfc3339(), &id),
    )
    .map_err(|e| HandlerErr::update(e, "course_grading_criteria"))?;
    Ok(json!({ "id": id }))
}

fn criteria_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM course_grading_criteria WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "course_grading_criteria"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("grading criteria not found"));
    }
    Ok(json!({ "deleted": id }))
}

fn evaluations_list_by_criteria(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let criteria_id = required_str(params, "criteriaId")?;
    require_row(conn, "course_grading_criteria", &criteria_id, "grading criteria")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, title, description, start_date, end_date, max_score, created_at
             FROM course_evaluations WHERE criteria_id = ?
             ORDER BY datetime(created_at)",
        )
        .map_err(HandlerErr::query)?;
    let evaluations = stmt
        .query_map([&criteria_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "startDate": r.get::<_, Option<String>>(3)?,
                "endDate": r.get::<_, Option<String>>(4)?,
                "maxScore": r.get::<_, f64>(5)?,
                "createdAt": r.get::<_, String>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "evaluations": evaluations }))
}

fn evaluations_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let criteria_id = required_str(params, "criteriaId")?;
    let title = required_str(params, "title")?;
    require_row(conn, "course_grading_criteria", &criteria_id, "grading criteria")?;
    let description = optional_str(params, "description");
    let start_date = optional_str(params, "startDate");
    let end_date = optional_str(params, "endDate");
    let max_score = optional_f64(params, "maxScore")?.unwrap_or(100.0);

    let id = new_id();
    conn.execute(
        "INSERT INTO course_evaluations(id, criteria_id, title, description, start_date,
                end_date, max_score, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &criteria_id,
            &title,
            &description,
            &start_date,
            &end_date,
            max_score,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e, "course_evaluations"))?;
    Ok(json!({ "id": id, "criteriaId": criteria_id, "title": title, "maxScore": max_score }))
}

fn evaluations_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let payload = params
        .get("evaluation")
        .ok_or_else(|| HandlerErr::bad_params("missing evaluation"))?;
    check_id_match(&id, payload)?;
    require_row(conn, "course_evaluations", &id, "evaluation")?;

    let title = required_str(payload, "title")?;
    let description = optional_str(payload, "description");
    let start_date = optional_str(payload, "startDate");
    let end_date = optional_str(payload, "endDate");
    let max_score = optional_f64(payload, "maxScore")?.unwrap_or(100.0);
    conn.execute(
        "UPDATE course_evaluations SET title = ?, description = ?, start_date = ?,
                end_date = ?, max_score = ?
         WHERE id = ?",
        (&title, &description, &start_date, &end_date, max_score, &id),
    )
    .map_err(|e| HandlerErr::update(e, "course_evaluations"))?;
    Ok(json!({ "id": id }))
}

fn evaluations_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    let affected = conn
        .execute("DELETE FROM course_evaluations WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::update(e, "course_evaluations"))?;
    if affected == 0 {
        return Err(HandlerErr::not_found("evaluation not found"));
    }
    Ok(json!({ "deleted": id }))
}

fn grade_row(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT g.id, g.student_id, g.evaluation_id, g.score, g.feedback, g.graded_at,
                g.created_at, g.updated_at, e.title
         FROM student_course_evaluations g
         JOIN course_evaluations e ON e.id = g.evaluation_id
         WHERE g.id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "evaluationId": r.get::<_, String>(2)?,
                "score": r.get::<_, Option<f64>>(3)?,
                "feedback": r.get::<_, Option<String>>(4)?,
                "gradedAt": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
                "updatedAt": r.get::<_, String>(7)?,
                "evaluationTitle": r.get::<_, String>(8)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

/// The one conditional write in the mutation layer: at most one grade
/// row per (student, evaluation); a second write overwrites the first
/// in place. Returns whether a row was created.
fn upsert_grade(
    conn: &Connection,
    student_id: &str,
    evaluation_id: &str,
    score: Option<f64>,
    feedback: Option<&str>,
) -> Result<(bool, String), HandlerErr> {
    let now = now_rfc3339();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM student_course_evaluations
             WHERE student_id = ? AND evaluation_id = ?",
            (student_id, evaluation_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE student_course_evaluations
                 SET score = ?, feedback = ?, graded_at = ?, updated_at = ?
                 WHERE id = ?",
                (score, feedback, &now, &now, &id),
            )
            .map_err(|e| HandlerErr::update(e, "student_course_evaluations"))?;
            Ok((false, id))
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO student_course_evaluations(id, student_id, evaluation_id, score,
                        feedback, graded_at, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (&id, student_id, evaluation_id, score, feedback, &now, &now, &now),
            )
            .map_err(|e| HandlerErr::update(e, "student_course_evaluations"))?;
            Ok((true, id))
        }
    }
}

fn grades_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let evaluation_id = required_str(params, "evaluationId")?;
    require_row(conn, "students", &student_id, "student")?;
    require_row(conn, "course_evaluations", &evaluation_id, "evaluation")?;
    let score = optional_f64(params, "score")?;
    let feedback = optional_str(params, "feedback");

    let (created, id) = upsert_grade(conn, &student_id, &evaluation_id, score, feedback.as_deref())?;
    let mut result = grade_row(conn, &id)?.expect("upserted grade");
    result["created"] = json!(created);
    Ok(result)
}

fn grades_bulk_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(grades) = params.get("grades").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing grades"));
    };
    if grades.is_empty() {
        return Err(HandlerErr::bad_params("grades must not be empty"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut created = 0i64;
    let mut updated = 0i64;
    for raw in grades {
        let student_id = required_str(raw, "studentId")?;
        let evaluation_id = required_str(raw, "evaluationId")?;
        require_row(&tx, "students", &student_id, "student")?;
        require_row(&tx, "course_evaluations", &evaluation_id, "evaluation")?;
        let score = optional_f64(raw, "score")?;
        let feedback = optional_str(raw, "feedback");
        let (was_created, _) =
            upsert_grade(&tx, &student_id, &evaluation_id, score, feedback.as_deref())?;
        if was_created {
            created += 1;
        } else {
            updated += 1;
        }
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "created": created, "updated": updated }))
}

fn grades_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = required_str(params, "id")?;
    grade_row(conn, &id)?.ok_or_else(|| HandlerErr::not_found("grade not found"))
}

fn grades_list_by_evaluation(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let evaluation_id = required_str(params, "evaluationId")?;
    require_row(conn, "course_evaluations", &evaluation_id, "evaluation")?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.student_id, s.first_name, s.paternal_surname, g.score, g.feedback
             FROM student_course_evaluations g
             JOIN students s ON s.id = g.student_id
             WHERE g.evaluation_id = ?
             ORDER BY s.paternal_surname, s.first_name",
        )
        .map_err(HandlerErr::query)?;
    let grades = stmt
        .query_map([&evaluation_id], |r| {
            let first: String = r.get(2)?;
            let paternal: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", first, paternal),
                "score": r.get::<_, Option<f64>>(4)?,
                "feedback": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": grades }))
}

fn grades_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.evaluation_id, e.title, cr.component_type, cr.weight_percentage,
                    c.name, g.score, g.feedback, g.graded_at
             FROM student_course_evaluations g
             JOIN course_evaluations e ON e.id = g.evaluation_id
             JOIN course_grading_criteria cr ON cr.id = e.criteria_id
             JOIN courses c ON c.id = cr.course_id
             WHERE g.student_id = ?
             ORDER BY datetime(g.created_at) DESC",
        )
        .map_err(HandlerErr::query)?;
    let grades = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "evaluationId": r.get::<_, String>(1)?,
                "evaluationTitle": r.get::<_, String>(2)?,
                "componentType": r.get::<_, String>(3)?,
                "weightPercentage": r.get::<_, f64>(4)?,
                "courseName": r.get::<_, String>(5)?,
                "score": r.get::<_, Option<f64>>(6)?,
                "feedback": r.get::<_, Option<String>>(7)?,
                "gradedAt": r.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.criteria.listByCourse" => Some(dispatch(state, req, criteria_list_by_course)),
        "grading.criteria.create" => Some(dispatch(state, req, criteria_create)),
        "grading.criteria.update" => Some(dispatch(state, req, criteria_update)),
        "grading.criteria.delete" => Some(dispatch(state, req, criteria_delete)),
        "grading.evaluations.listByCriteria" => {
            Some(dispatch(state, req, evaluations_list_by_criteria))
        }
        "grading.evaluations.create" => Some(dispatch(state, req, evaluations_create)),
        "grading.evaluations.update" => Some(dispatch(state, req, evaluations_update)),
        "grading.evaluations.delete" => Some(dispatch(state, req, evaluations_delete)),
        "grades.get" => Some(dispatch(state, req, grades_get)),
        "grades.listByEvaluation" => Some(dispatch(state, req, grades_list_by_evaluation)),
        "grades.listByStudent" => Some(dispatch(state, req, grades_list_by_student)),
        "grades.upsert" => Some(dispatch(state, req, grades_upsert)),
        "grades.bulkUpsert" => Some(dispatch(state, req, grades_bulk_upsert)),
        _ => None,
    }
}
