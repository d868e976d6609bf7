use crate::ipc::helpers::{
    dispatch, new_id, now_rfc3339, optional_i64, optional_str, require_row, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn tests_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, description, total_time_minutes, is_active, created_at
             FROM iq_tests ORDER BY name",
        )
        .map_err(HandlerErr::query)?;
    let tests = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "totalTimeMinutes": r.get::<_, i64>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "tests": tests }))
}

fn tests_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description");
    let total_time = optional_i64(params, "totalTimeMinutes")?.unwrap_or(45);
    let id = new_id();
    conn.execute(
        "INSERT INTO iq_tests(id, name, description, total_time_minutes, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&id, &name, &description, total_time, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e, "iq_tests"))?;
    Ok(json!({ "id": id, "name": name, "totalTimeMinutes": total_time }))
}

fn questions_list_by_test(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = required_str(params, "testId")?;
    require_row(conn, "iq_tests", &test_id, "test")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, text, order_index, points, correct_option, options
             FROM iq_questions WHERE test_id = ?
             ORDER BY order_index",
        )
        .map_err(HandlerErr::query)?;
    let questions = stmt
        .query_map([&test_id], |r| {
            let options_raw: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "text": r.get::<_, String>(1)?,
                "orderIndex": r.get::<_, i64>(2)?,
                "points": r.get::<_, i64>(3)?,
                "correctOption": r.get::<_, String>(4)?,
                "options": options_raw
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "questions": questions }))
}

fn questions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = required_str(params, "testId")?;
    let text = required_str(params, "text")?;
    let correct_option = required_str(params, "correctOption")?;
    require_row(conn, "iq_tests", &test_id, "test")?;
    let order_index = optional_i64(params, "orderIndex")?.unwrap_or(0);
    let points = optional_i64(params, "points")?.unwrap_or(1);
    let options = params
        .get("options")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());

    let id = new_id();
    conn.execute(
        "INSERT INTO iq_questions(id, test_id, text, order_index, points, correct_option, options, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &test_id,
            &text,
            order_index,
            points,
            &correct_option,
            &options,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e, "iq_questions"))?;
    Ok(json!({ "id": id, "testId": test_id, "orderIndex": order_index, "points": points }))
}

fn attempts_start(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = required_str(params, "testId")?;
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "iq_tests", &test_id, "test")?;
    require_row(conn, "students", &student_id, "student")?;

    let id = new_id();
    let started_at = now_rfc3339();
    conn.execute(
        "INSERT INTO iq_test_attempts(id, test_id, student_id, started_at) VALUES(?, ?, ?, ?)",
        (&id, &test_id, &student_id, &started_at),
    )
    .map_err(|e| HandlerErr::update(e, "iq_test_attempts"))?;
    Ok(json!({
        "id": id,
        "testId": test_id,
        "studentId": student_id,
        "startedAt": started_at
    }))
}

fn attempt_open(conn: &Connection, attempt_id: &str) -> Result<(String, String), HandlerErr> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT test_id, student_id, completed_at FROM iq_test_attempts WHERE id = ?",
            [attempt_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((test_id, student_id, completed_at)) = row else {
        return Err(HandlerErr::not_found("attempt not found"));
    };
    if completed_at.is_some() {
        return Err(HandlerErr::conflict("attempt already submitted"));
    }
    Ok((test_id, student_id))
}

/// One answer row per (attempt, question); re-answering replaces the
/// previous selection.
fn attempts_answer(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = required_str(params, "attemptId")?;
    let question_id = required_str(params, "questionId")?;
    let selected = required_str(params, "selectedOption")?;
    let (test_id, _) = attempt_open(conn, &attempt_id)?;

    let question: Option<(String, String)> = conn
        .query_row(
            "SELECT test_id, correct_option FROM iq_questions WHERE id = ?",
            [&question_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((question_test_id, correct_option)) = question else {
        return Err(HandlerErr::not_found("question not found"));
    };
    if question_test_id != test_id {
        return Err(HandlerErr::bad_params("question belongs to another test"));
    }
    let is_correct = selected == correct_option;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM iq_attempt_answers WHERE attempt_id = ? AND question_id = ?",
            (&attempt_id, &question_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let (created, id) = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE iq_attempt_answers SET selected_option = ?, is_correct = ? WHERE id = ?",
                (&selected, is_correct as i64, &id),
            )
            .map_err(|e| HandlerErr::update(e, "iq_attempt_answers"))?;
            (false, id)
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO iq_attempt_answers(id, attempt_id, question_id, selected_option, is_correct)
                 VALUES(?, ?, ?, ?, ?)",
                (&id, &attempt_id, &question_id, &selected, is_correct as i64),
            )
            .map_err(|e| HandlerErr::update(e, "iq_attempt_answers"))?;
            (true, id)
        }
    };

    Ok(json!({
        "id": id,
        "attemptId": attempt_id,
        "questionId": question_id,
        "selectedOption": selected,
        "isCorrect": is_correct,
        "created": created
    }))
}

/// Sums the points of correct answers, closes the attempt, and writes
/// the score back to the student record.
fn attempts_submit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attempt_id = required_str(params, "attemptId")?;
    let (_, student_id) = attempt_open(conn, &attempt_id)?;

    let score: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(q.points), 0)
             FROM iq_attempt_answers a
             JOIN iq_questions q ON q.id = a.question_id
             WHERE a.attempt_id = ? AND a.is_correct = 1",
            [&attempt_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let completed_at = now_rfc3339();
    tx.execute(
        "UPDATE iq_test_attempts SET completed_at = ?, score = ? WHERE id = ?",
        (&completed_at, score, &attempt_id),
    )
    .map_err(|e| HandlerErr::update(e, "iq_test_attempts"))?;
    tx.execute(
        "UPDATE students SET iq_score = ? WHERE id = ?",
        (score, &student_id),
    )
    .map_err(|e| HandlerErr::update(e, "students"))?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "attemptId": attempt_id,
        "studentId": student_id,
        "score": score,
        "completedAt": completed_at
    }))
}

fn attempts_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.test_id, t.name, a.started_at, a.completed_at, a.score
             FROM iq_test_attempts a
             JOIN iq_tests t ON t.id = a.test_id
             WHERE a.student_id = ?
             ORDER BY datetime(a.started_at) DESC",
        )
        .map_err(HandlerErr::query)?;
    let attempts = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "testId": r.get::<_, String>(1)?,
                "testName": r.get::<_, String>(2)?,
                "startedAt": r.get::<_, String>(3)?,
                "completedAt": r.get::<_, Option<String>>(4)?,
                "score": r.get::<_, Option<i64>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "attempts": attempts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "iq.tests.list" => Some(dispatch(state, req, tests_list)),
        "iq.tests.create" => Some(dispatch(state, req, tests_create)),
        "iq.questions.listByTest" => Some(dispatch(state, req, questions_list_by_test)),
        "iq.questions.create" => Some(dispatch(state, req, questions_create)),
        "iq.attempts.start" => Some(dispatch(state, req, attempts_start)),
        "iq.attempts.answer" => Some(dispatch(state, req, attempts_answer)),
        "iq.attempts.submit" => Some(dispatch(state, req, attempts_submit)),
        "iq.attempts.listByStudent" => Some(dispatch(state, req, attempts_list_by_student)),
        _ => None,
    }
}
