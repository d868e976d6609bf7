use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug)]
pub struct StatsError {
    pub code: &'static str,
    pub message: String,
}

impl StatsError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        StatsError {
            code,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StatsError {
    fn from(e: rusqlite::Error) -> Self {
        StatsError::new("db_query_failed", e.to_string())
    }
}

pub const UNASSIGNED_LEVEL: &str = "Sin asignar";

#[derive(Debug, Clone)]
pub struct RecentStudent {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug)]
pub struct AdminStats {
    pub total_students: i64,
    pub pending_docs: i64,
    pub new_enrollments: i64,
    pub by_level: Vec<(String, i64)>,
    pub recent_students: Vec<RecentStudent>,
}

/// Point-in-time enrollment snapshot for the admin dashboard. Read-only.
pub fn admin_stats(conn: &Connection, now: DateTime<Utc>) -> Result<AdminStats, StatsError> {
    let total_students: i64 =
        conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;

    // Missing national id stands in for incomplete paperwork.
    let pending_docs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE curp IS NULL OR TRIM(curp) = ''",
        [],
        |r| r.get(0),
    )?;

    let cutoff = (now - Duration::days(30)).to_rfc3339();
    let new_enrollments: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE datetime(created_at) >= datetime(?)",
        [&cutoff],
        |r| r.get(0),
    )?;

    // Load every grouped student with its level chain, then bucket in
    // memory. A broken chain lands in the unassigned bucket instead of
    // dropping the student.
    let mut stmt = conn.prepare(
        "SELECT lvl.name
         FROM students s
         LEFT JOIN school_groups g ON g.id = s.group_id
         LEFT JOIN school_grades gr ON gr.id = g.grade_id
         LEFT JOIN school_levels lvl ON lvl.id = gr.level_id
         WHERE s.group_id IS NOT NULL",
    )?;
    let level_names = stmt
        .query_map([], |r| r.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts: Vec<(String, i64)> = Vec::new();
    for name in level_names {
        let label = name.unwrap_or_else(|| UNASSIGNED_LEVEL.to_string());
        match counts.iter_mut().find(|(n, _)| *n == label) {
            Some((_, c)) => *c += 1,
            None => counts.push((label, 1)),
        }
    }

    let mut stmt = conn.prepare(
        "SELECT id, first_name, paternal_surname, created_at
         FROM students
         ORDER BY datetime(created_at) DESC
         LIMIT 5",
    )?;
    let recent_students = stmt
        .query_map([], |r| {
            let first: String = r.get(1)?;
            let paternal: String = r.get(2)?;
            Ok(RecentStudent {
                id: r.get(0)?,
                name: format!("{} {}", first, paternal),
                created_at: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AdminStats {
        total_students,
        pending_docs,
        new_enrollments,
        by_level: counts,
        recent_students,
    })
}

#[derive(Debug, Clone)]
pub struct StudentSummary {
    pub id: String,
    pub name: String,
    pub group: String,
}

#[derive(Debug, Default)]
pub struct CoordinatorDashboard {
    pub total_students: i64,
    pub assigned_groups_count: i64,
    pub absences_today: i64,
    pub incidents_today: i64,
    pub emotion_summary: HashMap<String, i64>,
    pub at_risk: Vec<StudentSummary>,
}

const ABSENCE_RISK_THRESHOLD: i64 = 3;
const RISK_WINDOW_DAYS: i64 = 30;
const AT_RISK_LIMIT: usize = 10;

struct GroupStudent {
    id: String,
    name: String,
    group_name: Option<String>,
}

/// Today's operational snapshot plus the 30-day at-risk set for one
/// coordinator. A coordinator with no assigned groups returns the
/// zero value without touching the student, attendance, or incident
/// tables.
pub fn coordinator_dashboard(
    conn: &Connection,
    coordinator_id: &str,
    today: NaiveDate,
) -> Result<CoordinatorDashboard, StatsError> {
    let mut stmt =
        conn.prepare("SELECT group_id FROM coordinator_groups WHERE coordinator_id = ?")?;
    let group_ids = stmt
        .query_map([coordinator_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    if group_ids.is_empty() {
        return Ok(CoordinatorDashboard::default());
    }

    let students = load_group_students(conn, &group_ids)?;
    if students.is_empty() {
        return Ok(CoordinatorDashboard {
            assigned_groups_count: group_ids.len() as i64,
            ..CoordinatorDashboard::default()
        });
    }

    let student_ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let today_key = today.to_string();
    let marks = in_placeholders(student_ids.len());

    let sql = format!(
        "SELECT COUNT(*) FROM attendances
         WHERE student_id IN ({}) AND class_date = ? AND status = 'A'",
        marks
    );
    let absences_today: i64 = conn.query_row(
        &sql,
        params_from_iter(text_params(&student_ids, &[&today_key])),
        |r| r.get(0),
    )?;

    let sql = format!(
        "SELECT COUNT(*) FROM student_incidents
         WHERE student_id IN ({}) AND date = ?",
        marks
    );
    let incidents_today: i64 = conn.query_row(
        &sql,
        params_from_iter(text_params(&student_ids, &[&today_key])),
        |r| r.get(0),
    )?;

    // Emotion labels are free text, so the rows are materialized first
    // and grouped in process. Keep this two-phase.
    let sql = format!(
        "SELECT emotion FROM attendances
         WHERE student_id IN ({}) AND class_date = ? AND emotion IS NOT NULL",
        marks
    );
    let mut stmt = conn.prepare(&sql)?;
    let emotions_raw = stmt
        .query_map(
            params_from_iter(text_params(&student_ids, &[&today_key])),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let mut emotion_summary: HashMap<String, i64> = HashMap::new();
    for e in emotions_raw {
        *emotion_summary.entry(e).or_insert(0) += 1;
    }

    let window_start = (today - Duration::days(RISK_WINDOW_DAYS)).to_string();

    let sql = format!(
        "SELECT student_id FROM attendances
         WHERE student_id IN ({}) AND status = 'A' AND class_date > ?
         GROUP BY student_id
         HAVING COUNT(*) >= {}",
        marks, ABSENCE_RISK_THRESHOLD
    );
    let mut stmt = conn.prepare(&sql)?;
    let risky_by_absence = stmt
        .query_map(
            params_from_iter(text_params(&student_ids, &[&window_start])),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let sql = format!(
        "SELECT DISTINCT student_id FROM student_incidents
         WHERE student_id IN ({}) AND date > ?",
        marks
    );
    let mut stmt = conn.prepare(&sql)?;
    let risky_by_incident = stmt
        .query_map(
            params_from_iter(text_params(&student_ids, &[&window_start])),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    // Union by student id; BTreeSet doubles as the stable ascending order
    // for the projection below.
    let risky: BTreeSet<String> = risky_by_absence
        .into_iter()
        .chain(risky_by_incident)
        .collect();

    let by_id: HashMap<&str, &GroupStudent> =
        students.iter().map(|s| (s.id.as_str(), s)).collect();
    let at_risk: Vec<StudentSummary> = risky
        .iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .map(|s| StudentSummary {
            id: s.id.clone(),
            name: s.name.clone(),
            group: s.group_name.clone().unwrap_or_else(|| "N/A".to_string()),
        })
        .take(AT_RISK_LIMIT)
        .collect();

    Ok(CoordinatorDashboard {
        total_students: students.len() as i64,
        assigned_groups_count: group_ids.len() as i64,
        absences_today,
        incidents_today,
        emotion_summary,
        at_risk,
    })
}

fn load_group_students(
    conn: &Connection,
    group_ids: &[String],
) -> Result<Vec<GroupStudent>, StatsError> {
    let sql = format!(
        "SELECT s.id, s.first_name, s.paternal_surname, g.name
         FROM students s
         LEFT JOIN school_groups g ON g.id = s.group_id
         WHERE s.group_id IN ({})",
        in_placeholders(group_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(text_params(group_ids, &[])), |r| {
            let first: String = r.get(1)?;
            let paternal: String = r.get(2)?;
            Ok(GroupStudent {
                id: r.get(0)?,
                name: format!("{} {}", first, paternal),
                group_name: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn in_placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn text_params(ids: &[String], tail: &[&str]) -> Vec<Value> {
    ids.iter()
        .map(|s| Value::Text(s.clone()))
        .chain(tail.iter().map(|s| Value::Text(s.to_string())))
        .collect()
}

#[derive(Debug, Clone)]
pub struct GradeRow {
    pub course: String,
    pub title: String,
    pub score: Option<f64>,
    pub component_type: String,
    pub weight_percentage: f64,
}

#[derive(Debug)]
pub struct SubjectGrades {
    pub subject: String,
    pub evaluations: Vec<GradeRow>,
    pub average: f64,
}

/// Unweighted mean with missing scores counted as zero. An ungraded
/// evaluation therefore pulls the average down; the recorded weight
/// percentages are descriptive only and never enter this mean.
pub fn course_average(scores: &[Option<f64>]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let sum: f64 = scores.iter().map(|s| s.unwrap_or(0.0)).sum();
    sum / scores.len() as f64
}

/// Group a student's evaluation rows by course display name, preserving
/// first-appearance order.
pub fn group_grades_by_course(rows: Vec<GradeRow>) -> Vec<SubjectGrades> {
    let mut out: Vec<SubjectGrades> = Vec::new();
    for row in rows {
        match out.iter_mut().find(|g| g.subject == row.course) {
            Some(group) => group.evaluations.push(row),
            None => out.push(SubjectGrades {
                subject: row.course.clone(),
                evaluations: vec![row],
                average: 0.0,
            }),
        }
    }
    for group in &mut out {
        let scores: Vec<Option<f64>> = group.evaluations.iter().map(|e| e.score).collect();
        group.average = course_average(&scores);
    }
    out
}
