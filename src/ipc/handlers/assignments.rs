use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let module_id = req
        .params
        .get("moduleId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let due_at = req
        .params
        .get("dueAt")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let points = req
        .params
        .get("points")
        .and_then(|v| v.as_i64())
        .unwrap_or(100);
    if points < 0 {
        return err(&req.id, "bad_params", "points must not be negative", None);
    }

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, course_id, module_id, title, description, due_at, points)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &course_id,
            &module_id,
            &title,
            &description,
            &due_at,
            points,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    let _ = super::announcements::post_system(
        conn,
        &course_id,
        "New assignment",
        &format!("Assignment **{}** was published.", title),
    );

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.title, a.description, a.due_at, a.points, m.title
         FROM assignments a
         LEFT JOIN modules m ON m.id = a.module_id
         WHERE a.course_id = ?
         ORDER BY a.due_at IS NULL, a.due_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let due_at: Option<String> = row.get(3)?;
            let points: i64 = row.get(4)?;
            let module_title: Option<String> = row.get(5)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "dueAt": due_at,
                "points": points,
                "moduleTitle": module_title
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM submissions WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "submissions" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let body_text = req
        .params
        .get("text")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());
    let file_path = req
        .params
        .get("filePath")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());
    if body_text.is_none() && file_path.is_none() {
        return err(
            &req.id,
            "bad_params",
            "a submission needs text or a file",
            None,
        );
    }

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    // Re-submitting replaces the previous hand-in.
    let submission_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, body_text, file_path, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           body_text = excluded.body_text,
           file_path = excluded.file_path,
           submitted_at = excluded.submitted_at",
        (
            &submission_id,
            &assignment_id,
            &student_id,
            &body_text,
            &file_path,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "submissions" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_submissions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "submissions": [] }));
    };

    let assignment_id = match req.params.get("assignmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assignmentId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, u.id, u.name, s.body_text, s.file_path, s.submitted_at
         FROM submissions s
         JOIN users u ON u.id = s.student_id
         WHERE s.assignment_id = ?
         ORDER BY s.submitted_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&assignment_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let body_text: Option<String> = row.get(3)?;
            let file_path: Option<String> = row.get(4)?;
            let submitted_at: String = row.get(5)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": name,
                "text": body_text,
                "filePath": file_path,
                "submittedAt": submitted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(handle_create(state, req)),
        "assignments.list" => Some(handle_list(state, req)),
        "assignments.delete" => Some(handle_delete(state, req)),
        "assignments.submit" => Some(handle_submit(state, req)),
        "assignments.submissions" => Some(handle_submissions(state, req)),
        _ => None,
    }
}
