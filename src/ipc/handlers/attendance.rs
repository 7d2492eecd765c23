use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_create_session(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let session_date = match req.params.get("sessionDate").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing sessionDate", None),
    };
    let open = req
        .params
        .get("open")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    // Auto-generate a six digit code when the instructor leaves it blank.
    let access_code = match req
        .params
        .get("accessCode")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(code) => code,
        None => {
            let ts = Utc::now().timestamp().to_string();
            ts[ts.len().saturating_sub(6)..].to_string()
        }
    };

    let session_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO attendance_sessions(id, course_id, title, session_date, access_code, is_open, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &course_id,
            &title,
            &session_date,
            &access_code,
            if open { 1 } else { 0 },
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_sessions" })),
        );
    }

    let _ = super::announcements::post_system(
        conn,
        &course_id,
        "Attendance session opened",
        &format!("Session **{}** on {} is now open.", title, session_date),
    );

    ok(
        &req.id,
        json!({ "sessionId": session_id, "accessCode": access_code }),
    )
}

fn handle_list_sessions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sessions": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.title,
           s.session_date,
           s.access_code,
           s.is_open,
           (SELECT COUNT(*) FROM attendance_logs l WHERE l.session_id = s.id) AS present_count
         FROM attendance_sessions s
         WHERE s.course_id = ?
         ORDER BY s.created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let session_date: String = row.get(2)?;
            let access_code: String = row.get(3)?;
            let is_open: i64 = row.get(4)?;
            let present_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "title": title,
                "sessionDate": session_date,
                "accessCode": access_code,
                "isOpen": is_open != 0,
                "presentCount": present_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sessions) => ok(&req.id, json!({ "sessions": sessions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_set_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let open = match req.params.get("open").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing open", None),
    };

    let changed = match conn.execute(
        "UPDATE attendance_sessions SET is_open = ? WHERE id = ?",
        (if open { 1 } else { 0 }, &session_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "session not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let supplied = req
        .params
        .get("accessCode")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let row = conn
        .query_row(
            "SELECT access_code, is_open FROM attendance_sessions WHERE id = ?",
            [&session_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional();
    let (expected, is_open) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "session not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if is_open == 0 {
        return err(&req.id, "session_closed", "this session is closed", None);
    }
    if supplied != expected.trim() {
        return err(&req.id, "bad_access_code", "wrong attendance code", None);
    }

    let already: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM attendance_logs WHERE session_id = ? AND student_id = ?",
            (&session_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if already.is_some() {
        return err(
            &req.id,
            "already_marked",
            "attendance already recorded for this session",
            None,
        );
    }

    if let Err(e) = conn.execute(
        "INSERT INTO attendance_logs(id, session_id, student_id, marked_at) VALUES(?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &session_id,
            &student_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_logs" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_logs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "logs": [] }));
    };

    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.name, l.marked_at
         FROM attendance_logs l
         JOIN users u ON u.id = l.student_id
         WHERE l.session_id = ?
         ORDER BY l.marked_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&session_id], |row| {
            let student_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let marked_at: String = row.get(2)?;
            Ok(json!({
                "studentId": student_id,
                "name": name,
                "markedAt": marked_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(logs) => ok(&req.id, json!({ "logs": logs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.createSession" => Some(handle_create_session(state, req)),
        "attendance.listSessions" => Some(handle_list_sessions(state, req)),
        "attendance.setOpen" => Some(handle_set_open(state, req)),
        "attendance.mark" => Some(handle_mark(state, req)),
        "attendance.logs" => Some(handle_logs(state, req)),
        _ => None,
    }
}
