use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Post a system announcement to a course feed. Content publication
/// (modules, assignments, quizzes, attendance sessions) goes through here
/// so students see one stream of course activity. Best-effort for callers:
/// they decide whether a failure aborts their own write.
pub fn post_system(
    conn: &Connection,
    course_id: &str,
    title: &str,
    message: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO announcements(id, course_id, title, message, is_system, posted_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            Uuid::new_v4().to_string(),
            course_id,
            title,
            message,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

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
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let announcement_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO announcements(id, course_id, title, message, is_system, posted_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (
            &announcement_id,
            &course_id,
            &title,
            &message,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }

    ok(&req.id, json!({ "announcementId": announcement_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "announcements": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, message, is_system, posted_at
         FROM announcements
         WHERE course_id = ?
         ORDER BY posted_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let message: String = row.get(2)?;
            let is_system: i64 = row.get(3)?;
            let posted_at: String = row.get(4)?;
            Ok(json!({
                "id": id,
                "title": title,
                "message": message,
                "isSystem": is_system != 0,
                "postedAt": posted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(announcements) => ok(&req.id, json!({ "announcements": announcements })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let announcement_id = match req.params.get("announcementId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing announcementId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM announcements WHERE id = ?",
            [&announcement_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "announcement not found", None);
    }

    if let Err(e) = conn.execute(
        "DELETE FROM announcements WHERE id = ?",
        [&announcement_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.create" => Some(handle_create(state, req)),
        "announcements.list" => Some(handle_list(state, req)),
        "announcements.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
