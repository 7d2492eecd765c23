use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

// Course reading library: embedded flipbooks and other linked material.

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
    let embed_url = match req.params.get("embedUrl").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing embedUrl", None),
    };

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let book_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO course_books(id, course_id, title, embed_url, added_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &book_id,
            &course_id,
            &title,
            &embed_url,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "course_books" })),
        );
    }

    let _ = super::announcements::post_system(
        conn,
        &course_id,
        "New book added",
        &format!("Reading material **{}** is now available.", title),
    );

    ok(&req.id, json!({ "bookId": book_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "books": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, embed_url, added_at
         FROM course_books
         WHERE course_id = ?
         ORDER BY added_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let embed_url: String = row.get(2)?;
            let added_at: String = row.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "embedUrl": embed_url,
                "addedAt": added_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(books) => ok(&req.id, json!({ "books": books })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let book_id = match req.params.get("bookId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing bookId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM course_books WHERE id = ?", [&book_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "book not found", None);
    }

    if let Err(e) = conn.execute("DELETE FROM course_books WHERE id = ?", [&book_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "books.create" => Some(handle_create(state, req)),
        "books.list" => Some(handle_list(state, req)),
        "books.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
