use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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
    let content = req
        .params
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let order_index = req
        .params
        .get("orderIndex")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let module_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO modules(id, course_id, title, content, order_index) VALUES(?, ?, ?, ?, ?)",
        (&module_id, &course_id, &title, &content, order_index),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "modules" })),
        );
    }

    let _ = super::announcements::post_system(
        conn,
        &course_id,
        "New topic published",
        &format!("Topic **{}** is now available.", title),
    );

    ok(&req.id, json!({ "moduleId": module_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "modules": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, content, order_index
         FROM modules
         WHERE course_id = ?
         ORDER BY order_index, title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let content: Option<String> = row.get(2)?;
            let order_index: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "content": content,
                "orderIndex": order_index
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(modules) => ok(&req.id, json!({ "modules": modules })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    if !module_exists(conn, &module_id) {
        return err(&req.id, "not_found", "module not found", None);
    }

    if let Some(title) = req.params.get("title").and_then(|v| v.as_str()) {
        if title.trim().is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE modules SET title = ? WHERE id = ?",
            (title.trim(), &module_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(content) = req.params.get("content").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE modules SET content = ? WHERE id = ?",
            (content, &module_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(order_index) = req.params.get("orderIndex").and_then(|v| v.as_i64()) {
        if let Err(e) = conn.execute(
            "UPDATE modules SET order_index = ? WHERE id = ?",
            (order_index, &module_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let module_id = match req.params.get("moduleId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing moduleId", None),
    };
    if !module_exists(conn, &module_id) {
        return err(&req.id, "not_found", "module not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Deleting a topic detaches its items; assignments and quizzes survive.
    if let Err(e) = tx.execute(
        "UPDATE assignments SET module_id = NULL WHERE module_id = ?",
        [&module_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE quizzes SET module_id = NULL WHERE module_id = ?",
        [&module_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM modules WHERE id = ?", [&module_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn module_exists(conn: &rusqlite::Connection, module_id: &str) -> bool {
    conn.query_row("SELECT 1 FROM modules WHERE id = ?", [module_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .ok()
    .flatten()
    .is_some()
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "modules.create" => Some(handle_create(state, req)),
        "modules.list" => Some(handle_list(state, req)),
        "modules.update" => Some(handle_update(state, req)),
        "modules.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
