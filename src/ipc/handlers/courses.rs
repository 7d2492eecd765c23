use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let instructor_id = match req.params.get("instructorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing instructorId", None),
    };
    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing code", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let access_code = req
        .params
        .get("accessCode")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE code = ?", [&code], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(&req.id, "code_taken", "course code is already in use", None);
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, title, description, access_code, instructor_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &code,
            &title,
            &description,
            &access_code,
            &instructor_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    // The instructor is a member of their own course.
    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO enrollments(user_id, course_id, role) VALUES(?, ?, 'instructor')",
        (&instructor_id, &course_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Include membership counts so the UI can show a useful dashboard.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.code,
           c.title,
           c.description,
           u.name,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id AND e.role = 'student') AS student_count,
           (SELECT COUNT(*) FROM quizzes q WHERE q.course_id = c.id) AS quiz_count
         FROM courses c
         LEFT JOIN users u ON u.id = c.instructor_id
         ORDER BY c.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let title: String = row.get(2)?;
            let description: Option<String> = row.get(3)?;
            let instructor: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let quiz_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "code": code,
                "title": title,
                "description": description,
                "instructorName": instructor,
                "studentCount": student_count,
                "quizCount": quiz_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_mine(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "enrolled": [], "teaching": [] }));
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };

    let enrolled = collect_courses(
        conn,
        "SELECT c.id, c.code, c.title, u.name
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         LEFT JOIN users u ON u.id = c.instructor_id
         WHERE e.user_id = ? AND e.role = 'student'
         ORDER BY c.title",
        &user_id,
    );
    let teaching = collect_courses(
        conn,
        "SELECT c.id, c.code, c.title, u.name
         FROM courses c
         LEFT JOIN users u ON u.id = c.instructor_id
         WHERE c.instructor_id = ?
         ORDER BY c.title",
        &user_id,
    );

    match (enrolled, teaching) {
        (Ok(enrolled), Ok(teaching)) => ok(
            &req.id,
            json!({ "enrolled": enrolled, "teaching": teaching }),
        ),
        (Err(e), _) | (_, Err(e)) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn collect_courses(
    conn: &rusqlite::Connection,
    sql: &str,
    user_id: &str,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([user_id], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let title: String = row.get(2)?;
            let instructor: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "code": code,
                "title": title,
                "instructorName": instructor
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    if !course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    if let Some(title) = req.params.get("title").and_then(|v| v.as_str()) {
        if title.trim().is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE courses SET title = ? WHERE id = ?",
            (title.trim(), &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(description) = req.params.get("description").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET description = ? WHERE id = ?",
            (description, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    // An empty access code means "leave unchanged", matching the edit form
    // behavior the instructors expect.
    if let Some(access) = req.params.get("accessCode").and_then(|v| v.as_str()) {
        if !access.trim().is_empty() {
            if let Err(e) = conn.execute(
                "UPDATE courses SET access_code = ? WHERE id = ?",
                (access.trim(), &course_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_courses_join(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let supplied = req
        .params
        .get("accessCode")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let stored: Option<Option<String>> = match conn
        .query_row(
            "SELECT access_code FROM courses WHERE id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(stored) = stored else {
        return err(&req.id, "not_found", "course not found", None);
    };

    let expected = stored.unwrap_or_default().trim().to_string();
    if supplied != expected {
        return err(&req.id, "bad_access_code", "wrong access code", None);
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO enrollments(user_id, course_id, role) VALUES(?, ?, 'student')",
        (&user_id, &course_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "joined": true }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    if !course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 13] = [
        (
            "DELETE FROM quiz_answers
             WHERE attempt_id IN (
               SELECT a.id FROM quiz_attempts a
               JOIN quizzes q ON q.id = a.quiz_id
               WHERE q.course_id = ?
             )",
            "quiz_answers",
        ),
        (
            "DELETE FROM quiz_attempts
             WHERE quiz_id IN (SELECT id FROM quizzes WHERE course_id = ?)",
            "quiz_attempts",
        ),
        (
            "DELETE FROM quiz_choices
             WHERE question_id IN (
               SELECT qq.id FROM quiz_questions qq
               JOIN quizzes q ON q.id = qq.quiz_id
               WHERE q.course_id = ?
             )",
            "quiz_choices",
        ),
        (
            "DELETE FROM quiz_questions
             WHERE quiz_id IN (SELECT id FROM quizzes WHERE course_id = ?)",
            "quiz_questions",
        ),
        ("DELETE FROM quizzes WHERE course_id = ?", "quizzes"),
        (
            "DELETE FROM submissions
             WHERE assignment_id IN (SELECT id FROM assignments WHERE course_id = ?)",
            "submissions",
        ),
        ("DELETE FROM assignments WHERE course_id = ?", "assignments"),
        ("DELETE FROM modules WHERE course_id = ?", "modules"),
        ("DELETE FROM course_books WHERE course_id = ?", "course_books"),
        (
            "DELETE FROM announcements WHERE course_id = ?",
            "announcements",
        ),
        (
            "DELETE FROM attendance_logs
             WHERE session_id IN (SELECT id FROM attendance_sessions WHERE course_id = ?)",
            "attendance_logs",
        ),
        (
            "DELETE FROM attendance_sessions WHERE course_id = ?",
            "attendance_sessions",
        ),
        ("DELETE FROM enrollments WHERE course_id = ?", "enrollments"),
    ];

    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&course_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn course_exists(conn: &rusqlite::Connection, course_id: &str) -> bool {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .ok()
    .flatten()
    .is_some()
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.mine" => Some(handle_courses_mine(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.join" => Some(handle_courses_join(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
