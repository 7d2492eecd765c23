use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Fresh multiple-choice questions get these empty slots; the instructor
// fills in labels and marks the correct one afterwards.
const CHOICE_SLOTS: [&str; 4] = ["A", "B", "C", "D"];

/// Total points is denormalized on the quiz row; recompute it whenever the
/// question set changes.
pub fn recompute_total_points(conn: &Connection, quiz_id: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE quizzes
         SET total_points = (SELECT COALESCE(SUM(points), 0) FROM quiz_questions WHERE quiz_id = ?)
         WHERE id = ?",
        (quiz_id, quiz_id),
    )?;
    Ok(())
}

/// Distinguishes an absent numeric param from one that is present but not an
/// integer ("points": 2.5 must fail loudly, not coerce to a default).
fn int_param(params: &serde_json::Value, key: &str) -> Result<Option<i64>, String> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{} must be an integer", key)),
    }
}

fn quiz_exists(conn: &Connection, quiz_id: &str) -> bool {
    conn.query_row("SELECT 1 FROM quizzes WHERE id = ?", [quiz_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .ok()
    .flatten()
    .is_some()
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
        _ => return err(&req.id, "bad_params", "title must not be empty", None),
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
    let time_limit = match int_param(&req.params, "timeLimitMinutes") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let attempt_limit = match int_param(&req.params, "attemptLimit") {
        Ok(v) => v.unwrap_or(0),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if attempt_limit < 0 {
        return err(&req.id, "bad_params", "attemptLimit must not be negative", None);
    }

    if !super::courses::course_exists(conn, &course_id) {
        return err(&req.id, "not_found", "course not found", None);
    }

    let quiz_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO quizzes(id, course_id, module_id, title, description, time_limit_minutes, attempt_limit, total_points)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0)",
        (
            &quiz_id,
            &course_id,
            &module_id,
            &title,
            &description,
            time_limit,
            attempt_limit,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }

    let _ = super::announcements::post_system(
        conn,
        &course_id,
        "New quiz",
        &format!("Quiz **{}** was published.", title),
    );

    ok(&req.id, json!({ "quizId": quiz_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "quizzes": [] }));
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           q.id,
           q.title,
           q.description,
           q.time_limit_minutes,
           q.attempt_limit,
           q.total_points,
           m.title,
           (SELECT COUNT(*) FROM quiz_questions qq WHERE qq.quiz_id = q.id) AS question_count
         FROM quizzes q
         LEFT JOIN modules m ON m.id = q.module_id
         WHERE q.course_id = ?
         ORDER BY q.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let time_limit: Option<i64> = row.get(3)?;
            let attempt_limit: i64 = row.get(4)?;
            let total_points: i64 = row.get(5)?;
            let module_title: Option<String> = row.get(6)?;
            let question_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "timeLimitMinutes": time_limit,
                "attemptLimit": attempt_limit,
                "totalPoints": total_points,
                "moduleTitle": module_title,
                "questionCount": question_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(quizzes) => ok(&req.id, json!({ "quizzes": quizzes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };
    if !quiz_exists(conn, &quiz_id) {
        return err(&req.id, "not_found", "quiz not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE):
    // answers under attempts, choices under questions, then the quiz row.
    let steps: [(&str, &str); 4] = [
        (
            "DELETE FROM quiz_answers
             WHERE attempt_id IN (SELECT id FROM quiz_attempts WHERE quiz_id = ?)",
            "quiz_answers",
        ),
        ("DELETE FROM quiz_attempts WHERE quiz_id = ?", "quiz_attempts"),
        (
            "DELETE FROM quiz_choices
             WHERE question_id IN (SELECT id FROM quiz_questions WHERE quiz_id = ?)",
            "quiz_choices",
        ),
        ("DELETE FROM quiz_questions WHERE quiz_id = ?", "quiz_questions"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&quiz_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.execute("DELETE FROM quizzes WHERE id = ?", [&quiz_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_question_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };
    let kind = match req.params.get("kind").and_then(|v| v.as_str()) {
        Some(v @ ("mcq" | "short")) => v.to_string(),
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                format!("unknown question kind: {}", v),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing kind", None),
    };
    let prompt = match req.params.get("prompt").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing prompt", None),
    };
    let points = match int_param(&req.params, "points") {
        Ok(v) => v.unwrap_or(1),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if points < 1 {
        return err(&req.id, "bad_params", "points must be at least 1", None);
    }

    let (correct_text, correct_pattern, case_sensitive) = if kind == "short" {
        (
            req.params
                .get("correctText")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            req.params
                .get("correctPattern")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            req.params
                .get("caseSensitive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        )
    } else {
        (None, None, false)
    };

    if !quiz_exists(conn, &quiz_id) {
        return err(&req.id, "not_found", "quiz not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let question_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO quiz_questions(id, quiz_id, kind, prompt, points, correct_text, correct_pattern, case_sensitive)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &question_id,
            &quiz_id,
            &kind,
            &prompt,
            points,
            &correct_text,
            &correct_pattern,
            if case_sensitive { 1 } else { 0 },
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quiz_questions" })),
        );
    }

    let mut choice_ids: Vec<String> = Vec::new();
    if kind == "mcq" {
        for (i, label) in CHOICE_SLOTS.iter().enumerate() {
            let choice_id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO quiz_choices(id, question_id, label, is_correct, sort_order)
                 VALUES(?, ?, ?, 0, ?)",
                (&choice_id, &question_id, label, i as i64),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "quiz_choices" })),
                );
            }
            choice_ids.push(choice_id);
        }
    }

    if let Err(e) = recompute_total_points(&tx, &quiz_id) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "questionId": question_id, "choiceIds": choice_ids }),
    )
}

fn handle_question_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "questions": [] }));
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };
    if !quiz_exists(conn, &quiz_id) {
        return err(&req.id, "not_found", "quiz not found", None);
    }

    let questions = load_questions(conn, &quiz_id);
    match questions {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn load_questions(
    conn: &Connection,
    quiz_id: &str,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, prompt, points, correct_text, correct_pattern, case_sensitive
         FROM quiz_questions WHERE quiz_id = ? ORDER BY rowid",
    )?;
    let questions = stmt
        .query_map([quiz_id], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let prompt: String = row.get(2)?;
            let points: i64 = row.get(3)?;
            let correct_text: Option<String> = row.get(4)?;
            let correct_pattern: Option<String> = row.get(5)?;
            let case_sensitive: i64 = row.get(6)?;
            Ok((id, kind, prompt, points, correct_text, correct_pattern, case_sensitive))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut choice_stmt = conn.prepare(
        "SELECT id, label, is_correct FROM quiz_choices WHERE question_id = ? ORDER BY sort_order",
    )?;

    let mut out = Vec::with_capacity(questions.len());
    for (id, kind, prompt, points, correct_text, correct_pattern, case_sensitive) in questions {
        let choices = if kind == "mcq" {
            choice_stmt
                .query_map([&id], |row| {
                    let choice_id: String = row.get(0)?;
                    let label: String = row.get(1)?;
                    let is_correct: i64 = row.get(2)?;
                    Ok(json!({
                        "id": choice_id,
                        "label": label,
                        "isCorrect": is_correct != 0
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        out.push(json!({
            "id": id,
            "kind": kind,
            "prompt": prompt,
            "points": points,
            "correctText": correct_text,
            "correctPattern": correct_pattern,
            "caseSensitive": case_sensitive != 0,
            "choices": choices
        }));
    }
    Ok(out)
}

fn handle_question_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question_id = match req.params.get("questionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing questionId", None),
    };

    let quiz_id: Option<String> = match conn
        .query_row(
            "SELECT quiz_id FROM quiz_questions WHERE id = ?",
            [&question_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(quiz_id) = quiz_id else {
        return err(&req.id, "not_found", "question not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Answers already recorded against this question go with it.
    let steps: [(&str, &str); 3] = [
        ("DELETE FROM quiz_answers WHERE question_id = ?", "quiz_answers"),
        ("DELETE FROM quiz_choices WHERE question_id = ?", "quiz_choices"),
        ("DELETE FROM quiz_questions WHERE id = ?", "quiz_questions"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&question_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = recompute_total_points(&tx, &quiz_id) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_choices_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question_id = match req.params.get("questionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing questionId", None),
    };
    let edits = req
        .params
        .get("edits")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let correct_choice_id = req
        .params
        .get("correctChoiceId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let kind: Option<String> = match conn
        .query_row(
            "SELECT kind FROM quiz_questions WHERE id = ?",
            [&question_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match kind.as_deref() {
        Some("mcq") => {}
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "choices only apply to multiple-choice questions",
                None,
            )
        }
        None => return err(&req.id, "not_found", "question not found", None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for edit in &edits {
        let Some(choice_id) = edit.get("choiceId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(&req.id, "bad_params", "edit missing choiceId", None);
        };
        if edit.get("delete").and_then(|v| v.as_bool()).unwrap_or(false) {
            let res = tx
                .execute(
                    "DELETE FROM quiz_answers WHERE question_id = ? AND choice_id = ?",
                    (&question_id, choice_id),
                )
                .and_then(|_| {
                    tx.execute(
                        "DELETE FROM quiz_choices WHERE id = ? AND question_id = ?",
                        (choice_id, &question_id),
                    )
                });
            if let Err(e) = res {
                let _ = tx.rollback();
                return err(&req.id, "db_delete_failed", e.to_string(), None);
            }
        } else if let Some(label) = edit.get("label").and_then(|v| v.as_str()) {
            if let Err(e) = tx.execute(
                "UPDATE quiz_choices SET label = ? WHERE id = ? AND question_id = ?",
                (label, choice_id, &question_id),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }

    // Clear-then-set keeps the at-most-one-correct invariant even when the
    // designation moved between two choices in the same batch.
    if let Err(e) = tx.execute(
        "UPDATE quiz_choices SET is_correct = 0 WHERE question_id = ?",
        [&question_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Some(correct_id) = &correct_choice_id {
        let changed = match tx.execute(
            "UPDATE quiz_choices SET is_correct = 1 WHERE id = ? AND question_id = ?",
            (correct_id, &question_id),
        ) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        };
        if changed == 0 {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                "designated correct choice does not exist on this question",
                None,
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };

    let total_points: Option<i64> = match conn
        .query_row(
            "SELECT total_points FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(total_points) = total_points else {
        return err(&req.id, "not_found", "quiz not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, u.name, a.attempt_no, a.started_at, a.submitted_at,
                a.auto_score, a.manual_score, a.feedback
         FROM quiz_attempts a
         JOIN users u ON u.id = a.student_id
         WHERE a.quiz_id = ?
         ORDER BY a.started_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&quiz_id], |row| {
            let id: String = row.get(0)?;
            let student: String = row.get(1)?;
            let attempt_no: i64 = row.get(2)?;
            let started_at: String = row.get(3)?;
            let submitted_at: Option<String> = row.get(4)?;
            let auto_score: Option<i64> = row.get(5)?;
            let manual_score: Option<i64> = row.get(6)?;
            let feedback: Option<String> = row.get(7)?;
            let final_score = auto_score
                .map(|auto| crate::grading::final_score(auto, manual_score));
            Ok(json!({
                "attemptId": id,
                "studentName": student,
                "attemptNo": attempt_no,
                "startedAt": started_at,
                "submittedAt": submitted_at,
                "autoScore": auto_score,
                "manualScore": manual_score,
                "finalScore": final_score,
                "feedback": feedback
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(attempts) => ok(
            &req.id,
            json!({ "totalPoints": total_points, "attempts": attempts }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quizzes.create" => Some(handle_create(state, req)),
        "quizzes.list" => Some(handle_list(state, req)),
        "quizzes.delete" => Some(handle_delete(state, req)),
        "quizzes.results" => Some(handle_results(state, req)),
        "questions.add" => Some(handle_question_add(state, req)),
        "questions.list" => Some(handle_question_list(state, req)),
        "questions.delete" => Some(handle_question_delete(state, req)),
        "choices.update" => Some(handle_choices_update(state, req)),
        _ => None,
    }
}
