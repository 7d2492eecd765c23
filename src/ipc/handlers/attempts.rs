use crate::grading::{self, ShortAnswerKey};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct QuestionRow {
    id: String,
    kind: String,
    points: i64,
    correct_text: Option<String>,
    correct_pattern: Option<String>,
    case_sensitive: bool,
}

fn load_question_rows(
    conn: &Connection,
    quiz_id: &str,
) -> Result<Vec<QuestionRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, points, correct_text, correct_pattern, case_sensitive
         FROM quiz_questions WHERE quiz_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([quiz_id], |row| {
            Ok(QuestionRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                points: row.get(2)?,
                correct_text: row.get(3)?,
                correct_pattern: row.get(4)?,
                case_sensitive: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let attempt_limit: Option<i64> = match conn
        .query_row(
            "SELECT attempt_limit FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(attempt_limit) = attempt_limit else {
        return err(&req.id, "not_found", "quiz not found", None);
    };

    // An unfinished attempt is resumed rather than stacked; leaving the page
    // never burns one of the student's tries.
    let open: Option<(String, i64)> = match conn
        .query_row(
            "SELECT id, attempt_no FROM quiz_attempts
             WHERE quiz_id = ? AND student_id = ? AND submitted_at IS NULL",
            (&quiz_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some((attempt_id, attempt_no)) = open {
        return ok(
            &req.id,
            json!({ "attemptId": attempt_id, "attemptNo": attempt_no, "resumed": true }),
        );
    }

    // Only submitted attempts count against the limit.
    let (submitted, total): (i64, i64) = match conn.query_row(
        "SELECT
           COUNT(*) FILTER (WHERE submitted_at IS NOT NULL),
           COUNT(*)
         FROM quiz_attempts WHERE quiz_id = ? AND student_id = ?",
        (&quiz_id, &student_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if attempt_limit > 0 && submitted >= attempt_limit {
        return err(
            &req.id,
            "attempt_limit_reached",
            format!("attempt limit of {} reached", attempt_limit),
            Some(json!({ "limit": attempt_limit, "submitted": submitted })),
        );
    }

    let attempt_id = Uuid::new_v4().to_string();
    let attempt_no = total + 1;
    if let Err(e) = conn.execute(
        "INSERT INTO quiz_attempts(id, quiz_id, student_id, attempt_no, started_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &attempt_id,
            &quiz_id,
            &student_id,
            attempt_no,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quiz_attempts" })),
        );
    }

    ok(
        &req.id,
        json!({ "attemptId": attempt_id, "attemptNo": attempt_no, "resumed": false }),
    )
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let attempt_id = match req.params.get("attemptId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing attemptId", None),
    };
    let answers = req
        .params
        .get("answers")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let attempt: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT quiz_id, submitted_at FROM quiz_attempts WHERE id = ?",
            [&attempt_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (quiz_id, submitted_at) = match attempt {
        Some(v) => v,
        None => return err(&req.id, "not_found", "attempt not found", None),
    };
    if submitted_at.is_some() {
        return err(
            &req.id,
            "already_submitted",
            "this attempt was already submitted",
            None,
        );
    }

    let questions = match load_question_rows(conn, &quiz_id) {
        Ok(q) => q,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // questionId -> (choiceId, text) as the student sent them.
    let mut by_question: std::collections::HashMap<String, (Option<String>, Option<String>)> =
        std::collections::HashMap::new();
    for answer in &answers {
        let Some(question_id) = answer.get("questionId").and_then(|v| v.as_str()) else {
            return err(&req.id, "bad_params", "answer missing questionId", None);
        };
        by_question.insert(
            question_id.to_string(),
            (
                answer
                    .get("choiceId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                answer
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            ),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut auto_score: i64 = 0;
    let mut total_possible: i64 = 0;
    let mut pending_review = false;
    let mut results = Vec::with_capacity(questions.len());

    for question in &questions {
        total_possible += question.points;
        let (choice_id, text) = by_question
            .get(&question.id)
            .cloned()
            .unwrap_or((None, None));

        let verdict: Option<bool> = if question.kind == "mcq" {
            let selected: Option<bool> = match choice_id.as_deref() {
                Some(id) => {
                    match tx
                        .query_row(
                            "SELECT is_correct FROM quiz_choices WHERE id = ? AND question_id = ?",
                            (id, &question.id),
                            |r| r.get::<_, i64>(0),
                        )
                        .optional()
                    {
                        Ok(v) => v.map(|n| n != 0),
                        Err(e) => {
                            let _ = tx.rollback();
                            return err(&req.id, "db_query_failed", e.to_string(), None);
                        }
                    }
                }
                None => None,
            };
            Some(grading::grade_choice(selected))
        } else {
            let key = ShortAnswerKey {
                reference: question.correct_text.as_deref(),
                pattern: question.correct_pattern.as_deref(),
                case_sensitive: question.case_sensitive,
            };
            grading::grade_short_answer(&key, text.as_deref().unwrap_or(""))
        };

        if verdict.is_none() {
            pending_review = true;
        }
        let awarded = grading::points_awarded(verdict, question.points);
        auto_score += awarded;

        if let Err(e) = tx.execute(
            "INSERT INTO quiz_answers(id, attempt_id, question_id, choice_id, answer_text, is_correct, points_awarded)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &attempt_id,
                &question.id,
                &choice_id,
                &text,
                verdict.map(|b| if b { 1 } else { 0 }),
                awarded,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "quiz_answers" })),
            );
        }

        results.push(json!({
            "questionId": question.id,
            "correct": verdict,
            "pointsAwarded": awarded,
            "maxPoints": question.points
        }));
    }

    if let Err(e) = tx.execute(
        "UPDATE quiz_attempts SET submitted_at = ?, auto_score = ? WHERE id = ?",
        (Utc::now().to_rfc3339(), auto_score, &attempt_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "autoScore": auto_score,
            "totalPossible": total_possible,
            "pendingReview": pending_review,
            "results": results
        }),
    )
}

fn handle_grade_manual(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let attempt_id = match req.params.get("attemptId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing attemptId", None),
    };
    let manual_score = match req.params.get("manualScore").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v,
        Some(_) => return err(&req.id, "bad_params", "manualScore must not be negative", None),
        None => return err(&req.id, "bad_params", "missing manualScore", None),
    };
    let feedback = req
        .params
        .get("feedback")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let attempt: Option<(Option<String>, Option<i64>)> = match conn
        .query_row(
            "SELECT submitted_at, auto_score FROM quiz_attempts WHERE id = ?",
            [&attempt_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (submitted_at, auto_score) = match attempt {
        Some(v) => v,
        None => return err(&req.id, "not_found", "attempt not found", None),
    };
    if submitted_at.is_none() {
        return err(
            &req.id,
            "not_submitted",
            "only submitted attempts can be graded",
            None,
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE quiz_attempts SET manual_score = ?, feedback = ? WHERE id = ?",
        (manual_score, &feedback, &attempt_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let final_score = grading::final_score(auto_score.unwrap_or(0), Some(manual_score));
    ok(&req.id, json!({ "finalScore": final_score }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let attempt_id = match req.params.get("attemptId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing attemptId", None),
    };

    let attempt = conn
        .query_row(
            "SELECT a.quiz_id, a.student_id, a.attempt_no, a.started_at, a.submitted_at,
                    a.auto_score, a.manual_score, a.feedback, q.total_points
             FROM quiz_attempts a
             JOIN quizzes q ON q.id = a.quiz_id
             WHERE a.id = ?",
            [&attempt_id],
            |r| {
                let quiz_id: String = r.get(0)?;
                let student_id: String = r.get(1)?;
                let attempt_no: i64 = r.get(2)?;
                let started_at: String = r.get(3)?;
                let submitted_at: Option<String> = r.get(4)?;
                let auto_score: Option<i64> = r.get(5)?;
                let manual_score: Option<i64> = r.get(6)?;
                let feedback: Option<String> = r.get(7)?;
                let total_points: i64 = r.get(8)?;
                Ok(json!({
                    "quizId": quiz_id,
                    "studentId": student_id,
                    "attemptNo": attempt_no,
                    "startedAt": started_at,
                    "submittedAt": submitted_at,
                    "autoScore": auto_score,
                    "manualScore": manual_score,
                    "finalScore": auto_score.map(|auto| grading::final_score(auto, manual_score)),
                    "feedback": feedback,
                    "totalPoints": total_points
                }))
            },
        )
        .optional();
    let attempt = match attempt {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "attempt not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT question_id, choice_id, answer_text, is_correct, points_awarded
         FROM quiz_answers WHERE attempt_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let answers = stmt
        .query_map([&attempt_id], |row| {
            let question_id: String = row.get(0)?;
            let choice_id: Option<String> = row.get(1)?;
            let answer_text: Option<String> = row.get(2)?;
            let is_correct: Option<i64> = row.get(3)?;
            let points_awarded: i64 = row.get(4)?;
            Ok(json!({
                "questionId": question_id,
                "choiceId": choice_id,
                "text": answer_text,
                "correct": is_correct.map(|n| n != 0),
                "pointsAwarded": points_awarded
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match answers {
        Ok(answers) => {
            let mut result = attempt;
            result["answers"] = json!(answers);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "attempts": [] }));
    };

    let quiz_id = match req.params.get("quizId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing quizId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, attempt_no, started_at, submitted_at, auto_score, manual_score, feedback
         FROM quiz_attempts
         WHERE quiz_id = ? AND student_id = ?
         ORDER BY attempt_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&quiz_id, &student_id), |row| {
            let id: String = row.get(0)?;
            let attempt_no: i64 = row.get(1)?;
            let started_at: String = row.get(2)?;
            let submitted_at: Option<String> = row.get(3)?;
            let auto_score: Option<i64> = row.get(4)?;
            let manual_score: Option<i64> = row.get(5)?;
            let feedback: Option<String> = row.get(6)?;
            Ok(json!({
                "attemptId": id,
                "attemptNo": attempt_no,
                "startedAt": started_at,
                "submittedAt": submitted_at,
                "autoScore": auto_score,
                "manualScore": manual_score,
                "finalScore": auto_score.map(|auto| grading::final_score(auto, manual_score)),
                "feedback": feedback
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(attempts) => ok(&req.id, json!({ "attempts": attempts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => Some(handle_start(state, req)),
        "attempts.submit" => Some(handle_submit(state, req)),
        "attempts.gradeManual" => Some(handle_grade_manual(state, req)),
        "attempts.get" => Some(handle_get(state, req)),
        "attempts.listForStudent" => Some(handle_list_for_student(state, req)),
        _ => None,
    }
}
