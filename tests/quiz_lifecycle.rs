use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

fn count_rows(workspace: &Path, sql: &str) -> i64 {
    let conn = rusqlite::Connection::open(workspace.join("lms.sqlite3")).expect("open db");
    conn.query_row(sql, [], |r| r.get(0)).expect("count query")
}

struct Fixture {
    workspace: PathBuf,
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    course_id: String,
    student_id: String,
}

fn setup(prefix: &str) -> Fixture {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "auth.register",
        json!({
            "email": "prof@example.edu",
            "name": "Prof",
            "password": "pw",
            "role": "instructor"
        }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s3",
        "auth.register",
        json!({
            "email": "stu@example.edu",
            "name": "Stu",
            "password": "pw",
            "role": "student"
        }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "s4",
        "courses.create",
        json!({
            "instructorId": str_field(&instructor, "userId"),
            "code": format!("C-{}", prefix),
            "title": "Course"
        }),
    );
    Fixture {
        workspace,
        child,
        stdin,
        reader,
        course_id: str_field(&course, "courseId"),
        student_id: str_field(&student, "userId"),
    }
}

impl Fixture {
    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

#[test]
fn total_points_tracks_question_set() {
    let mut fx = setup("lms-total-points");

    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Unit Test Quiz" }),
    );
    let quiz_id = str_field(&quiz, "quizId");

    let q1 = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "questions.add",
        json!({ "quizId": quiz_id, "kind": "mcq", "prompt": "Pick one", "points": 4 }),
    );
    let _q2 = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "questions.add",
        json!({
            "quizId": quiz_id,
            "kind": "short",
            "prompt": "Say hi",
            "points": 6,
            "correctText": "hi"
        }),
    );

    let listed = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "quizzes.list",
        json!({ "courseId": fx.course_id }),
    );
    let quizzes = listed.get("quizzes").and_then(|v| v.as_array()).unwrap();
    assert_eq!(quizzes.len(), 1);
    assert_eq!(quizzes[0].get("totalPoints").and_then(|v| v.as_i64()), Some(10));
    assert_eq!(quizzes[0].get("questionCount").and_then(|v| v.as_i64()), Some(2));

    // Removing a question brings the total back down.
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "5",
        "questions.delete",
        json!({ "questionId": str_field(&q1, "questionId") }),
    );
    let listed = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "6",
        "quizzes.list",
        json!({ "courseId": fx.course_id }),
    );
    let quizzes = listed.get("quizzes").and_then(|v| v.as_array()).unwrap();
    assert_eq!(quizzes[0].get("totalPoints").and_then(|v| v.as_i64()), Some(6));

    fx.finish();
}

#[test]
fn non_integer_numeric_params_are_rejected() {
    let mut fx = setup("lms-bad-numbers");

    // A fractional limit must not silently coerce to the default.
    let bad_quiz = request(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Fractional", "attemptLimit": 2.5 }),
    );
    assert_eq!(bad_quiz.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        bad_quiz.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Whole", "attemptLimit": 2 }),
    );
    let quiz_id = str_field(&quiz, "quizId");

    let bad_question = request(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "questions.add",
        json!({ "quizId": quiz_id, "kind": "mcq", "prompt": "Pick", "points": 2.5 }),
    );
    assert_eq!(
        bad_question.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
    // Nothing was stored for the rejected question.
    let listed = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "questions.list",
        json!({ "quizId": quiz_id }),
    );
    assert_eq!(
        listed
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|q| q.len()),
        Some(0)
    );

    fx.finish();
}

#[test]
fn mcq_questions_start_with_four_blank_choices() {
    let mut fx = setup("lms-choice-slots");

    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Slots" }),
    );
    let quiz_id = str_field(&quiz, "quizId");
    let question = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "questions.add",
        json!({ "quizId": quiz_id, "kind": "mcq", "prompt": "Pick" }),
    );
    let choice_ids = question
        .get("choiceIds")
        .and_then(|v| v.as_array())
        .expect("choiceIds");
    assert_eq!(choice_ids.len(), 4);

    let listed = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "questions.list",
        json!({ "quizId": quiz_id }),
    );
    let questions = listed.get("questions").and_then(|v| v.as_array()).unwrap();
    let choices = questions[0].get("choices").and_then(|v| v.as_array()).unwrap();
    assert_eq!(choices.len(), 4);
    assert!(choices
        .iter()
        .all(|c| c.get("isCorrect").and_then(|v| v.as_bool()) == Some(false)));
    assert_eq!(choices[0].get("label").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(choices[3].get("label").and_then(|v| v.as_str()), Some("D"));

    fx.finish();
}

#[test]
fn marking_correct_choice_clears_previous_designation() {
    let mut fx = setup("lms-clear-then-set");

    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Keying" }),
    );
    let quiz_id = str_field(&quiz, "quizId");
    let question = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "questions.add",
        json!({ "quizId": quiz_id, "kind": "mcq", "prompt": "2 + 2?" }),
    );
    let question_id = str_field(&question, "questionId");
    let choice_ids: Vec<String> = question
        .get("choiceIds")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();

    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "choices.update",
        json!({
            "questionId": question_id,
            "edits": [
                { "choiceId": choice_ids[0], "label": "3" },
                { "choiceId": choice_ids[1], "label": "4" }
            ],
            "correctChoiceId": choice_ids[0]
        }),
    );
    // Re-key the question onto another choice; exactly one stays correct.
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "choices.update",
        json!({ "questionId": question_id, "correctChoiceId": choice_ids[1] }),
    );

    let listed = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "5",
        "questions.list",
        json!({ "quizId": quiz_id }),
    );
    let questions = listed.get("questions").and_then(|v| v.as_array()).unwrap();
    let choices = questions[0].get("choices").and_then(|v| v.as_array()).unwrap();
    let correct: Vec<&str> = choices
        .iter()
        .filter(|c| c.get("isCorrect").and_then(|v| v.as_bool()) == Some(true))
        .map(|c| c.get("id").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert_eq!(correct, vec![choice_ids[1].as_str()]);

    // Pointing at a deleted choice is rejected and leaves the key alone.
    let bad = request(
        &mut fx.stdin,
        &mut fx.reader,
        "6",
        "choices.update",
        json!({
            "questionId": question_id,
            "edits": [{ "choiceId": choice_ids[2], "delete": true }],
            "correctChoiceId": choice_ids[2]
        }),
    );
    assert_eq!(bad.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        bad.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    fx.finish();
}

#[test]
fn deleting_quiz_removes_every_dependent_row() {
    let mut fx = setup("lms-quiz-cascade");

    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "title": "Doomed" }),
    );
    let quiz_id = str_field(&quiz, "quizId");
    let question = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "questions.add",
        json!({
            "quizId": quiz_id,
            "kind": "short",
            "prompt": "Anything",
            "correctText": "yes"
        }),
    );
    let question_id = str_field(&question, "questionId");

    let attempt = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "attempts.start",
        json!({ "quizId": quiz_id, "studentId": fx.student_id }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "attempts.submit",
        json!({
            "attemptId": str_field(&attempt, "attemptId"),
            "answers": [{ "questionId": question_id, "text": "yes" }]
        }),
    );

    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "5",
        "quizzes.delete",
        json!({ "quizId": quiz_id }),
    );

    for table in ["quizzes", "quiz_questions", "quiz_choices", "quiz_attempts", "quiz_answers"] {
        assert_eq!(
            count_rows(&fx.workspace, &format!("SELECT COUNT(*) FROM {}", table)),
            0,
            "orphan rows left in {}",
            table
        );
    }

    fx.finish();
}

#[test]
fn deleting_course_removes_every_dependent_row() {
    let mut fx = setup("lms-course-cascade");
    let course_id = fx.course_id.clone();

    let module = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "modules.create",
        json!({ "courseId": course_id, "title": "Week 1" }),
    );
    let quiz = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "quizzes.create",
        json!({
            "courseId": course_id,
            "moduleId": str_field(&module, "moduleId"),
            "title": "Quiz"
        }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "questions.add",
        json!({ "quizId": str_field(&quiz, "quizId"), "kind": "mcq", "prompt": "Pick" }),
    );
    let assignment = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "assignments.create",
        json!({ "courseId": course_id, "title": "Essay" }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "5",
        "assignments.submit",
        json!({
            "assignmentId": str_field(&assignment, "assignmentId"),
            "studentId": fx.student_id,
            "text": "hello"
        }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "5b",
        "books.create",
        json!({
            "courseId": course_id,
            "title": "Reader",
            "embedUrl": "https://flip.example/reader"
        }),
    );
    let session = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "6",
        "attendance.createSession",
        json!({
            "courseId": course_id,
            "title": "Day 1",
            "sessionDate": "2026-09-01",
            "accessCode": "999999"
        }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "7",
        "attendance.mark",
        json!({
            "sessionId": str_field(&session, "sessionId"),
            "studentId": fx.student_id,
            "accessCode": "999999"
        }),
    );

    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "8",
        "courses.delete",
        json!({ "courseId": course_id }),
    );

    for table in [
        "courses",
        "enrollments",
        "modules",
        "course_books",
        "announcements",
        "attendance_sessions",
        "attendance_logs",
        "assignments",
        "submissions",
        "quizzes",
        "quiz_questions",
        "quiz_choices",
        "quiz_attempts",
        "quiz_answers",
    ] {
        assert_eq!(
            count_rows(&fx.workspace, &format!("SELECT COUNT(*) FROM {}", table)),
            0,
            "orphan rows left in {}",
            table
        );
    }
    // Users survive a course deletion.
    assert_eq!(count_rows(&fx.workspace, "SELECT COUNT(*) FROM users"), 2);

    fx.finish();
}

#[test]
fn deleting_module_detaches_rather_than_deletes_content() {
    let mut fx = setup("lms-module-detach");

    let module = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "1",
        "modules.create",
        json!({ "courseId": fx.course_id, "title": "Week 1" }),
    );
    let module_id = str_field(&module, "moduleId");
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "2",
        "quizzes.create",
        json!({ "courseId": fx.course_id, "moduleId": module_id, "title": "Survivor" }),
    );
    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "3",
        "assignments.create",
        json!({ "courseId": fx.course_id, "moduleId": module_id, "title": "Survivor HW" }),
    );

    let _ = request_ok(
        &mut fx.stdin,
        &mut fx.reader,
        "4",
        "modules.delete",
        json!({ "moduleId": module_id }),
    );

    assert_eq!(count_rows(&fx.workspace, "SELECT COUNT(*) FROM modules"), 0);
    assert_eq!(count_rows(&fx.workspace, "SELECT COUNT(*) FROM quizzes"), 1);
    assert_eq!(
        count_rows(&fx.workspace, "SELECT COUNT(*) FROM assignments"),
        1
    );
    assert_eq!(
        count_rows(
            &fx.workspace,
            "SELECT COUNT(*) FROM quizzes WHERE module_id IS NOT NULL"
        ),
        0
    );

    fx.finish();
}
