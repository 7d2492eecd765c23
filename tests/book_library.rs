use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
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

#[test]
fn books_are_added_listed_announced_and_removed() {
    let workspace = temp_dir("lms-book-library");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({
            "email": "prof@example.edu",
            "name": "Prof",
            "password": "pw",
            "role": "instructor"
        }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({
            "instructorId": str_field(&instructor, "userId"),
            "code": "LIB-101",
            "title": "Library Course"
        }),
    );
    let course_id = str_field(&course, "courseId");

    // Both title and embed URL are required.
    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "books.create",
        json!({ "courseId": course_id, "title": "No URL" }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let book = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "books.create",
        json!({
            "courseId": course_id,
            "title": "Algebra Flipbook",
            "embedUrl": "https://flip.example/algebra"
        }),
    );
    let book_id = str_field(&book, "bookId");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "books.list",
        json!({ "courseId": course_id }),
    );
    let books = listed.get("books").and_then(|v| v.as_array()).unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(
        books[0].get("title").and_then(|v| v.as_str()),
        Some("Algebra Flipbook")
    );
    assert_eq!(
        books[0].get("embedUrl").and_then(|v| v.as_str()),
        Some("https://flip.example/algebra")
    );

    // Adding a book lands in the course feed as a system announcement.
    let feed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "announcements.list",
        json!({ "courseId": course_id }),
    );
    let announcements = feed
        .get("announcements")
        .and_then(|v| v.as_array())
        .unwrap();
    assert!(announcements.iter().any(|a| {
        a.get("isSystem").and_then(|v| v.as_bool()) == Some(true)
            && a.get("message")
                .and_then(|v| v.as_str())
                .map(|m| m.contains("Algebra Flipbook"))
                .unwrap_or(false)
    }));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "books.delete",
        json!({ "bookId": book_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "books.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(
        listed.get("books").and_then(|v| v.as_array()).map(|b| b.len()),
        Some(0)
    );

    let gone = request(
        &mut stdin,
        &mut reader,
        "10",
        "books.delete",
        json!({ "bookId": book_id }),
    );
    assert_eq!(
        gone.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
