use serde_json::json;
use sha2::{Digest, Sha256};
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

#[test]
fn register_login_and_change_password_round_trip() {
    let workspace = temp_dir("lms-auth-roundtrip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let registered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({
            "email": "ada@example.edu",
            "name": "Ada",
            "password": "engines",
            "role": "student"
        }),
    );
    let user_id = registered.get("userId").and_then(|v| v.as_str()).unwrap().to_string();

    // Second registration on the same email is rejected.
    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "auth.register",
        json!({
            "email": "ada@example.edu",
            "name": "Imposter",
            "password": "x",
            "role": "student"
        }),
    );
    assert_eq!(
        dup.pointer("/error/code").and_then(|v| v.as_str()),
        Some("email_taken")
    );

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": "ada@example.edu", "password": "engines" }),
    );
    assert_eq!(login.get("userId").and_then(|v| v.as_str()), Some(user_id.as_str()));
    assert_eq!(login.get("role").and_then(|v| v.as_str()), Some("student"));
    assert_eq!(login.get("rehashed").and_then(|v| v.as_bool()), Some(false));

    let wrong = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "ada@example.edu", "password": "difference" }),
    );
    assert_eq!(
        wrong.pointer("/error/code").and_then(|v| v.as_str()),
        Some("invalid_credentials")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.changePassword",
        json!({ "userId": user_id, "current": "engines", "new": "analytical" }),
    );
    let relogin = request(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "ada@example.edu", "password": "engines" }),
    );
    assert_eq!(relogin.get("ok").and_then(|v| v.as_bool()), Some(false));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "email": "ada@example.edu", "password": "analytical" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn profile_update_changes_name_and_email_but_rejects_collisions() {
    let workspace = temp_dir("lms-auth-profile");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let grace = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({
            "email": "grace@example.edu",
            "name": "Grace",
            "password": "cobol",
            "role": "instructor"
        }),
    );
    let grace_id = grace.get("userId").and_then(|v| v.as_str()).unwrap().to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.register",
        json!({
            "email": "alan@example.edu",
            "name": "Alan",
            "password": "enigma",
            "role": "student"
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.updateProfile",
        json!({
            "userId": grace_id,
            "name": "Rear Admiral Grace",
            "email": "hopper@example.edu"
        }),
    );
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "hopper@example.edu", "password": "cobol" }),
    );
    assert_eq!(
        login.get("name").and_then(|v| v.as_str()),
        Some("Rear Admiral Grace")
    );

    // Someone else's address is off limits.
    let clash = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.updateProfile",
        json!({ "userId": grace_id, "email": "alan@example.edu" }),
    );
    assert_eq!(
        clash.pointer("/error/code").and_then(|v| v.as_str()),
        Some("email_taken")
    );

    // Re-saving your own address is a no-op, not a conflict.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.updateProfile",
        json!({ "userId": grace_id, "email": "hopper@example.edu" }),
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "auth.updateProfile",
        json!({ "userId": "no-such-user", "name": "Ghost" }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn legacy_unsalted_hash_still_logs_in_and_is_upgraded() {
    let workspace = temp_dir("lms-auth-legacy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Seed a user the way old workspaces stored them: a bare hex digest
    // with no salt prefix.
    let legacy_digest = {
        let mut hasher = Sha256::new();
        hasher.update(b"oldpassword");
        format!("{:x}", hasher.finalize())
    };
    {
        let conn = rusqlite::Connection::open(workspace.join("lms.sqlite3")).expect("open db");
        conn.execute(
            "INSERT INTO users(id, name, email, password_hash, role, created_at)
             VALUES('legacy-user', 'Old Timer', 'old@example.edu', ?, 'student', '2020-01-01T00:00:00Z')",
            [&legacy_digest],
        )
        .expect("seed legacy user");
    }

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "email": "old@example.edu", "password": "oldpassword" }),
    );
    assert_eq!(login.get("rehashed").and_then(|v| v.as_bool()), Some(true));

    // The stored hash is now in the salted format and keeps working.
    {
        let conn = rusqlite::Connection::open(workspace.join("lms.sqlite3")).expect("open db");
        let stored: String = conn
            .query_row(
                "SELECT password_hash FROM users WHERE id = 'legacy-user'",
                [],
                |r| r.get(0),
            )
            .expect("read hash");
        assert!(stored.starts_with("sha256$"), "hash not upgraded: {}", stored);
        assert_ne!(stored, legacy_digest);
    }
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "old@example.edu", "password": "oldpassword" }),
    );
    assert_eq!(again.get("rehashed").and_then(|v| v.as_bool()), Some(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
