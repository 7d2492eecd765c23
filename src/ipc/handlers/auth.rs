use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["admin", "instructor", "student"];

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing password", None),
    };
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) if ROLES.contains(&v) => v.to_string(),
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                format!("unknown role: {}", v),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing role", None),
    };

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(&req.id, "email_taken", "email is already registered", None);
    }

    let user_id = Uuid::new_v4().to_string();
    let hash = auth::hash_password(&password);
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, password_hash, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&user_id, &name, &email, &hash, &role, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id, "role": role }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing email", None),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing password", None),
    };

    let row = conn
        .query_row(
            "SELECT id, name, role, password_hash FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional();

    let (user_id, name, role, stored) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "invalid_credentials", "wrong email or password", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let verdict = auth::verify_password(&stored, &password);
    if !verdict.valid {
        return err(&req.id, "invalid_credentials", "wrong email or password", None);
    }

    // Upgrade legacy unsalted digests while we still hold the plaintext.
    if verdict.needs_rehash {
        let fresh = auth::hash_password(&password);
        if let Err(e) = conn.execute(
            "UPDATE users SET password_hash = ? WHERE id = ?",
            (&fresh, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({
            "userId": user_id,
            "name": name,
            "email": email,
            "role": role,
            "rehashed": verdict.needs_rehash
        }),
    )
}

fn handle_update_profile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    if !user_exists(conn, &user_id) {
        return err(&req.id, "not_found", "user not found", None);
    }

    if let Some(name) = req.params.get("name").and_then(|v| v.as_str()) {
        if name.trim().is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET name = ? WHERE id = ?",
            (name.trim(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(email) = req.params.get("email").and_then(|v| v.as_str()) {
        let email = email.trim().to_string();
        if email.is_empty() {
            return err(&req.id, "bad_params", "email must not be empty", None);
        }
        // The address may collide with another account, but re-saving your
        // own is fine.
        let taken: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND id != ?",
                (&email, &user_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if taken.is_some() {
            return err(&req.id, "email_taken", "email is already registered", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            (&email, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn user_exists(conn: &rusqlite::Connection, user_id: &str) -> bool {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .ok()
    .flatten()
    .is_some()
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let current = match req.params.get("current").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing current", None),
    };
    let new = match req.params.get("new").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing new password", None),
    };

    let stored: Option<String> = match conn
        .query_row(
            "SELECT password_hash FROM users WHERE id = ?",
            [&user_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(stored) = stored else {
        return err(&req.id, "not_found", "user not found", None);
    };

    if !auth::verify_password(&stored, &current).valid {
        return err(&req.id, "invalid_credentials", "current password is wrong", None);
    }

    let fresh = auth::hash_password(&new);
    if let Err(e) = conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (&fresh, &user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(handle_register(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.updateProfile" => Some(handle_update_profile(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        _ => None,
    }
}
