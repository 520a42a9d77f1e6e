use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_rfc3339, require_admin, require_session,
};
use crate::ipc::types::{AppState, Request, Session};

fn user_count(conn: &Connection) -> Result<i64, HandlerErr> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(HandlerErr::db)
}

/// Inserts the user row and returns its id. Caller has already authorized
/// the action and validated the role.
pub fn insert_user(
    conn: &Connection,
    username: &str,
    password: &str,
    role: Role,
    first_name: &str,
    last_name: &str,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<String, HandlerErr> {
    if username.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "username must not be empty"));
    }
    if password.len() < 4 {
        return Err(HandlerErr::new(
            "bad_params",
            "password must be at least 4 characters",
        ));
    }
    let user_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().to_string();
    let password_hash = auth::hash_password(&salt, password);
    conn.execute(
        "INSERT INTO users(id, username, password_hash, salt, role, first_name, last_name,
                           email, phone, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            username,
            &password_hash,
            &salt,
            role.as_str(),
            first_name,
            last_name,
            email,
            phone,
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "users" }),
        )
    })?;
    Ok(user_id)
}

fn users_create(state: &AppState, conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role_str = get_required_str(params, "role")?;
    let Some(role) = Role::parse(&role_str) else {
        return Err(HandlerErr::with_details(
            "bad_params",
            "role must be one of: admin, teacher, student",
            json!({ "role": role_str }),
        ));
    };

    // First account of a fresh workspace may be created unauthenticated,
    // and must be the admin who will create everyone else.
    if user_count(conn)? == 0 {
        if role != Role::Admin {
            return Err(HandlerErr::new(
                "bad_params",
                "the first account must have the admin role",
            ));
        }
    } else {
        require_admin(state)?;
    }

    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");

    let user_id = insert_user(
        conn,
        &username,
        &password,
        role,
        &first_name,
        &last_name,
        email.as_deref(),
        phone.as_deref(),
    )?;
    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

struct LoginOutcome {
    session: Session,
    result: serde_json::Value,
}

fn auth_login(conn: &Connection, params: &serde_json::Value) -> Result<LoginOutcome, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let row: Option<(String, String, String, String, String, String, i64)> = conn
        .query_row(
            "SELECT id, password_hash, salt, role, first_name, last_name, is_active
             FROM users WHERE username = ?",
            [&username],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;

    let Some((user_id, password_hash, salt, role_str, first_name, last_name, is_active)) = row
    else {
        return Err(HandlerErr::new("invalid_credentials", "unknown username or wrong password"));
    };
    if !auth::verify_password(&salt, &password, &password_hash) {
        return Err(HandlerErr::new("invalid_credentials", "unknown username or wrong password"));
    }
    if is_active == 0 {
        return Err(HandlerErr::new("forbidden", "account is deactivated"));
    }
    let role = Role::parse(&role_str)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "user row has unknown role"))?;

    conn.execute(
        "INSERT INTO login_history(id, user_id, login_time) VALUES(?, ?, ?)",
        (Uuid::new_v4().to_string(), &user_id, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "login_history" }),
        )
    })?;

    let display_name = format!("{} {}", first_name, last_name).trim().to_string();
    let result = json!({
        "userId": user_id,
        "role": role.as_str(),
        "displayName": display_name,
    });
    Ok(LoginOutcome {
        session: Session {
            user_id,
            role,
            display_name,
        },
        result,
    })
}

fn auth_login_history(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(50)
        .clamp(1, 500);
    let mut stmt = conn
        .prepare(
            "SELECT h.login_time, u.username, u.role
             FROM login_history h
             JOIN users u ON u.id = h.user_id
             ORDER BY h.login_time DESC
             LIMIT ?",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(json!({
                "loginTime": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "logins": rows }))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_create(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match auth_login(conn, &req.params) {
        Ok(outcome) => {
            state.session = Some(outcome.session);
            ok(&req.id, outcome.result)
        }
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_auth_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_session(state) {
        Ok(session) => ok(
            &req.id,
            json!({
                "userId": session.user_id,
                "role": session.role.as_str(),
                "displayName": session.display_name,
            }),
        ),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_login_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match auth_login_history(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        "auth.whoami" => Some(handle_auth_whoami(state, req)),
        "auth.loginHistory" => Some(handle_auth_login_history(state, req)),
        _ => None,
    }
}
