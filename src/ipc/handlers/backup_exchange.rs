use serde_json::json;
use std::path::PathBuf;

use crate::backup;
use crate::db::open_db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, require_admin};
use crate::ipc::types::{AppState, Request};

fn workspace_path(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn export_bundle(state: &AppState, req: &Request) -> serde_json::Value {
    let outcome: Result<serde_json::Value, HandlerErr> = (|| {
        require_admin(state)?;
        let workspace = workspace_path(state)?;
        let out_path = get_required_str(&req.params, "outPath")?;
        let summary = backup::export_workspace_bundle(&workspace, &PathBuf::from(&out_path))
            .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
        Ok(json!({
            "outPath": out_path,
            "bundleFormat": summary.bundle_format,
            "dbSha256": summary.db_sha256,
        }))
    })();
    match outcome {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Replaces the workspace database with the bundle's copy. The open
/// connection is dropped before the file swap, and everyone must log
/// in again afterwards: accounts may not survive the import.
fn import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let outcome: Result<serde_json::Value, HandlerErr> = (|| {
        let workspace = workspace_path(state)?;
        // A workspace with no accounts yet may be restored without a
        // session, mirroring the admin bootstrap rule: that is how a
        // fresh machine gets its data back.
        let users: i64 = match state.db.as_ref() {
            Some(conn) => conn
                .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
                .map_err(HandlerErr::db)?,
            None => 0,
        };
        if users > 0 {
            require_admin(state)?;
        }
        let in_path = get_required_str(&req.params, "inPath")?;
        state.db = None;
        let imported = backup::import_workspace_bundle(&PathBuf::from(&in_path), &workspace);
        // Reopen either way: a failed import leaves the old database file
        // untouched (the swap is rename-based).
        let conn = open_db(&workspace)
            .map_err(|e| HandlerErr::new("db_open_failed", e.to_string()))?;
        state.db = Some(conn);
        let summary =
            imported.map_err(|e| HandlerErr::new("import_failed", e.to_string()))?;
        state.session = None;
        Ok(json!({
            "bundleFormatDetected": summary.bundle_format_detected,
            "dbSha256": summary.db_sha256,
        }))
    })();
    match outcome {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(import_bundle(state, req)),
        _ => None,
    }
}
