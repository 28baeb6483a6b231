
use serde_json::json;
use tempfile::tempdir;

use support_agent::{accept_agent, bind_console, spawn_agent, wait_for_exit};

#[test]
fn agent_registers_heartbeats_and_obeys_a_console_shutdown() -> Result<(), String> {
    let (listener, port) = bind_console()?;
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let home = dir.path().to_string_lossy().into_owned();

    let mut child = spawn_agent(&home, port)?;
    let result = (|| {
        let mut link = accept_agent(&listener)?;

        let register = link.read_until("register")?;
        let connection_type = register
            .get("connection_type")
            .and_then(serde_json::Value::as_str);
        if connection_type != Some("agent") {
            return Err(format!("unexpected registration: {}", register));
        }

        let started = link.read_until("report")?;
        if started.get("state").and_then(serde_json::Value::as_str) != Some("started") {
            return Err(format!("expected a started report, got {}", started));
        }

        link.send(&json!({"type": "shutdown"}))?;

        loop {
            let report = link.read_until("report")?;
            match report.get("state").and_then(serde_json::Value::as_str) {
                Some("finished") => break,
                Some("running") => {}
                other => return Err(format!("unexpected report state {:?}", other)),
            }
        }

        let status = wait_for_exit(&mut child)?;
        if !status.success() {
            return Err(format!("agent exited with {}", status));
        }
        Ok(())
    })();

    if result.is_err() {
        drop(child.kill());
    }
    result
}

#[test]
fn agent_fails_fast_when_the_console_is_unreachable() -> Result<(), String> {
    // Bind then drop so the port is free but nothing listens on it.
    let (listener, port) = bind_console()?;
    drop(listener);

    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let home = dir.path().to_string_lossy().into_owned();

    let mut child = spawn_agent(&home, port)?;
    let status = wait_for_exit(&mut child)?;
    if status.success() {
        return Err("expected the agent to exit with an error".to_owned());
    }
    Ok(())
}
