//! Integration tests for the `policyline serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with a
//! seed file, makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tempfile::TempDir;

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from the process ID so separate test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Server process that is killed when the test ends, pass or fail.
struct Server {
    child: Child,
    port: u16,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_seed(dir: &Path) -> std::path::PathBuf {
    let seed = serde_json::json!({"snapshots": [
        {"version": "v1", "rules": [
            {"ruleName": "R1", "priority": 10},
            {"ruleName": "R2", "priority": 4}
        ]},
        {"version": "v2", "rules": [{"ruleName": "R1", "priority": 12}]}
    ]});
    let path = dir.join("seed.json");
    std::fs::write(&path, seed.to_string()).unwrap();
    path
}

/// Helper: start `policyline serve` with the standard seed (v1 = 1, v2 = 2).
fn start_server() -> Server {
    let port = next_port();
    let dir = TempDir::new().unwrap();
    let seed = write_seed(dir.path());
    // Listings must reflect writes immediately.
    std::fs::write(dir.path().join("policyline.toml"), "[cache]\nttl_secs = 0\n").unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_policyline"));
    cmd.current_dir(dir.path())
        .env_remove("POLICYLINE_CONFIG")
        .env_remove("POLICYLINE_PORT")
        .env("POLICYLINE_LOG", "warn")
        .arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .arg("--seed")
        .arg(&seed)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = cmd.spawn().expect("failed to start policyline serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server {
        child,
        port,
        _dir: dir,
    }
}

/// Helper: send a raw HTTP request and return (status, parsed JSON body).
fn http(port: u16, method: &str, path: &str, body: Option<&str>) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let request = match body {
        Some(body) => format!(
            "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method, path, port, body.len(), body
        ),
        None => format!(
            "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
            method, path, port
        ),
    };
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

fn get(port: u16, path: &str) -> (u16, serde_json::Value) {
    http(port, "GET", path, None)
}

fn post(port: u16, path: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
    http(port, "POST", path, Some(&body.to_string()))
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, serde_json::Value) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"");
    let body = parts.get(1).unwrap_or(&"");

    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let json = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Walk `snapshot_id` up the ladder on router/global to `percent`.
fn climb(port: u16, snapshot_id: i64, percent: u8) {
    for rung in [5, 25, 50, 100].into_iter().take_while(|r| *r <= percent) {
        let (status, body) = post(port, "/deployments", deploy(snapshot_id, rung));
        assert_eq!(status, 200, "{body}");
    }
}

fn deploy(snapshot_id: i64, percent: u8) -> serde_json::Value {
    serde_json::json!({
        "snapshotId": snapshot_id,
        "target": "router",
        "region": "global",
        "percent": percent,
        "activatedBy": "ops"
    })
}

#[test]
fn health_returns_200_with_version() {
    let server = start_server();
    let (status, body) = get(server.port, "/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[test]
fn unknown_route_is_json_404() {
    let server = start_server();
    let (status, body) = get(server.port, "/nope");
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not found");
}

#[test]
fn seeded_snapshots_and_rules_are_listed() {
    let server = start_server();
    let (status, body) = get(server.port, "/snapshots");
    assert_eq!(status, 200);
    let versions: Vec<_> = body["snapshots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["version"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(versions, ["v1", "v2"]);

    let (status, body) = get(server.port, "/snapshots/1/rules");
    assert_eq!(status, 200);
    assert_eq!(body["rules"].as_array().unwrap().len(), 2);

    let (status, body) = get(server.port, "/snapshots/99/rules");
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("99"));

    let (status, _) = get(server.port, "/snapshots/abc/rules");
    assert_eq!(status, 400);
}

#[test]
fn canary_upserts_chain_events_and_repeat_is_noop() {
    let server = start_server();
    let port = server.port;

    let (status, body) = post(port, "/deployments", deploy(2, 5));
    assert_eq!(status, 200);
    assert_eq!(body["current"]["percent"], 5);
    assert_eq!(body["current"]["noop"], false);
    assert!(body.get("previous").is_none());

    let (status, body) = post(port, "/deployments", deploy(2, 25));
    assert_eq!(status, 200);
    assert_eq!(body["previous"]["percent"], 5);

    let (status, body) = post(port, "/deployments", deploy(2, 25));
    assert_eq!(status, 200);
    assert_eq!(body["current"]["noop"], true);

    let (status, body) = get(port, "/lanes/router/global/events");
    assert_eq!(status, 200);
    let steps: Vec<_> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| (e["fromPercent"].clone(), e["toPercent"].clone()))
        .collect();
    assert_eq!(
        steps,
        vec![
            (serde_json::Value::Null, serde_json::json!(5)),
            (serde_json::json!(5), serde_json::json!(25)),
        ]
    );

    let (_, body) = get(port, "/deployments?activeOnly=true");
    let active = body["deployments"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["percent"], 25);

    let (_, body) = get(port, "/snapshots");
    let v2 = &body["snapshots"][1];
    assert_eq!(v2["isActive"], true);
}

#[test]
fn rollback_deactivates_the_lane() {
    let server = start_server();
    let port = server.port;
    climb(port, 1, 50);

    let mut partial = deploy(1, 25);
    partial["isRollback"] = serde_json::json!(true);
    let (status, body) = post(port, "/deployments", partial);
    assert_eq!(status, 200);
    assert_eq!(body["current"]["percent"], 25);
    assert_eq!(body["current"]["isActive"], true);
    assert_eq!(body["previous"]["percent"], 50);

    let (status, body) = post(
        port,
        "/deployments/rollback",
        serde_json::json!({"snapshotId": 1, "target": "router", "region": "global"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["current"]["percent"], 0);
    assert_eq!(body["current"]["isActive"], false);

    let (_, body) = get(port, "/deployments?activeOnly=true");
    assert!(body["deployments"].as_array().unwrap().is_empty());
    let (_, body) = get(port, "/deployments");
    assert_eq!(body["deployments"].as_array().unwrap().len(), 5);
}

#[test]
fn deployment_errors_map_to_status_codes() {
    let server = start_server();
    let port = server.port;

    let (status, body) = post(port, "/deployments", deploy(1, 101));
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, _) = post(port, "/deployments", deploy(42, 5));
    assert_eq!(status, 404);

    let (status, body) = post(port, "/deployments", deploy(1, 100));
    assert_eq!(status, 409);
    assert!(body["error"].as_str().unwrap().contains("next canary rung is 5%"));

    climb(port, 1, 50);
    let (status, body) = post(port, "/deployments", deploy(1, 25));
    assert_eq!(status, 409);
    assert!(body["error"].is_string());

    let (status, _) = http(port, "POST", "/deployments", Some("{not json"));
    assert_eq!(status, 400);
}

#[test]
fn ladder_endpoint_steps_and_validates() {
    let server = start_server();
    let (status, body) = get(server.port, "/ladder/50");
    assert_eq!(status, 200);
    assert_eq!(body["current"], 50);
    assert_eq!(body["next"], 100);

    let (status, body) = get(server.port, "/ladder/150");
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("between 0 and 100"));
}
