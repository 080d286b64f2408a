//! Tests that run the built `nsbroker-server` executable.

use nsbroker_core::{Client, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Start the server on an auto-assigned port and return it with its address.
async fn spawn_server(extra: &[&str]) -> (Child, String) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_nsbroker-server"))
        .args(["--port", "0"])
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server");

    let stdout = child.stdout.take().expect("no stdout");
    let mut lines = BufReader::new(stdout).lines();
    let addr = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(addr) = line.strip_prefix("LISTEN=") {
                return addr.to_string();
            }
        }
        panic!("server exited before printing LISTEN=");
    })
    .await
    .expect("server did not report its address");

    (child, addr)
}

#[tokio::test]
async fn test_server_process_serves_and_dies() {
    let (mut child, addr) = spawn_server(&["--init", "n=greeting = 'hello'"]).await;

    let client = Client::connect(&addr).await.unwrap();
    assert_eq!(
        client.eval_in("n", "greeting + ' world'").await.unwrap(),
        Value::from("hello world")
    );

    client.kill_server(None).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_server_process_requires_password() {
    let (_child, addr) = spawn_server(&["--password", "pw", "--no-new-namespaces"]).await;

    let client = Client::connect(&format!("pw@{}", addr)).await.unwrap();
    assert!(client.eval_in("anything", "1").await.is_err());

    assert!(Client::connect(&format!("bad@{}", addr)).await.is_err());
}

#[tokio::test]
async fn test_shell_scheme_talks_to_stdio_server() {
    let command = format!("{} --stdio", env!("CARGO_BIN_EXE_nsbroker-server"));
    let client = Client::connect(&format!("shell://{}", command))
        .await
        .unwrap();
    client.exec("x = 3").await.unwrap();
    assert_eq!(client.eval("x * x").await.unwrap(), Value::Int(9));
}
