mod common;

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use common::token_for;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER: &str = "relay listening on";

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("room-relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(binary).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Keep draining relay logs so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = spawn_client(binary, "alice", &addr, "lobby").await?;
    let mut bob = spawn_client(binary, "bob", &addr, "lobby").await?;

    let alice_sees_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(alice_sees_bob, "*** bob joined the room");

    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "<alice> Hello from Alice");
    let alice_echo = read_line_expect(&mut alice.stdout, "waiting for alice echo").await?;
    assert_eq!(alice_echo, "<alice> Hello from Alice");

    bob.send_line("/typing").await.context("bob typing")?;
    let alice_sees_typing =
        read_line_expect(&mut alice.stdout, "waiting for typing notice").await?;
    assert_eq!(alice_sees_typing, "*** bob is typing");

    bob.send_line("/leave").await.context("bob leave")?;
    let bob_left = read_line_expect(&mut bob.stdout, "waiting for bob leave").await?;
    assert_eq!(bob_left, "*** left lobby");
    let alice_sees_leave =
        read_line_expect(&mut alice.stdout, "waiting for alice to see bob leave").await?;
    assert_eq!(alice_sees_leave, "*** bob left the room");

    alice.send_line("/quit").await.context("alice quit")?;
    let alice_quit = read_line_expect(&mut alice.stdout, "waiting for alice quit").await?;
    assert_eq!(alice_quit, "*** leaving chat");
    bob.send_line("/quit").await.context("bob quit")?;
    let bob_quit = read_line_expect(&mut bob.stdout, "waiting for bob quit").await?;
    assert_eq!(bob_quit, "*** leaving chat");

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("JWT_SECRET", String::from_utf8_lossy(common::SECRET).as_ref())
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .env("RUST_LOG_STYLE", "never")
        .env_remove("RELAY_STORE")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("relay exited before printing its address")?;
        if !line.contains(BANNER) {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected relay banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("relay banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn spawn_client(
    binary: &Path,
    username: &str,
    addr: &str,
    room: &str,
) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .arg("--room")
        .arg(room)
        .env("RELAY_TOKEN", token_for(username))
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let authenticated = read_line_expect(&mut process.stdout, "waiting for auth banner").await?;
    if authenticated != format!("*** authenticated as {username}") {
        return Err(anyhow!(
            "expected auth banner for {username}, got '{authenticated}'"
        ));
    }
    let joined = read_line_expect(&mut process.stdout, "waiting for join banner").await?;
    if !joined.starts_with(&format!("*** joined {room}")) {
        return Err(anyhow!("expected join banner for {room}, got '{joined}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
