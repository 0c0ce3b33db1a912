use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Stop scanning a process's output after this many unmatched lines.
const SCAN_LIMIT: usize = 50;

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let control = read_banner_addr(&mut relay_stdout, "relay control on").await?;
    let broadcast = read_banner_addr(&mut relay_stdout, "relay broadcast on").await?;

    // Drain further relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &control, &broadcast).await?;
    expect_line(&mut alice.stdout, "*** Welcome, alice.", "alice welcome notice").await?;

    let mut bob = spawn_client(&binary, "bob", &control, &broadcast).await?;
    expect_line(
        &mut bob.stdout,
        "*** currently online: alice",
        "bob initial roster",
    )
    .await?;
    expect_line(
        &mut alice.stdout,
        "*** bob joined the chat",
        "alice sees bob join",
    )
    .await?;

    // Alice greets the room; the broadcast reaches both participants.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    expect_line(
        &mut bob.stdout,
        "<alice> Hello from Alice",
        "bob hears alice",
    )
    .await?;
    expect_line(
        &mut alice.stdout,
        "<alice> Hello from Alice",
        "alice echo",
    )
    .await?;

    // Bob whispers back; only alice is subscribed to her own topic.
    bob.send_line("/msg alice secret")
        .await
        .context("bob send private")?;
    expect_line(
        &mut alice.stdout,
        "[private] <bob> secret",
        "alice receives the private message",
    )
    .await?;

    // Alice quits; once her lease runs out the relay says goodbye.
    alice.send_line("/quit").await.context("alice send quit")?;
    expect_line(&mut alice.stdout, "*** leaving chat", "alice quit confirmation").await?;
    ensure_success(&mut alice.child, "alice client").await?;
    expect_line(
        &mut bob.stdout,
        "*** Goodbye, alice.",
        "bob sees alice expire",
    )
    .await?;

    bob.send_line("/quit").await.context("bob send quit")?;
    expect_line(&mut bob.stdout, "*** leaving chat", "bob quit confirmation").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The relay stays up after clients disconnect; terminate it manually.
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
    cmd.arg("relay")
        .arg("--control")
        .arg("127.0.0.1:0")
        .arg("--broadcast")
        .arg("127.0.0.1:0")
        .arg("--lease-seconds")
        .arg("1")
        .arg("--idle-ms")
        .arg("100")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

/// Scans the relay banner for a line containing `marker` and returns its
/// final whitespace-separated token, the bound socket address.
async fn read_banner_addr(reader: &mut BufReader<ChildStdout>, marker: &str) -> Result<String> {
    for _ in 0..SCAN_LIMIT {
        let line = read_line(reader)
            .await?
            .with_context(|| format!("relay exited before announcing '{marker}'"))?;
        if !line.contains(marker) {
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
    Err(anyhow!("relay never announced '{marker}'"))
}

async fn spawn_client(
    binary: &Path,
    handle: &str,
    control: &str,
    broadcast: &str,
) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--handle")
        .arg(handle)
        .arg("--control")
        .arg(control)
        .arg("--broadcast")
        .arg(broadcast)
        .arg("--timeout-ms")
        .arg("200")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {handle}"))?;

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

    expect_line(
        &mut process.stdout,
        &format!("*** connected as {handle}"),
        "welcome banner",
    )
    .await?;

    Ok(process)
}

/// Reads lines until `want` shows up, skipping unrelated traffic such as
/// roster refreshes that race with broadcasts.
async fn expect_line(
    reader: &mut BufReader<ChildStdout>,
    want: &str,
    description: &str,
) -> Result<()> {
    for _ in 0..SCAN_LIMIT {
        match read_line(reader).await {
            Ok(Some(line)) if line == want => return Ok(()),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(anyhow!("{description}: stream closed")),
            Err(err) => return Err(err.context(format!("{description}: failed to read line"))),
        }
    }
    Err(anyhow!("{description}: '{want}' never appeared"))
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
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
