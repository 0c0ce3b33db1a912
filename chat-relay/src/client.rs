use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::{mpsc, oneshot},
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    session::{ChatUpdate, OutgoingTalk, Session, SessionHandle},
    wire,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = args.session_config();
    let handle = config.handle.clone();
    let (session, channels) = Session::connect(config).await?;
    let SessionHandle {
        mut roster,
        mut updates,
        outbox,
    } = channels;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let session_task = tokio::spawn(session.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    write_stdout(&format!("*** connected as {handle}")).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut known: Vec<String> = Vec::new();

    loop {
        input.clear();
        select! {
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = roster.borrow_and_update().clone();
                render_roster_change(&known, &current, &handle).await?;
                known = current;
            }
            update = updates.recv() => {
                match update {
                    Some(update) => render_chat_update(update).await?,
                    None => {
                        write_stdout("*** relay connection lost").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &outbox).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    // Hanging up the outbox asks the session to leave; the explicit signal
    // covers the case where it is mid-wait on another channel.
    drop(outbox);
    let _ = shutdown_tx.send(());
    match session_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = ?err, "session ended with error"),
        Err(err) => warn!(error = ?err, "session task failed"),
    }

    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    outbox: &mpsc::Sender<OutgoingTalk>,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(rest) = text.strip_prefix("/msg") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return send_private(rest.trim_start(), outbox).await;
        }
        // Not the /msg command after all; treat it as ordinary text.
    }

    send_talk(OutgoingTalk::public(text), outbox).await
}

async fn send_private(rest: &str, outbox: &mpsc::Sender<OutgoingTalk>) -> Result<bool> {
    match rest.split_once(char::is_whitespace) {
        Some((target, details)) if !details.trim().is_empty() => {
            send_talk(OutgoingTalk::private(target, details.trim()), outbox).await
        }
        _ => {
            write_stderr("!!! usage: /msg <handle> <text>").await?;
            Ok(true)
        }
    }
}

async fn send_talk(talk: OutgoingTalk, outbox: &mpsc::Sender<OutgoingTalk>) -> Result<bool> {
    if outbox.send(talk).await.is_err() {
        write_stderr("!!! session closed").await?;
        return Ok(false);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Print what changed between two roster snapshots. The very first
/// snapshot lists whoever else is already present; afterwards only the
/// transitions are shown.
async fn render_roster_change(known: &[String], current: &[String], own: &str) -> io::Result<()> {
    if known.is_empty() {
        let others: Vec<&str> = current
            .iter()
            .filter(|handle| *handle != own)
            .map(String::as_str)
            .collect();
        if !others.is_empty() {
            return write_stdout(&format!("*** currently online: {}", others.join(", "))).await;
        }
        return Ok(());
    }

    for handle in current {
        if handle != own && !known.contains(handle) {
            write_stdout(&format!("*** {handle} joined the chat")).await?;
        }
    }
    for handle in known {
        if handle != own && !current.contains(handle) {
            write_stdout(&format!("*** {handle} left the chat")).await?;
        }
    }
    Ok(())
}

async fn render_chat_update(update: ChatUpdate) -> io::Result<()> {
    if update.sender == wire::GROUP_SENDER {
        write_stdout(&format!("*** {}", update.content)).await
    } else if update.private {
        write_stdout(&format!("[private] <{}> {}", update.sender, update.content)).await
    } else {
        write_stdout(&format!("<{}> {}", update.sender, update.content)).await
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
