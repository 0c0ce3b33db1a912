use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use chat_relay::{
    relay::{Relay, RelayConfig},
    session::{ChatUpdate, OutgoingTalk, Session, SessionConfig, SessionHandle},
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> Result<(SocketAddr, SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let config = RelayConfig {
        control: "127.0.0.1:0".parse()?,
        broadcast: "127.0.0.1:0".parse()?,
        lease: Duration::from_secs(5),
        idle_timeout: Duration::from_millis(50),
    };
    let relay = Relay::bind(&config).await?;
    let control = relay.control_addr();
    let broadcast = relay.broadcast_addr();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = relay.run_until(shutdown).await;
    });

    Ok((control, broadcast, shutdown_tx, task))
}

async fn join(
    control: SocketAddr,
    broadcast: SocketAddr,
    handle: &str,
) -> Result<(SessionHandle, oneshot::Sender<()>, JoinHandle<Result<()>>)> {
    let (session, channels) = Session::connect(SessionConfig {
        control,
        broadcast,
        handle: handle.to_string(),
        timeout: Duration::from_millis(200),
    })
    .await?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(session.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    Ok((channels, shutdown_tx, task))
}

/// Waits until the roster view holds exactly `expected` (sorted).
async fn await_roster(channels: &mut SessionHandle, expected: &[&str]) {
    loop {
        if *channels.roster.borrow_and_update() == expected {
            return;
        }
        timeout(WAIT, channels.roster.changed())
            .await
            .expect("roster change in time")
            .expect("session alive");
    }
}

/// Reads chat updates until one arrives from `sender`, skipping relay
/// notices such as welcomes.
async fn await_update_from(channels: &mut SessionHandle, sender: &str) -> ChatUpdate {
    loop {
        let update = timeout(WAIT, channels.updates.recv())
            .await
            .expect("update in time")
            .expect("session alive");
        if update.sender == sender {
            return update;
        }
    }
}

#[tokio::test]
async fn sessions_exchange_public_and_private_talks() -> Result<()> {
    let (control, broadcast, relay_shutdown, relay_task) = start_relay().await?;

    let (mut alice, alice_shutdown, alice_task) = join(control, broadcast, "alice").await?;
    let (mut bob, bob_shutdown, bob_task) = join(control, broadcast, "bob").await?;

    // Heartbeats admit both handles; the roster views converge.
    await_roster(&mut alice, &["alice", "bob"]).await;
    await_roster(&mut bob, &["alice", "bob"]).await;

    alice
        .outbox
        .send(OutgoingTalk::public("hello everyone"))
        .await?;
    let public = await_update_from(&mut bob, "alice").await;
    assert_eq!(public.content, "hello everyone");
    assert!(!public.private);

    alice.outbox.send(OutgoingTalk::private("bob", "psst")).await?;
    let private = await_update_from(&mut bob, "alice").await;
    assert_eq!(private.content, "psst");
    assert!(private.private);

    let _ = alice_shutdown.send(());
    let _ = bob_shutdown.send(());
    alice_task.await?.expect("alice session exits cleanly");
    bob_task.await?.expect("bob session exits cleanly");

    let _ = relay_shutdown.send(());
    let _ = relay_task.await;
    Ok(())
}

#[tokio::test]
async fn session_leaves_when_the_outbox_is_dropped() -> Result<()> {
    let (control, broadcast, relay_shutdown, relay_task) = start_relay().await?;

    let (channels, _shutdown, task) = join(control, broadcast, "alice").await?;
    drop(channels);

    // With the owner gone, the loop notices the hung-up outbox and leaves.
    timeout(WAIT, task)
        .await
        .expect("session exits in time")?
        .expect("session exits cleanly");

    let _ = relay_shutdown.send(());
    let _ = relay_task.await;
    Ok(())
}
