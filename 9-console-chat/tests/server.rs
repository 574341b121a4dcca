use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use console_chat::{
    protocol::{LineChannel, LineReader, LineWriter},
    server::{Server, ServerConfig},
};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

type Reader = LineReader<BufReader<OwnedReadHalf>>;
type Writer = LineWriter<OwnedWriteHalf>;

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, config);
        let addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn connect(addr: SocketAddr) -> Result<(Reader, Writer)> {
    let stream = TcpStream::connect(addr).await?;
    Ok(LineChannel::from_tcp(stream).into_split())
}

/// Connects, joins, and consumes the welcome and own join notice.
async fn join(addr: SocketAddr, username: &str) -> Result<(Reader, Writer)> {
    let (mut reader, mut writer) = connect(addr).await?;
    writer.write_line(&format!("CONNECT {username}")).await?;

    let welcome = next_line(&mut reader).await?.context("welcome line")?;
    assert!(welcome.starts_with("Welcome! "), "unexpected welcome: {welcome:?}");
    let joined = next_line(&mut reader).await?.context("own join notice")?;
    assert_eq!(joined, format!("{username} joined!!!!\n"));

    Ok((reader, writer))
}

async fn next_line(reader: &mut Reader) -> Result<Option<String>> {
    let line = timeout(READ_TIMEOUT, reader.read_line())
        .await
        .context("timed out waiting for line")??;
    Ok(line)
}

#[tokio::test]
async fn chat_lines_reach_everyone_and_departures_are_announced() -> Result<()> {
    let server = RunningServer::start(ServerConfig::default()).await?;

    let (mut alice_reader, mut alice_writer) = join(server.addr, "alice").await?;
    let (mut bob_reader, bob_writer) = join(server.addr, "bob").await?;
    assert_eq!(
        next_line(&mut alice_reader).await?.as_deref(),
        Some("bob joined!!!!\n")
    );

    alice_writer.write_line("hi").await?;
    assert_eq!(next_line(&mut alice_reader).await?.as_deref(), Some("alice: hi\n"));
    assert_eq!(next_line(&mut bob_reader).await?.as_deref(), Some("alice: hi\n"));

    drop(bob_writer);
    drop(bob_reader);
    assert_eq!(
        next_line(&mut alice_reader).await?.as_deref(),
        Some("bob left the chat\n")
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn welcome_reports_users_online() -> Result<()> {
    let server = RunningServer::start(ServerConfig::default()).await?;

    let (_alice_reader, _alice_writer) = join(server.addr, "alice").await?;
    let (mut reader, mut writer) = connect(server.addr).await?;
    writer.write_line("CONNECT bob").await?;
    assert_eq!(
        next_line(&mut reader).await?.as_deref(),
        Some("Welcome! 2 user(s) online\n")
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_handshake_is_dropped_silently() -> Result<()> {
    let server = RunningServer::start(ServerConfig::default()).await?;

    let (mut watcher_reader, _watcher_writer) = join(server.addr, "watcher").await?;
    let (mut reader, mut writer) = connect(server.addr).await?;
    writer.write_line("LOGIN mallory").await?;

    assert_eq!(next_line(&mut reader).await?, None);
    // Nobody hears about the rejected connection.
    let nothing = timeout(Duration::from_millis(200), watcher_reader.read_line()).await;
    assert!(nothing.is_err(), "unexpected line: {nothing:?}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn idle_users_time_out_with_one_departure_notice() -> Result<()> {
    let server = RunningServer::start(ServerConfig {
        idle_timeout: Duration::from_millis(400),
        write_timeout: Duration::from_secs(1),
    })
    .await?;

    let (mut sleepy_reader, _sleepy_writer) = join(server.addr, "sleepy").await?;
    let (mut chatty_reader, mut chatty_writer) = join(server.addr, "chatty").await?;
    assert_eq!(
        next_line(&mut sleepy_reader).await?.as_deref(),
        Some("chatty joined!!!!\n")
    );

    // Keep chatty active while sleepy goes quiet.
    let mut departures = 0;
    for _ in 0..10 {
        chatty_writer.write_line("still here").await?;
        loop {
            match timeout(Duration::from_millis(100), chatty_reader.read_line()).await {
                Ok(line) => {
                    if line?.as_deref() == Some("sleepy left the chat\n") {
                        departures += 1;
                    }
                }
                Err(_) => break,
            }
        }
    }
    assert_eq!(departures, 1);

    // The timed-out user's connection was closed.
    loop {
        match next_line(&mut sleepy_reader).await? {
            Some(_) => continue,
            None => break,
        }
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_open_sessions() -> Result<()> {
    let server = RunningServer::start(ServerConfig::default()).await?;
    let (mut reader, _writer) = join(server.addr, "alice").await?;

    server.stop().await;

    assert_eq!(next_line(&mut reader).await?, None);
    Ok(())
}
