use std::{collections::VecDeque, io::Write};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite},
    net::TcpStream,
    task::JoinSet,
};
use tracing::{debug, info};

use crate::{
    cli::ClientArgs,
    input::{InputEditor, Keyboard},
    protocol::{self, LineChannel, LineReader, LineWriter},
    store::{MessageStore, Redraw},
    terminal::{self, RawModeGuard, Terminal},
};

const USERNAME_PROMPT: &str = "Enter your username: ";

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ServerClosed,
    InputClosed,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let _raw_mode = RawModeGuard::enable().context("failed to enable raw terminal mode")?;
    let terminal = Terminal::stdout();
    let rows = terminal::rows().context("failed to read terminal size")?;
    terminal.prepare_screen(rows)?;

    let store = MessageStore::new(
        usize::from(rows.saturating_sub(1)),
        redraw_with(terminal.clone()),
    );
    let keyboard = Keyboard::stdin().context("failed to start keyboard reader")?;
    let mut editor = InputEditor::new(keyboard, terminal.clone());

    let username = match args.username {
        Some(username) => username,
        None => match prompt_username(&terminal, &mut editor).await? {
            Some(username) => username,
            None => return Ok(()),
        },
    };

    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let mut session = ClientSession::new(LineChannel::from_tcp(stream), editor, store);
    session.handshake(&username).await?;
    let end = session.run().await?;
    debug!(?end, "chat session finished");

    terminal.prompt("\r\n")?;
    Ok(())
}

fn redraw_with<W>(terminal: Terminal<W>) -> Redraw
where
    W: Write + Send + 'static,
{
    Box::new(move |lines: &VecDeque<String>| {
        terminal.redraw(lines.iter().map(String::as_str))
    })
}

async fn prompt_username<R, W>(
    terminal: &Terminal<W>,
    editor: &mut InputEditor<R, W>,
) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    loop {
        terminal.prompt(USERNAME_PROMPT)?;
        match editor.read_line().await? {
            Some(name) => {
                let name = name.trim();
                if !name.is_empty() && !name.contains(char::is_whitespace) {
                    return Ok(Some(name.to_string()));
                }
            }
            None => return Ok(None),
        }
    }
}

/// One connection to the server plus the local keyboard and message screen.
pub struct ClientSession<R, W, I, T> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
    editor: InputEditor<I, T>,
    store: MessageStore,
}

impl<R, W, I, T> ClientSession<R, W, I, T>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    T: Write + Send + 'static,
{
    pub fn new(channel: LineChannel<R, W>, editor: InputEditor<I, T>, store: MessageStore) -> Self {
        let (reader, writer) = channel.into_split();
        Self {
            reader,
            writer,
            editor,
            store,
        }
    }

    /// Announces the username. No acknowledgement is awaited.
    pub async fn handshake(&mut self, username: &str) -> Result<()> {
        self.writer
            .write_line(&protocol::connect_line(username))
            .await
            .context("failed to send handshake")
    }

    /// Runs the receive and input loops until either one ends, then cancels
    /// the other.
    pub async fn run(self) -> Result<SessionEnd> {
        let ClientSession {
            reader,
            writer,
            editor,
            store,
        } = self;

        let mut loops = JoinSet::new();
        loops.spawn(receive_loop(reader, store));
        loops.spawn(input_loop(editor, writer));

        let first = loops
            .join_next()
            .await
            .context("client session started without tasks")?;
        loops.shutdown().await;

        first.context("client session task panicked")?
    }
}

async fn receive_loop<R>(mut reader: LineReader<R>, mut store: MessageStore) -> Result<SessionEnd>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = reader
        .read_line()
        .await
        .context("failed to read from server")?
    {
        store.append(line)?;
    }
    store.append(protocol::SERVER_CLOSED)?;
    Ok(SessionEnd::ServerClosed)
}

async fn input_loop<I, T, W>(
    mut editor: InputEditor<I, T>,
    mut writer: LineWriter<W>,
) -> Result<SessionEnd>
where
    I: AsyncRead + Unpin,
    T: Write,
    W: AsyncWrite + Unpin,
{
    while let Some(line) = editor.read_line().await? {
        writer
            .write_line(&line)
            .await
            .context("failed to send message")?;
    }
    if let Err(err) = writer.close().await {
        debug!(error = ?err, "failed to close connection after input ended");
    }
    Ok(SessionEnd::InputClosed)
}
