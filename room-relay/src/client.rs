use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{ClientToServer, ServerToClient, read_event, write_event},
};

/// What the terminal client knows about its own session.
#[derive(Debug, Default)]
struct ClientState {
    room: Option<String>,
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Join(String),
    Leave,
    TypingStart,
    TypingStop,
    Say(String),
    Nothing,
}

impl Input {
    fn parse(line: &str) -> Self {
        let text = line.trim();
        if text.is_empty() {
            return Input::Nothing;
        }

        let Some(command) = text.strip_prefix('/') else {
            return Input::Say(text.to_string());
        };
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));

        match name.to_ascii_lowercase().as_str() {
            "quit" => Input::Quit,
            "join" if !rest.is_empty() => Input::Join(rest.to_string()),
            "leave" => Input::Leave,
            "typing" => Input::TypingStart,
            "idle" => Input::TypingStop,
            _ => Input::Say(text.to_string()),
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_handshake(&mut writer, &args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut state = ClientState::default();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut state).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn send_handshake(writer: &mut OwnedWriteHalf, args: &ClientArgs) -> Result<()> {
    write_event(
        writer,
        &ClientToServer::Authenticate {
            token: args.token.clone(),
        },
    )
    .await?;

    // The relay handles a connection's events in order, so the join is only
    // considered once authentication has been decided.
    if let Some(room) = &args.room {
        write_event(writer, &ClientToServer::JoinRoom { room: room.clone() }).await?;
    }
    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    state: &mut ClientState,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_event = read_event::<_, ServerToClient>(reader) => {
                if !handle_server_event(server_event, state).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, state).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_event(
    event: io::Result<Option<ServerToClient>>,
    state: &mut ClientState,
) -> Result<bool> {
    match event? {
        Some(event) => {
            track_state(&event, state);
            render_server_event(event).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

fn track_state(event: &ServerToClient, state: &mut ClientState) {
    match event {
        ServerToClient::PreviousMessages { room, .. } => state.room = Some(room.clone()),
        ServerToClient::LeftRoom { room } if state.room.as_deref() == Some(room.as_str()) => {
            state.room = None;
        }
        _ => {}
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    state: &ClientState,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let outbound = match (Input::parse(input), state.room.clone()) {
        (Input::Nothing, _) => return Ok(true),
        (Input::Quit, _) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        (Input::Join(room), _) => ClientToServer::JoinRoom { room },
        (Input::Leave, Some(room)) => ClientToServer::LeaveRoom { room },
        (Input::TypingStart, Some(room)) => ClientToServer::TypingStart { room },
        (Input::TypingStop, Some(room)) => ClientToServer::TypingStop { room },
        (Input::Say(content), Some(room)) => ClientToServer::SendMessage { room, content },
        (_, None) => {
            write_stderr("!!! join a room first with /join <room>").await?;
            return Ok(true);
        }
    };

    write_event(writer, &outbound).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn render_lines(event: ServerToClient) -> Result<Vec<String>, String> {
    let lines = match event {
        ServerToClient::Authenticated { username } => {
            vec![format!("*** authenticated as {username}")]
        }
        ServerToClient::PreviousMessages { room, messages } => {
            let mut lines = vec![format!(
                "*** joined {room} ({} earlier messages)",
                messages.len()
            )];
            lines.extend(
                messages
                    .into_iter()
                    .map(|message| format!("<{}> {}", message.sender, message.content)),
            );
            lines
        }
        ServerToClient::NewMessage { message, .. } => {
            vec![format!("<{}> {}", message.sender, message.content)]
        }
        ServerToClient::UserJoined { username } => vec![format!("*** {username} joined the room")],
        ServerToClient::UserLeft { username } => vec![format!("*** {username} left the room")],
        ServerToClient::LeftRoom { room } => vec![format!("*** left {room}")],
        ServerToClient::UserTyping { username } => vec![format!("*** {username} is typing")],
        ServerToClient::UserStoppedTyping { username } => {
            vec![format!("*** {username} stopped typing")]
        }
        ServerToClient::AuthError { message } | ServerToClient::Error { message } => {
            return Err(format!("!!! {message}"));
        }
    };
    Ok(lines)
}

async fn render_server_event(event: ServerToClient) -> io::Result<()> {
    match render_lines(event) {
        Ok(lines) => {
            for line in lines {
                write_stdout(&line).await?;
            }
            Ok(())
        }
        Err(line) => write_stderr(&line).await,
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
