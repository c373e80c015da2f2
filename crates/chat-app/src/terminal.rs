use std::io::Write;
use std::ops::ControlFlow;

use cortex::{ChatCore, ChatEvent};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "\
/new            start a conversation
/list           list conversations
/select <n>     switch to conversation n
/delete [n]     delete conversation n, or the current one
/model [name]   show or change the model
/models         list installed models
/status         re-check the backend
/cancel         stop the reply being streamed
/quit           exit
anything else is sent as a message";

#[derive(Debug, Snafu)]
pub enum TerminalError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    New,
    List,
    Select(usize),
    Delete(Option<usize>),
    Model(Option<String>),
    Models,
    Status,
    Cancel,
    Quit,
    Help,
    Invalid(String),
    Prompt(String),
}

pub async fn run(core: ChatCore) -> Result<(), TerminalError> {
    let status = core.check_connection().await;
    println!("backend {status}, model {}", core.default_model());
    if core.current_session().is_none() {
        println!("no conversation selected, /new starts one (/help for commands)");
    }

    let printer = tokio::spawn(print_events(core.subscribe_events()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "terminal-read-line",
    })? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if execute(&core, command).await.is_break() {
            break;
        }
    }

    core.cancel();
    printer.abort();
    Ok(())
}

async fn execute(core: &ChatCore, command: Command) -> ControlFlow<()> {
    match command {
        Command::New => {
            let session = core.create_session();
            println!("started a conversation on {}", session.model);
        }
        Command::List => {
            let current = core.current_session_id();
            let sessions = core.list_sessions();
            if sessions.is_empty() {
                println!("no conversations yet");
            }
            for (index, session) in sessions.iter().enumerate() {
                let marker = if Some(session.id) == current { '*' } else { ' ' };
                println!(
                    "{marker} {}. {} ({}, {} messages)",
                    index + 1,
                    session.title,
                    session.model,
                    session.messages.len()
                );
            }
        }
        Command::Select(position) => match session_at(core, position) {
            Some(session_id) => {
                if let Err(error) = core.select_session(session_id) {
                    println!("[error] {error}");
                } else if let Some(session) = core.current_session() {
                    for message in &session.messages {
                        println!("{}> {}", message.role.as_str(), message.content);
                    }
                }
            }
            None => println!("no conversation {position}"),
        },
        Command::Delete(position) => {
            let target = match position {
                Some(position) => session_at(core, position),
                None => core.current_session_id(),
            };
            match target {
                Some(session_id) => core.delete_session(session_id),
                None => println!("nothing to delete"),
            }
        }
        Command::Model(None) => println!("model {}", core.default_model()),
        Command::Model(Some(model)) => {
            core.select_model(&model);
            println!("model {}", core.default_model());
        }
        Command::Models => match core.refresh_models().await {
            Ok(models) => {
                for model in models {
                    match model.size_label() {
                        Some(size) => println!("  {} ({size})", model.name),
                        None => println!("  {}", model.name),
                    }
                }
            }
            Err(error) => println!("[error] {error}"),
        },
        Command::Status => {
            let status = core.check_connection().await;
            println!("backend {status}, exchange {}", core.exchange_state().borrow().label());
        }
        Command::Cancel => {
            if !core.cancel() {
                println!("nothing to cancel");
            }
        }
        Command::Quit => return ControlFlow::Break(()),
        Command::Help => println!("{HELP}"),
        Command::Invalid(line) => println!("unrecognized command `{line}`, /help lists commands"),
        Command::Prompt(text) => {
            // The handle is dropped; the printer task reports how the reply ends.
            if let Err(error) = core.submit(&text) {
                println!("[error] {error}");
            }
        }
    }

    ControlFlow::Continue(())
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::Fragment { text, .. }) => {
                let mut stdout = std::io::stdout().lock();
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            Ok(ChatEvent::ExchangeCompleted { .. }) => println!(),
            Ok(ChatEvent::ExchangeFailed { error, .. }) => println!("\n[error] {error}"),
            Ok(ChatEvent::ExchangeCancelled { .. }) => println!("\n[cancelled]"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "terminal fell behind the reply stream");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// Positions on screen are 1-based.
fn session_at(core: &ChatCore, position: usize) -> Option<cortex_storage::SessionId> {
    let index = position.checked_sub(1)?;
    core.list_sessions().get(index).map(|session| session.id)
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Prompt(line.to_string()));
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((rest, ""));
    let invalid = || Command::Invalid(line.to_string());

    let command = match (name, argument) {
        ("new", "") => Command::New,
        ("list", "") => Command::List,
        ("select", position) => position.parse().map(Command::Select).unwrap_or_else(|_| invalid()),
        ("delete", "") => Command::Delete(None),
        ("delete", position) => position
            .parse()
            .map(|position| Command::Delete(Some(position)))
            .unwrap_or_else(|_| invalid()),
        ("model", "") => Command::Model(None),
        ("model", model) => Command::Model(Some(model.to_string())),
        ("models", "") => Command::Models,
        ("status", "") => Command::Status,
        ("cancel", "") => Command::Cancel,
        ("quit" | "exit", "") => Command::Quit,
        ("help", _) => Command::Help,
        _ => invalid(),
    };
    Some(command)
}
