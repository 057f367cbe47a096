use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use qingwang_chat::cli::{parse_repl_line, Args, ReplCommand};
use qingwang_chat::{
    ApiClient, Author, ChatError, ClientConfig, Conversation, Message, MessageBody, Mission, SignInRedirect,
    SubmitOptions, Update,
};

/// Env var holding the tracing filter directive.
const LOG_ENV: &str = "QINGWANG_LOG";

type Chat = Conversation<ApiClient>;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_message(message: &Message) {
    match message.author {
        Author::User => println!("{} {}", "你:".cyan().bold(), message.body.render()),
        Author::Assistant => {
            let label = match message.mission {
                Some(mission) => format!("青望·{}:", mission.wire_name()),
                None => "青望:".to_string(),
            };
            let body = message.body.render();
            let body = match &message.body {
                MessageBody::Failed(_) => body.red(),
                MessageBody::Interrupted(_) => body.yellow(),
                MessageBody::NoResults | MessageBody::Thinking => body.dimmed(),
                MessageBody::Text(_) | MessageBody::Results(_) => body.normal(),
            };
            println!("{} {}", label.green().bold(), body);
        }
    }
}

fn print_prompt(mission: Mission) {
    print!("{} ", format!("[{}]>", mission).blue());
    let _ = std::io::stdout().flush();
}

// ---------------------------------------------------------------------------
// One turn
// ---------------------------------------------------------------------------

/// Submit one prompt and print the answer once it is final. With `follow`,
/// streamed text is printed as it grows.
async fn run_turn(chat: &mut Chat, input: &str, mission: Mission, options: SubmitOptions, follow: bool) {
    let placeholder = match chat.submit(input, mission, options).await {
        Ok(handle) => handle,
        Err(ChatError::Busy) => {
            eprintln!("{}", "上一个回答尚未结束".yellow());
            return;
        }
        Err(ChatError::ChannelLost(reason)) => {
            eprintln!("{} {}", "连接已断开，无法继续对话:".red(), reason);
            return;
        }
        Err(e) => {
            // The placeholder already carries the failure.
            tracing::debug!(error = %e, "submit failed");
            if let Some(last) = chat.transcript().last() {
                print_message(last);
            }
            return;
        }
    };

    let mut printed = String::new();
    if follow && chat.is_busy() {
        print!("{} ", "青望:".green().bold());
        while chat.is_busy() {
            match chat.next_update().await {
                Some(Update::Chunk { target, .. }) if target == placeholder => {
                    if let Some(MessageBody::Text(text)) = chat.transcript().get(placeholder).map(|m| &m.body) {
                        match text.strip_prefix(printed.as_str()) {
                            Some(grown) => print!("{}", grown),
                            None => print!("\n{}", text),
                        }
                        printed = text.clone();
                        let _ = std::io::stdout().flush();
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        println!();
    }
    chat.settle().await;

    if let Some(message) = chat.transcript().get(placeholder) {
        let already_shown = matches!(&message.body, MessageBody::Text(text) if follow && *text == printed);
        if !already_shown {
            print_message(message);
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "qingwang-chat", &mut std::io::stdout());
        return Ok(());
    }

    let config = ClientConfig::load(args.config.as_deref())?;
    let client = ApiClient::new(&config);

    if args.list_rooms {
        let rooms = match client.list_rooms().await {
            Err(ChatError::AuthRejected) => {
                eprintln!("{}", "登录已失效，请重新登录".red().bold());
                std::process::exit(2);
            }
            other => other?,
        };
        for room in rooms {
            println!("{}\t{}", room.chat_id.bold(), room.title);
        }
        return Ok(());
    }

    let room = args.room.clone().ok_or("a room id is required (or pass --list-rooms)")?;

    let signed_out = Arc::new(AtomicBool::new(false));
    let redirect: Arc<dyn SignInRedirect> = {
        let signed_out = Arc::clone(&signed_out);
        Arc::new(move || {
            signed_out.store(true, Ordering::SeqCst);
            eprintln!("{}", "登录已失效，请重新登录（设置 QINGWANG_TOKEN）".red().bold());
        })
    };

    let mut chat = match Conversation::open(config, room, client, redirect).await {
        Ok(chat) => chat,
        Err(ChatError::AuthRejected) => std::process::exit(2),
        Err(e) => return Err(e.into()),
    };
    for message in chat.transcript().snapshot() {
        print_message(&message);
    }

    let options = SubmitOptions {
        model_enhanced: args.model_enhanced,
    };

    if let Some(prompt) = args.prompt.as_deref() {
        run_turn(&mut chat, prompt, args.mission, options, args.follow).await;
        chat.close();
        if signed_out.load(Ordering::SeqCst) {
            std::process::exit(2);
        }
        return Ok(());
    }

    let mut mission = args.mission;
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    print_prompt(mission);
    while let Some(line) = lines.next().await {
        match parse_repl_line(&line?) {
            ReplCommand::Submit(text) => {
                run_turn(&mut chat, &text, mission, options, args.follow).await;
                if signed_out.load(Ordering::SeqCst) {
                    break;
                }
            }
            ReplCommand::SwitchMission(next) => {
                mission = next;
                println!("{} {}", "mission:".dimmed(), mission.wire_name());
            }
            ReplCommand::Refresh => match chat.refresh_history().await {
                Ok(true) => {
                    for message in chat.transcript().snapshot() {
                        print_message(&message);
                    }
                }
                Ok(false) => eprintln!("{}", "回答进行中，稍后再刷新".yellow()),
                Err(e) => eprintln!("{}", e.to_string().red()),
            },
            ReplCommand::Quit => break,
            ReplCommand::Empty => {}
            ReplCommand::Invalid(msg) => eprintln!("{}", msg.yellow()),
        }
        print_prompt(mission);
    }

    chat.close();
    Ok(())
}
