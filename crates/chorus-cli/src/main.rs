//! chorus - follow a live agent conversation from the terminal

mod config;
mod utils;

use anyhow::Context;
use chorus_session::{
    ChatHandlers, ConversationConfig, ConversationEvent, Delivery, InitialConfig, Messaging,
    SocketTransport,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// chorus - headless client for agent-execution backends
#[derive(Parser, Debug)]
#[command(name = "chorus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Conversation websocket URL
    #[arg(short, long)]
    url: Option<String>,

    /// Step-execution websocket URL
    #[arg(long)]
    step_url: Option<String>,

    /// Start the workflow stored in this file
    #[arg(short, long)]
    workflow: Option<std::path::PathBuf>,

    /// Exit once the workflow finishes
    #[arg(long)]
    exit_on_done: bool,

    /// Do not reconnect after the connection drops
    #[arg(long)]
    no_reconnect: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("chorus=debug,chorus_wire=debug,chorus_session=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        let path = config::Config::init().context("Error creating config")?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut config = config::Config::load();
    if args.no_reconnect {
        config.reconnect.enabled = false;
    }
    let url = args
        .url
        .clone()
        .or_else(|| config.url.clone())
        .context("No backend URL: pass --url or set `url` in the config file")?;

    let conversation = ConversationConfig::new(InitialConfig {
        show: true,
        ..Default::default()
    })
    .with_handlers(ChatHandlers::default().with_on_user_input(|response| {
        tracing::debug!("Answered input request {}", response.request_id);
    }))
    .with_deduplication(config.dedup_config());

    let mut messaging = Messaging::connect(config.transport_config(&url), conversation);
    if let Some(step_url) = args.step_url.as_ref().or(config.step_url.as_ref()) {
        messaging = messaging.connect_steps(config.transport_config(step_url));
    }

    let printer = spawn_printer(&messaging);

    if let Some(path) = &args.workflow {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        messaging.start_workflow(&utils::parse_workflow(&contents));
    }

    let result = run(&mut messaging, args.exit_on_done).await;

    messaging.close();
    // Let the printer drain the final events
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.abort();

    result
}

/// Print conversation and step events as they are published
fn spawn_printer(messaging: &Messaging<SocketTransport>) -> tokio::task::JoinHandle<()> {
    let mut events = messaging.subscribe();
    let mut steps = messaging.subscribe_steps();
    tokio::spawn(async move {
        let mut warned_secret = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let secret = matches!(
                            &event,
                            ConversationEvent::ActiveRequestChanged { request: Some(r) } if r.password
                        );
                        if secret && !warned_secret {
                            eprintln!("Note: secret input is echoed as you type it");
                            warned_secret = true;
                        }
                        if let Some(line) = utils::format_event(&event) {
                            println!("{}", line);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("[{} events skipped]", n);
                    }
                    Err(_) => break,
                },
                Some(Ok(step)) = async {
                    match steps.as_mut() {
                        Some(steps) => Some(steps.recv().await),
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(line) = utils::format_step(&step) {
                        println!("{}", line);
                    }
                }
            }
        }
    })
}

/// Drive the conversation until the backend goes away or the user quits
async fn run(messaging: &mut Messaging<SocketTransport>, exit_on_done: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut watch = utils::WorkflowWatch::new(messaging.state().active);

    loop {
        tokio::select! {
            delivery = messaging.next_frame() => match delivery {
                Some(Delivery::Conversation) => {
                    if watch.finished(messaging.state().active) && exit_on_done {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    eprintln!("Connection closed");
                    break;
                }
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !handle_input(messaging, line.trim()) {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

/// Act on one line of user input. Returns `false` to quit.
fn handle_input(messaging: &mut Messaging<SocketTransport>, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" | "/exit" => return false,
        "/reconnect" => messaging.reconnect(),
        "/reset" => messaging.reset(),
        "/status" => {
            let state = messaging.state();
            println!(
                "[{} | active: {} | {} messages | awaiting input: {}]",
                messaging.connection_state(),
                state.active,
                state.messages.len(),
                state.active_request.is_some()
            );
        }
        text => {
            if messaging.respond(text).is_none() {
                eprintln!("No input request is pending");
            }
        }
    }
    true
}
