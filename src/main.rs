use std::io::Write;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use buddy_relay::config::{ChatArgs, Cli, Command, ServeArgs};
use buddy_relay::relay::{self, ChatRelay};
use buddy_relay::server::Server;
use buddy_relay::session::{ChatSession, HttpTransport};
use buddy_relay::voice::{CommandSynthesizer, SpeechSynthesizer, Unsupported};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("BUDDY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => chat(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let relay = ChatRelay::from_config(args.completion_config())
        .context("invalid provider configuration")?;
    let app = relay::app(relay, args.cors_origins()).into_handler();

    let server = Server::bind(&args.bind).await?;
    tracing::info!(
        address = %server.local_addr(),
        model = %args.model,
        "relay ready at http://{}{}",
        server.local_addr(),
        relay::CHAT_PATH
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    server
        .run_until(
            move |req| {
                let app = app.clone();
                async move { app.handle(req).await }
            },
            shutdown,
        )
        .await?;
    Ok(())
}

async fn chat(args: ChatArgs) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&args.endpoint)?;
    let synthesizer: Box<dyn SpeechSynthesizer> = match args.speak_command.as_deref() {
        Some(command) => Box::new(CommandSynthesizer::new(command)?),
        None => Box::new(Unsupported),
    };
    let mut session = ChatSession::new(transport, synthesizer);

    println!("Therapy Buddy offers supportive conversation and coping ideas.");
    println!("It is not a substitute for professional care. If you are in crisis, contact local emergency services.");
    println!("Type a message and press enter. Ctrl-D quits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let mut printed = 0;
        let reply = session
            .send(&line, |message| {
                show_new_text(&mut std::io::stdout(), &message.content, &mut printed);
            })
            .await;
        if reply.is_some() {
            println!();
        }
    }
    Ok(())
}

/// Writes the part of a streaming reply not shown yet. Terminal write
/// failures are logged and the reply keeps streaming.
fn show_new_text(out: &mut impl Write, content: &str, shown: &mut usize) {
    let fresh = content.get(*shown..).unwrap_or_default();
    if let Err(e) = out.write_all(fresh.as_bytes()).and_then(|()| out.flush()) {
        tracing::debug!(error = %e, "could not write reply to the terminal");
    }
    *shown = content.len();
}
