use anyhow::Context;
use pricecheck::{
    config::Settings,
    console::{render_outcome, ConsoleProgress, SessionHistory},
    Pipeline,
};
use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The main entry point of the application.
///
/// With a product name on the command line it runs one analysis and exits;
/// the exit status is non-zero when the analysis failed. Without arguments it
/// reads product names from stdin until `quit`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    // Missing credentials stop the program here, before any request is made.
    let settings = Settings::load().context("failed to load configuration")?;
    let pipeline = Pipeline::from_settings(&settings).context("failed to build HTTP clients")?;

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if !query.trim().is_empty() {
        let succeeded = analyze(&pipeline, &query, None).await;
        if !succeeded {
            std::process::exit(1);
        }
        return Ok(());
    }

    let history = SessionHistory::default();
    println!("🛡️ Product Price Insurance");
    println!("Enter a product name to analyze (e.g. 'iPhone 16 256GB').");
    println!("Commands: history, clear, quit");

    let stdin = io::stdin();
    loop {
        print!("product> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "history" => print!("{}", history.render()),
            "clear" => {
                history.clear();
                println!("History cleared.");
            }
            product => {
                analyze(&pipeline, product, Some(&history)).await;
            }
        }
    }

    Ok(())
}

/// Runs one analysis and prints the outcome. Returns whether a report was produced.
async fn analyze(pipeline: &Pipeline, product: &str, history: Option<&SessionHistory>) -> bool {
    let start_time = Instant::now();
    let progress = ConsoleProgress::new();

    let state = pipeline.run(product, &progress).await;

    println!("{}", render_outcome(&state));
    info!(elapsed = ?start_time.elapsed(), phase = %state.phase(), "Analysis finished");

    if let Some(history) = history {
        history.record(&state);
    }
    state.is_done()
}
