use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "interceptor-cli")]
#[command(about = "Management CLI for the HTTP interceptor", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    #[arg(short, long, env = "INTERCEPTOR_API_KEY", default_value = "CHANGE_ME")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check interceptor status
    Status,
    /// List sessions awaiting a response
    Sessions,
    /// Manage interception rules
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Inspect and decide held messages
    Holds {
        #[command(subcommand)]
        command: HoldCommands,
    },
    /// Duplicate highlighter
    Highlight {
        #[command(subcommand)]
        command: HighlightCommands,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules in evaluation order
    List,
    /// Add a rule from a JSON file (same shape as a `[[rules]]` entry)
    Add { file: PathBuf },
    /// Remove a rule
    Remove { id: u64 },
    /// Enable a rule
    Enable { id: u64 },
    /// Disable a rule
    Disable { id: u64 },
}

#[derive(Subcommand)]
enum HoldCommands {
    /// List held messages
    List,
    /// Decide a held message
    Decide {
        id: String,
        #[command(subcommand)]
        decision: DecisionCommand,
    },
}

#[derive(Subcommand)]
enum DecisionCommand {
    /// Release unchanged
    Forward,
    /// Discard
    Drop,
    /// Replace with the raw message in a file
    Replace { file: PathBuf },
    /// Apply edits from a JSON file (an array of edits)
    Modify { file: PathBuf },
}

#[derive(Subcommand)]
enum HighlightCommands {
    /// Forget every request seen so far
    Reset,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let url = |path: &str| format!("{}{}", cli.url.trim_end_matches('/'), path);

    let request = match cli.command {
        Commands::Status => client.get(url("/admin/status")),
        Commands::Sessions => client.get(url("/admin/sessions")),
        Commands::Rules { command } => match command {
            RuleCommands::List => client.get(url("/admin/rules")),
            RuleCommands::Add { file } => {
                let rule: Value = serde_json::from_str(&std::fs::read_to_string(file)?)?;
                client.post(url("/admin/rules")).json(&rule)
            }
            RuleCommands::Remove { id } => client.delete(url(&format!("/admin/rules/{}", id))),
            RuleCommands::Enable { id } => client.post(url(&format!("/admin/rules/{}/enable", id))),
            RuleCommands::Disable { id } => client.post(url(&format!("/admin/rules/{}/disable", id))),
        },
        Commands::Holds { command } => match command {
            HoldCommands::List => client.get(url("/admin/holds")),
            HoldCommands::Decide { id, decision } => {
                let body = match decision {
                    DecisionCommand::Forward => json!({ "type": "forward" }),
                    DecisionCommand::Drop => json!({ "type": "drop" }),
                    DecisionCommand::Replace { file } => {
                        json!({ "type": "replace", "raw": std::fs::read_to_string(file)? })
                    }
                    DecisionCommand::Modify { file } => {
                        let edits: Value = serde_json::from_str(&std::fs::read_to_string(file)?)?;
                        json!({ "type": "modify", "edits": edits })
                    }
                };
                client.post(url(&format!("/admin/holds/{}/decision", id))).json(&body)
            }
        },
        Commands::Highlight { command } => match command {
            HighlightCommands::Reset => client.post(url("/admin/highlight/reset")),
        },
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
