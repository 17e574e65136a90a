//! CLI entry point for qabot (for dev, testing and offline dataset work).
//!
//! `qabot chat` stands in for the chat transport: each stdin line is a message
//! from one local session, replies go to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use async_trait::async_trait;
use clap::Parser;
use qabot_core::bot::display_topic;
use qabot_core::{
    app_data_dir, config_path, feedback_to_corpus, load_config, load_config_from, merge_corpus_dir, read_csv_corpus,
    read_log, save_config, set_topic_path, split_corpus, status, write_corpus, Bot, Config, Event, Label, Reply,
    ReplyOptions, SessionId, Transport, TransportError,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qabot")]
#[command(about = "qabot: answers questions from topic FAQ corpora by embedding similarity")]
struct Cli {
    /// Config file to use instead of the one in the app data directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show backend status (for dev).
    Status,
    /// Show where qabot stores its config, feedback log and datasets.
    DataDir,
    /// List the topics that have a corpus.
    Topics,
    /// Answer one question.
    Ask {
        #[arg(long, short)]
        topic: String,
        /// Show the N best corpus sentences with scores instead of the answer.
        #[arg(long, value_name = "N")]
        top: Option<usize>,
        #[arg(value_name = "QUESTION", required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Chat in the terminal. Lines starting with `/` are commands: /start, /<topic>, /like, /dislike.
    Chat {
        #[arg(long, default_value = "local")]
        session: String,
    },
    /// Convert the feedback log into a corpus file.
    ExportFeedback {
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        /// Keep only records with this label (like or dislike).
        #[arg(long)]
        label: Option<Label>,
    },
    /// Shuffle a corpus file and split it into train.json and test.json.
    Split {
        #[arg(value_name = "PATH")]
        input: PathBuf,
        #[arg(long, default_value_t = 0.8)]
        ratio: f64,
        #[arg(long, value_name = "DIR", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Convert a question,answer CSV table into a corpus file.
    ImportCsv {
        #[arg(value_name = "PATH")]
        input: PathBuf,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
    },
    /// Merge every corpus file in a directory into one.
    Merge {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
    },
    /// Show or edit the saved config.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand)]
enum ConfigAction {
    /// Print the effective config (file plus environment) as TOML.
    Show,
    /// Write the default config file.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Register a corpus file for a topic.
    SetTopic { name: String, path: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match load_config_from(path) {
            Ok(mut c) => {
                c.apply_env();
                c
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => load_config(),
    };

    match run(cli.command.unwrap_or(Commands::Status), &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Status => {
            println!("qabot backend");
            println!("  core: {}", status());
            println!("  model: {} @ {}", config.embed_model, config.ollama_url);
            println!("  datasets: {}", config.dataset_dir.display());
            println!("  feedback: {}", config.feedback_path.display());
        }
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => eprintln!("Could not determine app data directory."),
        },
        Commands::Topics => {
            let bot = Bot::from_config(config)?;
            let registry = bot.retriever().corpus().registry();
            for topic in bot.topics() {
                let path = registry.path_for(&topic).map(|p| p.display().to_string()).unwrap_or_default();
                println!("  {:<24} {}", display_topic(&topic), path);
            }
        }
        Commands::Ask { topic, top, question } => {
            let bot = Bot::from_config(config)?;
            let question = question.join(" ");
            match top {
                Some(n) => {
                    for (sentence, score) in bot.retriever().retrieve_top(&question, &topic, n).await? {
                        println!("{:.3}  {}", score, sentence);
                    }
                }
                None => {
                    let answer = bot.retriever().retrieve(&question, &topic).await?;
                    println!("{}", answer.text);
                    tracing::debug!(score = answer.score, fallback = answer.fallback, "answered");
                }
            }
        }
        Commands::Chat { session } => {
            let bot = Bot::from_config(config)?;
            let mut terminal = Terminal::new(session);
            terminal.send_local(bot.welcome());
            bot.serve(&mut terminal).await?;
        }
        Commands::ExportFeedback { out, label } => {
            let records = read_log(&config.feedback_path)?;
            let doc = feedback_to_corpus(&records, label);
            write_corpus(&out, &doc)?;
            println!(
                "Wrote {} of {} feedback record(s) to {}",
                doc.data[0].paragraphs.len(),
                records.len(),
                out.display()
            );
        }
        Commands::Split { input, ratio, out_dir } => {
            let doc = qabot_core::corpus::read_corpus(&input)?;
            let (train, test) = split_corpus(&doc, ratio, &mut rand::thread_rng());
            write_corpus(&out_dir.join("train.json"), &train)?;
            write_corpus(&out_dir.join("test.json"), &test)?;
            println!(
                "train: {} paragraph(s), test: {} paragraph(s)",
                train.data[0].paragraphs.len(),
                test.data[0].paragraphs.len()
            );
        }
        Commands::ImportCsv { input, out } => {
            let doc = read_csv_corpus(&input)?;
            write_corpus(&out, &doc)?;
            println!("Wrote {} row(s) to {}", doc.data[0].paragraphs.len(), out.display());
        }
        Commands::Merge { dir, out } => {
            let doc = merge_corpus_dir(&dir)?;
            write_corpus(&out, &doc)?;
            println!("Wrote {} paragraph(s) to {}", doc.data[0].paragraphs.len(), out.display());
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
            ConfigAction::Init { force } => {
                let path = config_path().ok_or("could not determine app data directory")?;
                if path.exists() && !force {
                    return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
                }
                save_config(&Config::default())?;
                println!("Wrote {}", path.display());
            }
            ConfigAction::SetTopic { name, path } => {
                set_topic_path(&name, path)?;
                println!("Topic {} registered", display_topic(&name));
            }
        },
    }
    Ok(())
}

/// One local session over stdin/stdout.
struct Terminal {
    session: SessionId,
    lines: Lines<BufReader<Stdin>>,
}

impl Terminal {
    fn new(session: String) -> Self {
        Self {
            session,
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    fn send_local(&self, reply: Reply) {
        println!("{}", reply.text);
        match reply.options {
            Some(ReplyOptions::Rating) => println!("  [/like] [/dislike]"),
            Some(ReplyOptions::Topics(topics)) => {
                let buttons: Vec<String> = topics.iter().map(|t| format!("[/{}]", t)).collect();
                println!("  {}", buttons.join(" "));
            }
            None => {}
        }
    }
}

#[async_trait]
impl Transport for Terminal {
    async fn next_event(&mut self) -> Option<(SessionId, Event)> {
        loop {
            let line = self.lines.next_line().await.ok()??;
            if line.trim().is_empty() {
                continue;
            }
            return Some((self.session.clone(), Event::from_text(&line)));
        }
    }

    async fn send(&mut self, _session: &str, reply: Reply) -> Result<(), TransportError> {
        self.send_local(reply);
        Ok(())
    }
}
