use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quickimage_contracts::ids::object_id;
use quickimage_contracts::library::{SearchOrder, DEFAULT_LIST_LIMIT, DEFAULT_SEARCH_LIMIT};
use quickimage_contracts::runs::{GenerationRequest, PostProcessOptions, ProviderOptions};
use quickimage_engine::{Engine, EngineConfig, VideoRequest};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "quickimage=info";

#[derive(Debug, Parser)]
#[command(name = "quickimage", version, about = "Generate, store and search AI images")]
struct Cli {
    /// Image library directory (overrides QUICKIMAGE_IMAGE_DIR).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Append lifecycle events as JSONL to this file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Search(SearchArgs),
    List(ListArgs),
    Show(ShowArgs),
    Keys,
    Video(VideoArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "dall-e-3")]
    model: String,
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    quality: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    output_format: Option<String>,
    #[arg(long)]
    remove_background: bool,
    /// Keep the original next to `<id>-background-removed.png`.
    #[arg(long)]
    keep_original: bool,
    #[arg(long)]
    jpeg_copy: bool,
}

#[derive(Debug, Parser)]
struct SearchArgs {
    #[arg(long)]
    query: String,
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    limit: usize,
    #[arg(long)]
    newest_first: bool,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
    limit: usize,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Parser)]
struct VideoArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("quickimage error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    // A missing .env is normal; keys may come from the real environment.
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(dir) = cli.dir {
        config.image_dir = dir;
    }
    if let Some(events) = cli.events {
        config.events_path = Some(events);
    }
    let engine = Engine::new(config);

    match cli.command {
        Command::Generate(args) => run_generate(&engine, args).await,
        Command::Search(args) => run_search(&engine, args).await,
        Command::List(args) => {
            print_json(&engine.list_newest(args.limit).await?)?;
            Ok(0)
        }
        Command::Show(args) => {
            let metadata = engine
                .read_metadata(&args.id)
                .await
                .with_context(|| format!("cannot show '{}'", args.id))?;
            print_json(&metadata)?;
            Ok(0)
        }
        Command::Keys => {
            print_json(&engine.api_key_status())?;
            Ok(0)
        }
        Command::Video(args) => {
            let request = VideoRequest {
                id: args.id.unwrap_or_else(object_id),
                source_image: args.source,
            };
            let result = engine.generate_video(&request).await?;
            print_json(&result)?;
            Ok(0)
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

async fn run_generate(engine: &Engine, args: GenerateArgs) -> Result<i32> {
    let request = GenerationRequest::new(
        args.id.unwrap_or_else(object_id),
        args.model,
        args.prompt,
    )
    .with_provider_options(ProviderOptions {
        size: args.size,
        aspect_ratio: args.aspect_ratio,
        quality: args.quality,
        style: args.style,
        output_format: args.output_format,
    })
    .with_post_process(PostProcessOptions {
        remove_background: args.remove_background,
        remove_background_keep_original: args.keep_original,
        save_jpeg_copy: args.jpeg_copy,
    });

    let result = engine.generate(&request).await;
    print_json(&result)?;
    Ok(if result.succeeded { 0 } else { 1 })
}

async fn run_search(engine: &Engine, args: SearchArgs) -> Result<i32> {
    if args.query.is_empty() {
        bail!("search query is empty");
    }
    let order = if args.newest_first {
        SearchOrder::NewestFirst
    } else {
        SearchOrder::Storage
    };
    let rows = engine.search(&args.query, args.limit, order).await?;
    if rows.is_empty() {
        println!("No results found for '{}'.", args.query);
        return Ok(0);
    }
    print_json(&rows)?;
    Ok(0)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
