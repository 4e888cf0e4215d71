use clap::Parser;
use minicpm_api::openai::openai_server::build_router;
use minicpm_api::openai::pipelines::echo::echo_backend;
use minicpm_api::openai::pipelines::worker::InferenceWorker;
use minicpm_api::openai::pipelines::BackendKind;
use minicpm_api::openai::responses::APIError;
use minicpm_api::openai::script_filter::{DictionaryConverter, ScriptFilter};
use minicpm_api::openai::OpenAIServerData;
use minicpm_api::TokenizerSource;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SIZE_IN_MB: usize = 1024 * 1024;
const LOG_FILE: &str = "minicpm-api.log";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to serve on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Model identifier, also selects the backend calling convention
    #[arg(long, env = "MODEL_ID", default_value = "openbmb/MiniCPM-Llama3-V-2_5")]
    model_id: String,

    /// Name reported in the `model` field of responses
    #[arg(long, default_value = "minicpm-v")]
    served_model_name: String,

    /// Path to a tokenizer.json used for completion token counts
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// The folder that contains the model files (huggingface layout)
    #[arg(long)]
    weight_path: Option<PathBuf>,

    /// Download tokenizer.json for `model_id` from the Hugging Face hub when
    /// no local tokenizer is found
    #[arg(long, default_value_t = false)]
    hf_tokenizer: bool,

    /// Huggingface token environment variable (optional). If not specified, load using hf_token_path.
    #[arg(long)]
    hf_token: Option<String>,

    /// Huggingface token file (optional). Defaults to `~/.cache/huggingface/token` when present
    #[arg(long)]
    hf_token_path: Option<String>,

    /// OpenCC-format dictionary for script conversion; repeat for several files,
    /// later files override earlier ones
    #[arg(long)]
    script_dict: Vec<PathBuf>,

    /// Delay between streamed fragments of the development engine (milliseconds)
    #[arg(long, default_value_t = 0)]
    echo_delay_ms: u64,

    /// Maximum request body size (MB); inline images count against it
    #[arg(long, default_value_t = 64)]
    max_body_mb: usize,

    /// SSE keep-alive interval (seconds)
    #[arg(long, default_value_t = 15)]
    keep_alive_secs: u64,

    /// Production mode: do not serve /openapi.json
    #[arg(long, env = "PROD_MODE", default_value_t = false)]
    prod: bool,

    /// Log to console and minicpm-api.log, level from RUST_LOG
    #[arg(long, default_value_t = false)]
    log: bool,
}

fn config_log(logger: ftail::Ftail, log_file: &str) -> Result<(), ftail::error::FtailError> {
    use tracing::log::LevelFilter;
    let cfg_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if std::path::Path::new(log_file).exists() {
        let _ = std::fs::remove_file(log_file);
    }
    logger
        .console(cfg_filter)
        .single_file(log_file, true, cfg_filter)
        .init()
}

#[tokio::main]
async fn main() -> Result<(), APIError> {
    let args = Args::parse();
    if args.log {
        if let Err(e) = config_log(ftail::Ftail::new(), LOG_FILE) {
            eprintln!("Failed to set up file logging: {e}");
        }
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    let kind = BackendKind::from_model_id(&args.model_id);
    info!("Model {} uses the {} backend", args.model_id, kind);

    let tokenizer = TokenizerSource::resolve(
        args.tokenizer.clone(),
        args.weight_path.as_deref(),
        args.hf_tokenizer.then_some(args.model_id.as_str()),
    )
    .load(args.hf_token.clone(), args.hf_token_path.clone())?;

    let script_filter: Option<Arc<dyn ScriptFilter>> = if args.script_dict.is_empty() {
        None
    } else {
        let converter = DictionaryConverter::from_files(&args.script_dict).map_err(APIError::from)?;
        info!("Script conversion enabled ({} entries)", converter.len());
        Some(Arc::new(converter))
    };

    let delay = Duration::from_millis(args.echo_delay_ms);
    let (worker, ready) =
        InferenceWorker::spawn(kind, move |kind| Ok(echo_backend(kind, tokenizer, delay)))
            .map_err(APIError::from)?;
    match ready.await {
        Ok(Ok(())) => info!("{} backend loaded", kind),
        Ok(Err(e)) => warn!("Serving without a model, chat requests will fail: {}", e),
        Err(_) => return Err(APIError::new_str("inference worker exited during startup")),
    }

    let mut server_data = OpenAIServerData::new(worker, args.served_model_name)
        .with_keep_alive(Duration::from_secs(args.keep_alive_secs));
    if let Some(filter) = script_filter {
        server_data = server_data.with_script_filter(filter);
    }
    if args.prod {
        info!("Production mode, /openapi.json disabled");
    }
    let app = build_router(server_data, args.max_body_mb * SIZE_IN_MB, args.prod);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| APIError::new(e.to_string()))?;
    warn!("Server started at http://{}.", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| APIError::new(e.to_string()))?;

    Ok(())
}
