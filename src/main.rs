use std::process;

use clap::{Parser, error::ErrorKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use local_llm::{
    AppConfig, Args, GenerationResult, LoadedModel, Outcome,
    adapter::{run, until_interrupted},
};

#[tokio::main]
async fn main() {
    init_tracing();
    let outcome = until_interrupted(serve(), interrupted()).await;
    println!("{}", outcome.result.to_json_line());
    // The blocking worker may still be running after an interrupt.
    process::exit(outcome.exit_code);
}

async fn serve() -> Outcome {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => return fatal("invalid arguments", err),
    };
    let request = match args.into_request() {
        Ok(request) => request,
        Err(err) => return fatal("invalid request", err),
    };
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => return fatal("invalid configuration", err),
    };

    tracing::info!(model = %request.model_name, device = ?config.device, "starting generation");
    let top_k = config.top_k;
    run(request, top_k, move |model_name| {
        let model = LoadedModel::load(model_name, &config)?;
        tracing::info!(metadata = ?model.metadata(), "model ready");
        Ok(model)
    })
    .await
}

fn fatal(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Outcome {
    tracing::error!(%context, %err, "aborting");
    Outcome {
        result: GenerationResult::failure(err.to_string().trim().to_string()),
        exit_code: 1,
    }
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        // Without a signal handler nothing can interrupt us; wait forever.
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
