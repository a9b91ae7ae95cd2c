use std::{io, process};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use local_llm::{
    AppConfig,
    installer::{Pip, run_setup},
};

fn main() {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            process::exit(1);
        }
    };

    let pip = Pip::new(config.python.clone());
    let result = run_setup(&pip, &mut io::stdout().lock());
    if let Err(err) = result {
        tracing::error!(%err, "setup failed");
        process::exit(1);
    }

    report_linked_runtime();
    println!();
    println!("Next steps:");
    println!("1. Run `local_llm \"hello\"` to download the default model and generate a reply");
    println!("2. Pass --model to try any of the models above");
}

/// What the libtorch linked into these binaries can see, independent of pip.
#[cfg(feature = "tch-backend")]
fn report_linked_runtime() {
    if tch::Cuda::is_available() {
        println!(
            "   Linked libtorch sees {} CUDA device(s)",
            tch::Cuda::device_count()
        );
    } else {
        println!("   Linked libtorch runs on CPU");
    }
}

#[cfg(not(feature = "tch-backend"))]
fn report_linked_runtime() {}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
