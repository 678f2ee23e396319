mod args;
mod dispatch;
mod shell;
mod sink;
mod tokenizer;

use std::process;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use args::Args;
use clap::Parser;
use dispatch::Dispatcher;
use shell::{normalize_line, run_repl, ShellOutput};
use sink::SinkOptions;
use strata_access::{global, ConnFactory, ConnectOption};
use strata_common::config::StrataConfig;
use strata_common::timefmt::TimeLocation;
use strata_common::Context;
use strata_engine::mem::MemEngine;
use tracing::{debug, info};

fn main() {
    if let Err(e) = run() {
        eprintln!("strata: error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => StrataConfig::load(path)
            .with_context(|| format!("Could not load config {}", path.display()))?,
        None => StrataConfig::default(),
    };
    strata_observability::init_tracing(&config.observability.log_filter);
    if !config.observability.metrics_listen_addr.is_empty() {
        strata_observability::init_metrics(&config.observability.metrics_listen_addr)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Could not start metrics exporter")?;
    }

    let base = SinkOptions {
        tz: TimeLocation::parse(&config.watcher.timezone)?,
        ..SinkOptions::default()
    };

    let db = global::init(Arc::new(MemEngine::new()), config).context("Could not start database")?;
    info!("database started");

    let user = args.user.clone();
    let password = args.password.clone();
    let connect: ConnFactory = Arc::new(move || {
        db.connect(
            &Context::background(),
            &[ConnectOption::password(user.as_str(), password.as_str())],
        )
    });
    // Fail early on bad credentials instead of on the first command.
    connect()
        .and_then(|conn| conn.close())
        .context("Could not connect")?;
    let dispatcher = Dispatcher::new(connect);

    let result = match &args.command {
        Some(line) => {
            let mut out = ShellOutput::new(std::io::stdout(), base);
            dispatcher
                .exec_line(&Context::background(), &normalize_line(line), &mut out)
                .map_err(anyhow::Error::from)
        }
        None => run_repl(&dispatcher, base),
    };

    debug!("shutting down");
    drop(dispatcher);
    global::finalize().context("Could not shut down database")?;
    result
}
