mod config;
mod dispatch;
mod engine;
mod logging;
mod metrics;
mod pools;
mod procedures;
mod server;
mod shutdown;
mod wire;

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use config::AppConfig;
use dispatch::{Dispatcher, InstrumentedHandler, RuntimeToggles};
use engine::{FixtureQueryEngine, QueryEngine};
use logging::{LogLevel, Logger, LoggerConfig};
use metrics::Metrics;
use pools::WorkerPool;
use procedures::{
    register_definition_files, request_id_procedure, InMemoryProcedureRegistry, ProcedureRegistry,
};
use serde_json::json;
use server::{ConnectionManager, TcpServer};
use shutdown::ShutdownHooks;
use wire::codec::CodecConfig;
use wire::session::auth::{scramble, scramble_with_new_salt, AuthProtocol};

const HASH_PASSWORD_FLAG: &str = "--hash-password";
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

fn main() {
    ensure_posix_or_exit();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.first().map(String::as_str) == Some(HASH_PASSWORD_FLAG) {
        print_password_hash_or_exit(&args[1..]);
        return;
    }

    print_startup_banner();

    let app_config = load_config_or_exit(args);
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let codec_config = CodecConfig::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Wire codec configured",
        Some(json!({
            "format": codec_config.format.as_str(),
            "compression": codec_config.compression.as_str(),
            "max_frame_size_bytes": codec_config.max_frame_size_bytes,
        })),
    );

    let auth = AuthProtocol::from_app_config(&app_config, Arc::clone(&logger)).unwrap_or_else(
        |error| {
            eprintln!("authentication configuration error: {error}");
            process::exit(2);
        },
    );
    let auth = Arc::new(auth);
    logger.log(
        LogLevel::Info,
        Some("main::auth"),
        "Authentication protocol ready",
        Some(json!({
            "enabled": auth.requires_auth(),
            "rechallenge": app_config.auth.rechallenge,
        })),
    );

    let engine = load_engine_or_exit(&app_config, &logger);

    let registry = Arc::new(InMemoryProcedureRegistry::new());
    registry.register(Arc::new(request_id_procedure()));
    let loaded = register_definition_files(
        &app_config.procedures.files,
        registry.as_ref(),
        &engine,
        &logger,
    );
    logger.log(
        LogLevel::Info,
        Some("main::procedures"),
        "Stored procedures registered",
        Some(json!({"from_files": loaded, "total": registry.len()})),
    );

    let metrics = Arc::new(Metrics::new(false));
    let dispatcher = Dispatcher::new(
        Arc::clone(&auth),
        registry,
        engine,
        RuntimeToggles::new(Arc::clone(&logger), Some(Arc::clone(&metrics))),
        Arc::clone(&logger),
    );
    let handler = InstrumentedHandler::new(Arc::new(dispatcher), Arc::clone(&metrics));

    let pool = Arc::new(WorkerPool::from_config(
        app_config.pool,
        Arc::new(handler),
        Arc::clone(&logger),
    ));
    if let Err(error) = pool.activate(app_config.pool.size) {
        eprintln!("worker pool startup error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::pools"),
        "Worker pool activated",
        Some(json!({
            "size": pool.size(),
            "idle_wait_ms": app_config.pool.idle_wait_ms,
        })),
    );

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for persistent connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "host": app_config.server.host,
            "port": app_config.server.port,
        })),
    );

    let mut connections = ConnectionManager::new(
        server,
        Arc::clone(&pool),
        auth,
        codec_config,
        Arc::clone(&logger),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_hooks.is_triggered() {
        match connections.poll_once() {
            Ok(true) => {}
            Ok(false) => {
                shutdown_hooks.idle_for(IDLE_POLL_INTERVAL);
            }
            Err(error) => {
                logger.log(
                    LogLevel::Error,
                    Some("main::server"),
                    "Accept failed",
                    Some(json!({"error": error.to_string()})),
                );
                shutdown_hooks.idle_for(IDLE_POLL_INTERVAL);
            }
        }
    }

    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
        Some(json!({
            "open_connections": connections.connection_count(),
            "pending_requests": pool.total_pending(),
        })),
    );
    connections.close_all();
    if let Err(error) = pool.terminate() {
        logger.log(
            LogLevel::Warn,
            Some("main::shutdown"),
            "Worker pool did not stop cleanly",
            Some(json!({"error": error.to_string()})),
        );
    }
    if metrics.is_enabled() {
        logger.log(
            LogLevel::Info,
            Some("main::metrics"),
            "Final metrics snapshot",
            Some(metrics.snapshot()),
        );
    }
    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn load_config_or_exit(args: Vec<String>) -> AppConfig {
    match AppConfig::load_with_discovery(args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn load_engine_or_exit(app_config: &AppConfig, logger: &Logger) -> Arc<dyn QueryEngine> {
    let fixtures_file = app_config.engine.fixtures_file.trim();
    if fixtures_file.is_empty() {
        logger.warn(
            Some("main::engine"),
            "No engine.fixtures_file configured; every query will report an unknown table",
        );
        return Arc::new(FixtureQueryEngine::new());
    }

    let engine = FixtureQueryEngine::from_file(Path::new(fixtures_file)).unwrap_or_else(|error| {
        eprintln!("query engine startup error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::engine"),
        "Fixture tables loaded",
        Some(json!({"path": fixtures_file, "tables": engine.table_count()})),
    );
    Arc::new(engine)
}

fn print_password_hash_or_exit(args: &[String]) {
    match args {
        [user, password] => println!("{}", scramble_with_new_salt(user, password)),
        [user, password, salt] => println!("{salt}:{}", scramble(user, password, salt)),
        _ => {
            eprintln!("usage: graphwire {HASH_PASSWORD_FLAG} <user> <password> [salt]");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: graphwire is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;30m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                         _              _
   __ _ _ __ __ _ _ __ | |____      __(_)_ __ ___
  / _` | '__/ _` | '_ \| '_ \ \ /\ / /| | '__/ _ \
 | (_| | | | (_| | |_) | | | \ V  V / | | | |  __/
  \__, |_|  \__,_| .__/|_| |_|\_/\_/  |_|_|  \___|
  |___/          |_|                                "#;
    const APP_DESCRIPTION: &str =
        "Graph query server over persistent multiplexed connections.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GRAPHWIRE_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
