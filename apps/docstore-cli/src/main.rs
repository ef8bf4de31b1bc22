//! docstore — command-line access to a Firestore collection.
//!
//! Run:
//! ```bash
//! GOOGLE_APPLICATION_CREDENTIALS=./sa.json \
//!   cargo run -p docstore-cli -- get users 42
//!
//! # against a local emulator
//! FIRESTORE_EMULATOR_HOST=localhost:8080 FIRESTORE_PROJECT_ID=demo \
//!   cargo run -p docstore-cli -- upsert users 42 '{"name": "Ana"}'
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod config;

use std::env;
use std::fs;
use std::process;

use domain::{CallContext, Document, DocumentStore, InitError, StoreError};
use firestore::FirebaseApp;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, PartialEq)]
enum Command {
    Get {
        collection: String,
        document: String,
    },
    Delete {
        collection: String,
        document: String,
    },
    Upsert {
        collection: String,
        document: String,
        payload: Document,
    },
}

fn usage() -> String {
    format!(
        "{} v{}\n\nUsage:\n  docstore get <collection> <document>\n  docstore delete <collection> <document>\n  docstore upsert <collection> <document> <json-object>\n\nNotes:\n  - upsert merges the given fields into the document, creating it if absent.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some((cmd, rest)) = args.split_first() else {
        return Err(usage());
    };
    let address = |rest: &[String]| -> Result<(String, String), String> {
        match rest {
            [c, d, ..] => Ok((c.clone(), d.clone())),
            _ => Err(format!("missing <collection> <document> for {}", cmd)),
        }
    };

    match cmd.as_str() {
        "get" | "delete" => {
            if rest.len() > 2 {
                return Err(format!("unexpected argument: {}", rest[2]));
            }
            let (collection, document) = address(rest)?;
            Ok(if cmd == "get" {
                Command::Get {
                    collection,
                    document,
                }
            } else {
                Command::Delete {
                    collection,
                    document,
                }
            })
        }
        "upsert" => {
            let (collection, document) = address(rest)?;
            let raw = rest
                .get(2)
                .ok_or_else(|| "missing <json-object> for upsert".to_string())?;
            let payload = serde_json::from_str::<Document>(raw)
                .map_err(|e| format!("upsert payload must be a JSON object: {}", e))?;
            Ok(Command::Upsert {
                collection,
                document,
                payload,
            })
        }
        other => Err(format!("unknown command: {}\n\n{}", other, usage())),
    }
}

fn build_app(cfg: &config::Config) -> Result<FirebaseApp, StoreError> {
    let project_id = cfg.project_id.as_deref().unwrap_or("");
    let app = match (&cfg.emulator_host, &cfg.credentials_path) {
        (Some(host), _) => FirebaseApp::with_emulator(project_id, host)?,
        (None, Some(path)) => {
            let key = fs::read(path).map_err(|e| {
                StoreError::Initialization(InitError::with_source(
                    format!("reading credentials {}", path.display()),
                    e,
                ))
            })?;
            FirebaseApp::new(project_id, &key)?
        }
        (None, None) => {
            return Err(StoreError::Initialization("no credentials configured".into()))
        }
    };
    Ok(app.with_database(cfg.database_id.clone()))
}

fn call_context(cfg: &config::Config) -> CallContext {
    match cfg.timeout {
        Some(t) => CallContext::with_timeout(t),
        None => CallContext::new(),
    }
}

fn execute(
    store: &DocumentStore<FirebaseApp>,
    cmd: Command,
) -> Result<Option<Document>, StoreError> {
    match cmd {
        Command::Get {
            collection,
            document,
        } => {
            let doc = store.get(&collection, &document)?;
            Ok(Some(doc))
        }
        Command::Delete {
            collection,
            document,
        } => {
            store.delete(&collection, &document)?;
            info!(%collection, %document, "document deleted");
            Ok(None)
        }
        Command::Upsert {
            collection,
            document,
            payload,
        } => {
            store.upsert(&collection, &document, &payload)?;
            info!(%collection, %document, fields = payload.len(), "document upserted");
            Ok(None)
        }
    }
}

fn run(cfg: &config::Config, args: &[String]) -> Result<(), String> {
    let cmd = parse_args(args)?;
    let app = build_app(cfg).map_err(|e| e.to_string())?;
    let store = DocumentStore::with_context(app, call_context(cfg));

    match execute(&store, cmd) {
        Ok(Some(out)) => {
            let text = serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?;
            println!("{}", text);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) if e.is_not_found() => Err("not found".into()),
        Err(e) => {
            error!(error = %e, "operation failed");
            Err(e.to_string())
        }
    }
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output; logs go to stderr
    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_risky();

    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(msg) = run(&cfg, &args) {
        eprintln!("error: {}", msg);
        process::exit(1);
    }
}
