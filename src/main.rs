//! Purpose: `private-attrs` CLI entry point for inspecting and poking proxy-store session files.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout.
//! Invariants: Errors are emitted as JSON on stderr; exit code comes from `api::to_exit_code`.
//! Invariants: Session mutations go through the session lock, same as library stores.
#![allow(clippy::result_large_err)]
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

use private_attrs::api::{Error, ErrorKind, ListRef, Store, to_exit_code};
use private_attrs::core::session::Session;

#[derive(Parser, Debug)]
#[command(
    name = "private-attrs",
    version,
    about = "Inspect and modify private-attrs proxy-store session files"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print a JSON summary of a session file")]
    Info {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(about = "Print every dict and list held by a session file")]
    Dump {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Pretty-print the JSON output")]
        pretty: bool,
    },
    #[command(about = "Append a JSON value to a shared list in a session file")]
    Append {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Id of the shared list")]
        list: u64,
        #[arg(long = "json", help = "JSON value to append")]
        value: String,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `private-attrs --help`."));
            }
        },
    };

    let output = match cli.command {
        Command::Info { path } => info_json(&path)?,
        Command::Dump { path, pretty } => {
            let state = Session::open(&path)?.snapshot()?;
            let value = serde_json::to_value(&state).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode session state")
                    .with_source(err)
            })?;
            if pretty {
                emit_json_pretty(&value)?;
                return Ok(0);
            }
            value
        }
        Command::Append { path, list, value } => {
            let value: Value = serde_json::from_str(&value).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("--json is not valid JSON")
                    .with_source(err)
            })?;
            let handle = ListRef {
                session: path,
                id: list,
            };
            let store = Store::local();
            let shared = store.open_list(&handle.to_value())?;
            shared.push(value)?;
            let len = shared.len()?;
            json!({ "list": list, "len": len })
        }
    };

    emit_json(&output)?;
    Ok(0)
}

fn info_json(path: &Path) -> Result<Value, Error> {
    let info = Session::open(path)?.info()?;
    Ok(json!({
        "path": info.path.display().to_string(),
        "file_size": info.file_size,
        "body_len": info.body_len,
        "created_at": info.created_at,
        "next_id": info.next_id,
        "dicts": info.dict_count,
        "lists": info.list_count,
    }))
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let text = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn emit_json_pretty(value: &Value) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn emit_error(err: &Error) {
    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "session file is corrupt".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
