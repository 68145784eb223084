use std::path::PathBuf;

use caskdb::{merge, Options, Result};
use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[arg(short, long, default_value = ".", help = "Path to the store directory")]
    path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(name = "get", about = "Get the value of a given key")]
    Get(GetCommand),
    #[command(name = "set", about = "Set the value of a key")]
    Set(SetCommand),
    #[command(name = "rm", about = "Remove a given key")]
    Remove(RemoveCommand),
    #[command(name = "keys", about = "List all keys")]
    Keys,
    #[command(name = "merge", about = "Compact the store's data files")]
    Merge,
}

#[derive(Args, Debug)]
struct GetCommand {
    #[arg(name = "KEY", help = "A string key")]
    key: String,
}

#[derive(Args, Debug)]
struct SetCommand {
    #[arg(name = "KEY", help = "A string key")]
    key: String,
    #[arg(name = "VALUE", help = "A string value")]
    value: String,
}

#[derive(Args, Debug)]
struct RemoveCommand {
    #[arg(name = "KEY", help = "A string key")]
    key: String,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Get(GetCommand { key }) => {
            let store = Options::default().open(cli.path)?;
            if let Some(value) = store.get(key.as_bytes())? {
                println!("{}", String::from_utf8_lossy(&value));
            } else {
                println!("Key not found");
            }
        }
        Command::Set(SetCommand { key, value }) => {
            let store = Options::default().read_write(true).open(cli.path)?;
            store.put(key.as_bytes(), value.as_bytes())?;
            store.close()?;
        }
        Command::Remove(RemoveCommand { key }) => {
            let store = Options::default().read_write(true).open(cli.path)?;
            if store.get(key.as_bytes())?.is_none() {
                store.close()?;
                println!("Key not found");
                std::process::exit(1);
            }
            store.delete(key.as_bytes())?;
            store.close()?;
        }
        Command::Keys => {
            let store = Options::default().open(cli.path)?;
            for key in store.keys() {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Command::Merge => {
            merge(cli.path)?;
        }
    };

    Ok(())
}

#[cfg(debug_assertions)]
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();
}

#[cfg(not(debug_assertions))]
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();
}
