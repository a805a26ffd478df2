//! Document command handlers.

use adbrief_core::config::Config;
use adbrief_core::documents::{DocumentStore, JsonFileDocumentStore};
use anyhow::{Context, Result, bail};

fn open(config: &Config) -> Result<JsonFileDocumentStore> {
    let path = config.documents_path();
    JsonFileDocumentStore::open(&path)
        .with_context(|| format!("open documents at {}", path.display()))
}

pub fn show(config: &Config, section: Option<&str>) -> Result<()> {
    let store = open(config)?;
    let json = match section {
        Some(name) => {
            let Some(section) = store.get(name) else {
                bail!("Section '{name}' not found in {}", store.path().display());
            };
            serde_json::to_string_pretty(&section)?
        }
        None => serde_json::to_string_pretty(&store.sections())?,
    };
    println!("{json}");
    Ok(())
}

pub fn set_locked(config: &Config, section: &str, locked: bool) -> Result<()> {
    let store = open(config)?;
    store.set_locked(section, locked)?;
    let state = if locked { "Locked" } else { "Unlocked" };
    println!("{state} section '{section}'");
    Ok(())
}
