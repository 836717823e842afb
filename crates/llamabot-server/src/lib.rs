use std::path::Path;

use anyhow::Result;
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

pub mod channel;
pub mod commands;
pub mod config;
pub mod console;
pub mod driver;
#[cfg(feature = "llama-cpp")]
pub mod llama;

pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}
