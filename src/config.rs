use anyhow::{bail, Result};
use clap::Parser;
use std::env;

/// Environment variable checked when `--key` is not supplied.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Parser)]
#[clap(
    name = "geminichat",
    version = "0.1.0",
    about = "Chat with a Gemini model from the terminal. Type 'exit' to end the chat."
)]
pub struct Config {
    #[clap(
        long("api"),
        value_name = "URL",
        help = "The API endpoint base URL to use.",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub api: String,

    #[clap(
        long("key"),
        value_name = "API_KEY",
        help = "Sets the API key for remote endpoint; if absent, the envvar 'GEMINI_API_KEY' is checked",
        default_value = ""
    )]
    pub api_key: String,

    #[clap(
        long,
        value_name = "MODEL_ID",
        help = "Sets the model to chat with",
        default_value = "gemini-2.5-flash"
    )]
    pub model_id: String,

    #[clap(
        short('s'),
        long,
        value_name = "BOOL",
        help = "Write each reply to stdout as it's received",
        default_value_t = false
    )]
    pub stream: bool,

    #[clap(
        short('n'),
        long,
        value_name = "INT",
        help = "Sets the maximum number of tokens to generate per reply"
    )]
    pub max_tokens: Option<u32>,

    #[clap(long, value_name = "F32", help = "Sets the temperature for sampling")]
    pub temp: Option<f32>,

    #[clap(
        long,
        value_name = "F32",
        help = "Include only the top tokens whose probabilities add up to P when sampling"
    )]
    pub top_p: Option<f32>,

    #[clap(
        long,
        value_name = "INT",
        help = "Include only this amount of top tokens when sampling"
    )]
    pub top_k: Option<u32>,

    #[clap(
        long,
        value_name = "INT",
        help = "The seed to use for the generation (determinism is not guaranteed)"
    )]
    pub seed: Option<i64>,

    #[clap(
        long("system"),
        value_name = "TEXT",
        help = "A system instruction applied to the whole conversation"
    )]
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn from_cli() -> Result<Self> {
        Config::parse().resolve(env::var(API_KEY_ENV).ok())
    }

    /// Fills in the API key from `env_key` when `--key` was not given and
    /// rejects settings the session cannot start with.
    pub fn resolve(mut self, env_key: Option<String>) -> Result<Self> {
        if self.api_key.is_empty() {
            match env_key.filter(|k| !k.is_empty()) {
                Some(key) => self.api_key = key,
                None => bail!(
                    "API key must be provided via --key or {} environment variable",
                    API_KEY_ENV
                ),
            }
        }

        if self.model_id.trim().is_empty() {
            bail!("--model-id must not be empty");
        }

        Ok(self)
    }
}
