//! `warden check` -- validate the configuration.
//!
//! Prints where the config came from, whether each credential resolved,
//! and the effective settings as JSON. Secrets serialize as empty strings.

use std::path::Path;

use chatwarden_types::config::Config;
use comfy_table::{Table, presets::UTF8_FULL};

pub fn run(config: &Config, source: Option<&Path>) -> anyhow::Result<()> {
    match source {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: built-in defaults"),
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["CREDENTIAL", "STATUS"]);
    for (name, present) in credentials(config) {
        table.add_row([name, if present { "present" } else { "missing" }]);
    }
    println!("{table}");

    println!("{}", serde_json::to_string_pretty(config)?);

    if let Err(e) = config.validate() {
        anyhow::bail!("invalid config: {e}");
    }
    println!("config OK");
    Ok(())
}

fn credentials(config: &Config) -> [(&'static str, bool); 4] {
    [
        ("engine api key", config.engine.api_key().is_some()),
        ("twitch access token", config.twitch.access_token().is_some()),
        ("twitch refresh token", config.twitch.refresh_token().is_some()),
        ("twitch client secret", config.twitch.client_secret().is_some()),
    ]
}
