//! `warden categories` -- list the violation categories and the escalation
//! policy in effect for each.

use chatwarden_core::escalation::EscalationPolicy;
use chatwarden_types::Category;
use chatwarden_types::config::{Config, FirstOffense};
use comfy_table::{Table, presets::UTF8_FULL};

pub fn run(config: &Config) {
    println!("{}", render(config));
    println!(
        "repeat offenses counted over {} days",
        config.escalation.window_days
    );
}

fn render(config: &Config) -> Table {
    let policy = EscalationPolicy::new(config.escalation.clone());
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["CATEGORY", "ZERO TOLERANCE", "SEVERE", "FIRST OFFENSE", "LADDER"]);

    for category in Category::ALL {
        let p = policy.category(category);
        let ladder = if p.zero_tolerance {
            "ban".to_owned()
        } else {
            let rungs: Vec<String> = policy
                .ladder_for(&p)
                .iter()
                .map(|s| format!("{s}s"))
                .collect();
            format!("{} -> ban", rungs.join(" -> "))
        };
        let first = match (p.zero_tolerance, p.first_offense) {
            (true, _) => "ban",
            (false, FirstOffense::Ignore) => "record only",
            (false, FirstOffense::Warn) => "warn",
            (false, FirstOffense::Timeout) => "timeout",
        };
        table.add_row([
            category.as_str().to_owned(),
            yes_no(p.zero_tolerance).to_owned(),
            yes_no(p.severe).to_owned(),
            first.to_owned(),
            ladder,
        ]);
    }
    table
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}
