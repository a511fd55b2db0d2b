//! `termwatch list` - configured watchers, one per line.

use termwatch_core::{CooldownMode, Watcher};

use crate::registry::JsonRegistry;

pub fn cmd_list(registry: &JsonRegistry) {
    let data = registry.snapshot();
    if data.watchers.is_empty() {
        println!("no watchers configured");
        return;
    }
    for watcher in &data.watchers {
        println!("{}", format_watcher(watcher));
    }
}

fn format_watcher(w: &Watcher) -> String {
    let state = if w.enabled { "on " } else { "off" };
    let scope = match &w.scope_filter_id {
        Some(filter) => format!("{}:{filter}", w.scope),
        None => w.scope.to_string(),
    };
    let cooldown = match w.cooldown_mode {
        CooldownMode::UntilClear => "until_clear".to_string(),
        CooldownMode::Time => format!("{}ms", w.cooldown_ms),
    };
    format!(
        "{state}  {:<20} {:<24} every {}ms  scope={scope}  cooldown={cooldown}  event={}",
        w.id, w.name, w.poll_interval_ms, w.event_name
    )
}
