use colored::Colorize;

use crate::group::TunnelGroup;
use crate::tunnel::Tunnel;

/// Print every resolved tunnel and its forwards without starting anything.
pub fn print_plan(group: &TunnelGroup) {
    if group.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        return;
    }

    let w_target = group
        .tunnels()
        .iter()
        .map(|t| t.target().len())
        .max()
        .unwrap_or(0);

    for tunnel in group.tunnels() {
        let row = Row::from(tunnel);
        let target = format!("{:<width$}", row.target, width = w_target);
        println!("  {} {}  {}", "○".dimmed(), target.bold(), row.via.dimmed());
        for fwd in &row.forwards {
            println!("      {}", fwd);
        }
    }
}

/// Plain-text view of a tunnel, colored at print time.
struct Row {
    target: String,
    via: String,
    forwards: Vec<String>,
}

impl From<&Tunnel> for Row {
    fn from(tunnel: &Tunnel) -> Self {
        let params = tunnel.params();
        let mut via = match params.ssh_username() {
            Some(user) => format!("{} as {}", params.ssh_host(), user),
            None => params.ssh_host().to_string(),
        };
        if let Some(key) = params.ssh_private_key_path() {
            via.push_str(&format!(", key {}", key.display()));
        }
        let forwards = params
            .pairs()
            .map(|(local, remote)| format!("{} → {}", local, remote))
            .collect();
        Row {
            target: tunnel.target().to_string(),
            via,
            forwards,
        }
    }
}
