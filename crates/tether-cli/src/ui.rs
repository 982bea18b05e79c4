//! Terminal output helpers.

use colored::Colorize;

/// Print a success message.
pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Print a labeled value.
pub fn kv(label: &str, value: &str) {
    println!("    {:<18} {}", label.dimmed(), value);
}

/// Print a section header.
pub fn section(title: &str) {
    println!("\n  {}", title.bold());
}
