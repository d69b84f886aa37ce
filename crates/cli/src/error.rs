use colored::Colorize;

/// Format an error for CLI display with contextual help messages.
pub fn display_error(err: &anyhow::Error) {
    let msg = format!("{err:#}");

    if msg.contains("Connection refused")
        || msg.contains("error sending request")
        || msg.contains("tcp connect error")
    {
        eprintln!("  {} Cannot connect to the Virtuous engine", "ERROR".red().bold());
        eprintln!(
            "        Is the server running? Start it with: {}",
            "virtuous_server".dimmed()
        );
        eprintln!("        Current endpoint: {}", "virtuous config show".dimmed());
    } else if msg.contains("403") || msg.contains("PermissionDenied") {
        eprintln!("  {} Authentication failed", "ERROR".red().bold());
        eprintln!(
            "        Set your API key: {}",
            "virtuous config set api_key <key>".dimmed()
        );
    } else if msg.contains("429") || msg.contains("RateLimited") {
        eprintln!("  {} Rate limit reached", "ERROR".red().bold());
        eprintln!("        Operator actions are limited per minute; try again shortly.");
    } else if msg.contains("409") || msg.contains("Conflict") {
        eprintln!("  {} {}", "REJECTED".yellow().bold(), err);
    } else {
        eprintln!("  {} {}", "ERROR".red().bold(), err);
        for cause in err.chain().skip(1) {
            eprintln!("        {} {cause}", "caused by:".dimmed());
        }
    }
}
