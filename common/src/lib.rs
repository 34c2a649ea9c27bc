use owo_colors::OwoColorize;

/// Process-level initialization shared by all gsorch binaries. Resolves the
/// color override once so container logs stay clean unless forced.
pub fn init() {
    if std::env::var_os("NO_COLOR").is_some() {
        owo_colors::set_override(false);
    } else if std::env::var_os("FORCE_COLOR").is_some() {
        owo_colors::set_override(true);
    }
}

const READY_FILE: &str = "/tmp/gsorch-ready";

/// Touches the file the deployment's readiness probe checks for. Called once
/// the controller is wired up and consuming events.
pub fn signal_ready() {
    if let Err(e) = std::fs::write(READY_FILE, b"ok") {
        eprintln!(
            "{}",
            format!("Failed to write readiness file {}: {}", READY_FILE, e).red()
        );
    }
}
