// Terminal Output
// Colored progress lines for builds and checks, all written to stderr

use std::time::Duration;

/// Right-aligned bold label followed by a value, e.g. `   Workspace /var/cache/isoforge`
pub fn status(label: &str, value: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", label, value);
}

pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Build banner
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// A stage began; `progress` is where the job will stand once it completes
pub fn stage_started(stage: &str, progress: u8) {
    eprintln!("\x1b[1;34m  Stage\x1b[0m '{}' (to {}%)", stage, progress);
}

pub fn stage_completed(stage: &str, duration: Duration) {
    eprintln!(
        "\x1b[32m  Stage '{}' OK ({:.2}s)\x1b[0m",
        stage,
        duration.as_secs_f64()
    );
}

/// Informational line from the pipeline, indented under its stage
pub fn build_log(message: &str) {
    eprintln!("\x1b[2m    {}\x1b[0m", message);
}
