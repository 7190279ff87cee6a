// Terminal output for CLI commands
// Everything goes to stderr except data meant for piping (parse, list)

const BOLD_CYAN: &str = "1;36";
const BOLD_GREEN: &str = "1;32";
const BOLD_RED: &str = "1;31";
const GREEN: &str = "32";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const DIM: &str = "2";

fn paint(style: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", style, text)
}

/// Right-aligned action label followed by a message, e.g. `  Validating path`
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(BOLD_CYAN, &format!("{:>12}", action)), message);
}

/// Final line of a command that succeeded
pub fn success(message: &str) {
    eprintln!("{} {}", paint(BOLD_GREEN, "  \u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "  \u{2717}"), message);
}

/// One passed check within a command
pub fn check(message: &str) {
    eprintln!("{} {}", paint(GREEN, "  \u{2713}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint(YELLOW, "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint(CYAN, "  i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(DIM, message));
}
