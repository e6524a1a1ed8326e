//! # Articulate (aq)
//!
//! A CLI tool that expands inline `???` and `!!!` markers in text files by
//! asking an external AI command-line tool and splicing the answer back
//! underneath the marker.
//!
//! ## Overview
//!
//! `aq` scans text files for lines that end with one of two markers:
//!
//! - `???` (expand): asks for three decomposition questions about the text
//!   in front of the marker.
//! - `!!!` (answer): asks for a short bulleted answer.
//!
//! The marker line, a window of surrounding lines and the enclosing markdown
//! headings are sent to the configured provider CLI (Claude, Gemini or
//! Codex). The response is indented one level below the marker and replaces
//! the marker token. A marker whose AI call fails stays in the file untouched
//! so the next pass can retry it.
//!
//! ## Pipeline
//!
//! ```text
//! Read → Scan Markers → For each marker, last one first:
//!                          - Window + heading context
//!                          - Build prompt pair
//!                          - Call provider (or report, in dry-run)
//!                          - Splice indented answer or keep marker
//!                     → Write back (only if something was applied)
//! ```
//!
//! Markers are processed bottom to top so a splice never shifts the line
//! index of a marker that has not been processed yet.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (file not found, provider missing, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: markers found |
//! | 4 | Parse error (invalid UTF-8 or binary input) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use wait_timeout::ChildExt;

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, provider missing, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: markers found
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Default)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Marker requesting three decomposition questions
const MARKER_EXPAND: &str = "???";
/// Marker requesting a concise bulleted answer
const MARKER_ANSWER: &str = "!!!";

/// Lines of context taken above and below a marker
const CONTEXT_WINDOW: usize = 10;
/// Indent unit used when a file has no indented lines
const DEFAULT_INDENT_UNIT: &str = "  ";

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_GLOB: &str = "*.md";
const DEFAULT_BACKUP_EXT: &str = ".bak";
const PID_FILE_NAME: &str = "aq.pid";

/// Extra time allowed for a provider's output pipes to close after it exits
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Characters of a prompt shown in dry-run previews
const PREVIEW_CHARS: usize = 80;

fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join(PID_FILE_NAME)
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// External AI command-line backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Provider {
    /// Claude Code CLI (prompt on stdin)
    Claude,
    /// Gemini CLI (prompt as argument)
    Gemini,
    /// Codex CLI (`codex exec`)
    Codex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Articulate: expands ??? and !!! markers in text files with an AI CLI
#[derive(Parser, Debug)]
#[command(
    name = "aq",
    version,
    about,
    long_about = None,
    after_help = "MARKERS:\n  text ???   Ask for 3 questions that decompose the text\n  text !!!   Ask for a concise bulleted answer\n\nEXIT CODES:\n  0  Success\n  1  General error (file not found, provider missing, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: markers found\n  4  Parse error (invalid UTF-8 or binary input)\n"
)]
struct Args {
    /// Files or directories to process once. Directories are searched
    /// recursively for files matching --glob.
    #[arg(value_name = "PATH")]
    inputs: Vec<PathBuf>,

    /// Path to config file (default: search for .aqrc)
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config", global = true)]
    no_config: bool,

    /// Show what would be sent without calling the provider or writing files
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Force the response language (e.g. "ja", "English")
    #[arg(long, value_name = "LANG", global = true)]
    lang: Option<String>,

    /// Extra instruction appended to every system prompt
    #[arg(long = "prompt", value_name = "TEXT", global = true)]
    custom_prompt: Option<String>,

    /// AI provider CLI to call [default: claude]
    #[arg(short = 'p', long, value_enum, global = true)]
    provider: Option<Provider>,

    /// Explicit path to the provider binary (skips discovery)
    #[arg(long = "ai-bin", value_name = "FILE", global = true)]
    ai_bin: Option<PathBuf>,

    /// Timeout for a single AI call in seconds [default: 120]
    #[arg(short = 't', long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Poll interval for watch mode in seconds [default: 1.0]
    #[arg(long, value_name = "SECS", global = true)]
    interval: Option<f64>,

    /// Glob pattern(s) for file names in directories (comma-separated) [default: *.md]
    #[arg(short = 'g', long, global = true)]
    glob: Option<String>,

    /// Allow nested follow-up questions under each ??? axis
    #[arg(long, global = true)]
    structure: bool,

    /// Verbose output showing processing details
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Print a JSON summary of the run to stdout
    #[arg(long, global = true)]
    json: bool,

    /// Print a unified diff of every rewritten file
    #[arg(short = 'd', long, global = true)]
    diff: bool,

    /// Create a backup copy before rewriting a file
    #[arg(long, global = true)]
    backup: bool,

    /// Extension for backup files [default: .bak]
    #[arg(long, value_name = "EXT", global = true)]
    backup_ext: Option<String>,

    /// Run-marker file holding the watcher PID [default: $TMPDIR/aq.pid]
    #[arg(long = "pid-file", value_name = "FILE", global = true)]
    pid_file: Option<PathBuf>,

    /// Subcommand (watch mode, watcher control, config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll a file or directory and process markers whenever a file changes
    Watch {
        /// File or directory to watch
        #[arg(value_name = "TARGET")]
        target: PathBuf,
    },
    /// Stop a running watcher
    Stop,
    /// Report whether a watcher is running
    Status,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .aqrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args and the config file.
///
/// Immutable for the duration of a run; every pipeline stage borrows it.
#[derive(Debug, Clone)]
struct Config {
    dry_run: bool,
    lang: Option<String>,
    custom_prompt: Option<String>,
    provider: Provider,
    ai_bin: Option<PathBuf>,
    timeout_secs: u64,
    poll_interval_secs: f64,
    glob: String,
    structure: bool,
    verbose: bool,
    color: ColorMode,
    json: bool,
    diff: bool,
    backup: bool,
    backup_ext: String,
    pid_file: PathBuf,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            dry_run: args.dry_run,
            lang: args.lang.clone(),
            custom_prompt: args.custom_prompt.clone(),
            provider: args.provider.unwrap_or(Provider::Claude),
            ai_bin: args.ai_bin.clone(),
            timeout_secs: args.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            poll_interval_secs: args.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            glob: args.glob.clone().unwrap_or_else(|| DEFAULT_GLOB.to_string()),
            structure: args.structure,
            verbose: args.verbose,
            color: args.color,
            json: args.json,
            diff: args.diff,
            backup: args.backup,
            backup_ext: args
                .backup_ext
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKUP_EXT.to_string()),
            pid_file: args.pid_file.clone().unwrap_or_else(default_pid_file),
        }
    }
}

impl Config {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn warning(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Statistics collected across the files of one run
#[derive(Default, Clone)]
struct Stats {
    /// Files read and scanned
    files_processed: usize,
    /// Files rewritten on disk
    files_changed: usize,
    /// Markers detected
    markers_found: usize,
    /// Markers replaced (or reported, in dry-run)
    markers_applied: usize,
    /// Markers kept because the AI call failed
    markers_failed: usize,
    /// Wall-clock time for the run
    elapsed: Duration,
}

impl Stats {
    fn record(&mut self, outcome: &FileOutcome) {
        self.files_processed += 1;
        if outcome.written {
            self.files_changed += 1;
        }
        self.markers_found += outcome.markers_found;
        self.markers_applied += outcome.applied;
        self.markers_failed += outcome.failed;
    }
}

/// Print a statistics summary to stderr
fn print_stats_summary(stats: &Stats, errors: usize, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} processed, {} rewritten, {} unchanged",
        styles.stat_label("Files:"),
        stats.files_processed,
        stats.files_changed,
        stats.files_processed.saturating_sub(stats.files_changed)
    ));

    console.print(&format!(
        "  {} {} found, {} applied, {} preserved after failure",
        styles.stat_label("Markers:"),
        stats.markers_found,
        stats.markers_applied,
        stats.markers_failed
    ));

    console.print(&format!(
        "  {} {:.2}s",
        styles.stat_label("Time:"),
        stats.elapsed.as_secs_f64()
    ));

    if errors > 0 {
        console.print(&format!(
            "  {} {}",
            styles.wrap("bold red", "Errors:"),
            errors
        ));
    }

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".aqrc", ".aqrc.toml", "aqrc.toml"];

/// Configuration loaded from a .aqrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// AI provider: claude, gemini, codex
    provider: Option<Provider>,
    /// Explicit provider binary
    ai_bin: Option<PathBuf>,
    /// Response language override
    lang: Option<String>,
    /// Extra system prompt instruction
    prompt: Option<String>,
    /// AI call timeout in seconds
    timeout: Option<u64>,
    /// Watch poll interval in seconds
    interval: Option<f64>,
    /// Glob patterns for directory inputs
    glob: Option<String>,
    /// Nested follow-up questions for ??? markers
    structure: Option<bool>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Create backup before rewriting
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
    /// Watcher run-marker file
    pid_file: Option<PathBuf>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory where the config file search starts: the first path the
/// command operates on, or the current directory.
fn config_search_start(args: &Args) -> PathBuf {
    let first = match &args.command {
        Some(Commands::Watch { target }) => Some(target),
        _ => args.inputs.first(),
    };

    first
        .and_then(|p| {
            if p.is_dir() {
                Some(p.clone())
            } else {
                p.parent()
                    .filter(|parent| !parent.as_os_str().is_empty())
                    .map(|parent| parent.to_path_buf())
            }
        })
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        find_config_file(&config_search_start(args))
    };

    let Some(path) = config_path else {
        return Ok(config);
    };
    let file_config = load_config_file(&path)?;

    if args.provider.is_none() {
        if let Some(provider) = file_config.provider {
            config.provider = provider;
        }
    }

    if args.ai_bin.is_none() {
        config.ai_bin = file_config.ai_bin;
    }

    if args.lang.is_none() {
        config.lang = file_config.lang;
    }

    if args.custom_prompt.is_none() {
        config.custom_prompt = file_config.prompt;
    }

    if args.timeout.is_none() {
        if let Some(timeout) = file_config.timeout {
            config.timeout_secs = timeout;
        }
    }

    if args.interval.is_none() {
        if let Some(interval) = file_config.interval {
            config.poll_interval_secs = interval;
        }
    }

    if args.glob.is_none() {
        if let Some(glob) = file_config.glob {
            config.glob = glob;
        }
    }

    if !args.structure {
        if let Some(s) = file_config.structure {
            config.structure = s;
        }
    }

    if !args.verbose {
        if let Some(v) = file_config.verbose {
            config.verbose = v;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !args.backup {
        if let Some(b) = file_config.backup {
            config.backup = b;
        }
    }

    if args.backup_ext.is_none() {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }

    if args.pid_file.is_none() {
        if let Some(pid_file) = file_config.pid_file {
            config.pid_file = pid_file;
        }
    }

    validate_config(&config)?;
    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .aqrc - aq configuration file

# AI provider CLI: claude | gemini | codex
provider = "claude"

# Explicit provider binary (default: discovered automatically)
# ai_bin = "/usr/local/bin/claude"

# Seconds allowed for one AI call
timeout = 120

# Response language override and extra system instruction
# lang = "English"
# prompt = "Keep every bullet under 15 words."

# Nested follow-up questions under each ??? axis
# structure = false

# File selection for directories and watch mode (comma-separated)
# glob = "*.md"

# Watch mode poll interval in seconds
# interval = 1.0
# pid_file = "/tmp/aq.pid"

# Output options
# verbose = false
# color = "auto"

# Backup options
# backup = false
# backup_ext = ".bak"
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction, args: &Args) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".aqrc")
            } else {
                PathBuf::from(".aqrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let config = create_config(args)?;

            eprintln!("Effective configuration:");
            eprintln!("  provider: {}", config.provider.command());
            if let Some(ref bin) = config.ai_bin {
                eprintln!("  ai_bin: {}", bin.display());
            }
            eprintln!("  lang: {}", config.lang.as_deref().unwrap_or("(input language)"));
            if let Some(ref prompt) = config.custom_prompt {
                eprintln!("  prompt: {}", prompt);
            }
            eprintln!("  timeout: {}s", config.timeout_secs);
            eprintln!("  interval: {}s", config.poll_interval_secs);
            eprintln!("  glob: {}", config.glob);
            eprintln!("  structure: {}", config.structure);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  backup: {}", config.backup);
            eprintln!("  backup_ext: {}", config.backup_ext);
            eprintln!("  pid_file: {}", config.pid_file.display());

            if !args.no_config {
                if let Some(path) = find_config_file(&config_search_start(args)) {
                    eprintln!();
                    eprintln!("Config file: {}", path.display());
                }
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            match find_config_file(&start_dir) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => anyhow::bail!("No config file found"),
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.timeout == Some(0) {
        return Err(ArgError("--timeout must be at least 1 second".to_string()).into());
    }

    if let Some(interval) = args.interval {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ArgError("--interval must be a positive number of seconds".to_string()).into());
        }
    }

    if let Some(ref bin) = args.ai_bin {
        if !bin.is_file() {
            return Err(ArgError(format!("--ai-bin does not exist: {}", bin.display())).into());
        }
    }

    Ok(())
}

/// Validate values that may also come from a config file
fn validate_config(config: &Config) -> Result<()> {
    if config.timeout_secs == 0 {
        return Err(ArgError("timeout must be at least 1 second".to_string()).into());
    }

    if !config.poll_interval_secs.is_finite() || config.poll_interval_secs <= 0.0 {
        return Err(ArgError("interval must be a positive number of seconds".to_string()).into());
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Marker Scanning
// ─────────────────────────────────────────────────────────────────────────────

/// Which request a marker makes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    /// `???`: decompose the concept into three questions
    Expand,
    /// `!!!`: answer the question in a few bullets
    Answer,
}

impl MarkerKind {
    fn token(self) -> &'static str {
        match self {
            Self::Expand => MARKER_EXPAND,
            Self::Answer => MARKER_ANSWER,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Expand => "EXPAND",
            Self::Answer => "ANSWER",
        }
    }
}

/// A detected marker in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MarkerHit {
    /// 0-based line index
    line_idx: usize,
    /// Leading spaces/tabs of the marker line, verbatim
    indent: String,
    /// Text in front of the marker token, trimmed
    content: String,
    kind: MarkerKind,
}

/// Match a single line against the marker grammar.
///
/// A marker line is: optional `[ \t]` indent, any content, optional
/// whitespace, then `???` or `!!!` as the last non-whitespace text. The
/// token that physically ends the line decides the kind, so `a !!!???` is an
/// expand marker whose content is `a !!!`.
fn match_marker_line(line: &str) -> Option<(&str, &str, MarkerKind)> {
    let body = line.trim_end();

    let kind = if body.ends_with(MARKER_EXPAND) {
        MarkerKind::Expand
    } else if body.ends_with(MARKER_ANSWER) {
        MarkerKind::Answer
    } else {
        return None;
    };

    // Both tokens are three ASCII bytes, so this is a char boundary.
    let before = &body[..body.len() - kind.token().len()];
    let indent = detect_indent(before);
    let content = before[indent.len()..].trim();

    Some((indent, content, kind))
}

/// Scan all lines for markers, in ascending line order.
fn scan_markers(lines: &[String]) -> Vec<MarkerHit> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(line_idx, line)| {
            match_marker_line(line).map(|(indent, content, kind)| MarkerHit {
                line_idx,
                indent: indent.to_string(),
                content: content.to_string(),
                kind,
            })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Indentation
// ─────────────────────────────────────────────────────────────────────────────

/// Leading spaces and tabs of a line
fn detect_indent(line: &str) -> &str {
    let rest = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - rest.len()]
}

/// Detect the indentation unit of a file: the shortest non-empty indent of a
/// non-blank line (first one wins on ties), or two spaces.
fn detect_indent_unit(lines: &[String]) -> String {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| detect_indent(line))
        .filter(|indent| !indent.is_empty())
        .min_by_key(|indent| indent.chars().count())
        .unwrap_or(DEFAULT_INDENT_UNIT)
        .to_string()
}

/// Indent every non-empty line of `text` one level below `base_indent`.
/// Whitespace-only lines become empty.
fn indent_block(text: &str, base_indent: &str, indent_unit: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}{}", base_indent, indent_unit, line)
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Text surrounding a marker: up to `window` lines above, the marker line
/// wrapped in `>>> <<<`, and up to `window` lines below. Sections are
/// separated by a blank line; empty sections are left out.
fn extract_window(lines: &[String], idx: usize, window: usize) -> String {
    let start = idx.saturating_sub(window);
    let end = (idx + window + 1).min(lines.len());

    let mut sections = Vec::with_capacity(3);
    if start < idx {
        sections.push(lines[start..idx].join("\n"));
    }
    sections.push(format!(">>> {} <<<", lines[idx].trim_end()));
    if idx + 1 < end {
        sections.push(lines[idx + 1..end].join("\n"));
    }

    sections.join("\n\n")
}

/// Enclosing markdown headings above `idx`, outermost first.
///
/// Walks upward collecting every line that starts with `#` and stops after
/// the first top-level (`# `) heading.
fn extract_headings(lines: &[String], idx: usize) -> String {
    let mut headings = Vec::new();

    for line in lines[..idx].iter().rev() {
        let stripped = line.trim();
        if !stripped.starts_with('#') {
            continue;
        }
        headings.push(stripped);
        if stripped.starts_with("# ") {
            break;
        }
    }

    headings.reverse();
    headings.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

const SYSTEM_EXPAND: &str = "\
You are a thought-structuring assistant. Generate exactly 3 questions that decompose the given concept along 3 axes:
1. [Distinction] How does it differ from similar concepts?
2. [Structure] What are its internal components and stages?
3. [Relation] What are its external dependencies and connections?

Rules:
- Output exactly 3 lines
- Each line: - [Axis] Specific question
- Match the input language
- No preamble, no summary, no explanation
";

const STRUCTURE_RULE: &str = "\
- Exception: under each axis line you may nest up to 2 follow-up questions, indented by two spaces and starting with -
";

const SYSTEM_ANSWER: &str = "\
Provide a concise, practical answer.
- 2 to 5 bullet points
- Each line starts with -
- Match the input language
- No preamble, no summary, no explanation
";

/// System and user text for one AI call
#[derive(Debug, Clone, PartialEq, Eq)]
struct PromptPair {
    system: String,
    user: String,
}

/// Per-run prompt options taken from the config
#[derive(Debug, Clone, Copy, Default)]
struct PromptOptions<'a> {
    lang: Option<&'a str>,
    custom: Option<&'a str>,
    structure: bool,
}

impl<'a> From<&'a Config> for PromptOptions<'a> {
    fn from(config: &'a Config) -> Self {
        Self {
            lang: config.lang.as_deref().filter(|s| !s.is_empty()),
            custom: config.custom_prompt.as_deref().filter(|s| !s.is_empty()),
            structure: config.structure,
        }
    }
}

fn finish_system_prompt(mut system: String, options: &PromptOptions<'_>) -> String {
    if let Some(lang) = options.lang {
        system.push_str(&format!("\nRespond in {}.", lang));
    }
    if let Some(custom) = options.custom {
        system.push('\n');
        system.push_str(custom);
    }
    system
}

fn build_user_prompt(headings: &str, context: &str, label: &str, content: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    if !headings.is_empty() {
        parts.push(format!("Section context:\n{}", headings));
    }
    if !context.is_empty() {
        parts.push(format!("Surrounding context:\n{}", context));
    }
    parts.push(format!("{}:\n{}", label, content));
    parts.join("\n\n")
}

/// Build the prompt pair for a `???` marker
fn build_expand_prompt(
    content: &str,
    context: &str,
    headings: &str,
    options: &PromptOptions<'_>,
) -> PromptPair {
    let mut system = SYSTEM_EXPAND.to_string();
    if options.structure {
        system.push_str(STRUCTURE_RULE);
    }

    PromptPair {
        system: finish_system_prompt(system, options),
        user: build_user_prompt(headings, context, "Concept to elaborate", content),
    }
}

/// Build the prompt pair for a `!!!` marker
fn build_answer_prompt(
    content: &str,
    context: &str,
    headings: &str,
    options: &PromptOptions<'_>,
) -> PromptPair {
    PromptPair {
        system: finish_system_prompt(SYSTEM_ANSWER.to_string(), options),
        user: build_user_prompt(headings, context, "Question/topic to answer", content),
    }
}

/// Context + prompt for one marker, read from the current buffer
fn build_marker_prompt(lines: &[String], hit: &MarkerHit, config: &Config) -> PromptPair {
    let context = extract_window(lines, hit.line_idx, CONTEXT_WINDOW);
    let headings = extract_headings(lines, hit.line_idx);
    let options = PromptOptions::from(config);

    match hit.kind {
        MarkerKind::Expand => build_expand_prompt(&hit.content, &context, &headings, &options),
        MarkerKind::Answer => build_answer_prompt(&hit.content, &context, &headings, &options),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AI Client
// ─────────────────────────────────────────────────────────────────────────────

/// A failed AI call. Callers log the reason and keep the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AiFailure(String);

impl AiFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for AiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AiFailure {}

/// Something that turns a prompt pair into response text.
trait AiClient {
    fn call(&self, system: &str, user: &str, timeout: Duration) -> Result<String, AiFailure>;
}

/// How to launch a provider for one prompt
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    args: Vec<String>,
    /// Payload written to the child's stdin; `None` closes stdin
    stdin: Option<String>,
    /// Environment variables removed from the child
    env_remove: Vec<OsString>,
}

impl Provider {
    fn display_name(self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Gemini => "Gemini",
            Self::Codex => "Codex",
        }
    }

    fn command(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
        }
    }

    fn install_url(self) -> &'static str {
        match self {
            Self::Claude => "https://docs.anthropic.com/en/docs/claude-code",
            Self::Gemini => "https://github.com/google-gemini/gemini-cli",
            Self::Codex => "https://github.com/openai/codex",
        }
    }

    /// Well-known install locations checked before `PATH`
    fn candidate_paths(self, home: Option<&Path>) -> Vec<PathBuf> {
        match self {
            Self::Claude => {
                let mut paths = Vec::with_capacity(2);
                if let Some(home) = home {
                    paths.push(home.join(".local/bin/claude"));
                }
                paths.push(PathBuf::from("/usr/local/bin/claude"));
                paths
            }
            Self::Gemini | Self::Codex => Vec::new(),
        }
    }

    /// Locate the provider binary: known paths first, then `PATH`.
    fn discover(self, home: Option<&Path>, path_var: Option<&OsStr>) -> Option<PathBuf> {
        self.candidate_paths(home)
            .into_iter()
            .find(|path| is_executable(path))
            .or_else(|| find_in_path(self.command(), path_var))
    }

    /// Arguments, stdin payload and environment edits for one call.
    ///
    /// Claude reads the prompt from stdin and must not inherit `CLAUDE*`
    /// variables, otherwise it behaves like a nested session.
    fn build_invocation<I>(self, prompt: &str, env_keys: I) -> Invocation
    where
        I: IntoIterator<Item = OsString>,
    {
        match self {
            Self::Claude => Invocation {
                args: ["-p", "--output-format", "text", "--max-turns", "1"]
                    .map(String::from)
                    .to_vec(),
                stdin: Some(prompt.to_string()),
                env_remove: env_keys
                    .into_iter()
                    .filter(|key| key.to_str().is_some_and(|k| k.starts_with("CLAUDE")))
                    .collect(),
            },
            Self::Gemini => Invocation {
                args: vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "text".to_string(),
                ],
                stdin: None,
                env_remove: Vec::new(),
            },
            Self::Codex => Invocation {
                args: vec!["exec".to_string(), prompt.to_string()],
                stdin: None,
                env_remove: Vec::new(),
            },
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn find_in_path(command: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let file_name = format!("{}{}", command, std::env::consts::EXE_SUFFIX);
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| is_executable(candidate))
}

/// Single prompt text sent to every provider
fn combine_prompt(system: &str, user: &str) -> String {
    format!(
        "[System Instructions]\n{}\n\n[User Request]\n{}",
        system, user
    )
}

/// AI client backed by a provider's command-line tool
#[derive(Debug, Clone)]
struct CliClient {
    provider: Provider,
    binary: PathBuf,
}

impl CliClient {
    /// Resolve the provider binary. A missing binary is a configuration
    /// error and ends the run.
    fn discover(provider: Provider, override_bin: Option<&Path>) -> Result<Self> {
        if let Some(path) = override_bin {
            if !path.is_file() {
                return Err(ArgError(format!("AI binary not found: {}", path.display())).into());
            }
            return Ok(Self {
                provider,
                binary: path.to_path_buf(),
            });
        }

        let home = dirs::home_dir();
        let path_var = std::env::var_os("PATH");
        let binary = provider
            .discover(home.as_deref(), path_var.as_deref())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} CLI not found. Install: {}",
                    provider.display_name(),
                    provider.install_url()
                )
            })?;

        Ok(Self { provider, binary })
    }
}

impl AiClient for CliClient {
    fn call(&self, system: &str, user: &str, timeout: Duration) -> Result<String, AiFailure> {
        let prompt = combine_prompt(system, user);
        let invocation = self
            .provider
            .build_invocation(&prompt, std::env::vars_os().map(|(key, _)| key));
        run_invocation(
            &self.binary,
            invocation,
            timeout,
            self.provider.display_name(),
        )
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Wait for a drained pipe until `deadline`. `None` means the pipe is still
/// open, e.g. a background process inherited it.
fn collect_pipe(rx: Option<mpsc::Receiver<Vec<u8>>>, deadline: Instant) -> Option<String> {
    let rx = rx?;
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(PIPE_GRACE);
    rx.recv_timeout(wait)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Run one provider invocation with a wall-clock limit.
///
/// The child is killed and reaped when the limit expires. Pipes are drained
/// on helper threads so a chatty child cannot block on a full pipe, and
/// reading them is bounded by the same deadline so a background process
/// that inherited stdout cannot hold the call open.
fn run_invocation(
    binary: &Path,
    invocation: Invocation,
    timeout: Duration,
    name: &str,
) -> Result<String, AiFailure> {
    let mut command = Command::new(binary);
    command
        .args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in &invocation.env_remove {
        command.env_remove(key);
    }

    let mut child = command
        .spawn()
        .map_err(|err| AiFailure::new(format!("{} call failed: {}", name, err)))?;

    // The writer is detached: a descendant may hold stdin open without
    // reading it.
    if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), invocation.stdin) {
        thread::spawn(move || {
            let _ = pipe.write_all(payload.as_bytes());
        });
    }
    let stdout = child.stdout.take().map(drain_pipe);
    let stderr = child.stderr.take().map(drain_pipe);
    let deadline = Instant::now() + timeout;

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AiFailure::new(format!(
                "{} timed out after {}s",
                name,
                timeout.as_secs()
            )));
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AiFailure::new(format!("{} call failed: {}", name, err)));
        }
    };

    let Some(stdout) = collect_pipe(stdout, deadline) else {
        return Err(AiFailure::new(format!(
            "{} timed out after {}s (output still open after exit)",
            name,
            timeout.as_secs()
        )));
    };
    let stderr = collect_pipe(stderr, deadline).unwrap_or_default();

    if !status.success() {
        let stderr = stderr.trim();
        return Err(AiFailure::new(if stderr.is_empty() {
            format!("{} returned non-zero ({})", name, describe_exit(status))
        } else {
            format!("{} error: {}", name, stderr)
        }));
    }

    Ok(stdout.trim().to_string())
}

/// Resolve the AI client for a run. Dry runs never call the provider, so
/// they do not need one installed.
fn resolve_client(config: &Config) -> Result<Option<CliClient>> {
    if config.dry_run {
        return Ok(None);
    }
    CliClient::discover(config.provider, config.ai_bin.as_deref()).map(Some)
}

// ─────────────────────────────────────────────────────────────────────────────
// File Processing
// ─────────────────────────────────────────────────────────────────────────────

/// True when any readable file contains at least one marker. Unreadable
/// files are skipped here; processing reports their errors.
fn any_file_has_markers(files: &[PathBuf]) -> bool {
    files.iter().any(|path| {
        read_file(path)
            .map(|lines| lines.iter().any(|line| match_marker_line(line).is_some()))
            .unwrap_or(false)
    })
}

/// Result of processing one file
#[derive(Debug)]
struct FileOutcome {
    filename: String,
    original: Vec<String>,
    rewritten: Vec<String>,
    markers_found: usize,
    /// Markers replaced; in dry-run, markers that would be sent
    applied: usize,
    /// Markers left in place because the AI call failed
    failed: usize,
    written: bool,
}

/// Applied/failed counts for one buffer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MarkerTally {
    applied: usize,
    failed: usize,
}

fn content_label(content: &str) -> &str {
    if content.is_empty() {
        "(no content)"
    } else {
        content
    }
}

/// Single-line preview of at most `max_chars` characters
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Replace the marker line with the content line (if any) and the response
/// indented one level below the marker.
fn splice_response(lines: &mut Vec<String>, hit: &MarkerHit, response: &str, indent_unit: &str) {
    let block = indent_block(response, &hit.indent, indent_unit);

    let mut replacement = Vec::with_capacity(block.len() + 1);
    if !hit.content.is_empty() {
        replacement.push(format!("{}{}", hit.indent, hit.content));
    }
    replacement.extend(block);

    lines.splice(hit.line_idx..=hit.line_idx, replacement);
}

/// Resolve every hit in `lines`, last one first.
///
/// A splice can change the number of lines, but only at or after the hit
/// being processed, so the indices of the remaining (earlier) hits stay
/// valid. A failed call leaves the marker line untouched.
fn expand_markers(
    lines: &mut Vec<String>,
    hits: &[MarkerHit],
    indent_unit: &str,
    config: &Config,
    client: Option<&dyn AiClient>,
) -> MarkerTally {
    let mut tally = MarkerTally::default();

    for hit in hits.iter().rev() {
        let token = hit.kind.token();
        let line_no = hit.line_idx + 1;
        eprintln!("  {} L{}: {}", token, line_no, content_label(&hit.content));

        let prompt = build_marker_prompt(lines, hit, config);

        if config.dry_run {
            eprintln!(
                "  dry-run L{}: {} '{}'",
                line_no,
                hit.kind.label(),
                hit.content
            );
            eprintln!("  dry-run system: {}", preview(&prompt.system, PREVIEW_CHARS));
            eprintln!("  dry-run user: {}", preview(&prompt.user, PREVIEW_CHARS));
            tally.applied += 1;
            continue;
        }

        let response = match client {
            Some(client) => client.call(&prompt.system, &prompt.user, config.timeout()),
            None => Err(AiFailure::new("no AI provider available")),
        };

        match response {
            Ok(text) => {
                splice_response(lines, hit, &text, indent_unit);
                tally.applied += 1;
            }
            Err(failure) => {
                eprintln!("  {} L{}: {}", token, line_no, failure);
                eprintln!("  {} failed, marker preserved for retry", token);
                tally.failed += 1;
            }
        }
    }

    tally
}

fn short_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Process all markers in a file and write it back if any was applied.
///
/// `FileOutcome::applied` is the number of markers successfully processed.
fn process_file(
    path: &Path,
    config: &Config,
    client: Option<&dyn AiClient>,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<FileOutcome> {
    let original = read_file(path)?;
    let name = short_name(path);
    let hits = scan_markers(&original);

    let mut outcome = FileOutcome {
        filename: path.display().to_string(),
        rewritten: Vec::new(),
        markers_found: hits.len(),
        applied: 0,
        failed: 0,
        written: false,
        original,
    };

    if hits.is_empty() {
        if config.verbose && !config.json {
            console.print(&styles.dim(format!("{}: no markers", name)));
        }
        outcome.rewritten = outcome.original.clone();
        return Ok(outcome);
    }

    // stdout is reserved for the JSON document in --json mode.
    let announce = !config.json;
    if announce {
        console.print(&styles.header(format!(
            "{}: {} marker(s) found, powered by {}",
            name,
            hits.len(),
            config.provider.display_name()
        )));
    }

    let mut lines = outcome.original.clone();
    let indent_unit = detect_indent_unit(&lines);
    if config.verbose && announce {
        console.print(&styles.dim(format!(
            "  indent unit: {:?}, context window: {} lines",
            indent_unit, CONTEXT_WINDOW
        )));
    }

    let tally = expand_markers(&mut lines, &hits, &indent_unit, config, client);
    outcome.applied = tally.applied;
    outcome.failed = tally.failed;

    if tally.applied > 0 && !config.dry_run {
        if config.backup {
            let backup_path = create_backup(path, &config.backup_ext)?;
            if config.verbose && announce {
                console.print(&styles.dim(format!("Created backup: {}", backup_path.display())));
            }
        }

        write_lines(path, &lines)?;
        outcome.written = true;
        if announce {
            console.print(&styles.success(format!(
                "{}: {} marker(s) processed",
                name, tally.applied
            )));
        }
    }

    outcome.rewritten = lines;
    Ok(outcome)
}

// ─────────────────────────────────────────────────────────────────────────────
// File Discovery
// ─────────────────────────────────────────────────────────────────────────────

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    builder
        .build()
        .map_err(|err| ArgError(format!("Invalid glob set: {}", err)).into())
}

/// Files selected by `target`: a file is always included as-is; a directory
/// is walked recursively, skipping hidden entries, keeping files whose base
/// name matches `globs`.
fn collect_files(target: &Path, globs: &GlobSet, verbose: bool) -> Vec<PathBuf> {
    if !target.is_dir() {
        return vec![target.to_path_buf()];
    }

    let mut files = BTreeSet::new();
    let mut walker = WalkBuilder::new(target);
    walker.standard_filters(false);
    walker.hidden(true);

    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if verbose {
                    eprintln!("Warning: {}", err);
                }
                continue;
            }
        };

        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        if let Some(name) = entry_path.file_name() {
            if globs.is_match(name) {
                files.insert(entry_path.to_path_buf());
            }
        }
    }

    files.into_iter().collect()
}

fn collect_inputs(paths: &[PathBuf], globs: &GlobSet, verbose: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut seen = BTreeSet::new();

    for path in paths {
        for file in collect_files(path, globs, verbose) {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }

    files
}

// ─────────────────────────────────────────────────────────────────────────────
// File I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a backup of the file by appending the extension to the filename.
/// For example: "notes.md" with extension ".bak" becomes "notes.md.bak"
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read content from a file path and return lines
fn read_file(path: &Path) -> Result<Vec<String>> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let source_label = path.display().to_string();
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    parse_bytes_to_lines(bytes, &source_label)
}

/// Convert raw bytes to lines, checking for binary content and valid UTF-8
fn parse_bytes_to_lines(bytes: Vec<u8>, source_label: &str) -> Result<Vec<String>> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    let content = String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail)
    })?;

    Ok(content.lines().map(String::from).collect())
}

/// Overwrite the file with `lines` joined by `\n` plus a trailing newline
fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut output = lines.join("\n");
    output.push('\n');
    fs::write(path, output).with_context(|| format!("Failed to write to file: {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Last seen modification time per watched file.
#[derive(Debug, Default)]
struct PollState {
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl PollState {
    /// Record `mtime` for `path` and report whether the file changed.
    ///
    /// The first observation of a file only records it, so starting a
    /// watcher never reprocesses everything.
    fn observe(&mut self, path: &Path, mtime: SystemTime) -> bool {
        match self.mtimes.insert(path.to_path_buf(), mtime) {
            Some(previous) => mtime > previous,
            None => false,
        }
    }

    /// Remember `mtime` without treating it as a change
    fn record(&mut self, path: &Path, mtime: SystemTime) {
        self.mtimes.insert(path.to_path_buf(), mtime);
    }
}

fn file_mtime(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// PID file marking the single active watcher.
///
/// Created by [`RunMarker::acquire`] and removed on release or drop, so
/// every exit path of the watch loop cleans it up.
#[derive(Debug)]
struct RunMarker {
    path: PathBuf,
    released: bool,
}

impl RunMarker {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            let own = i32::try_from(std::process::id()).unwrap_or(i32::MAX);
            if pid != own && process_alive(pid) {
                anyhow::bail!(
                    "A watcher is already running (PID {}). Stop it with `aq stop`.",
                    pid
                );
            }
        }

        fs::write(path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    fn is_running(path: &Path) -> bool {
        read_pid(path).is_some_and(process_alive)
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        remove_pid_file(&self.path)
    }
}

impl Drop for RunMarker {
    fn drop(&mut self) {
        if !self.released {
            let _ = remove_pid_file(&self.path);
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

fn remove_pid_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove PID file: {}", path.display()))
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(err) => err == Errno::EPERM,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

/// Send SIGTERM; `Ok(false)` when no such process exists.
#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(anyhow::Error::new(err).context(format!("Failed to signal PID {}", pid))),
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: i32) -> Result<bool> {
    anyhow::bail!("Stopping a watcher is only supported on Unix")
}

/// Stop a running watcher by sending SIGTERM to the PID in `pid_path`.
///
/// Returns true if a process was signaled. Missing processes and malformed
/// PID files are treated as stale and removed.
fn stop_watcher(pid_path: &Path, console: &Console, styles: &VerboseStyle) -> Result<bool> {
    if !pid_path.exists() {
        console.print(&styles.dim("No running watcher found."));
        return Ok(false);
    }

    let Some(pid) = read_pid(pid_path) else {
        remove_pid_file(pid_path)?;
        console.print(&styles.warning("Invalid PID file removed."));
        return Ok(false);
    };

    if send_terminate(pid)? {
        remove_pid_file(pid_path)?;
        console.print(&styles.success(format!("Sent stop signal to PID {}", pid)));
        Ok(true)
    } else {
        remove_pid_file(pid_path)?;
        console.print(&styles.warning("Watcher process not found (stale PID file removed)."));
        Ok(false)
    }
}

/// Per-run state of the watch loop.
struct WatchSession<'a> {
    target: &'a Path,
    globs: &'a GlobSet,
    config: &'a Config,
    client: Option<&'a dyn AiClient>,
    console: &'a Console,
    styles: &'a VerboseStyle,
    state: PollState,
    stats: Stats,
}

impl WatchSession<'_> {
    /// One poll: process every file whose mtime advanced since it was last
    /// seen. Per-file errors are logged and never end the loop.
    fn tick(&mut self, diff_out: &mut dyn Write) {
        for file in collect_files(self.target, self.globs, self.config.verbose) {
            let Ok(mtime) = file_mtime(&file) else {
                continue;
            };
            if !self.state.observe(&file, mtime) {
                continue;
            }

            let outcome =
                match process_file(&file, self.config, self.client, self.console, self.styles) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        eprintln!("Error processing {}: {:#}", short_name(&file), err);
                        continue;
                    }
                };

            if self.config.diff {
                if let Err(err) = output_diff(&outcome, diff_out) {
                    eprintln!("Error writing diff for {}: {:#}", short_name(&file), err);
                }
            }
            self.stats.record(&outcome);

            // Only our own rewrite is skipped; an edit saved while the
            // provider was running keeps its newer mtime for the next tick.
            if outcome.written {
                if let Ok(mtime) = file_mtime(&file) {
                    self.state.record(&file, mtime);
                }
            }
        }
    }
}

/// Poll `target` and process every file whose modification time advanced
/// since the previous tick, until Ctrl+C or SIGTERM.
fn watch_and_expand(
    target: &Path,
    config: &Config,
    client: Option<&dyn AiClient>,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    if !target.exists() {
        anyhow::bail!("Watch target not found: {}", target.display());
    }
    let globs = build_globset(&config.glob)?;

    let marker = RunMarker::acquire(&config.pid_file)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    console.print(&styles.header(format!(
        "Watching: {} (powered by {})",
        target.display(),
        config.provider.display_name()
    )));
    console.print(&styles.dim(format!(
        "Pattern: {} | Poll: {}s",
        config.glob, config.poll_interval_secs
    )));
    console.print(&styles.dim("Press Ctrl+C to stop"));

    let mut session = WatchSession {
        target,
        globs: &globs,
        config,
        client,
        console,
        styles,
        state: PollState::default(),
        stats: Stats::default(),
    };
    let started = Instant::now();

    while running.load(Ordering::SeqCst) {
        session.tick(&mut io::stdout());
        thread::sleep(config.poll_interval());
    }

    let mut stats = session.stats;
    stats.elapsed = started.elapsed();
    marker.release()?;
    eprintln!();
    console.print(&styles.dim("Watcher stopped."));
    if config.verbose {
        print_stats_summary(&stats, 0, console, styles);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: false,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: &'static str,
    provider: &'static str,
    files: Vec<JsonFileReport>,
    totals: JsonTotals,
}

#[derive(Serialize)]
struct JsonFileReport {
    file: String,
    markers_found: usize,
    markers_applied: usize,
    markers_failed: usize,
    written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&FileOutcome> for JsonFileReport {
    fn from(outcome: &FileOutcome) -> Self {
        Self {
            file: outcome.filename.clone(),
            markers_found: outcome.markers_found,
            markers_applied: outcome.applied,
            markers_failed: outcome.failed,
            written: outcome.written,
            error: None,
        }
    }
}

#[derive(Serialize)]
struct JsonTotals {
    files: usize,
    markers_found: usize,
    markers_applied: usize,
    markers_failed: usize,
    errors: usize,
}

fn output_json(
    config: &Config,
    files: Vec<JsonFileReport>,
    stats: &Stats,
    errors: usize,
) -> Result<()> {
    let status = if errors > 0 {
        "error"
    } else if config.dry_run {
        "dry_run"
    } else {
        "success"
    };

    let json_output = JsonOutput {
        version: "1.0",
        status,
        provider: config.provider.command(),
        totals: JsonTotals {
            files: files.len(),
            markers_found: stats.markers_found,
            markers_applied: stats.markers_applied,
            markers_failed: stats.markers_failed,
            errors,
        },
        files,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json_output).context("Failed to serialize JSON output")?
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

/// Output a unified diff between the original and rewritten file
fn output_diff(outcome: &FileOutcome, out: &mut dyn Write) -> Result<()> {
    if outcome.original == outcome.rewritten {
        return Ok(());
    }

    let original_text = outcome.original.join("\n");
    let rewritten_text = outcome.rewritten.join("\n");
    let diff = TextDiff::from_lines(&original_text, &rewritten_text);

    writeln!(out, "--- a/{}", outcome.filename)?;
    writeln!(out, "+++ b/{}", outcome.filename)?;

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(out, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(out, "{}{}", sign, line)?;
            } else {
                writeln!(out, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    if let Some(Commands::Config { action }) = &args.command {
        run_config_command(action, &args)?;
        return Ok(RunOutcome::default());
    }

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    match &args.command {
        Some(Commands::Watch { target }) => {
            let client = resolve_client(&config)?;
            watch_and_expand(
                target,
                &config,
                client.as_ref().map(|c| c as &dyn AiClient),
                &console,
                &styles,
            )
        }
        Some(Commands::Stop) => {
            stop_watcher(&config.pid_file, &console, &styles)?;
            Ok(RunOutcome::default())
        }
        Some(Commands::Status) => {
            if RunMarker::is_running(&config.pid_file) {
                console.print(&styles.success(format!(
                    "Watcher running ({})",
                    config.pid_file.display()
                )));
            } else {
                console.print(&styles.dim("No running watcher found."));
            }
            Ok(RunOutcome::default())
        }
        Some(Commands::Config { .. }) => Ok(RunOutcome::default()),
        None => run_once(&args.inputs, &config, &console, &styles),
    }
}

/// One pass over the given files and directories
fn run_once(
    inputs: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    if inputs.is_empty() {
        return Err(ArgError(
            "at least one file or directory is required (or use `aq watch <TARGET>`)".to_string(),
        )
        .into());
    }

    let globs = build_globset(&config.glob)?;
    let files = collect_inputs(inputs, &globs, config.verbose);
    if files.is_empty() {
        let message = format!(
            "Warning: No files matched pattern '{}' in provided paths",
            config.glob
        );
        if config.verbose {
            console.print(&styles.dim(message));
        } else {
            eprintln!("{}", message);
        }
        return Ok(RunOutcome {
            dry_run: config.dry_run,
            would_change: false,
        });
    }

    // A missing provider only matters once some file has a marker to send.
    let client = if any_file_has_markers(&files) {
        resolve_client(config)?
    } else {
        None
    };
    let client = client.as_ref().map(|c| c as &dyn AiClient);

    let started = Instant::now();
    let mut stats = Stats::default();
    let mut reports = Vec::with_capacity(files.len());
    let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();

    for path in &files {
        match process_file(path, config, client, console, styles) {
            Ok(outcome) => {
                stats.record(&outcome);
                if config.diff && !config.json {
                    output_diff(&outcome, &mut io::stdout().lock())?;
                }
                reports.push(JsonFileReport::from(&outcome));
            }
            Err(e) => {
                eprintln!("Error processing {}: {:#}", path.display(), e);
                reports.push(JsonFileReport {
                    file: path.display().to_string(),
                    markers_found: 0,
                    markers_applied: 0,
                    markers_failed: 0,
                    written: false,
                    error: Some(format!("{:#}", e)),
                });
                errors.push((path.clone(), e));
            }
        }
    }
    stats.elapsed = started.elapsed();

    if config.json {
        output_json(config, reports, &stats, errors.len())?;
    }

    if config.verbose && !config.json {
        print_stats_summary(&stats, errors.len(), console, styles);
    }

    if !errors.is_empty() {
        let files = errors
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let has_parse_error = errors
            .iter()
            .any(|(_, err)| error_chain_has::<ParseError>(err));

        if has_parse_error {
            return Err(ParseError(format!(
                "{} file(s) had parse errors: {}",
                errors.len(),
                files
            ))
            .into());
        }

        anyhow::bail!("{} file(s) had errors: {}", errors.len(), files);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: stats.markers_found > 0,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
