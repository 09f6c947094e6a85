//! Command line surface and the derived run configuration.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use nix::unistd::Pid;
use thiserror::Error;

pub const TRACE_FILE_NAME: &str = "memory.profile";
pub const STATS_FILE_NAME: &str = "statinfo.txt";

#[derive(Debug, Parser)]
#[command(
    name = "memtrace",
    about = "Trace the memory allocation activity of a process",
    after_help = "Examples:\n  \
        memtrace -p 12345        attach to the process with pid 12345\n  \
        memtrace ./app args...   run ./app under tracing"
)]
pub struct Args {
    /// Pid of a running process to attach to
    #[arg(short, long, conflicts_with = "command")]
    pub pid: Option<i32>,

    /// Directory trace artifacts are saved under
    #[arg(long, value_name = "DIR", default_value = "tracedata")]
    pub save_dir: PathBuf,

    /// Artifact subdirectory scheme; presets: "/name/time",
    /// "/name-time", "/time-name", "/name"
    #[arg(long, value_name = "SCHEME", default_value = "")]
    pub category: String,

    /// Maximum captured stack depth; negative disables capture
    #[arg(
        long = "stack",
        value_name = "DEPTH",
        default_value_t = 100,
        allow_hyphen_values = true
    )]
    pub stack_depth: i32,

    /// Don't collect trace records
    #[arg(long)]
    pub no_trace: bool,

    /// Don't capture stack traces
    #[arg(long)]
    pub no_stack: bool,

    /// Don't write the binary log
    #[arg(long)]
    pub no_save: bool,

    /// Echo every invoke/result record to the console
    #[arg(long, overrides_with = "no_print_log")]
    print_log: bool,
    #[arg(long, hide = true)]
    no_print_log: bool,

    /// Print captured stacks along with echoed records
    #[arg(long, overrides_with = "no_print_stack")]
    print_stack: bool,
    #[arg(long, hide = true)]
    no_print_stack: bool,

    /// Print every name entry written to the log
    #[arg(long, overrides_with = "no_print_save")]
    print_save: bool,
    #[arg(long, hide = true)]
    no_print_save: bool,

    /// Print the statistics summary on exit
    #[arg(long, overrides_with = "no_print_stat")]
    print_stat: bool,
    #[arg(long, hide = true)]
    no_print_stat: bool,

    /// Extra key=value pairs recorded in the statistics, comma separated
    #[arg(long, value_name = "PAIRS")]
    pub extra: Option<String>,

    /// Target command and its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no target: specify --pid or a command to run")]
    NoTarget,
    #[error("target program not found: {0}")]
    TargetMissing(String),
    #[error("invalid extra argument: `{0}` (expected key=value)")]
    BadExtra(String),
}

/// Validated run configuration derived from the raw arguments.
#[derive(Debug)]
pub struct Config {
    pub pid: Option<Pid>,
    pub command: Vec<String>,
    pub executable_name: String,
    pub save_dir: PathBuf,
    pub category: String,
    pub collect_trace: bool,
    pub capture_stacks: bool,
    pub save_trace: bool,
    pub max_stack_depth: usize,
    pub print_records: bool,
    pub print_stack: bool,
    pub print_entries: bool,
    pub print_stats: bool,
    pub extra: Vec<(String, String)>,
    pub argv: Vec<String>,
    pub start_timestamp: String,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.pid.is_none() && args.command.is_empty() {
            return Err(ConfigError::NoTarget);
        }
        if let Some(program) = args.command.first() {
            if !Path::new(program).exists() {
                return Err(ConfigError::TargetMissing(program.clone()));
            }
        }

        let executable_name = match args.command.first() {
            Some(program) => basename(program),
            None => {
                let pid = args.pid.unwrap();
                fs::read_link(format!("/proc/{}/exe", pid))
                    .ok()
                    .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| format!("pid{}", pid))
            }
        };

        let extra = parse_extra_pairs(args.extra.as_deref())?;
        let start_timestamp = local_timestamp();
        let category = resolve_category(&args.category, &executable_name, &start_timestamp);

        Ok(Self {
            pid: args.pid.map(Pid::from_raw),
            executable_name,
            save_dir: args.save_dir,
            category,
            collect_trace: !args.no_trace,
            capture_stacks: !args.no_stack && args.stack_depth >= 0,
            save_trace: !args.no_save,
            max_stack_depth: args.stack_depth.max(0) as usize,
            print_records: args.print_log || !args.no_print_log,
            print_stack: args.print_stack && !args.no_print_stack,
            print_entries: args.print_save && !args.no_print_save,
            print_stats: args.print_stat || !args.no_print_stat,
            extra,
            argv: env::args().collect(),
            start_timestamp,
            command: args.command,
        })
    }

    pub fn parent_dir(&self) -> PathBuf {
        self.save_dir.join(&self.category)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.parent_dir().join(TRACE_FILE_NAME)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.parent_dir().join(STATS_FILE_NAME)
    }

    pub fn prepare_output_dir(&self) -> io::Result<()> {
        fs::create_dir_all(self.parent_dir())
    }
}

fn basename(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_owned(),
        None => path.to_owned(),
    }
}

fn parse_extra_pairs(raw: Option<&str>) -> Result<Vec<(String, String)>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut pairs = Vec::new();
    for chunk in raw.split(',') {
        let Some((key, value)) = chunk.split_once('=') else {
            return Err(ConfigError::BadExtra(chunk.to_owned()));
        };
        if key.is_empty() || value.is_empty() {
            return Err(ConfigError::BadExtra(chunk.to_owned()));
        }
        pairs.push((key.to_owned(), value.to_owned()));
    }
    Ok(pairs)
}

fn resolve_category(preset: &str, name: &str, timestamp: &str) -> String {
    match preset {
        "" | "/name/time" => format!("{}/{}", name, timestamp),
        "/name-time" => format!("{}-{}", name, timestamp),
        "/time-name" => format!("{}-{}", timestamp, name),
        "/name" => name.to_owned(),
        custom => custom.to_owned(),
    }
}

/// Local wall-clock time, second resolution plus a nine-digit
/// nanosecond suffix.
pub fn local_timestamp() -> String {
    let now = chrono::Local::now();
    format!(
        "{}-{:09}",
        now.format("%Y%m%d-%H%M%S"),
        now.timestamp_subsec_nanos()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_presets() {
        assert_eq!(resolve_category("", "app", "T"), "app/T");
        assert_eq!(resolve_category("/name/time", "app", "T"), "app/T");
        assert_eq!(resolve_category("/name-time", "app", "T"), "app-T");
        assert_eq!(resolve_category("/time-name", "app", "T"), "T-app");
        assert_eq!(resolve_category("/name", "app", "T"), "app");
        assert_eq!(resolve_category("custom/dir", "app", "T"), "custom/dir");
    }

    #[test]
    fn extra_pairs_parse_and_validate() {
        assert_eq!(parse_extra_pairs(None).unwrap(), vec![]);
        assert_eq!(
            parse_extra_pairs(Some("a=1,b=two")).unwrap(),
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "two".to_owned())
            ]
        );
        assert!(parse_extra_pairs(Some("novalue")).is_err());
        assert!(parse_extra_pairs(Some("a=")).is_err());
        assert!(parse_extra_pairs(Some("=1")).is_err());
    }

    #[test]
    fn negative_stack_depth_disables_capture() {
        let args = Args::parse_from(["memtrace", "--stack", "-1", "-p", "1"]);
        let config = Config::from_args(args).unwrap();
        assert!(!config.capture_stacks);
        assert_eq!(config.max_stack_depth, 0);
    }

    #[test]
    fn attach_and_command_targets() {
        let args = Args::parse_from(["memtrace", "-p", "1234"]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.pid, Some(Pid::from_raw(1234)));

        let args = Args::parse_from(["memtrace"]);
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::NoTarget)
        ));

        let args = Args::parse_from(["memtrace", "/no/such/binary"]);
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::TargetMissing(_))
        ));
    }

    #[test]
    fn print_toggles_default_like_the_statistics_emitter() {
        let args = Args::parse_from(["memtrace", "-p", "1"]);
        let config = Config::from_args(args).unwrap();
        assert!(config.print_records);
        assert!(!config.print_stack);
        assert!(!config.print_entries);
        assert!(config.print_stats);

        let args = Args::parse_from(["memtrace", "-p", "1", "--no-print-log", "--print-stack"]);
        let config = Config::from_args(args).unwrap();
        assert!(!config.print_records);
        assert!(config.print_stack);
    }

    #[test]
    fn trailing_command_keeps_its_own_flags() {
        let args = Args::parse_from(["memtrace", "/bin/sh", "-c", "exit 0"]);
        assert_eq!(args.command, vec!["/bin/sh", "-c", "exit 0"]);
    }
}
