//! Run statistics: per-operation counters and the plain-text summary
//! written next to the binary log.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::catalog::{Operation, OPERATION_COUNT};

const KEY_WIDTH: usize = 25;

#[derive(Debug, Default)]
pub struct StatInfo {
    pub extra: Vec<(String, String)>,

    pub argv: Vec<String>,
    pub commands: Vec<String>,
    pub target: String,
    pub target_full_path: String,
    pub working_dir: String,
    pub save_path: String,

    pub total_count: u64,
    pub max_stack_depth: i32,
    pub filename_max_length: i32,
    pub function_max_length: i32,

    pub main_tid: i32,
    pub child_tids: Vec<i32>,
    pub tid_relations: Vec<(i32, i32)>,

    pub timestamp_start: String,
    pub timestamp_end: String,
    pub elapsed_ns: i64,

    pub invoke_counts: [u64; OPERATION_COUNT],
    pub result_counts: [u64; OPERATION_COUNT],
    pub invoke_total: u64,
    pub result_total: u64,
}

impl StatInfo {
    pub fn finalize(&mut self) {
        self.invoke_total = self.invoke_counts.iter().sum();
        self.result_total = self.result_counts.iter().sum();
        self.total_count = self.invoke_total + self.result_total;
    }

    pub fn print(&self) {
        let stdout = io::stdout();
        let _ = self.render(&mut stdout.lock(), true);
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        self.render(&mut file, false)
    }

    fn render(&self, out: &mut dyn Write, console: bool) -> io::Result<()> {
        let align_t = self.elapsed_ns.to_string().len();
        let align_op = self.total_count.to_string().len();

        let section = |out: &mut dyn Write, title: &str| -> io::Result<()> {
            if console {
                writeln!(out, "{}", title)?;
            }
            Ok(())
        };

        section(out, "================ Statistic Information ================")?;

        if !self.extra.is_empty() {
            section(out, "-------- Extra Keys")?;
            writeln!(out, "{:<KEY_WIDTH$}: {}", "num_of_extrakeys", self.extra.len())?;
            for (key, value) in &self.extra {
                writeln!(out, "{:<KEY_WIDTH$}: {}", key, value)?;
            }
        }

        section(out, "-------- Basic Information")?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "argc", self.argv.len())?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "argv[]", self.argv.join(" "))?;
        let own_args = self.argv.len().saturating_sub(self.commands.len());
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "memtrace_args",
            self.argv[..own_args].join(" ")
        )?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "executed_commands",
            self.commands.join(" ")
        )?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "target", self.target)?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "target_full_path", self.target_full_path
        )?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "working_directory", self.working_dir)?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "save_path", self.save_path)?;

        section(out, "-------- Trace Information")?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "total_traceinfo_count", self.total_count
        )?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "max_stack_size", self.max_stack_depth
        )?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "filename_max_length", self.filename_max_length
        )?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "function_max_length", self.function_max_length
        )?;

        section(out, "-------- Process Information")?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "main_pid", self.main_tid)?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "child_tid_num",
            self.child_tids.len()
        )?;
        if !self.child_tids.is_empty() {
            let tids = self
                .child_tids
                .iter()
                .map(|tid| tid.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, "{:<KEY_WIDTH$}: {}", "child_tid_list", tids)?;
            let relations = self
                .tid_relations
                .iter()
                .map(|(parent, child)| format!("{}>{}", parent, child))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, "{:<KEY_WIDTH$}: {}", "tid_relations", relations)?;
        }

        section(out, "-------- Time Cost")?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {}",
            "timestamp_start", self.timestamp_start
        )?;
        writeln!(out, "{:<KEY_WIDTH$}: {}", "timestamp_end", self.timestamp_end)?;
        writeln!(
            out,
            "{:<KEY_WIDTH$}: {:>align_t$}",
            "time_end", self.elapsed_ns
        )?;

        section(out, "-------- Operation Called")?;
        for index in 0..OPERATION_COUNT {
            if self.invoke_counts[index] == 0 && console {
                continue;
            }
            let op = Operation::from_index(index as u8).unwrap_or(Operation::Unknown);
            let key = format!("num_of_{}", op.name());
            if console {
                write!(
                    out,
                    "{:<KEY_WIDTH$}: {:>align_op$}",
                    key, self.invoke_counts[index]
                )?;
                if op.meta().has_return {
                    write!(out, " / {:>align_op$}", self.result_counts[index])?;
                }
                writeln!(out)?;
            } else {
                writeln!(
                    out,
                    "{:<KEY_WIDTH$}: {} {}",
                    key, self.invoke_counts[index], self.result_counts[index]
                )?;
            }
        }
        if console {
            writeln!(
                out,
                "{:<KEY_WIDTH$}: {:>align_op$} / {:>align_op$}",
                "total_invoke/result", self.invoke_total, self.result_total
            )?;
        } else {
            writeln!(
                out,
                "{:<KEY_WIDTH$}: {} {}",
                "total_invoke/result", self.invoke_total, self.result_total
            )?;
        }

        section(out, "================ ===================== ================")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatInfo {
        let mut stat = StatInfo {
            argv: vec!["memtrace".into(), "./target".into()],
            commands: vec!["./target".into()],
            target: "./target".into(),
            main_tid: 100,
            child_tids: vec![101, 102],
            tid_relations: vec![(100, 101), (100, 102)],
            elapsed_ns: 123_456,
            ..Default::default()
        };
        stat.invoke_counts[Operation::Malloc.index() as usize] = 3;
        stat.result_counts[Operation::Malloc.index() as usize] = 3;
        stat.invoke_counts[Operation::Free.index() as usize] = 2;
        stat.finalize();
        stat
    }

    #[test]
    fn totals_are_sums_of_counters() {
        let stat = sample();
        assert_eq!(stat.invoke_total, 5);
        assert_eq!(stat.result_total, 3);
        assert_eq!(stat.total_count, 8);
    }

    #[test]
    fn file_rendering_is_plain_key_value() {
        let stat = sample();
        let mut out = Vec::new();
        stat.render(&mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(!text.contains("Statistic Information"));
        assert!(text.contains("num_of_malloc"));
        // file form keeps zero-invoke operations
        assert!(text.contains("num_of_brk"));
        assert!(text.lines().any(|line| line.starts_with("child_tid_list")
            && line.ends_with("101 102")));
        assert!(text.lines().any(|line| line.contains("100>101 100>102")));
    }

    #[test]
    fn console_rendering_elides_unused_operations() {
        let stat = sample();
        let mut out = Vec::new();
        stat.render(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Statistic Information"));
        assert!(text.contains("num_of_malloc"));
        assert!(!text.contains("num_of_brk"));
        // free has no result column
        let free_line = text.lines().find(|l| l.contains("num_of_free")).unwrap();
        assert!(!free_line.contains('/'));
    }
}
