//! Trace collection: supervisors push fixed-size records into a
//! bounded queue and never block; a single consumer thread symbolizes
//! stacks and streams binary frames into the compressed sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use fnv::FnvHashMap as HashMap;
use log::warn;
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::catalog::{is_invoke, operation_of, Operation};
use crate::symbolize::Symbolizer;
use crate::unwind::{Arena, STACK_MAX};

/// Queue capacity; pushes beyond it are dropped, not retried.
const QUEUE_CAPACITY: usize = 10_000;

const IDLE_SLEEP: Duration = Duration::from_millis(25);

/// Name-entry frame tags, carved out of the reserved operation.
pub const FILE_NAME_ENTRY: u8 = Operation::Unknown.invoke_tag();
pub const FUNC_NAME_ENTRY: u8 = Operation::Unknown.result_tag();

/// A raw trace event as captured on the supervisor thread.
#[derive(Clone, Copy)]
pub struct TraceRecord {
    pub tag: u8,
    pub tid: i32,
    pub args: [u64; 2],
    pub timestamp_ns: i64,
    pub depth: u16,
    pub stack: [u64; STACK_MAX],
}

/// A symbolized stack entry as it appears in a data frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameRecord {
    pub file: u32,
    pub function: u32,
    pub line: i32,
    pub column: i32,
}

/// The binary frame layout. Everything is little-endian.
pub mod wire {
    use super::{FrameRecord, TraceRecord};
    use std::io::{self, Write};

    pub fn write_name_entry<W: Write>(out: &mut W, kind: u8, name: &str) -> io::Result<()> {
        let bytes = name.as_bytes();
        let length = bytes.len().min(u16::MAX as usize);
        out.write_all(&[kind])?;
        out.write_all(&(length as u16).to_le_bytes())?;
        out.write_all(&bytes[..length])
    }

    pub fn write_data_frame<W: Write>(
        out: &mut W,
        record: &TraceRecord,
        frames: &[FrameRecord],
    ) -> io::Result<()> {
        out.write_all(&[record.tag])?;
        out.write_all(&record.tid.to_le_bytes())?;
        out.write_all(&record.args[0].to_le_bytes())?;
        out.write_all(&record.args[1].to_le_bytes())?;
        out.write_all(&record.timestamp_ns.to_le_bytes())?;
        out.write_all(&(frames.len() as u16).to_le_bytes())?;
        for frame in frames {
            out.write_all(&frame.file.to_le_bytes())?;
            out.write_all(&frame.function.to_le_bytes())?;
            out.write_all(&frame.line.to_le_bytes())?;
            out.write_all(&frame.column.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Opens the output log: a zstd stream over a buffered file, written
/// as one frame and finished when the sink is dropped.
pub fn create_compressed_sink(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    let file = File::create(path)?;
    let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), 0)?;
    Ok(Box::new(encoder.auto_finish()))
}

#[derive(Debug, Clone, Copy)]
pub struct RecorderConfig {
    pub capture_stacks: bool,
    pub max_stack_depth: usize,
    pub print_records: bool,
    pub print_stack: bool,
    pub print_entries: bool,
}

/// What the consumer learned over the run, folded into the statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumerReport {
    pub filename_max_length: i32,
    pub function_max_length: i32,
}

pub struct TraceRecorder {
    sender: Sender<TraceRecord>,
    start: Instant,
    stopped: Arc<AtomicBool>,
    mappings_changed: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<ConsumerReport>>>,
    config: RecorderConfig,
}

impl TraceRecorder {
    /// Spawns the consumer thread. `sink` receives the binary log.
    pub fn start(pid: Pid, sink: Box<dyn Write + Send>, config: RecorderConfig) -> Self {
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));
        // resolve the initial module set before the first record
        let mappings_changed = Arc::new(AtomicBool::new(true));

        let consumer = {
            let stopped = stopped.clone();
            let mappings_changed = mappings_changed.clone();
            thread::Builder::new()
                .name("trace-consumer".into())
                .spawn(move || {
                    Consumer::new(pid, receiver, stopped, mappings_changed, sink, config).run()
                })
                .expect("spawn trace consumer")
        };

        Self {
            sender,
            start: Instant::now(),
            stopped,
            mappings_changed,
            consumer: Mutex::new(Some(consumer)),
            config,
        }
    }

    /// Nanoseconds since tracing started; the timestamp of every
    /// record.
    pub fn elapsed_ns(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    /// Captures the stack for invocation records and enqueues. Returns
    /// the captured depth. Never blocks: a full queue drops the record
    /// with a warning.
    pub fn record(&self, tag: u8, tid: Pid, args: [u64; 2], arena: &mut Arena) -> u16 {
        let mut record = TraceRecord {
            tag,
            tid: tid.as_raw(),
            args,
            timestamp_ns: self.elapsed_ns(),
            depth: 0,
            stack: [0; STACK_MAX],
        };
        if is_invoke(tag) && self.config.capture_stacks {
            record.depth = arena.capture(tid, &mut record.stack, self.config.max_stack_depth);
        }
        if self.config.print_records {
            print_record(&record, self.config.print_stack);
        }

        let depth = record.depth;
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) | Err(TrySendError::Disconnected(record)) => {
                warn!(
                    "[{}] dropped trace record: tag {} args [{:#x}, {:#x}]",
                    tid, record.tag, record.args[0], record.args[1]
                );
            }
        }
        depth
    }

    /// The target's mapping set changed; the consumer rebuilds its
    /// symbolization state before touching further records.
    pub fn notify_mappings_changed(&self) {
        self.mappings_changed.store(true, Ordering::SeqCst);
    }

    /// Drains the queue and joins the consumer. Idempotent; later
    /// calls return an empty report.
    pub fn shutdown(&self) -> ConsumerReport {
        self.stopped.store(true, Ordering::SeqCst);
        match self.consumer.lock().take() {
            Some(handle) => handle.join().unwrap_or_else(|err| {
                warn!("trace consumer panicked: {:?}", err);
                ConsumerReport::default()
            }),
            None => ConsumerReport::default(),
        }
    }
}

/// Console echo of a record, mirroring what lands in the log.
fn print_record(record: &TraceRecord, with_stack: bool) {
    let op = operation_of(record.tag);
    let meta = op.meta();
    print!("[{}][{}]", record.tid, record.timestamp_ns / 1000);
    if is_invoke(record.tag) {
        print!(" invoke [{:>7}]", meta.name);
        match meta.argc {
            2 => print!(" arg = [{:#x}, {:#x}]", record.args[0], record.args[1]),
            1 => print!(" arg = [{:#x}]", record.args[0]),
            _ => {}
        }
        if record.depth > 0 {
            print!(", stack_size = [{}]", record.depth);
        }
        println!(".");
        if with_stack {
            for i in 0..record.depth as usize {
                println!("  stack[{}] = [{:#x}]", i, record.stack[i]);
            }
        }
    } else {
        print!(" result [{:>7}]", meta.name);
        if meta.has_return {
            print!(" ret = [{:#x}]", record.args[0]);
        }
        println!(".");
    }
}

struct Consumer {
    pid: Pid,
    receiver: Receiver<TraceRecord>,
    stopped: Arc<AtomicBool>,
    mappings_changed: Arc<AtomicBool>,
    sink: Box<dyn Write + Send>,
    config: RecorderConfig,
    symbolizer: Option<Symbolizer>,
    file_names: HashMap<String, u32>,
    func_names: HashMap<String, u32>,
    cache: HashMap<u64, FrameRecord>,
    report: ConsumerReport,
}

impl Consumer {
    fn new(
        pid: Pid,
        receiver: Receiver<TraceRecord>,
        stopped: Arc<AtomicBool>,
        mappings_changed: Arc<AtomicBool>,
        sink: Box<dyn Write + Send>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            pid,
            receiver,
            stopped,
            mappings_changed,
            sink,
            config,
            symbolizer: None,
            file_names: HashMap::default(),
            func_names: HashMap::default(),
            cache: HashMap::default(),
            report: ConsumerReport {
                filename_max_length: -1,
                function_max_length: -1,
            },
        }
    }

    fn run(mut self) -> ConsumerReport {
        loop {
            let refresh = self.mappings_changed.load(Ordering::SeqCst);
            if self.stopped.load(Ordering::SeqCst) && self.receiver.is_empty() && !refresh {
                break;
            }
            if refresh {
                self.refresh_symbolizer();
                continue;
            }
            match self.receiver.try_recv() {
                Ok(record) => self.process(&record),
                Err(_) => thread::sleep(IDLE_SLEEP),
            }
        }
        if let Err(err) = self.sink.flush() {
            warn!("cannot flush trace sink: {}", err);
        }
        self.report
    }

    fn refresh_symbolizer(&mut self) {
        match Symbolizer::new(self.pid) {
            Ok(symbolizer) => {
                self.symbolizer = Some(symbolizer);
                self.cache.clear();
            }
            // keep the previous module snapshot, e.g. when the target
            // already exited while records are still queued
            Err(err) => warn!("cannot refresh symbolizer: {}", err),
        }
        self.mappings_changed.store(false, Ordering::SeqCst);
    }

    fn intern(&mut self, kind: u8, name: &str) -> u32 {
        let (names, max_length) = if kind == FILE_NAME_ENTRY {
            (&mut self.file_names, &mut self.report.filename_max_length)
        } else {
            (&mut self.func_names, &mut self.report.function_max_length)
        };
        if let Some(&index) = names.get(name) {
            return index;
        }
        let index = names.len() as u32;
        names.insert(name.to_owned(), index);
        *max_length = (*max_length).max(name.len() as i32);
        if let Err(err) = wire::write_name_entry(&mut self.sink, kind, name) {
            warn!("cannot write name entry: {}", err);
        }
        if self.config.print_entries {
            let what = if kind == FILE_NAME_ENTRY {
                "filename"
            } else {
                "function"
            };
            println!("[{}] #{} len=[{}] name=[{}]", what, index, name.len(), name);
        }
        index
    }

    fn process(&mut self, record: &TraceRecord) {
        let mut frames = Vec::with_capacity(record.depth as usize);
        for &addr in &record.stack[..record.depth as usize] {
            if let Some(frame) = self.cache.get(&addr) {
                frames.push(*frame);
                continue;
            }
            let (function, file, line, column) = match self
                .symbolizer
                .as_ref()
                .and_then(|symbolizer| symbolizer.resolve(addr))
            {
                Some(resolved) => (
                    resolved.function.unwrap_or_else(|| "<nil>".to_owned()),
                    resolved.file.unwrap_or_else(|| "<nil>".to_owned()),
                    resolved.line,
                    resolved.column,
                ),
                None => ("<nil>".to_owned(), "<nil>".to_owned(), -1, -1),
            };
            let frame = FrameRecord {
                file: self.intern(FILE_NAME_ENTRY, &file),
                function: self.intern(FUNC_NAME_ENTRY, &function),
                line,
                column,
            };
            self.cache.insert(addr, frame);
            frames.push(frame);
        }
        if let Err(err) = wire::write_data_frame(&mut self.sink, record, &frames) {
            warn!("cannot write data frame: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_entry_layout() {
        let mut out = Vec::new();
        wire::write_name_entry(&mut out, FUNC_NAME_ENTRY, "malloc").unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(u16::from_le_bytes([out[1], out[2]]), 6);
        assert_eq!(&out[3..], b"malloc");
    }

    #[test]
    fn data_frame_layout() {
        let record = TraceRecord {
            tag: Operation::Malloc.invoke_tag(),
            tid: 42,
            args: [16, 0],
            timestamp_ns: 1_000_000,
            depth: 1,
            stack: [0; STACK_MAX],
        };
        let frames = [FrameRecord {
            file: 3,
            function: 7,
            line: 120,
            column: 9,
        }];
        let mut out = Vec::new();
        wire::write_data_frame(&mut out, &record, &frames).unwrap();

        assert_eq!(out.len(), 1 + 4 + 8 + 8 + 8 + 2 + 16);
        assert_eq!(out[0], Operation::Malloc.invoke_tag());
        assert_eq!(i32::from_le_bytes(out[1..5].try_into().unwrap()), 42);
        assert_eq!(u64::from_le_bytes(out[5..13].try_into().unwrap()), 16);
        assert_eq!(
            i64::from_le_bytes(out[21..29].try_into().unwrap()),
            1_000_000
        );
        assert_eq!(u16::from_le_bytes(out[29..31].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(out[31..35].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(out[35..39].try_into().unwrap()), 7);
        assert_eq!(i32::from_le_bytes(out[39..43].try_into().unwrap()), 120);
        assert_eq!(i32::from_le_bytes(out[43..47].try_into().unwrap()), 9);
    }

    #[test]
    fn name_tags_are_distinct_and_reserved() {
        assert_eq!(FILE_NAME_ENTRY, 0);
        assert_eq!(FUNC_NAME_ENTRY, 1);
        assert_eq!(operation_of(FILE_NAME_ENTRY), Operation::Unknown);
    }
}
