//! Round-trips the binary log format through a reader defined from the
//! frame layout: every tag, argument, timestamp and stack entry must
//! come back bit-exact, compressed end to end.

use std::io::Read;

use memtrace::catalog::{is_invoke, operation_of, Operation};
use memtrace::recorder::{wire, FrameRecord, TraceRecord, FILE_NAME_ENTRY, FUNC_NAME_ENTRY};
use memtrace::unwind::STACK_MAX;

#[derive(Debug, PartialEq)]
enum Frame {
    Name { kind: u8, name: String },
    Data {
        tag: u8,
        tid: i32,
        args: [u64; 2],
        timestamp_ns: i64,
        stack: Vec<FrameRecord>,
    },
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let bytes: [u8; N] = self.data[self.pos..self.pos + N].try_into().unwrap();
        self.pos += N;
        bytes
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.pos >= self.data.len() {
            return None;
        }
        let tag = self.take::<1>()[0];
        if tag == FILE_NAME_ENTRY || tag == FUNC_NAME_ENTRY {
            let length = u16::from_le_bytes(self.take::<2>()) as usize;
            let name = String::from_utf8(self.data[self.pos..self.pos + length].to_vec()).unwrap();
            self.pos += length;
            Some(Frame::Name { kind: tag, name })
        } else {
            let tid = i32::from_le_bytes(self.take::<4>());
            let args = [
                u64::from_le_bytes(self.take::<8>()),
                u64::from_le_bytes(self.take::<8>()),
            ];
            let timestamp_ns = i64::from_le_bytes(self.take::<8>());
            let depth = u16::from_le_bytes(self.take::<2>());
            let stack = (0..depth)
                .map(|_| FrameRecord {
                    file: u32::from_le_bytes(self.take::<4>()),
                    function: u32::from_le_bytes(self.take::<4>()),
                    line: i32::from_le_bytes(self.take::<4>()),
                    column: i32::from_le_bytes(self.take::<4>()),
                })
                .collect();
            Some(Frame::Data {
                tag,
                tid,
                args,
                timestamp_ns,
                stack,
            })
        }
    }
}

fn record(tag: u8, tid: i32, args: [u64; 2], timestamp_ns: i64) -> TraceRecord {
    TraceRecord {
        tag,
        tid,
        args,
        timestamp_ns,
        depth: 0,
        stack: [0; STACK_MAX],
    }
}

#[test]
fn frames_round_trip_bit_exact() {
    let mut log = Vec::new();

    wire::write_name_entry(&mut log, FILE_NAME_ENTRY, "alloc.c").unwrap();
    wire::write_name_entry(&mut log, FUNC_NAME_ENTRY, "malloc").unwrap();

    let malloc_invoke = record(Operation::Malloc.invoke_tag(), 7, [16, 0], 1_000);
    let frames = [FrameRecord {
        file: 0,
        function: 0,
        line: 42,
        column: 3,
    }];
    wire::write_data_frame(&mut log, &malloc_invoke, &frames).unwrap();

    let malloc_result = record(Operation::Malloc.result_tag(), 7, [0xdead_beef, 0], 2_000);
    wire::write_data_frame(&mut log, &malloc_result, &[]).unwrap();

    let mut reader = Reader::new(&log);
    assert_eq!(
        reader.next_frame(),
        Some(Frame::Name {
            kind: FILE_NAME_ENTRY,
            name: "alloc.c".into()
        })
    );
    assert_eq!(
        reader.next_frame(),
        Some(Frame::Name {
            kind: FUNC_NAME_ENTRY,
            name: "malloc".into()
        })
    );
    assert_eq!(
        reader.next_frame(),
        Some(Frame::Data {
            tag: Operation::Malloc.invoke_tag(),
            tid: 7,
            args: [16, 0],
            timestamp_ns: 1_000,
            stack: frames.to_vec(),
        })
    );
    assert_eq!(
        reader.next_frame(),
        Some(Frame::Data {
            tag: Operation::Malloc.result_tag(),
            tid: 7,
            args: [0xdead_beef, 0],
            timestamp_ns: 2_000,
            stack: vec![],
        })
    );
    assert_eq!(reader.next_frame(), None);
}

#[test]
fn log_survives_zstd_compression() {
    let mut log = Vec::new();
    wire::write_name_entry(&mut log, FUNC_NAME_ENTRY, "realloc").unwrap();
    for i in 0..100i64 {
        let rec = record(
            Operation::Realloc.invoke_tag(),
            42,
            [i as u64, 64],
            i * 1_000,
        );
        wire::write_data_frame(&mut log, &rec, &[]).unwrap();
    }

    let compressed = zstd::stream::encode_all(&log[..], 0).unwrap();
    let mut decompressed = Vec::new();
    zstd::stream::read::Decoder::new(&compressed[..])
        .unwrap()
        .read_to_end(&mut decompressed)
        .unwrap();
    assert_eq!(log, decompressed);

    // and the reader still walks every frame in order, timestamps
    // monotone per tid
    let mut reader = Reader::new(&decompressed);
    assert!(matches!(reader.next_frame(), Some(Frame::Name { .. })));
    let mut last_ts = i64::MIN;
    let mut count = 0;
    while let Some(Frame::Data { tid, timestamp_ns, .. }) = reader.next_frame() {
        assert_eq!(tid, 42);
        assert!(timestamp_ns >= last_ts);
        last_ts = timestamp_ns;
        count += 1;
    }
    assert_eq!(count, 100);
}

#[test]
fn tag_field_splits_into_operation_and_direction() {
    for op in [
        Operation::Malloc,
        Operation::Free,
        Operation::PosixMemalign,
        Operation::DeleteArray,
    ] {
        assert_eq!(operation_of(op.invoke_tag()), op);
        assert_eq!(operation_of(op.result_tag()), op);
        assert!(is_invoke(op.invoke_tag()));
        assert!(!is_invoke(op.result_tag()));
    }
}
