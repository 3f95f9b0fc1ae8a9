//! Newline-delimited record stream: reading, sinks, and the processing loop.

use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressReporter};
use crate::record::FileRecord;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from a signal handler thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Error::Cancelled` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Destination for records produced by a stage.
pub trait RecordSink {
    /// Accept one record.
    fn emit(&mut self, record: &FileRecord) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RecordSink for Vec<FileRecord> {
    fn emit(&mut self, record: &FileRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn emit(&mut self, record: &FileRecord) -> Result<()> {
        (**self).emit(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn emit(&mut self, record: &FileRecord) -> Result<()> {
        (**self).emit(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Writes one JSON record per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn emit(&mut self, record: &FileRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record).map_err(std::io::Error::from)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Iterator over records in a newline-delimited JSON stream.
///
/// Blank lines are skipped.
pub struct RecordReader<R: BufRead> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// Read every remaining record.
    pub fn read_all(self) -> Result<Vec<FileRecord>> {
        self.collect()
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            return Some(
                serde_json::from_str(line)
                    .map_err(|e| Error::invalid_record(self.line, e.to_string())),
            );
        }
    }
}

/// Options for `process_records`.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Emit progress events at this interval; `None` disables the reporter.
    pub progress_interval: Option<Duration>,
    /// Checked before each record.
    pub cancel: CancellationToken,
}

/// Run `handler` over each record in order.
///
/// Totals for progress reporting come from the buffered input. The
/// cancellation token is polled before every record; the first handler error
/// stops processing and is returned.
pub fn process_records<F>(
    records: Vec<FileRecord>,
    options: &ProcessOptions,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(FileRecord) -> Result<()>,
{
    let total_bytes = records
        .iter()
        .fold(0u64, |total, r| total.saturating_add(r.size));
    let progress = Arc::new(Progress::new(records.len() as u64, total_bytes));

    let reporter = options.progress_interval.map(|interval| {
        progress.snapshot().log();
        ProgressReporter::spawn(Arc::clone(&progress), interval)
    });

    for record in records {
        options.cancel.check()?;

        let size = record.size;
        handler(record)?;
        progress.record(size);
    }

    if reporter.is_some() {
        drop(reporter);
        progress.snapshot().log();
    }

    Ok(())
}
