//! Incremental reader for service responses shaped as one JSON object with
//! a row array under a known key (`results`, `rows`, `hits`).
//!
//! Rows are handed out as raw JSON as soon as they are complete in the
//! buffer. Every other top-level field is collected as metadata: fields
//! before the array are available early, fields after it once the rows are
//! drained.

use bytes::Bytes;
use cbcore_errors::{CoreError, CoreResult};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

const COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Members,
    Rows,
    Done,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Scan {
    Row(Bytes),
    /// The row array has just been entered.
    RowsStart,
    NeedMore,
    Done,
}

fn skip_ws(buf: &[u8], mut i: usize) -> Option<usize> {
    while let Some(c) = buf.get(i) {
        if !c.is_ascii_whitespace() {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// End (exclusive) of the string starting at the quote at `start`.
fn scan_string(buf: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    loop {
        match buf.get(i)? {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
}

/// End (exclusive) of the JSON value starting at `start`, if complete.
fn scan_value(buf: &[u8], start: usize) -> Option<usize> {
    match buf.get(start)? {
        b'"' => scan_string(buf, start),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut i = start;
            loop {
                match buf.get(i)? {
                    b'"' => {
                        i = scan_string(buf, i)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(i + 1);
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
        }
        _ => {
            let mut i = start;
            while let Some(c) = buf.get(i) {
                if matches!(c, b',' | b'}' | b']') || c.is_ascii_whitespace() {
                    return Some(i);
                }
                i += 1;
            }
            None
        }
    }
}

fn malformed(what: &str) -> CoreError {
    CoreError::protocol(format!("malformed service response: {what}"))
}

pub(crate) struct RowScanner {
    rows_key: &'static str,
    buf: Vec<u8>,
    pos: usize,
    phase: Phase,
    meta: Map<String, Value>,
}

impl RowScanner {
    pub(crate) fn new(rows_key: &'static str) -> Self {
        Self {
            rows_key,
            buf: Vec::new(),
            pos: 0,
            phase: Phase::Start,
            meta: Map::new(),
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub(crate) fn in_rows(&self) -> bool {
        self.phase == Phase::Rows
    }

    pub(crate) fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    pub(crate) fn take_meta(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.meta)
    }

    pub(crate) fn next(&mut self) -> CoreResult<Scan> {
        loop {
            let buf = &self.buf;
            match self.phase {
                Phase::Start => {
                    let Some(i) = skip_ws(buf, self.pos) else {
                        return Ok(Scan::NeedMore);
                    };
                    if buf[i] != b'{' {
                        return Err(malformed("expected an object"));
                    }
                    self.pos = i + 1;
                    self.phase = Phase::Members;
                }
                Phase::Members => {
                    let Some(i) = skip_ws(buf, self.pos) else {
                        return Ok(Scan::NeedMore);
                    };
                    match buf[i] {
                        b'}' => {
                            self.pos = i + 1;
                            self.phase = Phase::Done;
                            return Ok(Scan::Done);
                        }
                        b',' => self.pos = i + 1,
                        b'"' => {
                            let Some(key_end) = scan_string(buf, i) else {
                                return Ok(Scan::NeedMore);
                            };
                            let Some(colon) = skip_ws(buf, key_end) else {
                                return Ok(Scan::NeedMore);
                            };
                            if buf[colon] != b':' {
                                return Err(malformed("expected ':'"));
                            }
                            let Some(value_start) = skip_ws(buf, colon + 1) else {
                                return Ok(Scan::NeedMore);
                            };
                            let key: String =
                                serde_json::from_slice(&buf[i..key_end]).map_err(|e| malformed(&e.to_string()))?;
                            if key == self.rows_key && buf[value_start] == b'[' {
                                self.pos = value_start + 1;
                                self.phase = Phase::Rows;
                                return Ok(Scan::RowsStart);
                            }
                            let Some(value_end) = scan_value(buf, value_start) else {
                                return Ok(Scan::NeedMore);
                            };
                            let value: Value = serde_json::from_slice(&buf[value_start..value_end])
                                .map_err(|e| malformed(&e.to_string()))?;
                            self.meta.insert(key, value);
                            self.pos = value_end;
                        }
                        _ => return Err(malformed("expected a field name")),
                    }
                }
                Phase::Rows => {
                    let Some(i) = skip_ws(buf, self.pos) else {
                        return Ok(Scan::NeedMore);
                    };
                    match buf[i] {
                        b']' => {
                            self.pos = i + 1;
                            self.phase = Phase::Members;
                        }
                        b',' => self.pos = i + 1,
                        _ => {
                            let Some(end) = scan_value(buf, i) else {
                                return Ok(Scan::NeedMore);
                            };
                            let row = Bytes::copy_from_slice(&buf[i..end]);
                            self.pos = end;
                            return Ok(Scan::Row(row));
                        }
                    }
                }
                Phase::Done => return Ok(Scan::Done),
            }
        }
    }
}

/// Streams rows out of a service response body.
pub struct RowReader {
    scanner: RowScanner,
    body: BoxStream<'static, CoreResult<Bytes>>,
    endpoint: String,
}

impl RowReader {
    pub fn new(body: BoxStream<'static, CoreResult<Bytes>>, rows_key: &'static str, endpoint: impl Into<String>) -> Self {
        Self {
            scanner: RowScanner::new(rows_key),
            body,
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint that served the response.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fill(&mut self) -> CoreResult<()> {
        match self.body.next().await {
            Some(Ok(chunk)) => {
                self.scanner.feed(&chunk);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(malformed("body ended early")),
        }
    }

    /// The next row, or `None` once the array is exhausted.
    pub async fn next_row(&mut self) -> CoreResult<Option<Bytes>> {
        loop {
            match self.scanner.next()? {
                Scan::Row(row) => return Ok(Some(row)),
                Scan::RowsStart => {}
                Scan::Done => return Ok(None),
                Scan::NeedMore => self.fill().await?,
            }
        }
    }

    /// Fields that precede the rows. Does not consume any row.
    pub async fn early_metadata(&mut self) -> CoreResult<&Map<String, Value>> {
        while !self.scanner.in_rows() && !self.scanner.is_done() {
            match self.scanner.next()? {
                Scan::NeedMore => self.fill().await?,
                Scan::Row(_) => return Err(malformed("row outside the row array")),
                Scan::RowsStart | Scan::Done => {}
            }
        }
        Ok(self.scanner.meta())
    }

    /// Drains the rest of the rows and returns every non-row field.
    pub async fn metadata(mut self) -> CoreResult<Value> {
        while self.next_row().await?.is_some() {}
        Ok(Value::Object(self.scanner.take_meta()))
    }

    /// Collects every remaining row and the trailing metadata.
    pub async fn collect(mut self) -> CoreResult<(Vec<Bytes>, Value)> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok((rows, Value::Object(self.scanner.take_meta())))
    }
}
