use serde::Deserialize;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("stream record is not valid UTF-8: {raw}"))]
    InvalidUtf8 {
        stage: &'static str,
        raw: String,
        source: std::str::Utf8Error,
    },
    #[snafu(display("malformed stream record `{raw}`: {details}"))]
    MalformedRecord {
        stage: &'static str,
        raw: String,
        details: String,
    },
    #[snafu(display("backend reported an error mid-stream: {message}"))]
    BackendReported {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("stream ended before a terminal record ({buffered} bytes unflushed)"))]
    UnexpectedEnd {
        stage: &'static str,
        buffered: usize,
    },
}

impl DecodeError {
    /// Raw text of the record that failed, when one exists.
    pub fn raw_segment(&self) -> Option<&str> {
        match self {
            Self::InvalidUtf8 { raw, .. } | Self::MalformedRecord { raw, .. } => Some(raw),
            Self::BackendReported { .. } | Self::UnexpectedEnd { .. } => None,
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// One decoded protocol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub done: bool,
}

#[derive(Deserialize)]
struct GenerateRecord {
    response: Option<String>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Decoding,
    Finished,
    Failed,
    Cancelled,
}

/// Incremental NDJSON decoder for `/api/generate` bodies.
///
/// Chunks may split records (and multi-byte characters) anywhere. Bytes after
/// the last newline stay in a carry-over buffer until the rest arrives.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    input_closed: bool,
    state: DecoderState,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            input_closed: false,
            state: DecoderState::Decoding,
        }
    }

    /// Appends a raw chunk. Ignored once the stream is finished, failed or cancelled.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.state == DecoderState::Decoding && !self.input_closed {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Marks the end of input so the trailing segment can be flushed.
    pub fn close(&mut self) {
        self.input_closed = true;
    }

    /// Stops decoding and drops whatever is still buffered.
    pub fn cancel(&mut self) {
        self.buffer.clear();
        if self.state == DecoderState::Decoding {
            self.state = DecoderState::Cancelled;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == DecoderState::Finished
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pulls the next fragment out of the complete records seen so far.
    ///
    /// Returns `None` when more input is needed or decoding has stopped. An
    /// error is returned once and ends decoding.
    pub fn next_fragment(&mut self) -> Option<DecodeResult<Fragment>> {
        while self.state == DecoderState::Decoding {
            let segment = match self.take_line() {
                Some(segment) => segment,
                None if !self.input_closed => return None,
                None if self.buffer.iter().all(u8::is_ascii_whitespace) => {
                    let buffered = self.buffer.len();
                    self.fail();
                    return Some(
                        UnexpectedEndSnafu {
                            stage: "decoder-end-of-input",
                            buffered,
                        }
                        .fail(),
                    );
                }
                None => std::mem::take(&mut self.buffer),
            };

            match decode_segment(&segment) {
                Ok(None) => continue,
                Ok(Some(fragment)) => {
                    if fragment.done {
                        self.state = DecoderState::Finished;
                        self.buffer.clear();
                    }
                    return Some(Ok(fragment));
                }
                Err(error) => {
                    self.fail();
                    return Some(Err(error));
                }
            }
        }

        None
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        Some(line)
    }

    fn fail(&mut self) {
        self.state = DecoderState::Failed;
        self.buffer.clear();
    }
}

fn decode_segment(segment: &[u8]) -> DecodeResult<Option<Fragment>> {
    let text = std::str::from_utf8(segment).map_err(|source| DecodeError::InvalidUtf8 {
        stage: "decoder-utf8",
        raw: String::from_utf8_lossy(segment).into_owned(),
        source,
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let record: GenerateRecord =
        serde_json::from_str(text).map_err(|source| DecodeError::MalformedRecord {
            stage: "decoder-parse-record",
            raw: text.to_string(),
            details: source.to_string(),
        })?;

    if let Some(message) = record.error {
        return BackendReportedSnafu {
            stage: "decoder-backend-error",
            message,
        }
        .fail();
    }

    let Some(response) = record.response else {
        return MalformedRecordSnafu {
            stage: "decoder-missing-response",
            raw: text.to_string(),
            details: "record has no `response` field".to_string(),
        }
        .fail();
    };

    Ok(Some(Fragment {
        text: response,
        done: record.done,
    }))
}
