//! Frame codec for the hybrid line and length-prefixed binary protocol.
//!
//! # Frame Format
//!
//! Every frame starts with a single header line terminated by `\n`:
//!
//! | Header | Payload |
//! |---|---|
//! | `FILE_SEND\|<name>\|<size>` | `size` raw bytes |
//! | `FILE_LIST` | none |
//! | `FILE_LIST_RESP\|<n1>,<n2>,...` | none |
//! | `FILE_DOWNLOAD\|<name>` | none |
//! | `FILE_DOWNLOAD_RESP\|<name>\|<size>` | `size` raw bytes |
//! | `FILE_DOWNLOAD_ERR\|<message>` | none |
//! | any other line | none (chat text) |
//!
//! The payload of a sized frame is consumed before the next header line is
//! parsed, so binary bytes are never read as protocol text.
//!
//! # Delimiters
//!
//! Fields are not escaped. The encoder refuses filenames containing `|`, `,`,
//! `\n` or `\r`, and text containing `\n` or `\r`, so every encoded frame
//! decodes back to itself.

use crate::error::{ProtocolError, Result};

/// Header tag for a client upload.
pub const TAG_FILE_SEND: &str = "FILE_SEND";

/// Header line requesting the list of stored files.
pub const TAG_FILE_LIST: &str = "FILE_LIST";

/// Header tag for the file list response.
pub const TAG_FILE_LIST_RESP: &str = "FILE_LIST_RESP";

/// Header tag for a download request.
pub const TAG_FILE_DOWNLOAD: &str = "FILE_DOWNLOAD";

/// Header tag for a successful download response.
pub const TAG_FILE_DOWNLOAD_RESP: &str = "FILE_DOWNLOAD_RESP";

/// Header tag for a failed download.
pub const TAG_FILE_DOWNLOAD_ERR: &str = "FILE_DOWNLOAD_ERR";

/// Field separator inside tagged header lines.
pub const FIELD_SEPARATOR: char = '|';

/// Separator between names in a file list response.
pub const NAME_SEPARATOR: char = ',';

/// Maximum header line length (64 KB), terminator excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default maximum binary payload size (100 MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// One logical protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Plain chat text or an unrecognized command line.
    TextLine { content: String },
    /// Client to server upload.
    FileSend { filename: String, payload: Vec<u8> },
    /// Request for the names of stored files.
    FileListRequest,
    /// Stored file names, in store order.
    FileListResponse { names: Vec<String> },
    /// Request for the contents of one file.
    FileDownloadRequest { filename: String },
    /// Contents of a requested file.
    FileDownloadResponse { filename: String, payload: Vec<u8> },
    /// A download could not be served.
    FileDownloadError { message: String },
}

impl Frame {
    /// Create a text line frame.
    pub fn text(content: impl Into<String>) -> Self {
        Frame::TextLine {
            content: content.into(),
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::TextLine { .. } => "text",
            Frame::FileSend { .. } => "file_send",
            Frame::FileListRequest => "file_list",
            Frame::FileListResponse { .. } => "file_list_resp",
            Frame::FileDownloadRequest { .. } => "file_download",
            Frame::FileDownloadResponse { .. } => "file_download_resp",
            Frame::FileDownloadError { .. } => "file_download_err",
        }
    }

    /// The binary payload carried by sized variants.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::FileSend { payload, .. } | Frame::FileDownloadResponse { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }
}

/// Result of decoding one header line (and its payload, if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A well-formed frame.
    Frame(Frame),
    /// A tagged header that could not be parsed. The line has been consumed.
    Malformed {
        /// The offending header line.
        line: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Which sized variant a header announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Upload,
    Download,
}

/// Parsed header line.
enum Header {
    Complete(Frame),
    Payload {
        kind: PayloadKind,
        filename: String,
        size: usize,
    },
    Malformed(String),
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Largest binary payload accepted or produced.
    max_payload: usize,
    /// Largest header line accepted.
    max_line_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default limits.
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// Create a codec with a custom payload limit.
    ///
    /// The limit is clamped to `u32::MAX`, the largest size the header can carry.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u32::MAX as usize),
            max_line_length: MAX_LINE_LENGTH,
        }
    }

    /// The payload limit in bytes.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a frame into bytes.
    ///
    /// Fails if a field contains a delimiter that would corrupt the framing
    /// or the payload exceeds the limit.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let (header, payload): (String, &[u8]) = match frame {
            Frame::TextLine { content } => {
                validate_line("content", content)?;
                if is_tagged(content) {
                    return Err(ProtocolError::invalid_field(
                        "content",
                        "text starts with a protocol tag",
                    ));
                }
                (content.clone(), &[])
            }
            Frame::FileSend { filename, payload } => {
                validate_filename(filename)?;
                self.check_payload(payload)?;
                (
                    format!("{TAG_FILE_SEND}|{filename}|{}", payload.len()),
                    payload,
                )
            }
            Frame::FileListRequest => (TAG_FILE_LIST.to_string(), &[]),
            Frame::FileListResponse { names } => {
                for name in names {
                    validate_filename(name)?;
                }
                (format!("{TAG_FILE_LIST_RESP}|{}", names.join(",")), &[])
            }
            Frame::FileDownloadRequest { filename } => {
                validate_filename(filename)?;
                (format!("{TAG_FILE_DOWNLOAD}|{filename}"), &[])
            }
            Frame::FileDownloadResponse { filename, payload } => {
                validate_filename(filename)?;
                self.check_payload(payload)?;
                (
                    format!("{TAG_FILE_DOWNLOAD_RESP}|{filename}|{}", payload.len()),
                    payload,
                )
            }
            Frame::FileDownloadError { message } => {
                validate_line("message", message)?;
                (format!("{TAG_FILE_DOWNLOAD_ERR}|{message}"), &[])
            }
        };

        let mut output = Vec::with_capacity(header.len() + 1 + payload.len());
        output.extend_from_slice(header.as_bytes());
        output.push(b'\n');
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Try to decode one frame from the front of `data`.
    ///
    /// Returns `None` if the header line or the payload is not complete yet.
    /// On success the second element is the number of bytes consumed, which
    /// is also reported for malformed headers so the caller can skip them.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Decoded, usize)>> {
        self.decode_inner(data, false)
    }

    /// Decode one frame from the bytes left over when the stream has ended.
    ///
    /// A final line without a terminator is accepted as a complete line.
    /// A header whose payload is missing bytes fails with
    /// [`ProtocolError::TruncatedPayload`]. Returns `None` for empty input.
    pub fn decode_eof(&self, data: &[u8]) -> Result<Option<(Decoded, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }
        self.decode_inner(data, true)
    }

    fn decode_inner(&self, data: &[u8], at_eof: bool) -> Result<Option<(Decoded, usize)>> {
        let (line_end, header_len) = match data.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos, pos + 1),
            None if at_eof => (data.len(), data.len()),
            None => {
                if data.len() > self.max_line_length {
                    return Err(ProtocolError::LineTooLong {
                        len: data.len(),
                        max: self.max_line_length,
                    });
                }
                return Ok(None);
            }
        };

        if line_end > self.max_line_length {
            return Err(ProtocolError::LineTooLong {
                len: line_end,
                max: self.max_line_length,
            });
        }

        let line = header_text(&data[..line_end]);
        let rest = &data[header_len..];

        match parse_header(&line) {
            Header::Complete(frame) => Ok(Some((Decoded::Frame(frame), header_len))),
            Header::Malformed(reason) => Ok(Some((Decoded::Malformed { line, reason }, header_len))),
            Header::Payload {
                kind,
                filename,
                size,
            } => {
                if size > self.max_payload {
                    return Err(ProtocolError::FrameTooLarge {
                        size: size as u64,
                        max: self.max_payload as u64,
                    });
                }
                if rest.len() < size {
                    if at_eof {
                        return Err(ProtocolError::TruncatedPayload {
                            expected: size,
                            received: rest.len(),
                        });
                    }
                    return Ok(None);
                }

                let payload = rest[..size].to_vec();
                let frame = match kind {
                    PayloadKind::Upload => Frame::FileSend { filename, payload },
                    PayloadKind::Download => Frame::FileDownloadResponse { filename, payload },
                };
                Ok(Some((Decoded::Frame(frame), header_len + size)))
            }
        }
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() as u64,
                max: self.max_payload as u64,
            });
        }
        Ok(())
    }
}

/// Check that a filename can travel inside a header line and a name list.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProtocolError::invalid_field("filename", "must not be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '|' | ',' | '\n' | '\r'))
    {
        return Err(ProtocolError::invalid_field(
            "filename",
            format!("must not contain {:?}", c),
        ));
    }
    Ok(())
}

fn validate_line(field: &'static str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(ProtocolError::invalid_field(
            field,
            "must not contain line breaks",
        ));
    }
    Ok(())
}

/// Whether a line would be parsed as something other than plain text.
fn is_tagged(line: &str) -> bool {
    line == TAG_FILE_LIST
        || [
            TAG_FILE_SEND,
            TAG_FILE_LIST_RESP,
            TAG_FILE_DOWNLOAD,
            TAG_FILE_DOWNLOAD_RESP,
            TAG_FILE_DOWNLOAD_ERR,
        ]
        .iter()
        .any(|tag| {
            line.strip_prefix(tag)
                .is_some_and(|rest| rest.starts_with(FIELD_SEPARATOR))
        })
}

/// Header bytes as text, with a trailing `\r` removed.
fn header_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn tagged_rest<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.strip_prefix(tag)?.strip_prefix(FIELD_SEPARATOR)
}

fn parse_header(line: &str) -> Header {
    if tagged_rest(line, TAG_FILE_SEND).is_some() {
        return parse_sized(line, PayloadKind::Upload);
    }
    if let Some(rest) = tagged_rest(line, TAG_FILE_LIST_RESP) {
        let names = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(NAME_SEPARATOR).map(str::to_string).collect()
        };
        return Header::Complete(Frame::FileListResponse { names });
    }
    if line == TAG_FILE_LIST {
        return Header::Complete(Frame::FileListRequest);
    }
    if tagged_rest(line, TAG_FILE_DOWNLOAD_RESP).is_some() {
        return parse_sized(line, PayloadKind::Download);
    }
    if let Some(message) = tagged_rest(line, TAG_FILE_DOWNLOAD_ERR) {
        return Header::Complete(Frame::FileDownloadError {
            message: message.to_string(),
        });
    }
    if tagged_rest(line, TAG_FILE_DOWNLOAD).is_some() {
        let fields = split_fields(line);
        if fields.len() != 2 {
            return Header::Malformed(format!("expected 2 fields, got {}", fields.len()));
        }
        if fields[1].is_empty() {
            return Header::Malformed("empty filename".to_string());
        }
        return Header::Complete(Frame::FileDownloadRequest {
            filename: fields[1].to_string(),
        });
    }
    Header::Complete(Frame::text(line))
}

/// Split a header into fields, ignoring trailing empty fields.
fn split_fields(line: &str) -> Vec<&str> {
    let mut fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    while fields.len() > 1 && fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    fields
}

fn parse_sized(line: &str, kind: PayloadKind) -> Header {
    let fields = split_fields(line);
    if fields.len() != 3 {
        return Header::Malformed(format!("expected 3 fields, got {}", fields.len()));
    }
    if fields[1].is_empty() {
        return Header::Malformed("empty filename".to_string());
    }
    match fields[2].parse::<u32>() {
        Ok(size) => Header::Payload {
            kind,
            filename: fields[1].to_string(),
            size: size as usize,
        },
        Err(e) => Header::Malformed(format!("invalid size {:?}: {}", fields[2], e)),
    }
}
