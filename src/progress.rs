use anyhow::{anyhow, Result};
use log::debug;
use serde_json::Value;
use std::io::Write;

use crate::models::Verbosity;

/// One interpreted record from the engine's build output.
///
/// A record carrying `errorDetail` is always fatal, whatever else it
/// contains. Records that decode but match no known shape degrade to
/// `Unrecognized` instead of failing the build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildEvent {
    Status(String),
    Stream(String),
    ImageId(String),
    Fatal(String),
    Unrecognized(String),
}

pub fn classify(record: &Value) -> BuildEvent {
    if let Some(message) = record
        .get("errorDetail")
        .and_then(|detail| detail.get("message"))
        .and_then(Value::as_str)
    {
        return BuildEvent::Fatal(message.trim().to_owned());
    }

    if let Some(status) = record.get("status").and_then(Value::as_str) {
        return BuildEvent::Status(status.to_owned());
    }

    if let Some(text) = record.get("stream").and_then(Value::as_str) {
        return BuildEvent::Stream(text.to_owned());
    }

    if let Some(id) = record
        .get("aux")
        .and_then(|aux| aux.get("ID"))
        .and_then(Value::as_str)
    {
        return BuildEvent::ImageId(id.to_owned());
    }

    BuildEvent::Unrecognized(record.to_string())
}

/// Splits raw build-output chunks into complete `\r\n`-terminated records.
///
/// Record boundaries do not have to line up with chunk boundaries: an
/// unterminated tail is buffered and completed by the next chunk.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    pending: Vec<u8>,
}

impl RecordSplitter {
    pub fn new() -> RecordSplitter {
        RecordSplitter::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(position) = find_crlf(&self.pending) {
            let record = self.pending[..position].to_vec();
            self.pending.drain(..position + 2);

            if !record.is_empty() {
                records.push(record);
            }
        }

        records
    }

    /// The final fragment, if the stream ended without a trailing `\r\n`.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

/// Interprets decoded build records and writes the user-facing progress.
///
/// A status equal to the previous one is coalesced into a single `.`; a new
/// status starts its own line. `stream` text is echoed verbatim when
/// verbose, and the resulting image id always gets a line of its own. The
/// only state carried between records is the last status text and whether
/// the current output line is still open.
pub struct ProgressPrinter<W: Write> {
    output: W,
    verbosity: Verbosity,
    last_status: Option<String>,
    dirty: bool,
}

impl<W: Write> ProgressPrinter<W> {
    pub fn new(output: W, verbosity: Verbosity) -> ProgressPrinter<W> {
        ProgressPrinter {
            output,
            verbosity,
            last_status: None,
            dirty: false,
        }
    }

    /// Decodes one raw record and feeds it through [`handle`].
    ///
    /// [`handle`]: ProgressPrinter::handle
    pub fn interpret(&mut self, record: &[u8]) -> Result<()> {
        let event = match serde_json::from_slice::<Value>(record) {
            Ok(value) => classify(&value),
            Err(error) => {
                debug!("build record failed to decode: {}", error);
                BuildEvent::Unrecognized(String::from_utf8_lossy(record).into_owned())
            }
        };

        self.handle(event)
    }

    pub fn handle(&mut self, event: BuildEvent) -> Result<()> {
        match event {
            BuildEvent::Status(status) => {
                if self.verbosity >= Verbosity::Normal {
                    if self.last_status.as_deref() == Some(status.as_str()) {
                        self.write(".")?;
                    } else {
                        self.write("\n")?;
                        self.write(&status)?;
                    }
                    self.dirty = true;
                }
                self.last_status = Some(status);
            }
            BuildEvent::Stream(text) => {
                if self.verbosity >= Verbosity::Verbose {
                    self.write(&text)?;
                    self.dirty = !text.ends_with('\n');
                }
            }
            BuildEvent::ImageId(id) => {
                if self.dirty {
                    self.write("\n")?;
                }
                self.write(&id)?;
                self.write("\n")?;
                self.dirty = false;
            }
            BuildEvent::Unrecognized(record) => {
                if self.verbosity >= Verbosity::Normal {
                    if self.dirty {
                        self.write("\n")?;
                    }
                    self.write(&format!("Unknown build record: {}\n", record))?;
                    self.dirty = false;
                }
            }
            BuildEvent::Fatal(message) => {
                if self.dirty {
                    self.write("\n")?;
                    self.dirty = false;
                }
                self.output.flush()?;
                return Err(anyhow!(message));
            }
        }

        self.output.flush()?;
        Ok(())
    }

    /// Closes the output line once the stream is exhausted.
    pub fn finish(&mut self) -> Result<()> {
        if self.dirty {
            self.write("\n")?;
            self.dirty = false;
        }
        self.output.flush()?;

        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.output.write_all(text.as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.output
    }
}

/// Drains a build-output stream through the printer.
///
/// Stops at the first fatal record; everything after it is left unread.
pub fn consume_build_output<I, W>(chunks: I, printer: &mut ProgressPrinter<W>) -> Result<()>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
    W: Write,
{
    let mut splitter = RecordSplitter::new();

    for chunk in chunks {
        let chunk = chunk?;
        for record in splitter.push(&chunk) {
            printer.interpret(&record)?;
        }
    }

    if let Some(record) = splitter.finish() {
        printer.interpret(&record)?;
    }

    printer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpret_all(records: &[&str], verbosity: Verbosity) -> (String, Result<()>) {
        let mut printer = ProgressPrinter::new(Vec::new(), verbosity);

        let mut outcome = Ok(());
        for record in records {
            outcome = printer.interpret(record.as_bytes());
            if outcome.is_err() {
                break;
            }
        }

        let output = String::from_utf8(printer.into_inner()).unwrap();
        (output, outcome)
    }

    #[test]
    fn repeated_status_lines_coalesce_into_dots() {
        let (output, outcome) = interpret_all(
            &[
                r#"{"status":"Pulling"}"#,
                r#"{"status":"Pulling"}"#,
                r#"{"status":"Done"}"#,
            ],
            Verbosity::Normal,
        );

        assert!(outcome.is_ok());
        assert_eq!(output, "\nPulling.\nDone");
    }

    #[test]
    fn status_reverting_to_an_earlier_text_starts_a_new_line() {
        let (output, _) = interpret_all(
            &[
                r#"{"status":"Downloading"}"#,
                r#"{"status":"Extracting"}"#,
                r#"{"status":"Downloading"}"#,
            ],
            Verbosity::Normal,
        );

        assert_eq!(output, "\nDownloading\nExtracting\nDownloading");
    }

    #[test]
    fn stream_text_is_echoed_verbatim_when_verbose() {
        let (output, outcome) = interpret_all(
            &[r#"{"stream":"step 1\n"}"#, r#"{"aux":{"ID":"sha256:abc"}}"#],
            Verbosity::Verbose,
        );

        assert!(outcome.is_ok());
        assert_eq!(output, "step 1\nsha256:abc\n");
    }

    #[test]
    fn stream_text_is_dropped_at_normal_verbosity() {
        let (output, _) = interpret_all(
            &[r#"{"stream":"step 1\n"}"#, r#"{"status":"Done"}"#],
            Verbosity::Normal,
        );

        assert_eq!(output, "\nDone");
    }

    #[test]
    fn quiet_mode_prints_only_the_image_id() {
        let (output, outcome) = interpret_all(
            &[
                r#"{"status":"Pulling"}"#,
                r#"{"stream":"step 1\n"}"#,
                r#"{"aux":{"ID":"sha256:abc"}}"#,
            ],
            Verbosity::Quiet,
        );

        assert!(outcome.is_ok());
        assert_eq!(output, "sha256:abc\n");
    }

    #[test]
    fn error_detail_is_fatal_and_stops_interpretation() {
        let (output, outcome) = interpret_all(
            &[
                r#"{"status":"Step 1/2","errorDetail":{"message":" no such file "}}"#,
                r#"{"status":"never printed"}"#,
            ],
            Verbosity::Normal,
        );

        let error = outcome.unwrap_err();
        assert_eq!(error.to_string(), "no such file");
        assert!(!output.contains("Step 1/2"));
        assert!(!output.contains("never printed"));
    }

    #[test]
    fn undecodable_records_degrade_to_a_diagnostic() {
        let (output, outcome) = interpret_all(&["not json at all"], Verbosity::Normal);

        assert!(outcome.is_ok());
        assert_eq!(output, "Unknown build record: not json at all\n");
    }

    #[test]
    fn unknown_shapes_are_reported_not_fatal() {
        let (output, outcome) =
            interpret_all(&[r#"{"progressDetail":{"current":3}}"#], Verbosity::Normal);

        assert!(outcome.is_ok());
        assert!(output.contains("Unknown build record"));
        assert!(output.contains("progressDetail"));
    }

    #[test]
    fn splitter_reassembles_records_across_chunks() {
        let mut splitter = RecordSplitter::new();

        assert!(splitter.push(b"{\"status\":\"Pul").is_empty());

        let records = splitter.push(b"ling\"}\r\n{\"stat");
        assert_eq!(records, vec![b"{\"status\":\"Pulling\"}".to_vec()]);

        let records = splitter.push(b"us\":\"Done\"}\r\n");
        assert_eq!(records, vec![b"{\"status\":\"Done\"}".to_vec()]);

        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_discards_empty_fragments() {
        let mut splitter = RecordSplitter::new();
        assert!(splitter.push(b"\r\n\r\n").is_empty());
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_hands_back_an_unterminated_tail() {
        let mut splitter = RecordSplitter::new();
        assert!(splitter.push(b"{\"status\":\"Done\"}").is_empty());
        assert_eq!(splitter.finish(), Some(b"{\"status\":\"Done\"}".to_vec()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn consume_drains_chunks_in_arrival_order() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(b"{\"status\":\"Pulling\"}\r\n{\"status\":\"Pul".to_vec()),
            Ok(b"ling\"}\r\n".to_vec()),
            Ok(b"{\"aux\":{\"ID\":\"sha256:abc\"}}".to_vec()),
        ];

        let mut printer = ProgressPrinter::new(Vec::new(), Verbosity::Normal);
        consume_build_output(chunks, &mut printer).unwrap();

        let output = String::from_utf8(printer.into_inner()).unwrap();
        assert_eq!(output, "\nPulling.\nsha256:abc\n");
    }

    #[test]
    fn consume_stops_at_the_first_fatal_record() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(b"{\"errorDetail\":{\"message\":\"build broke\"}}\r\n".to_vec()),
            Ok(b"{\"status\":\"never printed\"}\r\n".to_vec()),
        ];

        let mut printer = ProgressPrinter::new(Vec::new(), Verbosity::Normal);
        let error = consume_build_output(chunks, &mut printer).unwrap_err();

        assert_eq!(error.to_string(), "build broke");
        let output = String::from_utf8(printer.into_inner()).unwrap();
        assert!(!output.contains("never printed"));
    }
}
