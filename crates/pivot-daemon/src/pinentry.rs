//! PIN broker backed by a pinentry program
//!
//! Speaks the Assuan protocol over the program's stdin/stdout. One program
//! instance is started per prompt.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use tracing::debug;
use zeroize::Zeroizing;

use pivot_core::{Pin, PinBroker, PinError};

/// GPG_ERR_CANCELED as reported by pinentry
const ASSUAN_CANCELLED: u32 = 83886179;

/// Prompts through an external pinentry program
#[derive(Debug, Clone)]
pub struct PinentryBroker {
    program: String,
}

impl PinentryBroker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PinBroker for PinentryBroker {
    fn prompt(&self, serial: u32, retries: u8) -> Result<Pin, PinError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PinError::Unavailable(format!("{}: {}", self.program, e)))?;

        let result = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => {
                let mut client = AssuanClient::new(BufReader::new(stdout), stdin);
                run_dialog(&mut client, serial, retries)
            }
            _ => Err(PinError::Unavailable(
                "pinentry pipes unavailable".to_string(),
            )),
        };

        if result.is_err() {
            let _ = child.kill();
        }
        let _ = child.wait();
        result
    }
}

/// Ask for the PIN over an open Assuan connection
fn run_dialog<R: BufRead, W: Write>(
    client: &mut AssuanClient<R, W>,
    serial: u32,
    retries: u8,
) -> Result<Pin, PinError> {
    client.read_response()?;

    client.command("SETTITLE pivot-agent PIN Prompt")?;
    client.command(&format!(
        "SETDESC {}",
        escape(&format!(
            "Token serial number: {} ({} tries remaining)",
            serial, retries
        ))
    ))?;
    client.command("SETPROMPT Please enter your PIN:")?;

    // Older pinentry builds reject these, prompting still works without them
    if let Err(e) = client.command("OPTION allow-external-password-cache") {
        debug!("pinentry has no external password cache: {}", e);
    }
    if let Err(e) = client.command(&format!("SETKEYINFO --piv-token-{}", serial)) {
        debug!("pinentry rejected key info: {}", e);
    }

    let mut pin = client.command("GETPIN")?;
    let _ = client.command("BYE");

    Pin::new(std::mem::take(&mut *pin))
}

/// Minimal Assuan client
struct AssuanClient<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> AssuanClient<R, W> {
    fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Send one command and collect any data lines of its response
    fn command(&mut self, line: &str) -> Result<Zeroizing<String>, PinError> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|e| PinError::Unavailable(format!("pinentry write failed: {}", e)))?;
        self.read_response()
    }

    /// Read lines until OK or ERR
    fn read_response(&mut self) -> Result<Zeroizing<String>, PinError> {
        let mut data = Zeroizing::new(String::new());
        loop {
            let mut line = Zeroizing::new(String::new());
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| PinError::Unavailable(format!("pinentry read failed: {}", e)))?;
            if read == 0 {
                return Err(PinError::Unavailable(
                    "pinentry closed the connection".to_string(),
                ));
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line == "OK" || line.starts_with("OK ") {
                return Ok(data);
            }
            if let Some(payload) = line.strip_prefix("D ") {
                data.push_str(&unescape(payload));
            } else if let Some(error) = line.strip_prefix("ERR ") {
                return Err(map_assuan_error(error));
            }
            // Status and comment lines are ignored
        }
    }
}

fn map_assuan_error(error: &str) -> PinError {
    let code = error
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u32>().ok());
    if code == Some(ASSUAN_CANCELLED) || error.to_ascii_lowercase().contains("cancel") {
        PinError::Cancelled
    } else {
        PinError::Unavailable(format!("pinentry error: {}", error))
    }
}

/// Percent-escape an Assuan command argument
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '\r' => escaped.push_str("%0D"),
            '\n' => escaped.push_str("%0A"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Decode percent escapes in an Assuan data line
fn unescape(value: &str) -> Zeroizing<String> {
    let bytes = value.as_bytes();
    let mut decoded = Zeroizing::new(Vec::with_capacity(bytes.len()));
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                decoded.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    Zeroizing::new(String::from_utf8_lossy(&decoded).into_owned())
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

#[cfg(any(test, feature = "fake-device"))]
pub use scripted::ScriptedPinBroker;

#[cfg(any(test, feature = "fake-device"))]
mod scripted {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pivot_core::{Pin, PinBroker, PinError};

    type Hook = Box<dyn Fn() + Send + Sync>;

    /// Answers every prompt with a fixed PIN, optionally after a delay
    #[derive(Clone)]
    pub struct ScriptedPinBroker {
        answer: Result<String, PinError>,
        delay: Duration,
        prompts: Arc<AtomicUsize>,
        last_retries: Arc<Mutex<Option<u8>>>,
        hook: Arc<Mutex<Option<Hook>>>,
    }

    impl ScriptedPinBroker {
        pub fn answering(pin: &str) -> Self {
            Self::with_answer(Ok(pin.to_string()))
        }

        pub fn failing(error: PinError) -> Self {
            Self::with_answer(Err(error))
        }

        fn with_answer(answer: Result<String, PinError>) -> Self {
            Self {
                answer,
                delay: Duration::ZERO,
                prompts: Arc::new(AtomicUsize::new(0)),
                last_retries: Arc::new(Mutex::new(None)),
                hook: Arc::new(Mutex::new(None)),
            }
        }

        /// Keep the prompt open for `delay`, as a user typing does
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Run `hook` at the end of every prompt, while it is still open
        pub fn on_prompt_end(&self, hook: impl Fn() + Send + Sync + 'static) {
            if let Ok(mut slot) = self.hook.lock() {
                *slot = Some(Box::new(hook));
            }
        }

        pub fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }

        /// Retry count passed to the most recent prompt
        pub fn last_retries(&self) -> Option<u8> {
            self.last_retries.lock().ok().and_then(|r| *r)
        }
    }

    impl PinBroker for ScriptedPinBroker {
        fn prompt(&self, _serial: u32, retries: u8) -> Result<Pin, PinError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_retries.lock() {
                *last = Some(retries);
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if let Ok(hook) = self.hook.lock() {
                if let Some(hook) = hook.as_ref() {
                    hook();
                }
            }
            match &self.answer {
                Ok(pin) => Pin::new(pin.as_str()),
                Err(e) => Err(e.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn transcript(lines: &[&str]) -> Cursor<Vec<u8>> {
        let mut text = lines.join("\n");
        text.push('\n');
        Cursor::new(text.into_bytes())
    }

    #[test]
    fn test_dialog_returns_pin() {
        let input = transcript(&[
            "OK Pleased to meet you",
            "OK",
            "OK",
            "OK",
            "OK",
            "OK",
            "D 12%2534",
            "OK",
            "OK closing connection",
        ]);
        let mut output = Vec::new();
        let mut client = AssuanClient::new(input, &mut output);

        let pin = run_dialog(&mut client, 1234567, 3).unwrap();
        assert_eq!(pin.as_bytes(), b"12%34");

        let sent = String::from_utf8(output).unwrap();
        assert!(sent.contains("SETDESC Token serial number: 1234567 (3 tries remaining)\n"));
        assert!(sent.contains("SETKEYINFO --piv-token-1234567\n"));
        assert!(sent.contains("GETPIN\n"));
    }

    #[test]
    fn test_cache_options_are_optional() {
        let input = transcript(&[
            "OK Pleased to meet you",
            "OK",
            "OK",
            "OK",
            "ERR 83886254 Unknown option <Pinentry>",
            "ERR 536871187 Unknown IPC command <Pinentry>",
            "D 424242",
            "OK",
            "OK",
        ]);
        let mut output = Vec::new();
        let mut client = AssuanClient::new(input, &mut output);
        let pin = run_dialog(&mut client, 1, 0).unwrap();
        assert_eq!(pin.as_bytes(), b"424242");
    }

    #[test]
    fn test_cancel_maps_to_cancelled() {
        let input = transcript(&[
            "OK Pleased to meet you",
            "OK",
            "OK",
            "OK",
            "OK",
            "OK",
            "ERR 83886179 Operation cancelled <Pinentry>",
        ]);
        let mut output = Vec::new();
        let mut client = AssuanClient::new(input, &mut output);
        assert_eq!(
            run_dialog(&mut client, 1, 3).unwrap_err(),
            PinError::Cancelled
        );
    }

    #[test]
    fn test_closed_pipe_is_unavailable() {
        let input = transcript(&["OK Pleased to meet you"]);
        let mut output = Vec::new();
        let mut client = AssuanClient::new(input, &mut output);
        assert!(matches!(
            run_dialog(&mut client, 1, 3),
            Err(PinError::Unavailable(_))
        ));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("50%\nnext"), "50%25%0Anext");
        assert_eq!(unescape("a%0Ab%25").as_str(), "a\nb%");
        assert_eq!(unescape("trailing%2").as_str(), "trailing%2");
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let broker = PinentryBroker::new("/nonexistent/pinentry");
        assert!(matches!(
            broker.prompt(1, 3),
            Err(PinError::Unavailable(_))
        ));
    }
}
