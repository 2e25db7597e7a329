use std::io::Write;
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// Log sink that masks provider credentials before they reach the terminal.
///
/// Provider errors echo request headers and bodies back into `tracing`
/// events, so every line passes through [`redact_secrets`] first.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_secrets(&line).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

static SECRET_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?xi)
          sk-ant-api\S{10,}                       # Anthropic keys
        | sk-[A-Za-z0-9_\-]{20,}                  # OpenAI-compatible keys
        | gsk_[A-Za-z0-9]{20,}                    # Groq keys
        | Bearer\s+[A-Za-z0-9._\-]{20,}           # Authorization headers
        | (?:api[_-]?key|token)["']?\s*[:=]\s*["']?[A-Za-z0-9._\-]{16,}
        "#,
    )
    .expect("redaction regex should compile")
});

/// Replace credential-looking substrings with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    SECRET_PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}
