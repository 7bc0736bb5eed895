//! Sending reports by mail.

use std::io::{self, Write};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

/// Anything that can deliver a report.
pub trait MailTransport {
    fn send(&self, to: &[String], subject: &str, body: &str) -> io::Result<()>;
}

/// Pipes the body into a `mail`-compatible program.
#[derive(Debug, Clone)]
pub struct CommandMailer {
    pub program: String,
    /// Arguments placed before `-s SUBJECT`.
    pub args: Vec<String>,
    /// Bodies longer than this many KiB are truncated.
    pub max_kb: usize,
}

impl Default for CommandMailer {
    fn default() -> Self {
        Self {
            program: "mail".into(),
            args: Vec::new(),
            max_kb: 50,
        }
    }
}

impl CommandMailer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }
}

/// Cut `body` to at most `max_kb` KiB, on a character boundary, and say so.
pub fn truncate_body(body: &str, max_kb: usize) -> String {
    let limit = max_kb * 1024;
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let mut cut = body[..end].to_string();
    cut.push_str(&format!("\n!! MAIL TOO LONG, TRUNCATED TO {max_kb}Kb !!\n"));
    cut
}

impl MailTransport for CommandMailer {
    fn send(&self, to: &[String], subject: &str, body: &str) -> io::Result<()> {
        if to.is_empty() {
            warn!("no recipients, mail not sent");
            return Ok(());
        }

        debug!(program = %self.program, ?to, subject, "sending mail");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("-s")
            .arg(subject)
            .args(to)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;

        let body = truncate_body(body, self.max_kb);
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(body.as_bytes()),
            None => Err(io::Error::other("mailer has no stdin")),
        };

        let status = child.wait()?;
        written?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short", 1), "short");

        let long = "é".repeat(1000);
        let cut = truncate_body(&long, 1);
        assert!(cut.starts_with("éé"));
        assert!(cut.ends_with("\n!! MAIL TOO LONG, TRUNCATED TO 1Kb !!\n"));
        assert!(cut.len() < long.len());
    }

    fn fake_mailer(dir: &TempDir, exit: i32) -> CommandMailer {
        let script = dir.path().join("mail");
        fs::write(
            &script,
            format!(
                "printf '%s\\n' \"$*\" > \"{dir}/args\"\ncat > \"{dir}/body\"\nexit {exit}\n",
                dir = dir.path().display()
            ),
        )
        .unwrap();
        CommandMailer {
            args: vec![script.to_string_lossy().into_owned()],
            ..CommandMailer::new("sh")
        }
    }

    #[test]
    fn test_command_mailer() {
        let dir = TempDir::new().unwrap();
        let mailer = fake_mailer(&dir, 0);
        mailer
            .send(&["root@localhost".into()], "--- report", "hello\n")
            .unwrap();

        let args = fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(args, "-s --- report root@localhost\n");
        let body = fs::read_to_string(dir.path().join("body")).unwrap();
        assert_eq!(body, "hello\n");
    }

    #[test]
    fn test_command_mailer_failure() {
        let dir = TempDir::new().unwrap();
        let mailer = fake_mailer(&dir, 3);
        assert!(mailer.send(&["a@b".into()], "s", "b").is_err());
    }

    #[test]
    fn test_no_recipients() {
        let mailer = CommandMailer::new("/nonexistent/mail");
        mailer.send(&[], "s", "b").unwrap();
    }
}
