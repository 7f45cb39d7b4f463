//! `tunkeeper logs`: tail the supervisor log.

use std::io::{SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use tunkeeper_core::registry::LOG_FILE;

use crate::args::ConfigArgs;

/// How often `--follow` checks the log for growth.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Print the last `lines` lines of the log, then optionally keep following.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub async fn run(args: &ConfigArgs, lines: usize, follow: bool) -> Result<()> {
    let config = args.to_config()?;
    let path = config.state_dir.join(LOG_FILE);

    let mut offset = match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let mut stdout = std::io::stdout().lock();
            for line in last_lines(&text, lines) {
                writeln!(stdout, "{line}").context("Failed to write to stdout")?;
            }
            bytes.len() as u64
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !follow {
                eprintln!("no log yet at {}", path.display());
                return Ok(());
            }
            0
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    if !follow {
        return Ok(());
    }
    tokio::select! {
        result = follow_from(&path, &mut offset) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}

/// Copy bytes appended after `offset` to stdout until cancelled.
///
/// A log that shrinks was truncated or replaced; reading restarts at zero.
async fn follow_from(path: &Path, offset: &mut u64) -> Result<()> {
    let mut interval = tokio::time::interval(FOLLOW_POLL);
    let mut buf = Vec::new();
    loop {
        interval.tick().await;
        let Ok(mut file) = File::open(path).await else {
            continue;
        };
        let len = file.metadata().await?.len();
        if len < *offset {
            *offset = 0;
        }
        if len == *offset {
            continue;
        }
        file.seek(SeekFrom::Start(*offset)).await?;
        buf.clear();
        file.read_to_end(&mut buf).await?;
        *offset += buf.len() as u64;

        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&buf).context("Failed to write to stdout")?;
        stdout.flush().context("Failed to flush stdout")?;
    }
}

/// The last `n` lines of `text`, oldest first.
pub fn last_lines(text: &str, n: usize) -> Vec<&str> {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(n)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_lines_takes_the_tail() {
        let text = "one\ntwo\nthree\nfour\n";
        assert_eq!(last_lines(text, 2), vec!["three", "four"]);
        assert_eq!(last_lines(text, 10), vec!["one", "two", "three", "four"]);
        assert!(last_lines(text, 0).is_empty());
        assert!(last_lines("", 5).is_empty());
    }

    #[test]
    fn last_lines_without_trailing_newline() {
        assert_eq!(last_lines("a\nb", 1), vec!["b"]);
    }
}
