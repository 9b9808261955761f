//! Management subcommands.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use netblock_core::{Config, Pattern, PatternKind};

/// How often `logs --follow` checks for new output.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// How long `status` waits when probing the listen address.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const APPLY_NOTE: &str = "A running proxy applies the change within a few seconds.";

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub kind: PatternKind,
}

/// Compiles the configured blacklist into listing rows, skipping blanks.
pub fn pattern_entries(config: &Config) -> Vec<PatternEntry> {
    config
        .blacklist
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            let compiled = Pattern::compile(p);
            PatternEntry {
                pattern: compiled.as_str().to_string(),
                kind: compiled.kind(),
            }
        })
        .collect()
}

fn load_or_create(path: &Path) -> anyhow::Result<Config> {
    Config::ensure_exists(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn add(path: &Path, pattern: &str) -> anyhow::Result<()> {
    let mut config = load_or_create(path)?;
    config.add_pattern(pattern)?;
    config
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    let compiled = Pattern::compile(pattern);
    println!("Added {} ({})", compiled, compiled.kind());
    println!("{}", APPLY_NOTE);
    Ok(())
}

pub fn remove(path: &Path, pattern: &str) -> anyhow::Result<()> {
    let mut config =
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    config.remove_pattern(pattern)?;
    config
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))?;

    println!("Removed {}", pattern.trim());
    println!("{}", APPLY_NOTE);
    Ok(())
}

pub fn list(path: &Path, json: bool) -> anyhow::Result<()> {
    let config =
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let entries = pattern_entries(&config);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Blacklist is empty");
        return Ok(());
    }
    print!("{}", format_table(&entries));
    Ok(())
}

fn format_table(entries: &[PatternEntry]) -> String {
    let width = entries
        .iter()
        .map(|e| e.pattern.len())
        .max()
        .unwrap_or(0)
        .max("PATTERN".len());

    let mut out = format!("{:<width$}  KIND\n", "PATTERN");
    for entry in entries {
        out.push_str(&format!("{:<width$}  {}\n", entry.pattern, entry.kind));
    }
    out
}

pub async fn status(path: &Path, logs_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let exists = path.exists();
    let config = if exists {
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        Config::default()
    };

    let listen = config.listen_addr();
    let running = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(&listen)).await,
        Ok(Ok(_))
    );

    println!(
        "Config:    {}{}",
        path.display(),
        if exists { "" } else { " (not created yet)" }
    );
    println!("Listen:    {}", listen);
    println!("Proxy:     {}", if running { "running" } else { "not running" });
    println!("Patterns:  {}", pattern_entries(&config).len());
    println!(
        "Logging:   blocked={} allowed={} level={}",
        config.logging.log_blocked, config.logging.log_allowed, config.logging.level
    );
    if let Some(dir) = logs_dir {
        println!("Logs:      {}", dir.display());
    }
    Ok(())
}

pub async fn logs(dir: &Path, lines: usize, follow: bool) -> anyhow::Result<()> {
    let Some(mut current) = latest_log_file(dir)? else {
        println!("No log files in {}", dir.display());
        return Ok(());
    };

    let initial = read_from(&current, 0)?;
    let content = String::from_utf8_lossy(&initial);
    for line in tail_lines(&content, lines) {
        println!("{}", line);
    }
    if !follow {
        return Ok(());
    }

    let mut offset = initial.len() as u64;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }

        // Daily rotation starts a new file.
        if let Some(latest) = latest_log_file(dir)? {
            if latest != current {
                current = latest;
                offset = 0;
            }
        }

        let len = std::fs::metadata(&current).map(|m| m.len()).unwrap_or(0);
        if len < offset {
            offset = 0;
        }
        if len > offset {
            let appended = read_from(&current, offset)?;
            print!("{}", String::from_utf8_lossy(&appended));
            offset += appended.len() as u64;
        }
    }
    Ok(())
}

/// Returns the most recently modified `netblock*.log` file in `dir`.
pub fn latest_log_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("netblock") || !name.ends_with(".log") {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn read_from(path: &Path, offset: u64) -> anyhow::Result<Vec<u8>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Returns the last `n` lines of `content`.
pub fn tail_lines(content: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}
