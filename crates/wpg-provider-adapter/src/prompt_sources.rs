use crate::ProviderAdapterError;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wpg_core::{normalize_prompt, PromptGenerator, ProviderError, ProviderFailureKind};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptPayload {
    List(Vec<String>),
    Items { items: Vec<String> },
    Prompts { prompts: Vec<String> },
}

/// Accepts a JSON array, `{"items": [...]}`, `{"prompts": [...]}` or one
/// prompt per line. Blank entries and repeats (by normalized text) are dropped.
pub fn parse_prompt_output(output: &str) -> Vec<String> {
    let trimmed = output.trim();
    let candidates = match serde_json::from_str::<PromptPayload>(trimmed) {
        Ok(PromptPayload::List(items))
        | Ok(PromptPayload::Items { items })
        | Ok(PromptPayload::Prompts { prompts: items }) => items,
        Err(_) => trimmed.lines().map(str::to_string).collect(),
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|candidate| candidate.trim().to_string())
        .filter(|candidate| !candidate.is_empty())
        .filter(|candidate| seen.insert(normalize_prompt(candidate)))
        .collect()
}

/// Runs an external program (usually an LLM wrapper) and reads prompts from
/// its stdout. `{topic}` and `{count}` in arguments are substituted and the
/// same values are exported as `WPG_TOPIC` and `WPG_COUNT`.
#[derive(Debug, Clone)]
pub struct CommandPromptGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPromptGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a configured command line on whitespace.
    pub fn from_command_line(
        command_line: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderAdapterError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            ProviderAdapterError::Template("prompt command is empty".to_string())
        })?;
        Ok(Self::new(program, parts.collect(), timeout))
    }

    fn run(&self, topic: &str, count: usize) -> Result<String, ProviderError> {
        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{topic}", topic)
                    .replace("{count}", &count.to_string())
            })
            .collect::<Vec<_>>();

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("WPG_TOPIC", topic)
            .env("WPG_COUNT", count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ProviderError::new(
                    ProviderFailureKind::Other,
                    format!("failed to start {}: {err}", self.program),
                )
            })?;

        let stdout = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(program = %self.program, timeout_secs = self.timeout.as_secs(), "prompt command timed out");
                    return Err(ProviderError::new(
                        ProviderFailureKind::Timeout,
                        format!("{} did not finish within {:?}", self.program, self.timeout),
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    return Err(ProviderError::new(
                        ProviderFailureKind::Other,
                        format!("waiting for {} failed: {err}", self.program),
                    ))
                }
            }
        };

        let output = stdout
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let errors = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let tail = errors.lines().last().unwrap_or("").trim().to_string();
            return Err(ProviderError::new(
                ProviderFailureKind::Other,
                format!("{} exited with {status}: {tail}", self.program),
            ));
        }
        Ok(output)
    }
}

impl PromptGenerator for CommandPromptGenerator {
    fn generate(&self, topic: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        let output = self.run(topic, count)?;
        let mut prompts = parse_prompt_output(&output);
        if prompts.is_empty() {
            return Err(ProviderError::new(
                ProviderFailureKind::InvalidOutput,
                format!("{} printed no prompts", self.program),
            ));
        }
        prompts.truncate(count);
        debug!(program = %self.program, prompts = prompts.len(), "prompts received");
        Ok(prompts)
    }
}

/// Prompt templates kept in a text file, one per line. `{topic}` is replaced
/// with the requested topic; blank lines and `#` comments are ignored.
#[derive(Debug, Clone)]
pub struct PromptFileGenerator {
    path: PathBuf,
    templates: Vec<String>,
}

impl PromptFileGenerator {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProviderAdapterError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)?;
        let templates = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if templates.is_empty() {
            return Err(ProviderAdapterError::EmptyPromptSource(
                path.display().to_string(),
            ));
        }
        Ok(Self { path, templates })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl PromptGenerator for PromptFileGenerator {
    fn generate(&self, topic: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        let rendered = self
            .templates
            .iter()
            .map(|template| template.replace("{topic}", topic.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompts = parse_prompt_output(&rendered);
        prompts.truncate(count);
        Ok(prompts)
    }
}
