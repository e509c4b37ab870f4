//! Stage clients backed by external programs.
//!
//! Each stage can be bound to a command line with placeholders (`{url}`,
//! `{input}`, `{output}`, `{target}`). Summarize and publish receive a JSON
//! payload on stdin. Exit code 75 (EX_TEMPFAIL) or death by signal is a
//! transient failure, any other non-zero exit is permanent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::StageCommands;
use crate::prompt;
use crate::registry::FieldSchema;
use crate::scratch::{ArtifactKind, ScratchDir};
use crate::stage::{
    Downloader, Publisher, StageClients, StageError, Summarizer, TextExtractor, Transcriber,
};

/// sysexits.h EX_TEMPFAIL
pub const EX_TEMPFAIL: i32 = 75;

/// Number of trailing stderr characters kept in error messages
const STDERR_TAIL: usize = 400;

fn default_transient_exit_codes() -> Vec<i32> {
    vec![EX_TEMPFAIL]
}

/// An external program invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes reported as transient failures
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            transient_exit_codes: default_transient_exit_codes(),
        }
    }

    /// Substitute `{name}` placeholders in every argument
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect()
    }

    /// Run the command and return its stdout
    pub async fn run(&self, vars: &[(&str, &str)], stdin: Option<Vec<u8>>) -> Result<String, StageError> {
        let args = self.render_args(vars);
        debug!("Running {} {:?}", self.program, args);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StageError::permanent(format!("program not found: {}", self.program))
            } else {
                StageError::transient(format!("failed to start {}: {}", self.program, e))
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            match pipe.write_all(&input).await {
                Ok(()) => {}
                // The program may exit without reading all of its input
                Err(e) if e.kind() == ErrorKind::BrokenPipe => debug!("{} closed stdin early", self.program),
                Err(e) => {
                    return Err(StageError::transient(format!(
                        "failed to write stdin of {}: {}",
                        self.program, e
                    )))
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::transient(format!("failed to wait for {}: {}", self.program, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = tail(stderr.trim(), STDERR_TAIL);
        match output.status.code() {
            Some(code) if self.transient_exit_codes.contains(&code) => Err(StageError::transient(format!(
                "{} exited with {}: {}",
                self.program, code, stderr
            ))),
            Some(code) => Err(StageError::permanent(format!(
                "{} exited with {}: {}",
                self.program, code, stderr
            ))),
            None => Err(StageError::transient(format!("{} was killed by a signal", self.program))),
        }
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}

/// Parse a model response as a JSON object, tolerating a ```json fence
pub fn parse_record(raw: &str) -> Result<Value, StageError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    let value: Value = serde_json::from_str(body.trim())
        .map_err(|e| StageError::permanent(format!("malformed summary response: {}", e)))?;
    if !value.is_object() {
        return Err(StageError::permanent("summary response is not a JSON object"));
    }
    Ok(value)
}

pub struct CommandDownloader {
    spec: CommandSpec,
}

impl CommandDownloader {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Downloader for CommandDownloader {
    async fn download(&self, source_url: &str, destination: &Path) -> Result<PathBuf, StageError> {
        // A partial file from an earlier attempt must not pass for this one's output
        match tokio::fs::remove_file(destination).await {
            Ok(()) => debug!("Removed leftover download: {}", destination.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StageError::transient(format!(
                    "could not clear {}: {}",
                    destination.display(),
                    e
                )))
            }
        }

        let output = destination.to_string_lossy();
        let stdout = self.spec.run(&[("url", source_url), ("output", &*output)], None).await?;

        // Some downloaders pick their own extension and print the final path
        if let Some(reported) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
            let reported = PathBuf::from(reported);
            if reported.is_file() {
                return Ok(reported);
            }
        }
        if destination.is_file() {
            return Ok(destination.to_path_buf());
        }
        Err(StageError::permanent(format!("downloader produced no file for {}", source_url)))
    }
}

pub struct CommandTranscriber {
    spec: CommandSpec,
    extract_audio: Option<CommandSpec>,
    scratch: ScratchDir,
}

impl CommandTranscriber {
    pub fn new(spec: CommandSpec, extract_audio: Option<CommandSpec>, scratch: ScratchDir) -> Self {
        Self {
            spec,
            extract_audio,
            scratch,
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, media: &Path) -> Result<String, StageError> {
        let media_arg = media.to_string_lossy();
        let Some(extract) = &self.extract_audio else {
            let stdout = self.spec.run(&[("input", &*media_arg)], None).await?;
            return Ok(stdout.trim().to_string());
        };

        // Audio lives only as long as this call
        let audio = self.scratch.acquire(ArtifactKind::Audio);
        let audio_arg = audio.path().to_string_lossy().into_owned();
        extract.run(&[("input", &*media_arg), ("output", audio_arg.as_str())], None).await?;
        if !audio.path().exists() {
            return Err(StageError::permanent("audio extraction produced no file"));
        }
        let stdout = self.spec.run(&[("input", audio_arg.as_str())], None).await?;
        Ok(stdout.trim().to_string())
    }
}

pub struct CommandTextExtractor {
    spec: CommandSpec,
}

impl CommandTextExtractor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl TextExtractor for CommandTextExtractor {
    async fn extract_text(&self, media: &Path) -> Result<String, StageError> {
        let media_arg = media.to_string_lossy();
        let stdout = self.spec.run(&[("input", &*media_arg)], None).await?;
        Ok(stdout.trim().to_string())
    }
}

/// Used when no text extraction command is configured
pub struct DisabledTextExtractor;

#[async_trait]
impl TextExtractor for DisabledTextExtractor {
    async fn extract_text(&self, _media: &Path) -> Result<String, StageError> {
        Err(StageError::permanent("text extraction is not configured"))
    }
}

pub struct CommandSummarizer {
    spec: CommandSpec,
}

impl CommandSummarizer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    async fn summarize(
        &self,
        transcript: &str,
        extracted_text: &str,
        field_schema: &FieldSchema,
        prompt_override: Option<&str>,
    ) -> Result<Value, StageError> {
        let payload = json!({
            "prompt": prompt::build_summary_prompt(transcript, extracted_text, field_schema, prompt_override),
            "fields": field_schema,
        });
        let stdout = self.spec.run(&[], Some(payload.to_string().into_bytes())).await?;
        parse_record(&stdout)
    }
}

pub struct CommandPublisher {
    spec: CommandSpec,
}

impl CommandPublisher {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn write(&self, target_resource_id: &str, record: &Value, source_url: &str) -> Result<String, StageError> {
        let payload = json!({
            "target": target_resource_id,
            "source_url": source_url,
            "record": record,
        });
        let stdout = self
            .spec
            .run(&[("target", target_resource_id)], Some(payload.to_string().into_bytes()))
            .await?;
        let confirmation = stdout.trim();
        Ok(if confirmation.is_empty() { "written".to_string() } else { confirmation.to_string() })
    }
}

/// Build the stage clients from configured commands
pub fn command_clients(commands: &StageCommands, scratch: &ScratchDir) -> Result<StageClients> {
    let download = commands.download.clone().context("No download command configured")?;
    let transcribe = commands.transcribe.clone().context("No transcribe command configured")?;
    let summarize = commands.summarize.clone().context("No summarize command configured")?;
    let publish = commands.publish.clone().context("No publish command configured")?;

    let text_extractor: Arc<dyn TextExtractor> = match commands.extract_text.clone() {
        Some(spec) => Arc::new(CommandTextExtractor::new(spec)),
        None => Arc::new(DisabledTextExtractor),
    };

    Ok(StageClients {
        downloader: Arc::new(CommandDownloader::new(download)),
        transcriber: Arc::new(CommandTranscriber::new(
            transcribe,
            commands.extract_audio.clone(),
            scratch.clone(),
        )),
        text_extractor,
        summarizer: Arc::new(CommandSummarizer::new(summarize)),
        publisher: Arc::new(CommandPublisher::new(publish)),
    })
}
