//! Stages that delegate to external programs (OCR, watermarking).
//!
//! Both download the attachment to the temp dir, run a configured command over it and
//! only touch the envelope once the command succeeded.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::Deserialize;
use tokio::process::Command;

use crate::{
    envelope::Envelope,
    messaging::types::FileType,
    pipeline::Verdict,
    Error, Result,
};

static OUTPUT_COUNTER: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    /// Program and arguments; `{file}` is replaced with the image path.
    pub command: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: vec![
                "tesseract".to_string(),
                "{file}".to_string(),
                "stdout".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub enabled: bool,
    /// Overlay image handed to the command as `{image}`.
    pub image: String,
    /// Program and arguments; `{input}`, `{output}` and `{image}` are substituted.
    pub command: Vec<String>,
    pub file_types: Vec<FileType>,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "image.png".to_string(),
            command: [
                "ffmpeg",
                "-y",
                "-loglevel",
                "error",
                "-i",
                "{input}",
                "-i",
                "{image}",
                "-filter_complex",
                "overlay=10:10",
                "{output}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            file_types: vec![FileType::Photo, FileType::Video, FileType::Gif],
        }
    }
}

/// Appends text recognised in photos.
pub struct OcrStage {
    command: Vec<String>,
    temp_dir: PathBuf,
}

impl OcrStage {
    pub fn new(cfg: OcrConfig, temp_dir: PathBuf) -> Self {
        Self {
            command: cfg.command,
            temp_dir,
        }
    }

    pub async fn apply(&self, env: &mut Envelope) -> Result<Verdict> {
        if env.file_type != FileType::Photo {
            return Ok(Verdict::Keep);
        }

        let (input, downloaded) = local_input(env, &self.temp_dir).await?;
        let file = input.to_string_lossy().to_string();
        let args = substitute(&self.command, &[("{file}", &file)]);
        let result = run(&args).await;
        if downloaded {
            remove_quietly(&input);
        }

        let recognised = result?;
        let recognised = recognised.trim();
        if !recognised.is_empty() {
            env.text = if env.text.is_empty() {
                recognised.to_string()
            } else {
                format!("{}\n\n{recognised}", env.text)
            };
        }
        Ok(Verdict::Keep)
    }
}

/// Regenerates photo/video attachments with an overlay.
pub struct WatermarkStage {
    cfg: WatermarkConfig,
    temp_dir: PathBuf,
}

impl WatermarkStage {
    pub fn new(cfg: WatermarkConfig, temp_dir: PathBuf) -> Self {
        Self { cfg, temp_dir }
    }

    pub async fn apply(&self, env: &mut Envelope) -> Result<Verdict> {
        if !self.cfg.file_types.contains(&env.file_type) {
            return Ok(Verdict::Keep);
        }

        let (input, downloaded) = local_input(env, &self.temp_dir).await?;
        let ext = input
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| default_extension(env.file_type).to_string());
        let output = unique_path(&self.temp_dir, "wm", &ext);

        let input_s = input.to_string_lossy().to_string();
        let output_s = output.to_string_lossy().to_string();
        let args = substitute(
            &self.cfg.command,
            &[
                ("{input}", &input_s),
                ("{output}", &output_s),
                ("{image}", &self.cfg.image),
            ],
        );
        let result = run(&args).await;
        if downloaded {
            remove_quietly(&input);
        }
        if let Err(e) = result {
            remove_quietly(&output);
            return Err(e);
        }
        if !output.exists() {
            return Err(Error::External(format!(
                "watermark command produced no output at {}",
                output.display()
            )));
        }

        env.set_new_file(output);
        Ok(Verdict::Keep)
    }
}

/// Path of the envelope's attachment on disk, downloading it if needed.
///
/// The flag is true when the file was downloaded here and should be removed by the caller.
async fn local_input(env: &Envelope, temp_dir: &Path) -> Result<(PathBuf, bool)> {
    if let Some(p) = &env.new_file {
        return Ok((p.clone(), false));
    }
    let media = env
        .source
        .media
        .as_ref()
        .ok_or_else(|| Error::InvalidMedia("message has no attachment".to_string()))?;
    tokio::fs::create_dir_all(temp_dir).await?;
    let path = env.client.download_media(media, temp_dir).await?;
    Ok((path, true))
}

fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (k, v)| acc.replace(k, v))
        })
        .collect()
}

async fn run(args: &[String]) -> Result<String> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| Error::Config("empty command".to_string()))?;

    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::External(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::External(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.chars().take(200).collect::<String>()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn unique_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let n = OUTPUT_COUNTER.fetch_add(1, Ordering::SeqCst);
    dir.join(format!("{prefix}_{}_{n}.{ext}", std::process::id()))
}

fn default_extension(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Photo => "jpg",
        FileType::Gif => "mp4",
        FileType::Video | FileType::VideoNote => "mp4",
        _ => "bin",
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!("failed to remove {}: {e}", path.display());
    }
}
