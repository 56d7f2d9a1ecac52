//! Speech-to-text dispatch.
//!
//! Two backends: a local whisper.cpp HTTP server (audio converted to
//! 16 kHz mono WAV via ffmpeg first) and an OpenAI-compatible cloud
//! endpoint. An empty transcription is an error, never a silent success.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::debug;

use lucyd_core::LucydConfig;

/// Transcribe an audio file via the configured backend.
pub async fn transcribe(
    config: &LucydConfig,
    file_path: &str,
    content_type: &str,
) -> anyhow::Result<String> {
    match config.stt.backend.as_str() {
        "local" => transcribe_local(config, file_path).await,
        "openai" => transcribe_openai(config, file_path, content_type).await,
        "" => bail!("STT disabled (no backend configured)"),
        other => bail!("unknown STT backend: {other}"),
    }
}

/// whisper.cpp flow: ffmpeg → 16 kHz mono WAV → POST to the inference
/// endpoint.
async fn transcribe_local(config: &LucydConfig, file_path: &str) -> anyhow::Result<String> {
    let wav = tempfile::Builder::new()
        .suffix(".wav")
        .tempfile()
        .context("create temp wav")?;
    let wav_path = wav.path().to_path_buf();

    let ffmpeg = tokio::time::timeout(
        Duration::from_secs(config.stt.local_ffmpeg_timeout_secs),
        tokio::process::Command::new("ffmpeg")
            .args([
                "-i",
                file_path,
                "-ar",
                "16000",
                "-ac",
                "1",
                "-f",
                "wav",
                "-y",
            ])
            .arg(&wav_path)
            .output(),
    )
    .await
    .context("ffmpeg timed out")?
    .context("ffmpeg failed to run")?;

    if !ffmpeg.status.success() {
        bail!(
            "ffmpeg conversion failed: {}",
            String::from_utf8_lossy(&ffmpeg.stderr)
        );
    }

    let wav_bytes = tokio::fs::read(&wav_path).await.context("read wav")?;
    debug!(bytes = wav_bytes.len(), "posting wav to whisper endpoint");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.stt.local_request_timeout_secs))
        .build()?;
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(wav_bytes)
                .file_name("audio.wav")
                .mime_str("audio/wav")?,
        )
        .text("response_format", "json")
        .text("language", config.stt.local_language.clone());

    let resp = client
        .post(&config.stt.local_endpoint)
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;

    extract_text(resp.json().await?)
}

/// OpenAI-compatible transcription endpoint.
async fn transcribe_openai(
    config: &LucydConfig,
    file_path: &str,
    content_type: &str,
) -> anyhow::Result<String> {
    let api_key = std::env::var(&config.stt.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        bail!("no API key in ${} for cloud STT", config.stt.api_key_env);
    }

    let audio = tokio::fs::read(file_path).await.context("read audio")?;
    let filename = Path::new(file_path)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio".to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.stt.openai_timeout_secs))
        .build()?;
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(audio)
                .file_name(filename)
                .mime_str(content_type)?,
        )
        .text("model", config.stt.openai_model.clone());

    let resp = client
        .post(&config.stt.openai_api_url)
        .header("Authorization", format!("Bearer {api_key}"))
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;

    extract_text(resp.json().await?)
}

fn extract_text(body: serde_json::Value) -> anyhow::Result<String> {
    let text = body
        .get("text")
        .and_then(|t| t.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(anyhow!("whisper returned empty transcription"));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transcription_is_an_error() {
        assert!(extract_text(serde_json::json!({"text": "  "})).is_err());
        assert!(extract_text(serde_json::json!({})).is_err());
        assert_eq!(
            extract_text(serde_json::json!({"text": " hello "})).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn disabled_backend_errors_cleanly() {
        let config: LucydConfig = serde_json::from_value(serde_json::json!({
            "agent": {"name": "t"},
            "models": {"primary": {"model": "m"}},
        }))
        .unwrap();
        assert!(transcribe(&config, "/tmp/x.ogg", "audio/ogg").await.is_err());
    }
}
